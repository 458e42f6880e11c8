//! Stack unwinding: one walker per architecture, one driver for all.
//!
//! Every walker recovers a caller frame by trying, in order: call-frame
//! information (plus STACK WIN records on x86), the architecture's frame
//! conventions (frame pointer, link register, back chain), and finally a
//! heuristic stack scan when the caller permits it. The first strategy
//! producing a plausible frame wins; a frame's [`FrameTrust`] records
//! which one that was.

mod amd64;
mod arm;
mod arm64;
mod mips;
mod ppc;
mod riscv;
mod sparc;
mod x86;

use std::collections::HashSet;

use async_trait::async_trait;
use scroll::ctx::{SizeWith, TryFromCtx};
use tracing::trace;

use debris_dump::format as md;
use debris_dump::{
    ContextValidity, CpuRegisters, DumpContext, DumpMemory, DumpModuleList, RawContext,
};
use debris_symbols::{FillSymbolError, FrameSymbolizer, FrameWalker};

use crate::process_state::{CallStack, CallStackInfo, FrameTrust, StackFrame};
use crate::processor::ProcessorOptions;
use crate::symbols::SymbolProvider;
use crate::system_info::SystemInfo;

/// The symbol supplier cancelled the walk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WalkInterrupted;

pub(crate) type CallerResult = Result<Option<StackFrame>, WalkInterrupted>;

/// Per-architecture caller recovery, implemented on each raw context type.
#[async_trait]
pub(crate) trait Unwind {
    async fn get_caller_frame<P>(
        &self,
        callee: &StackFrame,
        grand_callee: Option<&StackFrame>,
        stack_memory: &DumpMemory<'_>,
        modules: &DumpModuleList,
        system_info: &SystemInfo,
        options: &ProcessorOptions,
        syms: &P,
    ) -> CallerResult
    where
        P: SymbolProvider + Sync;
}

/// The bridge between the CFI evaluator's name-based callbacks and a typed
/// CPU context.
///
/// Callee registers are read subject to the callee's validity; caller
/// registers default to the forwarded callee-saved set and are overwritten
/// or cleared as the evaluator dictates. `set_cfa`/`set_ra` land in the
/// architecture's stack pointer and program counter.
pub(crate) struct CfiStackWalker<'a, C: CpuRegisters> {
    pub instruction: u64,
    pub has_grand_callee: bool,
    pub grand_callee_parameter_size: u32,

    pub callee_ctx: &'a C,
    pub callee_validity: &'a ContextValidity,

    pub caller_ctx: C,
    pub caller_validity: HashSet<&'static str>,

    pub stack_memory: &'a DumpMemory<'a>,
}

impl<'a, C> FrameWalker for CfiStackWalker<'a, C>
where
    C: CpuRegisters + Send,
    C::Register: for<'b> TryFromCtx<'b, scroll::Endian, [u8], Error = scroll::Error>
        + SizeWith<scroll::Endian>,
{
    fn get_instruction(&self) -> u64 {
        self.instruction
    }

    fn has_grand_callee(&self) -> bool {
        self.has_grand_callee
    }

    fn get_grand_callee_parameter_size(&self) -> u32 {
        self.grand_callee_parameter_size
    }

    fn get_register_at_address(&self, address: u64) -> Option<u64> {
        let result: Option<C::Register> = self.stack_memory.get_memory_at_address(address);
        result.map(Into::into)
    }

    fn get_callee_register(&self, name: &str) -> Option<u64> {
        self.callee_ctx
            .get_register(name, self.callee_validity)
            .map(Into::into)
    }

    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()> {
        let val = C::register_from_u64(val);
        let canon = self.caller_ctx.set_register(name, val)?;
        self.caller_validity.insert(canon);
        Some(())
    }

    fn clear_caller_register(&mut self, name: &str) {
        if let Some(canon) = C::canonical_register(name) {
            self.caller_validity.remove(canon);
        }
    }

    fn set_cfa(&mut self, val: u64) -> Option<()> {
        // The CFA is the caller's stack pointer by definition.
        self.set_caller_register(C::STACK_POINTER, val)
    }

    fn set_ra(&mut self, val: u64) -> Option<()> {
        self.set_caller_register(C::PROGRAM_COUNTER, val)
    }
}

/// Forward the callee-saved registers the callee actually has.
pub(crate) fn callee_forwarded_regs(
    valid: &ContextValidity,
    callee_saved: &'static [&'static str],
) -> HashSet<&'static str> {
    match valid {
        ContextValidity::All => callee_saved.iter().copied().collect(),
        ContextValidity::Some(which) => callee_saved
            .iter()
            .filter(|&reg| which.contains(reg))
            .copied()
            .collect(),
    }
}

/// The scanner's plausibility oracle for return-address candidates.
///
/// An address must land in a loaded module; when that module has symbols,
/// it must additionally symbolize to a named function. CFI and
/// frame-pointer recovery deliberately skip this check so they can step
/// through modules we know nothing about (OS frames) and hand a correct
/// register file to the next strategy.
pub(crate) async fn instruction_seems_valid_by_symbols<P>(
    instruction: u64,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> bool
where
    P: SymbolProvider + Sync,
{
    if instruction == 0 {
        return false;
    }
    let module = match modules.module_at_address(instruction) {
        Some(module) => module,
        None => return false,
    };

    struct DummyFrame {
        instruction: u64,
        has_name: bool,
    }
    impl FrameSymbolizer for DummyFrame {
        fn get_instruction(&self) -> u64 {
            self.instruction
        }
        fn set_function(&mut self, _name: &str, _base: u64, _parameter_size: u32) {
            self.has_name = true;
        }
        fn set_source_file(&mut self, _file: &str, _line: u32, _base: u64) {}
    }

    let mut frame = DummyFrame {
        instruction,
        has_name: false,
    };
    match symbol_provider.fill_symbol(module, &mut frame).await {
        Ok(()) => frame.has_name,
        // No symbols to judge by; being inside a module is good enough.
        Err(_) => true,
    }
}

/// Fill module and symbol information for one frame.
async fn fill_source_line_info<P>(
    frame: &mut StackFrame,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> Result<(), FillSymbolError>
where
    P: SymbolProvider + Sync,
{
    if let Some(module) = modules.module_at_address(frame.instruction) {
        frame.module = Some(module.clone());
        match symbol_provider.fill_symbol(module, frame).await {
            // "No symbols" still leaves a valid, unsymbolized frame.
            Ok(()) | Err(FillSymbolError::NotFound) => Ok(()),
            Err(FillSymbolError::Interrupted) => Err(FillSymbolError::Interrupted),
        }
    } else {
        Ok(())
    }
}

async fn get_caller_frame<P>(
    callee: &StackFrame,
    grand_callee: Option<&StackFrame>,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
    system_info: &SystemInfo,
    options: &ProcessorOptions,
    symbol_provider: &P,
) -> CallerResult
where
    P: SymbolProvider + Sync,
{
    match &callee.context.raw {
        RawContext::X86(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Amd64(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Arm(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Arm64(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::OldArm64(ctx) => {
            // Normalize the legacy layout once; recovered callers continue
            // in the current layout.
            let ctx = md::ContextArm64 {
                context_flags: md::ContextFlagsCpu::CONTEXT_ARM64.bits(),
                cpsr: ctx.cpsr,
                iregs: ctx.iregs,
                pc: ctx.pc,
                ..Default::default()
            };
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Mips(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Ppc(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Ppc64(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Sparc(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Riscv(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
        RawContext::Riscv64(ctx) => {
            ctx.get_caller_frame(
                callee,
                grand_callee,
                stack_memory,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
        }
    }
}

/// Unwind one thread.
///
/// Frame 0 comes from `maybe_context` with [`FrameTrust::Context`]; every
/// further frame is recovered by the architecture's strategies until the
/// caller's pc goes null, the stack pointer stops advancing, a configured
/// entry sentinel is hit, or the frame limit is reached. A supplier
/// interruption truncates the stack at the frame that triggered it.
pub async fn walk_stack<P>(
    maybe_context: Option<&DumpContext>,
    stack_memory: Option<&DumpMemory<'_>>,
    modules: &DumpModuleList,
    system_info: &SystemInfo,
    options: &ProcessorOptions,
    symbol_provider: &P,
) -> CallStack
where
    P: SymbolProvider + Sync,
{
    let mut frames: Vec<StackFrame> = vec![];
    let mut info = CallStackInfo::Ok;

    if let Some(context) = maybe_context {
        let mut maybe_frame = Some(StackFrame::from_context(
            context.clone(),
            FrameTrust::Context,
        ));
        while let Some(mut frame) = maybe_frame {
            // A configured process-entry sentinel ends the walk without
            // emitting the sentinel frame (frame 0 is always kept).
            if !frames.is_empty()
                && options
                    .entry_sentinels
                    .contains(&frame.context.get_instruction_pointer())
            {
                trace!("unwind: hit entry sentinel, stopping");
                break;
            }

            match fill_source_line_info(&mut frame, modules, symbol_provider).await {
                Ok(()) => {}
                Err(_) => {
                    // Truncate at the frame whose module interrupted us;
                    // earlier frames stand.
                    trace!("unwind: symbol lookup interrupted");
                    info = CallStackInfo::Interrupted;
                    break;
                }
            }
            frames.push(frame);

            if frames.len() >= options.max_frames {
                trace!("unwind: frame limit reached");
                break;
            }
            let stack = match stack_memory {
                Some(stack) => stack,
                None => {
                    if frames.len() == 1 {
                        info = CallStackInfo::MissingMemory;
                    }
                    break;
                }
            };

            let callee = frames.last().unwrap();
            let grand_callee = frames.len().checked_sub(2).map(|i| &frames[i]);
            maybe_frame = match get_caller_frame(
                callee,
                grand_callee,
                stack,
                modules,
                system_info,
                options,
                symbol_provider,
            )
            .await
            {
                Ok(maybe_frame) => maybe_frame,
                Err(WalkInterrupted) => {
                    info = CallStackInfo::Interrupted;
                    None
                }
            };
        }
    } else {
        info = CallStackInfo::MissingContext;
    }

    CallStack {
        frames,
        info,
        thread_id: 0,
        thread_name: None,
    }
}

#[cfg(test)]
mod amd64_unittest;
#[cfg(test)]
mod arm64_unittest;
#[cfg(test)]
mod x86_unittest;
