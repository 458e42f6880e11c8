//! Stack unwinding for mips32 and mips64.
//!
//! MIPS has no conventional frame-pointer chain, so unwinding leans on
//! CFI, with a scan as the fallback. The program counter of a caller is
//! derived from the return address minus the jal/delay-slot pair.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::ContextMips;
use debris_dump::{ContextValidity, CpuRegisters, DumpContext, DumpMemory, DumpModuleList, RawContext};
use debris_symbols::WalkError;

use super::{
    callee_forwarded_regs, instruction_seems_valid_by_symbols, CallerResult, CfiStackWalker,
    Unwind, WalkInterrupted,
};
use crate::process_state::{FrameTrust, StackFrame};
use crate::processor::ProcessorOptions;
use crate::symbols::SymbolProvider;
use crate::system_info::SystemInfo;

type Pointer = u64;
const POINTER_WIDTH: Pointer = 8;
const STACK_POINTER: &str = "sp";
const PROGRAM_COUNTER: &str = "pc";
const RETURN_ADDRESS: &str = "ra";
const FRAME_POINTER: &str = "fp";
const CALLEE_SAVED_REGS: &[&str] = &[
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "gp", "sp", "fp",
];

async fn get_caller_by_cfi<P>(
    ctx: &ContextMips,
    callee: &StackFrame,
    grand_callee: Option<&StackFrame>,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> CallerResult
where
    P: SymbolProvider + Sync,
{
    trace!("unwind: trying cfi");
    let valid = &callee.context.valid;
    if ctx.get_register(STACK_POINTER, valid).is_none() {
        return Ok(None);
    }
    let module = match modules.module_at_address(callee.instruction) {
        Some(module) => module,
        None => return Ok(None),
    };

    let grand_callee_parameter_size = grand_callee.and_then(|f| f.parameter_size).unwrap_or(0);
    let has_grand_callee = grand_callee.is_some();

    let mut stack_walker = CfiStackWalker {
        instruction: callee.instruction,
        has_grand_callee,
        grand_callee_parameter_size,

        callee_ctx: ctx,
        callee_validity: valid,

        caller_ctx: ctx.clone(),
        caller_validity: callee_forwarded_regs(valid, CALLEE_SAVED_REGS),

        stack_memory,
    };

    match symbol_provider.walk_frame(module, &mut stack_walker).await {
        Ok(()) => {}
        Err(WalkError::NoUnwindInfo) => return Ok(None),
        Err(WalkError::Interrupted) => return Err(WalkInterrupted),
    }
    let caller_ra = stack_walker.caller_ctx.get_register_always(RETURN_ADDRESS);
    let caller_sp = stack_walker.caller_ctx.get_register_always(STACK_POINTER);
    trace!("unwind: cfi emitted caller_ra: {caller_ra:#018x}, caller_sp: {caller_sp:#018x}");

    // CFI recovers ra; the caller's pc is the jal's address, two
    // instruction words back (jal + delay slot).
    if instruction_seems_valid_by_symbols(caller_ra, modules, symbol_provider).await {
        stack_walker
            .caller_ctx
            .set_register(PROGRAM_COUNTER, caller_ra.wrapping_sub(2 * 4));
        stack_walker.caller_validity.insert(PROGRAM_COUNTER);
    }

    let context = DumpContext {
        raw: RawContext::Mips(stack_walker.caller_ctx),
        valid: ContextValidity::Some(stack_walker.caller_validity),
    };
    Ok(Some(StackFrame::from_context(
        context,
        FrameTrust::CallFrameInfo,
    )))
}

async fn get_caller_by_scan<P>(
    ctx: &ContextMips,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider + Sync,
{
    const MAX_STACK_SIZE: Pointer = 1024;
    const MIN_ARGS: Pointer = 4;
    trace!("unwind: trying scan");
    let valid = &callee.context.valid;
    let mut last_sp = ctx.get_register(STACK_POINTER, valid)?;

    let mut count = MAX_STACK_SIZE / POINTER_WIDTH;
    // Non-leaf frames reserve at least four argument words; skipping them
    // avoids reporting phantom frames. Frame 0 might be a leaf, so it
    // scans from sp directly.
    if callee.trust != FrameTrust::Context {
        last_sp = last_sp.checked_add(MIN_ARGS * POINTER_WIDTH)?;
        count -= MIN_ARGS;
    }

    for i in 0..count {
        let address_of_pc = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_pc: Pointer = stack_memory.get_memory_at_address(address_of_pc)?;
        if instruction_seems_valid_by_symbols(caller_pc, modules, symbol_provider).await {
            let caller_fp: Pointer =
                stack_memory.get_memory_at_address(address_of_pc.checked_sub(POINTER_WIDTH)?)?;
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;
            trace!("unwind: scan hit caller_pc: {caller_pc:#018x}, caller_sp: {caller_sp:#018x}");

            let mut caller_ctx = ContextMips::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc.wrapping_sub(2 * POINTER_WIDTH));
            caller_ctx.set_register(STACK_POINTER, caller_sp);
            caller_ctx.set_register(FRAME_POINTER, caller_fp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);
            valid.insert(FRAME_POINTER);

            let context = DumpContext {
                raw: RawContext::Mips(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            return Some(StackFrame::from_context(context, FrameTrust::Scan));
        }
    }

    None
}

#[async_trait]
impl Unwind for ContextMips {
    async fn get_caller_frame<P>(
        &self,
        callee: &StackFrame,
        grand_callee: Option<&StackFrame>,
        stack_memory: &DumpMemory<'_>,
        modules: &DumpModuleList,
        _system_info: &SystemInfo,
        options: &ProcessorOptions,
        syms: &P,
    ) -> CallerResult
    where
        P: SymbolProvider + Sync,
    {
        let mut frame =
            get_caller_by_cfi(self, callee, grand_callee, stack_memory, modules, syms).await?;
        if frame.is_none() && options.allow_scan {
            frame = get_caller_by_scan(self, callee, stack_memory, modules, syms).await;
        }
        let mut frame = match frame {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.context.get_instruction_pointer() < 0x1000 {
            return Ok(None);
        }

        let sp = frame.context.get_stack_pointer();
        let last_sp = self.get_register_always(STACK_POINTER);
        if sp <= last_sp {
            let is_leaf = callee.trust == FrameTrust::Context && sp == last_sp;
            if !is_leaf {
                return Ok(None);
            }
        }

        // The pc already points at the call; symbolize inside it.
        let ip = frame.context.get_instruction_pointer();
        frame.instruction = ip;

        Ok(Some(frame))
    }
}
