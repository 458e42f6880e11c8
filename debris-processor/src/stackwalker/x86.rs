//! Stack unwinding for x86.
//!
//! x86 is the only architecture with STACK WIN records; those are tried by
//! the symbol layer as part of `walk_frame`, ahead of plain CFI.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::ContextX86;
use debris_dump::{ContextValidity, DumpContext, DumpMemory, DumpModuleList, RawContext};
use debris_symbols::WalkError;

use super::{
    callee_forwarded_regs, instruction_seems_valid_by_symbols, CallerResult, CfiStackWalker,
    Unwind, WalkInterrupted,
};
use crate::process_state::{FrameTrust, StackFrame};
use crate::processor::ProcessorOptions;
use crate::symbols::SymbolProvider;
use crate::system_info::SystemInfo;

type Pointer = u32;
const POINTER_WIDTH: Pointer = 4;
const INSTRUCTION_REGISTER: &str = "eip";
const STACK_POINTER_REGISTER: &str = "esp";
const FRAME_POINTER_REGISTER: &str = "ebp";
const CALLEE_SAVED_REGS: &[&str] = &["ebp", "ebx", "edi", "esi"];

async fn get_caller_by_cfi<P>(
    ctx: &ContextX86,
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
    if let ContextValidity::Some(which) = valid {
        if !which.contains(INSTRUCTION_REGISTER) || !which.contains(STACK_POINTER_REGISTER) {
            return Ok(None);
        }
    }

    let last_sp = ctx.esp;
    let last_ip = ctx.eip;
    let module = match modules.module_at_address(last_ip as u64) {
        Some(module) => module,
        None => return Ok(None),
    };

    let grand_callee_parameter_size = grand_callee.and_then(|f| f.parameter_size).unwrap_or(0);
    let has_grand_callee = grand_callee.is_some();

    // STACK WIN record queries sometimes land just past the record's
    // extent; looking up one byte back into the call hits the right one.
    let instruction = if callee.trust == FrameTrust::Context {
        last_ip as u64
    } else {
        last_ip as u64 - 1
    };

    let mut stack_walker = CfiStackWalker {
        instruction,
        has_grand_callee,
        grand_callee_parameter_size,

        callee_ctx: ctx,
        callee_validity: valid,

        // Forward the callee-saved registers verbatim by default; the
        // evaluator overwrites or clears them.
        caller_ctx: ctx.clone(),
        caller_validity: callee_forwarded_regs(valid, CALLEE_SAVED_REGS),

        stack_memory,
    };

    match symbol_provider.walk_frame(module, &mut stack_walker).await {
        Ok(()) => {}
        Err(WalkError::NoUnwindInfo) => return Ok(None),
        Err(WalkError::Interrupted) => return Err(WalkInterrupted),
    }
    let caller_ip = stack_walker.caller_ctx.eip;
    let caller_sp = stack_walker.caller_ctx.esp;
    trace!("unwind: cfi emitted caller_ip: {caller_ip:#010x}, caller_sp: {caller_sp:#010x}");

    // Reject evaluations that obviously went wrong.
    if !instruction_seems_valid_by_symbols(caller_ip as u64, modules, symbol_provider).await {
        return Ok(None);
    }
    if !stack_seems_valid(caller_sp, last_sp, stack_memory) {
        return Ok(None);
    }

    let context = DumpContext {
        raw: RawContext::X86(stack_walker.caller_ctx),
        valid: ContextValidity::Some(stack_walker.caller_validity),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::CallFrameInfo);
    adjust_instruction(&mut frame, caller_ip);
    Ok(Some(frame))
}

fn get_caller_by_frame_pointer(
    ctx: &ContextX86,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");
    if let ContextValidity::Some(which) = &callee.context.valid {
        if !which.contains(FRAME_POINTER_REGISTER) {
            return None;
        }
    }

    let last_bp = ctx.ebp;
    // In the conventional %ebp-chained calling convention, CALL pushes the
    // return address and the callee pushes the caller's %ebp, then copies
    // %esp into %ebp. So:
    //
    //   %ip_new = *(%bp_old + 4)
    //   %sp_new = %bp_old + 8
    //   %bp_new = *(%bp_old)
    let caller_ip = stack_memory.get_memory_at_address(last_bp as u64 + POINTER_WIDTH as u64)?;
    let caller_bp = stack_memory.get_memory_at_address(last_bp as u64)?;
    let caller_sp = last_bp.checked_add(POINTER_WIDTH * 2)?;

    let caller_ctx = ContextX86 {
        eip: caller_ip,
        esp: caller_sp,
        ebp: caller_bp,
        ..ContextX86::default()
    };
    let mut valid = HashSet::new();
    valid.insert(INSTRUCTION_REGISTER);
    valid.insert(STACK_POINTER_REGISTER);
    valid.insert(FRAME_POINTER_REGISTER);
    let context = DumpContext {
        raw: RawContext::X86(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_ip);
    Some(frame)
}

async fn get_caller_by_scan<P>(
    ctx: &ContextX86,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider + Sync,
{
    trace!("unwind: trying scan");
    // Walk up from the callee's stack pointer looking for a word that
    // could be a return address (it lands in a module and symbolizes).
    // The frame is then assumed to end just before that word.
    let last_bp = match &callee.context.valid {
        ContextValidity::All => Some(ctx.ebp),
        ContextValidity::Some(which) => {
            if !which.contains(STACK_POINTER_REGISTER) {
                return None;
            }
            which.contains(FRAME_POINTER_REGISTER).then_some(ctx.ebp)
        }
    };
    let last_sp = ctx.esp;

    // Words to inspect; the first frame gets a longer leash because crash
    // PCs are often nowhere near a normal frame layout.
    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;
    let scan_range = if callee.trust == FrameTrust::Context {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip: Pointer = stack_memory.get_memory_at_address(address_of_ip as u64)?;
        if instruction_seems_valid_by_symbols(caller_ip as u64, modules, symbol_provider).await {
            // The ip was pushed by CALL, so the caller's sp is one word up.
            let caller_sp = address_of_ip.checked_add(POINTER_WIDTH)?;

            // Try to rescue %ebp too. Either this function used the
            // standard prologue and the saved %ebp sits just below the
            // return address, or it never touched %ebp and the callee's
            // value still holds. Sanity-check both against the stack.
            let mut caller_bp = None;

            // 99.5% of observed x86 frames are under 128KiB; anything
            // further is assumed to be a missed chain.
            const MAX_REASONABLE_GAP_BETWEEN_FRAMES: Pointer = 128 * 1024;

            if address_of_ip >= POINTER_WIDTH {
                let address_of_bp = address_of_ip - POINTER_WIDTH;
                let bp: Pointer = stack_memory.get_memory_at_address(address_of_bp as u64)?;
                if bp > address_of_ip
                    && bp.wrapping_sub(address_of_bp) <= MAX_REASONABLE_GAP_BETWEEN_FRAMES
                {
                    if stack_memory
                        .get_memory_at_address::<Pointer>(bp as u64)
                        .is_some()
                    {
                        caller_bp = Some(bp);
                    }
                } else if let Some(last_bp) = last_bp {
                    if last_bp >= caller_sp
                        && stack_memory
                            .get_memory_at_address::<Pointer>(last_bp as u64)
                            .is_some()
                    {
                        caller_bp = Some(last_bp);
                    }
                }
            }

            let caller_ctx = ContextX86 {
                eip: caller_ip,
                esp: caller_sp,
                ebp: caller_bp.unwrap_or(0),
                ..ContextX86::default()
            };
            let mut valid = HashSet::new();
            valid.insert(INSTRUCTION_REGISTER);
            valid.insert(STACK_POINTER_REGISTER);
            if caller_bp.is_some() {
                valid.insert(FRAME_POINTER_REGISTER);
            }
            let context = DumpContext {
                raw: RawContext::X86(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
            adjust_instruction(&mut frame, caller_ip);
            return Some(frame);
        }
    }

    None
}

fn stack_seems_valid(caller_sp: Pointer, callee_sp: Pointer, stack_memory: &DumpMemory<'_>) -> bool {
    // The stack must not grow when unwinding.
    if caller_sp <= callee_sp {
        return false;
    }
    stack_memory
        .get_memory_at_address::<Pointer>(caller_sp as u64)
        .is_some()
}

fn adjust_instruction(frame: &mut StackFrame, caller_ip: Pointer) {
    // A recovered ip is the return address; step back one byte so symbol
    // lookups land inside the CALL instruction.
    if caller_ip > 0 {
        frame.instruction = caller_ip as u64 - 1;
    }
}

#[async_trait]
impl Unwind for ContextX86 {
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
        if frame.is_none() {
            frame = get_caller_by_frame_pointer(self, callee, stack_memory);
        }
        if frame.is_none() && options.allow_scan {
            frame = get_caller_by_scan(self, callee, stack_memory, modules, syms).await;
        }
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(None),
        };

        // A null ip means the end of the stack.
        if frame.context.get_instruction_pointer() == 0 {
            return Ok(None);
        }
        // A stack pointer that fails to advance means a busted unwind;
        // stop rather than loop.
        if frame.context.get_stack_pointer() <= self.esp as u64 {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}
