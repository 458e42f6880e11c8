//! Stack unwinding for SPARC.
//!
//! Register windows mean stale stack words routinely look like return
//! addresses, so scanning is off the table entirely; only CFI and the
//! frame-pointer convention are used. The saved %i7 holds the address of
//! the call instruction itself.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::{ContextSparc, SparcRegisters};
use debris_dump::{ContextValidity, CpuRegisters, DumpContext, DumpMemory, DumpModuleList, RawContext};
use debris_symbols::WalkError;

use super::{callee_forwarded_regs, CallerResult, CfiStackWalker, Unwind, WalkInterrupted};
use crate::process_state::{FrameTrust, StackFrame};
use crate::processor::ProcessorOptions;
use crate::symbols::SymbolProvider;
use crate::system_info::SystemInfo;

type Pointer = u64;
const WORD: u64 = 8;
const STACK_POINTER: &str = SparcRegisters::StackPointer.name();
const FRAME_POINTER: &str = SparcRegisters::FramePointer.name();
const RETURN_ADDRESS: &str = SparcRegisters::ReturnAddress.name();
const PROGRAM_COUNTER: &str = "pc";
// The in-registers survive into the caller's window.
const CALLEE_SAVED_REGS: &[&str] = &["i0", "i1", "i2", "i3", "i4", "i5", "i6", "i7"];

async fn get_caller_by_cfi<P>(
    ctx: &ContextSparc,
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
    let mut stack_walker = CfiStackWalker {
        instruction: callee.instruction,
        has_grand_callee: grand_callee.is_some(),
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

    let context = DumpContext {
        raw: RawContext::Sparc(stack_walker.caller_ctx),
        valid: ContextValidity::Some(stack_walker.caller_validity),
    };
    Ok(Some(StackFrame::from_context(
        context,
        FrameTrust::CallFrameInfo,
    )))
}

fn get_caller_by_frame_pointer(
    ctx: &ContextSparc,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");
    // The caller's window was saved at %fp: the in-registers live at
    // [fp + 8*word..], with the saved %fp at in6's slot and the call
    // address in in7's. The callee's %fp becomes the caller's %sp.
    let valid = &callee.context.valid;
    let last_fp = ctx.get_register(FRAME_POINTER, valid)?;

    let caller_fp: Pointer = stack_memory.get_memory_at_address(last_fp + 14 * WORD)?;
    let caller_pc_call: Pointer = stack_memory.get_memory_at_address(last_fp + 15 * WORD)?;
    let caller_sp = last_fp;
    // The saved address points at the call; execution resumes two
    // instructions later (call + delay slot).
    let caller_pc = caller_pc_call.checked_add(8)?;

    let mut caller_ctx = ContextSparc::default();
    caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
    caller_ctx.set_register(STACK_POINTER, caller_sp);
    caller_ctx.set_register(FRAME_POINTER, caller_fp);
    caller_ctx.set_register(RETURN_ADDRESS, caller_pc_call);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(STACK_POINTER);
    valid.insert(FRAME_POINTER);
    valid.insert(RETURN_ADDRESS);

    let context = DumpContext {
        raw: RawContext::Sparc(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    // Symbolize at the call instruction itself.
    frame.instruction = caller_pc_call;
    Some(frame)
}

#[async_trait]
impl Unwind for ContextSparc {
    async fn get_caller_frame<P>(
        &self,
        callee: &StackFrame,
        grand_callee: Option<&StackFrame>,
        stack_memory: &DumpMemory<'_>,
        modules: &DumpModuleList,
        _system_info: &SystemInfo,
        _options: &ProcessorOptions,
        syms: &P,
    ) -> CallerResult
    where
        P: SymbolProvider + Sync,
    {
        // No scanning here: register windows leave too many plausible
        // return addresses lying around.
        let mut frame =
            get_caller_by_cfi(self, callee, grand_callee, stack_memory, modules, syms).await?;
        if frame.is_none() {
            frame = get_caller_by_frame_pointer(self, callee, stack_memory);
        }
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.context.get_instruction_pointer() < 0x1000 {
            return Ok(None);
        }
        // Stack grows down; %sp must move strictly toward the stack base.
        if frame.context.get_stack_pointer() <= self.get_register_always(STACK_POINTER) {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}
