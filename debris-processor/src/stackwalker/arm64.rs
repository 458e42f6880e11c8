//! Stack unwinding for aarch64.
//!
//! The return address lives in the link register rather than on the
//! stack, and on Apple hardware the saved lr/fp values carry pointer
//! authentication bits in their high bits that must be stripped before
//! use.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::{Arm64Registers, ContextArm64};
use debris_dump::{
    ContextValidity, CpuRegisters, DumpContext, DumpMemory, DumpModuleList, Module, RawContext,
};
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
const FRAME_POINTER: &str = Arm64Registers::FramePointer.name();
const LINK_REGISTER: &str = Arm64Registers::LinkRegister.name();
const STACK_POINTER: &str = Arm64Registers::StackPointer.name();
const PROGRAM_COUNTER: &str = Arm64Registers::ProgramCounter.name();
const CALLEE_SAVED_REGS: &[&str] = &[
    "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "x29",
];

async fn get_caller_by_cfi<P>(
    ctx: &ContextArm64,
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
    let caller_pc = stack_walker.caller_ctx.get_register_always(PROGRAM_COUNTER);
    let caller_sp = stack_walker.caller_ctx.get_register_always(STACK_POINTER);
    trace!("unwind: cfi emitted caller_pc: {caller_pc:#018x}, caller_sp: {caller_sp:#018x}");

    // Successful CFI evaluation (which had to resolve pc and sp) is
    // trusted as-is; extra validation here rejects legitimate unwinds
    // through modules without symbols.
    let context = DumpContext {
        raw: RawContext::Arm64(stack_walker.caller_ctx),
        valid: ContextValidity::Some(stack_walker.caller_validity),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::CallFrameInfo);
    adjust_instruction(&mut frame, caller_pc);
    Ok(Some(frame))
}

/// Strip pointer-authentication bits with an address-space mask.
///
/// The highest mappable module address bounds the meaningful bits of any
/// code pointer; smearing that bit downward produces a mask that clears
/// PAC material above it. The stripped value is only used when it actually
/// lands in a module, so plain pointers into unmapped space survive.
fn ptr_auth_strip(modules: &DumpModuleList, ptr: Pointer) -> Pointer {
    if let Some(last_module) = modules.by_addr().next_back() {
        let mut mask = last_module.base_address() + last_module.size();
        mask |= mask >> 1;
        mask |= mask >> 2;
        mask |= mask >> 4;
        mask |= mask >> 8;
        mask |= mask >> 16;
        mask |= mask >> 32;
        let stripped = ptr & mask;
        if modules.module_at_address(stripped).is_some() {
            return stripped;
        }
    }
    ptr
}

fn get_caller_by_frame_pointer(
    ctx: &ContextArm64,
    callee: &StackFrame,
    grand_callee: Option<&StackFrame>,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");
    // The standard prologue pushes the fp/lr pair and points fp at the
    // pair, so:
    //
    //   pc := lr
    //   sp := fp + 16
    //   lr := *(fp + 8)
    //   fp := *fp
    let valid = &callee.context.valid;
    let last_fp = ctx.get_register(FRAME_POINTER, valid)?;
    let last_sp = ctx.get_register(STACK_POINTER, valid)?;
    let last_lr = match ctx.get_register(LINK_REGISTER, valid) {
        Some(lr) => ptr_auth_strip(modules, lr),
        None => get_link_register_by_frame_pointer(
            ctx,
            valid,
            stack_memory,
            grand_callee,
            modules,
        )?,
    };

    if last_fp >= u64::MAX - POINTER_WIDTH * 2 {
        return None;
    }

    let (caller_fp, caller_lr, caller_sp) = if last_fp == 0 {
        // A null fp chain-end; emit a frame whose sp matches the callee so
        // the driver's progress check ends the walk.
        (0, 0, last_sp)
    } else {
        (
            stack_memory.get_memory_at_address(last_fp)?,
            stack_memory.get_memory_at_address(last_fp + POINTER_WIDTH)?,
            last_fp + POINTER_WIDTH * 2,
        )
    };
    let caller_lr = ptr_auth_strip(modules, caller_lr);
    let caller_pc = last_lr;

    if is_non_canonical(caller_pc) {
        trace!("unwind: rejecting frame pointer result, pc non-canonical");
        return None;
    }
    trace!("unwind: frame pointer gave caller_pc: {caller_pc:#018x}, caller_sp: {caller_sp:#018x}");

    let mut caller_ctx = ContextArm64::default();
    caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
    caller_ctx.set_register(LINK_REGISTER, caller_lr);
    caller_ctx.set_register(FRAME_POINTER, caller_fp);
    caller_ctx.set_register(STACK_POINTER, caller_sp);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(LINK_REGISTER);
    valid.insert(FRAME_POINTER);
    valid.insert(STACK_POINTER);

    let context = DumpContext {
        raw: RawContext::Arm64(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_pc);
    Some(frame)
}

/// Recover the callee's lost lr from where the grand-callee's prologue
/// saved it.
///
/// If an earlier strategy restored fp but not lr, and the grand-callee
/// used the fp/lr pair-push convention, the callee's lr sits right above
/// its saved fp.
fn get_link_register_by_frame_pointer(
    ctx: &ContextArm64,
    valid: &ContextValidity,
    stack_memory: &DumpMemory<'_>,
    grand_callee: Option<&StackFrame>,
    modules: &DumpModuleList,
) -> Option<Pointer> {
    let grand_callee = grand_callee?;
    let last_last_fp = if let RawContext::Arm64(ref grand_ctx) = grand_callee.context.raw {
        grand_ctx.get_register(FRAME_POINTER, &grand_callee.context.valid)?
    } else {
        return None;
    };
    let presumed_last_fp: Pointer = stack_memory.get_memory_at_address(last_last_fp)?;

    // fp/sp must be ordered sanely and the two frames must agree on fp.
    let last_fp = ctx.get_register(FRAME_POINTER, valid)?;
    let last_sp = ctx.get_register(STACK_POINTER, valid)?;
    if last_fp <= last_sp || presumed_last_fp != last_fp {
        return None;
    }

    let last_lr = stack_memory.get_memory_at_address(last_last_fp + POINTER_WIDTH)?;
    Some(ptr_auth_strip(modules, last_lr))
}

async fn get_caller_by_scan<P>(
    ctx: &ContextArm64,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider + Sync,
{
    trace!("unwind: trying scan");
    let valid = &callee.context.valid;
    let last_sp = ctx.get_register(STACK_POINTER, valid)?;

    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;
    let scan_range = if callee.trust == FrameTrust::Context {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_pc = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_pc: Pointer = stack_memory.get_memory_at_address(address_of_pc)?;
        let caller_pc = ptr_auth_strip(modules, caller_pc);
        if !is_non_canonical(caller_pc)
            && instruction_seems_valid_by_symbols(caller_pc, modules, symbol_provider).await
        {
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;
            trace!("unwind: scan hit caller_pc: {caller_pc:#018x}, caller_sp: {caller_sp:#018x}");

            let mut caller_ctx = ContextArm64::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
            caller_ctx.set_register(STACK_POINTER, caller_sp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);

            let context = DumpContext {
                raw: RawContext::Arm64(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
            adjust_instruction(&mut frame, caller_pc);
            return Some(frame);
        }
    }

    None
}

fn is_non_canonical(instruction: Pointer) -> bool {
    !(0x1000..=0x000f_ffff_ffff_ffff).contains(&instruction)
}

fn adjust_instruction(frame: &mut StackFrame, caller_pc: Pointer) {
    // Instructions are four bytes; the return address is one instruction
    // past the branch-and-link that got us here.
    if caller_pc >= 4 {
        frame.instruction = caller_pc - 4;
    }
}

#[async_trait]
impl Unwind for ContextArm64 {
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
            frame =
                get_caller_by_frame_pointer(self, callee, grand_callee, stack_memory, modules);
        }
        if frame.is_none() && options.allow_scan {
            frame = get_caller_by_scan(self, callee, stack_memory, modules, syms).await;
        }
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(None),
        };

        // Nullish pc: done.
        if frame.context.get_instruction_pointer() < 0x1000 {
            return Ok(None);
        }

        // The stack pointer must advance, except that a frame-0 leaf
        // function may never have touched the stack (its return address is
        // still in lr).
        let sp = frame.context.get_stack_pointer();
        let last_sp = self.get_register_always(STACK_POINTER);
        if sp <= last_sp {
            let is_leaf = callee.trust == FrameTrust::Context && sp == last_sp;
            if !is_leaf {
                return Ok(None);
            }
        }
        Ok(Some(frame))
    }
}
