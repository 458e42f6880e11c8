//! Stack unwinding for 32-bit Arm.
//!
//! Arm builds split on which register anchors the frame chain: AAPCS uses
//! r11, Apple's variant uses r7. Without a reliable per-module hint, both
//! are tried.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::{ArmRegisters, ContextArm};
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

type Pointer = u32;
const POINTER_WIDTH: Pointer = 4;
const FRAME_POINTER: &str = ArmRegisters::FramePointer.name();
const IOS_FRAME_POINTER: &str = ArmRegisters::IosFramePointer.name();
const STACK_POINTER: &str = ArmRegisters::StackPointer.name();
const LINK_REGISTER: &str = ArmRegisters::LinkRegister.name();
const PROGRAM_COUNTER: &str = ArmRegisters::ProgramCounter.name();
const CALLEE_SAVED_REGS: &[&str] = &["r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11"];

async fn get_caller_by_cfi<P>(
    ctx: &ContextArm,
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
    trace!("unwind: cfi emitted caller_pc: {caller_pc:#010x}, caller_sp: {caller_sp:#010x}");

    let context = DumpContext {
        raw: RawContext::Arm(stack_walker.caller_ctx),
        valid: ContextValidity::Some(stack_walker.caller_validity),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::CallFrameInfo);
    adjust_instruction(&mut frame, caller_pc);
    Ok(Some(frame))
}

fn frame_pointer_chain(
    ctx: &ContextArm,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
    fp_name: &'static str,
) -> Option<StackFrame> {
    // The lr/fp pair-push prologue gives:
    //
    //   pc := lr
    //   sp := fp + 8
    //   lr := *(fp + 4)
    //   fp := *fp
    let valid = &callee.context.valid;
    let last_fp = ctx.get_register(fp_name, valid)?;
    let last_sp = ctx.get_register(STACK_POINTER, valid)?;
    let last_lr = ctx.get_register(LINK_REGISTER, valid)?;

    let caller_fp: Pointer = stack_memory.get_memory_at_address(last_fp as u64)?;
    let caller_lr = stack_memory.get_memory_at_address(last_fp as u64 + POINTER_WIDTH as u64)?;
    let caller_pc = last_lr;
    let caller_sp = if last_fp == 0 {
        last_sp
    } else {
        last_fp.checked_add(POINTER_WIDTH * 2)?
    };

    let mut caller_ctx = ContextArm::default();
    caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
    caller_ctx.set_register(LINK_REGISTER, caller_lr);
    caller_ctx.set_register(fp_name, caller_fp);
    caller_ctx.set_register(STACK_POINTER, caller_sp);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(LINK_REGISTER);
    valid.insert(ContextArm::canonical_register(fp_name)?);
    valid.insert(STACK_POINTER);

    let context = DumpContext {
        raw: RawContext::Arm(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_pc);
    Some(frame)
}

async fn get_caller_by_frame_pointer<P>(
    ctx: &ContextArm,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider + Sync,
{
    trace!("unwind: trying frame pointer");
    // Try r11 first, then the Apple r7 convention; accept whichever
    // produces a return address that looks like code.
    for fp_name in [FRAME_POINTER, IOS_FRAME_POINTER] {
        if let Some(frame) = frame_pointer_chain(ctx, callee, stack_memory, fp_name) {
            let pc = frame.context.get_instruction_pointer();
            if instruction_seems_valid_by_symbols(pc, modules, symbol_provider).await {
                return Some(frame);
            }
        }
    }
    None
}

/// For a crashing leaf function, the return address is still in lr.
async fn get_caller_by_link_register<P>(
    ctx: &ContextArm,
    callee: &StackFrame,
    modules: &DumpModuleList,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider + Sync,
{
    if callee.trust != FrameTrust::Context {
        return None;
    }
    trace!("unwind: trying link register");
    let valid = &callee.context.valid;
    let last_lr = ctx.get_register(LINK_REGISTER, valid)?;
    let last_sp = ctx.get_register(STACK_POINTER, valid)?;
    if !instruction_seems_valid_by_symbols(last_lr as u64, modules, symbol_provider).await {
        return None;
    }

    let mut caller_ctx = ctx.clone();
    caller_ctx.set_register(PROGRAM_COUNTER, last_lr);
    caller_ctx.set_register(STACK_POINTER, last_sp);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(STACK_POINTER);

    let context = DumpContext {
        raw: RawContext::Arm(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, last_lr);
    Some(frame)
}

async fn get_caller_by_scan<P>(
    ctx: &ContextArm,
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
        let caller_pc: Pointer = stack_memory.get_memory_at_address(address_of_pc as u64)?;
        if instruction_seems_valid_by_symbols(caller_pc as u64, modules, symbol_provider).await {
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;
            trace!("unwind: scan hit caller_pc: {caller_pc:#010x}, caller_sp: {caller_sp:#010x}");

            let mut caller_ctx = ContextArm::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
            caller_ctx.set_register(STACK_POINTER, caller_sp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);

            let context = DumpContext {
                raw: RawContext::Arm(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
            adjust_instruction(&mut frame, caller_pc);
            return Some(frame);
        }
    }

    None
}

fn adjust_instruction(frame: &mut StackFrame, caller_pc: Pointer) {
    // Step back into the branch instruction; two bytes keeps Thumb call
    // sites in range as well.
    if caller_pc >= 2 {
        frame.instruction = caller_pc as u64 - 2;
    }
}

#[async_trait]
impl Unwind for ContextArm {
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
            frame = get_caller_by_frame_pointer(self, callee, stack_memory, modules, syms).await;
        }
        if frame.is_none() {
            frame = get_caller_by_link_register(self, callee, modules, syms).await;
        }
        if frame.is_none() && options.allow_scan {
            frame = get_caller_by_scan(self, callee, stack_memory, modules, syms).await;
        }
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.context.get_instruction_pointer() < 0x1000 {
            return Ok(None);
        }

        let sp = frame.context.get_stack_pointer();
        let last_sp = self.get_register_always(STACK_POINTER) as u64;
        if sp <= last_sp {
            // Leaf functions may not touch the stack; allow one repeat of
            // the stack pointer at frame 0.
            let is_leaf = callee.trust == FrameTrust::Context && sp == last_sp;
            if !is_leaf {
                return Ok(None);
            }
        }
        Ok(Some(frame))
    }
}
