//! Stack unwinding for x86-64.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::ContextAmd64;
use debris_dump::{ContextValidity, DumpContext, DumpMemory, DumpModuleList, Os, RawContext};
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
const INSTRUCTION_REGISTER: &str = "rip";
const STACK_POINTER_REGISTER: &str = "rsp";
const FRAME_POINTER_REGISTER: &str = "rbp";
const CALLEE_SAVED_REGS: &[&str] = &["rbx", "rbp", "r12", "r13", "r14", "r15"];

/// Bytes below %rsp that leaf functions may legitimately use on SysV.
const SYSV_RED_ZONE: Pointer = 128;

async fn get_caller_by_cfi<P>(
    ctx: &ContextAmd64,
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

    let last_sp = ctx.rsp;
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
    let caller_ip = stack_walker.caller_ctx.rip;
    let caller_sp = stack_walker.caller_ctx.rsp;
    trace!("unwind: cfi emitted caller_ip: {caller_ip:#018x}, caller_sp: {caller_sp:#018x}");

    if is_non_canonical(caller_ip) {
        return Ok(None);
    }
    if !stack_seems_valid(caller_sp, last_sp, stack_memory) {
        return Ok(None);
    }

    let context = DumpContext {
        raw: RawContext::Amd64(stack_walker.caller_ctx),
        valid: ContextValidity::Some(stack_walker.caller_validity),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::CallFrameInfo);
    adjust_instruction(&mut frame, caller_ip);
    Ok(Some(frame))
}

fn get_caller_by_frame_pointer(
    ctx: &ContextAmd64,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");
    if let ContextValidity::Some(which) = &callee.context.valid {
        if !which.contains(FRAME_POINTER_REGISTER) {
            return None;
        }
    }

    // Same %bp-chain convention as x86, with 8-byte words:
    //
    //   %ip_new = *(%bp_old + 8)
    //   %sp_new = %bp_old + 16
    //   %bp_new = *(%bp_old)
    let last_bp = ctx.rbp;
    if last_bp >= u64::MAX - POINTER_WIDTH * 2 {
        return None;
    }
    let caller_ip = stack_memory.get_memory_at_address(last_bp + POINTER_WIDTH)?;
    let caller_bp = stack_memory.get_memory_at_address(last_bp)?;
    let caller_sp = last_bp + POINTER_WIDTH * 2;

    let caller_ctx = ContextAmd64 {
        rip: caller_ip,
        rsp: caller_sp,
        rbp: caller_bp,
        ..ContextAmd64::default()
    };
    let mut valid = HashSet::new();
    valid.insert(INSTRUCTION_REGISTER);
    valid.insert(STACK_POINTER_REGISTER);
    valid.insert(FRAME_POINTER_REGISTER);
    let context = DumpContext {
        raw: RawContext::Amd64(caller_ctx),
        valid: ContextValidity::Some(valid),
    };
    let mut frame = StackFrame::from_context(context, FrameTrust::FramePointer);
    adjust_instruction(&mut frame, caller_ip);
    Some(frame)
}

async fn get_caller_by_scan<P>(
    ctx: &ContextAmd64,
    callee: &StackFrame,
    stack_memory: &DumpMemory<'_>,
    modules: &DumpModuleList,
    system_info: &SystemInfo,
    symbol_provider: &P,
) -> Option<StackFrame>
where
    P: SymbolProvider + Sync,
{
    trace!("unwind: trying scan");
    let last_bp = match &callee.context.valid {
        ContextValidity::All => Some(ctx.rbp),
        ContextValidity::Some(which) => {
            if !which.contains(STACK_POINTER_REGISTER) {
                return None;
            }
            which.contains(FRAME_POINTER_REGISTER).then_some(ctx.rbp)
        }
    };

    // On SysV targets a crashing leaf function may still have live data in
    // the red zone below %rsp, and its return address can sit there too;
    // let the first-frame scan start below the stack pointer.
    let mut last_sp = ctx.rsp;
    if callee.trust == FrameTrust::Context && system_info.os != Os::Windows {
        last_sp = last_sp.saturating_sub(SYSV_RED_ZONE);
    }

    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;
    let scan_range = if callee.trust == FrameTrust::Context {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip: Pointer = stack_memory.get_memory_at_address(address_of_ip)?;
        if !is_non_canonical(caller_ip)
            && instruction_seems_valid_by_symbols(caller_ip, modules, symbol_provider).await
        {
            let caller_sp = address_of_ip.checked_add(POINTER_WIDTH)?;

            // Rescue %rbp when the standard prologue evidently ran, or
            // when the callee's value still points above this frame.
            let mut caller_bp = None;
            if let Some(last_bp) = last_bp {
                let address_of_bp = address_of_ip.wrapping_sub(POINTER_WIDTH);
                if last_bp == address_of_bp {
                    let bp: Pointer = stack_memory.get_memory_at_address(address_of_bp)?;
                    if bp > address_of_ip {
                        caller_bp = Some(bp);
                    }
                } else if last_bp >= caller_sp {
                    caller_bp = Some(last_bp);
                }
            }

            let caller_ctx = ContextAmd64 {
                rip: caller_ip,
                rsp: caller_sp,
                rbp: caller_bp.unwrap_or(0),
                ..ContextAmd64::default()
            };
            let mut valid = HashSet::new();
            valid.insert(INSTRUCTION_REGISTER);
            valid.insert(STACK_POINTER_REGISTER);
            if caller_bp.is_some() {
                valid.insert(FRAME_POINTER_REGISTER);
            }
            let context = DumpContext {
                raw: RawContext::Amd64(caller_ctx),
                valid: ContextValidity::Some(valid),
            };
            let mut frame = StackFrame::from_context(context, FrameTrust::Scan);
            adjust_instruction(&mut frame, caller_ip);
            return Some(frame);
        }
    }

    None
}

fn is_non_canonical(instruction: Pointer) -> bool {
    // Reject the first page and anything above the user-space range.
    !(0x1000..=0x0007_ffff_ffff_ffff).contains(&instruction)
}

fn stack_seems_valid(caller_sp: Pointer, callee_sp: Pointer, stack_memory: &DumpMemory<'_>) -> bool {
    if caller_sp <= callee_sp {
        return false;
    }
    stack_memory
        .get_memory_at_address::<Pointer>(caller_sp)
        .is_some()
}

fn adjust_instruction(frame: &mut StackFrame, caller_ip: Pointer) {
    if caller_ip > 0 {
        frame.instruction = caller_ip - 1;
    }
}

#[async_trait]
impl Unwind for ContextAmd64 {
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
        P: SymbolProvider + Sync,
    {
        let mut frame =
            get_caller_by_cfi(self, callee, grand_callee, stack_memory, modules, syms).await?;
        // Frame pointers are not part of the baseline amd64 ABI; most
        // builds repurpose %rbp, so chasing it by default invents frames.
        // Callers that know their binaries keep frame pointers opt in.
        if frame.is_none() && options.amd64_use_fp {
            frame = get_caller_by_frame_pointer(self, callee, stack_memory);
        }
        if frame.is_none() && options.allow_scan {
            frame =
                get_caller_by_scan(self, callee, stack_memory, modules, system_info, syms).await;
        }
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.context.get_instruction_pointer() < 0x1000 {
            return Ok(None);
        }
        if frame.context.get_stack_pointer() <= self.rsp {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}
