//! Stack unwinding for 32- and 64-bit PowerPC.
//!
//! The PowerPC ABIs keep a back chain: the word at `[sp]` is the caller's
//! stack pointer, and the caller's saved link register sits one word above
//! the chained-to frame. That makes frame recovery mostly a pointer chase,
//! with CFI preferred when symbols carry it.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::{ContextPpc, ContextPpc64};
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

const STACK_POINTER: &str = "r1";
const PROGRAM_COUNTER: &str = "srr0";
const LINK_REGISTER: &str = "lr";
const CALLEE_SAVED_REGS: &[&str] = &[
    "r1", "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25",
    "r26", "r27", "r28", "r29", "r30", "r31",
];

macro_rules! ppc_walker {
    ($ctx_ty:ty, $variant:ident, $pointer:ty, $word:expr) => {
        #[async_trait]
        impl Unwind for $ctx_ty {
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
                type Pointer = $pointer;
                const POINTER_WIDTH: Pointer = $word;

                let valid = &callee.context.valid;

                // CFI first.
                let mut frame = 'cfi: {
                    trace!("unwind: trying cfi");
                    if self.get_register(STACK_POINTER, valid).is_none() {
                        break 'cfi None;
                    }
                    let module = match modules.module_at_address(callee.instruction) {
                        Some(module) => module,
                        None => break 'cfi None,
                    };
                    let grand_callee_parameter_size =
                        grand_callee.and_then(|f| f.parameter_size).unwrap_or(0);
                    let mut stack_walker = CfiStackWalker {
                        instruction: callee.instruction,
                        has_grand_callee: grand_callee.is_some(),
                        grand_callee_parameter_size,
                        callee_ctx: self,
                        callee_validity: valid,
                        caller_ctx: self.clone(),
                        caller_validity: callee_forwarded_regs(valid, CALLEE_SAVED_REGS),
                        stack_memory,
                    };
                    match syms.walk_frame(module, &mut stack_walker).await {
                        Ok(()) => {}
                        Err(WalkError::NoUnwindInfo) => break 'cfi None,
                        Err(WalkError::Interrupted) => return Err(WalkInterrupted),
                    }
                    let context = DumpContext {
                        raw: RawContext::$variant(stack_walker.caller_ctx),
                        valid: ContextValidity::Some(stack_walker.caller_validity),
                    };
                    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
                };

                // Then the back chain: caller_sp = *[sp], and the saved lr
                // (the return address) lives one word above the chained-to
                // frame.
                if frame.is_none() {
                    trace!("unwind: trying back chain");
                    frame = (|| {
                        let last_sp = self.get_register(STACK_POINTER, valid)?;
                        let caller_sp: Pointer =
                            stack_memory.get_memory_at_address(last_sp as u64)?;
                        if caller_sp == 0 {
                            return None;
                        }
                        let caller_pc: Pointer = stack_memory
                            .get_memory_at_address(caller_sp as u64 + POINTER_WIDTH as u64)?;

                        let mut caller_ctx = <$ctx_ty>::default();
                        caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
                        caller_ctx.set_register(LINK_REGISTER, caller_pc);
                        caller_ctx.set_register(STACK_POINTER, caller_sp);

                        let mut valid = HashSet::new();
                        valid.insert(PROGRAM_COUNTER);
                        valid.insert(LINK_REGISTER);
                        valid.insert(STACK_POINTER);

                        let context = DumpContext {
                            raw: RawContext::$variant(caller_ctx),
                            valid: ContextValidity::Some(valid),
                        };
                        Some(StackFrame::from_context(context, FrameTrust::FramePointer))
                    })();
                }

                // Finally a scan of stack words.
                if frame.is_none() && options.allow_scan {
                    trace!("unwind: trying scan");
                    frame = 'scan: {
                        let last_sp = match self.get_register(STACK_POINTER, valid) {
                            Some(sp) => sp,
                            None => break 'scan None,
                        };
                        let default_scan_range = 40;
                        let scan_range = if callee.trust == FrameTrust::Context {
                            default_scan_range * 4
                        } else {
                            default_scan_range
                        };
                        for i in 0..scan_range {
                            let address_of_pc =
                                match last_sp.checked_add(i * POINTER_WIDTH) {
                                    Some(addr) => addr,
                                    None => break 'scan None,
                                };
                            let caller_pc: Pointer =
                                match stack_memory.get_memory_at_address(address_of_pc as u64) {
                                    Some(pc) => pc,
                                    None => break 'scan None,
                                };
                            if instruction_seems_valid_by_symbols(
                                caller_pc as u64,
                                modules,
                                syms,
                            )
                            .await
                            {
                                let caller_sp =
                                    match address_of_pc.checked_add(POINTER_WIDTH) {
                                        Some(sp) => sp,
                                        None => break 'scan None,
                                    };
                                let mut caller_ctx = <$ctx_ty>::default();
                                caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
                                caller_ctx.set_register(STACK_POINTER, caller_sp);

                                let mut valid = HashSet::new();
                                valid.insert(PROGRAM_COUNTER);
                                valid.insert(STACK_POINTER);

                                let context = DumpContext {
                                    raw: RawContext::$variant(caller_ctx),
                                    valid: ContextValidity::Some(valid),
                                };
                                break 'scan Some(StackFrame::from_context(
                                    context,
                                    FrameTrust::Scan,
                                ));
                            }
                        }
                        None
                    };
                }

                let mut frame = match frame {
                    Some(frame) => frame,
                    None => return Ok(None),
                };

                if frame.context.get_instruction_pointer() < 0x1000 {
                    return Ok(None);
                }
                let sp = frame.context.get_stack_pointer();
                let last_sp = self.get_register_always(STACK_POINTER) as u64;
                if sp <= last_sp {
                    let is_leaf = callee.trust == FrameTrust::Context && sp == last_sp;
                    if !is_leaf {
                        return Ok(None);
                    }
                }

                // Step back into the branch-and-link; instructions are
                // four bytes.
                let ip = frame.context.get_instruction_pointer();
                if ip >= 4 {
                    frame.instruction = ip - 4;
                }
                Ok(Some(frame))
            }
        }
    };
}

ppc_walker!(ContextPpc, Ppc, u32, 4);
ppc_walker!(ContextPpc64, Ppc64, u64, 8);
