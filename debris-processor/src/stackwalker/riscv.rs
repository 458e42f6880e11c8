//! Stack unwinding for riscv32 and riscv64.
//!
//! CFI is the primary strategy; when the build keeps frame pointers, s0
//! anchors the conventional fp/ra pair-push chain, and a scan covers the
//! rest.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use debris_dump::format::{ContextRiscv, ContextRiscv64, RiscvRegisters};
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

const FRAME_POINTER: &str = RiscvRegisters::FramePointer.name();
const RETURN_ADDRESS: &str = RiscvRegisters::ReturnAddress.name();
const STACK_POINTER: &str = RiscvRegisters::StackPointer.name();
const PROGRAM_COUNTER: &str = "pc";
const CALLEE_SAVED_REGS: &[&str] = &[
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "sp",
];

macro_rules! riscv_walker {
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

                // The fp/ra pair-push convention (when built with frame
                // pointers):
                //
                //   pc := ra
                //   sp := fp + 2*word
                //   ra := *(fp + word)
                //   fp := *fp
                if frame.is_none() {
                    trace!("unwind: trying frame pointer");
                    frame = (|| {
                        let last_fp = self.get_register(FRAME_POINTER, valid)?;
                        let last_sp = self.get_register(STACK_POINTER, valid)?;
                        let last_ra = self.get_register(RETURN_ADDRESS, valid)?;

                        let (caller_fp, caller_pc, caller_sp, caller_ra) = if last_fp == 0 {
                            // Chain end; repeat sp so the progress check
                            // stops the walk.
                            (0, last_ra, last_sp, 0)
                        } else {
                            (
                                stack_memory.get_memory_at_address(last_fp as u64)?,
                                last_ra,
                                last_fp.checked_add(POINTER_WIDTH * 2)?,
                                stack_memory
                                    .get_memory_at_address(last_fp as u64 + POINTER_WIDTH as u64)?,
                            )
                        };

                        let mut caller_ctx = <$ctx_ty>::default();
                        caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
                        caller_ctx.set_register(FRAME_POINTER, caller_fp);
                        caller_ctx.set_register(STACK_POINTER, caller_sp);
                        caller_ctx.set_register(RETURN_ADDRESS, caller_ra);

                        let mut valid = HashSet::new();
                        valid.insert(PROGRAM_COUNTER);
                        valid.insert(FRAME_POINTER);
                        valid.insert(STACK_POINTER);
                        valid.insert(RETURN_ADDRESS);

                        let context = DumpContext {
                            raw: RawContext::$variant(caller_ctx),
                            valid: ContextValidity::Some(valid),
                        };
                        Some(StackFrame::from_context(context, FrameTrust::FramePointer))
                    })();
                }

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
                            let address_of_pc = match last_sp.checked_add(i * POINTER_WIDTH) {
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
                                let caller_sp = match address_of_pc.checked_add(POINTER_WIDTH) {
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
                    // A frame-0 leaf's return address is still in ra and
                    // its sp may not have moved.
                    let is_leaf = callee.trust == FrameTrust::Context && sp == last_sp;
                    if !is_leaf {
                        return Ok(None);
                    }
                }

                // Step back into the jal; instructions are four bytes.
                let ip = frame.context.get_instruction_pointer();
                if ip >= 4 {
                    frame.instruction = ip - 4;
                }
                Ok(Some(frame))
            }
        }
    };
}

riscv_walker!(ContextRiscv, Riscv, u32, 4);
riscv_walker!(ContextRiscv64, Riscv64, u64, 8);
