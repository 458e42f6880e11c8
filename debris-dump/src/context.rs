//! CPU contexts: the per-architecture register state attached to threads
//! and exceptions.
//!
//! A context record's architecture is determined from its `context_flags`
//! word (or, for the layouts whose flags aren't in a fixed spot, from its
//! exact size) and then cross-checked against the system-info stream; a
//! disagreement means the record cannot be trusted and surfaces as
//! [`ContextError::UnknownArchitecture`].

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::io::Write;

use debris_format::format as md;
use debris_format::format::ContextFlagsCpu;
use scroll::ctx::SizeWith;
use scroll::Pread;
use tracing::warn;

use crate::system_info::Cpu;
use crate::DumpSystemInfo;

/// Errors from decoding a CPU context record.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("failed to read context data")]
    ReadFailure,
    #[error("context architecture disagrees with the dump's system info")]
    UnknownArchitecture,
}

/// The architecture-tagged raw register state.
#[derive(Debug, Clone, PartialEq)]
pub enum RawContext {
    X86(md::ContextX86),
    Amd64(md::ContextAmd64),
    Arm(md::ContextArm),
    Arm64(md::ContextArm64),
    OldArm64(md::ContextArm64Old),
    Mips(md::ContextMips),
    Ppc(md::ContextPpc),
    Ppc64(md::ContextPpc64),
    Sparc(md::ContextSparc),
    Riscv(md::ContextRiscv),
    Riscv64(md::ContextRiscv64),
}

/// Which registers in a context actually hold captured values.
///
/// Frame-0 contexts come straight from the dump and are fully valid; every
/// recovered caller frame only has the registers its unwind strategy could
/// restore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextValidity {
    All,
    Some(HashSet<&'static str>),
}

/// Register access generic over the context layouts.
///
/// Register names are canonicalized to `'static` strings so that validity
/// sets can be plain `HashSet<&'static str>`s; lookups accept the common
/// aliases (`fp`, `lr`, `sp`, `pc`, `$`-prefixed CFI spellings).
pub trait CpuRegisters {
    /// The natural register width.
    type Register: Copy + Into<u64> + fmt::LowerHex;

    /// Canonical names, in display order.
    const REGISTERS: &'static [&'static str];

    /// Canonical name of the stack pointer.
    const STACK_POINTER: &'static str;

    /// Canonical name of the program counter.
    const PROGRAM_COUNTER: &'static str;

    /// Resolve `reg` (canonical name or alias) to its canonical name.
    fn canonical_register(reg: &str) -> Option<&'static str>;

    /// Truncate a CFI-evaluator value to this architecture's width.
    fn register_from_u64(val: u64) -> Self::Register;

    /// Read a canonical register, 0 if the name is unknown.
    fn get_register_always(&self, reg: &str) -> Self::Register;

    /// Write a register; returns the canonical name written.
    fn set_register(&mut self, reg: &str, val: Self::Register) -> Option<&'static str>;

    /// Read `reg` if it is known and marked valid.
    fn get_register(&self, reg: &str, valid: &ContextValidity) -> Option<Self::Register> {
        let canon = Self::canonical_register(reg)?;
        match valid {
            ContextValidity::All => Some(self.get_register_always(canon)),
            ContextValidity::Some(which) => which
                .contains(canon)
                .then(|| self.get_register_always(canon)),
        }
    }

    /// Render `reg` at its natural width.
    fn format_register(&self, reg: &str) -> String {
        format!(
            "0x{:01$x}",
            self.get_register_always(reg),
            std::mem::size_of::<Self::Register>() * 2
        )
    }
}

fn strip_cfi_sigil(reg: &str) -> &str {
    reg.strip_prefix('$').unwrap_or(reg)
}

impl CpuRegisters for md::ContextX86 {
    type Register = u32;

    const REGISTERS: &'static [&'static str] = &[
        "eip", "esp", "ebp", "ebx", "edi", "esi", "eax", "ecx", "edx", "eflags",
    ];

    const STACK_POINTER: &'static str = "esp";
    const PROGRAM_COUNTER: &'static str = "eip";

    fn canonical_register(reg: &str) -> Option<&'static str> {
        let reg = strip_cfi_sigil(reg);
        match reg {
            "efl" => Some("eflags"),
            _ => Self::REGISTERS.iter().find(|&&r| r == reg).copied(),
        }
    }

    fn register_from_u64(val: u64) -> u32 {
        val as u32
    }

    fn get_register_always(&self, reg: &str) -> u32 {
        match reg {
            "eip" => self.eip,
            "esp" => self.esp,
            "ebp" => self.ebp,
            "ebx" => self.ebx,
            "edi" => self.edi,
            "esi" => self.esi,
            "eax" => self.eax,
            "ecx" => self.ecx,
            "edx" => self.edx,
            "eflags" => self.eflags,
            _ => 0,
        }
    }

    fn set_register(&mut self, reg: &str, val: u32) -> Option<&'static str> {
        let canon = Self::canonical_register(reg)?;
        match canon {
            "eip" => self.eip = val,
            "esp" => self.esp = val,
            "ebp" => self.ebp = val,
            "ebx" => self.ebx = val,
            "edi" => self.edi = val,
            "esi" => self.esi = val,
            "eax" => self.eax = val,
            "ecx" => self.ecx = val,
            "edx" => self.edx = val,
            "eflags" => self.eflags = val,
            _ => return None,
        }
        Some(canon)
    }
}

impl CpuRegisters for md::ContextAmd64 {
    type Register = u64;

    const REGISTERS: &'static [&'static str] = &[
        "rip", "rsp", "rbp", "rbx", "rdi", "rsi", "rax", "rcx", "rdx", "r8", "r9", "r10", "r11",
        "r12", "r13", "r14", "r15",
    ];

    const STACK_POINTER: &'static str = "rsp";
    const PROGRAM_COUNTER: &'static str = "rip";

    fn canonical_register(reg: &str) -> Option<&'static str> {
        let reg = strip_cfi_sigil(reg);
        Self::REGISTERS.iter().find(|&&r| r == reg).copied()
    }

    fn register_from_u64(val: u64) -> u64 {
        val
    }

    fn get_register_always(&self, reg: &str) -> u64 {
        match reg {
            "rip" => self.rip,
            "rsp" => self.rsp,
            "rbp" => self.rbp,
            "rbx" => self.rbx,
            "rdi" => self.rdi,
            "rsi" => self.rsi,
            "rax" => self.rax,
            "rcx" => self.rcx,
            "rdx" => self.rdx,
            "r8" => self.r8,
            "r9" => self.r9,
            "r10" => self.r10,
            "r11" => self.r11,
            "r12" => self.r12,
            "r13" => self.r13,
            "r14" => self.r14,
            "r15" => self.r15,
            _ => 0,
        }
    }

    fn set_register(&mut self, reg: &str, val: u64) -> Option<&'static str> {
        let canon = Self::canonical_register(reg)?;
        match canon {
            "rip" => self.rip = val,
            "rsp" => self.rsp = val,
            "rbp" => self.rbp = val,
            "rbx" => self.rbx = val,
            "rdi" => self.rdi = val,
            "rsi" => self.rsi = val,
            "rax" => self.rax = val,
            "rcx" => self.rcx = val,
            "rdx" => self.rdx = val,
            "r8" => self.r8 = val,
            "r9" => self.r9 = val,
            "r10" => self.r10 = val,
            "r11" => self.r11 = val,
            "r12" => self.r12 = val,
            "r13" => self.r13 = val,
            "r14" => self.r14 = val,
            "r15" => self.r15 = val,
            _ => return None,
        }
        Some(canon)
    }
}

// Contexts whose general-purpose registers live in one index-addressed
// array share this implementation shape; the macro maps canonical names to
// indices and wires up the aliases.
macro_rules! indexed_registers {
    ($ty:ty, $reg_ty:ty, $field:ident, sp: $sp:literal, pc: $pc:literal,
     names: [$($name:literal => $idx:expr),* $(,)?],
     aliases: [$($alias:literal => $canon:literal),* $(,)?],
     extra_get: [$($xname:literal => $xget:expr),* $(,)?],
     extra_set: [$($sname:literal => $sfield:ident),* $(,)?]) => {
        impl CpuRegisters for $ty {
            type Register = $reg_ty;

            const REGISTERS: &'static [&'static str] = &[$($name,)* $($xname,)*];

            const STACK_POINTER: &'static str = $sp;
            const PROGRAM_COUNTER: &'static str = $pc;

            fn canonical_register(reg: &str) -> Option<&'static str> {
                let reg = strip_cfi_sigil(reg);
                match reg {
                    $($alias => Some($canon),)*
                    _ => Self::REGISTERS.iter().find(|&&r| r == reg).copied(),
                }
            }

            fn register_from_u64(val: u64) -> $reg_ty {
                val as $reg_ty
            }

            fn get_register_always(&self, reg: &str) -> $reg_ty {
                match reg {
                    $($name => self.$field[$idx],)*
                    $($xname => $xget(self),)*
                    _ => 0,
                }
            }

            fn set_register(&mut self, reg: &str, val: $reg_ty) -> Option<&'static str> {
                let canon = Self::canonical_register(reg)?;
                match canon {
                    $($name => self.$field[$idx] = val,)*
                    $($sname => self.$sfield = val,)*
                    _ => return None,
                }
                Some(canon)
            }
        }
    };
}

indexed_registers!(md::ContextArm, u32, iregs, sp: "r13", pc: "r15",
    names: [
        "r0" => 0, "r1" => 1, "r2" => 2, "r3" => 3, "r4" => 4, "r5" => 5, "r6" => 6,
        "r7" => 7, "r8" => 8, "r9" => 9, "r10" => 10, "r11" => 11, "r12" => 12,
        "r13" => 13, "r14" => 14, "r15" => 15,
    ],
    aliases: ["sp" => "r13", "lr" => "r14", "pc" => "r15", "fp" => "r11"],
    extra_get: [],
    extra_set: []);

indexed_registers!(md::ContextArm64, u64, iregs, sp: "sp", pc: "pc",
    names: [
        "x0" => 0, "x1" => 1, "x2" => 2, "x3" => 3, "x4" => 4, "x5" => 5, "x6" => 6,
        "x7" => 7, "x8" => 8, "x9" => 9, "x10" => 10, "x11" => 11, "x12" => 12,
        "x13" => 13, "x14" => 14, "x15" => 15, "x16" => 16, "x17" => 17, "x18" => 18,
        "x19" => 19, "x20" => 20, "x21" => 21, "x22" => 22, "x23" => 23, "x24" => 24,
        "x25" => 25, "x26" => 26, "x27" => 27, "x28" => 28, "x29" => 29, "x30" => 30,
        "sp" => 31,
    ],
    aliases: ["fp" => "x29", "lr" => "x30", "x31" => "sp"],
    extra_get: ["pc" => |ctx: &md::ContextArm64| ctx.pc],
    extra_set: ["pc" => pc]);

indexed_registers!(md::ContextArm64Old, u64, iregs, sp: "sp", pc: "pc",
    names: [
        "x0" => 0, "x1" => 1, "x2" => 2, "x3" => 3, "x4" => 4, "x5" => 5, "x6" => 6,
        "x7" => 7, "x8" => 8, "x9" => 9, "x10" => 10, "x11" => 11, "x12" => 12,
        "x13" => 13, "x14" => 14, "x15" => 15, "x16" => 16, "x17" => 17, "x18" => 18,
        "x19" => 19, "x20" => 20, "x21" => 21, "x22" => 22, "x23" => 23, "x24" => 24,
        "x25" => 25, "x26" => 26, "x27" => 27, "x28" => 28, "x29" => 29, "x30" => 30,
        "sp" => 31,
    ],
    aliases: ["fp" => "x29", "lr" => "x30", "x31" => "sp"],
    extra_get: ["pc" => |ctx: &md::ContextArm64Old| ctx.pc],
    extra_set: ["pc" => pc]);

indexed_registers!(md::ContextMips, u64, iregs, sp: "sp", pc: "pc",
    names: [
        "zero" => 0, "at" => 1, "v0" => 2, "v1" => 3, "a0" => 4, "a1" => 5, "a2" => 6,
        "a3" => 7, "t0" => 8, "t1" => 9, "t2" => 10, "t3" => 11, "t4" => 12, "t5" => 13,
        "t6" => 14, "t7" => 15, "s0" => 16, "s1" => 17, "s2" => 18, "s3" => 19,
        "s4" => 20, "s5" => 21, "s6" => 22, "s7" => 23, "t8" => 24, "t9" => 25,
        "k0" => 26, "k1" => 27, "gp" => 28, "sp" => 29, "fp" => 30, "ra" => 31,
    ],
    aliases: ["s8" => "fp"],
    extra_get: ["pc" => |ctx: &md::ContextMips| ctx.epc],
    extra_set: ["pc" => epc]);

indexed_registers!(md::ContextSparc, u64, g_r, sp: "o6", pc: "pc",
    names: [
        "g0" => 0, "g1" => 1, "g2" => 2, "g3" => 3, "g4" => 4, "g5" => 5, "g6" => 6,
        "g7" => 7, "o0" => 8, "o1" => 9, "o2" => 10, "o3" => 11, "o4" => 12, "o5" => 13,
        "o6" => 14, "o7" => 15, "l0" => 16, "l1" => 17, "l2" => 18, "l3" => 19,
        "l4" => 20, "l5" => 21, "l6" => 22, "l7" => 23, "i0" => 24, "i1" => 25,
        "i2" => 26, "i3" => 27, "i4" => 28, "i5" => 29, "i6" => 30, "i7" => 31,
    ],
    aliases: ["sp" => "o6", "fp" => "i6"],
    extra_get: ["pc" => |ctx: &md::ContextSparc| ctx.pc],
    extra_set: ["pc" => pc]);

indexed_registers!(md::ContextPpc, u32, gpr, sp: "r1", pc: "srr0",
    names: [
        "r0" => 0, "r1" => 1, "r2" => 2, "r3" => 3, "r4" => 4, "r5" => 5, "r6" => 6,
        "r7" => 7, "r8" => 8, "r9" => 9, "r10" => 10, "r11" => 11, "r12" => 12,
        "r13" => 13, "r14" => 14, "r15" => 15, "r16" => 16, "r17" => 17, "r18" => 18,
        "r19" => 19, "r20" => 20, "r21" => 21, "r22" => 22, "r23" => 23, "r24" => 24,
        "r25" => 25, "r26" => 26, "r27" => 27, "r28" => 28, "r29" => 29, "r30" => 30,
        "r31" => 31,
    ],
    aliases: ["sp" => "r1", "pc" => "srr0"],
    extra_get: [
        "srr0" => |ctx: &md::ContextPpc| ctx.srr0,
        "lr" => |ctx: &md::ContextPpc| ctx.lr,
        "ctr" => |ctx: &md::ContextPpc| ctx.ctr,
    ],
    extra_set: ["srr0" => srr0, "lr" => lr, "ctr" => ctr]);

indexed_registers!(md::ContextPpc64, u64, gpr, sp: "r1", pc: "srr0",
    names: [
        "r0" => 0, "r1" => 1, "r2" => 2, "r3" => 3, "r4" => 4, "r5" => 5, "r6" => 6,
        "r7" => 7, "r8" => 8, "r9" => 9, "r10" => 10, "r11" => 11, "r12" => 12,
        "r13" => 13, "r14" => 14, "r15" => 15, "r16" => 16, "r17" => 17, "r18" => 18,
        "r19" => 19, "r20" => 20, "r21" => 21, "r22" => 22, "r23" => 23, "r24" => 24,
        "r25" => 25, "r26" => 26, "r27" => 27, "r28" => 28, "r29" => 29, "r30" => 30,
        "r31" => 31,
    ],
    aliases: ["sp" => "r1", "pc" => "srr0"],
    extra_get: [
        "srr0" => |ctx: &md::ContextPpc64| ctx.srr0,
        "lr" => |ctx: &md::ContextPpc64| ctx.lr,
        "ctr" => |ctx: &md::ContextPpc64| ctx.ctr,
    ],
    extra_set: ["srr0" => srr0, "lr" => lr, "ctr" => ctr]);

indexed_registers!(md::ContextRiscv, u32, regs, sp: "sp", pc: "pc",
    names: [
        "ra" => 0, "sp" => 1, "gp" => 2, "tp" => 3, "t0" => 4, "t1" => 5, "t2" => 6,
        "s0" => 7, "s1" => 8, "a0" => 9, "a1" => 10, "a2" => 11, "a3" => 12, "a4" => 13,
        "a5" => 14, "a6" => 15, "a7" => 16, "s2" => 17, "s3" => 18, "s4" => 19,
        "s5" => 20, "s6" => 21, "s7" => 22, "s8" => 23, "s9" => 24, "s10" => 25,
        "s11" => 26, "t3" => 27, "t4" => 28, "t5" => 29, "t6" => 30,
    ],
    aliases: ["fp" => "s0", "x1" => "ra", "x2" => "sp", "x8" => "s0"],
    extra_get: ["pc" => |ctx: &md::ContextRiscv| ctx.pc],
    extra_set: ["pc" => pc]);

indexed_registers!(md::ContextRiscv64, u64, regs, sp: "sp", pc: "pc",
    names: [
        "ra" => 0, "sp" => 1, "gp" => 2, "tp" => 3, "t0" => 4, "t1" => 5, "t2" => 6,
        "s0" => 7, "s1" => 8, "a0" => 9, "a1" => 10, "a2" => 11, "a3" => 12, "a4" => 13,
        "a5" => 14, "a6" => 15, "a7" => 16, "s2" => 17, "s3" => 18, "s4" => 19,
        "s5" => 20, "s6" => 21, "s7" => 22, "s8" => 23, "s9" => 24, "s10" => 25,
        "s11" => 26, "t3" => 27, "t4" => 28, "t5" => 29, "t6" => 30,
    ],
    aliases: ["fp" => "s0", "x1" => "ra", "x2" => "sp", "x8" => "s0"],
    extra_get: ["pc" => |ctx: &md::ContextRiscv64| ctx.pc],
    extra_set: ["pc" => pc]);

/// The decoded register state of one thread (or of the exception record).
///
/// Note that when an exception stream is present, the context it embeds is
/// the state at the fault; the faulting thread's own context records the
/// handler that wrote the dump, which is rarely what callers want.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpContext {
    pub raw: RawContext,
    pub valid: ContextValidity,
}

impl DumpContext {
    /// Wrap a raw context, marking every register valid.
    pub fn from_raw(raw: RawContext) -> DumpContext {
        DumpContext {
            raw,
            valid: ContextValidity::All,
        }
    }

    /// Decode a context record, resolving its architecture and checking it
    /// against the dump's system info.
    ///
    /// The layouts without a reliably-placed flags word (amd64, ppc64, the
    /// old arm64 layout) are recognized by their exact size; everything else
    /// dispatches on the CPU bits of the leading `context_flags`.
    pub fn read(
        bytes: &[u8],
        endian: scroll::Endian,
        system_info: &DumpSystemInfo,
    ) -> Result<DumpContext, ContextError> {
        let expected = system_info.cpu;
        let raw = if bytes.len() == md::ContextAmd64::size_with(&endian) {
            let ctx: md::ContextAmd64 = bytes
                .pread_with(0, endian)
                .map_err(|_| ContextError::ReadFailure)?;
            if !ContextFlagsCpu::from_flags(ctx.context_flags)
                .contains(ContextFlagsCpu::CONTEXT_AMD64)
            {
                return Err(ContextError::ReadFailure);
            }
            RawContext::Amd64(ctx)
        } else if bytes.len() == md::ContextPpc64::size_with(&endian) {
            let ctx: md::ContextPpc64 = bytes
                .pread_with(0, endian)
                .map_err(|_| ContextError::ReadFailure)?;
            if !ContextFlagsCpu::from_flags(ctx.context_flags as u32)
                .contains(ContextFlagsCpu::CONTEXT_PPC64)
            {
                return Err(ContextError::ReadFailure);
            }
            RawContext::Ppc64(ctx)
        } else if bytes.len() == md::ContextArm64Old::size_with(&endian) {
            let ctx: md::ContextArm64Old = bytes
                .pread_with(0, endian)
                .map_err(|_| ContextError::ReadFailure)?;
            if !ContextFlagsCpu::from_flags(ctx.context_flags as u32)
                .contains(ContextFlagsCpu::CONTEXT_ARM64_OLD)
            {
                return Err(ContextError::ReadFailure);
            }
            RawContext::OldArm64(ctx)
        } else {
            let flags: u32 = bytes
                .pread_with(0, endian)
                .map_err(|_| ContextError::ReadFailure)?;
            let cpu_flags = ContextFlagsCpu::from_flags(flags);
            let read = |ctx: Result<RawContext, scroll::Error>| {
                ctx.map_err(|_| ContextError::ReadFailure)
            };
            if cpu_flags.contains(ContextFlagsCpu::CONTEXT_X86) {
                read(bytes.pread_with(0, endian).map(RawContext::X86))?
            } else if cpu_flags.contains(ContextFlagsCpu::CONTEXT_ARM) {
                read(bytes.pread_with(0, endian).map(RawContext::Arm))?
            } else if cpu_flags.contains(ContextFlagsCpu::CONTEXT_ARM64) {
                read(bytes.pread_with(0, endian).map(RawContext::Arm64))?
            } else if cpu_flags.contains(ContextFlagsCpu::CONTEXT_MIPS)
                || cpu_flags.contains(ContextFlagsCpu::CONTEXT_MIPS64)
            {
                read(bytes.pread_with(0, endian).map(RawContext::Mips))?
            } else if cpu_flags.contains(ContextFlagsCpu::CONTEXT_PPC) {
                read(bytes.pread_with(0, endian).map(RawContext::Ppc))?
            } else if cpu_flags.contains(ContextFlagsCpu::CONTEXT_SPARC) {
                read(bytes.pread_with(0, endian).map(RawContext::Sparc))?
            } else if cpu_flags.contains(ContextFlagsCpu::CONTEXT_RISCV) {
                read(bytes.pread_with(0, endian).map(RawContext::Riscv))?
            } else if cpu_flags.contains(ContextFlagsCpu::CONTEXT_RISCV64) {
                read(bytes.pread_with(0, endian).map(RawContext::Riscv64))?
            } else {
                warn!("unrecognized context flags 0x{flags:08x}");
                return Err(ContextError::UnknownArchitecture);
            }
        };

        if raw.cpu() != expected {
            warn!(
                "context architecture {} disagrees with system info {}",
                raw.cpu(),
                expected
            );
            return Err(ContextError::UnknownArchitecture);
        }
        Ok(DumpContext::from_raw(raw))
    }

    pub fn cpu(&self) -> Cpu {
        self.raw.cpu()
    }

    pub fn get_instruction_pointer(&self) -> u64 {
        match self.raw {
            RawContext::X86(ref ctx) => ctx.eip as u64,
            RawContext::Amd64(ref ctx) => ctx.rip,
            RawContext::Arm(ref ctx) => ctx.iregs[md::ArmRegisters::ProgramCounter as usize] as u64,
            RawContext::Arm64(ref ctx) => ctx.pc,
            RawContext::OldArm64(ref ctx) => ctx.pc,
            RawContext::Mips(ref ctx) => ctx.epc,
            RawContext::Ppc(ref ctx) => ctx.srr0 as u64,
            RawContext::Ppc64(ref ctx) => ctx.srr0,
            RawContext::Sparc(ref ctx) => ctx.pc,
            RawContext::Riscv(ref ctx) => ctx.pc as u64,
            RawContext::Riscv64(ref ctx) => ctx.pc,
        }
    }

    pub fn get_stack_pointer(&self) -> u64 {
        match self.raw {
            RawContext::X86(ref ctx) => ctx.esp as u64,
            RawContext::Amd64(ref ctx) => ctx.rsp,
            RawContext::Arm(ref ctx) => ctx.iregs[md::ArmRegisters::StackPointer as usize] as u64,
            RawContext::Arm64(ref ctx) => ctx.iregs[md::Arm64Registers::StackPointer as usize],
            RawContext::OldArm64(ref ctx) => ctx.iregs[md::Arm64Registers::StackPointer as usize],
            RawContext::Mips(ref ctx) => ctx.iregs[md::MipsRegisters::StackPointer as usize],
            RawContext::Ppc(ref ctx) => ctx.gpr[md::PpcRegisters::StackPointer as usize] as u64,
            RawContext::Ppc64(ref ctx) => ctx.gpr[md::PpcRegisters::StackPointer as usize],
            RawContext::Sparc(ref ctx) => ctx.g_r[md::SparcRegisters::StackPointer as usize],
            RawContext::Riscv(ref ctx) => {
                ctx.regs[md::RiscvRegisters::StackPointer as usize] as u64
            }
            RawContext::Riscv64(ref ctx) => ctx.regs[md::RiscvRegisters::StackPointer as usize],
        }
    }

    /// Read any register by name, widened to u64, honoring validity.
    pub fn get_register(&self, reg: &str) -> Option<u64> {
        macro_rules! dispatch {
            ($ctx:expr) => {
                $ctx.get_register(reg, &self.valid).map(Into::into)
            };
        }
        match self.raw {
            RawContext::X86(ref ctx) => dispatch!(ctx),
            RawContext::Amd64(ref ctx) => dispatch!(ctx),
            RawContext::Arm(ref ctx) => dispatch!(ctx),
            RawContext::Arm64(ref ctx) => dispatch!(ctx),
            RawContext::OldArm64(ref ctx) => dispatch!(ctx),
            RawContext::Mips(ref ctx) => dispatch!(ctx),
            RawContext::Ppc(ref ctx) => dispatch!(ctx),
            RawContext::Ppc64(ref ctx) => dispatch!(ctx),
            RawContext::Sparc(ref ctx) => dispatch!(ctx),
            RawContext::Riscv(ref ctx) => dispatch!(ctx),
            RawContext::Riscv64(ref ctx) => dispatch!(ctx),
        }
    }

    /// The canonical general-purpose register names for this architecture.
    pub fn general_purpose_registers(&self) -> &'static [&'static str] {
        match self.raw {
            RawContext::X86(_) => md::ContextX86::REGISTERS,
            RawContext::Amd64(_) => md::ContextAmd64::REGISTERS,
            RawContext::Arm(_) => md::ContextArm::REGISTERS,
            RawContext::Arm64(_) => md::ContextArm64::REGISTERS,
            RawContext::OldArm64(_) => md::ContextArm64Old::REGISTERS,
            RawContext::Mips(_) => md::ContextMips::REGISTERS,
            RawContext::Ppc(_) => md::ContextPpc::REGISTERS,
            RawContext::Ppc64(_) => md::ContextPpc64::REGISTERS,
            RawContext::Sparc(_) => md::ContextSparc::REGISTERS,
            RawContext::Riscv(_) => md::ContextRiscv::REGISTERS,
            RawContext::Riscv64(_) => md::ContextRiscv64::REGISTERS,
        }
    }

    /// Render `reg` at its natural width.
    pub fn format_register(&self, reg: &str) -> String {
        macro_rules! dispatch {
            ($ctx:expr) => {
                $ctx.format_register(reg)
            };
        }
        match self.raw {
            RawContext::X86(ref ctx) => dispatch!(ctx),
            RawContext::Amd64(ref ctx) => dispatch!(ctx),
            RawContext::Arm(ref ctx) => dispatch!(ctx),
            RawContext::Arm64(ref ctx) => dispatch!(ctx),
            RawContext::OldArm64(ref ctx) => dispatch!(ctx),
            RawContext::Mips(ref ctx) => dispatch!(ctx),
            RawContext::Ppc(ref ctx) => dispatch!(ctx),
            RawContext::Ppc64(ref ctx) => dispatch!(ctx),
            RawContext::Sparc(ref ctx) => dispatch!(ctx),
            RawContext::Riscv(ref ctx) => dispatch!(ctx),
            RawContext::Riscv64(ref ctx) => dispatch!(ctx),
        }
    }

    /// Write the valid registers to `f`, a few per line.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        writeln!(f, "Context ({})", self.cpu())?;
        let mut line = String::new();
        for &reg in self.general_purpose_registers() {
            let shown = match self.valid {
                ContextValidity::All => true,
                ContextValidity::Some(ref which) => which.contains(reg),
            };
            if !shown {
                continue;
            }
            let next = format!(" {: >6} = {}", reg, self.format_register(reg));
            if line.len() + next.len() > 80 {
                writeln!(f, "{line}")?;
                line.clear();
            }
            line.push_str(&next);
        }
        if !line.is_empty() {
            writeln!(f, "{line}")?;
        }
        writeln!(f)
    }
}

impl RawContext {
    /// The architecture this context belongs to.
    pub fn cpu(&self) -> Cpu {
        match self {
            RawContext::X86(_) => Cpu::X86,
            RawContext::Amd64(_) => Cpu::X86_64,
            RawContext::Arm(_) => Cpu::Arm,
            RawContext::Arm64(_) | RawContext::OldArm64(_) => Cpu::Arm64,
            RawContext::Mips(ref ctx) => {
                if ContextFlagsCpu::from_flags(ctx.context_flags)
                    .contains(ContextFlagsCpu::CONTEXT_MIPS64)
                {
                    Cpu::Mips64
                } else {
                    Cpu::Mips
                }
            }
            RawContext::Ppc(_) => Cpu::Ppc,
            RawContext::Ppc64(_) => Cpu::Ppc64,
            RawContext::Sparc(_) => Cpu::Sparc,
            RawContext::Riscv(_) => Cpu::Riscv,
            RawContext::Riscv64(_) => Cpu::Riscv64,
        }
    }
}
