//! OS and CPU identification derived from the system-info stream.

use std::borrow::Cow;
use std::fmt;

use debris_format::format as fmt_raw;
use num_traits::FromPrimitive;

/// The operating system that wrote the dump.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Os {
    Windows,
    MacOs,
    Ios,
    Linux,
    Solaris,
    Android,
    Ps3,
    NaCl,
    Fuchsia,
    Unknown(u32),
}

impl Os {
    /// Map a raw `platform_id` to an [`Os`].
    pub fn from_platform_id(id: u32) -> Os {
        match fmt_raw::PlatformId::from_u32(id) {
            Some(fmt_raw::PlatformId::Win32s)
            | Some(fmt_raw::PlatformId::Windows9x)
            | Some(fmt_raw::PlatformId::WindowsNt)
            | Some(fmt_raw::PlatformId::WindowsCe) => Os::Windows,
            Some(fmt_raw::PlatformId::MacOs) => Os::MacOs,
            Some(fmt_raw::PlatformId::Ios) => Os::Ios,
            Some(fmt_raw::PlatformId::Linux) => Os::Linux,
            Some(fmt_raw::PlatformId::Solaris) => Os::Solaris,
            Some(fmt_raw::PlatformId::Android) => Os::Android,
            Some(fmt_raw::PlatformId::Ps3) => Os::Ps3,
            Some(fmt_raw::PlatformId::NaCl) => Os::NaCl,
            Some(fmt_raw::PlatformId::Fuchsia) => Os::Fuchsia,
            Some(fmt_raw::PlatformId::Unix) | None => Os::Unknown(id),
        }
    }

    /// The short identifier used in symbol files and reports.
    pub fn name(&self) -> Cow<'static, str> {
        match *self {
            Os::Windows => Cow::Borrowed("windows"),
            Os::MacOs => Cow::Borrowed("mac"),
            Os::Ios => Cow::Borrowed("ios"),
            Os::Linux => Cow::Borrowed("linux"),
            Os::Solaris => Cow::Borrowed("solaris"),
            Os::Android => Cow::Borrowed("android"),
            Os::Ps3 => Cow::Borrowed("ps3"),
            Os::NaCl => Cow::Borrowed("nacl"),
            Os::Fuchsia => Cow::Borrowed("fuchsia"),
            Os::Unknown(id) => Cow::Owned(format!("unknown 0x{id:08x}")),
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The CPU architecture the dump was captured on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Cpu {
    X86,
    X86_64,
    Ppc,
    Ppc64,
    Sparc,
    Arm,
    Arm64,
    Mips,
    Mips64,
    Riscv,
    Riscv64,
    Unknown(u16),
}

/// How wide pointers are on a [`Cpu`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    Bits32,
    Bits64,
    Unknown,
}

impl PointerWidth {
    pub fn size_in_bytes(self) -> Option<u8> {
        match self {
            PointerWidth::Bits32 => Some(4),
            PointerWidth::Bits64 => Some(8),
            PointerWidth::Unknown => None,
        }
    }
}

impl Cpu {
    /// Map a raw `processor_architecture` to a [`Cpu`].
    pub fn from_processor_architecture(arch: u16) -> Cpu {
        use fmt_raw::ProcessorArchitecture::*;
        match fmt_raw::ProcessorArchitecture::from_u16(arch) {
            Some(Intel) | Some(Ia32OnWin64) => Cpu::X86,
            Some(Amd64) => Cpu::X86_64,
            Some(Ppc) => Cpu::Ppc,
            Some(Ppc64) => Cpu::Ppc64,
            Some(Sparc) => Cpu::Sparc,
            Some(Arm) => Cpu::Arm,
            Some(Arm64) | Some(Arm64Old) => Cpu::Arm64,
            Some(Mips) => Cpu::Mips,
            Some(Mips64) => Cpu::Mips64,
            Some(Riscv) => Cpu::Riscv,
            Some(Riscv64) => Cpu::Riscv64,
            _ => Cpu::Unknown(arch),
        }
    }

    /// The architecture name as spelled in symbol-file MODULE records.
    pub fn name(&self) -> Cow<'static, str> {
        match *self {
            Cpu::X86 => Cow::Borrowed("x86"),
            Cpu::X86_64 => Cow::Borrowed("amd64"),
            Cpu::Ppc => Cow::Borrowed("ppc"),
            Cpu::Ppc64 => Cow::Borrowed("ppc64"),
            Cpu::Sparc => Cow::Borrowed("sparc"),
            Cpu::Arm => Cow::Borrowed("arm"),
            Cpu::Arm64 => Cow::Borrowed("arm64"),
            Cpu::Mips => Cow::Borrowed("mips"),
            Cpu::Mips64 => Cow::Borrowed("mips64"),
            Cpu::Riscv => Cow::Borrowed("riscv"),
            Cpu::Riscv64 => Cow::Borrowed("riscv64"),
            Cpu::Unknown(arch) => Cow::Owned(format!("unknown 0x{arch:04x}")),
        }
    }

    pub fn pointer_width(&self) -> PointerWidth {
        match self {
            Cpu::X86 | Cpu::Ppc | Cpu::Sparc | Cpu::Arm | Cpu::Mips | Cpu::Riscv => {
                PointerWidth::Bits32
            }
            Cpu::X86_64 | Cpu::Ppc64 | Cpu::Arm64 | Cpu::Mips64 | Cpu::Riscv64 => {
                PointerWidth::Bits64
            }
            Cpu::Unknown(_) => PointerWidth::Unknown,
        }
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
