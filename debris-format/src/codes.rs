//! Exception and signal codes, keyed by the platform that produced the dump.
//!
//! Only the codes that the crash-reason table cares about are enumerated;
//! anything else renders as a hex value downstream.
#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use enum_primitive_derive::Primitive;

/// `exception_code` values for Linux and Android dumps: signal numbers.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum ExceptionCodeLinux {
    SIGHUP = 0x1,
    SIGINT = 0x2,
    SIGQUIT = 0x3,
    SIGILL = 0x4,
    SIGTRAP = 0x5,
    SIGABRT = 0x6,
    SIGBUS = 0x7,
    SIGFPE = 0x8,
    SIGKILL = 0x9,
    SIGUSR1 = 0xa,
    SIGSEGV = 0xb,
    SIGUSR2 = 0xc,
    SIGPIPE = 0xd,
    SIGALRM = 0xe,
    SIGTERM = 0xf,
    SIGSTKFLT = 0x10,
    SIGCHLD = 0x11,
    SIGCONT = 0x12,
    SIGSTOP = 0x13,
    SIGTSTP = 0x14,
    SIGTTIN = 0x15,
    SIGTTOU = 0x16,
    SIGURG = 0x17,
    SIGXCPU = 0x18,
    SIGXFSZ = 0x19,
    SIGVTALRM = 0x1a,
    SIGPROF = 0x1b,
    SIGWINCH = 0x1c,
    SIGIO = 0x1d,
    SIGPWR = 0x1e,
    SIGSYS = 0x1f,
    /// No signal was raised; the dump was explicitly requested.
    DUMP_REQUESTED = 0xffffffffu32,
}

/// si_code refinements for SIGILL (asm-generic/siginfo.h).
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum LinuxSigillKind {
    ILL_ILLOPC = 1,
    ILL_ILLOPN = 2,
    ILL_ILLADR = 3,
    ILL_ILLTRP = 4,
    ILL_PRVOPC = 5,
    ILL_PRVREG = 6,
    ILL_COPROC = 7,
    ILL_BADSTK = 8,
}

/// si_code refinements for SIGFPE.
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum LinuxSigfpeKind {
    FPE_INTDIV = 1,
    FPE_INTOVF = 2,
    FPE_FLTDIV = 3,
    FPE_FLTOVF = 4,
    FPE_FLTUND = 5,
    FPE_FLTRES = 6,
    FPE_FLTINV = 7,
    FPE_FLTSUB = 8,
}

/// si_code refinements for SIGSEGV.
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum LinuxSigsegvKind {
    SEGV_MAPERR = 1,
    SEGV_ACCERR = 2,
    SEGV_BNDERR = 3,
    SEGV_PKUERR = 4,
}

/// si_code refinements for SIGBUS.
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum LinuxSigbusKind {
    BUS_ADRALN = 1,
    BUS_ADRERR = 2,
    BUS_OBJERR = 3,
    BUS_MCEERR_AR = 4,
    BUS_MCEERR_AO = 5,
}

/// `exception_code` values for macOS/iOS dumps: Mach exception types.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum ExceptionCodeMac {
    EXC_BAD_ACCESS = 1,
    EXC_BAD_INSTRUCTION = 2,
    EXC_ARITHMETIC = 3,
    EXC_EMULATION = 4,
    EXC_SOFTWARE = 5,
    EXC_BREAKPOINT = 6,
    EXC_SYSCALL = 7,
    EXC_MACH_SYSCALL = 8,
    EXC_RPC_ALERT = 9,
    /// Crashpad's SimulateCrash ('CPsx').
    SIMULATED = 0x43507378,
}

/// kern_return_t values refining EXC_BAD_ACCESS.
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum MacBadAccessKernKind {
    KERN_INVALID_ADDRESS = 1,
    KERN_PROTECTION_FAILURE = 2,
    KERN_NO_ACCESS = 8,
    KERN_MEMORY_FAILURE = 9,
    KERN_MEMORY_ERROR = 10,
    KERN_CODESIGN_ERROR = 50,
}

/// Codes refining EXC_SOFTWARE.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum MacSoftwareKind {
    SIGABRT = 0x00010002,
    UNCAUGHT_NS_EXCEPTION = 0xDEADC0DEu32,
}

/// `exception_code` values for Windows dumps (WinBase.h / WinNT.h).
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum ExceptionCodeWindows {
    DBG_CONTROL_C = 0x40010005,
    EXCEPTION_GUARD_PAGE = 0x80000001u32,
    EXCEPTION_DATATYPE_MISALIGNMENT = 0x80000002u32,
    EXCEPTION_BREAKPOINT = 0x80000003u32,
    EXCEPTION_SINGLE_STEP = 0x80000004u32,
    EXCEPTION_ACCESS_VIOLATION = 0xc0000005u32,
    EXCEPTION_IN_PAGE_ERROR = 0xc0000006u32,
    EXCEPTION_INVALID_HANDLE = 0xc0000008u32,
    EXCEPTION_ILLEGAL_INSTRUCTION = 0xc000001du32,
    EXCEPTION_NONCONTINUABLE_EXCEPTION = 0xc0000025u32,
    EXCEPTION_INVALID_DISPOSITION = 0xc0000026u32,
    EXCEPTION_BOUNDS_EXCEEDED = 0xc000008cu32,
    EXCEPTION_FLT_DENORMAL_OPERAND = 0xc000008du32,
    EXCEPTION_FLT_DIVIDE_BY_ZERO = 0xc000008eu32,
    EXCEPTION_FLT_INEXACT_RESULT = 0xc000008fu32,
    EXCEPTION_FLT_INVALID_OPERATION = 0xc0000090u32,
    EXCEPTION_FLT_OVERFLOW = 0xc0000091u32,
    EXCEPTION_FLT_STACK_CHECK = 0xc0000092u32,
    EXCEPTION_FLT_UNDERFLOW = 0xc0000093u32,
    EXCEPTION_INT_DIVIDE_BY_ZERO = 0xc0000094u32,
    EXCEPTION_INT_OVERFLOW = 0xc0000095u32,
    EXCEPTION_PRIV_INSTRUCTION = 0xc0000096u32,
    EXCEPTION_STACK_OVERFLOW = 0xc00000fdu32,
    EXCEPTION_POSSIBLE_DEADLOCK = 0xc0000194u32,
    STATUS_HEAP_CORRUPTION = 0xc0000374u32,
    STATUS_STACK_BUFFER_OVERRUN = 0xc0000409u32,
    /// Raised by Chromium allocators on OOM.
    OUT_OF_MEMORY = 0xe0000008u32,
    /// Visual C++'s unhandled C++ exception.
    UNHANDLED_CPP_EXCEPTION = 0xe06d7363u32,
    /// Crashpad's fake code for simulated dumps.
    SIMULATED = 0x0517a7ed,
}

/// Access kind in `exception_information[0]` for access violations.
#[repr(u64)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum WindowsAccessKind {
    READ = 0,
    WRITE = 1,
    EXEC = 8,
}
