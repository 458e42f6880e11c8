//! Mapping from raw platform exception codes to a human-readable crash
//! reason.

use std::fmt;

use num_traits::FromPrimitive;

use debris_format::codes as err;
use debris_format::format as md;

use crate::system_info::Os;

/// Why the process crashed, as precisely as the platform codes allow.
///
/// The variants are platform-keyed; refinements (e.g. the segv kind) are
/// applied when the exception record carries them. Codes outside the known
/// tables fall through to [`CrashReason::Unknown`], which renders as the
/// raw hex value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CrashReason {
    LinuxGeneral(err::ExceptionCodeLinux, u32),
    LinuxSigill(err::LinuxSigillKind),
    LinuxSigfpe(err::LinuxSigfpeKind),
    LinuxSigsegv(err::LinuxSigsegvKind),
    LinuxSigbus(err::LinuxSigbusKind),

    MacGeneral(err::ExceptionCodeMac, u32),
    MacBadAccessKern(err::MacBadAccessKernKind),
    MacSoftware(err::MacSoftwareKind),

    WindowsGeneral(err::ExceptionCodeWindows),
    WindowsAccessViolation(err::WindowsAccessKind),
    WindowsInPageError(err::WindowsAccessKind, u64),

    Unknown(u32, u32),
}

impl CrashReason {
    /// Derive a reason from an exception stream for the dump's platform.
    pub fn from_exception(raw: &md::RawExceptionStream, os: Os) -> CrashReason {
        let record = &raw.exception_record;
        let reason = match os {
            Os::MacOs | Os::Ios => Self::from_mac_exception(record),
            Os::Linux | Os::Android => Self::from_linux_exception(record),
            Os::Windows => Self::from_windows_exception(record),
            _ => None,
        };
        reason.unwrap_or(CrashReason::Unknown(
            record.exception_code,
            record.exception_flags,
        ))
    }

    fn from_linux_exception(record: &md::RawException) -> Option<CrashReason> {
        let signal = err::ExceptionCodeLinux::from_u32(record.exception_code)?;
        let flags = record.exception_flags;
        // The si_code rides in exception_flags and refines the signal.
        let reason = match signal {
            err::ExceptionCodeLinux::SIGILL => {
                err::LinuxSigillKind::from_u32(flags).map(CrashReason::LinuxSigill)
            }
            err::ExceptionCodeLinux::SIGFPE => {
                err::LinuxSigfpeKind::from_u32(flags).map(CrashReason::LinuxSigfpe)
            }
            err::ExceptionCodeLinux::SIGSEGV => {
                err::LinuxSigsegvKind::from_u32(flags).map(CrashReason::LinuxSigsegv)
            }
            err::ExceptionCodeLinux::SIGBUS => {
                err::LinuxSigbusKind::from_u32(flags).map(CrashReason::LinuxSigbus)
            }
            _ => None,
        };
        Some(reason.unwrap_or(CrashReason::LinuxGeneral(signal, flags)))
    }

    fn from_mac_exception(record: &md::RawException) -> Option<CrashReason> {
        let exc = err::ExceptionCodeMac::from_u32(record.exception_code)?;
        let flags = record.exception_flags;
        let reason = match exc {
            err::ExceptionCodeMac::EXC_BAD_ACCESS => {
                err::MacBadAccessKernKind::from_u32(flags).map(CrashReason::MacBadAccessKern)
            }
            err::ExceptionCodeMac::EXC_SOFTWARE => {
                err::MacSoftwareKind::from_u32(flags).map(CrashReason::MacSoftware)
            }
            _ => None,
        };
        Some(reason.unwrap_or(CrashReason::MacGeneral(exc, flags)))
    }

    fn from_windows_exception(record: &md::RawException) -> Option<CrashReason> {
        let code = err::ExceptionCodeWindows::from_u32(record.exception_code)?;
        let info = &record.exception_information;
        let mut reason = CrashReason::WindowsGeneral(code);
        match code {
            err::ExceptionCodeWindows::EXCEPTION_ACCESS_VIOLATION => {
                // info[0] is the access kind, info[1] the faulting address.
                if record.number_parameters >= 1 {
                    if let Some(kind) = err::WindowsAccessKind::from_u64(info[0]) {
                        reason = CrashReason::WindowsAccessViolation(kind);
                    }
                }
            }
            err::ExceptionCodeWindows::EXCEPTION_IN_PAGE_ERROR => {
                // info[2] carries the underlying NTSTATUS.
                if record.number_parameters >= 3 {
                    if let Some(kind) = err::WindowsAccessKind::from_u64(info[0]) {
                        reason = CrashReason::WindowsInPageError(kind, info[2]);
                    }
                }
            }
            _ => {}
        }
        Some(reason)
    }
}

fn strip_kind_prefix(name: &str) -> &str {
    name.split_once('_').map(|(_, rest)| rest).unwrap_or(name)
}

impl fmt::Display for CrashReason {
    /// Platform-flavored rendering: `"SIGSEGV /MAPERR"` on Linux,
    /// `"EXC_BAD_ACCESS / KERN_INVALID_ADDRESS"` on macOS,
    /// `"EXCEPTION_ACCESS_VIOLATION_READ"` on Windows, `"0x<hex>"` when
    /// nothing matched.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CrashReason::*;
        match self {
            LinuxGeneral(signal, _) => write!(f, "{signal:?}"),
            LinuxSigill(kind) => {
                write!(f, "SIGILL /{}", strip_kind_prefix(&format!("{kind:?}")))
            }
            LinuxSigfpe(kind) => {
                write!(f, "SIGFPE /{}", strip_kind_prefix(&format!("{kind:?}")))
            }
            LinuxSigsegv(kind) => {
                write!(f, "SIGSEGV /{}", strip_kind_prefix(&format!("{kind:?}")))
            }
            LinuxSigbus(kind) => {
                write!(f, "SIGBUS /{}", strip_kind_prefix(&format!("{kind:?}")))
            }
            MacGeneral(exc, _) => write!(f, "{exc:?}"),
            MacBadAccessKern(kind) => write!(f, "EXC_BAD_ACCESS / {kind:?}"),
            MacSoftware(kind) => write!(f, "EXC_SOFTWARE / {kind:?}"),
            WindowsGeneral(code) => write!(f, "{code:?}"),
            WindowsAccessViolation(kind) => {
                write!(f, "EXCEPTION_ACCESS_VIOLATION_{kind:?}")
            }
            WindowsInPageError(kind, nt_status) => {
                write!(f, "EXCEPTION_IN_PAGE_ERROR_{kind:?} / {nt_status:#010x}")
            }
            Unknown(code, _flags) => write!(f, "0x{code:08x}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exception_stream(code: u32, flags: u32, params: &[u64]) -> md::RawExceptionStream {
        let mut info = [0u64; 15];
        info[..params.len()].copy_from_slice(params);
        md::RawExceptionStream {
            thread_id: 1,
            __align: 0,
            exception_record: md::RawException {
                exception_code: code,
                exception_flags: flags,
                exception_record: 0,
                exception_address: 0,
                number_parameters: params.len() as u32,
                __align: 0,
                exception_information: info,
            },
            thread_context: Default::default(),
        }
    }

    #[test]
    fn test_linux_segv_maperr() {
        let raw = exception_stream(11, 1, &[]);
        let reason = CrashReason::from_exception(&raw, Os::Linux);
        assert_eq!(reason.to_string(), "SIGSEGV /MAPERR");
    }

    #[test]
    fn test_linux_segv_accerr() {
        let raw = exception_stream(11, 2, &[]);
        let reason = CrashReason::from_exception(&raw, Os::Linux);
        assert_eq!(reason.to_string(), "SIGSEGV /ACCERR");
    }

    #[test]
    fn test_linux_plain_signal() {
        let raw = exception_stream(6, 0, &[]);
        let reason = CrashReason::from_exception(&raw, Os::Linux);
        assert_eq!(reason.to_string(), "SIGABRT");
    }

    #[test]
    fn test_mac_bad_access() {
        let raw = exception_stream(1, 0, &[]);
        let reason = CrashReason::from_exception(&raw, Os::MacOs);
        assert_eq!(reason.to_string(), "EXC_BAD_ACCESS");

        let raw = exception_stream(1, 1, &[]);
        let reason = CrashReason::from_exception(&raw, Os::MacOs);
        assert_eq!(reason.to_string(), "EXC_BAD_ACCESS / KERN_INVALID_ADDRESS");
    }

    #[test]
    fn test_windows_access_violation() {
        let raw = exception_stream(0xc0000005, 0, &[1, 0xcafe]);
        let reason = CrashReason::from_exception(&raw, Os::Windows);
        assert_eq!(reason.to_string(), "EXCEPTION_ACCESS_VIOLATION_WRITE");
    }

    #[test]
    fn test_unknown_renders_hex() {
        let raw = exception_stream(0xdeadbeef, 7, &[]);
        let reason = CrashReason::from_exception(&raw, Os::Linux);
        assert_eq!(reason.to_string(), "0xdeadbeef");
    }
}
