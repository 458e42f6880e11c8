//! Information about the system the dump was captured on, condensed for
//! the final report.

use debris_dump::{Cpu, Os};

/// OS and CPU details for a [`crate::ProcessState`].
#[derive(Debug, Clone)]
pub struct SystemInfo {
    /// The operating system that produced the dump.
    pub os: Os,
    /// Version number, e.g. `"10.0.19043"` or a kernel version on Linux.
    pub os_version: Option<String>,
    /// Build string, when one was recorded.
    pub os_build: Option<String>,
    /// The CPU architecture.
    pub cpu: Cpu,
    /// Vendor/model description, when derivable.
    pub cpu_info: Option<String>,
    /// Microcode version, recovered from the Linux cpuinfo stream.
    pub cpu_microcode_version: Option<u64>,
    /// Number of processors on the system.
    pub cpu_count: usize,
}
