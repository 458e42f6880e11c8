//! On-disk minidump layouts.
//!
//! Layouts follow the Microsoft minidump headers where those exist, plus the
//! Breakpad and Crashpad extension records for the streams those projects
//! add. Names are Rust-flavored but field order and widths are bit-exact.
#![allow(clippy::upper_case_acronyms)]

use std::fmt;

use bitflags::bitflags;
use enum_primitive_derive::Primitive;
use scroll::{Endian, Pread, SizeWith};
use smart_default::SmartDefault;

/// A 32-bit offset from the start of the minidump file.
pub type Rva = u32;
/// A 64-bit offset from the start of the minidump file.
pub type Rva64 = u64;

/// The magic number at the start of a minidump; `"MDMP"` in little-endian.
pub const DUMP_SIGNATURE: u32 = 0x504d444d;

/// The format version carried in the low half of [`RawHeader::version`].
pub const DUMP_VERSION: u32 = 0xa793;

/// The fixed header at offset 0 of every minidump.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawHeader {
    /// Must be [`DUMP_SIGNATURE`].
    pub signature: u32,
    /// Low 16 bits must be [`DUMP_VERSION`]; the high half is writer-defined.
    pub version: u32,
    /// Number of entries in the stream directory.
    pub stream_count: u32,
    /// File offset of the stream directory, an array of [`RawDirectory`].
    pub stream_directory_rva: Rva,
    pub checksum: u32,
    /// Seconds since the Unix epoch at the time the dump was written.
    pub time_date_stamp: u32,
    pub flags: u64,
}

/// A sized location within the minidump file.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct LocationDescriptor {
    pub data_size: u32,
    pub rva: Rva,
}

/// One stream directory entry.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawDirectory {
    /// Usually one of [`StreamKind`], but writers may emit private values.
    pub stream_type: u32,
    pub location: LocationDescriptor,
}

/// A range of the crashed process's memory captured in the dump.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct MemoryDescriptor {
    /// Base address of the range in the crashed process.
    pub start_of_memory_range: u64,
    /// Where the captured bytes live in this file.
    pub memory: LocationDescriptor,
}

/// A memory range within the `Memory64List` stream.
///
/// The 64-bit list stores its contents contiguously; each descriptor only
/// carries a size, and offsets accumulate from the list's `base_rva`.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct MemoryDescriptor64 {
    pub start_of_memory_range: u64,
    pub data_size: u64,
}

/// Stream types this crate knows about.
///
/// Values below `LastReserved` come from the Microsoft enum; the `0x4767`
/// ("Gg") block is Breakpad's, `0x4350` ("CP") is Crashpad's.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Primitive)]
pub enum StreamKind {
    Unused = 0,
    ThreadList = 3,
    ModuleList = 4,
    MemoryList = 5,
    Exception = 6,
    SystemInfo = 7,
    ThreadExList = 8,
    Memory64List = 9,
    CommentA = 10,
    CommentW = 11,
    HandleData = 12,
    FunctionTable = 13,
    UnloadedModuleList = 14,
    MiscInfo = 15,
    MemoryInfoList = 16,
    ThreadInfoList = 17,
    HandleOperationList = 18,
    Token = 19,
    JavaScriptData = 20,
    SystemMemoryInfo = 21,
    ProcessVmCounters = 22,
    IptTrace = 23,
    ThreadNames = 24,
    LastReserved = 0x0000ffff,
    /* Breakpad extensions. */
    BreakpadInfo = 0x47670001,
    AssertionInfo = 0x47670002,
    LinuxCpuInfo = 0x47670003,
    LinuxProcStatus = 0x47670004,
    LinuxLsbRelease = 0x47670005,
    LinuxCmdLine = 0x47670006,
    LinuxEnviron = 0x47670007,
    LinuxAuxv = 0x47670008,
    LinuxMaps = 0x47670009,
    LinuxDsoDebug = 0x4767000a,
    /* Crashpad extensions. */
    CrashpadInfo = 0x43500001,
}

impl From<StreamKind> for u32 {
    fn from(kind: StreamKind) -> Self {
        kind as u32
    }
}

/// Version information from a module's PE resources (zeroed elsewhere).
#[derive(Debug, Clone, Default, Pread, SizeWith)]
pub struct FixedFileInfo {
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_hi: u32,
    pub file_version_lo: u32,
    pub product_version_hi: u32,
    pub product_version_lo: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_hi: u32,
    pub file_date_lo: u32,
}

/// One loaded module (executable or shared library).
#[derive(Debug, Clone, Default, Pread, SizeWith)]
pub struct RawModule {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    /// Offset of a length-prefixed UTF-16LE module name.
    pub module_name_rva: Rva,
    pub version_info: FixedFileInfo,
    /// Location of the CodeView record carrying debug identity.
    pub cv_record: LocationDescriptor,
    pub misc_record: LocationDescriptor,
    pub reserved0: [u32; 2],
    pub reserved1: [u32; 2],
}

/// One module that had been unloaded before the dump was written.
#[derive(Debug, Clone, Default, Pread, SizeWith)]
pub struct RawUnloadedModule {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub module_name_rva: Rva,
}

/// One thread from the crashed process.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawThread {
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    /// Thread environment block (or equivalent) address.
    pub teb: u64,
    pub stack: MemoryDescriptor,
    /// Location of the thread's CPU context record.
    pub thread_context: LocationDescriptor,
}

/// An entry in the thread-names stream.
#[derive(Debug, Clone, Default, Pread, SizeWith)]
pub struct RawThreadName {
    pub thread_id: u32,
    /// 64-bit offset of a length-prefixed UTF-16LE name.
    pub thread_name_rva: Rva64,
}

/// Details of the exception that terminated the process.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawException {
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: u64,
    pub exception_address: u64,
    pub number_parameters: u32,
    pub __align: u32,
    pub exception_information: [u64; 15],
}

/// The exception stream: which thread faulted, how, and with what context.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawExceptionStream {
    pub thread_id: u32,
    pub __align: u32,
    pub exception_record: RawException,
    pub thread_context: LocationDescriptor,
}

/// A GUID as stored in CodeView records.
///
/// `Display` prints the hyphenated lowercase form; the alternate (`{:#}`)
/// form is the symbol-server style (uppercase, no hyphens).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pread, SizeWith)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        if f.alternate() {
            write!(
                f,
                "{:08X}{:04X}{:04X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
                self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7],
            )
        } else {
            write!(
                f,
                "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7],
            )
        }
    }
}

/// Signatures found in the first four bytes of a CodeView record.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum CvSignature {
    /// PDB 2.0, "NB10".
    Pdb20 = 0x3031424e,
    /// PDB 7.0, "RSDS"; the common case.
    Pdb70 = 0x53445352,
    /// ELF build id, "BpEL"; a Breakpad extension.
    Elf = 0x4270454c,
}

/// PDB 2.0 CodeView data (trailing file name is variable-length).
#[derive(Debug, Clone)]
pub struct CvInfoPdb20 {
    pub cv_signature: u32,
    pub cv_offset: u32,
    pub signature: u32,
    pub age: u32,
    /// NUL-terminated PDB file name bytes.
    pub pdb_file_name: Vec<u8>,
}

impl<'a> scroll::ctx::TryFromCtx<'a, Endian> for CvInfoPdb20 {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        Ok((
            CvInfoPdb20 {
                cv_signature: src.gread_with(offset, endian)?,
                cv_offset: src.gread_with(offset, endian)?,
                signature: src.gread_with(offset, endian)?,
                age: src.gread_with(offset, endian)?,
                pdb_file_name: {
                    let size = src.len() - *offset;
                    src.gread_with::<&[u8]>(offset, size)?.to_owned()
                },
            },
            *offset,
        ))
    }
}

/// PDB 7.0 CodeView data (trailing file name is variable-length).
#[derive(Debug, Clone)]
pub struct CvInfoPdb70 {
    pub cv_signature: u32,
    pub signature: Guid,
    pub age: u32,
    /// NUL-terminated PDB file name bytes.
    pub pdb_file_name: Vec<u8>,
}

impl<'a> scroll::ctx::TryFromCtx<'a, Endian> for CvInfoPdb70 {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        Ok((
            CvInfoPdb70 {
                cv_signature: src.gread_with(offset, endian)?,
                signature: src.gread_with(offset, endian)?,
                age: src.gread_with(offset, endian)?,
                pdb_file_name: {
                    let size = src.len() - *offset;
                    src.gread_with::<&[u8]>(offset, size)?.to_owned()
                },
            },
            *offset,
        ))
    }
}

/// ELF build-id CodeView data; the id is an arbitrary number of bytes.
#[derive(Debug, Clone)]
pub struct CvInfoElf {
    pub cv_signature: u32,
    pub build_id: Vec<u8>,
}

impl<'a> scroll::ctx::TryFromCtx<'a, Endian> for CvInfoElf {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        Ok((
            CvInfoElf {
                cv_signature: src.gread_with(offset, endian)?,
                build_id: {
                    let size = src.len() - *offset;
                    src.gread_with::<&[u8]>(offset, size)?.to_owned()
                },
            },
            *offset,
        ))
    }
}

/// The CPU union inside [`RawSystemInfo`].
///
/// The C definition is a union of [`X86CpuInfo`], [`ArmCpuInfo`] and
/// [`OtherCpuInfo`]; we keep the raw 24 bytes and let callers `pread` the
/// interpretation that matches the architecture.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct CpuInformation {
    pub data: [u8; 24],
}

/// x86 `cpuid`-derived vendor and feature bits.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct X86CpuInfo {
    pub vendor_id: [u32; 3],
    pub version_information: u32,
    pub feature_information: u32,
    pub amd_extended_cpu_features: u32,
}

/// Arm cpuid and ELF hwcaps (a Breakpad extension).
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct ArmCpuInfo {
    pub cpuid: u32,
    pub elf_hwcaps: u32,
}

/// Processor feature words for everything else.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct OtherCpuInfo {
    pub processor_features: [u64; 2],
}

/// The system-info stream: architecture, OS, and version details.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawSystemInfo {
    /// One of [`ProcessorArchitecture`].
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    /// One of [`PlatformId`].
    pub platform_id: u32,
    pub csd_version_rva: Rva,
    pub suite_mask: u16,
    pub reserved2: u16,
    pub cpu: CpuInformation,
}

/// Architecture values for [`RawSystemInfo::processor_architecture`].
///
/// The low values are Microsoft's; the `0x8000` block is Breakpad's.
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum ProcessorArchitecture {
    Intel = 0,
    Mips = 1,
    Alpha = 2,
    Ppc = 3,
    Shx = 4,
    Arm = 5,
    Ia64 = 6,
    Alpha64 = 7,
    Msil = 8,
    Amd64 = 9,
    Ia32OnWin64 = 10,
    Arm64 = 12,
    Sparc = 0x8001,
    Ppc64 = 0x8002,
    Arm64Old = 0x8003,
    Mips64 = 0x8004,
    Riscv = 0x8005,
    Riscv64 = 0x8006,
    Unknown = 0xffff,
}

/// Platform values for [`RawSystemInfo::platform_id`].
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum PlatformId {
    Win32s = 1,
    Windows9x = 2,
    WindowsNt = 3,
    WindowsCe = 4,
    Unix = 0x8000,
    MacOs = 0x8101,
    Ios = 0x8102,
    Linux = 0x8201,
    Solaris = 0x8202,
    Android = 0x8203,
    Ps3 = 0x8204,
    NaCl = 0x8205,
    Fuchsia = 0x8206,
}

/// A calendar timestamp as Windows' SYSTEMTIME.
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq, Eq)]
pub struct SystemTime16 {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub milliseconds: u16,
}

/// Time-zone settings recorded by misc-info v3 and later.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct TimeZoneInformation {
    pub bias: i32,
    pub standard_name: [u16; 32],
    pub standard_date: SystemTime16,
    pub standard_bias: i32,
    pub daylight_name: [u16; 32],
    pub daylight_date: SystemTime16,
    pub daylight_bias: i32,
}

impl Default for TimeZoneInformation {
    fn default() -> Self {
        Self {
            bias: 0,
            standard_name: [0; 32],
            standard_date: SystemTime16::default(),
            standard_bias: 0,
            daylight_name: [0; 32],
            daylight_date: SystemTime16::default(),
            daylight_bias: 0,
        }
    }
}

/// Offset and size of one XSAVE entry trailing a thread context.
#[derive(Clone, Copy, Debug, Default, Pread, SizeWith, PartialEq, Eq)]
pub struct XstateFeature {
    pub offset: u32,
    pub size: u32,
}

// Pread's array derive builds the scratch array with `0u8.into()`.
impl From<u8> for XstateFeature {
    fn from(_input: u8) -> Self {
        XstateFeature { offset: 0, size: 0 }
    }
}

/// XSAVE layout descriptor carried by misc-info v5.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct XstateConfigFeatureMscInfo {
    pub size_of_info: u32,
    pub context_size: u32,
    pub enabled_features: u64,
    pub features: [XstateFeature; 64],
}

impl Default for XstateConfigFeatureMscInfo {
    fn default() -> Self {
        Self {
            size_of_info: std::mem::size_of::<XstateConfigFeatureMscInfo>() as u32,
            context_size: 0,
            enabled_features: 0,
            features: [XstateFeature::default(); 64],
        }
    }
}

// The misc-info stream grew a new struct with every revision, each one a
// strict prefix of the next. Declaring them through a macro keeps the field
// lists in one place; each invocation inherits every earlier field.
macro_rules! versioned_structs {
    (@next { $($prev:tt)* }) => {};
    (@next { $($prev:tt)* } $(#[$attr:meta])* pub struct $name:ident { $($cur:tt)* } $($tail:tt)* ) => {
        versioned_structs!($(#[$attr])* pub struct $name { $($prev)* $($cur)* } $($tail)*);
    };
    ($(#[$attr:meta])* pub struct $name:ident { $( pub $field:ident: $t:tt, )* } $($tail:tt)* ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Pread, SizeWith)]
        pub struct $name {
            $( pub $field: $t, )*
        }
        versioned_structs!(@next { $( pub $field: $t, )* } $($tail)*);
    };
}

versioned_structs! {
    /// Miscellaneous process information, first revision.
    pub struct RawMiscInfo {
        pub size_of_info: u32,
        pub flags1: u32,
        pub process_id: u32,
        pub process_create_time: u32,
        pub process_user_time: u32,
        pub process_kernel_time: u32,
    }
    /// Misc info v2: processor power information.
    pub struct RawMiscInfo2 {
        pub processor_max_mhz: u32,
        pub processor_current_mhz: u32,
        pub processor_mhz_limit: u32,
        pub processor_max_idle_state: u32,
        pub processor_current_idle_state: u32,
    }
    /// Misc info v3: process integrity, execute flags, time zone.
    pub struct RawMiscInfo3 {
        pub process_integrity_level: u32,
        pub process_execute_flags: u32,
        pub protected_process: u32,
        pub time_zone_id: u32,
        pub time_zone: TimeZoneInformation,
    }
    /// Misc info v4: build strings.
    pub struct RawMiscInfo4 {
        pub build_string: [u16; 260],
        pub dbg_bld_str: [u16; 40],
    }
    /// Misc info v5: XSAVE layout and process cookie.
    pub struct RawMiscInfo5 {
        pub xstate_data: XstateConfigFeatureMscInfo,
        pub process_cookie: u32,
    }
}

bitflags! {
    /// Validity bits for `RawMiscInfo*::flags1`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MiscInfoFlags: u32 {
        const PROCESS_ID            = 0x00000001;
        const PROCESS_TIMES         = 0x00000002;
        const PROCESSOR_POWER_INFO  = 0x00000004;
        const PROCESS_INTEGRITY     = 0x00000010;
        const PROCESS_EXECUTE_FLAGS = 0x00000020;
        const TIMEZONE              = 0x00000040;
        const PROTECTED_PROCESS     = 0x00000080;
        const BUILDSTRING           = 0x00000100;
        const PROCESS_COOKIE        = 0x00000200;
    }
}

/// Header of the memory-info list stream.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct MemoryInfoListHeader {
    pub size_of_header: u32,
    pub size_of_entry: u32,
    pub number_of_entries: u64,
}

/// Metadata about one region of the crashed process's address space.
#[derive(Debug, Clone, PartialEq, Eq, Pread, SizeWith)]
pub struct RawMemoryInfo {
    pub base_address: u64,
    pub allocation_base: u64,
    pub allocation_protection: u32,
    pub __alignment1: u32,
    pub region_size: u64,
    pub state: u32,
    pub protection: u32,
    pub _type: u32,
    pub __alignment2: u32,
}

bitflags! {
    /// Values for [`RawMemoryInfo::state`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryState: u32 {
        const MEM_COMMIT  = 0x01000;
        const MEM_FREE    = 0x10000;
        const MEM_RESERVE = 0x02000;
    }
}

bitflags! {
    /// Values for [`RawMemoryInfo::protection`] and `allocation_protection`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryProtection: u32 {
        const PAGE_NOACCESS          = 0x01;
        const PAGE_READONLY          = 0x02;
        const PAGE_READWRITE         = 0x04;
        const PAGE_WRITECOPY         = 0x08;
        const PAGE_EXECUTE           = 0x10;
        const PAGE_EXECUTE_READ      = 0x20;
        const PAGE_EXECUTE_READWRITE = 0x40;
        const PAGE_EXECUTE_WRITECOPY = 0x80;
        const ACCESS_MASK            = 0xff;
        const PAGE_GUARD             = 0x100;
        const PAGE_NOCACHE           = 0x200;
        const PAGE_WRITECOMBINE      = 0x400;
    }
}

bitflags! {
    /// Values for [`RawMemoryInfo::_type`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryType: u32 {
        const MEM_PRIVATE = 0x00020000;
        const MEM_MAPPED  = 0x00040000;
        const MEM_IMAGE   = 0x01000000;
    }
}

/// Header of the handle-data stream.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct HandleDataHeader {
    pub size_of_header: u32,
    /// Selects the descriptor layout; see [`HandleDescriptor`] and
    /// [`HandleDescriptor2`].
    pub size_of_descriptor: u32,
    pub number_of_descriptors: u32,
    pub reserved: u32,
}

/// Original handle descriptor layout (32 bytes).
#[derive(Debug, Clone, Default, Pread, SizeWith)]
pub struct HandleDescriptor {
    pub handle: u64,
    pub type_name_rva: Rva,
    pub object_name_rva: Rva,
    pub attributes: u32,
    pub granted_access: u32,
    pub handle_count: u32,
    pub pointer_count: u32,
}

/// Extended handle descriptor layout (40 bytes).
#[derive(Debug, Clone, Default, Pread, SizeWith)]
pub struct HandleDescriptor2 {
    pub handle: u64,
    pub type_name_rva: Rva,
    pub object_name_rva: Rva,
    pub attributes: u32,
    pub granted_access: u32,
    pub handle_count: u32,
    pub pointer_count: u32,
    pub object_info_rva: Rva,
    pub reserved0: u32,
}

/// Breakpad's extra process information stream.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawBreakpadInfo {
    pub validity: u32,
    /// Thread that wrote the dump.
    pub dump_thread_id: u32,
    /// Thread that asked for the dump to be written.
    pub requesting_thread_id: u32,
}

bitflags! {
    /// Validity bits for [`RawBreakpadInfo::validity`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreakpadInfoValidity: u32 {
        const DUMP_THREAD_ID       = 1 << 0;
        const REQUESTING_THREAD_ID = 1 << 1;
    }
}

/// Breakpad's failed-assertion stream.
#[derive(Debug, Clone, Pread, SizeWith)]
pub struct RawAssertionInfo {
    /// The failed expression, NUL-terminated UTF-16LE.
    pub expression: [u16; 128],
    pub function: [u16; 128],
    pub file: [u16; 128],
    pub line: u32,
    pub _type: u32,
}

/// Known values of [`RawAssertionInfo::_type`].
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Debug, Primitive)]
pub enum AssertionKind {
    Unknown = 0,
    InvalidParameter = 1,
    PureVirtualCall = 2,
}

/// A length-prefixed, NUL-terminated UTF-8 string (Crashpad convention).
#[derive(Debug, Clone)]
pub struct Utf8String {
    pub length: u32,
    pub buffer: Vec<u8>,
}

impl<'a> scroll::ctx::TryFromCtx<'a, Endian> for Utf8String {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let length: u32 = src.gread_with(offset, endian)?;
        let data: &[u8] = src.gread_with(offset, length as usize + 1)?;
        if !data.ends_with(&[0]) {
            return Err(scroll::Error::Custom(
                "crashpad string missing NUL terminator".to_owned(),
            ));
        }
        Ok((
            Self {
                length,
                buffer: data.to_vec(),
            },
            *offset,
        ))
    }
}

/// A key/value pair of string RVAs in a Crashpad dictionary.
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct SimpleStringDictionaryEntry {
    pub key: Rva,
    pub value: Rva,
}

/// A Crashpad typed annotation.
#[derive(Clone, Debug, Pread)]
pub struct RawAnnotation {
    pub name: Rva,
    pub ty: u16,
    pub _reserved: u16,
    pub value: Rva,
}

impl RawAnnotation {
    pub const TYPE_INVALID: u16 = 0;
    pub const TYPE_STRING: u16 = 1;
    pub const TYPE_USER_DEFINED: u16 = 0x8000;
}

/// Crashpad's per-module extension record.
#[derive(Clone, Debug, Pread)]
pub struct CrashpadModuleInfo {
    pub version: u32,
    pub list_annotations: LocationDescriptor,
    pub simple_annotations: LocationDescriptor,
    pub annotation_objects: LocationDescriptor,
}

impl CrashpadModuleInfo {
    pub const VERSION: u32 = 1;
}

/// Links a module-list index to its [`CrashpadModuleInfo`].
#[derive(Clone, Debug, Pread)]
pub struct CrashpadModuleInfoLink {
    pub module_list_index: u32,
    pub location: LocationDescriptor,
}

/// Crashpad's top-level extension stream.
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct RawCrashpadInfo {
    pub version: u32,
    pub report_id: Guid,
    pub client_id: Guid,
    pub simple_annotations: LocationDescriptor,
    pub module_list: LocationDescriptor,
}

impl RawCrashpadInfo {
    pub const VERSION: u32 = 1;
}

/// Mask selecting the CPU-type bits of a context's `context_flags`.
pub const CONTEXT_CPU_MASK: u32 = 0xffffff00;

bitflags! {
    /// CPU-type bits found in a context record's `context_flags`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ContextFlagsCpu: u32 {
        const CONTEXT_X86 = 0x10000;
        const CONTEXT_AMD64 = 0x100000;
        const CONTEXT_ARM = 0x40000000;
        const CONTEXT_ARM64 = 0x400000;
        const CONTEXT_ARM64_OLD = 0x80000000;
        const CONTEXT_MIPS = 0x40000;
        const CONTEXT_MIPS64 = 0x80000;
        const CONTEXT_PPC = 0x20000000;
        const CONTEXT_PPC64 = 0x1000000;
        const CONTEXT_SPARC = 0x10000000;
        const CONTEXT_RISCV = 0x8000000;
        const CONTEXT_RISCV64 = 0x4000000;
    }
}

impl ContextFlagsCpu {
    /// Extract the CPU-type bits from a raw `context_flags` word.
    pub fn from_flags(flags: u32) -> ContextFlagsCpu {
        ContextFlagsCpu::from_bits_truncate(flags & CONTEXT_CPU_MASK)
    }
}

/// x87/FPU state for [`ContextX86`].
#[derive(Debug, Clone, SmartDefault, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaX86 {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    #[default([0; 80])]
    pub register_area: [u8; 80],
    pub cr0_npx_state: u32,
}

/// An x86 CPU context (716 bytes on disk).
#[derive(Debug, Clone, SmartDefault, Pread, SizeWith, PartialEq)]
pub struct ContextX86 {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: FloatSaveAreaX86,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
    #[default([0; 512])]
    pub extended_registers: [u8; 512],
}

/// An x86-64 CPU context (1232 bytes on disk).
///
/// This layout has no leading flags word in a distinguishable position, so
/// readers identify it by its exact size.
#[derive(Debug, Clone, SmartDefault, Pread, SizeWith, PartialEq)]
pub struct ContextAmd64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /// A union of the legacy FXSAVE area and the SSE header in C; kept raw.
    #[default([0; 512])]
    pub float_save: [u8; 512],
    #[default([0; 26])]
    pub vector_register: [u128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

/// VFP state for [`ContextArm`].
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaArm {
    pub fpscr: u64,
    pub regs: [u64; 32],
    pub extra: [u32; 8],
}

/// An Arm CPU context (368 bytes on disk, Breakpad layout).
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct ContextArm {
    pub context_flags: u32,
    pub iregs: [u32; 16],
    pub cpsr: u32,
    pub float_save: FloatSaveAreaArm,
}

/// Indices into [`ContextArm::iregs`] with a conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ArmRegisters {
    IosFramePointer = 7,
    FramePointer = 11,
    StackPointer = 13,
    LinkRegister = 14,
    ProgramCounter = 15,
}

impl ArmRegisters {
    pub const fn name(self) -> &'static str {
        match self {
            Self::IosFramePointer => "r7",
            Self::FramePointer => "r11",
            Self::StackPointer => "r13",
            Self::LinkRegister => "r14",
            Self::ProgramCounter => "r15",
        }
    }
}

/// SIMD state for [`ContextArm64`].
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaArm64 {
    pub regs: [u128; 32],
    pub fpsr: u32,
    pub fpcr: u32,
}

/// An aarch64 CPU context (912 bytes on disk).
#[derive(Debug, Default, Clone, Pread, SizeWith, PartialEq)]
pub struct ContextArm64 {
    pub context_flags: u32,
    pub cpsr: u32,
    pub iregs: [u64; 32],
    pub pc: u64,
    pub float_save: FloatSaveAreaArm64,
    pub bcr: [u32; 8],
    pub bvr: [u64; 8],
    pub wcr: [u32; 2],
    pub wvr: [u64; 2],
}

/// SIMD state for [`ContextArm64Old`].
#[derive(Debug, Clone, Copy, Default, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaArm64Old {
    pub fpsr: u32,
    pub fpcr: u32,
    pub regs: [u128; 32],
}

/// The older, packed aarch64 layout with a 64-bit flags word.
#[derive(Debug, Clone, Copy, Default, Pread, SizeWith, PartialEq)]
pub struct ContextArm64Old {
    pub context_flags: u64,
    pub iregs: [u64; 32],
    pub pc: u64,
    pub cpsr: u32,
    pub float_save: FloatSaveAreaArm64Old,
}

/// Indices into [`ContextArm64::iregs`] with a conventional purpose.
///
/// `ProgramCounter` is a pseudo-index one past the integer registers, as the
/// pc lives in its own field.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Arm64Registers {
    FramePointer = 29,
    LinkRegister = 30,
    StackPointer = 31,
    ProgramCounter = 32,
}

impl Arm64Registers {
    pub const fn name(self) -> &'static str {
        match self {
            Self::FramePointer => "x29",
            Self::LinkRegister => "x30",
            Self::StackPointer => "sp",
            Self::ProgramCounter => "pc",
        }
    }
}

/// FPU state for [`ContextMips`].
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaMips {
    pub regs: [u64; 32],
    pub fpcsr: u32,
    pub fir: u32,
}

/// A MIPS CPU context (Breakpad layout, shared by mips32 and mips64).
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct ContextMips {
    pub context_flags: u32,
    pub _pad0: u32,
    pub iregs: [u64; 32],
    pub mdhi: u64,
    pub mdlo: u64,
    pub hi: [u32; 3],
    pub lo: [u32; 3],
    pub dsp_control: u32,
    pub _pad1: u32,
    pub epc: u64,
    pub badvaddr: u64,
    pub status: u32,
    pub cause: u32,
    pub float_save: FloatSaveAreaMips,
}

/// Indices into [`ContextMips::iregs`] with a conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum MipsRegisters {
    GlobalPointer = 28,
    StackPointer = 29,
    FramePointer = 30,
    ReturnAddress = 31,
}

impl MipsRegisters {
    pub const fn name(self) -> &'static str {
        match self {
            Self::GlobalPointer => "gp",
            Self::StackPointer => "sp",
            Self::FramePointer => "fp",
            Self::ReturnAddress => "ra",
        }
    }
}

/// FPU state shared by [`ContextPpc`] and [`ContextPpc64`].
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaPpc {
    pub fpregs: [u64; 32],
    pub fpscr_pad: u32,
    pub fpscr: u32,
}

/// AltiVec state shared by [`ContextPpc`] and [`ContextPpc64`].
#[derive(Debug, Clone, SmartDefault, Pread, SizeWith, PartialEq)]
pub struct VectorSaveAreaPpc {
    #[default([0; 32])]
    pub save_vr: [u128; 32],
    pub save_vscr: u128,
    pub save_pad5: [u32; 4],
    pub save_vrvalid: u32,
    pub save_pad6: [u32; 7],
}

/// A 32-bit PowerPC CPU context (Breakpad layout).
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct ContextPpc {
    pub context_flags: u32,
    pub srr0: u32,
    pub srr1: u32,
    pub gpr: [u32; 32],
    pub cr: u32,
    pub xer: u32,
    pub lr: u32,
    pub ctr: u32,
    pub mq: u32,
    pub vrsave: u32,
    pub float_save: FloatSaveAreaPpc,
    pub vector_save: VectorSaveAreaPpc,
}

/// A 64-bit PowerPC CPU context (Breakpad layout; 64-bit flags word).
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct ContextPpc64 {
    pub context_flags: u64,
    pub srr0: u64,
    pub srr1: u64,
    pub gpr: [u64; 32],
    pub cr: u64,
    pub xer: u64,
    pub lr: u64,
    pub ctr: u64,
    pub vrsave: u64,
    pub float_save: FloatSaveAreaPpc,
    pub vector_save: VectorSaveAreaPpc,
}

/// Indices into the PowerPC `gpr` array with a conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum PpcRegisters {
    StackPointer = 1,
}

impl PpcRegisters {
    pub const fn name(self) -> &'static str {
        match self {
            Self::StackPointer => "r1",
        }
    }
}

/// FPU state for [`ContextSparc`].
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaSparc {
    pub regs: [u64; 32],
    pub filler: u64,
    pub fsr: u64,
}

/// A SPARC CPU context (Breakpad layout).
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct ContextSparc {
    pub context_flags: u32,
    pub flag_pad: u32,
    pub g_r: [u64; 32],
    pub ccr: u64,
    pub pc: u64,
    pub npc: u64,
    pub y: u64,
    pub asi: u64,
    pub fprs: u64,
    pub float_save: FloatSaveAreaSparc,
}

/// Indices into [`ContextSparc::g_r`] with a conventional purpose.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SparcRegisters {
    /// %o6, the stack pointer.
    StackPointer = 14,
    /// %i6, the frame pointer.
    FramePointer = 30,
    /// %i7, the saved return address.
    ReturnAddress = 31,
}

impl SparcRegisters {
    pub const fn name(self) -> &'static str {
        match self {
            Self::StackPointer => "o6",
            Self::FramePointer => "i6",
            Self::ReturnAddress => "i7",
        }
    }
}

/// FPU state for [`ContextRiscv`].
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct FloatSaveAreaRiscv {
    pub fpregs: [u64; 32],
    pub fcsr: u32,
}

/// A 32-bit RISC-V CPU context (Breakpad layout).
///
/// Integer registers x1..x31; x0 is architecturally zero and not stored.
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct ContextRiscv {
    pub context_flags: u32,
    pub pc: u32,
    pub regs: [u32; 31],
    pub float_save: FloatSaveAreaRiscv,
}

/// A 64-bit RISC-V CPU context (Breakpad layout).
#[derive(Debug, Clone, Default, Pread, SizeWith, PartialEq)]
pub struct ContextRiscv64 {
    pub context_flags: u32,
    pub pc: u64,
    pub regs: [u64; 31],
    pub float_save: FloatSaveAreaRiscv,
}

/// Indices into the RISC-V `regs` array (which starts at x1).
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum RiscvRegisters {
    /// x1, the return address.
    ReturnAddress = 0,
    /// x2, the stack pointer.
    StackPointer = 1,
    /// x8 (s0), the frame pointer when one is in use.
    FramePointer = 7,
}

impl RiscvRegisters {
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReturnAddress => "ra",
            Self::StackPointer => "sp",
            Self::FramePointer => "s0",
        }
    }
}
