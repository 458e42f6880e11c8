//! The minidump container reader and its typed stream accessors.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Write;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::Path;
use std::time::{Duration, SystemTime};

use debugid::{CodeId, DebugId};
use memmap2::Mmap;
use num_traits::FromPrimitive;
use range_map::{Range, RangeMap};
use scroll::ctx::{SizeWith, TryFromCtx};
use scroll::{Pread, BE, LE};
use time::format_description::well_known::Rfc3339;
use tracing::warn;
use uuid::Uuid;

use debris_format::format::{self as md, CvSignature, StreamKind};
use debris_format::range::checked_range;
use debris_format::traits::Module;

use crate::context::{ContextError, DumpContext};
use crate::strings::*;
use crate::system_info::{Cpu, Os, PointerWidth};

/// Errors from reading a minidump.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("file not found")]
    FileNotFound,
    #[error("I/O error while reading the dump")]
    IoError,
    /// The file is too short to even hold a header.
    #[error("truncated minidump (no complete header)")]
    Truncated,
    /// The first four bytes are not `"MDMP"` in either byte order.
    #[error("bad minidump signature")]
    BadSignature,
    /// The header's version word does not carry the minidump version.
    #[error("unsupported minidump version")]
    BadVersion,
    #[error("stream directory out of bounds")]
    MissingDirectory,
    /// A stream's contents could not be decoded.
    #[error("failed to read stream data")]
    StreamReadFailure,
    /// A counted list claims more entries than its stream can hold.
    #[error("stream overrun: expected {expected} bytes, found {actual}")]
    StreamOverrun { expected: usize, actual: usize },
    /// The requested stream is not present in the directory.
    #[error("stream type {0:#x} not present")]
    StreamNotFound(u32),
    /// A versioned stream advertises a layout this reader does not know.
    #[error("unsupported stream version")]
    BadStreamVersion,
    #[error("failed to read a module record")]
    ModuleReadFailure,
    #[error("failed to read a memory region")]
    MemoryReadFailure,
    #[error("failed to read CodeView record")]
    CodeViewReadFailure,
    /// A CPU context's architecture could not be established.
    #[error("unknown or mismatched context architecture")]
    UnknownArchitecture,
}

impl Error {
    /// A stable identifier for the error, for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Error::FileNotFound => "FileNotFound",
            Error::IoError => "IoError",
            Error::Truncated => "Truncated",
            Error::BadSignature => "BadSignature",
            Error::BadVersion => "BadVersion",
            Error::MissingDirectory => "MissingDirectory",
            Error::StreamReadFailure => "StreamReadFailure",
            Error::StreamOverrun { .. } => "StreamOverrun",
            Error::StreamNotFound(_) => "StreamNotFound",
            Error::BadStreamVersion => "BadStreamVersion",
            Error::ModuleReadFailure => "ModuleReadFailure",
            Error::MemoryReadFailure => "MemoryReadFailure",
            Error::CodeViewReadFailure => "CodeViewReadFailure",
            Error::UnknownArchitecture => "UnknownArchitecture",
        }
    }
}

/// A parsed minidump, generic over how the file bytes are owned.
///
/// The `Dump` owns the bytes for the duration of a processing run; every
/// stream and memory view borrows from it and cannot outlive it.
#[derive(Debug)]
pub struct Dump<'a, T>
where
    T: Deref<Target = [u8]> + 'a,
{
    data: T,
    /// The raw header.
    pub header: md::RawHeader,
    streams: HashMap<u32, (u32, md::RawDirectory)>,
    system_info: Option<DumpSystemInfo>,
    /// The byte order of the file.
    pub endian: scroll::Endian,
    _phantom: PhantomData<&'a [u8]>,
}

/// One typed stream of a [`Dump`].
pub trait DumpStream<'a>: Sized {
    /// The directory stream type this decodes; kept as a `u32` so private
    /// vendor streams can implement this too.
    const STREAM_TYPE: u32;

    /// Decode the stream.
    ///
    /// `bytes` is the stream's own slice; `all` is the whole file, for
    /// records that chase location descriptors; `system_info` is the
    /// preparsed system-info stream if the dump has one.
    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error>;
}

fn format_time_t(t: u32) -> String {
    time::OffsetDateTime::from_unix_timestamp(t as i64)
        .ok()
        .and_then(|datetime| datetime.format(&Rfc3339).ok())
        .unwrap_or_default()
}

/// Slice `bytes` per `loc`, verifying the range lies within the file.
fn location_slice<'a>(bytes: &'a [u8], loc: &md::LocationDescriptor) -> Result<&'a [u8], Error> {
    let start = loc.rva as usize;
    start
        .checked_add(loc.data_size as usize)
        .and_then(|end| bytes.get(start..end))
        .ok_or(Error::StreamReadFailure)
}

/// Check that `buf` can hold `count` entries of `entry_size` after `offset`
/// bytes of header; returns the total counted size.
fn ensure_count_in_bound(
    buf: &[u8],
    count: usize,
    entry_size: usize,
    offset: usize,
) -> Result<usize, Error> {
    let expected = count
        .checked_mul(entry_size)
        .and_then(|v| v.checked_add(offset))
        .ok_or(Error::StreamReadFailure)?;
    if buf.len() < expected {
        return Err(Error::StreamOverrun {
            expected,
            actual: buf.len(),
        });
    }
    Ok(expected)
}

/// Read a `u32`-counted array of raw entries.
fn read_stream_list<'a, T>(
    offset: &mut usize,
    bytes: &'a [u8],
    endian: scroll::Endian,
) -> Result<Vec<T>, Error>
where
    T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
    T: SizeWith<scroll::Endian>,
{
    let count: u32 = bytes
        .gread_with(offset, endian)
        .or(Err(Error::StreamReadFailure))?;
    let counted_size = ensure_count_in_bound(
        bytes,
        count as usize,
        <T>::size_with(&endian),
        std::mem::size_of::<u32>(),
    )?;

    // Some writers pad the count to 8 bytes; tolerate exactly that.
    match bytes.len() - counted_size {
        0 => {}
        4 => {
            *offset += 4;
        }
        _ => {
            return Err(Error::StreamOverrun {
                expected: counted_size,
                actual: bytes.len(),
            });
        }
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw: T = bytes
            .gread_with(offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        entries.push(raw);
    }
    Ok(entries)
}

/// Read a list stream with the newer extended header
/// (`size_of_header`/`size_of_entry`/`number_of_entries`).
fn read_ex_stream_list<'a, T>(
    offset: &mut usize,
    bytes: &'a [u8],
    endian: scroll::Endian,
) -> Result<Vec<T>, Error>
where
    T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
    T: SizeWith<scroll::Endian>,
{
    let size_of_header: u32 = bytes
        .gread_with(offset, endian)
        .or(Err(Error::StreamReadFailure))?;
    let size_of_entry: u32 = bytes
        .gread_with(offset, endian)
        .or(Err(Error::StreamReadFailure))?;
    let number_of_entries: u32 = bytes
        .gread_with(offset, endian)
        .or(Err(Error::StreamReadFailure))?;

    if size_of_entry as usize != <T>::size_with(&endian) {
        // Entries of a different size than we know how to decode; the
        // extension story for this header is unproven, so bail.
        return Err(Error::BadStreamVersion);
    }

    ensure_count_in_bound(
        bytes,
        number_of_entries as usize,
        size_of_entry as usize,
        size_of_header as usize,
    )?;

    let header_padding = (size_of_header as usize)
        .checked_sub(*offset)
        .ok_or(Error::StreamReadFailure)?;
    *offset += header_padding;

    let mut entries = Vec::with_capacity(number_of_entries as usize);
    for _ in 0..number_of_entries {
        let raw: T = bytes
            .gread_with(offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        entries.push(raw);
    }
    Ok(entries)
}

/// The decoded CodeView record of a module.
#[derive(Debug, Clone)]
pub enum CodeView {
    /// PDB 2.0 debug info in an external file.
    Pdb20(md::CvInfoPdb20),
    /// PDB 7.0 debug info in an external file; the common case.
    Pdb70(md::CvInfoPdb70),
    /// An ELF build id (Breakpad extension).
    Elf(md::CvInfoElf),
    /// Unrecognized data, retained raw.
    Unknown(Vec<u8>),
}

fn read_codeview(
    location: &md::LocationDescriptor,
    data: &[u8],
    endian: scroll::Endian,
) -> Option<CodeView> {
    let bytes = location_slice(data, location).ok()?;
    let signature: u32 = bytes.pread_with(0, endian).ok()?;
    Some(match CvSignature::from_u32(signature) {
        Some(CvSignature::Pdb70) => CodeView::Pdb70(bytes.pread_with(0, endian).ok()?),
        Some(CvSignature::Pdb20) => CodeView::Pdb20(bytes.pread_with(0, endian).ok()?),
        Some(CvSignature::Elf) => CodeView::Elf(bytes.pread_with(0, endian).ok()?),
        None => CodeView::Unknown(bytes.to_owned()),
    })
}

fn read_debug_id(codeview: &CodeView, endian: scroll::Endian) -> Option<DebugId> {
    match codeview {
        CodeView::Pdb70(raw) => {
            let uuid = Uuid::from_fields(
                raw.signature.data1,
                raw.signature.data2,
                raw.signature.data3,
                &raw.signature.data4,
            );
            (!uuid.is_nil()).then(|| DebugId::from_parts(uuid, raw.age))
        }
        CodeView::Pdb20(raw) => Some(DebugId::from_pdb20(raw.signature, raw.age)),
        CodeView::Elf(raw) => {
            // Build ids from non-executable mappings are frequently all
            // zeroes; those aren't identities.
            if raw.build_id.iter().all(|byte| *byte == 0) {
                return None;
            }
            // Historical convention: the first 16 bytes of the build id are
            // treated as a GUID (zero-padded when shorter).
            let guid_size = md::Guid::size_with(&endian);
            let mut padded = raw.build_id.clone();
            padded.resize(std::cmp::max(guid_size, padded.len()), 0);
            let guid: md::Guid = padded.pread_with(0, endian).ok()?;
            let uuid = Uuid::from_fields(guid.data1, guid.data2, guid.data3, &guid.data4);
            Some(DebugId::from_uuid(uuid))
        }
        CodeView::Unknown(_) => None,
    }
}

/// One loaded module, with its name and debug identity resolved.
#[derive(Debug, Clone)]
pub struct DumpModule {
    /// The raw record from the file.
    pub raw: md::RawModule,
    /// The module's name, read from its name RVA.
    pub name: String,
    /// The CodeView record, if the module carries one.
    pub codeview: Option<CodeView>,
    os: Os,
    debug_id: Option<DebugId>,
}

impl DumpModule {
    /// Build a module with just a base, size, and name. Tests lean on this.
    pub fn new(base: u64, size: u32, name: &str) -> DumpModule {
        DumpModule {
            raw: md::RawModule {
                base_of_image: base,
                size_of_image: size,
                ..md::RawModule::default()
            },
            name: String::from(name),
            codeview: None,
            os: Os::Unknown(0),
            debug_id: None,
        }
    }

    /// Resolve the auxiliary data (name, CodeView) for `raw`.
    pub fn read(
        raw: md::RawModule,
        all: &[u8],
        endian: scroll::Endian,
        system_info: Option<&DumpSystemInfo>,
    ) -> Result<DumpModule, Error> {
        let mut offset = raw.module_name_rva as usize;
        let name = read_string_utf16(&mut offset, all, endian).ok_or(Error::ModuleReadFailure)?;
        let codeview = if raw.cv_record.data_size == 0 {
            None
        } else {
            Some(read_codeview(&raw.cv_record, all, endian).ok_or(Error::CodeViewReadFailure)?)
        };
        let os = system_info.map(|info| info.os).unwrap_or(Os::Unknown(0));
        let debug_id = codeview.as_ref().and_then(|cv| read_debug_id(cv, endian));
        Ok(DumpModule {
            raw,
            name,
            codeview,
            os,
            debug_id,
        })
    }

    fn memory_range(&self) -> Option<Range<u64>> {
        checked_range(self.base_address(), self.size())
    }

    /// Write a human-readable description of this module.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        writeln!(
            f,
            "Module {} @ {:#x}..{:#x}",
            self.name,
            self.raw.base_of_image,
            self.raw.base_of_image + self.raw.size_of_image as u64,
        )?;
        writeln!(
            f,
            "  checksum        = {:#x}\n  time_date_stamp = {:#x} {}",
            self.raw.checksum,
            self.raw.time_date_stamp,
            format_time_t(self.raw.time_date_stamp),
        )?;
        match &self.codeview {
            Some(CodeView::Pdb70(cv)) => writeln!(
                f,
                "  codeview        = PDB70 {} age {} {}",
                cv.signature,
                cv.age,
                string_from_bytes_nul(&cv.pdb_file_name).unwrap_or(Cow::Borrowed("(invalid)")),
            )?,
            Some(CodeView::Pdb20(cv)) => writeln!(
                f,
                "  codeview        = PDB20 {:#x} age {}",
                cv.signature, cv.age
            )?,
            Some(CodeView::Elf(cv)) => {
                writeln!(f, "  codeview        = ELF {}", bytes_to_hex(&cv.build_id))?
            }
            Some(CodeView::Unknown(bytes)) => {
                writeln!(f, "  codeview        = unknown {}", bytes_to_hex(bytes))?
            }
            None => writeln!(f, "  codeview        = (none)")?,
        }
        writeln!(
            f,
            "  debug_file      = {}\n  debug_id        = {}\n",
            self.debug_file().unwrap_or(Cow::Borrowed("")),
            self.debug_identifier().unwrap_or_default(),
        )
    }
}

impl Module for DumpModule {
    fn base_address(&self) -> u64 {
        self.raw.base_of_image
    }

    fn size(&self) -> u64 {
        self.raw.size_of_image as u64
    }

    fn code_file(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
    }

    fn code_identifier(&self) -> Option<CodeId> {
        match self.codeview {
            Some(CodeView::Pdb70(ref raw)) if self.os == Os::MacOs || self.os == Os::Ios => {
                // Mach-O modules reuse the PDB70 record for their UUID.
                Some(CodeId::new(format!("{:#}", raw.signature)))
            }
            Some(CodeView::Pdb20(_)) | Some(CodeView::Pdb70(_)) => Some(CodeId::new(format!(
                "{0:08X}{1:x}",
                self.raw.time_date_stamp, self.raw.size_of_image
            ))),
            Some(CodeView::Elf(ref raw)) => {
                if raw.build_id.iter().all(|byte| *byte == 0) {
                    None
                } else {
                    Some(CodeId::from_binary(&raw.build_id))
                }
            }
            // Windows module records sometimes omit the CodeView record but
            // the timestamp+size id is still resolvable on symbol servers.
            None if self.os == Os::Windows => Some(CodeId::new(format!(
                "{0:08X}{1:x}",
                self.raw.time_date_stamp, self.raw.size_of_image
            ))),
            _ => None,
        }
    }

    fn debug_file(&self) -> Option<Cow<'_, str>> {
        match self.codeview {
            Some(CodeView::Pdb70(ref raw)) => string_from_bytes_nul(&raw.pdb_file_name),
            Some(CodeView::Pdb20(ref raw)) => string_from_bytes_nul(&raw.pdb_file_name),
            // ELF debug info lives in the binary (or its .debug sibling).
            Some(CodeView::Elf(_)) => Some(Cow::Borrowed(&self.name)),
            _ => None,
        }
    }

    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }

    fn version(&self) -> Option<Cow<'_, str>> {
        let v = &self.raw.version_info;
        if v.signature == 0xfeef04bd {
            Some(Cow::Owned(format!(
                "{}.{}.{}.{}",
                v.file_version_hi >> 16,
                v.file_version_hi & 0xffff,
                v.file_version_lo >> 16,
                v.file_version_lo & 0xffff,
            )))
        } else {
            None
        }
    }
}

/// A pair of modules whose address ranges collide.
///
/// The registry keeps the first-loaded module for the colliding addresses;
/// these records let callers surface the anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleOverlap {
    /// Index (load order) of the module that kept the address range.
    pub kept: usize,
    /// Index (load order) of the module whose range was ignored.
    pub dropped: usize,
}

/// The module registry: all loaded modules, ordered and range-indexed.
#[derive(Debug, Clone)]
pub struct DumpModuleList {
    modules: Vec<DumpModule>,
    modules_by_addr: RangeMap<u64, usize>,
    overlaps: Vec<ModuleOverlap>,
}

impl Default for DumpModuleList {
    fn default() -> Self {
        DumpModuleList {
            modules: vec![],
            modules_by_addr: RangeMap::new(),
            overlaps: vec![],
        }
    }
}

impl DumpModuleList {
    /// An empty registry.
    pub fn new() -> DumpModuleList {
        Self::default()
    }

    /// Build the registry from modules in their load order.
    ///
    /// Overlapping address ranges keep the first-loaded module and are
    /// recorded in [`DumpModuleList::overlaps`]; parsing never fails on
    /// overlap. Duplicate debug identifiers are allowed.
    pub fn from_modules(modules: Vec<DumpModule>) -> DumpModuleList {
        let mut accepted: Vec<(Range<u64>, usize)> = Vec::with_capacity(modules.len());
        let mut overlaps = vec![];
        for (index, module) in modules.iter().enumerate() {
            let range = match module.memory_range() {
                Some(range) => range,
                None => continue,
            };
            let insert_at = accepted.partition_point(|&(r, _)| r.start < range.start);
            let conflict = accepted[..insert_at]
                .last()
                .filter(|&&(r, _)| r.end >= range.start)
                .or_else(|| accepted.get(insert_at).filter(|&&(r, _)| r.start <= range.end));
            if let Some(&(_, kept)) = conflict {
                warn!(
                    "module {:?} overlaps module {:?}; keeping the first-loaded",
                    module.name, modules[kept].name
                );
                overlaps.push(ModuleOverlap {
                    kept,
                    dropped: index,
                });
                continue;
            }
            accepted.insert(insert_at, (range, index));
        }
        let modules_by_addr = accepted.into_iter().collect();
        DumpModuleList {
            modules,
            modules_by_addr,
            overlaps,
        }
    }

    /// The main executable: the first module by load order.
    pub fn main_module(&self) -> Option<&DumpModule> {
        self.modules.first()
    }

    /// The module whose mapped range covers `address`, if any.
    pub fn module_at_address(&self, address: u64) -> Option<&DumpModule> {
        self.modules_by_addr
            .get(address)
            .map(|&index| &self.modules[index])
    }

    /// The module at position `index` in load order.
    pub fn module_at_sequence(&self, index: usize) -> Option<&DumpModule> {
        self.modules.get(index)
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Address-range collisions found while building the registry.
    pub fn overlaps(&self) -> &[ModuleOverlap] {
        &self.overlaps
    }

    /// Iterate modules in load order.
    pub fn iter(&self) -> impl Iterator<Item = &DumpModule> {
        self.modules.iter()
    }

    /// Iterate modules by ascending base address.
    pub fn by_addr(&self) -> impl DoubleEndedIterator<Item = &DumpModule> {
        self.modules_by_addr
            .ranges_values()
            .map(move |&(_, index)| &self.modules[index])
    }

    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        writeln!(f, "ModuleList ({} modules)\n", self.modules.len())?;
        for module in &self.modules {
            module.print(f)?;
        }
        Ok(())
    }
}

impl<'a> DumpStream<'a> for DumpModuleList {
    const STREAM_TYPE: u32 = StreamKind::ModuleList as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        system_info: Option<&DumpSystemInfo>,
    ) -> Result<DumpModuleList, Error> {
        let mut offset = 0;
        let raw_modules: Vec<md::RawModule> = read_stream_list(&mut offset, bytes, endian)?;
        let mut modules = Vec::with_capacity(raw_modules.len());
        for raw in raw_modules {
            if raw.size_of_image == 0 || raw.size_of_image as u64 > u64::MAX - raw.base_of_image {
                return Err(Error::ModuleReadFailure);
            }
            modules.push(DumpModule::read(raw, all, endian, system_info)?);
        }
        Ok(DumpModuleList::from_modules(modules))
    }
}

/// A module that was unloaded before the crash.
#[derive(Debug, Clone)]
pub struct DumpUnloadedModule {
    pub raw: md::RawUnloadedModule,
    pub name: String,
}

impl DumpUnloadedModule {
    pub fn read(
        raw: md::RawUnloadedModule,
        all: &[u8],
        endian: scroll::Endian,
    ) -> Result<DumpUnloadedModule, Error> {
        let mut offset = raw.module_name_rva as usize;
        let name = read_string_utf16(&mut offset, all, endian).ok_or(Error::ModuleReadFailure)?;
        Ok(DumpUnloadedModule { raw, name })
    }

    fn memory_range(&self) -> Option<Range<u64>> {
        checked_range(self.raw.base_of_image, self.raw.size_of_image as u64)
    }
}

/// Unloaded modules; ranges can overlap freely (an address may have hosted
/// several modules over the process's lifetime).
#[derive(Debug, Clone, Default)]
pub struct DumpUnloadedModuleList {
    modules: Vec<DumpUnloadedModule>,
    by_addr: Vec<(Range<u64>, usize)>,
}

impl DumpUnloadedModuleList {
    pub fn new() -> DumpUnloadedModuleList {
        Self::default()
    }

    pub fn from_modules(modules: Vec<DumpUnloadedModule>) -> DumpUnloadedModuleList {
        let mut by_addr: Vec<_> = (0..modules.len())
            .filter_map(|i| modules[i].memory_range().map(|r| (r, i)))
            .collect();
        by_addr.sort_by_key(|&(range, _)| range);
        DumpUnloadedModuleList { modules, by_addr }
    }

    /// All unloaded modules that ever covered `address`.
    pub fn modules_at_address(&self, address: u64) -> impl Iterator<Item = &DumpUnloadedModule> {
        self.by_addr
            .iter()
            .filter(move |(range, _)| range.contains(address))
            .map(move |&(_, index)| &self.modules[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &DumpUnloadedModule> {
        self.modules.iter()
    }
}

impl<'a> DumpStream<'a> for DumpUnloadedModuleList {
    const STREAM_TYPE: u32 = StreamKind::UnloadedModuleList as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<DumpUnloadedModuleList, Error> {
        let mut offset = 0;
        let raw_modules: Vec<md::RawUnloadedModule> =
            read_ex_stream_list(&mut offset, bytes, endian)?;
        let mut modules = Vec::with_capacity(raw_modules.len());
        for raw in raw_modules {
            if raw.size_of_image == 0 || raw.size_of_image as u64 > u64::MAX - raw.base_of_image {
                return Err(Error::ModuleReadFailure);
            }
            modules.push(DumpUnloadedModule::read(raw, all, endian)?);
        }
        Ok(DumpUnloadedModuleList::from_modules(modules))
    }
}

/// A captured region of the crashed process's memory.
#[derive(Clone, Debug)]
pub struct DumpMemoryBase<'a, Descriptor> {
    /// The raw descriptor from the file.
    pub desc: Descriptor,
    /// The region's base address in the crashed process.
    pub base_address: u64,
    /// Length of the region in bytes.
    pub size: u64,
    /// The captured bytes, borrowed from the dump.
    pub bytes: &'a [u8],
}

/// A region from the 32-bit memory list.
pub type DumpMemory<'a> = DumpMemoryBase<'a, md::MemoryDescriptor>;
/// A region from the 64-bit memory list.
pub type DumpMemory64<'a> = DumpMemoryBase<'a, md::MemoryDescriptor64>;

impl<'a, Descriptor> DumpMemoryBase<'a, Descriptor> {
    /// Read a `T`-sized value at absolute address `addr` within this region.
    ///
    /// Returns `None` when any byte of the read falls outside the region;
    /// lookups are bounded, never panicking.
    pub fn get_memory_at_address<T>(&self, addr: u64) -> Option<T>
    where
        T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
        T: SizeWith<scroll::Endian>,
    {
        let _end = self.base_address.checked_add(self.size)?;
        let start = addr.checked_sub(self.base_address)? as usize;
        self.bytes.pread_with::<T>(start, LE).ok()
    }

    fn memory_range(&self) -> Option<Range<u64>> {
        checked_range(self.base_address, self.size)
    }
}

impl<'a> DumpMemory<'a> {
    pub fn read(desc: &md::MemoryDescriptor, data: &'a [u8]) -> Result<DumpMemory<'a>, Error> {
        if desc.memory.rva == 0 || desc.memory.data_size == 0 {
            // Null stack RVAs happen; the caller can fall back to the
            // memory list for the same address.
            return Err(Error::MemoryReadFailure);
        }
        let bytes = location_slice(data, &desc.memory).or(Err(Error::StreamReadFailure))?;
        Ok(DumpMemory {
            desc: *desc,
            base_address: desc.start_of_memory_range,
            size: desc.memory.data_size as u64,
            bytes,
        })
    }
}

/// A list of memory regions, range-indexed.
#[derive(Debug, Clone)]
pub struct DumpMemoryListBase<'a, Descriptor> {
    regions: Vec<DumpMemoryBase<'a, Descriptor>>,
    regions_by_addr: RangeMap<u64, usize>,
}

pub type DumpMemoryList<'a> = DumpMemoryListBase<'a, md::MemoryDescriptor>;
pub type DumpMemory64List<'a> = DumpMemoryListBase<'a, md::MemoryDescriptor64>;

impl<'a, Descriptor> Default for DumpMemoryListBase<'a, Descriptor> {
    fn default() -> Self {
        Self {
            regions: vec![],
            regions_by_addr: RangeMap::new(),
        }
    }
}

impl<'a, Descriptor> DumpMemoryListBase<'a, Descriptor> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regions(regions: Vec<DumpMemoryBase<'a, Descriptor>>) -> Self {
        use debris_format::range::IntoRangeMapSafe;
        let regions_by_addr = regions
            .iter()
            .enumerate()
            .map(|(i, region)| (region.memory_range(), i))
            .into_rangemap_safe();
        Self {
            regions,
            regions_by_addr,
        }
    }

    /// The region containing `address`, if one was captured.
    pub fn memory_at_address(&self, address: u64) -> Option<&DumpMemoryBase<'a, Descriptor>> {
        self.regions_by_addr
            .get(address)
            .map(|&index| &self.regions[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &DumpMemoryBase<'a, Descriptor>> {
        self.regions.iter()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl<'a> DumpStream<'a> for DumpMemoryList<'a> {
    const STREAM_TYPE: u32 = StreamKind::MemoryList as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<DumpMemoryList<'a>, Error> {
        let mut offset = 0;
        let descriptors: Vec<md::MemoryDescriptor> = read_stream_list(&mut offset, bytes, endian)?;
        let mut regions = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            if let Ok(memory) = DumpMemory::read(&desc, all) {
                regions.push(memory);
            }
        }
        Ok(DumpMemoryList::from_regions(regions))
    }
}

impl<'a> DumpStream<'a> for DumpMemory64List<'a> {
    const STREAM_TYPE: u32 = StreamKind::Memory64List as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<DumpMemory64List<'a>, Error> {
        let mut offset = 0;
        let count: u64 = bytes
            .gread_with(&mut offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        let base_rva: u64 = bytes
            .gread_with(&mut offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        ensure_count_in_bound(
            bytes,
            count.try_into().or(Err(Error::StreamReadFailure))?,
            md::MemoryDescriptor64::size_with(&endian),
            offset,
        )?;

        // The regions' bytes are packed back-to-back starting at base_rva;
        // each descriptor only records a size.
        let mut regions = Vec::with_capacity(count as usize);
        let mut data_offset = base_rva;
        for _ in 0..count {
            let desc: md::MemoryDescriptor64 = bytes
                .gread_with(&mut offset, endian)
                .or(Err(Error::StreamReadFailure))?;
            let loc = md::LocationDescriptor {
                rva: data_offset.try_into().or(Err(Error::StreamReadFailure))?,
                data_size: desc.data_size.try_into().or(Err(Error::StreamReadFailure))?,
            };
            let region_bytes = location_slice(all, &loc)?;
            regions.push(DumpMemory64 {
                desc,
                base_address: desc.start_of_memory_range,
                size: desc.data_size,
                bytes: region_bytes,
            });
            data_offset = data_offset
                .checked_add(desc.data_size)
                .ok_or(Error::StreamReadFailure)?;
        }
        Ok(DumpMemory64List::from_regions(regions))
    }
}

/// A memory region from either memory list, flattened to a common shape.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion<'a> {
    pub base_address: u64,
    pub size: u64,
    pub bytes: &'a [u8],
}

impl<'a> MemoryRegion<'a> {
    /// Read a `T`-sized value at absolute address `addr` within this region.
    pub fn get_memory_at_address<T>(&self, addr: u64) -> Option<T>
    where
        T: TryFromCtx<'a, scroll::Endian, [u8], Error = scroll::Error>,
        T: SizeWith<scroll::Endian>,
    {
        let start = addr.checked_sub(self.base_address)? as usize;
        self.bytes.pread_with::<T>(start, LE).ok()
    }
}

/// All captured memory: the union of the 32- and 64-bit memory lists.
///
/// Lookups are O(log n) over a single range index.
#[derive(Debug, Clone)]
pub struct UnifiedMemoryList<'a> {
    regions: Vec<MemoryRegion<'a>>,
    regions_by_addr: RangeMap<u64, usize>,
}

impl<'a> Default for UnifiedMemoryList<'a> {
    fn default() -> Self {
        UnifiedMemoryList {
            regions: vec![],
            regions_by_addr: RangeMap::new(),
        }
    }
}

impl<'a> UnifiedMemoryList<'a> {
    pub fn new(list: &DumpMemoryList<'a>, list64: &DumpMemory64List<'a>) -> UnifiedMemoryList<'a> {
        use debris_format::range::IntoRangeMapSafe;
        let regions: Vec<MemoryRegion<'a>> = list
            .iter()
            .map(|m| MemoryRegion {
                base_address: m.base_address,
                size: m.size,
                bytes: m.bytes,
            })
            .chain(list64.iter().map(|m| MemoryRegion {
                base_address: m.base_address,
                size: m.size,
                bytes: m.bytes,
            }))
            .collect();
        let regions_by_addr = regions
            .iter()
            .enumerate()
            .map(|(i, region)| (checked_range(region.base_address, region.size), i))
            .into_rangemap_safe();
        UnifiedMemoryList {
            regions,
            regions_by_addr,
        }
    }

    /// The region containing `address`, from either list.
    pub fn memory_at_address(&self, address: u64) -> Option<MemoryRegion<'a>> {
        self.regions_by_addr
            .get(address)
            .map(|&index| self.regions[index])
    }
}

/// Metadata about one mapped region (protection, state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpMemoryInfo {
    pub raw: md::RawMemoryInfo,
    pub allocation_protection: md::MemoryProtection,
    pub state: md::MemoryState,
    pub protection: md::MemoryProtection,
    pub ty: md::MemoryType,
}

impl DumpMemoryInfo {
    pub fn is_executable(&self) -> bool {
        self.protection.intersects(
            md::MemoryProtection::PAGE_EXECUTE
                | md::MemoryProtection::PAGE_EXECUTE_READ
                | md::MemoryProtection::PAGE_EXECUTE_READWRITE
                | md::MemoryProtection::PAGE_EXECUTE_WRITECOPY,
        )
    }
}

/// The memory-info list stream.
#[derive(Debug, Clone)]
pub struct DumpMemoryInfoList {
    regions: Vec<DumpMemoryInfo>,
    regions_by_addr: RangeMap<u64, usize>,
}

impl Default for DumpMemoryInfoList {
    fn default() -> Self {
        DumpMemoryInfoList {
            regions: vec![],
            regions_by_addr: RangeMap::new(),
        }
    }
}

impl DumpMemoryInfoList {
    pub fn memory_info_at_address(&self, address: u64) -> Option<&DumpMemoryInfo> {
        self.regions_by_addr
            .get(address)
            .map(|&index| &self.regions[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &DumpMemoryInfo> {
        self.regions.iter()
    }
}

impl<'a> DumpStream<'a> for DumpMemoryInfoList {
    const STREAM_TYPE: u32 = StreamKind::MemoryInfoList as u32;

    fn read(
        bytes: &'a [u8],
        _all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        use debris_format::range::IntoRangeMapSafe;
        let mut offset = 0;
        let header: md::MemoryInfoListHeader = bytes
            .gread_with(&mut offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        if header.size_of_entry as usize != md::RawMemoryInfo::size_with(&endian) {
            return Err(Error::BadStreamVersion);
        }
        ensure_count_in_bound(
            bytes,
            header.number_of_entries.try_into().or(Err(Error::StreamReadFailure))?,
            header.size_of_entry as usize,
            header.size_of_header as usize,
        )?;
        offset = header.size_of_header as usize;

        let mut regions = Vec::with_capacity(header.number_of_entries as usize);
        for _ in 0..header.number_of_entries {
            let raw: md::RawMemoryInfo = bytes
                .gread_with(&mut offset, endian)
                .or(Err(Error::StreamReadFailure))?;
            regions.push(DumpMemoryInfo {
                allocation_protection: md::MemoryProtection::from_bits_truncate(
                    raw.allocation_protection,
                ),
                state: md::MemoryState::from_bits_truncate(raw.state),
                protection: md::MemoryProtection::from_bits_truncate(raw.protection),
                ty: md::MemoryType::from_bits_truncate(raw._type),
                raw,
            });
        }
        let regions_by_addr = regions
            .iter()
            .enumerate()
            .map(|(i, info)| (checked_range(info.raw.base_address, info.raw.region_size), i))
            .into_rangemap_safe();
        Ok(DumpMemoryInfoList {
            regions,
            regions_by_addr,
        })
    }
}

/// One thread's captured state.
#[derive(Debug)]
pub struct DumpThread<'a> {
    /// The raw record from the file.
    pub raw: md::RawThread,
    context: Option<&'a [u8]>,
    stack: Option<DumpMemory<'a>>,
    endian: scroll::Endian,
}

impl<'a> DumpThread<'a> {
    /// Decode this thread's CPU context.
    ///
    /// Fails with [`ContextError::UnknownArchitecture`] when the context
    /// record's architecture cannot be established or disagrees with the
    /// system info.
    pub fn context(&self, system_info: &DumpSystemInfo) -> Result<DumpContext, ContextError> {
        let bytes = self.context.ok_or(ContextError::ReadFailure)?;
        DumpContext::read(bytes, self.endian, system_info)
    }

    /// This thread's stack memory.
    ///
    /// If the thread record's own stack location is broken, fall back to
    /// looking up the stack address in the memory list.
    pub fn stack_memory(&self, memory_list: &DumpMemoryList<'a>) -> Option<Cow<'_, DumpMemory<'a>>> {
        self.stack.as_ref().map(Cow::Borrowed).or_else(|| {
            let stack_addr = self.raw.stack.start_of_memory_range;
            let memory = memory_list.memory_at_address(stack_addr)?;
            Some(Cow::Owned(memory.clone()))
        })
    }
}

/// The thread-list stream.
#[derive(Debug, Default)]
pub struct DumpThreadList<'a> {
    /// Threads, in file order.
    pub threads: Vec<DumpThread<'a>>,
    thread_ids: HashMap<u32, usize>,
}

impl<'a> DumpThreadList<'a> {
    /// Look up a thread by its id.
    pub fn get_thread(&self, id: u32) -> Option<&DumpThread<'a>> {
        self.thread_ids.get(&id).map(|&index| &self.threads[index])
    }
}

impl<'a> DumpStream<'a> for DumpThreadList<'a> {
    const STREAM_TYPE: u32 = StreamKind::ThreadList as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<DumpThreadList<'a>, Error> {
        let mut offset = 0;
        let raw_threads: Vec<md::RawThread> = read_stream_list(&mut offset, bytes, endian)?;
        let mut threads = Vec::with_capacity(raw_threads.len());
        let mut thread_ids = HashMap::with_capacity(raw_threads.len());
        for raw in raw_threads {
            thread_ids.insert(raw.thread_id, threads.len());
            // Context decoding needs the system-info stream, so defer it to
            // the `context` method.
            let context = location_slice(all, &raw.thread_context).ok();
            let stack = DumpMemory::read(&raw.stack, all).ok();
            threads.push(DumpThread {
                raw,
                context,
                stack,
                endian,
            });
        }
        Ok(DumpThreadList {
            threads,
            thread_ids,
        })
    }
}

/// Thread-id to thread-name mapping from the thread-names stream.
#[derive(Debug, Clone, Default)]
pub struct DumpThreadNames {
    names: HashMap<u32, String>,
}

impl DumpThreadNames {
    pub fn get_name(&self, thread_id: u32) -> Option<Cow<'_, str>> {
        self.names
            .get(&thread_id)
            .map(|name| Cow::Borrowed(&**name))
    }
}

impl<'a> DumpStream<'a> for DumpThreadNames {
    const STREAM_TYPE: u32 = StreamKind::ThreadNames as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        let mut offset = 0;
        let raw_names: Vec<md::RawThreadName> = read_stream_list(&mut offset, bytes, endian)?;
        let mut names = HashMap::with_capacity(raw_names.len());
        for raw in raw_names {
            let mut offset = raw.thread_name_rva as usize;
            // Drop unreadable names individually rather than the stream.
            if let Some(name) = read_string_utf16(&mut offset, all, endian) {
                names.insert(raw.thread_id, name);
            } else {
                warn!("couldn't read name for thread {:#x}", raw.thread_id);
            }
        }
        Ok(DumpThreadNames { names })
    }
}

/// The system-info stream, with OS and CPU resolved.
#[derive(Debug, Clone)]
pub struct DumpSystemInfo {
    /// The raw record.
    pub raw: md::RawSystemInfo,
    pub os: Os,
    pub cpu: Cpu,
    csd_version: Option<String>,
    cpu_info: Option<String>,
}

impl<'a> DumpStream<'a> for DumpSystemInfo {
    const STREAM_TYPE: u32 = StreamKind::SystemInfo as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        if let Some(info) = system_info {
            return Ok(info.clone());
        }
        use std::fmt::Write;
        let raw: md::RawSystemInfo = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        let os = Os::from_platform_id(raw.platform_id);
        let cpu = Cpu::from_processor_architecture(raw.processor_architecture);

        let mut csd_offset = raw.csd_version_rva as usize;
        let csd_version = read_string_utf16(&mut csd_offset, all, endian);

        // The cpu union resolves differently per architecture.
        let cpu_info = match cpu {
            Cpu::X86 | Cpu::X86_64 => {
                let mut cpu_info = String::new();
                if cpu == Cpu::X86 {
                    let x86_info: md::X86CpuInfo = raw
                        .cpu
                        .data
                        .pread_with(0, endian)
                        .or(Err(Error::StreamReadFailure))?;
                    cpu_info.extend(
                        x86_info
                            .vendor_id
                            .iter()
                            .flat_map(|i| i.to_le_bytes())
                            .map(char::from),
                    );
                    cpu_info.push(' ');
                }
                write!(
                    &mut cpu_info,
                    "family {} model {} stepping {}",
                    raw.processor_level,
                    (raw.processor_revision >> 8) & 0xff,
                    raw.processor_revision & 0xff
                )
                .ok();
                Some(cpu_info)
            }
            Cpu::Arm => {
                let arm_info: md::ArmCpuInfo = raw
                    .cpu
                    .data
                    .pread_with(0, endian)
                    .or(Err(Error::StreamReadFailure))?;
                let mut cpu_info = format!("ARMv{}", raw.processor_level);
                if arm_info.cpuid != 0 {
                    write!(&mut cpu_info, " cpuid({:#x})", arm_info.cpuid).ok();
                }
                Some(cpu_info)
            }
            _ => None,
        };

        Ok(DumpSystemInfo {
            raw,
            os,
            cpu,
            csd_version,
            cpu_info,
        })
    }
}

impl DumpSystemInfo {
    /// OS service-pack / build string, when present.
    pub fn csd_version(&self) -> Option<Cow<'_, str>> {
        self.csd_version.as_deref().map(Cow::Borrowed)
    }

    /// CPU vendor and model string, when derivable.
    pub fn cpu_info(&self) -> Option<Cow<'_, str>> {
        self.cpu_info.as_deref().map(Cow::Borrowed)
    }

    /// `(os_version, os_build)`, favoring a version parsed from the Linux
    /// `uname` string when the numeric fields are the useless `0.0.0`.
    pub fn os_parts(&self) -> (String, Option<String>) {
        let os_version = format!(
            "{}.{}.{}",
            self.raw.major_version, self.raw.minor_version, self.raw.build_number
        );
        let os_build = self
            .csd_version()
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty());
        if self.os != Os::Linux && self.os != Os::Android || os_version != "0.0.0" {
            return (os_version, os_build);
        }

        // "Linux <version> <build...> <arch> [Linux/GNU]" from `uname`.
        let raw_build = self.csd_version().unwrap_or(Cow::Borrowed(""));
        let mut parts = raw_build.split(' ');
        let version = parts.nth(1).unwrap_or("0.0.0");
        let arch_or_os = parts.next_back().unwrap_or_default();
        if arch_or_os == "Linux/GNU" {
            let _arch = parts.next_back();
        }
        let build = parts.collect::<Vec<&str>>().join(" ");
        if version == "0.0.0" {
            (os_version, os_build)
        } else {
            (version.into(), Some(build))
        }
    }
}

/// Version-tagged misc-info contents.
#[derive(Debug, Clone)]
pub enum RawMiscInfoVariant {
    V1(md::RawMiscInfo),
    V2(md::RawMiscInfo2),
    V3(md::RawMiscInfo3),
    V4(md::RawMiscInfo4),
    V5(md::RawMiscInfo5),
}

// One accessor per misc-info field: present from some version onward, and
// only meaningful when its flags1 bit is set.
macro_rules! misc_accessors {
    () => {};
    (@def $name:ident $flag:ident $t:ty [$($variant:ident)+]) => {
        #[allow(unreachable_patterns)]
        pub fn $name(&self) -> Option<&$t> {
            match self {
                $(
                    RawMiscInfoVariant::$variant(raw) => md::MiscInfoFlags::from_bits_truncate(raw.flags1)
                        .contains(md::MiscInfoFlags::$flag)
                        .then_some(&raw.$name),
                )+
                _ => None,
            }
        }
    };
    (@defnoflag $name:ident $t:ty [$($variant:ident)+]) => {
        #[allow(unreachable_patterns)]
        pub fn $name(&self) -> Option<&$t> {
            match self {
                $(
                    RawMiscInfoVariant::$variant(raw) => Some(&raw.$name),
                )+
                _ => None,
            }
        }
    };
    (1: $name:ident -> $t:ty, $($rest:tt)*) => {
        misc_accessors!(@defnoflag $name $t [V1 V2 V3 V4 V5]);
        misc_accessors!($($rest)*);
    };
    (1: $name:ident if $flag:ident -> $t:ty, $($rest:tt)*) => {
        misc_accessors!(@def $name $flag $t [V1 V2 V3 V4 V5]);
        misc_accessors!($($rest)*);
    };
    (2: $name:ident if $flag:ident -> $t:ty, $($rest:tt)*) => {
        misc_accessors!(@def $name $flag $t [V2 V3 V4 V5]);
        misc_accessors!($($rest)*);
    };
    (3: $name:ident if $flag:ident -> $t:ty, $($rest:tt)*) => {
        misc_accessors!(@def $name $flag $t [V3 V4 V5]);
        misc_accessors!($($rest)*);
    };
    (4: $name:ident if $flag:ident -> $t:ty, $($rest:tt)*) => {
        misc_accessors!(@def $name $flag $t [V4 V5]);
        misc_accessors!($($rest)*);
    };
    (5: $name:ident -> $t:ty, $($rest:tt)*) => {
        misc_accessors!(@defnoflag $name $t [V5]);
        misc_accessors!($($rest)*);
    };
    (5: $name:ident if $flag:ident -> $t:ty, $($rest:tt)*) => {
        misc_accessors!(@def $name $flag $t [V5]);
        misc_accessors!($($rest)*);
    };
}

impl RawMiscInfoVariant {
    misc_accessors!(
        1: size_of_info -> u32,
        1: flags1 -> u32,
        1: process_id if PROCESS_ID -> u32,
        1: process_create_time if PROCESS_TIMES -> u32,
        1: process_user_time if PROCESS_TIMES -> u32,
        1: process_kernel_time if PROCESS_TIMES -> u32,
        2: processor_max_mhz if PROCESSOR_POWER_INFO -> u32,
        2: processor_current_mhz if PROCESSOR_POWER_INFO -> u32,
        2: processor_mhz_limit if PROCESSOR_POWER_INFO -> u32,
        3: process_integrity_level if PROCESS_INTEGRITY -> u32,
        3: process_execute_flags if PROCESS_EXECUTE_FLAGS -> u32,
        3: protected_process if PROTECTED_PROCESS -> u32,
        3: time_zone_id if TIMEZONE -> u32,
        3: time_zone if TIMEZONE -> md::TimeZoneInformation,
        4: build_string if BUILDSTRING -> [u16; 260],
        4: dbg_bld_str if BUILDSTRING -> [u16; 40],
        5: xstate_data -> md::XstateConfigFeatureMscInfo,
        5: process_cookie if PROCESS_COOKIE -> u32,
    );
}

/// The misc-info stream.
#[derive(Debug, Clone)]
pub struct DumpMiscInfo {
    pub raw: RawMiscInfoVariant,
}

impl DumpMiscInfo {
    /// Process creation time, when recorded.
    pub fn process_create_time(&self) -> Option<SystemTime> {
        self.raw
            .process_create_time()
            .map(|&t| SystemTime::UNIX_EPOCH + Duration::from_secs(t as u64))
    }
}

impl<'a> DumpStream<'a> for DumpMiscInfo {
    const STREAM_TYPE: u32 = StreamKind::MiscInfo as u32;

    fn read(
        bytes: &'a [u8],
        _all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        // Read the largest known layout that fits. A stream shorter than
        // even v1 is padded with zeroes: the flags1 gates keep the absent
        // fields unreadable, so truncation is not an error.
        macro_rules! do_read {
            ($(($t:ty, $variant:ident),)+) => {
                $(
                    if bytes.len() >= <$t>::size_with(&endian) {
                        return Ok(DumpMiscInfo {
                            raw: RawMiscInfoVariant::$variant(
                                bytes.pread_with(0, endian).or(Err(Error::StreamReadFailure))?,
                            ),
                        });
                    }
                )+
            }
        }
        do_read!(
            (md::RawMiscInfo5, V5),
            (md::RawMiscInfo4, V4),
            (md::RawMiscInfo3, V3),
            (md::RawMiscInfo2, V2),
            (md::RawMiscInfo, V1),
        );

        let mut padded = bytes.to_vec();
        padded.resize(md::RawMiscInfo::size_with(&endian), 0);
        Ok(DumpMiscInfo {
            raw: RawMiscInfoVariant::V1(
                padded
                    .pread_with(0, endian)
                    .or(Err(Error::StreamReadFailure))?,
            ),
        })
    }
}

/// The Breakpad-info stream: which thread wrote the dump and which asked
/// for it.
#[derive(Debug, Clone)]
pub struct DumpBreakpadInfo {
    pub dump_thread_id: Option<u32>,
    pub requesting_thread_id: Option<u32>,
}

impl<'a> DumpStream<'a> for DumpBreakpadInfo {
    const STREAM_TYPE: u32 = StreamKind::BreakpadInfo as u32;

    fn read(
        bytes: &'a [u8],
        _all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        let raw: md::RawBreakpadInfo = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        let validity = md::BreakpadInfoValidity::from_bits_truncate(raw.validity);
        Ok(DumpBreakpadInfo {
            dump_thread_id: validity
                .contains(md::BreakpadInfoValidity::DUMP_THREAD_ID)
                .then_some(raw.dump_thread_id),
            requesting_thread_id: validity
                .contains(md::BreakpadInfoValidity::REQUESTING_THREAD_ID)
                .then_some(raw.requesting_thread_id),
        })
    }
}

/// The exception stream.
#[derive(Debug)]
pub struct DumpException<'a> {
    pub raw: md::RawExceptionStream,
    pub thread_id: u32,
    context: Option<&'a [u8]>,
    endian: scroll::Endian,
}

impl<'a> DumpStream<'a> for DumpException<'a> {
    const STREAM_TYPE: u32 = StreamKind::Exception as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        let raw: md::RawExceptionStream = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        let context = location_slice(all, &raw.thread_context).ok();
        let thread_id = raw.thread_id;
        Ok(DumpException {
            raw,
            thread_id,
            context,
            endian,
        })
    }
}

impl<'a> DumpException<'a> {
    /// The CPU context at the fault.
    ///
    /// This context, not the faulting thread's own (which records the dump
    /// writer at work), is the state a caller wants for the crashed thread.
    pub fn context(&self, system_info: &DumpSystemInfo) -> Result<DumpContext, ContextError> {
        let bytes = self.context.ok_or(ContextError::ReadFailure)?;
        DumpContext::read(bytes, self.endian, system_info)
    }

    /// The address that "caused" the crash.
    ///
    /// For memory faults this is the inaccessible data address (on Windows,
    /// recovered from the exception parameters); otherwise it is the
    /// faulting instruction address. On 32-bit CPUs stray sign extensions
    /// are masked off.
    pub fn get_crash_address(&self, os: Os, cpu: Cpu) -> u64 {
        use debris_format::codes::ExceptionCodeWindows;
        let record = &self.raw.exception_record;
        let addr = match (
            os,
            ExceptionCodeWindows::from_u32(record.exception_code),
        ) {
            (Os::Windows, Some(ExceptionCodeWindows::EXCEPTION_ACCESS_VIOLATION))
            | (Os::Windows, Some(ExceptionCodeWindows::EXCEPTION_IN_PAGE_ERROR))
                if record.number_parameters >= 2 =>
            {
                record.exception_information[1]
            }
            _ => record.exception_address,
        };
        match cpu.pointer_width() {
            PointerWidth::Bits32 => addr as u32 as u64,
            _ => addr,
        }
    }

    /// Map the raw platform exception code to a [`crate::CrashReason`].
    pub fn get_crash_reason(&self, os: Os) -> crate::CrashReason {
        crate::CrashReason::from_exception(&self.raw, os)
    }

    /// The id of the thread the exception struck.
    pub fn get_crashing_thread_id(&self) -> u32 {
        self.thread_id
    }
}

/// The assertion-info stream.
#[derive(Debug, Clone)]
pub struct DumpAssertion {
    pub raw: md::RawAssertionInfo,
}

impl DumpAssertion {
    pub fn expression(&self) -> Option<String> {
        utf16_to_string(&self.raw.expression)
    }

    pub fn function(&self) -> Option<String> {
        utf16_to_string(&self.raw.function)
    }

    pub fn file(&self) -> Option<String> {
        utf16_to_string(&self.raw.file)
    }
}

impl<'a> DumpStream<'a> for DumpAssertion {
    const STREAM_TYPE: u32 = StreamKind::AssertionInfo as u32;

    fn read(
        bytes: &'a [u8],
        _all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        let raw: md::RawAssertionInfo = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        Ok(DumpAssertion { raw })
    }
}

/// Handle descriptors come in size-versioned layouts; unknown sizes are
/// preserved raw rather than rejected.
#[derive(Debug, Clone)]
pub enum HandleDescriptorVariant {
    V1(md::HandleDescriptor),
    V2(md::HandleDescriptor2),
    Unknown(Vec<u8>),
}

/// One open handle, with its names resolved when possible.
#[derive(Debug, Clone)]
pub struct DumpHandle {
    pub raw: HandleDescriptorVariant,
    /// Name of the handle's type (e.g. "File", "Event").
    pub type_name: Option<String>,
    /// Name of the object the handle refers to.
    pub object_name: Option<String>,
}

/// The handle-data stream.
#[derive(Debug, Clone, Default)]
pub struct DumpHandleData {
    pub handles: Vec<DumpHandle>,
}

impl<'a> DumpStream<'a> for DumpHandleData {
    const STREAM_TYPE: u32 = StreamKind::HandleData as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        let mut offset = 0;
        let header: md::HandleDataHeader = bytes
            .gread_with(&mut offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        let descriptor_size = header.size_of_descriptor as usize;
        if descriptor_size == 0 {
            return Err(Error::StreamReadFailure);
        }
        ensure_count_in_bound(
            bytes,
            header.number_of_descriptors as usize,
            descriptor_size,
            header.size_of_header as usize,
        )?;
        offset = header.size_of_header as usize;

        let v1_size = md::HandleDescriptor::size_with(&endian);
        let v2_size = md::HandleDescriptor2::size_with(&endian);
        let mut handles = Vec::with_capacity(header.number_of_descriptors as usize);
        for _ in 0..header.number_of_descriptors {
            let chunk: &[u8] = bytes
                .gread_with(&mut offset, descriptor_size)
                .or(Err(Error::StreamReadFailure))?;
            let raw = if descriptor_size == v1_size {
                HandleDescriptorVariant::V1(
                    chunk
                        .pread_with(0, endian)
                        .or(Err(Error::StreamReadFailure))?,
                )
            } else if descriptor_size == v2_size {
                HandleDescriptorVariant::V2(
                    chunk
                        .pread_with(0, endian)
                        .or(Err(Error::StreamReadFailure))?,
                )
            } else {
                warn!(
                    "unknown handle descriptor size {descriptor_size}, keeping raw bytes"
                );
                HandleDescriptorVariant::Unknown(chunk.to_vec())
            };
            let read_name = |rva: md::Rva| {
                if rva == 0 {
                    return None;
                }
                let mut offset = rva as usize;
                read_string_utf16(&mut offset, all, endian)
            };
            let (type_name, object_name) = match &raw {
                HandleDescriptorVariant::V1(d) => {
                    (read_name(d.type_name_rva), read_name(d.object_name_rva))
                }
                HandleDescriptorVariant::V2(d) => {
                    (read_name(d.type_name_rva), read_name(d.object_name_rva))
                }
                HandleDescriptorVariant::Unknown(_) => (None, None),
            };
            handles.push(DumpHandle {
                raw,
                type_name,
                object_name,
            });
        }
        Ok(DumpHandleData { handles })
    }
}

/// A module's Crashpad annotations.
#[derive(Debug, Clone, Default)]
pub struct CrashpadModuleAnnotations {
    /// Index of the module in the module-list stream.
    pub module_index: usize,
    pub list_annotations: Vec<String>,
    pub simple_annotations: HashMap<String, String>,
}

/// The Crashpad-info stream.
#[derive(Debug, Clone)]
pub struct DumpCrashpadInfo {
    pub raw: md::RawCrashpadInfo,
    pub simple_annotations: HashMap<String, String>,
    pub module_annotations: Vec<CrashpadModuleAnnotations>,
}

fn read_crashpad_string(all: &[u8], rva: md::Rva, endian: scroll::Endian) -> Option<String> {
    let mut offset = rva as usize;
    read_string_utf8(&mut offset, all, endian).map(String::from)
}

fn read_simple_string_dictionary(
    all: &[u8],
    location: &md::LocationDescriptor,
    endian: scroll::Endian,
) -> Result<HashMap<String, String>, Error> {
    let mut dictionary = HashMap::new();
    if location.data_size == 0 {
        return Ok(dictionary);
    }
    let data = location_slice(all, location)?;
    let mut offset = 0;
    let count: u32 = data
        .gread_with(&mut offset, endian)
        .or(Err(Error::StreamReadFailure))?;
    for _ in 0..count {
        let entry: md::SimpleStringDictionaryEntry = data
            .gread_with(&mut offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        let key = read_crashpad_string(all, entry.key, endian).ok_or(Error::StreamReadFailure)?;
        let value =
            read_crashpad_string(all, entry.value, endian).ok_or(Error::StreamReadFailure)?;
        dictionary.insert(key, value);
    }
    Ok(dictionary)
}

fn read_string_list(
    all: &[u8],
    location: &md::LocationDescriptor,
    endian: scroll::Endian,
) -> Result<Vec<String>, Error> {
    let mut strings = Vec::new();
    if location.data_size == 0 {
        return Ok(strings);
    }
    let data = location_slice(all, location)?;
    let mut offset = 0;
    let count: u32 = data
        .gread_with(&mut offset, endian)
        .or(Err(Error::StreamReadFailure))?;
    for _ in 0..count {
        let rva: md::Rva = data
            .gread_with(&mut offset, endian)
            .or(Err(Error::StreamReadFailure))?;
        strings.push(read_crashpad_string(all, rva, endian).ok_or(Error::StreamReadFailure)?);
    }
    Ok(strings)
}

impl<'a> DumpStream<'a> for DumpCrashpadInfo {
    const STREAM_TYPE: u32 = StreamKind::CrashpadInfo as u32;

    fn read(
        bytes: &'a [u8],
        all: &'a [u8],
        endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        let raw: md::RawCrashpadInfo = bytes
            .pread_with(0, endian)
            .or(Err(Error::StreamReadFailure))?;
        if raw.version == 0 || raw.version > md::RawCrashpadInfo::VERSION {
            return Err(Error::BadStreamVersion);
        }
        let simple_annotations =
            read_simple_string_dictionary(all, &raw.simple_annotations, endian)?;

        let mut module_annotations = vec![];
        if raw.module_list.data_size != 0 {
            let data = location_slice(all, &raw.module_list)?;
            let mut offset = 0;
            let count: u32 = data
                .gread_with(&mut offset, endian)
                .or(Err(Error::StreamReadFailure))?;
            for _ in 0..count {
                let link: md::CrashpadModuleInfoLink = data
                    .gread_with(&mut offset, endian)
                    .or(Err(Error::StreamReadFailure))?;
                let info_data = location_slice(all, &link.location)?;
                let info: md::CrashpadModuleInfo = info_data
                    .pread_with(0, endian)
                    .or(Err(Error::StreamReadFailure))?;
                module_annotations.push(CrashpadModuleAnnotations {
                    module_index: link.module_list_index as usize,
                    list_annotations: read_string_list(all, &info.list_annotations, endian)?,
                    simple_annotations: read_simple_string_dictionary(
                        all,
                        &info.simple_annotations,
                        endian,
                    )?,
                });
            }
        }
        Ok(DumpCrashpadInfo {
            raw,
            simple_annotations,
            module_annotations,
        })
    }
}

/// One parsed `/proc/<pid>/maps` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxMapInfo {
    /// First address the mapping covers.
    pub base_address: u64,
    /// One past the last address the mapping covers.
    pub final_address: u64,
    pub is_read: bool,
    pub is_write: bool,
    pub is_exec: bool,
    /// The pathname column, if any (file path, `[stack]`, `[heap]`, ...).
    pub pathname: Option<String>,
}

/// The captured `/proc/<pid>/maps` of a Linux process.
#[derive(Debug, Clone)]
pub struct DumpLinuxMaps {
    regions: Vec<LinuxMapInfo>,
    regions_by_addr: RangeMap<u64, usize>,
}

impl Default for DumpLinuxMaps {
    fn default() -> Self {
        DumpLinuxMaps {
            regions: vec![],
            regions_by_addr: RangeMap::new(),
        }
    }
}

impl DumpLinuxMaps {
    /// The mapping covering `address`, if any.
    pub fn memory_info_at_address(&self, address: u64) -> Option<&LinuxMapInfo> {
        self.regions_by_addr
            .get(address)
            .map(|&index| &self.regions[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinuxMapInfo> {
        self.regions.iter()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

fn parse_maps_line(line: &str) -> Option<LinuxMapInfo> {
    // e.g. "7f01dc09a000-7f01dc09b000 r-xp 00000000 08:01 1234 /lib/ld.so"
    let mut fields = line.split_ascii_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let (base, limit) = range.split_once('-')?;
    let base_address = u64::from_str_radix(base, 16).ok()?;
    let final_address = u64::from_str_radix(limit, 16).ok()?;
    if final_address < base_address {
        return None;
    }
    let perms = perms.as_bytes();
    let pathname = fields.nth(3).map(String::from);
    Some(LinuxMapInfo {
        base_address,
        final_address,
        is_read: perms.first() == Some(&b'r'),
        is_write: perms.get(1) == Some(&b'w'),
        is_exec: perms.get(2) == Some(&b'x'),
        pathname,
    })
}

impl<'a> DumpStream<'a> for DumpLinuxMaps {
    const STREAM_TYPE: u32 = StreamKind::LinuxMaps as u32;

    fn read(
        bytes: &'a [u8],
        _all: &'a [u8],
        _endian: scroll::Endian,
        _system_info: Option<&DumpSystemInfo>,
    ) -> Result<Self, Error> {
        use debris_format::range::IntoRangeMapSafe;
        let text = String::from_utf8_lossy(bytes);
        let regions: Vec<LinuxMapInfo> = text.lines().filter_map(parse_maps_line).collect();
        let regions_by_addr = regions
            .iter()
            .enumerate()
            .map(|(i, map)| {
                let range = (map.final_address > map.base_address)
                    .then(|| Range::new(map.base_address, map.final_address - 1));
                (range, i)
            })
            .into_rangemap_safe();
        Ok(DumpLinuxMaps {
            regions,
            regions_by_addr,
        })
    }
}

// The remaining Linux streams are raw procfs text; expose the bytes plus a
// key/value iterator and let callers pick out what they need.
macro_rules! linux_text_stream {
    ($(#[$attr:meta])* $name:ident, $kind:ident, $separator:literal) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Default)]
        pub struct $name<'a> {
            data: &'a [u8],
        }

        impl<'a> $name<'a> {
            /// The raw bytes of the stream.
            pub fn raw_bytes(&self) -> &'a [u8] {
                self.data
            }

            /// Iterate the stream as key/value pairs.
            pub fn iter(&self) -> impl Iterator<Item = (Cow<'a, str>, Cow<'a, str>)> {
                linux_list_iter(self.data, $separator)
            }
        }

        impl<'a> DumpStream<'a> for $name<'a> {
            const STREAM_TYPE: u32 = StreamKind::$kind as u32;

            fn read(
                bytes: &'a [u8],
                _all: &'a [u8],
                _endian: scroll::Endian,
                _system_info: Option<&DumpSystemInfo>,
            ) -> Result<Self, Error> {
                Ok($name { data: bytes })
            }
        }
    };
}

linux_text_stream!(
    /// The captured `/proc/cpuinfo`.
    DumpLinuxCpuInfo, LinuxCpuInfo, b':');
linux_text_stream!(
    /// The captured `/etc/lsb-release` (or os-release).
    DumpLinuxLsbRelease, LinuxLsbRelease, b'=');
linux_text_stream!(
    /// The captured `/proc/self/environ`.
    DumpLinuxEnviron, LinuxEnviron, b'=');
linux_text_stream!(
    /// The captured `/proc/self/status`.
    DumpLinuxProcStatus, LinuxProcStatus, b':');

/// A directory entry whose stream type this crate has no decoder for.
#[derive(Debug)]
pub struct DumpUnknownStream {
    pub stream_type: u32,
    pub location: md::LocationDescriptor,
    pub vendor: &'static str,
}

fn stream_vendor(stream_type: u32) -> &'static str {
    if stream_type <= StreamKind::LastReserved as u32 {
        "Official"
    } else {
        match stream_type & 0xffff0000 {
            0x4767_0000 => "Breakpad Extension",
            0x4350_0000 => "Crashpad Extension",
            _ => "Unknown Extension",
        }
    }
}

impl<'a> Dump<'a, Mmap> {
    /// Map a minidump from a file on disk.
    pub fn read_path<P>(path: P) -> Result<Dump<'a, Mmap>, Error>
    where
        P: AsRef<Path>,
    {
        let f = File::open(path).or(Err(Error::FileNotFound))?;
        let mmap = unsafe { Mmap::map(&f).or(Err(Error::IoError))? };
        Dump::read(mmap)
    }
}

impl<'a, T> Dump<'a, T>
where
    T: Deref<Target = [u8]> + 'a,
{
    /// Parse the header and stream directory from `data`.
    ///
    /// The file format is little-endian; a byte-swapped signature is taken
    /// as a dump written by a big-endian producer and read accordingly.
    pub fn read(data: T) -> Result<Dump<'a, T>, Error> {
        let mut offset = 0;
        let mut endian = LE;
        let mut header: md::RawHeader = data
            .gread_with(&mut offset, endian)
            .or(Err(Error::Truncated))?;
        if header.signature != md::DUMP_SIGNATURE {
            if header.signature.swap_bytes() != md::DUMP_SIGNATURE {
                return Err(Error::BadSignature);
            }
            endian = BE;
            offset = 0;
            header = data
                .gread_with(&mut offset, endian)
                .or(Err(Error::Truncated))?;
        }
        if (header.version & 0x0000ffff) != md::DUMP_VERSION {
            return Err(Error::BadVersion);
        }

        offset = header.stream_directory_rva as usize;
        ensure_count_in_bound(
            &data,
            header.stream_count as usize,
            md::RawDirectory::size_with(&endian),
            offset,
        )
        .map_err(|_| Error::MissingDirectory)?;

        let mut streams = HashMap::with_capacity(header.stream_count as usize);
        for i in 0..header.stream_count {
            let dir: md::RawDirectory = data
                .gread_with(&mut offset, endian)
                .or(Err(Error::MissingDirectory))?;
            if let Some((old_index, old_dir)) = streams.insert(dir.stream_type, (i, dir.clone())) {
                warn!(
                    "duplicate stream type {:#x} at directory indices {} ({} bytes) and {} ({} bytes), using the latter",
                    dir.stream_type,
                    old_index,
                    old_dir.location.data_size,
                    i,
                    dir.location.data_size,
                );
            }
        }

        let system_info = streams
            .get(&DumpSystemInfo::STREAM_TYPE)
            .and_then(|(_, dir)| {
                let all = data.deref();
                let bytes = location_slice(all, &dir.location).ok()?;
                DumpSystemInfo::read(bytes, all, endian, None).ok()
            });

        Ok(Dump {
            data,
            header,
            streams,
            system_info,
            endian,
            _phantom: PhantomData,
        })
    }

    /// Decode the stream `S`, if the dump carries one.
    ///
    /// An absent stream is [`Error::StreamNotFound`]; each well-known type
    /// appears at most once.
    pub fn get_stream<S>(&'a self) -> Result<S, Error>
    where
        S: DumpStream<'a>,
    {
        let bytes = self.get_raw_stream(S::STREAM_TYPE)?;
        let all = self.data.deref();
        S::read(bytes, all, self.endian, self.system_info.as_ref())
    }

    /// The raw bytes of any stream, known or not.
    pub fn get_raw_stream(&'a self, stream_type: u32) -> Result<&'a [u8], Error> {
        match self.streams.get(&stream_type) {
            None => Err(Error::StreamNotFound(stream_type)),
            Some((_, dir)) => location_slice(self.data.deref(), &dir.location),
        }
    }

    /// Iterate every directory entry as `(stream_type, bytes)`.
    ///
    /// Entries whose location falls outside the file are skipped; each
    /// yielded slice is validated to lie entirely within it.
    pub fn streams(&'a self) -> impl Iterator<Item = (u32, &'a [u8])> {
        let all = self.data.deref();
        self.streams.iter().filter_map(move |(&stream_type, (_, dir))| {
            let bytes = location_slice(all, &dir.location).ok()?;
            Some((stream_type, bytes))
        })
    }

    /// Whether a stream of `stream_type` is present.
    pub fn has_stream(&self, stream_type: u32) -> bool {
        self.streams.contains_key(&stream_type)
    }

    /// When the dump was written.
    pub fn written_at(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.header.time_date_stamp as u64)
    }

    /// Every captured memory region, merged across both memory lists.
    ///
    /// This parses both streams; callers doing repeated lookups should hold
    /// on to the returned list rather than re-request it.
    pub fn memory(&'a self) -> UnifiedMemoryList<'a> {
        let list = self.get_stream::<DumpMemoryList>().unwrap_or_default();
        let list64 = self.get_stream::<DumpMemory64List>().unwrap_or_default();
        UnifiedMemoryList::new(&list, &list64)
    }

    /// The captured region containing `address`, searching both memory
    /// lists. See [`Dump::memory`] about reuse.
    pub fn get_memory(&'a self, address: u64) -> Option<MemoryRegion<'a>> {
        self.memory().memory_at_address(address)
    }

    /// Directory entries this reader has no decoder for.
    pub fn unknown_streams(&self) -> impl Iterator<Item = DumpUnknownStream> + '_ {
        self.streams.values().filter_map(|(_, stream)| {
            if StreamKind::from_u32(stream.stream_type).is_none() {
                return Some(DumpUnknownStream {
                    stream_type: stream.stream_type,
                    location: stream.location,
                    vendor: stream_vendor(stream.stream_type),
                });
            }
            None
        })
    }

    // Convenience accessors, one per well-known stream. Absence is not an
    // error at this level.

    pub fn system_info(&'a self) -> Option<DumpSystemInfo> {
        self.get_stream().ok()
    }

    pub fn modules(&'a self) -> Option<DumpModuleList> {
        self.get_stream().ok()
    }

    pub fn unloaded_modules(&'a self) -> Option<DumpUnloadedModuleList> {
        self.get_stream().ok()
    }

    pub fn threads(&'a self) -> Option<DumpThreadList<'a>> {
        self.get_stream().ok()
    }

    pub fn thread_names(&'a self) -> Option<DumpThreadNames> {
        self.get_stream().ok()
    }

    pub fn memory_list(&'a self) -> Option<DumpMemoryList<'a>> {
        self.get_stream().ok()
    }

    pub fn memory64_list(&'a self) -> Option<DumpMemory64List<'a>> {
        self.get_stream().ok()
    }

    pub fn memory_info_list(&'a self) -> Option<DumpMemoryInfoList> {
        self.get_stream().ok()
    }

    pub fn exception(&'a self) -> Option<DumpException<'a>> {
        self.get_stream().ok()
    }

    pub fn misc_info(&'a self) -> Option<DumpMiscInfo> {
        self.get_stream().ok()
    }

    pub fn breakpad_info(&'a self) -> Option<DumpBreakpadInfo> {
        self.get_stream().ok()
    }

    pub fn assertion(&'a self) -> Option<DumpAssertion> {
        self.get_stream().ok()
    }

    pub fn handle_data(&'a self) -> Option<DumpHandleData> {
        self.get_stream().ok()
    }

    pub fn crashpad_info(&'a self) -> Option<DumpCrashpadInfo> {
        self.get_stream().ok()
    }

    pub fn linux_maps(&'a self) -> Option<DumpLinuxMaps> {
        self.get_stream().ok()
    }

    pub fn linux_cpu_info(&'a self) -> Option<DumpLinuxCpuInfo<'a>> {
        self.get_stream().ok()
    }

    pub fn linux_lsb_release(&'a self) -> Option<DumpLinuxLsbRelease<'a>> {
        self.get_stream().ok()
    }

    pub fn linux_environ(&'a self) -> Option<DumpLinuxEnviron<'a>> {
        self.get_stream().ok()
    }

    pub fn linux_proc_status(&'a self) -> Option<DumpLinuxProcStatus<'a>> {
        self.get_stream().ok()
    }

    /// Write a description of the header and directory.
    pub fn print<W: Write>(&self, f: &mut W) -> io::Result<()> {
        fn stream_name(stream_type: u32) -> Cow<'static, str> {
            match StreamKind::from_u32(stream_type) {
                Some(kind) => Cow::Owned(format!("{kind:?}")),
                None => Cow::Borrowed("unknown"),
            }
        }
        writeln!(
            f,
            "Header\n  signature            = {:#x}\n  version              = {:#x}\n  stream_count         = {}\n  stream_directory_rva = {:#x}\n  time_date_stamp      = {:#x} {}\n  flags                = {:#x}\n",
            self.header.signature,
            self.header.version,
            self.header.stream_count,
            self.header.stream_directory_rva,
            self.header.time_date_stamp,
            format_time_t(self.header.time_date_stamp),
            self.header.flags,
        )?;
        let mut streams: Vec<_> = self.streams.iter().collect();
        streams.sort_by_key(|&(_, &(i, _))| i);
        for (_, (i, stream)) in streams {
            writeln!(
                f,
                "directory[{}] type {:#x} ({}) size {} rva {:#x}",
                i,
                stream.stream_type,
                stream_name(stream.stream_type),
                stream.location.data_size,
                stream.location.rva,
            )?;
        }
        writeln!(f)
    }
}

impl fmt::Display for ModuleOverlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module {} overlapped by module {}",
            self.kept, self.dropped
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bad_signature() {
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert_eq!(Dump::read(&bytes[..]).err(), Some(Error::BadSignature));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = b"MDMP".to_vec();
        assert_eq!(Dump::read(&bytes[..]).err(), Some(Error::Truncated));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(b"MDMP");
        bytes[4..8].copy_from_slice(&0xdead0000u32.to_le_bytes());
        assert_eq!(Dump::read(&bytes[..]).err(), Some(Error::BadVersion));
    }

    #[test]
    fn test_module_overlap_keeps_first() {
        let list = DumpModuleList::from_modules(vec![
            DumpModule::new(0x1000, 0x1000, "first"),
            DumpModule::new(0x1800, 0x1000, "second"),
            DumpModule::new(0x4000, 0x1000, "third"),
        ]);
        assert_eq!(list.module_at_address(0x1900).unwrap().name, "first");
        assert_eq!(list.module_at_address(0x4100).unwrap().name, "third");
        assert_eq!(
            list.overlaps(),
            &[ModuleOverlap {
                kept: 0,
                dropped: 1
            }]
        );
    }

    #[test]
    fn test_module_lookup_misses() {
        let list = DumpModuleList::from_modules(vec![DumpModule::new(0x1000, 0x1000, "only")]);
        assert!(list.module_at_address(0xfff).is_none());
        assert!(list.module_at_address(0x2000).is_none());
        assert_eq!(list.main_module().unwrap().name, "only");
    }

    #[test]
    fn test_empty_memory_region_lookup() {
        let list = DumpMemoryList::from_regions(vec![DumpMemory {
            desc: Default::default(),
            base_address: 0x1000,
            size: 0,
            bytes: &[],
        }]);
        // Zero-sized regions never match any address.
        assert!(list.memory_at_address(0x1000).is_none());
    }
}
