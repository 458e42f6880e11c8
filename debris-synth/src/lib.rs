//! Synthetic minidumps for testing.
//!
//! This deliberately does not reuse `debris-format`'s `scroll` derives for
//! writing; streams are laid out field by field with `test_assembler` so
//! that a layout mistake in the reader and the writer can't cancel out.
//!
//! Build a [`SynthDump`], add streams to it, then `finish()` to get the
//! file bytes.

#![allow(missing_debug_implementations)]

use std::marker::PhantomData;
use std::mem;

use debris_format::format as md;
use scroll::ctx::SizeWith;
use scroll::LE;
use test_assembler::*;

/// A writer of synthetic minidumps.
pub struct SynthDump {
    /// The section accumulating the whole file.
    section: Section,
    flags: Label,
    stream_count: u32,
    stream_count_label: Label,
    stream_directory_rva: Label,
    stream_directory: Section,
    system_info: Option<SystemInfo>,
    exception: Option<Exception>,
    misc_info: Option<MiscStream>,
    module_list: Option<ListStream<Module>>,
    unloaded_module_list: Option<ExListStream<UnloadedModule>>,
    thread_list: Option<ListStream<Thread>>,
    thread_names_list: Option<ListStream<ThreadName>>,
    memory_list: Option<ListStream<Section>>,
    memory64_list: Option<Memory64ListStream>,
    memory64_section: Option<Section>,
    simple_streams: Vec<SimpleStream>,
}

/// A block of data within the synthetic dump.
pub trait DumpSection {
    /// This block's offset from the start of the file.
    fn file_offset(&self) -> Label;
    /// This block's size in bytes.
    fn file_size(&self) -> Label;
}

/// A list entry plus optional out-of-band data serialized after the list.
pub trait ListItem: DumpSection {
    fn into_sections(self) -> (Section, Option<Section>);
}

impl<T> ListItem for T
where
    T: Into<Section> + DumpSection,
{
    fn into_sections(self) -> (Section, Option<Section>) {
        (self.into(), None)
    }
}

/// Writes a `LocationDescriptor` (size + rva) referring to a section.
pub trait CiteLocation {
    fn cite_location_in(&self, section: Section) -> Section;
}

impl<T: DumpSection> CiteLocation for T {
    fn cite_location_in(&self, section: Section) -> Section {
        section.D32(self.file_size()).D32(self.file_offset())
    }
}

impl CiteLocation for (Label, Label) {
    fn cite_location_in(&self, section: Section) -> Section {
        section.D32(&self.0).D32(&self.1)
    }
}

impl<T: CiteLocation> CiteLocation for Option<T> {
    fn cite_location_in(&self, section: Section) -> Section {
        match *self {
            Some(ref inner) => inner.cite_location_in(section),
            None => section.D32(0).D32(0),
        }
    }
}

/// Chainable citation helpers on `Section`.
pub trait SectionExtra {
    fn cite_location<T: CiteLocation>(self, thing: &T) -> Self;
    fn cite_memory(self, memory: &Memory) -> Self;
}

impl SectionExtra for Section {
    fn cite_location<T: CiteLocation>(self, thing: &T) -> Self {
        thing.cite_location_in(self)
    }
    fn cite_memory(self, memory: &Memory) -> Self {
        memory.cite_memory_in(self)
    }
}

/// A stream that knows its directory entry type.
pub trait Stream: DumpSection + Into<Section> {
    fn stream_type(&self) -> u32;

    fn cite_stream_in(&self, section: Section) -> Section {
        section.D32(self.stream_type()).cite_location(self)
    }
}

impl SynthDump {
    /// A little-endian dump.
    pub fn new() -> SynthDump {
        SynthDump::with_endian(Endian::Little)
    }

    pub fn with_endian(endian: Endian) -> SynthDump {
        let flags = Label::new();
        let stream_count_label = Label::new();
        let stream_directory_rva = Label::new();
        let section = Section::with_endian(endian)
            .D32(md::DUMP_SIGNATURE)
            .D32(md::DUMP_VERSION)
            .D32(&stream_count_label)
            .D32(&stream_directory_rva)
            .D32(0) // checksum
            .D32(1262805309) // time_date_stamp, arbitrary
            .D64(&flags);
        section.start().set_const(0);
        assert_eq!(section.size(), md::RawHeader::size_with(&LE) as u64);
        let memory64_section = Section::with_endian(endian);

        SynthDump {
            section,
            flags,
            stream_count: 0,
            stream_count_label,
            stream_directory_rva,
            stream_directory: Section::with_endian(endian),
            system_info: None,
            exception: None,
            misc_info: None,
            module_list: Some(ListStream::new(md::StreamKind::ModuleList, endian)),
            unloaded_module_list: Some(ExListStream::new(
                md::StreamKind::UnloadedModuleList,
                md::RawUnloadedModule::size_with(&LE),
                endian,
            )),
            thread_list: Some(ListStream::new(md::StreamKind::ThreadList, endian)),
            thread_names_list: Some(ListStream::new(md::StreamKind::ThreadNames, endian)),
            memory_list: Some(ListStream::new(md::StreamKind::MemoryList, endian)),
            memory64_list: Some(Memory64ListStream::new(
                endian,
                &memory64_section.file_offset(),
            )),
            memory64_section: Some(memory64_section),
            simple_streams: vec![],
        }
    }

    /// Set the header flags.
    pub fn flags(self, flags: u64) -> SynthDump {
        self.flags.set_const(flags);
        self
    }

    /// Append `section` to the file, marking its offset.
    #[allow(clippy::should_implement_trait)]
    pub fn add<T>(mut self, section: T) -> SynthDump
    where
        T: DumpSection + Into<Section>,
    {
        let offset = section.file_offset();
        self.section = self.section.mark(&offset).append_section(section);
        self
    }

    pub fn add_module(mut self, module: Module) -> SynthDump {
        self.module_list = self.module_list.take().map(|list| list.add(module));
        self
    }

    pub fn add_unloaded_module(mut self, module: UnloadedModule) -> SynthDump {
        self.unloaded_module_list = self
            .unloaded_module_list
            .take()
            .map(|list| list.add(module));
        self
    }

    pub fn add_thread(mut self, thread: Thread) -> SynthDump {
        self.thread_list = self.thread_list.take().map(|list| list.add(thread));
        self
    }

    pub fn add_thread_name(mut self, thread_name: ThreadName) -> SynthDump {
        self.thread_names_list = self
            .thread_names_list
            .take()
            .map(|list| list.add(thread_name));
        self
    }

    /// Add a memory region, citing it in the memory-list stream.
    pub fn add_memory(mut self, memory: Memory) -> SynthDump {
        let descriptor = memory.cite_memory_in(Section::with_endian(self.section.endian));
        self.memory_list = self.memory_list.take().map(|list| list.add(descriptor));
        self.add(memory)
    }

    /// Add a memory region to the 64-bit memory list.
    pub fn add_memory64(mut self, memory: Memory) -> SynthDump {
        self.memory64_list = self
            .memory64_list
            .take()
            .map(|list| list.add_memory(&memory));
        self.memory64_section = self
            .memory64_section
            .take()
            .map(|section| section.append_section(memory.section));
        self
    }

    pub fn add_system_info(mut self, system_info: SystemInfo) -> Self {
        self.system_info = Some(system_info);
        self
    }

    pub fn add_exception(mut self, exception: Exception) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn add_misc_info(mut self, misc: MiscStream) -> Self {
        self.misc_info = Some(misc);
        self
    }

    /// Add an arbitrary byte stream (Linux procfs streams etc).
    pub fn add_simple_stream<S: Into<u32>>(mut self, stream_type: S, bytes: &[u8]) -> Self {
        self.simple_streams.push(SimpleStream {
            stream_type: stream_type.into(),
            section: Section::new().append_bytes(bytes),
        });
        self
    }

    /// Append `stream` and its directory entry.
    pub fn add_stream<T: Stream>(mut self, stream: T) -> SynthDump {
        self.stream_directory = stream.cite_stream_in(self.stream_directory);
        self.stream_count += 1;
        self.add(stream)
    }

    fn finish_list<T: ListItem>(self, list: Option<ListStream<T>>) -> SynthDump {
        match list {
            Some(l) if !l.is_empty() => self.add_stream(l),
            _ => self,
        }
    }

    fn finish_ex_list<T: ListItem>(self, list: Option<ExListStream<T>>) -> SynthDump {
        match list {
            Some(l) if !l.is_empty() => self.add_stream(l),
            _ => self,
        }
    }

    /// Serialize the dump.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        let modules = self.module_list.take();
        self = self.finish_list(modules);
        let unloaded = self.unloaded_module_list.take();
        self = self.finish_ex_list(unloaded);
        let memories = self.memory_list.take();
        self = self.finish_list(memories);
        if let Some(memories64) = self.memory64_list.take() {
            if !memories64.is_empty() {
                self = self.add_stream(memories64);
            }
        }
        let threads = self.thread_list.take();
        self = self.finish_list(threads);
        let thread_names = self.thread_names_list.take();
        self = self.finish_list(thread_names);
        if let Some(stream) = self.system_info.take() {
            self = self.add_stream(stream);
        }
        if let Some(stream) = self.exception.take() {
            self = self.add_stream(stream);
        }
        if let Some(stream) = self.misc_info.take() {
            self = self.add_stream(stream);
        }
        let simple = mem::take(&mut self.simple_streams);
        for stream in simple {
            self = self.add_stream(stream);
        }
        if let Some(memory64_section) = self.memory64_section.take() {
            self = self.add(memory64_section);
        }

        let SynthDump {
            section,
            flags,
            stream_count,
            stream_count_label,
            stream_directory_rva,
            stream_directory,
            ..
        } = self;
        if flags.value().is_none() {
            flags.set_const(0);
        }
        stream_count_label.set_const(stream_count as u64);
        section
            .mark(&stream_directory_rva)
            .append_section(stream_directory)
            .get_contents()
    }
}

impl Default for SynthDump {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpSection for Section {
    fn file_offset(&self) -> Label {
        self.start()
    }

    fn file_size(&self) -> Label {
        self.final_size()
    }
}

macro_rules! impl_dumpsection {
    ( $x:ty ) => {
        impl DumpSection for $x {
            fn file_offset(&self) -> Label {
                self.section.file_offset()
            }
            fn file_size(&self) -> Label {
                self.section.file_size()
            }
        }
    };
}

/// A stream of arbitrary bytes.
pub struct SimpleStream {
    pub stream_type: u32,
    pub section: Section,
}

impl From<SimpleStream> for Section {
    fn from(stream: SimpleStream) -> Self {
        stream.section
    }
}

impl_dumpsection!(SimpleStream);

impl Stream for SimpleStream {
    fn stream_type(&self) -> u32 {
        self.stream_type
    }
}

/// A `u32`-counted list with out-of-band data appended after the entries.
pub struct List<T: ListItem> {
    section: Section,
    count: u32,
    count_label: Label,
    out_of_band: Section,
    _type: PhantomData<T>,
}

impl<T: ListItem> List<T> {
    pub fn new(endian: Endian) -> Self {
        let count_label = Label::new();
        List {
            section: Section::with_endian(endian).D32(&count_label),
            count_label,
            count: 0,
            out_of_band: Section::with_endian(endian),
            _type: PhantomData,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, entry: T) -> Self {
        self.count += 1;
        let (section, out_of_band) = entry.into_sections();
        self.section = self
            .section
            .mark(&section.file_offset())
            .append_section(section);
        if let Some(out_of_band) = out_of_band {
            self.out_of_band = self
                .out_of_band
                .mark(&out_of_band.file_offset())
                .append_section(out_of_band);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T: ListItem> From<List<T>> for Section {
    fn from(list: List<T>) -> Self {
        list.count_label.set_const(list.count as u64);
        list.section
            .mark(&list.out_of_band.file_offset())
            .append_section(list.out_of_band)
    }
}

impl<T: ListItem> DumpSection for List<T> {
    fn file_offset(&self) -> Label {
        self.section.file_offset()
    }

    fn file_size(&self) -> Label {
        self.section.file_size()
    }
}

/// A [`List`] that is also a stream.
pub struct ListStream<T: ListItem> {
    stream_type: u32,
    list: List<T>,
}

impl<T: ListItem> ListStream<T> {
    pub fn new<S: Into<u32>>(stream_type: S, endian: Endian) -> Self {
        Self {
            stream_type: stream_type.into(),
            list: List::new(endian),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, entry: T) -> Self {
        self.list = self.list.add(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl<T: ListItem> From<ListStream<T>> for Section {
    fn from(stream: ListStream<T>) -> Self {
        stream.list.into()
    }
}

impl<T: ListItem> DumpSection for ListStream<T> {
    fn file_offset(&self) -> Label {
        self.list.file_offset()
    }

    fn file_size(&self) -> Label {
        self.list.file_size()
    }
}

impl<T: ListItem> Stream for ListStream<T> {
    fn stream_type(&self) -> u32 {
        self.stream_type
    }
}

/// A list with the extended header (`size_of_header`/`size_of_entry`/count).
pub struct ExList<T: ListItem> {
    section: Section,
    count: u32,
    count_label: Label,
    out_of_band: Section,
    _type: PhantomData<T>,
}

impl<T: ListItem> ExList<T> {
    pub fn new(size_of_entry: usize, endian: Endian) -> Self {
        let count_label = Label::new();
        let section = Section::with_endian(endian)
            .D32(12)
            .D32(size_of_entry as u32)
            .D32(&count_label);
        ExList {
            section,
            count_label,
            count: 0,
            out_of_band: Section::with_endian(endian),
            _type: PhantomData,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, entry: T) -> Self {
        self.count += 1;
        let (section, out_of_band) = entry.into_sections();
        self.section = self
            .section
            .mark(&section.file_offset())
            .append_section(section);
        if let Some(out_of_band) = out_of_band {
            self.out_of_band = self
                .out_of_band
                .mark(&out_of_band.file_offset())
                .append_section(out_of_band);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T: ListItem> From<ExList<T>> for Section {
    fn from(list: ExList<T>) -> Self {
        list.count_label.set_const(list.count as u64);
        list.section
            .mark(&list.out_of_band.file_offset())
            .append_section(list.out_of_band)
    }
}

impl<T: ListItem> DumpSection for ExList<T> {
    fn file_offset(&self) -> Label {
        self.section.file_offset()
    }

    fn file_size(&self) -> Label {
        self.section.file_size()
    }
}

/// An [`ExList`] that is also a stream.
pub struct ExListStream<T: ListItem> {
    stream_type: u32,
    list: ExList<T>,
}

impl<T: ListItem> ExListStream<T> {
    pub fn new<S: Into<u32>>(stream_type: S, size_of_entry: usize, endian: Endian) -> Self {
        Self {
            stream_type: stream_type.into(),
            list: ExList::new(size_of_entry, endian),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, entry: T) -> Self {
        self.list = self.list.add(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl<T: ListItem> From<ExListStream<T>> for Section {
    fn from(stream: ExListStream<T>) -> Self {
        stream.list.into()
    }
}

impl<T: ListItem> DumpSection for ExListStream<T> {
    fn file_offset(&self) -> Label {
        self.list.file_offset()
    }

    fn file_size(&self) -> Label {
        self.list.file_size()
    }
}

impl<T: ListItem> Stream for ExListStream<T> {
    fn stream_type(&self) -> u32 {
        self.stream_type
    }
}

/// The 64-bit memory list stream; contents live elsewhere, packed at a
/// shared base RVA.
pub struct Memory64ListStream {
    section: Section,
    count: u64,
    count_label: Label,
}

impl Memory64ListStream {
    pub fn new(endian: Endian, memory64_rva: &Label) -> Self {
        let count_label = Label::new();
        let section = Section::with_endian(endian)
            .D64(&count_label)
            .D64(memory64_rva);
        Self {
            section,
            count: 0,
            count_label,
        }
    }

    pub fn add_memory(mut self, memory: &Memory) -> Self {
        self.count += 1;
        self.section = self.section.D64(memory.address).D64(memory.section.size());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl From<Memory64ListStream> for Section {
    fn from(list: Memory64ListStream) -> Self {
        list.count_label.set_const(list.count);
        list.section
    }
}

impl DumpSection for Memory64ListStream {
    fn file_offset(&self) -> Label {
        self.section.file_offset()
    }

    fn file_size(&self) -> Label {
        self.section.file_size()
    }
}

impl Stream for Memory64ListStream {
    fn stream_type(&self) -> u32 {
        md::StreamKind::Memory64List as u32
    }
}

/// A u32-length-prefixed UTF-16 string.
pub struct DumpString {
    section: Section,
}

impl DumpString {
    pub fn new(s: &str, endian: Endian) -> DumpString {
        let u16_s = s
            .encode_utf16()
            .fold(Vec::with_capacity(s.len() * 2), |mut v, unit| {
                match endian {
                    Endian::Little => v.extend_from_slice(&unit.to_le_bytes()),
                    Endian::Big => v.extend_from_slice(&unit.to_be_bytes()),
                }
                v
            });
        let section = Section::with_endian(endian)
            .D32(u16_s.len() as u32)
            .append_bytes(&u16_s);
        DumpString { section }
    }
}

impl From<DumpString> for Section {
    fn from(string: DumpString) -> Self {
        string.section
    }
}

impl_dumpsection!(DumpString);

/// Version info used by default for synthetic modules.
pub const STOCK_VERSION_INFO: md::FixedFileInfo = md::FixedFileInfo {
    signature: 0xfeef04bd,
    struct_version: 0x00010000,
    file_version_hi: 0x11111111,
    file_version_lo: 0x22222222,
    product_version_hi: 0x33333333,
    product_version_lo: 0x44444444,
    file_flags_mask: 1,
    file_flags: 1,
    file_os: 0x40004,
    file_type: 1,
    file_subtype: 0,
    file_date_hi: 0,
    file_date_lo: 0,
};

/// A module record.
pub struct Module {
    section: Section,
    cv_record: Option<(Label, Label)>,
    misc_record: Option<(Label, Label)>,
}

impl Module {
    pub fn new<'a, T: Into<Option<&'a md::FixedFileInfo>>>(
        endian: Endian,
        base_of_image: u64,
        size_of_image: u32,
        name: &DumpString,
        time_date_stamp: u32,
        checksum: u32,
        version_info: T,
    ) -> Module {
        let version_info = version_info.into().unwrap_or(&STOCK_VERSION_INFO);
        let section = Section::with_endian(endian)
            .D64(base_of_image)
            .D32(size_of_image)
            .D32(checksum)
            .D32(time_date_stamp)
            .D32(name.file_offset())
            .D32(version_info.signature)
            .D32(version_info.struct_version)
            .D32(version_info.file_version_hi)
            .D32(version_info.file_version_lo)
            .D32(version_info.product_version_hi)
            .D32(version_info.product_version_lo)
            .D32(version_info.file_flags_mask)
            .D32(version_info.file_flags)
            .D32(version_info.file_os)
            .D32(version_info.file_type)
            .D32(version_info.file_subtype)
            .D32(version_info.file_date_hi)
            .D32(version_info.file_date_lo);
        Module {
            section,
            cv_record: None,
            misc_record: None,
        }
    }

    pub fn cv_record<T: DumpSection>(mut self, cv_record: &T) -> Module {
        self.cv_record = Some((cv_record.file_size(), cv_record.file_offset()));
        self
    }

    pub fn misc_record<T: DumpSection>(mut self, misc_record: &T) -> Module {
        self.misc_record = Some((misc_record.file_size(), misc_record.file_offset()));
        self
    }
}

impl_dumpsection!(Module);

impl From<Module> for Section {
    fn from(module: Module) -> Self {
        let Module {
            section,
            cv_record,
            misc_record,
        } = module;
        section
            .cite_location(&cv_record)
            .cite_location(&misc_record)
            .D64(0) // reserved0
            .D64(0) // reserved1
    }
}

/// An ELF build-id CodeView record.
pub struct CvElfRecord {
    section: Section,
}

impl CvElfRecord {
    pub fn new(build_id: &[u8], endian: Endian) -> Self {
        let section = Section::with_endian(endian)
            .D32(md::CvSignature::Elf as u32)
            .append_bytes(build_id);
        CvElfRecord { section }
    }
}

impl From<CvElfRecord> for Section {
    fn from(record: CvElfRecord) -> Self {
        record.section
    }
}

impl_dumpsection!(CvElfRecord);

/// A PDB 7.0 CodeView record.
pub struct CvPdb70Record {
    section: Section,
}

impl CvPdb70Record {
    pub fn new(guid: md::Guid, age: u32, pdb_file_name: &str, endian: Endian) -> Self {
        let mut section = Section::with_endian(endian)
            .D32(md::CvSignature::Pdb70 as u32)
            .D32(guid.data1)
            .D16(guid.data2)
            .D16(guid.data3);
        section = section.append_bytes(&guid.data4);
        let section = section.append_bytes(pdb_file_name.as_bytes()).D8(0);
        CvPdb70Record { section }
    }
}

impl From<CvPdb70Record> for Section {
    fn from(record: CvPdb70Record) -> Self {
        record.section
    }
}

impl_dumpsection!(CvPdb70Record);

/// An unloaded-module record.
pub struct UnloadedModule {
    section: Section,
}

impl UnloadedModule {
    pub fn new(
        endian: Endian,
        base_of_image: u64,
        size_of_image: u32,
        name: &DumpString,
        time_date_stamp: u32,
        checksum: u32,
    ) -> UnloadedModule {
        let section = Section::with_endian(endian)
            .D64(base_of_image)
            .D32(size_of_image)
            .D32(checksum)
            .D32(time_date_stamp)
            .D32(name.file_offset());
        UnloadedModule { section }
    }
}

impl_dumpsection!(UnloadedModule);

impl From<UnloadedModule> for Section {
    fn from(module: UnloadedModule) -> Self {
        module.section
    }
}

/// A thread record.
pub struct Thread {
    section: Section,
}

impl Thread {
    pub fn new<T>(endian: Endian, id: u32, stack: &Memory, context: &T) -> Thread
    where
        T: DumpSection,
    {
        let section = Section::with_endian(endian)
            .D32(id)
            .D32(0) // suspend_count
            .D32(0) // priority_class
            .D32(0) // priority
            .D64(0) // teb
            .cite_memory(stack)
            .cite_location(context);
        Thread { section }
    }
}

impl_dumpsection!(Thread);

impl From<Thread> for Section {
    fn from(thread: Thread) -> Self {
        thread.section
    }
}

/// A thread-name record.
pub struct ThreadName {
    section: Section,
}

impl ThreadName {
    pub fn new(endian: Endian, id: u32, name: Option<&DumpString>) -> Self {
        let section = Section::with_endian(endian).D32(id);
        // Name is optional so corrupt-name handling can be tested.
        let section = match name {
            Some(name) => section.D64(name.file_offset()),
            None => section.D64(0xffff_ffff_ffff_ffff),
        };
        ThreadName { section }
    }
}

impl_dumpsection!(ThreadName);

impl From<ThreadName> for Section {
    fn from(thread: ThreadName) -> Self {
        thread.section
    }
}

/// A range of memory contents.
pub struct Memory {
    section: Section,
    pub address: u64,
}

impl Memory {
    pub fn with_section(section: Section, address: u64) -> Memory {
        Memory { section, address }
    }

    /// Write a `MemoryDescriptor` referring to this range.
    pub fn cite_memory_in(&self, section: Section) -> Section {
        section.D64(self.address).cite_location(self)
    }
}

impl_dumpsection!(Memory);

impl From<Memory> for Section {
    fn from(memory: Memory) -> Self {
        memory.section
    }
}

/// The system-info stream.
pub struct SystemInfo {
    section: Section,
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: u32,
    pub suite_mask: u16,
    pub reserved2: u16,
}

impl SystemInfo {
    pub fn new(endian: Endian) -> Self {
        Self {
            section: Section::with_endian(endian),
            processor_architecture: 0,
            processor_level: 6,
            processor_revision: 0,
            number_of_processors: 1,
            product_type: 0,
            major_version: 0,
            minor_version: 0,
            build_number: 0,
            platform_id: 0,
            csd_version_rva: 0,
            suite_mask: 0,
            reserved2: 0,
        }
    }

    pub fn set_processor_architecture(mut self, arch: u16) -> Self {
        self.processor_architecture = arch;
        self
    }

    pub fn set_platform_id(mut self, platform_id: u32) -> Self {
        self.platform_id = platform_id;
        self
    }
}

impl_dumpsection!(SystemInfo);

impl From<SystemInfo> for Section {
    fn from(info: SystemInfo) -> Self {
        info.section
            .D16(info.processor_architecture)
            .D16(info.processor_level)
            .D16(info.processor_revision)
            .D8(info.number_of_processors)
            .D8(info.product_type)
            .D32(info.major_version)
            .D32(info.minor_version)
            .D32(info.build_number)
            .D32(info.platform_id)
            .D32(info.csd_version_rva)
            .D16(info.suite_mask)
            .D16(info.reserved2)
            // The cpu-information union; zeroes are fine for any arch.
            .append_repeated(0, 24)
    }
}

impl Stream for SystemInfo {
    fn stream_type(&self) -> u32 {
        md::StreamKind::SystemInfo.into()
    }
}

/// The exception stream.
pub struct Exception {
    section: Section,
    pub thread_id: u32,
    pub exception_record: ExceptionRecord,
    /// `(size, rva)` of the exception context; absent cites a null record.
    pub thread_context: Option<(Label, Label)>,
}

#[derive(Default)]
pub struct ExceptionRecord {
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: u64,
    pub exception_address: u64,
    pub number_parameters: u32,
    pub exception_information: [u64; 15],
}

impl Exception {
    pub fn new(endian: Endian) -> Self {
        Self {
            section: Section::with_endian(endian),
            thread_id: 0,
            exception_record: ExceptionRecord::default(),
            thread_context: None,
        }
    }

    /// Point the exception's context at `context`.
    pub fn set_thread_context<T: DumpSection>(mut self, context: &T) -> Self {
        self.thread_context = Some((context.file_size(), context.file_offset()));
        self
    }
}

impl_dumpsection!(Exception);

impl From<Exception> for Section {
    fn from(info: Exception) -> Self {
        let mut section = info
            .section
            .D32(info.thread_id)
            .D32(0) // __align
            .D32(info.exception_record.exception_code)
            .D32(info.exception_record.exception_flags)
            .D64(info.exception_record.exception_record)
            .D64(info.exception_record.exception_address)
            .D32(info.exception_record.number_parameters)
            .D32(0); // __align
        for &param in &info.exception_record.exception_information {
            section = section.D64(param);
        }
        section.cite_location(&info.thread_context)
    }
}

impl Stream for Exception {
    fn stream_type(&self) -> u32 {
        md::StreamKind::Exception.into()
    }
}

/// The misc-info stream, built from whichever field groups are set.
pub struct MiscStream {
    section: Section,
    pub process_id: Option<u32>,
    pub process_times: Option<MiscFieldsProcessTimes>,
    /// Pad the stream with zeroes up to this size.
    pub pad_to_size: Option<usize>,
}

#[derive(Default)]
pub struct MiscFieldsProcessTimes {
    pub process_create_time: u32,
    pub process_user_time: u32,
    pub process_kernel_time: u32,
}

impl MiscStream {
    pub fn new(endian: Endian) -> MiscStream {
        let section = Section::with_endian(endian);
        let size = section.final_size();
        MiscStream {
            section: section.D32(size),
            process_id: None,
            process_times: None,
            pad_to_size: None,
        }
    }
}

impl From<MiscStream> for Section {
    fn from(stream: MiscStream) -> Self {
        let MiscStream {
            section,
            process_id,
            process_times,
            pad_to_size,
        } = stream;

        let mut flags = md::MiscInfoFlags::empty();
        if process_id.is_some() {
            flags |= md::MiscInfoFlags::PROCESS_ID;
        }
        if process_times.is_some() {
            flags |= md::MiscInfoFlags::PROCESS_TIMES;
        }
        let section = section.D32(flags.bits());
        let section = section.D32(process_id.unwrap_or_default());
        let section = if let Some(times) = process_times {
            section
                .D32(times.process_create_time)
                .D32(times.process_user_time)
                .D32(times.process_kernel_time)
        } else {
            section.D32(0).D32(0).D32(0)
        };

        if let Some(size) = pad_to_size {
            let padding = size as u64 - section.size();
            section.append_repeated(0, padding as usize)
        } else {
            section
        }
    }
}

impl_dumpsection!(MiscStream);

impl Stream for MiscStream {
    fn stream_type(&self) -> u32 {
        md::StreamKind::MiscInfo.into()
    }
}

/// Serializers for the CPU context layouts the tests exercise.
pub struct SynthContext;

impl SynthContext {
    /// Lay out an x86 context record.
    pub fn x86(ctx: &md::ContextX86, endian: Endian) -> Section {
        let fs = &ctx.float_save;
        let mut section = Section::with_endian(endian)
            .D32(ctx.context_flags)
            .D32(ctx.dr0)
            .D32(ctx.dr1)
            .D32(ctx.dr2)
            .D32(ctx.dr3)
            .D32(ctx.dr6)
            .D32(ctx.dr7)
            .D32(fs.control_word)
            .D32(fs.status_word)
            .D32(fs.tag_word)
            .D32(fs.error_offset)
            .D32(fs.error_selector)
            .D32(fs.data_offset)
            .D32(fs.data_selector);
        section = section.append_bytes(&fs.register_area).D32(fs.cr0_npx_state);
        section = section
            .D32(ctx.gs)
            .D32(ctx.fs)
            .D32(ctx.es)
            .D32(ctx.ds)
            .D32(ctx.edi)
            .D32(ctx.esi)
            .D32(ctx.ebx)
            .D32(ctx.edx)
            .D32(ctx.ecx)
            .D32(ctx.eax)
            .D32(ctx.ebp)
            .D32(ctx.eip)
            .D32(ctx.cs)
            .D32(ctx.eflags)
            .D32(ctx.esp)
            .D32(ctx.ss);
        section.append_bytes(&ctx.extended_registers)
    }

    /// Lay out an amd64 context record.
    pub fn amd64(ctx: &md::ContextAmd64, endian: Endian) -> Section {
        let mut section = Section::with_endian(endian)
            .D64(ctx.p1_home)
            .D64(ctx.p2_home)
            .D64(ctx.p3_home)
            .D64(ctx.p4_home)
            .D64(ctx.p5_home)
            .D64(ctx.p6_home)
            .D32(ctx.context_flags)
            .D32(ctx.mx_csr)
            .D16(ctx.cs)
            .D16(ctx.ds)
            .D16(ctx.es)
            .D16(ctx.fs)
            .D16(ctx.gs)
            .D16(ctx.ss)
            .D32(ctx.eflags)
            .D64(ctx.dr0)
            .D64(ctx.dr1)
            .D64(ctx.dr2)
            .D64(ctx.dr3)
            .D64(ctx.dr6)
            .D64(ctx.dr7)
            .D64(ctx.rax)
            .D64(ctx.rcx)
            .D64(ctx.rdx)
            .D64(ctx.rbx)
            .D64(ctx.rsp)
            .D64(ctx.rbp)
            .D64(ctx.rsi)
            .D64(ctx.rdi)
            .D64(ctx.r8)
            .D64(ctx.r9)
            .D64(ctx.r10)
            .D64(ctx.r11)
            .D64(ctx.r12)
            .D64(ctx.r13)
            .D64(ctx.r14)
            .D64(ctx.r15)
            .D64(ctx.rip);
        section = section.append_bytes(&ctx.float_save);
        for reg in &ctx.vector_register {
            section = section.append_bytes(&reg.to_le_bytes());
        }
        section
            .D64(ctx.vector_control)
            .D64(ctx.debug_control)
            .D64(ctx.last_branch_to_rip)
            .D64(ctx.last_branch_from_rip)
            .D64(ctx.last_exception_to_rip)
            .D64(ctx.last_exception_from_rip)
    }

    /// Lay out an aarch64 context record.
    pub fn arm64(ctx: &md::ContextArm64, endian: Endian) -> Section {
        let mut section = Section::with_endian(endian)
            .D32(ctx.context_flags)
            .D32(ctx.cpsr);
        for reg in &ctx.iregs {
            section = section.D64(*reg);
        }
        section = section.D64(ctx.pc);
        for reg in &ctx.float_save.regs {
            section = section.append_bytes(&reg.to_le_bytes());
        }
        section = section.D32(ctx.float_save.fpsr).D32(ctx.float_save.fpcr);
        for reg in &ctx.bcr {
            section = section.D32(*reg);
        }
        for reg in &ctx.bvr {
            section = section.D64(*reg);
        }
        for reg in &ctx.wcr {
            section = section.D32(*reg);
        }
        for reg in &ctx.wvr {
            section = section.D64(*reg);
        }
        section
    }

    /// Lay out an Arm context record.
    pub fn arm(ctx: &md::ContextArm, endian: Endian) -> Section {
        let mut section = Section::with_endian(endian).D32(ctx.context_flags);
        for reg in &ctx.iregs {
            section = section.D32(*reg);
        }
        section = section.D32(ctx.cpsr).D64(ctx.float_save.fpscr);
        for reg in &ctx.float_save.regs {
            section = section.D64(*reg);
        }
        for extra in &ctx.float_save.extra {
            section = section.D32(*extra);
        }
        section
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dump_header() {
        let dump = SynthDump::with_endian(Endian::Little).flags(0x9f738b33685cc84c);
        assert_eq!(
            dump.finish().unwrap(),
            vec![
                0x4d, 0x44, 0x4d, 0x50, // signature
                0x93, 0xa7, 0x00, 0x00, // version
                0, 0, 0, 0, // stream count
                0x20, 0, 0, 0, // directory RVA
                0, 0, 0, 0, // checksum
                0x3d, 0xe1, 0x44, 0x4b, // time_date_stamp
                0x4c, 0xc8, 0x5c, 0x68, // flags
                0x33, 0x8b, 0x73, 0x9f,
            ]
        );
    }

    #[test]
    fn test_dump_string() {
        let dump = SynthDump::with_endian(Endian::Little);
        let s = DumpString::new("hello", Endian::Little);
        let contents = dump.add(s).finish().unwrap();
        assert_eq!(
            &contents[md::RawHeader::size_with(&LE)..],
            &[
                0xa, 0x0, 0x0, 0x0, // length
                b'h', 0x0, b'e', 0x0, b'l', 0x0, b'l', 0x0, b'o', 0x0
            ]
        );
    }

    #[test]
    fn test_synth_context_sizes() {
        let x86 = SynthContext::x86(&md::ContextX86::default(), Endian::Little);
        assert_eq!(x86.size() as usize, md::ContextX86::size_with(&LE));
        let amd64 = SynthContext::amd64(&md::ContextAmd64::default(), Endian::Little);
        assert_eq!(amd64.size() as usize, md::ContextAmd64::size_with(&LE));
        let arm64 = SynthContext::arm64(&md::ContextArm64::default(), Endian::Little);
        assert_eq!(arm64.size() as usize, md::ContextArm64::size_with(&LE));
        let arm = SynthContext::arm(&md::ContextArm::default(), Endian::Little);
        assert_eq!(arm.size() as usize, md::ContextArm::size_with(&LE));
    }
}
