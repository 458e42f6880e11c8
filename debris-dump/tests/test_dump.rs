//! Reader integration tests over synthetic minidumps.

use test_assembler::*;

use debris_dump::format as md;
use debris_dump::*;

const X86_ARCH: u16 = md::ProcessorArchitecture::Intel as u16;
const ARM64_ARCH: u16 = md::ProcessorArchitecture::Arm64 as u16;
const LINUX: u32 = md::PlatformId::Linux as u32;

use debris_synth::{
    CvElfRecord, DumpSection, DumpString, Exception, Memory, MiscStream, Module as SynthModule,
    SynthContext, SynthDump, SystemInfo, Thread, ThreadName, UnloadedModule,
};

fn read_synth_dump(dump: SynthDump) -> Vec<u8> {
    dump.finish().unwrap()
}

fn linux_x86_system_info() -> SystemInfo {
    SystemInfo::new(Endian::Little)
        .set_processor_architecture(X86_ARCH)
        .set_platform_id(LINUX)
}

#[test]
fn test_empty_dump() {
    let bytes = read_synth_dump(SynthDump::new().flags(0x9f738b33685cc84c));
    let dump = Dump::read(&bytes[..]).unwrap();
    assert_eq!(dump.header.signature, md::DUMP_SIGNATURE);
    assert_eq!(dump.header.flags, 0x9f738b33685cc84c);
    assert_eq!(dump.endian, scroll::LE);
    assert!(dump.system_info().is_none());
    assert!(matches!(
        dump.get_stream::<DumpThreadList>(),
        Err(Error::StreamNotFound(_))
    ));
}

#[test]
fn test_system_info() {
    let bytes = read_synth_dump(SynthDump::new().add_system_info(linux_x86_system_info()));
    let dump = Dump::read(&bytes[..]).unwrap();
    let system_info = dump.system_info().unwrap();
    assert_eq!(system_info.os, Os::Linux);
    assert_eq!(system_info.cpu, Cpu::X86);
}

#[test]
fn test_module_list_with_build_id() {
    let name = DumpString::new("/usr/lib/libfoo.so", Endian::Little);
    let cv = CvElfRecord::new(
        &[
            0xf1, 0xc3, 0xbc, 0xc0, 0x27, 0x98, 0x65, 0xfe, 0x30, 0x58, 0x40, 0x4b, 0x28, 0x31,
            0xd9, 0xe6, 0x41, 0x35, 0x38, 0x6c,
        ],
        Endian::Little,
    );
    let module = SynthModule::new(Endian::Little, 0xa0000000, 0x1000, &name, 0xb1054d2a, 0, None)
        .cv_record(&cv);
    let bytes = read_synth_dump(
        SynthDump::new()
            .add_system_info(linux_x86_system_info())
            .add_module(module)
            .add(name)
            .add(cv),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let modules = dump.modules().unwrap();
    assert_eq!(modules.module_count(), 1);
    let module = modules.main_module().unwrap();
    assert_eq!(module.name, "/usr/lib/libfoo.so");
    assert_eq!(module.base_address(), 0xa0000000);
    assert_eq!(module.size(), 0x1000);
    // The build id is read back as both identifiers.
    assert_eq!(
        module.code_identifier().unwrap().to_string(),
        "f1c3bcc0279865fe3058404b2831d9e64135386c"
    );
    assert_eq!(
        module.debug_identifier().unwrap().breakpad().to_string(),
        "C0BCC3F19827FE653058404B2831D9E60"
    );
    assert_eq!(modules.module_at_address(0xa0000800).unwrap().name, module.name);
    assert!(modules.module_at_address(0xa0001000).is_none());
    assert!(modules.overlaps().is_empty());
}

#[test]
fn test_thread_and_context() {
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0xabcd1234,
        esp: 0x1010,
        ebp: 0x1020,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(Section::new().append_repeated(0, 16), 0x1000);

    let bytes = read_synth_dump(
        SynthDump::new()
            .add_system_info(linux_x86_system_info())
            .add_thread(Thread::new(Endian::Little, 0x77, &stack, &context_section))
            .add_memory(stack)
            .add(context_section),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let system_info = dump.system_info().unwrap();
    let threads = dump.threads().unwrap();
    assert_eq!(threads.threads.len(), 1);
    let thread = threads.get_thread(0x77).unwrap();

    let context = thread.context(&system_info).unwrap();
    assert_eq!(context.get_instruction_pointer(), 0xabcd1234);
    assert_eq!(context.get_stack_pointer(), 0x1010);
    assert_eq!(context.cpu(), Cpu::X86);

    let memory_list = dump.memory_list().unwrap();
    let stack = thread.stack_memory(&memory_list).unwrap();
    assert_eq!(stack.base_address, 0x1000);
    assert_eq!(stack.size, 16);
}

#[test]
fn test_context_arch_mismatch() {
    // SystemInfo says arm64, but the record is an x86 context.
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(Section::new().append_repeated(0, 16), 0x1000);

    let bytes = read_synth_dump(
        SynthDump::new()
            .add_system_info(
                SystemInfo::new(Endian::Little)
                    .set_processor_architecture(ARM64_ARCH)
                    .set_platform_id(LINUX),
            )
            .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
            .add_memory(stack)
            .add(context_section),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let system_info = dump.system_info().unwrap();
    let threads = dump.threads().unwrap();
    assert_eq!(
        threads.threads[0].context(&system_info),
        Err(ContextError::UnknownArchitecture)
    );
}

#[test]
fn test_memory_lookup() {
    let memory = Memory::with_section(
        Section::new().D32(0x11111111u32).D32(0x22222222u32),
        0x2000,
    );
    let bytes = read_synth_dump(
        SynthDump::new()
            .add_system_info(linux_x86_system_info())
            .add_memory(memory),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let memory_list = dump.memory_list().unwrap();
    let region = memory_list.memory_at_address(0x2004).unwrap();
    assert_eq!(region.base_address, 0x2000);
    assert_eq!(region.get_memory_at_address::<u32>(0x2004), Some(0x22222222));
    // Out-of-region reads fail softly.
    assert_eq!(region.get_memory_at_address::<u32>(0x2008), None);
    assert!(memory_list.memory_at_address(0x3000).is_none());
}

#[test]
fn test_memory64_and_unified_lookup() {
    let memory = Memory::with_section(
        Section::new().D64(0x1122334455667788u64),
        0x7fff00000000,
    );
    let bytes = read_synth_dump(
        SynthDump::new()
            .add_system_info(linux_x86_system_info())
            .add_memory64(memory),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let list64 = dump.memory64_list().unwrap();
    assert_eq!(list64.region_count(), 1);

    // The unified view searches both lists.
    let region = dump.get_memory(0x7fff00000000).unwrap();
    assert_eq!(
        region.get_memory_at_address::<u64>(0x7fff00000000),
        Some(0x1122334455667788)
    );
    assert!(dump.get_memory(0x1000).is_none());
}

#[test]
fn test_misc_info_truncated() {
    let mut misc = MiscStream::new(Endian::Little);
    misc.process_id = Some(0x1234abcd);
    misc.pad_to_size = Some(24);
    let bytes = read_synth_dump(SynthDump::new().add_misc_info(misc));
    let dump = Dump::read(&bytes[..]).unwrap();
    let misc = dump.misc_info().unwrap();
    assert_eq!(misc.raw.process_id(), Some(&0x1234abcd));
    // Process times were not recorded, so the fields gate off.
    assert_eq!(misc.raw.process_create_time(), None);
    assert_eq!(misc.process_create_time(), None);
}

#[test]
fn test_thread_names() {
    let name = DumpString::new("worker", Endian::Little);
    let bytes = read_synth_dump(
        SynthDump::new()
            .add_thread_name(ThreadName::new(Endian::Little, 0x11, Some(&name)))
            // A second entry with a bogus name RVA is dropped, not fatal.
            .add_thread_name(ThreadName::new(Endian::Little, 0x22, None))
            .add(name),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let names = dump.thread_names().unwrap();
    assert_eq!(names.get_name(0x11).as_deref(), Some("worker"));
    assert_eq!(names.get_name(0x22), None);
}

#[test]
fn test_exception() {
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x40000200,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let mut exception = Exception::new(Endian::Little);
    exception.thread_id = 0x1234;
    exception.exception_record.exception_code = 11;
    exception.exception_record.exception_flags = 2; // SEGV_ACCERR
    exception.exception_record.exception_address = 0xdead;
    let exception = exception.set_thread_context(&context_section);

    let bytes = read_synth_dump(
        SynthDump::new()
            .add_system_info(linux_x86_system_info())
            .add_exception(exception)
            .add(context_section),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let system_info = dump.system_info().unwrap();
    let exception = dump.exception().unwrap();
    assert_eq!(exception.get_crashing_thread_id(), 0x1234);
    assert_eq!(exception.get_crash_address(Os::Linux, Cpu::X86), 0xdead);
    assert_eq!(
        exception.get_crash_reason(Os::Linux).to_string(),
        "SIGSEGV /ACCERR"
    );
    let context = exception.context(&system_info).unwrap();
    assert_eq!(context.get_instruction_pointer(), 0x40000200);
}

#[test]
fn test_unloaded_modules() {
    let name = DumpString::new("old.dll", Endian::Little);
    let unloaded = UnloadedModule::new(Endian::Little, 0x60000000, 0x1000, &name, 0, 0);
    let bytes = read_synth_dump(
        SynthDump::new()
            .add_system_info(linux_x86_system_info())
            .add_unloaded_module(unloaded)
            .add(name),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let unloaded = dump.unloaded_modules().unwrap();
    let hits: Vec<_> = unloaded.modules_at_address(0x60000800).collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "old.dll");
    assert_eq!(unloaded.modules_at_address(0x50000000).count(), 0);
}

#[test]
fn test_linux_lsb_release() {
    let lsb = b"DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=22.04\nDISTRIB_CODENAME=jammy\n";
    let bytes = read_synth_dump(
        SynthDump::new().add_simple_stream(md::StreamKind::LinuxLsbRelease, lsb),
    );
    let dump = Dump::read(&bytes[..]).unwrap();
    let lsb = dump.linux_lsb_release().unwrap();
    let pairs: Vec<_> = lsb.iter().collect();
    assert_eq!(pairs.len(), 3);
    assert_eq!(pairs[0].0, "DISTRIB_ID");
    assert_eq!(pairs[0].1, "Ubuntu");
}

#[test]
fn test_linux_maps() {
    let maps = b"40000000-40010000 r-xp 00000000 08:01 1234 /usr/bin/app\n\
50000000-50004000 rw-p 00000000 00:00 0 [heap]\n";
    let bytes =
        read_synth_dump(SynthDump::new().add_simple_stream(md::StreamKind::LinuxMaps, maps));
    let dump = Dump::read(&bytes[..]).unwrap();
    let maps = dump.linux_maps().unwrap();
    assert_eq!(maps.region_count(), 2);
    let region = maps.memory_info_at_address(0x40008000).unwrap();
    assert!(region.is_exec);
    assert_eq!(region.pathname.as_deref(), Some("/usr/bin/app"));
    let heap = maps.memory_info_at_address(0x50000100).unwrap();
    assert!(!heap.is_exec);
    assert!(heap.is_write);
}

#[test]
fn test_handle_data() {
    // Header (16 bytes) + one 32-byte descriptor, with name strings
    // resolved through the whole-file RVAs.
    let type_name = DumpString::new("File", Endian::Little);
    let object_name = DumpString::new("/tmp/log", Endian::Little);
    let stream = Section::with_endian(Endian::Little)
        .D32(16) // size_of_header
        .D32(32) // size_of_descriptor
        .D32(1) // number_of_descriptors
        .D32(0) // reserved
        .D64(0x1d34u64) // handle
        .D32(type_name.file_offset()) // type_name_rva
        .D32(object_name.file_offset()) // object_name_rva
        .D32(0) // attributes
        .D32(0x120089) // granted_access
        .D32(2) // handle_count
        .D32(3); // pointer_count
    let bytes = {
        let mut dump = SynthDump::new();
        dump = dump.add(type_name).add(object_name);
        let stream_bytes_placeholder = debris_synth::SimpleStream {
            stream_type: md::StreamKind::HandleData as u32,
            section: stream,
        };
        dump = dump.add_stream(stream_bytes_placeholder);
        dump.finish().unwrap()
    };
    let dump = Dump::read(&bytes[..]).unwrap();
    let handles = dump.handle_data().unwrap();
    assert_eq!(handles.handles.len(), 1);
    let handle = &handles.handles[0];
    assert_eq!(handle.type_name.as_deref(), Some("File"));
    assert_eq!(handle.object_name.as_deref(), Some("/tmp/log"));
    match &handle.raw {
        HandleDescriptorVariant::V1(raw) => assert_eq!(raw.handle, 0x1d34),
        other => panic!("wrong descriptor variant: {other:?}"),
    }
}

#[test]
fn test_big_endian_dump() {
    let bytes = read_synth_dump(SynthDump::with_endian(Endian::Big));
    let dump = Dump::read(&bytes[..]).unwrap();
    assert_eq!(dump.endian, scroll::BE);
    assert_eq!(dump.header.signature, md::DUMP_SIGNATURE);
}
