//! End-to-end tests over synthetic minidumps.

use std::collections::HashMap;

use async_trait::async_trait;
use test_assembler::*;

use debris_dump::format as md;
use debris_dump::{Dump, Module};
use debris_processor::{
    process_dump, process_dump_with_options, string_symbol_supplier, CallStackInfo, FrameTrust,
    ProcessStatus, ProcessorOptions, SymbolError, SymbolFile, SymbolSupplier, Symbolizer,
};
use debris_synth::{
    DumpString, Exception, Memory, MiscStream, Module as SynthModule, SynthContext, SynthDump,
    SystemInfo, Thread, ThreadName,
};

const X86_ARCH: u16 = md::ProcessorArchitecture::Intel as u16;
const AMD64_ARCH: u16 = md::ProcessorArchitecture::Amd64 as u16;
const ARM64_ARCH: u16 = md::ProcessorArchitecture::Arm64 as u16;
const LINUX: u32 = md::PlatformId::Linux as u32;
const MACOS: u32 = md::PlatformId::MacOs as u32;

fn linux_x86_system_info() -> SystemInfo {
    SystemInfo::new(Endian::Little)
        .set_processor_architecture(X86_ARCH)
        .set_platform_id(LINUX)
}

/// The crashing-thread scenario the symbol fixtures below describe:
/// `main` (with CFI chaining to `start`) faulted on a null read.
fn libfoo_symbols() -> String {
    "MODULE Linux x86 DEADBEEF0123456789ABCDEF012345670 libfoo.so
FILE 0 foo.c
FUNC 400 40 0 main
400 40 12 0
FUNC 500 100 0 start
STACK CFI INIT 400 40 .cfa: $esp 4 + .ra: .cfa 4 - ^
STACK CFI INIT 500 100 .cfa: $esp .ra 0
"
    .to_string()
}

#[tokio::test]
async fn test_x86_null_deref_with_cfi() {
    // One module at 0x08048000, the crashing thread's eip inside `main`,
    // a SIGSEGV/MAPERR exception at address 0, and stack memory whose
    // first word is the return address into `start`.
    let mut context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ebp: 0,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);

    // The second thread sits somewhere else entirely.
    context.eip = 0x08048430;
    let context_section2 = SynthContext::x86(&context, Endian::Little);

    let stack = Memory::with_section(
        Section::new().D32(0x08048521).append_repeated(0, 60),
        0x30001000,
    );
    let stack2 = Memory::with_section(Section::new().append_repeated(0, 32), 0x30002000);

    let name = DumpString::new("libfoo.so", Endian::Little);
    let module = SynthModule::new(Endian::Little, 0x08048000, 0x1000, &name, 0, 0, None);

    let mut exception = Exception::new(Endian::Little);
    exception.thread_id = 0x1234;
    exception.exception_record.exception_code = 11; // SIGSEGV
    exception.exception_record.exception_flags = 1; // SEGV_MAPERR
    exception.exception_record.exception_address = 0;
    let exception = exception.set_thread_context(&context_section);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_module(module)
        .add(name)
        .add_thread(Thread::new(Endian::Little, 0x1234, &stack, &context_section))
        .add_thread(Thread::new(
            Endian::Little,
            0x5678,
            &stack2,
            &context_section2,
        ))
        .add_memory(stack)
        .add_memory(stack2)
        .add_exception(exception)
        .add(context_section)
        .add(context_section2);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let mut symbols = HashMap::new();
    symbols.insert("libfoo.so".to_string(), libfoo_symbols());
    let symbolizer = Symbolizer::new(string_symbol_supplier(symbols));

    let state = process_dump(&dump, &symbolizer).await.unwrap();

    assert_eq!(state.status, ProcessStatus::Crashed);
    assert!(state.crashed());
    assert_eq!(state.crash_reason.unwrap().to_string(), "SIGSEGV /MAPERR");
    assert_eq!(state.crash_address, Some(0));
    assert_eq!(state.requesting_thread, Some(0));
    assert_eq!(state.threads.len(), 2);

    let stack = &state.threads[0];
    assert_eq!(stack.info, CallStackInfo::Ok);
    assert_eq!(stack.frames.len(), 2);

    // Frame 0: main + 0x10, straight from the context.
    let f0 = &stack.frames[0];
    assert_eq!(f0.trust, FrameTrust::Context);
    assert_eq!(f0.function_name.as_deref(), Some("main"));
    assert_eq!(f0.instruction - f0.function_base.unwrap(), 0x10);
    assert_eq!(f0.source_file_name.as_deref(), Some("foo.c"));
    assert_eq!(f0.source_line, Some(12));

    // Frame 1: start + 0x20, recovered via CFI.
    let f1 = &stack.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    assert_eq!(f1.function_name.as_deref(), Some("start"));
    assert_eq!(f1.instruction - f1.function_base.unwrap(), 0x20);

    // The module's symbols loaded fine.
    assert!(state.modules_without_symbols.is_empty());
    assert!(state.modules_with_corrupt_symbols.is_empty());
}

#[tokio::test]
async fn test_amd64_missing_symbols() {
    let context = md::ContextAmd64 {
        context_flags: md::ContextFlagsCpu::CONTEXT_AMD64.bits(),
        rip: 0x7400c0000200,
        rsp: 0x7fff00001000,
        ..Default::default()
    };
    let context_section = SynthContext::amd64(&context, Endian::Little);

    let stack = Memory::with_section(
        Section::new().append_repeated(0, 64),
        0x7fff00001000,
    );

    let name = DumpString::new("libbar.so", Endian::Little);
    let module = SynthModule::new(Endian::Little, 0x7400c0000000, 0x10000, &name, 0, 0, None);

    let dump = SynthDump::new()
        .add_system_info(
            SystemInfo::new(Endian::Little)
                .set_processor_architecture(AMD64_ARCH)
                .set_platform_id(LINUX),
        )
        .add_module(module)
        .add(name)
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    // Supplier knows no modules at all.
    let symbolizer = Symbolizer::new(string_symbol_supplier(HashMap::new()));
    let state = process_dump(&dump, &symbolizer).await.unwrap();

    assert_eq!(state.status, ProcessStatus::Ok);
    let frame = &state.threads[0].frames[0];
    assert_eq!(frame.module.as_ref().unwrap().name, "libbar.so");
    assert_eq!(frame.function_name, None);
    assert_eq!(state.modules_without_symbols, vec!["libbar.so".to_string()]);
}

#[tokio::test]
async fn test_arm64_pac_stripped_lr() {
    let mut context = md::ContextArm64 {
        context_flags: md::ContextFlagsCpu::CONTEXT_ARM64.bits(),
        pc: 0x40c7a4,
        ..Default::default()
    };
    context.iregs[29] = 0; // fp: chain end, forces the lr-only leaf path
    context.iregs[30] = 0xabcd_0000_0040_1234; // lr with PAC bits
    context.iregs[31] = 0x80000000; // sp
    let context_section = SynthContext::arm64(&context, Endian::Little);

    let stack = Memory::with_section(Section::new().append_repeated(0, 64), 0x80000000);
    let name = DumpString::new("app", Endian::Little);
    let module = SynthModule::new(Endian::Little, 0x400000, 0x10000, &name, 0, 0, None);

    let dump = SynthDump::new()
        .add_system_info(
            SystemInfo::new(Endian::Little)
                .set_processor_architecture(ARM64_ARCH)
                .set_platform_id(MACOS),
        )
        .add_module(module)
        .add(name)
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let symbolizer = Symbolizer::new(string_symbol_supplier(HashMap::new()));
    let mut options = ProcessorOptions::default();
    options.allow_scan = false;
    let state = process_dump_with_options(&dump, &symbolizer, &options)
        .await
        .unwrap();

    let frames = &state.threads[0].frames;
    assert_eq!(frames.len(), 2);
    // The PAC bits are gone from the recovered caller pc.
    assert_eq!(
        frames[1].context.get_instruction_pointer(),
        0x0000_0000_0040_1234
    );
}

#[tokio::test]
async fn test_truncated_misc_info() {
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(Section::new().append_repeated(0, 16), 0x30001000);

    let mut misc = MiscStream::new(Endian::Little);
    misc.process_id = Some(0xcafe);
    // No process-times flag, padded out to the v1 layout.
    misc.pad_to_size = Some(24);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add_misc_info(misc)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let symbolizer = Symbolizer::new(string_symbol_supplier(HashMap::new()));
    let state = process_dump(&dump, &symbolizer).await.unwrap();

    assert_eq!(state.process_id, Some(0xcafe));
    assert_eq!(state.process_create_time, None);
    assert_eq!(state.status, ProcessStatus::Ok);
}

#[tokio::test]
async fn test_stack_scan_fallback() {
    // No CFI, no frame pointer; the stack holds garbage, garbage, then a
    // plausible return address.
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ebp: 0xdeadbeef,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);

    let stack = Memory::with_section(
        Section::new()
            .D32(0x11223344)
            .D32(0x55667788)
            .D32(0x08048521) // return address in libfoo.so
            .append_repeated(0, 32),
        0x30001000,
    );
    let name = DumpString::new("libfoo.so", Endian::Little);
    let module = SynthModule::new(Endian::Little, 0x08048000, 0x1000, &name, 0, 0, None);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_module(module)
        .add(name)
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let symbolizer = Symbolizer::new(string_symbol_supplier(HashMap::new()));
    let state = process_dump(&dump, &symbolizer).await.unwrap();

    let frames = &state.threads[0].frames;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].trust, FrameTrust::Scan);
    assert_eq!(frames[1].context.get_instruction_pointer(), 0x08048521);
}

/// A supplier that interrupts on one specific module.
struct InterruptingSupplier {
    interrupt_on: String,
}

#[async_trait]
impl SymbolSupplier for InterruptingSupplier {
    async fn locate_symbols(
        &self,
        module: &(dyn Module + Sync),
    ) -> Result<SymbolFile, SymbolError> {
        if *module.code_file() == *self.interrupt_on {
            Err(SymbolError::Interrupted)
        } else {
            Err(SymbolError::NotFound)
        }
    }
}

#[tokio::test]
async fn test_interrupt_truncates_processing() {
    // Thread 1's frame 0 sits in module1 (symbols merely missing); the
    // frame-pointer chain leads into module2, whose lookup interrupts.
    let frame0_ebp = Label::new();
    let frame1_ebp = Label::new();
    let mut stack_section = Section::new();
    stack_section.start().set_const(0x30001000);
    stack_section = stack_section
        .append_repeated(0, 8)
        .mark(&frame0_ebp)
        .D32(&frame1_ebp)
        .D32(0x50000210) // return address in module2
        .append_repeated(0, 8)
        .mark(&frame1_ebp)
        .D32(0)
        .D32(0);

    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x40000200,
        esp: 0x30001000,
        ebp: frame0_ebp.value().unwrap() as u32,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let context_section2 = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(stack_section, 0x30001000);
    let stack2 = Memory::with_section(Section::new().append_repeated(0, 16), 0x30002000);

    let name1 = DumpString::new("module1", Endian::Little);
    let name2 = DumpString::new("module2", Endian::Little);
    let module1 = SynthModule::new(Endian::Little, 0x40000000, 0x10000, &name1, 0, 0, None);
    let module2 = SynthModule::new(Endian::Little, 0x50000000, 0x10000, &name2, 0, 0, None);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_module(module1)
        .add_module(module2)
        .add(name1)
        .add(name2)
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_thread(Thread::new(Endian::Little, 2, &stack2, &context_section2))
        .add_memory(stack)
        .add_memory(stack2)
        .add(context_section)
        .add(context_section2);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let symbolizer = Symbolizer::new(InterruptingSupplier {
        interrupt_on: "module2".to_string(),
    });
    let state = process_dump(&dump, &symbolizer).await.unwrap();

    assert_eq!(state.status, ProcessStatus::Interrupted);
    // Thread 2 is absent entirely; thread 1 is truncated at the frame
    // whose module triggered the interrupt.
    assert_eq!(state.threads.len(), 1);
    let stack = &state.threads[0];
    assert_eq!(stack.info, CallStackInfo::Interrupted);
    assert_eq!(stack.frames.len(), 1);
    assert_eq!(stack.frames[0].module.as_ref().unwrap().name, "module1");
}

#[tokio::test]
async fn test_empty_module_list() {
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(Section::new().append_repeated(0, 16), 0x30001000);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let symbolizer = Symbolizer::new(string_symbol_supplier(HashMap::new()));
    let state = process_dump(&dump, &symbolizer).await.unwrap();

    // Only frame 0, with no module to attribute it to.
    let frames = &state.threads[0].frames;
    assert_eq!(frames.len(), 1);
    assert!(frames[0].module.is_none());
}

#[tokio::test]
async fn test_exception_thread_id_not_in_thread_list() {
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(Section::new().append_repeated(0, 16), 0x30001000);

    let mut exception = Exception::new(Endian::Little);
    exception.thread_id = 0x9999; // no such thread
    exception.exception_record.exception_code = 11;
    exception.exception_record.exception_flags = 1;
    exception.exception_record.exception_address = 0x42;
    let exception = exception.set_thread_context(&context_section);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add_exception(exception)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let symbolizer = Symbolizer::new(string_symbol_supplier(HashMap::new()));
    let state = process_dump(&dump, &symbolizer).await.unwrap();

    assert_eq!(state.status, ProcessStatus::Crashed);
    assert_eq!(state.requesting_thread, None);
    assert_eq!(state.crash_address, Some(0x42));
}

#[tokio::test]
async fn test_thread_names() {
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(Section::new().append_repeated(0, 16), 0x30001000);
    let thread_name = DumpString::new("MainThread", Endian::Little);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_thread(Thread::new(Endian::Little, 7, &stack, &context_section))
        .add_thread_name(ThreadName::new(Endian::Little, 7, Some(&thread_name)))
        .add(thread_name)
        .add_memory(stack)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let symbolizer = Symbolizer::new(string_symbol_supplier(HashMap::new()));
    let state = process_dump(&dump, &symbolizer).await.unwrap();
    assert_eq!(state.threads[0].thread_name.as_deref(), Some("MainThread"));
}

#[tokio::test]
async fn test_processing_is_deterministic() {
    // Two runs over the same dump render identical reports.
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(
        Section::new().D32(0x08048521).append_repeated(0, 28),
        0x30001000,
    );
    let name = DumpString::new("libfoo.so", Endian::Little);
    let module = SynthModule::new(Endian::Little, 0x08048000, 0x1000, &name, 0, 0, None);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_module(module)
        .add(name)
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add(context_section);

    let bytes = dump.finish().unwrap();

    let mut reports = vec![];
    for _ in 0..2 {
        let dump = Dump::read(&bytes[..]).unwrap();
        let mut symbols = HashMap::new();
        symbols.insert("libfoo.so".to_string(), libfoo_symbols());
        let symbolizer = Symbolizer::new(string_symbol_supplier(symbols));
        let state = process_dump(&dump, &symbolizer).await.unwrap();
        let mut out = vec![];
        state.print(&mut out).unwrap();
        reports.push(out);
    }
    assert_eq!(reports[0], reports[1]);
}

#[tokio::test]
async fn test_corrupt_symbols_are_reported() {
    let context = md::ContextX86 {
        context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
        eip: 0x08048410,
        esp: 0x30001000,
        ..Default::default()
    };
    let context_section = SynthContext::x86(&context, Endian::Little);
    let stack = Memory::with_section(Section::new().append_repeated(0, 16), 0x30001000);
    let name = DumpString::new("libfoo.so", Endian::Little);
    let module = SynthModule::new(Endian::Little, 0x08048000, 0x1000, &name, 0, 0, None);

    let dump = SynthDump::new()
        .add_system_info(linux_x86_system_info())
        .add_module(module)
        .add(name)
        .add_thread(Thread::new(Endian::Little, 1, &stack, &context_section))
        .add_memory(stack)
        .add(context_section);

    let bytes = dump.finish().unwrap();
    let dump = Dump::read(&bytes[..]).unwrap();

    let mut symbols = HashMap::new();
    symbols.insert("libfoo.so".to_string(), "not a symbol file".to_string());
    let symbolizer = Symbolizer::new(string_symbol_supplier(symbols));
    let state = process_dump(&dump, &symbolizer).await.unwrap();

    // The frame survives without function data; the module is flagged.
    let frame = &state.threads[0].frames[0];
    assert!(frame.function_name.is_none());
    assert_eq!(
        state.modules_with_corrupt_symbols,
        vec!["libfoo.so".to_string()]
    );
    assert!(state.modules_without_symbols.is_empty());
}
