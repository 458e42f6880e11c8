use std::collections::HashMap;

use test_assembler::*;

use debris_dump::format::ContextAmd64;
use debris_dump::{
    ContextValidity, Cpu, DumpContext, DumpMemory, DumpModule, DumpModuleList, Os, RawContext,
};

use crate::process_state::*;
use crate::processor::ProcessorOptions;
use crate::stackwalker::walk_stack;
use crate::symbols::{string_symbol_supplier, Symbolizer};
use crate::system_info::SystemInfo;

fn linux_amd64_system_info() -> SystemInfo {
    SystemInfo {
        os: Os::Linux,
        os_version: None,
        os_build: None,
        cpu: Cpu::X86_64,
        cpu_info: None,
        cpu_microcode_version: None,
        cpu_count: 1,
    }
}

struct TestFixture {
    pub raw: ContextAmd64,
    pub modules: DumpModuleList,
    pub symbols: HashMap<String, String>,
    pub options: ProcessorOptions,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: ContextAmd64::default(),
            modules: DumpModuleList::from_modules(vec![
                DumpModule::new(0x00007400c0000000, 0x10000, "module1"),
                DumpModule::new(0x00007500b0000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
            options: ProcessorOptions::default(),
        }
    }

    pub async fn walk_stack(&self, stack: Section) -> CallStack {
        let context = DumpContext {
            raw: RawContext::Amd64(self.raw.clone()),
            valid: ContextValidity::All,
        };
        let base = stack.start().value().unwrap();
        let size = stack.size();
        let stack = stack.get_contents().unwrap();
        let stack_memory = DumpMemory {
            desc: Default::default(),
            base_address: base,
            size,
            bytes: &stack,
        };
        let symbolizer = Symbolizer::new(string_symbol_supplier(self.symbols.clone()));
        walk_stack(
            Some(&context),
            Some(&stack_memory),
            &self.modules,
            &linux_amd64_system_info(),
            &self.options,
            &symbolizer,
        )
        .await
    }
}

#[tokio::test]
async fn test_simple() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.D64(0u64).D64(0u64);
    f.raw.rip = 0x00007400c0000200;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = 0x80000000;
    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 1);
    let frame = &s.frames[0];
    assert_eq!(frame.trust, FrameTrust::Context);
    assert_eq!(frame.module.as_ref().unwrap().name, "module1");
}

// Frame-pointer chasing is opt-in on amd64; the same stack walks one
// frame without the option and two with it.
fn traditional_stack() -> (Section, Label, Label) {
    let frame0_rbp = Label::new();
    let frame1_rbp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 16) // frame 0: space
        .mark(&frame0_rbp)
        .D64(&frame1_rbp) // frame 0: saved %rbp
        .D64(0x00007400c0008679u64) // frame 0: return address
        .append_repeated(0, 16) // frame 1: space
        .mark(&frame1_rbp)
        .D64(0u64) // frame 1: saved %rbp (stack end)
        .D64(0u64); // frame 1: return address (stack end)
    (stack, frame0_rbp, frame1_rbp)
}

#[tokio::test]
async fn test_frame_pointer_gated_off() {
    let (stack, frame0_rbp, _) = traditional_stack();
    let mut f = TestFixture::new();
    // Scanning would also find the return address; turn it off to isolate
    // the frame-pointer strategy.
    f.options.allow_scan = false;
    f.raw.rip = 0x00007400c000c7a5;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = frame0_rbp.value().unwrap() as u64;

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 1);
}

#[tokio::test]
async fn test_frame_pointer_gated_on() {
    let (stack, frame0_rbp, frame1_rbp) = traditional_stack();
    let mut f = TestFixture::new();
    f.options.allow_scan = false;
    f.options.amd64_use_fp = true;
    f.raw.rip = 0x00007400c000c7a5;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = frame0_rbp.value().unwrap() as u64;

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::FramePointer);
    assert_eq!(f1.instruction + 1, 0x00007400c0008679);
    if let RawContext::Amd64(ctx) = &f1.context.raw {
        assert_eq!(ctx.rbp, frame1_rbp.value().unwrap() as u64);
    } else {
        unreachable!();
    }
}

#[tokio::test]
async fn test_scan() {
    let mut f = TestFixture::new();
    let frame1_rsp = Label::new();
    let mut stack = Section::new();
    let stack_start = 0x80000000u64;
    stack.start().set_const(stack_start);
    stack = stack
        .D64(0xf065dc76_4b23ba33u64) // garbage
        .D64(0x46ee2167_9939dbb2u64) // garbage
        .D64(0x00007400c000129du64) // return address
        .mark(&frame1_rsp)
        .append_repeated(0, 32)
        .D64(0u64)
        .D64(0u64);

    f.raw.rip = 0x00007400c000f49d;
    f.raw.rsp = stack_start;
    f.raw.rbp = 0xd43eed6e_aca4d2b1; // garbage; forces the scan

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::Scan);
    assert_eq!(f1.instruction + 1, 0x00007400c000129d);
    if let RawContext::Amd64(ctx) = &f1.context.raw {
        assert_eq!(ctx.rip, 0x00007400c000129d);
        assert_eq!(ctx.rsp, frame1_rsp.value().unwrap() as u64);
    } else {
        unreachable!();
    }
}

// Values that can't be user-space code addresses never count as return
// addresses during scanning.
#[tokio::test]
async fn test_scan_rejects_non_canonical() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x80000000u64;
    stack.start().set_const(stack_start);
    stack = stack
        .D64(0xffff7400c000129du64) // high bits set: kernel-ish, not ours
        .D64(0u64)
        .D64(0u64);

    f.raw.rip = 0x00007400c000f49d;
    f.raw.rsp = stack_start;
    f.raw.rbp = 0;

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 1);
}
