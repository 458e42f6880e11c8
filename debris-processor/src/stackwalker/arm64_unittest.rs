use std::collections::HashMap;

use test_assembler::*;

use debris_dump::format::{Arm64Registers, ContextArm64};
use debris_dump::{
    ContextValidity, Cpu, CpuRegisters, DumpContext, DumpMemory, DumpModule, DumpModuleList, Os,
    RawContext,
};

use crate::process_state::*;
use crate::processor::ProcessorOptions;
use crate::stackwalker::walk_stack;
use crate::symbols::{string_symbol_supplier, Symbolizer};
use crate::system_info::SystemInfo;

const FRAME_POINTER: &str = Arm64Registers::FramePointer.name();
const LINK_REGISTER: &str = Arm64Registers::LinkRegister.name();
const STACK_POINTER: &str = Arm64Registers::StackPointer.name();
const PROGRAM_COUNTER: &str = Arm64Registers::ProgramCounter.name();

fn macos_arm64_system_info() -> SystemInfo {
    SystemInfo {
        os: Os::MacOs,
        os_version: None,
        os_build: None,
        cpu: Cpu::Arm64,
        cpu_info: None,
        cpu_microcode_version: None,
        cpu_count: 1,
    }
}

struct TestFixture {
    pub raw: ContextArm64,
    pub modules: DumpModuleList,
    pub symbols: HashMap<String, String>,
    pub options: ProcessorOptions,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: ContextArm64::default(),
            modules: DumpModuleList::from_modules(vec![
                DumpModule::new(0x400000, 0x10000, "module1"),
                DumpModule::new(0x500000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
            options: ProcessorOptions::default(),
        }
    }

    pub async fn walk_stack(&self, stack: Section) -> CallStack {
        let context = DumpContext {
            raw: RawContext::Arm64(self.raw.clone()),
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
            &macos_arm64_system_info(),
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
    f.raw.set_register(PROGRAM_COUNTER, 0x400200).unwrap();
    f.raw.set_register(STACK_POINTER, 0x80000000).unwrap();
    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 1);
    assert_eq!(s.frames[0].trust, FrameTrust::Context);
}

// The fp/lr pair-push convention: fp points at the saved pair.
#[tokio::test]
async fn test_frame_pointer() {
    let mut f = TestFixture::new();
    f.options.allow_scan = false;
    let frame0_fp = Label::new();
    let frame1_fp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 32) // frame 0: space
        .mark(&frame0_fp)
        .D64(&frame1_fp) // frame 0: saved fp
        .D64(0x400869cu64) // frame 0: saved lr
        .append_repeated(0, 32) // frame 1: space
        .mark(&frame1_fp)
        .D64(0u64) // frame 1: saved fp (chain end)
        .D64(0u64); // frame 1: saved lr

    f.raw.set_register(PROGRAM_COUNTER, 0x40c7a4).unwrap();
    f.raw.set_register(LINK_REGISTER, 0x4011d4).unwrap();
    f.raw
        .set_register(FRAME_POINTER, frame0_fp.value().unwrap())
        .unwrap();
    f.raw.set_register(STACK_POINTER, 0x80000000).unwrap();

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 3);
    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::FramePointer);
        // pc comes from the callee's lr.
        assert_eq!(f1.context.get_instruction_pointer(), 0x4011d4);
        assert_eq!(f1.instruction, 0x4011d4 - 4);
        if let RawContext::Arm64(ctx) = &f1.context.raw {
            assert_eq!(
                ctx.get_register_always(FRAME_POINTER),
                frame1_fp.value().unwrap()
            );
        } else {
            unreachable!();
        }
    }
    {
        let f2 = &s.frames[2];
        assert_eq!(f2.trust, FrameTrust::FramePointer);
        assert_eq!(f2.context.get_instruction_pointer(), 0x400869c);
    }
}

// Pointer-authentication bits in the link register must be stripped
// before the value is usable as a return address.
#[tokio::test]
async fn test_ptr_auth_strip() {
    let mut f = TestFixture::new();
    f.options.allow_scan = false;
    let frame0_fp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 32)
        .mark(&frame0_fp)
        .D64(0u64) // saved fp (chain end)
        .D64(0u64); // saved lr

    f.raw.set_register(PROGRAM_COUNTER, 0x40c7a4).unwrap();
    // PAC material in the top byte of lr.
    f.raw
        .set_register(LINK_REGISTER, 0xabcd_0000_0040_1234)
        .unwrap();
    f.raw
        .set_register(FRAME_POINTER, frame0_fp.value().unwrap())
        .unwrap();
    f.raw.set_register(STACK_POINTER, 0x80000000).unwrap();

    let s = f.walk_stack(stack).await;
    assert!(s.frames.len() >= 2);
    let f1 = &s.frames[1];
    // The caller's pc is the stripped lr.
    assert_eq!(f1.context.get_instruction_pointer(), 0x0000_0000_0040_1234);
}

// A crashing leaf function: no frame was pushed, but lr still has the
// return address. The stack pointer not moving is tolerated for frame 0.
#[tokio::test]
async fn test_leaf_frame() {
    let mut f = TestFixture::new();
    f.options.allow_scan = false;
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.append_repeated(0, 64);

    f.raw.set_register(PROGRAM_COUNTER, 0x400200).unwrap();
    f.raw.set_register(LINK_REGISTER, 0x4011d4).unwrap();
    f.raw.set_register(FRAME_POINTER, 0).unwrap();
    f.raw.set_register(STACK_POINTER, 0x80000000).unwrap();

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].context.get_instruction_pointer(), 0x4011d4);
    // Frame 1 repeats the stack pointer, which is only allowed once.
    assert_eq!(
        s.frames[1].context.get_stack_pointer(),
        s.frames[0].context.get_stack_pointer()
    );
}
