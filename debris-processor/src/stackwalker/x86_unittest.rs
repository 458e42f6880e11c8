use std::collections::HashMap;

use test_assembler::*;

use debris_dump::format::ContextX86;
use debris_dump::{
    ContextValidity, Cpu, CpuRegisters, DumpContext, DumpMemory, DumpModule, DumpModuleList, Os,
    RawContext,
};

use crate::process_state::*;
use crate::processor::ProcessorOptions;
use crate::stackwalker::walk_stack;
use crate::symbols::{string_symbol_supplier, Symbolizer};
use crate::system_info::SystemInfo;

fn linux_x86_system_info() -> SystemInfo {
    SystemInfo {
        os: Os::Linux,
        os_version: None,
        os_build: None,
        cpu: Cpu::X86,
        cpu_info: None,
        cpu_microcode_version: None,
        cpu_count: 1,
    }
}

struct TestFixture {
    pub raw: ContextX86,
    pub modules: DumpModuleList,
    pub symbols: HashMap<String, String>,
    pub options: ProcessorOptions,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: ContextX86::default(),
            // Give the two modules reasonable standard locations and names
            // for tests to play with.
            modules: DumpModuleList::from_modules(vec![
                DumpModule::new(0x40000000, 0x10000, "module1"),
                DumpModule::new(0x50000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
            options: ProcessorOptions::default(),
        }
    }

    pub async fn walk_stack(&self, stack: Section) -> CallStack {
        let context = DumpContext {
            raw: RawContext::X86(self.raw.clone()),
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
            &linux_x86_system_info(),
            &self.options,
            &symbolizer,
        )
        .await
    }

    pub fn add_symbols(&mut self, name: String, symbols: String) {
        self.symbols.insert(name, symbols);
    }
}

#[tokio::test]
async fn test_simple() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack.D32(0).D32(0); // end-of-stack marker
    f.raw.eip = 0x40000200;
    f.raw.esp = 0x80000000;
    f.raw.ebp = 0x80000000;
    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 1);
    let frame = &s.frames[0];
    assert_eq!(frame.trust, FrameTrust::Context);
    assert_eq!(frame.module.as_ref().unwrap().name, "module1");
}

// A traditional frame: the caller's %ebp is saved right below the return
// address, and the callee's %ebp points at the saved one.
#[tokio::test]
async fn test_traditional() {
    let mut f = TestFixture::new();
    let frame0_ebp = Label::new();
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .append_repeated(0, 12) // frame 0: space
        .mark(&frame0_ebp) // frame 0 %ebp points here
        .D32(&frame1_ebp) // frame 0: saved %ebp
        .D32(0x40008679) // frame 0: return address
        .append_repeated(0, 8) // frame 1: space
        .mark(&frame1_ebp) // frame 1 %ebp points here
        .D32(0) // frame 1: saved %ebp (stack end)
        .D32(0); // frame 1: return address (stack end)
    f.raw.eip = 0x4000c7a5;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = frame0_ebp.value().unwrap() as u32;
    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 2);
    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.context.valid, ContextValidity::All);
        assert_eq!(f0.instruction, 0x4000c7a5);
    }
    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::FramePointer);
        assert_eq!(f1.instruction, 0x40008678);
        if let RawContext::X86(ctx) = &f1.context.raw {
            assert_eq!(ctx.eip, 0x40008679);
            assert_eq!(ctx.ebp, frame1_ebp.value().unwrap() as u32);
        } else {
            unreachable!();
        }
    }
}

// A bogus %ebp forces a scan for something that looks like a return
// address.
#[tokio::test]
async fn test_traditional_scan() {
    let mut f = TestFixture::new();
    let frame1_esp = Label::new();
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    let stack_start = 0x80000000;
    stack.start().set_const(stack_start);
    stack = stack
        // frame 0
        .D32(0xf065dc76u32) // locals area:
        .D32(0x46ee2167u32) // garbage that doesn't look like
        .D32(0xbab023ecu32) // a return address
        .D32(&frame1_ebp) // saved %ebp (%ebp fails to point here, forcing scan)
        .D32(0x4000129d) // return address
        // frame 1
        .mark(&frame1_esp)
        .append_repeated(0, 8) // space
        .mark(&frame1_ebp) // %ebp points here
        .D32(0) // saved %ebp (stack end)
        .D32(0); // return address (stack end)

    f.raw.eip = 0x4000f49d;
    f.raw.esp = stack.start().value().unwrap() as u32;
    // A scan-forcing, nonsensical frame pointer.
    f.raw.ebp = 0xd43eed6e;

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 2);

    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.instruction, 0x4000f49d);
    }
    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::Scan);
        if let ContextValidity::Some(which) = &f1.context.valid {
            assert!(which.contains("eip"));
            assert!(which.contains("esp"));
            assert!(which.contains("ebp"));
        } else {
            unreachable!();
        }
        assert_eq!(f1.instruction + 1, 0x4000129d);
        if let RawContext::X86(ctx) = &f1.context.raw {
            assert_eq!(ctx.eip, 0x4000129d);
            assert_eq!(ctx.esp, frame1_esp.value().unwrap() as u32);
            assert_eq!(ctx.ebp, frame1_ebp.value().unwrap() as u32);
        } else {
            unreachable!();
        }
    }
}

// With scanning disallowed, the bogus %ebp leaves only frame 0.
#[tokio::test]
async fn test_scan_disallowed() {
    let mut f = TestFixture::new();
    f.options.allow_scan = false;
    let frame1_ebp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D32(0xf065dc76u32)
        .D32(&frame1_ebp)
        .D32(0x4000129d)
        .append_repeated(0, 8)
        .mark(&frame1_ebp)
        .D32(0)
        .D32(0);

    f.raw.eip = 0x4000f49d;
    f.raw.esp = stack.start().value().unwrap() as u32;
    f.raw.ebp = 0xd43eed6e;

    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 1);
}

const CALLEE_SAVE_REGS: &[&str] = &["eip", "esp", "ebp", "ebx", "edi", "esi"];

fn init_cfi_state() -> (TestFixture, Section, ContextX86, ContextValidity) {
    let mut f = TestFixture::new();
    let symbols = [
        // The youngest frame's function.
        "FUNC 4000 1000 10 enchiridion\n",
        // Initially, just a return address.
        "STACK CFI INIT 4000 100 .cfa: $esp 4 + .ra: .cfa 4 - ^\n",
        // Push %ebx.
        "STACK CFI 4001 .cfa: $esp 8 + $ebx: .cfa 8 - ^\n",
        // Move %esi into %ebx. Weird, but permitted.
        "STACK CFI 4002 $esi: $ebx\n",
        // Allocate frame space, and save %edi.
        "STACK CFI 4003 .cfa: $esp 20 + $edi: .cfa 16 - ^\n",
        // Put the return address in %edi.
        "STACK CFI 4005 .ra: $edi\n",
        // Save %ebp, and use it as a frame pointer.
        "STACK CFI 4006 .cfa: $ebp 8 + $ebp: .cfa 12 - ^\n",
        // The calling function.
        "FUNC 5000 1000 10 epictetus\n",
        // Mark it as the end of the stack.
        "STACK CFI INIT 5000 1000 .cfa: $esp .ra 0\n",
    ];
    f.add_symbols(String::from("module1"), symbols.concat());

    f.raw.set_register("esp", 0x80000000).unwrap();
    f.raw.set_register("eip", 0x40005510).unwrap();
    f.raw.set_register("ebp", 0xc0d4aab9).unwrap();
    f.raw.set_register("ebx", 0x60f20ce6).unwrap();
    f.raw.set_register("esi", 0x53d1379d).unwrap();
    f.raw.set_register("edi", 0xafbae234).unwrap();

    let expected = f.raw.clone();
    let expected_valid: ContextValidity =
        ContextValidity::Some(CALLEE_SAVE_REGS.iter().copied().collect());

    let stack = Section::new();
    stack.start().set_const(0x80000000);

    (f, stack, expected, expected_valid)
}

async fn check_cfi(
    f: TestFixture,
    stack: Section,
    expected: ContextX86,
    expected_valid: ContextValidity,
) {
    let s = f.walk_stack(stack).await;
    assert_eq!(s.frames.len(), 2);

    {
        let frame = &s.frames[0];
        assert_eq!(frame.trust, FrameTrust::Context);
        assert_eq!(frame.context.valid, ContextValidity::All);
        assert_eq!(frame.function_name.as_deref(), Some("enchiridion"));
    }

    let expected_regs = match &expected_valid {
        ContextValidity::Some(which) => which,
        ContextValidity::All => unreachable!(),
    };
    let frame = &s.frames[1];
    assert_eq!(frame.trust, FrameTrust::CallFrameInfo);
    match &frame.context.valid {
        ContextValidity::Some(which) => assert_eq!(which.len(), expected_regs.len()),
        ContextValidity::All => unreachable!(),
    }
    if let RawContext::X86(ctx) = &frame.context.raw {
        for &reg in expected_regs {
            assert_eq!(
                ctx.get_register(reg, &frame.context.valid),
                expected.get_register(reg, &expected_valid),
                "{reg} registers didn't match!"
            );
        }
    } else {
        unreachable!();
    }
}

#[tokio::test]
async fn test_cfi_at_4000() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame1_rsp = Label::new();
    stack = stack
        .D32(0x40005510) // return address
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    expected
        .set_register("esp", frame1_rsp.value().unwrap() as u32)
        .unwrap();
    f.raw.set_register("eip", 0x40004000).unwrap();

    check_cfi(f, stack, expected, expected_valid).await;
}

#[tokio::test]
async fn test_cfi_at_4001() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame1_rsp = Label::new();
    stack = stack
        .D32(0x60f20ce6) // saved %ebx
        .D32(0x40005510) // return address
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    expected
        .set_register("esp", frame1_rsp.value().unwrap() as u32)
        .unwrap();
    f.raw.set_register("eip", 0x40004001).unwrap();
    f.raw.set_register("ebx", 0x91aa9a8b).unwrap();

    check_cfi(f, stack, expected, expected_valid).await;
}

#[tokio::test]
async fn test_cfi_at_4002() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame1_rsp = Label::new();
    stack = stack
        .D32(0x60f20ce6) // saved %ebx
        .D32(0x40005510) // return address
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    expected
        .set_register("esp", frame1_rsp.value().unwrap() as u32)
        .unwrap();
    f.raw.set_register("eip", 0x40004002).unwrap();
    f.raw.set_register("ebx", 0x53d1379d).unwrap();
    f.raw.set_register("esi", 0xa5c790ed).unwrap();

    check_cfi(f, stack, expected, expected_valid).await;
}

#[tokio::test]
async fn test_cfi_at_4003() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame1_rsp = Label::new();
    stack = stack
        .D32(0x56ec3db7u32) // garbage
        .D32(0xafbae234u32) // saved %edi
        .D32(0x53d67131u32) // garbage
        .D32(0x60f20ce6u32) // saved %ebx
        .D32(0x40005510u32) // return address
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    expected
        .set_register("esp", frame1_rsp.value().unwrap() as u32)
        .unwrap();
    f.raw.set_register("eip", 0x40004003).unwrap();
    f.raw.set_register("ebx", 0x53d1379d).unwrap();
    f.raw.set_register("esi", 0xa97f229d).unwrap();
    f.raw.set_register("edi", 0xb05cc997).unwrap();

    check_cfi(f, stack, expected, expected_valid).await;
}

#[tokio::test]
async fn test_cfi_at_4006() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame0_ebp = Label::new();
    let frame1_rsp = Label::new();
    stack = stack
        .D32(0xdcdd25cdu32) // garbage
        .D32(0xafbae234u32) // saved %edi
        .D32(0xc0d4aab9u32) // saved %ebp
        .mark(&frame0_ebp) // frame pointer points here
        .D32(0x60f20ce6u32) // saved %ebx
        .D32(0x8036cc02u32) // garbage
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    expected
        .set_register("esp", frame1_rsp.value().unwrap() as u32)
        .unwrap();
    f.raw
        .set_register("ebp", frame0_ebp.value().unwrap() as u32)
        .unwrap();
    f.raw.set_register("eip", 0x40004006).unwrap();
    f.raw.set_register("ebx", 0x53d1379d).unwrap();
    f.raw.set_register("esi", 0x743833c9).unwrap();
    f.raw.set_register("edi", 0x40005510).unwrap();

    check_cfi(f, stack, expected, expected_valid).await;
}
