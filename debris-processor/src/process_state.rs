//! The final, immutable result of processing a dump.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::io::Write;
use std::time::SystemTime;

use debris_dump::{
    CrashReason, DumpContext, DumpModule, DumpModuleList, DumpUnknownStream,
    DumpUnloadedModuleList, Module,
};
use debris_symbols::{FrameSymbolizer, SymbolStats};

use crate::system_info::SystemInfo;

/// How much to believe a frame's instruction pointer.
///
/// Ordered by increasing confidence: a `Context` frame is the captured
/// machine state itself, while a `Scan` frame is a guess pulled out of
/// stack memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameTrust {
    /// The frame's provenance is unknown.
    None,
    /// Synthesized from inline-call records; rides on its physical frame.
    InlineExpansion,
    /// Found by scanning the stack for plausible return addresses.
    Scan,
    /// Derived by following the frame-pointer chain.
    FramePointer,
    /// Derived from call-frame information (CFI or STACK WIN records).
    CallFrameInfo,
    /// The captured CPU context; only frame 0 may carry this.
    Context,
}

impl FrameTrust {
    /// A short description of how the frame was recovered.
    pub fn description(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "given as instruction pointer in context",
            FrameTrust::CallFrameInfo => "call frame info",
            FrameTrust::FramePointer => "previous frame's frame pointer",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::InlineExpansion => "inline expansion",
            FrameTrust::None => "unknown",
        }
    }

    /// The identifier used in machine-readable output.
    pub fn name(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "context",
            FrameTrust::CallFrameInfo => "cfi",
            FrameTrust::FramePointer => "frame_pointer",
            FrameTrust::Scan => "scan",
            FrameTrust::InlineExpansion => "inline",
            FrameTrust::None => "none",
        }
    }
}

/// A frame synthesized from inline-call records.
///
/// Inline frames have no machine state of their own; they share the
/// physical frame's stack pointer and exist to name the inlined calls the
/// instruction pointer is logically inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineFrame {
    pub function_name: String,
    /// The call site in the next-outer function.
    pub source_file_name: Option<String>,
    pub source_line: Option<u32>,
}

/// One physical stack frame.
#[derive(Debug)]
pub struct StackFrame {
    /// The address to symbolize this frame by.
    ///
    /// For frame 0 this is the exact instruction pointer; for every caller
    /// frame it is adjusted back into the call instruction, so lookups hit
    /// the call site rather than the return point.
    pub instruction: u64,

    /// The module containing `instruction`.
    pub module: Option<DumpModule>,

    /// Unloaded modules overlapping `instruction`, with the offsets into
    /// each, for frames that resolve to no loaded module.
    pub unloaded_modules: BTreeMap<String, BTreeSet<u64>>,

    pub function_name: Option<String>,
    pub function_base: Option<u64>,
    /// Stack parameter size; STACK WIN unwinding consumes this.
    pub parameter_size: Option<u32>,
    pub source_file_name: Option<String>,
    pub source_line: Option<u32>,
    pub source_line_base: Option<u64>,

    /// Inline frames at this address, innermost first.
    pub inline_frames: Vec<InlineFrame>,

    /// How this frame was recovered.
    pub trust: FrameTrust,

    /// Register state, with validity tracking which registers the unwind
    /// actually recovered.
    pub context: DumpContext,
}

impl StackFrame {
    /// Start a frame from recovered register state.
    pub fn from_context(context: DumpContext, trust: FrameTrust) -> StackFrame {
        StackFrame {
            instruction: context.get_instruction_pointer(),
            module: None,
            unloaded_modules: BTreeMap::new(),
            function_name: None,
            function_base: None,
            parameter_size: None,
            source_file_name: None,
            source_line: None,
            source_line_base: None,
            inline_frames: vec![],
            trust,
            context,
        }
    }

    /// The return address as saved by the machine (unadjusted).
    pub fn return_address(&self) -> u64 {
        self.context.get_instruction_pointer()
    }
}

impl FrameSymbolizer for StackFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32) {
        self.function_name = Some(String::from(name));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file_name = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
    fn add_inline_frame(&mut self, name: &str, file: Option<&str>, line: Option<u32>) {
        self.inline_frames.push(InlineFrame {
            function_name: String::from(name),
            source_file_name: file.map(String::from),
            source_line: line,
        });
    }
}

/// Why a thread's walk ended up the way it did.
#[derive(Debug, PartialEq, Eq)]
pub enum CallStackInfo {
    Ok,
    /// No usable CPU context; no frames could be produced.
    MissingContext,
    /// No stack memory; only frame 0 could be produced.
    MissingMemory,
    /// The context's architecture has no walker.
    UnsupportedCpu,
    /// This thread wrote the dump and was skipped.
    DumpThreadSkipped,
    /// The symbol supplier interrupted the walk; the stack is truncated.
    Interrupted,
}

/// The unwound stack of one thread. Frame 0 is the innermost callee.
#[derive(Debug)]
pub struct CallStack {
    pub frames: Vec<StackFrame>,
    pub info: CallStackInfo,
    pub thread_id: u32,
    pub thread_name: Option<String>,
}

impl CallStack {
    /// An empty stack with the given status.
    pub fn with_info(thread_id: u32, info: CallStackInfo) -> CallStack {
        CallStack {
            frames: vec![],
            info,
            thread_id,
            thread_name: None,
        }
    }

    /// Write a human-readable backtrace for this thread.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        if self.frames.is_empty() {
            return writeln!(f, "<no frames: {:?}>", self.info);
        }
        let mut index = 0;
        for frame in &self.frames {
            for inline in &frame.inline_frames {
                write!(f, "{:2}  {}", index, inline.function_name)?;
                if let (Some(file), Some(line)) = (&inline.source_file_name, inline.source_line) {
                    write!(f, " [{file} : {line}]")?;
                }
                writeln!(f, " (inlined)")?;
                index += 1;
            }
            write!(f, "{index:2}  ")?;
            if let Some(module) = &frame.module {
                write!(f, "{}", module.code_file())?;
                match (&frame.function_name, frame.function_base) {
                    (Some(name), Some(base)) => {
                        write!(f, "!{} + {:#x}", name, frame.instruction - base)?;
                        if let (Some(file), Some(line)) =
                            (&frame.source_file_name, frame.source_line)
                        {
                            write!(f, " [{file} : {line}]")?;
                        }
                    }
                    _ => write!(f, " + {:#x}", frame.instruction - module.base_address())?,
                }
            } else {
                write!(f, "{:#x}", frame.instruction)?;
                for (name, offsets) in &frame.unloaded_modules {
                    write!(f, " (unloaded {name}@")?;
                    for offset in offsets {
                        write!(f, "{offset:#x},")?;
                    }
                    write!(f, ")")?;
                }
            }
            writeln!(f, "  ({})", frame.trust.description())?;
            index += 1;
        }
        Ok(())
    }
}

/// Linux distribution details from the lsb-release stream.
#[derive(Debug, Clone, Default)]
pub struct LinuxStandardBase {
    pub id: String,
    pub release: String,
    pub codename: String,
    pub description: String,
}

/// The overall outcome of processing, as a coarse status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Processed fine; the dump was requested without a crash.
    Ok,
    /// Processed fine; the process crashed.
    Crashed,
    /// An exception stream exists but carried no usable crash context.
    NoCrashContext,
    /// The symbol supplier interrupted processing; threads after the
    /// interruption point are absent.
    Interrupted,
    /// Mandatory streams parsed, but parts of the dump were unreadable.
    CorruptDump,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ProcessStatus::Ok => "ok",
            ProcessStatus::Crashed => "crashed",
            ProcessStatus::NoCrashContext => "no crash context",
            ProcessStatus::Interrupted => "interrupted",
            ProcessStatus::CorruptDump => "corrupt_dump",
        };
        f.write_str(status)
    }
}

/// Everything recovered from one dump. Constructed once, never mutated.
pub struct ProcessState {
    /// The dumped process's id, when recorded.
    pub process_id: Option<u32>,
    /// When the dump was written.
    pub time: SystemTime,
    /// When the process started, when recorded.
    pub process_create_time: Option<SystemTime>,
    /// The crash reason, if the process crashed.
    pub crash_reason: Option<CrashReason>,
    /// The faulting address (data address for memory faults, instruction
    /// address otherwise).
    pub crash_address: Option<u64>,
    /// The failed assertion, when the dump carries one.
    pub assertion: Option<String>,
    /// Index into `threads` of the thread that crashed or requested the
    /// dump; `None` when no thread could be identified.
    pub requesting_thread: Option<usize>,
    /// Coarse outcome; see [`ProcessStatus`].
    pub status: ProcessStatus,
    pub system_info: SystemInfo,
    pub linux_standard_base: Option<LinuxStandardBase>,
    /// One call stack per thread, in thread-list order (possibly truncated
    /// by an interruption).
    pub threads: Vec<CallStack>,
    pub modules: DumpModuleList,
    pub unloaded_modules: DumpUnloadedModuleList,
    /// Modules referenced by frames whose symbols could not be found.
    pub modules_without_symbols: Vec<String>,
    /// Modules referenced by frames whose symbol files failed to parse.
    pub modules_with_corrupt_symbols: Vec<String>,
    pub unknown_streams: Vec<DumpUnknownStream>,
    pub symbol_stats: HashMap<String, SymbolStats>,
}

impl ProcessState {
    /// Whether the process actually crashed (rather than requesting a
    /// dump).
    pub fn crashed(&self) -> bool {
        self.crash_reason.is_some()
    }

    /// Write a human-readable report.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        writeln!(f, "Operating system: {}", self.system_info.os)?;
        if let Some(version) = &self.system_info.os_version {
            writeln!(f, "                  {version}")?;
        }
        writeln!(f, "CPU: {}", self.system_info.cpu)?;
        if let Some(info) = &self.system_info.cpu_info {
            writeln!(f, "     {info}")?;
        }
        writeln!(f, "     {} CPUs", self.system_info.cpu_count)?;
        writeln!(f)?;
        writeln!(f, "Status: {}", self.status)?;
        if let Some(reason) = &self.crash_reason {
            writeln!(f, "Crash reason:  {reason}")?;
        }
        if let Some(address) = self.crash_address {
            writeln!(f, "Crash address: {address:#x}")?;
        }
        if let Some(assertion) = &self.assertion {
            writeln!(f, "Assertion: {assertion}")?;
        }
        writeln!(f)?;

        for (index, stack) in self.threads.iter().enumerate() {
            let requesting = self.requesting_thread == Some(index);
            write!(f, "Thread {index}")?;
            if let Some(name) = &stack.thread_name {
                write!(f, " ({name})")?;
            }
            if requesting {
                write!(f, " (crashed)")?;
            }
            writeln!(f)?;
            stack.print(f)?;
            writeln!(f)?;
        }

        writeln!(f, "Loaded modules:")?;
        for module in self.modules.by_addr() {
            let file = module.code_file();
            let annotation = if self
                .modules_with_corrupt_symbols
                .iter()
                .any(|m| **m == *debris_dump::basename(&file))
            {
                "  (corrupt symbols)"
            } else if self
                .modules_without_symbols
                .iter()
                .any(|m| **m == *debris_dump::basename(&file))
            {
                "  (no symbols)"
            } else {
                ""
            };
            writeln!(
                f,
                "{:#010x} - {:#010x}  {}{}",
                module.base_address(),
                module.base_address() + module.size() - 1,
                file,
                annotation,
            )?;
        }
        Ok(())
    }
}
