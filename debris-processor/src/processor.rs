//! The top-level assembler: streams in, [`ProcessState`] out.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;

use tracing::warn;

use debris_dump::{
    ContextError, Dump, DumpAssertion, DumpBreakpadInfo, DumpException, DumpLinuxCpuInfo,
    DumpLinuxLsbRelease, DumpMemoryList, DumpMiscInfo, DumpModuleList, DumpSystemInfo,
    DumpThreadList, DumpThreadNames, DumpUnloadedModuleList, Error as DumpError,
};

use crate::process_state::{
    CallStack, CallStackInfo, LinuxStandardBase, ProcessState, ProcessStatus,
};
use crate::stackwalker;
use crate::symbols::SymbolProvider;
use crate::system_info::SystemInfo;

/// Knobs controlling how dumps are processed.
///
/// All fields are public; start from [`Default`] and adjust. There is no
/// global state anywhere in the processor, so distinct runs with distinct
/// options can share a process (and a symbol provider, if it allows it).
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Permit heuristic stack scanning as the last-resort unwind strategy.
    pub allow_scan: bool,
    /// The most frames a single thread's walk may produce.
    pub max_frames: usize,
    /// Chase %rbp frame chains on amd64.
    ///
    /// Off by default: the baseline amd64 ABI repurposes %rbp, and chasing
    /// it through such code fabricates frames. Set this for builds known
    /// to keep frame pointers.
    pub amd64_use_fp: bool,
    /// Addresses that terminate a walk when a recovered caller's pc hits
    /// one (process entry points and the like).
    pub entry_sentinels: Vec<u64>,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions {
            allow_scan: true,
            max_frames: 1024,
            amd64_use_fp: false,
            entry_sentinels: vec![],
        }
    }
}

/// A dump that couldn't be processed at all.
///
/// Everything softer than this degrades instead: missing optional streams
/// leave fields `None`, unreadable auxiliary streams mark the state
/// `corrupt_dump`, symbol trouble marks modules.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to read minidump")]
    DumpReadFailure(#[from] DumpError),
    #[error("the system info stream was not found")]
    MissingSystemInfo,
    #[error("the thread list stream was not found")]
    MissingThreadList,
}

/// Process `dump` with default options.
pub async fn process_dump<'a, T, P>(
    dump: &Dump<'a, T>,
    symbol_provider: &P,
) -> Result<ProcessState, ProcessError>
where
    T: Deref<Target = [u8]> + 'a,
    P: SymbolProvider + Sync,
{
    process_dump_with_options(dump, symbol_provider, &ProcessorOptions::default()).await
}

/// Process `dump`: parse the streams, walk every thread, symbolize, and
/// assemble the final [`ProcessState`].
pub async fn process_dump_with_options<'a, T, P>(
    dump: &Dump<'a, T>,
    symbol_provider: &P,
    options: &ProcessorOptions,
) -> Result<ProcessState, ProcessError>
where
    T: Deref<Target = [u8]> + 'a,
    P: SymbolProvider + Sync,
{
    // A helper for streams that are allowed to be absent but, when
    // present, failing to parse taints the dump.
    fn degrade<S>(result: Result<S, DumpError>, corrupt: &mut bool) -> Option<S> {
        match result {
            Ok(stream) => Some(stream),
            Err(DumpError::StreamNotFound(_)) => None,
            Err(err) => {
                warn!("stream failed to parse: {}", err.name());
                *corrupt = true;
                None
            }
        }
    }
    let mut corrupt = false;

    // These two the processor cannot work without.
    let dump_system_info = dump
        .get_stream::<DumpSystemInfo>()
        .or(Err(ProcessError::MissingSystemInfo))?;
    let thread_list = dump
        .get_stream::<DumpThreadList>()
        .or(Err(ProcessError::MissingThreadList))?;

    let thread_names = dump
        .get_stream::<DumpThreadNames>()
        .unwrap_or_default();
    let modules =
        degrade(dump.get_stream::<DumpModuleList>(), &mut corrupt).unwrap_or_default();
    let unloaded_modules =
        degrade(dump.get_stream::<DumpUnloadedModuleList>(), &mut corrupt).unwrap_or_default();
    let memory_list =
        degrade(dump.get_stream::<DumpMemoryList>(), &mut corrupt).unwrap_or_default();
    let misc_info = dump.get_stream::<DumpMiscInfo>().ok();
    let breakpad_info = dump.get_stream::<DumpBreakpadInfo>().ok();
    let exception = dump.get_stream::<DumpException>().ok();
    let assertion = dump.get_stream::<DumpAssertion>().ok();
    if !modules.overlaps().is_empty() {
        warn!(
            "module list contains {} overlapping ranges",
            modules.overlaps().len()
        );
    }

    let (os_version, os_build) = dump_system_info.os_parts();

    // The Linux streams are grab-bags; pull out the few facts the report
    // uses.
    let cpu_microcode_version = dump
        .get_stream::<DumpLinuxCpuInfo>()
        .ok()
        .and_then(|cpu_info| {
            cpu_info
                .iter()
                .find(|(key, _)| key == "microcode")
                .and_then(|(_, val)| {
                    let val = val.trim();
                    let val = val.strip_prefix("0x").unwrap_or(val);
                    u64::from_str_radix(val, 16).ok()
                })
        });

    let linux_standard_base = dump.get_stream::<DumpLinuxLsbRelease>().ok().map(|lsb| {
        let mut out = LinuxStandardBase::default();
        for (key, val) in lsb.iter() {
            match &*key {
                "DISTRIB_ID" | "ID" => out.id = val.into_owned(),
                "DISTRIB_RELEASE" | "VERSION_ID" => out.release = val.into_owned(),
                "DISTRIB_CODENAME" | "VERSION_CODENAME" => out.codename = val.into_owned(),
                "DISTRIB_DESCRIPTION" | "PRETTY_NAME" => out.description = val.into_owned(),
                _ => {}
            }
        }
        out
    });

    let system_info = SystemInfo {
        os: dump_system_info.os,
        os_version: Some(os_version),
        os_build,
        cpu: dump_system_info.cpu,
        cpu_info: dump_system_info.cpu_info().map(|s| s.into_owned()),
        cpu_microcode_version,
        cpu_count: dump_system_info.raw.number_of_processors as usize,
    };

    let (process_id, process_create_time) = match &misc_info {
        Some(misc) => (
            misc.raw.process_id().copied(),
            misc.process_create_time(),
        ),
        None => (None, None),
    };

    let (dump_thread_id, requesting_thread_id) = match &breakpad_info {
        Some(info) => (info.dump_thread_id, info.requesting_thread_id),
        None => (None, None),
    };

    let (crash_reason, crash_address, crashing_thread_id) = match &exception {
        Some(exception) => (
            Some(exception.get_crash_reason(system_info.os)),
            Some(exception.get_crash_address(system_info.os, system_info.cpu)),
            Some(exception.get_crashing_thread_id()),
        ),
        None => (None, None, None),
    };

    // The exception's embedded context is the state at the fault; it
    // replaces the crashed thread's own (handler) context below.
    let exception_context = exception
        .as_ref()
        .map(|e| e.context(&dump_system_info))
        .transpose()
        .unwrap_or_else(|err| {
            warn!("exception context unusable: {err}");
            None
        });

    let assertion = assertion.as_ref().and_then(|assertion| {
        let expression = assertion.expression()?;
        match assertion.function() {
            Some(function) if !function.is_empty() => {
                Some(format!("{expression} in {function}"))
            }
            _ => Some(expression),
        }
    });

    let mut threads = Vec::with_capacity(thread_list.threads.len());
    let mut requesting_thread = None;
    let mut interrupted = false;
    for (index, thread) in thread_list.threads.iter().enumerate() {
        let id = thread.raw.thread_id;

        // The thread that wrote the dump is walking minidump-writer code,
        // not anything the crashed process was doing; skip it.
        if dump_thread_id == Some(id) && crashing_thread_id != Some(id) {
            threads.push(CallStack::with_info(id, CallStackInfo::DumpThreadSkipped));
            continue;
        }

        let is_requesting_thread = crashing_thread_id
            .or(requesting_thread_id)
            .map(|wanted| wanted == id)
            .unwrap_or(false);
        if is_requesting_thread {
            requesting_thread = Some(index);
        }

        let thread_context = match thread.context(&dump_system_info) {
            Ok(context) => Some(context),
            Err(ContextError::UnknownArchitecture) => {
                threads.push(CallStack::with_info(id, CallStackInfo::UnsupportedCpu));
                continue;
            }
            Err(ContextError::ReadFailure) => None,
        };
        let context = if is_requesting_thread && exception_context.is_some() {
            exception_context.as_ref()
        } else {
            thread_context.as_ref()
        };

        let stack_memory = thread.stack_memory(&memory_list);

        let mut stack = stackwalker::walk_stack(
            context,
            stack_memory.as_deref(),
            &modules,
            &system_info,
            options,
            symbol_provider,
        )
        .await;
        stack.thread_id = id;
        stack.thread_name = thread_names.get_name(id).map(|name| name.into_owned());

        // Frames outside every loaded module may sit where an unloaded
        // module used to be; note each candidate and the offset into it.
        for frame in &mut stack.frames {
            if frame.module.is_none() {
                let mut offsets = BTreeMap::new();
                for unloaded in unloaded_modules.modules_at_address(frame.instruction) {
                    let offset = frame.instruction - unloaded.raw.base_of_image;
                    offsets
                        .entry(unloaded.name.clone())
                        .or_insert_with(BTreeSet::new)
                        .insert(offset);
                }
                frame.unloaded_modules = offsets;
            }
        }

        let was_interrupted = stack.info == CallStackInfo::Interrupted;
        threads.push(stack);
        if was_interrupted {
            // Cooperative cancellation: leave the remaining threads out
            // entirely rather than produce untrustworthy stacks.
            interrupted = true;
            break;
        }
    }

    // Modules whose symbols were consulted and found missing or broken.
    let symbol_stats = symbol_provider.stats();
    let mut modules_without_symbols = vec![];
    let mut modules_with_corrupt_symbols = vec![];
    for (name, stats) in &symbol_stats {
        if stats.corrupt_symbols {
            modules_with_corrupt_symbols.push(name.clone());
        } else if !stats.loaded_symbols {
            modules_without_symbols.push(name.clone());
        }
    }
    modules_without_symbols.sort();
    modules_with_corrupt_symbols.sort();

    let status = if interrupted {
        ProcessStatus::Interrupted
    } else if corrupt {
        ProcessStatus::CorruptDump
    } else if exception.is_some() {
        if exception_context.is_some() {
            ProcessStatus::Crashed
        } else {
            ProcessStatus::NoCrashContext
        }
    } else {
        ProcessStatus::Ok
    };

    let unknown_streams = dump.unknown_streams().collect();

    Ok(ProcessState {
        process_id,
        time: dump.written_at(),
        process_create_time,
        crash_reason,
        crash_address,
        assertion,
        requesting_thread,
        status,
        system_info,
        linux_standard_base,
        threads,
        modules,
        unloaded_modules,
        modules_without_symbols,
        modules_with_corrupt_symbols,
        unknown_streams,
        symbol_stats,
    })
}
