//! A parser for the minidump file format.
//!
//! Reading is strictly non-destructive and lazy: [`Dump::read`] only parses
//! the header and stream directory, and each stream is decoded on request
//! through [`Dump::get_stream`] (or the named convenience accessors). All
//! decoding is explicit and endian-aware through [`scroll`]; nothing is ever
//! reinterpret-cast from raw bytes, so behavior is identical on any host.
//!
//! ```no_run
//! use debris_dump::{Dump, DumpSystemInfo, DumpThreadList};
//!
//! # fn main() -> Result<(), debris_dump::Error> {
//! let dump = Dump::read_path("testdata/crash.dmp")?;
//! let system_info = dump.get_stream::<DumpSystemInfo>()?;
//! let threads = dump.get_stream::<DumpThreadList>()?;
//! println!("{:?} threads on {:?}", threads.threads.len(), system_info.os);
//! # Ok(())
//! # }
//! ```

mod context;
mod crash_reason;
mod dump;
mod strings;
pub mod system_info;

pub use debris_format::format;
pub use debris_format::range::IntoRangeMapSafe;
pub use debris_format::traits::{basename, Module};

pub use crate::context::*;
pub use crate::crash_reason::CrashReason;
pub use crate::dump::*;
pub use crate::system_info::{Cpu, Os, PointerWidth};
