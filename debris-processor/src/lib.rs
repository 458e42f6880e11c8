//! The offline crash-dump processor.
//!
//! [`process_dump`] reads every stream it needs from a parsed
//! [`Dump`][debris_dump::Dump], walks the stack of each thread with the
//! architecture-appropriate unwinder, symbolizes the frames through a
//! [`SymbolProvider`], and assembles a [`ProcessState`]: crash reason and
//! address, requesting thread, per-thread call stacks with trust levels,
//! and the module list annotated with symbol status.
//!
//! ```no_run
//! use debris_dump::Dump;
//! use debris_processor::{simple_symbol_supplier, ProcessError, Symbolizer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ProcessError> {
//!     let dump = Dump::read_path("crash.dmp")?;
//!     let symbolizer = Symbolizer::new(simple_symbol_supplier(vec!["symbols".into()]));
//!     let state = debris_processor::process_dump(&dump, &symbolizer).await?;
//!     state.print(&mut std::io::stdout()).unwrap();
//!     Ok(())
//! }
//! ```

mod process_state;
mod processor;
mod stackwalker;
mod symbols;
pub mod system_info;

pub use debris_dump::CrashReason;

pub use crate::process_state::*;
pub use crate::processor::*;
pub use crate::stackwalker::walk_stack;
pub use crate::symbols::*;
pub use crate::system_info::SystemInfo;
