//! Loading and querying Breakpad text-format symbol files.
//!
//! The pieces fit together like this:
//!
//! * [`SymbolSupplier`] locates the bytes of a symbol file for a module.
//!   Implementations here: [`SimpleSymbolSupplier`] (disk paths in the
//!   symbol-server layout), [`StringSymbolSupplier`] (in-memory, for
//!   tests), [`NoSymbolSupplier`].
//! * [`SymbolFile`] is a parsed symbol table; [`Symbolizer`] caches one per
//!   module and answers lookups.
//! * [`FrameSymbolizer`] and [`FrameWalker`] are the callback seams through
//!   which lookups and CFI evaluation write their results; stack-walking
//!   code implements them.
//!
//! The supplier is asynchronous and is the only suspension point in dump
//! processing; a supplier may also return [`SymbolError::Interrupted`] to
//! cancel a walk cooperatively (e.g. on a deadline).

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use debugid::{CodeId, DebugId};
use tracing::trace;

pub use debris_format::traits::{basename, Module};

mod sym_file;

pub use crate::sym_file::types::*;
pub use crate::sym_file::walker;
pub use crate::sym_file::SymbolFile;

/// The maximum number of synthesized inline frames per physical frame.
pub const MAX_INLINE_DEPTH: usize = 16;

/// Results of locating symbols for one module.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// No symbol file could be located; another supplier might find one.
    #[error("symbol file not found")]
    NotFound,
    /// The module carries no debug file/id, so there is nothing to look up.
    #[error("the debug file or id were missing")]
    MissingDebugFileOrId,
    /// The symbol file exists but could not be read.
    #[error("couldn't read input stream")]
    LoadError(#[from] std::io::Error),
    /// The symbol file was too corrupt to parse at all.
    ///
    /// Individual bad records are repaired or skipped during parsing; this
    /// is for files missing their mandatory structure.
    #[error("parse error: {0} at line {1}")]
    ParseError(&'static str, u64),
    /// The supplier gave up cooperatively (deadline, cancellation).
    ///
    /// Walkers propagate this outward and the assembler reports a partial
    /// result; whether to retry is the supplier's own business.
    #[error("symbol lookup interrupted")]
    Interrupted,
}

impl PartialEq for SymbolError {
    fn eq(&self, other: &SymbolError) -> bool {
        matches!(
            (self, other),
            (SymbolError::NotFound, SymbolError::NotFound)
                | (
                    SymbolError::MissingDebugFileOrId,
                    SymbolError::MissingDebugFileOrId
                )
                | (SymbolError::LoadError(_), SymbolError::LoadError(_))
                | (SymbolError::ParseError(..), SymbolError::ParseError(..))
                | (SymbolError::Interrupted, SymbolError::Interrupted)
        )
    }
}

/// Failure to fill symbol information for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FillSymbolError {
    /// No symbols are available for the module.
    #[error("no symbols for module")]
    NotFound,
    /// The supplier interrupted the lookup.
    #[error("symbol lookup interrupted")]
    Interrupted,
}

/// Failure to evaluate unwind info for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    /// No unwind rules cover the address (or evaluation failed); the
    /// walker should fall back to its next strategy.
    #[error("no unwind info for address")]
    NoUnwindInfo,
    /// The supplier interrupted the lookup; abort the walk.
    #[error("symbol lookup interrupted")]
    Interrupted,
}

/// Callbacks through which symbolication writes its results.
pub trait FrameSymbolizer {
    /// The program-counter value being symbolized.
    fn get_instruction(&self) -> u64;
    /// Record the enclosing function.
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32);
    /// Record the source location.
    fn set_source_file(&mut self, file: &str, line: u32, base: u64);
    /// Record one synthesized inline frame, innermost first.
    fn add_inline_frame(&mut self, _name: &str, _file: Option<&str>, _line: Option<u32>) {}
}

/// Callbacks through which CFI evaluation reads callee state and writes
/// caller state.
pub trait FrameWalker {
    /// The address being unwound from.
    fn get_instruction(&self) -> u64;
    /// Whether a grand-callee frame exists (frame N-2).
    fn has_grand_callee(&self) -> bool;
    /// Parameter size of the grand-callee, for STACK WIN frame sizing.
    fn get_grand_callee_parameter_size(&self) -> u32;
    /// Read a register-sized value from stack memory.
    fn get_register_at_address(&self, address: u64) -> Option<u64>;
    /// Read a callee register by name.
    fn get_callee_register(&self, name: &str) -> Option<u64>;
    /// Write a caller register by name.
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()>;
    /// Mark a caller register as unrecoverable.
    fn clear_caller_register(&mut self, name: &str);
    /// Commit the computed CFA (becomes the caller's stack pointer).
    fn set_cfa(&mut self, val: u64) -> Option<()>;
    /// Commit the computed return address (becomes the caller's pc).
    fn set_ra(&mut self, val: u64) -> Option<()>;
}

/// A plain-data [`Module`] implementation.
///
/// Useful to look up symbols from a debug file/id pair without a minidump
/// in hand.
#[derive(Default)]
pub struct SimpleModule {
    pub base_address: Option<u64>,
    pub size: Option<u64>,
    pub code_file: Option<String>,
    pub code_identifier: Option<CodeId>,
    pub debug_file: Option<String>,
    pub debug_id: Option<DebugId>,
    pub version: Option<String>,
}

impl SimpleModule {
    /// A module known only by its `debug_file` and `debug_id`.
    pub fn new(debug_file: &str, debug_id: DebugId) -> SimpleModule {
        SimpleModule {
            debug_file: Some(String::from(debug_file)),
            debug_id: Some(debug_id),
            ..SimpleModule::default()
        }
    }
}

impl Module for SimpleModule {
    fn base_address(&self) -> u64 {
        self.base_address.unwrap_or(0)
    }
    fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }
    fn code_file(&self) -> Cow<'_, str> {
        self.code_file
            .as_ref()
            .map_or(Cow::from(""), |s| Cow::Borrowed(&s[..]))
    }
    fn code_identifier(&self) -> Option<CodeId> {
        self.code_identifier.clone()
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        self.debug_file.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<'_, str>> {
        self.version.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
}

/// If `filename` ends with `match_extension`, swap it for `new_extension`;
/// otherwise append.
fn replace_or_add_extension(filename: &str, match_extension: &str, new_extension: &str) -> String {
    let mut bits = filename.split('.').collect::<Vec<_>>();
    if bits.len() > 1
        && bits
            .last()
            .is_some_and(|e| e.to_lowercase() == match_extension)
    {
        bits.pop();
    }
    bits.push(new_extension);
    bits.join(".")
}

/// The relative path at which a module's symbol file lives.
///
/// The layout is the Microsoft symbol-server convention used by Breakpad
/// tooling: `<debug file>/<debug id>/<debug file>.sym` (with a `.pdb`
/// leaf losing its extension).
pub fn symbol_relative_path(module: &(dyn Module + Sync)) -> Option<String> {
    let debug_file = module.debug_file()?;
    let debug_id = module.debug_identifier()?;
    let leaf = basename(&debug_file);
    let filename = replace_or_add_extension(leaf, "pdb", "sym");
    Some([leaf, &debug_id.breakpad().to_string(), &filename[..]].join("/"))
}

/// Locates and loads symbol files for modules.
///
/// Implementations may hit disk, a network cache, or nothing at all; the
/// processing core never touches the filesystem except through this seam.
#[async_trait]
pub trait SymbolSupplier {
    /// Locate and parse a symbol file for `module`.
    async fn locate_symbols(
        &self,
        module: &(dyn Module + Sync),
    ) -> Result<SymbolFile, SymbolError>;
}

/// A [`SymbolSupplier`] over local disk paths in the symbol-server layout.
pub struct SimpleSymbolSupplier {
    paths: Vec<PathBuf>,
}

impl SimpleSymbolSupplier {
    pub fn new(paths: Vec<PathBuf>) -> SimpleSymbolSupplier {
        SimpleSymbolSupplier { paths }
    }
}

#[async_trait]
impl SymbolSupplier for SimpleSymbolSupplier {
    #[tracing::instrument(name = "symbols", level = "trace", skip_all, fields(module = basename(&module.code_file())))]
    async fn locate_symbols(
        &self,
        module: &(dyn Module + Sync),
    ) -> Result<SymbolFile, SymbolError> {
        let rel_path = symbol_relative_path(module).ok_or(SymbolError::MissingDebugFileOrId)?;
        for path in &self.paths {
            let test_path = path.join(&rel_path);
            if std::fs::metadata(&test_path).map(|m| m.is_file()).unwrap_or(false) {
                trace!("found symbol file {}", test_path.display());
                return SymbolFile::from_file(&test_path);
            }
        }
        trace!("no symbol file under any configured path");
        Err(SymbolError::NotFound)
    }
}

/// A [`SymbolSupplier`] that never finds anything.
pub struct NoSymbolSupplier;

#[async_trait]
impl SymbolSupplier for NoSymbolSupplier {
    async fn locate_symbols(
        &self,
        _module: &(dyn Module + Sync),
    ) -> Result<SymbolFile, SymbolError> {
        Err(SymbolError::NotFound)
    }
}

/// A [`SymbolSupplier`] mapping module code files to in-memory symbol text.
/// Meant for tests.
#[derive(Default, Debug, Clone)]
pub struct StringSymbolSupplier {
    modules: HashMap<String, String>,
}

impl StringSymbolSupplier {
    pub fn new(modules: HashMap<String, String>) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl SymbolSupplier for StringSymbolSupplier {
    async fn locate_symbols(
        &self,
        module: &(dyn Module + Sync),
    ) -> Result<SymbolFile, SymbolError> {
        match self.modules.get(&*module.code_file()) {
            Some(symbols) => SymbolFile::from_bytes(symbols.as_bytes()),
            None => Err(SymbolError::NotFound),
        }
    }
}

/// A [`FrameSymbolizer`] that just stores what it is given.
#[derive(Debug, Default)]
pub struct SimpleFrame {
    pub instruction: u64,
    pub function: Option<String>,
    pub function_base: Option<u64>,
    pub parameter_size: Option<u32>,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
    pub source_line_base: Option<u64>,
    /// `(name, file, line)` triples, innermost first.
    pub inlines: Vec<(String, Option<String>, Option<u32>)>,
}

impl SimpleFrame {
    pub fn with_instruction(instruction: u64) -> SimpleFrame {
        SimpleFrame {
            instruction,
            ..SimpleFrame::default()
        }
    }
}

impl FrameSymbolizer for SimpleFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32) {
        self.function = Some(String::from(name));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
    fn add_inline_frame(&mut self, name: &str, file: Option<&str>, line: Option<u32>) {
        self.inlines
            .push((String::from(name), file.map(String::from), line));
    }
}

/// Statistics about the symbols resolved for one module.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct SymbolStats {
    /// A symbol file was found and parsed.
    pub loaded_symbols: bool,
    /// A symbol file was found but failed to parse.
    pub corrupt_symbols: bool,
}

// `Module` can't be a hash key directly (trait object), so cache entries
// are keyed by the identity tuple.
type ModuleKey = (String, Option<String>, Option<String>, Option<String>);

fn module_key(module: &(dyn Module + Sync)) -> ModuleKey {
    (
        module.code_file().to_string(),
        module.code_identifier().map(|id| id.to_string()),
        module.debug_file().map(|s| s.to_string()),
        module.debug_identifier().map(|id| id.to_string()),
    )
}

/// A cachable, coalesced symbol load: the first request runs the supplier,
/// concurrent requests await the same cell.
type CachedOperation<T, E> = Arc<tokio::sync::OnceCell<Result<T, E>>>;

/// The caching symbol resolver.
///
/// Owns every parsed [`SymbolFile`] for the lifetime of a processing run;
/// entries are never evicted while a walk is in flight.
pub struct Symbolizer {
    supplier: Box<dyn SymbolSupplier + Send + Sync + 'static>,
    symbols: Mutex<HashMap<ModuleKey, CachedOperation<SymbolFile, SymbolError>>>,
}

impl Symbolizer {
    /// A symbolizer backed by `supplier`.
    pub fn new<T: SymbolSupplier + Send + Sync + 'static>(supplier: T) -> Symbolizer {
        Symbolizer {
            supplier: Box::new(supplier),
            symbols: Mutex::new(HashMap::new()),
        }
    }

    /// Convenience lookup: the symbol covering `address` in the module
    /// described by `debug_file` and `debug_id`.
    pub async fn get_symbol_at_address(
        &self,
        debug_file: &str,
        debug_id: DebugId,
        address: u64,
    ) -> Option<String> {
        let module = SimpleModule::new(debug_file, debug_id);
        let mut frame = SimpleFrame::with_instruction(address);
        self.fill_symbol(&module, &mut frame).await.ok()?;
        frame.function
    }

    /// Fill function/source information for `frame` from `module`'s
    /// symbols.
    pub async fn fill_symbol(
        &self,
        module: &(dyn Module + Sync),
        frame: &mut (dyn FrameSymbolizer + Send),
    ) -> Result<(), FillSymbolError> {
        let cached = self.get_symbols(module).await;
        match cached.get().unwrap_or(&Err(SymbolError::NotFound)) {
            Ok(sym) => {
                sym.fill_symbol(module, frame);
                Ok(())
            }
            Err(SymbolError::Interrupted) => Err(FillSymbolError::Interrupted),
            Err(_) => Err(FillSymbolError::NotFound),
        }
    }

    /// Evaluate unwind rules for the `walker`'s frame from `module`'s
    /// symbols.
    pub async fn walk_frame(
        &self,
        module: &(dyn Module + Sync),
        walker: &mut (dyn FrameWalker + Send),
    ) -> Result<(), WalkError> {
        let cached = self.get_symbols(module).await;
        match cached.get().unwrap_or(&Err(SymbolError::NotFound)) {
            Ok(sym) => {
                trace!("have symbols for module, searching for unwind rules");
                sym.walk_frame(module, walker).ok_or(WalkError::NoUnwindInfo)
            }
            Err(SymbolError::Interrupted) => Err(WalkError::Interrupted),
            Err(_) => {
                trace!("no symbols for module, cannot use cfi");
                Err(WalkError::NoUnwindInfo)
            }
        }
    }

    /// Per-module symbol statistics, keyed by the module's file name.
    pub fn stats(&self) -> HashMap<String, SymbolStats> {
        self.symbols
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(key, cell)| {
                let result = cell.get()?;
                let mut stats = SymbolStats::default();
                match result {
                    Ok(_) => stats.loaded_symbols = true,
                    Err(SymbolError::ParseError(..)) => {
                        stats.loaded_symbols = true;
                        stats.corrupt_symbols = true;
                    }
                    Err(_) => {}
                }
                Some((basename(&key.0).to_string(), stats))
            })
            .collect()
    }

    async fn get_symbols(
        &self,
        module: &(dyn Module + Sync),
    ) -> CachedOperation<SymbolFile, SymbolError> {
        let key = module_key(module);
        let cell = self.symbols.lock().unwrap().entry(key).or_default().clone();
        cell.get_or_init(|| async {
            trace!("locating symbols for module {}", module.code_file());
            self.supplier.locate_symbols(module).await
        })
        .await;
        cell
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::io::Write as _;
    use std::path::Path;
    use std::str::FromStr;

    #[test]
    fn test_relative_symbol_path() {
        let debug_id = DebugId::from_str("abcd1234-abcd-1234-abcd-abcd12345678-a").unwrap();
        let m = SimpleModule::new("foo.pdb", debug_id);
        assert_eq!(
            symbol_relative_path(&m).unwrap(),
            "foo.pdb/ABCD1234ABCD1234ABCDABCD12345678a/foo.sym"
        );

        let m2 = SimpleModule::new("foo.xyz", debug_id);
        assert_eq!(
            symbol_relative_path(&m2).unwrap(),
            "foo.xyz/ABCD1234ABCD1234ABCDABCD12345678a/foo.xyz.sym"
        );

        let m3 = SimpleModule::new("/path/to/foo.bin", debug_id);
        assert_eq!(
            symbol_relative_path(&m3).unwrap(),
            "foo.bin/ABCD1234ABCD1234ABCDABCD12345678a/foo.bin.sym"
        );

        let m4 = SimpleModule::new("c:\\path\\to\\foo.pdb", debug_id);
        assert_eq!(
            symbol_relative_path(&m4).unwrap(),
            "foo.pdb/ABCD1234ABCD1234ABCDABCD12345678a/foo.sym"
        );

        assert!(symbol_relative_path(&SimpleModule::default()).is_none());
    }

    fn write_symbol_file(path: &Path, contents: &[u8]) {
        let dir = path.parent().unwrap();
        fs::create_dir_all(dir).unwrap();
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[tokio::test]
    async fn test_simple_symbol_supplier() {
        let tmp = tempfile::tempdir().unwrap();
        let supplier = SimpleSymbolSupplier::new(vec![tmp.path().to_owned()]);

        let debug_id = DebugId::from_str("abcd1234-0000-0000-0000-abcd12345678-a").unwrap();
        let module = SimpleModule::new("foo.pdb", debug_id);
        assert_eq!(
            supplier.locate_symbols(&module).await.err(),
            Some(SymbolError::NotFound)
        );

        write_symbol_file(
            &tmp.path()
                .join("foo.pdb/ABCD1234000000000000ABCD12345678a/foo.sym"),
            b"MODULE Linux x86 ABCD1234000000000000ABCD12345678a foo\n",
        );
        assert!(supplier.locate_symbols(&module).await.is_ok());

        // A module with no debug identity can't be looked up at all.
        assert_eq!(
            supplier.locate_symbols(&SimpleModule::default()).await.err(),
            Some(SymbolError::MissingDebugFileOrId)
        );

        // A present-but-garbled file is a parse error, not NotFound.
        let bad_id = DebugId::from_str("ffff0000-0000-0000-0000-abcd12345678-a").unwrap();
        let bad_module = SimpleModule::new("baz.pdb", bad_id);
        write_symbol_file(
            &tmp.path()
                .join("baz.pdb/FFFF0000000000000000ABCD12345678a/baz.sym"),
            b"this is not a symbol file\n",
        );
        assert!(matches!(
            supplier.locate_symbols(&bad_module).await,
            Err(SymbolError::ParseError(..))
        ));
    }

    #[tokio::test]
    async fn test_symbolizer_caches_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let symbolizer = Symbolizer::new(SimpleSymbolSupplier::new(vec![tmp.path().to_owned()]));
        let debug_id = DebugId::from_str("ffff0000-0000-0000-0000-abcd12345678-a").unwrap();
        let module = SimpleModule::new("bar.pdb", debug_id);

        let mut frame = SimpleFrame::with_instruction(0x1010);
        assert!(symbolizer.fill_symbol(&module, &mut frame).await.is_err());

        // Writing the file after the first lookup changes nothing; the miss
        // is cached for the lifetime of the symbolizer.
        write_symbol_file(
            &tmp.path()
                .join("bar.pdb/FFFF0000000000000000ABCD12345678a/bar.sym"),
            b"MODULE Linux x86 FFFF0000000000000000ABCD12345678a bar
FILE 53 bar.c
FUNC 1000 30 10 another func
1000 30 7 53
",
        );
        assert!(symbolizer.fill_symbol(&module, &mut frame).await.is_err());
        assert!(frame.function.is_none());
    }

    #[tokio::test]
    async fn test_symbolizer_fill() {
        let tmp = tempfile::tempdir().unwrap();
        let symbolizer = Symbolizer::new(SimpleSymbolSupplier::new(vec![tmp.path().to_owned()]));
        let debug_id = DebugId::from_str("abcd1234-abcd-1234-abcd-abcd12345678-a").unwrap();
        write_symbol_file(
            &tmp.path()
                .join("foo.pdb/ABCD1234ABCD1234ABCDABCD12345678a/foo.sym"),
            b"MODULE Linux x86 ABCD1234ABCD1234ABCDABCD12345678a foo
FILE 1 foo.c
FUNC 1000 30 10 some func
1000 30 100 1
",
        );
        let module = SimpleModule::new("foo.pdb", debug_id);
        let mut frame = SimpleFrame::with_instruction(0x1010);
        symbolizer.fill_symbol(&module, &mut frame).await.unwrap();
        assert_eq!(frame.function.unwrap(), "some func");
        assert_eq!(frame.function_base.unwrap(), 0x1000);
        assert_eq!(frame.source_file.unwrap(), "foo.c");
        assert_eq!(frame.source_line.unwrap(), 100);
        assert_eq!(frame.source_line_base.unwrap(), 0x1000);

        assert_eq!(
            symbolizer
                .get_symbol_at_address("foo.pdb", debug_id, 0x1010)
                .await
                .unwrap(),
            "some func"
        );
    }
}
