//! The in-memory shape of a parsed symbol file.
//!
//! Records reference each other only by the integer ids the text format
//! uses (`FILE` ids, `INLINE_ORIGIN` ids); a dangling id degrades the one
//! record that uses it, never the table.

use std::cmp::Ordering;
use std::collections::HashMap;

use range_map::{Range, RangeMap};

/// A `PUBLIC` record: an exported symbol with no known extent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PublicSymbol {
    /// Module-relative address.
    pub address: u64,
    /// Size of the function's stack parameters, for STACK WIN sizing.
    pub parameter_size: u32,
    pub name: String,
}

impl Ord for PublicSymbol {
    fn cmp(&self, other: &PublicSymbol) -> Ordering {
        self.address
            .cmp(&other.address)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.parameter_size.cmp(&other.parameter_size))
    }
}

impl PartialOrd for PublicSymbol {
    fn partial_cmp(&self, other: &PublicSymbol) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A machine-code range attributed to one source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// Module-relative start address.
    pub address: u64,
    pub size: u32,
    /// Index into [`SymbolFile::files`].
    pub file: u32,
    pub line: u32,
}

/// An `INLINE` record: one address range of one inlined call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inlinee {
    /// Nesting depth; 0 is inlined directly into the surrounding `FUNC`.
    pub depth: u32,
    /// Module-relative start address of this range.
    pub address: u64,
    pub size: u32,
    /// Index into [`SymbolFile::files`] for the call site.
    pub call_file: u32,
    /// Source line of the call site in the enclosing function.
    pub call_line: u32,
    /// Index into [`SymbolFile::inline_origins`].
    pub origin_id: u32,
}

/// A `FUNC` record with its child line and inline records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// Module-relative start address.
    pub address: u64,
    pub size: u32,
    pub parameter_size: u32,
    pub name: String,
    /// Marked ambiguous (`FUNC m`) by the producer.
    pub is_multiple: bool,
    pub lines: RangeMap<u64, SourceLine>,
    /// Inline ranges, sorted by (depth, address).
    pub inlinees: Vec<Inlinee>,
}

impl Function {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.address,
            self.address.checked_add(self.size as u64)? - 1,
        ))
    }

    /// The inline range at `depth` containing `addr`, if any.
    pub fn inlinee_at_depth(&self, depth: u32, addr: u64) -> Option<&Inlinee> {
        let first = self
            .inlinees
            .partition_point(|i| (i.depth, i.address) < (depth, 0));
        self.inlinees[first..]
            .iter()
            .take_while(|i| i.depth == depth)
            .find(|i| i.address <= addr && addr - i.address < i.size as u64)
    }
}

/// One CFI rule string and the address it starts applying at.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CfiRules {
    pub address: u64,
    /// `REG: postfix-expr` pairs, whitespace separated.
    pub rules: String,
}

/// A `STACK CFI INIT` record and its delta rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackInfoCfi {
    pub init: CfiRules,
    /// Size of the whole covered range.
    pub size: u32,
    /// Delta rules, sorted by address.
    pub add_rules: Vec<CfiRules>,
}

impl StackInfoCfi {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.init.address,
            self.init.address.checked_add(self.size as u64)? - 1,
        ))
    }
}

/// Which flavor a `STACK WIN` record is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinFrameType {
    /// FPO-style: a fixed frame layout, no program string.
    Fpo(StackInfoWin),
    /// Framedata-style: carries an expression program.
    FrameData(StackInfoWin),
    /// A type this crate doesn't evaluate.
    Unhandled,
}

/// The tail of a `STACK WIN` record: either an expression program or a
/// "function allocates %ebp" flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinStackThing {
    ProgramString(String),
    AllocatesBasePointer(bool),
}

/// A `STACK WIN` unwind record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackInfoWin {
    pub address: u64,
    pub size: u32,
    pub prologue_size: u32,
    pub epilogue_size: u32,
    pub parameter_size: u32,
    pub saved_register_size: u32,
    pub local_size: u32,
    pub max_stack_size: u32,
    pub program_string_or_base_pointer: WinStackThing,
}

impl StackInfoWin {
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.address,
            self.address.checked_add(self.size as u64)? - 1,
        ))
    }
}

/// A parsed symbol file for one module.
#[derive(Debug, PartialEq)]
pub struct SymbolFile {
    /// OS named by the MODULE header.
    pub os: String,
    /// Architecture named by the MODULE header; fixes which register names
    /// its CFI rules may use.
    pub arch: String,
    /// Debug id named by the MODULE header.
    pub debug_id: String,
    /// Debug file named by the MODULE header.
    pub debug_file: String,
    /// `FILE` records.
    pub files: HashMap<u32, String>,
    /// `INLINE_ORIGIN` records.
    pub inline_origins: HashMap<u32, String>,
    /// `PUBLIC` records, sorted by address.
    pub publics: Vec<PublicSymbol>,
    /// `FUNC` records, sorted and non-overlapping.
    pub functions: RangeMap<u64, Function>,
    /// `STACK CFI` unwind info.
    pub cfi_stack_info: RangeMap<u64, StackInfoCfi>,
    /// `STACK WIN 4` (framedata) unwind info.
    pub win_stack_framedata_info: RangeMap<u64, StackInfoWin>,
    /// `STACK WIN 0` (FPO) unwind info.
    pub win_stack_fpo_info: RangeMap<u64, StackInfoWin>,
}
