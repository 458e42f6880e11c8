//! Lookup operations over a parsed [`SymbolFile`].

use std::path::Path;

use tracing::trace;

use crate::sym_file::parser::parse_symbol_bytes;
use crate::{FrameSymbolizer, FrameWalker, Module, SymbolError, MAX_INLINE_DEPTH};

pub use crate::sym_file::types::*;

mod parser;
pub mod types;
pub mod walker;

impl SymbolFile {
    /// Parse a symbol file from disk.
    pub fn from_file(path: &Path) -> Result<SymbolFile, SymbolError> {
        let bytes = std::fs::read(path)?;
        parse_symbol_bytes(&bytes)
    }

    /// Parse a symbol file from memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<SymbolFile, SymbolError> {
        parse_symbol_bytes(bytes)
    }

    /// Fill in function, source line, and inline information for `frame`.
    ///
    /// Addresses are resolved module-relative. A `FUNC` record covering the
    /// address wins; failing that, the nearest preceding `PUBLIC` is used,
    /// but only if no `FUNC` sits between it and the address (a PUBLIC
    /// can't plausibly extend across another function).
    pub fn fill_symbol(&self, module: &dyn Module, frame: &mut dyn FrameSymbolizer) {
        if frame.get_instruction() < module.base_address() {
            return;
        }
        let addr = frame.get_instruction() - module.base_address();

        if let Some(func) = self.functions.get(addr) {
            // STACK WIN records know parameter sizes more reliably than
            // FUNC records do, and later STACK WIN evaluation consumes the
            // value we set here, so prefer theirs.
            let parameter_size = if let Some(info) = self.win_stack_framedata_info.get(addr) {
                info.parameter_size
            } else if let Some(info) = self.win_stack_fpo_info.get(addr) {
                info.parameter_size
            } else {
                func.parameter_size
            };

            frame.set_function(
                &func.name,
                func.address + module.base_address(),
                parameter_size,
            );
            if let Some(line) = func.lines.get(addr) {
                if let Some(file) = self.files.get(&line.file) {
                    frame.set_source_file(file, line.line, line.address + module.base_address());
                }
            }

            self.fill_inline_frames(func, addr, frame);
        } else if let Some(public) = self.find_nearest_public(addr) {
            // Find the nearest FUNC *before* the address: if the PUBLIC
            // starts at or before that FUNC, the FUNC truncates it and the
            // PUBLIC cannot cover the address. Binary search gives the
            // would-be insertion point; the entry before it is the nearest
            // preceding range.
            let funcs_slice = self.functions.ranges_values().as_slice();
            let prev_func = funcs_slice
                .binary_search_by_key(&addr, |(range, _)| range.start)
                .err()
                .and_then(|idx| idx.checked_sub(1))
                .and_then(|idx| funcs_slice.get(idx));
            if let Some((_, prev_func)) = prev_func {
                if public.address <= prev_func.address {
                    return;
                }
            }

            frame.set_function(
                &public.name,
                public.address + module.base_address(),
                public.parameter_size,
            );
        }
    }

    /// Synthesize inline frames for `addr`, innermost first.
    ///
    /// Each inline range covering the address contributes one frame named
    /// by its origin; the call file/line locate the call site in the
    /// enclosing function. Depth is capped to bound memory on hostile
    /// input.
    fn fill_inline_frames(&self, func: &Function, addr: u64, frame: &mut dyn FrameSymbolizer) {
        let mut covering = vec![];
        for depth in 0..MAX_INLINE_DEPTH as u32 {
            match func.inlinee_at_depth(depth, addr) {
                Some(inlinee) => covering.push(inlinee),
                None => break,
            }
        }
        for inlinee in covering.iter().rev() {
            let name = match self.inline_origins.get(&inlinee.origin_id) {
                Some(name) => name.as_str(),
                // A dangling origin id degrades this one record.
                None => "<unknown inlined function>",
            };
            let file = self.files.get(&inlinee.call_file).map(|f| f.as_str());
            frame.add_inline_frame(name, file, Some(inlinee.call_line));
        }
    }

    /// Evaluate unwind rules covering the walker's frame.
    ///
    /// Framedata records are preferred over FPO over CFI; whichever is
    /// tried first and succeeds wins.
    pub fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        if walker.get_instruction() < module.base_address() {
            return None;
        }
        let addr = walker.get_instruction() - module.base_address();

        let win_result = if let Some(info) = self.win_stack_framedata_info.get(addr) {
            trace!("unwind: trying STACK WIN framedata");
            walker::walk_with_stack_win_framedata(info, walker)
        } else if let Some(info) = self.win_stack_fpo_info.get(addr) {
            trace!("unwind: trying STACK WIN fpo");
            walker::walk_with_stack_win_fpo(info, walker)
        } else {
            None
        };

        win_result.or_else(|| {
            let info = self.cfi_stack_info.get(addr)?;
            // Deltas past the target address don't apply.
            let mut count = 0;
            let len = info.add_rules.len();
            while count < len && info.add_rules[count].address <= addr {
                count += 1;
            }
            walker::walk_with_stack_cfi(&info.init, &info.add_rules[0..count], walker)
        })
    }

    /// The nearest `PUBLIC` whose address is at or below `addr`.
    pub fn find_nearest_public(&self, addr: u64) -> Option<&PublicSymbol> {
        self.publics.iter().rev().find(|p| p.address <= addr)
    }

    /// The CFI rules covering module-relative `addr`, merged down to the
    /// applicable deltas. Mostly useful for inspection and tests; walking
    /// goes through [`SymbolFile::walk_frame`].
    pub fn cfi_rules_at(&self, addr: u64) -> Option<(&CfiRules, &[CfiRules])> {
        let info = self.cfi_stack_info.get(addr)?;
        let count = info
            .add_rules
            .iter()
            .take_while(|rule| rule.address <= addr)
            .count();
        Some((&info.init, &info.add_rules[..count]))
    }

    /// The `STACK WIN` record covering module-relative `addr`, preferring
    /// framedata over FPO.
    pub fn win_record_at(&self, addr: u64) -> Option<&StackInfoWin> {
        self.win_stack_framedata_info
            .get(addr)
            .or_else(|| self.win_stack_fpo_info.get(addr))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{SimpleFrame, SimpleModule};

    fn test_symbols() -> SymbolFile {
        SymbolFile::from_bytes(
            b"MODULE Linux x86 ffff0000 bar
FILE 53 bar.c
PUBLIC 2234 10 some public
FUNC 1000 30 10 another func
1000 30 7 53
",
        )
        .unwrap()
    }

    #[test]
    fn test_fill_symbol_func() {
        let sym = test_symbols();
        let module = SimpleModule {
            base_address: Some(0x10000),
            ..SimpleModule::default()
        };
        let mut frame = SimpleFrame::with_instruction(0x11010);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.function.unwrap(), "another func");
        assert_eq!(frame.function_base.unwrap(), 0x11000);
        assert_eq!(frame.source_file.unwrap(), "bar.c");
        assert_eq!(frame.source_line.unwrap(), 7);
    }

    #[test]
    fn test_fill_symbol_public_fallback() {
        let sym = test_symbols();
        let module = SimpleModule {
            base_address: Some(0x10000),
            ..SimpleModule::default()
        };
        // Past the PUBLIC, no FUNC in between.
        let mut frame = SimpleFrame::with_instruction(0x12240);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.function.unwrap(), "some public");
    }

    #[test]
    fn test_fill_symbol_public_truncated_by_func() {
        let sym = SymbolFile::from_bytes(
            b"MODULE Linux x86 ffff0000 bar
PUBLIC 1000 0 early public
FUNC 2000 30 10 some func
",
        )
        .unwrap();
        let module = SimpleModule::default();
        // The PUBLIC at 0x1000 can't extend past the FUNC at 0x2000.
        let mut frame = SimpleFrame::with_instruction(0x2500);
        sym.fill_symbol(&module, &mut frame);
        assert!(frame.function.is_none());
    }

    #[test]
    fn test_fill_symbol_below_base() {
        let sym = test_symbols();
        let module = SimpleModule {
            base_address: Some(0x10000),
            ..SimpleModule::default()
        };
        let mut frame = SimpleFrame::with_instruction(0x100);
        sym.fill_symbol(&module, &mut frame);
        assert!(frame.function.is_none());
    }

    #[test]
    fn test_inline_frames() {
        let sym = SymbolFile::from_bytes(
            b"MODULE Linux x86_64 ABCD1234 libfoo.so
FILE 0 outer.c
FILE 1 inlined.h
INLINE_ORIGIN 0 middle()
INLINE_ORIGIN 1 innermost()
FUNC 1000 100 0 outer
INLINE 0 10 0 0 1010 20
INLINE 1 22 1 1 1014 8
1000 100 9 0
",
        )
        .unwrap();
        let module = SimpleModule::default();
        let mut frame = SimpleFrame::with_instruction(0x1015);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.function.as_deref(), Some("outer"));
        // Innermost first.
        assert_eq!(
            frame.inlines,
            vec![
                (
                    "innermost()".to_string(),
                    Some("inlined.h".to_string()),
                    Some(22)
                ),
                ("middle()".to_string(), Some("outer.c".to_string()), Some(10)),
            ]
        );

        // Outside the inline ranges only the physical frame remains.
        let mut frame = SimpleFrame::with_instruction(0x1040);
        sym.fill_symbol(&module, &mut frame);
        assert_eq!(frame.function.as_deref(), Some("outer"));
        assert!(frame.inlines.is_empty());
    }

    #[test]
    fn test_cfi_rules_at() {
        let sym = SymbolFile::from_bytes(
            b"MODULE Linux x86 ffff0000 bar
STACK CFI INIT 1000 100 .cfa: $esp 4 + .ra: .cfa 4 - ^
STACK CFI 1010 .cfa: $esp 8 +
STACK CFI 1020 .cfa: $esp 12 +
",
        )
        .unwrap();
        let (init, deltas) = sym.cfi_rules_at(0x1015).unwrap();
        assert_eq!(init.address, 0x1000);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].address, 0x1010);

        let (_, deltas) = sym.cfi_rules_at(0x1020).unwrap();
        assert_eq!(deltas.len(), 2);

        assert!(sym.cfi_rules_at(0x2000).is_none());
    }
}
