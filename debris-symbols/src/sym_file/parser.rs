//! The text-format symbol file parser.
//!
//! The format is line oriented: a mandatory `MODULE` header, then any mix
//! of `FILE`, `INLINE_ORIGIN`, `PUBLIC`, `FUNC` (with attached line and
//! `INLINE` children), `STACK WIN` and `STACK CFI` records. A malformed
//! line is logged and skipped; only a missing or garbled `MODULE` header
//! condemns the whole file.

use std::collections::HashMap;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{digit1, hex_digit1, space1};
use nom::combinator::{map, map_res, opt, rest};
use nom::sequence::{preceded, tuple};
use nom::IResult;
use range_map::Range;
use tracing::warn;

use debris_format::range::IntoRangeMapSafe;

use super::types::*;
use crate::SymbolError;

fn hex_u64(input: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |s| u64::from_str_radix(s, 16))(input)
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |s| u32::from_str_radix(s, 16))(input)
}

fn dec_u32(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse)(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_ascii_whitespace())(input)
}

/// `MODULE <os> <arch> <debug_id> <debug_file>`
fn module_line(input: &str) -> IResult<&str, (&str, &str, &str, &str)> {
    map(
        tuple((
            tag("MODULE"),
            space1,
            word,
            space1,
            word,
            space1,
            take_while1(|c: char| c.is_ascii_hexdigit()),
            space1,
            rest,
        )),
        |(_, _, os, _, arch, _, debug_id, _, debug_file)| (os, arch, debug_id, debug_file),
    )(input)
}

/// `FILE <id> <path>`
fn file_line(input: &str) -> IResult<&str, (u32, &str)> {
    map(
        tuple((tag("FILE"), space1, dec_u32, space1, rest)),
        |(_, _, id, _, path)| (id, path),
    )(input)
}

/// `INLINE_ORIGIN <id> <name>`
fn inline_origin_line(input: &str) -> IResult<&str, (u32, &str)> {
    map(
        tuple((tag("INLINE_ORIGIN"), space1, dec_u32, space1, rest)),
        |(_, _, id, _, name)| (id, name),
    )(input)
}

/// `INLINE <depth> <call_line> <call_file> <origin_id> [<address> <size>]+`
fn inline_line(input: &str) -> IResult<&str, impl Iterator<Item = Inlinee>> {
    let (input, (_, _, depth, _, call_line, _, call_file, _, origin_id)) = tuple((
        tag("INLINE"),
        space1,
        dec_u32,
        space1,
        dec_u32,
        space1,
        dec_u32,
        space1,
        dec_u32,
    ))(input)?;
    let (input, ranges) =
        nom::multi::many1(tuple((preceded(space1, hex_u64), preceded(space1, hex_u32))))(input)?;
    Ok((
        input,
        ranges.into_iter().map(move |(address, size)| Inlinee {
            depth,
            address,
            size,
            call_file,
            call_line,
            origin_id,
        }),
    ))
}

/// `FUNC [m] <address> <size> <param_size> <name>`
fn func_line(input: &str) -> IResult<&str, Function> {
    map(
        tuple((
            tag("FUNC"),
            opt(preceded(space1, tag("m"))),
            space1,
            hex_u64,
            space1,
            hex_u32,
            space1,
            hex_u32,
            space1,
            rest,
        )),
        |(_, multiple, _, address, _, size, _, parameter_size, _, name)| Function {
            address,
            size,
            parameter_size,
            name: name.to_string(),
            is_multiple: multiple.is_some(),
            lines: range_map::RangeMap::new(),
            inlinees: vec![],
        },
    )(input)
}

/// `<address> <size> <line> <file_id>`, a line record under a `FUNC`.
fn func_line_data(input: &str) -> IResult<&str, SourceLine> {
    map(
        tuple((
            hex_u64, space1, hex_u32, space1, dec_u32, space1, dec_u32,
        )),
        |(address, _, size, _, line, _, file)| SourceLine {
            address,
            size,
            file,
            line,
        },
    )(input)
}

/// `PUBLIC [m] <address> <param_size> <name>`
fn public_line(input: &str) -> IResult<&str, PublicSymbol> {
    map(
        tuple((
            tag("PUBLIC"),
            opt(preceded(space1, tag("m"))),
            space1,
            hex_u64,
            space1,
            hex_u32,
            space1,
            rest,
        )),
        |(_, _multiple, _, address, _, parameter_size, _, name)| PublicSymbol {
            address,
            parameter_size,
            name: name.to_string(),
        },
    )(input)
}

/// `STACK WIN <type> <rva> <code_size> <prolog> <epilog> <params>
///  <saved_regs> <locals> <max_stack> <has_program> <program-or-bp>`
fn stack_win_line(input: &str) -> IResult<&str, WinFrameType> {
    map(
        tuple((
            tuple((
                tag("STACK WIN"),
                space1,
                hex_digit1,
                space1,
                hex_u64,
                space1,
                hex_u32,
                space1,
                hex_u32,
                space1,
                hex_u32,
                space1,
            )),
            tuple((
                hex_u32,
                space1,
                hex_u32,
                space1,
                hex_u32,
                space1,
                hex_u32,
                space1,
                alt((tag("1"), tag("0"))),
                space1,
                rest,
            )),
        )),
        |(
            (_, _, ty, _, address, _, size, _, prologue_size, _, epilogue_size, _),
            (parameter_size, _, saved_register_size, _, local_size, _, max_stack_size, _, has_program, _, tail),
        )| {
            let program_string_or_base_pointer = if has_program == "1" {
                WinStackThing::ProgramString(tail.to_string())
            } else {
                WinStackThing::AllocatesBasePointer(tail == "1")
            };
            let info = StackInfoWin {
                address,
                size,
                prologue_size,
                epilogue_size,
                parameter_size,
                saved_register_size,
                local_size,
                max_stack_size,
                program_string_or_base_pointer,
            };
            match ty {
                "4" => WinFrameType::FrameData(info),
                "0" => WinFrameType::Fpo(info),
                _ => WinFrameType::Unhandled,
            }
        },
    )(input)
}

/// `STACK CFI INIT <address> <size> <rules>`
fn stack_cfi_init_line(input: &str) -> IResult<&str, StackInfoCfi> {
    map(
        tuple((
            tag("STACK CFI INIT"),
            space1,
            hex_u64,
            space1,
            hex_u32,
            space1,
            rest,
        )),
        |(_, _, address, _, size, _, rules)| StackInfoCfi {
            init: CfiRules {
                address,
                rules: rules.to_string(),
            },
            size,
            add_rules: vec![],
        },
    )(input)
}

/// `STACK CFI <address> <rules>`
fn stack_cfi_delta_line(input: &str) -> IResult<&str, CfiRules> {
    map(
        tuple((tag("STACK CFI"), space1, hex_u64, space1, rest)),
        |(_, _, address, _, rules)| CfiRules {
            address,
            rules: rules.to_string(),
        },
    )(input)
}

/// Did the whole line parse?
fn complete<T>(result: IResult<&str, T>) -> Option<T> {
    match result {
        Ok(("", value)) => Some(value),
        _ => None,
    }
}

#[derive(Default)]
struct SymbolFileBuilder {
    files: HashMap<u32, String>,
    inline_origins: HashMap<u32, String>,
    publics: Vec<PublicSymbol>,
    functions: Vec<Function>,
    cur_function: Option<Function>,
    cur_lines: Vec<SourceLine>,
    cfi: Vec<StackInfoCfi>,
    cur_cfi: Option<StackInfoCfi>,
    win_framedata: Vec<StackInfoWin>,
    win_fpo: Vec<StackInfoWin>,
}

impl SymbolFileBuilder {
    fn finish_function(&mut self) {
        if let Some(mut func) = self.cur_function.take() {
            func.lines = std::mem::take(&mut self.cur_lines)
                .into_iter()
                .map(|line| {
                    let range = Range::new(line.address, line.address + line.size as u64 - 1);
                    (Some(range), line)
                })
                .into_rangemap_safe();
            func.inlinees
                .sort_by_key(|inlinee| (inlinee.depth, inlinee.address));
            self.functions.push(func);
        }
        self.cur_lines.clear();
    }

    fn finish_cfi(&mut self) {
        if let Some(mut cfi) = self.cur_cfi.take() {
            cfi.add_rules.sort();
            self.cfi.push(cfi);
        }
    }

    fn into_symbol_file(mut self, header: (String, String, String, String)) -> SymbolFile {
        self.finish_function();
        self.finish_cfi();
        self.publics.sort();

        let (os, arch, debug_id, debug_file) = header;
        SymbolFile {
            os,
            arch,
            debug_id,
            debug_file,
            files: self.files,
            inline_origins: self.inline_origins,
            publics: self.publics,
            functions: self
                .functions
                .into_iter()
                .map(|f| (f.memory_range(), f))
                .into_rangemap_safe(),
            cfi_stack_info: self
                .cfi
                .into_iter()
                .map(|c| (c.memory_range(), c))
                .into_rangemap_safe(),
            win_stack_framedata_info: self
                .win_framedata
                .into_iter()
                .map(|w| (w.memory_range(), w))
                .into_rangemap_safe(),
            win_stack_fpo_info: self
                .win_fpo
                .into_iter()
                .map(|w| (w.memory_range(), w))
                .into_rangemap_safe(),
        }
    }
}

/// Parse a symbol file from `bytes`.
pub fn parse_symbol_bytes(bytes: &[u8]) -> Result<SymbolFile, SymbolError> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines().enumerate();

    // The MODULE record must come first; without it we don't even know the
    // architecture the unwind rules speak of.
    let header = loop {
        let (number, line) = lines
            .next()
            .ok_or(SymbolError::ParseError("empty symbol file", 0))?;
        if line.trim().is_empty() {
            continue;
        }
        match complete(module_line(line)) {
            Some((os, arch, debug_id, debug_file)) => {
                break (
                    os.to_string(),
                    arch.to_string(),
                    debug_id.to_string(),
                    debug_file.trim().to_string(),
                )
            }
            None => {
                return Err(SymbolError::ParseError(
                    "missing MODULE record",
                    number as u64 + 1,
                ))
            }
        }
    };

    let mut builder = SymbolFileBuilder::default();
    for (number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let lineno = number as u64 + 1;

        if line.starts_with("INFO") {
            // Accepted and ignored.
        } else if line.starts_with("FILE") {
            match complete(file_line(line)) {
                Some((id, path)) => {
                    builder.files.insert(id, path.trim().to_string());
                }
                None => warn!("skipping malformed FILE record at line {lineno}"),
            }
        } else if line.starts_with("INLINE_ORIGIN") {
            match complete(inline_origin_line(line)) {
                Some((id, name)) => {
                    builder.inline_origins.insert(id, name.trim().to_string());
                }
                None => warn!("skipping malformed INLINE_ORIGIN record at line {lineno}"),
            }
        } else if line.starts_with("INLINE") {
            match (complete(inline_line(line)), builder.cur_function.as_mut()) {
                (Some(inlinees), Some(func)) => func.inlinees.extend(inlinees),
                (Some(_), None) => {
                    warn!("skipping INLINE record outside a FUNC at line {lineno}")
                }
                (None, _) => warn!("skipping malformed INLINE record at line {lineno}"),
            }
        } else if line.starts_with("FUNC") {
            builder.finish_function();
            match complete(func_line(line)) {
                Some(mut func) => {
                    func.name = func.name.trim().to_string();
                    builder.cur_function = Some(func);
                }
                None => warn!("skipping malformed FUNC record at line {lineno}"),
            }
        } else if line.starts_with("PUBLIC") {
            match complete(public_line(line)) {
                Some(mut public) => {
                    public.name = public.name.trim().to_string();
                    builder.publics.push(public);
                }
                None => warn!("skipping malformed PUBLIC record at line {lineno}"),
            }
        } else if line.starts_with("STACK CFI INIT") {
            builder.finish_cfi();
            match complete(stack_cfi_init_line(line)) {
                Some(cfi) => builder.cur_cfi = Some(cfi),
                None => warn!("skipping malformed STACK CFI INIT record at line {lineno}"),
            }
        } else if line.starts_with("STACK CFI") {
            match (
                complete(stack_cfi_delta_line(line)),
                builder.cur_cfi.as_mut(),
            ) {
                (Some(delta), Some(cfi)) => cfi.add_rules.push(delta),
                (Some(_), None) => {
                    warn!("skipping STACK CFI delta with no INIT at line {lineno}")
                }
                (None, _) => warn!("skipping malformed STACK CFI record at line {lineno}"),
            }
        } else if line.starts_with("STACK WIN") {
            match complete(stack_win_line(line)) {
                Some(WinFrameType::FrameData(info)) => builder.win_framedata.push(info),
                Some(WinFrameType::Fpo(info)) => builder.win_fpo.push(info),
                Some(WinFrameType::Unhandled) => {}
                None => warn!("skipping malformed STACK WIN record at line {lineno}"),
            }
        } else if line.starts_with(|c: char| c.is_ascii_hexdigit()) {
            // A line record belonging to the most recent FUNC.
            match (complete(func_line_data(line)), builder.cur_function.is_some()) {
                (Some(source_line), true) => {
                    // PDB output routinely carries zero-size line entries.
                    if source_line.size > 0 {
                        builder.cur_lines.push(source_line);
                    }
                }
                (Some(_), false) => warn!("skipping line record outside a FUNC at line {lineno}"),
                (None, _) => warn!("skipping malformed line record at line {lineno}"),
            }
        } else {
            warn!("skipping unrecognized record at line {lineno}");
        }
    }

    Ok(builder.into_symbol_file(header))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_module_line() {
        let (os, arch, id, file) = complete(module_line(
            "MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 firefox-bin",
        ))
        .unwrap();
        assert_eq!(os, "Linux");
        assert_eq!(arch, "x86");
        assert_eq!(id, "D3096ED481217FD4C16B29CD9BC208BA0");
        assert_eq!(file, "firefox-bin");
    }

    #[test]
    fn test_module_line_filename_spaces() {
        let (_, _, _, file) = complete(module_line(
            "MODULE Windows x86_64 D3096ED481217FD4C16B29CD9BC208BA0 firefox x y z",
        ))
        .unwrap();
        assert_eq!(file, "firefox x y z");
    }

    #[test]
    fn test_func_line() {
        let func = complete(func_line(
            "FUNC c184 30 0 nsQueryInterfaceWithError::operator()(nsID const&, void**) const",
        ))
        .unwrap();
        assert_eq!(func.address, 0xc184);
        assert_eq!(func.size, 0x30);
        assert_eq!(func.parameter_size, 0);
        assert!(!func.is_multiple);

        let func = complete(func_line("FUNC m 1000 30 10 some func")).unwrap();
        assert!(func.is_multiple);
    }

    #[test]
    fn test_stack_win_program_string() {
        let record = complete(stack_win_line(
            "STACK WIN 4 2170 14 a1 b2 c3 d4 e5 f6 1 $eip 4 + ^ = $esp $ebp 8 + = $ebp $ebp ^ =",
        ))
        .unwrap();
        match record {
            WinFrameType::FrameData(stack) => {
                assert_eq!(stack.address, 0x2170);
                assert_eq!(stack.size, 0x14);
                assert_eq!(stack.prologue_size, 0xa1);
                assert_eq!(stack.max_stack_size, 0xf6);
                assert_eq!(
                    stack.program_string_or_base_pointer,
                    WinStackThing::ProgramString(
                        "$eip 4 + ^ = $esp $ebp 8 + = $ebp $ebp ^ =".to_string()
                    )
                );
            }
            other => panic!("wrong frame type: {other:?}"),
        }
    }

    #[test]
    fn test_stack_win_fpo() {
        let record =
            complete(stack_win_line("STACK WIN 0 1000 30 a1 b2 c3 d4 e5 f6 0 1")).unwrap();
        match record {
            WinFrameType::Fpo(stack) => {
                assert_eq!(stack.address, 0x1000);
                assert_eq!(
                    stack.program_string_or_base_pointer,
                    WinStackThing::AllocatesBasePointer(true)
                );
            }
            other => panic!("wrong frame type: {other:?}"),
        }
    }

    #[test]
    fn test_parse_symbol_bytes() {
        let bytes = &b"MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 firefox-bin
INFO blah blah blah
FILE 0 foo.c
FILE 100 bar.c
PUBLIC abcd 10 func 1
PUBLIC ff00 3 func 2
FUNC 900 30 10 some other func
FUNC 1000 30 10 some func
1000 10 42 7
1010 10 52 8
1020 10 62 15
FUNC 1100 30 10 a third func
STACK WIN 4 900 30 a1 b2 c3 d4 e5 f6 1 prog string
STACK WIN 0 1000 30 a1 b2 c3 d4 e5 f6 0 1
STACK CFI INIT badf00d abc init rules
STACK CFI deadf00d some rules
STACK CFI deadbeef more rules
STACK CFI INIT f00f f0 more init rules
"[..];
        let sym = parse_symbol_bytes(bytes).unwrap();
        assert_eq!(sym.arch, "x86");
        assert_eq!(sym.debug_id, "D3096ED481217FD4C16B29CD9BC208BA0");
        assert_eq!(sym.files.len(), 2);
        assert_eq!(sym.files.get(&100).unwrap(), "bar.c");
        assert_eq!(sym.publics.len(), 2);
        assert_eq!(sym.publics[0].address, 0xabcd);
        assert_eq!(sym.publics[0].name, "func 1");

        assert_eq!(sym.functions.ranges_values().count(), 3);
        let func = sym.functions.get(0x1000).unwrap();
        assert_eq!(func.name, "some func");
        assert_eq!(func.lines.ranges_values().count(), 3);
        assert_eq!(
            func.lines.get(0x1010).unwrap(),
            &SourceLine {
                address: 0x1010,
                size: 0x10,
                file: 8,
                line: 52,
            }
        );

        assert_eq!(sym.win_stack_framedata_info.ranges_values().count(), 1);
        assert_eq!(sym.win_stack_fpo_info.ranges_values().count(), 1);

        assert_eq!(sym.cfi_stack_info.ranges_values().count(), 2);
        let cfi = sym.cfi_stack_info.get(0xbadf00d).unwrap();
        assert_eq!(cfi.init.rules, "init rules");
        assert_eq!(cfi.size, 0xabc);
        // Delta rules end up sorted by address.
        assert_eq!(
            cfi.add_rules,
            vec![
                CfiRules {
                    address: 0xdeadbeef,
                    rules: "more rules".to_string(),
                },
                CfiRules {
                    address: 0xdeadf00d,
                    rules: "some rules".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_inline_records() {
        let bytes = &b"MODULE Linux x86_64 ABCD1234 libfoo.so
FILE 0 foo.c
INLINE_ORIGIN 0 inlined_fn
INLINE_ORIGIN 1 deeper_fn
FUNC 1000 100 0 outer
INLINE 0 10 0 0 1010 20
INLINE 1 20 0 1 1014 8 1020 4
1000 100 9 0
"[..];
        let sym = parse_symbol_bytes(bytes).unwrap();
        let func = sym.functions.get(0x1000).unwrap();
        assert_eq!(func.inlinees.len(), 3);
        assert_eq!(sym.inline_origins.get(&0).unwrap(), "inlined_fn");

        let shallow = func.inlinee_at_depth(0, 0x1015).unwrap();
        assert_eq!(shallow.origin_id, 0);
        assert_eq!(shallow.call_line, 10);
        let deep = func.inlinee_at_depth(1, 0x1015).unwrap();
        assert_eq!(deep.origin_id, 1);
        assert!(func.inlinee_at_depth(2, 0x1015).is_none());
        assert!(func.inlinee_at_depth(0, 0x1000).is_none());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let bytes = &b"MODULE Linux x86 abcd1234 foo
FILE x nonsense.c
FILE 1 ok.c
FUNC zz 1 2 broken
FUNC 1000 30 0 fine
garbage that is not hex
"[..];
        let sym = parse_symbol_bytes(bytes).unwrap();
        assert_eq!(sym.files.len(), 1);
        assert_eq!(sym.functions.ranges_values().count(), 1);
        assert_eq!(sym.functions.get(0x1000).unwrap().name, "fine");
    }

    #[test]
    fn test_missing_module_is_fatal() {
        assert!(matches!(
            parse_symbol_bytes(&b"this is not a symbol file\n"[..]),
            Err(SymbolError::ParseError(..))
        ));
        assert!(matches!(
            parse_symbol_bytes(&b"MODULE Linux x86 xxxx_not_hex foo\n"[..]),
            Err(SymbolError::ParseError(..))
        ));
        assert!(matches!(
            parse_symbol_bytes(&b""[..]),
            Err(SymbolError::ParseError(..))
        ));
    }

    #[test]
    fn test_crlf_line_endings() {
        let bytes = &b"MODULE Linux x86 ffff0000 bar\r\nFILE 53 bar.c\r\nFUNC 1000 30 10 another func\r\n1000 30 7 53\r\n"[..];
        let sym = parse_symbol_bytes(bytes).unwrap();
        assert_eq!(sym.functions.get(0x1001).unwrap().name, "another func");
        assert_eq!(sym.functions.get(0x1000).unwrap().lines.get(0x1020).unwrap().line, 7);
    }
}
