//! Evaluation of `STACK CFI` and `STACK WIN` unwinding rules.
//!
//! `STACK CFI` rules are `REG: EXPR` pairs where `EXPR` is a postfix
//! expression over callee registers, `.cfa` (the canonical frame address),
//! integer literals, and the operators `+ - * / % @ ^`. `.cfa` and `.ra`
//! must always be derivable; the CFA must be computed without reference to
//! itself, and every other register may then use it.
//!
//! To recover a caller frame, start from the covering `STACK CFI INIT`
//! line and apply every delta line up to the target address; later rules
//! for the same register overwrite earlier ones.
//!
//! `STACK WIN` framedata programs extend the language with named variables
//! and the `=` assignment operator; the caller's registers are whatever
//! `$eip`/`$esp`/`$ebp`/... variables hold after the program runs. The FPO
//! flavor has no program, just a frame size to skip over.
//!
//! Expressions come from symbol files, which are untrusted input: the
//! operand stack is depth-capped, division by zero and non-power-of-two
//! alignments are refused, and unknown identifiers or unreadable memory
//! fail the expression (the stackwalker then falls back to its next
//! strategy).

use std::collections::HashMap;
use std::str::FromStr;

use tracing::{debug, trace};

use super::types::{CfiRules, StackInfoWin, WinStackThing};
use crate::FrameWalker;

/// Operand-stack depth limit for expression evaluation.
const MAX_EVAL_STACK_DEPTH: usize = 100;

fn bounded_push<T>(stack: &mut Vec<T>, value: T) -> Option<()> {
    if stack.len() >= MAX_EVAL_STACK_DEPTH {
        debug!("expression overflowed the operand stack");
        return None;
    }
    stack.push(value);
    Some(())
}

/// Evaluate merged CFI rules against the walker's callee state.
///
/// `additional` must hold exactly the delta lines at or before the target
/// address, in order; the caller slices them out of the `STACK CFI INIT`
/// record.
pub fn walk_with_stack_cfi(
    init: &CfiRules,
    additional: &[CfiRules],
    walker: &mut dyn FrameWalker,
) -> Option<()> {
    trace!("  ...got cfi");
    trace!("    {}", init.rules);
    for line in additional {
        trace!("    {}", line.rules);
    }

    // Collect all REG: EXPR pairs, letting later lines override earlier
    // ones; that's how delta records express incremental updates.
    let mut exprs = HashMap::new();
    parse_cfi_exprs(&init.rules, &mut exprs)?;
    for line in additional {
        parse_cfi_exprs(&line.rules, &mut exprs)?;
    }
    trace!("  ...parsed exprs");

    // These two must be present for the unwind to be well-formed.
    let cfa_expr = exprs.remove(&CfiReg::Cfa)?;
    let ra_expr = exprs.remove(&CfiReg::Ra)?;

    // The CFA may not be defined in terms of itself.
    let cfa = eval_cfi_expr(cfa_expr, walker, None)?;
    let ra = eval_cfi_expr(ra_expr, walker, Some(cfa))?;
    trace!("  ...eval'd cfa and ra");

    walker.set_cfa(cfa)?;
    walker.set_ra(ra)?;

    for (reg, expr) in exprs {
        if let CfiReg::Other(reg) = reg {
            // A failed expression only loses this one register; make sure
            // it isn't silently forwarded from the callee either.
            match eval_cfi_expr(expr, walker, Some(cfa)) {
                Some(val) => {
                    walker.set_caller_register(reg, val);
                }
                None => {
                    walker.clear_caller_register(reg);
                }
            }
        }
    }
    trace!("  ...success!");

    Some(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CfiReg<'a> {
    Cfa,
    Ra,
    Other(&'a str),
}

fn parse_cfi_exprs<'a>(input: &'a str, output: &mut HashMap<CfiReg<'a>, &'a str>) -> Option<()> {
    // The format is ascii, so chars are bytes and substring arithmetic on
    // pointers recovers each EXPR span from the original string.
    let base_addr = input.as_ptr() as usize;
    let mut cur_reg = None;
    let mut expr_first: Option<&str> = None;
    let mut expr_last: Option<&str> = None;
    for token in input.split_ascii_whitespace() {
        if let Some(token) = token.strip_suffix(':') {
            // A "REG:" token ends the previous EXPR; commit it.
            if let Some(reg) = cur_reg {
                let min_addr = expr_first?.as_ptr() as usize;
                let max_addr = expr_last?.as_ptr() as usize + expr_last?.len();
                let expr = &input[min_addr - base_addr..max_addr - base_addr];
                output.insert(reg, expr);
                expr_first = None;
                expr_last = None;
            }

            cur_reg = if token == ".cfa" {
                Some(CfiReg::Cfa)
            } else if token == ".ra" {
                Some(CfiReg::Ra)
            } else if let Some(token) = token.strip_prefix('$') {
                // x86-style "$rax:".
                Some(CfiReg::Other(token))
            } else {
                // arm-style "x11:".
                Some(CfiReg::Other(token))
            };
        } else {
            // The first token must be a register.
            cur_reg.as_ref()?;
            if expr_first.is_none() {
                expr_first = Some(token);
            }
            expr_last = Some(token);
        }
    }

    // Commit the final pair.
    let min_addr = expr_first?.as_ptr() as usize;
    let max_addr = expr_last?.as_ptr() as usize + expr_last?.len();
    let expr = &input[min_addr - base_addr..max_addr - base_addr];
    output.insert(cur_reg?, expr);

    Some(())
}

fn eval_cfi_expr(expr: &str, walker: &mut dyn FrameWalker, cfa: Option<u64>) -> Option<u64> {
    let mut stack: Vec<u64> = Vec::new();
    let push = bounded_push::<u64>;

    for token in expr.split_ascii_whitespace() {
        match token {
            "+" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                push(&mut stack, lhs.wrapping_add(rhs))?;
            }
            "-" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                push(&mut stack, lhs.wrapping_sub(rhs))?;
            }
            "*" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                push(&mut stack, lhs.wrapping_mul(rhs))?;
            }
            "/" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return None;
                }
                push(&mut stack, lhs.wrapping_div(rhs))?;
            }
            "%" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return None;
                }
                push(&mut stack, lhs.wrapping_rem(rhs))?;
            }
            "@" => {
                // Align: truncate lhs down to a multiple of rhs.
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 || !rhs.is_power_of_two() {
                    return None;
                }
                push(&mut stack, lhs & (-1i64 as u64 ^ (rhs - 1)))?;
            }
            "^" => {
                // Dereference stack memory; unreadable is a soft failure.
                let ptr = stack.pop()?;
                push(&mut stack, walker.get_register_at_address(ptr)?)?;
            }
            ".cfa" => {
                // None when computing the CFA itself.
                push(&mut stack, cfa?)?;
            }
            ".undef" => {
                // The output is explicitly unknowable.
                return None;
            }
            _ => {
                if let Some((_, reg)) = token.split_once('$') {
                    push(&mut stack, walker.get_callee_register(reg)?)?;
                } else if let Ok(value) = i64::from_str(token) {
                    push(&mut stack, value as u64)?;
                } else if let Some(reg) = walker.get_callee_register(token) {
                    // Unprefixed register name (arm syntax).
                    push(&mut stack, reg)?;
                } else {
                    debug!("STACK CFI expression eval failed - unknown token: {token}");
                    return None;
                }
            }
        }
    }

    if stack.len() == 1 {
        stack.pop()
    } else {
        None
    }
}

fn win_frame_size(info: &StackInfoWin, grand_callee_param_size: u32) -> u32 {
    info.local_size + info.saved_register_size + grand_callee_param_size
}

enum WinVal<'a> {
    Var(&'a str),
    Int(u32),
    Undef,
}

impl<'a> WinVal<'a> {
    fn into_var(self) -> Option<&'a str> {
        match self {
            WinVal::Var(var) => Some(var),
            _ => None,
        }
    }
    fn into_int(self, map: &HashMap<&'a str, u32>) -> Option<u32> {
        match self {
            WinVal::Var(var) => map.get(&var).cloned(),
            WinVal::Int(int) => Some(int),
            WinVal::Undef => None,
        }
    }
}

pub(crate) fn eval_win_expr(
    expr: &str,
    info: &StackInfoWin,
    walker: &mut dyn FrameWalker,
) -> Option<()> {
    let mut vars = HashMap::new();

    let callee_esp = walker.get_callee_register("esp")? as u32;
    let callee_ebp = walker.get_callee_register("ebp")? as u32;
    let grand_callee_param_size = walker.get_grand_callee_parameter_size();
    let frame_size = win_frame_size(info, grand_callee_param_size);

    vars.insert("$esp", callee_esp);
    vars.insert("$ebp", callee_ebp);
    // Forward %ebx too when available; some programs consult it.
    if let Some(callee_ebx) = walker.get_callee_register("ebx") {
        vars.insert("$ebx", callee_ebx as u32);
    }

    let search_start = callee_esp.checked_add(frame_size)?;

    // The constant environment the programs expect.
    vars.insert(".cbParams", info.parameter_size);
    vars.insert(".cbCalleeParams", grand_callee_param_size);
    vars.insert(".cbSavedRegs", info.saved_register_size);
    vars.insert(".cbLocals", info.local_size);
    vars.insert(".raSearch", search_start);
    vars.insert(".raSearchStart", search_start);

    let mut stack: Vec<WinVal> = Vec::new();
    let push = bounded_push;

    for token in expr.split_ascii_whitespace() {
        trace!("    ...token: {token}");
        match token {
            "+" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                push(&mut stack, WinVal::Int(lhs.wrapping_add(rhs)))?;
            }
            "-" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                push(&mut stack, WinVal::Int(lhs.wrapping_sub(rhs)))?;
            }
            "*" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                push(&mut stack, WinVal::Int(lhs.wrapping_mul(rhs)))?;
            }
            "/" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                if rhs == 0 {
                    return None;
                }
                push(&mut stack, WinVal::Int(lhs.wrapping_div(rhs)))?;
            }
            "%" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                if rhs == 0 {
                    return None;
                }
                push(&mut stack, WinVal::Int(lhs.wrapping_rem(rhs)))?;
            }
            "@" => {
                let rhs = stack.pop()?.into_int(&vars)?;
                let lhs = stack.pop()?.into_int(&vars)?;
                if rhs == 0 || !rhs.is_power_of_two() {
                    return None;
                }
                push(&mut stack, WinVal::Int(lhs & (-1i32 as u32 ^ (rhs - 1))))?;
            }
            "=" => {
                // Assign rhs to the variable on the lhs; assigning .undef
                // deletes the variable.
                let rhs = stack.pop()?;
                let lhs = stack.pop()?.into_var()?;
                if let WinVal::Undef = rhs {
                    vars.remove(&lhs);
                } else {
                    let rhs = rhs.into_int(&vars)?;
                    vars.insert(lhs, rhs);
                }
            }
            "^" => {
                let ptr = stack.pop()?.into_int(&vars)?;
                let val = walker.get_register_at_address(ptr as u64)? as u32;
                push(&mut stack, WinVal::Int(val))?;
            }
            ".undef" => {
                push(&mut stack, WinVal::Undef)?;
            }
            _ => {
                if token.starts_with('$') || token.starts_with('.') {
                    push(&mut stack, WinVal::Var(token))?;
                } else if let Ok(value) = i32::from_str(token) {
                    push(&mut stack, WinVal::Int(value as u32))?;
                } else {
                    debug!("STACK WIN program eval failed - unknown token: {token}");
                    return None;
                }
            }
        }
    }

    trace!("  ...eval'd expr");

    let output_regs = ["$eip", "$esp", "$ebp", "$ebx", "$esi", "$edi"];
    for reg in &output_regs {
        if let Some(&val) = vars.get(reg) {
            walker.set_caller_register(&reg[1..], val as u64)?;
        }
    }

    trace!("  ...success!");
    Some(())
}

/// Unwind with a framedata (`STACK WIN 4`) record's program string.
pub fn walk_with_stack_win_framedata(
    info: &StackInfoWin,
    walker: &mut dyn FrameWalker,
) -> Option<()> {
    match &info.program_string_or_base_pointer {
        WinStackThing::ProgramString(expr) => {
            trace!("  ...using stack win framedata: {expr}");
            eval_win_expr(expr, info, walker)
        }
        WinStackThing::AllocatesBasePointer(_) => None,
    }
}

/// Unwind with an FPO (`STACK WIN 0`) record's fixed frame layout.
pub fn walk_with_stack_win_fpo(info: &StackInfoWin, walker: &mut dyn FrameWalker) -> Option<()> {
    match info.program_string_or_base_pointer {
        WinStackThing::AllocatesBasePointer(allocates_base_pointer) => {
            trace!("  ...using stack win fpo");
            let grand_callee_param_size = walker.get_grand_callee_parameter_size();
            let frame_size = win_frame_size(info, grand_callee_param_size) as u64;

            let callee_esp = walker.get_callee_register("esp")?;
            let eip_address = callee_esp.checked_add(frame_size)?;
            let caller_eip = walker.get_register_at_address(eip_address)?;
            let caller_esp = eip_address.checked_add(4)?;

            let caller_ebp = if allocates_base_pointer {
                let ebp_address = callee_esp
                    .checked_add(grand_callee_param_size as u64)?
                    .checked_add(info.saved_register_size as u64)?
                    .checked_sub(8)?;
                walker.get_register_at_address(ebp_address)?
            } else {
                // %ebx is commonly untouched by FPO thunks; forward it so
                // the frames above can keep using it.
                if let Some(callee_ebx) = walker.get_callee_register("ebx") {
                    walker.set_caller_register("ebx", callee_ebx)?;
                }
                walker.get_callee_register("ebp")?
            };

            walker.set_caller_register("eip", caller_eip)?;
            walker.set_caller_register("esp", caller_esp)?;
            walker.set_caller_register("ebp", caller_ebp)?;
            trace!("  ...success!");
            Some(())
        }
        WinStackThing::ProgramString(_) => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    // Register names handed to set_caller_register must be memoized to
    // 'static somewhere; this array plays that role for the tests.
    static STATIC_REGS: [&str; 14] = [
        "cfa", "ra", "esp", "eip", "ebp", "eax", "ebx", "rsp", "rip", "rbp", "rax", "rbx", "x11",
        "x12",
    ];

    struct TestFrameWalker<Reg> {
        instruction: Reg,
        grand_callee_param_size: u32,
        callee_regs: HashMap<&'static str, Reg>,
        caller_regs: HashMap<&'static str, Reg>,
        stack: Vec<u8>,
    }

    trait Int {
        const BYTES: usize;
        fn from_bytes(bytes: &[u8]) -> Self;
        fn into_u64(self) -> u64;
        fn from_u64(val: u64) -> Self;
    }
    impl Int for u32 {
        const BYTES: usize = 4;
        fn from_bytes(bytes: &[u8]) -> Self {
            let mut buf = [0; Self::BYTES];
            buf.copy_from_slice(bytes);
            u32::from_le_bytes(buf)
        }
        fn into_u64(self) -> u64 {
            self as u64
        }
        fn from_u64(val: u64) -> Self {
            val as u32
        }
    }
    impl Int for u64 {
        const BYTES: usize = 8;
        fn from_bytes(bytes: &[u8]) -> Self {
            let mut buf = [0; Self::BYTES];
            buf.copy_from_slice(bytes);
            u64::from_le_bytes(buf)
        }
        fn into_u64(self) -> u64 {
            self
        }
        fn from_u64(val: u64) -> Self {
            val
        }
    }

    impl<Reg: Int + Copy> FrameWalker for TestFrameWalker<Reg> {
        fn get_instruction(&self) -> u64 {
            self.instruction.into_u64()
        }
        fn has_grand_callee(&self) -> bool {
            true
        }
        fn get_grand_callee_parameter_size(&self) -> u32 {
            self.grand_callee_param_size
        }
        fn get_register_at_address(&self, address: u64) -> Option<u64> {
            let addr = address as usize;
            self.stack
                .get(addr..addr + Reg::BYTES)
                .map(|slice| Reg::from_bytes(slice).into_u64())
        }
        fn get_callee_register(&self, name: &str) -> Option<u64> {
            self.callee_regs.get(name).map(|val| val.into_u64())
        }
        fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()> {
            STATIC_REGS.iter().position(|&reg| reg == name).map(|idx| {
                let memoized_reg = STATIC_REGS[idx];
                self.caller_regs.insert(memoized_reg, Reg::from_u64(val));
            })
        }
        fn clear_caller_register(&mut self, name: &str) {
            self.caller_regs.remove(name);
        }
        fn set_cfa(&mut self, val: u64) -> Option<()> {
            self.caller_regs.insert("cfa", Reg::from_u64(val));
            Some(())
        }
        fn set_ra(&mut self, val: u64) -> Option<()> {
            self.caller_regs.insert("ra", Reg::from_u64(val));
            Some(())
        }
    }

    impl<Reg: Int + Copy> TestFrameWalker<Reg> {
        fn new(stack: Vec<u8>, callee_regs: HashMap<&'static str, Reg>) -> Self {
            TestFrameWalker {
                stack,
                callee_regs,
                caller_regs: HashMap::new(),
                instruction: Reg::from_u64(0xf1cefa32),
                grand_callee_param_size: 4,
            }
        }
    }

    fn whatever_win_info() -> StackInfoWin {
        StackInfoWin {
            address: 0xfea4a123,
            size: 16,
            prologue_size: 4,
            epilogue_size: 8,
            parameter_size: 16,
            saved_register_size: 12,
            local_size: 24,
            max_stack_size: 64,
            program_string_or_base_pointer: WinStackThing::AllocatesBasePointer(false),
        }
    }

    fn build_cfi_rules(init: &str, additional: &[&str]) -> (CfiRules, Vec<CfiRules>) {
        let init = CfiRules {
            address: 0,
            rules: init.to_string(),
        };
        let additional = additional
            .iter()
            .enumerate()
            .map(|(idx, rules)| CfiRules {
                address: idx as u64 + 1,
                rules: rules.to_string(),
            })
            .collect::<Vec<_>>();
        (init, additional)
    }

    #[test]
    fn test_stack_cfi_chained_deltas() {
        // cfa = callee_rsp + 24, ra = *(cfa - 8), rax = *(cfa - 16)
        let init = ".cfa: $rsp 8 + .ra: .cfa -8 + ^";
        let additional = &[".cfa: $rsp 16 + $rax: .cfa -16 + ^", ".cfa: $rsp 24 +"];
        let input = vec![("rsp", 32u64), ("rip", 1600)].into_iter().collect();
        let mut stack = vec![0; 1600];

        const FINAL_CFA: usize = 32 + 24;
        const FINAL_RA: u64 = 0xfa1e_f2e6_a2df_2b68;
        const FINAL_RAX: u64 = 0xb3ef_04ce_4321_fe2a;
        stack[FINAL_CFA - 8..FINAL_CFA].copy_from_slice(&FINAL_RA.to_le_bytes());
        stack[FINAL_CFA - 16..FINAL_CFA - 8].copy_from_slice(&FINAL_RAX.to_le_bytes());

        let mut walker = TestFrameWalker::new(stack, input);
        let (init, additional) = build_cfi_rules(init, additional);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();

        assert_eq!(walker.caller_regs.len(), 3);
        assert_eq!(walker.caller_regs["cfa"], FINAL_CFA as u64);
        assert_eq!(walker.caller_regs["ra"], FINAL_RA);
        assert_eq!(walker.caller_regs["rax"], FINAL_RAX);
    }

    #[test]
    fn test_stack_cfi_ops() {
        let input = vec![("esp", 32u32), ("eip", 1600)].into_iter().collect();
        let stack = vec![0; 1600];
        let mut walker = TestFrameWalker::new(stack, input);

        walker.caller_regs.clear();
        let (init, additional) = build_cfi_rules(".cfa: 1 2 + .ra: -4 0 +", &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs["cfa"], 3);
        assert_eq!(walker.caller_regs["ra"], -4i32 as u32);

        walker.caller_regs.clear();
        let (init, additional) = build_cfi_rules(".cfa: 5 3 - .ra: 5 3 *", &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs["cfa"], 2);
        assert_eq!(walker.caller_regs["ra"], 15);

        walker.caller_regs.clear();
        let (init, additional) = build_cfi_rules(".cfa: 5 3 / .ra: 5 3 %", &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs["cfa"], 1);
        assert_eq!(walker.caller_regs["ra"], 2);

        walker.caller_regs.clear();
        let (init, additional) = build_cfi_rules(".cfa: 8 16 @ .ra: 161 8 @", &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs["cfa"], 0);
        assert_eq!(walker.caller_regs["ra"], 160);

        // Missing operands and bad divisors are soft failures.
        for bad in [
            ".cfa: 1 + .ra: 8",
            ".cfa: 1 - .ra: 8",
            ".cfa: ^ .ra: 8",
            ".cfa: 1 0 / .ra: 8",
            ".cfa: 1 0 % .ra: 8",
            ".cfa: 1 0 @ .ra: 8",
            ".cfa: 1 3 @ .ra: 8",
        ] {
            let (init, additional) = build_cfi_rules(bad, &[]);
            assert!(
                walk_with_stack_cfi(&init, &additional, &mut walker).is_none(),
                "{bad} should fail"
            );
        }
    }

    #[test]
    fn test_stack_cfi_errors() {
        let input = vec![("rsp", 32u64), ("rip", 1600)].into_iter().collect();
        let stack = vec![0; 1600];
        let mut walker = TestFrameWalker::new(stack, input);

        // Missing .ra or .cfa
        let (init, additional) = build_cfi_rules(".cfa: 8 16 +", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());
        let (init, additional) = build_cfi_rules(".ra: 8 16 *", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());

        // Doesn't start with a REG
        let (init, additional) = build_cfi_rules(".cfa 8 16 *", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());

        // Leftover operands on the stack
        let (init, additional) = build_cfi_rules(".cfa: 8 12 .ra: 8", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());

        // .cfa computed from itself, or .undef
        let (init, additional) = build_cfi_rules(".cfa: .cfa .ra: 2", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());
        let (init, additional) = build_cfi_rules(".cfa: .undef .ra: 8", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());

        // Unknown register, out-of-bounds deref
        let (init, additional) = build_cfi_rules(".cfa: 8 .ra: $kitties", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());
        let (init, additional) = build_cfi_rules(".cfa: 2000 ^ .ra: 8", &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());
    }

    #[test]
    fn test_stack_cfi_corners() {
        let input = vec![("rsp", 32u64), ("rip", 1600)].into_iter().collect();
        let stack = vec![0; 1600];
        let mut walker = TestFrameWalker::new(stack, input);

        // A failing $reg expression only loses that register.
        walker.caller_regs.clear();
        let (init, additional) = build_cfi_rules(".cfa: 1 .ra: 8 $rax: 1 0 /", &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs.len(), 2);

        // Duplicate rules: last one wins.
        walker.caller_regs.clear();
        let (init, additional) =
            build_cfi_rules(".cfa: 1 .cfa: 2 .ra: 3 .ra: 4 $rax: 5 $rax: 6", &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs["cfa"], 2);
        assert_eq!(walker.caller_regs["ra"], 4);
        assert_eq!(walker.caller_regs["rax"], 6);
    }

    #[test]
    fn test_stack_cfi_depth_limit() {
        let input = vec![("rsp", 32u64), ("rip", 1600)].into_iter().collect();
        let stack = vec![0; 1600];
        let mut walker = TestFrameWalker::new(stack, input);

        // 100 pushes is the cap; the 101st operand kills the expression.
        let mut deep = String::from(".cfa: ");
        for _ in 0..=MAX_EVAL_STACK_DEPTH {
            deep.push_str("1 ");
        }
        for _ in 0..MAX_EVAL_STACK_DEPTH {
            deep.push_str("+ ");
        }
        deep.push_str(".ra: 8");
        let (init, additional) = build_cfi_rules(&deep, &[]);
        assert!(walk_with_stack_cfi(&init, &additional, &mut walker).is_none());

        // Right at the cap works.
        let mut ok = String::from(".cfa: ");
        for _ in 0..MAX_EVAL_STACK_DEPTH {
            ok.push_str("1 ");
        }
        for _ in 0..MAX_EVAL_STACK_DEPTH - 1 {
            ok.push_str("+ ");
        }
        ok.push_str(".ra: 8");
        let (init, additional) = build_cfi_rules(&ok, &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs["cfa"], MAX_EVAL_STACK_DEPTH as u64);
    }

    #[test]
    fn test_stack_cfi_arm_names() {
        // arm doesn't prefix registers with $.
        let input = vec![("pc", 32u64), ("x11", 1600)].into_iter().collect();
        let stack = vec![0; 1600];
        let mut walker = TestFrameWalker::new(stack, input);

        let (init, additional) = build_cfi_rules(".cfa: 8 .ra: 12 x11: 16 x12: x11 .cfa +", &[]);
        walk_with_stack_cfi(&init, &additional, &mut walker).unwrap();
        assert_eq!(walker.caller_regs["cfa"], 8);
        assert_eq!(walker.caller_regs["ra"], 12);
        assert_eq!(walker.caller_regs["x11"], 16);
        assert_eq!(walker.caller_regs["x12"], 1608);
    }

    #[test]
    fn test_stack_win_framedata() {
        // ebp = *16, esp = 24, eip = *20
        let expr = "$T0 $ebp = $eip $T0 4 + ^ = $ebp $T0 ^ = $esp $T0 8 + =";
        let input = vec![("ebp", 16u32), ("esp", 1600)].into_iter().collect();
        let mut stack = vec![0; 1600];

        const FINAL_EBP: u32 = 0xfa1ef2e6;
        const FINAL_EIP: u32 = 0xb3ef04ce;
        stack[16..20].copy_from_slice(&FINAL_EBP.to_le_bytes());
        stack[20..24].copy_from_slice(&FINAL_EIP.to_le_bytes());

        let mut walker = TestFrameWalker::new(stack, input);
        let info = whatever_win_info();
        eval_win_expr(expr, &info, &mut walker).unwrap();

        assert_eq!(walker.caller_regs.len(), 3);
        assert_eq!(walker.caller_regs["esp"], 24);
        assert_eq!(walker.caller_regs["ebp"], FINAL_EBP);
        assert_eq!(walker.caller_regs["eip"], FINAL_EIP);
    }

    #[test]
    fn test_stack_win_corners() {
        let input = vec![("esp", 32u32), ("ebp", 1600)].into_iter().collect();
        let stack = vec![0; 1600];
        let mut walker = TestFrameWalker::new(stack, input);
        let info = whatever_win_info();

        // Empty program forwards esp/ebp through.
        walker.caller_regs.clear();
        eval_win_expr("", &info, &mut walker).unwrap();
        assert_eq!(walker.caller_regs.len(), 2);
        assert_eq!(walker.caller_regs["esp"], 32);
        assert_eq!(walker.caller_regs["ebp"], 1600);

        // .undef deletes.
        walker.caller_regs.clear();
        eval_win_expr("$esp .undef = $ebp .undef =", &info, &mut walker).unwrap();
        assert_eq!(walker.caller_regs.len(), 0);

        // Temporaries don't leak into the output.
        walker.caller_regs.clear();
        eval_win_expr("$t0 1 = $esp $t0 5 + = $ebp 2 =", &info, &mut walker).unwrap();
        assert_eq!(walker.caller_regs.len(), 2);
        assert_eq!(walker.caller_regs["esp"], 6);
        assert_eq!(walker.caller_regs["ebp"], 2);

        // Reading an undefined variable fails.
        assert!(eval_win_expr("$esp $kitties =", &info, &mut walker).is_none());
        // Assigning to a non-variable fails.
        assert!(eval_win_expr("0 2 =", &info, &mut walker).is_none());
        // Variables must start with $ or .
        assert!(eval_win_expr("esp 2 =", &info, &mut walker).is_none());
    }
}
