//! Debugger state lines
//!
//! Renders one machine snapshot per state emission: the pc, the opcode
//! about to run, the state tag, any symbols for the pc and for the
//! address the instruction touches, the operand values it would consume,
//! and both stacks.

use std::fmt::Write;
use uxn::{op, Machine, Op};
use varvara::symbols::Symbols;
use varvara::StateKind;

/// Formats a state emission, or `None` for kinds that stay quiet
pub fn state_line(syms: &Symbols, m: &Machine, k: StateKind) -> Option<String> {
    let tag = match k {
        StateKind::Break => "[break]",
        StateKind::Debug => "[debug]",
        StateKind::Pause => "[pause]",
        StateKind::Halt => "[HALT!]",
        StateKind::Clear | StateKind::Quiet => return None,
    };

    let opcode = Op(m.ram_read_byte(m.pc));
    let pc_sym = syms
        .for_addr(m.pc)
        .first()
        .map(|s| format!("{s} -> "))
        .unwrap_or_default();

    let mut line = format!(
        "{:04x} {:<6} {} {}{}",
        m.pc,
        opcode.to_string(),
        tag,
        pc_sym,
        addr_symbol(syms, m, opcode),
    );
    let args = operand_note(m, opcode);
    if !args.is_empty() {
        let _ = write!(line, " ({args})");
    }
    let _ = write!(line, "\nws: {:?}\nrs: {:?}", m.work(), m.ret());
    Some(line)
}

/// The symbol for the address the instruction would touch, if any
///
/// When a load/store target carries several labels the last one names the
/// innermost scope, except for device ports where the first is the device
/// itself.
fn addr_symbol(syms: &Symbols, m: &Machine, opcode: Op) -> String {
    let Some(addr) = m.op_addr(m.pc) else {
        return String::new();
    };
    let hits = syms.for_addr(addr);
    match hits.len() {
        0 => String::new(),
        1 => hits[0].to_string(),
        n => match opcode.base() {
            op::DEO | op::DEI => hits[0].to_string(),
            _ => hits[n - 1].to_string(),
        },
    }
}

/// Renders the stacked operands the instruction is about to consume
fn operand_note(m: &Machine, opcode: Op) -> String {
    let stack = if opcode.ret() { m.ret() } else { m.work() };
    let mut out = String::new();
    for (name, v) in ["a", "b", "c"].iter().zip(opcode.stack_args()) {
        if !v.present() || stack.len() < v.index {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        match v.size {
            1 => {
                let _ = write!(out, "{name}={:02x}", stack.peek_at(v.index - 1));
            }
            _ => {
                let hi = stack.peek_at(v.index - 1);
                let lo = stack.peek_at(v.index - 2);
                let _ = write!(out, "{name}={:04x}", u16::from_be_bytes([hi, lo]));
            }
        }
    }
    out
}
