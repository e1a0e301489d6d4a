//! Opcode decoding
//!
//! A Uxn opcode packs a five-bit base operation with three mode flags:
//! bit 5 selects 16-bit operands (*short*), bit 6 selects the return stack
//! (*return*), and bit 7 makes pops non-destructive (*keep*).  Four byte
//! values escape this scheme: `BRK` (0x00), `JCI` (0x20), `JMI` (0x40) and
//! `JSI` (0x60) ignore the flag bits entirely, and the slot where `BRK`
//! would gain the keep bit (0x80 and friends) is repurposed as `LIT`.

use core::fmt;

/// A single Uxn opcode byte
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Op(pub u8);

/// Position and width of one stack argument
///
/// `index` counts bytes from the top of the operating stack (1 is the top
/// byte, 0 means the argument is absent); `size` is 1 for a byte and 2 for
/// a short.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StackVal {
    pub index: u8,
    pub size: u8,
}

impl StackVal {
    const NONE: Self = StackVal { index: 0, size: 0 };

    const fn new(index: u8, size: u8) -> Self {
        Self { index, size }
    }

    /// Returns `true` if this slot describes a real argument
    pub fn present(&self) -> bool {
        self.index != 0
    }
}

impl Op {
    /// Reports whether the opcode operates on 16-bit values
    pub fn short(&self) -> bool {
        self.0 & SHORT != 0 && self.0 & 0x9f != 0
    }

    /// Reports whether the opcode operates on the return stack
    pub fn ret(&self) -> bool {
        self.0 & RET != 0 && self.0 & 0x9f != 0
    }

    /// Reports whether pops leave the stack pointer untouched
    pub fn keep(&self) -> bool {
        self.0 & KEEP != 0 && self.0 & 0x1f != 0
    }

    /// Strips the mode flags, leaving the base operation
    ///
    /// `BRK`, `JCI`, `JMI` and `JSI` are their own bases; every keep-mode
    /// variant of `BRK` decodes as `LIT`.
    pub fn base(&self) -> u8 {
        match self.0 {
            b if b & 0x1f != 0 => b & 0x1f,
            b if b & 0x9f == 0 => b,
            _ => LIT,
        }
    }

    /// Reports the stack arguments consumed by this opcode
    ///
    /// Absent arguments have `index` 0.  The table mirrors the generic
    /// instruction forms: `w` is the operand width in bytes.
    pub fn stack_args(&self) -> [StackVal; 3] {
        let v = StackVal::new;
        let w = if self.short() { 2 } else { 1 };
        let t = w;
        match self.base() {
            JMP | JSR | STH | INC | POP | DUP => [v(w, t), StackVal::NONE, StackVal::NONE],
            SWP | EQU | NEQ | GTH | LTH | ADD | SUB | MUL | DIV | AND | ORA | EOR => {
                [v(w, t), v(w * 2, t), StackVal::NONE]
            }
            ROT => [v(w, t), v(w * 2, t), v(w * 3, t)],
            NIP | OVR => [v(w * 2, t), StackVal::NONE, StackVal::NONE],
            JCN => [v(w, t), v(w + 1, 1), StackVal::NONE],
            LDZ | LDR | DEI | JCI => [v(1, 1), StackVal::NONE, StackVal::NONE],
            STZ | STR | DEO | SFT => [v(1, 1), v(1 + w, t), StackVal::NONE],
            LDA => [v(2, 2), StackVal::NONE, StackVal::NONE],
            STA => [v(2, 2), v(2 + w, t), StackVal::NONE],
            _ => [StackVal::NONE; 3],
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(BASE_NAMES[usize::from(self.base())])?;
        if self.short() {
            f.write_str("2")?;
        }
        if self.keep() {
            f.write_str("k")?;
        }
        if self.ret() {
            f.write_str("r")?;
        }
        Ok(())
    }
}

/// Short-mode flag bit
pub const SHORT: u8 = 0x20;
/// Return-mode flag bit
pub const RET: u8 = 0x40;
/// Keep-mode flag bit
pub const KEEP: u8 = 0x80;

pub const BRK: u8 = 0x00;
pub const INC: u8 = 0x01;
pub const POP: u8 = 0x02;
pub const NIP: u8 = 0x03;
pub const SWP: u8 = 0x04;
pub const ROT: u8 = 0x05;
pub const DUP: u8 = 0x06;
pub const OVR: u8 = 0x07;
pub const EQU: u8 = 0x08;
pub const NEQ: u8 = 0x09;
pub const GTH: u8 = 0x0a;
pub const LTH: u8 = 0x0b;
pub const JMP: u8 = 0x0c;
pub const JCN: u8 = 0x0d;
pub const JSR: u8 = 0x0e;
pub const STH: u8 = 0x0f;
pub const LDZ: u8 = 0x10;
pub const STZ: u8 = 0x11;
pub const LDR: u8 = 0x12;
pub const STR: u8 = 0x13;
pub const LDA: u8 = 0x14;
pub const STA: u8 = 0x15;
pub const DEI: u8 = 0x16;
pub const DEO: u8 = 0x17;
pub const ADD: u8 = 0x18;
pub const SUB: u8 = 0x19;
pub const MUL: u8 = 0x1a;
pub const DIV: u8 = 0x1b;
pub const AND: u8 = 0x1c;
pub const ORA: u8 = 0x1d;
pub const EOR: u8 = 0x1e;
pub const SFT: u8 = 0x1f;
pub const JCI: u8 = 0x20;
pub const JMI: u8 = 0x40;
pub const JSI: u8 = 0x60;
pub const LIT: u8 = 0x80;

const BASE_NAMES: [&str; 0x81] = {
    let mut names = [""; 0x81];
    names[BRK as usize] = "BRK";
    names[INC as usize] = "INC";
    names[POP as usize] = "POP";
    names[NIP as usize] = "NIP";
    names[SWP as usize] = "SWP";
    names[ROT as usize] = "ROT";
    names[DUP as usize] = "DUP";
    names[OVR as usize] = "OVR";
    names[EQU as usize] = "EQU";
    names[NEQ as usize] = "NEQ";
    names[GTH as usize] = "GTH";
    names[LTH as usize] = "LTH";
    names[JMP as usize] = "JMP";
    names[JCN as usize] = "JCN";
    names[JSR as usize] = "JSR";
    names[STH as usize] = "STH";
    names[LDZ as usize] = "LDZ";
    names[STZ as usize] = "STZ";
    names[LDR as usize] = "LDR";
    names[STR as usize] = "STR";
    names[LDA as usize] = "LDA";
    names[STA as usize] = "STA";
    names[DEI as usize] = "DEI";
    names[DEO as usize] = "DEO";
    names[ADD as usize] = "ADD";
    names[SUB as usize] = "SUB";
    names[MUL as usize] = "MUL";
    names[DIV as usize] = "DIV";
    names[AND as usize] = "AND";
    names[ORA as usize] = "ORA";
    names[EOR as usize] = "EOR";
    names[SFT as usize] = "SFT";
    names[JCI as usize] = "JCI";
    names[JMI as usize] = "JMI";
    names[JSI as usize] = "JSI";
    names[LIT as usize] = "LIT";
    names
};
