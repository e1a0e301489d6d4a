//! The Uxn CPU
//!
//! [`Machine`] owns 64 KiB of RAM, the two stacks, the 256-byte device
//! page and the program counter.  [`Machine::step`] executes exactly one
//! instruction; a burst is a sequence of steps ending at `BRK` or a fault.

use crate::op::{self, Op};
use crate::stack::{Stack, StackView, Value};
use core::fmt;

/// Size of one device slot in port memory
pub const DEV_SIZE: usize = 16;

/// Condition that halted execution
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HaltCode {
    /// Explicit stop requested through the system exit port
    Halt,
    /// Pop from an empty stack
    Underflow,
    /// Push to a full stack
    Overflow,
    /// `DIV` with a zero divisor
    DivideByZero,
    /// Raised by the system debug port; the stacks are left unchanged and
    /// execution may continue
    Debug,
}

impl HaltCode {
    /// The byte written into the fault frame on the working stack
    pub fn code(&self) -> u8 {
        match self {
            HaltCode::Halt => 0x00,
            HaltCode::Underflow => 0x01,
            HaltCode::Overflow => 0x02,
            HaltCode::DivideByZero => 0x03,
            HaltCode::Debug => 0xff,
        }
    }
}

impl fmt::Display for HaltCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HaltCode::Halt => "halt",
            HaltCode::Underflow => "stack underflow",
            HaltCode::Overflow => "stack overflow",
            HaltCode::DivideByZero => "division by zero",
            HaltCode::Debug => "debug",
        })
    }
}

/// Fault raised while executing a single instruction
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HaltError {
    /// Address of the faulting opcode
    pub addr: u16,
    /// The faulting opcode
    pub op: Op,
    /// What went wrong
    pub code: HaltCode,
}

impl fmt::Display for HaltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} executing {} at {:04x}", self.code, self.op, self.addr)
    }
}

impl std::error::Error for HaltError {}

/// Outcome of one successful [`Machine::step`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// The program counter advanced; keep going
    Continue,
    /// `BRK` was executed, ending the current vector
    Break,
}

/// A Uxn-compatible peripheral set
pub trait Device {
    /// Performs the `DEI` operation for the given port
    ///
    /// The implementation must leave its answer in `vm.dev[target]`; the
    /// CPU then copies that byte to the stack.
    fn dei(&mut self, vm: &mut Machine, target: u8);

    /// Performs the `DEO` operation for the given port
    ///
    /// The written byte is stored to `vm.dev[target]` before this is
    /// called.  Returning `Some(code)` raises the corresponding fault:
    /// `Halt` stops the burst, `Debug` is reported and execution resumes.
    #[must_use]
    fn deo(&mut self, vm: &mut Machine, target: u8) -> Option<HaltCode>;
}

/// A device which does nothing
pub struct EmptyDevice;

impl Device for EmptyDevice {
    fn dei(&mut self, _vm: &mut Machine, _target: u8) {}
    fn deo(&mut self, _vm: &mut Machine, _target: u8) -> Option<HaltCode> {
        None
    }
}

/// Trait for a type which views a 16-byte device slot
pub trait Ports: zerocopy::AsBytes + zerocopy::FromBytes + zerocopy::FromZeroes {
    /// Base address of the slot, of the form `0xA0`
    const BASE: u8;
}

/// The CPU itself
pub struct Machine {
    /// Program counter
    pub pc: u16,
    /// Device port memory
    dev: [u8; 256],
    /// Main memory
    ram: Box<[u8; 65536]>,
    /// Working stack
    work: Stack,
    /// Return stack
    ret: Stack,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Builds a machine with zeroed memory and the pc at 0x0100
    pub fn new() -> Self {
        let ram: Box<[u8; 65536]> = vec![0u8; 65536]
            .into_boxed_slice()
            .try_into()
            .expect("65536-byte allocation");
        Self {
            pc: 0x100,
            dev: [0u8; 256],
            ram,
            work: Stack::default(),
            ret: Stack::default(),
        }
    }

    /// Clears all state and loads the ROM at 0x0100
    ///
    /// Returns trailing ROM data which does not fit in addressable memory;
    /// the caller should load it into expansion banks.
    #[must_use]
    pub fn reset<'b>(&mut self, rom: &'b [u8]) -> &'b [u8] {
        self.dev.fill(0);
        self.ram.fill(0);
        self.work = Stack::default();
        self.ret = Stack::default();
        self.pc = 0x100;
        let n = (self.ram.len() - 0x100).min(rom.len());
        self.ram[0x100..][..n].copy_from_slice(&rom[..n]);
        &rom[n..]
    }

    /// Reads a byte from RAM
    #[inline]
    pub fn ram_read_byte(&self, addr: u16) -> u8 {
        self.ram[usize::from(addr)]
    }

    /// Writes a byte to RAM
    #[inline]
    pub fn ram_write_byte(&mut self, addr: u16, v: u8) {
        self.ram[usize::from(addr)] = v;
    }

    /// Reads a word from RAM; the second byte wraps past 0xFFFF
    #[inline]
    pub fn ram_read_word(&self, addr: u16) -> u16 {
        let hi = self.ram[usize::from(addr)];
        let lo = self.ram[usize::from(addr.wrapping_add(1))];
        u16::from_be_bytes([hi, lo])
    }

    /// Reads a byte of device port memory
    #[inline]
    pub fn dev_read(&self, addr: u8) -> u8 {
        self.dev[usize::from(addr)]
    }

    /// Writes to the given address in device port memory
    #[inline]
    pub fn write_dev_mem(&mut self, addr: u8, value: u8) {
        self.dev[usize::from(addr)] = value;
    }

    /// Views the device slot claimed by `D`
    #[inline]
    pub fn dev<D: Ports>(&self) -> &D {
        self.dev_at(D::BASE)
    }

    /// Views the device slot at `pos`
    #[inline]
    pub fn dev_at<D: Ports>(&self, pos: u8) -> &D {
        Self::check_dev_size::<D>();
        D::ref_from(&self.dev[usize::from(pos)..][..DEV_SIZE]).unwrap()
    }

    /// Mutable view of the device slot claimed by `D`
    #[inline]
    pub fn dev_mut<D: Ports>(&mut self) -> &mut D {
        self.dev_mut_at(D::BASE)
    }

    /// Mutable view of the device slot at `pos`
    #[inline]
    pub fn dev_mut_at<D: Ports>(&mut self, pos: u8) -> &mut D {
        Self::check_dev_size::<D>();
        D::mut_from(&mut self.dev[usize::from(pos)..][..DEV_SIZE]).unwrap()
    }

    /// Shared borrow of the working stack
    #[inline]
    pub fn work(&self) -> &Stack {
        &self.work
    }

    /// Mutable borrow of the working stack
    #[inline]
    pub fn work_mut(&mut self) -> &mut Stack {
        &mut self.work
    }

    /// Shared borrow of the return stack
    #[inline]
    pub fn ret(&self) -> &Stack {
        &self.ret
    }

    /// Mutable borrow of the return stack
    #[inline]
    pub fn ret_mut(&mut self) -> &mut Stack {
        &mut self.ret
    }

    /// Executes the instruction at the program counter
    ///
    /// On a fault other than `Debug`, the working stack is replaced with
    /// the four-byte frame `[addr_hi, addr_lo, op, code]` and the return
    /// stack is cleared, ready for halt-vector recovery.
    pub fn step<D: Device>(&mut self, dev: &mut D) -> Result<Step, HaltError> {
        let addr = self.pc;
        let op = Op(self.ram[usize::from(addr)]);
        self.pc = self.pc.wrapping_add(1);
        match self.exec(op, dev) {
            Ok(s) => Ok(s),
            Err(code) => {
                if code != HaltCode::Debug && code != HaltCode::Halt {
                    self.work = Stack::default();
                    let [hi, lo] = addr.to_be_bytes();
                    for b in [hi, lo, op.0, code.code()] {
                        let _ = self.work.push(b);
                    }
                    self.ret = Stack::default();
                }
                Err(HaltError { addr, op, code })
            }
        }
    }

    /// Runs instructions until `BRK` or a fault
    pub fn run<D: Device>(&mut self, dev: &mut D) -> Result<(), HaltError> {
        loop {
            if let Step::Break = self.step(dev)? {
                return Ok(());
            }
        }
    }

    /// Runs the vector at `vector` until `BRK` or a fault
    pub fn run_vector<D: Device>(&mut self, dev: &mut D, vector: u16) -> Result<(), HaltError> {
        self.pc = vector;
        self.run(dev)
    }

    /// Reads the byte at the pc and advances it
    #[inline]
    fn next(&mut self) -> u8 {
        let out = self.ram[usize::from(self.pc)];
        self.pc = self.pc.wrapping_add(1);
        out
    }

    /// Reads the word at the pc and advances it by two
    #[inline]
    fn next2(&mut self) -> u16 {
        let hi = self.next();
        let lo = self.next();
        u16::from_be_bytes([hi, lo])
    }

    #[inline]
    fn ram_read(&self, addr: u16, short: bool) -> Value {
        if short {
            Value::Short(self.ram_read_word(addr))
        } else {
            Value::Byte(self.ram_read_byte(addr))
        }
    }

    #[inline]
    fn ram_write(&mut self, addr: u16, v: Value) {
        match v {
            Value::Byte(v) => self.ram_write_byte(addr, v),
            Value::Short(v) => {
                let [hi, lo] = v.to_be_bytes();
                self.ram_write_byte(addr, hi);
                self.ram_write_byte(addr.wrapping_add(1), lo);
            }
        }
    }

    /// A per-instruction view of the stack selected by the return flag
    #[inline]
    fn view(&mut self, op: Op) -> StackView<'_> {
        let stack = if op.ret() { &mut self.ret } else { &mut self.work };
        StackView::new(stack, op.keep(), op.short())
    }

    /// The stack opposite the one selected by the return flag
    #[inline]
    fn opposite(&mut self, op: Op) -> &mut Stack {
        if op.ret() {
            &mut self.work
        } else {
            &mut self.ret
        }
    }

    fn exec<D: Device>(&mut self, op: Op, dev: &mut D) -> Result<Step, HaltCode> {
        // The four flagless opcodes and their immediate reads
        match op.0 {
            op::BRK => return Ok(Step::Break),
            op::JCI => {
                let dt = self.next2();
                if self.work.pop()? != 0 {
                    self.pc = self.pc.wrapping_add(dt);
                }
                return Ok(Step::Continue);
            }
            op::JMI => {
                let dt = self.next2();
                self.pc = self.pc.wrapping_add(dt);
                return Ok(Step::Continue);
            }
            op::JSI => {
                let dt = self.next2();
                self.ret.push_short(self.pc)?;
                self.pc = self.pc.wrapping_add(dt);
                return Ok(Step::Continue);
            }
            _ => (),
        }

        match op.base() {
            op::LIT => {
                let v = if op.short() {
                    Value::Short(self.next2())
                } else {
                    Value::Byte(self.next())
                };
                self.view(op).push(v)?;
            }
            op::INC => {
                let mut s = self.view(op);
                let v = s.pop()?;
                s.push(v.wrapping_add(1))?;
            }
            op::POP => {
                self.view(op).pop()?;
            }
            op::NIP => {
                let mut s = self.view(op);
                let v = s.pop()?;
                s.pop()?;
                s.push(v)?;
            }
            op::SWP => {
                let mut s = self.view(op);
                let b = s.pop()?;
                let a = s.pop()?;
                s.push(b)?;
                s.push(a)?;
            }
            op::ROT => {
                let mut s = self.view(op);
                let c = s.pop()?;
                let b = s.pop()?;
                let a = s.pop()?;
                s.push(b)?;
                s.push(c)?;
                s.push(a)?;
            }
            op::DUP => {
                let mut s = self.view(op);
                let v = s.pop()?;
                s.push(v)?;
                s.push(v)?;
            }
            op::OVR => {
                let mut s = self.view(op);
                let b = s.pop()?;
                let a = s.pop()?;
                s.push(a)?;
                s.push(b)?;
                s.push(a)?;
            }
            op::EQU => self.cmp(op, |a, b| a == b, |a, b| a == b)?,
            op::NEQ => self.cmp(op, |a, b| a != b, |a, b| a != b)?,
            op::GTH => self.cmp(op, |a, b| a > b, |a, b| a > b)?,
            op::LTH => self.cmp(op, |a, b| a < b, |a, b| a < b)?,
            op::ADD => self.binary(op, u8::wrapping_add, u16::wrapping_add)?,
            op::SUB => self.binary(op, u8::wrapping_sub, u16::wrapping_sub)?,
            op::MUL => self.binary(op, u8::wrapping_mul, u16::wrapping_mul)?,
            op::DIV => {
                let mut s = self.view(op);
                if s.short() {
                    let b = s.pop_short()?;
                    let a = s.pop_short()?;
                    if b == 0 {
                        return Err(HaltCode::DivideByZero);
                    }
                    s.push_short(a / b)?;
                } else {
                    let b = s.pop_byte()?;
                    let a = s.pop_byte()?;
                    if b == 0 {
                        return Err(HaltCode::DivideByZero);
                    }
                    s.push_byte(a / b)?;
                }
            }
            op::AND => self.binary(op, |a, b| a & b, |a, b| a & b)?,
            op::ORA => self.binary(op, |a, b| a | b, |a, b| a | b)?,
            op::EOR => self.binary(op, |a, b| a ^ b, |a, b| a ^ b)?,
            op::SFT => {
                let mut s = self.view(op);
                let shift = s.pop_byte()?;
                let right = u32::from(shift & 0x0f);
                let left = u32::from(shift >> 4);
                match s.pop()? {
                    Value::Byte(v) => {
                        let v = v.checked_shr(right).unwrap_or(0);
                        s.push_byte(v.checked_shl(left).unwrap_or(0))?;
                    }
                    Value::Short(v) => {
                        let v = v.checked_shr(right).unwrap_or(0);
                        s.push_short(v.checked_shl(left).unwrap_or(0))?;
                    }
                }
            }
            op::JMP => {
                let pc = self.pc;
                let mut s = self.view(op);
                let target = if s.short() {
                    s.pop_short()?
                } else {
                    pc.wrapping_add(s.pop_offset()?)
                };
                self.pc = target;
            }
            op::JSR => {
                let pc = self.pc;
                let target = {
                    let mut s = self.view(op);
                    if s.short() {
                        s.pop_short()?
                    } else {
                        pc.wrapping_add(s.pop_offset()?)
                    }
                };
                self.ret.push_short(pc)?;
                self.pc = target;
            }
            op::JCN => {
                let pc = self.pc;
                let (target, cond) = {
                    let mut s = self.view(op);
                    let t = if s.short() {
                        s.pop_short()?
                    } else {
                        pc.wrapping_add(s.pop_offset()?)
                    };
                    (t, s.pop_byte()?)
                };
                if cond != 0 {
                    self.pc = target;
                }
            }
            op::STH => {
                let v = self.view(op).pop()?;
                let dst = self.opposite(op);
                match v {
                    Value::Byte(v) => dst.push(v)?,
                    Value::Short(v) => dst.push_short(v)?,
                }
            }
            op::LDZ => {
                let addr = u16::from(self.view(op).pop_byte()?);
                let v = self.ram_read(addr, op.short());
                self.view(op).push(v)?;
            }
            op::STZ => {
                let (addr, v) = {
                    let mut s = self.view(op);
                    (u16::from(s.pop_byte()?), s.pop()?)
                };
                self.ram_write(addr, v);
            }
            op::LDR => {
                let pc = self.pc;
                let addr = pc.wrapping_add(self.view(op).pop_offset()?);
                let v = self.ram_read(addr, op.short());
                self.view(op).push(v)?;
            }
            op::STR => {
                let pc = self.pc;
                let (addr, v) = {
                    let mut s = self.view(op);
                    (pc.wrapping_add(s.pop_offset()?), s.pop()?)
                };
                self.ram_write(addr, v);
            }
            op::LDA => {
                let addr = self.view(op).pop_short()?;
                let v = self.ram_read(addr, op.short());
                self.view(op).push(v)?;
            }
            op::STA => {
                let (addr, v) = {
                    let mut s = self.view(op);
                    (s.pop_short()?, s.pop()?)
                };
                self.ram_write(addr, v);
            }
            op::DEI => {
                let port = self.view(op).pop_byte()?;
                if op.short() {
                    dev.dei(self, port);
                    let hi = self.dev[usize::from(port)];
                    let next = port.wrapping_add(1);
                    dev.dei(self, next);
                    let lo = self.dev[usize::from(next)];
                    self.view(op).push_short(u16::from_be_bytes([hi, lo]))?;
                } else {
                    dev.dei(self, port);
                    let v = self.dev[usize::from(port)];
                    self.view(op).push_byte(v)?;
                }
            }
            op::DEO => {
                let (port, v) = {
                    let mut s = self.view(op);
                    let p = s.pop_byte()?;
                    (p, s.pop()?)
                };
                let status = match v {
                    Value::Byte(v) => {
                        self.dev[usize::from(port)] = v;
                        dev.deo(self, port)
                    }
                    Value::Short(v) => {
                        let [hi, lo] = v.to_be_bytes();
                        self.dev[usize::from(port)] = hi;
                        let first = dev.deo(self, port);
                        if first == Some(HaltCode::Halt) {
                            return Err(HaltCode::Halt);
                        }
                        let next = port.wrapping_add(1);
                        self.dev[usize::from(next)] = lo;
                        let second = dev.deo(self, next);
                        if second == Some(HaltCode::Halt) {
                            Some(HaltCode::Halt)
                        } else {
                            first.or(second)
                        }
                    }
                };
                if let Some(code) = status {
                    return Err(code);
                }
            }
            _ => unreachable!("decoded base out of range"),
        }
        Ok(Step::Continue)
    }

    /// Comparison ops push a one-byte boolean
    fn cmp(
        &mut self,
        op: Op,
        byte: fn(u8, u8) -> bool,
        short: fn(u16, u16) -> bool,
    ) -> Result<(), HaltCode> {
        let mut s = self.view(op);
        let v = if s.short() {
            let b = s.pop_short()?;
            let a = s.pop_short()?;
            short(a, b)
        } else {
            let b = s.pop_byte()?;
            let a = s.pop_byte()?;
            byte(a, b)
        };
        s.push_bool(v)
    }

    /// Binary arithmetic over the operand width
    fn binary(
        &mut self,
        op: Op,
        byte: fn(u8, u8) -> u8,
        short: fn(u16, u16) -> u16,
    ) -> Result<(), HaltCode> {
        let mut s = self.view(op);
        if s.short() {
            let b = s.pop_short()?;
            let a = s.pop_short()?;
            s.push_short(short(a, b))
        } else {
            let b = s.pop_byte()?;
            let a = s.pop_byte()?;
            s.push_byte(byte(a, b))
        }
    }

    /// Reports the memory or port address the instruction at `addr` would
    /// touch, without consuming stack bytes
    ///
    /// Returns `None` for opcodes with no associated address, or when the
    /// stack is too shallow to peek the operand.
    pub fn op_addr(&self, addr: u16) -> Option<u16> {
        let op = Op(self.ram[usize::from(addr)]);
        match op.base() {
            op::JCI | op::JMI | op::JSI => {
                let dt = self.ram_read_word(addr.wrapping_add(1));
                Some(addr.wrapping_add(dt).wrapping_add(3))
            }
            op::JMP | op::JCN | op::JSR | op::LDR | op::STR | op::LDA | op::STA | op::LDZ
            | op::STZ | op::DEI | op::DEO => {
                let st = if op.ret() { &self.ret } else { &self.work };
                match op.base() {
                    op::JMP | op::JCN | op::JSR => {
                        if op.short() {
                            st.peek_short()
                        } else {
                            let offs = st.peek_offset()?;
                            Some(addr.wrapping_add(offs).wrapping_add(1))
                        }
                    }
                    op::LDR | op::STR => {
                        let offs = st.peek_offset()?;
                        Some(addr.wrapping_add(offs).wrapping_add(1))
                    }
                    op::LDA | op::STA => st.peek_short(),
                    _ => st.peek().map(u16::from),
                }
            }
            _ => None,
        }
    }

    /// Asserts that the given [`Ports`] view spans exactly one slot
    #[inline]
    fn check_dev_size<D: Ports>() {
        struct AssertDevSize<D>(D);
        impl<D> AssertDevSize<D> {
            const ASSERT: () = if core::mem::size_of::<D>() != DEV_SIZE {
                panic!("dev must be 16 bytes");
            };
        }
        AssertDevSize::<D>::ASSERT
    }
}
