use log::warn;
use std::mem::offset_of;
use uxn::{HaltCode, Machine, Ports};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

/// Number of expansion banks reachable through the copy command
const BANKS: usize = 15;

pub struct System {
    banks: [Box<[u8; 65536]>; BANKS],
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct SystemPorts {
    /// Recovery entry point for stack and arithmetic faults
    vector: U16<BigEndian>,
    expansion: U16<BigEndian>,
    _unused: [u8; 4],
    red: U16<BigEndian>,
    green: U16<BigEndian>,
    blue: U16<BigEndian>,
    debug: u8,
    state: u8,
}

impl Ports for SystemPorts {
    const BASE: u8 = 0x00;
}

impl SystemPorts {
    const EXPANSION: u8 = (offset_of!(Self, expansion) + 1) as u8;
    const DEBUG: u8 = offset_of!(Self, debug) as u8;
    const STATE: u8 = offset_of!(Self, state) as u8;

    /// The halt-vector address, or 0 when unset
    pub fn halt_vector(&self) -> u16 {
        self.vector.get()
    }

    /// The exit code recorded by a write to the state port
    pub fn exit_code(&self) -> i32 {
        i32::from(self.state & 0x7f)
    }

    /// Looks up the ARGB color for palette index `i`
    ///
    /// Color `i` takes nibble `i` of each channel word, replicated into
    /// both nibbles of an 8-bit component, with alpha 0xFF.
    pub fn color(&self, i: u8) -> u32 {
        let i = 3 - i;
        let r = u32::from(self.red.get() >> (i * 4)) & 0xf;
        let g = u32::from(self.green.get() >> (i * 4)) & 0xf;
        let b = u32::from(self.blue.get() >> (i * 4)) & 0xf;
        let color = 0x0f00_0000 | (r << 16) | (g << 8) | b;
        color | (color << 4)
    }
}

/// Packed operands of the RAM-to-RAM copy command
#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct Cpy {
    length: U16<BigEndian>,
    src_bank: u8,
    src_addr: U16<BigEndian>,
    dst_bank: u8,
    dst_addr: U16<BigEndian>,
}

mod expansion {
    pub const CPY: u8 = 0x01;
}

impl System {
    pub fn new() -> Self {
        let banks = [(); BANKS].map(|_| {
            vec![0u8; 65536]
                .into_boxed_slice()
                .try_into()
                .expect("65536-byte bank")
        });
        Self { banks }
    }

    /// Loads trailing ROM data into the expansion banks
    pub fn reset(&mut self, mut mem: &[u8]) {
        for b in &mut self.banks {
            let n = mem.len().min(b.len());
            b[..n].copy_from_slice(&mem[..n]);
            mem = &mem[n..];
            b[n..].fill(0u8);
        }
    }

    pub fn deo(&mut self, vm: &mut Machine, target: u8) -> Option<HaltCode> {
        let v = vm.dev::<SystemPorts>();
        match target {
            SystemPorts::EXPANSION => {
                let addr = v.expansion.get();
                let cmd = vm.ram_read_byte(addr);
                match cmd {
                    expansion::CPY => self.copy(vm, addr),
                    _ => warn!("unknown expansion command {cmd:#04x}"),
                }
                None
            }
            SystemPorts::DEBUG => Some(HaltCode::Debug),
            SystemPorts::STATE => {
                if v.state != 0 {
                    Some(HaltCode::Halt)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn dei(&mut self, _vm: &mut Machine, _target: u8) {
        // Every system port reads back its last written value
    }

    /// Executes the copy command whose operands start past `addr`
    fn copy(&mut self, vm: &mut Machine, addr: u16) {
        let mut c = Cpy::new_zeroed();
        for (i, b) in c.as_bytes_mut().iter_mut().enumerate() {
            *b = vm.ram_read_byte(addr.wrapping_add(1).wrapping_add(i as u16));
        }
        for i in 0..c.length.get() {
            let v = self.bank_read(vm, c.src_bank, c.src_addr.get().wrapping_add(i));
            self.bank_write(vm, c.dst_bank, c.dst_addr.get().wrapping_add(i), v);
        }
    }

    fn bank_read(&self, vm: &Machine, bank: u8, addr: u16) -> u8 {
        match usize::from(bank).checked_sub(1) {
            None => vm.ram_read_byte(addr),
            Some(b) => match self.banks.get(b) {
                Some(bank) => bank[usize::from(addr)],
                None => 0,
            },
        }
    }

    fn bank_write(&mut self, vm: &mut Machine, bank: u8, addr: u16, v: u8) {
        match usize::from(bank).checked_sub(1) {
            None => vm.ram_write_byte(addr, v),
            Some(b) => {
                if let Some(bank) = self.banks.get_mut(b) {
                    bank[usize::from(addr)] = v;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uxn::EmptyDevice;

    fn machine() -> Machine {
        let mut m = Machine::new();
        let _ = m.reset(&[]);
        m
    }

    #[test]
    fn palette_nibbles_replicate() {
        let mut m = machine();
        let p = m.dev_mut::<SystemPorts>();
        p.red.set(0x1234);
        p.green.set(0x5678);
        p.blue.set(0x9abc);
        let p = m.dev::<SystemPorts>();
        assert_eq!(p.color(0), 0xff115599);
        assert_eq!(p.color(1), 0xff2266aa);
        assert_eq!(p.color(2), 0xff3377bb);
        assert_eq!(p.color(3), 0xff4488cc);
    }

    #[test]
    fn copy_between_main_and_bank() {
        let mut sys = System::new();
        let mut m = machine();
        // Stage a payload and the packed operands in main memory
        for (i, b) in b"kestrel".iter().enumerate() {
            m.ram_write_byte(0x3000 + i as u16, *b);
        }
        let operands: [u8; 9] = [
            0x01, // copy
            0x00, 0x07, // length
            0x00, // src bank: main
            0x30, 0x00, // src addr
            0x01, // dst bank 1
            0x00, 0x10, // dst addr
        ];
        for (i, b) in operands.iter().enumerate() {
            m.ram_write_byte(0x2000 + i as u16, *b);
        }
        m.dev_mut::<SystemPorts>().expansion.set(0x2000);
        assert_eq!(sys.deo(&mut m, SystemPorts::EXPANSION), None);
        assert_eq!(&sys.banks[0][0x10..0x17], b"kestrel");

        // And back again into main memory
        let operands: [u8; 9] = [0x01, 0x00, 0x07, 0x01, 0x00, 0x10, 0x00, 0x40, 0x00];
        for (i, b) in operands.iter().enumerate() {
            m.ram_write_byte(0x2000 + i as u16, *b);
        }
        assert_eq!(sys.deo(&mut m, SystemPorts::EXPANSION), None);
        let got: Vec<u8> = (0..7).map(|i| m.ram_read_byte(0x4000 + i)).collect();
        assert_eq!(&got, b"kestrel");
    }

    #[test]
    fn exit_port_raises_halt() {
        let mut sys = System::new();
        let mut m = machine();
        m.write_dev_mem(SystemPorts::STATE, 0x81);
        assert_eq!(sys.deo(&mut m, SystemPorts::STATE), Some(HaltCode::Halt));
        assert_eq!(m.dev::<SystemPorts>().exit_code(), 1);
    }

    #[test]
    fn debug_port_raises_debug() {
        let mut sys = System::new();
        let mut m = machine();
        m.write_dev_mem(SystemPorts::DEBUG, 1);
        assert_eq!(sys.deo(&mut m, SystemPorts::DEBUG), Some(HaltCode::Debug));
        // A debug fault leaves the machine runnable
        assert_eq!(m.step(&mut EmptyDevice), Ok(uxn::Step::Break));
    }
}
