use crossbeam_channel::{bounded, Receiver, Sender};
use std::mem::offset_of;
use uxn::{Machine, Ports};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ControllerPorts {
    vector: U16<BigEndian>,
    button: u8,
    key: u8,
    _pad: [u8; 12],
}

impl Ports for ControllerPorts {
    const BASE: u8 = 0x80;
}

impl ControllerPorts {
    const BUTTON: u8 = Self::BASE | offset_of!(Self, button) as u8;
    const KEY: u8 = Self::BASE | offset_of!(Self, key) as u8;
}

/// The button-and-keyboard latch
///
/// The host pushes state in through [`Controller::set_buttons`] and
/// [`Controller::set_key`]; a vector-ready signal fires only when a latched
/// byte actually changed, and at most one signal is pending.
pub struct Controller {
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = bounded(1);
        Self { ready_tx, ready_rx }
    }

    /// The coalesced vector-ready signal
    pub fn ready(&self) -> &Receiver<()> {
        &self.ready_rx
    }

    /// The controller event vector
    pub fn vector(&self, vm: &Machine) -> u16 {
        vm.dev::<ControllerPorts>().vector.get()
    }

    /// Latches the button byte, signalling if it changed
    pub fn set_buttons(&mut self, vm: &mut Machine, buttons: u8) {
        if vm.dev_read(ControllerPorts::BUTTON) != buttons {
            vm.write_dev_mem(ControllerPorts::BUTTON, buttons);
            let _ = self.ready_tx.try_send(());
        }
    }

    /// Latches a key character, signalling if it changed
    pub fn set_key(&mut self, vm: &mut Machine, key: u8) {
        if vm.dev_read(ControllerPorts::KEY) != key {
            vm.write_dev_mem(ControllerPorts::KEY, key);
            let _ = self.ready_tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_detection_coalesces_signals() {
        let mut c = Controller::new();
        let mut m = Machine::new();
        let _ = m.reset(&[]);

        c.set_buttons(&mut m, 0x10);
        c.set_buttons(&mut m, 0x30);
        assert!(c.ready().try_recv().is_ok());
        assert!(c.ready().try_recv().is_err());

        // An unchanged write does not re-arm the signal
        c.set_buttons(&mut m, 0x30);
        assert!(c.ready().try_recv().is_err());

        c.set_key(&mut m, b'q');
        assert_eq!(m.dev_read(ControllerPorts::KEY), b'q');
        assert!(c.ready().try_recv().is_ok());
    }
}
