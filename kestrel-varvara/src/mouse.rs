use crossbeam_channel::{bounded, Receiver, Sender};
use uxn::{Machine, Ports};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct MousePorts {
    vector: U16<BigEndian>,
    x: U16<BigEndian>,
    y: U16<BigEndian>,
    state: u8,
    _pad: [u8; 3],
    scroll_x: U16<BigEndian>,
    scroll_y: U16<BigEndian>,
    _rest: [u8; 2],
}

impl Ports for MousePorts {
    const BASE: u8 = 0x90;
}

/// A host-side mouse snapshot
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MouseState {
    pub x: i16,
    pub y: i16,
    pub scroll_x: i16,
    pub scroll_y: i16,
    /// Bit 0 left, bit 1 middle, bit 2 right
    pub buttons: u8,
}

/// The pointer latch, with change detection over all observable bytes
pub struct Mouse {
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
}

impl Default for Mouse {
    fn default() -> Self {
        Self::new()
    }
}

impl Mouse {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = bounded(1);
        Self { ready_tx, ready_rx }
    }

    /// The coalesced vector-ready signal
    pub fn ready(&self) -> &Receiver<()> {
        &self.ready_rx
    }

    /// The mouse event vector
    pub fn vector(&self, vm: &Machine) -> u16 {
        vm.dev::<MousePorts>().vector.get()
    }

    /// Latches the full mouse state, signalling once if anything changed
    pub fn set(&mut self, vm: &mut Machine, state: MouseState) {
        let m = vm.dev_mut::<MousePorts>();
        let mut changed = false;

        for (port, v) in [
            (&mut m.x, state.x as u16),
            (&mut m.y, state.y as u16),
            (&mut m.scroll_x, state.scroll_x as u16),
            (&mut m.scroll_y, state.scroll_y as u16),
        ] {
            if port.get() != v {
                port.set(v);
                changed = true;
            }
        }
        if m.state != state.buttons {
            m.state = state.buttons;
            changed = true;
        }

        if changed {
            let _ = self.ready_tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_state_is_silent() {
        let mut mouse = Mouse::new();
        let mut m = Machine::new();
        let _ = m.reset(&[]);

        let s = MouseState {
            x: 12,
            y: -1,
            buttons: 0x1,
            ..Default::default()
        };
        mouse.set(&mut m, s);
        assert!(mouse.ready().try_recv().is_ok());
        // Negative coordinates latch as two's complement shorts
        assert_eq!(m.dev::<MousePorts>().y.get(), 0xffff);

        mouse.set(&mut m, s);
        assert!(mouse.ready().try_recv().is_err());
    }
}
