//! The Varvara computer system
//!
//! Sixteen device slots memory-mapped behind the CPU's 256-byte port
//! page: system control, console, screen, controller, mouse, two file
//! handles and a clock.  The [`run::Runner`] sequences CPU bursts against
//! the devices' vector-ready signals and owns pause/step/break debugging
//! and ROM hot swap.
#![warn(missing_docs)]

use log::warn;
use std::io::Write;
use std::sync::Arc;

mod console;
mod controller;
mod datetime;
mod file;
mod mouse;
pub mod run;
mod screen;
pub mod symbols;
mod system;

pub use console::StdinReader;
pub use mouse::MouseState;
pub use run::{Command, Controls, Frame, GuiBridge, InputFrame, Runner, StateFn, StateKind};
pub use system::SystemPorts;

use console::{Console, ConsolePorts};
use controller::{Controller, ControllerPorts};
use datetime::{Datetime, DatetimePorts};
use file::{File, FilePorts};
use mouse::{Mouse, MousePorts};
use screen::{Screen, ScreenPorts};
use system::System;
use uxn::{Device, HaltCode, Machine, Ports};

/// The full Varvara peripheral set
pub struct Varvara {
    system: System,
    console: Console,
    screen: Screen,
    controller: Controller,
    mouse: Mouse,
    files: [File; 2],
    datetime: Datetime,

    /// One warning per unimplemented device slot
    already_warned: [bool; 16],
}

impl Varvara {
    /// Builds a fresh peripheral set against `vm`
    ///
    /// `extra` is trailing ROM data destined for the expansion banks; the
    /// stdin reader and output sinks are handed in so they can outlive
    /// machine replacement.
    pub fn new(
        vm: &mut Machine,
        input: Arc<StdinReader>,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
        extra: &[u8],
    ) -> Self {
        let mut system = System::new();
        system.reset(extra);
        Self {
            system,
            console: Console::new(input, stdout, stderr),
            screen: Screen::new(vm),
            controller: Controller::new(),
            mouse: Mouse::new(),
            files: [File::new(), File::new()],
            datetime: Datetime,
            already_warned: [false; 16],
        }
    }

    fn warn_missing(&mut self, t: u8) {
        let slot = usize::from(t >> 4);
        if !self.already_warned[slot] {
            warn!("unimplemented device {t:#04x}");
            self.already_warned[slot] = true;
        }
    }

    /// The coalesced console input-ready signal
    pub fn console_ready(&self) -> crossbeam_channel::Receiver<()> {
        self.console.ready().clone()
    }

    /// The coalesced controller-ready signal
    pub fn controller_ready(&self) -> crossbeam_channel::Receiver<()> {
        self.controller.ready().clone()
    }

    /// The coalesced mouse-ready signal
    pub fn mouse_ready(&self) -> crossbeam_channel::Receiver<()> {
        self.mouse.ready().clone()
    }

    /// Moves the pending console byte into the read port
    pub fn commit_console(&mut self, vm: &mut Machine) {
        self.console.commit(vm);
    }

    /// Current console vector
    pub fn console_vector(&self, vm: &Machine) -> u16 {
        self.console.vector(vm)
    }

    /// Current controller vector
    pub fn controller_vector(&self, vm: &Machine) -> u16 {
        self.controller.vector(vm)
    }

    /// Current mouse vector
    pub fn mouse_vector(&self, vm: &Machine) -> u16 {
        self.mouse.vector(vm)
    }

    /// Current screen vector
    pub fn screen_vector(&self, vm: &Machine) -> u16 {
        self.screen.vector(vm)
    }

    /// Latches one frame of host input, firing change-detected signals
    pub fn apply_input(&mut self, vm: &mut Machine, input: &InputFrame) {
        self.controller.set_buttons(vm, input.buttons);
        if input.keys.is_empty() {
            self.controller.set_key(vm, 0);
        } else {
            for &k in &input.keys {
                self.controller.set_key(vm, k);
            }
        }
        self.mouse.set(vm, input.mouse);
    }

    /// Draw-op counter, monotonic over the screen's lifetime
    pub fn screen_ops(&self) -> u64 {
        self.screen.ops()
    }

    /// Screen dimensions
    pub fn screen_size(&self) -> (u16, u16) {
        self.screen.size()
    }

    /// Copies the current screen contents into a presenter frame
    pub fn screen_frame(&mut self, vm: &Machine) -> Frame {
        let (width, height) = self.screen.size();
        Frame {
            width,
            height,
            bg: self.screen.bg(vm).to_vec(),
            fg: self.screen.fg().to_vec(),
        }
    }
}

impl Device for Varvara {
    fn dei(&mut self, vm: &mut Machine, target: u8) {
        match target & 0xf0 {
            SystemPorts::BASE => self.system.dei(vm, target),
            ConsolePorts::BASE => self.console.dei(vm, target),
            ScreenPorts::BASE => self.screen.dei(vm, target),
            ControllerPorts::BASE | MousePorts::BASE => (),
            f if FilePorts::matches(f) => (),
            DatetimePorts::BASE => self.datetime.dei(vm, target),
            t => self.warn_missing(t),
        }
    }

    fn deo(&mut self, vm: &mut Machine, target: u8) -> Option<HaltCode> {
        match target & 0xf0 {
            SystemPorts::BASE => return self.system.deo(vm, target),
            ConsolePorts::BASE => self.console.deo(vm, target),
            ScreenPorts::BASE => self.screen.deo(vm, target),
            ControllerPorts::BASE | MousePorts::BASE => (),
            f if FilePorts::matches(f) => {
                let (slot, low) = File::decode_target(target);
                self.files[slot].deo(vm, slot, low);
            }
            DatetimePorts::BASE => self.datetime.deo(vm, target),
            t => self.warn_missing(t),
        }
        None
    }
}
