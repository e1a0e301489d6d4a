//! The runner: CPU bursts, vector dispatch, and debug control
//!
//! One session thread owns the machine and devices and alternates between
//! executing a burst (to the next `BRK` or fault) and waiting on the union
//! of vector-ready signals.  The control loop owns the session: it can
//! halt it, swap in a new ROM, and relay debugger commands.  Break and
//! debug addresses and the pause flag are shared atomics, read at every
//! instruction boundary.

use crate::{MouseState, StdinReader, SystemPorts, Varvara};
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use log::{error, info};
use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};
use uxn::{HaltCode, HaltError, Machine, Step};

/// Why the runner is telling the debugger about the machine
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateKind {
    /// Execution resumed after a wait
    Clear,
    /// The machine stopped for good
    Halt,
    /// Stopped on the pause flag
    Pause,
    /// Stopped on the break address
    Break,
    /// Passed the debug address or hit the debug port; still running
    Debug,
    /// A burst completed without incident
    Quiet,
}

/// Out-of-band state callback, run on the execution thread
///
/// Implementations must treat the machine as read-only and return
/// promptly.
pub type StateFn = Arc<dyn Fn(&Machine, StateKind) + Send + Sync>;

/// A debugger command, as accepted by [`Controls::send`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Stop the current session
    Halt,
    /// Halt, rebuild the machine from the ROM, and restart
    Reset,
    /// Pause and execute a single instruction
    Step,
    /// Clear the pause flag and resume
    Continue,
    /// Set the break address (0 clears it)
    Break(u16),
    /// Set the debug address (0 clears it)
    Debug(u16),
    /// Halt and leave the control loop
    Exit,
}

/// One frame of host input, latched at the screen tick
#[derive(Clone, Debug, Default)]
pub struct InputFrame {
    /// Controller button bitmask
    pub buttons: u8,
    /// Key characters pressed since the last tick
    pub keys: Vec<u8>,
    /// Pointer state in screen coordinates
    pub mouse: MouseState,
}

/// A copy of both screen layers for the presenter
#[derive(Clone)]
pub struct Frame {
    pub width: u16,
    pub height: u16,
    /// Opaque background, ARGB
    pub bg: Vec<u32>,
    /// Foreground with transparent holes, ARGB
    pub fg: Vec<u32>,
}

/// The presenter's half of the tick/frame handshake
pub struct GuiBridge {
    /// Send one input frame per 60 Hz tick; coalesced under backpressure
    pub tick: Sender<InputFrame>,
    /// Fresh screen contents, published only when the draw counter moved
    pub frame: Receiver<Frame>,
}

/// A cloneable handle for driving the runner from a debugger
#[derive(Clone)]
pub struct Controls {
    debug_tx: Sender<Command>,
    swap_tx: Sender<Vec<u8>>,
    swap_done_rx: Receiver<()>,
}

impl Controls {
    /// Sends a debugger command; lost if the runner already exited
    pub fn send(&self, cmd: Command) {
        let _ = self.debug_tx.send(cmd);
    }

    /// Replaces the running ROM, blocking until the new machine executes
    pub fn swap(&self, rom: Vec<u8>) {
        if self.swap_tx.send(rom).is_ok() {
            let _ = self.swap_done_rx.recv();
        }
    }
}

/// Shared debug state, carried across machine replacement
#[derive(Clone)]
struct DebugFlags {
    paused: Arc<AtomicBool>,
    break_addr: Arc<AtomicU32>,
    debug_addr: Arc<AtomicU32>,
    cont_tx: Sender<()>,
    cont_rx: Receiver<()>,
}

impl DebugFlags {
    fn new() -> Self {
        let (cont_tx, cont_rx) = bounded(0);
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            break_addr: Arc::new(AtomicU32::new(0)),
            debug_addr: Arc::new(AtomicU32::new(0)),
            cont_tx,
            cont_rx,
        }
    }

    /// Non-blocking continue: only delivered if the session is waiting
    fn nudge(&self) {
        let _ = self.cont_tx.try_send(());
    }
}

/// A shareable output sink for the console device
#[derive(Clone)]
pub(crate) struct Sink(Arc<Mutex<Box<dyn Write + Send>>>);

impl Sink {
    fn new(w: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(w)))
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

/// A running execution session
struct Session {
    /// Dropping this halts the session at its next suspension point
    halt_tx: Sender<()>,
    done_rx: Receiver<(Machine, Result<(), HaltError>)>,
}

/// Owns the execution thread and sequences machine lifecycles
pub struct Runner {
    gui: bool,
    dev: bool,
    state: StateFn,
    flags: DebugFlags,
    input: Arc<StdinReader>,
    stdout: Sink,
    stderr: Sink,

    debug_tx: Sender<Command>,
    debug_rx: Receiver<Command>,
    swap_tx: Sender<Vec<u8>>,
    swap_rx: Receiver<Vec<u8>>,
    swap_done_tx: Sender<()>,
    swap_done_rx: Receiver<()>,

    tick_tx: Option<Sender<InputFrame>>,
    tick_rx: Receiver<InputFrame>,
    frame_tx: Sender<Frame>,
    frame_rx: Option<Receiver<Frame>>,
}

impl Runner {
    /// Builds a runner
    ///
    /// `gui` enables the presenter handshake; `dev` keeps the control
    /// loop alive after the program stops, awaiting reset or swap.
    pub fn new(gui: bool, dev: bool, state: Option<StateFn>) -> Self {
        let state = state.unwrap_or_else(|| Arc::new(|_: &Machine, _| {}));
        let (debug_tx, debug_rx) = bounded(16);
        let (swap_tx, swap_rx) = bounded(0);
        let (swap_done_tx, swap_done_rx) = bounded(0);
        let (tick_tx, tick_rx) = bounded(1);
        let (frame_tx, frame_rx) = bounded(1);
        Self {
            gui,
            dev,
            state,
            flags: DebugFlags::new(),
            input: Arc::new(StdinReader::new()),
            stdout: Sink::new(Box::new(std::io::stdout())),
            stderr: Sink::new(Box::new(std::io::stderr())),
            debug_tx,
            debug_rx,
            swap_tx,
            swap_rx,
            swap_done_tx,
            swap_done_rx,
            tick_tx: Some(tick_tx),
            tick_rx,
            frame_tx,
            frame_rx: Some(frame_rx),
        }
    }

    /// Redirects console output, for debugger UIs and tests
    pub fn set_output(&mut self, out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) {
        self.stdout = Sink::new(out);
        self.stderr = Sink::new(err);
    }

    /// The shared stdin reader, for hosts that feed input themselves
    pub fn input(&self) -> Arc<StdinReader> {
        Arc::clone(&self.input)
    }

    /// Sets the break address before or during execution (0 clears)
    pub fn set_break(&self, addr: u16) {
        self.flags.break_addr.store(u32::from(addr), Ordering::SeqCst);
    }

    /// Sets the debug address before or during execution (0 clears)
    pub fn set_debug(&self, addr: u16) {
        self.flags.debug_addr.store(u32::from(addr), Ordering::SeqCst);
    }

    /// The debugger-side control handle
    pub fn controls(&self) -> Controls {
        Controls {
            debug_tx: self.debug_tx.clone(),
            swap_tx: self.swap_tx.clone(),
            swap_done_rx: self.swap_done_rx.clone(),
        }
    }

    /// Takes the presenter's half of the tick/frame handshake
    ///
    /// May be taken once; only meaningful when the runner was built with
    /// `gui` enabled.
    pub fn bridge(&mut self) -> GuiBridge {
        GuiBridge {
            tick: self.tick_tx.take().expect("bridge already taken"),
            frame: self.frame_rx.take().expect("bridge already taken"),
        }
    }

    /// Runs the ROM to completion and returns the process exit code
    ///
    /// In dev mode the loop outlives the program, waiting for reset and
    /// swap requests; otherwise the first session to stop decides the
    /// exit code.
    pub fn run(mut self, rom: Vec<u8>) -> i32 {
        // Keep a sender alive in cli mode so the tick arm stays quiet
        let _parked_tick = if self.gui { None } else { self.tick_tx.take() };

        let mut rom = rom;
        let mut session = Some(self.spawn(&rom));
        let mut stopped: Option<Machine> = None;
        loop {
            let done = session
                .as_ref()
                .map(|s| s.done_rx.clone())
                .unwrap_or_else(never);
            select! {
                recv(self.swap_rx) -> r => {
                    let Ok(new_rom) = r else { continue };
                    if !self.dev {
                        error!("swap requested while not in dev mode");
                        let _ = self.swap_done_tx.send(());
                        continue;
                    }
                    stopped = self.halt(&mut session).or(stopped);
                    rom = new_rom;
                    session = Some(self.spawn(&rom));
                    let _ = self.swap_done_tx.send(());
                }
                recv(done) -> r => {
                    session = None;
                    match r {
                        Ok((m, res)) => {
                            match &res {
                                Ok(()) => info!("uxn: stopped"),
                                Err(e) => error!("uxn: stopped: {e}"),
                            }
                            if !self.dev {
                                return m.dev::<SystemPorts>().exit_code();
                            }
                            stopped = Some(m);
                        }
                        Err(_) => {
                            error!("uxn: stopped: program bug in device handler");
                            if !self.dev {
                                return 1;
                            }
                        }
                    }
                }
                recv(self.debug_rx) -> cmd => {
                    let Ok(cmd) = cmd else { continue };
                    match cmd {
                        Command::Halt => {
                            stopped = self.halt(&mut session).or(stopped);
                        }
                        Command::Reset => {
                            stopped = self.halt(&mut session).or(stopped);
                            session = Some(self.spawn(&rom));
                        }
                        Command::Step => {
                            self.flags.paused.store(true, Ordering::SeqCst);
                            self.flags.nudge();
                        }
                        Command::Continue => {
                            self.flags.paused.store(false, Ordering::SeqCst);
                            self.flags.nudge();
                        }
                        Command::Break(addr) => {
                            self.flags.break_addr.store(u32::from(addr), Ordering::SeqCst);
                        }
                        Command::Debug(addr) => {
                            self.flags.debug_addr.store(u32::from(addr), Ordering::SeqCst);
                        }
                        Command::Exit => {
                            stopped = self.halt(&mut session).or(stopped);
                            return stopped
                                .map(|m| m.dev::<SystemPorts>().exit_code())
                                .unwrap_or(0);
                        }
                    }
                }
            }
        }
    }

    /// Halts the running session, if any, and recovers its machine
    ///
    /// Setting the pause flag forces a busy burst to its next suspension
    /// point, where the dropped halt channel is observed.
    fn halt(&mut self, session: &mut Option<Session>) -> Option<Machine> {
        let s = session.take()?;
        self.flags.paused.store(true, Ordering::SeqCst);
        drop(s.halt_tx);
        match s.done_rx.recv() {
            Ok((m, res)) => {
                match res {
                    Ok(()) => info!("uxn: stopped"),
                    Err(e) => error!("uxn: stopped: {e}"),
                }
                Some(m)
            }
            Err(_) => {
                error!("uxn: stopped: program bug in device handler");
                None
            }
        }
    }

    /// Builds a machine for `rom` and starts its session thread
    ///
    /// Break and debug addresses carry over; the pause flag does not.
    fn spawn(&self, rom: &[u8]) -> Session {
        self.flags.paused.store(false, Ordering::SeqCst);
        let mut m = Machine::new();
        let extra = m.reset(rom);
        let mut v = Varvara::new(
            &mut m,
            Arc::clone(&self.input),
            Box::new(self.stdout.clone()),
            Box::new(self.stderr.clone()),
            extra,
        );
        emit(&self.state, &m, StateKind::Clear);

        let (halt_tx, halt_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded(1);
        let flags = self.flags.clone();
        let state = Arc::clone(&self.state);
        let tick_rx = self.tick_rx.clone();
        let frame_tx = self.frame_tx.clone();
        std::thread::spawn(move || {
            let res = exec(&mut m, &mut v, &flags, &state, &halt_rx, &tick_rx, &frame_tx);
            emit(&state, &m, StateKind::Halt);
            let _ = done_tx.send((m, res));
        });
        info!("uxn: started");
        Session { halt_tx, done_rx }
    }
}

/// Invokes the state callback through a plain trait-object reference
fn emit(state: &StateFn, m: &Machine, k: StateKind) {
    let f: &(dyn Fn(&Machine, StateKind) + Send + Sync) = &**state;
    f(m, k);
}

/// The burst/wait loop, run on the session thread
fn exec(
    m: &mut Machine,
    v: &mut Varvara,
    flags: &DebugFlags,
    state: &StateFn,
    halt_rx: &Receiver<()>,
    tick_rx: &Receiver<InputFrame>,
    frame_tx: &Sender<Frame>,
) -> Result<(), HaltError> {
    let console_ready = v.console_ready();
    let controller_ready = v.controller_ready();
    let mouse_ready = v.mouse_ready();
    let mut published_ops: Option<u64> = None;

    loop {
        let mut clear = false;
        let mut quiet = true;

        // One burst: instructions until BRK, with debug checks between
        loop {
            let mut wait = false;
            if flags.paused.load(Ordering::SeqCst) {
                emit(state, m, StateKind::Pause);
                wait = true;
            } else if flags.break_addr.load(Ordering::SeqCst) as u16 == m.pc {
                emit(state, m, StateKind::Break);
                wait = true;
            } else if flags.debug_addr.load(Ordering::SeqCst) as u16 == m.pc {
                emit(state, m, StateKind::Debug);
                quiet = false;
            }
            if wait {
                select! {
                    recv(halt_rx) -> _ => return Ok(()),
                    recv(flags.cont_rx) -> r => {
                        if r.is_err() {
                            return Ok(());
                        }
                    }
                }
                clear = true;
                quiet = false;
            }
            match m.step(v) {
                Ok(Step::Continue) => (),
                Ok(Step::Break) => break,
                Err(e) if e.code == HaltCode::Debug => {
                    emit(state, m, StateKind::Debug);
                }
                Err(e) if e.code == HaltCode::Halt => return Ok(()),
                Err(e) => {
                    // The fault frame is already on the stacks; resume at
                    // the halt vector when one is set
                    let vec = m.dev::<SystemPorts>().halt_vector();
                    if vec > 0 {
                        m.pc = vec;
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        if quiet {
            emit(state, m, StateKind::Quiet);
        } else if clear {
            emit(state, m, StateKind::Clear);
        }

        // Wait for the next vector
        let mut vector = 0u16;
        while vector == 0 {
            select! {
                recv(console_ready) -> r => {
                    if r.is_ok() {
                        v.commit_console(m);
                        vector = v.console_vector(m);
                    }
                }
                recv(controller_ready) -> r => {
                    if r.is_ok() {
                        vector = v.controller_vector(m);
                    }
                }
                recv(mouse_ready) -> r => {
                    if r.is_ok() {
                        vector = v.mouse_vector(m);
                    }
                }
                recv(tick_rx) -> input => {
                    let Ok(input) = input else {
                        // The presenter went away; treat it as a halt
                        return Ok(());
                    };
                    v.apply_input(m, &input);
                    publish(m, v, frame_tx, &mut published_ops);
                    vector = v.screen_vector(m);
                }
                recv(halt_rx) -> _ => return Ok(()),
            }
        }
        m.pc = vector;
    }
}

/// Offers the presenter a fresh frame when the draw counter moved
fn publish(m: &Machine, v: &mut Varvara, frame_tx: &Sender<Frame>, published: &mut Option<u64>) {
    let ops = v.screen_ops();
    if *published == Some(ops) {
        return;
    }
    if frame_tx.try_send(v.screen_frame(m)).is_ok() {
        *published = Some(ops);
    }
}
