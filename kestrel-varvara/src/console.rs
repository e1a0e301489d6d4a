use crossbeam_channel::{bounded, Receiver, Sender};
use log::error;
use std::{
    io::{Read, Write},
    mem::offset_of,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use uxn::{Machine, Ports};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ConsolePorts {
    vector: U16<BigEndian>,
    read: u8,
    _pad: [u8; 5],
    write: u8,
    error: u8,
    _rest: [u8; 6],
}

impl Ports for ConsolePorts {
    const BASE: u8 = 0x10;
}

impl ConsolePorts {
    const VECTOR_L: u8 = Self::BASE | 1;
    const READ: u8 = Self::BASE | offset_of!(Self, read) as u8;
    const WRITE: u8 = Self::BASE | offset_of!(Self, write) as u8;
    const ERROR: u8 = Self::BASE | offset_of!(Self, error) as u8;
}

/// The stdin reader shared by every machine over the process lifetime
///
/// The reader thread is started by the first write to the console vector
/// port and keeps running across ROM swaps.  It reads one byte at a time;
/// an unconsumed byte is replaced by the next one, and at most one ready
/// signal is pending at any moment.
pub struct StdinReader {
    pending: Mutex<Option<u8>>,
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
    started: AtomicBool,
}

impl Default for StdinReader {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinReader {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = bounded(1);
        Self {
            pending: Mutex::new(None),
            ready_tx,
            ready_rx,
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the reader thread on first call; later calls are no-ops
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let reader = Arc::clone(self);
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 1];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => return,
                    Ok(_) => reader.offer(buf[0]),
                    Err(e) => {
                        error!("reading stdin: {e}");
                        return;
                    }
                }
            }
        });
    }

    /// Latches a byte and signals readiness, replacing any unread byte
    pub fn offer(&self, b: u8) {
        *self.pending.lock().unwrap() = Some(b);
        let _ = self.ready_tx.try_send(());
    }

    /// Takes the pending byte, if any
    fn take(&self) -> Option<u8> {
        self.pending.lock().unwrap().take()
    }

    /// The coalesced input-ready signal
    pub fn ready(&self) -> &Receiver<()> {
        &self.ready_rx
    }
}

pub struct Console {
    input: Arc<StdinReader>,
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
}

impl Console {
    pub fn new(
        input: Arc<StdinReader>,
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
    ) -> Self {
        Self { input, out, err }
    }

    pub fn deo(&mut self, vm: &mut Machine, target: u8) {
        let v = vm.dev::<ConsolePorts>();
        match target {
            ConsolePorts::VECTOR_L => self.input.start(),
            ConsolePorts::WRITE => {
                let b = v.write;
                if let Err(e) = self.out.write_all(&[b]).and_then(|_| self.out.flush()) {
                    error!("writing stdout: {e}");
                }
            }
            ConsolePorts::ERROR => {
                let b = v.error;
                if let Err(e) = self.err.write_all(&[b]).and_then(|_| self.err.flush()) {
                    error!("writing stderr: {e}");
                }
            }
            _ => (),
        }
    }

    pub fn dei(&mut self, vm: &mut Machine, target: u8) {
        if target == ConsolePorts::READ {
            if let Some(b) = self.input.take() {
                vm.write_dev_mem(ConsolePorts::READ, b);
            }
        }
    }

    /// Moves the pending input byte into the read port
    ///
    /// The runner calls this after receiving the ready signal, before
    /// invoking the console vector.
    pub fn commit(&mut self, vm: &mut Machine) {
        if let Some(b) = self.input.take() {
            vm.write_dev_mem(ConsolePorts::READ, b);
        }
    }

    /// The console event vector
    pub fn vector(&self, vm: &Machine) -> u16 {
        vm.dev::<ConsolePorts>().vector.get()
    }

    /// The coalesced input-ready signal
    pub fn ready(&self) -> &Receiver<()> {
        self.input.ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latched_byte_is_replaced_not_queued() {
        let reader = Arc::new(StdinReader::new());
        reader.offer(b'a');
        reader.offer(b'b');
        assert_eq!(reader.take(), Some(b'b'));
        assert_eq!(reader.take(), None);
        // Both offers coalesced into a single ready signal
        assert!(reader.ready().try_recv().is_ok());
        assert!(reader.ready().try_recv().is_err());
    }

    #[test]
    fn commit_moves_byte_into_the_read_port() {
        let reader = Arc::new(StdinReader::new());
        let mut con =
            Console::new(reader.clone(), Box::new(std::io::sink()), Box::new(std::io::sink()));
        let mut m = Machine::new();
        let _ = m.reset(&[]);
        reader.offer(0x41);
        con.commit(&mut m);
        assert_eq!(m.dev_read(ConsolePorts::READ), 0x41);
    }

    #[test]
    fn writes_reach_the_sinks() {
        // Vec<u8> sinks stand in for stdout/stderr
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let out = Arc::new(Mutex::new(Vec::new()));
        let reader = Arc::new(StdinReader::new());
        let mut con = Console::new(
            reader,
            Box::new(Shared(out.clone())),
            Box::new(std::io::sink()),
        );
        let mut m = Machine::new();
        let _ = m.reset(&[]);
        for b in b"Hi\n" {
            m.write_dev_mem(ConsolePorts::WRITE, *b);
            con.deo(&mut m, ConsolePorts::WRITE);
        }
        assert_eq!(out.lock().unwrap().as_slice(), b"Hi\n");
    }
}
