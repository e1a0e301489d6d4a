//! End-to-end scenarios driving the machine through the device layer

use std::io::Write;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use uxn::{op, HaltCode, Machine};
use varvara::{Command, Runner, StateKind, StdinReader, SystemPorts, Varvara};

/// A shareable byte sink standing in for stdout/stderr
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Sink {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

fn boot(rom: &[u8]) -> (Machine, Varvara, Sink, Sink) {
    let mut m = Machine::new();
    let extra = m.reset(rom);
    let (out, err) = (Sink::default(), Sink::default());
    let v = Varvara::new(
        &mut m,
        Arc::new(StdinReader::new()),
        Box::new(out.clone()),
        Box::new(err.clone()),
        extra,
    );
    (m, v, out, err)
}

#[test]
fn hello_world_to_console() {
    // Write 'H', 'i', '\n' to the console, then exit with code 1
    let rom = [
        op::LIT, b'H', op::LIT, 0x18, op::DEO,
        op::LIT, b'i', op::LIT, 0x18, op::DEO,
        op::LIT, b'\n', op::LIT, 0x18, op::DEO,
        op::LIT, 0x01, op::LIT, 0x0f, op::DEO,
        op::BRK,
    ];
    let (mut m, mut v, out, _err) = boot(&rom);
    let err = m.run(&mut v).unwrap_err();
    assert_eq!(err.code, HaltCode::Halt);
    assert_eq!(m.dev::<SystemPorts>().exit_code(), 1);
    assert_eq!(out.contents(), b"Hi\n");
}

#[test]
fn stderr_is_independent() {
    let rom = [op::LIT, b'!', op::LIT, 0x19, op::DEO, op::BRK];
    let (mut m, mut v, out, err) = boot(&rom);
    m.run(&mut v).unwrap();
    assert!(out.contents().is_empty());
    assert_eq!(err.contents(), b"!");
}

#[test]
fn sprite_draw_increments_ops_once() {
    // Configure a 16x16 screen with a distinct palette and a one-bit
    // sprite at 0x3000, then draw it from a second vector
    let rom = [
        // Palette
        op::LIT | op::SHORT, 0x12, 0x34, op::LIT, 0x08, op::DEO | op::SHORT,
        op::LIT | op::SHORT, 0x56, 0x78, op::LIT, 0x0a, op::DEO | op::SHORT,
        op::LIT | op::SHORT, 0x9a, 0xbc, op::LIT, 0x0c, op::DEO | op::SHORT,
        // width = height = 16
        op::LIT | op::SHORT, 0x00, 0x10, op::LIT, 0x22, op::DEO | op::SHORT,
        op::LIT | op::SHORT, 0x00, 0x10, op::LIT, 0x24, op::DEO | op::SHORT,
        // x = y = 0, addr = 0x3000
        op::LIT | op::SHORT, 0x00, 0x00, op::LIT, 0x28, op::DEO | op::SHORT,
        op::LIT | op::SHORT, 0x00, 0x00, op::LIT, 0x2a, op::DEO | op::SHORT,
        op::LIT | op::SHORT, 0x30, 0x00, op::LIT, 0x2c, op::DEO | op::SHORT,
        op::BRK,
        // 0x131: the draw vector
        op::LIT, 0x01, op::LIT, 0x2f, op::DEO, op::BRK,
    ];
    let draw_vector = 0x100 + rom.len() as u16 - 6;
    let (mut m, mut v, _out, _err) = boot(&rom);
    // A diagonal sprite
    for j in 0..8u16 {
        m.ram_write_byte(0x3000 + j, 0x80 >> j);
    }
    m.run(&mut v).unwrap();
    assert_eq!(v.screen_size(), (16, 16));

    let before = v.screen_ops();
    m.run_vector(&mut v, draw_vector).unwrap();
    assert_eq!(v.screen_ops(), before + 1);

    let frame = v.screen_frame(&m);
    let color0 = m.dev::<SystemPorts>().color(0);
    let color1 = m.dev::<SystemPorts>().color(1);
    for y in 0..16usize {
        for x in 0..16usize {
            let want = if x == y && x < 8 { color1 } else { color0 };
            assert_eq!(frame.bg[x + y * 16], want, "pixel ({x},{y})");
        }
    }
}

#[test]
fn unknown_device_reads_zero() {
    // DEI from the (unimplemented) audio slot pushes zero
    let rom = [op::LIT, 0x30, op::DEI, op::BRK];
    let (mut m, mut v, _out, _err) = boot(&rom);
    m.run(&mut v).unwrap();
    assert_eq!(m.work().bytes(), &[0]);
}

fn run_with_states(
    rom: Vec<u8>,
) -> (
    varvara::run::Controls,
    Arc<StdinReader>,
    mpsc::Receiver<StateKind>,
    std::thread::JoinHandle<i32>,
    Sink,
) {
    let (state_tx, state_rx) = mpsc::channel();
    let state: varvara::StateFn = Arc::new(move |_m: &Machine, k| {
        let _ = state_tx.send(k);
    });
    let mut runner = Runner::new(false, false, Some(state));
    let out = Sink::default();
    runner.set_output(Box::new(out.clone()), Box::new(std::io::sink()));
    let controls = runner.controls();
    let input = runner.input();
    let handle = std::thread::spawn(move || runner.run(rom));
    (controls, input, state_rx, handle, out)
}

fn expect_state(rx: &mpsc::Receiver<StateKind>, want: StateKind) {
    loop {
        let got = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
        if got == want {
            return;
        }
    }
}

/// Sends `Continue` until the session reports the wanted state
///
/// The continue nudge is only delivered when the session is already
/// waiting, so a debugger retries rather than queueing.
fn resume_until(
    rx: &mpsc::Receiver<StateKind>,
    controls: &varvara::run::Controls,
    want: StateKind,
) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        controls.send(Command::Continue);
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(k) if k == want => return,
            Ok(_) => (),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "timed out waiting for {want:?}"
                );
            }
            Err(e) => panic!("state channel closed: {e}"),
        }
    }
}

#[test]
fn break_then_continue() {
    // Two literals; break on the second
    let rom = vec![op::LIT, 0x01, op::LIT, 0x02, op::BRK];
    let (state_tx, states) = mpsc::channel();
    let state: varvara::StateFn = Arc::new(move |_m: &Machine, k| {
        let _ = state_tx.send(k);
    });
    let mut runner = Runner::new(false, false, Some(state));
    runner.set_output(Box::new(std::io::sink()), Box::new(std::io::sink()));
    runner.set_break(0x0102);
    let controls = runner.controls();
    let handle = std::thread::spawn(move || runner.run(rom));

    expect_state(&states, StateKind::Break);
    resume_until(&states, &controls, StateKind::Clear);
    controls.send(Command::Exit);
    expect_state(&states, StateKind::Halt);
    assert_eq!(handle.join().unwrap(), 0);
}

#[test]
fn echo_loop_round_trips_stdin() {
    // Set the console vector to a handler that echoes the input byte
    let handler: u16 = 0x010a;
    let rom = vec![
        // vector = handler; the low-byte write starts the reader
        op::LIT | op::SHORT, (handler >> 8) as u8, handler as u8,
        op::LIT, 0x10, op::DEO | op::SHORT,
        op::BRK,
        op::BRK, op::BRK, op::BRK,
        // 0x10a: read the latched byte, write it back out
        op::LIT, 0x12, op::DEI, op::LIT, 0x18, op::DEO, op::BRK,
    ];
    assert_eq!(rom[usize::from(handler) - 0x100], op::LIT);

    let (controls, input, states, handle, out) = run_with_states(rom);
    expect_state(&states, StateKind::Quiet);

    for b in *b"abc\n" {
        input.offer(b);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !out.contents().ends_with(&[b]) {
            assert!(std::time::Instant::now() < deadline, "echo timed out");
            std::thread::yield_now();
        }
    }
    assert_eq!(out.contents(), b"abc\n");

    controls.send(Command::Exit);
    assert_eq!(handle.join().unwrap(), 0);
}

#[test]
fn halt_vector_recovery() {
    // Install a recovery vector at 0x0200, then underflow on POP.
    // The recovery frame replaces the working stack and execution
    // resumes at the vector, which exits with code 3.
    let rom_head = vec![
        op::LIT | op::SHORT, 0x02, 0x00, op::LIT, 0x00, op::DEO | op::SHORT,
        op::POP, // faults at 0x0106
    ];
    let mut rom = rom_head;
    rom.resize(0x100, 0); // pad to 0x0200
    rom.extend_from_slice(&[op::LIT, 0x03, op::LIT, 0x0f, op::DEO, op::BRK]);

    let frame: Arc<Mutex<Option<(Vec<u8>, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&frame);
    let state: varvara::StateFn = Arc::new(move |m: &Machine, k| {
        if k == StateKind::Debug && seen.lock().unwrap().is_none() {
            *seen.lock().unwrap() = Some((m.work().bytes().to_vec(), m.ret().bytes().to_vec()));
        }
    });
    let mut runner = Runner::new(false, false, Some(state));
    runner.set_output(Box::new(std::io::sink()), Box::new(std::io::sink()));
    runner.set_debug(0x0200);
    let code = runner.run(rom);
    assert_eq!(code, 3);

    let (work, ret) = frame.lock().unwrap().clone().expect("debug state at the vector");
    assert_eq!(work, vec![0x01, 0x06, op::POP, 0x01]);
    assert!(ret.is_empty());
}

#[test]
fn fault_without_vector_reports_and_exits() {
    let rom = vec![op::POP];
    let mut runner = Runner::new(false, false, None);
    runner.set_output(Box::new(std::io::sink()), Box::new(std::io::sink()));
    // No halt vector: the fault surfaces and the system exit code (0) is
    // returned
    assert_eq!(runner.run(rom), 0);
}

#[test]
fn device_contract_violation_is_an_internal_failure() {
    // A file read with no name or length set panics the device; the
    // runner reports exit code 1
    let rom = vec![
        op::LIT | op::SHORT, 0x00, 0x05, op::LIT, 0xaa, op::DEO | op::SHORT, // length = 5
        op::LIT | op::SHORT, 0x60, 0x00, op::LIT, 0xac, op::DEO | op::SHORT, // read trigger
        op::BRK,
    ];
    let mut runner = Runner::new(false, false, None);
    runner.set_output(Box::new(std::io::sink()), Box::new(std::io::sink()));
    assert_eq!(runner.run(rom), 1);
}

#[test]
fn swap_is_rejected_outside_dev_mode() {
    let rom = vec![op::BRK];
    let mut runner = Runner::new(false, false, None);
    runner.set_output(Box::new(std::io::sink()), Box::new(std::io::sink()));
    let controls = runner.controls();
    let handle = std::thread::spawn(move || runner.run(rom));
    // The acknowledgement must arrive even though the swap is refused
    controls.swap(vec![op::BRK]);
    controls.send(Command::Exit);
    let _ = handle.join();
}

#[test]
fn dev_mode_swap_replaces_the_machine() {
    let first = vec![op::BRK];
    // The replacement program exits immediately with code 7
    let second = vec![op::LIT, 0x07, op::LIT, 0x0f, op::DEO, op::BRK];

    let (state_tx, state_rx) = mpsc::channel();
    let state: varvara::StateFn = Arc::new(move |_m: &Machine, k| {
        let _ = state_tx.send(k);
    });
    let mut runner = Runner::new(false, true, Some(state));
    runner.set_output(Box::new(std::io::sink()), Box::new(std::io::sink()));
    let controls = runner.controls();
    let handle = std::thread::spawn(move || runner.run(first));

    expect_state(&state_rx, StateKind::Quiet);
    controls.swap(second);
    // One Halt for the swapped-out session, one when the replacement
    // program exits; in dev mode the runner stays alive through both
    expect_state(&state_rx, StateKind::Halt);
    expect_state(&state_rx, StateKind::Halt);
    controls.send(Command::Exit);
    assert_eq!(handle.join().unwrap(), 7);
}
