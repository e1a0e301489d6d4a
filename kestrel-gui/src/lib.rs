//! minifb window bridge for the Kestrel runner
//!
//! The window runs at 60 Hz.  Every frame it latches host input into an
//! [`InputFrame`] and offers it to the runner through the tick channel;
//! the runner answers with fresh screen layers whenever the draw counter
//! has moved.  The Varvara buffer is composited into the window surface
//! through a centered uniform-scale transform, and mouse coordinates map
//! back through its inverse.

use crossbeam_channel::{TryRecvError, TrySendError};
use varvara::{Frame, GuiBridge, InputFrame, MouseState};
use minifb::{Key, MouseButton, MouseMode, WindowOptions};

const APP_NAME: &str = "Kestrel";

/// Maps the Varvara buffer onto the window surface
///
/// A centered uniform scale: the buffer fills the largest rectangle that
/// fits in the window while keeping its aspect ratio.
#[derive(Copy, Clone, Debug)]
struct Transform {
    scale: f32,
    ox: f32,
    oy: f32,
}

impl Transform {
    fn letterbox(win: (usize, usize), buf: (u16, u16)) -> Self {
        let (ww, wh) = (win.0 as f32, win.1 as f32);
        let (bw, bh) = (f32::from(buf.0).max(1.0), f32::from(buf.1).max(1.0));
        let scale = (ww / bw).min(wh / bh);
        Self {
            scale,
            ox: (ww - bw * scale) / 2.0,
            oy: (wh - bh * scale) / 2.0,
        }
    }

    /// Window coordinates back to buffer coordinates
    fn invert(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.ox) / self.scale, (y - self.oy) / self.scale)
    }
}

fn clamp_i16(v: f32) -> i16 {
    if v >= f32::from(i16::MAX) {
        i16::MAX
    } else if v <= f32::from(i16::MIN) {
        i16::MIN
    } else {
        v as i16
    }
}

/// The presenter window
pub struct Window {
    win: minifb::Window,
    /// Last frame received from the runner
    frame: Option<Frame>,
    /// Window-sized composite of background and foreground
    surface: Vec<u32>,
    /// Fractional scroll accumulators
    scroll: (f32, f32),
}

impl Window {
    /// Opens the window at twice the default Varvara size
    pub fn new() -> Result<Self, minifb::Error> {
        let mut win = minifb::Window::new(
            APP_NAME,
            512,
            512,
            WindowOptions {
                resize: true,
                ..WindowOptions::default()
            },
        )?;
        win.limit_update_rate(Some(std::time::Duration::from_micros(1_000_000 / 60)));
        Ok(Self {
            win,
            frame: None,
            surface: Vec::new(),
            scroll: (0.0, 0.0),
        })
    }

    /// Drives the window until it closes or the runner goes away
    pub fn run(mut self, bridge: GuiBridge) {
        while self.win.is_open() {
            match bridge.frame.try_recv() {
                Ok(f) => self.frame = Some(f),
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => break,
            }

            let size = self.frame.as_ref().map(|f| (f.width, f.height)).unwrap_or((256, 256));
            let xform = Transform::letterbox(self.win.get_size(), size);

            let input = self.gather_input(&xform);
            match bridge.tick.try_send(input) {
                Ok(()) => (),
                // A full slot just means the runner is mid-burst
                Err(TrySendError::Full(_)) => (),
                Err(TrySendError::Disconnected(_)) => break,
            }

            self.present(&xform);
        }
    }

    /// Collects one frame of input, mapping the mouse through `xform`
    fn gather_input(&mut self, xform: &Transform) -> InputFrame {
        let shift = self.win.is_key_down(Key::LeftShift) || self.win.is_key_down(Key::RightShift);

        let mut buttons = 0u8;
        for (i, k) in [
            Key::LeftCtrl,
            Key::LeftAlt,
            Key::LeftShift,
            Key::Home,
            Key::Up,
            Key::Down,
            Key::Left,
            Key::Right,
        ]
        .into_iter()
        .enumerate()
        {
            if self.win.is_key_down(k) {
                buttons |= 1 << i;
            }
        }

        let keys: Vec<u8> = self
            .win
            .get_keys_pressed(minifb::KeyRepeat::Yes)
            .into_iter()
            .filter_map(|k| decode_key(k, shift))
            .collect();

        let mouse = self.gather_mouse(xform);
        InputFrame {
            buttons,
            keys,
            mouse,
        }
    }

    fn gather_mouse(&mut self, xform: &Transform) -> MouseState {
        let (wx, wy) = self.win.get_mouse_pos(MouseMode::Clamp).unwrap_or((0.0, 0.0));
        let (bx, by) = xform.invert(wx, wy);

        if let Some((sx, sy)) = self.win.get_scroll_wheel() {
            self.scroll.0 += sx;
            self.scroll.1 += sy;
        }
        let mut tick = (0i16, 0i16);
        if self.scroll.0 >= 1.0 {
            tick.0 = 1;
            self.scroll.0 -= 1.0;
        } else if self.scroll.0 <= -1.0 {
            tick.0 = -1;
            self.scroll.0 += 1.0;
        }
        if self.scroll.1 >= 1.0 {
            tick.1 = 1;
            self.scroll.1 -= 1.0;
        } else if self.scroll.1 <= -1.0 {
            tick.1 = -1;
            self.scroll.1 += 1.0;
        }

        let buttons = [MouseButton::Left, MouseButton::Middle, MouseButton::Right]
            .into_iter()
            .enumerate()
            .map(|(i, b)| u8::from(self.win.get_mouse_down(b)) << i)
            .fold(0, |a, b| a | b);

        MouseState {
            x: clamp_i16(bx),
            y: clamp_i16(by),
            scroll_x: tick.0,
            scroll_y: tick.1,
            buttons,
        }
    }

    /// Composites the current frame into the window surface and blits it
    fn present(&mut self, xform: &Transform) {
        let (ww, wh) = self.win.get_size();
        self.surface.resize(ww * wh, 0xff00_0000);

        if let Some(f) = &self.frame {
            let bw = usize::from(f.width);
            let bh = usize::from(f.height);
            for wy in 0..wh {
                for wx in 0..ww {
                    let (bx, by) = xform.invert(wx as f32, wy as f32);
                    let (bx, by) = (bx as isize, by as isize);
                    let c = if bx >= 0 && by >= 0 && (bx as usize) < bw && (by as usize) < bh {
                        let i = bx as usize + by as usize * bw;
                        // Foreground over background: transparent holes
                        // show the opaque layer beneath
                        if f.fg[i] >> 24 != 0 {
                            f.fg[i]
                        } else {
                            f.bg[i]
                        }
                    } else {
                        0xff00_0000
                    };
                    self.surface[wx + wy * ww] = c;
                }
            }
        }

        if let Err(e) = self.win.update_with_buffer(&self.surface, ww, wh) {
            log::error!("presenting frame: {e}");
        }
    }
}

/// Translates a minifb key into a console character
fn decode_key(k: Key, shift: bool) -> Option<u8> {
    let base = match k {
        Key::Key0 => b'0',
        Key::Key1 => b'1',
        Key::Key2 => b'2',
        Key::Key3 => b'3',
        Key::Key4 => b'4',
        Key::Key5 => b'5',
        Key::Key6 => b'6',
        Key::Key7 => b'7',
        Key::Key8 => b'8',
        Key::Key9 => b'9',
        Key::A => b'a',
        Key::B => b'b',
        Key::C => b'c',
        Key::D => b'd',
        Key::E => b'e',
        Key::F => b'f',
        Key::G => b'g',
        Key::H => b'h',
        Key::I => b'i',
        Key::J => b'j',
        Key::K => b'k',
        Key::L => b'l',
        Key::M => b'm',
        Key::N => b'n',
        Key::O => b'o',
        Key::P => b'p',
        Key::Q => b'q',
        Key::R => b'r',
        Key::S => b's',
        Key::T => b't',
        Key::U => b'u',
        Key::V => b'v',
        Key::W => b'w',
        Key::X => b'x',
        Key::Y => b'y',
        Key::Z => b'z',
        Key::Apostrophe => b'\'',
        Key::Backquote => b'`',
        Key::Backslash => b'\\',
        Key::Comma => b',',
        Key::Equal => b'=',
        Key::LeftBracket => b'[',
        Key::Minus => b'-',
        Key::Period => b'.',
        Key::RightBracket => b']',
        Key::Semicolon => b';',
        Key::Slash => b'/',
        Key::Space => b' ',
        Key::Tab => b'\t',
        Key::Enter => b'\r',
        Key::Backspace => 0x08,
        Key::Delete => 0x7f,
        Key::Escape => 0x1b,
        Key::NumPad0 => b'0',
        Key::NumPad1 => b'1',
        Key::NumPad2 => b'2',
        Key::NumPad3 => b'3',
        Key::NumPad4 => b'4',
        Key::NumPad5 => b'5',
        Key::NumPad6 => b'6',
        Key::NumPad7 => b'7',
        Key::NumPad8 => b'8',
        Key::NumPad9 => b'9',
        Key::NumPadDot => b'.',
        Key::NumPadSlash => b'/',
        Key::NumPadAsterisk => b'*',
        Key::NumPadMinus => b'-',
        Key::NumPadPlus => b'+',
        _ => return None,
    };
    Some(if shift { shifted(base) } else { base })
}

/// US-layout shifted variant of a key's base character
fn shifted(c: u8) -> u8 {
    match c {
        b'a'..=b'z' => c.to_ascii_uppercase(),
        b'0' => b')',
        b'1' => b'!',
        b'2' => b'@',
        b'3' => b'#',
        b'4' => b'$',
        b'5' => b'%',
        b'6' => b'^',
        b'7' => b'&',
        b'8' => b'*',
        b'9' => b'(',
        b'\'' => b'"',
        b'`' => b'~',
        b'\\' => b'|',
        b',' => b'<',
        b'=' => b'+',
        b'[' => b'{',
        b'-' => b'_',
        b'.' => b'>',
        b']' => b'}',
        b';' => b':',
        b'/' => b'?',
        _ => c,
    }
}
