use crate::system::SystemPorts;
use std::mem::offset_of;
use uxn::{Machine, Ports};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ScreenPorts {
    vector: U16<BigEndian>,
    width: U16<BigEndian>,
    height: U16<BigEndian>,
    auto: Auto,
    _pad: u8,
    x: U16<BigEndian>,
    y: U16<BigEndian>,
    addr: U16<BigEndian>,
    pixel: Pixel,
    sprite: Sprite,
}

impl Ports for ScreenPorts {
    const BASE: u8 = 0x20;
}

impl ScreenPorts {
    // Reads resolve on the high byte; writes act on the low byte
    const WIDTH_R: u8 = Self::BASE | offset_of!(Self, width) as u8;
    const WIDTH_W: u8 = Self::WIDTH_R + 1;
    const HEIGHT_R: u8 = Self::BASE | offset_of!(Self, height) as u8;
    const HEIGHT_W: u8 = Self::HEIGHT_R + 1;
    const PIXEL: u8 = Self::BASE | offset_of!(Self, pixel) as u8;
    const SPRITE: u8 = Self::BASE | offset_of!(Self, sprite) as u8;
}

enum Layer {
    Foreground,
    Background,
}

/// Decoder for the `pixel` port
#[derive(Copy, Clone, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct Pixel(u8);

impl Pixel {
    fn color(&self) -> u8 {
        self.0 & 0b11
    }
    fn flip_x(&self) -> bool {
        self.0 & (1 << 4) != 0
    }
    fn flip_y(&self) -> bool {
        self.0 & (1 << 5) != 0
    }
    fn foreground(&self) -> bool {
        self.0 & (1 << 6) != 0
    }
    fn layer(&self) -> Layer {
        if self.foreground() {
            Layer::Foreground
        } else {
            Layer::Background
        }
    }
    fn fill(&self) -> bool {
        self.0 & (1 << 7) != 0
    }
}

/// Decoder for the `sprite` port
#[derive(Copy, Clone, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct Sprite(u8);

impl Sprite {
    fn blend(&self) -> u8 {
        self.0 & 0b1111
    }
    fn flip_x(&self) -> bool {
        self.0 & (1 << 4) != 0
    }
    fn flip_y(&self) -> bool {
        self.0 & (1 << 5) != 0
    }
    fn foreground(&self) -> bool {
        self.0 & (1 << 6) != 0
    }
    fn layer(&self) -> Layer {
        if self.foreground() {
            Layer::Foreground
        } else {
            Layer::Background
        }
    }
    fn two_bpp(&self) -> bool {
        self.0 & (1 << 7) != 0
    }
}

/// Decoder for the `auto` port
#[derive(Copy, Clone, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct Auto(u8);

impl Auto {
    fn x(&self) -> bool {
        self.0 & (1 << 0) != 0
    }
    fn y(&self) -> bool {
        self.0 & (1 << 1) != 0
    }
    fn addr(&self) -> bool {
        self.0 & (1 << 2) != 0
    }
    /// Signed 4-bit sprite repeat count
    fn count(&self) -> i8 {
        (self.0 as i8) >> 4
    }
}

/// Fixed sprite blending table, indexed `[source][mode]`
const BLENDING: [[u8; 16]; 4] = [
    [0, 0, 0, 0, 1, 0, 1, 1, 2, 2, 0, 2, 3, 3, 3, 0],
    [0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3],
    [1, 2, 3, 1, 1, 2, 3, 1, 1, 2, 3, 1, 1, 2, 3, 1],
    [2, 3, 1, 2, 2, 3, 1, 2, 2, 3, 1, 2, 2, 3, 1, 2],
];

const TRANSPARENT: u32 = 0;
const DEFAULT_SIZE: u16 = 0x100;

/// The screen device: two ARGB layers composited by the presenter
///
/// The background is opaque, cleared to palette color 0; the foreground
/// starts fully transparent.  Palette colors are resolved when a draw
/// happens, and `ops` counts draws so the presenter can skip unchanged
/// frames.
pub struct Screen {
    bg: Vec<u32>,
    fg: Vec<u32>,
    width: u16,
    height: u16,
    ops: u64,
    /// The background clear is deferred until the palette is known
    cleared: bool,
}

impl Screen {
    pub fn new(vm: &mut Machine) -> Self {
        let v = vm.dev_mut::<ScreenPorts>();
        v.width.set(DEFAULT_SIZE);
        v.height.set(DEFAULT_SIZE);
        let size = usize::from(DEFAULT_SIZE) * usize::from(DEFAULT_SIZE);
        Self {
            bg: vec![TRANSPARENT; size],
            fg: vec![TRANSPARENT; size],
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
            ops: 0,
            cleared: false,
        }
    }

    /// Returns the current size as a `(width, height)` tuple
    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// Count of draw operations so far
    pub fn ops(&self) -> u64 {
        self.ops
    }

    /// The background layer, cleared if it has not been drawn to yet
    pub fn bg(&mut self, vm: &Machine) -> &[u32] {
        self.ensure_cleared(vm);
        &self.bg
    }

    /// The foreground layer
    pub fn fg(&self) -> &[u32] {
        &self.fg
    }

    /// The screen event vector
    pub fn vector(&self, vm: &Machine) -> u16 {
        vm.dev::<ScreenPorts>().vector.get()
    }

    pub fn deo(&mut self, vm: &mut Machine, target: u8) {
        match target {
            ScreenPorts::WIDTH_W | ScreenPorts::HEIGHT_W => self.resize(vm),
            ScreenPorts::PIXEL => {
                self.pixel(vm);
                self.ops += 1;
            }
            ScreenPorts::SPRITE => {
                self.sprite(vm);
                self.ops += 1;
            }
            _ => (),
        }
    }

    pub fn dei(&mut self, vm: &mut Machine, target: u8) {
        let v = vm.dev_mut::<ScreenPorts>();
        match target {
            ScreenPorts::WIDTH_R => v.width.set(self.width),
            ScreenPorts::HEIGHT_R => v.height.set(self.height),
            _ => (),
        }
    }

    fn palette(vm: &Machine) -> [u32; 4] {
        let sys = vm.dev::<SystemPorts>();
        [0, 1, 2, 3].map(|i| sys.color(i))
    }

    /// Clears the background to palette color 0 on first use
    fn ensure_cleared(&mut self, vm: &Machine) {
        if !self.cleared {
            self.bg.fill(Self::palette(vm)[0]);
            self.cleared = true;
        }
    }

    /// Applies a width/height write, clearing both layers on change
    ///
    /// A zero dimension falls back to the 256-pixel default; writes that
    /// leave the size unchanged are no-ops.
    fn resize(&mut self, vm: &mut Machine) {
        let v = vm.dev::<ScreenPorts>();
        let mut width = v.width.get();
        let mut height = v.height.get();
        if width == 0 {
            width = DEFAULT_SIZE;
        }
        if height == 0 {
            height = DEFAULT_SIZE;
        }
        if (width, height) == (self.width, self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        let size = usize::from(width) * usize::from(height);
        self.bg.clear();
        self.bg.resize(size, Self::palette(vm)[0]);
        self.fg.clear();
        self.fg.resize(size, TRANSPARENT);
        self.cleared = true;
        self.ops += 1;
    }

    fn set_pixel(&mut self, layer: &Layer, x: u16, y: u16, color: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = usize::from(x) + usize::from(y) * usize::from(self.width);
        match layer {
            Layer::Foreground => self.fg[i] = color,
            Layer::Background => self.bg[i] = color,
        }
    }

    /// Walks from `from` toward the nearest edge, inclusive of `from`
    fn span(flip: bool, from: u16, limit: u16) -> std::ops::RangeInclusive<u16> {
        if from >= limit {
            #[allow(clippy::reversed_empty_ranges)]
            {
                1..=0
            }
        } else if flip {
            0..=from
        } else {
            from..=limit - 1
        }
    }

    /// Executes the `pixel` port: a single pixel or a quadrant fill
    fn pixel(&mut self, vm: &mut Machine) {
        self.ensure_cleared(vm);
        let v = vm.dev::<ScreenPorts>();
        let p = v.pixel;
        let auto = v.auto;
        let x = v.x.get();
        let y = v.y.get();

        let theme = Self::palette(vm);
        let color = if p.foreground() && p.color() == 0 {
            TRANSPARENT
        } else {
            theme[usize::from(p.color())]
        };

        if p.fill() {
            for py in Self::span(p.flip_y(), y, self.height) {
                for px in Self::span(p.flip_x(), x, self.width) {
                    self.set_pixel(&p.layer(), px, py, color);
                }
            }
        } else {
            self.set_pixel(&p.layer(), x, y, color);
        }

        let v = vm.dev_mut::<ScreenPorts>();
        if auto.x() {
            v.x.set(x.wrapping_add(1));
        }
        if auto.y() {
            v.y.set(y.wrapping_add(1));
        }
    }

    /// Executes the `sprite` port: |count|+1 8×8 tiles from main memory
    fn sprite(&mut self, vm: &mut Machine) {
        self.ensure_cleared(vm);
        let v = vm.dev::<ScreenPorts>();
        let s = v.sprite;
        let auto = v.auto;
        let mut x = v.x.get();
        let mut y = v.y.get();
        let mut addr = v.addr.get();

        let theme = Self::palette(vm);
        let blend = usize::from(s.blend());
        // Blend modes 0, 5, 10 and 15 treat source color 0 as transparent
        let draw_zero = s.blend() % 5 != 0;
        let stride: u16 = if s.two_bpp() { 16 } else { 8 };

        for _ in 0..=s_count(auto) {
            for dy in 0..8u16 {
                let lo = vm.ram_read_byte(addr.wrapping_add(dy));
                let hi = if s.two_bpp() {
                    vm.ram_read_byte(addr.wrapping_add(8 + dy))
                } else {
                    0
                };
                let py = y.wrapping_add(if s.flip_y() { 7 - dy } else { dy });
                for dx in 0..8u16 {
                    let px = x.wrapping_add(if s.flip_x() { 7 - dx } else { dx });
                    let lo_bit = (lo >> (7 - dx)) & 1;
                    let hi_bit = (hi >> (7 - dx)) & 1;
                    let data = usize::from(lo_bit | (hi_bit << 1));
                    if data != 0 || draw_zero {
                        let c = BLENDING[data][blend];
                        let color = if s.foreground() && c == 0 {
                            TRANSPARENT
                        } else {
                            theme[usize::from(c)]
                        };
                        self.set_pixel(&s.layer(), px, py, color);
                    }
                }
            }
            // Repeats step along the axis perpendicular to the auto flag
            if auto.x() {
                y = y.wrapping_add(8);
            }
            if auto.y() {
                x = x.wrapping_add(8);
            }
            if auto.addr() {
                addr = addr.wrapping_add(stride);
            }
        }

        let v = vm.dev_mut::<ScreenPorts>();
        if auto.x() {
            v.x.set(v.x.get().wrapping_add(8));
        }
        if auto.y() {
            v.y.set(v.y.get().wrapping_add(8));
        }
        if auto.addr() {
            v.addr.set(addr);
        }
    }
}

/// Iteration bound for sprite repeats: |count|, inclusive
fn s_count(auto: Auto) -> u8 {
    auto.count().unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Machine, Screen) {
        let mut m = Machine::new();
        let _ = m.reset(&[]);
        let s = Screen::new(&mut m);
        (m, s)
    }

    fn set_palette(m: &mut Machine) -> [u32; 4] {
        for (port, v) in [
            (0x08, 0x12),
            (0x09, 0x34),
            (0x0a, 0x56),
            (0x0b, 0x78),
            (0x0c, 0x9a),
            (0x0d, 0xbc),
        ] {
            m.write_dev_mem(port, v);
        }
        Screen::palette(m)
    }

    fn ports(m: &mut Machine) -> &mut ScreenPorts {
        m.dev_mut::<ScreenPorts>()
    }

    #[test]
    fn default_size_and_resize() {
        let (mut m, mut s) = setup();
        assert_eq!(s.size(), (0x100, 0x100));

        ports(&mut m).width.set(16);
        s.deo(&mut m, ScreenPorts::WIDTH_W);
        ports(&mut m).height.set(16);
        s.deo(&mut m, ScreenPorts::HEIGHT_W);
        assert_eq!(s.size(), (16, 16));
        assert_eq!(s.bg.len(), 256);

        // Writing the same size again is a silent no-op
        let ops = s.ops();
        s.deo(&mut m, ScreenPorts::WIDTH_W);
        assert_eq!(s.ops(), ops);

        // A zero dimension falls back to the default
        ports(&mut m).width.set(0);
        s.deo(&mut m, ScreenPorts::WIDTH_W);
        assert_eq!(s.size(), (0x100, 16));
    }

    #[test]
    fn single_pixel_draw() {
        let (mut m, mut s) = setup();
        let theme = set_palette(&mut m);
        let v = ports(&mut m);
        v.x.set(3);
        v.y.set(2);
        v.pixel = Pixel(0x01); // color 1, background
        s.deo(&mut m, ScreenPorts::PIXEL);
        assert_eq!(s.ops(), 1);
        assert_eq!(s.bg[3 + 2 * 0x100], theme[1]);
        // Everything else is still the clear color
        assert_eq!(s.bg[0], theme[0]);
    }

    #[test]
    fn foreground_color_zero_is_transparent() {
        let (mut m, mut s) = setup();
        set_palette(&mut m);
        let v = ports(&mut m);
        v.x.set(1);
        v.y.set(1);
        v.pixel = Pixel(0x40); // color 0, foreground
        s.deo(&mut m, ScreenPorts::PIXEL);
        assert_eq!(s.fg[1 + 0x100], TRANSPARENT);
    }

    #[test]
    fn fill_paints_a_quadrant() {
        let (mut m, mut s) = setup();
        let theme = set_palette(&mut m);
        ports(&mut m).width.set(8);
        s.deo(&mut m, ScreenPorts::WIDTH_W);
        ports(&mut m).height.set(8);
        s.deo(&mut m, ScreenPorts::HEIGHT_W);

        let v = ports(&mut m);
        v.x.set(6);
        v.y.set(6);
        v.pixel = Pixel(0x81); // fill toward the far corner, color 1
        s.deo(&mut m, ScreenPorts::PIXEL);
        for y in 0..8usize {
            for x in 0..8usize {
                let want = if x >= 6 && y >= 6 { theme[1] } else { theme[0] };
                assert_eq!(s.bg[x + y * 8], want, "pixel ({x},{y})");
            }
        }

        // Flipped fill covers the opposite quadrant, inclusive
        let v = ports(&mut m);
        v.x.set(1);
        v.y.set(1);
        v.pixel = Pixel(0xb2); // fill, flip x and y, color 2
        s.deo(&mut m, ScreenPorts::PIXEL);
        assert_eq!(s.bg[0], theme[2]);
        assert_eq!(s.bg[1 + 8], theme[2]);
        assert_eq!(s.bg[2 + 2 * 8], theme[0]);
    }

    #[test]
    fn one_bit_sprite_blend_one() {
        let (mut m, mut s) = setup();
        let theme = set_palette(&mut m);
        ports(&mut m).width.set(16);
        s.deo(&mut m, ScreenPorts::WIDTH_W);
        ports(&mut m).height.set(16);
        s.deo(&mut m, ScreenPorts::HEIGHT_W);

        // A diagonal: row j has bit j set
        for j in 0..8u16 {
            m.ram_write_byte(0x3000 + j, 0x80 >> j);
        }
        let v = ports(&mut m);
        v.addr.set(0x3000);
        v.x.set(0);
        v.y.set(0);
        v.sprite = Sprite(0x01); // blend 1, background, one-bit
        let before = s.ops();
        s.deo(&mut m, ScreenPorts::SPRITE);
        assert_eq!(s.ops(), before + 1);
        for y in 0..8usize {
            for x in 0..8usize {
                let want = if x == y { theme[1] } else { theme[0] };
                assert_eq!(s.bg[x + y * 16], want, "pixel ({x},{y})");
            }
        }
    }

    #[test]
    fn two_bit_sprite_reads_both_planes() {
        let (mut m, mut s) = setup();
        let theme = set_palette(&mut m);
        // Top-left pixel has both planes set: source color 3
        m.ram_write_byte(0x3000, 0x80);
        m.ram_write_byte(0x3008, 0x80);
        let v = ports(&mut m);
        v.addr.set(0x3000);
        v.sprite = Sprite(0x81); // two-bit, blend 1
        s.deo(&mut m, ScreenPorts::SPRITE);
        assert_eq!(s.bg[0], theme[3]);
    }

    #[test]
    fn transparent_blend_skips_source_zero() {
        let (mut m, mut s) = setup();
        let theme = set_palette(&mut m);
        s.ensure_cleared(&m);
        // Paint the whole bg with color 2 first
        let v = ports(&mut m);
        v.pixel = Pixel(0x82); // fill from (0,0), color 2
        s.deo(&mut m, ScreenPorts::PIXEL);

        m.ram_write_byte(0x3000, 0x80); // only the top-left bit set
        let v = ports(&mut m);
        v.addr.set(0x3000);
        v.x.set(0);
        v.y.set(0);
        v.sprite = Sprite(0x05); // blend 5: source 0 is transparent
        s.deo(&mut m, ScreenPorts::SPRITE);
        assert_eq!(s.bg[0], theme[BLENDING[1][5] as usize]);
        // The unset pixels did not punch through the fill
        assert_eq!(s.bg[1], theme[2]);
    }

    #[test]
    fn sprite_repeat_advances_addr_and_position() {
        let (mut m, mut s) = setup();
        set_palette(&mut m);
        let v = ports(&mut m);
        v.addr.set(0x3000);
        v.x.set(0);
        v.y.set(0);
        v.auto = Auto(0x25); // count 2, auto x and addr
        v.sprite = Sprite(0x01);
        s.deo(&mut m, ScreenPorts::SPRITE);
        let v = ports(&mut m);
        assert_eq!(v.x.get(), 8);
        assert_eq!(v.addr.get(), 0x3000 + 3 * 8);
    }
}
