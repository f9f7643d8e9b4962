//! The display controller: per-scanline mode machine, line compositing
//! and the OAM DMA engine.
//!
//! A frame is 154 lines of 114 cycles each. Visible lines walk through
//! sprite search (mode 2), pixel transfer (mode 3, when the whole line is
//! composited in one go) and horizontal blank (mode 0); lines 144..153 are
//! vertical blank (mode 1). The finished frame is swapped in when line 144
//! begins, so readers never observe a half-drawn image.

pub mod image;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use bitflags::bitflags;

use crate::bits;
use crate::bus::{Bus, Clocked, Component};
use crate::cpu::Interrupts;
use crate::lcd::image::{LcdImage, LcdImageBuilder, LcdImageLine, LcdImageLineBuilder};
use crate::memory::{map, Ram};
use crate::registers::{Register, RegisterFile};
use crate::{SCREEN_HEIGHT, SCREEN_WIDTH};

const CYCLES_PER_LINE: u64 = 114;
const LINES_PER_FRAME: u64 = 154;
pub const CYCLES_PER_FRAME: u64 = CYCLES_PER_LINE * LINES_PER_FRAME;

const MODE_2_CYCLES: u64 = 20;
const MODE_3_CYCLES: u64 = 43;
const MODE_0_CYCLES: u64 = 51;

const TILE_SIDE: usize = 8;
const TILE_BYTES: u16 = 16;
const BG_TILES_PER_LINE: usize = 32;
const WIN_TILES_PER_LINE: usize = 20;
const TILE_MAP_TILES: u16 = 32 * 32;

const SPRITE_COUNT: usize = 40;
const MAX_SPRITES_PER_LINE: usize = 10;
const SPRITE_ATTRIBUTE_BYTES: usize = 4;
const SPRITE_X_OFFSET: i32 = 8;
const SPRITE_Y_OFFSET: i32 = 16;
const WX_OFFSET: i32 = 7;

/// The display controller's register window, in address order from 0xFF40.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum LcdReg {
    Lcdc,
    Stat,
    Scy,
    Scx,
    Ly,
    Lyc,
    Dma,
    Bgp,
    Obp0,
    Obp1,
    Wy,
    Wx,
}

impl Register for LcdReg {
    const COUNT: usize = 12;

    fn index(self) -> usize {
        self as usize
    }
}

impl LcdReg {
    const ALL: [LcdReg; 12] = [
        LcdReg::Lcdc,
        LcdReg::Stat,
        LcdReg::Scy,
        LcdReg::Scx,
        LcdReg::Ly,
        LcdReg::Lyc,
        LcdReg::Dma,
        LcdReg::Bgp,
        LcdReg::Obp0,
        LcdReg::Obp1,
        LcdReg::Wy,
        LcdReg::Wx,
    ];

    fn at(address: u16) -> LcdReg {
        LcdReg::ALL[(address - map::REGS_LCD_START) as usize]
    }
}

bitflags! {
    /// LCDC register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Lcdc: u8 {
        const BG = 1 << 0;
        const OBJ = 1 << 1;
        const OBJ_SIZE = 1 << 2;
        const BG_AREA = 1 << 3;
        const TILE_SOURCE = 1 << 4;
        const WIN = 1 << 5;
        const WIN_AREA = 1 << 6;
        const LCD_ENABLE = 1 << 7;
    }
}

bitflags! {
    /// STAT register bits; the low three are read-only for programs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Stat: u8 {
        const MODE0 = 1 << 0;
        const MODE1 = 1 << 1;
        const LYC_EQ_LY = 1 << 2;
        const INT_MODE0 = 1 << 3;
        const INT_MODE1 = 1 << 4;
        const INT_MODE2 = 1 << 5;
        const INT_LYC = 1 << 6;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Mode {
    HBlank = 0,
    VBlank = 1,
    SpriteSearch = 2,
    PixelTransfer = 3,
}

pub struct LcdController {
    regs: RegisterFile<LcdReg>,
    vram: Rc<RefCell<Ram>>,
    oam: Rc<RefCell<Ram>>,
    next_non_idle_cycle: u64,
    lcd_on_cycle: u64,
    win_y: u32,
    dma_source: Option<u16>,
    dma_destination: usize,
    image: LcdImage,
    next_image_builder: LcdImageBuilder,
    pending: Interrupts,
}

impl LcdController {
    pub fn new() -> LcdController {
        LcdController {
            regs: RegisterFile::new(),
            vram: Rc::new(RefCell::new(Ram::new(map::VIDEO_RAM_SIZE))),
            oam: Rc::new(RefCell::new(Ram::new(map::OAM_SIZE))),
            next_non_idle_cycle: u64::MAX,
            lcd_on_cycle: 0,
            win_y: 0,
            dma_source: None,
            dma_destination: 0,
            image: LcdImageBuilder::new(SCREEN_WIDTH, SCREEN_HEIGHT).build(),
            next_image_builder: LcdImageBuilder::new(SCREEN_WIDTH, SCREEN_HEIGHT),
            pending: Interrupts::empty(),
        }
    }

    /// The last fully drawn frame.
    pub fn current_image(&self) -> &LcdImage {
        &self.image
    }

    /// Shared handle to the video RAM block, for mapping onto the bus.
    pub fn video_ram(&self) -> Rc<RefCell<Ram>> {
        self.vram.clone()
    }

    /// Shared handle to the object attribute memory block.
    pub fn object_attribute_ram(&self) -> Rc<RefCell<Ram>> {
        self.oam.clone()
    }

    pub fn take_interrupts(&mut self) -> Interrupts {
        std::mem::replace(&mut self.pending, Interrupts::empty())
    }

    fn lcdc(&self) -> Lcdc {
        Lcdc::from_bits_truncate(self.regs.get(LcdReg::Lcdc))
    }

    fn stat(&self) -> Stat {
        Stat::from_bits_truncate(self.regs.get(LcdReg::Stat))
    }

    fn screen_on(&self) -> bool {
        self.lcdc().contains(Lcdc::LCD_ENABLE)
    }

    fn dma_active(&self) -> bool {
        self.dma_source.is_some()
    }

    fn set_mode(&mut self, mode: Mode) {
        let ordinal = mode as u32;
        self.regs.set_bit(LcdReg::Stat, 0, bits::test(ordinal, 0));
        self.regs.set_bit(LcdReg::Stat, 1, bits::test(ordinal, 1));
    }

    /// Raises the STAT interrupt when the per-mode enable bit allows it.
    fn stat_interrupt(&mut self, mode: Mode) {
        let enable = match mode {
            Mode::HBlank => Stat::INT_MODE0,
            Mode::VBlank => Stat::INT_MODE1,
            Mode::SpriteSearch => Stat::INT_MODE2,
            Mode::PixelTransfer => return,
        };
        if self.stat().contains(enable) {
            self.pending |= Interrupts::LCD_STAT;
        }
    }

    /// Writes LY or LYC and refreshes the coincidence flag, raising the
    /// STAT interrupt on a match when enabled.
    fn write_ly_lyc(&mut self, reg: LcdReg, value: u8) {
        debug_assert!(reg == LcdReg::Ly || reg == LcdReg::Lyc);
        self.regs.set(reg, value);
        let equal = self.regs.get(LcdReg::Ly) == self.regs.get(LcdReg::Lyc);
        self.regs.set_bit(LcdReg::Stat, 2, equal);
        if equal && self.stat().contains(Stat::INT_LYC) {
            self.pending |= Interrupts::LCD_STAT;
        }
    }

    fn really_cycle(&mut self) {
        let frame_cycle = (self.next_non_idle_cycle - self.lcd_on_cycle) % CYCLES_PER_FRAME;
        let line = frame_cycle / CYCLES_PER_LINE;
        let line_cycle = frame_cycle % CYCLES_PER_LINE;

        if line < SCREEN_HEIGHT as u64 {
            if line_cycle < MODE_2_CYCLES {
                self.set_mode(Mode::SpriteSearch);
                self.stat_interrupt(Mode::SpriteSearch);
                self.next_non_idle_cycle += MODE_2_CYCLES;
                self.write_ly_lyc(LcdReg::Ly, line as u8);
                if line == 0 {
                    self.next_image_builder = LcdImageBuilder::new(SCREEN_WIDTH, SCREEN_HEIGHT);
                    self.win_y = 0;
                }
            } else if line_cycle < MODE_2_CYCLES + MODE_3_CYCLES {
                self.set_mode(Mode::PixelTransfer);
                self.next_non_idle_cycle += MODE_3_CYCLES;
                let computed = self.compute_line(line as u32);
                self.next_image_builder.set_line(line as usize, computed);
            } else {
                self.set_mode(Mode::HBlank);
                self.stat_interrupt(Mode::HBlank);
                self.next_non_idle_cycle += MODE_0_CYCLES;
            }
        } else {
            self.set_mode(Mode::VBlank);
            self.stat_interrupt(Mode::VBlank);
            self.next_non_idle_cycle += CYCLES_PER_LINE;
            self.write_ly_lyc(LcdReg::Ly, line as u8);
            if line == SCREEN_HEIGHT as u64 {
                self.pending |= Interrupts::VBLANK;
                let builder = mem::replace(
                    &mut self.next_image_builder,
                    LcdImageBuilder::new(SCREEN_WIDTH, SCREEN_HEIGHT),
                );
                self.image = builder.build();
            }
        }
    }

    // Line compositing.

    fn compute_line(&mut self, line: u32) -> LcdImageLine {
        let lcdc = self.lcdc();
        let bg_map = lcdc.contains(Lcdc::BG_AREA) as usize;
        let win_map = lcdc.contains(Lcdc::WIN_AREA) as usize;
        let wx = self.regs.get(LcdReg::Wx) as i32 - WX_OFFSET;
        let bgp = self.regs.get(LcdReg::Bgp);
        let sprites = self.sprites_on_line(line);

        let mut bg_line = LcdImageLine::blank(SCREEN_WIDTH);
        if lcdc.contains(Lcdc::BG) {
            bg_line = self
                .tile_line(line + self.regs.get(LcdReg::Scy) as u32, bg_map, BG_TILES_PER_LINE)
                .extract_wrapped(self.regs.get(LcdReg::Scx) as i32, SCREEN_WIDTH)
                .map_colors(bgp);
        }

        if !self.window_disabled(wx) && line >= self.regs.get(LcdReg::Wy) as u32 {
            let window_line = self
                .tile_line(self.win_y, win_map, WIN_TILES_PER_LINE)
                .shift(wx)
                .map_colors(bgp);
            self.win_y += 1;
            bg_line = bg_line.join(&window_line, wx as usize);
        }

        let mut behind_sprites = LcdImageLine::blank(SCREEN_WIDTH);
        let mut front_sprites = LcdImageLine::blank(SCREEN_WIDTH);
        if lcdc.contains(Lcdc::OBJ) {
            behind_sprites = self.sprite_layer(&sprites, line, true);
            front_sprites = self.sprite_layer(&sprites, line, false);
        }

        let bg_line = bg_line.below(&front_sprites);
        // Behind-background sprites show only where nothing else is drawn.
        let mask = bg_line.opacity().or(&behind_sprites.opacity().not());
        behind_sprites.below_with_opacity(&bg_line, &mask)
    }

    /// Builds one full row of a tile map as an image line.
    fn tile_line(&self, line_index: u32, tile_map: usize, tile_count: usize) -> LcdImageLine {
        let mut builder = LcdImageLineBuilder::new(tile_count * TILE_SIDE);
        let map_start =
            ((line_index / TILE_SIDE as u32) * BG_TILES_PER_LINE as u32) % TILE_MAP_TILES as u32;
        let row_byte = (line_index % TILE_SIDE as u32) as u16 * 2;
        let tile_source = self.lcdc().contains(Lcdc::TILE_SOURCE);

        for i in 0..tile_count {
            let map_address = map::TILE_MAPS[tile_map] + map_start as u16 + i as u16;
            let mut tile_index = self.read_vram(map_address);
            if !tile_source {
                // Bank 0 indexes tiles with an 0x80 offset.
                tile_index = tile_index.wrapping_add(0x80);
            }
            let lsb = self.tile_byte(tile_source as usize, tile_index, row_byte);
            let msb = self.tile_byte(tile_source as usize, tile_index, row_byte + 1);
            builder.set_byte(i, msb.reverse_bits(), lsb.reverse_bits());
        }
        builder.build()
    }

    fn window_disabled(&self, wx: i32) -> bool {
        !self.lcdc().contains(Lcdc::WIN) || wx < 0 || wx >= SCREEN_WIDTH as i32
    }

    /// Indices of the at most 10 sprites covering `line`, sorted by
    /// ascending x with the OAM index breaking ties.
    fn sprites_on_line(&self, line: u32) -> Vec<usize> {
        let mut found: Vec<u16> = Vec::with_capacity(MAX_SPRITES_PER_LINE);
        let height = self.sprite_height();
        for index in 0..SPRITE_COUNT {
            if found.len() == MAX_SPRITES_PER_LINE {
                break;
            }
            let y = self.sprite_y(index);
            if (y..y + height).contains(&(line as i32)) {
                let raw_x = self.sprite_byte(index, 1);
                found.push(bits::make16(raw_x, index as u8));
            }
        }
        found.sort_unstable();
        found.into_iter().map(|packed| bits::lsb(packed) as usize).collect()
    }

    /// Composes the selected priority class of sprites into one line,
    /// painting in reverse order so higher-priority sprites win overlaps.
    fn sprite_layer(&self, sprites: &[usize], line: u32, behind_background: bool) -> LcdImageLine {
        let mut layer = LcdImageLine::blank(SCREEN_WIDTH);
        for &index in sprites.iter().rev() {
            if self.sprite_attribute(index, 7) == behind_background {
                layer = layer.below(&self.sprite_line(index, line));
            }
        }
        layer
    }

    /// Renders a single sprite's slice of `line` into a full-width line.
    fn sprite_line(&self, index: usize, line: u32) -> LcdImageLine {
        let h_flip = self.sprite_attribute(index, 5);
        let v_flip = self.sprite_attribute(index, 6);
        let palette = if self.sprite_attribute(index, 4) {
            self.regs.get(LcdReg::Obp1)
        } else {
            self.regs.get(LcdReg::Obp0)
        };

        let row = if v_flip {
            self.sprite_height() - 1 - (line as i32 - self.sprite_y(index))
        } else {
            line as i32 - self.sprite_y(index)
        };
        let tile_index = self.sprite_byte(index, 2);
        let lsb = self.tile_byte(1, tile_index, row as u16 * 2);
        let msb = self.tile_byte(1, tile_index, row as u16 * 2 + 1);
        // Tile bytes hold the leftmost pixel in the high bit; flipping
        // horizontally means using them as stored.
        let (msb, lsb) = if h_flip {
            (msb, lsb)
        } else {
            (msb.reverse_bits(), lsb.reverse_bits())
        };

        let mut builder = LcdImageLineBuilder::new(SCREEN_WIDTH);
        builder.set_byte(0, msb, lsb);
        builder.build().shift(self.sprite_x(index)).map_colors(palette)
    }

    // VRAM/OAM accessors.

    fn read_vram(&self, address: u16) -> u8 {
        self.vram
            .borrow()
            .read((address - map::VIDEO_RAM_START) as usize)
    }

    fn tile_byte(&self, tile_source: usize, tile_index: u8, byte: u16) -> u8 {
        self.read_vram(map::TILE_DATA[tile_source] + tile_index as u16 * TILE_BYTES + byte)
    }

    fn sprite_byte(&self, index: usize, byte: usize) -> u8 {
        self.oam
            .borrow()
            .read(index * SPRITE_ATTRIBUTE_BYTES + byte)
    }

    fn sprite_attribute(&self, index: usize, bit: u32) -> bool {
        bits::test(self.sprite_byte(index, 3) as u32, bit)
    }

    fn sprite_x(&self, index: usize) -> i32 {
        self.sprite_byte(index, 1) as i32 - SPRITE_X_OFFSET
    }

    fn sprite_y(&self, index: usize) -> i32 {
        self.sprite_byte(index, 0) as i32 - SPRITE_Y_OFFSET
    }

    fn sprite_height(&self) -> i32 {
        if self.lcdc().contains(Lcdc::OBJ_SIZE) {
            16
        } else {
            8
        }
    }
}

impl Clocked for LcdController {
    fn cycle(&mut self, cycle: u64, bus: &Bus) {
        // The DMA engine moves one byte per cycle, display on or off.
        if let Some(source) = self.dma_source {
            // Sources are read over the bus, except our own register
            // window, which cannot be reached through it mid-step.
            let value = if (map::REGS_LCD_START..map::REGS_LCD_END).contains(&source) {
                self.regs.get(LcdReg::at(source))
            } else {
                bus.read(source)
            };
            self.oam.borrow_mut().write(self.dma_destination, value);
            self.dma_destination += 1;
            self.dma_source = if self.dma_destination < map::OAM_SIZE {
                Some(source.wrapping_add(1))
            } else {
                None
            };
        }

        if self.next_non_idle_cycle == u64::MAX && self.screen_on() {
            log::debug!("display enabled at cycle {cycle}");
            self.set_mode(Mode::SpriteSearch);
            self.next_non_idle_cycle = cycle;
            self.lcd_on_cycle = cycle;
        }
        if self.next_non_idle_cycle == cycle && self.screen_on() {
            self.really_cycle();
        }
    }
}

impl Component for LcdController {
    fn read(&self, address: u16) -> Option<u8> {
        (map::REGS_LCD_START..map::REGS_LCD_END)
            .contains(&address)
            .then(|| self.regs.get(LcdReg::at(address)))
    }

    fn write(&mut self, address: u16, value: u8) {
        if !(map::REGS_LCD_START..map::REGS_LCD_END).contains(&address) {
            return;
        }
        match LcdReg::at(address) {
            // LY is read-only.
            LcdReg::Ly => {}
            LcdReg::Stat => {
                // Programs can only touch the interrupt-enable bits.
                let kept = bits::clip(3, self.regs.get(LcdReg::Stat) as u32) as u8;
                self.regs.set(LcdReg::Stat, kept | (value & 0xF8));
            }
            LcdReg::Lcdc => {
                let was_on = self.screen_on();
                self.regs.set(LcdReg::Lcdc, value);
                if !self.screen_on() {
                    if was_on {
                        log::debug!("display disabled");
                    }
                    self.set_mode(Mode::HBlank);
                    self.write_ly_lyc(LcdReg::Ly, 0);
                    self.next_non_idle_cycle = u64::MAX;
                }
            }
            LcdReg::Lyc => self.write_ly_lyc(LcdReg::Lyc, value),
            LcdReg::Dma => {
                self.regs.set(LcdReg::Dma, value);
                if self.dma_active() {
                    // A transfer in flight completes untouched.
                    log::debug!("OAM DMA retrigger ignored at byte {}", self.dma_destination);
                } else {
                    self.dma_source = Some(bits::make16(value, 0));
                    self.dma_destination = 0;
                    log::debug!("OAM DMA started from {:#06X}", bits::make16(value, 0));
                }
            }
            reg => self.regs.set(reg, value),
        }
    }
}

impl Default for LcdController {
    fn default() -> Self {
        Self::new()
    }
}
