use crate::bits;
use crate::hardware::{SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::interrupts::{Interrupt, Interrupts};

// Line timing in master cycles
const LINE_CYCLES: u32 = 456;
const MODE2_END: u32 = 80; // OAM scan
const MODE3_END: u32 = MODE2_END + 172; // Pixel transfer
const LINES_PER_FRAME: u8 = 154;

const MAX_SPRITES_PER_LINE: usize = 10;
const TOTAL_SPRITES: usize = 40;

const VRAM_BANK_SIZE: usize = 0x2000;
const OAM_SIZE: usize = 0xA0;
const PAL_RAM_SIZE: usize = 0x40;
const PAL_INDEX_MASK: u8 = 0x3F;
const PAL_UNUSED_BIT: u8 = 0x40;
const PAL_AUTO_INCREMENT_BIT: u8 = 0x80;

// Window X position is clipped if greater than this value
const WINDOW_X_MAX: u8 = 166;

// VRAM layout relative to 0x8000
const BG_MAP_0_BASE: usize = 0x1800;
const BG_MAP_1_BASE: usize = 0x1C00;

pub const MODE_HBLANK: u8 = 0;
pub const MODE_VBLANK: u8 = 1;
pub const MODE_OAM: u8 = 2;
pub const MODE_TRANSFER: u8 = 3;

/// Default DMG shades in 0x00RRGGBB order, lightest first.
pub const DMG_PALETTE: [u32; 4] = [0x009BBC0F, 0x008BAC0F, 0x00306230, 0x000F380F];

#[derive(Copy, Clone, Default)]
struct Sprite {
    x: i16,
    y: i16,
    tile: u8,
    flags: u8,
    oam_index: usize,
}

/// One background or window pixel before palette lookup.
#[derive(Copy, Clone, Default)]
struct BgPixel {
    color_id: u8,
    palette: u8,
    priority: bool,
}

pub struct Ppu {
    pub vram: [[u8; VRAM_BANK_SIZE]; 2],
    pub vram_bank: usize,
    pub oam: [u8; OAM_SIZE],

    cgb: bool,
    /// CGB hardware running a monochrome cartridge: DMG palette registers
    /// index into CGB palettes 0 and 1, and tile attributes are ignored.
    dmg_compat: bool,

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    lyc_eq_ly: bool,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,

    /// Internal window line counter
    win_line_counter: u8,

    bgpi: u8,
    bgpd: [u8; PAL_RAM_SIZE],
    obpi: u8,
    obpd: [u8; PAL_RAM_SIZE],

    line_clock: u32,
    mode: u8,
    dmg_palette: [u32; 4],

    framebuffer: Vec<u32>,
    line_sprites: [Sprite; MAX_SPRITES_PER_LINE],
    sprite_count: usize,
    frame_ready: bool,
    stat_irq_line: bool,
    frame_counter: u64,
}

impl Ppu {
    pub fn new(cgb: bool) -> Self {
        Self {
            vram: [[0; VRAM_BANK_SIZE]; 2],
            vram_bank: 0,
            oam: [0; OAM_SIZE],
            cgb,
            dmg_compat: false,
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            lyc_eq_ly: false,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            win_line_counter: 0,
            bgpi: PAL_UNUSED_BIT,
            bgpd: [0; PAL_RAM_SIZE],
            obpi: PAL_UNUSED_BIT,
            obpd: [0; PAL_RAM_SIZE],
            line_clock: 0,
            mode: MODE_HBLANK,
            dmg_palette: DMG_PALETTE,
            framebuffer: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
            line_sprites: [Sprite::default(); MAX_SPRITES_PER_LINE],
            sprite_count: 0,
            frame_ready: false,
            stat_irq_line: false,
            frame_counter: 0,
        }
    }

    /// Registers as left behind by the boot ROM.
    pub fn apply_boot_state(&mut self) {
        self.lcdc = 0x91;
        self.bgp = 0xFC;
        self.ly = 0;
        self.line_clock = 0;
        self.mode = MODE_OAM;
        self.win_line_counter = 0;
        self.lyc_eq_ly = self.ly == self.lyc;
        if self.cgb {
            self.bgpd = [0xFF; PAL_RAM_SIZE];
            self.obpd = [0xFF; PAL_RAM_SIZE];
        }
    }

    /// Loads the palettes the CGB boot ROM assigns to monochrome cartridges.
    pub fn apply_dmg_compatibility_palettes(&mut self) {
        const OBJ_PAL: [u16; 4] = [0x7FFF, 0x421F, 0x1CF2, 0x0000];
        const BG_PAL: [u16; 4] = [0x7FFF, 0x1BEF, 0x6180, 0x0000];

        let (obj0, rest) = self.obpd.split_at_mut(8);
        Self::write_palette(obj0, OBJ_PAL);
        Self::write_palette(&mut rest[..8], OBJ_PAL);
        Self::write_palette(&mut self.bgpd[..8], BG_PAL);

        self.bgp = 0xE4;
        self.obp0 = 0xD0;
        self.obp1 = 0xE0;
        self.enter_dmg_compat_mode();
    }

    pub fn enter_dmg_compat_mode(&mut self) {
        if self.cgb {
            self.dmg_compat = true;
        }
    }

    /// Tile attributes, OAM-order priority and the CGB LCDC bit 0 meaning.
    #[inline]
    fn cgb_features(&self) -> bool {
        self.cgb && !self.dmg_compat
    }

    /// Final color for DMG shade `shade` behind BGP.
    fn bg_shade_color(&self, shade: usize) -> u32 {
        if self.cgb {
            self.bg_palette_color(0, shade)
        } else {
            self.dmg_palette[shade]
        }
    }

    /// Final color for DMG shade `shade` behind OBP0 (`palette` 0) or OBP1.
    fn obj_shade_color(&self, palette: usize, shade: usize) -> u32 {
        if self.cgb {
            self.ob_palette_color(palette, shade)
        } else {
            self.dmg_palette[shade]
        }
    }

    fn write_palette(slice: &mut [u8], pal: [u16; 4]) {
        for (i, &c) in pal.iter().enumerate() {
            slice[i * 2] = (c & 0xFF) as u8;
            slice[i * 2 + 1] = (c >> 8) as u8;
        }
    }

    pub fn set_dmg_palette(&mut self, palette: [u32; 4]) {
        self.dmg_palette = palette;
    }

    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    /// Clears the frame ready flag after a frame has been consumed.
    pub fn clear_frame_flag(&mut self) {
        self.frame_ready = false;
    }

    /// 160x144 pixels in 0x00RRGGBB order, row-major.
    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    pub fn frames(&self) -> u64 {
        self.frame_counter
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn ly(&self) -> u8 {
        self.ly
    }

    pub fn window_line_counter(&self) -> u8 {
        self.win_line_counter
    }

    pub fn lcd_enabled(&self) -> bool {
        bits::test(self.lcdc, 7)
    }

    fn decode_cgb_color(lo: u8, hi: u8) -> u32 {
        let raw = ((hi as u16) << 8) | lo as u16;
        let expand = |c: u16| {
            let c = (c & 0x1F) as u32;
            (c << 3) | (c >> 2)
        };
        (expand(raw) << 16) | (expand(raw >> 5) << 8) | expand(raw >> 10)
    }

    pub fn bg_palette_color(&self, palette: usize, color_id: usize) -> u32 {
        let off = palette * 8 + color_id * 2;
        Self::decode_cgb_color(self.bgpd[off], self.bgpd[off + 1])
    }

    pub fn ob_palette_color(&self, palette: usize, color_id: usize) -> u32 {
        let off = palette * 8 + color_id * 2;
        Self::decode_cgb_color(self.obpd[off], self.obpd[off + 1])
    }

    fn sanitize_palette_index(value: u8) -> u8 {
        (value & (PAL_AUTO_INCREMENT_BIT | PAL_INDEX_MASK)) | PAL_UNUSED_BIT
    }

    fn step_palette_index(index: &mut u8) {
        if *index & PAL_AUTO_INCREMENT_BIT != 0 {
            let next = (*index).wrapping_add(1) & PAL_INDEX_MASK;
            *index = PAL_AUTO_INCREMENT_BIT | PAL_UNUSED_BIT | next;
        }
    }

    fn update_lyc_compare(&mut self) {
        if self.lcd_enabled() {
            self.lyc_eq_ly = self.ly == self.lyc;
        }
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                0x80 | (self.stat & 0x78) | (self.mode & 0x03) | if self.lyc_eq_ly { 0x04 } else { 0 }
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF68 if self.cgb => self.bgpi,
            0xFF69 if self.cgb => self.bgpd[(self.bgpi & PAL_INDEX_MASK) as usize],
            0xFF6A if self.cgb => self.obpi,
            0xFF6B if self.cgb => self.obpd[(self.obpi & PAL_INDEX_MASK) as usize],
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF40 => {
                let was_on = self.lcd_enabled();
                self.lcdc = val;
                if was_on && !self.lcd_enabled() {
                    self.mode = MODE_HBLANK;
                    self.line_clock = 0;
                    self.win_line_counter = 0;
                    self.ly = 0;
                } else if !was_on && self.lcd_enabled() {
                    self.mode = MODE_OAM;
                    self.line_clock = 0;
                    self.update_lyc_compare();
                }
            }
            // Mode and coincidence bits are read-only.
            0xFF41 => self.stat = (self.stat & 0x07) | (val & 0x78),
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {}
            0xFF45 => {
                self.lyc = val;
                self.update_lyc_compare();
            }
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            0xFF68 if self.cgb => self.bgpi = Self::sanitize_palette_index(val),
            0xFF69 if self.cgb => {
                self.bgpd[(self.bgpi & PAL_INDEX_MASK) as usize] = val;
                Self::step_palette_index(&mut self.bgpi);
            }
            0xFF6A if self.cgb => self.obpi = Self::sanitize_palette_index(val),
            0xFF6B if self.cgb => {
                self.obpd[(self.obpi & PAL_INDEX_MASK) as usize] = val;
                Self::step_palette_index(&mut self.obpi);
            }
            _ => {}
        }
    }

    /// Collect up to 10 sprites covering the current line, in drawing priority order.
    fn oam_scan(&mut self) {
        let height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        let ly = self.ly as i16;
        self.sprite_count = 0;
        for i in 0..TOTAL_SPRITES {
            if self.sprite_count >= MAX_SPRITES_PER_LINE {
                break;
            }
            let base = i * 4;
            let y = self.oam[base] as i16 - 16;
            if ly >= y && ly < y + height {
                self.line_sprites[self.sprite_count] = Sprite {
                    x: self.oam[base + 1] as i16 - 8,
                    y,
                    tile: self.oam[base + 2],
                    flags: self.oam[base + 3],
                    oam_index: i,
                };
                self.sprite_count += 1;
            }
        }
        let sprites = &mut self.line_sprites[..self.sprite_count];
        if self.cgb && !self.dmg_compat {
            sprites.sort_by_key(|s| s.oam_index);
        } else {
            sprites.sort_by_key(|s| (s.x, s.oam_index));
        }
    }

    #[inline(always)]
    fn dmg_shade(palette: u8, color_id: u8) -> usize {
        ((palette >> (color_id * 2)) & 0x03) as usize
    }

    /// Fetch the pixel at (`x`, `y`) of the 256x256 tile map at `map_base`.
    fn map_pixel(&self, map_base: usize, x: usize, y: usize) -> BgPixel {
        let map_idx = map_base + (y / 8) * 32 + (x / 8);
        let tile_index = self.vram[0][map_idx];
        let attr = if self.cgb_features() {
            self.vram[1][map_idx]
        } else {
            0
        };

        let mut row = y % 8;
        let mut col = x % 8;
        if attr & 0x40 != 0 {
            row = 7 - row;
        }
        if attr & 0x20 != 0 {
            col = 7 - col;
        }

        let tile_addr = if self.lcdc & 0x10 != 0 {
            tile_index as usize * 16
        } else {
            (0x1000 + (tile_index as i8 as isize) * 16) as usize
        };
        let bank = ((attr >> 3) & 0x01) as usize;
        let lo = self.vram[bank][tile_addr + row * 2];
        let hi = self.vram[bank][tile_addr + row * 2 + 1];
        let bit = 7 - col;

        BgPixel {
            color_id: (((hi >> bit) & 1) << 1) | ((lo >> bit) & 1),
            palette: attr & 0x07,
            priority: attr & 0x80 != 0,
        }
    }

    fn render_scanline(&mut self) {
        let ly = self.ly as usize;
        if !self.lcd_enabled() || ly >= SCREEN_HEIGHT {
            return;
        }

        // On DMG, LCDC bit 0 blanks BG and window. On CGB it only strips their priority.
        let cgb_features = self.cgb_features();
        let bg_enabled = cgb_features || self.lcdc & 0x01 != 0;
        let master_priority = !cgb_features || self.lcdc & 0x01 != 0;

        let mut line = [BgPixel::default(); SCREEN_WIDTH];

        if bg_enabled {
            let map = if self.lcdc & 0x08 != 0 {
                BG_MAP_1_BASE
            } else {
                BG_MAP_0_BASE
            };
            let y = (ly + self.scy as usize) & 0xFF;
            for (x, px) in line.iter_mut().enumerate() {
                *px = self.map_pixel(map, (x + self.scx as usize) & 0xFF, y);
            }

            if self.lcdc & 0x20 != 0 && self.ly >= self.wy && self.wx <= WINDOW_X_MAX {
                let map = if self.lcdc & 0x40 != 0 {
                    BG_MAP_1_BASE
                } else {
                    BG_MAP_0_BASE
                };
                let win_y = self.win_line_counter as usize;
                let start = (self.wx as isize - 7).max(0) as usize;
                for x in start..SCREEN_WIDTH {
                    let win_x = (x as isize - (self.wx as isize - 7)) as usize;
                    line[x] = self.map_pixel(map, win_x, win_y);
                }
                self.win_line_counter = self.win_line_counter.wrapping_add(1);
            }
        }

        let row = ly * SCREEN_WIDTH;
        for (x, px) in line.iter().enumerate() {
            self.framebuffer[row + x] = if !bg_enabled {
                self.bg_shade_color(0)
            } else if cgb_features {
                self.bg_palette_color(px.palette as usize, px.color_id as usize)
            } else {
                self.bg_shade_color(Self::dmg_shade(self.bgp, px.color_id))
            };
        }

        if self.lcdc & 0x02 != 0 {
            self.render_sprites(&line, bg_enabled, master_priority);
        }
    }

    fn render_sprites(&mut self, line: &[BgPixel; SCREEN_WIDTH], bg_enabled: bool, master_priority: bool) {
        let ly = self.ly as i16;
        let height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        let row = self.ly as usize * SCREEN_WIDTH;
        let mut claimed = [false; SCREEN_WIDTH];
        let cgb_features = self.cgb_features();

        for i in 0..self.sprite_count {
            let s = self.line_sprites[i];
            let tile = if height == 16 { s.tile & 0xFE } else { s.tile };
            let mut line_idx = ly - s.y;
            if s.flags & 0x40 != 0 {
                line_idx = height - 1 - line_idx;
            }
            let bank = if cgb_features {
                ((s.flags >> 3) & 0x01) as usize
            } else {
                0
            };
            let addr = tile as usize * 16 + line_idx as usize * 2;
            let lo = self.vram[bank][addr];
            let hi = self.vram[bank][addr + 1];

            for px in 0..8u8 {
                let sx = s.x + px as i16;
                if !(0..SCREEN_WIDTH as i16).contains(&sx) || claimed[sx as usize] {
                    continue;
                }
                let bit = if s.flags & 0x20 != 0 { px } else { 7 - px };
                let color_id = (((hi >> bit) & 1) << 1) | ((lo >> bit) & 1);
                if color_id == 0 {
                    continue;
                }
                let sx = sx as usize;
                claimed[sx] = true;

                let bg = line[sx];
                let bg_opaque = bg_enabled && bg.color_id != 0;
                if master_priority && bg_opaque && (s.flags & 0x80 != 0 || bg.priority) {
                    continue;
                }

                self.framebuffer[row + sx] = if cgb_features {
                    self.ob_palette_color((s.flags & 0x07) as usize, color_id as usize)
                } else {
                    let (reg, index) = if s.flags & 0x10 != 0 {
                        (self.obp1, 1)
                    } else {
                        (self.obp0, 0)
                    };
                    self.obj_shade_color(index, Self::dmg_shade(reg, color_id))
                };
            }
        }
    }

    /// Advance by `cycles` master cycles. Returns true if HBlank was entered.
    pub fn step(&mut self, cycles: u32, interrupts: &mut Interrupts) -> bool {
        if !self.lcd_enabled() {
            return false;
        }

        let mut hblank_entered = false;
        let mut remaining = cycles;
        while remaining > 0 {
            let visible = (self.ly as usize) < SCREEN_HEIGHT;
            let boundary = if !visible {
                LINE_CYCLES
            } else if self.line_clock < MODE2_END {
                MODE2_END
            } else if self.line_clock < MODE3_END {
                MODE3_END
            } else {
                LINE_CYCLES
            };
            let run = remaining.min(boundary - self.line_clock);
            self.line_clock += run;
            remaining -= run;

            if self.line_clock == LINE_CYCLES {
                self.line_clock = 0;
                self.next_line(interrupts);
            } else if visible && self.line_clock == MODE2_END {
                self.mode = MODE_TRANSFER;
                self.oam_scan();
                self.render_scanline();
            } else if visible && self.line_clock == MODE3_END {
                self.mode = MODE_HBLANK;
                hblank_entered = true;
            }

            self.update_stat_irq(interrupts);
        }
        hblank_entered
    }

    fn next_line(&mut self, interrupts: &mut Interrupts) {
        self.ly += 1;
        if self.ly == SCREEN_HEIGHT as u8 {
            self.mode = MODE_VBLANK;
            self.frame_ready = true;
            self.frame_counter = self.frame_counter.wrapping_add(1);
            interrupts.request(Interrupt::VBlank);
        } else if self.ly == LINES_PER_FRAME {
            self.ly = 0;
            self.win_line_counter = 0;
            self.mode = MODE_OAM;
        } else if self.ly < SCREEN_HEIGHT as u8 {
            self.mode = MODE_OAM;
        }
        self.update_lyc_compare();
    }

    fn update_stat_irq(&mut self, interrupts: &mut Interrupts) {
        let coincidence = self.lyc_eq_ly && self.stat & 0x40 != 0;
        let vblank_oam = self.ly == SCREEN_HEIGHT as u8 && self.line_clock == 0;
        let mode_signal = match self.mode {
            MODE_HBLANK => self.stat & 0x08 != 0,
            MODE_VBLANK => self.stat & 0x10 != 0 || (vblank_oam && self.stat & 0x20 != 0),
            MODE_OAM => self.stat & 0x20 != 0,
            _ => false,
        };
        let current = coincidence || mode_signal;
        if current && !self.stat_irq_line {
            interrupts.request(Interrupt::LcdStat);
        }
        self.stat_irq_line = current;
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new(false)
    }
}
