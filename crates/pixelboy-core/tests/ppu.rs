mod common;

use common::{gameboy_with, program_rom};
use pixelboy_core::{
    EmulatorConfig,
    gameboy::FRAME_CYCLES,
    hardware::Model,
    interrupts::{Interrupt, Interrupts},
    mmu::Mmu,
    ppu::{DMG_PALETTE, MODE_HBLANK, MODE_OAM, MODE_TRANSFER, MODE_VBLANK, Ppu},
};

fn lcd_on() -> Mmu {
    let mut mmu = Mmu::new(false);
    mmu.write_byte(0xFF40, 0x91);
    mmu.interrupts.flags = 0;
    mmu
}

fn stat_mode(mmu: &Mmu) -> u8 {
    mmu.read_byte(0xFF41) & 0x03
}

#[test]
fn frame_is_154_lines_of_456_cycles() {
    let mut mmu = lcd_on();
    let mut max_ly = 0;
    let mut vblank_edges = 0;
    for _ in 0..FRAME_CYCLES / 4 {
        mmu.tick(4);
        max_ly = max_ly.max(mmu.read_byte(0xFF44));
        if mmu.interrupts.flags & Interrupt::VBlank.bit() != 0 {
            vblank_edges += 1;
            mmu.interrupts.acknowledge(Interrupt::VBlank);
        }
    }
    assert_eq!(max_ly, 153);
    assert_eq!(vblank_edges, 1);
    assert_eq!(mmu.read_byte(0xFF44), 0);
    assert_eq!(stat_mode(&mmu), MODE_OAM);
    assert_eq!(mmu.ppu.frames(), 1);
}

#[test]
fn visible_line_mode_sequence() {
    let mut mmu = lcd_on();
    assert_eq!(stat_mode(&mmu), MODE_OAM);
    mmu.tick(79);
    assert_eq!(stat_mode(&mmu), MODE_OAM);
    mmu.tick(1);
    assert_eq!(stat_mode(&mmu), MODE_TRANSFER);
    mmu.tick(171);
    assert_eq!(stat_mode(&mmu), MODE_TRANSFER);
    mmu.tick(1);
    assert_eq!(stat_mode(&mmu), MODE_HBLANK);
    mmu.tick(204);
    assert_eq!(stat_mode(&mmu), MODE_OAM);
    assert_eq!(mmu.read_byte(0xFF44), 1);
}

#[test]
fn vblank_begins_at_line_144() {
    let mut mmu = lcd_on();
    mmu.tick(456 * 144 - 4);
    assert_eq!(stat_mode(&mmu), MODE_HBLANK);
    assert_eq!(mmu.interrupts.flags & Interrupt::VBlank.bit(), 0);
    mmu.tick(4);
    assert_eq!(mmu.read_byte(0xFF44), 144);
    assert_eq!(stat_mode(&mmu), MODE_VBLANK);
    assert_ne!(mmu.interrupts.flags & Interrupt::VBlank.bit(), 0);
    assert!(mmu.ppu.frame_ready());
}

#[test]
fn lyc_match_raises_stat() {
    let mut mmu = lcd_on();
    mmu.write_byte(0xFF45, 5);
    mmu.write_byte(0xFF41, 0x40);
    mmu.tick(456 * 5 - 4);
    assert_eq!(mmu.interrupts.flags & Interrupt::LcdStat.bit(), 0);
    assert_eq!(mmu.read_byte(0xFF41) & 0x04, 0);
    mmu.tick(4);
    assert_ne!(mmu.interrupts.flags & Interrupt::LcdStat.bit(), 0);
    assert_ne!(mmu.read_byte(0xFF41) & 0x04, 0);

    // The line stays high for the rest of LY=5, so no second request.
    mmu.interrupts.acknowledge(Interrupt::LcdStat);
    mmu.tick(400);
    assert_eq!(mmu.interrupts.flags & Interrupt::LcdStat.bit(), 0);
}

#[test]
fn hblank_stat_source() {
    let mut mmu = lcd_on();
    mmu.write_byte(0xFF41, 0x08);
    mmu.tick(251);
    assert_eq!(mmu.interrupts.flags & Interrupt::LcdStat.bit(), 0);
    mmu.tick(1);
    assert_ne!(mmu.interrupts.flags & Interrupt::LcdStat.bit(), 0);
}

#[test]
fn lcd_off_freezes_at_line_zero() {
    let mut mmu = lcd_on();
    mmu.tick(456 * 10 + 100);
    mmu.write_byte(0xFF40, 0x11);
    assert_eq!(mmu.read_byte(0xFF44), 0);
    assert_eq!(stat_mode(&mmu), MODE_HBLANK);
    mmu.tick(456 * 200);
    assert_eq!(mmu.read_byte(0xFF44), 0);
    assert_eq!(mmu.ppu.frames(), 0);
}

#[test]
fn run_frame_sees_exactly_one_vblank() {
    let mut gb = gameboy_with(program_rom(&[0x18, 0xFE]), EmulatorConfig::default());
    gb.run_frame().unwrap();
    for _ in 0..3 {
        let before = gb.mmu.ppu.frames();
        let elapsed = gb.run_frame().unwrap();
        assert_eq!(gb.mmu.ppu.frames(), before + 1);
        assert!(elapsed.abs_diff(FRAME_CYCLES) <= 12, "{elapsed}");
        assert_eq!(gb.mmu.read_byte(0xFF44), 144);
    }
}

/// Fills tile 0 with color 3 so the whole background shows one shade.
fn solid_background(config: EmulatorConfig) -> Vec<u32> {
    solid_background_with_bgp(config, 0xE4)
}

fn solid_background_with_bgp(config: EmulatorConfig, bgp: u8) -> Vec<u32> {
    let mut gb = gameboy_with(program_rom(&[0x18, 0xFE]), config);
    for addr in 0x8000..0x8010 {
        gb.mmu.write_byte(addr, 0xFF);
    }
    gb.mmu.write_byte(0xFF47, bgp);
    gb.run_frame().unwrap();
    gb.run_frame().unwrap();
    gb.framebuffer().to_vec()
}

#[test]
fn dmg_background_uses_default_shades() {
    let frame = solid_background(EmulatorConfig::default());
    assert_eq!(frame.len(), 160 * 144);
    assert!(frame.iter().all(|&px| px == DMG_PALETTE[3]));
}

#[test]
fn configured_dmg_palette_replaces_shades() {
    let frame = solid_background(EmulatorConfig {
        dmg_palette: Some([0x00FFFFFF, 0x00AAAAAA, 0x00555555, 0x00123456]),
        ..EmulatorConfig::default()
    });
    assert!(frame.iter().all(|&px| px == 0x00123456));
}

#[test]
fn dmg_cartridge_on_cgb_follows_bgp() {
    let forced_cgb = || EmulatorConfig {
        model: Model::Cgb,
        ..EmulatorConfig::default()
    };
    let normal = solid_background_with_bgp(forced_cgb(), 0xE4);
    assert!(normal.iter().all(|&px| px == 0x0000_0000));

    // An inverted BGP maps color 3 to the lightest compatibility shade.
    let inverted = solid_background_with_bgp(forced_cgb(), 0x1B);
    assert!(inverted.iter().all(|&px| px == 0x00FF_FFFF));
}

const LINE_CYCLES: u32 = 456;
const OAM_SCAN_CYCLES: u32 = 80;
const SCREEN_WIDTH: usize = 160;
const RED: u32 = 0x00FF_0000;
const GREEN: u32 = 0x0000_FF00;
const BLUE: u32 = 0x0000_00FF;

fn fill_tile(bank: &mut [u8], tile: usize, lo: u8, hi: u8) {
    for row in 0..8 {
        bank[tile * 16 + row * 2] = lo;
        bank[tile * 16 + row * 2 + 1] = hi;
    }
}

/// Turns the LCD on with `lcdc` and draws line 0.
fn start(ppu: &mut Ppu, ints: &mut Interrupts, lcdc: u8) {
    ppu.write_reg(0xFF40, lcdc);
    ppu.step(OAM_SCAN_CYCLES, ints);
}

fn draw_lines(ppu: &mut Ppu, ints: &mut Interrupts, lines: u32) {
    ppu.step(LINE_CYCLES * lines, ints);
}

fn set_color(ppu: &mut Ppu, index_reg: u16, palette: u8, color: u8, rgb555: u16) {
    ppu.write_reg(index_reg, 0x80 | (palette * 8 + color * 2));
    ppu.write_reg(index_reg + 1, rgb555 as u8);
    ppu.write_reg(index_reg + 1, (rgb555 >> 8) as u8);
}

fn set_bg_color(ppu: &mut Ppu, palette: u8, color: u8, rgb555: u16) {
    set_color(ppu, 0xFF68, palette, color, rgb555);
}

fn set_obj_color(ppu: &mut Ppu, palette: u8, color: u8, rgb555: u16) {
    set_color(ppu, 0xFF6A, palette, color, rgb555);
}

#[test]
fn window_keeps_its_own_line_counter() {
    const WINDOW_ON: u8 = 0xF1;
    let mut ints = Interrupts::new();
    let mut ppu = Ppu::new(false);
    // Tile 1 only draws its third row, in color 3.
    ppu.vram[0][16 + 4] = 0xFF;
    ppu.vram[0][16 + 5] = 0xFF;
    ppu.vram[0][0x1C00..0x2000].fill(1);
    ppu.write_reg(0xFF47, 0xE4);
    ppu.write_reg(0xFF4A, 2);
    ppu.write_reg(0xFF4B, 87);

    start(&mut ppu, &mut ints, WINDOW_ON);
    assert_eq!(ppu.window_line_counter(), 0);
    draw_lines(&mut ppu, &mut ints, 3);
    assert_eq!(ppu.window_line_counter(), 2);
    assert_eq!(ppu.framebuffer()[3 * SCREEN_WIDTH + 80], DMG_PALETTE[0]);

    // Lines drawn with the window off do not advance its counter.
    ppu.write_reg(0xFF40, WINDOW_ON & !0x20);
    draw_lines(&mut ppu, &mut ints, 2);
    assert_eq!(ppu.window_line_counter(), 2);

    ppu.write_reg(0xFF40, WINDOW_ON);
    draw_lines(&mut ppu, &mut ints, 1);
    assert_eq!(ppu.window_line_counter(), 3);
    let row = &ppu.framebuffer()[6 * SCREEN_WIDTH..7 * SCREEN_WIDTH];
    assert_eq!(row[79], DMG_PALETTE[0]);
    assert!(row[80..].iter().all(|&px| px == DMG_PALETTE[3]));
}

#[test]
fn tall_sprites_span_an_even_odd_tile_pair() {
    let mut ints = Interrupts::new();
    let mut ppu = Ppu::new(false);
    fill_tile(&mut ppu.vram[0], 2, 0xFF, 0x00);
    fill_tile(&mut ppu.vram[0], 3, 0xFF, 0xFF);
    // Tile index 3 still starts at tile 2; the second sprite is flipped vertically.
    ppu.oam[0..4].copy_from_slice(&[16, 8, 3, 0x00]);
    ppu.oam[4..8].copy_from_slice(&[16, 16, 3, 0x40]);
    ppu.write_reg(0xFF48, 0xE4);

    start(&mut ppu, &mut ints, 0x97);
    draw_lines(&mut ppu, &mut ints, 8);
    let fb = ppu.framebuffer();
    assert_eq!(fb[0], DMG_PALETTE[1]);
    assert_eq!(fb[8 * SCREEN_WIDTH], DMG_PALETTE[3]);
    assert_eq!(fb[8], DMG_PALETTE[3]);
    assert_eq!(fb[8 * SCREEN_WIDTH + 8], DMG_PALETTE[1]);
}

#[test]
fn cgb_tile_attributes_pick_bank_palette_and_flips() {
    let mut ints = Interrupts::new();
    let mut ppu = Ppu::new(true);
    // Bank 1, tile 1, last row: only the leftmost pixel, color 3.
    ppu.vram[1][16 + 14] = 0x80;
    ppu.vram[1][16 + 15] = 0x80;
    ppu.vram[0][0x1800] = 1;
    ppu.vram[1][0x1800] = 0x40 | 0x20 | 0x08 | 0x02;
    set_bg_color(&mut ppu, 2, 3, 0x001F);

    start(&mut ppu, &mut ints, 0x91);
    let fb = ppu.framebuffer();
    assert_eq!(fb[7], RED);
    assert_eq!(fb[0], 0);
}

#[test]
fn cgb_bg_priority_attribute_and_lcdc_bit_zero() {
    let mut ints = Interrupts::new();
    let mut ppu = Ppu::new(true);
    fill_tile(&mut ppu.vram[0], 2, 0xFF, 0x00);
    fill_tile(&mut ppu.vram[0], 3, 0xFF, 0xFF);
    ppu.vram[0][0x1801] = 2;
    ppu.vram[1][0x1801] = 0x80;
    set_bg_color(&mut ppu, 0, 1, 0x03E0);
    set_obj_color(&mut ppu, 0, 3, 0x7C00);
    ppu.oam[0..4].copy_from_slice(&[16, 16, 3, 0x00]);

    start(&mut ppu, &mut ints, 0x93);
    assert_eq!(ppu.framebuffer()[8], GREEN);

    // With LCDC bit 0 clear, sprites draw over every BG pixel.
    ppu.write_reg(0xFF40, 0x92);
    draw_lines(&mut ppu, &mut ints, 1);
    assert_eq!(ppu.framebuffer()[SCREEN_WIDTH + 8], BLUE);
}

#[test]
fn cgb_sprite_priority_follows_oam_order() {
    let mut ints = Interrupts::new();
    let mut ppu = Ppu::new(true);
    fill_tile(&mut ppu.vram[0], 1, 0xFF, 0x00);
    fill_tile(&mut ppu.vram[0], 2, 0xFF, 0xFF);
    // OAM 0 sits further right but still wins the overlap.
    ppu.oam[0..4].copy_from_slice(&[16, 12, 1, 0x00]);
    ppu.oam[4..8].copy_from_slice(&[16, 8, 2, 0x01]);
    set_obj_color(&mut ppu, 0, 1, 0x001F);
    set_obj_color(&mut ppu, 1, 3, 0x7C00);

    start(&mut ppu, &mut ints, 0x93);
    let fb = ppu.framebuffer();
    assert_eq!(fb[1], BLUE);
    assert_eq!(fb[5], RED);
    assert_eq!(fb[9], RED);
}

#[test]
fn behind_bg_sprite_shows_only_over_color_zero() {
    let mut ints = Interrupts::new();
    let mut ppu = Ppu::new(false);
    fill_tile(&mut ppu.vram[0], 1, 0xF0, 0x00);
    fill_tile(&mut ppu.vram[0], 2, 0xFF, 0xFF);
    ppu.vram[0][0x1800] = 1;
    ppu.oam[0..4].copy_from_slice(&[16, 8, 2, 0x80]);
    ppu.write_reg(0xFF47, 0xE4);
    ppu.write_reg(0xFF48, 0xE4);

    start(&mut ppu, &mut ints, 0x93);
    let fb = ppu.framebuffer();
    assert!(fb[0..4].iter().all(|&px| px == DMG_PALETTE[1]));
    assert!(fb[4..8].iter().all(|&px| px == DMG_PALETTE[3]));
}
