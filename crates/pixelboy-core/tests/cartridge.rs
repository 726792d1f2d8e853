mod common;

use common::{ManualClock, ROM_BANK_SIZE, RomBuilder};
use pixelboy_core::{
    EmulatorConfig, GameBoy,
    cartridge::{Cartridge, CartridgeError, MbcType},
};
use std::fs;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::tempdir;

#[test]
fn header_fields_are_decoded() {
    let cart = RomBuilder::new(0x13, 8)
        .ram_code(0x03)
        .cgb_flag(0x80)
        .title(b"POKEMON\0JUNK")
        .cartridge();
    let header = cart.header();
    assert_eq!(header.title, "POKEMON");
    assert_eq!(cart.title(), "POKEMON");
    assert_eq!(header.rom_banks(), 8);
    assert_eq!(header.ram_banks(), 4);
    assert_eq!(cart.mbc(), MbcType::Mbc3);
    assert!(cart.cgb());
    assert!(cart.has_battery());
    assert!(!cart.has_rtc());
}

#[test]
fn rejects_short_and_unknown_images() {
    assert_eq!(
        Cartridge::load(vec![0; 0x100]).unwrap_err(),
        CartridgeError::TooSmall(0x100)
    );
    let rom = RomBuilder::new(0x22, 2).build();
    assert_eq!(
        Cartridge::load(rom).unwrap_err(),
        CartridgeError::UnsupportedMbc(0x22)
    );
}

#[test]
fn mbc1_bank_zero_selects_one() {
    let mut cart = RomBuilder::new(0x01, 4).cartridge();
    cart.write(0x2000, 0x00);
    assert_eq!(cart.read(0x4000), 1);
    cart.write(0x2000, 0x03);
    assert_eq!(cart.read(0x4000), 3);
}

#[test]
fn mbc1_bank_select_wraps_bank_count() {
    let rom = RomBuilder::new(0x01, 4).build();
    let expected = rom[(5 % 4) * ROM_BANK_SIZE];
    let mut gb = common::gameboy_with(rom, EmulatorConfig::default());
    gb.mmu.write_byte(0x2000, 5);
    assert_eq!(gb.mmu.read_byte(0x4000), expected);
}

#[test]
fn mbc1_upper_bits_in_mode_one_bank_low_area() {
    let mut cart = RomBuilder::new(0x01, 64).cartridge();
    cart.write(0x4000, 0x01);
    cart.write(0x2000, 0x02);
    assert_eq!(cart.current_rom_bank(), 0x22);
    assert_eq!(cart.read(0x0000), 0);
    cart.write(0x6000, 0x01);
    assert_eq!(cart.read(0x0000), 0x20);
}

#[test]
fn external_ram_requires_enable() {
    let mut cart = RomBuilder::new(0x03, 2).ram_code(0x02).cartridge();
    cart.write(0xA000, 0x55);
    assert_eq!(cart.read(0xA000), 0xFF);
    cart.write(0x0000, 0x0A);
    cart.write(0xA000, 0x55);
    assert_eq!(cart.read(0xA000), 0x55);
    cart.write(0x0000, 0x00);
    assert_eq!(cart.read(0xA000), 0xFF);
    assert_eq!(cart.ram()[0], 0x55);
}

#[test]
fn mbc3_latch_freezes_clock_reads() {
    let mut cart = RomBuilder::new(0x10, 2).ram_code(0x03).cartridge();
    assert!(cart.has_rtc());
    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x08);
    cart.write(0xA000, 12);
    // Nothing latched yet.
    assert_eq!(cart.read(0xA000), 0);

    cart.write(0x6000, 0x00);
    cart.write(0x6000, 0x01);
    assert_eq!(cart.read(0xA000), 12);

    // A 1 without the preceding 0 does not relatch.
    cart.write(0xA000, 30);
    cart.write(0x6000, 0x01);
    assert_eq!(cart.read(0xA000), 12);
}

fn latch(cart: &mut Cartridge) {
    cart.write(0x6000, 0x00);
    cart.write(0x6000, 0x01);
}

fn read_rtc(cart: &mut Cartridge, reg: u8) -> u8 {
    cart.write(0x4000, reg);
    cart.read(0xA000)
}

#[test]
fn mbc3_rtc_follows_wall_clock_between_latches() {
    let clock = ManualClock::default();
    let mut cart = RomBuilder::new(0x10, 2).ram_code(0x03).cartridge();
    assert!(cart.set_rtc_clock(Box::new(clock.clone())));
    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x08);
    cart.write(0xA000, 50);

    clock.advance(5);
    latch(&mut cart);
    assert_eq!(read_rtc(&mut cart, 0x08), 55);
    assert_eq!(read_rtc(&mut cart, 0x09), 0);

    // The latched copy holds still while time passes.
    clock.advance(3_600 + 10);
    assert_eq!(read_rtc(&mut cart, 0x08), 55);

    latch(&mut cart);
    assert_eq!(read_rtc(&mut cart, 0x08), 5);
    assert_eq!(read_rtc(&mut cart, 0x09), 1);
    assert_eq!(read_rtc(&mut cart, 0x0A), 1);
}

#[test]
fn mbc3_rtc_ignores_emulated_time() {
    let clock = ManualClock::default();
    let mut cart = RomBuilder::new(0x10, 2).ram_code(0x03).cartridge();
    cart.set_rtc_clock(Box::new(clock.clone()));
    let mut gb = GameBoy::default();
    gb.load_cartridge(cart);
    for _ in 0..120 {
        gb.run_frame().unwrap();
    }
    gb.mmu.write_byte(0x0000, 0x0A);
    gb.mmu.write_byte(0x6000, 0x00);
    gb.mmu.write_byte(0x6000, 0x01);
    gb.mmu.write_byte(0x4000, 0x08);
    assert_eq!(gb.mmu.read_byte(0xA000), 0);
}

#[test]
fn clock_setter_needs_an_rtc_cartridge() {
    let mut cart = RomBuilder::new(0x13, 2).ram_code(0x03).cartridge();
    assert!(!cart.set_rtc_clock(Box::new(ManualClock::default())));
}

#[test]
fn mbc5_ninth_rom_bank_bit() {
    let mut cart = RomBuilder::new(0x19, 512).cartridge();
    cart.write(0x2000, 0x05);
    cart.write(0x3000, 0x01);
    assert_eq!(cart.current_rom_bank(), 0x105);
    assert_eq!(cart.read(0x4000), 0x05);
    assert_eq!(cart.read(0x4001), 0x01);

    // MBC5 can map bank 0 into the switchable area.
    cart.write(0x3000, 0x00);
    cart.write(0x2000, 0x00);
    assert_eq!(cart.current_rom_bank(), 0);
}

#[test]
fn battery_ram_round_trips_through_a_save_file() {
    let dir = tempdir().unwrap();
    let save_path = dir.path().join("game.sav");
    let rom = RomBuilder::new(0x03, 2).ram_code(0x03).build();

    let mut gb = common::gameboy_with(rom.clone(), EmulatorConfig::default());
    gb.mmu.write_byte(0x0000, 0x0A);
    // Mode 1 routes the upper bank bits to RAM.
    gb.mmu.write_byte(0x6000, 0x01);
    gb.mmu.write_byte(0xA000, 0xAA);
    gb.mmu.write_byte(0x4000, 0x02);
    gb.mmu.write_byte(0xA123, 0xBB);
    fs::write(&save_path, gb.save_ram().unwrap()).unwrap();

    let mut gb = common::gameboy_with(rom, EmulatorConfig::default());
    gb.load_ram(&fs::read(&save_path).unwrap());
    gb.mmu.write_byte(0x0000, 0x0A);
    gb.mmu.write_byte(0x6000, 0x01);
    assert_eq!(gb.mmu.read_byte(0xA000), 0xAA);
    gb.mmu.write_byte(0x4000, 0x02);
    assert_eq!(gb.mmu.read_byte(0xA123), 0xBB);
}

#[test]
fn non_battery_cart_has_no_save() {
    let rom = RomBuilder::new(0x02, 2).ram_code(0x02).build();
    let gb = common::gameboy_with(rom, EmulatorConfig::default());
    assert!(gb.save_ram().is_none());
}

#[test]
fn rtc_blob_restores_with_elapsed_wall_time() {
    let dir = tempdir().unwrap();
    let rtc_path = dir.path().join("game.rtc");

    let mut cart = RomBuilder::new(0x10, 2).ram_code(0x03).cartridge();
    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x09);
    cart.write(0xA000, 10);
    let saved_at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    fs::write(&rtc_path, cart.rtc_state_at(saved_at).unwrap()).unwrap();

    let mut cart = RomBuilder::new(0x10, 2).ram_code(0x03).cartridge();
    let blob = fs::read(&rtc_path).unwrap();
    assert!(cart.load_rtc_state_at(&blob, saved_at + Duration::from_secs(120)));
    cart.write(0x0000, 0x0A);
    cart.write(0x4000, 0x09);
    assert_eq!(cart.read(0xA000), 12);
}

#[test]
fn corrupt_rtc_timestamp_is_rejected() {
    let clock = ManualClock::default();
    let mut cart = RomBuilder::new(0x10, 2).ram_code(0x03).cartridge();
    cart.set_rtc_clock(Box::new(clock.clone()));
    let mut blob = cart.rtc_state().unwrap();
    blob[5..13].copy_from_slice(&u64::MAX.to_le_bytes());
    assert!(!cart.load_rtc_state(&blob));

    // The clock keeps running from where it was.
    clock.advance(2);
    latch(&mut cart);
    cart.write(0x0000, 0x0A);
    assert_eq!(read_rtc(&mut cart, 0x08), 2);
}

#[test]
fn rtc_blob_is_rejected_without_a_clock() {
    let mut gb = GameBoy::default();
    gb.load_cartridge(RomBuilder::new(0x03, 2).ram_code(0x02).cartridge());
    assert!(gb.rtc_state().is_none());
    assert!(!gb.load_rtc_state(b"RTC1"));
}
