#![allow(dead_code)]

use pixelboy_core::{EmulatorConfig, RtcClock, cartridge::Cartridge, gameboy::GameBoy};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ROM_BANK_SIZE: usize = 0x4000;

/// Builds cartridge images in memory. Every bank starts with its own index so
/// tests can tell which bank is mapped.
pub struct RomBuilder {
    rom: Vec<u8>,
}

impl RomBuilder {
    pub fn new(cart_type: u8, rom_banks: usize) -> Self {
        assert!(rom_banks.is_power_of_two() && rom_banks >= 2);
        let mut rom = vec![0u8; rom_banks * ROM_BANK_SIZE];
        for bank in 0..rom_banks {
            rom[bank * ROM_BANK_SIZE] = bank as u8;
            rom[bank * ROM_BANK_SIZE + 1] = (bank >> 8) as u8;
        }
        rom[0x0147] = cart_type;
        rom[0x0148] = (rom_banks.trailing_zeros() - 1) as u8;
        // Park the CPU on `JR -2` unless a test supplies its own entry point.
        rom[0x0100] = 0x18;
        rom[0x0101] = 0xFE;
        Self { rom }
    }

    pub fn ram_code(mut self, code: u8) -> Self {
        self.rom[0x0149] = code;
        self
    }

    pub fn cgb_flag(mut self, flag: u8) -> Self {
        self.rom[0x0143] = flag;
        self
    }

    pub fn title(mut self, title: &[u8]) -> Self {
        self.rom[0x0134..0x0134 + title.len()].copy_from_slice(title);
        self
    }

    /// Places raw bytes at an absolute ROM offset.
    pub fn code(mut self, at: usize, bytes: &[u8]) -> Self {
        self.rom[at..at + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.rom
    }

    pub fn cartridge(self) -> Cartridge {
        Cartridge::load(self.rom).expect("synthetic ROM should load")
    }
}

/// A ROM-only cartridge whose entry point runs `program`.
pub fn program_rom(program: &[u8]) -> Vec<u8> {
    RomBuilder::new(0x00, 2).code(0x0100, program).build()
}

/// Routes core log output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn gameboy_with(rom: Vec<u8>, config: EmulatorConfig) -> GameBoy {
    init_logging();
    let mut gb = GameBoy::new(config);
    gb.load_cartridge(Cartridge::load(rom).expect("synthetic ROM should load"));
    gb
}

/// Steps until PC reaches `pc`, failing after `max_steps`.
pub fn run_until_pc(gb: &mut GameBoy, pc: u16, max_steps: usize) {
    for _ in 0..max_steps {
        if gb.cpu.pc == pc {
            return;
        }
        gb.step().expect("unexpected illegal opcode");
    }
    panic!("PC never reached {pc:04X}; {}", gb.cpu.debug_state());
}

/// Wall clock that only moves when a test advances it. Clones share one time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub const EPOCH_SECS: u64 = 1_700_000_000;

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

impl RtcClock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(Self::EPOCH_SECS + self.0.load(Ordering::Relaxed))
    }
}
