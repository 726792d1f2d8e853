use log::{debug, trace};

use crate::{
    apu::Apu, cartridge::Cartridge, input::Input, interrupts::Interrupts, ppu::Ppu, serial::Serial,
    timer::Timer,
};

const WRAM_BANK_SIZE: usize = 0x1000;
const OAM_DMA_LEN: u16 = 0xA0;
const HDMA_BLOCK: u16 = 0x10;

/// CGB VRAM DMA registers (FF51-FF55).
#[derive(Debug, Default)]
struct Hdma {
    /// Source pointer; the low nibble is ignored.
    src: u16,
    /// Destination in VRAM, always `0x8000 | (dst & 0x1FF0)`.
    dst: u16,
    /// Remaining 0x10-byte blocks of an HBlank transfer
    blocks: u8,
    active: bool,
}

impl Hdma {
    #[inline]
    fn sanitize_dest(addr: u16) -> u16 {
        0x8000 | (addr & 0x1FF0)
    }
}

pub struct Mmu {
    pub wram: [[u8; WRAM_BANK_SIZE]; 8],
    pub wram_bank: usize,
    pub hram: [u8; 0x7F],
    pub cart: Option<Cartridge>,
    pub boot_rom: Option<Vec<u8>>,
    pub boot_mapped: bool,
    pub interrupts: Interrupts,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub input: Input,
    hdma: Hdma,
    pub key1: u8,
    dma_reg: u8,
    cgb_mode: bool,
}

impl Mmu {
    pub fn new(cgb: bool) -> Self {
        Self {
            wram: [[0; WRAM_BANK_SIZE]; 8],
            wram_bank: 1,
            hram: [0; 0x7F],
            cart: None,
            boot_rom: None,
            boot_mapped: false,
            interrupts: Interrupts::new(),
            serial: Serial::new(cgb),
            ppu: Ppu::new(cgb),
            apu: Apu::new(),
            timer: Timer::new(),
            input: Input::new(),
            hdma: Hdma {
                dst: Hdma::sanitize_dest(0),
                ..Hdma::default()
            },
            key1: 0,
            dma_reg: 0xFF,
            cgb_mode: cgb,
        }
    }

    pub fn cgb(&self) -> bool {
        self.cgb_mode
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.boot_rom = Some(data);
        self.boot_mapped = true;
    }

    pub fn unmap_boot_rom(&mut self) {
        if self.boot_mapped {
            debug!("Boot ROM unmapped");
            self.boot_mapped = false;
            if self.cgb_mode && self.cart.as_ref().is_some_and(|c| !c.cgb()) {
                self.ppu.enter_dmg_compat_mode();
            }
        }
    }

    /// I/O state normally left behind by the boot ROM.
    pub fn apply_post_boot_state(&mut self) {
        self.interrupts.flags = 0x01;
        self.ppu.apply_boot_state();
        if self.cgb_mode && self.cart.as_ref().is_some_and(|c| !c.cgb()) {
            self.ppu.apply_dmg_compatibility_palettes();
        }
    }

    #[inline]
    pub fn double_speed(&self) -> bool {
        self.key1 & 0x80 != 0
    }

    /// 1 in normal speed, 2 in CGB double speed.
    #[inline]
    pub fn speed_factor(&self) -> u32 {
        if self.double_speed() { 2 } else { 1 }
    }

    /// Performs an armed KEY1 speed switch. Returns false when none was armed.
    pub fn try_speed_switch(&mut self) -> bool {
        if !self.cgb_mode || self.key1 & 0x01 == 0 {
            return false;
        }
        self.key1 = (self.key1 ^ 0x80) & 0x80;
        debug!(
            "Speed switch: {} speed",
            if self.double_speed() { "double" } else { "normal" }
        );
        true
    }

    fn boot_rom_byte(&self, addr: u16) -> Option<u8> {
        if !self.boot_mapped {
            return None;
        }
        let in_overlay = addr < 0x0100 || (self.cgb_mode && (0x0200..=0x08FF).contains(&addr));
        if !in_overlay {
            return None;
        }
        self.boot_rom
            .as_ref()
            .and_then(|rom| rom.get(addr as usize).copied())
    }

    pub fn read_byte(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF => {
                if let Some(b) = self.boot_rom_byte(addr) {
                    return b;
                }
                self.cart.as_ref().map_or(0xFF, |c| c.read(addr))
            }
            0x8000..=0x9FFF => self.ppu.vram[self.ppu.vram_bank][(addr - 0x8000) as usize],
            0xA000..=0xBFFF => self.cart.as_ref().map_or(0xFF, |c| c.read(addr)),
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize],
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize],
            0xE000..=0xFDFF => self.read_byte(addr - 0x2000),
            0xFE00..=0xFE9F => self.ppu.oam[(addr - 0xFE00) as usize],
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => self.input.read(),
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.interrupts.read_flags(),
            0xFF10..=0xFF3F => self.apu.read(addr),
            0xFF46 => self.dma_reg,
            0xFF40..=0xFF4B => self.ppu.read_reg(addr),
            0xFF4D if self.cgb_mode => 0x7E | (self.key1 & 0x81),
            0xFF4F if self.cgb_mode => 0xFE | self.ppu.vram_bank as u8,
            0xFF55 if self.cgb_mode => {
                if self.hdma.active {
                    (self.hdma.blocks - 1) & 0x7F
                } else {
                    0xFF
                }
            }
            0xFF68..=0xFF6B => self.ppu.read_reg(addr),
            0xFF70 if self.cgb_mode => 0xF8 | self.wram_bank as u8,
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.interrupts.enable,
            _ => 0xFF,
        }
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                if let Some(cart) = &mut self.cart {
                    cart.write(addr, val);
                }
            }
            0x8000..=0x9FFF => {
                self.ppu.vram[self.ppu.vram_bank][(addr - 0x8000) as usize] = val;
            }
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize] = val,
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize] = val,
            0xE000..=0xFDFF => self.write_byte(addr - 0x2000, val),
            0xFE00..=0xFE9F => self.ppu.oam[(addr - 0xFE00) as usize] = val,
            0xFEA0..=0xFEFF => {}
            0xFF00 => self.input.write(val),
            0xFF01 | 0xFF02 => self.serial.write(addr, val),
            0xFF04..=0xFF07 => self.timer.write(addr, val),
            0xFF0F => self.interrupts.write_flags(val),
            0xFF10..=0xFF3F => self.apu.write(addr, val),
            0xFF46 => self.oam_dma(val),
            0xFF40..=0xFF4B => self.ppu.write_reg(addr, val),
            0xFF4D if self.cgb_mode => self.key1 = (self.key1 & 0x80) | (val & 0x01),
            0xFF4F if self.cgb_mode => self.ppu.vram_bank = (val & 0x01) as usize,
            0xFF50 => {
                if val != 0 {
                    self.unmap_boot_rom();
                }
            }
            0xFF51 if self.cgb_mode => self.hdma.src = (self.hdma.src & 0x00FF) | ((val as u16) << 8),
            0xFF52 if self.cgb_mode => self.hdma.src = (self.hdma.src & 0xFF00) | (val & 0xF0) as u16,
            0xFF53 if self.cgb_mode => {
                self.hdma.dst = Hdma::sanitize_dest((self.hdma.dst & 0x00FF) | ((val as u16) << 8));
            }
            0xFF54 if self.cgb_mode => {
                self.hdma.dst = Hdma::sanitize_dest((self.hdma.dst & 0xFF00) | val as u16);
            }
            0xFF55 if self.cgb_mode => self.write_hdma_control(val),
            0xFF68..=0xFF6B => self.ppu.write_reg(addr, val),
            0xFF70 if self.cgb_mode => {
                let bank = (val & 0x07) as usize;
                self.wram_bank = if bank == 0 { 1 } else { bank };
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.interrupts.enable = val,
            _ => {}
        }
    }

    pub fn read_word(&self, addr: u16) -> u16 {
        let lo = self.read_byte(addr) as u16;
        let hi = self.read_byte(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    pub fn write_word(&mut self, addr: u16, val: u16) {
        self.write_byte(addr, val as u8);
        self.write_byte(addr.wrapping_add(1), (val >> 8) as u8);
    }

    /// Copies 160 bytes from `val << 8` into OAM.
    fn oam_dma(&mut self, val: u8) {
        self.dma_reg = val;
        let src = (val as u16) << 8;
        for i in 0..OAM_DMA_LEN {
            self.ppu.oam[i as usize] = self.read_byte(src.wrapping_add(i));
        }
    }

    fn write_hdma_control(&mut self, val: u8) {
        if self.hdma.active && val & 0x80 == 0 {
            debug!("HDMA cancelled with {} blocks left", self.hdma.blocks);
            self.hdma.active = false;
            self.hdma.blocks = 0;
            return;
        }

        let blocks = (val & 0x7F) + 1;
        if val & 0x80 == 0 {
            trace!(
                "GDMA {:04X}->{:04X}, {} blocks",
                self.hdma.src, self.hdma.dst, blocks
            );
            for _ in 0..blocks {
                if !self.copy_hdma_block() {
                    break;
                }
            }
        } else {
            self.hdma.blocks = blocks;
            self.hdma.active = true;
        }
    }

    /// Copies one 16-byte block. Returns false once the destination has run
    /// off the end of VRAM, which ends the transfer.
    fn copy_hdma_block(&mut self) -> bool {
        for _ in 0..HDMA_BLOCK {
            let byte = self.read_byte(self.hdma.src);
            let dst = (self.hdma.dst - 0x8000) as usize;
            self.ppu.vram[self.ppu.vram_bank][dst] = byte;
            self.hdma.src = self.hdma.src.wrapping_add(1);
            self.hdma.dst += 1;
        }
        if self.hdma.dst > 0x9FFF {
            debug!("VRAM DMA stopped at the end of VRAM");
            self.hdma.dst = Hdma::sanitize_dest(self.hdma.dst);
            self.hdma.active = false;
            self.hdma.blocks = 0;
            return false;
        }
        true
    }

    /// Runs one pending HBlank DMA block.
    pub fn hdma_hblank_transfer(&mut self) {
        if !self.hdma.active {
            return;
        }
        trace!(
            "HDMA block {:04X}->{:04X}, {} left",
            self.hdma.src, self.hdma.dst, self.hdma.blocks
        );
        if self.copy_hdma_block() {
            self.hdma.blocks -= 1;
            if self.hdma.blocks == 0 {
                self.hdma.active = false;
            }
        }
    }

    pub fn hdma_active(&self) -> bool {
        self.hdma.active
    }

    pub fn take_serial(&mut self) -> Vec<u8> {
        self.serial.take_output()
    }

    /// Advance every peripheral by `cycles` CPU cycles.
    pub fn tick(&mut self, cycles: u32) {
        // The timer and serial clock follow the CPU; the rest run at the master rate.
        let hw_cycles = cycles / self.speed_factor();

        self.timer.step(cycles, &mut self.interrupts);
        self.serial.step(cycles, &mut self.interrupts);
        if self.ppu.step(hw_cycles, &mut self.interrupts) {
            self.hdma_hblank_transfer();
        }
        self.apu.step(hw_cycles);
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_ram_mirrors_wram() {
        let mut mmu = Mmu::new(false);
        mmu.write_byte(0xC123, 0x42);
        assert_eq!(mmu.read_byte(0xE123), 0x42);
        mmu.write_byte(0xFDFF, 0x99);
        assert_eq!(mmu.read_byte(0xDDFF), 0x99);
    }

    #[test]
    fn unusable_region_reads_ff() {
        let mut mmu = Mmu::new(false);
        mmu.write_byte(0xFEA0, 0x12);
        assert_eq!(mmu.read_byte(0xFEA0), 0xFF);
        assert_eq!(mmu.read_byte(0xFF7F), 0xFF);
    }

    #[test]
    fn if_reads_upper_bits_set() {
        let mut mmu = Mmu::new(false);
        mmu.write_byte(0xFF0F, 0x04);
        assert_eq!(mmu.read_byte(0xFF0F), 0xE4);
    }

    #[test]
    fn key1_switch_toggles_double_speed() {
        let mut mmu = Mmu::new(true);
        assert!(!mmu.try_speed_switch());
        mmu.write_byte(0xFF4D, 0x01);
        assert_eq!(mmu.read_byte(0xFF4D), 0x7F);
        assert!(mmu.try_speed_switch());
        assert_eq!(mmu.read_byte(0xFF4D), 0xFE);
        assert_eq!(mmu.speed_factor(), 2);
    }

    #[test]
    fn dmg_ignores_cgb_registers() {
        let mut mmu = Mmu::new(false);
        mmu.write_byte(0xFF70, 0x03);
        mmu.write_byte(0xFF4F, 0x01);
        assert_eq!(mmu.read_byte(0xFF70), 0xFF);
        assert_eq!(mmu.read_byte(0xFF4F), 0xFF);
        assert_eq!(mmu.wram_bank, 1);
        assert_eq!(mmu.ppu.vram_bank, 0);
    }
}
