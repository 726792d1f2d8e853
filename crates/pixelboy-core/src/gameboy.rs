use log::warn;

use crate::{
    audio_queue::AudioConsumer,
    cartridge::Cartridge,
    config::EmulatorConfig,
    cpu::{Cpu, IllegalOpcode},
    hardware::{IllegalOpcodePolicy, Model},
    input::Button,
    mmu::Mmu,
    ppu::DMG_PALETTE,
};

/// Master cycles in one 154-line frame.
pub const FRAME_CYCLES: u32 = 70_224;
const LOCKED_IDLE_CYCLES: u32 = 4;

pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
    pub cgb: bool,
    config: EmulatorConfig,
    /// Set once an undefined opcode froze the CPU under `LockUp`.
    locked: bool,
    illegal_warned: bool,
}

impl GameBoy {
    pub fn new(config: EmulatorConfig) -> Self {
        let cgb = config.model == Model::Cgb;
        let mut gb = Self {
            cpu: Cpu::post_boot(cgb),
            mmu: Mmu::new(cgb),
            cgb,
            config,
            locked: false,
            illegal_warned: false,
        };
        gb.reset();
        gb
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Inserts a cartridge, picks the model for it and resets.
    pub fn load_cartridge(&mut self, cart: Cartridge) {
        self.cgb = self.config.model.resolve(cart.header().cgb_flag);
        self.mmu.cart = Some(cart);
        self.reset();
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.mmu.cart.as_ref()
    }

    /// Maps a boot ROM and restarts execution at 0x0000.
    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.mmu.boot_rom = Some(data);
        self.reset();
    }

    /// Rebuilds all machine state while keeping the cartridge, boot ROM and
    /// audio queue.
    pub fn reset(&mut self) {
        let cart = self.mmu.cart.take();
        let boot = self.mmu.boot_rom.take();
        let audio = self.mmu.apu.take_output();
        let sample_rate = self.mmu.apu.sample_rate();

        self.mmu = Mmu::new(self.cgb);
        if let Some(cart) = cart {
            self.mmu.load_cart(cart);
        }
        match boot {
            Some(boot) => {
                self.mmu.load_boot_rom(boot);
                self.cpu = Cpu::new();
            }
            None => {
                self.mmu.apply_post_boot_state();
                self.cpu = Cpu::post_boot(self.cgb);
            }
        }
        self.cpu.halt_bug_enabled = self.config.halt_bug;
        self.mmu
            .ppu
            .set_dmg_palette(self.config.dmg_palette.unwrap_or(DMG_PALETTE));
        if let Some(producer) = audio {
            self.mmu.apu.attach_output(producer, sample_rate);
        }
        self.locked = false;
        self.illegal_warned = false;
    }

    /// Runs one CPU step and advances every peripheral by the cycles it took.
    pub fn step(&mut self) -> Result<u32, IllegalOpcode> {
        if self.locked {
            self.mmu.tick(LOCKED_IDLE_CYCLES);
            return Ok(LOCKED_IDLE_CYCLES);
        }

        let cycles = match self.cpu.step(&mut self.mmu) {
            Ok(cycles) => cycles,
            Err(err) => self.handle_illegal(err)?,
        };

        if self.mmu.boot_mapped && self.cpu.pc == 0x0100 {
            self.mmu.unmap_boot_rom();
        }
        self.mmu.tick(cycles);
        Ok(cycles)
    }

    fn handle_illegal(&mut self, err: IllegalOpcode) -> Result<u32, IllegalOpcode> {
        match self.config.illegal_opcode {
            IllegalOpcodePolicy::Fatal => {
                warn!("{err}");
                Err(err)
            }
            IllegalOpcodePolicy::LockUp => {
                warn!("{err}, CPU locked up");
                self.locked = true;
                Ok(LOCKED_IDLE_CYCLES)
            }
            IllegalOpcodePolicy::Nop => {
                if !self.illegal_warned {
                    warn!("{err}, treating as NOP");
                    self.illegal_warned = true;
                }
                Ok(LOCKED_IDLE_CYCLES)
            }
        }
    }

    /// Steps until the PPU finishes a frame. With the LCD off this returns
    /// after one frame's worth of cycles.
    pub fn run_frame(&mut self) -> Result<u32, IllegalOpcode> {
        let mut elapsed = 0u32;
        loop {
            elapsed += self.step()?;
            if self.mmu.ppu.frame_ready() {
                self.mmu.ppu.clear_frame_flag();
                break;
            }
            if !self.mmu.ppu.lcd_enabled() && elapsed >= FRAME_CYCLES * self.speed_factor() {
                break;
            }
        }
        self.mmu.apu.flush_output();
        Ok(elapsed)
    }

    pub fn is_locked_up(&self) -> bool {
        self.locked
    }

    pub fn speed_factor(&self) -> u32 {
        self.mmu.speed_factor()
    }

    /// 160x144 pixels in 0x00RRGGBB order.
    pub fn framebuffer(&self) -> &[u32] {
        self.mmu.ppu.framebuffer()
    }

    pub fn press(&mut self, button: Button) {
        self.mmu.input.press(button, &mut self.mmu.interrupts);
    }

    pub fn release(&mut self, button: Button) {
        self.mmu.input.release(button);
    }

    /// Starts audio output with the configured rate and queue size.
    pub fn enable_audio(&mut self) -> AudioConsumer {
        self.mmu
            .apu
            .enable_output(self.config.sample_rate, self.config.audio_buffer_frames)
    }

    /// Stops producing samples; the consumer side sees no new frames.
    pub fn disable_audio(&mut self) {
        self.mmu.apu.disable_output();
    }

    /// Bytes sent over the link port since the last call.
    pub fn take_serial(&mut self) -> Vec<u8> {
        self.mmu.take_serial()
    }

    /// Battery-backed RAM, if the cartridge has any.
    pub fn save_ram(&self) -> Option<Vec<u8>> {
        self.mmu
            .cart
            .as_ref()
            .filter(|c| c.has_battery() && !c.ram().is_empty())
            .map(|c| c.ram().to_vec())
    }

    pub fn load_ram(&mut self, blob: &[u8]) {
        if let Some(cart) = &mut self.mmu.cart {
            cart.load_ram(blob);
        }
    }

    pub fn rtc_state(&self) -> Option<Vec<u8>> {
        self.mmu.cart.as_ref().and_then(Cartridge::rtc_state)
    }

    pub fn load_rtc_state(&mut self, blob: &[u8]) -> bool {
        self.mmu
            .cart
            .as_mut()
            .is_some_and(|cart| cart.load_rtc_state(blob))
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}
