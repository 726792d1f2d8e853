use crate::interrupts::{Interrupt, Interrupts};

const DIV_PERIOD: u32 = 256;

/// Cycles per TIMA increment for TAC bits 0-1.
const TIMA_PERIODS: [u32; 4] = [1024, 16, 64, 256];

/// DIV/TIMA/TMA/TAC, modelled as two cycle accumulators.
#[derive(Debug, Clone)]
pub struct Timer {
    pub div: u8,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
    div_cycles: u32,
    tima_cycles: u32,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            div: 0,
            tima: 0,
            tma: 0,
            tac: 0,
            div_cycles: 0,
            tima_cycles: 0,
        }
    }

    #[inline]
    fn enabled(&self) -> bool {
        self.tac & 0x04 != 0
    }

    #[inline]
    fn period(&self) -> u32 {
        TIMA_PERIODS[(self.tac & 0x03) as usize]
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF04 => self.div,
            0xFF05 => self.tima,
            0xFF06 => self.tma,
            0xFF07 => self.tac | 0xF8,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF04 => {
                self.div = 0;
                self.div_cycles = 0;
                self.tima_cycles = 0;
            }
            0xFF05 => self.tima = val,
            0xFF06 => self.tma = val,
            0xFF07 => {
                let old_rate = self.tac & 0x03;
                self.tac = val & 0x07;
                if self.tac & 0x03 != old_rate {
                    self.tima_cycles = 0;
                }
            }
            _ => {}
        }
    }

    /// Advance by `cycles` CPU cycles.
    pub fn step(&mut self, cycles: u32, interrupts: &mut Interrupts) {
        self.div_cycles += cycles;
        while self.div_cycles >= DIV_PERIOD {
            self.div_cycles -= DIV_PERIOD;
            self.div = self.div.wrapping_add(1);
        }

        if !self.enabled() {
            return;
        }

        let period = self.period();
        self.tima_cycles += cycles;
        while self.tima_cycles >= period {
            self.tima_cycles -= period;
            let (next, overflow) = self.tima.overflowing_add(1);
            if overflow {
                self.tima = self.tma;
                interrupts.request(Interrupt::Timer);
            } else {
                self.tima = next;
            }
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
