use crate::interrupts::{Interrupt, Interrupts};

/// Cycles per shifted bit with the internal 8192 Hz clock.
const BIT_CYCLES: u32 = 512;
/// CGB high-speed serial clock (SC bit 1).
const FAST_BIT_CYCLES: u32 = 16;

pub trait LinkPort: Send {
    /// Exchange one byte with the partner and return what it sent back.
    fn transfer(&mut self, byte: u8) -> u8;
}

/// Link port with no cable attached. Incoming bits are all 1 unless
/// `loopback` echoes the outgoing byte.
#[derive(Default)]
pub struct NullLinkPort {
    loopback: bool,
}

impl NullLinkPort {
    pub fn new(loopback: bool) -> Self {
        Self { loopback }
    }
}

impl LinkPort for NullLinkPort {
    fn transfer(&mut self, byte: u8) -> u8 {
        if self.loopback { byte } else { 0xFF }
    }
}

/// SB/SC registers; only internally clocked transfers make progress.
pub struct Serial {
    sb: u8,
    sc: u8,
    out_buf: Vec<u8>,
    port: Box<dyn LinkPort>,
    remaining_cycles: Option<u32>,
    cgb: bool,
}

impl Serial {
    pub fn new(cgb: bool) -> Self {
        Self {
            sb: 0,
            sc: 0,
            out_buf: Vec::new(),
            port: Box::new(NullLinkPort::default()),
            remaining_cycles: None,
            cgb,
        }
    }

    pub fn connect(&mut self, port: Box<dyn LinkPort>) {
        self.port = port;
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF01 => self.sb,
            0xFF02 => {
                if self.cgb {
                    self.sc | 0x7C
                } else {
                    self.sc | 0x7E
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF01 => self.sb = val,
            0xFF02 => {
                self.sc = if self.cgb { val & 0x83 } else { val & 0x81 };
                if self.sc & 0x81 == 0x81 {
                    let per_bit = if self.sc & 0x02 != 0 {
                        FAST_BIT_CYCLES
                    } else {
                        BIT_CYCLES
                    };
                    self.remaining_cycles = Some(per_bit * 8);
                } else {
                    self.remaining_cycles = None;
                }
            }
            _ => {}
        }
    }

    pub fn step(&mut self, cycles: u32, interrupts: &mut Interrupts) {
        let Some(remaining) = self.remaining_cycles else {
            return;
        };
        if remaining > cycles {
            self.remaining_cycles = Some(remaining - cycles);
            return;
        }

        self.remaining_cycles = None;
        self.out_buf.push(self.sb);
        self.sb = self.port.transfer(self.sb);
        self.sc &= 0x7F;
        interrupts.request(Interrupt::Serial);
    }

    /// Bytes shifted out since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out_buf)
    }

    pub fn peek_output(&self) -> &[u8] {
        &self.out_buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_transfer_completes_after_eight_bits() {
        let mut ints = Interrupts::new();
        ints.flags = 0;
        let mut serial = Serial::new(false);
        serial.write(0xFF01, b'A');
        serial.write(0xFF02, 0x81);

        serial.step(BIT_CYCLES * 8 - 4, &mut ints);
        assert_eq!(ints.flags, 0);
        assert_eq!(serial.read(0xFF02) & 0x80, 0x80);

        serial.step(4, &mut ints);
        assert_eq!(ints.flags, Interrupt::Serial.bit());
        assert_eq!(serial.read(0xFF02) & 0x80, 0);
        assert_eq!(serial.read(0xFF01), 0xFF);
        assert_eq!(serial.take_output(), b"A");
        assert!(serial.peek_output().is_empty());
    }

    #[test]
    fn external_clock_never_completes() {
        let mut ints = Interrupts::new();
        ints.flags = 0;
        let mut serial = Serial::new(false);
        serial.write(0xFF02, 0x80);
        serial.step(100_000, &mut ints);
        assert_eq!(ints.flags, 0);
    }

    #[test]
    fn loopback_port_echoes() {
        let mut ints = Interrupts::new();
        let mut serial = Serial::new(true);
        serial.connect(Box::new(NullLinkPort::new(true)));
        serial.write(0xFF01, 0x5A);
        serial.write(0xFF02, 0x83);
        serial.step(FAST_BIT_CYCLES * 8, &mut ints);
        assert_eq!(serial.read(0xFF01), 0x5A);
    }
}
