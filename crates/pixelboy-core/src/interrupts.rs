/// Maskable interrupt sources in priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    VBlank,
    LcdStat,
    Timer,
    Serial,
    Joypad,
}

impl Interrupt {
    pub const ALL: [Interrupt; 5] = [
        Interrupt::VBlank,
        Interrupt::LcdStat,
        Interrupt::Timer,
        Interrupt::Serial,
        Interrupt::Joypad,
    ];

    #[inline]
    pub const fn bit(self) -> u8 {
        match self {
            Interrupt::VBlank => 0x01,
            Interrupt::LcdStat => 0x02,
            Interrupt::Timer => 0x04,
            Interrupt::Serial => 0x08,
            Interrupt::Joypad => 0x10,
        }
    }

    #[inline]
    pub const fn vector(self) -> u16 {
        match self {
            Interrupt::VBlank => 0x40,
            Interrupt::LcdStat => 0x48,
            Interrupt::Timer => 0x50,
            Interrupt::Serial => 0x58,
            Interrupt::Joypad => 0x60,
        }
    }
}

/// The IE/IF register pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupts {
    pub enable: u8,
    pub flags: u8,
}

impl Interrupts {
    pub fn new() -> Self {
        Self {
            enable: 0x00,
            flags: 0x01,
        }
    }

    #[inline]
    pub fn request(&mut self, interrupt: Interrupt) {
        self.flags |= interrupt.bit();
    }

    #[inline]
    pub fn acknowledge(&mut self, interrupt: Interrupt) {
        self.flags &= !interrupt.bit();
    }

    /// Requested and enabled sources.
    #[inline]
    pub fn pending(&self) -> u8 {
        self.flags & self.enable & 0x1F
    }

    pub fn highest_pending(&self) -> Option<Interrupt> {
        let pending = self.pending();
        Interrupt::ALL
            .into_iter()
            .find(|i| pending & i.bit() != 0)
    }

    pub fn read_flags(&self) -> u8 {
        self.flags | 0xE0
    }

    pub fn write_flags(&mut self, val: u8) {
        self.flags = val & 0x1F;
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}
