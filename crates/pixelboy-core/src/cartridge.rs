use log::{info, warn};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;
const HEADER_END: usize = 0x150;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CartridgeError {
    #[error("ROM image is {0} bytes, too small to hold a cartridge header")]
    TooSmall(usize),
    #[error("unsupported cartridge type 0x{0:02X}")]
    UnsupportedMbc(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc3,
    Mbc5,
}

/// Decoded cartridge header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub title: String,
    pub cgb_flag: u8,
    pub cart_type: u8,
    pub rom_size_code: u8,
    pub ram_size_code: u8,
}

impl Header {
    pub fn parse(rom: &[u8]) -> Result<Self, CartridgeError> {
        if rom.len() < HEADER_END {
            return Err(CartridgeError::TooSmall(rom.len()));
        }

        let mut title = &rom[0x134..0x143];
        if let Some(pos) = title.iter().position(|&b| b == 0) {
            title = &title[..pos];
        }
        let title = title
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect::<String>()
            .trim()
            .to_string();

        Ok(Self {
            title,
            cgb_flag: rom[0x143],
            cart_type: rom[0x147],
            rom_size_code: rom[0x148],
            ram_size_code: rom[0x149],
        })
    }

    pub fn mbc_type(&self) -> Result<MbcType, CartridgeError> {
        match self.cart_type {
            0x00 | 0x08 | 0x09 => Ok(MbcType::NoMbc),
            0x01..=0x03 => Ok(MbcType::Mbc1),
            0x0F..=0x13 => Ok(MbcType::Mbc3),
            0x19..=0x1E => Ok(MbcType::Mbc5),
            other => Err(CartridgeError::UnsupportedMbc(other)),
        }
    }

    pub fn cgb_supported(&self) -> bool {
        self.cgb_flag & 0x80 != 0
    }

    /// 2^(code+1) banks of 16 KiB.
    pub fn rom_banks(&self) -> usize {
        2usize << self.rom_size_code.min(8)
    }

    pub fn ram_banks(&self) -> usize {
        match self.ram_size_code {
            0x01 | 0x02 => 1,
            0x03 => 4,
            0x04 => 16,
            0x05 => 8,
            _ => 0,
        }
    }

    /// On-board RAM size in bytes. Code 1 is a single 2 KiB chip.
    pub fn ram_size(&self) -> usize {
        match self.ram_size_code {
            0x01 => 0x800,
            _ => self.ram_banks() * RAM_BANK_SIZE,
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.cart_type,
            0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
        )
    }

    pub fn has_rtc(&self) -> bool {
        matches!(self.cart_type, 0x0F | 0x10)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }

    fn advance(&mut self, seconds: u64) {
        // Whole days in one step; the 9-bit day counter wraps into the carry flag.
        let days = u64::from(self.days) + seconds / 86_400;
        if days > 0x1FF {
            self.carry = true;
        }
        self.days = (days & 0x1FF) as u16;
        for _ in 0..seconds % 86_400 {
            self.second_tick();
        }
    }

    fn second_tick(&mut self) {
        // Counters written out of range keep counting until they wrap their bit width.
        if self.seconds == 59 {
            self.seconds = 0;
            self.minute_tick();
        } else {
            self.seconds = (self.seconds + 1) & 0x3F;
        }
    }

    fn minute_tick(&mut self) {
        if self.minutes == 59 {
            self.minutes = 0;
            self.hour_tick();
        } else {
            self.minutes = (self.minutes + 1) & 0x3F;
        }
    }

    fn hour_tick(&mut self) {
        if self.hours == 23 {
            self.hours = 0;
            self.day_tick();
        } else {
            self.hours = (self.hours + 1) & 0x1F;
        }
    }

    fn day_tick(&mut self) {
        if self.days >= 0x1FF {
            self.days = 0;
            self.carry = true;
        } else {
            self.days += 1;
        }
    }
}

/// Wall-clock source for the MBC3 real-time clock.
pub trait RtcClock: Send + fmt::Debug {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl RtcClock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

const RTC_MAGIC: &[u8; 4] = b"RTC1";
const RTC_VERSION: u8 = 1;
const RTC_BLOB_LEN: usize = 4 + 1 + 8 + 4 + 5 + 1;

/// MBC3 clock: live counters that follow wall-clock time, plus the latched
/// copy the game reads back.
#[derive(Debug)]
struct Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    /// Instant at which `regs` was last brought up to date.
    synced_at: SystemTime,
    /// Time accumulated toward the next whole second.
    subsecond: Duration,
    clock: Box<dyn RtcClock>,
}

impl Rtc {
    fn new(clock: Box<dyn RtcClock>) -> Self {
        Self {
            regs: RtcRegisters::default(),
            latched: RtcRegisters::default(),
            synced_at: clock.now(),
            subsecond: Duration::ZERO,
            clock,
        }
    }

    fn set_clock(&mut self, clock: Box<dyn RtcClock>) {
        self.sync();
        self.synced_at = clock.now();
        self.clock = clock;
    }

    /// Live counters as they stand at `now`, without committing them.
    fn counters_at(&self, now: SystemTime) -> (RtcRegisters, Duration) {
        let mut regs = self.regs;
        if regs.halt {
            return (regs, self.subsecond);
        }
        let total = self.subsecond + now.duration_since(self.synced_at).unwrap_or_default();
        regs.advance(total.as_secs());
        (regs, Duration::from_nanos(u64::from(total.subsec_nanos())))
    }

    fn sync_to(&mut self, now: SystemTime) {
        (self.regs, self.subsecond) = self.counters_at(now);
        self.synced_at = now;
    }

    fn sync(&mut self) {
        let now = self.clock.now();
        self.sync_to(now);
    }

    fn latch(&mut self) {
        self.sync();
        self.latched = self.regs;
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds,
            0x09 => self.latched.minutes,
            0x0A => self.latched.hours,
            0x0B => self.latched.days as u8,
            0x0C => self.latched.control_byte(),
            _ => 0xFF,
        }
    }

    fn write(&mut self, reg: u8, val: u8) {
        // Time that passed under the old values counts before the write lands.
        self.sync();
        match reg {
            0x08 => {
                self.regs.seconds = val & 0x3F;
                self.subsecond = Duration::ZERO;
            }
            0x09 => self.regs.minutes = val & 0x3F,
            0x0A => self.regs.hours = val & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x100) | val as u16,
            0x0C => {
                self.regs.days = (self.regs.days & 0xFF) | (((val & 0x01) as u16) << 8);
                self.regs.halt = val & 0x40 != 0;
                self.regs.carry = val & 0x80 != 0;
            }
            _ => {}
        }
    }

    fn serialize(&self, now: SystemTime) -> Vec<u8> {
        let (regs, subsecond) = self.counters_at(now);
        let mut data = Vec::with_capacity(RTC_BLOB_LEN);
        data.extend_from_slice(RTC_MAGIC);
        data.push(RTC_VERSION);
        let saved = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        data.extend_from_slice(&saved.to_le_bytes());
        data.extend_from_slice(&subsecond.subsec_nanos().to_le_bytes());
        data.push(regs.seconds);
        data.push(regs.minutes);
        data.push(regs.hours);
        data.extend_from_slice(&regs.days.to_le_bytes());
        let mut flags = 0u8;
        if regs.halt {
            flags |= 0x01;
        }
        if regs.carry {
            flags |= 0x02;
        }
        data.push(flags);
        data
    }

    /// Restores counters and fast-forwards them by the wall-clock time that
    /// passed since the blob was written. A rejected blob leaves the clock as it was.
    fn restore(&mut self, data: &[u8], now: SystemTime) -> bool {
        if data.len() < RTC_BLOB_LEN || &data[..4] != RTC_MAGIC || data[4] != RTC_VERSION {
            return false;
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&data[5..13]);
        let Some(saved) = UNIX_EPOCH.checked_add(Duration::from_secs(u64::from_le_bytes(secs)))
        else {
            return false;
        };
        let mut nanos = [0u8; 4];
        nanos.copy_from_slice(&data[13..17]);

        self.regs = RtcRegisters {
            seconds: data[17] & 0x3F,
            minutes: data[18] & 0x3F,
            hours: data[19] & 0x1F,
            days: u16::from_le_bytes([data[20], data[21]]) & 0x1FF,
            halt: data[22] & 0x01 != 0,
            carry: data[22] & 0x02 != 0,
        };
        self.subsecond = Duration::from_nanos(u64::from(u32::from_le_bytes(nanos) % 1_000_000_000));
        self.synced_at = saved;
        self.sync_to(now);
        self.latched = self.regs;
        true
    }
}

#[derive(Debug)]
enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        upper: u8,
        mode: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_armed: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

/// A loaded cartridge: ROM image, external RAM and bank controller state.
#[derive(Debug)]
pub struct Cartridge {
    rom: Vec<u8>,
    ram: Vec<u8>,
    header: Header,
    mbc: MbcType,
    rom_banks: usize,
    ram_banks: usize,
    state: MbcState,
}

impl Cartridge {
    pub fn load(rom: Vec<u8>) -> Result<Self, CartridgeError> {
        let header = Header::parse(&rom)?;
        let mbc = header.mbc_type()?;

        let state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                upper: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: header
                    .has_rtc()
                    .then(|| Rtc::new(Box::new(SystemClock))),
                latch_armed: false,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        };

        info!(
            "Loaded cartridge \"{}\" (type 0x{:02X}, {:?}, CGB: {})",
            header.title,
            header.cart_type,
            mbc,
            if header.cgb_supported() { "yes" } else { "no" }
        );

        Ok(Self {
            ram: vec![0; header.ram_size()],
            rom_banks: header.rom_banks(),
            ram_banks: header.ram_banks(),
            rom,
            header,
            mbc,
            state,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn title(&self) -> &str {
        &self.header.title
    }

    pub fn mbc(&self) -> MbcType {
        self.mbc
    }

    pub fn cgb(&self) -> bool {
        self.header.cgb_supported()
    }

    pub fn has_battery(&self) -> bool {
        self.header.has_battery()
    }

    pub fn has_rtc(&self) -> bool {
        self.rtc().is_some()
    }

    /// Bank currently mapped at 4000-7FFF, after wrapping.
    pub fn current_rom_bank(&self) -> usize {
        let raw = match &self.state {
            MbcState::NoMbc => 1,
            MbcState::Mbc1 { rom_bank, upper, .. } => {
                ((*upper as usize) << 5) | (*rom_bank as usize)
            }
            MbcState::Mbc3 { rom_bank, .. } => *rom_bank as usize,
            MbcState::Mbc5 { rom_bank, .. } => *rom_bank as usize,
        };
        raw % self.rom_banks
    }

    fn low_rom_bank(&self) -> usize {
        match &self.state {
            MbcState::Mbc1 { upper, mode: 1, .. } => ((*upper as usize) << 5) % self.rom_banks,
            _ => 0,
        }
    }

    fn rom_byte(&self, bank: usize, addr: u16) -> u8 {
        let offset = bank * ROM_BANK_SIZE + (addr as usize & (ROM_BANK_SIZE - 1));
        self.rom.get(offset).copied().unwrap_or(0xFF)
    }

    fn ram_offset(&self, bank: usize, addr: u16) -> Option<usize> {
        if self.ram.is_empty() {
            return None;
        }
        let bank = if self.ram_banks == 0 {
            0
        } else {
            bank % self.ram_banks
        };
        Some((bank * RAM_BANK_SIZE + (addr as usize - 0xA000)) % self.ram.len())
    }

    /// Bank selected for A000-BFFF, or `None` when RAM is disabled or an
    /// RTC register is mapped.
    fn active_ram_bank(&self) -> Option<usize> {
        match &self.state {
            MbcState::NoMbc => Some(0),
            MbcState::Mbc1 {
                upper,
                mode,
                ram_enable,
                ..
            } => ram_enable.then_some(if *mode == 1 { *upper as usize } else { 0 }),
            MbcState::Mbc3 {
                ram_bank,
                ram_enable,
                ..
            } => (*ram_enable && *ram_bank <= 0x03).then_some(*ram_bank as usize),
            MbcState::Mbc5 {
                ram_bank,
                ram_enable,
                ..
            } => ram_enable.then_some(*ram_bank as usize),
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x3FFF => self.rom_byte(self.low_rom_bank(), addr),
            0x4000..=0x7FFF => self.rom_byte(self.current_rom_bank(), addr),
            0xA000..=0xBFFF => {
                if let MbcState::Mbc3 {
                    ram_enable: true,
                    ram_bank: reg @ 0x08..=0x0C,
                    rtc: Some(rtc),
                    ..
                } = &self.state
                {
                    return rtc.read(*reg);
                }
                self.active_ram_bank()
                    .and_then(|bank| self.ram_offset(bank, addr))
                    .map_or(0xFF, |idx| self.ram[idx])
            }
            _ => 0xFF,
        }
    }

    /// Bank controller register write (0000-7FFF).
    pub fn write_rom(&mut self, addr: u16, val: u8) {
        match &mut self.state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank,
                upper,
                mode,
                ram_enable,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => *rom_bank = (val & 0x1F).max(1),
                0x4000..=0x5FFF => *upper = val & 0x03,
                0x6000..=0x7FFF => *mode = val & 0x01,
                _ => {}
            },
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                rtc,
                latch_armed,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => *rom_bank = (val & 0x7F).max(1),
                0x4000..=0x5FFF => *ram_bank = val,
                0x6000..=0x7FFF => {
                    if *latch_armed
                        && val == 1
                        && let Some(rtc) = rtc
                    {
                        rtc.latch();
                    }
                    *latch_armed = val == 0;
                }
                _ => {}
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => match addr {
                0x0000..=0x1FFF => *ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x2FFF => *rom_bank = (*rom_bank & 0x100) | val as u16,
                0x3000..=0x3FFF => *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8),
                0x4000..=0x5FFF => *ram_bank = val & 0x0F,
                _ => {}
            },
        }
    }

    /// External RAM or RTC register write (A000-BFFF).
    pub fn write_ram(&mut self, addr: u16, val: u8) {
        if let MbcState::Mbc3 {
            ram_enable: true,
            ram_bank: reg @ 0x08..=0x0C,
            rtc: Some(rtc),
            ..
        } = &mut self.state
        {
            rtc.write(*reg, val);
            return;
        }
        if let Some(idx) = self
            .active_ram_bank()
            .and_then(|bank| self.ram_offset(bank, addr))
        {
            self.ram[idx] = val;
        }
    }

    /// Dispatches a CPU write anywhere in the cartridge's address space.
    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF => self.write_rom(addr, val),
            0xA000..=0xBFFF => self.write_ram(addr, val),
            _ => {}
        }
    }

    /// Replaces the wall-clock source behind the MBC3 clock. Returns false
    /// when the cartridge has no clock.
    pub fn set_rtc_clock(&mut self, clock: Box<dyn RtcClock>) -> bool {
        match self.rtc_mut() {
            Some(rtc) => {
                rtc.set_clock(clock);
                true
            }
            None => false,
        }
    }

    fn rtc(&self) -> Option<&Rtc> {
        match &self.state {
            MbcState::Mbc3 { rtc, .. } => rtc.as_ref(),
            _ => None,
        }
    }

    fn rtc_mut(&mut self) -> Option<&mut Rtc> {
        match &mut self.state {
            MbcState::Mbc3 { rtc, .. } => rtc.as_mut(),
            _ => None,
        }
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Copies a save blob into external RAM. Extra bytes are ignored and a
    /// short blob leaves the tail untouched.
    pub fn load_ram(&mut self, blob: &[u8]) {
        if blob.len() != self.ram.len() {
            warn!(
                "Save data is {} bytes, cartridge RAM is {} bytes",
                blob.len(),
                self.ram.len()
            );
        }
        let n = blob.len().min(self.ram.len());
        self.ram[..n].copy_from_slice(&blob[..n]);
    }

    pub fn rtc_state(&self) -> Option<Vec<u8>> {
        self.rtc().map(|rtc| rtc.serialize(rtc.clock.now()))
    }

    pub fn rtc_state_at(&self, now: SystemTime) -> Option<Vec<u8>> {
        self.rtc().map(|rtc| rtc.serialize(now))
    }

    /// Returns false when the blob is malformed or the cartridge has no clock.
    pub fn load_rtc_state(&mut self, blob: &[u8]) -> bool {
        let Some(now) = self.rtc().map(|rtc| rtc.clock.now()) else {
            return false;
        };
        self.load_rtc_state_at(blob, now)
    }

    pub fn load_rtc_state_at(&mut self, blob: &[u8], now: SystemTime) -> bool {
        let Some(rtc) = self.rtc_mut() else {
            return false;
        };
        let ok = rtc.restore(blob, now);
        if !ok {
            warn!("Ignoring malformed RTC state ({} bytes)", blob.len());
        }
        ok
    }
}
