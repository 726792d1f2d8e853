use crate::audio_queue::{AudioConsumer, AudioProducer, audio_queue};
use crate::hardware::CPU_CLOCK_HZ;

// 512 Hz frame sequencer tick (not doubled in CGB mode)
const FRAME_SEQUENCER_PERIOD: u32 = 8192;
const VOLUME_FACTOR: i16 = 64;
// Frames buffered inside the APU before they are handed to the queue.
const OUTPUT_BATCH: usize = 64;

// Duty table for pulse channels (CH1, CH2), indexed by NRx1 bits 6-7:
// 0 -> 00000001 (12.5%)
// 1 -> 10000001 (25%)
// 2 -> 10000111 (50%)
// 3 -> 01111110 (75%)
const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 1],
    [1, 0, 0, 0, 0, 0, 0, 1],
    [1, 0, 0, 0, 0, 1, 1, 1],
    [0, 1, 1, 1, 1, 1, 1, 0],
];

const NOISE_DIVISORS: [u32; 8] = [8, 16, 32, 48, 64, 80, 96, 112];

#[derive(Default, Clone, Copy)]
struct Envelope {
    initial: u8,
    period: u8,
    add: bool,
    volume: u8,
    timer: u8,
}

impl Envelope {
    fn write(&mut self, val: u8) {
        self.initial = val >> 4;
        self.add = val & 0x08 != 0;
        self.period = val & 0x07;
    }

    fn reg(&self) -> u8 {
        (self.initial << 4) | (if self.add { 0x08 } else { 0 }) | self.period
    }

    /// The DAC is powered whenever NRx2 bits 3-7 are not all zero.
    fn dac_enabled(&self) -> bool {
        self.initial != 0 || self.add
    }

    fn trigger(&mut self) {
        self.volume = self.initial;
        self.timer = self.period;
    }

    fn clock(&mut self) {
        if self.period == 0 {
            return;
        }
        self.timer = self.timer.saturating_sub(1);
        if self.timer == 0 {
            self.timer = self.period;
            if self.add && self.volume < 15 {
                self.volume += 1;
            } else if !self.add && self.volume > 0 {
                self.volume -= 1;
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Length {
    counter: u16,
    enabled: bool,
    max: u16,
}

impl Length {
    fn new(max: u16) -> Self {
        Self {
            counter: 0,
            enabled: false,
            max,
        }
    }

    fn load(&mut self, val: u8) {
        self.counter = self.max - (val as u16 & (self.max - 1));
    }

    fn trigger(&mut self) {
        if self.counter == 0 {
            self.counter = self.max;
        }
    }

    /// Returns true when the counter just ran out.
    fn clock(&mut self) -> bool {
        if self.enabled && self.counter > 0 {
            self.counter -= 1;
            return self.counter == 0;
        }
        false
    }
}

#[derive(Default)]
// Channel 1 frequency sweep.
struct Sweep {
    period: u8,
    negate: bool,
    shift: u8,
    timer: u8,
    shadow: u16,
    enabled: bool,
}

impl Sweep {
    fn write(&mut self, val: u8) {
        self.period = (val >> 4) & 0x07;
        self.negate = val & 0x08 != 0;
        self.shift = val & 0x07;
    }

    fn reg(&self) -> u8 {
        (self.period << 4) | (if self.negate { 0x08 } else { 0 }) | self.shift
    }

    fn calculate(&self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow + delta
        }
    }

    fn reload_timer(&mut self) {
        self.timer = if self.period == 0 { 8 } else { self.period };
    }
}

struct SquareChannel {
    enabled: bool,
    duty: u8,
    duty_pos: usize,
    frequency: u16,
    timer: i32,
    length: Length,
    envelope: Envelope,
    sweep: Option<Sweep>,
}

impl SquareChannel {
    fn new(with_sweep: bool) -> Self {
        Self {
            enabled: false,
            duty: 0,
            duty_pos: 0,
            frequency: 0,
            timer: 0,
            length: Length::new(64),
            envelope: Envelope::default(),
            sweep: with_sweep.then(Sweep::default),
        }
    }

    fn period(&self) -> i32 {
        (2048 - self.frequency as i32) * 4
    }

    /// `reg` is 0-4 for NRx0..NRx4.
    fn write(&mut self, reg: u8, val: u8) {
        match reg {
            0 => {
                if let Some(sweep) = self.sweep.as_mut() {
                    sweep.write(val);
                }
            }
            1 => {
                self.duty = val >> 6;
                self.length.load(val & 0x3F);
            }
            2 => {
                self.envelope.write(val);
                if !self.envelope.dac_enabled() {
                    self.enabled = false;
                }
            }
            3 => self.frequency = (self.frequency & 0x700) | val as u16,
            4 => {
                self.frequency = (self.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                self.length.enabled = val & 0x40 != 0;
                if val & 0x80 != 0 {
                    self.trigger();
                }
            }
            _ => {}
        }
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0 => self.sweep.as_ref().map_or(0xFF, Sweep::reg),
            1 => self.duty << 6,
            2 => self.envelope.reg(),
            4 => {
                if self.length.enabled {
                    0x40
                } else {
                    0
                }
            }
            _ => 0xFF,
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.envelope.dac_enabled();
        self.length.trigger();
        self.timer = self.period();
        self.envelope.trigger();

        if let Some(sweep) = self.sweep.as_mut() {
            sweep.shadow = self.frequency;
            sweep.reload_timer();
            sweep.enabled = sweep.period > 0 || sweep.shift > 0;
            if sweep.shift > 0 && sweep.calculate() > 2047 {
                self.enabled = false;
            }
        }
    }

    fn step(&mut self, cycles: u32) {
        self.timer -= cycles as i32;
        while self.timer <= 0 {
            self.timer += self.period();
            self.duty_pos = (self.duty_pos + 1) & 7;
        }
    }

    fn clock_length(&mut self) {
        if self.length.clock() {
            self.enabled = false;
        }
    }

    fn clock_envelope(&mut self) {
        self.envelope.clock();
    }

    fn clock_sweep(&mut self) {
        let Some(sweep) = self.sweep.as_mut() else {
            return;
        };
        sweep.timer = sweep.timer.saturating_sub(1);
        if sweep.timer != 0 {
            return;
        }
        sweep.reload_timer();
        if !sweep.enabled || sweep.period == 0 {
            return;
        }

        let next = sweep.calculate();
        if next > 2047 {
            self.enabled = false;
            return;
        }
        if sweep.shift > 0 {
            sweep.shadow = next;
            self.frequency = next;
            if sweep.calculate() > 2047 {
                self.enabled = false;
            }
        }
    }

    fn amplitude(&self) -> u8 {
        if self.enabled && DUTY_TABLE[self.duty as usize][self.duty_pos] == 1 {
            self.envelope.volume
        } else {
            0
        }
    }

    fn dac_enabled(&self) -> bool {
        self.envelope.dac_enabled()
    }
}

struct WaveChannel {
    enabled: bool,
    dac_enabled: bool,
    output_level: u8,
    frequency: u16,
    timer: i32,
    position: usize,
    sample: u8,
    length: Length,
    ram: [u8; 0x10],
}

impl WaveChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            dac_enabled: false,
            output_level: 0,
            frequency: 0,
            timer: 0,
            position: 0,
            sample: 0,
            length: Length::new(256),
            ram: [0; 0x10],
        }
    }

    fn period(&self) -> i32 {
        (2048 - self.frequency as i32) * 2
    }

    fn write(&mut self, reg: u8, val: u8) {
        match reg {
            0 => {
                self.dac_enabled = val & 0x80 != 0;
                if !self.dac_enabled {
                    self.enabled = false;
                }
            }
            1 => self.length.load(val),
            2 => self.output_level = (val >> 5) & 0x03,
            3 => self.frequency = (self.frequency & 0x700) | val as u16,
            4 => {
                self.frequency = (self.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                self.length.enabled = val & 0x40 != 0;
                if val & 0x80 != 0 {
                    self.trigger();
                }
            }
            _ => {}
        }
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0 => {
                if self.dac_enabled {
                    0x80
                } else {
                    0
                }
            }
            2 => self.output_level << 5,
            4 => {
                if self.length.enabled {
                    0x40
                } else {
                    0
                }
            }
            _ => 0xFF,
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.dac_enabled;
        self.length.trigger();
        self.timer = self.period();
        self.position = 0;
    }

    fn nibble(&self, position: usize) -> u8 {
        let byte = self.ram[position / 2];
        if position % 2 == 0 { byte >> 4 } else { byte & 0x0F }
    }

    fn step(&mut self, cycles: u32) {
        self.timer -= cycles as i32;
        while self.timer <= 0 {
            self.timer += self.period();
            self.position = (self.position + 1) & 31;
            self.sample = self.nibble(self.position);
        }
    }

    fn clock_length(&mut self) {
        if self.length.clock() {
            self.enabled = false;
        }
    }

    fn amplitude(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        match self.output_level {
            0 => 0,
            1 => self.sample,
            2 => self.sample >> 1,
            _ => self.sample >> 2,
        }
    }
}

struct NoiseChannel {
    enabled: bool,
    lfsr: u16,
    clock_shift: u8,
    width7: bool,
    divisor_code: u8,
    timer: i32,
    length: Length,
    envelope: Envelope,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            lfsr: 0x7FFF,
            clock_shift: 0,
            width7: false,
            divisor_code: 0,
            timer: 0,
            length: Length::new(64),
            envelope: Envelope::default(),
        }
    }

    fn period(&self) -> i32 {
        (NOISE_DIVISORS[self.divisor_code as usize] << self.clock_shift) as i32
    }

    fn write(&mut self, reg: u8, val: u8) {
        match reg {
            1 => self.length.load(val & 0x3F),
            2 => {
                self.envelope.write(val);
                if !self.envelope.dac_enabled() {
                    self.enabled = false;
                }
            }
            3 => {
                self.clock_shift = val >> 4;
                self.width7 = val & 0x08 != 0;
                self.divisor_code = val & 0x07;
            }
            4 => {
                self.length.enabled = val & 0x40 != 0;
                if val & 0x80 != 0 {
                    self.trigger();
                }
            }
            _ => {}
        }
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            2 => self.envelope.reg(),
            3 => (self.clock_shift << 4) | (if self.width7 { 0x08 } else { 0 }) | self.divisor_code,
            4 => {
                if self.length.enabled {
                    0x40
                } else {
                    0
                }
            }
            _ => 0xFF,
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.envelope.dac_enabled();
        self.length.trigger();
        self.timer = self.period();
        self.envelope.trigger();
        self.lfsr = 0x7FFF;
    }

    fn clock_lfsr(&mut self) {
        let x = (self.lfsr & 1) ^ ((self.lfsr >> 1) & 1);
        self.lfsr = (self.lfsr >> 1) | (x << 14);
        if self.width7 {
            self.lfsr = (self.lfsr & !0x40) | (x << 6);
        }
    }

    fn step(&mut self, cycles: u32) {
        self.timer -= cycles as i32;
        while self.timer <= 0 {
            self.timer += self.period();
            self.clock_lfsr();
        }
    }

    fn clock_length(&mut self) {
        if self.length.clock() {
            self.enabled = false;
        }
    }

    fn clock_envelope(&mut self) {
        self.envelope.clock();
    }

    fn amplitude(&self) -> u8 {
        if self.enabled && self.lfsr & 1 == 0 {
            self.envelope.volume
        } else {
            0
        }
    }

    fn dac_enabled(&self) -> bool {
        self.envelope.dac_enabled()
    }
}

struct FrameSequencer {
    step: u8,
    counter: u32,
}

impl FrameSequencer {
    fn new() -> Self {
        Self {
            step: 0,
            counter: 0,
        }
    }

    fn advance(&mut self, cycles: u32) {
        self.counter += cycles;
    }

    /// Pops the next step whose period has elapsed.
    fn next_step(&mut self) -> Option<u8> {
        if self.counter < FRAME_SEQUENCER_PERIOD {
            return None;
        }
        self.counter -= FRAME_SEQUENCER_PERIOD;
        let fired = self.step;
        self.step = (self.step + 1) & 7;
        Some(fired)
    }
}

/// Four-channel sound unit at FF10-FF3F.
pub struct Apu {
    ch1: SquareChannel,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,
    nr50: u8,
    nr51: u8,
    powered: bool,
    sequencer: FrameSequencer,
    sample_rate: u32,
    sample_acc: u64,
    producer: Option<AudioProducer>,
    pending: Vec<[i16; 2]>,
    hp_coef: f32,
    hp_prev_in: [f32; 2],
    hp_prev_out: [f32; 2],
}

impl Apu {
    pub fn new() -> Self {
        let sample_rate = 44_100;
        Self {
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::new(),
            ch4: NoiseChannel::new(),
            nr50: 0x77,
            nr51: 0xF3,
            powered: true,
            sequencer: FrameSequencer::new(),
            sample_rate,
            sample_acc: 0,
            producer: None,
            pending: Vec::with_capacity(OUTPUT_BATCH),
            hp_coef: Self::calc_hp_coef(sample_rate),
            hp_prev_in: [0.0; 2],
            hp_prev_out: [0.0; 2],
        }
    }

    fn calc_hp_coef(rate: u32) -> f32 {
        0.999_958_f32.powf(CPU_CLOCK_HZ as f32 / rate as f32)
    }

    /// Starts sample production at `sample_rate` and returns the consumer end
    /// of a fresh queue holding up to `capacity_frames` frames.
    pub fn enable_output(&mut self, sample_rate: u32, capacity_frames: usize) -> AudioConsumer {
        let (producer, consumer) = audio_queue(capacity_frames);
        self.attach_output(producer, sample_rate);
        consumer
    }

    pub fn attach_output(&mut self, producer: AudioProducer, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.hp_coef = Self::calc_hp_coef(self.sample_rate);
        self.sample_acc = 0;
        self.producer = Some(producer);
    }

    /// Detaches the queue producer so it can be moved to a rebuilt APU.
    pub fn take_output(&mut self) -> Option<AudioProducer> {
        self.pending.clear();
        self.producer.take()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn disable_output(&mut self) {
        self.producer = None;
        self.pending.clear();
    }

    fn read_mask(addr: u16) -> u8 {
        match addr {
            0xFF10 => 0x80,
            0xFF11 | 0xFF16 => 0x3F,
            0xFF13 | 0xFF18 | 0xFF1B | 0xFF1D | 0xFF20 => 0xFF,
            0xFF14 | 0xFF19 | 0xFF1E | 0xFF23 => 0xBF,
            0xFF1A => 0x7F,
            0xFF1C => 0x9F,
            0xFF12 | 0xFF17 | 0xFF21 | 0xFF22 | 0xFF24 | 0xFF25 => 0x00,
            0xFF26 => 0x70,
            0xFF30..=0xFF3F => 0x00,
            _ => 0xFF,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        let raw = match addr {
            0xFF10..=0xFF14 => self.ch1.read((addr - 0xFF10) as u8),
            0xFF16..=0xFF19 => self.ch2.read((addr - 0xFF15) as u8),
            0xFF1A..=0xFF1E => self.ch3.read((addr - 0xFF1A) as u8),
            0xFF20..=0xFF23 => self.ch4.read((addr - 0xFF1F) as u8),
            0xFF24 => self.nr50,
            0xFF25 => self.nr51,
            0xFF26 => self.nr52(),
            0xFF30..=0xFF3F => self.ch3.ram[(addr - 0xFF30) as usize],
            _ => 0xFF,
        };
        raw | Self::read_mask(addr)
    }

    fn nr52(&self) -> u8 {
        let mut val = if self.powered { 0x80 } else { 0 };
        if self.ch1.enabled {
            val |= 0x01;
        }
        if self.ch2.enabled {
            val |= 0x02;
        }
        if self.ch3.enabled {
            val |= 0x04;
        }
        if self.ch4.enabled {
            val |= 0x08;
        }
        val
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        if let 0xFF30..=0xFF3F = addr {
            self.ch3.ram[(addr - 0xFF30) as usize] = val;
            return;
        }
        if addr == 0xFF26 {
            let on = val & 0x80 != 0;
            if self.powered && !on {
                self.power_off();
            } else if !self.powered && on {
                self.sequencer = FrameSequencer::new();
            }
            self.powered = on;
            return;
        }
        if !self.powered {
            return;
        }

        match addr {
            0xFF10..=0xFF14 => self.ch1.write((addr - 0xFF10) as u8, val),
            0xFF16..=0xFF19 => self.ch2.write((addr - 0xFF15) as u8, val),
            0xFF1A..=0xFF1E => self.ch3.write((addr - 0xFF1A) as u8, val),
            0xFF20..=0xFF23 => self.ch4.write((addr - 0xFF1F) as u8, val),
            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            _ => {}
        }
    }

    fn power_off(&mut self) {
        let wave = self.ch3.ram;
        self.ch1 = SquareChannel::new(true);
        self.ch2 = SquareChannel::new(false);
        self.ch3 = WaveChannel::new();
        self.ch3.ram = wave;
        self.ch4 = NoiseChannel::new();
        self.nr50 = 0;
        self.nr51 = 0;
    }

    fn clock_frame_sequencer(&mut self, step: u8) {
        if step % 2 == 0 {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if step == 2 || step == 6 {
            self.ch1.clock_sweep();
        }
        if step == 7 {
            self.ch1.clock_envelope();
            self.ch2.clock_envelope();
            self.ch4.clock_envelope();
        }
    }

    /// Advance by `cycles` master-clock cycles.
    pub fn step(&mut self, cycles: u32) {
        if self.powered {
            self.sequencer.advance(cycles);
            while let Some(step) = self.sequencer.next_step() {
                self.clock_frame_sequencer(step);
            }
            self.ch1.step(cycles);
            self.ch2.step(cycles);
            self.ch3.step(cycles);
            self.ch4.step(cycles);
        }

        if self.producer.is_none() {
            return;
        }
        self.sample_acc += cycles as u64 * self.sample_rate as u64;
        while self.sample_acc >= CPU_CLOCK_HZ as u64 {
            self.sample_acc -= CPU_CLOCK_HZ as u64;
            let (left, right) = self.mix_output();
            let frame = self.dc_block(left, right);
            self.pending.push(frame);
        }
        if self.pending.len() >= OUTPUT_BATCH {
            self.flush_output();
        }
    }

    /// Hands buffered frames to the queue. Frames that do not fit are dropped.
    pub fn flush_output(&mut self) {
        if let Some(producer) = &self.producer {
            producer.push_samples(&self.pending);
        }
        self.pending.clear();
    }

    fn dac_level(amplitude: u8, dac_on: bool) -> i16 {
        if dac_on {
            amplitude as i16 * 2 - 15
        } else {
            0
        }
    }

    fn mix_output(&self) -> (i16, i16) {
        let outputs = [
            Self::dac_level(self.ch1.amplitude(), self.ch1.dac_enabled()),
            Self::dac_level(self.ch2.amplitude(), self.ch2.dac_enabled()),
            Self::dac_level(self.ch3.amplitude(), self.ch3.dac_enabled),
            Self::dac_level(self.ch4.amplitude(), self.ch4.dac_enabled()),
        ];

        let mut left = 0i16;
        let mut right = 0i16;
        for (i, out) in outputs.into_iter().enumerate() {
            if self.nr51 & (0x10 << i) != 0 {
                left += out;
            }
            if self.nr51 & (0x01 << i) != 0 {
                right += out;
            }
        }

        let left_vol = ((self.nr50 >> 4) & 0x07) as i16 + 1;
        let right_vol = (self.nr50 & 0x07) as i16 + 1;
        (
            left * left_vol * VOLUME_FACTOR,
            right * right_vol * VOLUME_FACTOR,
        )
    }

    fn dc_block(&mut self, left: i16, right: i16) -> [i16; 2] {
        let r = self.hp_coef;
        let mut out = [0i16; 2];
        for (i, sample) in [left, right].into_iter().enumerate() {
            let input = sample as f32;
            let filtered = input - self.hp_prev_in[i] + r * self.hp_prev_out[i];
            self.hp_prev_in[i] = input;
            self.hp_prev_out[i] = filtered;
            out[i] = filtered.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
        out
    }

    pub fn sequencer_step(&self) -> u8 {
        self.sequencer.step
    }

    pub fn ch1_frequency(&self) -> u16 {
        self.ch1.frequency
    }

    pub fn ch1_sweep_shadow(&self) -> u16 {
        self.ch1.sweep.as_ref().map_or(0, |s| s.shadow)
    }

    pub fn ch1_volume(&self) -> u8 {
        self.ch1.envelope.volume
    }

    pub fn ch3_position(&self) -> usize {
        self.ch3.position
    }

    pub fn ch4_lfsr(&self) -> u16 {
        self.ch4.lfsr
    }
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}
