use thiserror::Error;

use crate::bits;
use crate::interrupts::Interrupt;
use crate::mmu::Mmu;

// CPU flag bits as documented in gbdev.io/pandocs/The_CPU_Flags.html
const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half Carry
const FLAG_C: u8 = 0x10; // Carry

// Post-boot CPU state from gbdev.io/pandocs/Power_Up_State.html
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;
const DMG_BOOT_AF: u16 = 0x01B0;
const DMG_BOOT_BC: u16 = 0x0013;
const DMG_BOOT_DE: u16 = 0x00D8;
const DMG_BOOT_HL: u16 = 0x014D;
const CGB_BOOT_AF: u16 = 0x1180;
const CGB_BOOT_BC: u16 = 0x0000;
const CGB_BOOT_DE: u16 = 0xFF56;
const CGB_BOOT_HL: u16 = 0x000D;

const INTERRUPT_DISPATCH_CYCLES: u32 = 20;
const IDLE_CYCLES: u32 = 4;

macro_rules! cpu_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "cpu-trace")]
        log::trace!($($arg)*);
    };
}

/// Decode table entry. `cycles` is the base cost in master clock cycles;
/// zero marks an undefined opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub mnemonic: &'static str,
    pub cycles: u8,
}

impl OpcodeInfo {
    pub const ILLEGAL: Self = Self {
        mnemonic: "ILLEGAL",
        cycles: 0,
    };

    pub const fn defined(&self) -> bool {
        self.cycles != 0
    }
}

const fn op(mnemonic: &'static str, cycles: u8) -> OpcodeInfo {
    OpcodeInfo { mnemonic, cycles }
}

const X: OpcodeInfo = OpcodeInfo::ILLEGAL;

/// One row of eight entries over the B,C,D,E,H,L,(HL),A operand order.
macro_rules! r8_row {
    ($prefix:literal, $cycles:expr, $hl:expr) => {
        [
            op(concat!($prefix, "B"), $cycles),
            op(concat!($prefix, "C"), $cycles),
            op(concat!($prefix, "D"), $cycles),
            op(concat!($prefix, "E"), $cycles),
            op(concat!($prefix, "H"), $cycles),
            op(concat!($prefix, "L"), $cycles),
            op(concat!($prefix, "(HL)"), $hl),
            op(concat!($prefix, "A"), $cycles),
        ]
    };
}

#[rustfmt::skip]
const LOW_OPCODES: [OpcodeInfo; 64] = [
    op("NOP", 4), op("LD BC,d16", 12), op("LD (BC),A", 8), op("INC BC", 8),
    op("INC B", 4), op("DEC B", 4), op("LD B,d8", 8), op("RLCA", 4),
    op("LD (a16),SP", 20), op("ADD HL,BC", 8), op("LD A,(BC)", 8), op("DEC BC", 8),
    op("INC C", 4), op("DEC C", 4), op("LD C,d8", 8), op("RRCA", 4),
    op("STOP", 4), op("LD DE,d16", 12), op("LD (DE),A", 8), op("INC DE", 8),
    op("INC D", 4), op("DEC D", 4), op("LD D,d8", 8), op("RLA", 4),
    op("JR r8", 12), op("ADD HL,DE", 8), op("LD A,(DE)", 8), op("DEC DE", 8),
    op("INC E", 4), op("DEC E", 4), op("LD E,d8", 8), op("RRA", 4),
    op("JR NZ,r8", 8), op("LD HL,d16", 12), op("LD (HL+),A", 8), op("INC HL", 8),
    op("INC H", 4), op("DEC H", 4), op("LD H,d8", 8), op("DAA", 4),
    op("JR Z,r8", 8), op("ADD HL,HL", 8), op("LD A,(HL+)", 8), op("DEC HL", 8),
    op("INC L", 4), op("DEC L", 4), op("LD L,d8", 8), op("CPL", 4),
    op("JR NC,r8", 8), op("LD SP,d16", 12), op("LD (HL-),A", 8), op("INC SP", 8),
    op("INC (HL)", 12), op("DEC (HL)", 12), op("LD (HL),d8", 12), op("SCF", 4),
    op("JR C,r8", 8), op("ADD HL,SP", 8), op("LD A,(HL-)", 8), op("DEC SP", 8),
    op("INC A", 4), op("DEC A", 4), op("LD A,d8", 8), op("CCF", 4),
];

const REGISTER_OPCODES: [[OpcodeInfo; 8]; 16] = [
    r8_row!("LD B,", 4, 8),
    r8_row!("LD C,", 4, 8),
    r8_row!("LD D,", 4, 8),
    r8_row!("LD E,", 4, 8),
    r8_row!("LD H,", 4, 8),
    r8_row!("LD L,", 4, 8),
    r8_row!("LD (HL),", 8, 8),
    r8_row!("LD A,", 4, 8),
    r8_row!("ADD A,", 4, 8),
    r8_row!("ADC A,", 4, 8),
    r8_row!("SUB ", 4, 8),
    r8_row!("SBC A,", 4, 8),
    r8_row!("AND ", 4, 8),
    r8_row!("XOR ", 4, 8),
    r8_row!("OR ", 4, 8),
    r8_row!("CP ", 4, 8),
];

#[rustfmt::skip]
const HIGH_OPCODES: [OpcodeInfo; 64] = [
    op("RET NZ", 8), op("POP BC", 12), op("JP NZ,a16", 12), op("JP a16", 16),
    op("CALL NZ,a16", 12), op("PUSH BC", 16), op("ADD A,d8", 8), op("RST 00H", 16),
    op("RET Z", 8), op("RET", 16), op("JP Z,a16", 12), op("PREFIX CB", 4),
    op("CALL Z,a16", 12), op("CALL a16", 24), op("ADC A,d8", 8), op("RST 08H", 16),
    op("RET NC", 8), op("POP DE", 12), op("JP NC,a16", 12), X,
    op("CALL NC,a16", 12), op("PUSH DE", 16), op("SUB d8", 8), op("RST 10H", 16),
    op("RET C", 8), op("RETI", 16), op("JP C,a16", 12), X,
    op("CALL C,a16", 12), X, op("SBC A,d8", 8), op("RST 18H", 16),
    op("LDH (a8),A", 12), op("POP HL", 12), op("LD (C),A", 8), X,
    X, op("PUSH HL", 16), op("AND d8", 8), op("RST 20H", 16),
    op("ADD SP,r8", 16), op("JP (HL)", 4), op("LD (a16),A", 16), X,
    X, X, op("XOR d8", 8), op("RST 28H", 16),
    op("LDH A,(a8)", 12), op("POP AF", 12), op("LD A,(C)", 8), op("DI", 4),
    X, op("PUSH AF", 16), op("OR d8", 8), op("RST 30H", 16),
    op("LD HL,SP+r8", 12), op("LD SP,HL", 8), op("LD A,(a16)", 16), op("EI", 4),
    X, X, op("CP d8", 8), op("RST 38H", 16),
];

const fn build_opcode_table() -> [OpcodeInfo; 256] {
    let mut out = [X; 256];
    let mut i = 0;
    while i < 64 {
        out[i] = LOW_OPCODES[i];
        out[0xC0 + i] = HIGH_OPCODES[i];
        i += 1;
    }
    let mut i = 0;
    while i < 128 {
        out[0x40 + i] = REGISTER_OPCODES[i / 8][i % 8];
        i += 1;
    }
    out[0x76] = op("HALT", 4);
    out
}

const BIT_OPCODES: [[OpcodeInfo; 8]; 8] = [
    r8_row!("BIT 0,", 8, 12),
    r8_row!("BIT 1,", 8, 12),
    r8_row!("BIT 2,", 8, 12),
    r8_row!("BIT 3,", 8, 12),
    r8_row!("BIT 4,", 8, 12),
    r8_row!("BIT 5,", 8, 12),
    r8_row!("BIT 6,", 8, 12),
    r8_row!("BIT 7,", 8, 12),
];

const CB_SHIFT_OPCODES: [[OpcodeInfo; 8]; 8] = [
    r8_row!("RLC ", 8, 16),
    r8_row!("RRC ", 8, 16),
    r8_row!("RL ", 8, 16),
    r8_row!("RR ", 8, 16),
    r8_row!("SLA ", 8, 16),
    r8_row!("SRA ", 8, 16),
    r8_row!("SWAP ", 8, 16),
    r8_row!("SRL ", 8, 16),
];

const RES_OPCODES: [[OpcodeInfo; 8]; 8] = [
    r8_row!("RES 0,", 8, 16),
    r8_row!("RES 1,", 8, 16),
    r8_row!("RES 2,", 8, 16),
    r8_row!("RES 3,", 8, 16),
    r8_row!("RES 4,", 8, 16),
    r8_row!("RES 5,", 8, 16),
    r8_row!("RES 6,", 8, 16),
    r8_row!("RES 7,", 8, 16),
];

const SET_OPCODES: [[OpcodeInfo; 8]; 8] = [
    r8_row!("SET 0,", 8, 16),
    r8_row!("SET 1,", 8, 16),
    r8_row!("SET 2,", 8, 16),
    r8_row!("SET 3,", 8, 16),
    r8_row!("SET 4,", 8, 16),
    r8_row!("SET 5,", 8, 16),
    r8_row!("SET 6,", 8, 16),
    r8_row!("SET 7,", 8, 16),
];

const fn build_cb_table() -> [OpcodeInfo; 256] {
    let mut out = [X; 256];
    let mut i = 0;
    while i < 64 {
        out[i] = CB_SHIFT_OPCODES[i / 8][i % 8];
        out[0x40 + i] = BIT_OPCODES[i / 8][i % 8];
        out[0x80 + i] = RES_OPCODES[i / 8][i % 8];
        out[0xC0 + i] = SET_OPCODES[i / 8][i % 8];
        i += 1;
    }
    out
}

const fn build_taken_table() -> [u8; 256] {
    let mut out = [0; 256];
    let mut i = 0;
    while i < 4 {
        out[0x20 + i * 8] = 4; // JR cc
        out[0xC2 + i * 8] = 4; // JP cc
        out[0xC4 + i * 8] = 12; // CALL cc
        out[0xC0 + i * 8] = 12; // RET cc
        i += 1;
    }
    out
}

/// Unprefixed opcodes.
pub static OPCODE_TABLE: [OpcodeInfo; 256] = build_opcode_table();

/// CB-prefixed opcodes. Costs include the prefix fetch.
pub static CB_OPCODE_TABLE: [OpcodeInfo; 256] = build_cb_table();

/// Extra cycles charged when a conditional jump, call or return is taken.
pub static CONDITIONAL_TAKEN_CYCLES: [u8; 256] = build_taken_table();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal opcode 0x{opcode:02X} at {pc:04X}")]
pub struct IllegalOpcode {
    pub opcode: u8,
    pub pc: u16,
}

pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub cycles: u64,
    pub ime: bool,
    pub halted: bool,
    pub stopped: bool,
    /// EI was executed; IME turns on after the next instruction.
    ime_pending: bool,
    /// Emulate the HALT bug when HALT runs with IME=0 and an interrupt pending.
    pub halt_bug_enabled: bool,
    /// Next fetch does not advance PC.
    halt_bug: bool,
}

impl Cpu {
    /// Neutral power-on state, to be paired with a boot ROM mapped at 0x0000.
    pub fn new() -> Self {
        Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            pc: 0x0000,
            sp: 0x0000,
            cycles: 0,
            ime: false,
            halted: false,
            stopped: false,
            ime_pending: false,
            halt_bug_enabled: true,
            halt_bug: false,
        }
    }

    /// Registers as left by the boot ROM.
    pub fn post_boot(cgb: bool) -> Self {
        let mut cpu = Self::new();
        let (af, bc, de, hl) = if cgb {
            (CGB_BOOT_AF, CGB_BOOT_BC, CGB_BOOT_DE, CGB_BOOT_HL)
        } else {
            (DMG_BOOT_AF, DMG_BOOT_BC, DMG_BOOT_DE, DMG_BOOT_HL)
        };
        cpu.set_af(af);
        cpu.set_bc(bc);
        cpu.set_de(de);
        cpu.set_hl(hl);
        cpu.sp = BOOT_SP;
        cpu.pc = BOOT_PC;
        cpu
    }

    pub fn get_af(&self) -> u16 {
        ((self.a as u16) << 8) | self.f as u16
    }

    pub fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        self.f = (val as u8) & 0xF0;
    }

    pub fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    pub fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    pub fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    pub fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    pub fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    pub fn ime_pending(&self) -> bool {
        self.ime_pending
    }

    pub fn debug_state(&self) -> String {
        format!(
            "AF={:04X} BC={:04X} DE={:04X} HL={:04X} SP={:04X} PC={:04X} IME={}",
            self.get_af(),
            self.get_bc(),
            self.get_de(),
            self.get_hl(),
            self.sp,
            self.pc,
            self.ime as u8
        )
    }

    fn fetch8(&mut self, bus: &Mmu) -> u8 {
        let val = bus.read_byte(self.pc);
        if self.halt_bug {
            self.halt_bug = false;
        } else {
            self.pc = self.pc.wrapping_add(1);
        }
        val
    }

    fn fetch16(&mut self, bus: &Mmu) -> u16 {
        let lo = self.fetch8(bus) as u16;
        let hi = self.fetch8(bus) as u16;
        (hi << 8) | lo
    }

    fn push_stack(&mut self, bus: &mut Mmu, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        bus.write_byte(self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        bus.write_byte(self.sp, val as u8);
    }

    fn pop_stack(&mut self, bus: &Mmu) -> u16 {
        let lo = bus.read_byte(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = bus.read_byte(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    /// Operand in B,C,D,E,H,L,(HL),A order.
    fn read_r(&self, bus: &Mmu, index: u8) -> u8 {
        match index & 0x07 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => bus.read_byte(self.get_hl()),
            _ => self.a,
        }
    }

    fn write_r(&mut self, bus: &mut Mmu, index: u8, val: u8) {
        match index & 0x07 {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => bus.write_byte(self.get_hl(), val),
            _ => self.a = val,
        }
    }

    /// BC, DE, HL, SP
    fn read_rr(&self, index: u8) -> u16 {
        match index & 0x03 {
            0 => self.get_bc(),
            1 => self.get_de(),
            2 => self.get_hl(),
            _ => self.sp,
        }
    }

    fn write_rr(&mut self, index: u8, val: u16) {
        match index & 0x03 {
            0 => self.set_bc(val),
            1 => self.set_de(val),
            2 => self.set_hl(val),
            _ => self.sp = val,
        }
    }

    /// NZ, Z, NC, C
    fn condition(&self, index: u8) -> bool {
        match index & 0x03 {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    #[inline]
    fn flag(cond: bool, bit: u8) -> u8 {
        if cond { bit } else { 0 }
    }

    /// ADD, ADC, SUB, SBC, AND, XOR, OR, CP
    fn alu(&mut self, index: u8, val: u8) {
        let a = self.a;
        let carry = (self.f & FLAG_C != 0) as u8;
        match index & 0x07 {
            0 | 1 => {
                let c = if index & 0x07 == 1 { carry } else { 0 };
                let sum = a as u16 + val as u16 + c as u16;
                let res = sum as u8;
                self.f = Self::flag(res == 0, FLAG_Z)
                    | Self::flag((a & 0x0F) + (val & 0x0F) + c > 0x0F, FLAG_H)
                    | Self::flag(sum > 0xFF, FLAG_C);
                self.a = res;
            }
            2 | 3 | 7 => {
                let c = if index & 0x07 == 3 { carry } else { 0 };
                let res = a.wrapping_sub(val).wrapping_sub(c);
                self.f = FLAG_N
                    | Self::flag(res == 0, FLAG_Z)
                    | Self::flag((a & 0x0F) < (val & 0x0F) + c, FLAG_H)
                    | Self::flag((a as u16) < val as u16 + c as u16, FLAG_C);
                if index & 0x07 != 7 {
                    self.a = res;
                }
            }
            4 => {
                self.a = a & val;
                self.f = Self::flag(self.a == 0, FLAG_Z) | FLAG_H;
            }
            5 => {
                self.a = a ^ val;
                self.f = Self::flag(self.a == 0, FLAG_Z);
            }
            _ => {
                self.a = a | val;
                self.f = Self::flag(self.a == 0, FLAG_Z);
            }
        }
    }

    fn inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C)
            | Self::flag(res == 0, FLAG_Z)
            | Self::flag(val & 0x0F == 0x0F, FLAG_H);
        res
    }

    fn dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C)
            | FLAG_N
            | Self::flag(res == 0, FLAG_Z)
            | Self::flag(val & 0x0F == 0, FLAG_H);
        res
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.get_hl();
        let res = hl.wrapping_add(val);
        self.f = (self.f & FLAG_Z)
            | Self::flag((hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF, FLAG_H)
            | Self::flag(hl as u32 + val as u32 > 0xFFFF, FLAG_C);
        self.set_hl(res);
    }

    /// SP + signed offset with H/C taken from the low byte. Z and N are cleared.
    fn sp_offset(&mut self, offset: u8) -> u16 {
        let e = offset as i8 as i16 as u16;
        let sp = self.sp;
        self.f = Self::flag((sp & 0x0F) + (e & 0x0F) > 0x0F, FLAG_H)
            | Self::flag((sp & 0xFF) + (e & 0xFF) > 0xFF, FLAG_C);
        sp.wrapping_add(e)
    }

    fn daa(&mut self) {
        let mut a = self.a;
        let mut carry = self.f & FLAG_C != 0;
        let half = self.f & FLAG_H != 0;
        if self.f & FLAG_N == 0 {
            if carry || a > 0x99 {
                a = a.wrapping_add(0x60);
                carry = true;
            }
            if half || a & 0x0F > 0x09 {
                a = a.wrapping_add(0x06);
            }
        } else {
            if carry {
                a = a.wrapping_sub(0x60);
            }
            if half {
                a = a.wrapping_sub(0x06);
            }
        }
        self.a = a;
        self.f = (self.f & FLAG_N) | Self::flag(a == 0, FLAG_Z) | Self::flag(carry, FLAG_C);
    }

    fn handle_cb(&mut self, bus: &mut Mmu, opcode: u8) {
        let r = opcode & 0x07;
        let bit = (opcode >> 3) & 0x07;
        let val = self.read_r(bus, r);
        let carry_in = (self.f & FLAG_C != 0) as u8;
        match opcode {
            0x00..=0x3F => {
                let (res, carry) = match bit {
                    0 => (val.rotate_left(1), val & 0x80 != 0),
                    1 => (val.rotate_right(1), val & 0x01 != 0),
                    2 => ((val << 1) | carry_in, val & 0x80 != 0),
                    3 => ((val >> 1) | (carry_in << 7), val & 0x01 != 0),
                    4 => (val << 1, val & 0x80 != 0),
                    5 => ((val >> 1) | (val & 0x80), val & 0x01 != 0),
                    6 => (val.rotate_left(4), false),
                    _ => (val >> 1, val & 0x01 != 0),
                };
                self.write_r(bus, r, res);
                self.f = Self::flag(res == 0, FLAG_Z) | Self::flag(carry, FLAG_C);
            }
            0x40..=0x7F => {
                self.f = (self.f & FLAG_C) | FLAG_H | Self::flag(!bits::test(val, bit), FLAG_Z);
            }
            0x80..=0xBF => self.write_r(bus, r, bits::reset(val, bit)),
            _ => self.write_r(bus, r, bits::set(val, bit)),
        }
    }

    /// Dispatch the highest priority pending interrupt if IME allows it.
    fn service_interrupt(&mut self, bus: &mut Mmu) -> Option<u32> {
        if !self.ime {
            return None;
        }
        let irq = bus.interrupts.highest_pending()?;
        bus.interrupts.acknowledge(irq);
        self.ime = false;
        let pc = self.pc;
        self.push_stack(bus, pc);
        self.pc = irq.vector();
        cpu_trace!("IRQ {:?} -> {:04X}", irq, self.pc);
        Some(INTERRUPT_DISPATCH_CYCLES)
    }

    /// Execute one instruction, or service one interrupt, or idle for one
    /// machine cycle while halted. Returns the cycles consumed.
    pub fn step(&mut self, bus: &mut Mmu) -> Result<u32, IllegalOpcode> {
        let pending = bus.interrupts.pending();
        if self.halted && pending != 0 {
            self.halted = false;
        }
        if let Some(cycles) = self.service_interrupt(bus) {
            self.cycles += cycles as u64;
            return Ok(cycles);
        }
        if self.halted {
            self.cycles += IDLE_CYCLES as u64;
            return Ok(IDLE_CYCLES);
        }
        if self.stopped {
            if bus.interrupts.flags & Interrupt::Joypad.bit() == 0 {
                self.cycles += IDLE_CYCLES as u64;
                return Ok(IDLE_CYCLES);
            }
            self.stopped = false;
        }

        let enable_after = self.ime_pending;
        let pc = self.pc;
        let opcode = self.fetch8(bus);
        let info = OPCODE_TABLE[opcode as usize];
        if !info.defined() {
            // The undefined byte still counts as the instruction after EI.
            if enable_after {
                self.ime = true;
                self.ime_pending = false;
            }
            return Err(IllegalOpcode { opcode, pc });
        }
        cpu_trace!("{:04X}: {:<12} {}", pc, info.mnemonic, self.debug_state());

        let mut cycles = info.cycles as u32;
        let mut taken = false;
        match opcode {
            0x00 => {}
            0x10 => {
                let _ = self.fetch8(bus);
                bus.timer.write(0xFF04, 0);
                if !bus.try_speed_switch() {
                    self.stopped = true;
                }
            }
            0x76 => {
                if self.ime || pending == 0 {
                    self.halted = true;
                } else if self.halt_bug_enabled {
                    self.halt_bug = true;
                }
            }
            0xCB => {
                let cb = self.fetch8(bus);
                self.handle_cb(bus, cb);
                cycles = CB_OPCODE_TABLE[cb as usize].cycles as u32;
            }

            // 8-bit loads
            0x40..=0x7F => {
                let val = self.read_r(bus, opcode);
                self.write_r(bus, opcode >> 3, val);
            }
            op if op & 0xC7 == 0x06 => {
                let val = self.fetch8(bus);
                self.write_r(bus, op >> 3, val);
            }
            0x02 | 0x12 => bus.write_byte(self.read_rr(opcode >> 4), self.a),
            0x0A | 0x1A => self.a = bus.read_byte(self.read_rr(opcode >> 4)),
            0x22 | 0x32 => {
                let hl = self.get_hl();
                bus.write_byte(hl, self.a);
                self.set_hl(if opcode == 0x22 { hl.wrapping_add(1) } else { hl.wrapping_sub(1) });
            }
            0x2A | 0x3A => {
                let hl = self.get_hl();
                self.a = bus.read_byte(hl);
                self.set_hl(if opcode == 0x2A { hl.wrapping_add(1) } else { hl.wrapping_sub(1) });
            }
            0xE0 => {
                let offset = self.fetch8(bus) as u16;
                bus.write_byte(0xFF00 | offset, self.a);
            }
            0xF0 => {
                let offset = self.fetch8(bus) as u16;
                self.a = bus.read_byte(0xFF00 | offset);
            }
            0xE2 => bus.write_byte(0xFF00 | self.c as u16, self.a),
            0xF2 => self.a = bus.read_byte(0xFF00 | self.c as u16),
            0xEA => {
                let addr = self.fetch16(bus);
                bus.write_byte(addr, self.a);
            }
            0xFA => {
                let addr = self.fetch16(bus);
                self.a = bus.read_byte(addr);
            }

            // 16-bit loads and arithmetic
            op if op & 0xCF == 0x01 => {
                let val = self.fetch16(bus);
                self.write_rr(op >> 4, val);
            }
            op if op & 0xCF == 0x03 => {
                let val = self.read_rr(op >> 4).wrapping_add(1);
                self.write_rr(op >> 4, val);
            }
            op if op & 0xCF == 0x0B => {
                let val = self.read_rr(op >> 4).wrapping_sub(1);
                self.write_rr(op >> 4, val);
            }
            op if op & 0xCF == 0x09 => {
                let val = self.read_rr(op >> 4);
                self.add_hl(val);
            }
            0x08 => {
                let addr = self.fetch16(bus);
                bus.write_word(addr, self.sp);
            }
            0xE8 => {
                let offset = self.fetch8(bus);
                self.sp = self.sp_offset(offset);
            }
            0xF8 => {
                let offset = self.fetch8(bus);
                let val = self.sp_offset(offset);
                self.set_hl(val);
            }
            0xF9 => self.sp = self.get_hl(),
            op if op & 0xCF == 0xC5 => {
                let val = match (op >> 4) & 0x03 {
                    3 => self.get_af(),
                    i => self.read_rr(i),
                };
                self.push_stack(bus, val);
            }
            op if op & 0xCF == 0xC1 => {
                let val = self.pop_stack(bus);
                match (op >> 4) & 0x03 {
                    3 => self.set_af(val),
                    i => self.write_rr(i, val),
                }
            }

            // 8-bit arithmetic
            op if op & 0xC7 == 0x04 => {
                let val = self.read_r(bus, op >> 3);
                let res = self.inc8(val);
                self.write_r(bus, op >> 3, res);
            }
            op if op & 0xC7 == 0x05 => {
                let val = self.read_r(bus, op >> 3);
                let res = self.dec8(val);
                self.write_r(bus, op >> 3, res);
            }
            0x80..=0xBF => {
                let val = self.read_r(bus, opcode);
                self.alu(opcode >> 3, val);
            }
            op if op & 0xC7 == 0xC6 => {
                let val = self.fetch8(bus);
                self.alu(op >> 3, val);
            }
            0x27 => self.daa(),
            0x2F => {
                self.a = !self.a;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            0x37 => self.f = (self.f & FLAG_Z) | FLAG_C,
            0x3F => self.f = (self.f & FLAG_Z) | ((self.f & FLAG_C) ^ FLAG_C),

            // Accumulator rotates always clear Z
            0x07 => {
                self.f = Self::flag(self.a & 0x80 != 0, FLAG_C);
                self.a = self.a.rotate_left(1);
            }
            0x0F => {
                self.f = Self::flag(self.a & 0x01 != 0, FLAG_C);
                self.a = self.a.rotate_right(1);
            }
            0x17 => {
                let carry_in = (self.f & FLAG_C != 0) as u8;
                self.f = Self::flag(self.a & 0x80 != 0, FLAG_C);
                self.a = (self.a << 1) | carry_in;
            }
            0x1F => {
                let carry_in = (self.f & FLAG_C != 0) as u8;
                self.f = Self::flag(self.a & 0x01 != 0, FLAG_C);
                self.a = (self.a >> 1) | (carry_in << 7);
            }

            // Control flow
            0x18 => {
                let offset = self.fetch8(bus) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(bus) as i8;
                if self.condition(opcode >> 3) {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    taken = true;
                }
            }
            0xC3 => self.pc = self.fetch16(bus),
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch16(bus);
                if self.condition(opcode >> 3) {
                    self.pc = addr;
                    taken = true;
                }
            }
            0xE9 => self.pc = self.get_hl(),
            0xCD => {
                let addr = self.fetch16(bus);
                let ret = self.pc;
                self.push_stack(bus, ret);
                self.pc = addr;
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch16(bus);
                if self.condition(opcode >> 3) {
                    let ret = self.pc;
                    self.push_stack(bus, ret);
                    self.pc = addr;
                    taken = true;
                }
            }
            0xC9 => self.pc = self.pop_stack(bus),
            0xD9 => {
                self.pc = self.pop_stack(bus);
                self.ime = true;
                self.ime_pending = false;
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                if self.condition(opcode >> 3) {
                    self.pc = self.pop_stack(bus);
                    taken = true;
                }
            }
            op if op & 0xC7 == 0xC7 => {
                let ret = self.pc;
                self.push_stack(bus, ret);
                self.pc = (op & 0x38) as u16;
            }
            0xF3 => {
                self.ime = false;
                self.ime_pending = false;
            }
            0xFB => self.ime_pending = true,

            _ => debug_assert!(false, "opcode {opcode:02X} missing from dispatch"),
        }

        if taken {
            cycles += CONDITIONAL_TAKEN_CYCLES[opcode as usize] as u32;
        }
        if enable_after && self.ime_pending {
            self.ime = true;
            self.ime_pending = false;
        }
        self.cycles += cycles as u64;
        Ok(cycles)
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
