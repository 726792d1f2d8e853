//! Game Boy / Game Boy Color emulation core.
//!
//! This crate contains the platform-agnostic emulator logic (CPU/MMU/PPU/APU/etc).
//! Hosts drive it through the [`gameboy`] facade and never touch a window,
//! audio device or file system from inside the core.

/// Audio Processing Unit (APU) emulation.
pub mod apu;

/// Bounded SPSC sample queue and the background drain task.
pub mod audio_queue;

/// Single-bit helpers used by register code.
pub mod bits;

/// Cartridge mappers (MBC) and ROM/RAM/RTC handling.
pub mod cartridge;

/// Emulator settings loaded from TOML.
pub mod config;

/// SM83 CPU core and its decode tables.
pub mod cpu;

/// High-level facade that wires the CPU and MMU into a single machine.
pub mod gameboy;

/// Model selection and machine constants.
pub mod hardware;

/// Joypad input register and edge-triggered interrupt behavior.
pub mod input;

/// IE/IF pair and interrupt priority.
pub mod interrupts;

/// Memory map and hardware plumbing.
pub mod mmu;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// Serial unit and link port seam.
pub mod serial;

/// Divider/timer unit.
pub mod timer;

pub use cartridge::{Cartridge, CartridgeError, RtcClock, SystemClock};
pub use config::{ConfigError, EmulatorConfig};
pub use cpu::IllegalOpcode;
pub use gameboy::GameBoy;
pub use input::Button;
