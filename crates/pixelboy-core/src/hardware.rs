use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Which console to emulate.
///
/// `Auto` defers the choice to the cartridge header: CGB-flagged
/// cartridges run on color hardware, everything else on DMG.
pub enum Model {
    #[default]
    Auto,
    Dmg,
    Cgb,
}

impl Model {
    /// Resolves `Auto` against a cartridge's CGB flag byte (header 0x143).
    pub const fn resolve(self, cgb_flag: u8) -> bool {
        match self {
            Model::Auto => cgb_flag & 0x80 != 0,
            Model::Dmg => false,
            Model::Cgb => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// What the scheduler does when the CPU fetches an undefined opcode.
pub enum IllegalOpcodePolicy {
    /// Hand the error back to the caller.
    Fatal,
    /// Freeze the CPU the way real hardware does. Peripherals keep running.
    #[default]
    LockUp,
    /// Treat the byte as a 4-cycle NOP.
    Nop,
}

pub const CPU_CLOCK_HZ: u32 = 4_194_304;
pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_follows_header_flag() {
        assert!(Model::Auto.resolve(0x80));
        assert!(Model::Auto.resolve(0xC0));
        assert!(!Model::Auto.resolve(0x00));
        assert!(!Model::Dmg.resolve(0xC0));
        assert!(Model::Cgb.resolve(0x00));
    }
}
