use crate::hardware::{IllegalOpcodePolicy, Model};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Everything a host can tune about the emulated machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub model: Model,
    pub sample_rate: u32,
    pub audio_buffer_frames: usize,
    pub illegal_opcode: IllegalOpcodePolicy,
    pub halt_bug: bool,
    /// Four `0xRRGGBB` shades, lightest first, used for DMG output.
    pub dmg_palette: Option<[u32; 4]>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            model: Model::Auto,
            sample_rate: 44_100,
            audio_buffer_frames: 4096,
            illegal_opcode: IllegalOpcodePolicy::LockUp,
            halt_bug: true,
            dmg_palette: None,
        }
    }
}

impl EmulatorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = EmulatorConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, EmulatorConfig::default());
    }

    #[test]
    fn parses_kebab_case_enums() {
        let cfg = EmulatorConfig::from_toml_str(
            r#"
model = "cgb"
illegal_opcode = "lock-up"
sample_rate = 48000
halt_bug = false
dmg_palette = [0xFFFFFF, 0xAAAAAA, 0x555555, 0x000000]
"#,
        )
        .unwrap();
        assert_eq!(cfg.model, Model::Cgb);
        assert_eq!(cfg.illegal_opcode, IllegalOpcodePolicy::LockUp);
        assert_eq!(cfg.sample_rate, 48_000);
        assert!(!cfg.halt_bug);
        assert_eq!(cfg.dmg_palette, Some([0xFFFFFF, 0xAAAAAA, 0x555555, 0]));
        assert_eq!(cfg.audio_buffer_frames, 4096);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = EmulatorConfig {
            model: Model::Dmg,
            illegal_opcode: IllegalOpcodePolicy::Fatal,
            ..EmulatorConfig::default()
        };
        let text = cfg.to_toml_string().unwrap();
        assert_eq!(EmulatorConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn rejects_unknown_model() {
        let err = EmulatorConfig::from_toml_str("model = \"sgb\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EmulatorConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
