use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chip::ChipModel;
use crate::config::{validate_speed, PlayerConfig};
use crate::error::{PlayerError, Result};

/// Engine-wide settings, usually read from a TOML file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub sample_rate: u32,
    pub block_size: u32, // frames per output buffer
    pub channels: u16,
    pub default_chip: ChipModel,
    pub default_speed: f64,
    pub default_duration_secs: f64,
    pub device_name: Option<String>,
    pub fetch_timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            sample_rate: 44_100,
            block_size: 4096,
            channels: 2,
            default_chip: ChipModel::Mos6581,
            default_speed: 1.0,
            default_duration_secs: 180.0,
            device_name: None,
            fetch_timeout_secs: 30,
            progress_interval_ms: 100,
        }
    }
}

impl EngineSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PlayerError::Settings(format!("{}: {}", path.display(), e)))?;
        let settings = Self::from_toml_str(&content)?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: EngineSettings =
            toml::from_str(content).map_err(|e| PlayerError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PlayerError::Settings("sample_rate must be > 0".to_string()));
        }
        if self.block_size == 0 {
            return Err(PlayerError::Settings("block_size must be > 0".to_string()));
        }
        if self.channels == 0 {
            return Err(PlayerError::Settings("channels must be > 0".to_string()));
        }
        if !(self.default_duration_secs.is_finite() && self.default_duration_secs > 0.0) {
            return Err(PlayerError::Settings("default_duration_secs must be > 0".to_string()));
        }
        validate_speed(self.default_speed)
            .map_err(|_| PlayerError::Settings("default_speed must be > 0".to_string()))?;
        Ok(())
    }

    pub fn player_config(&self, sample_rate: u32) -> PlayerConfig {
        PlayerConfig {
            chip_model: self.default_chip,
            playback_speed: self.default_speed,
            sample_rate,
        }
    }
}
