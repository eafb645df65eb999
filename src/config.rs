use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};

use crate::chip::ChipModel;
use crate::error::{PlayerError, Result};

pub const SPEED_PRESETS: [f64; 4] = [1.0, 1.5, 2.0, 3.0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerConfig {
    pub chip_model: ChipModel,
    pub playback_speed: f64,
    pub sample_rate: u32,
}

impl PlayerConfig {
    pub fn new(sample_rate: u32) -> Self {
        PlayerConfig { chip_model: ChipModel::default(), playback_speed: 1.0, sample_rate }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigPatch {
    pub chip_model: Option<ChipModel>,
    pub playback_speed: Option<f64>,
}

impl ConfigPatch {
    pub fn chip_model(model: ChipModel) -> Self {
        ConfigPatch { chip_model: Some(model), ..Default::default() }
    }

    pub fn playback_speed(speed: f64) -> Self {
        ConfigPatch { playback_speed: Some(speed), ..Default::default() }
    }

    pub fn apply(&self, cur: &PlayerConfig) -> PlayerConfig {
        let mut next = *cur;
        if let Some(model) = self.chip_model {
            next.chip_model = model;
        }
        if let Some(speed) = self.playback_speed {
            next.playback_speed = speed;
        }
        next
    }
}

pub fn validate_speed(speed: f64) -> Result<f64> {
    if speed.is_finite() && speed > 0.0 {
        Ok(speed)
    } else {
        Err(PlayerError::InvalidSpeed(speed))
    }
}

/// Holds the committed `PlayerConfig` as an atomically swapped snapshot.
///
/// Readers (the audio callback) grab a whole snapshot with `snapshot()` and never
/// wait on writers. A patch is applied by publishing a new snapshot, so a reader
/// sees the config either entirely before or entirely after the change.
#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<PlayerConfig>,
}

impl ConfigStore {
    pub fn new(initial: PlayerConfig) -> Result<Self> {
        validate_speed(initial.playback_speed)?;
        Ok(ConfigStore { current: ArcSwap::from_pointee(initial) })
    }

    pub fn get(&self) -> PlayerConfig {
        **self.current.load()
    }

    /// Lock-free borrow for the real-time path.
    pub fn snapshot(&self) -> Guard<Arc<PlayerConfig>> {
        self.current.load()
    }

    /// Validates first; on error nothing is published.
    pub fn set(&self, patch: ConfigPatch) -> Result<PlayerConfig> {
        if let Some(speed) = patch.playback_speed {
            validate_speed(speed)?;
        }
        let previous = self.current.rcu(|cur| patch.apply(cur));
        Ok(patch.apply(&previous))
    }
}
