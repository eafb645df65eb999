use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PlayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChipModel {
    #[default]
    #[serde(rename = "6581")]
    Mos6581,
    #[serde(rename = "8580")]
    Mos8580,
}

impl ChipModel {
    pub fn label(&self) -> &'static str {
        match self {
            ChipModel::Mos6581 => "6581",
            ChipModel::Mos8580 => "8580",
        }
    }

    /// Maps the 11-bit cutoff register to Hz. The 6581 curve is bent and starts high,
    /// the 8580 is close to linear over its full range.
    pub fn cutoff_hz(&self, register: u16) -> f32 {
        let x = (register.min(2047) as f32) / 2047.0;
        match self {
            ChipModel::Mos6581 => 200.0 + 11_500.0 * x.powf(2.2),
            ChipModel::Mos8580 => 30.0 + 11_970.0 * x,
        }
    }

    pub fn resonance_q(&self, register: u8) -> f32 {
        let r = (register.min(15) as f32) / 15.0;
        match self {
            ChipModel::Mos6581 => 0.707 + r * 3.3,
            ChipModel::Mos8580 => 0.707 + r * 2.3,
        }
    }

    // 6581 output stage overdrives slightly; 8580 is clean.
    #[inline]
    pub fn output_stage(&self, x: f32) -> f32 {
        match self {
            ChipModel::Mos6581 => saturate(x * 1.4) / 1.4,
            ChipModel::Mos8580 => x.clamp(-1.0, 1.0),
        }
    }
}

impl fmt::Display for ChipModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ChipModel {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "6581" | "mos6581" => Ok(ChipModel::Mos6581),
            "8580" | "mos8580" => Ok(ChipModel::Mos8580),
            other => Err(PlayerError::Settings(format!("Unknown chip model: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterType {
    LowPass,
    BandPass,
    HighPass,
}

impl FilterType {
    pub fn from_bits(bits: u8) -> Self {
        match bits % 3 {
            0 => FilterType::LowPass,
            1 => FilterType::BandPass,
            _ => FilterType::HighPass,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub cutoff_register: u16,
    pub resonance_register: u8,
    pub filter_type: FilterType,
}

/// Biquad filter voiced per chip model. Coefficients only change through
/// `configure`, which the pipeline calls once per block; state carries over.
#[derive(Debug, Clone)]
pub struct ChipFilter {
    sample_rate: f32,
    coeffs: [f32; 5], // b0, b1, b2, a1, a2 (normalized by a0)
    x: (f32, f32),
    y: (f32, f32),
}

impl ChipFilter {
    pub fn new(sample_rate: f32) -> Self {
        ChipFilter {
            sample_rate,
            coeffs: [1.0, 0.0, 0.0, 0.0, 0.0],
            x: (0.0, 0.0),
            y: (0.0, 0.0),
        }
    }

    pub fn reset(&mut self) {
        self.x = (0.0, 0.0);
        self.y = (0.0, 0.0);
    }

    pub fn configure(&mut self, model: ChipModel, params: &FilterParams) {
        let nyquist_guard = self.sample_rate * 0.45;
        let cutoff = model.cutoff_hz(params.cutoff_register).min(nyquist_guard);
        let q = model.resonance_q(params.resonance_register);

        let omega = std::f32::consts::TAU * cutoff / self.sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let (b0, b1, b2) = match params.filter_type {
            FilterType::LowPass => ((1.0 - cos_omega) / 2.0, 1.0 - cos_omega, (1.0 - cos_omega) / 2.0),
            FilterType::HighPass => ((1.0 + cos_omega) / 2.0, -(1.0 + cos_omega), (1.0 + cos_omega) / 2.0),
            FilterType::BandPass => (alpha, 0.0, -alpha),
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        self.coeffs = [b0 / a0, b1 / a0, b2 / a0, a1 / a0, a2 / a0];
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let [b0, b1, b2, a1, a2] = self.coeffs;
        let output = b0 * input + b1 * self.x.0 + b2 * self.x.1 - a1 * self.y.0 - a2 * self.y.1;

        self.x = (input, self.x.0);
        self.y = (output, self.y.0);
        output
    }
}

// Cubic soft clip
#[inline]
fn saturate(x: f32) -> f32 {
    if x > 1.0 {
        2.0 / 3.0
    } else if x < -1.0 {
        -2.0 / 3.0
    } else {
        x - x.powi(3) / 3.0
    }
}
