#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaveformType {
    Triangle,
    Sawtooth,
    Pulse,
    Noise,
}

impl WaveformType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => WaveformType::Triangle,
            1 => WaveformType::Sawtooth,
            2 => WaveformType::Pulse,
            _ => WaveformType::Noise,
        }
    }

    // Phase in [0.0, 1.0). `pulse_width` only matters for Pulse, `noise` only for Noise.
    pub fn generate_sample(&self, phase: f32, pulse_width: f32, noise: f32) -> f32 {
        match self {
            WaveformType::Sawtooth => phase * 2.0 - 1.0,
            WaveformType::Pulse => if phase < pulse_width { 1.0 } else { -1.0 },
            WaveformType::Noise => noise,
            WaveformType::Triangle => {
                if phase < 0.5 { phase * 4.0 - 1.0 } else { 3.0 - phase * 4.0 }
            }
        }
    }
}

/// Phase accumulator with sample-and-hold noise, clocked the way the chip clocks
/// its noise register: a new random value each time the phase wraps.
#[derive(Debug, Clone)]
pub struct Oscillator {
    phase: f32,
    noise: f32,
    rng: fastrand::Rng,
}

impl Oscillator {
    pub fn new(seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let noise = rng.f32() * 2.0 - 1.0;
        Oscillator { phase: 0.0, noise, rng }
    }

    pub fn phase(&self) -> f32 {
        self.phase
    }

    /// Returns the sample at the current phase, then advances by `increment` cycles.
    pub fn next(&mut self, waveform: WaveformType, pulse_width: f32, increment: f32) -> f32 {
        let out = waveform.generate_sample(self.phase, pulse_width, self.noise);
        self.phase += increment;
        if self.phase >= 1.0 {
            self.phase = self.phase.fract();
            self.noise = self.rng.f32() * 2.0 - 1.0;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waveforms_stay_in_range() {
        for wf in [WaveformType::Triangle, WaveformType::Sawtooth, WaveformType::Pulse, WaveformType::Noise] {
            for i in 0..100 {
                let s = wf.generate_sample(i as f32 / 100.0, 0.5, 0.3);
                assert!((-1.0..=1.0).contains(&s), "{:?} produced {}", wf, s);
            }
        }
    }

    #[test]
    fn triangle_peaks_mid_cycle() {
        assert_eq!(WaveformType::Triangle.generate_sample(0.0, 0.5, 0.0), -1.0);
        assert_eq!(WaveformType::Triangle.generate_sample(0.5, 0.5, 0.0), 1.0);
    }

    #[test]
    fn pulse_width_sets_duty_cycle() {
        let high = (0..1000)
            .filter(|i| WaveformType::Pulse.generate_sample(*i as f32 / 1000.0, 0.25, 0.0) > 0.0)
            .count();
        assert_eq!(high, 250);
    }

    #[test]
    fn same_seed_same_noise() {
        let mut a = Oscillator::new(7);
        let mut b = Oscillator::new(7);
        for _ in 0..500 {
            assert_eq!(
                a.next(WaveformType::Noise, 0.5, 0.3),
                b.next(WaveformType::Noise, 0.5, 0.3)
            );
        }
    }

    #[test]
    fn phase_wraps() {
        let mut osc = Oscillator::new(1);
        for _ in 0..10 {
            osc.next(WaveformType::Sawtooth, 0.5, 0.37);
        }
        assert!(osc.phase() >= 0.0 && osc.phase() < 1.0);
    }
}
