use crate::waveform::{Oscillator, WaveformType};

// Attack/decay/release step tables in seconds, shortened from the chip's
// rate tables so a single row can hold a full envelope.
const ATTACK_TIMES: [f32; 16] = [
    0.002, 0.004, 0.008, 0.012, 0.016, 0.020, 0.024, 0.030,
    0.036, 0.044, 0.052, 0.060, 0.070, 0.080, 0.090, 0.100,
];
const RELEASE_TIMES: [f32; 16] = [
    0.006, 0.010, 0.014, 0.018, 0.024, 0.030, 0.036, 0.044,
    0.052, 0.060, 0.070, 0.080, 0.090, 0.100, 0.110, 0.120,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adsr {
    pub attack: f32, // seconds
    pub decay: f32,
    pub sustain: f32, // level 0..1
    pub release: f32,
}

impl Adsr {
    pub fn from_nibbles(attack: u8, sustain: u8, release: u8) -> Self {
        Adsr {
            attack: ATTACK_TIMES[(attack & 0x0F) as usize],
            decay: 0.024,
            sustain: 0.35 + (sustain & 0x0F) as f32 / 15.0 * 0.6,
            release: RELEASE_TIMES[(release & 0x0F) as usize],
        }
    }

    /// Envelope level `time` seconds into a gated note lasting `duration` seconds.
    pub fn level(&self, time: f32, duration: f32) -> f32 {
        let attack_end = self.attack;
        let decay_end = attack_end + self.decay;
        let release_start = (duration - self.release).max(0.0);

        let held = if time < attack_end {
            time / attack_end.max(f32::EPSILON)
        } else if time < decay_end {
            let decay_progress = (time - attack_end) / self.decay.max(f32::EPSILON);
            1.0 - decay_progress * (1.0 - self.sustain)
        } else {
            self.sustain
        };

        if time < release_start {
            held
        } else {
            let release_progress = ((time - release_start) / self.release.max(f32::EPSILON)).min(1.0);
            held * (1.0 - release_progress)
        }
    }
}

/// What a voice should be doing for the current row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceCommand {
    pub gate: bool,
    pub frequency: f32,
    pub waveform: WaveformType,
    pub pulse_width: f32,
    pub adsr: Adsr,
}

#[derive(Debug, Clone)]
pub struct Voice {
    oscillator: Oscillator,
    seed: u64,
}

impl Voice {
    pub fn new(seed: u64) -> Self {
        Voice { oscillator: Oscillator::new(seed), seed }
    }

    pub fn reset(&mut self) {
        self.oscillator = Oscillator::new(self.seed);
    }

    /// One sample. `time_in_row` and `row_duration` are in track seconds,
    /// `phase_increment` is cycles per output frame at the current speed.
    #[inline]
    pub fn next(&mut self, cmd: &VoiceCommand, time_in_row: f32, row_duration: f32, phase_increment: f32) -> f32 {
        // keep the oscillator running through rests so the next note starts in phase
        let sample = self.oscillator.next(cmd.waveform, cmd.pulse_width, phase_increment);
        if !cmd.gate {
            return 0.0;
        }
        sample * cmd.adsr.level(time_in_row, row_duration)
    }
}
