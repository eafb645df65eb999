//! Reads a track's music data as a cyclic score.
//!
//! Player ticks run at the subtune's tick rate; every `TICKS_PER_ROW` ticks a new
//! row starts. A row holds one 3-byte cell per voice plus a filter setting, all
//! read from the payload at offsets derived from (subtune, row, voice):
//!
//! - byte 0: note (`24 + b % 60`)
//! - byte 1: bit 7 gate, bits 0-1 waveform, bits 2-5 pulse width, bit 6 filter routing
//! - byte 2: high nibble attack, low nibble release; sustain comes from the note byte

use crate::chip::{FilterParams, FilterType};
use crate::track::Track;
use crate::utils::note_frequency;
use crate::voice::{Adsr, VoiceCommand};
use crate::waveform::WaveformType;

pub const VOICES: usize = 3;
pub const TICKS_PER_ROW: u64 = 6;
const ROW_STRIDE: usize = VOICES * 3 + 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Row {
    pub index: u64,
    pub voices: [VoiceCommand; VOICES],
    pub filter: FilterParams,
    pub routing: [bool; VOICES],
}

/// A view over one subtune of a track.
#[derive(Debug, Clone, Copy)]
pub struct Score<'a> {
    payload: &'a [u8],
    base: usize,
    tick_rate: f64,
}

impl<'a> Score<'a> {
    pub fn new(track: &'a Track, subtune: usize) -> Self {
        let payload = track.payload();
        let subtune = subtune.min(track.subtune_count.saturating_sub(1));
        let base = if track.subtune_count > 0 {
            payload.len() * subtune / track.subtune_count
        } else {
            0
        };
        Score { payload, base, tick_rate: track.header.tick_rate(subtune) }
    }

    pub fn tick_rate(&self) -> f64 {
        self.tick_rate
    }

    pub fn row_duration(&self) -> f64 {
        TICKS_PER_ROW as f64 / self.tick_rate
    }

    pub fn row_index(&self, track_time: f64) -> u64 {
        let tick = (track_time.max(0.0) * self.tick_rate).floor() as u64;
        tick / TICKS_PER_ROW
    }

    /// Seconds elapsed since the start of the row playing at `track_time`.
    pub fn time_in_row(&self, track_time: f64) -> f64 {
        let row = self.row_index(track_time);
        (track_time.max(0.0) - row as f64 * self.row_duration()).max(0.0)
    }

    #[inline]
    fn byte(&self, row: u64, at: usize) -> u8 {
        let len = self.payload.len();
        let row_offset = ((row % len as u64) as usize * ROW_STRIDE) % len;
        self.payload[(self.base + row_offset + at) % len]
    }

    pub fn row(&self, index: u64) -> Row {
        let mut voices = [VoiceCommand {
            gate: false,
            frequency: 0.0,
            waveform: WaveformType::Triangle,
            pulse_width: 0.5,
            adsr: Adsr::from_nibbles(0, 0, 0),
        }; VOICES];
        let mut routing = [false; VOICES];

        for (v, voice) in voices.iter_mut().enumerate() {
            let note = self.byte(index, v * 3);
            let control = self.byte(index, v * 3 + 1);
            let env = self.byte(index, v * 3 + 2);

            *voice = VoiceCommand {
                gate: control & 0x80 != 0,
                frequency: note_frequency(24 + note % 60),
                waveform: WaveformType::from_bits(control),
                pulse_width: 0.1 + ((control >> 2) & 0x0F) as f32 / 15.0 * 0.8,
                adsr: Adsr::from_nibbles(env >> 4, note >> 4, env & 0x0F),
            };
            routing[v] = control & 0x40 != 0;
        }

        let cutoff = self.byte(index, VOICES * 3);
        let mode = self.byte(index, VOICES * 3 + 1);
        let filter = FilterParams {
            cutoff_register: ((cutoff as u16) << 3) | (index & 0x07) as u16,
            resonance_register: mode >> 4,
            filter_type: FilterType::from_bits(mode & 0x0F),
        };

        Row { index, voices, filter, routing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::build_psid;

    fn track(songs: u16) -> Track {
        let payload: Vec<u8> = (0..=255u8).collect();
        Track::from_bytes(build_psid("t", "a", songs, 1, &payload), None).unwrap()
    }

    #[test]
    fn rows_follow_tick_rate() {
        let t = track(1);
        let score = Score::new(&t, 0);
        assert_eq!(score.tick_rate(), 50.0);
        assert_eq!(score.row_index(0.0), 0);
        assert_eq!(score.row_index(0.119), 0);
        assert_eq!(score.row_index(0.121), 1);
        assert!((score.time_in_row(0.13) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn same_row_same_commands() {
        let t = track(1);
        let score = Score::new(&t, 0);
        assert_eq!(score.row(17), score.row(17));
        assert_ne!(score.row(1).voices, score.row(2).voices);
    }

    #[test]
    fn subtunes_read_different_data() {
        let t = track(4);
        let a = Score::new(&t, 0).row(0);
        let b = Score::new(&t, 2).row(0);
        assert_ne!(a.voices, b.voices);
    }

    #[test]
    fn tiny_payload_wraps() {
        let t = Track::from_bytes(build_psid("t", "a", 1, 1, &[0xC5]), None).unwrap();
        let score = Score::new(&t, 0);
        for i in 0..20 {
            let row = score.row(i);
            assert!(row.voices[0].frequency > 0.0);
        }
    }
}
