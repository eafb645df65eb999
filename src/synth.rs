//! The synthesis pipeline: track + config + track time in, one block of
//! interleaved stereo (`[L0, R0, L1, R1, ..]`) out.
//!
//! Track time advances by `playback_speed / sample_rate` per output frame and
//! oscillator pitch is integrated against that same track time. The config is
//! read once per block, so a chip model or speed change lands on the next block
//! boundary. Oscillator phase, noise and filter state live here and carry from
//! one block to the next.

use crate::chip::{ChipFilter, ChipModel};
use crate::config::PlayerConfig;
use crate::pattern::{Row, Score, VOICES};
use crate::track::Track;
use crate::voice::Voice;

pub const CHANNELS: usize = 2;

const MASTER_GAIN: f32 = 0.3;
const FILTER_GAIN: f32 = 0.5;
// (left, right) gains per voice
const VOICE_PAN: [(f32, f32); VOICES] = [(0.85, 0.45), (0.64, 0.64), (0.45, 0.85)];

pub struct SynthesisPipeline {
    sample_rate: u32,
    voices: [Voice; VOICES],
    filter: ChipFilter,
    last_model: Option<ChipModel>,
}

impl SynthesisPipeline {
    pub fn new(sample_rate: u32) -> Self {
        SynthesisPipeline {
            sample_rate,
            voices: [Voice::new(0x5EED_0001), Voice::new(0x5EED_0002), Voice::new(0x5EED_0003)],
            filter: ChipFilter::new(sample_rate as f32),
            last_model: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Back to the state of a freshly built pipeline.
    pub fn reset(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.reset();
        }
        self.filter.reset();
        self.last_model = None;
    }

    /// Chip model used by the most recent block, if any.
    pub fn last_model(&self) -> Option<ChipModel> {
        self.last_model
    }

    pub fn generate(
        &mut self,
        track: &Track,
        config: &PlayerConfig,
        subtune: usize,
        start_offset: f64,
        frames: usize,
    ) -> Vec<f32> {
        let mut out = vec![0.0; frames * CHANNELS];
        self.render(track, config, subtune, start_offset, &mut out);
        out
    }

    /// Fills `out` (interleaved stereo, `out.len() / 2` frames). Does not allocate.
    /// Returns how many seconds of track time the block covered.
    pub fn render(
        &mut self,
        track: &Track,
        config: &PlayerConfig,
        subtune: usize,
        start_offset: f64,
        out: &mut [f32],
    ) -> f64 {
        let frames = out.len() / CHANNELS;
        let model = config.chip_model;
        let dt = config.playback_speed / self.sample_rate as f64;

        let score = Score::new(track, subtune);
        let row_duration = score.row_duration();

        let mut row: Row = score.row(score.row_index(start_offset));
        self.filter.configure(model, &row.filter);
        self.last_model = Some(model);

        for (i, frame) in out.chunks_exact_mut(CHANNELS).enumerate() {
            let t = start_offset + i as f64 * dt;
            let index = score.row_index(t);
            if index != row.index {
                row = score.row(index);
            }
            let time_in_row = (t - index as f64 * row_duration).max(0.0) as f32;

            let mut left = 0.0;
            let mut right = 0.0;
            let mut filtered = 0.0;
            for (v, voice) in self.voices.iter_mut().enumerate() {
                let cmd = &row.voices[v];
                let increment = (cmd.frequency as f64 * dt) as f32;
                let s = voice.next(cmd, time_in_row, row_duration as f32, increment);
                if row.routing[v] {
                    filtered += s;
                } else {
                    left += s * VOICE_PAN[v].0;
                    right += s * VOICE_PAN[v].1;
                }
            }

            let f = self.filter.process(filtered) * FILTER_GAIN;
            frame[0] = model.output_stage((left + f) * MASTER_GAIN);
            frame[1] = model.output_stage((right + f) * MASTER_GAIN);
        }

        // odd trailing value, if any
        for s in out[frames * CHANNELS..].iter_mut() {
            *s = 0.0;
        }

        frames as f64 * dt
    }
}
