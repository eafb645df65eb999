use std::path::Path;

use tracing::info;

use crate::config::PlayerConfig;
use crate::error::{PlayerError, Result};
use crate::synth::{CHANNELS, SynthesisPipeline};
use crate::track::Track;

const RENDER_BLOCK: usize = 4096;

/// Runs the pipeline for `seconds` of output time (track time covers
/// `seconds × playback_speed`). Interleaved stereo.
pub fn render_samples(track: &Track, config: &PlayerConfig, subtune: usize, seconds: f64) -> Result<Vec<f32>> {
    check(track, config, subtune, seconds)?;

    let frames = (seconds * config.sample_rate as f64).round() as usize;
    let mut pipeline = SynthesisPipeline::new(config.sample_rate);
    let mut out = vec![0.0; frames * CHANNELS];
    let mut track_time = 0.0;
    for block in out.chunks_mut(RENDER_BLOCK * CHANNELS) {
        track_time += pipeline.render(track, config, subtune, track_time, block);
    }
    Ok(out)
}

/// Renders to a 16-bit stereo WAV. Returns the number of frames written.
pub fn render_to_wav(
    track: &Track,
    config: &PlayerConfig,
    subtune: usize,
    seconds: f64,
    path: impl AsRef<Path>,
) -> Result<usize> {
    let path = path.as_ref();
    let samples = render_samples(track, config, subtune, seconds)?;

    let spec = hound::WavSpec {
        channels: CHANNELS as u16,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for s in &samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;

    let frames = samples.len() / CHANNELS;
    info!(
        "Rendered {} ({}, {}x) to {}: {} frames",
        track.title,
        config.chip_model,
        config.playback_speed,
        path.display(),
        frames
    );
    Ok(frames)
}

fn check(track: &Track, config: &PlayerConfig, subtune: usize, seconds: f64) -> Result<()> {
    if subtune >= track.subtune_count {
        return Err(PlayerError::InvalidSubtune { index: subtune, count: track.subtune_count });
    }
    if !(seconds.is_finite() && seconds >= 0.0) {
        return Err(PlayerError::Settings(format!("render length must be >= 0, got {}", seconds)));
    }
    crate::config::validate_speed(config.playback_speed)?;
    if config.sample_rate == 0 {
        return Err(PlayerError::Settings("sample_rate must be > 0".to_string()));
    }
    Ok(())
}
