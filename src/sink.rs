//! The output sink adapter: what runs inside the host's audio callback.
//!
//! Everything the callback reads comes out of `SharedPlayback` through
//! lock-free loads (`ArcSwap` snapshots and atomics). It never allocates,
//! locks, logs or does IO. Faults become silence plus a counter that the
//! control path reports later.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::clock::Clock;
use crate::config::{ConfigStore, PlayerConfig};
use crate::error::Result;
use crate::session::PlaybackState;
use crate::synth::{CHANNELS, SynthesisPipeline};
use crate::track::Track;

const NO_EPOCH: u64 = u64::MAX;

/// What the control path tells the renderer about playback, published as one unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transport {
    pub state: PlaybackState,
    /// Bumped whenever the renderer has to jump to `start_offset`.
    pub epoch: u64,
    /// Epoch of the latest restart. Carried forward by later jumps, so a
    /// renderer that skips epochs still resets oscillators and filter.
    pub restart_epoch: u64,
    pub start_offset: f64,
    pub duration: f64,
    pub subtune: usize,
}

/// State shared between the session (sole writer) and the audio callback.
pub struct SharedPlayback {
    transport: ArcSwap<Transport>,
    track: ArcSwapOption<Track>,
    config: ConfigStore,
    faults: AtomicU64,
    device_lost: AtomicBool,
    ended_epoch: AtomicU64,
    frames_rendered: AtomicU64,
}

impl SharedPlayback {
    pub fn new(config: PlayerConfig, duration: f64) -> Result<Self> {
        Ok(SharedPlayback {
            transport: ArcSwap::from_pointee(Transport {
                state: PlaybackState::Idle,
                epoch: 0,
                restart_epoch: 0,
                start_offset: 0.0,
                duration,
                subtune: 0,
            }),
            track: ArcSwapOption::empty(),
            config: ConfigStore::new(config)?,
            faults: AtomicU64::new(0),
            device_lost: AtomicBool::new(false),
            ended_epoch: AtomicU64::new(NO_EPOCH),
            frames_rendered: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn transport(&self) -> Transport {
        **self.transport.load()
    }

    pub(crate) fn publish(&self, transport: Transport) {
        self.transport.store(Arc::new(transport));
    }

    pub(crate) fn set_track(&self, track: Option<Arc<Track>>) {
        self.track.store(track);
    }

    pub(crate) fn take_faults(&self) -> u64 {
        self.faults.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn take_device_lost(&self) -> bool {
        self.device_lost.swap(false, Ordering::AcqRel)
    }

    /// True once the renderer has run past the end of the track for `epoch`.
    pub(crate) fn ended_in(&self, epoch: u64) -> bool {
        self.ended_epoch.load(Ordering::Acquire) == epoch
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }
}

/// Cloneable handle the device uses to report trouble from outside the render callback.
#[derive(Clone)]
pub struct SinkMonitor {
    shared: Arc<SharedPlayback>,
}

impl SinkMonitor {
    pub fn mark_device_lost(&self) {
        self.shared.device_lost.store(true, Ordering::Release);
    }

    pub fn record_fault(&self) {
        self.shared.faults.fetch_add(1, Ordering::AcqRel);
    }
}

/// The host audio clock: frames handed to the output over the sample rate.
/// Stands still while the device is suspended or gone.
pub struct HostClock {
    shared: Arc<SharedPlayback>,
    sample_rate: f64,
}

impl HostClock {
    pub fn new(shared: Arc<SharedPlayback>, sample_rate: u32) -> Self {
        HostClock { shared, sample_rate: sample_rate.max(1) as f64 }
    }
}

impl Clock for HostClock {
    fn now(&self) -> f64 {
        self.shared.frames_rendered() as f64 / self.sample_rate
    }
}

pub struct SinkRenderer {
    shared: Arc<SharedPlayback>,
    pipeline: SynthesisPipeline,
    channels: usize,
    scratch: Vec<f32>,
    epoch: u64,
    restart_epoch: u64,
    track_time: f64,
}

impl SinkRenderer {
    /// `max_frames` sizes the internal stereo scratch; larger host buffers are
    /// rendered in several passes rather than by growing it.
    pub fn new(shared: Arc<SharedPlayback>, sample_rate: u32, channels: u16, max_frames: u32) -> Self {
        SinkRenderer {
            shared,
            pipeline: SynthesisPipeline::new(sample_rate),
            channels: channels.max(1) as usize,
            scratch: vec![0.0; max_frames.max(1) as usize * CHANNELS],
            epoch: NO_EPOCH,
            restart_epoch: NO_EPOCH,
            track_time: 0.0,
        }
    }

    pub fn monitor(&self) -> SinkMonitor {
        SinkMonitor { shared: Arc::clone(&self.shared) }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Track time the next buffer starts at.
    pub fn track_time(&self) -> f64 {
        self.track_time
    }

    /// The host callback. Always fills `out` completely.
    pub fn render(&mut self, out: &mut [f32]) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.fill(out)));
        if !matches!(result, Ok(true)) {
            out.fill(0.0);
            self.shared.faults.fetch_add(1, Ordering::AcqRel);
        }
        self.shared
            .frames_rendered
            .fetch_add((out.len() / self.channels) as u64, Ordering::Relaxed);
    }

    // false when the block had to be thrown away
    fn fill(&mut self, out: &mut [f32]) -> bool {
        let transport = **self.shared.transport.load();
        if transport.epoch != self.epoch {
            self.epoch = transport.epoch;
            self.track_time = transport.start_offset;
            if transport.restart_epoch != self.restart_epoch {
                self.restart_epoch = transport.restart_epoch;
                self.pipeline.reset();
            }
        }

        if transport.state != PlaybackState::Playing {
            out.fill(0.0);
            return true;
        }

        let track_guard = self.shared.track.load();
        let Some(track) = track_guard.as_ref() else {
            out.fill(0.0);
            return true;
        };
        let config = self.shared.config.snapshot();

        let channels = self.channels;
        let total = out.len() / channels;
        let per_pass = self.scratch.len() / CHANNELS;
        let mut done = 0;

        while done < total {
            if self.track_time >= transport.duration {
                out[done * channels..].fill(0.0);
                self.shared.ended_epoch.store(transport.epoch, Ordering::Release);
                return true;
            }

            let n = (total - done).min(per_pass);
            let stereo = &mut self.scratch[..n * CHANNELS];
            self.track_time += self.pipeline.render(track, &config, transport.subtune, self.track_time, stereo);
            if stereo.iter().any(|s| !s.is_finite()) {
                return false;
            }

            let dst = &mut out[done * channels..(done + n) * channels];
            for (frame, src) in dst.chunks_exact_mut(channels).zip(stereo.chunks_exact(CHANNELS)) {
                if channels == 1 {
                    frame[0] = (src[0] + src[1]) * 0.5;
                } else {
                    frame[0] = src[0];
                    frame[1] = src[1];
                    frame[2..].fill(0.0);
                }
            }
            done += n;
        }

        out[total * channels..].fill(0.0);
        true
    }
}
