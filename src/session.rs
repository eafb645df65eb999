use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::chip::ChipModel;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigPatch, PlayerConfig, validate_speed};
use crate::device::{AudioDevice, CpalDevice};
use crate::error::{PlayerError, Result};
use crate::loader::{HttpFetcher, TrackFetcher, TrackLoader, TrackRequest};
use crate::settings::EngineSettings;
use crate::sink::{HostClock, SharedPlayback, SinkRenderer, Transport};
use crate::track::Track;
use crate::utils::format_time;

// Position within this of the duration counts as the end.
const END_TOLERANCE: f64 = 1e-3;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Stopped,
    Finished,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TrackLoaded { id: String, title: String, artist: String, subtunes: usize },
    StateChanged { from: PlaybackState, to: PlaybackState },
    ChipModelChanged(ChipModel),
    SpeedChanged(f64),
    Finished { track_id: String },
    Error(PlayerError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub position: f64,
    pub duration: f64,
    pub percent: f64,
    pub state: PlaybackState,
    /// Set on the one poll that noticed the end of the track.
    pub finished: bool,
}

impl Progress {
    pub fn label(&self) -> String {
        format!("{} / {}", format_time(self.position), format_time(self.duration))
    }
}

// How much the renderer has to resync when a transport is published.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Resync {
    Keep,
    Jump,
    Restart,
}

struct SessionInner {
    state: PlaybackState,
    track: Option<Arc<Track>>,
    subtune: usize,
    start_clock_time: f64,
    accumulated_offset: f64,
    duration_seconds: f64,
    epoch: u64,
    restart_epoch: u64,
    load_generation: u64,
    pending_load: Option<oneshot::Sender<PlayerError>>,
    device: Option<Box<dyn AudioDevice>>,
    backend_error: Option<PlayerError>,
    backend_error_reported: bool,
    device_lost_reported: bool,
    fault_reported: bool,
    last_error: Option<PlayerError>,
    closed: bool,
}

type DeviceFactory = Box<dyn FnOnce(&EngineSettings) -> Result<Box<dyn AudioDevice>> + Send>;

pub struct SessionBuilder {
    settings: EngineSettings,
    device: Option<DeviceFactory>,
    fetcher: Option<Arc<dyn TrackFetcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionBuilder {
    pub fn new(settings: EngineSettings) -> Self {
        SessionBuilder { settings, device: None, fetcher: None, clock: None }
    }

    /// Use this device instead of opening the default host output.
    pub fn device(self, device: impl AudioDevice + 'static) -> Self {
        self.device_factory(move |_| Ok(Box::new(device)))
    }

    /// How to acquire the output when the session is built.
    pub fn device_factory(
        mut self,
        factory: impl FnOnce(&EngineSettings) -> Result<Box<dyn AudioDevice>> + Send + 'static,
    ) -> Self {
        self.device = Some(Box::new(factory));
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn TrackFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// A missing audio backend doesn't fail the build: the session comes up
    /// and every `load` reports `NotInitialized`.
    pub fn build(self) -> Result<PlaybackSession> {
        let settings = self.settings;
        settings.validate()?;

        let device = match self.device {
            Some(factory) => factory(&settings),
            None => CpalDevice::open(&settings).map(|d| Box::new(d) as Box<dyn AudioDevice>),
        };
        let (device, backend_error) = match device {
            Ok(device) => (Some(device), None),
            Err(e) => {
                error!("Audio backend unavailable: {}", e);
                let e = match e {
                    PlayerError::NotInitialized(_) => e,
                    other => PlayerError::NotInitialized(other.to_string()),
                };
                (None, Some(e))
            }
        };

        let sample_rate = device.as_ref().map_or(settings.sample_rate, |d| d.sample_rate());
        let config = settings.player_config(sample_rate);
        let shared = Arc::new(SharedPlayback::new(config, settings.default_duration_secs)?);

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(Duration::from_secs(settings.fetch_timeout_secs))?),
        };
        let clock: Arc<dyn Clock> = match (self.clock, &device) {
            (Some(clock), _) => clock,
            (None, Some(_)) => Arc::new(HostClock::new(Arc::clone(&shared), sample_rate)),
            (None, None) => Arc::new(SystemClock::new()),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        debug!("Session ready: {:?}", config);

        Ok(PlaybackSession {
            inner: Mutex::new(SessionInner {
                state: PlaybackState::Idle,
                track: None,
                subtune: 0,
                start_clock_time: 0.0,
                accumulated_offset: 0.0,
                duration_seconds: settings.default_duration_secs,
                epoch: 0,
                restart_epoch: 0,
                load_generation: 0,
                pending_load: None,
                device,
                backend_error,
                backend_error_reported: false,
                device_lost_reported: false,
                fault_reported: false,
                last_error: None,
                closed: false,
            }),
            shared,
            loader: TrackLoader::new(fetcher),
            clock,
            events,
            settings,
        })
    }
}

/// One player: a track, a transport and an output.
///
/// All control calls take `&self` and are serialized on an internal lock, so
/// a session can be shared behind an `Arc`. The audio callback never touches
/// that lock; it reads what the session publishes into `SharedPlayback`.
pub struct PlaybackSession {
    inner: Mutex<SessionInner>,
    shared: Arc<SharedPlayback>,
    loader: TrackLoader,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
    settings: EngineSettings,
}

impl PlaybackSession {
    /// Session on the default (or configured) host output.
    pub fn open(settings: EngineSettings) -> Result<Self> {
        SessionBuilder::new(settings).build()
    }

    pub fn builder(settings: EngineSettings) -> SessionBuilder {
        SessionBuilder::new(settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn state(&self) -> PlaybackState {
        let mut inner = self.lock();
        self.check_end(&mut inner, self.clock.now());
        inner.state
    }

    pub fn current_track(&self) -> Option<Arc<Track>> {
        self.lock().track.clone()
    }

    pub fn subtune(&self) -> usize {
        self.lock().subtune
    }

    pub fn duration(&self) -> f64 {
        self.lock().duration_seconds
    }

    pub fn last_error(&self) -> Option<PlayerError> {
        self.lock().last_error.clone()
    }

    pub fn config(&self) -> PlayerConfig {
        self.shared.config().get()
    }

    /// Frames handed to the output so far, silence included.
    pub fn frames_rendered(&self) -> u64 {
        self.shared.frames_rendered()
    }

    pub async fn load(&self, request: impl Into<TrackRequest>) -> Result<Arc<Track>> {
        let request = request.into();

        let (generation, cancelled) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PlayerError::LoadCancelled);
            }
            if let Some(e) = inner.backend_error.clone() {
                if !inner.backend_error_reported {
                    inner.backend_error_reported = true;
                    self.emit(SessionEvent::Error(e.clone()));
                }
                return Err(e);
            }
            self.check_end(&mut inner, self.clock.now());
            if matches!(inner.state, PlaybackState::Playing | PlaybackState::Paused) {
                self.halt_output(&mut inner);
            }
            if let Some(previous) = inner.pending_load.take() {
                let _ = previous.send(PlayerError::LoadSuperseded);
            }

            inner.load_generation += 1;
            let (tx, rx) = oneshot::channel();
            inner.pending_load = Some(tx);
            inner.track = None;
            self.shared.set_track(None);
            self.commit(&mut inner, PlaybackState::Loading, Resync::Restart);
            (inner.load_generation, rx)
        };

        let result = tokio::select! {
            loaded = self.loader.load(&request) => loaded,
            reason = cancelled => Err(reason.unwrap_or(PlayerError::LoadCancelled)),
        };

        let mut inner = self.lock();
        if inner.load_generation != generation {
            debug!("Discarding stale load of {}", request.source.describe());
            return Err(match result {
                Err(PlayerError::LoadCancelled) => PlayerError::LoadCancelled,
                _ => PlayerError::LoadSuperseded,
            });
        }
        inner.pending_load = None;

        match result {
            Ok(track) => {
                let track = Arc::new(track);
                inner.subtune = track.default_subtune;
                inner.accumulated_offset = 0.0;
                inner.duration_seconds = self.settings.default_duration_secs;
                inner.track = Some(Arc::clone(&track));
                inner.last_error = None;
                self.shared.set_track(Some(Arc::clone(&track)));
                self.commit(&mut inner, PlaybackState::Ready, Resync::Restart);
                self.emit(SessionEvent::TrackLoaded {
                    id: track.id.clone(),
                    title: track.title.clone(),
                    artist: track.artist.clone(),
                    subtunes: track.subtune_count,
                });
                Ok(track)
            }
            Err(e) => {
                warn!("Load of {} failed: {}", request.source.describe(), e);
                inner.last_error = Some(e.clone());
                self.commit(&mut inner, PlaybackState::Error, Resync::Keep);
                self.emit(SessionEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    pub fn play(&self) -> Result<()> {
        let mut inner = self.lock();
        self.check_end(&mut inner, self.clock.now());
        self.play_locked(&mut inner)
    }

    /// Freezes the position. The state flips before the device is
    /// suspended, so every buffer requested afterwards is silence; a buffer
    /// the host already queued plays out.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = self.clock.now();
        self.check_end(&mut inner, now);
        self.pause_locked(&mut inner, now)
    }

    pub fn toggle_play_pause(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = self.clock.now();
        self.check_end(&mut inner, now);
        if inner.state == PlaybackState::Playing {
            self.pause_locked(&mut inner, now)
        } else {
            self.play_locked(&mut inner)
        }
    }

    fn play_locked(&self, inner: &mut SessionInner) -> Result<()> {
        let from = inner.state;
        match from {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Ready | PlaybackState::Paused | PlaybackState::Stopped | PlaybackState::Finished => {}
            state => return Err(PlayerError::InvalidState { operation: "play", state }),
        }
        if inner.track.is_none() {
            return Err(PlayerError::InvalidState { operation: "play", state: from });
        }

        let sync = if from == PlaybackState::Paused {
            Resync::Jump
        } else {
            inner.accumulated_offset = 0.0;
            Resync::Restart
        };
        inner.start_clock_time = self.clock.now();
        self.commit(inner, PlaybackState::Playing, sync);

        if let Err(e) = self.start_output(inner) {
            warn!("Output unavailable: {}", e);
            self.commit(inner, PlaybackState::Paused, Resync::Keep);
            inner.last_error = Some(e.clone());
            self.emit(SessionEvent::Error(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    fn pause_locked(&self, inner: &mut SessionInner, now: f64) -> Result<()> {
        if inner.state != PlaybackState::Playing {
            return Err(PlayerError::InvalidState { operation: "pause", state: inner.state });
        }
        self.bank(inner, now);
        self.commit(inner, PlaybackState::Paused, Resync::Jump);
        self.suspend_output(inner);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        self.check_end(&mut inner, self.clock.now());
        if inner.state == PlaybackState::Idle {
            return Err(PlayerError::InvalidState { operation: "stop", state: inner.state });
        }
        self.cancel_pending(&mut inner, PlayerError::LoadCancelled);
        self.halt_output(&mut inner);
        self.commit(&mut inner, PlaybackState::Stopped, Resync::Restart);
        Ok(())
    }

    pub fn set_subtune(&self, index: usize) -> Result<()> {
        let mut inner = self.lock();
        self.check_end(&mut inner, self.clock.now());
        match inner.state {
            PlaybackState::Ready | PlaybackState::Paused | PlaybackState::Stopped => {}
            state => return Err(PlayerError::InvalidState { operation: "set subtune", state }),
        }
        let count = match &inner.track {
            Some(track) => track.subtune_count,
            None => return Err(PlayerError::InvalidState { operation: "set subtune", state: inner.state }),
        };
        if index >= count {
            return Err(PlayerError::InvalidSubtune { index, count });
        }

        inner.subtune = index;
        inner.accumulated_offset = 0.0;
        let state = inner.state;
        self.commit(&mut inner, state, Resync::Restart);
        info!("Subtune {}/{}", index + 1, count);
        Ok(())
    }

    /// Overrides the play length, e.g. from a song-length database.
    pub fn set_duration(&self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(PlayerError::Settings(format!("duration must be > 0, got {}", seconds)));
        }
        let mut inner = self.lock();
        let state = inner.state;
        let sync = if state == PlaybackState::Playing {
            // a new epoch drops any end marker the renderer set for the old length
            let now = self.clock.now();
            self.bank(&mut inner, now);
            inner.start_clock_time = now;
            Resync::Jump
        } else {
            Resync::Keep
        };
        inner.duration_seconds = seconds;
        self.commit(&mut inner, state, sync);
        Ok(())
    }

    pub fn current_position(&self) -> f64 {
        let mut inner = self.lock();
        let now = self.clock.now();
        self.check_end(&mut inner, now);
        self.position(&inner, now).clamp(0.0, inner.duration_seconds)
    }

    /// The periodic control-path tick: reports the position and handles
    /// end of track, lost devices and render faults.
    pub fn poll_progress(&self) -> Progress {
        let mut inner = self.lock();
        let now = self.clock.now();

        if self.shared.take_device_lost() {
            let e = PlayerError::NoActiveDevice("output device lost".to_string());
            if inner.state == PlaybackState::Playing {
                self.bank(&mut inner, now);
                self.commit(&mut inner, PlaybackState::Paused, Resync::Jump);
                self.suspend_output(&mut inner);
            }
            if !inner.device_lost_reported {
                inner.device_lost_reported = true;
                warn!("{}", e);
                inner.last_error = Some(e.clone());
                self.emit(SessionEvent::Error(e));
            }
        }

        let faults = self.shared.take_faults();
        if faults > 0 {
            if !inner.fault_reported {
                inner.fault_reported = true;
                warn!("{} output buffer(s) replaced with silence", faults);
                self.emit(SessionEvent::Error(PlayerError::Audio(format!(
                    "{} output buffer(s) replaced with silence",
                    faults
                ))));
            }
        } else {
            inner.fault_reported = false;
        }

        let finished = self.check_end(&mut inner, now);

        let duration = inner.duration_seconds;
        let position = self.position(&inner, now).clamp(0.0, duration);
        Progress {
            position,
            duration,
            percent: if duration > 0.0 { position / duration * 100.0 } else { 0.0 },
            state: inner.state,
            finished,
        }
    }

    pub fn get_chip_model(&self) -> ChipModel {
        self.shared.config().get().chip_model
    }

    pub fn set_chip_model(&self, model: ChipModel) -> Result<()> {
        let mut inner = self.lock();
        self.check_end(&mut inner, self.clock.now());
        self.shared.config().set(ConfigPatch::chip_model(model))?;
        info!("Chip model {}", model);
        self.emit(SessionEvent::ChipModelChanged(model));
        Ok(())
    }

    pub fn get_playback_speed(&self) -> f64 {
        self.shared.config().get().playback_speed
    }

    pub fn set_playback_speed(&self, speed: f64) -> Result<()> {
        let speed = validate_speed(speed)?;
        let mut inner = self.lock();
        let now = self.clock.now();
        self.check_end(&mut inner, now);
        if inner.state == PlaybackState::Playing {
            // time so far counts at the old speed
            self.bank(&mut inner, now);
            inner.start_clock_time = now;
        }
        self.shared.config().set(ConfigPatch::playback_speed(speed))?;
        info!("Playback speed {}x", speed);
        self.emit(SessionEvent::SpeedChanged(speed));
        Ok(())
    }

    /// Cancels a pending load and shuts the output down. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.cancel_pending(&mut inner, PlayerError::LoadCancelled);
        if let Some(device) = inner.device.as_mut() {
            device.close();
        }
        inner.device = None;
        self.shared.set_track(None);
        debug!("Session closed");
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn speed(&self) -> f64 {
        self.shared.config().get().playback_speed
    }

    // Unclamped.
    fn position(&self, inner: &SessionInner, now: f64) -> f64 {
        let open = if inner.state == PlaybackState::Playing {
            (now - inner.start_clock_time).max(0.0) * self.speed()
        } else {
            0.0
        };
        inner.accumulated_offset + open
    }

    fn bank(&self, inner: &mut SessionInner, now: f64) {
        inner.accumulated_offset = self.position(inner, now).min(inner.duration_seconds);
    }

    /// Playing becomes Finished once the clock or the renderer reaches the
    /// end. Runs at the top of every control call, so no caller can observe
    /// Playing past the end. True on the call that made the transition.
    fn check_end(&self, inner: &mut SessionInner, now: f64) -> bool {
        if inner.state != PlaybackState::Playing {
            return false;
        }
        let position = self.position(inner, now);
        if position + END_TOLERANCE < inner.duration_seconds && !self.shared.ended_in(inner.epoch) {
            return false;
        }
        inner.accumulated_offset = inner.duration_seconds;
        self.commit(inner, PlaybackState::Finished, Resync::Keep);
        self.suspend_output(inner);
        let track_id = inner.track.as_ref().map(|t| t.id.clone()).unwrap_or_default();
        info!("Finished {}", track_id);
        self.emit(SessionEvent::Finished { track_id });
        true
    }

    fn commit(&self, inner: &mut SessionInner, to: PlaybackState, sync: Resync) {
        if sync != Resync::Keep {
            inner.epoch += 1;
        }
        if sync == Resync::Restart {
            inner.restart_epoch = inner.epoch;
        }
        self.shared.publish(Transport {
            state: to,
            epoch: inner.epoch,
            restart_epoch: inner.restart_epoch,
            start_offset: inner.accumulated_offset,
            duration: inner.duration_seconds,
            subtune: inner.subtune,
        });

        let from = inner.state;
        if from != to {
            inner.state = to;
            debug!("{:?} -> {:?}", from, to);
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    fn start_output(&self, inner: &mut SessionInner) -> Result<()> {
        let Some(device) = inner.device.as_mut() else {
            return Err(inner
                .backend_error
                .clone()
                .unwrap_or_else(|| PlayerError::NotInitialized("no audio device".to_string())));
        };
        if !device.is_open() {
            let renderer = SinkRenderer::new(
                Arc::clone(&self.shared),
                device.sample_rate(),
                device.channels(),
                device.block_size(),
            );
            device.open(renderer)?;
            debug!("Output stream opened");
        }
        device.resume()?;
        inner.device_lost_reported = false;
        Ok(())
    }

    fn suspend_output(&self, inner: &mut SessionInner) {
        if let Some(device) = inner.device.as_mut() {
            if let Err(e) = device.suspend() {
                warn!("Suspending output failed: {}", e);
            }
        }
    }

    // Back to position zero with the stream torn down.
    fn halt_output(&self, inner: &mut SessionInner) {
        inner.accumulated_offset = 0.0;
        if let Some(device) = inner.device.as_mut() {
            if device.is_open() {
                device.close();
                debug!("Output stream closed");
            }
        }
    }

    fn cancel_pending(&self, inner: &mut SessionInner, reason: PlayerError) {
        if let Some(pending) = inner.pending_load.take() {
            let _ = pending.send(reason);
        }
        inner.load_generation += 1;
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.close();
    }
}
