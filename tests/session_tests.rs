use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use chipdeck::track::build_psid;
use chipdeck::{
    ChipModel, EngineSettings, ManualClock, OfflineDevice, OfflineHandle, PlaybackSession, PlaybackState,
    PlayerError, SessionEvent, TrackFetcher, TrackRequest, TrackSource,
};

const RATE: u32 = 8_000;

/// Serves `Url` sources from memory. A URL registered with `gate` blocks
/// until the test opens it.
#[derive(Default)]
struct MemoryFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl MemoryFetcher {
    fn put(&self, url: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(url.to_string(), bytes);
    }

    fn gate(&self, url: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(url.to_string(), rx);
        tx
    }
}

impl TrackFetcher for MemoryFetcher {
    fn fetch<'a>(&'a self, source: &'a TrackSource) -> BoxFuture<'a, chipdeck::Result<Vec<u8>>> {
        Box::pin(async move {
            if let TrackSource::Bytes { data, .. } = source {
                return Ok(data.to_vec());
            }
            let url = source.url().unwrap_or_default();
            let gate = self.gates.lock().unwrap().remove(&url);
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.files
                .lock()
                .unwrap()
                .get(&url)
                .cloned()
                .ok_or_else(|| PlayerError::fetch(url, "HTTP 404 Not Found"))
        })
    }
}

struct Rig {
    session: Arc<PlaybackSession>,
    clock: Arc<ManualClock>,
    audio: OfflineHandle,
    fetcher: Arc<MemoryFetcher>,
}

fn rig_with(settings: EngineSettings) -> Rig {
    let clock = Arc::new(ManualClock::new());
    let fetcher = Arc::new(MemoryFetcher::default());
    let device = OfflineDevice::new(RATE, 2, 256);
    let audio = device.handle();
    let session = PlaybackSession::builder(settings)
        .device(device)
        .clock(clock.clone())
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    fetcher.put("https://tunes/a.sid", sid("Tune A", 3));
    fetcher.put("https://tunes/b.sid", sid("Tune B", 1));
    Rig { session: Arc::new(session), clock, audio, fetcher }
}

fn rig() -> Rig {
    rig_with(EngineSettings { sample_rate: RATE, ..Default::default() })
}

fn sid(name: &str, songs: u16) -> Vec<u8> {
    let payload: Vec<u8> = (0..330u32).map(|i| (i * 7 + 3) as u8 | 0x80).collect();
    build_psid(name, "Composer", songs, 1, &payload)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

#[tokio::test]
async fn plays_pauses_and_resumes_at_new_speed() {
    let r = rig();
    let track = r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    assert_eq!(track.title, "Tune A");
    assert_eq!(r.session.state(), PlaybackState::Ready);
    assert_relative_eq!(r.session.current_position(), 0.0);

    r.session.play().unwrap();
    assert!(r.audio.is_running());
    r.clock.advance(2.0);
    r.session.pause().unwrap();
    assert_relative_eq!(r.session.current_position(), 2.0);
    assert!(!r.audio.is_running());

    r.session.set_playback_speed(2.0).unwrap();
    r.session.play().unwrap();
    r.clock.advance(1.0);
    assert_relative_eq!(r.session.current_position(), 4.0);
}

#[tokio::test]
async fn pulls_sound_only_while_playing() {
    let r = rig();
    r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    r.session.play().unwrap();
    assert!(r.audio.pull(512).iter().any(|&s| s != 0.0));

    r.session.pause().unwrap();
    assert!(r.audio.pull(512).iter().all(|&s| s == 0.0));

    r.session.play().unwrap();
    assert!(r.audio.pull(512).iter().any(|&s| s != 0.0));
    assert_eq!(r.audio.open_count(), 1);
}

#[tokio::test]
async fn stop_resets_and_tears_down_output() {
    let r = rig();
    r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    r.session.play().unwrap();
    r.clock.advance(3.0);
    r.session.stop().unwrap();

    assert_eq!(r.session.state(), PlaybackState::Stopped);
    assert_relative_eq!(r.session.current_position(), 0.0);
    assert!(!r.audio.is_open());

    r.session.play().unwrap();
    assert!(r.audio.is_open());
    r.clock.advance(0.5);
    assert_relative_eq!(r.session.current_position(), 0.5);
}

#[tokio::test]
async fn newer_load_wins_over_a_slow_one() {
    let r = rig();
    let open_a = r.fetcher.gate("https://tunes/a.sid");

    let session = r.session.clone();
    let slow = tokio::spawn(async move { session.load(TrackRequest::url("https://tunes/a.sid")).await });
    tokio::task::yield_now().await;
    while r.session.state() != PlaybackState::Loading {
        tokio::task::yield_now().await;
    }

    let b = r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    let _ = open_a.send(());

    assert_eq!(slow.await.unwrap(), Err(PlayerError::LoadSuperseded));
    assert_eq!(b.title, "Tune B");
    assert_eq!(r.session.current_track().unwrap().title, "Tune B");
    assert_eq!(r.session.state(), PlaybackState::Ready);
}

#[tokio::test]
async fn stop_cancels_a_pending_load() {
    let r = rig();
    let _gate = r.fetcher.gate("https://tunes/a.sid");

    let session = r.session.clone();
    let pending = tokio::spawn(async move { session.load(TrackRequest::url("https://tunes/a.sid")).await });
    while r.session.state() != PlaybackState::Loading {
        tokio::task::yield_now().await;
    }
    r.session.stop().unwrap();

    assert_eq!(pending.await.unwrap(), Err(PlayerError::LoadCancelled));
    assert_eq!(r.session.state(), PlaybackState::Stopped);
    assert!(r.session.current_track().is_none());
}

#[tokio::test]
async fn close_cancels_a_pending_load() {
    let r = rig();
    let _gate = r.fetcher.gate("https://tunes/a.sid");

    let session = r.session.clone();
    let pending = tokio::spawn(async move { session.load(TrackRequest::url("https://tunes/a.sid")).await });
    while r.session.state() != PlaybackState::Loading {
        tokio::task::yield_now().await;
    }
    r.session.close();

    assert_eq!(pending.await.unwrap(), Err(PlayerError::LoadCancelled));
    assert_eq!(
        r.session.load(TrackRequest::url("https://tunes/b.sid")).await,
        Err(PlayerError::LoadCancelled)
    );
}

#[tokio::test]
async fn failed_load_lands_in_error_and_can_be_retried() {
    let r = rig();
    let mut events = r.session.subscribe();

    let err = r.session.load(TrackRequest::url("https://tunes/missing.sid")).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(r.session.state(), PlaybackState::Error);
    assert_eq!(r.session.last_error(), Some(err.clone()));
    assert!(drain(&mut events).contains(&SessionEvent::Error(err)));

    r.fetcher.put("https://tunes/missing.sid", vec![0u8; 16]);
    let err = r.session.load(TrackRequest::url("https://tunes/missing.sid")).await.unwrap_err();
    assert!(matches!(err, PlayerError::Format(_)));

    r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    assert_eq!(r.session.state(), PlaybackState::Ready);
    assert_eq!(r.session.last_error(), None);
}

#[tokio::test]
async fn finishes_once_and_goes_quiet() {
    let r = rig_with(EngineSettings { sample_rate: RATE, default_duration_secs: 5.0, ..Default::default() });
    let mut events = r.session.subscribe();
    r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    r.session.play().unwrap();

    r.clock.advance(4.0);
    assert!(!r.session.poll_progress().finished);

    r.clock.advance(1.5);
    let progress = r.session.poll_progress();
    assert!(progress.finished);
    assert_eq!(progress.state, PlaybackState::Finished);
    assert_relative_eq!(progress.position, 5.0);
    assert_relative_eq!(progress.percent, 100.0);
    assert!(!r.audio.is_running());
    assert!(r.audio.pull(256).iter().all(|&s| s == 0.0));

    r.clock.advance(1.0);
    assert!(!r.session.poll_progress().finished);
    let finished = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Finished { .. }))
        .count();
    assert_eq!(finished, 1);

    // play from Finished starts over
    r.session.play().unwrap();
    assert_relative_eq!(r.session.current_position(), 0.0);
}

#[tokio::test]
async fn renderer_reaching_the_end_finishes_the_session() {
    let r = rig_with(EngineSettings { sample_rate: RATE, default_duration_secs: 0.1, ..Default::default() });
    r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    r.session.play().unwrap();

    // the clock hasn't moved but the output has consumed the whole tune
    r.audio.pull(RATE as usize);
    assert!(r.session.poll_progress().finished);
    assert_eq!(r.session.state(), PlaybackState::Finished);
}

#[tokio::test]
async fn subtune_changes() {
    let r = rig();
    let track = r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    assert_eq!(track.subtune_count, 3);
    assert_eq!(r.session.subtune(), 0);

    r.session.play().unwrap();
    assert!(matches!(r.session.set_subtune(1), Err(PlayerError::InvalidState { .. })));

    r.clock.advance(2.0);
    r.session.pause().unwrap();
    assert_eq!(
        r.session.set_subtune(3),
        Err(PlayerError::InvalidSubtune { index: 3, count: 3 })
    );
    assert_eq!(r.session.state(), PlaybackState::Paused);
    assert_relative_eq!(r.session.current_position(), 2.0);

    r.session.set_subtune(2).unwrap();
    assert_eq!(r.session.subtune(), 2);
    assert_relative_eq!(r.session.current_position(), 0.0);
}

#[tokio::test]
async fn chip_model_is_visible_immediately() {
    let r = rig();
    let mut events = r.session.subscribe();
    assert_eq!(r.session.get_chip_model(), ChipModel::Mos6581);
    r.session.set_chip_model(ChipModel::Mos8580).unwrap();
    assert_eq!(r.session.get_chip_model(), ChipModel::Mos8580);
    assert_eq!(r.session.config().chip_model, ChipModel::Mos8580);
    assert!(drain(&mut events).contains(&SessionEvent::ChipModelChanged(ChipModel::Mos8580)));
}

#[tokio::test]
async fn lost_device_pauses_and_reports_once() {
    let r = rig();
    let mut events = r.session.subscribe();
    r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    r.session.play().unwrap();
    r.clock.advance(1.0);

    r.audio.unplug();
    let progress = r.session.poll_progress();
    assert_eq!(progress.state, PlaybackState::Paused);
    assert_relative_eq!(progress.position, 1.0);

    let err = r.session.play().unwrap_err();
    assert!(matches!(err, PlayerError::NoActiveDevice(_)));
    assert_eq!(r.session.state(), PlaybackState::Paused);

    r.audio.replug();
    r.session.play().unwrap();
    assert_eq!(r.session.state(), PlaybackState::Playing);

    let lost = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Error(PlayerError::NoActiveDevice(_))))
        .count();
    assert_eq!(lost, 2, "one for the loss, one for the failed resume");
}

#[tokio::test]
async fn missing_backend_reports_not_initialized_once() {
    let session = PlaybackSession::builder(EngineSettings::default())
        .device_factory(|_| Err(PlayerError::Audio("no host audio".into())))
        .fetcher(Arc::new(MemoryFetcher::default()))
        .build()
        .unwrap();
    let mut events = session.subscribe();

    for _ in 0..3 {
        let err = session.load(TrackSource::bytes("x", sid("X", 1))).await.unwrap_err();
        assert!(matches!(err, PlayerError::NotInitialized(_)), "{}", err);
    }
    assert_eq!(session.state(), PlaybackState::Idle);

    let reported = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Error(PlayerError::NotInitialized(_))))
        .count();
    assert_eq!(reported, 1);
}

#[tokio::test]
async fn toggle_flips_between_playing_and_paused() {
    let r = rig();
    r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    r.session.toggle_play_pause().unwrap();
    assert_eq!(r.session.state(), PlaybackState::Playing);
    r.session.toggle_play_pause().unwrap();
    assert_eq!(r.session.state(), PlaybackState::Paused);
}

#[tokio::test]
async fn load_while_playing_stops_first() {
    let r = rig();
    r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    r.session.play().unwrap();
    r.clock.advance(10.0);

    r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    assert_eq!(r.session.state(), PlaybackState::Ready);
    assert_relative_eq!(r.session.current_position(), 0.0);
    assert!(!r.audio.is_open());
}

#[tokio::test]
async fn state_reports_finished_without_polling() {
    let r = rig_with(EngineSettings { sample_rate: RATE, default_duration_secs: 5.0, ..Default::default() });
    let mut events = r.session.subscribe();
    r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    r.session.play().unwrap();

    r.clock.advance(7.0);
    assert_eq!(r.session.state(), PlaybackState::Finished);
    assert_relative_eq!(r.session.current_position(), 5.0);
    assert!(!r.audio.is_running());
    let finished = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Finished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn pause_past_the_end_is_too_late() {
    let r = rig_with(EngineSettings { sample_rate: RATE, default_duration_secs: 5.0, ..Default::default() });
    let mut events = r.session.subscribe();
    r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    r.session.play().unwrap();

    r.clock.advance(7.0);
    assert_eq!(
        r.session.pause(),
        Err(PlayerError::InvalidState { operation: "pause", state: PlaybackState::Finished })
    );
    assert!(!r.session.poll_progress().finished);

    let finished = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Finished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn subtune_change_while_paused_sounds_the_same_whatever_the_host_pulled() {
    let mut outputs = Vec::new();
    for pull_while_paused in [false, true] {
        let r = rig();
        r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
        r.session.play().unwrap();
        r.audio.pull(1000);
        r.session.pause().unwrap();
        if pull_while_paused {
            r.audio.pull(256);
        }
        r.session.set_subtune(1).unwrap();
        r.session.play().unwrap();
        outputs.push(r.audio.pull(512));
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn toggle_is_serialized_with_concurrent_pauses() {
    let r = rig();
    r.session.load(TrackRequest::url("https://tunes/a.sid")).await.unwrap();
    r.session.play().unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let session = Arc::clone(&r.session);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    session.toggle_play_pause().unwrap();
                    let _ = session.pause();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(matches!(r.session.state(), PlaybackState::Playing | PlaybackState::Paused));
}

#[tokio::test]
async fn position_follows_the_output_by_default() {
    let device = OfflineDevice::new(RATE, 2, 256);
    let audio = device.handle();
    let session = PlaybackSession::builder(EngineSettings { sample_rate: RATE, ..Default::default() })
        .device(device)
        .fetcher(Arc::new(MemoryFetcher::default()))
        .build()
        .unwrap();
    session.load(TrackSource::bytes("tune", sid("Tune", 1))).await.unwrap();

    session.play().unwrap();
    assert_relative_eq!(session.current_position(), 0.0);
    audio.pull(RATE as usize / 2);
    assert_relative_eq!(session.current_position(), 0.5);

    session.pause().unwrap();
    audio.pull(RATE as usize);
    assert_relative_eq!(session.current_position(), 0.5);
}

#[tokio::test]
async fn longer_duration_overrides_an_end_already_rendered() {
    let r = rig_with(EngineSettings { sample_rate: RATE, default_duration_secs: 0.1, ..Default::default() });
    r.session.load(TrackRequest::url("https://tunes/b.sid")).await.unwrap();
    r.session.play().unwrap();

    // the output runs past 0.1 s before the new length arrives
    r.audio.pull(RATE as usize);
    r.session.set_duration(10.0).unwrap();

    r.clock.advance(0.5);
    let progress = r.session.poll_progress();
    assert!(!progress.finished);
    assert_eq!(progress.state, PlaybackState::Playing);
    assert!(r.audio.pull(512).iter().any(|&s| s != 0.0));
}
