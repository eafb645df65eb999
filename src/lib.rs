//  _______          _________ _______  ______   _______  _______  _
// (  ____ \|\     /|\__   __/(  ____ )(  __  \ (  ____ \(  ____ \| \    /\
// | (    \/| )   ( |   ) (   | (    )|| (  \  )| (    \/| (    \/|  \  / /
// | |      | (___) |   | |   | (____)|| |   ) || (__    | |      |  (_/ /
// | |      |  ___  |   | |   |  _____)| |   | ||  __)   | |      |   _ (
// | |      | (   ) |   | |   | (      | |   ) || (      | |      |  ( \ \
// | (____/\| )   ( |___) (___| )      | (__/  )| (____/\| (____/\|  /  \ \
// (_______/|/     \|\_______/|/       (______/ (_______/(_______/|_/    \/

pub mod error;
pub mod utils;
pub mod clock;
pub mod chip;
pub mod waveform;
pub mod voice;
pub mod track;
pub mod pattern;
pub mod loader;
pub mod config;
pub mod settings;
pub mod synth;
pub mod sink;
pub mod device;
pub mod session;
pub mod render;

pub use error::{PlayerError, Result};
pub use chip::{ChipModel, FilterType};
pub use waveform::WaveformType;
pub use track::{SidHeader, Track};
pub use loader::{CatalogEntry, HttpFetcher, TrackFetcher, TrackLoader, TrackRequest, TrackSource};
pub use config::{ConfigPatch, ConfigStore, PlayerConfig, SPEED_PRESETS};
pub use settings::EngineSettings;
pub use synth::SynthesisPipeline;
pub use sink::HostClock;
pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{AudioDevice, CpalDevice, OfflineDevice, OfflineHandle};
pub use session::{PlaybackSession, PlaybackState, Progress, SessionBuilder, SessionEvent};
pub use render::{render_samples, render_to_wav};
