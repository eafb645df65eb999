use thiserror::Error;

use crate::session::PlaybackState;

pub type Result<T> = std::result::Result<T, PlayerError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlayerError {
    /// Network or IO failure while fetching track bytes. Retryable.
    #[error("Fetch Error: {source_desc}: {reason}")]
    Fetch { source_desc: String, reason: String },

    /// The bytes are not a playable SID file. Retrying with the same bytes won't help.
    #[error("Format Error: {0}")]
    Format(String),

    #[error("Not Initialized: audio backend unavailable ({0})")]
    NotInitialized(String),

    #[error("Invalid Subtune: {index} (track has {count})")]
    InvalidSubtune { index: usize, count: usize },

    #[error("No Active Device: {0}")]
    NoActiveDevice(String),

    #[error("Invalid State: cannot {operation} while {state:?}")]
    InvalidState { operation: &'static str, state: PlaybackState },

    #[error("Invalid Speed: {0} (must be finite and > 0)")]
    InvalidSpeed(f64),

    #[error("Load superseded by a newer request")]
    LoadSuperseded,

    #[error("Load cancelled")]
    LoadCancelled,

    #[error("Audio Error: {0}")]
    Audio(String),

    #[error("Settings Error: {0}")]
    Settings(String),

    #[error("Wav Error: {0}")]
    Wav(String),
}

impl PlayerError {
    pub fn fetch(source_desc: impl Into<String>, reason: impl ToString) -> Self {
        PlayerError::Fetch { source_desc: source_desc.into(), reason: reason.to_string() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PlayerError::Fetch { .. })
    }
}

impl From<hound::Error> for PlayerError {
    fn from(e: hound::Error) -> Self {
        PlayerError::Wav(e.to_string())
    }
}
