use thiserror::Error;

use super::audio::AudioError;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("Speech API returned {status}: {body}")]
    RemoteServiceError { status: u16, body: String },
    #[error("Streaming playback failed: {0}")]
    StreamPlaybackError(String),
    #[error("Network error: {0}")]
    TransportError(String),
    #[error(transparent)]
    AudioError(#[from] AudioError),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Speech player is busy with another request")]
    Busy,
    #[error("Speech player has been disposed")]
    Disposed,
}

impl TtsError {
    /// HTTP status for remote service failures.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::RemoteServiceError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type TtsResult<T> = Result<T, TtsError>;
