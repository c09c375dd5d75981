//! Runtime configuration
//!
//! Everything has a default except the API key, which comes from the
//! environment (optionally via a `.env` file).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tts::{PcmFormat, TtsError, TtsResult};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/audio/speech";

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const ENDPOINT_VAR: &str = "OPENAI_TTS_URL";

/// Bytes moved from the drain buffer to the sink per pump tick.
pub const DEFAULT_SLICE_SIZE: usize = 2048;
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_SINK_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_MAX_COMPLETION_DELAY: Duration = Duration::from_secs(600);

#[derive(Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub endpoint: String,
    pub pcm: PcmFormat,
    pub slice_size: usize,
    pub pump_interval: Duration,
    pub sink_buffer_size: usize,
    /// Upper bound on how long completion is waited for after the stream ends
    pub max_completion_delay: Duration,
}

impl TtsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            pcm: PcmFormat::SPEECH_PCM,
            slice_size: DEFAULT_SLICE_SIZE,
            pump_interval: DEFAULT_PUMP_INTERVAL,
            sink_buffer_size: DEFAULT_SINK_BUFFER_SIZE,
            max_completion_delay: DEFAULT_MAX_COMPLETION_DELAY,
        }
    }

    /// Load `.env` if present, then read the key and optional endpoint.
    pub fn from_env() -> TtsResult<Self> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("[Config] Loaded .env from {:?}", path),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("[Config] Could not load .env: {}", e),
        }

        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| TtsError::ConfigError(format!("{} is not set", API_KEY_VAR)))?;

        let mut config = Self::new(api_key);
        if let Ok(endpoint) = std::env::var(ENDPOINT_VAR) {
            config.endpoint = endpoint;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_slice_size(mut self, slice_size: usize) -> Self {
        self.slice_size = slice_size;
        self
    }

    pub fn with_pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval;
        self
    }

    pub fn with_max_completion_delay(mut self, delay: Duration) -> Self {
        self.max_completion_delay = delay;
        self
    }

    pub fn validate(&self) -> TtsResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(TtsError::ConfigError("API key is empty".to_string()));
        }
        if self.pcm.frame_size() == 0 {
            return Err(TtsError::ConfigError("PCM frame size is zero".to_string()));
        }
        if self.slice_size == 0 || self.slice_size % self.pcm.frame_size() != 0 {
            return Err(TtsError::ConfigError(format!(
                "slice size {} is not a positive multiple of the {} byte frame",
                self.slice_size,
                self.pcm.frame_size()
            )));
        }
        if self.pump_interval.is_zero() {
            return Err(TtsError::ConfigError("pump interval is zero".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TtsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsConfig")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("pcm", &self.pcm)
            .field("slice_size", &self.slice_size)
            .field("pump_interval", &self.pump_interval)
            .field("sink_buffer_size", &self.sink_buffer_size)
            .field("max_completion_delay", &self.max_completion_delay)
            .finish()
    }
}
