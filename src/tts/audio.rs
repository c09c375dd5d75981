//! Audio collaborator contracts
//!
//! The controller never touches an audio device directly. It drives a
//! [`StreamingSink`] for raw PCM and a [`ClipPlayer`] for encoded files; the
//! rodio implementations live in `playback`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::voices::ResponseFormat;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Failed to create audio output stream: {0}")]
    StreamError(String),
    #[error("Failed to decode audio: {0}")]
    DecodeError(String),
    #[error("Playback error: {0}")]
    PlaybackError(String),
    #[error("Audio output is not open")]
    NotOpen,
}

/// Layout of headerless PCM audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
}

impl PcmFormat {
    /// What the speech endpoint returns for `response_format: "pcm"`.
    pub const SPEECH_PCM: PcmFormat = PcmFormat {
        sample_rate: 24_000,
        channels: 1,
        bytes_per_sample: 2,
    };

    /// Bytes in one sample frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.frame_size() as u64
    }

    /// Nominal playback time of `bytes` of audio, in whole milliseconds.
    pub fn duration_of(&self, bytes: u64) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(bytes.saturating_mul(1000) / per_second)
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::SPEECH_PCM
    }
}

/// Settings handed to [`StreamingSink::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub format: PcmFormat,
    /// Bytes the sink should hold before it starts emitting sound
    pub buffer_size: usize,
}

/// A device endpoint that accepts raw PCM as it arrives.
///
/// `write` must not block on playback: it hands the bytes to the device and
/// returns, which is why completion has to be estimated separately.
pub trait StreamingSink: Send + Sync {
    fn open(&self) -> Result<(), AudioError>;
    fn configure(&self, config: SinkConfig) -> Result<(), AudioError>;
    fn write(&self, pcm: &[u8]) -> Result<(), AudioError>;

    /// No more writes follow: play out whatever is held back, including a
    /// partly filled prebuffer.
    fn finish(&self) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError>;
    fn close(&self) -> Result<(), AudioError>;
}

/// A player for complete encoded files.
pub trait ClipPlayer: Send + Sync {
    fn open(&self) -> Result<(), AudioError>;
    /// Start playing `audio` and return without waiting for the end.
    fn play(&self, audio: &[u8], format: ResponseFormat) -> Result<(), AudioError>;
    fn stop(&self) -> Result<(), AudioError>;
    fn close(&self) -> Result<(), AudioError>;

    /// Whether the last clip is still audible.
    fn is_playing(&self) -> bool;
}

/// Convert 16-bit signed little-endian PCM to `f32` samples in -1.0..1.0.
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speech_pcm_layout() {
        let format = PcmFormat::SPEECH_PCM;
        assert_eq!(format.frame_size(), 2);
        assert_eq!(format.bytes_per_second(), 48_000);
        assert_eq!(format.duration_of(8192), Duration::from_millis(170));
        assert_eq!(format.duration_of(48_000), Duration::from_secs(1));
    }

    #[test]
    fn test_stereo_frame_size() {
        let format = PcmFormat {
            sample_rate: 44_100,
            channels: 2,
            bytes_per_sample: 2,
        };
        assert_eq!(format.frame_size(), 4);
        assert_eq!(format.bytes_per_second(), 176_400);
    }

    #[test]
    fn test_pcm16_conversion() {
        let bytes = [0x00, 0x80, 0xff, 0x7f, 0x00, 0x00, 0x01];
        let samples = pcm16_to_f32(&bytes);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], -1.0);
        assert!((samples[1] - 32767.0 / 32768.0).abs() < f32::EPSILON);
        assert_eq!(samples[2], 0.0);
    }
}
