//! Playback completion estimate for streamed PCM.
//!
//! Sink writes return as soon as the device has the samples, not when it has
//! played them, so "last byte written" is too early to report completion.
//! The estimate is the nominal duration of everything received, plus the
//! sink's prebuffer latency, minus the time already spent playing. There is
//! no correction for device drift.

use std::time::Duration;
use tokio::time::Instant;

use super::audio::PcmFormat;

#[derive(Debug, Clone, Copy)]
pub struct CompletionEstimator {
    started: Instant,
    format: PcmFormat,
    /// Delay between a write and the sink starting to play it
    latency: Duration,
    max_delay: Duration,
}

impl CompletionEstimator {
    /// Start the clock now.
    pub fn start(format: PcmFormat, max_delay: Duration) -> Self {
        Self::started_at(Instant::now(), format, max_delay)
    }

    pub fn started_at(started: Instant, format: PcmFormat, max_delay: Duration) -> Self {
        Self {
            started,
            format,
            latency: Duration::ZERO,
            max_delay,
        }
    }

    /// Account for audio the sink holds back before it starts playing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Nominal playback time of `total_bytes` of audio.
    pub fn expected_duration(&self, total_bytes: u64) -> Duration {
        self.format.duration_of(total_bytes)
    }

    /// Time left until the device should have played `total_bytes`,
    /// clamped to `0..=max_delay`.
    pub fn remaining(&self, total_bytes: u64) -> Duration {
        self.remaining_at(total_bytes, Instant::now())
    }

    pub fn remaining_at(&self, total_bytes: u64, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.started);
        (self.expected_duration(total_bytes) + self.latency)
            .saturating_sub(elapsed)
            .min(self.max_delay)
    }
}
