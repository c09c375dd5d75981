//! Text-to-speech playback over the speech endpoint
//!
//! Two modes: a complete MP3 file played in one shot, and raw PCM streamed
//! through a drain buffer into a streaming sink while it downloads.

mod audio;
mod buffer;
mod client;
mod error;
mod estimator;
mod player;
mod pump;
mod status;
mod voices;

#[cfg(feature = "playback")]
mod playback;
#[cfg(feature = "playback")]
mod streaming_source;

pub use audio::{pcm16_to_f32, AudioError, ClipPlayer, PcmFormat, SinkConfig, StreamingSink};
pub use buffer::{aligned_len, ChunkAccumulator, ChunkCallback, DrainBuffer};
pub use client::{AudioByteStream, OpenAiSpeechClient, SpeechBody, SpeechRequest, SpeechTransport};
pub use error::{TtsError, TtsResult};
pub use estimator::CompletionEstimator;
pub use player::{PlaybackState, SpeechPlayer};
pub use pump::BufferPump;
pub use status::{PlaybackStatus, StatusChannel};
pub use voices::{ResponseFormat, TtsModel, Voice};

#[cfg(feature = "playback")]
pub use playback::{RodioClipPlayer, RodioStreamSink};
#[cfg(feature = "playback")]
pub use streaming_source::PcmStreamSource;
