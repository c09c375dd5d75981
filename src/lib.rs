//! Speech Player
//!
//! Turns text into audio through the OpenAI speech API and plays it, either
//! as a downloaded MP3 clip or as PCM streamed into the output device while
//! it is still arriving.

pub mod config;
pub mod tts;

pub use config::TtsConfig;
pub use tts::{
    PlaybackState, PlaybackStatus, SpeechPlayer, SpeechRequest, TtsError, TtsModel, TtsResult,
    Voice,
};
