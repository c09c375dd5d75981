//! Speech playback controller
//!
//! Owns one streaming sink and one clip player and runs at most one speak
//! call at a time. Every call moves through
//! `Idle -> Fetching -> Playing -> Stopped | Completed`, and each status is
//! emitted on the [`StatusChannel`] while the session lock is held, so
//! observers never see `completed` after `stopped` for the same call.

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::audio::{AudioError, ClipPlayer, SinkConfig, StreamingSink};
use super::buffer::{ChunkAccumulator, ChunkCallback, DrainBuffer};
use super::client::{OpenAiSpeechClient, SpeechRequest, SpeechTransport};
use super::error::{TtsError, TtsResult};
use super::estimator::CompletionEstimator;
use super::pump::BufferPump;
use super::status::{PlaybackStatus, StatusChannel};
use super::voices::ResponseFormat;
use crate::config::TtsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Fetching,
    Playing,
    Stopped,
    Completed,
}

/// Mutable state of the current (or last) speak call.
struct Session {
    state: PlaybackState,
    cancel: CancellationToken,
    pump: Option<BufferPump>,
    completion: Option<JoinHandle<()>>,
    sink_open: bool,
    clip_open: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            state: PlaybackState::Idle,
            cancel: CancellationToken::new(),
            pump: None,
            completion: None,
            sink_open: false,
            clip_open: false,
        }
    }

    fn has_timers(&self) -> bool {
        self.pump.is_some() || self.completion.is_some()
    }
}

struct Inner {
    config: TtsConfig,
    transport: Arc<dyn SpeechTransport>,
    sink: Arc<dyn StreamingSink>,
    clip: Arc<dyn ClipPlayer>,
    status: StatusChannel,
    session: Mutex<Session>,
    in_flight: AtomicBool,
    disposed: AtomicBool,
}

/// Clears the in-flight flag when the speak call returns.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum ReadOutcome {
    Finished,
    Cancelled,
    Failed(TtsError),
}

/// Chunk failures surface as `StreamPlaybackError`, without wrapping one
/// that already is.
fn playback_failure(e: TtsError) -> TtsError {
    match e {
        TtsError::StreamPlaybackError(_) => e,
        other => TtsError::StreamPlaybackError(other.to_string()),
    }
}

/// Text-to-speech player.
///
/// Cheap to clone; clones share the same devices and status channel, which
/// is how a second task calls [`stop_player`](Self::stop_player) while a
/// speak call is running.
#[derive(Clone)]
pub struct SpeechPlayer {
    inner: Arc<Inner>,
}

impl SpeechPlayer {
    /// Player on the default output device using the HTTP client.
    #[cfg(feature = "playback")]
    pub fn new(config: TtsConfig) -> TtsResult<Self> {
        let transport = Arc::new(OpenAiSpeechClient::new(&config));
        Self::with_backends(
            config,
            transport,
            Arc::new(super::playback::RodioStreamSink::new()),
            Arc::new(super::playback::RodioClipPlayer::new()),
        )
    }

    /// Player with the HTTP client and caller-supplied audio backends.
    pub fn with_audio(
        config: TtsConfig,
        sink: Arc<dyn StreamingSink>,
        clip: Arc<dyn ClipPlayer>,
    ) -> TtsResult<Self> {
        let transport = Arc::new(OpenAiSpeechClient::new(&config));
        Self::with_backends(config, transport, sink, clip)
    }

    pub fn with_backends(
        config: TtsConfig,
        transport: Arc<dyn SpeechTransport>,
        sink: Arc<dyn StreamingSink>,
        clip: Arc<dyn ClipPlayer>,
    ) -> TtsResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                sink,
                clip,
                status: StatusChannel::new(),
                session: Mutex::new(Session::new()),
                in_flight: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Subscribe to status transitions emitted from now on.
    pub fn status_stream(&self) -> broadcast::Receiver<PlaybackStatus> {
        self.inner.status.subscribe()
    }

    /// Current state. A clip that has played out reads as `Completed`.
    pub fn status(&self) -> PlaybackState {
        let mut session = self.inner.session();
        self.inner.settle_clip(&mut session);
        session.state
    }

    pub fn is_playing(&self) -> bool {
        self.status() == PlaybackState::Playing
    }

    /// Whether a pump or completion timer is still alive.
    pub fn has_active_timers(&self) -> bool {
        self.inner.session().has_timers()
    }

    /// Stream PCM from the endpoint into the streaming sink.
    ///
    /// Returns once the response has been fully read and the final
    /// `completed` notification is scheduled. A [`stop_player`] during the
    /// call ends it early with `Ok(())`.
    ///
    /// [`stop_player`]: Self::stop_player
    pub async fn stream_speak(
        &self,
        request: SpeechRequest,
        on_chunk: Option<ChunkCallback>,
    ) -> TtsResult<()> {
        let inner = &self.inner;
        let _guard = inner.enter()?;
        let cancel = inner.begin(true);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            opened = inner.transport.stream_audio(&request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                inner.abort_with_error();
                return Err(e);
            }
        };

        let buffer = DrainBuffer::new();
        let estimator = {
            let mut session = inner.session();
            if session.state != PlaybackState::Fetching || cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = inner.start_sink(&mut session, &buffer) {
                drop(session);
                inner.abort_with_error();
                return Err(e);
            }
            session.state = PlaybackState::Playing;
            inner.status.emit(PlaybackStatus::Playing);
            CompletionEstimator::start(inner.config.pcm, inner.config.max_completion_delay)
                .with_latency(
                    inner
                        .config
                        .pcm
                        .duration_of(inner.config.sink_buffer_size as u64),
                )
        };

        let mut accumulator =
            ChunkAccumulator::new(buffer, inner.config.pcm.frame_size(), on_chunk);

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ReadOutcome::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => accumulator.accept(&chunk),
                Some(Err(e)) => break ReadOutcome::Failed(playback_failure(e)),
                None => break ReadOutcome::Finished,
            }
            if let Some(e) = inner.pump_error() {
                break ReadOutcome::Failed(TtsError::StreamPlaybackError(e));
            }
        };

        match outcome {
            ReadOutcome::Cancelled => {
                // The sink was stopped by whoever cancelled
                accumulator.discard();
                log::info!(
                    "[Player] Stream cancelled after {} bytes",
                    accumulator.total_bytes()
                );
                Ok(())
            }
            ReadOutcome::Failed(e) => {
                accumulator.discard();
                log::warn!("[Player] Stream failed: {}", e);
                inner.abort_with_error();
                Err(e)
            }
            ReadOutcome::Finished => {
                let total = accumulator.total_bytes();
                let mut session = inner.session();
                if session.state != PlaybackState::Playing || cancel.is_cancelled() {
                    accumulator.discard();
                    return Ok(());
                }

                let flushed = accumulator
                    .flush(inner.sink.as_ref())
                    .and_then(|_| inner.sink.finish());
                let pump_failure = session.pump.as_ref().and_then(|p| p.take_error());
                if let Some(e) = flushed.err().map(|e| e.to_string()).or(pump_failure) {
                    drop(session);
                    log::warn!("[Player] Sink write failed: {}", e);
                    inner.abort_with_error();
                    return Err(TtsError::StreamPlaybackError(e));
                }

                let remaining = estimator.remaining(total);
                log::info!(
                    "[Player] Stream finished: {} bytes, completion in {:?}",
                    total,
                    remaining
                );

                if remaining.is_zero() {
                    inner.complete_locked(&mut session);
                } else {
                    let task_inner = Arc::clone(inner);
                    let task_cancel = cancel.clone();
                    session.completion = Some(tokio::spawn(async move {
                        tokio::time::sleep(remaining).await;
                        task_inner.complete(&task_cancel);
                    }));
                }
                Ok(())
            }
        }
    }

    /// Fetch the whole MP3 file, start playing it and return its bytes.
    ///
    /// Emits `playing` once the clip starts; there is no `completed` for
    /// clips. If the fetch fails nothing is emitted and no player is touched.
    pub async fn create_speak(
        &self,
        request: SpeechRequest,
        on_chunk: Option<ChunkCallback>,
    ) -> TtsResult<Bytes> {
        let inner = &self.inner;
        let _guard = inner.enter()?;
        let cancel = inner.begin(false);

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Bytes::new()),
            fetched = inner.transport.fetch_audio(&request) => fetched,
        };
        let audio = match fetched {
            Ok(audio) => audio,
            Err(e) => {
                inner.reset_quietly();
                return Err(e);
            }
        };

        if let Some(callback) = on_chunk.as_ref() {
            callback(&audio);
        }

        let fetching = inner.session().state == PlaybackState::Fetching;
        if !fetching || cancel.is_cancelled() {
            return Ok(audio);
        }

        // Opening the device and decoding block, so run them off the
        // runtime and without the session lock
        let clip = Arc::clone(&inner.clip);
        let clip_audio = audio.clone();
        let started = tokio::task::spawn_blocking(move || {
            clip.open().map_err(|e| (false, e))?;
            clip.play(&clip_audio, ResponseFormat::Mp3)
                .map_err(|e| (true, e))
        })
        .await
        .unwrap_or_else(|e| Err((false, AudioError::PlaybackError(e.to_string()))));
        let (opened, started) = match started {
            Ok(()) => (true, Ok(())),
            Err((opened, e)) => (opened, Err(e)),
        };

        let mut session = inner.session();
        if session.state != PlaybackState::Fetching || cancel.is_cancelled() {
            // Stopped while the clip was starting
            if opened {
                if let Err(e) = inner.clip.stop() {
                    log::warn!("[Player] Failed to stop clip: {}", e);
                }
            }
            return Ok(audio);
        }

        session.clip_open = opened;
        if let Err(e) = started {
            inner.halt(&mut session);
            session.state = PlaybackState::Idle;
            return Err(e.into());
        }

        session.state = PlaybackState::Playing;
        inner.status.emit(PlaybackStatus::Playing);
        log::info!("[Player] Playing {} byte clip", audio.len());
        Ok(audio)
    }

    /// Stop whatever is fetching or playing. Emits `stopped` once if a call
    /// was active; otherwise does nothing.
    pub async fn stop_player(&self) -> TtsResult<()> {
        self.inner.stop();
        Ok(())
    }

    /// Stop playback, close the devices and the status channel. Idempotent.
    pub async fn dispose(&self) -> TtsResult<()> {
        self.inner.dispose();
        Ok(())
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        // Session updates are single assignments, so a poisoned lock still
        // holds consistent state
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self) -> TtsResult<InFlight<'_>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TtsError::Disposed);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TtsError::Busy);
        }
        Ok(InFlight(&self.in_flight))
    }

    /// Tear down what the previous call left running and enter `Fetching`
    /// with a fresh cancellation token.
    fn begin(&self, announce: bool) -> CancellationToken {
        let mut session = self.session();
        self.settle_clip(&mut session);
        if matches!(
            session.state,
            PlaybackState::Fetching | PlaybackState::Playing
        ) {
            self.halt(&mut session);
            self.status.emit(PlaybackStatus::Stopped);
        }
        session.cancel = CancellationToken::new();
        session.state = PlaybackState::Fetching;
        if announce {
            self.status.emit(PlaybackStatus::Fetching);
        }
        session.cancel.clone()
    }

    fn start_sink(&self, session: &mut Session, buffer: &DrainBuffer) -> TtsResult<()> {
        self.sink.open()?;
        session.sink_open = true;
        self.sink.configure(SinkConfig {
            format: self.config.pcm,
            buffer_size: self.config.sink_buffer_size,
        })?;
        session.pump = Some(BufferPump::start(
            buffer.clone(),
            Arc::clone(&self.sink),
            self.config.slice_size,
            self.config.pump_interval,
        ));
        Ok(())
    }

    fn pump_error(&self) -> Option<String> {
        self.session().pump.as_ref().and_then(|p| p.take_error())
    }

    /// Cancel the call and release timers and devices. Cleanup failures are
    /// logged only.
    fn halt(&self, session: &mut Session) {
        session.cancel.cancel();
        if let Some(pump) = session.pump.take() {
            pump.stop();
        }
        if let Some(task) = session.completion.take() {
            task.abort();
        }
        if session.sink_open {
            session.sink_open = false;
            if let Err(e) = self.sink.stop() {
                log::warn!("[Player] Failed to stop sink: {}", e);
            }
            if let Err(e) = self.sink.close() {
                log::warn!("[Player] Failed to close sink: {}", e);
            }
        }
        if session.clip_open {
            session.clip_open = false;
            if let Err(e) = self.clip.stop() {
                log::warn!("[Player] Failed to stop clip: {}", e);
            }
        }
    }

    fn stop(&self) {
        let mut session = self.session();
        self.settle_clip(&mut session);
        let active = matches!(
            session.state,
            PlaybackState::Fetching | PlaybackState::Playing
        );
        self.halt(&mut session);
        if active {
            session.state = PlaybackState::Stopped;
            self.status.emit(PlaybackStatus::Stopped);
            log::info!("[Player] Stopped");
        }
    }

    /// Cleanup after a failed streaming call; observers see `stopped`.
    fn abort_with_error(&self) {
        self.stop();
    }

    /// Cleanup after a failed clip fetch; nothing was announced, so nothing
    /// is emitted.
    fn reset_quietly(&self) {
        let mut session = self.session();
        if session.state == PlaybackState::Fetching {
            self.halt(&mut session);
            session.state = PlaybackState::Idle;
        }
    }

    /// A clip session whose audio has ended is over; clips never emit
    /// `completed`.
    fn settle_clip(&self, session: &mut Session) {
        if session.state == PlaybackState::Playing
            && session.clip_open
            && !self.clip.is_playing()
        {
            session.clip_open = false;
            session.state = PlaybackState::Completed;
        }
    }

    /// Runs in the completion task of the call owning `cancel`.
    fn complete(&self, cancel: &CancellationToken) {
        let mut session = self.session();
        // Stopped or replaced while this task waited for the lock
        if cancel.is_cancelled() {
            return;
        }
        // Release this task's own handle without aborting it
        session.completion.take();
        self.complete_locked(&mut session);
    }

    fn complete_locked(&self, session: &mut Session) {
        if session.state != PlaybackState::Playing {
            return;
        }
        if let Some(pump) = session.pump.take() {
            pump.stop();
        }
        if session.sink_open {
            session.sink_open = false;
            if let Err(e) = self.sink.stop() {
                log::warn!("[Player] Failed to stop sink: {}", e);
            }
            if let Err(e) = self.sink.close() {
                log::warn!("[Player] Failed to close sink: {}", e);
            }
        }
        session.state = PlaybackState::Completed;
        self.status.emit(PlaybackStatus::Completed);
        log::info!("[Player] Completed");
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        if let Err(e) = self.clip.close() {
            log::warn!("[Player] Failed to close clip player: {}", e);
        }
        self.status.close();
        log::debug!("[Player] Disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::client::AudioByteStream;
    use async_trait::async_trait;

    struct Silent;

    impl StreamingSink for Silent {
        fn open(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn configure(&self, _config: SinkConfig) -> Result<(), AudioError> {
            Ok(())
        }
        fn write(&self, _pcm: &[u8]) -> Result<(), AudioError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn close(&self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    impl ClipPlayer for Silent {
        fn open(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn play(&self, _audio: &[u8], _format: ResponseFormat) -> Result<(), AudioError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn close(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn is_playing(&self) -> bool {
            false
        }
    }

    struct Never;

    #[async_trait]
    impl SpeechTransport for Never {
        async fn fetch_audio(&self, _request: &SpeechRequest) -> TtsResult<Bytes> {
            std::future::pending().await
        }
        async fn stream_audio(&self, _request: &SpeechRequest) -> TtsResult<AudioByteStream> {
            std::future::pending().await
        }
    }

    fn player() -> SpeechPlayer {
        SpeechPlayer::with_backends(
            TtsConfig::new("test_key"),
            Arc::new(Never),
            Arc::new(Silent),
            Arc::new(Silent),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = SpeechPlayer::with_backends(
            TtsConfig::new("test_key").with_slice_size(0),
            Arc::new(Never),
            Arc::new(Silent),
            Arc::new(Silent),
        );
        assert!(matches!(result, Err(TtsError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_stop_when_idle_emits_nothing() {
        let player = player();
        let mut rx = player.status_stream();
        player.stop_player().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(player.status(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_stop_while_fetching() {
        let player = player();
        let mut rx = player.status_stream();

        let speaker = player.clone();
        let call = tokio::spawn(async move {
            speaker.stream_speak(SpeechRequest::new("Hello"), None).await
        });

        assert_eq!(rx.recv().await.unwrap(), PlaybackStatus::Fetching);
        player.stop_player().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), PlaybackStatus::Stopped);

        call.await.unwrap().unwrap();
        assert_eq!(player.status(), PlaybackState::Stopped);
        assert!(!player.has_active_timers());
    }

    #[tokio::test]
    async fn test_second_call_is_busy() {
        let player = player();
        let mut rx = player.status_stream();

        let speaker = player.clone();
        let first = tokio::spawn(async move {
            speaker.stream_speak(SpeechRequest::new("one"), None).await
        });
        assert_eq!(rx.recv().await.unwrap(), PlaybackStatus::Fetching);

        let second = player.create_speak(SpeechRequest::new("two"), None).await;
        assert!(matches!(second, Err(TtsError::Busy)));

        player.stop_player().await.unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disposed_player_refuses_work() {
        let player = player();
        player.dispose().await.unwrap();
        player.dispose().await.unwrap();

        let result = player.stream_speak(SpeechRequest::new("late"), None).await;
        assert!(matches!(result, Err(TtsError::Disposed)));
    }

    #[tokio::test]
    async fn test_late_completion_of_stopped_call_is_ignored() {
        let player = player();
        let stale = CancellationToken::new();
        stale.cancel();
        {
            let mut session = player.inner.session();
            session.state = PlaybackState::Playing;
            session.completion = Some(tokio::spawn(std::future::pending::<()>()));
        }

        // A completion task that lost the race against stop must not touch
        // the current call
        player.inner.complete(&stale);
        assert_eq!(player.status(), PlaybackState::Playing);
        assert!(player.has_active_timers());

        player.stop_player().await.unwrap();
        assert!(!player.has_active_timers());
    }

    #[tokio::test]
    async fn test_completion_of_live_call() {
        let player = player();
        let mut rx = player.status_stream();
        let live = CancellationToken::new();
        player.inner.session().state = PlaybackState::Playing;

        player.inner.complete(&live);
        assert_eq!(player.status(), PlaybackState::Completed);
        assert_eq!(rx.recv().await.unwrap(), PlaybackStatus::Completed);
    }
}
