//! rodio implementations of the audio collaborators
//!
//! rodio's `OutputStream` is not `Send`, so each backend runs a dedicated
//! audio thread that owns the stream and its `Sink`, and is driven through a
//! command channel.

use crossbeam_channel::{unbounded, Receiver, Sender};
use rodio::{Decoder, OutputStream, Sink};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::audio::{pcm16_to_f32, AudioError, ClipPlayer, SinkConfig, StreamingSink};
use super::streaming_source::PcmStreamSource;
use super::voices::ResponseFormat;

enum AudioCmd {
    StartStream {
        samples: Receiver<Vec<f32>>,
        sample_rate: u32,
        channels: u16,
        prebuffer: usize,
    },
    PlayClip {
        audio: Vec<u8>,
        reply: mpsc::Sender<Result<(), AudioError>>,
    },
    Stop,
    Shutdown,
}

/// How often the audio thread checks whether its sink has run dry.
const POLL_INTERVAL_MS: u64 = 25;

/// Handle to a running audio thread.
///
/// Commands are fire-and-forget: neither starting nor shutting down the
/// thread waits for the device, so callers on the async runtime never block.
struct AudioThread {
    tx: mpsc::Sender<AudioCmd>,
    /// Whether the thread's sink still has queued sound
    playing: Arc<AtomicBool>,
    /// Why the thread gave up, if it could not open the output device
    failure: Arc<Mutex<Option<String>>>,
}

impl AudioThread {
    fn spawn(name: &str) -> Result<Self, AudioError> {
        let (tx, rx) = mpsc::channel::<AudioCmd>();
        let playing = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));
        let playing_for_thread = Arc::clone(&playing);
        let failure_for_thread = Arc::clone(&failure);

        // Detached: the thread exits on Shutdown or when `tx` is dropped
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || audio_thread_main(rx, playing_for_thread, failure_for_thread))
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            tx,
            playing,
            failure,
        })
    }

    fn send(&self, cmd: AudioCmd) -> Result<(), AudioError> {
        self.tx.send(cmd).map_err(|_| self.gone())
    }

    /// Error for a thread that no longer takes commands.
    fn gone(&self) -> AudioError {
        match self.failure.lock().ok().and_then(|slot| slot.clone()) {
            Some(reason) => AudioError::StreamError(reason),
            None => AudioError::PlaybackError("audio thread is gone".to_string()),
        }
    }

    fn shutdown(self) {
        let _ = self.tx.send(AudioCmd::Shutdown);
    }
}

fn audio_thread_main(
    rx: mpsc::Receiver<AudioCmd>,
    playing: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
) {
    // Create the output stream once for the lifetime of the thread
    let (_stream, stream_handle) = match OutputStream::try_default() {
        Ok(v) => v,
        Err(e) => {
            log::warn!("[Audio] Failed to open output device: {}", e);
            if let Ok(mut slot) = failure.lock() {
                *slot = Some(e.to_string());
            }
            return;
        }
    };

    let mut sink: Option<Sink> = None;

    loop {
        // Receive commands with timeout for polling sink state
        let cmd = match rx.recv_timeout(Duration::from_millis(POLL_INTERVAL_MS)) {
            Ok(cmd) => cmd,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let busy = sink.as_ref().map(|s| !s.empty()).unwrap_or(false);
                playing.store(busy, Ordering::SeqCst);
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match cmd {
            AudioCmd::StartStream {
                samples,
                sample_rate,
                channels,
                prebuffer,
            } => {
                if let Some(old) = sink.take() {
                    old.stop();
                }
                match Sink::try_new(&stream_handle) {
                    Ok(new_sink) => {
                        new_sink.append(PcmStreamSource::new(
                            samples,
                            sample_rate,
                            channels,
                            prebuffer,
                        ));
                        sink = Some(new_sink);
                        playing.store(true, Ordering::SeqCst);
                    }
                    Err(e) => log::warn!("[Audio] Failed to create audio sink: {}", e),
                }
            }

            AudioCmd::PlayClip { audio, reply } => {
                if let Some(old) = sink.take() {
                    old.stop();
                }
                let result = Sink::try_new(&stream_handle)
                    .map_err(|e| AudioError::StreamError(e.to_string()))
                    .and_then(|new_sink| {
                        let source = Decoder::new(Cursor::new(audio))
                            .map_err(|e| AudioError::DecodeError(e.to_string()))?;
                        new_sink.append(source);
                        Ok(new_sink)
                    });
                let _ = reply.send(result.map(|new_sink| {
                    sink = Some(new_sink);
                    playing.store(true, Ordering::SeqCst);
                }));
            }

            AudioCmd::Stop => {
                if let Some(old) = sink.take() {
                    old.stop();
                }
                playing.store(false, Ordering::SeqCst);
            }

            AudioCmd::Shutdown => break,
        }
    }

    if let Some(old) = sink.take() {
        old.stop();
    }
    playing.store(false, Ordering::SeqCst);
    log::debug!("[Audio] Thread exiting");
}

/// Streaming PCM sink on the default output device.
#[derive(Default)]
pub struct RodioStreamSink {
    thread: Mutex<Option<AudioThread>>,
    samples_tx: Mutex<Option<Sender<Vec<f32>>>>,
    /// Odd byte left over from the previous write
    carry: Mutex<Option<u8>>,
}

impl RodioStreamSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_thread<T>(
        &self,
        f: impl FnOnce(&AudioThread) -> Result<T, AudioError>,
    ) -> Result<T, AudioError> {
        let guard = self
            .thread
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?;
        let thread = guard.as_ref().ok_or(AudioError::NotOpen)?;
        f(thread)
    }
}

impl StreamingSink for RodioStreamSink {
    fn open(&self) -> Result<(), AudioError> {
        let mut guard = self
            .thread
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?;
        if guard.is_none() {
            *guard = Some(AudioThread::spawn("pcm-sink")?);
            log::debug!("[Audio] Streaming sink opened");
        }
        Ok(())
    }

    fn configure(&self, config: SinkConfig) -> Result<(), AudioError> {
        let (tx, rx) = unbounded();
        let bytes_per_sample = config.format.bytes_per_sample.max(1) as usize;
        self.with_thread(|thread| {
            thread.send(AudioCmd::StartStream {
                samples: rx,
                sample_rate: config.format.sample_rate,
                channels: config.format.channels,
                prebuffer: config.buffer_size / bytes_per_sample,
            })
        })?;
        if let Ok(mut slot) = self.samples_tx.lock() {
            *slot = Some(tx);
        }
        if let Ok(mut carry) = self.carry.lock() {
            *carry = None;
        }
        log::debug!(
            "[Audio] Streaming sink configured: {} Hz, {} ch",
            config.format.sample_rate,
            config.format.channels
        );
        Ok(())
    }

    fn write(&self, pcm: &[u8]) -> Result<(), AudioError> {
        let guard = self
            .samples_tx
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?;
        let tx = guard.as_ref().ok_or(AudioError::NotOpen)?;

        let mut carry = self
            .carry
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?;
        let samples = match carry.take() {
            Some(first) => {
                let mut joined = Vec::with_capacity(pcm.len() + 1);
                joined.push(first);
                joined.extend_from_slice(pcm);
                if joined.len() % 2 == 1 {
                    *carry = joined.last().copied();
                }
                pcm16_to_f32(&joined)
            }
            None => {
                if pcm.len() % 2 == 1 {
                    *carry = pcm.last().copied();
                }
                pcm16_to_f32(pcm)
            }
        };

        if tx.send(samples).is_err() {
            // The source went away with its thread
            return self.with_thread(|thread| Err(thread.gone()));
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), AudioError> {
        // Disconnecting the channel lets the source start even below its
        // prebuffer, then end once drained
        if let Ok(mut slot) = self.samples_tx.lock() {
            slot.take();
        }
        if let Ok(mut carry) = self.carry.lock() {
            carry.take();
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        if let Ok(mut slot) = self.samples_tx.lock() {
            slot.take();
        }
        self.with_thread(|thread| thread.send(AudioCmd::Stop))
    }

    fn close(&self) -> Result<(), AudioError> {
        if let Ok(mut slot) = self.samples_tx.lock() {
            slot.take();
        }
        let thread = self
            .thread
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?
            .take();
        if let Some(thread) = thread {
            thread.shutdown();
            log::debug!("[Audio] Streaming sink closed");
        }
        Ok(())
    }
}

/// One-shot player for encoded files on the default output device.
#[derive(Default)]
pub struct RodioClipPlayer {
    thread: Mutex<Option<AudioThread>>,
}

impl RodioClipPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_thread<T>(
        &self,
        f: impl FnOnce(&AudioThread) -> Result<T, AudioError>,
    ) -> Result<T, AudioError> {
        let guard = self
            .thread
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?;
        let thread = guard.as_ref().ok_or(AudioError::NotOpen)?;
        f(thread)
    }
}

impl ClipPlayer for RodioClipPlayer {
    fn open(&self) -> Result<(), AudioError> {
        let mut guard = self
            .thread
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?;
        if guard.is_none() {
            *guard = Some(AudioThread::spawn("clip-player")?);
        }
        Ok(())
    }

    fn play(&self, audio: &[u8], format: ResponseFormat) -> Result<(), AudioError> {
        log::debug!("[Audio] Playing {} byte {} clip", audio.len(), format);
        let (reply_tx, reply_rx) = mpsc::channel();
        self.with_thread(|thread| {
            thread.send(AudioCmd::PlayClip {
                audio: audio.to_vec(),
                reply: reply_tx,
            })
        })?;
        // Blocks until the clip is decoded and queued
        match reply_rx.recv() {
            Ok(result) => result,
            Err(_) => self.with_thread(|thread| Err(thread.gone())),
        }
    }

    fn stop(&self) -> Result<(), AudioError> {
        let guard = self
            .thread
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?;
        match guard.as_ref() {
            Some(thread) => thread.send(AudioCmd::Stop),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<(), AudioError> {
        let thread = self
            .thread
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))?
            .take();
        if let Some(thread) = thread {
            thread.shutdown();
        }
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.thread
            .lock()
            .ok()
            .and_then(|guard| {
                guard
                    .as_ref()
                    .map(|thread| thread.playing.load(Ordering::SeqCst))
            })
            .unwrap_or(false)
    }
}
