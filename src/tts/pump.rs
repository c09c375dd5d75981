//! Periodic drain of the PCM buffer into the streaming sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::audio::StreamingSink;
use super::buffer::DrainBuffer;

/// Timer task moving one `slice_size` slice from the buffer to the sink per
/// tick, and nothing on ticks where less than a slice is buffered.
///
/// Aborted on [`stop`](Self::stop) or drop. The first failed sink write
/// ends the task and is kept for [`take_error`](Self::take_error).
pub struct BufferPump {
    handle: JoinHandle<()>,
    error: Arc<Mutex<Option<String>>>,
}

impl BufferPump {
    /// Must be called from within a tokio runtime.
    pub fn start(
        buffer: DrainBuffer,
        sink: Arc<dyn StreamingSink>,
        slice_size: usize,
        period: Duration,
    ) -> Self {
        let error = Arc::new(Mutex::new(None));
        let error_slot = Arc::clone(&error);

        log::debug!(
            "[Pump] Starting: {} byte slices every {:?}",
            slice_size,
            period
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if let Err(e) = buffer.forward_slice(slice_size, sink.as_ref()) {
                    log::warn!("[Pump] Sink rejected slice: {}", e);
                    if let Ok(mut slot) = error_slot.lock() {
                        *slot = Some(e.to_string());
                    }
                    break;
                }
            }
        });

        Self { handle, error }
    }

    pub fn take_error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        log::debug!("[Pump] Stopped");
        // Drop aborts the task
    }
}

impl Drop for BufferPump {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::audio::{AudioError, SinkConfig};

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl StreamingSink for Recorder {
        fn open(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn configure(&self, _config: SinkConfig) -> Result<(), AudioError> {
            Ok(())
        }
        fn write(&self, pcm: &[u8]) -> Result<(), AudioError> {
            if self.fail {
                return Err(AudioError::PlaybackError("device gone".to_string()));
            }
            self.writes.lock().unwrap().push(pcm.len());
            Ok(())
        }
        fn stop(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn close(&self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    const TICK: Duration = Duration::from_millis(20);

    #[tokio::test(start_paused = true)]
    async fn test_one_slice_per_tick() {
        let sink = Arc::new(Recorder::default());
        let buffer = DrainBuffer::new();
        buffer.append(&[0; 5000]);

        let pump = BufferPump::start(buffer.clone(), sink.clone(), 2048, TICK);
        // First tick fires immediately, the second after one period
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*sink.writes.lock().unwrap(), vec![2048]);

        tokio::time::sleep(TICK).await;
        assert_eq!(*sink.writes.lock().unwrap(), vec![2048, 2048]);

        // 904 bytes left: below a slice, so later ticks leave it alone
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(sink.writes.lock().unwrap().len(), 2);
        assert_eq!(buffer.len(), 904);
        assert!(pump.is_running());
        pump.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_pump_forwards_nothing() {
        let sink = Arc::new(Recorder::default());
        let buffer = DrainBuffer::new();

        let pump = BufferPump::start(buffer.clone(), sink.clone(), 2048, TICK);
        tokio::time::sleep(Duration::from_millis(5)).await;
        pump.stop();

        buffer.append(&[0; 4096]);
        tokio::time::sleep(TICK * 4).await;
        assert!(sink.writes.lock().unwrap().is_empty());
        assert_eq!(buffer.len(), 4096);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_kept() {
        let sink = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let buffer = DrainBuffer::new();
        buffer.append(&[0; 2048]);

        let pump = BufferPump::start(buffer, sink, 2048, TICK);
        tokio::time::sleep(TICK * 2).await;

        assert!(!pump.is_running());
        let err = pump.take_error().unwrap();
        assert!(err.contains("device gone"));
        assert!(pump.take_error().is_none());
    }
}
