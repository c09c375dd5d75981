//! Inbound PCM accumulation
//!
//! The network read loop appends to a [`DrainBuffer`] while the buffer pump
//! removes fixed-size slices from its front. Both run on the tokio runtime,
//! so the queue sits behind a mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::audio::{AudioError, StreamingSink};

/// Observer for raw chunks as they arrive from the network.
pub type ChunkCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Shared FIFO of bytes waiting to be forwarded to the sink.
#[derive(Clone, Default)]
pub struct DrainBuffer {
    inner: Arc<Mutex<VecDeque<u8>>>,
}

impl DrainBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<u8>>, AudioError> {
        self.inner
            .lock()
            .map_err(|e| AudioError::PlaybackError(e.to_string()))
    }

    pub fn append(&self, bytes: &[u8]) {
        if let Ok(mut queue) = self.inner.lock() {
            queue.extend(bytes.iter().copied());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward exactly `size` bytes from the front to `sink`, or nothing if
    /// fewer are buffered. Returns the number of bytes written.
    ///
    /// The lock is held across the write so slices reach the sink in buffer
    /// order even when the pump and the final flush race.
    pub fn forward_slice(
        &self,
        size: usize,
        sink: &dyn StreamingSink,
    ) -> Result<usize, AudioError> {
        let mut queue = self.lock()?;
        if size == 0 || queue.len() < size {
            return Ok(0);
        }
        let slice: Vec<u8> = queue.drain(..size).collect();
        sink.write(&slice)?;
        Ok(slice.len())
    }

    /// Empty the buffer, forwarding its longest frame-aligned prefix as one
    /// write. Bytes of a trailing partial frame are dropped.
    pub fn forward_aligned(
        &self,
        frame_size: usize,
        sink: &dyn StreamingSink,
    ) -> Result<usize, AudioError> {
        let mut queue = self.lock()?;
        let keep = aligned_len(queue.len(), frame_size);
        let aligned: Vec<u8> = queue.drain(..keep).collect();
        queue.clear();
        if aligned.is_empty() {
            return Ok(0);
        }
        sink.write(&aligned)?;
        Ok(aligned.len())
    }

    pub fn clear(&self) {
        if let Ok(mut queue) = self.inner.lock() {
            queue.clear();
        }
    }
}

/// Largest multiple of `frame_size` that fits in `len`.
pub fn aligned_len(len: usize, frame_size: usize) -> usize {
    if frame_size == 0 {
        return len;
    }
    len - (len % frame_size)
}

/// Per-invocation state of the chunk consumer.
pub struct ChunkAccumulator {
    buffer: DrainBuffer,
    total_bytes: u64,
    frame_size: usize,
    on_chunk: Option<ChunkCallback>,
}

impl ChunkAccumulator {
    pub fn new(buffer: DrainBuffer, frame_size: usize, on_chunk: Option<ChunkCallback>) -> Self {
        Self {
            buffer,
            total_bytes: 0,
            frame_size,
            on_chunk,
        }
    }

    pub fn accept(&mut self, chunk: &[u8]) {
        self.buffer.append(chunk);
        self.total_bytes += chunk.len() as u64;
        if let Some(callback) = self.on_chunk.as_ref() {
            callback(chunk);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn buffer(&self) -> &DrainBuffer {
        &self.buffer
    }

    /// Forward whatever is left as one frame-aligned write and empty the
    /// buffer. Returns the number of bytes written.
    pub fn flush(&self, sink: &dyn StreamingSink) -> Result<usize, AudioError> {
        self.buffer.forward_aligned(self.frame_size, sink)
    }

    /// Drop everything still buffered without forwarding it.
    pub fn discard(&self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::audio::SinkConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Collect {
        writes: Mutex<Vec<usize>>,
        last: Mutex<Vec<u8>>,
    }

    impl StreamingSink for Collect {
        fn open(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn configure(&self, _config: SinkConfig) -> Result<(), AudioError> {
            Ok(())
        }
        fn write(&self, pcm: &[u8]) -> Result<(), AudioError> {
            self.writes.lock().unwrap().push(pcm.len());
            *self.last.lock().unwrap() = pcm.to_vec();
            Ok(())
        }
        fn stop(&self) -> Result<(), AudioError> {
            Ok(())
        }
        fn close(&self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    #[test]
    fn test_aligned_len() {
        assert_eq!(aligned_len(0, 2), 0);
        assert_eq!(aligned_len(1, 2), 0);
        assert_eq!(aligned_len(2049, 2), 2048);
        assert_eq!(aligned_len(10, 4), 8);
    }

    #[test]
    fn test_forward_slice_needs_a_full_slice() {
        let sink = Collect::default();
        let buffer = DrainBuffer::new();
        buffer.append(&[1; 2047]);
        assert_eq!(buffer.forward_slice(2048, &sink).unwrap(), 0);
        assert_eq!(buffer.len(), 2047);

        buffer.append(&[2; 3]);
        assert_eq!(buffer.forward_slice(2048, &sink).unwrap(), 2048);
        assert_eq!(buffer.len(), 2);
        assert_eq!(*sink.writes.lock().unwrap(), vec![2048]);
        assert_eq!(sink.last.lock().unwrap()[2047], 2);
    }

    #[test]
    fn test_slices_come_out_in_arrival_order() {
        let sink = Collect::default();
        let buffer = DrainBuffer::new();
        buffer.append(&[1, 2, 3]);
        buffer.append(&[4, 5]);
        buffer.forward_slice(4, &sink).unwrap();
        assert_eq!(*sink.last.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_flush_drops_partial_frame() {
        let sink = Collect::default();
        let mut acc = ChunkAccumulator::new(DrainBuffer::new(), 2, None);
        acc.accept(&[0; 7]);
        acc.accept(&[0; 4]);

        let written = acc.flush(&sink).unwrap();
        assert_eq!(written, 10);
        assert_eq!(*sink.writes.lock().unwrap(), vec![10]);
        assert!(acc.buffer().is_empty());
        assert_eq!(acc.total_bytes(), 11);
    }

    #[test]
    fn test_flush_of_single_byte_writes_nothing() {
        let sink = Collect::default();
        let mut acc = ChunkAccumulator::new(DrainBuffer::new(), 2, None);
        acc.accept(&[9]);

        assert_eq!(acc.flush(&sink).unwrap(), 0);
        assert!(sink.writes.lock().unwrap().is_empty());
        assert!(acc.buffer().is_empty());
    }

    #[test]
    fn test_observer_sees_raw_chunks() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut acc = ChunkAccumulator::new(
            DrainBuffer::new(),
            2,
            Some(Box::new(move |chunk: &[u8]| {
                counter.fetch_add(chunk.len(), Ordering::SeqCst);
            })),
        );
        acc.accept(&[0; 5]);
        acc.accept(&[0; 3]);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }
}
