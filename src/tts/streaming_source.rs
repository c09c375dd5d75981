//! Channel-backed streaming audio source for rodio.
//!
//! Receives f32 samples progressively via a crossbeam channel and implements
//! `rodio::Source` so the sink can play PCM while it is still arriving.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rodio::Source;
use std::collections::VecDeque;
use std::time::Duration;

/// How long `next` waits for data before yielding silence.
const STARVED_WAIT_MS: u64 = 10;

/// A rodio Source fed from a channel of sample batches.
///
/// Holds back playback until `prebuffer` samples are queued (or the sender
/// is gone). When starved while the sender is alive it yields silence;
/// once the sender is dropped and the queue is empty it ends.
pub struct PcmStreamSource {
    rx: Receiver<Vec<f32>>,
    buffer: VecDeque<f32>,
    sample_rate: u32,
    channels: u16,
    prebuffer: usize,
    started: bool,
    finished: bool,
}

impl PcmStreamSource {
    pub fn new(rx: Receiver<Vec<f32>>, sample_rate: u32, channels: u16, prebuffer: usize) -> Self {
        Self {
            rx,
            buffer: VecDeque::with_capacity(prebuffer * 2),
            sample_rate,
            channels,
            prebuffer,
            started: false,
            finished: false,
        }
    }

    /// Non-blocking drain of everything already sent.
    fn try_fill_buffer(&mut self) -> bool {
        let mut disconnected = false;
        loop {
            match self.rx.try_recv() {
                Ok(samples) => self.buffer.extend(samples),
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }
        disconnected
    }
}

impl Iterator for PcmStreamSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.finished {
            return None;
        }

        let disconnected = self.try_fill_buffer();

        if !self.started {
            if self.buffer.len() < self.prebuffer && !disconnected {
                return Some(0.0);
            }
            self.started = true;
        }

        if let Some(sample) = self.buffer.pop_front() {
            return Some(sample);
        }

        if disconnected {
            self.finished = true;
            return None;
        }

        match self.rx.recv_timeout(Duration::from_millis(STARVED_WAIT_MS)) {
            Ok(samples) => {
                self.buffer.extend(samples);
                self.buffer.pop_front().or(Some(0.0))
            }
            Err(RecvTimeoutError::Timeout) => Some(0.0),
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                None
            }
        }
    }
}

impl Source for PcmStreamSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
