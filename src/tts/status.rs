//! Playback status notifications.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring; a subscriber lagging further behind
/// than this sees `RecvError::Lagged`.
const STATUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Fetching,
    Playing,
    Stopped,
    Completed,
}

/// Fan-out of [`PlaybackStatus`] values to every current subscriber.
///
/// Subscribers only see values emitted after they subscribed. Once closed,
/// `emit` does nothing and new subscribers get an already-closed receiver.
pub struct StatusChannel {
    tx: Mutex<Option<broadcast::Sender<PlaybackStatus>>>,
}

impl StatusChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub fn emit(&self, status: PlaybackStatus) {
        if let Ok(guard) = self.tx.lock() {
            if let Some(tx) = guard.as_ref() {
                // Err only means nobody is listening right now
                let _ = tx.send(status);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackStatus> {
        if let Ok(guard) = self.tx.lock() {
            if let Some(tx) = guard.as_ref() {
                return tx.subscribe();
            }
        }
        let (_, rx) = broadcast::channel(1);
        rx
    }

    /// Drop the sender; existing receivers drain and then see `Closed`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}
