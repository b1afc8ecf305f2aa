//! Outbound half of a WebSocket connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// How long a Response or Request may wait for queue space.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a frame was not queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// No space, immediately or before the deadline.
    #[error("outbound queue full")]
    Full,
    /// The writer is gone.
    #[error("outbound queue closed")]
    Closed,
}

/// Queue of serialized frames for the socket writer, plus liveness tracking.
pub struct ClientConnection {
    tx: mpsc::Sender<String>,
    delivery_timeout: Duration,
    connected_at: Instant,
    alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped: AtomicU64,
}

impl ClientConnection {
    /// Wrap the writer's queue.
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self::with_delivery_timeout(tx, DELIVERY_TIMEOUT)
    }

    /// Wrap the writer's queue with a custom wait bound for [`send`](Self::send).
    pub fn with_delivery_timeout(tx: mpsc::Sender<String>, delivery_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            tx,
            delivery_timeout,
            connected_at: now,
            alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: String) -> Result<(), QueueError> {
        self.tx.try_send(frame).map_err(|e| {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Closed(_) => QueueError::Closed,
            }
        })
    }

    /// Queue a frame, waiting for space up to the delivery timeout.
    pub async fn send(&self, frame: String) -> Result<(), QueueError> {
        self.tx.send_timeout(frame, self.delivery_timeout).await.map_err(|e| {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                SendTimeoutError::Timeout(_) => QueueError::Full,
                SendTimeoutError::Closed(_) => QueueError::Closed,
            }
        })
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Whether anything arrived since the previous check; resets the flag.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound activity.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
