//! Bounded, best-effort notification queue.
//!
//! Any component can push a human-readable status line; the presentation
//! layer drains whatever is queued when it renders (`GET /api/messages`).
//! The queue is never a backpressure mechanism: if it stays full for longer
//! than the enqueue timeout the message is dropped and the drop is logged.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::util::now_ms;

/// A queued status message.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub message: String,
    /// Enqueue time in milliseconds since epoch.
    pub timestamp: u64,
}

/// Cloneable handle to the shared queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
    enqueue_timeout: Duration,
}

impl Notifier {
    /// Create a queue holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize, enqueue_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            enqueue_timeout,
        }
    }

    /// Queue a message. Returns `false` if it was dropped because the queue
    /// stayed full past the enqueue timeout.
    pub async fn push(&self, message: impl Into<String>) -> bool {
        let notification = Notification {
            message: message.into(),
            timestamp: now_ms(),
        };
        match self.tx.send_timeout(notification, self.enqueue_timeout).await {
            Ok(()) => {
                debug!("Queued notification ({} pending)", self.len());
                true
            }
            Err(SendTimeoutError::Timeout(n) | SendTimeoutError::Closed(n)) => {
                error!(
                    "Notification queue full ({} pending), dropping message: {}",
                    self.len(),
                    n.message
                );
                false
            }
        }
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued message without waiting for new ones.
    pub async fn drain(&self) -> Vec<Notification> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }
}
