use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Bounded FIFO of received messages shared between a receiver task and
/// any number of readers. When full, the oldest entry is dropped.
#[derive(Debug)]
pub struct InboundBuffer {
    entries: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    arrivals: Notify,
}

impl InboundBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            arrivals: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Append a message. Returns true when the oldest entry had to be
    /// dropped to make room.
    pub fn push(&self, message: Vec<u8>) -> bool {
        let dropped = {
            let mut entries = self.lock();
            let dropped = if entries.len() >= self.capacity {
                entries.pop_front();
                true
            } else {
                false
            };
            entries.push_back(message);
            dropped
        };
        self.arrivals.notify_waiters();
        dropped
    }

    /// Remove and return the oldest entry starting with `prefix`, or the
    /// oldest entry at all when no prefix is given.
    pub fn take_matching(&self, prefix: Option<&[u8]>) -> Option<Vec<u8>> {
        let mut entries = self.lock();
        let index = match prefix {
            Some(prefix) => entries.iter().position(|m| m.starts_with(prefix))?,
            None => 0,
        };
        entries.remove(index)
    }

    /// Wait up to `timeout` for a matching entry. A zero timeout checks once.
    pub async fn get(&self, prefix: Option<&[u8]>, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let arrival = self.arrivals.notified();
            if let Some(message) = self.take_matching(prefix) {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return self.take_matching(prefix);
            }
        }
    }

    /// Wait without a deadline for a matching entry.
    pub async fn wait(&self, prefix: Option<&[u8]>) -> Vec<u8> {
        loop {
            let arrival = self.arrivals.notified();
            if let Some(message) = self.take_matching(prefix) {
                return message;
            }
            arrival.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
