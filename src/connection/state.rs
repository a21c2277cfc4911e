use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    KeyExchange,
    Ready,
    /// Authenticated, but the peer has been quiet for too long.
    Degraded,
    Closed,
}

impl ConnectionState {
    /// Whether application data may flow.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::KeyExchange => "key-exchange",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observable connection state.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn set(&self, next: ConnectionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!("connection state {} -> {}", previous, next);
        }
    }

    /// Move to `next` only while the current state is `from`.
    pub fn transition(&self, from: ConnectionState, next: ConnectionState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if *state == from {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!("connection state {} -> {}", from, next);
        }
        moved
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait up to `timeout` for `target`. Returns whether it was reached.
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

/// Time of the last observed traffic in either direction.
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    pub fn new() -> Self {
        Self { last: Mutex::new(Instant::now()) }
    }

    pub fn feed(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn live_states() {
        assert!(ConnectionState::Ready.is_live());
        assert!(ConnectionState::Degraded.is_live());
        assert!(!ConnectionState::Authenticating.is_live());
        assert!(!ConnectionState::Closed.is_live());
    }

    #[test]
    fn conditional_transition() {
        let cell = StateCell::new(ConnectionState::Ready);
        assert!(!cell.transition(ConnectionState::Degraded, ConnectionState::Ready));
        assert!(cell.transition(ConnectionState::Ready, ConnectionState::Degraded));
        assert_eq!(cell.get(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn wait_for_sees_later_change() {
        let cell = Arc::new(StateCell::new(ConnectionState::Connecting));
        let setter = cell.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set(ConnectionState::Ready);
        });

        assert!(cell.wait_for(ConnectionState::Ready, Duration::from_secs(2)).await);
        assert!(!cell.wait_for(ConnectionState::Closed, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn wait_closed_returns_immediately_when_closed() {
        let cell = StateCell::new(ConnectionState::Closed);
        tokio::time::timeout(Duration::from_millis(100), cell.wait_closed())
            .await
            .expect("already closed");
    }

    #[tokio::test]
    async fn activity_tracks_idle_time() {
        let activity = Activity::new();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(activity.idle() >= Duration::from_millis(30));
        activity.feed();
        assert!(activity.idle() < Duration::from_millis(30));
    }
}
