//! Stop signal plus a registry of the background tasks it governs.

use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::error;

/// Coordinates shutdown of a group of background tasks.
///
/// Tasks hold a receiver from [`subscribe`](Self::subscribe) and leave their
/// `select!` loop once it flips to `true`. The owner calls
/// [`signal_stop`](Self::signal_stop) followed by
/// [`join_all`](Self::join_all).
pub struct ShutdownToken {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            stop_tx,
            stop_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Idempotent.
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Resolves once the stop signal has been sent.
    pub async fn stopped(&self) {
        wait_stopped(&mut self.subscribe()).await;
    }

    pub async fn add_task(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name, handle));
    }

    /// Await every registered task, aborting those that do not finish
    /// within `timeout`. Returns the number of tasks that had to be aborted.
    pub async fn join_all(&self, timeout: Duration) -> usize {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let mut aborted = 0;
        for (name, handle) in tasks {
            if !join_task(name, handle, timeout).await {
                aborted += 1;
            }
        }
        aborted
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait on a stop receiver until it reads `true`. A dropped sender counts
/// as stopped.
pub async fn wait_stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Join one task with a deadline. Returns false if it had to be aborted.
pub async fn join_task(name: &str, mut handle: JoinHandle<()>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(_) => true,
        Err(_) => {
            error!("failed to stop {} task within {:?}, aborting it", name, timeout);
            handle.abort();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_token_is_not_stopped() {
        let token = ShutdownToken::new();
        assert!(!token.is_stopped());
    }

    #[test]
    fn signal_stop_is_visible_to_subscribers() {
        let token = ShutdownToken::new();
        let rx = token.subscribe();

        assert!(!*rx.borrow());
        token.signal_stop();
        token.signal_stop();
        assert!(*rx.borrow());
        assert!(token.is_stopped());
    }

    #[tokio::test]
    async fn late_subscriber_sees_stop() {
        let token = ShutdownToken::new();
        token.signal_stop();

        let mut rx = token.subscribe();
        tokio::time::timeout(Duration::from_millis(100), wait_stopped(&mut rx))
            .await
            .expect("stop already signalled");
    }

    #[tokio::test]
    async fn join_all_waits_for_tasks() {
        let token = ShutdownToken::new();
        let mut rx = token.subscribe();
        token
            .add_task("waiter", tokio::spawn(async move { wait_stopped(&mut rx).await }))
            .await;

        token.signal_stop();
        assert_eq!(token.join_all(Duration::from_secs(1)).await, 0);
        assert!(token.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn join_all_aborts_stuck_tasks() {
        let token = ShutdownToken::new();
        token
            .add_task("stuck", tokio::spawn(std::future::pending::<()>()))
            .await;
        token.add_task("done", tokio::spawn(async {})).await;

        token.signal_stop();
        assert_eq!(token.join_all(Duration::from_millis(50)).await, 1);
    }
}
