use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::link::{Link, LinkContext, JOIN_TIMEOUT};
use crate::connection::state::{ConnectionState, StateCell};
use crate::error::{Result, TransportError};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::handshake::{client_handshake, Credentials};
use crate::utils::buffer::InboundBuffer;
use crate::utils::shutdown::{join_task, wait_stopped, ShutdownToken};

/// Client side of a connection, with optional automatic reconnection.
///
/// Received messages land in a buffer that outlives individual
/// connections, so nothing already received is lost across a reconnect.
pub struct ConnectionEndpoint {
    inner: Arc<EndpointInner>,
}

struct Supervisor {
    token: ShutdownToken,
    handle: JoinHandle<()>,
}

struct EndpointInner {
    config: ClientConfig,
    credentials: Credentials,
    state: Arc<StateCell>,
    inbound: Arc<InboundBuffer>,
    metrics: Arc<TransportMetrics>,
    link: StdMutex<Option<Arc<Link>>>,
    connecting: Mutex<()>,
    killed: AtomicBool,
    kill_signal: Notify,
    supervisor: StdMutex<Option<Supervisor>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionEndpoint {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let credentials = config.credentials()?;
        let inbound = Arc::new(InboundBuffer::new(config.buffer_max));

        Ok(Self {
            inner: Arc::new(EndpointInner {
                config,
                credentials,
                state: Arc::new(StateCell::new(ConnectionState::Closed)),
                inbound,
                metrics: Arc::new(TransportMetrics::new()),
                link: StdMutex::new(None),
                connecting: Mutex::new(()),
                killed: AtomicBool::new(false),
                kill_signal: Notify::new(),
                supervisor: StdMutex::new(None),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    /// Connect and authenticate. A failure here is reported to the caller
    /// and does not start reconnection; once connected, a lost connection
    /// is re-established in the background when `auto_reconnect` is set.
    pub async fn connect(&self) -> Result<()> {
        self.inner.killed.store(false, Ordering::SeqCst);
        self.inner.connect_once().await?;
        if self.inner.config.auto_reconnect {
            self.ensure_supervisor();
        }
        Ok(())
    }

    fn ensure_supervisor(&self) {
        let mut slot = lock(&self.inner.supervisor);
        if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }
        let token = ShutdownToken::new();
        let handle = tokio::spawn(supervise(self.inner.clone(), token.subscribe()));
        *slot = Some(Supervisor { token, handle });
    }

    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        let link = self.inner.live_link().ok_or(TransportError::NotConnected)?;
        link.send(payload).await
    }

    /// First buffered message starting with `prefix` (any message if
    /// `None`), waiting up to `timeout`. Without auto-reconnect the wait
    /// ends early once the connection has closed.
    pub async fn get(&self, prefix: Option<&[u8]>, timeout: Duration) -> Option<Vec<u8>> {
        if self.inner.config.auto_reconnect {
            return self.inner.inbound.get(prefix, timeout).await;
        }
        tokio::select! {
            message = self.inner.inbound.get(prefix, timeout) => message,
            _ = self.inner.state.wait_closed() => self.inner.inbound.take_matching(prefix),
        }
    }

    /// Oldest buffered message. With `block` it waits until one arrives or
    /// the endpoint gives up on the connection: closed without
    /// auto-reconnect, or killed.
    pub async fn recv(&self, block: bool) -> Option<Vec<u8>> {
        if !block {
            return self.inner.inbound.take_matching(None);
        }
        if self.inner.config.auto_reconnect {
            let killed = self.inner.kill_signal.notified();
            if self.inner.killed.load(Ordering::SeqCst) {
                return self.inner.inbound.take_matching(None);
            }
            return tokio::select! {
                message = self.inner.inbound.wait(None) => Some(message),
                _ = killed => self.inner.inbound.take_matching(None),
            };
        }
        tokio::select! {
            message = self.inner.inbound.wait(None) => Some(message),
            _ = self.inner.state.wait_closed() => self.inner.inbound.take_matching(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.live_link().is_some()
    }

    pub fn is_secured(&self) -> bool {
        self.inner.live_link().is_some_and(|link| link.is_secured())
    }

    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.inner.state.wait_for(target, timeout).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Close the connection, stop reconnecting and join every background task.
    pub async fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        self.inner.kill_signal.notify_waiters();
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(supervisor) = &supervisor {
            supervisor.token.signal_stop();
        }

        let link = lock(&self.inner.link).take();
        if let Some(link) = link {
            link.kill().await;
        }
        self.inner.state.set(ConnectionState::Closed);

        if let Some(supervisor) = supervisor {
            join_task("reconnect", supervisor.handle, JOIN_TIMEOUT).await;
        }
        info!("Connection to {} killed", self.inner.config.address);
    }

    /// Like [`kill`](Self::kill), and also discards buffered messages.
    pub async fn reset(&self) {
        self.kill().await;
        self.inner.inbound.clear();
    }
}

impl Drop for ConnectionEndpoint {
    fn drop(&mut self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        if let Some(supervisor) = lock(&self.inner.supervisor).take() {
            supervisor.token.signal_stop();
        }
        if let Some(link) = lock(&self.inner.link).take() {
            link.signal_stop();
        }
    }
}

impl EndpointInner {
    fn live_link(&self) -> Option<Arc<Link>> {
        lock(&self.link).as_ref().filter(|link| link.is_live()).cloned()
    }

    async fn connect_once(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        let address = &self.config.address;
        if self.live_link().is_some() {
            debug!("Already connected to {}", address);
            return Ok(());
        }

        self.state.set(ConnectionState::Connecting);
        let mut stream = match tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.set(ConnectionState::Closed);
                return Err(e.into());
            }
            Err(_) => {
                self.state.set(ConnectionState::Closed);
                return Err(TransportError::Timeout(format!("connecting to {}", address)));
            }
        };
        let _ = stream.set_nodelay(true);

        let session = match client_handshake(
            &mut stream,
            &self.credentials,
            self.config.require_secured,
            &self.state,
            self.config.handshake_timeout(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.state.set(ConnectionState::Closed);
                self.metrics.auth_failed();
                warn!("Handshake with {} failed: {}", address, e);
                return Err(e);
            }
        };

        let link = Link::establish(
            stream,
            session,
            LinkContext {
                label: address.clone(),
                framer: self.credentials.framer(),
                settings: self.config.link_settings(),
                state: self.state.clone(),
                inbound: self.inbound.clone(),
                metrics: self.metrics.clone(),
            },
        );
        info!("Connected to {}{}", address, if link.is_secured() { " (secured)" } else { "" });
        *lock(&self.link) = Some(link);
        Ok(())
    }
}

/// Watch for a lost connection and re-establish it every
/// `reconnect_interval` until it succeeds, the retry budget runs out, or
/// the endpoint is killed.
async fn supervise(inner: Arc<EndpointInner>, mut stop: watch::Receiver<bool>) {
    let address = inner.config.address.clone();
    let interval = inner.config.reconnect_interval();

    loop {
        tokio::select! {
            _ = inner.state.wait_closed() => {}
            _ = wait_stopped(&mut stop) => return,
        }
        if inner.killed.load(Ordering::SeqCst) {
            return;
        }
        warn!("Connection to {} lost, reconnecting every {:?}", address, interval);

        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wait_stopped(&mut stop) => return,
            }
            if inner.killed.load(Ordering::SeqCst) {
                return;
            }

            attempts += 1;
            match inner.connect_once().await {
                Ok(()) => {
                    if inner.killed.load(Ordering::SeqCst) {
                        let link = lock(&inner.link).take();
                        if let Some(link) = link {
                            link.kill().await;
                        }
                        return;
                    }
                    inner.metrics.reconnected();
                    info!("Reconnected to {} after {} attempt(s)", address, attempts);
                    break;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} to {} failed: {}", attempts, address, e);
                    if inner.config.max_reconnect_tries.is_some_and(|max| attempts >= max) {
                        error!("Giving up on {} after {} attempts", address, attempts);
                        return;
                    }
                }
            }
        }
    }
}
