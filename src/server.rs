use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::handler::ConnectionHandler;
use crate::connection::link::{LinkSettings, JOIN_TIMEOUT};
use crate::connection::state::ConnectionState;
use crate::crypto::SessionKeychain;
use crate::error::{Result, TransportError};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::handshake::Credentials;
use crate::utils::shutdown::{wait_stopped, ShutdownToken};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State every handler of one server shares.
pub(crate) struct ServerShared {
    pub credentials: Credentials,
    pub keychain: Option<Arc<SessionKeychain>>,
    pub metrics: Arc<TransportMetrics>,
    pub link_settings: LinkSettings,
    pub handshake_timeout: Duration,
    pub buffer_max: usize,
}

struct Slot {
    /// `None` while the handshake is still running.
    handler: Option<Arc<ConnectionHandler>>,
    claimed: bool,
}

/// Fixed-size table of connection slots.
struct ConnectionTable {
    slots: Mutex<Vec<Option<Slot>>>,
    arrivals: Notify,
    closed: AtomicBool,
}

impl ConnectionTable {
    fn new(size: usize) -> Self {
        Self {
            slots: Mutex::new((0..size).map(|_| None).collect()),
            arrivals: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reserve(&self) -> Option<usize> {
        let mut slots = self.lock();
        let index = slots.iter().position(Option::is_none)?;
        slots[index] = Some(Slot { handler: None, claimed: false });
        Some(index)
    }

    /// Publish an authenticated handler. Returns false if the table has
    /// been closed in the meantime.
    fn fill(&self, index: usize, handler: Arc<ConnectionHandler>) -> bool {
        {
            let mut slots = self.lock();
            if self.closed.load(Ordering::SeqCst) {
                slots[index] = None;
                return false;
            }
            slots[index] = Some(Slot { handler: Some(handler), claimed: false });
        }
        self.arrivals.notify_waiters();
        true
    }

    fn release(&self, index: usize) {
        self.lock()[index] = None;
    }

    fn claim_next(&self) -> Option<Arc<ConnectionHandler>> {
        let mut slots = self.lock();
        slots.iter_mut().flatten().find_map(|slot| match &slot.handler {
            Some(handler) if !slot.claimed && handler.is_connected() => {
                slot.claimed = true;
                Some(handler.clone())
            }
            _ => None,
        })
    }

    /// Free the slots of closed handlers and hand them back for joining.
    fn reap(&self) -> Vec<Arc<ConnectionHandler>> {
        let mut reaped = Vec::new();
        for entry in self.lock().iter_mut() {
            let closed = matches!(
                entry,
                Some(Slot { handler: Some(handler), .. }) if handler.state() == ConnectionState::Closed
            );
            if closed {
                if let Some(Slot { handler: Some(handler), .. }) = entry.take() {
                    reaped.push(handler);
                }
            }
        }
        reaped
    }

    fn close(&self) -> Vec<Arc<ConnectionHandler>> {
        let handlers = {
            let mut slots = self.lock();
            self.closed.store(true, Ordering::SeqCst);
            slots
                .iter_mut()
                .filter_map(|entry| entry.take().and_then(|slot| slot.handler))
                .collect()
        };
        self.arrivals.notify_waiters();
        handlers
    }

    fn count(&self) -> usize {
        self.lock()
            .iter()
            .flatten()
            .filter(|slot| slot.handler.as_ref().is_some_and(|h| h.is_connected()))
            .count()
    }
}

/// Accepts connections, authenticates them and hands out handlers.
pub struct ListenerServer {
    config: ServerConfig,
    shared: Arc<ServerShared>,
    table: Arc<ConnectionTable>,
    shutdown: ShutdownToken,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ListenerServer {
    /// Generates a session keychain when `config.secured` is set.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let keychain = if config.secured {
            Some(Arc::new(SessionKeychain::generate(config.rsa_bits)?))
        } else {
            None
        };
        Self::build(config, keychain)
    }

    /// Use an existing keychain instead of generating one.
    pub fn with_keychain(config: ServerConfig, keychain: Arc<SessionKeychain>) -> Result<Self> {
        let keychain = config.secured.then_some(keychain);
        Self::build(config, keychain)
    }

    fn build(config: ServerConfig, keychain: Option<Arc<SessionKeychain>>) -> Result<Self> {
        config.validate()?;
        let shared = ServerShared {
            credentials: config.credentials()?,
            keychain,
            metrics: Arc::new(TransportMetrics::new()),
            link_settings: config.link_settings(),
            handshake_timeout: config.handshake_timeout(),
            buffer_max: config.buffer_max,
        };

        Ok(Self {
            table: Arc::new(ConnectionTable::new(config.max_connections)),
            shared: Arc::new(shared),
            config,
            shutdown: ShutdownToken::new(),
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind the listener and start the accept and watchdog tasks.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Config("server already started".into()));
        }

        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        info!(
            "Server listening on {} (protocol {}, {})",
            addr,
            self.config.protocol,
            if self.shared.keychain.is_some() { "secured" } else { "authentication only" }
        );

        let accept = tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            self.table.clone(),
            self.shutdown.subscribe(),
        ));
        let watchdog = tokio::spawn(watchdog_loop(
            self.table.clone(),
            Duration::from_millis(self.config.watchdog_tick_ms),
            self.shutdown.subscribe(),
        ));
        self.shutdown.add_task("accept", accept).await;
        self.shutdown.add_task("server watchdog", watchdog).await;
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fingerprint of the session keychain, if the server is secured.
    pub fn key_fingerprint(&self) -> Option<String> {
        self.shared.keychain.as_ref().map(|keychain| keychain.fingerprint())
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shutdown.is_stopped()
    }

    /// Next authenticated connection not yet handed out. With `wait` it
    /// blocks until one arrives or the server stops.
    pub async fn get_connection(&self, wait: bool) -> Option<Arc<ConnectionHandler>> {
        loop {
            let arrival = self.table.arrivals.notified();
            if let Some(handler) = self.table.claim_next() {
                return Some(handler);
            }
            if !wait || self.shutdown.is_stopped() {
                return None;
            }
            tokio::select! {
                _ = arrival => {}
                _ = self.shutdown.stopped() => return None,
            }
        }
    }

    pub async fn get_connection_timeout(&self, timeout: Duration) -> Option<Arc<ConnectionHandler>> {
        tokio::time::timeout(timeout, self.get_connection(true)).await.ok().flatten()
    }

    /// Number of live authenticated connections.
    pub fn connection_count(&self) -> usize {
        self.table.count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stop accepting, close every connection and join all tasks.
    pub async fn kill(&self) {
        self.shutdown.signal_stop();
        for handler in self.table.close() {
            handler.kill().await;
        }
        let aborted = self.shutdown.join_all(JOIN_TIMEOUT).await;
        if aborted > 0 {
            error!("{} server task(s) had to be aborted", aborted);
        }
        info!("Server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    table: Arc<ConnectionTable>,
    mut stop: watch::Receiver<bool>,
) {
    let mut handshakes = JoinSet::new();
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            Some(joined) = handshakes.join_next(), if !handshakes.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Handshake task panicked: {}", e);
                    }
                }
                continue;
            }
            _ = wait_stopped(&mut stop) => break,
        };

        let Some(slot) = table.reserve() else {
            warn!("Connection table full, refusing {}", peer);
            drop(socket);
            continue;
        };
        info!("New connection from {}", peer);

        let shared = Arc::clone(&shared);
        let table = Arc::clone(&table);
        let mut stop = stop.clone();
        handshakes.spawn(async move {
            let accepted = tokio::select! {
                accepted = ConnectionHandler::accept(socket, peer, &shared) => accepted,
                _ = wait_stopped(&mut stop) => {
                    debug!("Dropping handshake with {} on shutdown", peer);
                    table.release(slot);
                    return;
                }
            };
            match accepted {
                Ok(handler) => {
                    let handler = Arc::new(handler);
                    if !table.fill(slot, handler.clone()) {
                        handler.kill().await;
                    }
                }
                Err(e) => {
                    warn!("Handshake with {} failed: {}", peer, e);
                    table.release(slot);
                }
            }
        });
    }

    while handshakes.join_next().await.is_some() {}
    debug!("Accept loop stopped");
}

async fn watchdog_loop(table: Arc<ConnectionTable>, tick: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_stopped(&mut stop) => break,
        }

        for handler in table.reap() {
            debug!("Reaping closed connection {}", handler.peer_addr());
            handler.kill().await;
        }
    }
    debug!("Server watchdog stopped");
}
