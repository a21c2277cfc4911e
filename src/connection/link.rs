//! An authenticated connection after the handshake: the socket halves, the
//! session ciphers, and the receiver, watchdog and heartbeat tasks that keep
//! it alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::connection::state::{Activity, ConnectionState, StateCell};
use crate::crypto::Iccode;
use crate::error::{Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::protocol::constants::MAX_MESSAGE_SIZE;
use crate::protocol::frame::{FrameEvent, FrameReader, Framer};
use crate::protocol::handshake::Session;
use crate::protocol::ProtocolError;
use crate::utils::buffer::InboundBuffer;
use crate::utils::io::write_all;
use crate::utils::shutdown::{join_task, wait_stopped, ShutdownToken};

/// Upper bound for joining a background task on shutdown.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub watchdog_timeout: Duration,
    pub watchdog_tick: Duration,
    pub write_timeout: Duration,
    /// Send heartbeats when outbound traffic is idle
    pub heartbeat: bool,
}

impl LinkSettings {
    fn heartbeat_after(&self) -> Duration {
        self.watchdog_timeout / 2
    }

    fn degraded_after(&self) -> Duration {
        self.watchdog_timeout * 3 / 4
    }
}

/// Shared pieces a link is wired into.
pub(crate) struct LinkContext {
    pub label: String,
    pub framer: Framer,
    pub settings: LinkSettings,
    pub state: Arc<StateCell>,
    pub inbound: Arc<InboundBuffer>,
    pub metrics: Arc<TransportMetrics>,
}

struct WriteSide {
    writer: OwnedWriteHalf,
    encoder: Option<Iccode>,
}

struct ReadSide {
    reader: FrameReader<OwnedReadHalf>,
    decoder: Option<Iccode>,
}

#[derive(Default)]
struct Workers {
    receiver: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct Link {
    label: String,
    framer: Framer,
    settings: LinkSettings,
    secured: bool,
    state: Arc<StateCell>,
    inbound: Arc<InboundBuffer>,
    metrics: Arc<TransportMetrics>,
    activity: Activity,
    write_side: Mutex<Option<WriteSide>>,
    read_side: Mutex<Option<ReadSide>>,
    shutdown: ShutdownToken,
    closed: AtomicBool,
    workers: StdMutex<Workers>,
}

impl Link {
    /// Take over an authenticated stream and start its background tasks.
    pub(crate) fn establish(stream: TcpStream, session: Session, ctx: LinkContext) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let secured = session.is_secured();

        let link = Arc::new(Self {
            label: ctx.label,
            framer: ctx.framer.clone(),
            settings: ctx.settings,
            secured,
            state: ctx.state,
            inbound: ctx.inbound,
            metrics: ctx.metrics,
            activity: Activity::new(),
            write_side: Mutex::new(Some(WriteSide {
                writer: write_half,
                encoder: session.encoder,
            })),
            read_side: Mutex::new(Some(ReadSide {
                reader: FrameReader::new(read_half, ctx.framer),
                decoder: session.decoder,
            })),
            shutdown: ShutdownToken::new(),
            closed: AtomicBool::new(false),
            workers: StdMutex::new(Workers::default()),
        });

        link.metrics.connection_opened();
        link.state.set(ConnectionState::Ready);
        {
            let mut workers = link.workers();
            workers.receiver = Some(tokio::spawn(link.clone().receiver_loop()));
            workers.watchdog = Some(tokio::spawn(link.clone().watchdog_loop()));
            if link.settings.heartbeat {
                workers.heartbeat = Some(tokio::spawn(link.clone().heartbeat_loop()));
            }
        }
        link
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_secured(&self) -> bool {
        self.secured
    }

    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state.get().is_live()
    }

    /// Encode, frame and transmit one message. Concurrent callers are
    /// serialised so their frames never interleave.
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(payload.len()).into());
        }

        let mut guard = self.write_side.lock().await;
        let side = guard.as_mut().ok_or(TransportError::ConnectionLost)?;

        let frames = match side.encoder.as_mut() {
            Some(encoder) => {
                encoder.reset(None);
                self.framer.pack(&encoder.encode(payload))?
            }
            None => self.framer.pack(payload)?,
        };

        let mut written = 0;
        let mut failure = None;
        for frame in frames {
            let bytes = frame.to_bytes();
            match write_all(&mut side.writer, &bytes, self.settings.write_timeout).await {
                Ok(()) => {
                    written += bytes.len();
                    self.activity.feed();
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(guard);

        if let Some(e) = failure {
            warn!("{} send failed: {}", self.label, e);
            self.close().await;
            return Err(TransportError::ConnectionLost);
        }
        self.metrics.record_sent(payload.len());
        trace!("{} sent {} bytes ({} on the wire)", self.label, payload.len(), written);
        Ok(written)
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let mut guard = self.write_side.lock().await;
        let side = guard.as_mut().ok_or(TransportError::ConnectionLost)?;
        let result = write_all(&mut side.writer, self.framer.heartbeat(), self.settings.write_timeout).await;
        drop(guard);

        match result {
            Ok(()) => {
                self.activity.feed();
                Ok(())
            }
            Err(e) => {
                self.close().await;
                Err(e.into())
            }
        }
    }

    /// Tear the connection down without waiting for the background tasks.
    /// Idempotent.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.signal_stop();
        self.state.set(ConnectionState::Closed);
        self.metrics.connection_closed();

        if let Some(mut side) = self.write_side.lock().await.take() {
            let _ = tokio::time::timeout(self.settings.write_timeout, side.writer.shutdown()).await;
        }
        debug!("{} closed", self.label);
    }

    /// Close and join every background task.
    pub(crate) async fn kill(&self) {
        self.close().await;

        let handles = {
            let mut workers = self.workers();
            [
                ("receiver", workers.receiver.take()),
                ("watchdog", workers.watchdog.take()),
                ("heartbeat", workers.heartbeat.take()),
            ]
        };
        for (name, handle) in handles {
            if let Some(handle) = handle {
                join_task(name, handle, JOIN_TIMEOUT).await;
            }
        }
    }

    /// Ask the background tasks to stop; the receiver finishes the close.
    pub(crate) fn signal_stop(&self) {
        self.shutdown.signal_stop();
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn receiver_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut guard = self.read_side.lock().await;
        let Some(side) = guard.as_mut() else {
            return;
        };

        loop {
            let event = tokio::select! {
                event = side.reader.next_event() => event,
                _ = wait_stopped(&mut stop) => break,
            };

            match event {
                Ok(FrameEvent::Heartbeat) => {
                    trace!("{} heartbeat received", self.label);
                    self.activity.feed();
                }
                Ok(FrameEvent::Segment) => self.activity.feed(),
                Ok(FrameEvent::Message(data)) => {
                    self.activity.feed();
                    let data = match side.decoder.as_mut() {
                        Some(decoder) => {
                            decoder.reset(None);
                            decoder.decode(&data)
                        }
                        None => data,
                    };
                    self.metrics.record_received(data.len());
                    trace!("{} received {} bytes", self.label, data.len());
                    if self.inbound.push(data) {
                        self.metrics.buffer_dropped();
                        warn!("{} inbound buffer full, dropped the oldest message", self.label);
                    }
                }
                Ok(FrameEvent::Rejected(e)) => {
                    self.metrics.frame_rejected();
                    warn!("{} discarding frame: {}", self.label, e);
                }
                Err(e) => {
                    if !self.shutdown.is_stopped() {
                        info!("{} connection lost: {}", self.label, e);
                    }
                    break;
                }
            }
        }

        *guard = None;
        drop(guard);
        self.close().await;
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.settings.watchdog_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_stopped(&mut stop) => break,
            }

            let idle = self.activity.idle();
            if idle > self.settings.watchdog_timeout {
                error!("{} peer silent for {:?}, disconnecting", self.label, idle);
                self.close().await;
                break;
            }

            if idle > self.settings.degraded_after() {
                if self.state.transition(ConnectionState::Ready, ConnectionState::Degraded) {
                    warn!("{} peer quiet for {:?}", self.label, idle);
                }
            } else if self.state.transition(ConnectionState::Degraded, ConnectionState::Ready) {
                info!("{} traffic resumed", self.label);
            }

            self.revive_workers();
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.settings.watchdog_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_stopped(&mut stop) => break,
            }

            if self.activity.idle() > self.settings.heartbeat_after() {
                match self.send_heartbeat().await {
                    Ok(()) => trace!("{} heartbeat sent", self.label),
                    Err(e) => {
                        warn!("{} heartbeat failed: {}", self.label, e);
                        break;
                    }
                }
            }
        }
    }

    /// Restart receiver or heartbeat tasks that died while the link is
    /// still up.
    fn revive_workers(self: &Arc<Self>) {
        if self.shutdown.is_stopped() {
            return;
        }

        let mut workers = self.workers();
        if workers.receiver.as_ref().map_or(true, |h| h.is_finished()) {
            warn!("{} receiver task offline, restarting it", self.label);
            workers.receiver = Some(tokio::spawn(self.clone().receiver_loop()));
        }
        if self.settings.heartbeat && workers.heartbeat.as_ref().map_or(true, |h| h.is_finished()) {
            warn!("{} heartbeat task offline, restarting it", self.label);
            workers.heartbeat = Some(tokio::spawn(self.clone().heartbeat_loop()));
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("label", &self.label)
            .field("secured", &self.secured)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}
