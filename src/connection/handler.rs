use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::info;

use crate::connection::link::{Link, LinkContext};
use crate::connection::state::{ConnectionState, StateCell};
use crate::error::{Result, TransportError};
use crate::protocol::handshake::server_handshake;
use crate::server::ServerShared;
use crate::utils::buffer::InboundBuffer;

/// Server side of one accepted connection.
#[derive(Debug)]
pub struct ConnectionHandler {
    peer: SocketAddr,
    state: Arc<StateCell>,
    inbound: Arc<InboundBuffer>,
    link: Arc<Link>,
}

impl ConnectionHandler {
    /// Run the server handshake on a freshly accepted socket.
    pub(crate) async fn accept(mut stream: TcpStream, peer: SocketAddr, shared: &ServerShared) -> Result<Self> {
        let state = Arc::new(StateCell::new(ConnectionState::Connecting));
        let _ = stream.set_nodelay(true);

        let session = match server_handshake(
            &mut stream,
            &shared.credentials,
            shared.keychain.as_deref(),
            &state,
            shared.handshake_timeout,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                state.set(ConnectionState::Closed);
                shared.metrics.auth_failed();
                return Err(e);
            }
        };

        let inbound = Arc::new(InboundBuffer::new(shared.buffer_max));
        let link = Link::establish(
            stream,
            session,
            LinkContext {
                label: peer.to_string(),
                framer: shared.credentials.framer(),
                settings: shared.link_settings.clone(),
                state: state.clone(),
                inbound: inbound.clone(),
                metrics: shared.metrics.clone(),
            },
        );
        info!("Client {} connected{}", peer, if link.is_secured() { " (secured)" } else { "" });

        Ok(Self { peer, state, inbound, link })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_live()
    }

    pub fn is_secured(&self) -> bool {
        self.link.is_secured()
    }

    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.link.send(payload).await
    }

    /// First buffered message starting with `prefix` (any message if
    /// `None`), waiting up to `timeout`. Returns early once the connection
    /// has closed and nothing matching is buffered.
    pub async fn get(&self, prefix: Option<&[u8]>, timeout: Duration) -> Option<Vec<u8>> {
        tokio::select! {
            message = self.inbound.get(prefix, timeout) => message,
            _ = self.state.wait_closed() => self.inbound.take_matching(prefix),
        }
    }

    /// Oldest buffered message. With `block` it waits until one arrives or
    /// the connection closes.
    pub async fn recv(&self, block: bool) -> Option<Vec<u8>> {
        if !block {
            return self.inbound.take_matching(None);
        }
        tokio::select! {
            message = self.inbound.wait(None) => Some(message),
            _ = self.state.wait_closed() => self.inbound.take_matching(None),
        }
    }

    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.state.wait_for(target, timeout).await
    }

    /// Close the connection and join its background tasks.
    pub async fn kill(&self) {
        self.link.kill().await;
        info!("Connection with {} killed", self.peer);
    }
}
