//! i2tcp: a framed, authenticated and optionally encrypted TCP transport.
//!
//! A [`ListenerServer`] accepts connections and authenticates each peer
//! against a pre-shared key with a time-rotating dynamic key. After
//! authentication the server may hand the client an RSA public key, and the
//! client answers with a session key that drives a symmetric stream cipher
//! in both directions. Messages of up to 16 MiB are split into integrity
//! checked frames and reassembled on the other side. A
//! [`ConnectionEndpoint`] is the client half, optionally reconnecting on
//! its own when the link drops.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod utils;

pub use config::{ClientConfig, NodeConfig, ServerConfig};
pub use connection::{ConnectionEndpoint, ConnectionHandler, ConnectionState};
pub use error::{Result, TransportError};
pub use metrics::MetricsSnapshot;
pub use protocol::ProtocolVersion;
pub use server::ListenerServer;
