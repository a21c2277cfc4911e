use std::fmt;
use std::io;

use crate::crypto::CryptoError;
use crate::protocol::ProtocolError;

#[derive(Debug)]
pub enum TransportError {
    /// No live connection when the call was made.
    NotConnected,
    /// The connection went away while the call was in progress.
    ConnectionLost,
    Timeout(String),
    AuthRejected(String),
    KeyExchange(String),
    Protocol(ProtocolError),
    Crypto(CryptoError),
    Io(io::Error),
    Config(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected =>
                write!(f, "not connected"),
            TransportError::ConnectionLost =>
                write!(f, "connection lost"),
            TransportError::Timeout(what) =>
                write!(f, "timed out: {}", what),
            TransportError::AuthRejected(reason) =>
                write!(f, "authentication rejected: {}", reason),
            TransportError::KeyExchange(reason) =>
                write!(f, "session key exchange failed: {}", reason),
            TransportError::Protocol(e) =>
                write!(f, "protocol error: {}", e),
            TransportError::Crypto(e) =>
                write!(f, "crypto error: {}", e),
            TransportError::Io(e) =>
                write!(f, "i/o error: {}", e),
            TransportError::Config(msg) =>
                write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Protocol(e) => Some(e),
            TransportError::Crypto(e) => Some(e),
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => TransportError::Timeout(e.to_string()),
            _ => TransportError::Io(e),
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e)
    }
}

impl From<CryptoError> for TransportError {
    fn from(e: CryptoError) -> Self {
        TransportError::Crypto(e)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
