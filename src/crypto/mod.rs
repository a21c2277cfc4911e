pub mod dynkey;
pub mod iccode;
pub mod session;

pub use dynkey::{DynamicKeyGenerator, KeyFlavor};
pub use iccode::Iccode;
pub use session::SessionKeychain;

use std::fmt;

#[derive(Debug)]
pub enum CryptoError {
    KeyTooShort(usize),
    InvalidFingerprintLevel,
    Rsa(String),
    MalformedPublicKey(String),
    SessionKeyLength { expected: usize, actual: usize },
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::KeyTooShort(len) => write!(f, "Cipher key too short: {} bytes", len),
            CryptoError::InvalidFingerprintLevel => write!(f, "Fingerprint level must be at least 1"),
            CryptoError::Rsa(msg) => write!(f, "RSA error: {}", msg),
            CryptoError::MalformedPublicKey(msg) => write!(f, "Malformed public key: {}", msg),
            CryptoError::SessionKeyLength { expected, actual } => {
                write!(f, "Session key length mismatch: expected {}, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for CryptoError {}
