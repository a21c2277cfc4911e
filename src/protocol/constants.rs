//! Protocol constants for i2tcp network communication

use serde::{Deserialize, Serialize};

/// Frame markers
pub const MARKER_DATA: u8 = b'A';
pub const MARKER_HEARTBEAT: u8 = b'H';

/// Heartbeat frames are this literal truncated to the header length
pub const HEARTBEAT_LITERAL: &[u8] = b"Heartbeat_";

/// Fixed header prefix: marker, u24 total length, u16 segment length
pub const HEADER_PREFIX_LEN: usize = 6;
pub const MAX_HEADER_TAG_LEN: usize = 3;

/// Largest message the u24 total-length field can describe
pub const MAX_MESSAGE_SIZE: usize = 0xFF_FFFF;

/// Handshake
pub const CHALLENGE_LEN: usize = 64;
pub const PRE_AUTH_KEY_LEN: usize = 16;
pub const AUTH_ACK: &[u8] = b"OK";
pub const FLAG_SECURED: &[u8] = b"SECURED_SESSION_KEY_REQUIRED";
pub const FLAG_AUTH_ONLY: &[u8] = b"AUTHENTICATION_ONLY";
pub const FLAG_SEPARATOR: u8 = 0x07;
pub const CODER_READY: &[u8] = b"CODER READY";

/// Cipher fingerprint levels
pub const MIX_CODER_LEVEL: u32 = 6;
pub const SESSION_CODER_LEVEL: u32 = 3;

/// Pre-authentication key rotation period
pub const PRE_AUTH_BUCKET_SECS: f64 = 60.0;

pub const DEFAULT_PORT: u16 = 24678;

/// Wire protocol revision. Both peers must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
    V2,
    #[default]
    V3,
}

impl ProtocolVersion {
    /// Identifier exchanged during authentication
    pub const fn wire_id(self) -> &'static [u8] {
        match self {
            ProtocolVersion::V1 => b"1.3",
            ProtocolVersion::V2 => b"2.1",
            ProtocolVersion::V3 => b"3.0",
        }
    }

    /// Maximum payload bytes per frame
    pub const fn segment_capacity(self) -> usize {
        match self {
            ProtocolVersion::V1 => 60_000,
            ProtocolVersion::V2 => 8_182,
            ProtocolVersion::V3 => 32_758,
        }
    }

    pub const fn header_tag_len(self) -> usize {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => 3,
            ProtocolVersion::V3 => 1,
        }
    }

    pub const fn has_payload_checksum(self) -> bool {
        matches!(self, ProtocolVersion::V3)
    }

    pub const fn has_segment_id(self) -> bool {
        !matches!(self, ProtocolVersion::V1)
    }

    /// Pre-authentication key is sent before the challenge
    pub const fn has_pre_auth(self) -> bool {
        matches!(self, ProtocolVersion::V3)
    }

    pub const fn header_len(self) -> usize {
        let mut len = HEADER_PREFIX_LEN + self.header_tag_len();
        if self.has_payload_checksum() {
            len += 2;
        }
        if self.has_segment_id() {
            len += 1;
        }
        len
    }

    pub fn heartbeat_frame(self) -> &'static [u8] {
        &HEARTBEAT_LITERAL[..self.header_len()]
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.wire_id()))
    }
}
