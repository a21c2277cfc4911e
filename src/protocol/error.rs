use std::fmt;

#[derive(Debug)]
pub enum ProtocolError {
    UnknownMarker(u8),
    HeaderIntegrity,
    PayloadChecksum { expected: u16, computed: u16 },
    SegmentTooLarge { len: usize, total: usize },
    MessageTooLarge(usize),
    Truncated { need: usize, got: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownMarker(m) =>
                write!(f, "unknown frame marker 0x{:02x}", m),
            ProtocolError::HeaderIntegrity =>
                write!(f, "header integrity tag mismatch"),
            ProtocolError::PayloadChecksum { expected, computed } =>
                write!(f, "payload checksum mismatch: expected={:04x}, computed={:04x}", expected, computed),
            ProtocolError::SegmentTooLarge { len, total } =>
                write!(f, "segment of {} bytes exceeds message length {}", len, total),
            ProtocolError::MessageTooLarge(size) =>
                write!(f, "message too large: {}", size),
            ProtocolError::Truncated { need, got } =>
                write!(f, "truncated frame: need {} bytes, got {}", need, got),
        }
    }
}

impl std::error::Error for ProtocolError {}
