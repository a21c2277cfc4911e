pub mod constants;
pub mod error;
pub mod frame;
pub mod handshake;

pub use constants::ProtocolVersion;
pub use error::ProtocolError;
pub use frame::{Frame, FrameEvent, FrameHeader, FrameReader, Framer};
