//! Segmenting framer and the matching depacker.
//!
//! A message is split into segments of at most the version's segment
//! capacity. Every segment carries the full message length, its own
//! length, a truncated SHA-256 tag over the header prefix and the shared
//! secret, and depending on the version a payload checksum and a per-message
//! segment id. The reader slides byte-by-byte over anything whose header
//! does not verify, which lets it resynchronise after corruption.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

use crate::protocol::constants::{
    ProtocolVersion, HEADER_PREFIX_LEN, MARKER_DATA, MARKER_HEARTBEAT, MAX_HEADER_TAG_LEN,
    MAX_MESSAGE_SIZE,
};
use crate::protocol::error::ProtocolError;
use crate::utils::crc::checksum16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub total_length: u32,
    pub segment_length: u16,
    pub tag: [u8; MAX_HEADER_TAG_LEN],
    pub payload_checksum: Option<u16>,
    pub segment_id: Option<u8>,
}

impl FrameHeader {
    /// Parse a data header. The integrity tag is not checked here.
    pub fn decode(version: ProtocolVersion, buf: &[u8]) -> Result<Self, ProtocolError> {
        let size = version.header_len();
        if buf.len() < size {
            return Err(ProtocolError::Truncated { need: size, got: buf.len() });
        }
        if buf[0] != MARKER_DATA {
            return Err(ProtocolError::UnknownMarker(buf[0]));
        }

        let total_length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        let segment_length = u16::from_be_bytes([buf[4], buf[5]]);

        let tag_len = version.header_tag_len();
        let mut tag = [0u8; MAX_HEADER_TAG_LEN];
        tag[..tag_len].copy_from_slice(&buf[HEADER_PREFIX_LEN..HEADER_PREFIX_LEN + tag_len]);

        let mut pos = HEADER_PREFIX_LEN + tag_len;
        let payload_checksum = if version.has_payload_checksum() {
            let value = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            pos += 2;
            Some(value)
        } else {
            None
        };
        let segment_id = version.has_segment_id().then(|| buf[pos]);

        Ok(Self {
            version,
            total_length,
            segment_length,
            tag,
            payload_checksum,
            segment_id,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.version.header_len());
        buf.extend_from_slice(&self.prefix());
        buf.extend_from_slice(&self.tag[..self.version.header_tag_len()]);
        if let Some(checksum) = self.payload_checksum {
            buf.extend_from_slice(&checksum.to_be_bytes());
        }
        if let Some(id) = self.segment_id {
            buf.push(id);
        }
        buf
    }

    /// Marker and length fields, the part covered by the integrity tag.
    fn prefix(&self) -> [u8; HEADER_PREFIX_LEN] {
        prefix_bytes(self.total_length, self.segment_length)
    }

    /// Identifies the message this segment belongs to.
    pub fn message_key(&self) -> (u32, Option<u8>) {
        (self.total_length, self.segment_id)
    }
}

fn prefix_bytes(total_length: u32, segment_length: u16) -> [u8; HEADER_PREFIX_LEN] {
    let mut prefix = [0u8; HEADER_PREFIX_LEN];
    prefix[0] = MARKER_DATA;
    prefix[1..4].copy_from_slice(&total_length.to_be_bytes()[1..]);
    prefix[4..6].copy_from_slice(&segment_length.to_be_bytes());
    prefix
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.header.encode();
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// What a verified header announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameInfo {
    Heartbeat,
    Data(FrameHeader),
}

/// Packs messages into frames and verifies incoming headers for one
/// protocol version and shared secret.
#[derive(Clone)]
pub struct Framer {
    version: ProtocolVersion,
    secret: Arc<[u8]>,
}

impl Framer {
    pub fn new(version: ProtocolVersion, psk: &[u8]) -> Self {
        let mut secret = version.wire_id().to_vec();
        secret.extend_from_slice(psk);
        Self {
            version,
            secret: secret.into(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn header_len(&self) -> usize {
        self.version.header_len()
    }

    pub fn heartbeat(&self) -> &'static [u8] {
        self.version.heartbeat_frame()
    }

    /// Split `payload` into frames. An empty payload still yields one frame.
    pub fn pack(&self, payload: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(payload.len()));
        }

        let total = payload.len() as u32;
        let segment_id = self.version.has_segment_id().then(rand::random::<u8>);
        if payload.is_empty() {
            return Ok(vec![self.frame(total, segment_id, &[])]);
        }

        Ok(payload
            .chunks(self.version.segment_capacity())
            .map(|segment| self.frame(total, segment_id, segment))
            .collect())
    }

    fn frame(&self, total: u32, segment_id: Option<u8>, segment: &[u8]) -> Frame {
        let segment_length = segment.len() as u16;
        let mut tag = [0u8; MAX_HEADER_TAG_LEN];
        let digest = self.tag_digest(&prefix_bytes(total, segment_length));
        let tag_len = self.version.header_tag_len();
        tag[..tag_len].copy_from_slice(&digest[..tag_len]);

        Frame {
            header: FrameHeader {
                version: self.version,
                total_length: total,
                segment_length,
                tag,
                payload_checksum: self.version.has_payload_checksum().then(|| checksum16(segment)),
                segment_id,
            },
            payload: segment.to_vec(),
        }
    }

    fn tag_digest(&self, prefix: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(prefix);
        hasher.update(&self.secret[..]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }

    /// Classify and verify a header-sized window.
    pub fn unpack_header(&self, buf: &[u8]) -> Result<FrameInfo, ProtocolError> {
        let size = self.header_len();
        if buf.len() < size {
            return Err(ProtocolError::Truncated { need: size, got: buf.len() });
        }
        match buf[0] {
            MARKER_HEARTBEAT if &buf[..size] == self.heartbeat() => return Ok(FrameInfo::Heartbeat),
            MARKER_HEARTBEAT => return Err(ProtocolError::HeaderIntegrity),
            MARKER_DATA => {}
            other => return Err(ProtocolError::UnknownMarker(other)),
        }

        let header = FrameHeader::decode(self.version, buf)?;
        let tag_len = self.version.header_tag_len();
        let digest = self.tag_digest(&header.prefix());
        if digest[..tag_len] != header.tag[..tag_len] {
            return Err(ProtocolError::HeaderIntegrity);
        }

        let len = header.segment_length as usize;
        let total = header.total_length as usize;
        if len > total || len > self.version.segment_capacity() {
            return Err(ProtocolError::SegmentTooLarge { len, total });
        }
        Ok(FrameInfo::Data(header))
    }

    pub fn verify_payload(&self, header: &FrameHeader, payload: &[u8]) -> Result<(), ProtocolError> {
        match header.payload_checksum {
            Some(expected) => {
                let computed = checksum16(payload);
                if computed != expected {
                    return Err(ProtocolError::PayloadChecksum { expected, computed });
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer").field("version", &self.version).finish_non_exhaustive()
    }
}

type MessageKey = (u32, Option<u8>);

struct Partial {
    key: MessageKey,
    data: Vec<u8>,
}

struct Skip {
    key: MessageKey,
    remaining: usize,
}

/// Reassembles segments into messages.
#[derive(Default)]
pub struct Reassembler {
    current: Option<Partial>,
    skip: Option<Skip>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Feed one verified segment; returns a message once it is complete.
    pub fn push(&mut self, header: &FrameHeader, payload: Vec<u8>) -> Option<Vec<u8>> {
        let key = header.message_key();
        let total = header.total_length as usize;

        if let Some(skip) = self.skip.as_mut() {
            if skip.key == key && payload.len() <= skip.remaining {
                skip.remaining -= payload.len();
                if skip.remaining == 0 {
                    self.skip = None;
                }
                trace!("dropping {} bytes of an abandoned message", payload.len());
                return None;
            }
            self.skip = None;
        }

        if let Some(mut partial) = self.current.take() {
            if partial.key == key {
                if partial.data.len() + payload.len() <= total {
                    partial.data.extend_from_slice(&payload);
                    return self.settle(partial, total);
                }
                warn!(
                    "segment overflows message ({} + {} > {}), abandoning it",
                    partial.data.len(),
                    payload.len(),
                    total
                );
            } else {
                warn!(
                    "abandoning incomplete message ({}/{} bytes), new message started",
                    partial.data.len(),
                    partial.key.0
                );
            }
        }

        if payload.len() > total {
            return None;
        }
        self.settle(Partial { key, data: payload }, total)
    }

    fn settle(&mut self, partial: Partial, total: usize) -> Option<Vec<u8>> {
        if partial.data.len() == total {
            Some(partial.data)
        } else {
            self.current = Some(partial);
            None
        }
    }

    /// Account for a segment whose payload failed verification. The message
    /// it belongs to is abandoned and its remaining segments are skipped.
    pub fn discard(&mut self, header: &FrameHeader) {
        let key = header.message_key();
        let received = match self.current.take() {
            Some(partial) if partial.key == key => partial.data.len(),
            Some(partial) => {
                warn!("abandoning incomplete message ({}/{} bytes)", partial.data.len(), partial.key.0);
                0
            }
            None => 0,
        };

        let remaining = (header.total_length as usize)
            .saturating_sub(received)
            .saturating_sub(header.segment_length as usize);
        self.skip = (remaining > 0).then_some(Skip { key, remaining });
    }
}

#[derive(Debug)]
pub enum FrameEvent {
    Heartbeat,
    /// A segment was accepted but its message is not complete yet.
    Segment,
    Message(Vec<u8>),
    /// A frame failed verification; the reader resynchronises.
    Rejected(ProtocolError),
}

/// Pulls frames off a byte stream and yields frame events.
pub struct FrameReader<R> {
    inner: R,
    framer: Framer,
    reassembler: Reassembler,
    window: Vec<u8>,
    resyncing: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framer: Framer) -> Self {
        let window = Vec::with_capacity(framer.header_len());
        Self {
            inner,
            framer,
            reassembler: Reassembler::new(),
            window,
            resyncing: false,
        }
    }

    /// Read until the next event. I/O errors, including end of stream, are
    /// returned as-is.
    pub async fn next_event(&mut self) -> std::io::Result<FrameEvent> {
        let header_len = self.framer.header_len();
        loop {
            let filled = self.window.len();
            if filled < header_len {
                self.window.resize(header_len, 0);
                if let Err(e) = self.inner.read_exact(&mut self.window[filled..]).await {
                    self.window.truncate(filled);
                    return Err(e);
                }
            }

            match self.framer.unpack_header(&self.window) {
                Ok(FrameInfo::Heartbeat) => {
                    self.window.clear();
                    self.resyncing = false;
                    return Ok(FrameEvent::Heartbeat);
                }
                Ok(FrameInfo::Data(header)) => {
                    self.window.clear();
                    self.resyncing = false;

                    let mut payload = vec![0u8; header.segment_length as usize];
                    self.inner.read_exact(&mut payload).await?;

                    if let Err(e) = self.framer.verify_payload(&header, &payload) {
                        self.reassembler.discard(&header);
                        return Ok(FrameEvent::Rejected(e));
                    }
                    return Ok(match self.reassembler.push(&header, payload) {
                        Some(message) => FrameEvent::Message(message),
                        None => FrameEvent::Segment,
                    });
                }
                Err(e) => {
                    self.window.remove(0);
                    if !self.resyncing {
                        self.resyncing = true;
                        return Ok(FrameEvent::Rejected(e));
                    }
                }
            }
        }
    }

    /// Read until a complete message arrives, skipping heartbeats and
    /// rejected frames.
    pub async fn next_message(&mut self) -> std::io::Result<Vec<u8>> {
        loop {
            match self.next_event().await? {
                FrameEvent::Message(message) => return Ok(message),
                FrameEvent::Rejected(e) => warn!("discarding frame: {}", e),
                FrameEvent::Heartbeat | FrameEvent::Segment => {}
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VERSIONS: [ProtocolVersion; 3] = [ProtocolVersion::V1, ProtocolVersion::V2, ProtocolVersion::V3];

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn wire(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.to_bytes()).collect()
    }

    async fn read_all_messages(framer: &Framer, bytes: &[u8]) -> (Vec<Vec<u8>>, usize) {
        let mut reader = FrameReader::new(bytes, framer.clone());
        let mut messages = Vec::new();
        let mut rejected = 0;
        while let Ok(event) = reader.next_event().await {
            match event {
                FrameEvent::Message(m) => messages.push(m),
                FrameEvent::Rejected(_) => rejected += 1,
                FrameEvent::Heartbeat | FrameEvent::Segment => {}
            }
        }
        (messages, rejected)
    }

    #[test]
    fn header_encode_decode() {
        let framer = Framer::new(ProtocolVersion::V3, b"secret");
        let frame = &framer.pack(b"hello").unwrap()[0];
        let bytes = frame.header.encode();
        assert_eq!(bytes.len(), ProtocolVersion::V3.header_len());
        assert_eq!(FrameHeader::decode(ProtocolVersion::V3, &bytes).unwrap(), frame.header);
    }

    #[test]
    fn segment_counts_follow_capacity() {
        for version in ALL_VERSIONS {
            let framer = Framer::new(version, b"secret");
            let cap = version.segment_capacity();
            for (len, expected) in [(0, 1), (1, 1), (cap - 1, 1), (cap, 1), (cap + 1, 2), (10 * cap, 10)] {
                let frames = framer.pack(&pattern(len)).unwrap();
                assert_eq!(frames.len(), expected, "{version:?} len {len}");
                assert!(frames.iter().all(|f| f.header.total_length as usize == len));
                assert!(frames.iter().all(|f| f.payload.len() <= cap));
                assert!(frames.iter().all(|f| f.header.segment_id == frames[0].header.segment_id));
            }
        }
    }

    #[test]
    fn oversized_message_is_refused() {
        let framer = Framer::new(ProtocolVersion::V3, b"secret");
        let payload = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(framer.pack(&payload), Err(ProtocolError::MessageTooLarge(_))));
    }

    #[test]
    fn tag_depends_on_secret() {
        let ours = Framer::new(ProtocolVersion::V2, b"secret");
        let theirs = Framer::new(ProtocolVersion::V2, b"other");
        let frame = &ours.pack(b"payload").unwrap()[0];
        let header = frame.header.encode();

        assert!(matches!(ours.unpack_header(&header), Ok(FrameInfo::Data(_))));
        assert!(matches!(theirs.unpack_header(&header), Err(ProtocolError::HeaderIntegrity)));
    }

    #[test]
    fn heartbeat_is_recognised() {
        let framer = Framer::new(ProtocolVersion::V1, b"secret");
        assert_eq!(framer.unpack_header(framer.heartbeat()).unwrap(), FrameInfo::Heartbeat);
    }

    #[tokio::test]
    async fn messages_survive_the_wire() {
        for version in ALL_VERSIONS {
            let framer = Framer::new(version, b"secret");
            let cap = version.segment_capacity();
            let sizes = [0, 1, cap - 1, cap, cap + 1, 10 * cap];

            let mut bytes = Vec::new();
            for &len in &sizes {
                bytes.extend(wire(&framer.pack(&pattern(len)).unwrap()));
                bytes.extend_from_slice(framer.heartbeat());
            }

            let (messages, rejected) = read_all_messages(&framer, &bytes).await;
            assert_eq!(rejected, 0);
            assert_eq!(messages.len(), sizes.len());
            for (message, &len) in messages.iter().zip(&sizes) {
                assert_eq!(message, &pattern(len));
            }
        }
    }

    #[tokio::test]
    async fn corrupted_header_is_rejected_and_stream_recovers() {
        let framer = Framer::new(ProtocolVersion::V2, b"secret");
        let mut first = wire(&framer.pack(b"first message").unwrap());
        first[2] ^= 0x40;
        let second = wire(&framer.pack(b"second message").unwrap());

        let bytes = [first, second].concat();
        let (messages, rejected) = read_all_messages(&framer, &bytes).await;
        assert!(rejected >= 1);
        assert_eq!(messages, vec![b"second message".to_vec()]);
    }

    #[tokio::test]
    async fn any_corrupted_header_byte_is_rejected() {
        for version in [ProtocolVersion::V2, ProtocolVersion::V3] {
            let framer = Framer::new(version, b"secret");
            let clean = wire(&framer.pack(b"first message").unwrap());
            let second = wire(&framer.pack(b"second message").unwrap());
            let tagged = HEADER_PREFIX_LEN + version.header_tag_len();

            for pos in 0..9 {
                // a one-byte tag lets 1 in 256 length corruptions through
                let mask = [0x40u8, 0x01, 0x80, 0xff]
                    .into_iter()
                    .find(|&mask| {
                        let mut header = clean[..framer.header_len()].to_vec();
                        header[pos] ^= mask;
                        pos >= tagged || framer.unpack_header(&header).is_err()
                    })
                    .expect("detectable corruption");

                let mut first = clean.clone();
                first[pos] ^= mask;
                let bytes = [first, second.clone()].concat();
                let (messages, rejected) = read_all_messages(&framer, &bytes).await;
                assert!(rejected >= 1, "{version:?} byte {pos}");
                assert_eq!(messages, vec![b"second message".to_vec()], "{version:?} byte {pos}");
            }
        }
    }

    #[tokio::test]
    async fn corrupted_payload_drops_the_whole_message() {
        let framer = Framer::new(ProtocolVersion::V3, b"secret");
        let cap = ProtocolVersion::V3.segment_capacity();
        let mut frames = framer.pack(&pattern(3 * cap)).unwrap();
        frames[1].payload[10] ^= 0xff;

        let mut bytes = wire(&frames);
        bytes.extend(wire(&framer.pack(b"after").unwrap()));

        let (messages, rejected) = read_all_messages(&framer, &bytes).await;
        assert_eq!(rejected, 1);
        assert_eq!(messages, vec![b"after".to_vec()]);
    }

    #[tokio::test]
    async fn interleaved_message_abandons_partial() {
        let framer = Framer::new(ProtocolVersion::V3, b"secret");
        let cap = ProtocolVersion::V3.segment_capacity();
        let big = framer.pack(&pattern(2 * cap)).unwrap();
        let small = framer.pack(b"small").unwrap();

        let bytes = [big[0].to_bytes(), wire(&small)].concat();
        let (messages, _) = read_all_messages(&framer, &bytes).await;
        assert_eq!(messages, vec![b"small".to_vec()]);
    }

    #[tokio::test]
    async fn leading_garbage_is_skipped() {
        let framer = Framer::new(ProtocolVersion::V1, b"secret");
        let mut bytes = b"\x00\x01garbage that is not a frame".to_vec();
        bytes.extend(wire(&framer.pack(b"payload").unwrap()));

        let (messages, rejected) = read_all_messages(&framer, &bytes).await;
        assert_eq!(rejected, 1);
        assert_eq!(messages, vec![b"payload".to_vec()]);
    }

    #[test]
    fn reassembler_skips_rest_of_discarded_message() {
        let framer = Framer::new(ProtocolVersion::V2, b"secret");
        let cap = ProtocolVersion::V2.segment_capacity();
        let frames = framer.pack(&pattern(3 * cap)).unwrap();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&frames[0].header, frames[0].payload.clone()).is_none());
        reassembler.discard(&frames[1].header);
        assert!(!reassembler.in_progress());
        assert!(reassembler.push(&frames[2].header, frames[2].payload.clone()).is_none());
        assert!(!reassembler.in_progress());

        let next = framer.pack(b"next").unwrap();
        assert_eq!(reassembler.push(&next[0].header, next[0].payload.clone()), Some(b"next".to_vec()));
    }
}
