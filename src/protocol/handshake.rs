//! Connection handshake: dynamic-key authentication followed by an
//! optional RSA-wrapped session key exchange.
//!
//! ```text
//! client                                   server
//!   -- pre-auth key (16 bytes, v3 only) -->
//!   <-------------- challenge (64 bytes) --
//!   -- masked dynamic key (64 bytes) ----->
//!   <----------------------- wire id ------
//!   -- "OK" ------------------------------>
//!   <-- framed negotiation flag [+ PEM] ---
//!   -- framed wrapped session key -------->   (secured only)
//!   <-- framed "CODER READY" --------------   (secured only)
//! ```

use std::time::Duration;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::connection::state::{ConnectionState, StateCell};
use crate::crypto::dynkey::{DynamicKeyGenerator, KeyFlavor};
use crate::crypto::session::{parse_public_pem, wrap_session_key, SessionKeychain};
use crate::crypto::Iccode;
use crate::error::{Result, TransportError};
use crate::protocol::constants::{
    ProtocolVersion, AUTH_ACK, CHALLENGE_LEN, CODER_READY, FLAG_AUTH_ONLY, FLAG_SECURED,
    FLAG_SEPARATOR, MIX_CODER_LEVEL, PRE_AUTH_BUCKET_SECS, PRE_AUTH_KEY_LEN, SESSION_CODER_LEVEL,
};
use crate::protocol::frame::{FrameReader, Framer};
use crate::utils::io::{read_exact, write_all};

/// Everything both peers derive from the pre-shared key.
pub struct Credentials {
    psk: Vec<u8>,
    version: ProtocolVersion,
    auth_keys: DynamicKeyGenerator,
    pre_auth_keys: DynamicKeyGenerator,
}

impl Credentials {
    pub fn new(psk: &[u8], version: ProtocolVersion, bucket_secs: f64, flush_rounds: u32) -> Result<Self> {
        if psk.len() <= 1 {
            return Err(TransportError::Config("pre-shared key must be at least 2 bytes".into()));
        }

        let pre_auth_seed = Sha256::digest(psk);
        Ok(Self {
            psk: psk.to_vec(),
            version,
            auth_keys: DynamicKeyGenerator::new(psk, flush_rounds, bucket_secs),
            pre_auth_keys: DynamicKeyGenerator::new(&pre_auth_seed[..16], 1, PRE_AUTH_BUCKET_SECS)
                .with_flavor(KeyFlavor::Compact16),
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn framer(&self) -> Framer {
        Framer::new(self.version, &self.psk)
    }

    /// Cipher that masks the dynamic key for one challenge.
    fn challenge_coder(&self, challenge: &[u8]) -> Result<Iccode> {
        let mut hasher = Sha256::new();
        hasher.update(Sha256::digest(&self.psk));
        hasher.update(challenge);
        Ok(Iccode::new(&hasher.finalize(), MIX_CODER_LEVEL)?)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("version", &self.version).finish_non_exhaustive()
    }
}

/// Ciphers negotiated for an established connection.
#[derive(Debug, Default)]
pub struct Session {
    pub encoder: Option<Iccode>,
    pub decoder: Option<Iccode>,
}

impl Session {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn secured(session_key: &[u8]) -> Result<Self> {
        Ok(Self {
            encoder: Some(Iccode::new(session_key, SESSION_CODER_LEVEL)?),
            decoder: Some(Iccode::new(session_key, SESSION_CODER_LEVEL)?),
        })
    }

    pub fn is_secured(&self) -> bool {
        self.encoder.is_some()
    }
}

/// Write one framed message.
pub async fn send_message<S>(stream: &mut S, framer: &Framer, payload: &[u8], limit: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    for frame in framer.pack(payload)? {
        write_all(stream, &frame.to_bytes(), limit).await?;
    }
    Ok(())
}

/// Read one framed message, skipping heartbeats and rejected frames.
pub async fn recv_message<S>(stream: &mut S, framer: &Framer, limit: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(stream, framer.clone());
    match tokio::time::timeout(limit, reader.next_message()).await {
        Ok(message) => Ok(message?),
        Err(_) => Err(TransportError::Timeout(format!("no handshake message within {:?}", limit))),
    }
}

/// Treat end of stream during authentication as a rejection by the peer.
fn closed_as_rejection(e: std::io::Error, reason: &str) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => TransportError::AuthRejected(reason.to_string()),
        _ => e.into(),
    }
}

pub async fn server_handshake<S>(
    stream: &mut S,
    credentials: &Credentials,
    keychain: Option<&SessionKeychain>,
    state: &StateCell,
    limit: Duration,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    state.set(ConnectionState::Authenticating);
    let version = credentials.version;

    if version.has_pre_auth() {
        let pre_auth = read_exact(stream, PRE_AUTH_KEY_LEN, limit).await?;
        if !credentials.pre_auth_keys.matches(&pre_auth) {
            return Err(TransportError::AuthRejected("pre-authentication key mismatch".into()));
        }
        trace!("pre-authentication key accepted");
    }

    let mut challenge = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    write_all(stream, &challenge, limit).await?;

    let masked = read_exact(stream, credentials.auth_keys.key_len(), limit).await?;
    let dynamic_key = credentials.challenge_coder(&challenge)?.decode(&masked);
    if !credentials.auth_keys.matches(&dynamic_key) {
        return Err(TransportError::AuthRejected("dynamic key mismatch".into()));
    }

    write_all(stream, version.wire_id(), limit).await?;
    let ack = read_exact(stream, AUTH_ACK.len(), limit).await?;
    if ack != AUTH_ACK {
        return Err(TransportError::AuthRejected("peer did not acknowledge protocol version".into()));
    }
    debug!("peer authenticated");

    let framer = credentials.framer();
    match keychain {
        Some(keychain) => {
            state.set(ConnectionState::KeyExchange);
            let mut flag = FLAG_SECURED.to_vec();
            flag.push(FLAG_SEPARATOR);
            flag.extend_from_slice(keychain.public_pem().as_bytes());
            send_message(stream, &framer, &flag, limit).await?;

            let wrapped = recv_message(stream, &framer, limit).await?;
            let session_key = keychain
                .unwrap_session_key(&wrapped)
                .map_err(|e| TransportError::KeyExchange(e.to_string()))?;
            let session = Session::secured(&session_key)?;

            send_message(stream, &framer, CODER_READY, limit).await?;
            debug!("secured session established");
            Ok(session)
        }
        None => {
            let mut flag = FLAG_AUTH_ONLY.to_vec();
            flag.push(FLAG_SEPARATOR);
            send_message(stream, &framer, &flag, limit).await?;
            Ok(Session::plain())
        }
    }
}

pub async fn client_handshake<S>(
    stream: &mut S,
    credentials: &Credentials,
    require_secured: bool,
    state: &StateCell,
    limit: Duration,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    state.set(ConnectionState::Authenticating);
    let version = credentials.version;

    if version.has_pre_auth() {
        write_all(stream, &credentials.pre_auth_keys.generate(0), limit).await?;
    }

    let challenge = read_exact(stream, CHALLENGE_LEN, limit)
        .await
        .map_err(|e| closed_as_rejection(e, "server closed the connection before the challenge"))?;
    let masked = credentials.challenge_coder(&challenge)?.encode(&credentials.auth_keys.generate(0));
    write_all(stream, &masked, limit).await?;

    let wire_id = read_exact(stream, version.wire_id().len(), limit)
        .await
        .map_err(|e| closed_as_rejection(e, "invalid key or invalid server"))?;
    if wire_id != version.wire_id() {
        return Err(TransportError::AuthRejected(format!(
            "protocol version mismatch: server speaks {}",
            String::from_utf8_lossy(&wire_id)
        )));
    }
    write_all(stream, AUTH_ACK, limit).await?;

    let framer = credentials.framer();
    let negotiation = recv_message(stream, &framer, limit).await?;
    let (flag, rest) = match negotiation.iter().position(|&b| b == FLAG_SEPARATOR) {
        Some(pos) => (&negotiation[..pos], &negotiation[pos + 1..]),
        None => (&negotiation[..], &[][..]),
    };

    if flag == FLAG_SECURED {
        state.set(ConnectionState::KeyExchange);
        let public_key = parse_public_pem(rest).map_err(|e| TransportError::KeyExchange(e.to_string()))?;
        let (wrapped, session_key) =
            wrap_session_key(&public_key).map_err(|e| TransportError::KeyExchange(e.to_string()))?;
        let session = Session::secured(&session_key)?;
        send_message(stream, &framer, &wrapped, limit).await?;

        let ready = recv_message(stream, &framer, limit).await?;
        if ready != CODER_READY {
            return Err(TransportError::KeyExchange("server did not confirm the session key".into()));
        }
        debug!("secured session established");
        Ok(session)
    } else if flag == FLAG_AUTH_ONLY {
        if require_secured {
            return Err(TransportError::KeyExchange("server does not offer a secured session".into()));
        }
        warn!("server offers authentication only, traffic will not be encrypted");
        Ok(Session::plain())
    } else {
        Err(TransportError::AuthRejected("unexpected negotiation flag".into()))
    }
}
