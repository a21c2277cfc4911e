use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::RngCore;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use sha2::{Digest, Sha512};

use i2tcp::crypto::SessionKeychain;
use i2tcp::{
    ClientConfig, ConnectionEndpoint, ConnectionState, ListenerServer, ProtocolVersion, ServerConfig,
    TransportError,
};

const KEY: &str = "testtest123";
const WAIT: Duration = Duration::from_secs(10);

fn keychain() -> Arc<SessionKeychain> {
    static KEYCHAIN: OnceLock<Arc<SessionKeychain>> = OnceLock::new();
    KEYCHAIN
        .get_or_init(|| Arc::new(SessionKeychain::generate(1024).expect("keychain")))
        .clone()
}

fn server_config(protocol: ProtocolVersion, secured: bool) -> ServerConfig {
    ServerConfig {
        listen_address: "127.0.0.1:0".to_string(),
        key: KEY.to_string(),
        protocol,
        secured,
        ..Default::default()
    }
}

fn client_config(addr: SocketAddr, protocol: ProtocolVersion) -> ClientConfig {
    ClientConfig {
        address: addr.to_string(),
        key: KEY.to_string(),
        protocol,
        ..Default::default()
    }
}

async fn start(config: ServerConfig) -> (ListenerServer, SocketAddr) {
    let server = ListenerServer::with_keychain(config, keychain()).expect("server");
    let addr = server.start().await.expect("bind");
    (server, addr)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

#[tokio::test]
async fn secured_session_round_trip() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let client = ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V3)).unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);
    assert!(client.is_secured());

    let handler = server.get_connection_timeout(WAIT).await.expect("handler");
    assert!(handler.is_secured());
    assert_eq!(server.connection_count(), 1);

    client.send(b"hello server").await.unwrap();
    assert_eq!(handler.get(None, WAIT).await, Some(b"hello server".to_vec()));

    handler.send(b"hello client").await.unwrap();
    assert_eq!(client.get(None, WAIT).await, Some(b"hello client".to_vec()));

    client.kill().await;
    server.kill().await;
}

#[tokio::test]
async fn authentication_only_session_on_every_version() {
    for protocol in [ProtocolVersion::V1, ProtocolVersion::V2, ProtocolVersion::V3] {
        let (server, addr) = start(server_config(protocol, false)).await;
        let client = ConnectionEndpoint::new(client_config(addr, protocol)).unwrap();
        client.connect().await.unwrap();
        assert!(!client.is_secured());

        let handler = server.get_connection_timeout(WAIT).await.expect("handler");
        client.send(b"plain").await.unwrap();
        assert_eq!(handler.get(None, WAIT).await, Some(b"plain".to_vec()), "{protocol:?}");

        client.kill().await;
        server.kill().await;
    }
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let mut config = client_config(addr, ProtocolVersion::V3);
    config.key = "not-the-key".to_string();

    let client = ConnectionEndpoint::new(config).unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::AuthRejected(_)), "{err}");
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(client.send(b"x").await, Err(TransportError::NotConnected)));

    assert!(eventually(|| server.metrics().auth_failures == 1).await);
    assert_eq!(server.connection_count(), 0);
    assert!(server.get_connection(false).await.is_none());
    server.kill().await;
}

#[tokio::test]
async fn client_requiring_encryption_refuses_plain_server() {
    let (server, addr) = start(server_config(ProtocolVersion::V2, false)).await;
    let mut config = client_config(addr, ProtocolVersion::V2);
    config.require_secured = true;

    let client = ConnectionEndpoint::new(config).unwrap();
    assert!(matches!(client.connect().await, Err(TransportError::KeyExchange(_))));
    server.kill().await;
}

#[tokio::test]
async fn large_payload_survives_intact() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let client = ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V3)).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    let payload = random_payload(1024 * 1024);
    client.send(&payload).await.unwrap();
    let received = handler.get(None, WAIT).await.expect("payload");
    assert_eq!(Sha512::digest(&received), Sha512::digest(&payload));

    handler.send(&received).await.unwrap();
    let echoed = client.get(None, WAIT).await.expect("echo");
    assert_eq!(Sha512::digest(&echoed), Sha512::digest(&payload));

    client.kill().await;
    server.kill().await;
}

#[tokio::test]
async fn empty_message_is_delivered() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let client = ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V3)).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    client.send(b"").await.unwrap();
    assert_eq!(handler.get(None, WAIT).await, Some(Vec::new()));

    client.kill().await;
    server.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_do_not_interleave() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let client = Arc::new(ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V3)).unwrap());
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    let mut expected = HashSet::new();
    let mut senders = Vec::new();
    for _ in 0..16 {
        let payload = random_payload(256 * 1024);
        expected.insert(hex::encode(Sha512::digest(&payload)));
        let client = client.clone();
        senders.push(tokio::spawn(async move { client.send(&payload).await }));
    }
    for sender in senders {
        sender.await.unwrap().unwrap();
    }

    let mut received = HashSet::new();
    for _ in 0..16 {
        let message = handler.get(None, WAIT).await.expect("message");
        received.insert(hex::encode(Sha512::digest(&message)));
    }
    assert_eq!(received, expected);

    client.kill().await;
    server.kill().await;
}

#[tokio::test]
async fn prefix_selects_matching_message() {
    let (server, addr) = start(server_config(ProtocolVersion::V2, true)).await;
    let client = ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V2)).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    client.send(b"log:first").await.unwrap();
    client.send(b"cmd:run").await.unwrap();

    assert_eq!(handler.get(Some(b"cmd:"), WAIT).await, Some(b"cmd:run".to_vec()));
    assert_eq!(handler.recv(true).await, Some(b"log:first".to_vec()));
    assert_eq!(handler.get(Some(b"cmd:"), Duration::from_millis(50)).await, None);

    client.kill().await;
    server.kill().await;
}

#[tokio::test]
async fn silent_peer_is_reaped() {
    let mut config = server_config(ProtocolVersion::V3, true);
    config.watchdog_timeout_ms = 600;
    config.watchdog_tick_ms = 100;
    let (server, addr) = start(config).await;

    let mut client_cfg = client_config(addr, ProtocolVersion::V3);
    client_cfg.heartbeat = false;
    let client = ConnectionEndpoint::new(client_cfg).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    assert!(handler.wait_for_state(ConnectionState::Closed, WAIT).await);
    assert!(eventually(|| server.connection_count() == 0).await);
    assert!(client.wait_for_state(ConnectionState::Closed, WAIT).await);
    assert!(matches!(handler.send(b"late").await, Err(TransportError::NotConnected)));

    client.kill().await;
    server.kill().await;
}

#[tokio::test]
async fn heartbeats_keep_idle_connection_alive() {
    let mut config = server_config(ProtocolVersion::V1, false);
    config.watchdog_timeout_ms = 1_000;
    config.watchdog_tick_ms = 100;
    let (server, addr) = start(config).await;

    let mut client_cfg = client_config(addr, ProtocolVersion::V1);
    client_cfg.watchdog_timeout_ms = 600;
    client_cfg.watchdog_tick_ms = 100;
    let client = ConnectionEndpoint::new(client_cfg).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(handler.is_connected());
    assert!(client.is_connected());

    client.kill().await;
    server.kill().await;
}

#[tokio::test]
async fn client_reconnects_after_server_drops_it() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let mut config = client_config(addr, ProtocolVersion::V3);
    config.auto_reconnect = true;
    config.reconnect_interval_ms = 200;
    let client = ConnectionEndpoint::new(config).unwrap();
    client.connect().await.unwrap();

    let first = server.get_connection_timeout(WAIT).await.expect("first handler");
    first.send(b"before").await.unwrap();
    assert_eq!(client.get(None, WAIT).await, Some(b"before".to_vec()));

    first.kill().await;
    let second = server.get_connection_timeout(WAIT).await.expect("second handler");
    assert!(eventually(|| client.is_connected() && client.metrics().reconnects == 1).await);

    client.send(b"after").await.unwrap();
    assert_eq!(second.get(None, WAIT).await, Some(b"after".to_vec()));

    client.kill().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    server.kill().await;
}

#[tokio::test]
async fn connection_limit_refuses_extra_clients() {
    let mut config = server_config(ProtocolVersion::V3, true);
    config.max_connections = 1;
    let (server, addr) = start(config).await;

    let first = ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V3)).unwrap();
    first.connect().await.unwrap();
    assert!(server.get_connection_timeout(WAIT).await.is_some());

    let mut second_cfg = client_config(addr, ProtocolVersion::V3);
    second_cfg.handshake_timeout_ms = 2_000;
    let second = ConnectionEndpoint::new(second_cfg).unwrap();
    assert!(second.connect().await.is_err());
    assert!(first.is_connected());

    first.kill().await;
    server.kill().await;
}

#[tokio::test]
async fn server_kill_closes_clients() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let client = ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V3)).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    server.kill().await;
    assert!(!server.is_running());
    assert_eq!(handler.state(), ConnectionState::Closed);
    assert!(client.wait_for_state(ConnectionState::Closed, WAIT).await);
    assert!(matches!(client.send(b"x").await, Err(TransportError::NotConnected)));
    assert!(server.get_connection(true).await.is_none());
}

#[tokio::test]
async fn reset_discards_buffered_messages() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, false)).await;
    let client = ConnectionEndpoint::new(client_config(addr, ProtocolVersion::V3)).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");

    handler.send(b"stale").await.unwrap();
    assert!(eventually(|| client.metrics().messages_received == 1).await);

    client.reset().await;
    assert_eq!(client.recv(false).await, None);
    assert_eq!(client.state(), ConnectionState::Closed);
    server.kill().await;
}

#[tokio::test]
async fn kill_drops_handshakes_in_progress() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;

    // never sends the pre-authentication key
    let mut silent = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), server.kill())
        .await
        .expect("kill finished");
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(1), silent.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "{read:?}");
    assert_eq!(server.metrics().auth_failures, 0);
}

#[tokio::test]
async fn kill_wakes_blocked_recv() {
    let (server, addr) = start(server_config(ProtocolVersion::V3, true)).await;
    let mut config = client_config(addr, ProtocolVersion::V3);
    config.auto_reconnect = true;
    let client = Arc::new(ConnectionEndpoint::new(config).unwrap());
    client.connect().await.unwrap();

    let reader = client.clone();
    let pending = tokio::spawn(async move { reader.recv(true).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    client.kill().await;
    let received = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("recv returned after kill")
        .unwrap();
    assert_eq!(received, None);
    assert_eq!(client.recv(true).await, None);
    server.kill().await;
}

#[tokio::test]
async fn quiet_peer_degrades_then_recovers() {
    let mut config = server_config(ProtocolVersion::V3, true);
    config.watchdog_timeout_ms = 2_000;
    config.watchdog_tick_ms = 100;
    let (server, addr) = start(config).await;

    let mut client_cfg = client_config(addr, ProtocolVersion::V3);
    client_cfg.heartbeat = false;
    let client = ConnectionEndpoint::new(client_cfg).unwrap();
    client.connect().await.unwrap();
    let handler = server.get_connection_timeout(WAIT).await.expect("handler");
    assert_eq!(handler.state(), ConnectionState::Ready);

    assert!(handler.wait_for_state(ConnectionState::Degraded, Duration::from_secs(5)).await);
    assert!(handler.is_connected());

    client.send(b"still here").await.unwrap();
    assert!(handler.wait_for_state(ConnectionState::Ready, Duration::from_secs(1)).await);
    assert_eq!(handler.get(None, WAIT).await, Some(b"still here".to_vec()));

    client.kill().await;
    server.kill().await;
}
