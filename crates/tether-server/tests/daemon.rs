//! End-to-end tests: a full daemon on loopback, with and without a kernel backend.

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::NamedTempFile;
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tether_proto::{DeviceId, GatewayMessage};
use tether_punch::probe;
use tether_server::{Daemon, ServerConfig, ServerError};
use tether_store::Store;
use tether_wireguard::{FakeKernel, PrivateKey, PublicKey};

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Fixture {
    _seed: NamedTempFile,
    config: ServerConfig,
    keys: Vec<PublicKey>,
}

/// Two users, two devices owned by alice sharing one network, one token each.
fn fixture(kernel: bool) -> Fixture {
    let keys: Vec<PublicKey> = (0..2).map(|_| PrivateKey::generate().public_key()).collect();
    let seed = format!(
        r#"{{
            "users": [
                {{"id": 1, "username": "alice", "email": "a@example.com"}},
                {{"id": 2, "username": "bob", "email": "b@example.com"}}
            ],
            "devices": [
                {{"id": 1, "owner": 1, "name": "laptop", "key": "{}", "ip": "127.0.0.1"}},
                {{"id": 2, "owner": 1, "name": "phone", "key": "{}", "ip": "127.0.0.3"}}
            ],
            "networks": [{{"id": 1, "owner": 1, "name": "home"}}],
            "memberships": [
                {{"network": 1, "device": 1}},
                {{"network": 1, "device": 2}}
            ],
            "tokens": {{"alice-token": 1, "bob-token": 2}}
        }}"#,
        keys[0], keys[1]
    );
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(seed.as_bytes()).expect("write seed");

    let toml = format!(
        r#"
listen = "127.0.0.1:0"
subnet = "127.0.0.0/8"
registry_file = "{}"

[delivery]
workers = 2
queue_capacity = 64

[kernel]
enabled = {kernel}
interface = "tether-test"
address = "127.0.0.2"
private_key = "{}"

[rendezvous]
bind = "127.0.0.1:0"
"#,
        file.path().display(),
        PrivateKey::generate().to_base64()
    );
    let config = ServerConfig::from_toml(&toml).expect("config");

    Fixture {
        _seed: file,
        config,
        keys,
    }
}

async fn connect(addr: SocketAddr, token: &str) -> Result<Client, WsError> {
    let mut request = format!("ws://{addr}/").into_client_request().expect("request");
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().expect("header"),
    );
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn next_message(client: &mut Client) -> GatewayMessage {
    loop {
        let frame = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("frame in time")
            .expect("open")
            .expect("frame");
        if let WsMessage::Text(text) = frame {
            return GatewayMessage::from_json(&text).expect("decode");
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition in time");
}

// ==================== Gateway Tests ====================

#[tokio::test]
async fn test_authenticated_ping_round_trip() {
    let fx = fixture(false);
    let daemon = Daemon::start(&fx.config).await.expect("start");

    let mut client = connect(daemon.gateway_addr(), "alice-token").await.expect("connect");
    let ping = GatewayMessage::ping(DeviceId::new(1), "198.51.100.1:51820");
    client
        .send(WsMessage::Text(ping.to_json().expect("encode")))
        .await
        .expect("send");

    let update = next_message(&mut client).await;
    assert_eq!(
        update.subject().and_then(|d| d.endpoint.clone()).as_deref(),
        Some("198.51.100.1:51820")
    );
    assert_eq!(
        daemon
            .store()
            .device_by_id(DeviceId::new(1))
            .expect("device")
            .endpoint
            .as_deref(),
        Some("198.51.100.1:51820")
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unknown_token_is_rejected_with_401() {
    let fx = fixture(false);
    let daemon = Daemon::start(&fx.config).await.expect("start");

    let err = connect(daemon.gateway_addr(), "nope").await.expect_err("rejected");
    assert!(
        matches!(&err, WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED),
        "unexpected error {err:?}"
    );
    assert!(daemon.registry().is_empty());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_missing_header_is_rejected() {
    let fx = fixture(false);
    let daemon = Daemon::start(&fx.config).await.expect("start");

    let result = connect_async(format!("ws://{}/", daemon.gateway_addr())).await;
    assert!(matches!(result, Err(WsError::Http(_))));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_other_users_device_is_not_claimed() {
    let fx = fixture(false);
    let daemon = Daemon::start(&fx.config).await.expect("start");

    let mut bob = connect(daemon.gateway_addr(), "bob-token").await.expect("connect");
    let ping = GatewayMessage::ping(DeviceId::new(1), "6.6.6.6:6");
    bob.send(WsMessage::Text(ping.to_json().expect("encode")))
        .await
        .expect("send");

    let registry = daemon.registry().clone();
    wait_until(|| registry.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(daemon.registry().find_by_device(DeviceId::new(1)).is_none());
    assert_eq!(
        daemon.store().device_by_id(DeviceId::new(1)).expect("device").endpoint,
        None
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let fx = fixture(false);
    let daemon = Daemon::start(&fx.config).await.expect("start");
    let mut client = connect(daemon.gateway_addr(), "alice-token").await.expect("connect");

    let registry = daemon.registry().clone();
    wait_until(|| registry.len() == 1).await;

    tokio::time::timeout(WAIT, daemon.shutdown())
        .await
        .expect("shutdown in time");
    assert!(registry.is_empty());

    let next = tokio::time::timeout(WAIT, client.next()).await.expect("closed in time");
    assert!(matches!(next, None | Some(Ok(WsMessage::Close(_))) | Some(Err(_))));
}

// ==================== Rendezvous Tests ====================

#[tokio::test]
async fn test_rendezvous_reports_source_address_without_kernel() {
    let fx = fixture(false);
    let daemon = Daemon::start(&fx.config).await.expect("start");

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let reply = probe(&socket, daemon.rendezvous_addr()).await.expect("probe");
    assert_eq!(reply, socket.local_addr().expect("addr").to_string());

    daemon.shutdown().await;
}

// ==================== Kernel Tests ====================

#[tokio::test]
async fn test_kernel_enabled_needs_backend() {
    let fx = fixture(true);
    let err = Daemon::start(&fx.config).await.expect_err("no backend");
    assert!(matches!(err, ServerError::Config(_)));
}

#[tokio::test]
async fn test_kernel_sync_mesh_rendezvous_and_teardown() {
    let fx = fixture(true);
    let kernel = FakeKernel::new();
    let daemon = Daemon::start_with_kernel(&fx.config, kernel.clone())
        .await
        .expect("start");

    assert!(kernel.is_up());
    assert!(daemon.peer_events().is_some());
    wait_until(|| kernel.peer_count() == 2).await;
    assert!(kernel.has_route("127.0.0.1".parse().expect("ip")));

    // Probes arriving from 127.0.0.1 belong to the laptop's peer.
    let underlay: SocketAddr = "198.51.100.9:51820".parse().expect("addr");
    kernel
        .simulate_handshake(&fx.keys[0], underlay)
        .expect("handshake");
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let reply = probe(&socket, daemon.rendezvous_addr()).await.expect("probe");
    assert_eq!(reply, underlay.to_string());

    daemon.shutdown().await;
    assert!(kernel.is_torn_down());
    assert_eq!(kernel.peer_count(), 0);
}

#[tokio::test]
async fn test_kernel_setup_failure_is_fatal() {
    let fx = fixture(true);
    let kernel = FakeKernel::new().failing_setup();

    let err = Daemon::start_with_kernel(&fx.config, kernel.clone())
        .await
        .expect_err("setup fails");
    assert!(matches!(err, ServerError::WireGuard(_)));
    assert!(!kernel.is_up());
}

#[tokio::test]
async fn test_runtime_peer_removal() {
    let fx = fixture(true);
    let kernel = FakeKernel::new();
    let daemon = Daemon::start_with_kernel(&fx.config, kernel.clone())
        .await
        .expect("start");
    wait_until(|| kernel.peer_count() == 2).await;

    let sender = daemon.peer_events().expect("sender");
    sender
        .enqueue(fx.keys[1], "127.0.0.3".parse().expect("ip"), true)
        .await
        .expect("enqueue");
    wait_until(|| kernel.peer(&fx.keys[1]).is_none()).await;
    assert!(!kernel.has_route("127.0.0.3".parse().expect("ip")));

    daemon.shutdown().await;
}
