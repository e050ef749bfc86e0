mod common;

use common::{MockTransport, Script, UNREACHABLE_HOST, context_with, target};
use sshmux::config::Config;
use sshmux::error::ErrorCode;
use sshmux::transport::Connection;
use sshmux::tunnel::{TunnelManager, TunnelSnapshot, TunnelSpec, TunnelStatus};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn spec(id: &str, local_port: u16, remote_host: &str, remote_port: u16) -> TunnelSpec {
    TunnelSpec {
        id: id.to_string(),
        name: format!("{id} tunnel"),
        local_host: "127.0.0.1".to_string(),
        local_port,
        remote_host: remote_host.to_string(),
        remote_port,
        ssh: target(),
    }
}

fn manager() -> (std::sync::Arc<MockTransport>, std::sync::Arc<TunnelManager>) {
    let transport = MockTransport::new(Script::default());
    let manager = TunnelManager::new(context_with(transport.clone(), Config::default()));
    (transport, manager)
}

async fn wait_for(
    events: &mut broadcast::Receiver<TunnelSnapshot>,
    pred: impl Fn(&TunnelSnapshot) -> bool,
) -> TunnelSnapshot {
    timeout(WAIT, async {
        loop {
            let snapshot = events.recv().await.expect("event stream closed");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for tunnel event")
}

#[tokio::test]
async fn local_forward_relays_ping_pong_and_tracks_connections() {
    let (transport, manager) = manager();
    let mut events = manager.subscribe();

    let created = manager
        .create_local_forward(spec("web", 0, "127.0.0.1", 9000))
        .await
        .unwrap();
    assert_eq!(created.status, TunnelStatus::Connected);
    assert_ne!(created.local_port, 0);
    let mut remote_ends = transport.last_connection().remote_ends();

    let mut client = TcpStream::connect(("127.0.0.1", created.local_port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut remote = timeout(WAIT, remote_ends.recv()).await.unwrap().unwrap();
    assert_eq!((remote.host.as_str(), remote.port), ("127.0.0.1", 9000));
    assert_eq!(remote.src_addr, "127.0.0.1");
    let mut buf = [0u8; 4];
    remote.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    remote.stream.write_all(b"pong").await.unwrap();

    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    assert_eq!(manager.get_tunnel("web").await.unwrap().connections, 1);

    drop(client);
    let mut rest = Vec::new();
    remote.stream.read_to_end(&mut rest).await.unwrap();
    drop(remote);

    let closed = wait_for(&mut events, |s| s.connections == 0 && s.bytes_in == 4).await;
    assert_eq!(closed.bytes_out, 4);
    assert_eq!(closed.status, TunnelStatus::Connected);

    manager.stop("web").await.unwrap();
}

#[tokio::test]
async fn counters_follow_directions_across_connections() {
    let (transport, manager) = manager();
    let created = manager
        .create_local_forward(spec("db", 0, "10.1.1.1", 5432))
        .await
        .unwrap();
    let mut remote_ends = transport.last_connection().remote_ends();

    for round in 1..=2u64 {
        let mut client = TcpStream::connect(("127.0.0.1", created.local_port)).await.unwrap();
        client.write_all(&[7u8; 300]).await.unwrap();

        let mut remote = timeout(WAIT, remote_ends.recv()).await.unwrap().unwrap();
        let mut seen = [0u8; 300];
        remote.stream.read_exact(&mut seen).await.unwrap();
        remote.stream.write_all(&[1u8; 20]).await.unwrap();

        let mut reply = [0u8; 20];
        client.read_exact(&mut reply).await.unwrap();
        drop(client);

        timeout(WAIT, async {
            loop {
                let snapshot = manager.get_tunnel("db").await.unwrap();
                if snapshot.connections == 0 && snapshot.bytes_in == 20 * round {
                    assert_eq!(snapshot.bytes_out, 300 * round);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
    manager.close_all().await;
    assert!(manager.get_all_tunnels().await.is_empty());
}

#[tokio::test]
async fn client_hangup_releases_peer_while_remote_stays_open() {
    let (transport, manager) = manager();
    let created = manager
        .create_local_forward(spec("idle", 0, "127.0.0.1", 9001))
        .await
        .unwrap();
    let mut remote_ends = transport.last_connection().remote_ends();

    let mut client = TcpStream::connect(("127.0.0.1", created.local_port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut remote = timeout(WAIT, remote_ends.recv()).await.unwrap().unwrap();
    let mut buf = [0u8; 4];
    remote.stream.read_exact(&mut buf).await.unwrap();
    remote.stream.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    // The server side never closes its end of the channel.
    drop(client);
    timeout(WAIT, async {
        while manager.get_tunnel("idle").await.unwrap().connections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut rest = Vec::new();
    timeout(WAIT, remote.stream.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    manager.stop("idle").await.unwrap();
}

#[tokio::test]
async fn socks5_connect_opens_channel_to_requested_address() {
    let (transport, manager) = manager();
    let created = manager.create_dynamic_forward(spec("proxy", 0, "", 0)).await.unwrap();
    let mut remote_ends = transport.last_connection().remote_ends();

    let mut client = TcpStream::connect(("127.0.0.1", created.local_port)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 168, 1, 20, 0x00, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    let mut remote = timeout(WAIT, remote_ends.recv()).await.unwrap().unwrap();
    assert_eq!((remote.host.as_str(), remote.port), ("192.168.1.20", 80));

    client.write_all(b"GET /").await.unwrap();
    let mut buf = [0u8; 5];
    remote.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET /");

    manager.stop("proxy").await.unwrap();
    assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
}

#[tokio::test]
async fn socks4_greeting_is_dropped_without_channel() {
    let (transport, manager) = manager();
    let created = manager.create_dynamic_forward(spec("proxy4", 0, "", 0)).await.unwrap();
    let mut remote_ends = transport.last_connection().remote_ends();

    let mut client = TcpStream::connect(("127.0.0.1", created.local_port)).await.unwrap();
    client
        .write_all(&[0x04, 0x01, 0x00, 0x50, 127, 0, 0, 1, 0x00])
        .await
        .unwrap();
    // Closed either cleanly or with a reset; no bytes either way.
    let mut rest = Vec::new();
    let _ = timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
    assert!(remote_ends.try_recv().is_err());

    manager.stop("proxy4").await.unwrap();
}

#[tokio::test]
async fn socks5_channel_failure_replies_general_failure() {
    let (_transport, manager) = manager();
    let created = manager.create_dynamic_forward(spec("proxyf", 0, "", 0)).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", created.local_port)).await.unwrap();
    let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, UNREACHABLE_HOST.len() as u8];
    request.extend_from_slice(UNREACHABLE_HOST.as_bytes());
    request.extend_from_slice(&443u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut replies = Vec::new();
    timeout(WAIT, client.read_to_end(&mut replies)).await.unwrap().unwrap();
    assert_eq!(replies, vec![0x05, 0x00, 0x05, 0x01]);

    manager.stop("proxyf").await.unwrap();
}

#[tokio::test]
async fn remote_forward_pipes_inbound_connections_to_local_target() {
    let (transport, manager) = manager();
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_port = destination.local_addr().unwrap().port();

    let created = manager
        .create_remote_forward(spec("rev", dest_port, "0.0.0.0", 2222))
        .await
        .unwrap();
    assert_eq!(created.status, TunnelStatus::Connected);
    let connection = transport.last_connection();
    assert_eq!(
        connection.forward_in_requests.lock().unwrap().clone(),
        vec![("0.0.0.0".to_string(), 2222)]
    );

    let mut far = connection.push_inbound();
    far.write_all(b"hello").await.unwrap();
    let (mut local, _) = timeout(WAIT, destination.accept()).await.unwrap().unwrap();
    let mut buf = [0u8; 5];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    local.write_all(b"world").await.unwrap();
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");
    assert_eq!(manager.get_tunnel("rev").await.unwrap().connections, 1);

    drop(far);
    drop(local);
    timeout(WAIT, async {
        loop {
            let snapshot = manager.get_tunnel("rev").await.unwrap();
            if snapshot.connections == 0 {
                assert_eq!((snapshot.bytes_in, snapshot.bytes_out), (5, 5));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    manager.stop("rev").await.unwrap();
}

#[tokio::test]
async fn remote_forward_closes_channel_when_local_side_hangs_up() {
    let (transport, manager) = manager();
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_port = destination.local_addr().unwrap().port();
    manager
        .create_remote_forward(spec("revhup", dest_port, "0.0.0.0", 2224))
        .await
        .unwrap();

    let mut far = transport.last_connection().push_inbound();
    let (local, _) = timeout(WAIT, destination.accept()).await.unwrap().unwrap();
    drop(local);

    let mut rest = Vec::new();
    timeout(WAIT, far.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    timeout(WAIT, async {
        while manager.get_tunnel("revhup").await.unwrap().connections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    manager.stop("revhup").await.unwrap();
}

#[tokio::test]
async fn remote_forward_closes_channel_when_destination_is_down() {
    let (transport, manager) = manager();
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = unused.local_addr().unwrap().port();
    drop(unused);

    manager
        .create_remote_forward(spec("dead", dead_port, "127.0.0.1", 2223))
        .await
        .unwrap();
    let mut far = transport.last_connection().push_inbound();
    let mut rest = Vec::new();
    timeout(WAIT, far.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    manager.stop("dead").await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_the_port() {
    let (transport, manager) = manager();
    let mut events = manager.subscribe();
    let created = manager
        .create_local_forward(spec("reuse", 0, "127.0.0.1", 80))
        .await
        .unwrap();
    let port = created.local_port;

    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut events, |s| s.connections == 1).await;

    manager.stop("reuse").await.unwrap();
    let stopped = wait_for(&mut events, |s| s.status == TunnelStatus::Disconnected).await;
    assert_eq!(stopped.connections, 0);
    assert!(transport.last_connection().is_closed());
    manager.stop("reuse").await.unwrap();
    assert!(events.try_recv().is_err());
    assert_eq!(
        manager.get_tunnel("reuse").await.unwrap_err().code(),
        ErrorCode::NotFound
    );

    let again = manager
        .create_local_forward(spec("reuse", port, "127.0.0.1", 80))
        .await
        .unwrap();
    assert_eq!(again.local_port, port);
    assert_eq!((again.bytes_in, again.bytes_out), (0, 0));
    manager.stop("reuse").await.unwrap();
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let (_transport, manager) = manager();
    manager
        .create_local_forward(spec("dup", 0, "127.0.0.1", 80))
        .await
        .unwrap();
    let err = manager
        .create_dynamic_forward(spec("dup", 0, "", 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);
    assert_eq!(manager.get_all_tunnels().await.len(), 1);
    manager.close_all().await;
}

#[tokio::test]
async fn bind_failure_reports_error_and_removes_tunnel() {
    let (transport, manager) = manager();
    let mut events = manager.subscribe();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = manager
        .create_local_forward(spec("clash", port, "127.0.0.1", 80))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BindFailed);

    let failed = wait_for(&mut events, |s| s.status == TunnelStatus::Error).await;
    assert!(failed.error.is_some());
    assert!(manager.get_all_tunnels().await.is_empty());
    assert!(transport.last_connection().is_closed());
}

#[tokio::test]
async fn lost_connection_moves_tunnel_to_error() {
    let (transport, manager) = manager();
    let mut events = manager.subscribe();
    manager
        .create_local_forward(spec("flaky", 0, "127.0.0.1", 80))
        .await
        .unwrap();

    transport.last_connection().drop_link();
    let failed = wait_for(&mut events, |s| s.status == TunnelStatus::Error).await;
    assert_eq!(failed.error.as_deref(), Some("SSH connection lost"));
    timeout(WAIT, async {
        while !manager.get_all_tunnels().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
