use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use ember_watcher::app::{self, App};
use ember_watcher::region::mock::RegionImage;
use ember_watcher::snapshot::MetricsSnapshot;
use ember_watcher::{Config, Shutdown};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn config_for(region: &Path) -> Config {
    Config {
        http_port: 0,
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        poll_interval: Duration::from_millis(20),
        region_path: region.to_path_buf(),
        drain_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

fn write_region(path: &Path, active_connections: u32) {
    let bytes = RegionImage::new()
        .timestamp_ms(1_700_000_000_000)
        .active_connections(active_connections)
        .queries_per_second(120)
        .to_bytes();
    std::fs::write(path, bytes).unwrap();
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    client
}

/// Next text frame, skipping control frames.
async fn next_message(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for_subscribers(app: &App, n: usize) {
    tokio::time::timeout(WAIT, async {
        while app.hub().subscriber_count() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscribers never registered");
}

/// Reads until the server closes the connection. Returns the close code, if
/// a close frame was sent.
async fn read_until_closed(client: &mut Client) -> Option<u16> {
    loop {
        match tokio::time::timeout(WAIT, client.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => panic!("connection not closed within timeout"),
        }
    }
}

#[tokio::test]
async fn test_pushes_decoded_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("metrics.mmap");
    write_region(&region, 42);

    let shutdown = Shutdown::new();
    let app = app::start(config_for(&region), shutdown.clone())
        .await
        .unwrap();
    let mut client = connect(app.local_addr()).await;

    let msg = next_message(&mut client).await;
    assert_eq!(msg["type"], "snapshot");
    assert!(msg["seq"].as_u64().unwrap() >= 1);
    let snapshot: MetricsSnapshot = serde_json::from_value(msg["snapshot"].clone()).unwrap();
    assert_eq!(snapshot.active_connections, 42);
    assert_eq!(snapshot.queries_per_second, 120);
    assert_eq!(snapshot.timestamp_ms, 1_700_000_000_000);

    // The producer rewrites the region; the change reaches the client.
    write_region(&region, 43);
    tokio::time::timeout(WAIT, async {
        loop {
            let msg = next_message(&mut client).await;
            if msg["snapshot"]["active_connections"] == 43 {
                break;
            }
        }
    })
    .await
    .expect("updated region never published");

    shutdown.trigger();
    assert_eq!(read_until_closed(&mut client).await, Some(1001));
    tokio::time::timeout(WAIT, app.wait())
        .await
        .expect("app did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_messages_arrive_in_capture_order() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("metrics.mmap");
    write_region(&region, 7);

    let shutdown = Shutdown::new();
    let app = app::start(config_for(&region), shutdown.clone())
        .await
        .unwrap();
    let mut client = connect(app.local_addr()).await;

    let mut seqs = Vec::new();
    let mut captured = Vec::new();
    for _ in 0..10 {
        let msg = next_message(&mut client).await;
        seqs.push(msg["seq"].as_u64().unwrap());
        let snapshot: MetricsSnapshot = serde_json::from_value(msg["snapshot"].clone()).unwrap();
        captured.push(snapshot.captured_at);
    }
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert!(captured.windows(2).all(|w| w[0] <= w[1]));

    shutdown.trigger();
    app.wait().await.unwrap();
}

#[tokio::test]
async fn test_no_messages_while_region_missing() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("metrics.mmap");

    let shutdown = Shutdown::new();
    let app = app::start(config_for(&region), shutdown.clone())
        .await
        .unwrap();
    let mut client = connect(app.local_addr()).await;
    wait_for_subscribers(&app, 1).await;

    let quiet = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(quiet.is_err(), "unexpected message while region missing");

    // The database starts writing; polling picks it up without a restart.
    write_region(&region, 5);
    let msg = next_message(&mut client).await;
    assert_eq!(msg["snapshot"]["active_connections"], 5);

    shutdown.trigger();
    app.wait().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_every_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("metrics.mmap");
    write_region(&region, 1);

    let shutdown = Shutdown::new();
    let app = app::start(config_for(&region), shutdown.clone())
        .await
        .unwrap();
    let addr = app.local_addr();

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connect(addr).await);
    }
    wait_for_subscribers(&app, 5).await;
    let hub = app.hub().clone();

    shutdown.trigger();
    shutdown.trigger();

    for client in &mut clients {
        let code = read_until_closed(client).await;
        assert!(matches!(code, Some(1001) | None));
    }
    let report = tokio::time::timeout(WAIT, app.wait())
        .await
        .expect("app did not stop")
        .unwrap();
    assert_eq!(report.undrained, 0);
    assert_eq!(report.hub.active_subscribers, 0);
    assert_eq!(report.hub.registered_total, 5);
    assert!(hub.is_closed());

    // Nothing is listening any more.
    assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
}
