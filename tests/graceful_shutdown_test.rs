//! Integration tests for graceful shutdown behavior.
//!
//! The load-bearing property: every file buffer still in memory when
//! shutdown begins must be flushed to disk before shutdown returns, even
//! though no flush command was ever sent.

use fogwillow::{app::Fog, config::Config};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::sleep;

async fn start_fog(output: &Path) -> Fog {
    let config = Config {
        output_path: output.to_path_buf(),
        listen_addr: "127.0.0.1:0".to_string(),
        // Long intervals so nothing expires on its own during the test.
        flush_interval_secs: 60.0,
        group_interval_secs: 60.0,
        ..Config::default()
    };

    let mut fog = Fog::new(config);
    fog.start().await.expect("failed to start fog");
    fog
}

async fn send(fog: &Fog, payload: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
    socket
        .send_to(payload, fog.udp_addr().expect("fog is started"))
        .await
        .expect("send datagram");
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn shutdown_force_flushes_buffered_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut fog = start_fog(dir.path()).await;

    send(&fog, b"1\nfilepath=one.log\nfirst\n").await;
    send(&fog, b"1\nfilepath=two.log\nsecond\n").await;

    // Make sure both packets landed in memory before shutting down.
    let metrics = fog.metrics().clone();
    wait_for("packets processed", || metrics.packets.get() == 2).await;
    wait_for("buffers in memory", || fog.buffered_files() == 2).await;

    fog.shutdown().await;

    // No polling here: shutdown must not return before the writes finished.
    assert_eq!(
        std::fs::read(dir.path().join("one.log")).unwrap(),
        b"first\n"
    );
    assert_eq!(
        std::fs::read(dir.path().join("two.log")).unwrap(),
        b"second\n"
    );
    assert_eq!(metrics.files.get(), 2);
    assert_eq!(metrics.expires.get(), 2, "forced flushes count as expired");
}

#[tokio::test]
async fn shutdown_completes_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let mut fog = start_fog(dir.path()).await;

    send(&fog, b"1\nfilepath=a.log\ndata\n").await;
    let metrics = fog.metrics().clone();
    wait_for("packet processed", || metrics.packets.get() == 1).await;

    let start = Instant::now();
    fog.shutdown().await;
    assert!(
        start.elapsed() < Duration::from_secs(6),
        "shutdown took too long: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn repeated_shutdown_is_safe() {
    let dir = tempfile::tempdir().unwrap();
    let mut fog = start_fog(dir.path()).await;

    fog.shutdown().await;
    // Second shutdown is a no-op.
    fog.shutdown().await;
}

#[tokio::test]
async fn shutdown_with_no_traffic_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let mut fog = start_fog(dir.path()).await;

    fog.shutdown().await;

    assert_eq!(fog.metrics().packets.get(), 0);
    assert_eq!(fog.metrics().errors.get(), 0);
}
