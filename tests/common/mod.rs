//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use forward_proxy::config::ProxyConfig;
use forward_proxy::net::ConnectionTracker;
use forward_proxy::proxy::CONNECTION_ESTABLISHED;
use forward_proxy::{ProxyServer, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A proxy running on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Default config with a one-second relay grace period.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.relay.timeout_secs = 1;
    config.upstream.connect_timeout_secs = 3;
    config
}

/// Start a proxy with `config` on 127.0.0.1.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = ProxyServer::new(config);
    let tracker = server.tracker();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    TestProxy {
        addr,
        tracker,
        shutdown,
    }
}

/// Echo every byte back until the peer closes.
pub async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// Origin that reads one request head, reports it, replies with `response`
/// verbatim and closes.
pub async fn start_mock_origin(
    response: &'static [u8],
) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(request);
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// An address nobody listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Open a tunnel to `target` through the proxy and consume the handshake.
pub async fn open_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();

    let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
    stream.read_exact(&mut established).await.unwrap();
    assert_eq!(established, CONNECTION_ESTABLISHED);
    stream
}

/// Read until EOF, failing the test if that takes longer than `limit`.
pub async fn read_to_end_within(stream: &mut TcpStream, limit: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(limit, stream.read_to_end(&mut out))
        .await
        .expect("connection was not closed in time")
        .unwrap();
    out
}

/// Wait until the proxy tracks no connection.
pub async fn assert_drained(tracker: &ConnectionTracker, limit: Duration) {
    assert!(
        tracker.wait_idle(limit).await,
        "proxy still holds {} connection(s)",
        tracker.active_count()
    );
}
