//! Per-connection request dispatch.
//!
//! # Responsibilities
//! - Read and classify the client's request line, within the head deadline
//! - CONNECT: open the origin, answer `200 Connection Established`, relay
//! - Anything else: rewrite to origin-form, send upstream, stream the
//!   response back with its status line and headers untouched
//!
//! # Design Decisions
//! - A request line without a method is dropped without a response
//! - CONNECT acts on the request line alone; header lines that arrived with
//!   it are skipped, later ones are never waited for
//! - On the forward path the client's unread bytes are drained while the
//!   response streams, so the final close never turns into a reset
//! - Every other failure surfaces as a `ProxyError`; `handle` reports it and
//!   the client stream is closed when it goes out of scope
//! - At most one origin connection per cycle, never reused, never retried

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::{HeaderPolicy, ProxyConfig, UpstreamConfig};
use crate::http::request::{
    buffered_header_len, read_headers, read_request_line, ConnectTarget, ForwardTarget, HeadBudget,
    HeadError, ParseError, RequestHead, RequestLine,
};
use crate::http::response::read_response_head;
use crate::proxy::error::ProxyError;
use crate::proxy::events::{CycleContext, ProxyEvents, RequestKind};
use crate::proxy::relay::{Relay, RelayStats};
use crate::proxy::upstream;

/// Sent once the tunnel's origin connection is open.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Sent on connect failure when `upstream.error_responses` is enabled.
pub const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// How a request cycle ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request line had no method; nothing was written back.
    Dropped,
    /// A tunnel ran to completion.
    Tunneled(RelayStats),
    /// A forward response was streamed to the client.
    Forwarded { status: u16, body_bytes: u64 },
}

/// Drives one request cycle per accepted connection.
pub struct Dispatcher {
    relay: Relay,
    upstream: UpstreamConfig,
    connect_timeout: Duration,
    head_timeout: Duration,
    events: Arc<dyn ProxyEvents>,
}

impl Dispatcher {
    pub fn new(config: &ProxyConfig, events: Arc<dyn ProxyEvents>) -> Self {
        Self {
            relay: Relay::new(&config.relay),
            upstream: config.upstream.clone(),
            connect_timeout: Duration::from_secs(config.upstream.connect_timeout_secs),
            head_timeout: Duration::from_secs(config.listener.head_timeout_secs),
            events,
        }
    }

    /// Replace the relay engine (tests use a short grace period).
    pub fn with_relay(mut self, relay: Relay) -> Self {
        self.relay = relay;
        self
    }

    /// Serve one client connection. Failures are reported to the event sink.
    pub async fn handle<S>(&self, mut ctx: CycleContext, client: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(e) = self.dispatch(&mut ctx, client).await {
            self.events.cycle_failed(&ctx, &e);
        }
    }

    /// Run the request cycle and return how it ended.
    ///
    /// `ctx.kind` is filled in as soon as the request line is understood.
    pub async fn dispatch<S>(&self, ctx: &mut CycleContext, client: S) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut client = BufReader::new(client);
        let deadline = Instant::now() + self.head_timeout;
        let mut budget = HeadBudget::new(self.upstream.max_header_bytes);

        let line = match timeout_at(deadline, read_request_line(&mut client, &mut budget)).await {
            Err(_) => return Err(ProxyError::HeadTimeout(self.head_timeout)),
            Ok(Err(HeadError::Parse(ParseError::EmptyMethod))) => {
                self.events.request_dropped(ctx, &ParseError::EmptyMethod);
                return Ok(Outcome::Dropped);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(line)) => line,
        };
        self.events.request_received(ctx, &line);

        if line.is_connect() {
            ctx.kind = Some(RequestKind::Tunnel);
            let skipped = buffered_header_len(client.buffer());
            client.consume(skipped);
            self.tunnel(ctx, client, &line).await
        } else {
            ctx.kind = Some(RequestKind::Forward);
            let headers = timeout_at(deadline, read_headers(&mut client, &mut budget))
                .await
                .map_err(|_| ProxyError::HeadTimeout(self.head_timeout))??;
            self.forward(ctx, client, &RequestHead { line, headers })
                .await
        }
    }

    async fn tunnel<S>(
        &self,
        ctx: &CycleContext,
        mut client: BufReader<S>,
        line: &RequestLine,
    ) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let target = ConnectTarget::parse(&line.target)?;
        let label = target.to_string();
        let mut upstream = self
            .open_upstream(ctx, &mut client, RequestKind::Tunnel, &target.host, target.port, &label)
            .await?;

        client.get_mut().write_all(CONNECTION_ESTABLISHED).await?;
        client.get_mut().flush().await?;

        // Bytes pipelined behind the request head already belong to the tunnel.
        let pending = client.buffer().to_vec();
        if !pending.is_empty() {
            upstream.write_all(&pending).await?;
        }

        let stats = self.relay.run(client.into_inner(), upstream).await;
        self.events.tunnel_closed(ctx, &label, &stats);
        Ok(Outcome::Tunneled(stats))
    }

    async fn forward<S>(
        &self,
        ctx: &CycleContext,
        mut client: BufReader<S>,
        head: &RequestHead,
    ) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let target = ForwardTarget::parse(&head.line.target, head.header("host"))?;
        let policy = self.upstream.header_policy;
        let body_len = match policy {
            HeaderPolicy::Forward => head.content_length()?,
            HeaderPolicy::Minimal => None,
        };
        let label = target.to_string();
        let mut upstream = self
            .open_upstream(ctx, &mut client, RequestKind::Forward, &target.host, target.port, &label)
            .await?;

        upstream
            .write_all(target.encode_request(head, policy).as_bytes())
            .await?;
        if let Some(len) = body_len {
            let copied = tokio::io::copy(&mut (&mut client).take(len), &mut upstream).await?;
            if copied < len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before sending the full request body",
                )
                .into());
            }
        }
        upstream.flush().await?;

        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let mut drain = tokio::spawn(async move {
            tokio::io::copy(&mut client_rx, &mut tokio::io::sink()).await
        });

        let relayed = self.relay_response(&mut upstream, &mut client_tx).await;
        if relayed.is_ok() {
            // The client gets the relay grace period to close its side.
            let _ = timeout(self.relay.grace(), &mut drain).await;
        }
        drain.abort();
        let _ = drain.await;

        let (status, body_bytes) = relayed?;
        self.events.response_relayed(ctx, &label, status, body_bytes);
        Ok(Outcome::Forwarded { status, body_bytes })
    }

    /// Stream the origin response to the client and close the write side.
    /// Returns the status code and body byte count.
    async fn relay_response<W>(
        &self,
        upstream: &mut TcpStream,
        client: &mut W,
    ) -> Result<(u16, u64), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let (response, early_body) =
            read_response_head(upstream, self.upstream.max_header_bytes).await?;

        client.write_all(&response.to_bytes()).await?;
        client.write_all(&early_body).await?;
        let streamed = tokio::io::copy(upstream, client).await?;
        client.flush().await?;
        let _ = client.shutdown().await;

        Ok((response.status, early_body.len() as u64 + streamed))
    }

    async fn open_upstream<S>(
        &self,
        ctx: &CycleContext,
        client: &mut BufReader<S>,
        kind: RequestKind,
        host: &str,
        port: u16,
        label: &str,
    ) -> Result<TcpStream, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match upstream::connect(host, port, self.connect_timeout).await {
            Ok(stream) => {
                self.events.upstream_connected(ctx, kind, label);
                Ok(stream)
            }
            Err(e) => {
                if self.upstream.error_responses {
                    // The client may already be gone; the cycle fails either way.
                    let _ = client.get_mut().write_all(BAD_GATEWAY).await;
                    let _ = client.get_mut().flush().await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    use crate::http::request::RequestLine;
    use crate::net::connection::ConnectionId;
    use crate::proxy::relay::Termination;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl ProxyEvents for Recorder {
        fn request_received(&self, _: &CycleContext, line: &RequestLine) {
            self.push(format!("request {}", line.method));
        }
        fn request_dropped(&self, _: &CycleContext, reason: &ParseError) {
            self.push(format!("dropped {}", reason));
        }
        fn upstream_connected(&self, _: &CycleContext, kind: RequestKind, target: &str) {
            self.push(format!("connected {} {}", kind.as_str(), target));
        }
        fn tunnel_closed(&self, _: &CycleContext, target: &str, _: &RelayStats) {
            self.push(format!("tunnel_closed {}", target));
        }
        fn response_relayed(&self, _: &CycleContext, _: &str, status: u16, _: u64) {
            self.push(format!("relayed {}", status));
        }
        fn cycle_failed(&self, ctx: &CycleContext, _: &ProxyError) {
            self.push(format!("failed {}", ctx.kind.map_or("-", |k| k.as_str())));
        }
    }

    fn ctx() -> CycleContext {
        CycleContext::new(ConnectionId::new(), "127.0.0.1:40000".parse().unwrap())
    }

    fn dispatcher(config: ProxyConfig) -> (Dispatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(&config, recorder.clone())
            .with_relay(Relay::new(&config.relay).with_timeout(Duration::from_millis(300)));
        (dispatcher, recorder)
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn empty_request_line_is_dropped_silently() {
        let (dispatcher, recorder) = dispatcher(ProxyConfig::default());
        let (client, mut peer) = duplex(1024);

        peer.write_all(b"\r\n").await.unwrap();
        let outcome = dispatcher.dispatch(&mut ctx(), client).await.unwrap();
        assert_eq!(outcome, Outcome::Dropped);

        let mut written = Vec::new();
        peer.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
        assert_eq!(recorder.take(), vec!["dropped request line has no method"]);
    }

    #[tokio::test]
    async fn connect_failure_closes_without_response() {
        let (dispatcher, recorder) = dispatcher(ProxyConfig::default());
        let (client, mut peer) = duplex(1024);
        let port = closed_port().await;

        peer.write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port).as_bytes())
            .await
            .unwrap();
        dispatcher.handle(ctx(), client).await;

        let mut written = Vec::new();
        peer.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
        assert_eq!(recorder.take(), vec!["request CONNECT", "failed connect"]);
    }

    #[tokio::test]
    async fn connect_failure_answers_502_when_enabled() {
        let mut config = ProxyConfig::default();
        config.upstream.error_responses = true;
        let (dispatcher, _) = dispatcher(config);
        let (client, mut peer) = duplex(1024);
        let port = closed_port().await;

        peer.write_all(format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port).as_bytes())
            .await
            .unwrap();
        let err = dispatcher.dispatch(&mut ctx(), client).await.unwrap_err();
        assert!(err.is_upstream_unreachable());

        let mut written = Vec::new();
        peer.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, BAD_GATEWAY);
    }

    #[tokio::test]
    async fn bare_connect_line_opens_tunnel() {
        let (dispatcher, recorder) = dispatcher(ProxyConfig::default());
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let (client, mut peer) = duplex(4096);

        // No header block and no blank line.
        peer.write_all(format!("CONNECT {} HTTP/1.1\r\n", origin_addr).as_bytes())
            .await
            .unwrap();
        let cycle = tokio::spawn(async move {
            let mut ctx = ctx();
            let outcome = dispatcher.dispatch(&mut ctx, client).await;
            (ctx, outcome)
        });

        let (upstream, _) = origin.accept().await.unwrap();
        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut established))
            .await
            .expect("no handshake for a bare request line")
            .unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);

        drop(peer);
        drop(upstream);
        let (ctx, outcome) = cycle.await.unwrap();
        assert!(matches!(outcome.unwrap(), Outcome::Tunneled(_)));
        assert_eq!(ctx.kind, Some(RequestKind::Tunnel));
        assert_eq!(recorder.take()[0], "request CONNECT");
    }

    #[tokio::test]
    async fn incomplete_forward_head_times_out() {
        let mut config = ProxyConfig::default();
        config.listener.head_timeout_secs = 1;
        let (dispatcher, _) = dispatcher(config);
        let (client, mut peer) = duplex(1024);

        peer.write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\n")
            .await
            .unwrap();
        let mut ctx = ctx();
        let err = tokio::time::timeout(Duration::from_secs(5), dispatcher.dispatch(&mut ctx, client))
            .await
            .expect("head read was not bounded")
            .unwrap_err();
        assert!(matches!(err, ProxyError::HeadTimeout(_)), "got {:?}", err);
        assert_eq!(ctx.kind, Some(RequestKind::Forward));
    }

    #[tokio::test]
    async fn silent_client_times_out_before_request_line() {
        let mut config = ProxyConfig::default();
        config.listener.head_timeout_secs = 1;
        let (dispatcher, recorder) = dispatcher(config);
        let (client, _peer) = duplex(1024);

        dispatcher.handle(ctx(), client).await;
        assert_eq!(recorder.take(), vec!["failed -"]);
    }

    #[tokio::test]
    async fn tunnel_forwards_pipelined_bytes() {
        let (dispatcher, recorder) = dispatcher(ProxyConfig::default());
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let (client, mut peer) = duplex(4096);

        let request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\nhello",
            origin_addr, origin_addr
        );
        peer.write_all(request.as_bytes()).await.unwrap();

        let cycle = tokio::spawn(async move {
            let outcome = dispatcher.dispatch(&mut ctx(), client).await;
            (dispatcher, outcome)
        });

        let (mut upstream, _) = origin.accept().await.unwrap();
        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        peer.read_exact(&mut established).await.unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);

        let mut greeting = [0u8; 5];
        upstream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");

        upstream.write_all(b"world").await.unwrap();
        let mut reply = [0u8; 5];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");

        drop(peer);
        drop(upstream);
        let (_dispatcher, outcome) = cycle.await.unwrap();
        match outcome.unwrap() {
            Outcome::Tunneled(stats) => {
                assert_eq!(stats.client_to_upstream, 0);
                assert_eq!(stats.upstream_to_client, 5);
                assert_ne!(stats.termination, Termination::TimedOut);
            }
            other => panic!("expected tunnel, got {:?}", other),
        }
        let events = recorder.take();
        assert_eq!(events[0], "request CONNECT");
        assert_eq!(events[1], format!("connected connect {}", origin_addr));
        assert_eq!(events[2], format!("tunnel_closed {}", origin_addr));
    }

    #[tokio::test]
    async fn forward_policy_sends_headers_and_body() {
        let mut config = ProxyConfig::default();
        config.upstream.header_policy = HeaderPolicy::Forward;
        let (dispatcher, _) = dispatcher(config);

        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"data") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "origin saw EOF before the body");
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let (client, mut peer) = duplex(4096);
        let request = format!(
            "POST http://{}/submit HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\nContent-Length: 4\r\n\r\ndata",
            origin_addr, origin_addr
        );
        peer.write_all(request.as_bytes()).await.unwrap();

        let outcome = dispatcher.dispatch(&mut ctx(), client).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Forwarded {
                status: 201,
                body_bytes: 2
            }
        );

        let seen = origin_task.await.unwrap();
        assert_eq!(
            seen,
            format!(
                "POST /submit HTTP/1.1\r\nHost: {}\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndata",
                origin_addr
            )
        );

        let mut response = Vec::new();
        peer.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok");
    }
}
