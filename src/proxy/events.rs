//! Event sink the dispatcher reports to.
//!
//! The dispatcher never logs directly. Production wiring uses
//! [`TracingEvents`], which turns each event into a `tracing` record and a
//! metrics update; tests plug in their own sink to observe what happened.

use std::net::SocketAddr;

use crate::http::request::{ParseError, RequestLine};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::proxy::error::ProxyError;
use crate::proxy::relay::RelayStats;

/// Which protocol path a request cycle took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Tunnel,
    Forward,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Tunnel => "connect",
            RequestKind::Forward => "forward",
        }
    }
}

/// Per-connection context attached to every event.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    /// Set once the request line has been parsed.
    pub kind: Option<RequestKind>,
}

impl CycleContext {
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            kind: None,
        }
    }
}

/// Observer for request-cycle events.
pub trait ProxyEvents: Send + Sync {
    /// A request line was parsed.
    fn request_received(&self, ctx: &CycleContext, line: &RequestLine);

    /// The request line had no method; the connection is dropped unanswered.
    fn request_dropped(&self, ctx: &CycleContext, reason: &ParseError);

    /// The origin connection is open.
    fn upstream_connected(&self, ctx: &CycleContext, kind: RequestKind, target: &str);

    /// A tunnel finished and both connections were released.
    fn tunnel_closed(&self, ctx: &CycleContext, target: &str, stats: &RelayStats);

    /// A forward response was fully streamed to the client.
    fn response_relayed(&self, ctx: &CycleContext, target: &str, status: u16, body_bytes: u64);

    /// The cycle ended with an error.
    fn cycle_failed(&self, ctx: &CycleContext, error: &ProxyError);
}

/// Production sink: structured logs plus Prometheus-style metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl ProxyEvents for TracingEvents {
    fn request_received(&self, ctx: &CycleContext, line: &RequestLine) {
        tracing::debug!(
            connection_id = %ctx.id,
            peer_addr = %ctx.peer,
            method = %line.method,
            target = %line.target,
            version = %line.version,
            "Request received"
        );
    }

    fn request_dropped(&self, ctx: &CycleContext, reason: &ParseError) {
        tracing::debug!(connection_id = %ctx.id, peer_addr = %ctx.peer, reason = %reason, "Request dropped");
        metrics::record_dropped();
    }

    fn upstream_connected(&self, ctx: &CycleContext, kind: RequestKind, target: &str) {
        tracing::info!(
            connection_id = %ctx.id,
            kind = kind.as_str(),
            target = %target,
            "Upstream connected"
        );
    }

    fn tunnel_closed(&self, ctx: &CycleContext, target: &str, stats: &RelayStats) {
        tracing::info!(
            connection_id = %ctx.id,
            target = %target,
            bytes_client_to_upstream = stats.client_to_upstream,
            bytes_upstream_to_client = stats.upstream_to_client,
            first_closed = %stats.first_closed,
            termination = ?stats.termination,
            "Tunnel closed"
        );
        metrics::record_tunnel(stats);
    }

    fn response_relayed(&self, ctx: &CycleContext, target: &str, status: u16, body_bytes: u64) {
        tracing::info!(
            connection_id = %ctx.id,
            target = %target,
            status,
            bytes_body = body_bytes,
            "Response relayed"
        );
        metrics::record_request(RequestKind::Forward, "ok");
    }

    fn cycle_failed(&self, ctx: &CycleContext, error: &ProxyError) {
        tracing::error!(
            connection_id = %ctx.id,
            peer_addr = %ctx.peer,
            kind = ctx.kind.map(|k| k.as_str()),
            error = %error,
            "Client error"
        );
        metrics::record_failure(ctx.kind, error);
    }
}
