//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_total` (counter): accepted client connections
//! - `proxy_active_connections` (gauge): connections currently being served
//! - `proxy_requests_total` (counter): finished cycles by `kind` and `outcome`
//! - `proxy_rejected_requests_total` (counter): cycles that ended before a
//!   request line was understood, by `reason`
//! - `proxy_tunnel_bytes_total` (counter): tunneled bytes by `direction`
//!
//! Recording is always on and cheap; the exporter is only installed when an
//! address is configured.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::proxy::error::ProxyError;
use crate::proxy::events::RequestKind;
use crate::proxy::relay::{Direction, RelayStats, Termination};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn connection_opened() {
    counter!("proxy_connections_total").increment(1);
    gauge!("proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("proxy_active_connections").decrement(1.0);
}

pub fn record_request(kind: RequestKind, outcome: &'static str) {
    counter!("proxy_requests_total", "kind" => kind.as_str(), "outcome" => outcome).increment(1);
}

pub fn record_dropped() {
    counter!("proxy_rejected_requests_total", "reason" => "empty_method").increment(1);
}

pub fn record_tunnel(stats: &RelayStats) {
    counter!("proxy_tunnel_bytes_total", "direction" => Direction::ClientToUpstream.as_str())
        .increment(stats.client_to_upstream);
    counter!("proxy_tunnel_bytes_total", "direction" => Direction::UpstreamToClient.as_str())
        .increment(stats.upstream_to_client);

    let outcome = match stats.termination {
        Termination::Closed => "closed",
        Termination::TimedOut => "timed_out",
        Termination::Failed => "failed",
    };
    record_request(RequestKind::Tunnel, outcome);
}

pub fn record_failure(kind: Option<RequestKind>, error: &ProxyError) {
    let outcome = match error {
        ProxyError::Parse(_) => "bad_request",
        ProxyError::HeadTimeout(_) => "client_timeout",
        ProxyError::Connect { .. } | ProxyError::ConnectTimeout(_) => "upstream_unreachable",
        ProxyError::Response(_) => "bad_upstream_response",
        ProxyError::Io(_) => "io_error",
    };
    match kind {
        Some(kind) => record_request(kind, outcome),
        None => counter!("proxy_rejected_requests_total", "reason" => outcome).increment(1),
    }
}
