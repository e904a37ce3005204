//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from a TOML file.
//! Every section falls back to its defaults, so an empty file is a valid config.

use serde::{Deserialize, Serialize};

/// Fixed address the proxy listens on. Not part of the config file.
pub const LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Accept-side limits.
    pub listener: ListenerConfig,

    /// Tunnel relay tuning.
    pub relay: RelayConfig,

    /// Upstream (origin) connection behaviour.
    pub upstream: UpstreamConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,

    /// Seconds a client has to deliver its request head.
    pub head_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            head_timeout_secs: 10,
        }
    }
}

/// Relay engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Largest chunk held in flight per direction, in bytes.
    pub chunk_size: usize,

    /// Seconds the remaining direction may keep running once the other has closed.
    pub timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            timeout_secs: 5,
        }
    }
}

/// Which client request headers reach the origin on the forward path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPolicy {
    /// Request line plus `Host` and `Connection: close` only.
    #[default]
    Minimal,
    /// Client headers minus hop-by-hop ones, plus a `Content-Length` body.
    Forward,
}

/// Upstream connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Upper bound for an origin response head (status line + headers).
    pub max_header_bytes: usize,

    /// Request header forwarding policy.
    pub header_policy: HeaderPolicy,

    /// Answer `502 Bad Gateway` on connect failure instead of closing silently.
    pub error_responses: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            max_header_bytes: 16 * 1024,
            header_policy: HeaderPolicy::Minimal,
            error_responses: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Prometheus exporter bind address. Disabled when absent.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_address: None,
        }
    }
}
