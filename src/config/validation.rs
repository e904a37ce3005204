//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges. All violations are
//! collected so a bad file is reported in one pass.

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// Smallest accepted `upstream.max_header_bytes`.
pub const MIN_HEADER_BYTES: usize = 1024;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("upstream.max_header_bytes must be at least 1024, got {0}")]
    HeaderLimitTooSmall(usize),

    #[error("observability.metrics_address is not a socket address: {0}")]
    MetricsAddress(String),
}

/// Validate a parsed configuration, returning every violation found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero { field: "listener.max_connections" });
    }
    if config.listener.head_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "listener.head_timeout_secs" });
    }
    if config.relay.chunk_size == 0 {
        errors.push(ValidationError::Zero { field: "relay.chunk_size" });
    }
    if config.relay.timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "relay.timeout_secs" });
    }
    if config.upstream.connect_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "upstream.connect_timeout_secs" });
    }
    if config.upstream.max_header_bytes < MIN_HEADER_BYTES {
        errors.push(ValidationError::HeaderLimitTooSmall(config.upstream.max_header_bytes));
    }
    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::MetricsAddress(addr.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
