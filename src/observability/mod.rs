//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! dispatcher events (proxy::events::TracingEvents)
//!     → logging.rs (structured log records)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (fmt or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Connection ID is attached to every record of a cycle
//! - Metrics are cheap (atomic increments) and recorded unconditionally

pub mod logging;
pub mod metrics;
