//! Proxy core.
//!
//! # Data Flow
//! ```text
//! accepted client stream
//!     → dispatcher.rs (read head, classify)
//!         CONNECT → upstream.rs (connect) → "200 Connection Established"
//!                 → relay.rs (two copy tasks, joined)
//!         other   → upstream.rs (connect) → origin-form request
//!                 → response head + body streamed back
//!     → events.rs (every step reported to the injected sink)
//! ```

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod relay;
pub mod upstream;

pub use dispatcher::{Dispatcher, Outcome, CONNECTION_ESTABLISHED};
pub use error::ProxyError;
pub use events::{CycleContext, ProxyEvents, RequestKind, TracingEvents};
pub use relay::{Direction, Relay, RelayStats, Termination};
