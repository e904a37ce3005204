//! Forward HTTP/HTTPS proxy library.
//!
//! Plain HTTP requests are rewritten to origin-form and relayed; `CONNECT`
//! requests become opaque byte tunnels.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::ProxyConfig;
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
pub use proxy::Dispatcher;
