//! HTTP/1 protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, one task per connection)
//!     → request.rs (request line + head, targets)
//!     → [proxy::Dispatcher picks tunnel or forward]
//!     → response.rs (origin status line + headers, verbatim)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ConnectTarget, ForwardTarget, ParseError, RequestHead, RequestLine};
pub use response::{ResponseError, ResponseHead};
pub use server::ProxyServer;
