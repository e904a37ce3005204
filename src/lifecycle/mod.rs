//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Parse CLI → Load config → Init logging/metrics → Bind :8080 → Serve
//!
//! Shutdown (shutdown.rs):
//!     Ctrl+C → Stop accepting → Drain in-flight cycles (bounded) → Exit
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
