//! Proxy server accept loop.
//!
//! # Responsibilities
//! - Accept client connections under the connection limit
//! - Give every connection its own task, ID and tracking guard
//! - Hand the stream to the dispatcher
//! - Stop accepting when shutdown fires

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::ProxyConfig;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::proxy::{CycleContext, Dispatcher, ProxyEvents, TracingEvents};

/// Pause after a failed accept (e.g. EMFILE) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Forward proxy server.
pub struct ProxyServer {
    dispatcher: Arc<Dispatcher>,
    tracker: ConnectionTracker,
    max_connections: usize,
}

impl ProxyServer {
    /// Create a server that reports through `tracing` and `metrics`.
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_events(config, Arc::new(TracingEvents))
    }

    /// Create a server with a custom event sink.
    pub fn with_events(config: ProxyConfig, events: Arc<dyn ProxyEvents>) -> Self {
        Self::with_dispatcher(&config, Dispatcher::new(&config, events))
    }

    /// Create a server around a prepared dispatcher.
    pub fn with_dispatcher(config: &ProxyConfig, dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            tracker: ConnectionTracker::new(),
            max_connections: config.listener.max_connections,
        }
    }

    /// Tracker for connections served by this server.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let listener = Listener::from_tcp(listener, self.max_connections)?;
        tracing::info!(
            address = ?listener.local_addr().ok(),
            max_connections = listener.max_connections(),
            "Proxy server starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(active_connections = self.tracker.active_count(), "Proxy server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let guard = self.tracker.track();
                        let ctx = CycleContext::new(guard.id(), peer);
                        let dispatcher = Arc::clone(&self.dispatcher);

                        tokio::spawn(async move {
                            let _permit = permit;
                            let _guard = guard;
                            dispatcher.handle(ctx, stream).await;
                        });
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        Ok(())
    }
}
