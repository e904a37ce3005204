//! Bidirectional tunnel relay.
//!
//! # Data Flow
//! ```text
//! client ──read──▶ [chunk] ──write──▶ upstream     (client_to_upstream task)
//! client ◀─write── [chunk] ◀──read─── upstream     (upstream_to_client task)
//! ```
//!
//! Each direction is its own task, so a silent side never stalls the other.
//! A direction ends on EOF or on an I/O error. On EOF it shuts down the write
//! half of its destination, so the peer observes the close.
//!
//! After the first direction ends, the second gets `timeout` to finish on its
//! own before it is aborted. An error in either direction aborts the other
//! immediately. Both tasks are awaited before `run` returns, so neither stream
//! outlives the relay.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};

use crate::config::RelayConfig;

/// One of the two copy loops of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the second direction of a tunnel came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Both sides reached EOF on their own.
    Closed,
    /// The second direction outlived the grace period and was aborted.
    TimedOut,
    /// A read or write failed; the other direction was aborted.
    Failed,
}

/// Outcome of a finished tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// Direction that ended first.
    pub first_closed: Direction,
    pub termination: Termination,
}

/// Relay engine shared by all tunnels.
#[derive(Debug, Clone)]
pub struct Relay {
    chunk_size: usize,
    timeout: Duration,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Override the grace period (used by tests that need a short one).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Time the remaining direction gets once the other has closed.
    pub fn grace(&self) -> Duration {
        self.timeout
    }

    /// Copy bytes both ways between `client` and `upstream` until the tunnel ends.
    pub async fn run<C, U>(&self, client: C, upstream: U) -> RelayStats
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        U: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let outbound_bytes = Arc::new(AtomicU64::new(0));
        let inbound_bytes = Arc::new(AtomicU64::new(0));

        let mut outbound = tokio::spawn(copy_direction(
            client_read,
            upstream_write,
            self.chunk_size,
            Arc::clone(&outbound_bytes),
        ));
        let mut inbound = tokio::spawn(copy_direction(
            upstream_read,
            client_write,
            self.chunk_size,
            Arc::clone(&inbound_bytes),
        ));

        let (first_closed, first) = tokio::select! {
            res = &mut outbound => (Direction::ClientToUpstream, flatten(res)),
            res = &mut inbound => (Direction::UpstreamToClient, flatten(res)),
        };
        let remaining = match first_closed {
            Direction::ClientToUpstream => &mut inbound,
            Direction::UpstreamToClient => &mut outbound,
        };

        let termination = if first.is_err() {
            abort_and_wait(remaining).await;
            Termination::Failed
        } else {
            let waited = tokio::time::timeout(self.timeout, &mut *remaining).await;
            match waited {
                Ok(res) => match flatten(res) {
                    Ok(()) => Termination::Closed,
                    Err(_) => Termination::Failed,
                },
                Err(_) => {
                    abort_and_wait(remaining).await;
                    Termination::TimedOut
                }
            }
        };

        RelayStats {
            client_to_upstream: outbound_bytes.load(Ordering::Relaxed),
            upstream_to_client: inbound_bytes.load(Ordering::Relaxed),
            first_closed,
            termination,
        }
    }
}

/// One direction: read a chunk, write it through, repeat until EOF.
async fn copy_direction<R, W>(
    mut src: R,
    mut dst: W,
    chunk_size: usize,
    copied: Arc<AtomicU64>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
    // The peer may already be gone; the direction is over either way.
    let _ = dst.shutdown().await;
    Ok(())
}

fn flatten(res: Result<std::io::Result<()>, JoinError>) -> std::io::Result<()> {
    match res {
        Ok(inner) => inner,
        Err(join) => Err(std::io::Error::other(join.to_string())),
    }
}

async fn abort_and_wait(handle: &mut JoinHandle<std::io::Result<()>>) {
    handle.abort();
    let _ = handle.await;
}
