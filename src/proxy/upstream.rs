//! Origin connection establishment.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::proxy::error::ProxyError;

/// Open a TCP connection to `host:port`, bounded by `connect_timeout`.
///
/// DNS resolution counts against the same deadline.
pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let target = || {
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        }
    };

    let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ProxyError::Connect {
                target: target(),
                source,
            })
        }
        Err(_) => return Err(ProxyError::ConnectTimeout(target())),
    };

    // Tunnels carry interactive traffic (TLS handshakes); don't batch small writes.
    stream.set_nodelay(true)?;
    Ok(stream)
}
