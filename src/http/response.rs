//! Origin response head handling.
//!
//! The status line and headers are parsed with `httparse` only to learn where
//! the head ends. They are written back to the client unchanged: same version,
//! same status and reason, same header names in the same order.

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_SIZE: usize = 8192;
const MAX_HEADERS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("origin closed the connection before sending a complete response head")]
    Incomplete,

    #[error("origin response head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed origin response: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("I/O error reading origin response: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed status line and header block of an origin response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Minor HTTP version (`HTTP/1.<minor>`).
    pub minor_version: u8,
    pub status: u16,
    pub reason: String,
    /// Header names and raw values in arrival order.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ResponseHead {
    /// Serialize the head for the client, ending with the blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.{} {} {}\r\n",
            self.minor_version, self.status, self.reason
        )
        .into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Read an origin response head.
///
/// Returns the head and whatever body bytes arrived in the same reads.
pub async fn read_response_head<R>(
    upstream: &mut R,
    max_bytes: usize,
) -> Result<(ResponseHead, Vec<u8>), ResponseError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut chunk = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ResponseError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, len)) = parse_head(&buf)? {
            let body = buf.split_off(len);
            return Ok((head, body));
        }
        if buf.len() > max_bytes {
            return Err(ResponseError::TooLarge(max_bytes));
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ResponseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let head = ResponseHead {
        minor_version: response.version.unwrap_or(1),
        status: response.code.unwrap_or_default(),
        reason: response.reason.unwrap_or_default().to_string(),
        headers: response
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    };
    Ok(Some((head, len)))
}
