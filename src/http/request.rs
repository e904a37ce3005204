//! Client request head parsing.
//!
//! # Responsibilities
//! - Split the first line into method, target and version
//! - Resolve CONNECT authorities and forward URLs into host/port pairs
//! - Collect the remaining header lines so they can be dropped or forwarded
//! - Serialize the request sent to the origin on the forward path
//!
//! # Design Decisions
//! - An empty method is its own error kind so the dispatcher can drop the
//!   connection without answering
//! - Every line read is bounded by the configured head size limit, shared
//!   across the whole head
//! - A CONNECT does not wait for its header lines; the dispatcher skips the
//!   ones that already arrived with the request line

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use url::{Host, Url};

use crate::config::HeaderPolicy;

/// Method that switches a connection into tunnel mode.
pub const CONNECT_METHOD: &str = "CONNECT";

/// Port used when a CONNECT authority carries none.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Port used when a forward target carries none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Version assumed when the request line omits one.
const DEFAULT_VERSION: &str = "HTTP/1.1";

/// Request headers that only describe the client-to-proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Errors produced while interpreting a client request head.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("request line has no method")]
    EmptyMethod,

    #[error("request line has no target")]
    MissingTarget,

    #[error("no host in target {0:?}")]
    MissingHost(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),

    #[error("invalid URL {target:?}: {reason}")]
    InvalidUrl { target: String, reason: String },

    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
}

/// The first line of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// Parse `METHOD target VERSION`. A missing version defaults to HTTP/1.1.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.split_whitespace();
        let method = parts.next().ok_or(ParseError::EmptyMethod)?;
        let target = parts.next().ok_or(ParseError::MissingTarget)?;
        let version = parts.next().unwrap_or(DEFAULT_VERSION);

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    /// True when this line asks for a tunnel.
    pub fn is_connect(&self) -> bool {
        self.method == CONNECT_METHOD
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, self.version)
    }
}

/// A single `name: value` header line, kept in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Request line plus the header block that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: Vec<Header>,
}

impl RequestHead {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Declared request body length, if any.
    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        match self.header("content-length") {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ParseError::InvalidContentLength(raw.to_string())),
        }
    }
}

/// Byte budget shared by every line of one request head.
#[derive(Debug, Clone, Copy)]
pub struct HeadBudget {
    max_bytes: usize,
    remaining: usize,
}

impl HeadBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            remaining: max_bytes,
        }
    }
}

/// Read and parse the request line.
///
/// A line without a method fails with [`ParseError::EmptyMethod`]. EOF before
/// the first byte is treated the same way.
pub async fn read_request_line<R>(reader: &mut R, budget: &mut HeadBudget) -> Result<RequestLine, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_line_limited(reader, budget).await?;
    Ok(RequestLine::parse(&first)?)
}

/// Read header lines up to and including the blank line that ends the head.
pub async fn read_headers<R>(reader: &mut R, budget: &mut HeadBudget) -> Result<Vec<Header>, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let raw = read_line_limited(reader, budget).await?;
        let trimmed = raw.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        // Lines without a colon carry nothing we can forward.
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }

    Ok(headers)
}

/// Length of the header lines at the start of `buf`, through the blank line
/// that ends them.
///
/// Only complete lines are counted. When the blank line has not arrived yet,
/// the count stops after the last complete line.
pub fn buffered_header_len(buf: &[u8]) -> usize {
    let mut consumed = 0;
    while let Some(end) = buf[consumed..].iter().position(|&b| b == b'\n') {
        let line = &buf[consumed..consumed + end];
        consumed += end + 1;
        if line.is_empty() || line == b"\r" {
            break;
        }
    }
    consumed
}

/// Failure while reading a request head off the wire.
#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("I/O error reading request head: {0}")]
    Io(#[from] std::io::Error),
}

async fn read_line_limited<R>(reader: &mut R, budget: &mut HeadBudget) -> Result<String, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let limit = budget.remaining as u64;
    let n = (&mut *reader).take(limit).read_line(&mut line).await?;
    if n as u64 == limit && !line.ends_with('\n') {
        return Err(ParseError::TooLarge(budget.max_bytes).into());
    }
    budget.remaining -= n;
    Ok(line)
}

/// Destination of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parse `host[:port]`, defaulting to port 443. Bracketed IPv6 literals are accepted.
    pub fn parse(authority: &str) -> Result<Self, ParseError> {
        parse_authority(authority, DEFAULT_TUNNEL_PORT)
            .map(|(host, port)| Self { host, port })
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_authority(f, &self.host, self.port)
    }
}

/// Destination and rewritten request path of a forward request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    /// Origin-form path sent upstream, never empty.
    pub path_and_query: String,
}

impl ForwardTarget {
    /// Resolve a forward target.
    ///
    /// Absolute `http://` URLs carry their own host. Origin-form targets
    /// (`/path`) fall back to the client's `Host` header.
    pub fn parse(target: &str, host_header: Option<&str>) -> Result<Self, ParseError> {
        if target.starts_with('/') {
            let authority = host_header.ok_or_else(|| ParseError::MissingHost(target.to_string()))?;
            let (host, port) = parse_authority(authority.trim(), DEFAULT_HTTP_PORT)?;
            return Ok(Self {
                host,
                port,
                path_and_query: target.to_string(),
            });
        }

        let url = Url::parse(target).map_err(|e| ParseError::InvalidUrl {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" {
            return Err(ParseError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(ParseError::MissingHost(target.to_string())),
        };
        let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);

        let mut path_and_query = url.path().to_string();
        if path_and_query.is_empty() {
            path_and_query.push('/');
        }
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        Ok(Self {
            host,
            port,
            path_and_query,
        })
    }

    /// Value for the `Host` header; the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        let host = bracket_if_v6(&self.host);
        if self.port == DEFAULT_HTTP_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Serialize the head of the request sent to the origin.
    ///
    /// `Connection: close` is always sent: the body is read until the origin
    /// closes, so the origin must not keep the connection open.
    pub fn encode_request(&self, head: &RequestHead, policy: HeaderPolicy) -> String {
        let line = &head.line;
        let mut out = format!("{} {} {}\r\n", line.method, self.path_and_query, line.version);

        match policy {
            HeaderPolicy::Minimal => {
                push_header(&mut out, "Host", &self.host_header());
            }
            HeaderPolicy::Forward => {
                if head.header("host").is_none() {
                    push_header(&mut out, "Host", &self.host_header());
                }
                for header in &head.headers {
                    let lower = header.name.to_ascii_lowercase();
                    if HOP_BY_HOP.contains(&lower.as_str()) {
                        continue;
                    }
                    push_header(&mut out, &header.name, &header.value);
                }
            }
        }

        push_header(&mut out, "Connection", "close");
        out.push_str("\r\n");
        out
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_authority(f, &self.host, self.port)?;
        f.write_str(&self.path_and_query)
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), ParseError> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::MissingHost(authority.to_string()))?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(ParseError::InvalidPort(authority.to_string())),
            },
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ParseError::MissingHost(authority.to_string()));
    }
    let port = match port {
        None => default_port,
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidPort(authority.to_string()))?,
    };

    Ok((host.to_string(), port))
}

fn bracket_if_v6(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn fmt_authority(f: &mut fmt::Formatter<'_>, host: &str, port: u16) -> fmt::Result {
    write!(f, "{}:{}", bracket_if_v6(host), port)
}
