//! Errors that end a request cycle.

use std::time::Duration;

use crate::http::request::{HeadError, ParseError};
use crate::http::response::ResponseError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),

    #[error("client sent no complete request head within {0:?}")]
    HeadTimeout(Duration),

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),

    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True when the origin could not be reached at all.
    pub fn is_upstream_unreachable(&self) -> bool {
        matches!(self, ProxyError::Connect { .. } | ProxyError::ConnectTimeout(_))
    }
}

impl From<HeadError> for ProxyError {
    fn from(err: HeadError) -> Self {
        match err {
            HeadError::Parse(e) => ProxyError::Parse(e),
            HeadError::Io(e) => ProxyError::Io(e),
        }
    }
}
