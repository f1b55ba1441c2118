use std::path::PathBuf;

use thiserror::Error;

/// Errors from the endpoint pool
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Proxy pool is empty")]
    Empty,
}

/// Errors that can occur while loading the upstream list
#[derive(Debug, Error)]
pub enum LoadError {
    /// The list file could not be read
    #[error("Failed to read proxy list '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line is neither colon nor URL format
    #[error("Failed to parse proxy at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Every line was blank or a comment
    #[error("No proxies loaded from list")]
    NoEndpoints,
}

impl LoadError {
    /// Create a parse error for a 1-based line number
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }
}

/// Errors from a single handshake against one upstream
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Transport failure while opening, writing or reading
    #[error("Dial error: {0}")]
    Dial(#[from] std::io::Error),

    /// Upstream answered the CONNECT with a non-200 status
    #[error("Proxy refused connection ({status}): {body}")]
    ProxyRefused { status: u16, body: String },

    /// Upstream answered with something that is not an HTTP response
    #[error("Malformed proxy response: {0}")]
    MalformedResponse(String),

    /// SOCKS5 negotiation was rejected
    #[error("SOCKS5 negotiation failed: {0}")]
    Socks(String),
}

impl HandshakeError {
    /// True when the upstream was reached but declined the tunnel
    pub fn is_protocol(&self) -> bool {
        !matches!(self, HandshakeError::Dial(_))
    }
}

/// Terminal errors surfaced to the listener
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Failed to connect after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: usize,
        #[source]
        source: HandshakeError,
    },
}
