use std::io;

use thiserror::Error;

/// Unified error type for the crawler
#[derive(Error, Debug)]
pub enum CrawlError {
    // Transport errors
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Proxy handshake failed: {0}")]
    ProxyHandshake(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Unexpected HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Operation timed out")]
    Timeout,

    #[error("Blocked by remote site: {0}")]
    Blocked(String),

    // Proxy address errors
    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Content errors
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported target: {0}")]
    UnsupportedTarget(String),

    #[error("Unexpected content: {0}")]
    UnexpectedContent(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Task(#[from] anyhow::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for crawler operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Failure kinds attributable to the network path or the proxy rather than to the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    ConnectionRefused,
    ProxyHandshake,
    ConnectionReset,
    ClientError,
    Timeout,
    Blocked,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::ConnectionRefused,
        TransportKind::ProxyHandshake,
        TransportKind::ConnectionReset,
        TransportKind::ClientError,
        TransportKind::Timeout,
        TransportKind::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::ConnectionRefused => "connection_refused",
            TransportKind::ProxyHandshake => "proxy_handshake",
            TransportKind::ConnectionReset => "connection_reset",
            TransportKind::ClientError => "client_error",
            TransportKind::Timeout => "timeout",
            TransportKind::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl CrawlError {
    /// Get the transport kind of this error, if it has one
    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self {
            CrawlError::ConnectionRefused(_) => Some(TransportKind::ConnectionRefused),

            CrawlError::ProxyConnectionFailed(_)
            | CrawlError::ProxyHandshake(_)
            | CrawlError::TlsHandshake(_) => Some(TransportKind::ProxyHandshake),

            CrawlError::ConnectionReset(_) | CrawlError::Http(_) => {
                Some(TransportKind::ConnectionReset)
            }

            CrawlError::HttpStatus { .. } => Some(TransportKind::ClientError),

            CrawlError::Timeout => Some(TransportKind::Timeout),

            CrawlError::Blocked(_) => Some(TransportKind::Blocked),

            CrawlError::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => Some(TransportKind::ConnectionRefused),
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => Some(TransportKind::ConnectionReset),
                io::ErrorKind::TimedOut => Some(TransportKind::Timeout),
                _ => None,
            },

            // Task bodies may wrap transport errors in anyhow context.
            CrawlError::Task(e) => e
                .chain()
                .find_map(|cause| cause.downcast_ref::<CrawlError>())
                .and_then(CrawlError::transport_kind),

            CrawlError::InvalidProxyAddress(_)
            | CrawlError::UnsupportedProtocol(_)
            | CrawlError::InvalidUrl(_)
            | CrawlError::UnsupportedTarget(_)
            | CrawlError::UnexpectedContent(_)
            | CrawlError::TaskPanicked(_)
            | CrawlError::InvalidConfig(_)
            | CrawlError::Json(_)
            | CrawlError::Internal(_) => None,
        }
    }

    /// Check if this error is attributable to the network path or proxy
    pub fn is_transport(&self) -> bool {
        self.transport_kind().is_some()
    }
}

impl From<hyper::Error> for CrawlError {
    fn from(err: hyper::Error) -> Self {
        CrawlError::Http(err.to_string())
    }
}

impl From<url::ParseError> for CrawlError {
    fn from(err: url::ParseError) -> Self {
        CrawlError::InvalidUrl(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CrawlError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CrawlError::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_mapping() {
        assert_eq!(
            CrawlError::ConnectionRefused("127.0.0.1:1".to_string()).transport_kind(),
            Some(TransportKind::ConnectionRefused)
        );
        assert_eq!(
            CrawlError::ProxyHandshake("bad reply".to_string()).transport_kind(),
            Some(TransportKind::ProxyHandshake)
        );
        assert_eq!(
            CrawlError::HttpStatus {
                status: 403,
                url: "http://example.com".to_string()
            }
            .transport_kind(),
            Some(TransportKind::ClientError)
        );
        assert_eq!(
            CrawlError::TlsHandshake("listing.example: bad certificate".to_string())
                .transport_kind(),
            Some(TransportKind::ProxyHandshake)
        );
        assert_eq!(
            CrawlError::Timeout.transport_kind(),
            Some(TransportKind::Timeout)
        );
        assert_eq!(
            CrawlError::Blocked("captcha".to_string()).transport_kind(),
            Some(TransportKind::Blocked)
        );
        assert_eq!(
            CrawlError::UnexpectedContent("no title".to_string()).transport_kind(),
            None
        );
    }

    #[test]
    fn test_io_error_kinds() {
        let refused = CrawlError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(
            refused.transport_kind(),
            Some(TransportKind::ConnectionRefused)
        );

        let reset = CrawlError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.transport_kind(), Some(TransportKind::ConnectionReset));

        let missing = CrawlError::from(io::Error::from(io::ErrorKind::NotFound));
        assert!(!missing.is_transport());
    }

    #[test]
    fn test_anyhow_wrapped_transport_error() {
        let wrapped = CrawlError::from(
            anyhow::Error::new(CrawlError::Timeout).context("fetching listing page"),
        );
        assert!(wrapped.is_transport());

        let logic = CrawlError::from(anyhow::anyhow!("missing business name"));
        assert!(!logic.is_transport());
    }
}
