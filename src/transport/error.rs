//! Transport-level failures: no HTTP response was received.

use thiserror::Error;

/// Errors raised when a request produced no response.
///
/// A 4xx/5xx response is not a transport error; it is returned as a normal
/// [`HttpResponse`](super::HttpResponse) and classified by the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before a response arrived.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The server closed the connection without answering.
    #[error("connection closed by server while requesting {url}")]
    ConnectionClosed {
        /// The URL being requested.
        url: String,
    },

    /// The URL could not be parsed or resolved against the base URL.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL text.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("HTTP client construction failed: {0}")]
    Build(#[source] reqwest::Error),
}

impl TransportError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a connection-closed error.
    pub fn connection_closed(url: impl Into<String>) -> Self {
        Self::ConnectionClosed { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns true when the server went away mid-request and a retry may succeed.
    ///
    /// Long-polling wait endpoints drop idle connections; the discharge engine
    /// uses this to decide whether to poll again.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::ConnectionClosed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(TransportError::timeout("http://idp/wait").is_disconnect());
        assert!(TransportError::connection_closed("http://idp/wait").is_disconnect());
        assert!(!TransportError::invalid_url("::").is_disconnect());
    }

    #[test]
    fn test_error_messages_include_url() {
        let err = TransportError::connection_closed("http://idp/wait");
        assert!(err.to_string().contains("http://idp/wait"));
    }
}
