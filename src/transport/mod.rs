//! HTTP transport seam.
//!
//! The bakery never issues raw HTTP itself. It builds [`HttpRequest`] values,
//! hands them to an [`HttpTransport`], and interprets the [`HttpResponse`]
//! that comes back. [`ReqwestTransport`] is the production implementation;
//! tests and embedders can supply their own.

mod error;
mod reqwest_transport;

pub use error::TransportError;
pub use reqwest_transport::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, ReqwestTransport};

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::warn;

/// Header carrying the bakery protocol version.
pub const BAKERY_PROTOCOL_VERSION: HeaderName = HeaderName::from_static("bakery-protocol-version");

/// Header carrying a base64 JSON macaroon set (or a discharge token).
pub const MACAROONS: HeaderName = HeaderName::from_static("macaroons");

/// Content type for JSON request bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type for form-encoded discharge requests.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// An outgoing request, as handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL or a path relative to the transport's base URL.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Optional request body.
    pub body: Option<String>,
    /// Whether the transport should attach ambient cookies for this request.
    pub with_credentials: bool,
}

impl HttpRequest {
    /// Creates a request with no headers and no body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            with_credentials: false,
        }
    }

    /// Adds a header. Values that are not valid header text are dropped with a warning.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => warn!(header = %name, "dropping header with invalid value"),
        }
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Marks the request as credentialed.
    #[must_use]
    pub fn with_credentials(mut self) -> Self {
        self.with_credentials = true;
        self
    }

    /// Returns a header value as text, if present and printable.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// A received response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body decoded as text.
    pub body: String,
}

impl HttpResponse {
    /// Creates an empty response with the given status.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    /// Adds a header. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Sets the response body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns a header value as text (case-insensitive name lookup).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Returns true for statuses below 400.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] when the body is not valid JSON
    /// for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// The external HTTP collaborator.
///
/// # Object Safety
///
/// Uses `async_trait` so the bakery can hold an `Arc<dyn HttpTransport>`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and returns whatever response arrived, including 4xx/5xx.
    ///
    /// Only failures that produced no response at all are errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport double for unit tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replies with queued responses in order and records every request.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        replies: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn reply(&self, response: HttpResponse) -> &Self {
            self.replies.lock().unwrap().push_back(Ok(response));
            self
        }

        pub(crate) fn fail(&self, error: TransportError) -> &Self {
            self.replies.lock().unwrap().push_back(Err(error));
            self
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("no scripted reply left for {url}"))
        }
    }
}
