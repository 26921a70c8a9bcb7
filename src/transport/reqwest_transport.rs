//! reqwest-backed transport sharing a cookie jar with the credential store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::cookie::Jar;
use tracing::{debug, instrument};
use url::Url;

use super::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default HTTP read timeout (90 seconds, longer than identity wait long-polls).
pub const READ_TIMEOUT_SECS: u64 = 90;

fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("bakery-client/{version}")
}

/// Production [`HttpTransport`] built on `reqwest`.
///
/// Cookies set by servers (for example by the auth cookie endpoint) land in a
/// shared [`Jar`] and are replayed on matching requests, just like a browser.
/// Relative request URLs are resolved against the optional base URL.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    jar: Arc<Jar>,
    base_url: Option<Url>,
}

impl ReqwestTransport {
    /// Creates a transport with default timeouts and a fresh cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Build`] when the HTTP client cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a transport with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Build`] when the HTTP client cannot be built.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, TransportError> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(default_user_agent())
            .cookie_provider(Arc::clone(&jar))
            .gzip(true)
            .build()
            .map_err(TransportError::Build)?;
        Ok(Self {
            client,
            jar,
            base_url: None,
        })
    }

    /// Sets the base URL used to resolve relative request paths.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] when `base_url` is not absolute.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, TransportError> {
        let parsed = Url::parse(base_url).map_err(|_| TransportError::invalid_url(base_url))?;
        self.base_url = Some(parsed);
        Ok(self)
    }

    /// Returns the shared cookie jar.
    #[must_use]
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    /// Returns the configured base URL, if any.
    #[must_use]
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Resolves a request URL against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for relative URLs without a base,
    /// or for text that does not parse.
    pub fn resolve_url(&self, url: &str) -> Result<Url, TransportError> {
        match Url::parse(url) {
            Ok(parsed) => Ok(parsed),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .as_ref()
                .and_then(|base| base.join(url).ok())
                .ok_or_else(|| TransportError::invalid_url(url)),
            Err(_) => Err(TransportError::invalid_url(url)),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    // The jar is attached client-wide, so `with_credentials` has no extra effect here.
    #[instrument(level = "debug", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self.resolve_url(&request.url)?;
        let mut builder = self
            .client
            .request(request.method, url.clone())
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| classify(url.as_str(), e))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| classify(url.as_str(), e))?;
        debug!(status, bytes = body.len(), "response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(url: &str, error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout(url)
    } else if error.is_body() {
        TransportError::connection_closed(url)
    } else {
        TransportError::network(url, error)
    }
}
