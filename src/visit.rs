//! Interaction strategies for "interaction required" discharges.
//!
//! One strategy is fixed per [`Bakery`](crate::Bakery) at construction. The
//! discharge engine calls it once with the identity provider's visit and wait
//! URLs, then polls the wait URL itself.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::transport::{HttpRequest, HttpTransport, JSON_CONTENT_TYPE, TransportError};

/// The `Info` object of an interaction-required discharge response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionInfo {
    /// Page the user (or agent) must visit to authenticate.
    #[serde(rename = "VisitURL")]
    pub visit_url: String,
    /// URL that yields the discharge once authentication completes.
    #[serde(rename = "WaitURL")]
    pub wait_url: String,
}

/// Errors raised while visiting the identity provider.
#[derive(Debug, Error)]
pub enum VisitError {
    /// The browser could not be launched.
    #[error("cannot open browser: {0}")]
    Browser(#[source] std::io::Error),

    /// A visit request produced no response.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The identity provider answered with an error status.
    #[error("{url} returned status {status}")]
    Status {
        /// Request URL.
        url: String,
        /// Response status.
        status: u16,
    },

    /// The visit page did not return JSON.
    #[error("cannot parse login methods: {0}")]
    InvalidResponse(#[source] serde_json::Error),

    /// The visit page does not offer the configured login method.
    #[error("login method {0:?} not offered by identity provider")]
    MissingLoginMethod(String),

    /// Custom strategy failure.
    #[error("{0}")]
    Other(String),
}

/// Pluggable interaction handler.
///
/// # Object Safety
///
/// Uses `async_trait` so the bakery can hold an `Arc<dyn VisitStrategy>`.
#[async_trait]
pub trait VisitStrategy: Send + Sync {
    /// Performs the interaction described by `info`.
    ///
    /// Returning `Ok` means the wait URL may now be polled.
    async fn visit(
        &self,
        transport: &dyn HttpTransport,
        info: &InteractionInfo,
    ) -> Result<(), VisitError>;
}

/// Opens the visit URL in the user's browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserVisit;

#[async_trait]
impl VisitStrategy for BrowserVisit {
    async fn visit(
        &self,
        _transport: &dyn HttpTransport,
        info: &InteractionInfo,
    ) -> Result<(), VisitError> {
        info!(url = %info.visit_url, "opening browser for login");
        open_browser(&info.visit_url)
    }
}

fn open_browser(url: &str) -> Result<(), VisitError> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open")
            .arg(url)
            .spawn()
            .map_err(VisitError::Browser)?;
    }

    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open")
            .arg(url)
            .spawn()
            .map_err(VisitError::Browser)?;
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()
            .map_err(VisitError::Browser)?;
    }

    Ok(())
}

/// Logs in without a user by posting a stored credential blob.
///
/// GETs the visit URL asking for JSON, reads the URL under `login_method`,
/// and POSTs `{"login": auth}` there.
#[derive(Clone)]
pub struct NonInteractiveVisit {
    auth: serde_json::Value,
    login_method: String,
}

impl fmt::Debug for NonInteractiveVisit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonInteractiveVisit")
            .field("auth", &"[REDACTED]")
            .field("login_method", &self.login_method)
            .finish()
    }
}

impl NonInteractiveVisit {
    /// Creates the strategy.
    #[must_use]
    pub fn new(auth: serde_json::Value, login_method: impl Into<String>) -> Self {
        Self {
            auth,
            login_method: login_method.into(),
        }
    }
}

#[async_trait]
impl VisitStrategy for NonInteractiveVisit {
    #[instrument(level = "debug", skip(self, transport, info), fields(url = %info.visit_url))]
    async fn visit(
        &self,
        transport: &dyn HttpTransport,
        info: &InteractionInfo,
    ) -> Result<(), VisitError> {
        let request =
            HttpRequest::new(Method::GET, &info.visit_url).with_header(ACCEPT, JSON_CONTENT_TYPE);
        let response = transport.send(request).await?;
        if !response.is_success() {
            return Err(VisitError::Status {
                url: info.visit_url.clone(),
                status: response.status,
            });
        }

        let methods: serde_json::Value = response.json().map_err(VisitError::InvalidResponse)?;
        let login_url = methods
            .get(&self.login_method)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| VisitError::MissingLoginMethod(self.login_method.clone()))?;
        debug!(method = %self.login_method, "posting login credentials");

        let body = serde_json::json!({ "login": self.auth }).to_string();
        let request = HttpRequest::new(Method::POST, login_url)
            .with_header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .with_body(body);
        let response = transport.send(request).await?;
        if !response.is_success() {
            return Err(VisitError::Status {
                url: login_url.to_string(),
                status: response.status,
            });
        }
        Ok(())
    }
}

type VisitFn = dyn Fn(&InteractionInfo) -> Result<(), VisitError> + Send + Sync;

/// Caller-supplied visit function.
#[derive(Clone)]
pub struct FnVisit(Arc<VisitFn>);

impl fmt::Debug for FnVisit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnVisit").finish_non_exhaustive()
    }
}

impl FnVisit {
    /// Wraps a closure.
    pub fn new<F>(visit: F) -> Self
    where
        F: Fn(&InteractionInfo) -> Result<(), VisitError> + Send + Sync + 'static,
    {
        Self(Arc::new(visit))
    }
}

#[async_trait]
impl VisitStrategy for FnVisit {
    async fn visit(
        &self,
        _transport: &dyn HttpTransport,
        info: &InteractionInfo,
    ) -> Result<(), VisitError> {
        (self.0)(info)
    }
}
