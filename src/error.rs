//! Errors surfaced to callers of the request methods.

use thiserror::Error;

use crate::transport::{HttpResponse, TransportError};

/// Why a dispatched request did not succeed.
///
/// This is the failure half of every request; `Ok(HttpResponse)` is the
/// success half.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The server answered with status 400 or above. The raw response is kept.
    #[error("request to {url} failed with status {}", response.status)]
    Status {
        /// Request URL.
        url: String,
        /// The response as received.
        response: HttpResponse,
    },

    /// No response arrived.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A 401 challenge could not be discharged; the request was not replayed.
    #[error(transparent)]
    Discharge(#[from] DischargeError),

    /// The operation needs a setting this bakery was built without.
    #[error("{0} was not defined")]
    NotConfigured(&'static str),
}

impl RequestError {
    /// The raw response for [`RequestError::Status`].
    #[must_use]
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::Status { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Why a [`Bakery`](crate::Bakery) could not be built.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid settings.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The default transport could not be created.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Initial credentials could not be stored.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// A failed discharge sequence, reported as a single message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DischargeError(String);

impl DischargeError {
    /// Creates an error from any message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The message text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<TransportError> for DischargeError {
    fn from(error: TransportError) -> Self {
        Self(error.to_string())
    }
}

impl From<crate::macaroon::MacaroonError> for DischargeError {
    fn from(error: crate::macaroon::MacaroonError) -> Self {
        Self(error.to_string())
    }
}

impl From<crate::store::StoreError> for DischargeError {
    fn from(error: crate::store::StoreError) -> Self {
        Self(format!("cannot store credentials: {error}"))
    }
}
