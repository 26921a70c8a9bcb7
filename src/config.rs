//! Bakery construction settings.

use thiserror::Error;

use crate::store::cookie_name_for;

/// Default JSON field naming the agent login URL on the visit page.
pub const DEFAULT_LOGIN_METHOD: &str = "agent";

/// Bakery protocol version sent on every request.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Misconfiguration detected at construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `service_name` is empty.
    #[error("service name is required")]
    MissingServiceName,
    /// `login_method` is empty.
    #[error("login method must not be empty")]
    EmptyLoginMethod,
    /// Non-interactive login needs a credential blob.
    #[error("non-interactive login requires an auth credential")]
    MissingAuth,
    /// Protocol versions start at 1.
    #[error("invalid protocol version {0}; expected 1 or later")]
    InvalidProtocolVersion(u32),
}

/// Settings for one bakery instance.
#[derive(Debug, Clone, PartialEq)]
pub struct BakeryConfig {
    /// Backend service name; the macaroon entry is `Macaroons-<service_name>`.
    pub service_name: String,
    /// Use this entry name instead of the derived one.
    pub existing_cookie: Option<String>,
    /// Endpoint that receives a PUT of each new macaroon set.
    pub set_cookie_path: Option<String>,
    /// Endpoint serving a macaroon to discharge on demand.
    pub static_macaroon_path: Option<String>,
    /// Macaroon text stored at construction, as-is.
    pub macaroon: Option<String>,
    /// Discharge token text stored at construction, as-is.
    pub discharge_token: Option<String>,
    /// Open a browser for logins. When false the auth blob is posted instead.
    pub interactive: bool,
    /// Credential blob for non-interactive login.
    pub auth: Option<serde_json::Value>,
    /// Field of the visit page JSON holding the login URL.
    pub login_method: String,
    /// Value of the `Bakery-Protocol-Version` header.
    pub protocol_version: u32,
}

impl BakeryConfig {
    /// Creates a config with defaults for everything but the service name.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            existing_cookie: None,
            set_cookie_path: None,
            static_macaroon_path: None,
            macaroon: None,
            discharge_token: None,
            interactive: true,
            auth: None,
            login_method: DEFAULT_LOGIN_METHOD.to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
        }
    }

    /// Name under which the macaroon set is stored.
    #[must_use]
    pub fn cookie_name(&self) -> String {
        cookie_name_for(&self.service_name, self.existing_cookie.as_deref())
    }

    /// Checks the values that do not depend on the chosen visit strategy.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingServiceName);
        }
        if self.login_method.trim().is_empty() {
            return Err(ConfigError::EmptyLoginMethod);
        }
        if self.protocol_version == 0 {
            return Err(ConfigError::InvalidProtocolVersion(self.protocol_version));
        }
        Ok(())
    }
}
