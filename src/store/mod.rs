//! Credential persistence.
//!
//! A [`CredentialStore`] keeps two independent entries: the current
//! [`MacaroonSet`] under a service-derived name, and the discharge token under
//! [`DISCHARGE_TOKEN_KEY`]. Each entry lives in a pluggable [`KeyValueStore`]:
//! an in-memory map, the transport's cookie jar, or an encrypted file.

mod cookie_jar;
mod file;
mod memory;

pub use cookie_jar::CookieJarStore;
pub use file::{FileStore, default_store_path};
pub use memory::MemoryStore;

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use crate::macaroon::{MacaroonError, MacaroonSet};

/// Key under which the discharge token is stored.
pub const DISCHARGE_TOKEN_KEY: &str = "discharge-token";

/// Prefix of the derived macaroon cookie name.
pub const COOKIE_NAME_PREFIX: &str = "Macaroons-";

/// Errors for credential storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No suitable user config directory is available.
    #[error("unable to determine config directory (set XDG_CONFIG_HOME or HOME)")]
    ConfigDirUnavailable,
    /// Filesystem I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Could not access keychain and no env fallback key was provided.
    #[error(
        "unable to access system keychain for credential encryption key; set BAKERY_MASTER_KEY or configure keychain access"
    )]
    KeychainUnavailable,
    /// Stored encrypted payload is malformed.
    #[error("persisted credential payload is invalid")]
    InvalidPayload,
    /// Encryption failed.
    #[error("failed to encrypt persisted credentials")]
    EncryptionFailed,
    /// Decryption failed.
    #[error("failed to decrypt persisted credentials")]
    DecryptionFailed,
    /// A macaroon set could not be encoded.
    #[error(transparent)]
    Macaroon(#[from] MacaroonError),
}

/// Synchronous key/value backing for credentials.
///
/// Each `set` must be a single atomic write; last write wins.
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes a value. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing cannot be written.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Derives the macaroon entry name for a service.
#[must_use]
pub fn cookie_name_for(service_name: &str, existing_cookie: Option<&str>) -> String {
    match existing_cookie {
        Some(existing) if !existing.trim().is_empty() => existing.to_string(),
        _ => format!("{COOKIE_NAME_PREFIX}{service_name}"),
    }
}

/// Facade over the macaroon and discharge-token entries.
#[derive(Clone)]
pub struct CredentialStore {
    macaroons: Arc<dyn KeyValueStore>,
    discharge_tokens: Arc<dyn KeyValueStore>,
    cookie_name: String,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("cookie_name", &self.cookie_name)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Creates a store keeping both entries in the same backing.
    #[must_use]
    pub fn new(backing: Arc<dyn KeyValueStore>, cookie_name: impl Into<String>) -> Self {
        Self::with_stores(Arc::clone(&backing), backing, cookie_name)
    }

    /// Creates a store with separate backings for macaroons and discharge tokens.
    #[must_use]
    pub fn with_stores(
        macaroons: Arc<dyn KeyValueStore>,
        discharge_tokens: Arc<dyn KeyValueStore>,
        cookie_name: impl Into<String>,
    ) -> Self {
        Self {
            macaroons,
            discharge_tokens,
            cookie_name: cookie_name.into(),
        }
    }

    /// Creates an in-memory store.
    #[must_use]
    pub fn in_memory(cookie_name: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), cookie_name)
    }

    /// Name under which the macaroon set is stored.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Returns the stored macaroon set.
    ///
    /// A set that does not decode, or that still has undischarged third-party
    /// caveats, is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only when the backing itself fails.
    pub fn get_macaroon(&self) -> Result<Option<MacaroonSet>, StoreError> {
        let Some(encoded) = self.get_raw_macaroon()? else {
            return Ok(None);
        };
        match MacaroonSet::decode(&encoded) {
            Ok(set) if set.is_complete() => Ok(Some(set)),
            Ok(_) => {
                warn!(name = %self.cookie_name, "ignoring stored macaroon set with undischarged caveats");
                Ok(None)
            }
            Err(e) => {
                warn!(name = %self.cookie_name, error = %e, "ignoring corrupt stored macaroon set");
                Ok(None)
            }
        }
    }

    /// Returns the stored macaroon text exactly as written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing fails.
    pub fn get_raw_macaroon(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .macaroons
            .get(&self.cookie_name)?
            .filter(|value| !value.is_empty()))
    }

    /// Stores a macaroon set as `base64(JSON)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when encoding or writing fails.
    pub fn set_macaroon(&self, set: &MacaroonSet) -> Result<(), StoreError> {
        let encoded = set.encode()?;
        self.set_raw_macaroon(&encoded)
    }

    /// Stores already-encoded macaroon text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when writing fails.
    pub fn set_raw_macaroon(&self, encoded: &str) -> Result<(), StoreError> {
        self.macaroons.set(&self.cookie_name, encoded)?;
        debug!(name = %self.cookie_name, "stored macaroon set");
        Ok(())
    }

    /// Removes the macaroon set and the discharge token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when either removal fails.
    pub fn clear_cookie(&self) -> Result<(), StoreError> {
        self.macaroons.remove(&self.cookie_name)?;
        self.discharge_tokens.remove(DISCHARGE_TOKEN_KEY)?;
        debug!(name = %self.cookie_name, "cleared stored credentials");
        Ok(())
    }

    /// Returns the stored discharge token in its header form (`base64(JSON)`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing fails.
    pub fn get_discharge_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .discharge_tokens
            .get(DISCHARGE_TOKEN_KEY)?
            .filter(|value| !value.is_empty()))
    }

    /// Stores a discharge token received from an identity provider.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when encoding or writing fails.
    pub fn set_discharge_token(&self, token: &serde_json::Value) -> Result<(), StoreError> {
        let encoded = STANDARD.encode(serde_json::to_vec(token)?);
        self.set_raw_discharge_token(&encoded)
    }

    /// Stores already-encoded discharge token text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when writing fails.
    pub fn set_raw_discharge_token(&self, encoded: &str) -> Result<(), StoreError> {
        self.discharge_tokens.set(DISCHARGE_TOKEN_KEY, encoded)?;
        debug!("stored discharge token");
        Ok(())
    }
}
