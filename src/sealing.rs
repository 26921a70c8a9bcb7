//! Public-key sealed third-party caveats.
//!
//! Used when this client's owner acts as a discharger for another service.
//! The caveat id is a JSON envelope:
//!
//! ```text
//! {"ThirdPartyPublicKey": b64, "FirstPartyPublicKey": b64, "Nonce": b64, "Id": b64(box)}
//! ```
//!
//! where the box is a NaCl `crypto_box` of `{"RootKey": b64, "Condition": str}`
//! sealed with the first party's secret key for the third party's public key.
//! Byte strings use padded standard base64 and the nonce is 24 bytes, so the
//! counterpart may live in another process or language.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crypto_box::aead::Aead;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::macaroon::{Macaroon, MacaroonError};

/// NaCl box nonce length.
pub const NONCE_LEN: usize = 24;

/// Curve25519 key length.
pub const KEY_LEN: usize = 32;

/// Length of the random root key generated for each sealed caveat.
pub const ROOT_KEY_LEN: usize = 24;

/// Errors raised by sealing and unsealing. Never swallowed by this crate.
#[derive(Debug, Error)]
pub enum SealError {
    /// The caveat id is not a JSON envelope.
    #[error("cannot parse caveat id: {0}")]
    UnparsableId(#[source] serde_json::Error),

    /// The envelope was sealed for a different third party.
    #[error("public key mismatch")]
    PublicKeyMismatch,

    /// The nonce is not exactly 24 bytes.
    #[error("bad nonce length {0}")]
    BadNonceLength(usize),

    /// A key field has the wrong length.
    #[error("bad public key length {0}")]
    BadKeyLength(usize),

    /// A field is not valid base64.
    #[error("invalid base64 in caveat field {0}")]
    InvalidEncoding(&'static str),

    /// Sealing the payload failed.
    #[error("cannot seal caveat")]
    SealFailed,

    /// The box could not be opened with the supplied keys.
    #[error("cannot decrypt caveat id")]
    OpenFailed,

    /// The sealed payload is not valid JSON.
    #[error("cannot parse sealed caveat payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// The sealed payload carries no condition.
    #[error("empty third party caveat condition")]
    MissingCondition,

    /// The caller's check rejected the condition.
    #[error("caveat condition {condition:?} rejected: {reason}")]
    ConditionRejected {
        /// The rejected condition.
        condition: String,
        /// Reason supplied by the check.
        reason: String,
    },

    /// The macaroon layer failed while adding the caveat.
    #[error(transparent)]
    Macaroon(#[from] MacaroonError),
}

/// A Curve25519 key pair. The secret half is redacted in `Debug`.
#[derive(Clone)]
pub struct KeyPair {
    /// Public key bytes.
    pub public: [u8; KEY_LEN],
    secret: [u8; KEY_LEN],
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &STANDARD.encode(self.public))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generates a fresh random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let mut secret = [0_u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    /// Rebuilds a key pair from its secret half.
    #[must_use]
    pub fn from_secret(secret: [u8; KEY_LEN]) -> Self {
        let public = *SecretKey::from(secret).public_key().as_bytes();
        Self { public, secret }
    }

    /// The secret key bytes.
    #[must_use]
    pub fn secret(&self) -> &[u8; KEY_LEN] {
        &self.secret
    }
}

/// NaCl box primitive, injectable so another implementation can be substituted.
pub trait BoxCrypto: Send + Sync {
    /// Seals `message` for `their_public` using `my_secret`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::SealFailed`] on cipher failure.
    fn seal(
        &self,
        message: &[u8],
        nonce: &[u8; NONCE_LEN],
        their_public: &[u8; KEY_LEN],
        my_secret: &[u8; KEY_LEN],
    ) -> Result<Vec<u8>, SealError>;

    /// Opens a box sealed by `their_public` for `my_secret`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::OpenFailed`] when authentication fails.
    fn open(
        &self,
        sealed: &[u8],
        nonce: &[u8; NONCE_LEN],
        their_public: &[u8; KEY_LEN],
        my_secret: &[u8; KEY_LEN],
    ) -> Result<Vec<u8>, SealError>;

    /// Fills `buf` with cryptographically secure random bytes.
    fn fill_random(&self, buf: &mut [u8]);
}

/// [`BoxCrypto`] backed by `crypto_box` (X25519 + XSalsa20-Poly1305).
#[derive(Debug, Clone, Copy, Default)]
pub struct NaclBox;

impl BoxCrypto for NaclBox {
    fn seal(
        &self,
        message: &[u8],
        nonce: &[u8; NONCE_LEN],
        their_public: &[u8; KEY_LEN],
        my_secret: &[u8; KEY_LEN],
    ) -> Result<Vec<u8>, SealError> {
        let salsa = SalsaBox::new(&PublicKey::from(*their_public), &SecretKey::from(*my_secret));
        salsa
            .encrypt(GenericArray::from_slice(nonce), message)
            .map_err(|_| SealError::SealFailed)
    }

    fn open(
        &self,
        sealed: &[u8],
        nonce: &[u8; NONCE_LEN],
        their_public: &[u8; KEY_LEN],
        my_secret: &[u8; KEY_LEN],
    ) -> Result<Vec<u8>, SealError> {
        let salsa = SalsaBox::new(&PublicKey::from(*their_public), &SecretKey::from(*my_secret));
        salsa
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|_| SealError::OpenFailed)
    }

    fn fill_random(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CaveatIdEnvelope {
    third_party_public_key: String,
    first_party_public_key: String,
    nonce: String,
    id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SealedCaveat {
    root_key: String,
    #[serde(default)]
    condition: Option<String>,
}

/// Adds and discharges sealed third-party caveats with an injected [`BoxCrypto`].
#[derive(Clone)]
pub struct CaveatSealer {
    crypto: Arc<dyn BoxCrypto>,
}

impl Default for CaveatSealer {
    fn default() -> Self {
        Self::new(Arc::new(NaclBox))
    }
}

impl fmt::Debug for CaveatSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaveatSealer").finish_non_exhaustive()
    }
}

impl CaveatSealer {
    /// Creates a sealer over the given box implementation.
    #[must_use]
    pub fn new(crypto: Arc<dyn BoxCrypto>) -> Self {
        Self { crypto }
    }

    /// Seals `condition` for the third party and adds it to `macaroon`.
    ///
    /// A fresh root key and nonce are generated for every caveat.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if sealing or caveat addition fails.
    pub fn add_third_party_caveat(
        &self,
        macaroon: &mut Macaroon,
        condition: &str,
        location: &str,
        third_party_public: &[u8; KEY_LEN],
        my_keys: &KeyPair,
    ) -> Result<(), SealError> {
        let mut root_key = [0_u8; ROOT_KEY_LEN];
        self.crypto.fill_random(&mut root_key);
        let mut nonce = [0_u8; NONCE_LEN];
        self.crypto.fill_random(&mut nonce);

        let payload = serde_json::to_vec(&SealedCaveat {
            root_key: STANDARD.encode(root_key),
            condition: Some(condition.to_string()),
        })
        .map_err(SealError::InvalidPayload)?;
        let sealed = self
            .crypto
            .seal(&payload, &nonce, third_party_public, my_keys.secret())?;

        let envelope = CaveatIdEnvelope {
            third_party_public_key: STANDARD.encode(third_party_public),
            first_party_public_key: STANDARD.encode(my_keys.public),
            nonce: STANDARD.encode(nonce),
            id: STANDARD.encode(sealed),
        };
        let caveat_id = serde_json::to_string(&envelope).map_err(SealError::InvalidPayload)?;

        macaroon.add_third_party_caveat(&root_key, caveat_id, location)?;
        debug!(location, "added sealed third-party caveat");
        Ok(())
    }

    /// Opens a sealed caveat id addressed to `my_keys` and mints its discharge.
    ///
    /// `check` receives the recovered condition and returns `Err(reason)` to
    /// refuse the discharge. The returned macaroon is unbound; the requesting
    /// client binds it to its root.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] for a malformed envelope, a key mismatch, a bad
    /// nonce, a box that does not open, a missing condition, or a rejected check.
    pub fn discharge_third_party_caveat<F>(
        &self,
        caveat_id: &str,
        my_keys: &KeyPair,
        check: F,
    ) -> Result<Macaroon, SealError>
    where
        F: FnOnce(&str) -> Result<(), String>,
    {
        let envelope: CaveatIdEnvelope =
            serde_json::from_str(caveat_id).map_err(SealError::UnparsableId)?;

        let third_party_public = decode_key(&envelope.third_party_public_key, "ThirdPartyPublicKey")?;
        if third_party_public != my_keys.public {
            return Err(SealError::PublicKeyMismatch);
        }
        let first_party_public = decode_key(&envelope.first_party_public_key, "FirstPartyPublicKey")?;

        let nonce_bytes = decode_field(&envelope.nonce, "Nonce")?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SealError::BadNonceLength(nonce_bytes.len()))?;

        let sealed = decode_field(&envelope.id, "Id")?;
        let payload = self
            .crypto
            .open(&sealed, &nonce, &first_party_public, my_keys.secret())?;
        let inner: SealedCaveat =
            serde_json::from_slice(&payload).map_err(SealError::InvalidPayload)?;

        let condition = inner
            .condition
            .filter(|condition| !condition.is_empty())
            .ok_or(SealError::MissingCondition)?;
        let root_key = decode_field(&inner.root_key, "RootKey")?;

        check(&condition).map_err(|reason| SealError::ConditionRejected {
            condition: condition.clone(),
            reason,
        })?;

        debug!("discharged sealed third-party caveat");
        Ok(Macaroon::new(&root_key, caveat_id, ""))
    }
}

/// Seals a third-party caveat with the default [`NaclBox`] implementation.
///
/// # Errors
///
/// See [`CaveatSealer::add_third_party_caveat`].
pub fn add_third_party_caveat(
    macaroon: &mut Macaroon,
    condition: &str,
    location: &str,
    third_party_public: &[u8; KEY_LEN],
    my_keys: &KeyPair,
) -> Result<(), SealError> {
    CaveatSealer::default().add_third_party_caveat(
        macaroon,
        condition,
        location,
        third_party_public,
        my_keys,
    )
}

/// Discharges a sealed caveat with the default [`NaclBox`] implementation.
///
/// # Errors
///
/// See [`CaveatSealer::discharge_third_party_caveat`].
pub fn discharge_third_party_caveat<F>(
    caveat_id: &str,
    my_keys: &KeyPair,
    check: F,
) -> Result<Macaroon, SealError>
where
    F: FnOnce(&str) -> Result<(), String>,
{
    CaveatSealer::default().discharge_third_party_caveat(caveat_id, my_keys, check)
}

fn decode_field(text: &str, field: &'static str) -> Result<Vec<u8>, SealError> {
    STANDARD
        .decode(text)
        .map_err(|_| SealError::InvalidEncoding(field))
}

fn decode_key(text: &str, field: &'static str) -> Result<[u8; KEY_LEN], SealError> {
    let bytes = decode_field(text, field)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| SealError::BadKeyLength(bytes.len()))
}
