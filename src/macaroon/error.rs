//! Macaroon decode and verification errors.

use thiserror::Error;

/// Errors from macaroon import, export, and verification.
#[derive(Debug, Error)]
pub enum MacaroonError {
    /// The signature field is not 32 bytes of hex.
    #[error("invalid macaroon signature encoding")]
    InvalidSignature,

    /// A caveat verification id is not valid base64.
    #[error("invalid caveat verification id encoding")]
    InvalidVerificationId,

    /// A third-party caveat has no discharge location.
    #[error("third-party caveat {0:?} has no location")]
    MissingCaveatLocation(String),

    /// Sealing a caveat key failed.
    #[error("caveat key encryption failed")]
    EncryptionFailed,

    /// A verification id could not be opened with the current signature.
    #[error("caveat key decryption failed")]
    DecryptionFailed,

    /// No discharge macaroon matches a third-party caveat.
    #[error("cannot find discharge macaroon for caveat {0:?}")]
    MissingDischarge(String),

    /// A discharge macaroon was supplied but no caveat referenced it.
    #[error("discharge macaroon {0:?} was not used")]
    UnusedDischarge(String),

    /// A discharge macaroon satisfied more than one caveat.
    #[error("discharge macaroon {0:?} was used more than once")]
    DischargeReused(String),

    /// A first-party caveat was rejected by the checker.
    #[error("caveat {condition:?} not satisfied: {reason}")]
    CaveatNotSatisfied {
        /// The rejected condition.
        condition: String,
        /// Checker-supplied reason.
        reason: String,
    },

    /// The final signature does not match.
    #[error("signature mismatch after caveat verification")]
    SignatureMismatch,

    /// A macaroon set must contain at least the root macaroon.
    #[error("macaroon set is empty")]
    EmptySet,

    /// A serialized macaroon set is not valid base64.
    #[error("macaroon set is not valid base64")]
    InvalidSetEncoding,

    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
