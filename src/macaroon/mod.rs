//! Macaroon primitives in the V1 JSON format.
//!
//! Signatures are HMAC-SHA256 chains; third-party caveat verification ids are
//! XSalsa20-Poly1305 secretboxes with the nonce prepended. The JSON shape is
//! `{location, identifier, signature (hex), caveats: [{cid, vid?, cl?}]}`,
//! with `vid` in unpadded URL-safe base64.

mod error;
mod set;

pub use error::MacaroonError;
pub use set::MacaroonSet;

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use crypto_secretbox::XSalsa20Poly1305;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Length of a macaroon signature in bytes.
pub const SIGNATURE_LEN: usize = 32;

const SECRETBOX_NONCE_LEN: usize = 24;
const KEY_GENERATOR: &[u8] = b"macaroons-key-generator";

type HmacSha256 = Hmac<Sha256>;
type Signature = [u8; SIGNATURE_LEN];

/// A single caveat.
///
/// First-party caveats carry only an id (the condition). Third-party caveats
/// also carry a verification id and the location of the discharger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caveat {
    /// Caveat id: the condition, or an opaque id for the third party.
    pub id: String,
    /// Encrypted caveat root key; present only for third-party caveats.
    pub verification_id: Option<Vec<u8>>,
    /// Discharger location; present only for third-party caveats.
    pub location: Option<String>,
}

impl Caveat {
    /// Returns true when discharging this caveat requires contacting a third party.
    #[must_use]
    pub fn is_third_party(&self) -> bool {
        self.verification_id.is_some()
    }
}

/// A signed, caveat-bearing capability token.
///
/// The signature is redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MacaroonJson", into = "MacaroonJson")]
pub struct Macaroon {
    location: String,
    identifier: String,
    signature: Signature,
    caveats: Vec<Caveat>,
}

impl fmt::Debug for Macaroon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Macaroon")
            .field("location", &self.location)
            .field("identifier", &self.identifier)
            .field("caveats", &self.caveats.len())
            .field("signature", &"[REDACTED]")
            .finish()
    }
}

impl Macaroon {
    /// Creates a macaroon signed with `root_key`.
    #[must_use]
    pub fn new(root_key: &[u8], identifier: impl Into<String>, location: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let signature = keyed_hash(&make_key(root_key), identifier.as_bytes());
        Self {
            location: location.into(),
            identifier,
            signature,
            caveats: Vec::new(),
        }
    }

    /// Target service location.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Macaroon identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Current signature.
    #[must_use]
    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    /// All caveats in order.
    #[must_use]
    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    /// Caveats that need a discharge macaroon from a third party.
    pub fn third_party_caveats(&self) -> impl Iterator<Item = &Caveat> {
        self.caveats.iter().filter(|caveat| caveat.is_third_party())
    }

    /// Adds a caveat checked by the target service.
    pub fn add_first_party_caveat(&mut self, condition: impl Into<String>) {
        let id = condition.into();
        self.signature = keyed_hash2(&self.signature, None, id.as_bytes());
        self.caveats.push(Caveat {
            id,
            verification_id: None,
            location: None,
        });
    }

    /// Adds a caveat discharged by the third party at `location`.
    ///
    /// `caveat_id` must let the third party recover `root_key`, either by
    /// sealing it or by referencing its own storage.
    ///
    /// # Errors
    ///
    /// Returns [`MacaroonError::EncryptionFailed`] when sealing the key fails.
    pub fn add_third_party_caveat(
        &mut self,
        root_key: &[u8],
        caveat_id: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<(), MacaroonError> {
        let id = caveat_id.into();
        let verification_id = encrypt(&self.signature, &make_key(root_key))?;
        self.signature = keyed_hash2(&self.signature, Some(&verification_id), id.as_bytes());
        self.caveats.push(Caveat {
            id,
            verification_id: Some(verification_id),
            location: Some(location.into()),
        });
        Ok(())
    }

    /// Binds this discharge macaroon to the root macaroon signature.
    ///
    /// Binding an already-bound macaroon to the same root is a no-op only when
    /// the signatures already match.
    pub fn bind(&mut self, root_signature: &[u8; SIGNATURE_LEN]) {
        self.signature = bind_for_request(root_signature, &self.signature);
    }

    /// Verifies this macaroon against `root_key` and the supplied discharges.
    ///
    /// `check` is called for every first-party caveat and returns `Err(reason)`
    /// to reject it. Every discharge must be used exactly once.
    ///
    /// # Errors
    ///
    /// Returns a [`MacaroonError`] describing the first failure found.
    pub fn verify<F>(
        &self,
        root_key: &[u8],
        check: F,
        discharges: &[Macaroon],
    ) -> Result<(), MacaroonError>
    where
        F: Fn(&str) -> Result<(), String>,
    {
        let mut used = vec![0_usize; discharges.len()];
        self.verify_with_key(
            &self.signature,
            &make_key(root_key),
            &check,
            discharges,
            &mut used,
        )?;
        for (discharge, count) in discharges.iter().zip(&used) {
            if *count == 0 {
                return Err(MacaroonError::UnusedDischarge(discharge.identifier.clone()));
            }
        }
        Ok(())
    }

    fn verify_with_key(
        &self,
        root_signature: &Signature,
        key: &Signature,
        check: &dyn Fn(&str) -> Result<(), String>,
        discharges: &[Macaroon],
        used: &mut [usize],
    ) -> Result<(), MacaroonError> {
        let mut signature = keyed_hash(key, self.identifier.as_bytes());
        for caveat in &self.caveats {
            if let Some(verification_id) = &caveat.verification_id {
                let caveat_key: Signature = decrypt(&signature, verification_id)?
                    .as_slice()
                    .try_into()
                    .map_err(|_| MacaroonError::DecryptionFailed)?;
                let index = discharges
                    .iter()
                    .position(|discharge| discharge.identifier == caveat.id)
                    .ok_or_else(|| MacaroonError::MissingDischarge(caveat.id.clone()))?;
                // Count before recursing so a cycle cannot recurse forever.
                used[index] += 1;
                if used[index] > 1 {
                    return Err(MacaroonError::DischargeReused(caveat.id.clone()));
                }
                discharges[index].verify_with_key(
                    root_signature,
                    &caveat_key,
                    check,
                    discharges,
                    used,
                )?;
            } else {
                check(&caveat.id).map_err(|reason| MacaroonError::CaveatNotSatisfied {
                    condition: caveat.id.clone(),
                    reason,
                })?;
            }
            signature = keyed_hash2(
                &signature,
                caveat.verification_id.as_deref(),
                caveat.id.as_bytes(),
            );
        }

        if bind_for_request(root_signature, &signature) != self.signature {
            return Err(MacaroonError::SignatureMismatch);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct MacaroonJson {
    location: String,
    identifier: String,
    signature: String,
    #[serde(default)]
    caveats: Vec<CaveatJson>,
}

#[derive(Serialize, Deserialize)]
struct CaveatJson {
    cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cl: Option<String>,
}

impl TryFrom<MacaroonJson> for Macaroon {
    type Error = MacaroonError;

    fn try_from(json: MacaroonJson) -> Result<Self, Self::Error> {
        let signature: Signature = hex::decode(&json.signature)
            .map_err(|_| MacaroonError::InvalidSignature)?
            .as_slice()
            .try_into()
            .map_err(|_| MacaroonError::InvalidSignature)?;
        let caveats = json
            .caveats
            .into_iter()
            .map(|caveat| {
                let verification_id = caveat
                    .vid
                    .as_deref()
                    .map(decode_base64_lenient)
                    .transpose()?;
                if verification_id.is_some() && caveat.cl.is_none() {
                    return Err(MacaroonError::MissingCaveatLocation(caveat.cid));
                }
                Ok(Caveat {
                    id: caveat.cid,
                    verification_id,
                    location: caveat.cl,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            location: json.location,
            identifier: json.identifier,
            signature,
            caveats,
        })
    }
}

impl From<Macaroon> for MacaroonJson {
    fn from(macaroon: Macaroon) -> Self {
        Self {
            location: macaroon.location,
            identifier: macaroon.identifier,
            signature: hex::encode(macaroon.signature),
            caveats: macaroon
                .caveats
                .into_iter()
                .map(|caveat| CaveatJson {
                    cid: caveat.id,
                    vid: caveat
                        .verification_id
                        .map(|vid| URL_SAFE_NO_PAD.encode(vid)),
                    cl: caveat.location,
                })
                .collect(),
        }
    }
}

// Peers disagree on padding and alphabet; accept all four.
fn decode_base64_lenient(text: &str) -> Result<Vec<u8>, MacaroonError> {
    [URL_SAFE_NO_PAD, URL_SAFE, STANDARD_NO_PAD, STANDARD]
        .iter()
        .find_map(|engine| engine.decode(text).ok())
        .ok_or(MacaroonError::InvalidVerificationId)
}

#[allow(clippy::expect_used)]
fn keyed_hash(key: &[u8], data: &[u8]) -> Signature {
    // HMAC accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC key of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn keyed_hash2(key: &[u8], first: Option<&[u8]>, second: &[u8]) -> Signature {
    let Some(first) = first else {
        return keyed_hash(key, second);
    };
    let mut joined = [0_u8; SIGNATURE_LEN * 2];
    joined[..SIGNATURE_LEN].copy_from_slice(&keyed_hash(key, first));
    joined[SIGNATURE_LEN..].copy_from_slice(&keyed_hash(key, second));
    keyed_hash(key, &joined)
}

fn make_key(root_key: &[u8]) -> Signature {
    keyed_hash(KEY_GENERATOR, root_key)
}

fn bind_for_request(root_signature: &Signature, discharge_signature: &Signature) -> Signature {
    if root_signature == discharge_signature {
        return *root_signature;
    }
    keyed_hash2(
        &[0_u8; SIGNATURE_LEN],
        Some(root_signature),
        discharge_signature,
    )
}

fn encrypt(key: &Signature, plaintext: &[u8]) -> Result<Vec<u8>, MacaroonError> {
    let cipher =
        XSalsa20Poly1305::new_from_slice(key).map_err(|_| MacaroonError::EncryptionFailed)?;
    let mut nonce = [0_u8; SECRETBOX_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| MacaroonError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(SECRETBOX_NONCE_LEN + sealed.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&sealed);
    Ok(output)
}

fn decrypt(key: &Signature, ciphertext: &[u8]) -> Result<Vec<u8>, MacaroonError> {
    if ciphertext.len() < SECRETBOX_NONCE_LEN {
        return Err(MacaroonError::DecryptionFailed);
    }
    let cipher =
        XSalsa20Poly1305::new_from_slice(key).map_err(|_| MacaroonError::DecryptionFailed)?;
    let (nonce, sealed) = ciphertext.split_at(SECRETBOX_NONCE_LEN);
    cipher
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| MacaroonError::DecryptionFailed)
}
