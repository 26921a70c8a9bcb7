//! The root macaroon plus its bound discharges, as carried on requests.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::{Macaroon, MacaroonError};

/// Root macaroon followed by the discharges bound to it.
///
/// Serialized as a JSON array; the header and cookie form is
/// `base64(JSON)` via [`encode`](Self::encode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Macaroon>", try_from = "Vec<Macaroon>")]
pub struct MacaroonSet(Vec<Macaroon>);

impl MacaroonSet {
    /// Creates a set holding only the root macaroon.
    #[must_use]
    pub fn new(root: Macaroon) -> Self {
        Self(vec![root])
    }

    /// Creates a set from a root-first list.
    ///
    /// # Errors
    ///
    /// Returns [`MacaroonError::EmptySet`] for an empty list.
    pub fn from_macaroons(macaroons: Vec<Macaroon>) -> Result<Self, MacaroonError> {
        if macaroons.is_empty() {
            return Err(MacaroonError::EmptySet);
        }
        Ok(Self(macaroons))
    }

    /// The root macaroon.
    #[must_use]
    pub fn root(&self) -> &Macaroon {
        &self.0[0]
    }

    /// The discharge macaroons, in acquisition order.
    #[must_use]
    pub fn discharges(&self) -> &[Macaroon] {
        &self.0[1..]
    }

    /// Appends a discharge. The caller is responsible for binding it first.
    pub fn push_discharge(&mut self, discharge: Macaroon) {
        self.0.push(discharge);
    }

    /// Number of macaroons, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; every constructor rejects an empty list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All macaroons, root first.
    #[must_use]
    pub fn as_slice(&self) -> &[Macaroon] {
        &self.0
    }

    /// Returns true when every third-party caveat in the set has a discharge.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.0
            .iter()
            .flat_map(Macaroon::third_party_caveats)
            .all(|caveat| {
                self.discharges()
                    .iter()
                    .any(|discharge| discharge.identifier() == caveat.id)
            })
    }

    /// Serializes to `base64(JSON)`.
    ///
    /// # Errors
    ///
    /// Returns [`MacaroonError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String, MacaroonError> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Parses `base64(JSON)` text produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns a [`MacaroonError`] for bad base64, bad JSON, invalid macaroons,
    /// or an empty array.
    pub fn decode(encoded: &str) -> Result<Self, MacaroonError> {
        let json = STANDARD
            .decode(encoded.trim())
            .map_err(|_| MacaroonError::InvalidSetEncoding)?;
        let macaroons: Vec<Macaroon> = serde_json::from_slice(&json)?;
        Self::from_macaroons(macaroons)
    }
}

impl TryFrom<Vec<Macaroon>> for MacaroonSet {
    type Error = MacaroonError;

    fn try_from(macaroons: Vec<Macaroon>) -> Result<Self, Self::Error> {
        Self::from_macaroons(macaroons)
    }
}

impl From<MacaroonSet> for Vec<Macaroon> {
    fn from(set: MacaroonSet) -> Self {
        set.0
    }
}

impl IntoIterator for MacaroonSet {
    type Item = Macaroon;
    type IntoIter = std::vec::IntoIter<Macaroon>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
