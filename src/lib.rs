//! Bakery Client Library
//!
//! A macaroon bakery client: it wraps outgoing HTTP calls, answers 401
//! macaroon challenges by discharging third-party caveats (with interactive
//! or agent login when the identity provider asks), persists the resulting
//! credentials, and replays the original request once.
//!
//! # Architecture
//!
//! The library is organized into the following modules, leaf first:
//! - [`transport`] - The HTTP collaborator seam and its reqwest implementation
//! - [`macaroon`] - Macaroon primitives and the `MacaroonSet` wire codec
//! - [`sealing`] - Public-key sealed caveats for acting as a discharger
//! - [`store`] - Credential persistence (memory, cookie jar, encrypted file)
//! - [`visit`] - Interaction strategies for "interaction required"
//! - [`discharge`] - The discharge loop and wait polling
//! - [`challenge`] - 401 challenge detection and single replay
//! - [`bakery`] - The public request surface

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bakery;
pub mod challenge;
pub mod config;
pub mod discharge;
pub mod error;
pub mod macaroon;
pub mod sealing;
pub mod store;
pub mod transport;
pub mod visit;

// Re-export commonly used types
pub use bakery::{Bakery, BakeryBuilder, RequestHandle};
pub use config::{BakeryConfig, ConfigError};
pub use error::{BuildError, DischargeError, RequestError};
pub use macaroon::{Caveat, Macaroon, MacaroonError, MacaroonSet};
pub use sealing::{
    BoxCrypto, CaveatSealer, KeyPair, NaclBox, SealError, add_third_party_caveat,
    discharge_third_party_caveat,
};
pub use store::{
    CookieJarStore, CredentialStore, FileStore, KeyValueStore, MemoryStore, StoreError,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use visit::{BrowserVisit, FnVisit, InteractionInfo, NonInteractiveVisit, VisitError, VisitStrategy};
