//! Third-party caveat discharge.
//!
//! Walks every third-party caveat of a root macaroon (and of the discharges it
//! collects), POSTs each to `<location>/discharge`, runs the interaction flow
//! when the identity provider asks for it, binds the results to the root and
//! persists the complete set. Any failure drops everything collected so far.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::error::DischargeError;
use crate::macaroon::{Macaroon, MacaroonSet};
use crate::store::CredentialStore;
use crate::transport::{
    BAKERY_PROTOCOL_VERSION, FORM_CONTENT_TYPE, HttpRequest, HttpResponse, HttpTransport,
    JSON_CONTENT_TYPE, MACAROONS,
};
use crate::visit::{InteractionInfo, VisitStrategy};

/// Error code an identity provider returns when a login is needed.
pub const INTERACTION_REQUIRED: &str = "interaction required";

/// How many times a dropped wait request is reissued.
pub const MAX_WAIT_RETRIES: usize = 5;

/// Upper bound on discharges collected for one root macaroon.
pub const MAX_DISCHARGES: usize = 16;

#[derive(Deserialize)]
struct DischargeResponse {
    #[serde(rename = "Macaroon")]
    macaroon: Macaroon,
    #[serde(rename = "DischargeToken", default)]
    discharge_token: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct InteractionResponse {
    #[serde(rename = "Info")]
    info: InteractionInfo,
}

/// Runs discharge sequences against a shared transport and store.
///
/// Cheap to clone; every sequence can run on its own task.
#[derive(Clone)]
pub struct DischargeEngine {
    transport: Arc<dyn HttpTransport>,
    store: CredentialStore,
    visit: Arc<dyn VisitStrategy>,
    set_cookie_path: Option<String>,
    protocol_version: u32,
}

impl fmt::Debug for DischargeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DischargeEngine")
            .field("store", &self.store)
            .field("set_cookie_path", &self.set_cookie_path)
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

impl DischargeEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: CredentialStore,
        visit: Arc<dyn VisitStrategy>,
        set_cookie_path: Option<String>,
        protocol_version: u32,
    ) -> Self {
        Self {
            transport,
            store,
            visit,
            set_cookie_path,
            protocol_version,
        }
    }

    /// Discharges `root` and persists the resulting set.
    ///
    /// When a cookie path is configured the set is first PUT there so the
    /// server can issue its own cookie; only then is it stored locally.
    ///
    /// # Errors
    ///
    /// Returns [`DischargeError`] if any discharge, the cookie PUT, or the
    /// store write fails. Nothing is stored in that case.
    pub async fn discharge_and_store(&self, root: Macaroon) -> Result<MacaroonSet, DischargeError> {
        let set = self.discharge(root).await?;
        if let Some(path) = &self.set_cookie_path {
            self.set_auth_cookie(path, &set).await?;
        }
        self.store.set_macaroon(&set)?;
        info!(macaroons = set.len(), "stored discharged macaroon set");
        Ok(set)
    }

    /// Collects and binds a discharge for every third-party caveat.
    ///
    /// A root without third-party caveats yields a one-element set.
    ///
    /// # Errors
    ///
    /// Returns the first [`DischargeError`] encountered, or one when more
    /// than [`MAX_DISCHARGES`] discharges would be needed.
    #[instrument(level = "debug", skip(self, root), fields(location = %root.location()))]
    pub async fn discharge(&self, root: Macaroon) -> Result<MacaroonSet, DischargeError> {
        let first_party_location = root.location().to_string();
        let root_signature = *root.signature();
        let mut pending: VecDeque<(String, String)> = third_party_targets(&root)?;
        let mut set = MacaroonSet::new(root);

        while let Some((caveat_id, third_party_location)) = pending.pop_front() {
            if set.discharges().len() >= MAX_DISCHARGES {
                return Err(DischargeError::new(format!(
                    "too many discharges required (limit {MAX_DISCHARGES})"
                )));
            }
            let mut discharge = self
                .obtain_discharge(&first_party_location, &third_party_location, &caveat_id)
                .await?;
            pending.extend(third_party_targets(&discharge)?);
            discharge.bind(&root_signature);
            set.push_discharge(discharge);
        }

        debug!(macaroons = set.len(), "discharge complete");
        Ok(set)
    }

    #[instrument(level = "debug", skip_all, fields(third_party = %third_party_location))]
    async fn obtain_discharge(
        &self,
        location: &str,
        third_party_location: &str,
        caveat_id: &str,
    ) -> Result<Macaroon, DischargeError> {
        let url = format!("{}/discharge", third_party_location.trim_end_matches('/'));
        let body = format!(
            "id={}&location={}",
            urlencoding::encode(caveat_id),
            urlencoding::encode(location)
        );
        let mut request = HttpRequest::new(Method::POST, url)
            .with_header(BAKERY_PROTOCOL_VERSION, &self.protocol_version.to_string())
            .with_header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .with_body(body);
        if let Some(token) = self.store.get_discharge_token()? {
            request = request.with_header(MACAROONS, &token);
        }

        let response = self.transport.send(request).await?;
        if response.is_success() {
            return self.accept_discharge(&response);
        }
        self.interact(&response).await
    }

    async fn interact(&self, response: &HttpResponse) -> Result<Macaroon, DischargeError> {
        let error: serde_json::Value = response
            .json()
            .map_err(|e| DischargeError::new(format!("cannot parse discharge response: {e}")))?;
        let code = error.get("Code").and_then(serde_json::Value::as_str);
        if code != Some(INTERACTION_REQUIRED) {
            let message = code.map_or_else(|| error_message(&error), str::to_string);
            warn!(status = response.status, %message, "discharge refused");
            return Err(DischargeError::new(message));
        }

        let InteractionResponse { info } = serde_json::from_value(error)
            .map_err(|e| DischargeError::new(format!("cannot parse interaction info: {e}")))?;
        info!(visit_url = %info.visit_url, "interaction required");
        self.visit
            .visit(self.transport.as_ref(), &info)
            .await
            .map_err(|e| DischargeError::new(format!("cannot interact: {e}")))?;

        let response = self.wait(&info.wait_url).await?;
        if !response.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .map_or_else(|_| format!("status {}", response.status), |v| error_message(&v));
            return Err(DischargeError::new(format!("cannot interact: {message}")));
        }
        self.accept_discharge(&response)
    }

    // Login may outlast the server's wait timeout, which drops the connection.
    async fn wait(&self, wait_url: &str) -> Result<HttpResponse, DischargeError> {
        let mut retries = 0;
        loop {
            let request = HttpRequest::new(Method::GET, wait_url)
                .with_header(CONTENT_TYPE, JSON_CONTENT_TYPE);
            match self.transport.send(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_disconnect() && retries < MAX_WAIT_RETRIES => {
                    retries += 1;
                    debug!(retries, error = %e, "wait request dropped, retrying");
                }
                Err(e) => return Err(DischargeError::new(format!("cannot interact: {e}"))),
            }
        }
    }

    fn accept_discharge(&self, response: &HttpResponse) -> Result<Macaroon, DischargeError> {
        let parsed: DischargeResponse = response
            .json()
            .map_err(|e| DischargeError::new(format!("cannot parse discharge response: {e}")))?;
        if let Some(token) = parsed.discharge_token.filter(|token| !token.is_null()) {
            self.store.set_discharge_token(&token)?;
        }
        Ok(parsed.macaroon)
    }

    #[instrument(level = "debug", skip(self, set))]
    async fn set_auth_cookie(&self, path: &str, set: &MacaroonSet) -> Result<(), DischargeError> {
        let body = serde_json::json!({ "Macaroons": set }).to_string();
        let request = HttpRequest::new(Method::PUT, path)
            .with_header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .with_body(body)
            .with_credentials();
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(DischargeError::new(format!(
                "cannot set auth cookie: status {}",
                response.status
            )));
        }
        Ok(())
    }
}

fn third_party_targets(macaroon: &Macaroon) -> Result<VecDeque<(String, String)>, DischargeError> {
    macaroon
        .third_party_caveats()
        .map(|caveat| {
            caveat
                .location
                .clone()
                .map(|location| (caveat.id.clone(), location))
                .ok_or_else(|| {
                    DischargeError::new(format!("caveat {:?} has no discharge location", caveat.id))
                })
        })
        .collect()
}

/// Extracts a human-readable message from a JSON error body.
pub(crate) fn error_message(body: &serde_json::Value) -> String {
    ["Message", "message", "Error", "error"]
        .iter()
        .find_map(|field| {
            body.get(*field)
                .and_then(serde_json::Value::as_str)
                .filter(|text| !text.is_empty())
        })
        .map_or_else(|| format!("unexpected error: {body}"), str::to_string)
}
