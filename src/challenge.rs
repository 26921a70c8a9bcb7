//! 401 challenge handling.
//!
//! A response is `Challenged` only when it is a 401 carrying
//! `WWW-Authenticate: Macaroon` and the caller allowed redirects. Everything
//! else is `Direct` and routes by status. A challenge triggers one discharge
//! and one replay with redirects off, so a second 401 surfaces as a failure.

use std::fmt;
use std::sync::Arc;

use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::discharge::DischargeEngine;
use crate::error::{DischargeError, RequestError};
use crate::macaroon::Macaroon;
use crate::store::CredentialStore;
use crate::transport::{
    BAKERY_PROTOCOL_VERSION, HttpRequest, HttpResponse, HttpTransport, JSON_CONTENT_TYPE,
    MACAROONS,
};

/// Status code of a macaroon challenge.
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// `WWW-Authenticate` value of a macaroon challenge.
pub const MACAROON_CHALLENGE: &str = "Macaroon";

#[derive(Deserialize)]
struct ChallengeBody {
    #[serde(rename = "Info")]
    info: ChallengeInfo,
}

#[derive(Deserialize)]
struct ChallengeInfo {
    #[serde(rename = "Macaroon")]
    macaroon: Macaroon,
}

/// How a received response is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    /// Route by status.
    Direct,
    /// Discharge, then replay once.
    Challenged,
}

impl ChallengeState {
    /// Classifies a response.
    #[must_use]
    pub fn of(response: &HttpResponse, redirect: bool) -> Self {
        let challenged = redirect
            && response.status == STATUS_UNAUTHORIZED
            && response.header(WWW_AUTHENTICATE.as_str()) == Some(MACAROON_CHALLENGE);
        if challenged {
            Self::Challenged
        } else {
            Self::Direct
        }
    }
}

/// Decorates, sends, and if challenged discharges and replays requests.
#[derive(Clone)]
pub struct AuthChallengeHandler {
    transport: Arc<dyn HttpTransport>,
    store: CredentialStore,
    engine: DischargeEngine,
    protocol_version: u32,
}

impl fmt::Debug for AuthChallengeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthChallengeHandler")
            .field("store", &self.store)
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

impl AuthChallengeHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: CredentialStore,
        engine: DischargeEngine,
        protocol_version: u32,
    ) -> Self {
        Self {
            transport,
            store,
            engine,
            protocol_version,
        }
    }

    /// The credential store used for the `Macaroons` header.
    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// The discharge engine run on challenges.
    #[must_use]
    pub fn engine(&self) -> &DischargeEngine {
        &self.engine
    }

    /// The transport requests go through.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Builds a request carrying the protocol headers and stored macaroons.
    ///
    /// Requests with a body are marked as JSON.
    #[must_use]
    pub fn decorate(&self, method: Method, path: &str, data: Option<&str>) -> HttpRequest {
        let mut request = HttpRequest::new(method, path)
            .with_header(BAKERY_PROTOCOL_VERSION, &self.protocol_version.to_string());
        match self.store.get_macaroon() {
            Ok(Some(set)) => match set.encode() {
                Ok(encoded) => request = request.with_header(MACAROONS, &encoded),
                Err(e) => warn!(error = %e, "cannot encode stored macaroons"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cannot read stored macaroons"),
        }
        if let Some(data) = data {
            request = request
                .with_header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .with_body(data);
        }
        request
    }

    /// Sends a request, handling at most one macaroon challenge.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Status`] for responses of 400 and above that
    /// are not handled challenges, [`RequestError::Transport`] when no
    /// response arrives, and [`RequestError::Discharge`] when a challenge
    /// cannot be discharged.
    #[instrument(level = "debug", skip(self, method, path, data), fields(method = %method, path = %path))]
    pub async fn dispatch(
        &self,
        method: Method,
        path: &str,
        data: Option<&str>,
        redirect: bool,
    ) -> Result<HttpResponse, RequestError> {
        let request = self.decorate(method.clone(), path, data);
        let response = self.transport.send(request).await?;

        match ChallengeState::of(&response, redirect) {
            ChallengeState::Direct => route(path, response),
            ChallengeState::Challenged => {
                info!(path, "macaroon challenge received");
                let root = parse_challenge(&response)?;
                self.discharge_detached(root).await?;

                debug!(path, "replaying request with discharged macaroons");
                let replay = self.decorate(method, path, data);
                let response = self.transport.send(replay).await?;
                route(path, response)
            }
        }
    }

    // Runs on its own task so the credentials are still persisted if the
    // caller abandons the request mid-discharge.
    async fn discharge_detached(&self, root: Macaroon) -> Result<(), DischargeError> {
        let engine = self.engine.clone();
        let task = tokio::spawn(async move { engine.discharge_and_store(root).await });
        task.await
            .map_err(|e| DischargeError::new(format!("discharge task failed: {e}")))??;
        Ok(())
    }
}

fn parse_challenge(response: &HttpResponse) -> Result<Macaroon, DischargeError> {
    response
        .json::<ChallengeBody>()
        .map(|body| body.info.macaroon)
        .map_err(|e| DischargeError::new(format!("cannot parse macaroon challenge: {e}")))
}

/// Routes a response by status: below 400 is success.
///
/// # Errors
///
/// Returns [`RequestError::Status`] with the raw response otherwise.
pub fn route(url: &str, response: HttpResponse) -> Result<HttpResponse, RequestError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(RequestError::Status {
            url: url.to_string(),
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macaroon::MacaroonSet;
    use crate::transport::testing::RecordingTransport;
    use crate::visit::FnVisit;

    fn handler(transport: Arc<RecordingTransport>) -> AuthChallengeHandler {
        let store = CredentialStore::in_memory("Macaroons-test");
        let visit = Arc::new(FnVisit::new(|_| Ok(())));
        let engine = DischargeEngine::new(transport.clone(), store.clone(), visit, None, 1);
        AuthChallengeHandler::new(transport, store, engine, 1)
    }

    fn challenge(root: &Macaroon) -> HttpResponse {
        HttpResponse::new(401)
            .with_header("WWW-Authenticate", "Macaroon")
            .with_body(serde_json::json!({"Info": {"Macaroon": root}}).to_string())
    }

    #[test]
    fn test_challenge_state_requires_all_conditions() {
        let plain = Macaroon::new(b"k", "id", "gui");
        assert_eq!(ChallengeState::of(&challenge(&plain), true), ChallengeState::Challenged);
        assert_eq!(ChallengeState::of(&challenge(&plain), false), ChallengeState::Direct);
        assert_eq!(
            ChallengeState::of(&HttpResponse::new(401), true),
            ChallengeState::Direct
        );
        let other = HttpResponse::new(401).with_header("WWW-Authenticate", "Basic");
        assert_eq!(ChallengeState::of(&other, true), ChallengeState::Direct);
        let forbidden = HttpResponse::new(403).with_header("WWW-Authenticate", "Macaroon");
        assert_eq!(ChallengeState::of(&forbidden, true), ChallengeState::Direct);
    }

    #[test]
    fn test_decorate_adds_headers() {
        let transport = Arc::new(RecordingTransport::new());
        let handler = handler(transport);
        let get = handler.decorate(Method::GET, "/api/foo", None);
        assert_eq!(get.header("Bakery-Protocol-Version"), Some("1"));
        assert!(get.header("Macaroons").is_none());
        assert!(get.header("Content-Type").is_none());

        let set = MacaroonSet::new(Macaroon::new(b"k", "id", "gui"));
        handler.store().set_macaroon(&set).unwrap();
        let post = handler.decorate(Method::POST, "/api/foo", Some("{}"));
        assert_eq!(post.header("Macaroons"), Some(set.encode().unwrap().as_str()));
        assert_eq!(post.header("Content-Type"), Some(JSON_CONTENT_TYPE));
        assert_eq!(post.body.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_direct_responses_route_by_status() {
        let transport = Arc::new(RecordingTransport::new());
        transport
            .reply(HttpResponse::new(200).with_body("ok"))
            .reply(HttpResponse::new(404));
        let handler = handler(Arc::clone(&transport));

        let ok = handler.dispatch(Method::GET, "/a", None, true).await.unwrap();
        assert_eq!(ok.body, "ok");
        let err = handler.dispatch(Method::GET, "/b", None, true).await.unwrap_err();
        assert_eq!(err.response().map(|r| r.status), Some(404));
    }

    #[tokio::test]
    async fn test_challenge_discharges_and_replays_once() {
        let root = Macaroon::new(b"k", "id", "gui");
        let transport = Arc::new(RecordingTransport::new());
        transport
            .reply(challenge(&root))
            .reply(HttpResponse::new(200).with_body("done"));
        let handler = handler(Arc::clone(&transport));

        let response = handler
            .dispatch(Method::POST, "/api/foo", Some(r#"{"a":1}"#), true)
            .await
            .unwrap();
        assert_eq!(response.body, "done");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].header("Macaroons").is_none());
        assert_eq!(requests[1].method, Method::POST);
        assert_eq!(requests[1].body.as_deref(), Some(r#"{"a":1}"#));
        let expected = MacaroonSet::new(root).encode().unwrap();
        assert_eq!(requests[1].header("Macaroons"), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_second_challenge_is_a_failure() {
        let root = Macaroon::new(b"k", "id", "gui");
        let transport = Arc::new(RecordingTransport::new());
        transport.reply(challenge(&root)).reply(challenge(&root));
        let handler = handler(Arc::clone(&transport));

        let err = handler
            .dispatch(Method::GET, "/api/foo", None, true)
            .await
            .unwrap_err();
        assert_eq!(err.response().map(|r| r.status), Some(401));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_no_redirect_surfaces_challenge() {
        let root = Macaroon::new(b"k", "id", "gui");
        let transport = Arc::new(RecordingTransport::new());
        transport.reply(challenge(&root));
        let handler = handler(Arc::clone(&transport));

        let err = handler
            .dispatch(Method::GET, "/api/foo", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Status { .. }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_challenge_is_discharge_failure() {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply(
            HttpResponse::new(401)
                .with_header("WWW-Authenticate", "Macaroon")
                .with_body("{}"),
        );
        let handler = handler(Arc::clone(&transport));

        let err = handler
            .dispatch(Method::GET, "/api/foo", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Discharge(_)));
        assert_eq!(transport.requests().len(), 1);
    }
}
