//! The public request surface.
//!
//! [`Bakery`] decorates every request with the bakery protocol headers and the
//! stored macaroons, and transparently discharges 401 macaroon challenges.
//! Verb methods are plain futures (drop to cancel); [`Bakery::spawn_request`]
//! returns a [`RequestHandle`] for callers that want an abortable task.

use std::fmt;
use std::sync::Arc;

use reqwest::Method;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::challenge::{AuthChallengeHandler, route};
use crate::config::{BakeryConfig, ConfigError};
use crate::discharge::DischargeEngine;
use crate::error::{BuildError, DischargeError, RequestError};
use crate::macaroon::{Macaroon, MacaroonSet};
use crate::sealing::{BoxCrypto, CaveatSealer, KEY_LEN, KeyPair, SealError};
use crate::store::{CredentialStore, KeyValueStore, MemoryStore, StoreError};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::visit::{BrowserVisit, NonInteractiveVisit, VisitStrategy};

/// Builder for [`Bakery`].
///
/// Anything not supplied gets a default: a [`ReqwestTransport`], an in-memory
/// store, and a visit strategy chosen from the config.
pub struct BakeryBuilder {
    config: BakeryConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    macaroon_store: Option<Arc<dyn KeyValueStore>>,
    discharge_store: Option<Arc<dyn KeyValueStore>>,
    visit: Option<Arc<dyn VisitStrategy>>,
    box_crypto: Option<Arc<dyn BoxCrypto>>,
}

impl fmt::Debug for BakeryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BakeryBuilder")
            .field("service_name", &self.config.service_name)
            .finish_non_exhaustive()
    }
}

impl BakeryBuilder {
    /// Starts a builder from a config.
    #[must_use]
    pub fn new(config: BakeryConfig) -> Self {
        Self {
            config,
            transport: None,
            macaroon_store: None,
            discharge_store: None,
            visit: None,
            box_crypto: None,
        }
    }

    /// Uses `transport` for every HTTP exchange.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Keeps both the macaroon set and the discharge token in `store`.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.macaroon_store = Some(Arc::clone(&store));
        self.discharge_store = Some(store);
        self
    }

    /// Keeps the macaroon set in `store`.
    #[must_use]
    pub fn macaroon_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.macaroon_store = Some(store);
        self
    }

    /// Keeps the discharge token in `store`.
    #[must_use]
    pub fn discharge_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.discharge_store = Some(store);
        self
    }

    /// Overrides the visit strategy selected from the config.
    #[must_use]
    pub fn visit_strategy(mut self, visit: Arc<dyn VisitStrategy>) -> Self {
        self.visit = Some(visit);
        self
    }

    /// Replaces the NaCl box implementation used for caveat sealing.
    #[must_use]
    pub fn box_crypto(mut self, crypto: Arc<dyn BoxCrypto>) -> Self {
        self.box_crypto = Some(crypto);
        self
    }

    /// Validates the config and assembles the bakery.
    ///
    /// Initial `macaroon` and `discharge_token` values are written to the
    /// stores unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] for invalid settings, a transport that cannot be
    /// created, or initial credentials that cannot be stored.
    pub fn build(self) -> Result<Bakery, BuildError> {
        let config = self.config;
        config.validate()?;

        let visit: Arc<dyn VisitStrategy> = match self.visit {
            Some(visit) => visit,
            None if config.interactive => Arc::new(BrowserVisit),
            None => {
                let auth = config.auth.clone().ok_or(ConfigError::MissingAuth)?;
                Arc::new(NonInteractiveVisit::new(auth, config.login_method.clone()))
            }
        };
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let macaroon_store = self
            .macaroon_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let discharge_store = self
            .discharge_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let store = CredentialStore::with_stores(macaroon_store, discharge_store, config.cookie_name());
        if let Some(macaroon) = config.macaroon.as_deref().filter(|m| !m.is_empty()) {
            store.set_raw_macaroon(macaroon)?;
        }
        if let Some(token) = config.discharge_token.as_deref().filter(|t| !t.is_empty()) {
            store.set_raw_discharge_token(token)?;
        }

        let engine = DischargeEngine::new(
            Arc::clone(&transport),
            store.clone(),
            visit,
            config.set_cookie_path.clone(),
            config.protocol_version,
        );
        let handler = AuthChallengeHandler::new(transport, store, engine, config.protocol_version);
        let sealer = self.box_crypto.map(CaveatSealer::new).unwrap_or_default();

        info!(service = %config.service_name, interactive = config.interactive, "bakery ready");
        Ok(Bakery {
            handler,
            discharge_disabled: false,
            static_macaroon_path: config.static_macaroon_path,
            sealer,
        })
    }
}

/// Macaroon-aware HTTP client.
///
/// Cheap to clone; clones share the transport, stores, and visit strategy.
#[derive(Clone)]
pub struct Bakery {
    handler: AuthChallengeHandler,
    discharge_disabled: bool,
    static_macaroon_path: Option<String>,
    sealer: CaveatSealer,
}

impl fmt::Debug for Bakery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bakery")
            .field("handler", &self.handler)
            .field("discharge_disabled", &self.discharge_disabled)
            .field("static_macaroon_path", &self.static_macaroon_path)
            .finish_non_exhaustive()
    }
}

impl Bakery {
    /// Starts a [`BakeryBuilder`].
    #[must_use]
    pub fn builder(config: BakeryConfig) -> BakeryBuilder {
        BakeryBuilder::new(config)
    }

    /// Builds a bakery with all defaults.
    ///
    /// # Errors
    ///
    /// See [`BakeryBuilder::build`].
    pub fn new(config: BakeryConfig) -> Result<Self, BuildError> {
        BakeryBuilder::new(config).build()
    }

    /// Returns a bakery sharing this one's state whose requests never run
    /// the challenge flow.
    #[must_use]
    pub fn without_discharge(&self) -> Self {
        Self {
            discharge_disabled: true,
            ..self.clone()
        }
    }

    /// Sends a GET request.
    ///
    /// # Errors
    ///
    /// See [`Bakery::send_request`].
    pub async fn send_get_request(
        &self,
        path: &str,
        redirect: bool,
    ) -> Result<HttpResponse, RequestError> {
        self.send_request(Method::GET, path, None, redirect).await
    }

    /// Sends a POST request with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`Bakery::send_request`].
    pub async fn send_post_request(
        &self,
        path: &str,
        data: &str,
        redirect: bool,
    ) -> Result<HttpResponse, RequestError> {
        self.send_request(Method::POST, path, Some(data), redirect)
            .await
    }

    /// Sends a PUT request with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`Bakery::send_request`].
    pub async fn send_put_request(
        &self,
        path: &str,
        data: &str,
        redirect: bool,
    ) -> Result<HttpResponse, RequestError> {
        self.send_request(Method::PUT, path, Some(data), redirect)
            .await
    }

    /// Sends a PATCH request with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`Bakery::send_request`].
    pub async fn send_patch_request(
        &self,
        path: &str,
        data: &str,
        redirect: bool,
    ) -> Result<HttpResponse, RequestError> {
        self.send_request(Method::PATCH, path, Some(data), redirect)
            .await
    }

    /// Sends a DELETE request.
    ///
    /// # Errors
    ///
    /// See [`Bakery::send_request`].
    pub async fn send_delete_request(
        &self,
        path: &str,
        redirect: bool,
    ) -> Result<HttpResponse, RequestError> {
        self.send_request(Method::DELETE, path, None, redirect)
            .await
    }

    /// Sends a request with the protocol headers and stored macaroons.
    ///
    /// With `redirect` set (and discharge not disabled) a 401 macaroon
    /// challenge is discharged and the request replayed once.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Status`] for final responses of 400 and above,
    /// [`RequestError::Transport`] when nothing was received, and
    /// [`RequestError::Discharge`] when a challenge could not be discharged.
    pub async fn send_request(
        &self,
        method: Method,
        path: &str,
        data: Option<&str>,
        redirect: bool,
    ) -> Result<HttpResponse, RequestError> {
        let redirect = redirect && !self.discharge_disabled;
        self.handler.dispatch(method, path, data, redirect).await
    }

    /// Runs a request on its own task.
    ///
    /// Aborting the returned handle cancels delivery of the result; a
    /// discharge already under way still completes and persists.
    #[must_use]
    pub fn spawn_request(
        &self,
        method: Method,
        path: impl Into<String>,
        data: Option<String>,
        redirect: bool,
    ) -> RequestHandle {
        let bakery = self.clone();
        let path = path.into();
        let task = tokio::spawn(async move {
            bakery
                .send_request(method, &path, data.as_deref(), redirect)
                .await
        });
        RequestHandle { task }
    }

    /// Discharges `root` and stores the resulting set.
    ///
    /// # Errors
    ///
    /// Returns [`DischargeError`] when any step fails; nothing is stored then.
    pub async fn discharge(&self, root: Macaroon) -> Result<MacaroonSet, DischargeError> {
        self.handler.engine().discharge_and_store(root).await
    }

    /// Returns the stored macaroon set, fetching and discharging the one at
    /// the static macaroon path when nothing is stored yet.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::NotConfigured`] when there is no stored set
    /// and no static path, [`RequestError::Status`] when the path answers
    /// with an error, and [`RequestError::Discharge`] when the response is
    /// not a macaroon or cannot be discharged.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_macaroon_from_static_path(&self) -> Result<MacaroonSet, RequestError> {
        if let Some(set) = self.get_macaroon().map_err(DischargeError::from)? {
            return Ok(set);
        }
        let Some(path) = self.static_macaroon_path.as_deref() else {
            return Err(RequestError::NotConfigured("static macaroon path"));
        };

        debug!(path, "fetching static macaroon");
        let response = self
            .handler
            .transport()
            .send(HttpRequest::new(Method::GET, path))
            .await?;
        let response = route(path, response)?;
        let root: Macaroon = response
            .json()
            .map_err(|e| DischargeError::new(format!("cannot parse static macaroon: {e}")))?;
        Ok(self.discharge(root).await?)
    }

    /// The stored macaroon set, if complete and valid.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing store fails.
    pub fn get_macaroon(&self) -> Result<Option<MacaroonSet>, StoreError> {
        self.handler.store().get_macaroon()
    }

    /// The stored discharge token in header form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backing store fails.
    pub fn get_discharge_token(&self) -> Result<Option<String>, StoreError> {
        self.handler.store().get_discharge_token()
    }

    /// Logs out: removes the macaroon set and the discharge token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when either removal fails.
    pub fn clear_cookie(&self) -> Result<(), StoreError> {
        self.handler.store().clear_cookie()
    }

    /// The credential store.
    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        self.handler.store()
    }

    /// Seals a third-party caveat for another discharger.
    ///
    /// # Errors
    ///
    /// See [`CaveatSealer::add_third_party_caveat`].
    pub fn add_third_party_caveat(
        &self,
        macaroon: &mut Macaroon,
        condition: &str,
        location: &str,
        third_party_public: &[u8; KEY_LEN],
        my_keys: &KeyPair,
    ) -> Result<(), SealError> {
        self.sealer.add_third_party_caveat(
            macaroon,
            condition,
            location,
            third_party_public,
            my_keys,
        )
    }

    /// Discharges a caveat sealed for `my_keys`.
    ///
    /// # Errors
    ///
    /// See [`CaveatSealer::discharge_third_party_caveat`].
    pub fn discharge_third_party_caveat<F>(
        &self,
        caveat_id: &str,
        my_keys: &KeyPair,
        check: F,
    ) -> Result<Macaroon, SealError>
    where
        F: FnOnce(&str) -> Result<(), String>,
    {
        self.sealer
            .discharge_third_party_caveat(caveat_id, my_keys, check)
    }
}

/// Handle to a request started with [`Bakery::spawn_request`].
#[derive(Debug)]
pub struct RequestHandle {
    task: JoinHandle<Result<HttpResponse, RequestError>>,
}

impl RequestHandle {
    /// Cancels the request. Its result is never delivered.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Returns true once the request has completed or been aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the result; `None` if the request was aborted.
    pub async fn wait(self) -> Option<Result<HttpResponse, RequestError>> {
        match self.task.await {
            Ok(result) => Some(result),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use super::*;
    use crate::transport::TransportError;
    use crate::transport::testing::RecordingTransport;
    use crate::visit::FnVisit;

    fn config() -> BakeryConfig {
        BakeryConfig::new("test")
    }

    fn bakery(transport: Arc<RecordingTransport>) -> Bakery {
        Bakery::builder(config())
            .transport(transport)
            .visit_strategy(Arc::new(FnVisit::new(|_| Ok(()))))
            .build()
            .unwrap()
    }

    fn challenge(root: &Macaroon) -> HttpResponse {
        HttpResponse::new(401)
            .with_header("WWW-Authenticate", "Macaroon")
            .with_body(serde_json::json!({"Info": {"Macaroon": root}}).to_string())
    }

    #[test]
    fn test_build_stores_initial_credentials() {
        let store = Arc::new(MemoryStore::new());
        let mut config = config();
        config.macaroon = Some("foo-bar".to_string());
        config.discharge_token = Some("discharge-foo".to_string());
        Bakery::builder(config)
            .transport(Arc::new(RecordingTransport::new()))
            .store(store.clone())
            .build()
            .unwrap();

        assert_eq!(store.get("Macaroons-test").unwrap().as_deref(), Some("foo-bar"));
        assert_eq!(
            store.get("discharge-token").unwrap().as_deref(),
            Some("discharge-foo")
        );
    }

    #[test]
    fn test_build_uses_existing_cookie_name() {
        let store = Arc::new(MemoryStore::new());
        let mut config = config();
        config.existing_cookie = Some("existing-cookie".to_string());
        config.macaroon = Some("foo-bar".to_string());
        let bakery = Bakery::builder(config)
            .transport(Arc::new(RecordingTransport::new()))
            .store(store.clone())
            .build()
            .unwrap();

        assert_eq!(store.get("existing-cookie").unwrap().as_deref(), Some("foo-bar"));
        bakery.clear_cookie().unwrap();
        assert!(store.get("existing-cookie").unwrap().is_none());
    }

    #[test]
    fn test_non_interactive_without_auth_is_rejected() {
        let mut config = config();
        config.interactive = false;
        let result = Bakery::builder(config)
            .transport(Arc::new(RecordingTransport::new()))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::MissingAuth))
        ));
    }

    #[test]
    fn test_missing_service_name_is_rejected() {
        let result = Bakery::builder(BakeryConfig::new(""))
            .transport(Arc::new(RecordingTransport::new()))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::MissingServiceName))
        ));
    }

    #[tokio::test]
    async fn test_verbs_use_their_methods() {
        let transport = Arc::new(RecordingTransport::new());
        for _ in 0..5 {
            transport.reply(HttpResponse::new(200));
        }
        let bakery = bakery(Arc::clone(&transport));

        bakery.send_get_request("/a", true).await.unwrap();
        bakery.send_post_request("/a", "{}", true).await.unwrap();
        bakery.send_put_request("/a", "{}", true).await.unwrap();
        bakery.send_patch_request("/a", "{}", true).await.unwrap();
        bakery.send_delete_request("/a", true).await.unwrap();

        let methods: Vec<Method> = transport.requests().into_iter().map(|r| r.method).collect();
        assert_eq!(
            methods,
            vec![Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE]
        );
        let requests = transport.requests();
        assert!(requests[0].header("Content-Type").is_none());
        assert!(requests[4].header("Content-Type").is_none());
        for write in &requests[1..4] {
            assert_eq!(write.header("Content-Type"), Some("application/json"));
        }
    }

    #[tokio::test]
    async fn test_without_discharge_surfaces_challenge() {
        let root = Macaroon::new(b"k", "id", "gui");
        let transport = Arc::new(RecordingTransport::new());
        transport.reply(challenge(&root));
        let bakery = bakery(Arc::clone(&transport)).without_discharge();

        let err = bakery.send_get_request("/api", true).await.unwrap_err();
        assert_eq!(err.response().map(|r| r.status), Some(401));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_cookie_drops_macaroons_header() {
        let root = Macaroon::new(b"k", "id", "gui");
        let transport = Arc::new(RecordingTransport::new());
        transport
            .reply(challenge(&root))
            .reply(HttpResponse::new(200))
            .reply(HttpResponse::new(200));
        let bakery = bakery(Arc::clone(&transport));

        bakery.send_get_request("/api", true).await.unwrap();
        assert!(bakery.get_macaroon().unwrap().is_some());

        bakery.clear_cookie().unwrap();
        assert!(bakery.get_macaroon().unwrap().is_none());
        bakery.send_get_request("/api", true).await.unwrap();
        assert!(transport.requests()[2].header("Macaroons").is_none());
    }

    #[tokio::test]
    async fn test_static_path_returns_stored_set_without_request() {
        let transport = Arc::new(RecordingTransport::new());
        let bakery = bakery(Arc::clone(&transport));
        let set = MacaroonSet::new(Macaroon::new(b"k", "id", "gui"));
        bakery.store().set_macaroon(&set).unwrap();

        assert_eq!(bakery.fetch_macaroon_from_static_path().await.unwrap(), set);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_static_path_not_defined() {
        let bakery = bakery(Arc::new(RecordingTransport::new()));
        let err = bakery.fetch_macaroon_from_static_path().await.unwrap_err();
        assert_eq!(err.to_string(), "static macaroon path was not defined");
    }

    #[tokio::test]
    async fn test_static_path_fetches_and_discharges() {
        let root = Macaroon::new(b"k", "id", "gui");
        let transport = Arc::new(RecordingTransport::new());
        transport.reply(HttpResponse::new(200).with_body(serde_json::to_string(&root).unwrap()));
        let mut config = config();
        config.static_macaroon_path = Some("path/to/macaroon".to_string());
        let bakery = Bakery::builder(config)
            .transport(transport.clone())
            .build()
            .unwrap();

        let set = bakery.fetch_macaroon_from_static_path().await.unwrap();
        assert_eq!(set.root(), &root);
        assert_eq!(bakery.get_macaroon().unwrap(), Some(set));

        let request = &transport.requests()[0];
        assert_eq!(request.url, "path/to/macaroon");
        assert!(request.headers.is_empty());
    }

    #[tokio::test]
    async fn test_static_path_invalid_json() {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply(HttpResponse::new(200).with_body("invalidjson"));
        let mut config = config();
        config.static_macaroon_path = Some("path/to/macaroon".to_string());
        let bakery = Bakery::builder(config)
            .transport(transport)
            .build()
            .unwrap();

        let err = bakery.fetch_macaroon_from_static_path().await.unwrap_err();
        assert!(matches!(err, RequestError::Discharge(_)));
        assert!(bakery.get_macaroon().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discharge_token_from_config_is_sent() {
        let mut root = Macaroon::new(b"root", "id", "gui");
        root.add_third_party_caveat(b"tp", "cond", "https://idp").unwrap();
        let discharge = Macaroon::new(b"tp", "cond", "https://idp");

        let transport = Arc::new(RecordingTransport::new());
        transport
            .reply(challenge(&root))
            .reply(HttpResponse::new(200).with_body(
                serde_json::json!({"Macaroon": discharge, "DischargeToken": "discharge-foo"})
                    .to_string(),
            ))
            .reply(HttpResponse::new(200));
        let mut config = config();
        config.discharge_token = Some("initial".to_string());
        let bakery = Bakery::builder(config)
            .transport(transport.clone())
            .build()
            .unwrap();

        bakery.send_get_request("/api", true).await.unwrap();
        assert_eq!(transport.requests()[1].header("Macaroons"), Some("initial"));
        assert_eq!(
            bakery.get_discharge_token().unwrap(),
            Some(STANDARD.encode("\"discharge-foo\""))
        );
    }

    struct SlowTransport;

    #[async_trait]
    impl HttpTransport for SlowTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HttpResponse::new(200))
        }
    }

    #[tokio::test]
    async fn test_aborted_request_yields_nothing() {
        let bakery = Bakery::builder(config())
            .transport(Arc::new(SlowTransport))
            .visit_strategy(Arc::new(FnVisit::new(|_| Ok(()))))
            .build()
            .unwrap();

        let handle = bakery.spawn_request(Method::GET, "/slow", None, true);
        handle.abort();
        assert!(handle.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_spawned_request_delivers_result() {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply(HttpResponse::new(200).with_body("hi"));
        let bakery = bakery(transport);

        let handle = bakery.spawn_request(Method::GET, "/a", None, true);
        let response = handle.wait().await.unwrap().unwrap();
        assert_eq!(response.body, "hi");
    }
}
