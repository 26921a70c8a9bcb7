//! Mock bakery endpoints shared by the integration tests.

use std::sync::Arc;

use bakery_client::{FnVisit, Macaroon, VisitError, VisitStrategy};
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Root key of the protected service.
pub const ROOT_KEY: &[u8] = b"root key";
/// Root key shared with the mock discharger.
pub const CAVEAT_KEY: &[u8] = b"tp key";
/// Condition the mock discharger vouches for.
pub const CONDITION: &str = "is-user";

/// A root macaroon whose single third-party caveat is discharged at `server`.
pub fn root_macaroon(server: &MockServer) -> Macaroon {
    let mut root = Macaroon::new(ROOT_KEY, "root id", server.uri());
    root.add_third_party_caveat(CAVEAT_KEY, CONDITION, &server.uri())
        .unwrap();
    root
}

/// The unbound discharge for [`root_macaroon`].
pub fn discharge_macaroon(server: &MockServer) -> Macaroon {
    Macaroon::new(CAVEAT_KEY, CONDITION, server.uri())
}

/// A `401` macaroon challenge carrying `root`.
pub fn challenge_for(root: &Macaroon) -> ResponseTemplate {
    ResponseTemplate::new(401)
        .insert_header("WWW-Authenticate", "Macaroon")
        .set_body_json(serde_json::json!({ "Info": { "Macaroon": root } }))
}

/// A challenge carrying [`root_macaroon`].
pub fn challenge(server: &MockServer) -> ResponseTemplate {
    challenge_for(&root_macaroon(server))
}

/// A successful discharge response.
pub fn discharge_response(discharge: &Macaroon) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "Macaroon": discharge }))
}

/// Serves `body` to requests carrying macaroons and challenges all others with `root`.
pub async fn mount_protected(server: &MockServer, route: &str, body: &str, root: &Macaroon) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(header_exists("Macaroons"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(challenge_for(root))
        .with_priority(5)
        .mount(server)
        .await;
}

/// A visit strategy for flows that must not need a login.
pub fn no_visit() -> Arc<dyn VisitStrategy> {
    Arc::new(FnVisit::new(|_| {
        Err(VisitError::Other("unexpected visit".to_string()))
    }))
}
