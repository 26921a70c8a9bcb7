//! Integration tests for sealed third-party caveats discharged over HTTP.

use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, Request, ResponseTemplate};

use bakery_client::{
    Bakery, BakeryConfig, KeyPair, Macaroon, ReqwestTransport, SealError, add_third_party_caveat,
    discharge_third_party_caveat,
};
mod support;
use support::bakery_server::{mount_protected, no_visit};
use support::socket_guard::start_mock_server_or_skip;

fn form_field(request: &Request, name: &str) -> Option<String> {
    url::form_urlencoded::parse(&request.body)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[test]
fn test_sealed_caveat_discharge_verifies_against_root() {
    let target = KeyPair::generate();
    let discharger = KeyPair::generate();

    let mut root = Macaroon::new(b"service root key", "op-1", "https://service");
    root.add_first_party_caveat("time-before 2100-01-01");
    add_third_party_caveat(
        &mut root,
        "is-authenticated-user",
        "https://idp",
        &discharger.public,
        &target,
    )
    .unwrap();

    let caveat = root.third_party_caveats().next().unwrap().clone();
    let mut discharge = discharge_third_party_caveat(&caveat.id, &discharger, |condition| {
        if condition == "is-authenticated-user" {
            Ok(())
        } else {
            Err(format!("unknown condition {condition}"))
        }
    })
    .unwrap();
    discharge.bind(root.signature());

    assert!(
        root.verify(b"service root key", |_| Ok(()), &[discharge])
            .is_ok()
    );
}

#[test]
fn test_wrong_discharger_cannot_open_caveat() {
    let target = KeyPair::generate();
    let discharger = KeyPair::generate();
    let intruder = KeyPair::generate();

    let mut root = Macaroon::new(b"k", "id", "https://service");
    add_third_party_caveat(&mut root, "cond", "https://idp", &discharger.public, &target).unwrap();
    let caveat = root.third_party_caveats().next().unwrap().clone();

    let err = discharge_third_party_caveat(&caveat.id, &intruder, |_| Ok(())).unwrap_err();
    assert!(matches!(err, SealError::PublicKeyMismatch));
}

#[tokio::test]
async fn test_client_discharges_sealed_caveat_from_remote_discharger() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let target = KeyPair::generate();
    let discharger = KeyPair::generate();

    let mut root = Macaroon::new(b"service root key", "op-1", server.uri());
    add_third_party_caveat(
        &mut root,
        "is-authenticated-user",
        &server.uri(),
        &discharger.public,
        &target,
    )
    .unwrap();

    mount_protected(&server, "/api/resource", "ok", &root).await;
    let discharger_keys = discharger.clone();
    Mock::given(method("POST"))
        .and(path("/discharge"))
        .respond_with(move |request: &Request| {
            let Some(id) = form_field(request, "id") else {
                return ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({ "Message": "missing id" }));
            };
            match discharge_third_party_caveat(&id, &discharger_keys, |_| Ok(())) {
                Ok(discharge) => ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "Macaroon": discharge })),
                Err(e) => ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({ "Message": e.to_string() })),
            }
        })
        .expect(1)
        .mount(&server)
        .await;

    let bakery = Bakery::builder(BakeryConfig::new("sealed"))
        .transport(Arc::new(ReqwestTransport::new().unwrap()))
        .visit_strategy(no_visit())
        .build()
        .unwrap();

    let response = bakery
        .send_get_request(&format!("{}/api/resource", server.uri()), true)
        .await
        .unwrap();
    assert_eq!(response.body, "ok");

    let set = bakery.get_macaroon().unwrap().expect("stored set");
    assert!(
        set.root()
            .verify(b"service root key", |_| Ok(()), set.discharges())
            .is_ok()
    );
}
