//! End-to-end CLI tests for the bakery binary.

use assert_cmd::Command;
use predicates::prelude::*;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

fn bakery() -> Command {
    let mut cmd = Command::cargo_bin("bakery").unwrap();
    cmd.env_remove("BAKERY_AUTH").env_remove("RUST_LOG");
    cmd
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    bakery()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Send HTTP requests with macaroon authorization",
        ));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    bakery()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bakery"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    bakery()
        .args(["--invalid-flag", "logout"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_requires_subcommand() {
    bakery()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_binary_non_interactive_without_auth_fails() {
    bakery()
        .args(["--non-interactive", "get", "http://127.0.0.1:9/x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("auth credential"));
}

#[test]
fn test_binary_logout_with_persistent_store() {
    let config_home = tempfile::TempDir::new().unwrap();
    bakery()
        .env("XDG_CONFIG_HOME", config_home.path())
        .env("HOME", config_home.path())
        .env("BAKERY_MASTER_KEY", "test-master-key")
        .args(["-q", "--service", "test", "--persist", "logout"])
        .assert()
        .success();
}

#[test]
fn test_binary_logout_recovers_from_corrupt_credential_file() {
    let config_home = tempfile::TempDir::new().unwrap();
    let credentials = config_home.path().join("bakery").join("credentials.enc");
    std::fs::create_dir_all(credentials.parent().unwrap()).unwrap();
    std::fs::write(&credentials, b"BKC1truncated").unwrap();

    bakery()
        .env("XDG_CONFIG_HOME", config_home.path())
        .env("BAKERY_MASTER_KEY", "test-master-key")
        .args(["-q", "--service", "test", "--persist", "logout"])
        .assert()
        .success();
    assert!(!credentials.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_get_prints_response_body() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .and(header("Bakery-Protocol-Version", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/api/status", server.uri());
    tokio::task::spawn_blocking(move || {
        bakery()
            .args(["-q", "get", &url])
            .assert()
            .success()
            .stdout(predicate::str::contains("{\"ok\":true}"));
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_post_with_base_url_sends_data() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("POST"))
        .and(path("/api/items"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("created"))
        .expect(1)
        .mount(&server)
        .await;

    let base_url = server.uri();
    tokio::task::spawn_blocking(move || {
        bakery()
            .args([
                "-q",
                "--base-url",
                &base_url,
                "post",
                "/api/items",
                "--data",
                "{\"name\":\"x\"}",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("created"));
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_error_status_exits_non_zero() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("DELETE"))
        .and(path("/api/items/1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let url = format!("{}/api/items/1", server.uri());
    tokio::task::spawn_blocking(move || {
        bakery()
            .args(["-q", "delete", &url])
            .assert()
            .failure()
            .stdout(predicate::str::contains("not found"))
            .stderr(predicate::str::contains("status 404"));
    })
    .await
    .unwrap();
}
