//! Skips wiremock-backed tests on hosts that refuse loopback sockets.

use std::net::TcpListener;

use wiremock::MockServer;

const REQUIRE_SOCKETS_ENV: &str = "BAKERY_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_SOCKETS_ENV)
        .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` when no loopback socket can be bound.
///
/// Panics instead of skipping when `BAKERY_REQUIRE_SOCKET_TESTS` is set.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if let Err(e) = TcpListener::bind("127.0.0.1:0") {
        let message = format!("[socket-bound-test] loopback bind failed: {e}");
        assert!(
            !sockets_required(),
            "{message}; unset {REQUIRE_SOCKETS_ENV} to allow skipping"
        );
        eprintln!("{message}; skipping. Set {REQUIRE_SOCKETS_ENV}=1 to fail instead.");
        return None;
    }
    Some(MockServer::start().await)
}
