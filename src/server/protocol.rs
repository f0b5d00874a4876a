//! HTTP vs. WebSocket decision for a freshly parsed request.

use crate::http::{Request, Response};
use crate::realtime::handshake;

/// What the connection should do with a request.
#[derive(Debug)]
pub enum Decision {
    /// Write this `101` response and switch the connection to WebSocket framing.
    Upgrade(Response),
    /// Serve the request over plain HTTP.
    Http,
}

/// Attempts the WebSocket handshake; any failed precondition falls through
/// to ordinary HTTP handling instead of closing the connection.
pub fn decide(request: &Request) -> Decision {
    if !handshake::wants_upgrade(request) {
        return Decision::Http;
    }
    match handshake::handshake(request) {
        Ok(response) => Decision::Upgrade(response),
        Err(e) => {
            tracing::debug!(path = request.path(), error = %e, "handshake failed, serving as HTTP");
            Decision::Http
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn parse(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[test]
    fn plain_request_is_http() {
        let req = parse("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(decide(&req), Decision::Http));
    }

    #[test]
    fn valid_upgrade() {
        let req = parse(
            "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        match decide(&req) {
            Decision::Upgrade(res) => assert_eq!(res.status_code(), StatusCode::SWITCHING_PROTOCOLS),
            Decision::Http => panic!("expected upgrade"),
        }
    }

    #[test]
    fn failed_handshake_falls_through() {
        let req = parse("GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");
        assert!(matches!(decide(&req), Decision::Http));
    }
}
