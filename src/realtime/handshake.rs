//! WebSocket opening handshake (RFC 6455 §4.2).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::{Request, Response, StatusCode};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing `Upgrade: websocket` header")]
    MissingUpgrade,

    #[error("`Connection` header does not contain the `upgrade` token")]
    MissingConnectionUpgrade,

    #[error("missing or empty `Sec-WebSocket-Key` header")]
    MissingKey,
}

/// Computes `Sec-WebSocket-Accept` for a client key:
/// `base64(SHA-1(key + GUID))`.
///
/// ```
/// use socketry::realtime::handshake::accept_key;
///
/// assert_eq!(
///     accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Returns `true` when the request asks for a protocol upgrade at all.
pub fn wants_upgrade(req: &Request) -> bool {
    req.header("upgrade").is_some()
}

/// Validates an upgrade request and builds the `101 Switching Protocols` reply.
pub fn handshake(req: &Request) -> Result<Response, HandshakeError> {
    let upgrade = req.header("upgrade").map(str::trim);
    if !upgrade.is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        return Err(HandshakeError::MissingUpgrade);
    }

    let connection = req.header("connection").unwrap_or_default();
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let key = req
        .header("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    let mut response = Response::new(StatusCode::SWITCHING_PROTOCOLS);
    response
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(key));
    Ok(response)
}
