//! Real-time communication over WebSocket (RFC 6455).
//!
//! - [`frame`]: wire codec for data and control frames.
//! - [`handshake`]: validation of the upgrade request and the `101` reply.
//! - [`registry`]: the set of open clients, with broadcast.
//!
//! Application code plugs in through [`WebSocketHandler`]. The server calls
//! [`on_open`](WebSocketHandler::on_open) once the handshake has been written,
//! [`on_message`](WebSocketHandler::on_message) for every complete (possibly
//! reassembled) data message, and [`on_close`](WebSocketHandler::on_close)
//! exactly once when the session ends, whatever the reason.

pub mod frame;
pub mod handshake;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

pub use frame::{Frame, FrameError, Opcode};
pub use handshake::{HandshakeError, accept_key};
pub use registry::{ClientGone, ClientHandle, ClientRegistry, Outbound};

use crate::http::Request;
use crate::server::ConnectionId;

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }
}

/// Everything a handler needs to talk back to its client and to the others.
#[derive(Debug, Clone)]
pub struct WsContext {
    id: ConnectionId,
    peer: SocketAddr,
    request: Arc<Request>,
    handle: ClientHandle,
    registry: Arc<ClientRegistry>,
}

impl WsContext {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        request: Arc<Request>,
        handle: ClientHandle,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            id,
            peer,
            request,
            handle,
            registry,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The upgrade request that opened this session.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Sends a text frame to this client only.
    pub fn send_text(&self, text: &str) -> Result<(), ClientGone> {
        self.handle.send_text(text)
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), ClientGone> {
        self.handle.send_binary(data)
    }

    /// Sends a text frame to every open client, this one included.
    pub fn broadcast(&self, text: &str) -> usize {
        self.registry.broadcast(text)
    }

    /// Starts the closing handshake for this client.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), ClientGone> {
        self.handle.close(code, reason)
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }
}

/// Application callbacks for WebSocket sessions.
///
/// Callbacks run on the session's task and must not block for long; send
/// operations only queue frames and never wait on the socket.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn on_open(&self, _ctx: &WsContext) {}

    fn on_message(&self, ctx: &WsContext, message: Message);

    fn on_close(&self, _ctx: &WsContext, _code: Option<u16>) {}
}

/// Acknowledges every text message to its sender, then relays it to all clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoBroadcast;

impl WebSocketHandler for EchoBroadcast {
    fn on_open(&self, ctx: &WsContext) {
        tracing::info!(id = %ctx.id(), peer = %ctx.peer_addr(), "websocket client connected");
    }

    fn on_message(&self, ctx: &WsContext, message: Message) {
        match message {
            Message::Text(text) => {
                if ctx.send_text(&format!("Server received: {text}")).is_err() {
                    return;
                }
                ctx.broadcast(&text);
            }
            Message::Binary(data) => {
                let _ = ctx.send_binary(&data);
            }
        }
    }

    fn on_close(&self, ctx: &WsContext, code: Option<u16>) {
        tracing::info!(id = %ctx.id(), ?code, "websocket client disconnected");
    }
}
