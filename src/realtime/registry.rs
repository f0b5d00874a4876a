//! Registry of open WebSocket clients.
//!
//! Every open session registers a [`ClientHandle`]: the sending half of the
//! channel its writer task drains. Broadcasting is therefore a matter of
//! encoding the frame once and pushing the shared bytes into each channel;
//! a handle whose channel has closed belongs to a dead connection and is
//! dropped from the registry on the spot.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::frame::{self, Opcode};
use crate::server::ConnectionId;

/// A message queued for a session's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded data or control frame.
    Frame(Bytes),
    /// Encoded close frame; the writer stops after sending it.
    Close(Bytes),
}

/// The receiving side of a session no longer exists.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("client connection is gone")]
pub struct ClientGone;

/// Sending half of one client's outbound queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Creates a handle together with the receiver its writer task reads.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queues an already-encoded frame.
    pub fn send_frame(&self, bytes: Bytes) -> Result<(), ClientGone> {
        self.tx.send(Outbound::Frame(bytes)).map_err(|_| ClientGone)
    }

    pub fn send_text(&self, text: &str) -> Result<(), ClientGone> {
        self.send_frame(frame::encode_text(text).freeze())
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), ClientGone> {
        self.send_frame(frame::encode(data, Opcode::Binary).freeze())
    }

    /// Queues a close frame; nothing queued after it is written.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), ClientGone> {
        self.tx
            .send(Outbound::Close(frame::encode_close(code, reason).freeze()))
            .map_err(|_| ClientGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Set of open WebSocket connections, safe to share between sessions.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ConnectionId, ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a client. A second registration under the same id replaces the first.
    pub fn register(&self, id: ConnectionId, handle: ClientHandle) {
        self.lock().insert(id, handle);
        tracing::debug!(%id, "websocket client registered");
    }

    /// Removes a client; returns `false` if it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(%id, "websocket client unregistered");
        }
        removed
    }

    /// Sends `payload` as a text frame to every registered client.
    ///
    /// Clients whose send fails are removed. Returns the number of clients
    /// the frame was queued for.
    pub fn broadcast(&self, payload: &str) -> usize {
        self.broadcast_frame(frame::encode_text(payload).freeze())
    }

    /// Sends `payload` as a binary frame to every registered client.
    pub fn broadcast_binary(&self, payload: &[u8]) -> usize {
        self.broadcast_frame(frame::encode(payload, Opcode::Binary).freeze())
    }

    /// Queues one pre-encoded frame for every client, pruning dead ones.
    pub fn broadcast_frame(&self, encoded: Bytes) -> usize {
        let mut clients = self.lock();
        let before = clients.len();
        clients.retain(|id, handle| match handle.send_frame(encoded.clone()) {
            Ok(()) => true,
            Err(ClientGone) => {
                tracing::debug!(%id, "dropping unreachable websocket client");
                false
            }
        });
        let delivered = clients.len();
        if delivered < before {
            tracing::info!(removed = before - delivered, "pruned broken websocket clients");
        }
        delivered
    }

    /// Sends a close frame to every client and empties the registry.
    /// Returns the number of clients that were still reachable.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained
            .into_iter()
            .filter(|(_, handle)| handle.close(code, reason).is_ok())
            .count()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
