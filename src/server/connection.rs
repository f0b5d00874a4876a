//! Per-connection state owned by the event loop.
//!
//! ```text
//! AwaitingRequest ──(handshake ok)──▶ Upgrading ──▶ WebSocketOpen
//!        │                                │               │
//!        └───(response sent / error)──────┴───────────────┴──▶ Closing
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ServerError;
use crate::http::{Request, RequestError, Response};

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier. Identifiers are never reused.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    AwaitingRequest,
    Upgrading,
    WebSocketOpen,
    Closing,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (AwaitingRequest, AwaitingRequest | Upgrading | Closing)
                | (Upgrading, WebSocketOpen | Closing)
                | (WebSocketOpen, Closing)
        )
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid connection state transition {from:?} -> {to:?}")]
pub struct StateError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// What the connection table knows about one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub state: ConnectionState,
}

/// In-memory table of every live connection.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionInfo>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock().get(&id).cloned()
    }

    /// Number of live connections in `state`.
    pub fn count(&self, state: ConnectionState) -> usize {
        self.lock().values().filter(|info| info.state == state).count()
    }

    fn insert(&self, id: ConnectionId, info: ConnectionInfo) {
        self.lock().insert(id, info);
    }

    fn set_state(&self, id: ConnectionId, state: ConnectionState) {
        if let Some(info) = self.lock().get_mut(&id) {
            info.state = state;
        }
    }

    fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }
}

// Removes the table entry when the connection goes away, whatever the path.
#[derive(Debug)]
struct TableEntry {
    id: ConnectionId,
    table: Arc<ConnectionTable>,
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// One accepted TCP connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    state: ConnectionState,
    buf: BytesMut,
    last_activity: Instant,
    read_chunk: usize,
    entry: TableEntry,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        table: Arc<ConnectionTable>,
        read_chunk: usize,
    ) -> Self {
        let id = ConnectionId::next();
        let state = ConnectionState::AwaitingRequest;
        table.insert(id, ConnectionInfo { peer, state });
        Self {
            id,
            peer,
            stream,
            state,
            buf: BytesMut::with_capacity(read_chunk),
            last_activity: Instant::now(),
            read_chunk,
            entry: TableEntry { id, table },
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Moves to `next`, mirroring the change in the connection table.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), StateError> {
        if !self.state.can_transition(next) {
            return Err(StateError {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(conn = %self.id, from = ?self.state, to = ?next, "state transition");
        self.state = next;
        self.entry.table.set_state(self.id, next);
        Ok(())
    }

    /// Bytes received but not yet consumed.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Reads once from the socket into the buffer. Returns the byte count;
    /// zero means the peer closed its side.
    pub async fn read_more(&mut self) -> std::io::Result<usize> {
        self.buf.reserve(self.read_chunk);
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n > 0 {
            self.last_activity = Instant::now();
        }
        Ok(n)
    }

    /// Reads until one complete request is buffered.
    ///
    /// Returns `Ok(None)` when the peer closes before sending anything. Each
    /// read may wait at most `idle_timeout` since the last received bytes.
    ///
    /// # Errors
    ///
    /// [`RequestError::TooLarge`] once more than `max_size` bytes are buffered
    /// without a complete request, [`RequestError::Malformed`] for unparseable
    /// input, [`ServerError::Timeout`] when the peer goes quiet, and
    /// [`ServerError::Io`] for socket failures.
    pub async fn read_request(
        &mut self,
        max_size: usize,
        idle_timeout: Duration,
    ) -> Result<Option<Request>, ServerError> {
        loop {
            if !self.buf.is_empty() {
                match Request::parse_limited(&self.buf, max_size) {
                    Ok((mut request, consumed)) => {
                        let _ = self.buf.split_to(consumed);
                        request.set_peer_addr(self.peer);
                        return Ok(Some(request));
                    }
                    Err(RequestError::Incomplete) => {}
                    Err(e) => return Err(e.into()),
                }
                if self.buf.len() > max_size {
                    return Err(RequestError::TooLarge {
                        max_bytes: max_size,
                    }
                    .into());
                }
            }

            let idle = idle_timeout.saturating_sub(self.last_activity.elapsed());
            let n = tokio::time::timeout(idle, self.read_more())
                .await
                .map_err(|_| ServerError::Timeout(idle_timeout))??;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RequestError::malformed("connection closed mid-request").into());
            }
        }
    }

    /// Writes the serialized response and flushes.
    pub async fn write_response(&mut self, response: &Response) -> std::io::Result<()> {
        self.write_all(&response.to_bytes()).await
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Half-closes the write side; errors are ignored since the peer may be gone.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
