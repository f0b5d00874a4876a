//! Async TCP server using Tokio.
//!
//! A single listener accepts connections and hands each one to its own task.
//! The accept wait is bounded by the configured poll interval so a shutdown
//! request is noticed promptly even when no client is connecting. Each
//! connection reads one HTTP request; it is either answered and closed, or
//! upgraded to a WebSocket session that lives until either side closes it.

pub mod connection;
pub mod protocol;
mod session;
pub mod shutdown;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

pub use connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionState, ConnectionTable, StateError,
};
pub use protocol::Decision;
pub use shutdown::ShutdownSignal;

use crate::app::App;
use crate::config::{ConfigError, ServerConfig};
use crate::http::{RequestError, Response, StatusCode};
use crate::realtime::frame::{FrameError, close_code};

/// Close reason sent to WebSocket clients when the server drains.
pub(crate) const SHUTDOWN_REASON: &str = "Server shutting down";

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("bad request: {0}")]
    Request(#[from] RequestError),

    #[error("websocket protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("no complete request within {0:?}")]
    Timeout(Duration),
}

/// The listening socket. Closing it is idempotent.
#[derive(Debug)]
pub struct Listener {
    inner: Option<TcpListener>,
}

impl Listener {
    fn new(listener: TcpListener) -> Self {
        Self {
            inner: Some(listener),
        }
    }

    /// The open listener, or `None` once closed.
    pub fn get(&self) -> Option<&TcpListener> {
        self.inner.as_ref()
    }

    /// Stops listening. Returns `false` if the listener was already closed.
    pub fn close(&mut self) -> bool {
        self.inner.take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

/// The socketry server: one listener plus every connection accepted from it.
///
/// # Examples
///
/// ```rust,no_run
/// use socketry::app::App;
/// use socketry::config::ServerConfig;
/// use socketry::router::Router;
/// use socketry::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/", |_req, res, _params| {
///         res.text("Hello!");
///     })?;
///
///     let server = Server::bind(ServerConfig::default()).await?;
///     server.run(App::new(router)).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: Listener,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
    shutdown: ShutdownSignal,
    connections: Arc<ConnectionTable>,
}

impl Server {
    /// Validates `config` and binds its address.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] for an invalid configuration, and
    /// [`ServerError::Bind`] if the address cannot be bound (port already in
    /// use, insufficient permissions).
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: config.addr.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Listener::new(listener),
            local_addr,
            config: Arc::new(config),
            shutdown: ShutdownSignal::new(),
            connections: Arc::new(ConnectionTable::new()),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops [`Server::run`] when triggered.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Replaces the shutdown signal, e.g. with one wired to OS signals.
    #[must_use]
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    /// Live view of the open connections and their states.
    pub fn connections(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.connections)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts and serves connections until shutdown is triggered, then
    /// drains.
    ///
    /// Accept failures are logged and the loop continues; only a failure to
    /// set up the server itself is returned as an error.
    pub async fn run(mut self, app: App) -> Result<(), ServerError> {
        let app = Arc::new(app);
        let mut tasks = JoinSet::new();
        let poll_interval = self.config.poll_interval();
        info!(address = %self.local_addr, "socketry listening");

        loop {
            // Reap finished connection tasks so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}

            let Some(listener) = self.listener.get() else {
                break;
            };

            let accepted = tokio::select! {
                () = self.shutdown.recv() => break,
                accepted = tokio::time::timeout(poll_interval, listener.accept()) => accepted,
            };

            let (stream, peer) = match accepted {
                // Nothing became ready within the interval.
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            let conn = Connection::new(
                stream,
                peer,
                Arc::clone(&self.connections),
                self.config.read_buffer_size,
            );
            debug!(peer = %peer, conn = %conn.id(), "connection accepted");

            let span = tracing::debug_span!("connection", conn = %conn.id(), peer = %peer);
            let app = Arc::clone(&app);
            let config = Arc::clone(&self.config);
            let shutdown = self.shutdown.clone();
            tasks.spawn(
                async move {
                    if let Err(e) = serve_connection(conn, &app, &config, &shutdown).await {
                        warn!(error = %e, "connection closed with error");
                    }
                }
                .instrument(span),
            );
        }

        self.drain(&app, tasks).await;
        Ok(())
    }

    async fn drain(&mut self, app: &App, mut tasks: JoinSet<()>) {
        self.listener.close();
        let open = self.connections.len();
        info!(connections = open, "shutting down");

        let notified = app
            .registry()
            .close_all(close_code::GOING_AWAY, SHUTDOWN_REASON);
        debug!(clients = notified, "sent close frames to websocket clients");

        let deadline = self.config.drain_timeout();
        let drained = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout = ?deadline,
                "connections still open after drain timeout, aborting them"
            );
            tasks.shutdown().await;
        }
        info!("server stopped");
    }
}

/// Serves one connection from its first request to close.
async fn serve_connection(
    mut conn: Connection,
    app: &App,
    config: &ServerConfig,
    shutdown: &ShutdownSignal,
) -> Result<(), ServerError> {
    let read = tokio::select! {
        () = shutdown.recv() => {
            conn.transition(ConnectionState::Closing)?;
            return Ok(());
        }
        read = conn.read_request(config.max_request_size, config.request_timeout()) => read,
    };

    let request = match read {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("connection closed by peer");
            conn.transition(ConnectionState::Closing)?;
            return Ok(());
        }
        Err(e) => return reject(conn, e).await,
    };

    debug!(method = %request.method(), path = %request.path(), "request received");

    match protocol::decide(&request) {
        Decision::Upgrade(response) => {
            conn.transition(ConnectionState::Upgrading)?;
            if let Err(e) = conn.write_response(&response).await {
                conn.transition(ConnectionState::Closing)?;
                return Err(e.into());
            }
            conn.transition(ConnectionState::WebSocketOpen)?;
            debug!(path = %request.path(), "websocket opened");
            session::run(conn, request, app, config.max_frame_size, shutdown).await
        }
        Decision::Http => {
            let mut response = app.handle_http(request);
            response.header("Connection", "close");
            let written = conn.write_response(&response).await;
            conn.transition(ConnectionState::Closing)?;
            conn.shutdown().await;
            written.map_err(ServerError::from)
        }
    }
}

/// Answers a request that could not be read, then closes.
async fn reject(mut conn: Connection, error: ServerError) -> Result<(), ServerError> {
    let (status, body) = match &error {
        ServerError::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, "Request Timeout"),
        ServerError::Request(RequestError::TooLarge { .. }) => {
            (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large")
        }
        ServerError::Request(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
        // The socket itself failed; there is nobody to answer.
        _ => {
            conn.transition(ConnectionState::Closing)?;
            return Err(error);
        }
    };

    warn!(status = status.as_u16(), error = %error, "rejecting request");
    let mut response = Response::new(status);
    response.text(body).header("Connection", "close");
    // The peer may already be gone; the original error is what matters.
    let _ = conn.write_response(&response).await;
    conn.transition(ConnectionState::Closing)?;
    conn.shutdown().await;
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn connect(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(addr).await.unwrap()
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            addr: "127.0.0.1:0".to_owned(),
            poll_interval_ms: 20,
            request_timeout_ms: 200,
            drain_timeout_ms: 500,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn listener_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut listener = Listener::new(listener);
        assert!(!listener.is_closed());
        assert!(listener.close());
        assert!(!listener.close());
        assert!(listener.get().is_none());
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let config = ServerConfig {
            poll_interval_ms: 0,
            ..test_config()
        };
        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let server = Server::bind(test_config()).await.unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_signal();
        let handle = tokio::spawn(server.run(App::new(Router::new())));

        let mut client = connect(addr).await;
        client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    async fn send_raw(raw: &[u8]) -> String {
        let server = Server::bind(test_config()).await.unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_signal();
        let handle = tokio::spawn(server.run(App::new(Router::new())));

        let mut client = connect(addr).await;
        client.write_all(raw).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();

        shutdown.trigger();
        handle.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn overflowing_content_length_gets_400() {
        let out =
            send_raw(b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nabc").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
    }

    #[tokio::test]
    async fn oversized_content_length_gets_413_without_waiting() {
        let out = send_raw(b"POST / HTTP/1.1\r\nContent-Length: 1000000000000\r\n\r\nabc").await;
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let server = Server::bind(test_config()).await.unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_signal();
        let handle = tokio::spawn(server.run(App::new(Router::new())));

        let mut client = connect(addr).await;
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 408"), "{out}");

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_returns_after_shutdown_with_idle_connection() {
        let server = Server::bind(test_config()).await.unwrap();
        let addr = server.local_addr();
        let table = server.connections();
        let shutdown = server.shutdown_signal();
        let handle = tokio::spawn(server.run(App::new(Router::new())));

        let _idle = connect(addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(table.count(ConnectionState::AwaitingRequest), 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(table.is_empty());
    }
}
