//! WebSocket session: the read/write loop of an upgraded connection.
//!
//! One task drives each session. It waits on two sources at once: bytes from
//! the peer and frames queued for this client (by its own handler or by a
//! broadcast from another session). Neither side can stall the other, and a
//! quiet peer never holds up any other connection.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionState};
use super::{SHUTDOWN_REASON, ServerError, ShutdownSignal};
use crate::app::App;
use crate::http::Request;
use crate::realtime::frame::{self, Frame, FrameError, Opcode, close_code};
use crate::realtime::{ClientHandle, Message, Outbound, WebSocketHandler, WsContext};

enum Flow {
    Continue,
    Stop,
}

struct Session {
    conn: Connection,
    ctx: WsContext,
    handler: Arc<dyn WebSocketHandler>,
    // Opcode and payload of a fragmented message still being received.
    fragments: Option<(Opcode, BytesMut)>,
    max_message: usize,
    close_code: Option<u16>,
}

/// Runs an upgraded connection until either side closes it.
///
/// The client is registered for broadcasts for exactly the lifetime of this
/// call, and the handler's `on_close` runs once on every exit path. A client
/// that registers after a drain has begun is sent the same going-away close.
pub(crate) async fn run(
    conn: Connection,
    request: Request,
    app: &App,
    max_message: usize,
    shutdown: &ShutdownSignal,
) -> Result<(), ServerError> {
    let id = conn.id();
    let registry = Arc::clone(app.registry());
    let (handle, mut outbound) = ClientHandle::channel();
    let ctx = WsContext::new(
        id,
        conn.peer_addr(),
        Arc::new(request),
        handle.clone(),
        Arc::clone(&registry),
    );

    registry.register(id, handle);
    // The drain's close_all may have swept the registry before this insert.
    if shutdown.is_shutdown() {
        let _ = ctx.close(close_code::GOING_AWAY, SHUTDOWN_REASON);
    }
    let handler = Arc::clone(app.websocket_handler());
    handler.on_open(&ctx);

    let mut session = Session {
        conn,
        ctx,
        handler,
        fragments: None,
        max_message,
        close_code: None,
    };
    let result = session.pump(&mut outbound).await;

    registry.unregister(id);
    session.handler.on_close(&session.ctx, session.close_code);
    session.conn.shutdown().await;
    result
}

impl Session {
    async fn pump(&mut self, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Result<(), ServerError> {
        loop {
            while let Some((frame, used)) = self.next_frame().await? {
                self.conn.buffer().advance(used);
                if let Flow::Stop = self.on_frame(frame).await? {
                    return Ok(());
                }
            }

            tokio::select! {
                queued = outbound.recv() => match queued {
                    Some(Outbound::Frame(bytes)) => self.send(&bytes).await?,
                    Some(Outbound::Close(bytes)) => {
                        self.enter_closing();
                        if let (Some(code), _) = frame::parse_close_payload(bytes.get(2..).unwrap_or_default()) {
                            self.close_code = Some(code);
                        }
                        let _ = self.conn.write_all(&bytes).await;
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                read = self.conn.read_more() => match read {
                    Ok(0) => {
                        tracing::debug!(conn = %self.ctx.id(), "peer closed websocket without a close frame");
                        self.enter_closing();
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.fail(close_code::GOING_AWAY, "").await;
                        return Err(e.into());
                    }
                },
            }
        }
    }

    // Decodes the next buffered frame, answering codec errors with a close frame.
    async fn next_frame(&mut self) -> Result<Option<(Frame, usize)>, ServerError> {
        match Frame::parse(self.conn.buffer(), self.max_message) {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                let code = match e {
                    FrameError::PayloadTooLarge { .. } => close_code::MESSAGE_TOO_BIG,
                    FrameError::InvalidFrame { .. } => close_code::PROTOCOL_ERROR,
                };
                self.fail(code, "invalid frame").await;
                Err(e.into())
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Flow, ServerError> {
        if !frame.is_masked() {
            return self
                .protocol_error(close_code::PROTOCOL_ERROR, "client frames must be masked")
                .await;
        }

        match frame.opcode {
            Opcode::Ping => {
                self.send(&frame::encode(&frame.payload, Opcode::Pong)).await?;
                Ok(Flow::Continue)
            }
            Opcode::Pong => Ok(Flow::Continue),
            Opcode::Close => {
                let (code, reason) = frame::parse_close_payload(&frame.payload);
                tracing::debug!(conn = %self.ctx.id(), ?code, %reason, "close frame received");
                if frame.payload.len() == 1 || !code.is_none_or(close_code::is_valid) {
                    return self
                        .protocol_error(close_code::PROTOCOL_ERROR, "invalid close frame")
                        .await;
                }
                self.close_code = code;
                self.enter_closing();
                let reply = frame::encode_close(code.unwrap_or(close_code::NORMAL), "");
                let _ = self.conn.write_all(&reply).await;
                Ok(Flow::Stop)
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragments.is_some() {
                    return self
                        .protocol_error(close_code::PROTOCOL_ERROR, "expected a continuation frame")
                        .await;
                }
                if frame.fin {
                    self.deliver(frame.opcode, frame.payload).await
                } else {
                    self.fragments = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                    Ok(Flow::Continue)
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut message)) = self.fragments.take() else {
                    return self
                        .protocol_error(close_code::PROTOCOL_ERROR, "unexpected continuation frame")
                        .await;
                };
                if message.len() + frame.payload.len() > self.max_message {
                    return self
                        .protocol_error(close_code::MESSAGE_TOO_BIG, "message too big")
                        .await;
                }
                message.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.deliver(opcode, message.freeze()).await
                } else {
                    self.fragments = Some((opcode, message));
                    Ok(Flow::Continue)
                }
            }
        }
    }

    async fn deliver(&mut self, opcode: Opcode, payload: Bytes) -> Result<Flow, ServerError> {
        let message = match opcode {
            Opcode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(_) => {
                    return self
                        .protocol_error(close_code::INVALID_PAYLOAD, "text message is not valid UTF-8")
                        .await;
                }
            },
            _ => Message::Binary(payload),
        };
        self.handler.on_message(&self.ctx, message);
        Ok(Flow::Continue)
    }

    // Writes a data or control frame; a dead socket moves the session to Closing.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        if let Err(e) = self.conn.write_all(bytes).await {
            self.fail(close_code::GOING_AWAY, "").await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn protocol_error(&mut self, code: u16, reason: &'static str) -> Result<Flow, ServerError> {
        self.fail(code, reason).await;
        Err(FrameError::InvalidFrame { reason }.into())
    }

    // Best-effort close frame; a failed write here is not escalated.
    async fn fail(&mut self, code: u16, reason: &str) {
        self.close_code = Some(code);
        self.enter_closing();
        let _ = self.conn.write_all(&frame::encode_close(code, reason)).await;
    }

    fn enter_closing(&mut self) {
        if self.conn.state() != ConnectionState::Closing {
            let _ = self.conn.transition(ConnectionState::Closing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use crate::server::ConnectionTable;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    const MAX: usize = 1 << 16;

    async fn open_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream, peer, Arc::new(ConnectionTable::new()), 1024);
        conn.transition(ConnectionState::Upgrading).unwrap();
        conn.transition(ConnectionState::WebSocketOpen).unwrap();
        (conn, client)
    }

    fn upgrade_request() -> Request {
        Request::parse(b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\n\r\n")
            .unwrap()
            .0
    }

    fn session(conn: Connection, app: &App) -> Session {
        let (handle, _outbound) = ClientHandle::channel();
        let ctx = WsContext::new(
            conn.id(),
            conn.peer_addr(),
            Arc::new(upgrade_request()),
            handle,
            Arc::clone(app.registry()),
        );
        Session {
            conn,
            ctx,
            handler: Arc::clone(app.websocket_handler()),
            fragments: None,
            max_message: MAX,
            close_code: None,
        }
    }

    async fn read_frame(client: &mut TcpStream) -> Frame {
        let mut buf = BytesMut::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some((frame, _)) = Frame::parse(&buf, MAX).unwrap() {
                    return frame;
                }
                assert!(client.read_buf(&mut buf).await.unwrap() > 0, "socket closed");
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    #[tokio::test]
    async fn failed_pong_write_moves_to_closing() {
        let app = App::new(Router::new());
        let (conn, _client) = open_pair().await;
        let mut session = session(conn, &app);
        session.conn.shutdown().await;

        let ping = Frame::new(Opcode::Ping, &b"hi"[..]).masked([1, 2, 3, 4]);
        let result = session.on_frame(ping).await;

        assert!(matches!(result, Err(ServerError::Io(_))));
        assert_eq!(session.conn.state(), ConnectionState::Closing);
        assert_eq!(session.close_code, Some(close_code::GOING_AWAY));
    }

    #[tokio::test]
    async fn malformed_close_payload_gets_protocol_error() {
        let app = App::new(Router::new());
        let payloads = [
            vec![0x03],
            1005u16.to_be_bytes().to_vec(),
            999u16.to_be_bytes().to_vec(),
            2000u16.to_be_bytes().to_vec(),
        ];
        for payload in payloads {
            let (conn, mut client) = open_pair().await;
            let mut session = session(conn, &app);

            let close = Frame::new(Opcode::Close, payload.clone()).masked([5, 6, 7, 8]);
            assert!(session.on_frame(close).await.is_err(), "{payload:?}");

            let reply = read_frame(&mut client).await;
            assert_eq!(reply.opcode, Opcode::Close);
            assert_eq!(
                frame::parse_close_payload(&reply.payload).0,
                Some(close_code::PROTOCOL_ERROR),
                "{payload:?}"
            );
            assert_eq!(session.close_code, Some(close_code::PROTOCOL_ERROR));
        }
    }

    #[tokio::test]
    async fn valid_close_is_echoed() {
        let app = App::new(Router::new());
        for (payload, echoed) in [
            (4000u16.to_be_bytes().to_vec(), 4000),
            (Vec::new(), close_code::NORMAL),
        ] {
            let (conn, mut client) = open_pair().await;
            let mut session = session(conn, &app);

            let close = Frame::new(Opcode::Close, payload).masked([5, 6, 7, 8]);
            assert!(matches!(session.on_frame(close).await, Ok(Flow::Stop)));

            let reply = read_frame(&mut client).await;
            assert_eq!(frame::parse_close_payload(&reply.payload).0, Some(echoed));
        }
    }

    #[tokio::test]
    async fn session_opened_during_drain_is_sent_going_away() {
        let app = App::new(Router::new());
        let registry = Arc::clone(app.registry());
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let (conn, mut client) = open_pair().await;
        let task = tokio::spawn(async move {
            run(conn, upgrade_request(), &app, MAX, &shutdown).await
        });

        let close = read_frame(&mut client).await;
        assert_eq!(close.opcode, Opcode::Close);
        let (code, reason) = frame::parse_close_payload(&close.payload);
        assert_eq!(code, Some(close_code::GOING_AWAY));
        assert_eq!(reason, SHUTDOWN_REASON);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session did not finish")
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
    }
}
