//! WebSocket transport: one TCP upgrade per session.
//!
//! Auth happens during the handshake — a bad token gets a 401 before the
//! upgrade completes. Browser clients cannot set custom headers on the
//! upgrade request, so with `browser: true` the expected headers may arrive
//! as query parameters instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info, warn};

use crate::auth::{bearer_token, AuthToken};
use crate::config::Config;
use crate::errors::TransportError;
use crate::presence::presence_manager;
use crate::transport::{ConnectContext, Connection, ConnectionAcceptor, MessageKind};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket transport server.
pub struct WebSocketTransport {
    config: Arc<Config>,
    auth: Arc<AuthToken>,
    acceptor: Arc<dyn ConnectionAcceptor>,
    shutdown: Arc<Notify>,
}

impl WebSocketTransport {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<AuthToken>,
        acceptor: Arc<dyn ConnectionAcceptor>,
    ) -> Self {
        Self {
            config,
            auth,
            acceptor,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Bind and start accepting connections. Returns once the listener is
    /// up; the accept loop runs in the background until [`stop`](Self::stop).
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!(
            "{}:{}",
            self.config.transport.websocket.ip, self.config.transport.websocket.port
        );
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!("WebSocket transport listening on ws://{}", local);

        let config = self.config.clone();
        let auth = self.auth.clone();
        let acceptor = self.acceptor.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let config = config.clone();
                                let auth = auth.clone();
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        handle_upgrade(stream, peer, config, auth, acceptor).await
                                    {
                                        warn!("WebSocket connection from {} ended: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => error!("Failed to accept connection: {}", e),
                        }
                    }
                    _ = shutdown.notified() => {
                        info!("WebSocket transport shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local)
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Headers the session layer cares about. With browser mode enabled, query
/// parameters of the same names are merged in as a fallback.
fn collect_headers(req: &Request, browser: bool) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_string(), v.to_string());
        }
    }

    if browser {
        if let Some(query) = req.uri().query() {
            for pair in query.split('&') {
                let mut it = pair.splitn(2, '=');
                let key = it.next().unwrap_or_default();
                let value = it.next().unwrap_or_default();
                let canonical = match key {
                    "Device-Id" | "Client-Id" | "Session-Id" | "Transport-Type"
                    | "Enable-VAD" => key.to_string(),
                    "Token" | "token" => {
                        headers
                            .entry("authorization".to_string())
                            .or_insert_with(|| format!("Bearer {}", value));
                        continue;
                    }
                    _ => continue,
                };
                headers
                    .entry(canonical.to_lowercase())
                    .or_insert_with(|| value.to_string());
            }
        }
    }

    headers
}

async fn handle_upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    auth: Arc<AuthToken>,
    acceptor: Arc<dyn ConnectionAcceptor>,
) -> anyhow::Result<()> {
    let browser = config.transport.websocket.browser;
    let mut ctx: Option<ConnectContext> = None;

    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let headers = collect_headers(req, browser);
        let device_id = headers.get("device-id").cloned().unwrap_or_default();

        let token = headers
            .get("authorization")
            .and_then(|v| bearer_token(v))
            .ok_or_else(|| unauthorized("missing bearer token"))?;

        let verified = auth
            .verify_for_device(token, &device_id)
            .map_err(|e| {
                warn!("WebSocket auth failed for device {}: {}", device_id, e);
                unauthorized(&e.to_string())
            })?;

        let enable_vad = headers
            .get("enable-vad")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        ctx = Some(ConnectContext {
            device_id,
            client_id: headers.get("client-id").cloned().unwrap_or_default(),
            session_id: headers.get("session-id").cloned().unwrap_or_default(),
            transport_type: headers
                .get("transport-type")
                .cloned()
                .unwrap_or_else(|| "websocket".to_string()),
            user_id: verified.user_id.to_string(),
            enable_vad,
            headers,
        });

        Ok(resp)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let mut ctx = match ctx {
        Some(c) => c,
        // The callback rejected; accept_hdr_async already returned an error
        // response, we only get here on a race.
        None => return Ok(()),
    };

    let conn_id = format!("ws-{}", uuid::Uuid::new_v4());
    ctx.resolve_session_id(&conn_id);
    info!(
        "WebSocket session established: device={}, session={}, peer={}",
        ctx.device_id, ctx.session_id, peer
    );

    let conn: Arc<dyn Connection> = Arc::new(WsConnection::new(conn_id, ws_stream));

    presence_manager().set_session_online(&ctx.device_id, &ctx.session_id);
    let device_id = ctx.device_id.clone();
    let session_id = ctx.session_id.clone();

    acceptor.accept(conn.clone(), ctx).await;

    conn.close().await;
    presence_manager().set_session_offline(&device_id, &session_id);
    Ok(())
}

fn unauthorized(message: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(format!("Unauthorized: {}", message)));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

// ---------------------------------------------------------------------------
// Connection impl
// ---------------------------------------------------------------------------

/// A live WebSocket connection. Sink and stream halves are locked
/// independently so a slow write never blocks the reader.
pub struct WsConnection {
    id: String,
    writer: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    reader: Mutex<SplitStream<WebSocketStream<TcpStream>>>,
    closed: AtomicBool,
    last_active_ms: AtomicI64,
}

impl WsConnection {
    pub fn new(id: String, stream: WebSocketStream<TcpStream>) -> Self {
        let (writer, reader) = stream.split();
        Self {
            id,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            closed: AtomicBool::new(false),
            last_active_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.last_active_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn write(&self, kind: MessageKind, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let message = match kind {
            MessageKind::Text => Message::Text(
                String::from_utf8(data.to_vec())
                    .map_err(|e| TransportError::WriteFailed(e.to_string()))?,
            ),
            MessageKind::Binary => Message::Binary(data.to_vec()),
        };

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, writer.send(message)).await {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::WriteFailed(e.to_string())),
            Err(_) => Err(TransportError::WriteTimeout(WRITE_TIMEOUT.as_secs())),
        }
    }

    async fn read(&self) -> Result<(MessageKind, Vec<u8>), TransportError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let next = {
                let mut reader = self.reader.lock().await;
                reader.next().await
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    self.touch();
                    return Ok((MessageKind::Text, text.into_bytes()));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.touch();
                    return Ok((MessageKind::Binary, data));
                }
                Some(Ok(Message::Ping(payload))) => {
                    let mut writer = self.writer.lock().await;
                    let _ = writer.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::ReadFailed(e.to_string()));
                }
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn transport_type(&self) -> &'static str {
        "websocket"
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }
}
