//! Transport layer: a uniform `Connection` the session core talks to, with
//! WebSocket and MQTT(+UDP) implementations behind it.

pub mod mqtt;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::errors::TransportError;

/// Wire message kinds. Text frames carry control JSON, binary frames carry
/// audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// UDP sidechannel parameters advertised to the client in the server hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHelloInfo {
    pub server: String,
    pub port: u16,
    /// Hex AES-128 key.
    pub key: String,
    /// Hex 16-byte nonce template.
    pub nonce: String,
}

/// Uniform connection interface exposed to the session core.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write one frame. Implementations time out after 5 seconds.
    async fn write(&self, kind: MessageKind, data: &[u8]) -> Result<(), TransportError>;

    /// Read the next frame. Blocks until a frame arrives or the connection
    /// closes. Cancel-safe: the session selects this against its stop
    /// signal.
    async fn read(&self) -> Result<(MessageKind, Vec<u8>), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self);

    fn id(&self) -> String;

    fn transport_type(&self) -> &'static str;

    fn is_closed(&self) -> bool;

    /// Unix-millis timestamp of the last frame in either direction.
    fn last_active_ms(&self) -> i64;

    fn last_active(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_active_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn is_stale(&self, timeout: Duration) -> bool {
        let age = Utc::now().timestamp_millis() - self.last_active_ms();
        age > timeout.as_millis() as i64
    }

    /// UDP sidechannel parameters, when the connection carries one.
    fn udp_info(&self) -> Option<UdpHelloInfo> {
        None
    }
}

/// Identity and negotiated options for an accepted connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    pub device_id: String,
    pub client_id: String,
    pub session_id: String,
    pub transport_type: String,
    /// User id from the verified token, as a decimal string.
    pub user_id: String,
    pub enable_vad: bool,
    /// Raw headers (or header-equivalents) from the handshake.
    pub headers: HashMap<String, String>,
}

impl ConnectContext {
    /// Derive the session id the way devices expect: explicit header wins,
    /// then a device-derived id, then a fresh UUID.
    pub fn resolve_session_id(&mut self, fallback: &str) {
        if !self.session_id.is_empty() {
            return;
        }
        self.session_id = if self.device_id.is_empty() {
            if fallback.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                fallback.to_string()
            }
        } else {
            format!("device-{}", self.device_id.replace(':', "_"))
        };
    }
}

/// Receives accepted connections and runs their sessions to completion.
///
/// `accept` returns when the session ends; transports spawn it and clean up
/// their connection tables afterwards.
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    async fn accept(&self, conn: Arc<dyn Connection>, ctx: ConnectContext);
}

/// Infer the message kind of an MQTT payload: valid UTF-8 is treated as
/// text, everything else as binary audio.
pub fn infer_message_kind(payload: &[u8]) -> MessageKind {
    if payload.is_empty() || std::str::from_utf8(payload).is_ok() {
        MessageKind::Text
    } else {
        MessageKind::Binary
    }
}
