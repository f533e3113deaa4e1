//! Logical per-session connection over the shared MQTT client.
//!
//! Inbound frames are injected by the transport's subscription callback;
//! outbound frames publish to the session's own `out` topic. When a UDP
//! session is attached, binary audio prefers the sidechannel and falls back
//! to MQTT.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::errors::TransportError;
use crate::transport::mqtt::crypto::PACKET_TYPE_AUDIO;
use crate::transport::mqtt::udp::UdpSession;
use crate::transport::{Connection, MessageKind, UdpHelloInfo};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const INCOMING_CAPACITY: usize = 1024;

pub(crate) fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

struct UdpBinding {
    session: Arc<UdpSession>,
    server: String,
    port: u16,
}

/// One device session multiplexed over the shared broker client.
pub struct MqttConnection {
    client: AsyncClient,
    id: String,
    out_topic: String,
    qos: QoS,
    closed: AtomicBool,
    last_active_ms: AtomicI64,
    incoming_tx: mpsc::Sender<(MessageKind, Vec<u8>)>,
    incoming_rx: Mutex<mpsc::Receiver<(MessageKind, Vec<u8>)>>,
    udp: StdMutex<Option<UdpBinding>>,
}

impl MqttConnection {
    pub fn new(client: AsyncClient, id: String, out_topic: String, qos: u8) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        Self {
            client,
            id,
            out_topic,
            qos: qos_from(qos),
            closed: AtomicBool::new(false),
            last_active_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            udp: StdMutex::new(None),
        }
    }

    fn touch(&self) {
        self.last_active_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Attach the UDP sidechannel created for this device.
    pub fn set_udp_session(&self, session: Arc<UdpSession>, server: String, port: u16) {
        *self.udp.lock().unwrap() = Some(UdpBinding {
            session,
            server,
            port,
        });
    }

    fn udp_session(&self) -> Option<Arc<UdpSession>> {
        self.udp
            .lock()
            .unwrap()
            .as_ref()
            .filter(|b| b.session.is_active())
            .map(|b| b.session.clone())
    }

    /// Inject a frame received from the broker subscription.
    ///
    /// Binary payloads that look like UDP packets (some firmwares tunnel
    /// them over MQTT) are decrypted through the UDP session when one is
    /// attached.
    pub fn push_incoming(&self, kind: MessageKind, data: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let data = if kind == MessageKind::Binary {
            match self.route_tunneled_packet(data) {
                Some(remaining) => remaining,
                None => return, // consumed by the UDP session channel
            }
        } else {
            data
        };

        match self.incoming_tx.try_send((kind, data)) {
            Ok(()) => self.touch(),
            Err(_) => {
                // Queue full; drop to keep the broker callback non-blocking.
                warn!("MQTT incoming queue full, dropping frame: conn={}", self.id);
            }
        }
    }

    /// Returns `None` when the packet was fully handled through the UDP
    /// session; otherwise the payload that should continue down the MQTT
    /// path.
    fn route_tunneled_packet(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        if payload.len() < 16 || payload[0] != PACKET_TYPE_AUDIO {
            return Some(payload);
        }
        let session = match self.udp_session() {
            Some(s) => s,
            None => return Some(payload[16..].to_vec()),
        };

        match session.decrypt(&payload) {
            Ok(decrypted) => match session.push_received(decrypted.clone()) {
                Ok(()) => None,
                Err(e) => {
                    debug!("UDP recv channel rejected tunneled frame: {}", e);
                    Some(decrypted)
                }
            },
            Err(_) => {
                if payload.len() > 16 {
                    Some(payload[16..].to_vec())
                } else {
                    Some(payload)
                }
            }
        }
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn write(&self, kind: MessageKind, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        // Audio prefers the UDP sidechannel when one is live.
        if kind == MessageKind::Binary {
            if let Some(session) = self.udp_session() {
                match session.send_audio(data.to_vec()) {
                    Ok(()) => {
                        self.touch();
                        return Ok(());
                    }
                    Err(e) => {
                        debug!("UDP send failed, falling back to MQTT: conn={}, {}", self.id, e);
                    }
                }
            }
        }

        let publish = self
            .client
            .publish(self.out_topic.clone(), self.qos, false, data.to_vec());
        match tokio::time::timeout(WRITE_TIMEOUT, publish).await {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::WriteFailed(e.to_string())),
            Err(_) => Err(TransportError::WriteTimeout(WRITE_TIMEOUT.as_secs())),
        }
    }

    async fn read(&self) -> Result<(MessageKind, Vec<u8>), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        if let Some(session) = self.udp_session() {
            let mut rx = self.incoming_rx.lock().await;
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some((kind, data)) => {
                        self.touch();
                        Ok((kind, data))
                    }
                    None => Err(TransportError::Closed),
                },
                audio = session.recv() => match audio {
                    Some(data) => {
                        self.touch();
                        Ok((MessageKind::Binary, data))
                    }
                    None => Err(TransportError::Closed),
                },
            }
        } else {
            let mut rx = self.incoming_rx.lock().await;
            match rx.recv().await {
                Some((kind, data)) => {
                    self.touch();
                    Ok((kind, data))
                }
                None => Err(TransportError::Closed),
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(binding) = self.udp.lock().unwrap().take() {
                binding.session.destroy();
            }
        }
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn transport_type(&self) -> &'static str {
        "mqtt"
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    fn udp_info(&self) -> Option<UdpHelloInfo> {
        let guard = self.udp.lock().unwrap();
        let binding = guard.as_ref()?;
        let (key, nonce) = binding.session.key_and_nonce_hex();
        Some(UdpHelloInfo {
            server: binding.server.clone(),
            port: binding.port,
            key,
            nonce,
        })
    }
}
