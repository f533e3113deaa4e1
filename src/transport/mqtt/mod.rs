//! MQTT transport: one shared broker client serving many device sessions,
//! with an optional encrypted UDP sidechannel for audio.
//!
//! Sessions are keyed by `(device_id, session_id)` parsed from the inbound
//! topic `{root}/{device}/{session}/{in_suffix}`. The first message on a new
//! key must be a `{headers, payload}` wrapper whose `Token` header verifies
//! like the WebSocket bearer token; later messages are raw payloads.

pub mod connection;
pub mod crypto;
pub mod udp;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, TlsConfiguration, Transport};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::auth::AuthToken;
use crate::config::Config;
use crate::presence::{presence_manager, HeartbeatMetrics};
use crate::transport::mqtt::connection::{qos_from, MqttConnection};
use crate::transport::mqtt::udp::UdpServer;
use crate::transport::{infer_message_kind, ConnectContext, Connection, ConnectionAcceptor};

/// First-message wrapper carrying handshake headers.
#[derive(Debug, Deserialize)]
struct FirstMessage {
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// MQTT transport server.
pub struct MqttTransport {
    config: Arc<Config>,
    auth: Arc<AuthToken>,
    acceptor: Arc<dyn ConnectionAcceptor>,
    connections: StdMutex<HashMap<String, Arc<MqttConnection>>>,
    client: StdMutex<Option<AsyncClient>>,
    udp_server: StdMutex<Option<Arc<UdpServer>>>,
    stop: Notify,
}

impl MqttTransport {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<AuthToken>,
        acceptor: Arc<dyn ConnectionAcceptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            auth,
            acceptor,
            connections: StdMutex::new(HashMap::new()),
            client: StdMutex::new(None),
            udp_server: StdMutex::new(None),
            stop: Notify::new(),
        })
    }

    /// Connect to the broker and start routing. Returns once the client is
    /// set up; subscription happens on CONNACK inside the event task.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        let mqtt_cfg = &self.config.transport.mqtt;
        if !mqtt_cfg.enabled {
            anyhow::bail!("MQTT transport not enabled");
        }

        if mqtt_cfg.udp.enabled {
            let server = UdpServer::start(&mqtt_cfg.udp).await?;
            *self.udp_server.lock().unwrap() = Some(server);
            info!("UDP sidechannel enabled for MQTT audio");
        }

        let (host, port, tls_implied) = parse_broker(&mqtt_cfg.broker)?;
        let client_id = format!(
            "{}-{}",
            mqtt_cfg.client_id_prefix,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if !mqtt_cfg.username.is_empty() {
            options.set_credentials(mqtt_cfg.username.clone(), mqtt_cfg.password.clone());
        } else {
            warn!("MQTT username not configured, connecting anonymously");
        }

        if mqtt_cfg.tls.enabled || tls_implied {
            let ca = if mqtt_cfg.tls.ca_file.is_empty() {
                Vec::new()
            } else {
                std::fs::read(&mqtt_cfg.tls.ca_file)?
            };
            if !mqtt_cfg.tls.cert_file.is_empty() {
                warn!("MQTT client-certificate auth not supported by this build; ignoring cert_file");
            }
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        *self.client.lock().unwrap() = Some(client.clone());

        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = transport.stop.notified() => {
                        info!("MQTT transport shutting down");
                        return;
                    }
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            transport.subscribe_all(&client).await;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            transport
                                .clone()
                                .route(&publish.topic, publish.payload.to_vec())
                                .await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("MQTT connection lost: {}; retrying", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        info!("MQTT transport started: {}", mqtt_cfg.broker);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
        if let Some(server) = self.udp_server.lock().unwrap().take() {
            server.stop();
        }
        let connections: Vec<Arc<MqttConnection>> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in connections {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await });
        }
    }

    pub fn active_connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    async fn subscribe_all(&self, client: &AsyncClient) {
        let mqtt_cfg = &self.config.transport.mqtt;
        let root = mqtt_cfg.topic_root.trim_end_matches('/');
        let in_suffix = mqtt_cfg.in_suffix.trim_start_matches('/');
        let qos = qos_from(mqtt_cfg.qos);

        for topic in [
            format!("{}/+/+/{}", root, in_suffix),
            format!("{}/+/status/heartbeat", root),
            format!("{}/+/status/connection", root),
        ] {
            info!("MQTT subscribing: {}", topic);
            if let Err(e) = client.subscribe(topic.clone(), qos).await {
                error!("MQTT subscribe failed for {}: {}", topic, e);
            }
        }
    }

    async fn route(self: Arc<Self>, topic: &str, payload: Vec<u8>) {
        let mqtt_cfg = &self.config.transport.mqtt;
        let parts: Vec<&str> = topic.split('/').collect();
        let in_suffix = mqtt_cfg.in_suffix.trim_start_matches('/');

        if parts.len() >= 3 && parts[parts.len() - 1] == in_suffix && parts[parts.len() - 2] != "status"
        {
            let device_id = parts[parts.len() - 3].to_string();
            let session_id = parts[parts.len() - 2].to_string();
            self.handle_inbound(device_id, session_id, payload).await;
        } else if parts.len() >= 4 && parts[parts.len() - 2] == "status" {
            let device_id = parts[parts.len() - 3];
            match parts[parts.len() - 1] {
                "heartbeat" => handle_heartbeat(device_id, &payload),
                "connection" => handle_connection_state(device_id, &payload),
                _ => {}
            }
        } else {
            warn!("MQTT topic did not match any route: {}", topic);
        }
    }

    async fn handle_inbound(self: Arc<Self>, device_id: String, session_id: String, payload: Vec<u8>) {
        let key = format!("{}:{}", device_id, session_id);

        let existing = self.connections.lock().unwrap().get(&key).cloned();
        if let Some(conn) = existing {
            let kind = infer_message_kind(&payload);
            conn.push_incoming(kind, payload);
            presence_manager().touch_session(&device_id, &session_id);
            return;
        }

        // New session: the first message must carry handshake headers.
        let wrapper: FirstMessage = match serde_json::from_slice(&payload) {
            Ok(w) => w,
            Err(e) => {
                warn!(
                    "First MQTT message is not valid JSON: device={}, {}",
                    device_id, e
                );
                self.send_error_response(&device_id, &session_id, "first message must be valid JSON");
                return;
            }
        };

        if wrapper.headers.is_empty() {
            warn!("First MQTT message missing headers: device={}", device_id);
            self.send_error_response(&device_id, &session_id, "first message must include headers");
            return;
        }

        let token = match wrapper.headers.get("Token") {
            Some(t) if !t.is_empty() => t.clone(),
            _ => {
                warn!(
                    "First MQTT message missing Token header: device={}, session={}",
                    device_id, session_id
                );
                self.send_error_response(&device_id, &session_id, "headers must include Token");
                return;
            }
        };

        let verified = match self.auth.verify_for_device(&token, &device_id) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "MQTT token verification failed: device={}, session={}, {}",
                    device_id, session_id, e
                );
                self.send_error_response(&device_id, &session_id, "token verification failed");
                return;
            }
        };

        info!(
            "MQTT session verified: device={}, session={}, user={}",
            device_id, session_id, verified.user_id
        );

        let conn = match self.new_connection(&device_id, &session_id) {
            Some(c) => c,
            None => return,
        };

        // Optional UDP sidechannel.
        if wrapper
            .headers
            .get("Udp-Enabled")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            let udp_server = self.udp_server.lock().unwrap().clone();
            match udp_server {
                Some(server) => {
                    let udp_session = server.create_session(&device_id, &session_id);
                    conn.set_udp_session(
                        udp_session.clone(),
                        server.external_host().to_string(),
                        server.external_port(),
                    );

                    // Probe the advertised client address to open its NAT.
                    let client_ip = wrapper.headers.get("Udp-Client-Ip").cloned();
                    let client_port = wrapper
                        .headers
                        .get("Udp-Client-Port")
                        .and_then(|p| p.parse::<u16>().ok());
                    if let (Some(ip), Some(port)) = (client_ip, client_port) {
                        if !ip.is_empty() && port > 0 {
                            let probe_server = server.clone();
                            let probe_session = udp_session.clone();
                            tokio::spawn(async move {
                                if let Err(e) = probe_server
                                    .probe_client_address(&probe_session, &ip, port)
                                    .await
                                {
                                    warn!("UDP address probe failed: {}", e);
                                }
                            });
                        }
                    }
                }
                None => {
                    warn!("Udp-Enabled requested but UDP server is not running");
                }
            }
        }

        let mut headers = wrapper.headers.clone();
        headers.insert("Device-Id".into(), device_id.clone());
        headers.insert("Session-Id".into(), session_id.clone());
        let enable_vad = headers
            .get("Enable-VAD")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let ctx = ConnectContext {
            device_id: device_id.clone(),
            client_id: headers
                .get("Client-Id")
                .cloned()
                .unwrap_or_else(|| key.clone()),
            session_id: session_id.clone(),
            transport_type: "mqtt".to_string(),
            user_id: verified.user_id.to_string(),
            enable_vad,
            headers,
        };

        self.connections.lock().unwrap().insert(key.clone(), conn.clone());
        presence_manager().set_session_online(&device_id, &session_id);

        let transport = self.clone();
        let acceptor = self.acceptor.clone();
        let session_conn: Arc<dyn Connection> = conn.clone();
        let cleanup_device = device_id.clone();
        let cleanup_session = session_id.clone();
        tokio::spawn(async move {
            acceptor.accept(session_conn.clone(), ctx).await;
            session_conn.close().await;
            transport.connections.lock().unwrap().remove(&key);
            presence_manager().set_session_offline(&cleanup_device, &cleanup_session);
        });

        // The wrapper's inner payload is the session's first real message.
        if let Some(inner) = wrapper.payload {
            if !inner.is_null() {
                if let Ok(bytes) = serde_json::to_vec(&inner) {
                    let kind = infer_message_kind(&bytes);
                    conn.push_incoming(kind, bytes);
                }
            }
        }
    }

    fn new_connection(&self, device_id: &str, session_id: &str) -> Option<Arc<MqttConnection>> {
        let client = self.client.lock().unwrap().clone();
        let client = match client {
            Some(c) => c,
            None => {
                error!("MQTT client not connected, cannot create connection");
                return None;
            }
        };
        let mqtt_cfg = &self.config.transport.mqtt;
        let root = mqtt_cfg.topic_root.trim_end_matches('/');
        let out_suffix = mqtt_cfg.out_suffix.trim_start_matches('/');
        let out_topic = format!("{}/{}/{}/{}", root, device_id, session_id, out_suffix);
        let conn_id = format!("{}/{}", device_id, session_id);
        Some(Arc::new(MqttConnection::new(
            client,
            conn_id,
            out_topic,
            mqtt_cfg.qos,
        )))
    }

    /// One-shot auth failure frame on the session's out topic.
    fn send_error_response(&self, device_id: &str, session_id: &str, message: &str) {
        let client = match self.client.lock().unwrap().clone() {
            Some(c) => c,
            None => return,
        };
        let mqtt_cfg = &self.config.transport.mqtt;
        let root = mqtt_cfg.topic_root.trim_end_matches('/');
        let out_suffix = mqtt_cfg.out_suffix.trim_start_matches('/');
        let out_topic = format!("{}/{}/{}/{}", root, device_id, session_id, out_suffix);

        let body = serde_json::json!({
            "type": "error",
            "code": "AUTH_FAILED",
            "message": message,
        });
        // try_publish keeps the event-loop task from waiting on itself.
        if let Err(e) = client.try_publish(
            out_topic,
            qos_from(mqtt_cfg.qos),
            false,
            body.to_string().into_bytes(),
        ) {
            error!("Failed to publish auth error response: {}", e);
        }
    }
}

fn parse_broker(broker: &str) -> anyhow::Result<(String, u16, bool)> {
    let (rest, tls) = if let Some(stripped) = broker.strip_prefix("tcp://") {
        (stripped, false)
    } else if let Some(stripped) = broker.strip_prefix("mqtt://") {
        (stripped, false)
    } else if let Some(stripped) = broker.strip_prefix("ssl://") {
        (stripped, true)
    } else if let Some(stripped) = broker.strip_prefix("mqtts://") {
        (stripped, true)
    } else {
        (broker, false)
    };

    let mut it = rest.splitn(2, ':');
    let host = it.next().unwrap_or_default();
    if host.is_empty() {
        anyhow::bail!("broker host missing in {}", broker);
    }
    let port = it
        .next()
        .map(|p| p.parse::<u16>())
        .transpose()?
        .unwrap_or(1883);
    Ok((host.to_string(), port, tls))
}

fn handle_heartbeat(device_id: &str, payload: &[u8]) {
    let mut metrics = HeartbeatMetrics::default();
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        metrics.timestamp = value["ts"].as_i64().unwrap_or_default();
        metrics.battery = value["battery"].as_f64().unwrap_or_default();
        metrics.temp = value["temp"].as_f64().unwrap_or_default();
        metrics.net = value["net"].as_str().unwrap_or_default().to_string();
        metrics.rssi = value["rssi"].as_i64().unwrap_or_default() as i32;
    } else {
        metrics.timestamp = chrono::Utc::now().timestamp();
    }
    presence_manager().update_heartbeat(device_id, metrics);
}

fn handle_connection_state(device_id: &str, payload: &[u8]) {
    let status = if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        value["status"].as_str().unwrap_or_default().to_string()
    } else {
        String::from_utf8_lossy(payload).trim().to_lowercase()
    };
    match status.as_str() {
        "online" => presence_manager().set_device_connection_state(device_id, true),
        "offline" => presence_manager().set_device_connection_state(device_id, false),
        _ => {}
    }
}
