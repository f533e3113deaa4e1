//! Encrypted UDP audio sidechannel for MQTT devices.
//!
//! One socket serves every session; packets are routed by the conn-id
//! embedded in the nonce. The sender's address is learned from the first
//! valid packet and relearned whenever it changes, so devices survive NAT
//! rebinding and 4G handovers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::UdpConfig;
use crate::errors::TransportError;
use crate::transport::mqtt::crypto::{
    aes_ctr_apply, build_full_nonce, extract_nonce_info, generate_aes_key, generate_conn_id,
    generate_nonce_template, is_health_check_packet, PACKET_TYPE_AUDIO, PACKET_TYPE_PROBE,
};

const CHANNEL_CAPACITY: usize = 100;
const SEND_RETRIES: usize = 3;
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(100);
const SEND_RETRY_DELAY: Duration = Duration::from_millis(10);

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// UdpSession
// ---------------------------------------------------------------------------

struct SeqState {
    remote_addr: Option<SocketAddr>,
    local_seq: u32,
    remote_seq: u32,
    seen_first: bool,
    last_active: DateTime<Utc>,
}

/// Per-device state of the encrypted sidechannel.
pub struct UdpSession {
    pub conn_id_hex: String,
    pub device_id: String,
    pub session_id: String,
    aes_key: [u8; 16],
    nonce_template: [u8; 8],
    state: StdMutex<SeqState>,
    active: AtomicBool,
    recv_tx: mpsc::Sender<Vec<u8>>,
    recv_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    send_tx: mpsc::Sender<Vec<u8>>,
    send_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl UdpSession {
    pub fn new(device_id: &str, session_id: &str) -> Self {
        let conn_id = generate_conn_id();
        let (recv_tx, recv_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (send_tx, send_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            conn_id_hex: hex(&conn_id),
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            aes_key: generate_aes_key(),
            nonce_template: generate_nonce_template(conn_id),
            state: StdMutex::new(SeqState {
                remote_addr: None,
                local_seq: 0,
                remote_seq: 0,
                seen_first: false,
                last_active: Utc::now(),
            }),
            active: AtomicBool::new(true),
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            send_tx,
            send_rx: Mutex::new(send_rx),
        }
    }

    pub fn conn_id(&self) -> [u8; 4] {
        let mut id = [0u8; 4];
        id.copy_from_slice(&self.nonce_template[..4]);
        id
    }

    /// Hex key and the 16-byte nonce layout the client derives its template
    /// from: `[0x01][0x00][len=0][template:8][seq=0]`.
    pub fn key_and_nonce_hex(&self) -> (String, String) {
        let full = build_full_nonce(self.nonce_template, 0, 0);
        (hex(&self.aes_key), hex(&full))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn destroy(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().remote_addr
    }

    fn set_remote_addr(&self, addr: SocketAddr) {
        self.state.lock().unwrap().remote_addr = Some(addr);
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().last_active
    }

    fn touch(&self) {
        self.state.lock().unwrap().last_active = Utc::now();
    }

    /// Encrypt a payload into a complete datagram, consuming one local
    /// sequence number.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        let seq = {
            let mut state = self.state.lock().unwrap();
            state.local_seq = state.local_seq.wrapping_add(1);
            state.last_active = Utc::now();
            state.local_seq
        };
        let nonce = build_full_nonce(self.nonce_template, data.len(), seq);
        let ciphertext = aes_ctr_apply(&nonce, &self.aes_key, data);

        let mut packet = Vec::with_capacity(16 + ciphertext.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Decrypt a datagram, enforcing length consistency and replay
    /// protection: after the first packet, sequence numbers must strictly
    /// increase.
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        if packet.len() < 16 {
            return Err(TransportError::UdpMalformed(format!(
                "packet too short: {} bytes",
                packet.len()
            )));
        }

        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&packet[..16]);
        let encrypted = &packet[16..];

        let info = extract_nonce_info(&nonce)?;
        if info.data_len as usize != encrypted.len() {
            return Err(TransportError::UdpMalformed(format!(
                "length mismatch: header {}, payload {}",
                info.data_len,
                encrypted.len()
            )));
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.seen_first && info.seq <= state.remote_seq {
                return Err(TransportError::UdpSequence {
                    expected: state.remote_seq + 1,
                    got: info.seq,
                });
            }
            state.seen_first = true;
            state.remote_seq = info.seq;
            state.last_active = Utc::now();
        }

        Ok(aes_ctr_apply(&nonce, &self.aes_key, encrypted))
    }

    /// Queue audio for sending; drops when the channel is full.
    pub fn send_audio(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        self.send_tx
            .try_send(data)
            .map_err(|_| TransportError::QueueFull)
    }

    /// Queue received (decrypted) audio for the session reader.
    pub fn push_received(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        self.recv_tx
            .try_send(data)
            .map_err(|_| TransportError::QueueFull)
    }

    /// Receive the next decrypted audio payload.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut rx = self.recv_rx.lock().await;
        rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// UdpServer
// ---------------------------------------------------------------------------

/// The process-wide UDP endpoint shared by every MQTT session.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    external_host: String,
    external_port: u16,
    by_conn: StdMutex<HashMap<String, Arc<UdpSession>>>,
    by_addr: StdMutex<HashMap<SocketAddr, Arc<UdpSession>>>,
    stop: Notify,
}

impl UdpServer {
    /// Bind the socket and start the receive loop.
    pub async fn start(cfg: &UdpConfig) -> anyhow::Result<Arc<Self>> {
        let addr = format!("{}:{}", cfg.listen_host, cfg.listen_port);
        let socket = UdpSocket::bind(&addr).await?;
        info!(
            "UDP server listening on {}, external {}:{}",
            addr, cfg.external_host, cfg.external_port
        );

        let server = Arc::new(Self {
            socket: Arc::new(socket),
            external_host: cfg.external_host.clone(),
            external_port: cfg.external_port,
            by_conn: StdMutex::new(HashMap::new()),
            by_addr: StdMutex::new(HashMap::new()),
            stop: Notify::new(),
        });

        let recv_server = server.clone();
        tokio::spawn(async move {
            recv_server.recv_loop().await;
        });

        Ok(server)
    }

    pub fn external_host(&self) -> &str {
        &self.external_host
    }

    /// The socket's bound address (tests bind to an ephemeral port).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn external_port(&self) -> u16 {
        self.external_port
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
        let sessions: Vec<Arc<UdpSession>> =
            self.by_conn.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.destroy();
        }
        self.by_conn.lock().unwrap().clear();
        self.by_addr.lock().unwrap().clear();
    }

    /// Allocate key material for a new device session and start its send
    /// loop.
    pub fn create_session(self: &Arc<Self>, device_id: &str, session_id: &str) -> Arc<UdpSession> {
        let session = Arc::new(UdpSession::new(device_id, session_id));
        self.by_conn
            .lock()
            .unwrap()
            .insert(session.conn_id_hex.clone(), session.clone());

        let server = self.clone();
        let send_session = session.clone();
        tokio::spawn(async move {
            server.send_loop(send_session).await;
        });

        info!(
            "Created UDP session: device={}, session={}, conn_id={}",
            device_id, session_id, session.conn_id_hex
        );
        session
    }

    /// Remove a session and its address mapping.
    pub fn close_session(&self, conn_id_hex: &str) {
        if let Some(session) = self.by_conn.lock().unwrap().remove(conn_id_hex) {
            session.destroy();
            if let Some(addr) = session.remote_addr() {
                self.by_addr.lock().unwrap().remove(&addr);
            }
        }
    }

    /// Punch a hole in the client's NAT by sending an unsolicited probe to
    /// the address it advertised.
    pub async fn probe_client_address(
        &self,
        session: &UdpSession,
        client_ip: &str,
        client_port: u16,
    ) -> anyhow::Result<()> {
        if client_ip.is_empty() || client_port == 0 {
            anyhow::bail!("client address incomplete");
        }
        let target: SocketAddr = format!("{}:{}", client_ip, client_port).parse()?;

        let mut probe = [0u8; 16];
        probe[0] = PACKET_TYPE_PROBE;
        probe[1..5].copy_from_slice(&session.conn_id());

        let mut last_err = None;
        for attempt in 0..SEND_RETRIES {
            match self.socket.send_to(&probe, target).await {
                Ok(_) => {
                    info!(
                        "UDP probe sent: conn_id={}, target={}, attempt={}",
                        session.conn_id_hex,
                        target,
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("UDP probe send failed, retrying: target={}, {}", target, e);
                    last_err = Some(e);
                    tokio::time::sleep(PROBE_RETRY_DELAY).await;
                }
            }
        }
        Err(anyhow::anyhow!(
            "UDP probe failed after {} attempts: {:?}",
            SEND_RETRIES,
            last_err
        ))
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                _ = self.stop.notified() => return,
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, addr)) => self.process_packet(addr, &buf[..n]),
                        Err(e) => {
                            warn!("UDP recv failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn process_packet(&self, addr: SocketAddr, data: &[u8]) {
        if data.len() < 16 {
            warn!("UDP packet too short: addr={}, len={}", addr, data.len());
            return;
        }

        if data[0] != PACKET_TYPE_AUDIO {
            if is_health_check_packet(data) {
                // Load balancer heartbeat; stay quiet.
                return;
            }
            warn!(
                "Non-standard UDP packet: addr={}, first_byte=0x{:02x}",
                addr, data[0]
            );
            return;
        }

        let info = match extract_nonce_info(&data[..16]) {
            Ok(info) => info,
            Err(e) => {
                warn!("UDP nonce parse failed: addr={}, {}", addr, e);
                return;
            }
        };

        let conn_id_hex = hex(&info.conn_id);
        let session = match self.by_conn.lock().unwrap().get(&conn_id_hex).cloned() {
            Some(s) => s,
            None => {
                warn!("No UDP session for conn_id={}, addr={}", conn_id_hex, addr);
                return;
            }
        };

        // Learn or refresh the device address (NAT rebinding).
        match session.remote_addr() {
            None => {
                session.set_remote_addr(addr);
                self.by_addr.lock().unwrap().insert(addr, session.clone());
                info!("Learned device UDP address: device={}, addr={}", session.device_id, addr);
            }
            Some(old) if old != addr => {
                let mut by_addr = self.by_addr.lock().unwrap();
                by_addr.remove(&old);
                by_addr.insert(addr, session.clone());
                drop(by_addr);
                session.set_remote_addr(addr);
                info!(
                    "Updated device UDP address: device={}, old={}, new={}",
                    session.device_id, old, addr
                );
            }
            _ => {}
        }

        let decrypted = match session.decrypt(data) {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "UDP decrypt failed: addr={}, conn_id={}, seq={}, {}",
                    addr, conn_id_hex, info.seq, e
                );
                return;
            }
        };

        // Some firmwares wrap the plaintext in another nonce header.
        let audio = if decrypted.len() >= 16 && decrypted[0] == PACKET_TYPE_AUDIO {
            decrypted[16..].to_vec()
        } else {
            decrypted
        };

        session.touch();
        if let Err(e) = session.push_received(audio) {
            warn!("UDP recv queue full: conn_id={}, {}", conn_id_hex, e);
        }
    }

    async fn send_loop(self: Arc<Self>, session: Arc<UdpSession>) {
        loop {
            let data = tokio::select! {
                _ = self.stop.notified() => return,
                data = async {
                    let mut rx = session.send_rx.lock().await;
                    rx.recv().await
                } => match data {
                    Some(d) => d,
                    None => return,
                },
            };

            if !session.is_active() {
                return;
            }

            let target = match session.remote_addr() {
                Some(addr) => addr,
                None => {
                    warn!(
                        "UDP session has no address yet, dropping frame: conn_id={}",
                        session.conn_id_hex
                    );
                    continue;
                }
            };

            let packet = match session.encrypt(&data) {
                Ok(p) => p,
                Err(e) => {
                    warn!("UDP encrypt failed: conn_id={}, {}", session.conn_id_hex, e);
                    continue;
                }
            };

            let mut sent = false;
            for attempt in 0..SEND_RETRIES {
                match self.socket.send_to(&packet, target).await {
                    Ok(_) => {
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "UDP send failed, attempt {}/{}: addr={}, {}",
                            attempt + 1,
                            SEND_RETRIES,
                            target,
                            e
                        );
                        tokio::time::sleep(SEND_RETRY_DELAY).await;
                    }
                }
            }
            if sent {
                debug!(
                    "Sent UDP audio: addr={}, conn_id={}, size={}",
                    target,
                    session.conn_id_hex,
                    data.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let tx = UdpSession::new("dev", "sess");
        let packet = tx.encrypt(b"pcm frame").unwrap();
        assert_eq!(packet[0], PACKET_TYPE_AUDIO);

        // A fresh peer state decrypts the first packet regardless of seq.
        let plain = tx_decrypt_clone(&tx, &packet).unwrap();
        assert_eq!(plain, b"pcm frame");
    }

    // Decrypt with a second session sharing the same key material, to model
    // the receiver side.
    fn tx_decrypt_clone(tx: &UdpSession, packet: &[u8]) -> Result<Vec<u8>, TransportError> {
        let rx = UdpSession {
            conn_id_hex: tx.conn_id_hex.clone(),
            device_id: tx.device_id.clone(),
            session_id: tx.session_id.clone(),
            aes_key: tx.aes_key,
            nonce_template: tx.nonce_template,
            state: StdMutex::new(SeqState {
                remote_addr: None,
                local_seq: 0,
                remote_seq: 0,
                seen_first: false,
                last_active: Utc::now(),
            }),
            active: AtomicBool::new(true),
            recv_tx: tx.recv_tx.clone(),
            recv_rx: Mutex::new(mpsc::channel(1).1),
            send_tx: tx.send_tx.clone(),
            send_rx: Mutex::new(mpsc::channel(1).1),
        };
        rx.decrypt(packet)
    }

    #[test]
    fn test_replayed_sequence_dropped() {
        let session = UdpSession::new("dev", "sess");
        let peer = UdpSession::new("dev", "sess");
        // Hand-build two packets with the same seq using the peer's key.
        let nonce = build_full_nonce(peer.nonce_template, 4, 1);
        let mut packet = nonce.to_vec();
        packet.extend_from_slice(&aes_ctr_apply(&nonce, &peer.aes_key, b"data"));

        // First delivery accepted.
        assert!(peer.decrypt(&packet).is_ok());
        // Replay with the same seq dropped.
        let err = peer.decrypt(&packet).unwrap_err();
        assert!(matches!(err, TransportError::UdpSequence { .. }));
        let _ = session;
    }

    #[test]
    fn test_out_of_order_sequence_dropped() {
        let peer = UdpSession::new("dev", "sess");
        for seq in [5u32, 6, 3] {
            let nonce = build_full_nonce(peer.nonce_template, 1, seq);
            let mut packet = nonce.to_vec();
            packet.extend_from_slice(&aes_ctr_apply(&nonce, &peer.aes_key, b"x"));
            let result = peer.decrypt(&packet);
            if seq == 3 {
                assert!(result.is_err());
            } else {
                assert!(result.is_ok());
            }
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let peer = UdpSession::new("dev", "sess");
        let nonce = build_full_nonce(peer.nonce_template, 10, 1);
        let mut packet = nonce.to_vec();
        packet.extend_from_slice(b"abc");
        assert!(matches!(
            peer.decrypt(&packet),
            Err(TransportError::UdpMalformed(_))
        ));
    }

    #[test]
    fn test_destroyed_session_rejects() {
        let session = UdpSession::new("dev", "sess");
        session.destroy();
        assert!(session.encrypt(b"x").is_err());
        assert!(session.send_audio(vec![1]).is_err());
    }

    #[test]
    fn test_key_and_nonce_hex_shape() {
        let session = UdpSession::new("dev", "sess");
        let (key, nonce) = session.key_and_nonce_hex();
        assert_eq!(key.len(), 32);
        assert_eq!(nonce.len(), 32);
        assert!(nonce.starts_with("01"));
        // Template sits at bytes 4..12.
        assert_eq!(&nonce[8..16], &session.conn_id_hex[..8]);
    }
}
