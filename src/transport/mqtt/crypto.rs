//! AES-CTR packet crypto for the UDP audio sidechannel.
//!
//! Every datagram is `[16-byte nonce][AES-CTR ciphertext]`. The nonce
//! doubles as the packet header:
//! `[type:1][reserved:1][payload_len:2 BE][conn_id:4][timestamp:4][seq:4 BE]`.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;
use rand::RngCore;

use crate::errors::TransportError;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Audio packet type marker.
pub const PACKET_TYPE_AUDIO: u8 = 0x01;
/// NAT probe packet type marker.
pub const PACKET_TYPE_PROBE: u8 = 0x02;

/// Generate a random AES-128 key.
pub fn generate_aes_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generate a random 4-byte connection id.
pub fn generate_conn_id() -> [u8; 4] {
    let mut id = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Build the 8-byte nonce template: conn_id followed by the current unix
/// timestamp (low 4 bytes, big-endian).
pub fn generate_nonce_template(conn_id: [u8; 4]) -> [u8; 8] {
    let mut template = [0u8; 8];
    template[..4].copy_from_slice(&conn_id);
    let ts = chrono::Utc::now().timestamp() as u32;
    template[4..].copy_from_slice(&ts.to_be_bytes());
    template
}

/// Assemble a full 16-byte nonce from the template, payload length and
/// sequence number.
pub fn build_full_nonce(template: [u8; 8], data_len: usize, seq: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[0] = PACKET_TYPE_AUDIO;
    nonce[1] = 0x00;
    nonce[2..4].copy_from_slice(&(data_len as u16).to_be_bytes());
    nonce[4..12].copy_from_slice(&template);
    nonce[12..16].copy_from_slice(&seq.to_be_bytes());
    nonce
}

/// Fields extracted from a 16-byte nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceInfo {
    pub conn_id: [u8; 4],
    pub seq: u32,
    pub data_len: u16,
}

/// Parse the header fields out of a packet nonce.
pub fn extract_nonce_info(nonce: &[u8]) -> Result<NonceInfo, TransportError> {
    if nonce.len() < 16 {
        return Err(TransportError::UdpMalformed(format!(
            "nonce too short: {} bytes",
            nonce.len()
        )));
    }
    let mut conn_id = [0u8; 4];
    conn_id.copy_from_slice(&nonce[4..8]);
    let data_len = u16::from_be_bytes([nonce[2], nonce[3]]);
    let seq = u32::from_be_bytes([nonce[12], nonce[13], nonce[14], nonce[15]]);
    Ok(NonceInfo {
        conn_id,
        seq,
        data_len,
    })
}

/// AES-CTR keystream application. Encryption and decryption are the same
/// operation.
pub fn aes_ctr_apply(nonce: &[u8; 16], key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut cipher = Aes128Ctr::new(key.into(), nonce.into());
    cipher.apply_keystream(&mut out);
    out
}

/// Health checks from load balancers arrive as short plaintext datagrams.
/// Treat a mostly-printable payload as one so it can be dropped silently.
pub fn is_health_check_packet(data: &[u8]) -> bool {
    if data.is_empty() || data.len() > 100 {
        return false;
    }
    let check_len = data.len().min(30);
    let printable = data[..check_len]
        .iter()
        .filter(|&&b| (0x20..=0x7e).contains(&b) || b == 0x09 || b == 0x0a || b == 0x0d)
        .count();
    printable as f64 / check_len as f64 > 0.8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_roundtrip() {
        let conn_id = [0xde, 0xad, 0xbe, 0xef];
        let template = generate_nonce_template(conn_id);
        let nonce = build_full_nonce(template, 320, 7);

        assert_eq!(nonce[0], PACKET_TYPE_AUDIO);
        let info = extract_nonce_info(&nonce).unwrap();
        assert_eq!(info.conn_id, conn_id);
        assert_eq!(info.data_len, 320);
        assert_eq!(info.seq, 7);
    }

    #[test]
    fn test_nonce_too_short() {
        assert!(extract_nonce_info(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_ctr_symmetry() {
        let key = generate_aes_key();
        let template = generate_nonce_template(generate_conn_id());
        let nonce = build_full_nonce(template, 5, 1);

        let plain = b"hello";
        let cipher = aes_ctr_apply(&nonce, &key, plain);
        assert_ne!(&cipher[..], plain);
        let round = aes_ctr_apply(&nonce, &key, &cipher);
        assert_eq!(&round[..], plain);
    }

    #[test]
    fn test_different_seq_different_keystream() {
        let key = [7u8; 16];
        let template = [1u8; 8];
        let a = aes_ctr_apply(&build_full_nonce(template, 4, 1), &key, b"data");
        let b = aes_ctr_apply(&build_full_nonce(template, 4, 2), &key, b"data");
        assert_ne!(a, b);
    }

    #[test]
    fn test_health_check_detection() {
        assert!(is_health_check_packet(b"Healthcheck udp check"));
        assert!(!is_health_check_packet(&[0x03, 0x80, 0xff, 0x00, 0x9a]));
        assert!(!is_health_check_packet(&[]));
        assert!(!is_health_check_packet(&[b'a'; 120]));
    }
}
