//! Opus decoder for inbound device audio.
//!
//! Devices ship Opus packets framed by the transport; each packet decodes
//! to one PCM frame at the session's negotiated sample rate.

use std::sync::Mutex;

use opus::{Channels, Decoder};

/// Samples per channel for the largest Opus frame (120 ms at 48 kHz).
const MAX_FRAME_SAMPLES: usize = 5760;

/// Thread-safe wrapper around a libopus decoder.
pub struct OpusAudioDecoder {
    decoder: Mutex<Decoder>,
    channels: usize,
}

impl OpusAudioDecoder {
    /// Create a decoder for the client's negotiated sample rate and channel
    /// count. Opus supports 8/12/16/24/48 kHz; the nearest supported rate
    /// is used for anything else.
    pub fn new(sample_rate: u32, channels: u32) -> anyhow::Result<Self> {
        let rate = match sample_rate {
            8000 | 12000 | 16000 | 24000 | 48000 => sample_rate,
            r if r < 12000 => 8000,
            r if r < 16000 => 12000,
            r if r < 24000 => 16000,
            r if r < 48000 => 24000,
            _ => 48000,
        };
        let ch = if channels >= 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        };
        let decoder = Decoder::new(rate, ch)?;
        Ok(Self {
            decoder: Mutex::new(decoder),
            channels: if channels >= 2 { 2 } else { 1 },
        })
    }

    /// Decode one Opus packet to 16-bit little-endian PCM bytes.
    pub fn decode(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES * self.channels];
        let decoded = {
            let mut decoder = self.decoder.lock().unwrap();
            decoder.decode(packet, &mut pcm, false)?
        };

        let mut out = Vec::with_capacity(decoded * self.channels * 2);
        for sample in &pcm[..decoded * self.channels] {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_rate_snapping() {
        assert!(OpusAudioDecoder::new(16000, 1).is_ok());
        assert!(OpusAudioDecoder::new(44100, 1).is_ok());
        assert!(OpusAudioDecoder::new(11025, 2).is_ok());
    }

    #[test]
    fn test_roundtrip_with_encoder() {
        let mut encoder =
            opus::Encoder::new(16000, Channels::Mono, opus::Application::Voip).unwrap();
        // 20 ms of a quiet tone at 16 kHz.
        let samples: Vec<i16> = (0..320).map(|i| ((i % 32) * 100) as i16).collect();
        let mut packet = vec![0u8; 4000];
        let written = encoder.encode(&samples, &mut packet).unwrap();
        packet.truncate(written);

        let decoder = OpusAudioDecoder::new(16000, 1).unwrap();
        let pcm = decoder.decode(&packet).unwrap();
        assert_eq!(pcm.len(), 320 * 2);
    }

}
