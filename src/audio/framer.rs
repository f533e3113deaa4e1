//! Outbound audio framing.
//!
//! Synthesis files arrive as WAV or raw PCM; the egress worker splits them
//! into fixed-duration frames in the session's negotiated server format —
//! raw PCM chunks, or Opus packets encoded one frame at a time.

use opus::{Application, Channels, Encoder};

/// Parsed audio payload: sample rate, channel count, 16-bit LE PCM bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<u8>,
}

/// Parse a minimal RIFF/WAVE header. Returns `None` when `bytes` is not a
/// WAV file; callers then treat the bytes as raw PCM.
pub fn parse_wav(bytes: &[u8]) -> Option<PcmAudio> {
    if bytes.len() < 44 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }

    let mut pos = 12;
    let mut sample_rate = 0u32;
    let mut channels = 0u16;
    let mut bits = 0u16;
    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_len =
            u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
                as usize;
        let body = pos + 8;
        match chunk_id {
            b"fmt " if body + 16 <= bytes.len() => {
                channels = u16::from_le_bytes([bytes[body + 2], bytes[body + 3]]);
                sample_rate = u32::from_le_bytes([
                    bytes[body + 4],
                    bytes[body + 5],
                    bytes[body + 6],
                    bytes[body + 7],
                ]);
                bits = u16::from_le_bytes([bytes[body + 14], bytes[body + 15]]);
            }
            b"data" => {
                if sample_rate == 0 || channels == 0 || bits != 16 {
                    return None;
                }
                let end = (body + chunk_len).min(bytes.len());
                return Some(PcmAudio {
                    sample_rate,
                    channels,
                    data: bytes[body..end].to_vec(),
                });
            }
            _ => {}
        }
        pos = body + chunk_len + (chunk_len & 1);
    }
    None
}

/// Split an audio file into wire frames of `frame_ms` each.
///
/// `server_format` is `"opus"` or `"pcm"`. WAV input is unwrapped first;
/// anything else is treated as raw PCM at the session's server sample rate.
/// The trailing partial frame is zero-padded so every frame has equal
/// duration.
pub fn frame_audio_file(
    bytes: &[u8],
    server_format: &str,
    sample_rate: u32,
    channels: u16,
    frame_ms: u32,
) -> anyhow::Result<Vec<Vec<u8>>> {
    let (rate, ch, pcm) = match parse_wav(bytes) {
        Some(wav) => (wav.sample_rate, wav.channels, wav.data),
        None => (sample_rate, channels, bytes.to_vec()),
    };

    let frame_bytes = (rate as usize * ch as usize * 2 * frame_ms as usize) / 1000;
    if frame_bytes == 0 || pcm.is_empty() {
        return Ok(Vec::new());
    }

    let mut frames: Vec<Vec<u8>> = Vec::with_capacity(pcm.len() / frame_bytes + 1);
    for chunk in pcm.chunks(frame_bytes) {
        let mut frame = chunk.to_vec();
        frame.resize(frame_bytes, 0);
        frames.push(frame);
    }

    if server_format != "opus" {
        return Ok(frames);
    }

    // Encode each PCM frame into one Opus packet.
    let opus_channels = if ch >= 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    };
    let mut encoder = Encoder::new(rate, opus_channels, Application::Voip)?;
    let mut encoded_frames = Vec::with_capacity(frames.len());
    let mut packet = vec![0u8; 4000];
    for frame in &frames {
        let samples: Vec<i16> = frame
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let written = encoder.encode(&samples, &mut packet)?;
        encoded_frames.push(packet[..written].to_vec());
    }
    Ok(encoded_frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(sample_rate: u32, channels: u16, pcm: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + pcm.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        let byte_rate = sample_rate * channels as u32 * 2;
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
        out.extend_from_slice(pcm);
        out
    }

    #[test]
    fn test_parse_wav() {
        let pcm: Vec<u8> = (0..64).collect();
        let wav = wav_bytes(16000, 1, &pcm);
        let parsed = parse_wav(&wav).unwrap();
        assert_eq!(parsed.sample_rate, 16000);
        assert_eq!(parsed.channels, 1);
        assert_eq!(parsed.data, pcm);
    }

    #[test]
    fn test_parse_wav_rejects_raw() {
        assert!(parse_wav(&[0u8; 100]).is_none());
        assert!(parse_wav(b"RIFFxxxxWAVE").is_none());
    }

    #[test]
    fn test_pcm_framing_exact() {
        // 16 kHz mono, 20 ms frames -> 640 bytes per frame.
        let pcm = vec![1u8; 1280];
        let frames = frame_audio_file(&pcm, "pcm", 16000, 1, 20).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 640));
    }

    #[test]
    fn test_pcm_framing_pads_tail() {
        let pcm = vec![1u8; 700];
        let frames = frame_audio_file(&pcm, "pcm", 16000, 1, 20).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), 640);
        assert_eq!(&frames[1][60..], &[0u8; 580][..]);
    }

    #[test]
    fn test_opus_framing_produces_packets() {
        // 60 ms of WAV audio at 16 kHz -> one 60 ms opus packet.
        let pcm = vec![0u8; 16000 * 2 * 60 / 1000];
        let wav = wav_bytes(16000, 1, &pcm);
        let frames = frame_audio_file(&wav, "opus", 16000, 1, 60).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_empty());
        assert!(frames[0].len() < pcm.len());
    }

    #[test]
    fn test_empty_input() {
        let frames = frame_audio_file(&[], "pcm", 16000, 1, 20).unwrap();
        assert!(frames.is_empty());
    }
}
