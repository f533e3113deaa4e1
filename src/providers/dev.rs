//! Development providers.
//!
//! Stand-ins for vendor recognizers and synthesizers so the server runs
//! end-to-end without external services: the ASR accepts audio and stays
//! quiet, the TTS renders silence of a plausible duration. Select them with
//! provider type `dev`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tracing::debug;

use crate::providers::{AsrEventListener, AsrProvider, TtsProvider};

/// Recognizer stub: buffers audio, never produces text.
pub struct DevAsr {
    listener: StdMutex<Option<Arc<dyn AsrEventListener>>>,
    buffered_bytes: AtomicU32,
    silence_count: AtomicU32,
}

impl DevAsr {
    pub fn new() -> Self {
        Self {
            listener: StdMutex::new(None),
            buffered_bytes: AtomicU32::new(0),
            silence_count: AtomicU32::new(0),
        }
    }
}

impl Default for DevAsr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsrProvider for DevAsr {
    fn set_listener(&self, listener: Arc<dyn AsrEventListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn add_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
        self.buffered_bytes
            .fetch_add(pcm.len() as u32, Ordering::Relaxed);
        Ok(())
    }

    async fn send_last_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
        self.buffered_bytes
            .fetch_add(pcm.len() as u32, Ordering::Relaxed);
        debug!(
            "DevAsr utterance closed after {} bytes",
            self.buffered_bytes.load(Ordering::Relaxed)
        );
        self.buffered_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn silence_count(&self) -> u32 {
        self.silence_count.load(Ordering::Relaxed)
    }

    fn reset_silence_count(&self) {
        self.silence_count.store(0, Ordering::Relaxed);
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.buffered_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn close_connection(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Synthesizer stub: writes a silent WAV sized to the text length.
pub struct DevTts {
    output_dir: PathBuf,
    voice: StdMutex<String>,
}

impl DevTts {
    pub fn new(output_dir: &str, voice: &str) -> Self {
        let dir = if output_dir.is_empty() {
            std::env::temp_dir().join("voxserve_tts")
        } else {
            PathBuf::from(output_dir)
        };
        Self {
            output_dir: dir,
            voice: StdMutex::new(if voice.is_empty() {
                "dev".to_string()
            } else {
                voice.to_string()
            }),
        }
    }

    fn silent_wav(duration_ms: u32) -> Vec<u8> {
        let sample_rate = 16000u32;
        let samples = (sample_rate * duration_ms / 1000) as usize;
        let data_len = samples * 2;
        let mut out = Vec::with_capacity(44 + data_len);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        out.resize(44 + data_len, 0);
        out
    }
}

#[async_trait]
impl TtsProvider for DevTts {
    async fn synthesize(&self, text: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        // Rough speaking pace: ~160 ms per character, capped at 10 s.
        let duration_ms = (text.chars().count() as u32 * 160).clamp(200, 10_000);
        let path = self
            .output_dir
            .join(format!("tts_{}.wav", uuid::Uuid::new_v4()));
        std::fs::write(&path, Self::silent_wav(duration_ms))?;
        Ok(path)
    }

    fn provider_type(&self) -> String {
        "dev".into()
    }

    fn voice(&self) -> String {
        self.voice.lock().unwrap().clone()
    }

    fn set_voice(&self, voice: &str) {
        *self.voice.lock().unwrap() = voice.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dev_tts_writes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let tts = DevTts::new(dir.path().to_str().unwrap(), "v1");
        let path = tts.synthesize("hello there").await.unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"RIFF"));
        let parsed = crate::audio::parse_wav(&bytes).unwrap();
        assert_eq!(parsed.sample_rate, 16000);
        assert!(!parsed.data.is_empty());
    }

    #[tokio::test]
    async fn test_dev_asr_accepts_audio() {
        let asr = DevAsr::new();
        asr.add_audio(&[0u8; 640]).await.unwrap();
        asr.send_last_audio(&[]).await.unwrap();
        assert_eq!(asr.silence_count(), 0);
    }

    #[test]
    fn test_voice_switching() {
        let tts = DevTts::new("", "");
        assert_eq!(tts.voice(), "dev");
        tts.set_voice("serena");
        assert_eq!(tts.voice(), "serena");
    }
}
