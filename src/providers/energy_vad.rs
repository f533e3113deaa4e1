//! Energy-threshold voice activity detector.
//!
//! The default detector when no vendor VAD is configured: computes RMS
//! energy over a 16-bit PCM window and compares it against a threshold
//! scaled by the configured aggressiveness.

use std::sync::Mutex;

use crate::providers::VadProvider;

const SUPPORTED_RATES: &[u32] = &[8000, 16000, 32000, 48000];

/// RMS-energy VAD. Stateless between windows apart from a noise-floor
/// estimate, which `reset` clears.
pub struct EnergyVad {
    threshold: f32,
    noise_floor: Mutex<f32>,
}

impl EnergyVad {
    /// `aggressiveness` 0..3; higher detects speech more eagerly.
    pub fn new(aggressiveness: u8) -> Self {
        // 0 -> 0.04, 1 -> 0.03, 2 -> 0.02, 3 -> 0.01
        let threshold = 0.04 - 0.01 * aggressiveness.min(3) as f32;
        Self {
            threshold,
            noise_floor: Mutex::new(0.0),
        }
    }

    fn rms(pcm: &[u8]) -> f32 {
        if pcm.len() < 2 {
            return 0.0;
        }
        let mut sum = 0f64;
        let samples = pcm.len() / 2;
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / i16::MAX as f64;
            sum += sample * sample;
        }
        (sum / samples as f64).sqrt() as f32
    }
}

impl VadProvider for EnergyVad {
    fn reset(&self) -> anyhow::Result<()> {
        *self.noise_floor.lock().unwrap() = 0.0;
        Ok(())
    }

    fn process(&self, pcm: &[u8], sample_rate: u32, _frame_ms: u32) -> anyhow::Result<bool> {
        if !SUPPORTED_RATES.contains(&sample_rate) {
            anyhow::bail!("unsupported sample rate: {}", sample_rate);
        }
        let energy = Self::rms(pcm);

        let mut floor = self.noise_floor.lock().unwrap();
        if *floor == 0.0 {
            *floor = energy.min(self.threshold / 2.0);
        } else {
            *floor = 0.95 * *floor + 0.05 * energy.min(*floor * 2.0);
        }

        Ok(energy > self.threshold + *floor)
    }
}
