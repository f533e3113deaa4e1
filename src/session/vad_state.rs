//! VAD state: audio buffering, voice activity flags and idle-time
//! accounting for one session.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Tracks voice activity, buffered audio and accumulated idle time.
///
/// The audio buffer length stays a whole multiple of `frame_size` after
/// every mutation; `idle_ms` is atomic so the session can read it without
/// taking the buffer lock.
pub struct VadState {
    inner: Mutex<VadInner>,
    idle_ms: AtomicI64,
}

struct VadInner {
    have_voice: bool,
    last_voice_ms: i64,
    voice_stop: bool,
    audio_buffer: Vec<u8>,
    frame_size: usize,
    max_buffer_frames: usize,
    vad_check_frames: usize,
    silence_threshold_ms: i64,
}

impl VadState {
    /// `frame_size` in bytes, `silence_threshold_ms` marks end-of-utterance.
    pub fn new(frame_size: usize, silence_threshold_ms: i64) -> Self {
        Self {
            inner: Mutex::new(VadInner {
                have_voice: false,
                last_voice_ms: 0,
                voice_stop: false,
                audio_buffer: Vec::with_capacity(frame_size * 10),
                frame_size,
                max_buffer_frames: 10,
                vad_check_frames: 3,
                silence_threshold_ms,
            }),
            idle_ms: AtomicI64::new(0),
        }
    }

    // -- buffer management --

    pub fn add_audio(&self, data: &[u8]) {
        self.inner.lock().unwrap().audio_buffer.extend_from_slice(data);
    }

    pub fn buffered_frame_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        if inner.frame_size == 0 {
            0
        } else {
            inner.audio_buffer.len() / inner.frame_size
        }
    }

    /// Copy up to `frame_count` frames without consuming them.
    pub fn buffered_data(&self, frame_count: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let bytes = (frame_count * inner.frame_size).min(inner.audio_buffer.len());
        inner.audio_buffer[..bytes].to_vec()
    }

    /// Take the whole buffer.
    pub fn take_all(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.audio_buffer)
    }

    /// Keep only the most recent `keep_frames` frames.
    pub fn remove_old_frames(&self, keep_frames: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.frame_size == 0 {
            return;
        }
        let current = inner.audio_buffer.len() / inner.frame_size;
        if current > keep_frames {
            let remove = (current - keep_frames) * inner.frame_size;
            inner.audio_buffer.drain(..remove);
        }
    }

    pub fn has_enough_for_vad(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.audio_buffer.len() >= inner.vad_check_frames * inner.frame_size
    }

    // -- idle time (atomic) --

    pub fn add_idle_ms(&self, ms: i64) -> i64 {
        self.idle_ms.fetch_add(ms, Ordering::AcqRel) + ms
    }

    pub fn idle_ms(&self) -> i64 {
        self.idle_ms.load(Ordering::Acquire)
    }

    pub fn reset_idle(&self) {
        self.idle_ms.store(0, Ordering::Release);
    }

    // -- voice flags --

    pub fn set_have_voice(&self, have_voice: bool) {
        self.inner.lock().unwrap().have_voice = have_voice;
    }

    pub fn have_voice(&self) -> bool {
        self.inner.lock().unwrap().have_voice
    }

    pub fn set_last_voice_ms(&self, ms: i64) {
        self.inner.lock().unwrap().last_voice_ms = ms;
    }

    pub fn last_voice_ms(&self) -> i64 {
        self.inner.lock().unwrap().last_voice_ms
    }

    pub fn set_voice_stop(&self, stop: bool) {
        self.inner.lock().unwrap().voice_stop = stop;
    }

    pub fn voice_stop(&self) -> bool {
        self.inner.lock().unwrap().voice_stop
    }

    pub fn is_silence(&self, idle_ms: i64) -> bool {
        idle_ms > self.inner.lock().unwrap().silence_threshold_ms
    }

    // -- tuning --

    pub fn set_frame_size(&self, frame_size: usize) {
        self.inner.lock().unwrap().frame_size = frame_size;
    }

    pub fn frame_size(&self) -> usize {
        self.inner.lock().unwrap().frame_size
    }

    pub fn set_vad_check_frames(&self, frames: usize) {
        self.inner.lock().unwrap().vad_check_frames = frames;
    }

    pub fn vad_check_frames(&self) -> usize {
        self.inner.lock().unwrap().vad_check_frames
    }

    pub fn set_max_buffer_frames(&self, frames: usize) {
        self.inner.lock().unwrap().max_buffer_frames = frames;
    }

    pub fn max_buffer_frames(&self) -> usize {
        self.inner.lock().unwrap().max_buffer_frames
    }

    /// Reset everything for the next utterance.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.have_voice = false;
        inner.last_voice_ms = 0;
        inner.voice_stop = false;
        inner.audio_buffer.clear();
        self.idle_ms.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_frame_accounting() {
        let state = VadState::new(4, 200);
        state.add_audio(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(state.buffered_frame_count(), 2);
        assert_eq!(state.buffered_data(1), vec![1, 2, 3, 4]);
        // Peeking does not consume.
        assert_eq!(state.buffered_frame_count(), 2);
    }

    #[test]
    fn test_take_all_clears() {
        let state = VadState::new(4, 200);
        state.add_audio(&[9; 12]);
        let all = state.take_all();
        assert_eq!(all.len(), 12);
        assert_eq!(state.buffered_frame_count(), 0);
    }

    #[test]
    fn test_remove_old_frames_keeps_recent() {
        let state = VadState::new(2, 200);
        state.add_audio(&[1, 1, 2, 2, 3, 3, 4, 4]);
        state.remove_old_frames(2);
        assert_eq!(state.take_all(), vec![3, 3, 4, 4]);
    }

    #[test]
    fn test_has_enough_for_vad() {
        let state = VadState::new(4, 200);
        state.set_vad_check_frames(2);
        state.add_audio(&[0; 4]);
        assert!(!state.has_enough_for_vad());
        state.add_audio(&[0; 4]);
        assert!(state.has_enough_for_vad());
    }

    #[test]
    fn test_idle_accumulation_and_silence() {
        let state = VadState::new(4, 200);
        assert_eq!(state.add_idle_ms(120), 120);
        assert!(!state.is_silence(state.idle_ms()));
        state.add_idle_ms(100);
        assert!(state.is_silence(state.idle_ms()));
        state.reset_idle();
        assert_eq!(state.idle_ms(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let state = VadState::new(4, 200);
        state.add_audio(&[0; 8]);
        state.set_have_voice(true);
        state.set_voice_stop(true);
        state.add_idle_ms(500);
        state.reset();
        assert!(!state.have_voice());
        assert!(!state.voice_stop());
        assert_eq!(state.idle_ms(), 0);
        assert_eq!(state.buffered_frame_count(), 0);
    }
}
