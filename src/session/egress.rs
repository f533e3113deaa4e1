//! Speech egress: the TTS worker, the ordered audio-send worker and
//! barge-in handling.
//!
//! Every task carries the talk round it was created in; a task whose round
//! no longer matches the session's current round is discarded on arrival.
//! That, plus the `server_voice_stop` flag, is the whole barge-in story.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::{AudioSendTask, SessionHandler, TtsTask};
use crate::transport::MessageKind;
use crate::utils::text::{
    is_music_file, is_quick_reply_hit, remove_emoji, remove_markdown, truncate_chars,
};

const MAX_TTS_CHARS: usize = 255;

impl SessionHandler {
    /// Queue one segment for synthesis and playback.
    ///
    /// The task is enqueued even when the cleaned text is empty or playback
    /// is stopped — the empty task keeps segment indices flowing so the
    /// final `tts stop` event still fires.
    pub(crate) fn speak_and_play(&self, text: &str, text_index: i32, round: u32) -> anyhow::Result<()> {
        let origin = text;
        let mut cleaned = remove_markdown(&remove_emoji(text)).trim().to_string();

        let mut result = Ok(());
        if cleaned.is_empty() {
            warn!("Nothing to speak for segment {} ({:?})", text_index, origin);
            result = Err(anyhow::anyhow!("empty text after cleanup"));
        } else if self.server_voice_stop.load(Ordering::Acquire) {
            info!("Server speech stopped, skipping segment: {}", cleaned);
            cleaned.clear();
            result = Err(anyhow::anyhow!("server speech stopped"));
        } else if cleaned.chars().count() > MAX_TTS_CHARS {
            warn!("Segment over {} chars, truncating", MAX_TTS_CHARS);
            cleaned = truncate_chars(&cleaned, MAX_TTS_CHARS).to_string();
        }

        let task = TtsTask {
            text: cleaned,
            round,
            text_index,
        };
        if self.tts_tx.try_send(task).is_err() {
            warn!("TTS queue full, dropping segment {}", text_index);
        }
        result
    }

    /// Immediately stop server playback for the current round.
    pub(crate) fn stop_server_speak(&self) {
        info!("Stopping server speech");
        self.server_voice_stop.store(true, Ordering::Release);
    }

    /// Client-initiated barge-in: stop speech, tell the client, reset
    /// speaking state.
    pub(crate) async fn client_abort_chat(&self) -> anyhow::Result<()> {
        info!("Client abort received, stopping speech");
        self.stop_server_speak();
        self.send_tts_event("stop", None, None).await?;
        self.clear_speak_status().await;
        Ok(())
    }

    pub(crate) async fn clear_speak_status(&self) {
        self.tts_last_index.store(-1, Ordering::Release);
        if let Err(e) = self.providers.asr.reset().await {
            warn!("ASR reset failed: {}", e);
        }
    }

    fn delete_audio_if_needed(&self, path: &Path, reason: &str) {
        if !self.config.delete_audio {
            return;
        }
        let path_str = path.to_string_lossy();
        if self.quick_reply_cache.is_cached_file(&path_str) {
            debug!("{}: keeping cached audio {}", reason, path_str);
            return;
        }
        if is_music_file(&path_str) {
            debug!("{}: keeping music file {}", reason, path_str);
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            warn!("{}: failed to delete {}: {}", reason, path_str, e);
        } else {
            debug!("{}: deleted {}", reason, path_str);
        }
    }

    // -----------------------------------------------------------------
    // TTS worker
    // -----------------------------------------------------------------

    pub(crate) async fn tts_worker(self: Arc<Self>, mut rx: mpsc::Receiver<TtsTask>) {
        loop {
            let task = tokio::select! {
                _ = self.stop.notified() => {
                    while let Ok(dropped) = rx.try_recv() {
                        debug!("Discarding queued TTS task: {}", dropped.text);
                    }
                    return;
                }
                task = rx.recv() => match task {
                    Some(t) => t,
                    None => return,
                },
            };
            self.process_tts_task(task).await;
        }
    }

    async fn process_tts_task(&self, task: TtsTask) {
        let mut filepath = None;

        if !task.text.is_empty() {
            let quick_hit = is_quick_reply_hit(&task.text, &self.config.quick_reply_words);
            if quick_hit {
                if let Some(cached) = self.quick_reply_cache.find_cached_audio(&task.text) {
                    info!("Using cached quick-reply audio: {}", cached.display());
                    filepath = Some(cached);
                }
            }

            if filepath.is_none() {
                let tts_start = Instant::now();
                match self.providers.tts.synthesize(&task.text).await {
                    Ok(path) => {
                        debug!(
                            "Synthesized \"{}\" (index {}) -> {}",
                            task.text,
                            task.text_index,
                            path.display()
                        );
                        if quick_hit {
                            if let Err(e) =
                                self.quick_reply_cache.save_cached_audio(&task.text, &path)
                            {
                                warn!("Failed to cache quick-reply audio: {}", e);
                            }
                        }
                        if task.text_index == 1 {
                            debug!("First-segment synthesis took {:?}", tts_start.elapsed());
                        }

                        if self.server_voice_stop.load(Ordering::Acquire) {
                            info!("Server speech stopped, discarding synthesized audio");
                            self.delete_audio_if_needed(&path, "barge-in");
                        } else {
                            filepath = Some(path);
                        }
                    }
                    Err(e) => {
                        warn!("Synthesis failed for \"{}\": {}", task.text, e);
                    }
                }
            }
        } else {
            debug!("Empty TTS task for index {}, forwarding placeholder", task.text_index);
        }

        let send_task = AudioSendTask {
            filepath,
            text: task.text,
            round: task.round,
            text_index: task.text_index,
        };
        if self.audio_send_tx.try_send(send_task).is_err() {
            warn!("Audio send queue full, dropping segment {}", task.text_index);
        }
    }

    // -----------------------------------------------------------------
    // Audio send worker
    // -----------------------------------------------------------------

    pub(crate) async fn audio_send_worker(self: Arc<Self>, mut rx: mpsc::Receiver<AudioSendTask>) {
        loop {
            let task = tokio::select! {
                _ = self.stop.notified() => {
                    while let Ok(dropped) = rx.try_recv() {
                        if let Some(path) = &dropped.filepath {
                            self.delete_audio_if_needed(path, "session close");
                        }
                    }
                    return;
                }
                task = rx.recv() => match task {
                    Some(t) => t,
                    None => return,
                },
            };
            self.send_audio_task(task).await;
        }
    }

    async fn send_audio_task(&self, task: AudioSendTask) {
        let current_round = self.talk_round.load(Ordering::Acquire);
        if task.round != current_round {
            debug!(
                "Discarding audio from stale round {} (current {})",
                task.round, current_round
            );
            if let Some(path) = &task.filepath {
                self.delete_audio_if_needed(path, "stale round");
            }
            return;
        }
        if self.server_voice_stop.load(Ordering::Acquire) {
            if let Some(path) = &task.filepath {
                self.delete_audio_if_needed(path, "barge-in");
            }
            return;
        }

        if let Some(path) = &task.filepath {
            if let Err(e) = self.stream_audio_file(path, &task).await {
                warn!("Failed to stream segment {}: {}", task.text_index, e);
            }
            self.delete_audio_if_needed(path, "after send");
        }

        // Final segment of the round: close the speech envelope.
        if task.text_index == self.tts_last_index.load(Ordering::Acquire) {
            let _ = self.send_tts_event("stop", None, None).await;
            let round_ms = chrono::Utc::now().timestamp_millis()
                - self.round_start_ms.load(Ordering::Acquire);
            info!("Round {} playback finished after {} ms", task.round, round_ms);
            if self.close_after_chat.load(Ordering::Acquire) {
                info!("Conversation marked for close, shutting session down");
                self.close().await;
            }
        }
    }

    async fn stream_audio_file(&self, path: &Path, task: &AudioSendTask) -> anyhow::Result<()> {
        let bytes = std::fs::read(path)?;
        let server = self.server_audio.lock().unwrap().clone();
        let frames = crate::audio::frame_audio_file(
            &bytes,
            &server.format,
            server.sample_rate,
            server.channels as u16,
            server.frame_duration_ms,
        )?;
        if frames.is_empty() {
            return Ok(());
        }

        self.send_tts_event("sentence_start", Some(&task.text), Some(task.text_index))
            .await?;

        let frame_duration = Duration::from_millis(server.frame_duration_ms as u64);
        for frame in &frames {
            if self.server_voice_stop.load(Ordering::Acquire)
                || task.round != self.talk_round.load(Ordering::Acquire)
            {
                info!("Playback interrupted mid-segment {}", task.text_index);
                break;
            }
            self.conn.write(MessageKind::Binary, frame).await?;
            tokio::time::sleep(frame_duration).await;
        }

        self.send_tts_event("sentence_end", None, None).await?;
        Ok(())
    }
}
