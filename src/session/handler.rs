//! Session run loop, message dispatch and dialogue orchestration.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::OpusAudioDecoder;
use crate::dialogue::{FunctionCall, Message, ToolCall};
use crate::errors::TransportError;
use crate::mcp::{Action, ActionResponse};
use crate::presence::{presence_manager, HeartbeatMetrics};
use crate::providers::{AsrEventListener, ImageData};
use crate::session::{SessionHandler, SessionReceivers};
use crate::transport::MessageKind;
use crate::utils::text::{
    extract_json_object, is_wake_up_word, random_select, remove_all_punctuation,
    split_at_last_punctuation, split_by_punctuation,
};

const SUPPORTED_SAMPLE_RATES: &[u32] = &[8000, 16000, 32000, 48000];
const SUPPORTED_FRAME_MS: &[u32] = &[10, 20, 30];
const MAX_VAD_IDLE_MS: i64 = 30_000;
const SILENT_USER_PROMPT: &str = "user silent, politely end conversation";
const APOLOGY_TEXT: &str = "Sorry, the service is temporarily unavailable. Please try again later.";

/// Accumulated identity of one model tool call.
#[derive(Debug, Clone)]
struct FunctionCallData {
    id: String,
    name: String,
    arguments: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn nearest(supported: &[u32], value: u32) -> u32 {
    *supported
        .iter()
        .min_by_key(|s| s.abs_diff(value))
        .expect("non-empty")
}

impl SessionHandler {
    /// Run the session to completion: spawn the worker set, pump the
    /// transport, tear everything down on exit.
    pub async fn run(self: Arc<Self>) {
        debug!(
            "Session workers starting: session={}, device={}, client={}",
            self.session_id, self.device_id, self.client_id
        );
        self.load_user_configurations().await;

        let SessionReceivers {
            audio,
            text,
            mcp,
            tts,
            audio_send,
        } = match self.receivers.lock().unwrap().take() {
            Some(r) => r,
            None => {
                error!("Session {} already ran", self.session_id);
                return;
            }
        };

        let workers = vec![
            tokio::spawn(self.clone().audio_ingress_worker(audio)),
            tokio::spawn(self.clone().text_worker(text)),
            tokio::spawn(self.clone().mcp_worker(mcp)),
            tokio::spawn(self.clone().tts_worker(tts)),
            tokio::spawn(self.clone().audio_send_worker(audio_send)),
        ];

        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                frame = self.conn.read() => match frame {
                    Ok((kind, data)) => self.handle_frame(kind, data).await,
                    Err(e) => {
                        info!("Session {} read ended: {}", self.session_id, e);
                        break;
                    }
                }
            }
        }

        self.close().await;
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Idempotent teardown: stop workers, clean providers in reverse
    /// acquisition order, close the transport.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing session {}", self.session_id);
        self.stop.notify_waiters();

        self.providers.tts.set_voice(&self.initial_voice);
        self.providers.asr.reset_silence_count();
        if let Err(e) = self.providers.asr.reset().await {
            warn!("ASR reset failed on close: {}", e);
        }
        if let Err(e) = self.providers.asr.close_connection().await {
            warn!("ASR close failed: {}", e);
        }
        self.conn.close().await;
    }

    async fn load_user_configurations(&self) {
        let Some(service) = &self.user_config_service else {
            return;
        };
        if self.user_id.is_empty() {
            debug!("No user id, skipping bot config load");
            return;
        }
        match service.user_configs(&self.user_id).await {
            Ok(configs) if configs.is_empty() => {
                debug!("User {} has no bot configs", self.user_id);
            }
            Ok(configs) => {
                // Rows without a function name are session-level model
                // overrides; the rest become callable bot tools.
                for config in configs.iter().filter(|c| c.function_name.is_empty()) {
                    if config.model_name.is_empty() && config.api_key.is_empty() {
                        continue;
                    }
                    let mut override_value = serde_json::Map::new();
                    if !config.model_name.is_empty() {
                        override_value
                            .insert("model_name".into(), json!(config.model_name));
                    }
                    if !config.base_url.is_empty() {
                        override_value.insert("url".into(), json!(config.base_url));
                    }
                    if !config.api_key.is_empty() {
                        override_value.insert("api_key".into(), json!(config.api_key));
                    }
                    if config.temperature > 0.0 {
                        override_value
                            .insert("temperature".into(), json!(config.temperature));
                    }
                    if config.max_tokens > 0 {
                        override_value
                            .insert("max_tokens".into(), json!(config.max_tokens));
                    }
                    self.providers
                        .apply_user_config("LLM", &serde_json::Value::Object(override_value));
                }
                self.dispatcher.register_user_bots(&configs);
                *self.user_configs.lock().unwrap() = configs;
            }
            Err(e) => error!("Failed to load bot configs for {}: {}", self.user_id, e),
        }
    }

    // -----------------------------------------------------------------
    // Frame routing
    // -----------------------------------------------------------------

    async fn handle_frame(&self, kind: MessageKind, data: Vec<u8>) {
        match kind {
            MessageKind::Text => {
                // MCP traffic gets its own queue so tool chatter never
                // blocks the text processor.
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&data) {
                    if value["type"] == "mcp" {
                        if self.mcp_tx.try_send(value).is_err() {
                            warn!("MCP queue full, dropping message");
                        }
                        return;
                    }
                }
                let text = String::from_utf8_lossy(&data).into_owned();
                if self.text_tx.try_send(text).is_err() {
                    warn!("Text queue full, dropping message");
                }
            }
            MessageKind::Binary => {
                let format = self.client_audio.lock().unwrap().format.clone();
                let payload = if format == "opus" {
                    let decoded = {
                        let decoder = self.opus_decoder.lock().unwrap();
                        decoder.as_ref().map(|d| d.decode(&data))
                    };
                    match decoded {
                        Some(Ok(pcm)) if !pcm.is_empty() => pcm,
                        Some(Ok(_)) => return,
                        Some(Err(e)) => {
                            // Let the recognizer try the raw bytes.
                            error!("Opus decode failed: {}", e);
                            data
                        }
                        None => data,
                    }
                } else {
                    data
                };
                if self.audio_tx.try_send(payload).is_err() {
                    warn!("Audio queue full, dropping frame");
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------

    async fn audio_ingress_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            let data = tokio::select! {
                _ = self.stop.notified() => return,
                data = rx.recv() => match data {
                    Some(d) => d,
                    None => return,
                },
            };
            if self.close_after_chat.load(Ordering::Acquire) {
                continue;
            }
            if self.enable_vad && self.providers.vad.is_some() && self.vad_state.is_some() {
                self.process_audio_with_vad(&data).await;
            } else if let Err(e) = self.providers.asr.add_audio(&data).await {
                error!("Failed to feed recognizer: {}", e);
            }
        }
    }

    async fn text_worker(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            let text = tokio::select! {
                _ = self.stop.notified() => return,
                text = rx.recv() => match text {
                    Some(t) => t,
                    None => return,
                },
            };
            if let Err(e) = self.clone().process_client_text(text).await {
                error!("Failed to process text message: {}", e);
            }
        }
    }

    async fn mcp_worker(self: Arc<Self>, mut rx: mpsc::Receiver<serde_json::Value>) {
        loop {
            let message = tokio::select! {
                _ = self.stop.notified() => return,
                msg = rx.recv() => match msg {
                    Some(m) => m,
                    None => return,
                },
            };
            self.dispatcher.handle_device_message(&message);
        }
    }

    // -----------------------------------------------------------------
    // VAD pipeline
    // -----------------------------------------------------------------

    async fn process_audio_with_vad(&self, data: &[u8]) {
        let state = self.vad_state.as_ref().expect("vad enabled");
        let vad = self.providers.vad.as_ref().expect("vad enabled");

        let params = self.client_audio.lock().unwrap().clone();
        let mut sample_rate = if params.sample_rate == 0 {
            16000
        } else {
            params.sample_rate
        };
        let mut frame_ms = if params.frame_duration_ms == 0 {
            20
        } else {
            params.frame_duration_ms
        };

        let snapped_rate = nearest(SUPPORTED_SAMPLE_RATES, sample_rate);
        let snapped_frame = nearest(SUPPORTED_FRAME_MS, frame_ms);
        if (snapped_rate != sample_rate || snapped_frame != frame_ms)
            && !self.rate_snap_logged.swap(true, Ordering::AcqRel)
        {
            warn!(
                "Unsupported audio parameters ({} Hz / {} ms), snapping to {} Hz / {} ms",
                sample_rate, frame_ms, snapped_rate, snapped_frame
            );
        }
        sample_rate = snapped_rate;
        frame_ms = snapped_frame;

        // The device may ship frames of any size; track the real one.
        if !data.is_empty() && data.len() != state.frame_size() {
            debug!("Adjusting VAD frame size to {} bytes", data.len());
            state.set_frame_size(data.len());
        }
        let mut actual_frame_ms = frame_ms;
        if !data.is_empty() {
            let calculated = (data.len() * 1000) as u32 / (sample_rate * 2);
            if calculated > 0 && calculated != frame_ms {
                actual_frame_ms = calculated;
            }
        }
        if actual_frame_ms == 0 {
            actual_frame_ms = 20;
        }

        let check_frames = 1;
        state.set_vad_check_frames(check_frames);
        state.add_audio(data);
        if !state.has_enough_for_vad() {
            return;
        }

        let vad_window = state.buffered_data(check_frames);
        if let Err(e) = vad.reset() {
            error!("VAD reset failed: {}", e);
        }
        let have_voice = match vad.process(&vad_window, sample_rate, actual_frame_ms) {
            Ok(v) => v,
            Err(e) => {
                // When the detector fails, assume speech so nothing is lost.
                error!("VAD check failed: {}", e);
                true
            }
        };

        let client_have_voice = state.have_voice();

        if have_voice && !client_have_voice {
            info!("Voice activity started");
            let all = state.take_all();
            if let Err(e) = self.providers.asr.add_audio(&all).await {
                error!("Failed to feed recognizer: {}", e);
            }
            state.set_have_voice(true);
            state.set_last_voice_ms(now_ms());
            state.reset_idle();
            return;
        }

        if client_have_voice {
            let buffered = state.take_all();
            if !buffered.is_empty() {
                if let Err(e) = self.providers.asr.add_audio(&buffered).await {
                    error!("Failed to feed recognizer: {}", e);
                }
            }
            if have_voice {
                state.set_last_voice_ms(now_ms());
                state.reset_idle();
            } else {
                state.add_idle_ms(frame_ms as i64);
            }

            let idle = state.idle_ms();
            if state.is_silence(idle) && !state.voice_stop() {
                info!("Silence after {} ms, ending utterance", idle);
                state.set_voice_stop(true);
                if let Err(e) = self.providers.asr.send_last_audio(&[]).await {
                    error!("Failed to signal end of utterance: {}", e);
                }
                state.reset();
            }
            return;
        }

        // No voice now and none before: just account idle time and cap the
        // buffer.
        let idle = state.add_idle_ms(frame_ms as i64);
        if idle > MAX_VAD_IDLE_MS {
            debug!("Session idle beyond {} ms with no speech", MAX_VAD_IDLE_MS);
        }
        if state.buffered_frame_count() > check_frames * 3 {
            state.remove_old_frames(state.max_buffer_frames());
        }
    }

    // -----------------------------------------------------------------
    // Control messages
    // -----------------------------------------------------------------

    async fn process_client_text(self: Arc<Self>, text: String) -> anyhow::Result<()> {
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                // Non-JSON text bounces straight back.
                self.send_raw(&text).await?;
                return Ok(());
            }
        };
        if value.is_number() {
            self.send_raw(&text).await?;
            return Ok(());
        }
        let Some(msg_type) = value["type"].as_str() else {
            anyhow::bail!("message missing type discriminant");
        };

        match msg_type {
            "hello" => self.handle_hello(&value).await,
            "abort" => self.client_abort_chat().await,
            "listen" => self.handle_listen(&value).await,
            "chat" => {
                let text = value["text"].as_str().unwrap_or_default().to_string();
                self.clone().handle_chat(text).await
            }
            "heartbeat" => self.handle_heartbeat(&value),
            "device_status" => self.handle_device_status(&value),
            "image" => self.clone().handle_image(&value).await,
            "media_upload" => self.handle_media_upload(&value).await,
            "vision" => {
                debug!("Vision command received: {}", value["cmd"]);
                Ok(())
            }
            "mcp" => {
                self.dispatcher.handle_device_message(&value);
                Ok(())
            }
            other => {
                warn!("Unknown message type: {}", other);
                anyhow::bail!("unknown message type: {}", other)
            }
        }
    }

    async fn handle_hello(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        info!("Client hello: {}", value);

        if let Some(audio_params) = value["audio_params"].as_object() {
            let mut client = self.client_audio.lock().unwrap();
            if let Some(format) = audio_params.get("format").and_then(|f| f.as_str()) {
                client.format = format.to_string();
                if format == "pcm" {
                    // A PCM client gets PCM back.
                    self.server_audio.lock().unwrap().format = "pcm".to_string();
                }
            }
            if let Some(rate) = audio_params.get("sample_rate").and_then(|r| r.as_u64()) {
                client.sample_rate = rate as u32;
            }
            if let Some(channels) = audio_params.get("channels").and_then(|c| c.as_u64()) {
                client.channels = channels as u32;
            }
            if let Some(frame) = audio_params.get("frame_duration").and_then(|f| f.as_u64()) {
                client.frame_duration_ms = frame as u32;
            }
            info!(
                "Client audio: format={}, rate={}, channels={}, frame={}ms",
                client.format, client.sample_rate, client.channels, client.frame_duration_ms
            );
        }

        if let Some(udp_info) = value["udp_client_info"].as_object() {
            let ip = udp_info
                .get("public_ip")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let port = udp_info
                .get("udp_port")
                .and_then(|v| v.as_u64())
                .unwrap_or_default();
            if !ip.is_empty() && port > 0 {
                // The transport probes this endpoint when the handshake
                // headers carried it; here it is informational.
                info!("Client advertised UDP endpoint {}:{}", ip, port);
            }
        }

        self.send_hello().await?;

        // (Re)build the Opus decoder for the negotiated parameters.
        {
            let client = self.client_audio.lock().unwrap().clone();
            let mut decoder = self.opus_decoder.lock().unwrap();
            *decoder = None;
            if client.format == "opus" {
                match OpusAudioDecoder::new(client.sample_rate, client.channels) {
                    Ok(d) => {
                        *decoder = Some(d);
                        info!("Opus decoder ready");
                    }
                    Err(e) => error!("Failed to initialize Opus decoder: {}", e),
                }
            }
        }

        // Wire the recognizer callback here so recognition works even when
        // the client never sends a listen message.
        let listener: Arc<dyn AsrEventListener> = self.arc_self();
        self.providers.asr.set_listener(listener);
        Ok(())
    }

    async fn handle_listen(self: Arc<Self>, value: &serde_json::Value) -> anyhow::Result<()> {
        let Some(state) = value["state"].as_str() else {
            anyhow::bail!("listen message missing state");
        };

        if let Some(mode) = value["mode"].as_str() {
            *self.listen_mode.lock().unwrap() = mode.to_string();
            info!("Client listen mode: {} ({})", mode, state);
            let listener: Arc<dyn AsrEventListener> = self.arc_self();
            self.providers.asr.set_listener(listener);
        }

        match state {
            "start" => {
                let pending = !self.client_asr_text.lock().unwrap().is_empty();
                let manual = *self.listen_mode.lock().unwrap() == "manual";
                if pending && manual && self.config.session.manual_start_abort {
                    self.client_abort_chat().await?;
                }
                self.client_asr_text.lock().unwrap().clear();
            }
            "stop" => {
                info!("Client stopped listening");
                self.providers.asr.send_last_audio(&[]).await?;
            }
            "detect" => {
                let text = value["text"].as_str().unwrap_or_default().to_string();
                if text.is_empty() {
                    warn!("detect without text");
                    anyhow::bail!("detect message missing text");
                }
                self.clone().handle_chat(text).await?;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_heartbeat(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        let metrics = HeartbeatMetrics {
            timestamp: value["ts"].as_i64().unwrap_or_default(),
            battery: value["battery"].as_f64().unwrap_or_default(),
            temp: value["temp"].as_f64().unwrap_or_default(),
            net: value["net"].as_str().unwrap_or_default().to_string(),
            rssi: value["rssi"].as_i64().unwrap_or_default() as i32,
        };
        presence_manager().update_heartbeat(&self.device_id, metrics);
        presence_manager().touch_session(&self.device_id, &self.session_id);
        debug!("Heartbeat: device={}, session={}", self.device_id, self.session_id);
        Ok(())
    }

    fn handle_device_status(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        if self.device_id.is_empty() {
            anyhow::bail!("device id missing, cannot update status");
        }
        let online = value["online"].as_bool().unwrap_or(true);
        presence_manager().set_device_connection_state(&self.device_id, online);
        info!("Device status: device={}, online={}", self.device_id, online);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------

    /// True when the utterance is an exact exit command; closes the session.
    pub(crate) async fn quit_intent(&self, text: &str) -> bool {
        let cleaned = remove_all_punctuation(text);
        for cmd in &self.config.cmd_exit {
            if cleaned == remove_all_punctuation(cmd) {
                info!("Exit intent matched, ending session");
                self.close().await;
                return true;
            }
        }
        false
    }

    fn quick_reply_wake_words(&self, text: &str, round: u32) -> Option<String> {
        if !self.config.quick_reply || round != 1 {
            return None;
        }
        if !is_wake_up_word(text) {
            return None;
        }
        random_select(&self.config.quick_reply_words).cloned()
    }

    pub(crate) async fn handle_chat(self: Arc<Self>, text: String) -> anyhow::Result<()> {
        if text.is_empty() {
            warn!("Empty chat message, ignoring");
            self.client_abort_chat().await?;
            anyhow::bail!("chat message empty");
        }

        if self.quit_intent(&text).await {
            return Ok(());
        }

        let round = self.talk_round.fetch_add(1, Ordering::AcqRel) + 1;
        self.round_start_ms.store(now_ms(), Ordering::Release);
        info!("Starting talk round {}", round);

        self.send_stt(&text).await?;
        self.send_tts_event("start", None, None).await?;

        if let Some(reply) = self.quick_reply_wake_words(&text, round) {
            self.tts_last_index.store(1, Ordering::Release);
            let _ = self.speak_and_play(&reply, 1, round);
            return Ok(());
        }

        {
            let mut dialogue = self.dialogue.lock().await;
            dialogue.put(Message::user(text.clone())).await;
        }
        let messages = self.dialogue.lock().await.llm_dialogue().to_vec();
        self.clone().gen_response_by_llm(messages, round).await
    }

    fn gen_response_by_llm(
        self: Arc<Self>,
        messages: Vec<Message>,
        round: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>> {
        Box::pin(self.gen_response_by_llm_inner(messages, round))
    }

    async fn gen_response_by_llm_inner(
        self: Arc<Self>,
        messages: Vec<Message>,
        round: u32,
    ) -> anyhow::Result<()> {
        let llm_start = Instant::now();
        let tools = self.dispatcher.tool_specs();

        let mut rx = match self
            .providers
            .llm
            .stream_with_functions(&self.session_id, &messages, &tools)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                error!("LLM request failed: {}", e);
                self.tts_last_index.store(1, Ordering::Release);
                let _ = self.speak_and_play(APOLOGY_TEXT, 1, round);
                return Err(e);
            }
        };

        self.server_voice_stop.store(false, Ordering::Release);

        let mut full_text = String::new();
        let mut processed = 0usize;
        let mut text_index = 0i32;

        let mut tool_call_flag = false;
        let mut function_id = String::new();
        let mut function_name = String::new();
        let mut function_arguments = String::new();
        let mut content_arguments = String::new();

        while let Some(chunk) = rx.recv().await {
            if let Some(err) = chunk.error {
                error!("LLM stream error: {}", err);
                self.tts_last_index.store(1, Ordering::Release);
                let _ = self.speak_and_play(APOLOGY_TEXT, 1, round);
                anyhow::bail!("LLM stream error: {}", err);
            }

            if let Some(content) = &chunk.content {
                content_arguments.push_str(content);
            }
            if !tool_call_flag && content_arguments.trim_start().starts_with("<tool_call>") {
                tool_call_flag = true;
            }

            if let Some(call) = chunk.tool_calls.first() {
                tool_call_flag = true;
                if !call.id.is_empty() {
                    function_id = call.id.clone();
                }
                if !call.function.name.is_empty() {
                    function_name = call.function.name.clone();
                }
                function_arguments.push_str(&call.function.arguments);
            }

            let Some(content) = chunk.content else {
                continue;
            };
            if content.is_empty() || tool_call_flag {
                continue;
            }

            full_text.push_str(&content);
            let current = &full_text[processed..];
            if let Some((segment, consumed)) = split_at_last_punctuation(current) {
                text_index += 1;
                let segment = segment.trim().to_string();
                if text_index == 1 {
                    info!(
                        "First segment after {:?}: \"{}\" (round {})",
                        llm_start.elapsed(),
                        segment,
                        round
                    );
                } else {
                    debug!("Segment {}: \"{}\" (round {})", text_index, segment, round);
                }
                self.tts_last_index.store(text_index, Ordering::Release);
                if let Err(e) = self.speak_and_play(&segment, text_index, round) {
                    warn!("Failed to queue segment: {}", e);
                }
                processed += consumed;
            }
        }

        if tool_call_flag {
            // Some models emit the call as inline text without an id.
            if function_id.is_empty() {
                match extract_json_object(&content_arguments) {
                    Some(parsed) => {
                        function_name = parsed["name"].as_str().unwrap_or_default().to_string();
                        function_arguments = parsed["arguments"].to_string();
                        function_id = Uuid::new_v4().to_string();
                    }
                    None => {
                        error!("Could not extract tool call from model output");
                        return Ok(());
                    }
                }
            }

            let call_data = FunctionCallData {
                id: function_id,
                name: function_name.clone(),
                arguments: function_arguments.clone(),
            };

            let result = match serde_json::from_str::<serde_json::Value>(&function_arguments) {
                Ok(args) => {
                    info!("Function call: {}({})", function_name, function_arguments);
                    let bot_configs = self.user_configs.lock().unwrap().clone();
                    self.dispatcher
                        .execute(&function_name, &args, &bot_configs)
                        .await
                }
                Err(e) => {
                    error!("Tool arguments failed to parse: {}", e);
                    ActionResponse::req_llm(format!("tool arguments could not be parsed: {}", e))
                }
            };

            self.clone()
                .handle_function_result(result, call_data, round)
                .await;
            return Ok(());
        }

        // Whatever trails the last punctuation mark still gets spoken.
        if full_text.len() > processed {
            let remaining = full_text[processed..].trim().to_string();
            if !remaining.is_empty() {
                text_index += 1;
                debug!("Trailing segment {}: \"{}\"", text_index, remaining);
                self.tts_last_index.store(text_index, Ordering::Release);
                let _ = self.speak_and_play(&remaining, text_index, round);
            }
        }

        if !full_text.is_empty() {
            let mut dialogue = self.dialogue.lock().await;
            dialogue.put(Message::assistant(full_text)).await;
        }
        Ok(())
    }

    async fn handle_function_result(
        self: Arc<Self>,
        result: ActionResponse,
        call_data: FunctionCallData,
        round: u32,
    ) {
        match result.action {
            Action::Error | Action::NotFound => {
                error!("Tool call failed: {}", result.result_text());
                let _ = self
                    .system_speak("Sorry, I couldn't complete that request.")
                    .await;
            }
            Action::None => {
                info!("Tool call produced no action");
            }
            Action::Response => {
                if let Some(response) = &result.response {
                    info!("Tool responded directly: {}", response);
                    let _ = self.system_speak(response).await;
                }
            }
            Action::CallHandler => {
                let result_text = self.handle_mcp_result_call(&result).await;
                self.add_tool_call_message(&result_text, &call_data).await;
                self.clone().continue_llm(round).await;
            }
            Action::ReqLlm => {
                let text = result.result_text();
                if text.is_empty() {
                    error!("Tool returned an empty result");
                    let _ = self.system_speak("The tool returned no result.").await;
                    return;
                }
                self.add_tool_call_message(&text, &call_data).await;
                self.clone().continue_llm(round).await;
            }
        }
    }

    /// Re-enter the generation loop with the tool exchange appended.
    async fn continue_llm(self: Arc<Self>, round: u32) {
        let messages = self.dialogue.lock().await.llm_dialogue().to_vec();
        if let Err(e) = self.clone().gen_response_by_llm(messages, round).await {
            error!("Continuation after tool call failed: {}", e);
        }
    }

    /// Apply server-side effects of a `call_handler` tool result; the
    /// returned text becomes the tool message.
    async fn handle_mcp_result_call(&self, result: &ActionResponse) -> String {
        let payload = result.result.clone().unwrap_or_default();
        match payload["handler"].as_str().unwrap_or_default() {
            "exit_intent" => {
                self.close_after_chat.store(true, Ordering::Release);
                let farewell = payload["farewell"].as_str().unwrap_or("Goodbye.");
                format!("The user is ending the conversation. Reply with: {}", farewell)
            }
            "change_voice" => {
                let voice = payload["voice"].as_str().unwrap_or_default();
                self.providers.tts.set_voice(voice);
                format!("Voice switched to {}.", voice)
            }
            "change_role" => {
                let role = payload["role"].as_str().unwrap_or_default();
                let prompt = payload["prompt"].as_str().unwrap_or_default();
                let mut dialogue = self.dialogue.lock().await;
                if prompt.is_empty() {
                    dialogue.set_system_message(&format!(
                        "You are now {}. Stay in character for the rest of the conversation.",
                        role
                    ));
                } else {
                    dialogue.set_system_message(prompt);
                }
                format!("Now acting as {}.", role)
            }
            "play_music" => {
                let song = payload["song"].as_str().unwrap_or_default();
                format!("Now playing: {}.", song)
            }
            _ => result.result_text(),
        }
    }

    /// Append `assistant(tool_calls)` + `tool(result)` to the dialogue.
    async fn add_tool_call_message(&self, result_text: &str, call_data: &FunctionCallData) {
        debug!(
            "Tool exchange: {}({}) -> {}",
            call_data.name, call_data.arguments, result_text
        );
        let mut dialogue = self.dialogue.lock().await;
        dialogue
            .put(Message {
                role: "assistant".into(),
                content: String::new(),
                tool_calls: Some(vec![ToolCall {
                    id: call_data.id.clone(),
                    r#type: "function".into(),
                    function: FunctionCall {
                        name: call_data.name.clone(),
                        arguments: call_data.arguments.clone(),
                    },
                    index: 0,
                }]),
                ..Default::default()
            })
            .await;

        let tool_call_id = if call_data.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            call_data.id.clone()
        };
        dialogue
            .put(Message::tool(tool_call_id, result_text))
            .await;
    }

    /// Speak server-originated text, splitting it into ordered segments.
    pub(crate) async fn system_speak(&self, text: &str) -> anyhow::Result<()> {
        if text.is_empty() {
            anyhow::bail!("cannot speak empty text");
        }
        let round = self.talk_round.load(Ordering::Acquire);
        for segment in split_by_punctuation(text) {
            let index = self.tts_last_index.load(Ordering::Acquire) + 1;
            self.tts_last_index.store(index, Ordering::Release);
            let _ = self.speak_and_play(&segment, index, round);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Vision
    // -----------------------------------------------------------------

    async fn handle_image(self: Arc<Self>, value: &serde_json::Value) -> anyhow::Result<()> {
        let round = self.talk_round.fetch_add(1, Ordering::AcqRel) + 1;
        self.round_start_ms.store(now_ms(), Ordering::Release);
        info!("Starting image round {}", round);

        if self.providers.vlm.is_none() {
            warn!("No VLM configured, image message ignored");
            self.send_raw("image processing is not available").await?;
            return Ok(());
        }

        let text = value["text"]
            .as_str()
            .unwrap_or("Please describe this image")
            .to_string();
        let image_map = value["image_data"]
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("image message missing image_data"))?;
        let image = ImageData {
            url: image_map
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            data: image_map
                .get("data")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            format: image_map
                .get("format")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        };
        if image.url.is_empty() && image.data.is_empty() {
            anyhow::bail!("image data empty");
        }

        self.send_stt(&text).await?;
        self.send_tts_event("start", None, None).await?;

        let marker = format!("{} [the user sent a {} image]", text, image.format);
        {
            let mut dialogue = self.dialogue.lock().await;
            dialogue.put(Message::user(marker)).await;
        }

        // The image itself goes to the VLM; earlier image markers are
        // dropped from the context.
        let messages: Vec<Message> = self
            .dialogue
            .lock()
            .await
            .llm_dialogue()
            .iter()
            .filter(|m| !(m.role == "user" && m.content.contains("[the user sent a")))
            .cloned()
            .collect();

        self.gen_response_by_vlm(messages, image, text, round).await
    }

    async fn gen_response_by_vlm(
        self: Arc<Self>,
        messages: Vec<Message>,
        image: ImageData,
        text: String,
        round: u32,
    ) -> anyhow::Result<()> {
        let vlm = self.providers.vlm.as_ref().expect("vlm checked");
        let mut rx = match vlm
            .stream_with_image(&self.session_id, &messages, &image, &text)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                // Degrade to the text model with a note.
                warn!("VLM failed, falling back to text LLM: {}", e);
                let fallback = format!(
                    "{} (note: an attached image could not be processed; answer from the text alone)",
                    text
                );
                let mut fallback_messages = messages;
                fallback_messages.push(Message::user(fallback));
                return self.clone().gen_response_by_llm(fallback_messages, round).await;
            }
        };

        self.server_voice_stop.store(false, Ordering::Release);

        let mut full_text = String::new();
        let mut processed = 0usize;
        let mut text_index = 0i32;

        while let Some(content) = rx.recv().await {
            if content.is_empty() {
                continue;
            }
            full_text.push_str(&content);
            let current = &full_text[processed..];
            if let Some((segment, consumed)) = split_at_last_punctuation(current) {
                text_index += 1;
                self.tts_last_index.store(text_index, Ordering::Release);
                let _ = self.speak_and_play(segment.trim(), text_index, round);
                processed += consumed;
            }
        }

        if full_text.len() > processed {
            let remaining = full_text[processed..].trim().to_string();
            if !remaining.is_empty() {
                text_index += 1;
                self.tts_last_index.store(text_index, Ordering::Release);
                let _ = self.speak_and_play(&remaining, text_index, round);
            }
        }

        if !full_text.is_empty() {
            let mut dialogue = self.dialogue.lock().await;
            dialogue.put(Message::assistant(full_text.clone())).await;
        }
        info!(
            "Vision reply complete: {} chars in {} segments",
            full_text.len(),
            text_index
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Media upload
    // -----------------------------------------------------------------

    async fn handle_media_upload(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        let base64_data = value["media_base64"].as_str().unwrap_or_default();
        if base64_data.is_empty() {
            anyhow::bail!("media_upload missing media_base64");
        }
        let media_type = value["media_type"]
            .as_str()
            .unwrap_or_default()
            .to_lowercase();
        if !matches!(media_type.as_str(), "image" | "video" | "audio") {
            return self
                .send_media_upload_result(false, None, &media_type, "unsupported media type")
                .await;
        }

        info!(
            "Media upload: type={}, device={}, size={}B (base64)",
            media_type,
            self.device_id,
            base64_data.len()
        );

        let data = match BASE64.decode(base64_data) {
            Ok(d) => d,
            Err(e) => {
                error!("Base64 decode failed: {}", e);
                return self
                    .send_media_upload_result(false, None, &media_type, "invalid base64 payload")
                    .await;
            }
        };

        let suffix = sniff_suffix(&media_type, &data);
        let dir = std::path::Path::new(&self.config.media_dir).join(&self.user_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("Failed to create media dir: {}", e);
            return self
                .send_media_upload_result(false, None, &media_type, "storage unavailable")
                .await;
        }
        let path = dir.join(format!("{}.{}", Uuid::new_v4(), suffix));
        if let Err(e) = std::fs::write(&path, &data) {
            error!("Failed to store media file: {}", e);
            return self
                .send_media_upload_result(false, None, &media_type, "storage unavailable")
                .await;
        }

        // Best-effort metadata.
        match media_type.as_str() {
            "image" => {
                if let Some((w, h)) = image_dimensions(&data) {
                    info!("Image dimensions: {}x{}", w, h);
                }
            }
            "audio" | "video" => {
                if let Some(seconds) = estimate_duration(&media_type, &suffix, &data) {
                    info!("Estimated duration: {:.2}s", seconds);
                }
            }
            _ => {}
        }

        self.send_media_upload_result(true, Some((&path, &suffix)), &media_type, "")
            .await
    }

    async fn send_media_upload_result(
        &self,
        success: bool,
        stored: Option<(&std::path::Path, &str)>,
        media_type: &str,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let mut response = json!({
            "type": "media_upload_result",
            "success": success,
            "file_type": media_type,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        if let Some((path, suffix)) = stored {
            response["path"] = json!(path.to_string_lossy());
            response["url"] = json!(format!("/{}", path.to_string_lossy()));
            response["suffix"] = json!(suffix);
        } else {
            response["error"] = json!(error_message);
        }
        self.send_json(&response).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Outbound events
    // -----------------------------------------------------------------

    pub(crate) async fn send_json(&self, value: &serde_json::Value) -> Result<(), TransportError> {
        self.conn
            .write(MessageKind::Text, value.to_string().as_bytes())
            .await
    }

    async fn send_raw(&self, text: &str) -> Result<(), TransportError> {
        self.conn.write(MessageKind::Text, text.as_bytes()).await
    }

    pub(crate) async fn send_stt(&self, text: &str) -> Result<(), TransportError> {
        self.send_json(&json!({"type": "stt", "text": text})).await
    }

    pub(crate) async fn send_tts_event(
        &self,
        state: &str,
        text: Option<&str>,
        index: Option<i32>,
    ) -> Result<(), TransportError> {
        let mut event = json!({"type": "tts", "state": state});
        if let Some(text) = text {
            event["text"] = json!(text);
        }
        if let Some(index) = index {
            event["index"] = json!(index);
        }
        self.send_json(&event).await
    }

    async fn send_hello(&self) -> Result<(), TransportError> {
        let server = self.server_audio.lock().unwrap().clone();
        let mut hello = json!({
            "type": "hello",
            "transport": self.conn.transport_type(),
            "session_id": self.session_id,
            "audio_params": {
                "format": server.format,
                "sample_rate": server.sample_rate,
                "channels": server.channels,
                "frame_duration": server.frame_duration_ms,
            },
        });
        if let Some(udp) = self.conn.udp_info() {
            hello["udp"] = json!({
                "server": udp.server,
                "port": udp.port,
                "key": udp.key,
                "nonce": udp.nonce,
            });
        }
        self.send_json(&hello).await
    }

    /// The `Arc` identity of this handler, recovered from the connection's
    /// worker context. Valid for as long as the session runs.
    fn arc_self(&self) -> Arc<Self> {
        // Sessions are only ever constructed inside an Arc (see
        // `SessionHandler::new`), so this upgrade cannot fail while a
        // worker is alive.
        self.self_arc
            .lock()
            .unwrap()
            .upgrade()
            .expect("session dropped while running")
    }
}

// ---------------------------------------------------------------------------
// ASR listener
// ---------------------------------------------------------------------------

impl AsrEventListener for SessionHandler {
    fn on_asr_result(&self, text: &str, is_final: bool) -> bool {
        let mut text = text.to_string();
        if self.providers.asr.silence_count() >= 2 {
            info!("Two consecutive silences, wrapping up the conversation");
            self.close_after_chat.store(true, Ordering::Release);
            text = SILENT_USER_PROMPT.to_string();
        }

        let mode = self.listen_mode.lock().unwrap().clone();
        match mode.as_str() {
            "manual" => {
                self.client_asr_text.lock().unwrap().push_str(&text);
                if is_final {
                    let full = std::mem::take(&mut *self.client_asr_text.lock().unwrap());
                    info!("[manual] recognized: {}", full);
                    self.dispatch_utterance(full);
                    true
                } else {
                    false
                }
            }
            "realtime" => {
                if text.is_empty() {
                    return false;
                }
                // Barge-in: kill current playback before dispatching.
                self.stop_server_speak();
                let asr = self.providers.asr.clone();
                tokio::spawn(async move {
                    let _ = asr.reset().await;
                });
                info!("[realtime] recognized: {}", text);
                self.dispatch_utterance(text);
                true
            }
            _ => {
                if text.is_empty() {
                    return false;
                }
                info!("[auto] recognized: {}", text);
                self.dispatch_utterance(text);
                true
            }
        }
    }
}

impl SessionHandler {
    fn dispatch_utterance(&self, text: String) {
        let message = json!({"type": "chat", "text": text}).to_string();
        if self.text_tx.try_send(message).is_err() {
            warn!("Text queue full, dropping utterance");
        }
    }
}

// ---------------------------------------------------------------------------
// Media helpers
// ---------------------------------------------------------------------------

fn sniff_suffix(media_type: &str, data: &[u8]) -> String {
    match media_type {
        "image" => {
            if data.starts_with(&[0x89, b'P', b'N', b'G']) {
                "png".into()
            } else if data.starts_with(&[0xFF, 0xD8]) {
                "jpg".into()
            } else if data.starts_with(b"GIF8") {
                "gif".into()
            } else {
                "bin".into()
            }
        }
        "audio" => {
            if data.starts_with(b"RIFF") {
                "wav".into()
            } else if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
                "mp3".into()
            } else if data.starts_with(b"OggS") {
                "ogg".into()
            } else {
                "aac".into()
            }
        }
        "video" => "mp4".into(),
        _ => "bin".into(),
    }
}

fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) && data.len() >= 24 {
        let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        return Some((width, height));
    }
    if data.starts_with(b"GIF8") && data.len() >= 10 {
        let width = u16::from_le_bytes([data[6], data[7]]) as u32;
        let height = u16::from_le_bytes([data[8], data[9]]) as u32;
        return Some((width, height));
    }
    if data.starts_with(&[0xFF, 0xD8]) {
        // Walk JPEG markers looking for a start-of-frame.
        let mut pos = 2;
        while pos + 9 < data.len() {
            if data[pos] != 0xFF {
                pos += 1;
                continue;
            }
            let marker = data[pos + 1];
            let is_sof = matches!(marker, 0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF);
            if is_sof {
                let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]) as u32;
                let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]) as u32;
                return Some((width, height));
            }
            let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 2 + len;
        }
    }
    None
}

/// Fixed-bitrate duration estimates for compressed media; WAV reads its
/// own header. Metadata only, never a contract.
fn estimate_duration(media_type: &str, suffix: &str, data: &[u8]) -> Option<f64> {
    match (media_type, suffix) {
        ("audio", "wav") => {
            let wav = crate::audio::parse_wav(data)?;
            let byte_rate = wav.sample_rate as f64 * wav.channels as f64 * 2.0;
            Some(wav.data.len() as f64 / byte_rate)
        }
        ("audio", _) => Some(data.len() as f64 * 8.0 / 128_000.0),
        ("video", _) => Some(data.len() as f64 * 8.0 / 1_000_000.0),
        _ => None,
    }
}
