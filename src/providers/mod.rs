//! Provider contracts for the session pipeline.
//!
//! The core never talks to a vendor protocol directly: recognizers,
//! models, synthesizers and detectors are trait objects borrowed from the
//! process-wide pool for the lifetime of one session.

pub mod dev;
pub mod energy_vad;
pub mod factory;
pub mod openai;
pub mod pool;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::dialogue::{Message, ToolCall};

/// Narrow callback the recognizer invokes on results.
///
/// The session implements this and hands itself to the provider by
/// identity; the provider holds no further reference into the session.
pub trait AsrEventListener: Send + Sync {
    /// Called for every partial or final result. Returning `true` pauses
    /// recognition until the next utterance begins.
    fn on_asr_result(&self, text: &str, is_final: bool) -> bool;
}

/// Streaming speech recognizer.
#[async_trait]
pub trait AsrProvider: Send + Sync {
    fn set_listener(&self, listener: Arc<dyn AsrEventListener>);

    /// Capability probe for per-user configuration.
    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    /// Feed PCM bytes into the recognizer.
    async fn add_audio(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Feed the final chunk of an utterance; an empty slice marks
    /// end-of-utterance without more audio.
    async fn send_last_audio(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Consecutive silence gaps the recognizer has reported.
    fn silence_count(&self) -> u32;

    fn reset_silence_count(&self);

    /// Reset recognition state for the next utterance.
    async fn reset(&self) -> anyhow::Result<()>;

    /// Tear down any vendor connection.
    async fn close_connection(&self) -> anyhow::Result<()>;
}

/// One streamed chunk of a model reply.
#[derive(Debug, Clone, Default)]
pub struct LlmChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
}

/// Streaming chat model.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Streamed completion with tool specs exposed to the model.
    async fn stream_with_functions(
        &self,
        session_id: &str,
        dialogue: &[Message],
        tools: &[serde_json::Value],
    ) -> anyhow::Result<mpsc::Receiver<LlmChunk>>;

    /// Plain streamed completion; yields content fragments.
    async fn stream(
        &self,
        session_id: &str,
        dialogue: &[Message],
    ) -> anyhow::Result<mpsc::Receiver<String>>;

    /// Scope provider-side conversation state (e.g. `("session", id)`).
    fn set_identity_flag(&self, key: &str, value: &str);

    /// Capability probe for per-user configuration.
    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// Text-to-speech synthesizer producing an audio file per segment.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<PathBuf>;

    fn provider_type(&self) -> String;

    fn voice(&self) -> String;

    fn set_voice(&self, voice: &str);

    /// Capability probe for per-user configuration.
    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }
}

/// Voice-activity detector: a binary speech decision over one PCM window.
pub trait VadProvider: Send + Sync {
    /// Drop accumulated detector state. Called before every check.
    fn reset(&self) -> anyhow::Result<()>;

    /// True when the window contains speech. `pcm` is 16-bit little-endian
    /// mono.
    fn process(&self, pcm: &[u8], sample_rate: u32, frame_ms: u32) -> anyhow::Result<bool>;
}

/// Image payload of a vision turn: a URL or inline base64 data.
#[derive(Debug, Clone, Default)]
pub struct ImageData {
    pub url: String,
    pub data: String,
    pub format: String,
}

/// Vision-language model.
#[async_trait]
pub trait VlmProvider: Send + Sync {
    async fn stream_with_image(
        &self,
        session_id: &str,
        dialogue: &[Message],
        image: &ImageData,
        text: &str,
    ) -> anyhow::Result<mpsc::Receiver<String>>;
}

/// Capability probe for providers that accept per-user overrides (API key,
/// model name, voice). Callers ignore and log when a provider opts out.
pub trait Configurable: Send + Sync {
    fn apply_user_config(&self, config: &serde_json::Value) -> anyhow::Result<()>;
}

/// The provider bundle a session borrows for its lifetime.
#[derive(Clone)]
pub struct ProviderSet {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub vad: Option<Arc<dyn VadProvider>>,
    pub vlm: Option<Arc<dyn VlmProvider>>,
}

impl ProviderSet {
    /// Apply a per-user override to one provider slot through the
    /// [`Configurable`] probe. Providers that don't opt in are skipped with
    /// a log line.
    pub fn apply_user_config(&self, slot: &str, config: &serde_json::Value) {
        let configurable = match slot {
            "ASR" => self.asr.as_configurable(),
            "LLM" => self.llm.as_configurable(),
            "TTS" => self.tts.as_configurable(),
            _ => None,
        };
        match configurable {
            Some(provider) => {
                if let Err(e) = provider.apply_user_config(config) {
                    tracing::warn!("User config for {} rejected: {}", slot, e);
                }
            }
            None => {
                tracing::info!("{} provider is not configurable, ignoring user override", slot);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-user bot configs
// ---------------------------------------------------------------------------

/// Per-(user, bot) model configuration surfaced as a callable function.
#[derive(Debug, Clone, Default)]
pub struct BotConfig {
    pub id: u32,
    pub llm_type: String,
    pub model_name: String,
    pub base_url: String,
    pub api_key: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub requires_network: bool,
    pub function_name: String,
    pub description: String,
    /// JSON schema of the function parameters.
    pub parameters: serde_json::Value,
}

/// Read-only source of a user's bot configurations.
#[async_trait]
pub trait UserConfigService: Send + Sync {
    async fn user_configs(&self, user_id: &str) -> anyhow::Result<Vec<BotConfig>>;
}

impl BotConfig {
    /// Render as an OpenAI tool spec for the function registry.
    pub fn to_tool_spec(&self) -> Option<serde_json::Value> {
        if self.function_name.is_empty() {
            return None;
        }
        Some(serde_json::json!({
            "type": "function",
            "function": {
                "name": self.function_name,
                "description": self.description,
                "parameters": self.parameters,
            }
        }))
    }
}
