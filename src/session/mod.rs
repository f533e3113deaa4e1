//! Per-connection session supervisor.
//!
//! One `SessionHandler` owns everything a connected device needs: the
//! transport connection, a borrowed provider set, the dialogue manager, the
//! VAD state and five bounded queues drained by dedicated workers. The
//! worker set is fixed; every queue chooses freshness over completeness
//! (overflow drops and logs).

mod egress;
mod handler;
mod vad_state;

pub use vad_state::VadState;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tracing::{error, info, warn};

use crate::audio::OpusAudioDecoder;
use crate::config::Config;
use crate::dialogue::memory::{build_memory, SqliteStore};
use crate::dialogue::DialogueManager;
use crate::mcp::dispatcher::McpDispatcher;
use crate::mcp::external::ExternalMcpPool;
use crate::providers::pool::ProviderPool;
use crate::providers::{BotConfig, ProviderSet, UserConfigService};
use crate::transport::{ConnectContext, Connection, ConnectionAcceptor, MessageKind};
use crate::utils::quick_reply::QuickReplyCache;

const QUEUE_CAPACITY: usize = 100;

/// Negotiated audio parameters for one direction.
#[derive(Debug, Clone)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_duration_ms: u32,
}

impl AudioParams {
    fn client_default() -> Self {
        Self {
            format: "opus".into(),
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 20,
        }
    }

    fn server_default() -> Self {
        Self {
            format: "opus".into(),
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 60,
        }
    }
}

/// A punctuation-bounded synthesis job.
#[derive(Debug, Clone)]
pub(crate) struct TtsTask {
    pub text: String,
    pub round: u32,
    pub text_index: i32,
}

/// A synthesized (or skipped) segment awaiting transmission.
#[derive(Debug, Clone)]
pub(crate) struct AudioSendTask {
    pub filepath: Option<PathBuf>,
    pub text: String,
    pub round: u32,
    pub text_index: i32,
}

pub(crate) struct SessionReceivers {
    audio: mpsc::Receiver<Vec<u8>>,
    text: mpsc::Receiver<String>,
    mcp: mpsc::Receiver<serde_json::Value>,
    tts: mpsc::Receiver<TtsTask>,
    audio_send: mpsc::Receiver<AudioSendTask>,
}

/// Per-connection pipeline supervisor.
pub struct SessionHandler {
    config: Arc<Config>,
    conn: Arc<dyn Connection>,
    providers: ProviderSet,

    session_id: String,
    device_id: String,
    client_id: String,
    user_id: String,

    client_audio: StdMutex<AudioParams>,
    server_audio: StdMutex<AudioParams>,
    opus_decoder: StdMutex<Option<OpusAudioDecoder>>,

    listen_mode: StdMutex<String>,
    client_asr_text: StdMutex<String>,
    close_after_chat: AtomicBool,
    server_voice_stop: AtomicBool,
    talk_round: AtomicU32,
    round_start_ms: AtomicI64,
    tts_last_index: AtomicI32,
    rate_snap_logged: AtomicBool,
    closed: AtomicBool,
    stop: Notify,

    enable_vad: bool,
    vad_state: Option<VadState>,

    dialogue: TokioMutex<DialogueManager>,
    dispatcher: McpDispatcher,
    user_configs: StdMutex<Vec<BotConfig>>,
    user_config_service: Option<Arc<dyn UserConfigService>>,
    quick_reply_cache: QuickReplyCache,
    initial_voice: String,

    audio_tx: mpsc::Sender<Vec<u8>>,
    text_tx: mpsc::Sender<String>,
    mcp_tx: mpsc::Sender<serde_json::Value>,
    tts_tx: mpsc::Sender<TtsTask>,
    audio_send_tx: mpsc::Sender<AudioSendTask>,
    receivers: StdMutex<Option<SessionReceivers>>,
    /// Weak back-reference so the recognizer listener can be handed out by
    /// identity without a reference cycle.
    self_arc: StdMutex<Weak<SessionHandler>>,
}

impl SessionHandler {
    /// Assemble a session around an accepted connection.
    pub fn new(
        config: Arc<Config>,
        conn: Arc<dyn Connection>,
        providers: ProviderSet,
        ctx: &ConnectContext,
        external_mcp: Arc<ExternalMcpPool>,
        sqlite: Option<Arc<SqliteStore>>,
        user_config_service: Option<Arc<dyn UserConfigService>>,
    ) -> Arc<Self> {
        let (audio_tx, audio_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (text_tx, text_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (mcp_tx, mcp_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (tts_tx, tts_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (audio_send_tx, audio_send_rx) = mpsc::channel(QUEUE_CAPACITY);

        let enable_vad = ctx.enable_vad && providers.vad.is_some();
        // 16 kHz, 16-bit mono at 20 ms -> 640-byte frames; 200 ms silence
        // closes the utterance.
        let vad_state = if enable_vad {
            let state = VadState::new(640, 200);
            state.set_max_buffer_frames(3);
            Some(state)
        } else {
            None
        };

        let memory = if ctx.user_id.is_empty() {
            None
        } else {
            build_memory(
                &config.dialog_storage,
                &ctx.user_id,
                sqlite,
                &config.redis_cache,
            )
        };
        let mut dialogue = DialogueManager::new(memory);
        dialogue.set_system_message(&config.default_prompt);

        let initial_voice = providers.tts.voice();
        let quick_reply_cache =
            QuickReplyCache::new(&providers.tts.provider_type(), &initial_voice);

        let dispatcher = McpDispatcher::new(&config.local_mcp_fun, external_mcp);

        let handler = Arc::new(Self {
            config,
            conn,
            providers,
            session_id: ctx.session_id.clone(),
            device_id: ctx.device_id.clone(),
            client_id: ctx.client_id.clone(),
            user_id: ctx.user_id.clone(),
            client_audio: StdMutex::new(AudioParams::client_default()),
            server_audio: StdMutex::new(AudioParams::server_default()),
            opus_decoder: StdMutex::new(None),
            listen_mode: StdMutex::new("auto".to_string()),
            client_asr_text: StdMutex::new(String::new()),
            close_after_chat: AtomicBool::new(false),
            server_voice_stop: AtomicBool::new(false),
            talk_round: AtomicU32::new(0),
            round_start_ms: AtomicI64::new(0),
            tts_last_index: AtomicI32::new(-1),
            rate_snap_logged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop: Notify::new(),
            enable_vad,
            vad_state,
            dialogue: TokioMutex::new(dialogue),
            dispatcher,
            user_configs: StdMutex::new(Vec::new()),
            user_config_service,
            quick_reply_cache,
            initial_voice,
            audio_tx,
            text_tx,
            mcp_tx,
            tts_tx,
            audio_send_tx,
            receivers: StdMutex::new(Some(SessionReceivers {
                audio: audio_rx,
                text: text_rx,
                mcp: mcp_rx,
                tts: tts_rx,
                audio_send: audio_send_rx,
            })),
            self_arc: StdMutex::new(Weak::new()),
        });
        *handler.self_arc.lock().unwrap() = Arc::downgrade(&handler);
        handler
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

/// Bridges transports to sessions: borrows a provider set from the pool,
/// runs the session to completion and returns the set.
pub struct SessionAcceptor {
    config: Arc<Config>,
    pool: Arc<ProviderPool>,
    external_mcp: Arc<ExternalMcpPool>,
    sqlite: Option<Arc<SqliteStore>>,
    user_config_service: Option<Arc<dyn UserConfigService>>,
}

impl SessionAcceptor {
    pub fn new(
        config: Arc<Config>,
        pool: Arc<ProviderPool>,
        external_mcp: Arc<ExternalMcpPool>,
        sqlite: Option<Arc<SqliteStore>>,
        user_config_service: Option<Arc<dyn UserConfigService>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            external_mcp,
            sqlite,
            user_config_service,
        })
    }
}

#[async_trait::async_trait]
impl ConnectionAcceptor for SessionAcceptor {
    async fn accept(&self, conn: Arc<dyn Connection>, ctx: ConnectContext) {
        let providers = match self.pool.acquire(&ctx.session_id).await {
            Ok(set) => set,
            Err(e) => {
                error!("No provider set available for session {}: {}", ctx.session_id, e);
                let body = serde_json::json!({
                    "type": "error",
                    "code": "PROVIDER_UNAVAILABLE",
                    "message": "no provider capacity",
                });
                let _ = conn
                    .write(MessageKind::Text, body.to_string().as_bytes())
                    .await;
                conn.close().await;
                return;
            }
        };

        info!(
            "Session starting: session={}, device={}, transport={}",
            ctx.session_id,
            ctx.device_id,
            conn.transport_type()
        );

        let handler = SessionHandler::new(
            self.config.clone(),
            conn,
            providers.clone(),
            &ctx,
            self.external_mcp.clone(),
            self.sqlite.clone(),
            self.user_config_service.clone(),
        );

        handler.run().await;

        if let Err(e) = providers.llm.cleanup().await {
            warn!("LLM cleanup failed for session {}: {}", ctx.session_id, e);
        }
        self.pool.release(providers).await;
        info!("Session ended: session={}", ctx.session_id);
    }
}
