//! Shared test support: a scriptable provider set and an in-memory
//! connection for driving full sessions without sockets.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};

use voxserve::config::Config;
use voxserve::dialogue::memory::SqliteStore;
use voxserve::dialogue::Message;
use voxserve::errors::TransportError;
use voxserve::mcp::external::ExternalMcpPool;
use voxserve::providers::{
    AsrEventListener, AsrProvider, LlmChunk, LlmProvider, ProviderSet, TtsProvider, VadProvider,
};
use voxserve::session::SessionHandler;
use voxserve::transport::{ConnectContext, Connection, MessageKind};

// ---------------------------------------------------------------------------
// Mock connection
// ---------------------------------------------------------------------------

pub struct MockConnection {
    incoming_tx: mpsc::Sender<(MessageKind, Vec<u8>)>,
    incoming_rx: TokioMutex<mpsc::Receiver<(MessageKind, Vec<u8>)>>,
    sent: StdMutex<Vec<(MessageKind, Vec<u8>)>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        Arc::new(Self {
            incoming_tx,
            incoming_rx: TokioMutex::new(incoming_rx),
            sent: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }

    pub async fn push_json(&self, value: serde_json::Value) {
        self.incoming_tx
            .send((MessageKind::Text, value.to_string().into_bytes()))
            .await
            .expect("session gone");
    }

    pub async fn push_binary(&self, data: Vec<u8>) {
        self.incoming_tx
            .send((MessageKind::Binary, data))
            .await
            .expect("session gone");
    }

    /// All text frames sent so far, parsed as JSON.
    pub fn sent_events(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == MessageKind::Text)
            .filter_map(|(_, data)| serde_json::from_slice(data).ok())
            .collect()
    }

    /// All binary frames sent so far.
    pub fn sent_binary(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == MessageKind::Binary)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Frames in transmission order, text frames parsed.
    pub fn sent_sequence(&self) -> Vec<SentFrame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, data)| match kind {
                MessageKind::Text => {
                    SentFrame::Event(serde_json::from_slice(data).unwrap_or_default())
                }
                MessageKind::Binary => SentFrame::Audio(data.clone()),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum SentFrame {
    Event(serde_json::Value),
    Audio(Vec<u8>),
}

#[async_trait]
impl Connection for MockConnection {
    async fn write(&self, kind: MessageKind, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push((kind, data.to_vec()));
        Ok(())
    }

    async fn read(&self) -> Result<(MessageKind, Vec<u8>), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut rx = self.incoming_rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
            _ = self.closed_notify.notified() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
    }

    fn id(&self) -> String {
        "mock-conn".into()
    }

    fn transport_type(&self) -> &'static str {
        "websocket"
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn last_active_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// ---------------------------------------------------------------------------
// Scripted providers
// ---------------------------------------------------------------------------

pub struct ScriptAsr {
    listener: StdMutex<Option<Arc<dyn AsrEventListener>>>,
    pub audio_bytes: AtomicUsize,
    pub silence: AtomicU32,
    pub finalize_calls: AtomicUsize,
    pub audio_calls: StdMutex<Vec<usize>>,
}

impl ScriptAsr {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listener: StdMutex::new(None),
            audio_bytes: AtomicUsize::new(0),
            silence: AtomicU32::new(0),
            finalize_calls: AtomicUsize::new(0),
            audio_calls: StdMutex::new(Vec::new()),
        })
    }

    /// Deliver a recognition result to the session's listener.
    pub fn emit(&self, text: &str, is_final: bool) -> bool {
        let listener = self.listener.lock().unwrap().clone();
        listener
            .map(|l| l.on_asr_result(text, is_final))
            .unwrap_or(false)
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

#[async_trait]
impl AsrProvider for ScriptAsr {
    fn set_listener(&self, listener: Arc<dyn AsrEventListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn add_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
        self.audio_bytes.fetch_add(pcm.len(), Ordering::Relaxed);
        self.audio_calls.lock().unwrap().push(pcm.len());
        Ok(())
    }

    async fn send_last_audio(&self, _pcm: &[u8]) -> anyhow::Result<()> {
        self.finalize_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn silence_count(&self) -> u32 {
        self.silence.load(Ordering::Relaxed)
    }

    fn reset_silence_count(&self) {
        self.silence.store(0, Ordering::Relaxed);
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close_connection(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct ScriptLlm {
    responses: StdMutex<VecDeque<Vec<LlmChunk>>>,
    pub calls: StdMutex<Vec<Vec<Message>>>,
}

impl ScriptLlm {
    pub fn new(responses: Vec<Vec<LlmChunk>>) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(responses.into()),
            calls: StdMutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn content_chunk(text: &str) -> LlmChunk {
    LlmChunk {
        content: Some(text.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl LlmProvider for ScriptLlm {
    async fn stream_with_functions(
        &self,
        _session_id: &str,
        dialogue: &[Message],
        _tools: &[serde_json::Value],
    ) -> anyhow::Result<mpsc::Receiver<LlmChunk>> {
        self.calls.lock().unwrap().push(dialogue.to_vec());
        let chunks = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        Ok(rx)
    }

    async fn stream(
        &self,
        session_id: &str,
        dialogue: &[Message],
    ) -> anyhow::Result<mpsc::Receiver<String>> {
        let mut chunks = self
            .stream_with_functions(session_id, dialogue, &[])
            .await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                if let Some(content) = chunk.content {
                    if tx.send(content).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    fn set_identity_flag(&self, _key: &str, _value: &str) {}

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Synthesizer writing short PCM WAVs whose samples carry the synthesis
/// ordinal, so transmitted frames are attributable to their segment.
pub struct FileTts {
    dir: PathBuf,
    counter: AtomicUsize,
    pub texts: StdMutex<Vec<String>>,
    voice: StdMutex<String>,
}

impl FileTts {
    pub fn new(dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            dir,
            counter: AtomicUsize::new(0),
            texts: StdMutex::new(Vec::new()),
            voice: StdMutex::new("test-voice".into()),
        })
    }

    pub fn synth_count(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    fn wav_filled(fill: u8) -> Vec<u8> {
        // 120 ms at 16 kHz mono: exactly two 60 ms frames.
        let data_len = 16000 * 2 * 120 / 1000;
        let mut out = Vec::with_capacity(44 + data_len);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&16000u32.to_le_bytes());
        out.extend_from_slice(&32000u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        out.extend(std::iter::repeat(fill).take(data_len));
        out
    }
}

#[async_trait]
impl TtsProvider for FileTts {
    async fn synthesize(&self, text: &str) -> anyhow::Result<PathBuf> {
        let ordinal = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.texts.lock().unwrap().push(text.to_string());
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("seg_{}.wav", ordinal));
        std::fs::write(&path, Self::wav_filled(ordinal as u8))?;
        Ok(path)
    }

    fn provider_type(&self) -> String {
        "file".into()
    }

    fn voice(&self) -> String {
        self.voice.lock().unwrap().clone()
    }

    fn set_voice(&self, voice: &str) {
        *self.voice.lock().unwrap() = voice.to_string();
    }
}

/// VAD that reports voice whenever any sample is non-zero.
pub struct NonZeroVad;

impl VadProvider for NonZeroVad {
    fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(&self, pcm: &[u8], _sample_rate: u32, _frame_ms: u32) -> anyhow::Result<bool> {
        Ok(pcm.iter().any(|&b| b != 0))
    }
}

// ---------------------------------------------------------------------------
// Session bootstrapping
// ---------------------------------------------------------------------------

pub struct TestSession {
    pub handler: Arc<SessionHandler>,
    pub conn: Arc<MockConnection>,
    pub asr: Arc<ScriptAsr>,
    pub llm: Arc<ScriptLlm>,
    pub tts: Arc<FileTts>,
    pub run: tokio::task::JoinHandle<()>,
    pub tempdir: tempfile::TempDir,
}

pub struct SessionOptions {
    pub config: Config,
    pub llm_responses: Vec<Vec<LlmChunk>>,
    pub sqlite: Option<Arc<SqliteStore>>,
    pub enable_vad: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            config: Config::default(),
            llm_responses: Vec::new(),
            sqlite: None,
            enable_vad: false,
        }
    }
}

pub fn start_session(options: SessionOptions) -> TestSession {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let conn = MockConnection::new();
    let asr = ScriptAsr::new();
    let llm = ScriptLlm::new(options.llm_responses);
    let tts = FileTts::new(tempdir.path().join("tts"));

    let providers = ProviderSet {
        asr: asr.clone(),
        llm: llm.clone(),
        tts: tts.clone(),
        vad: if options.enable_vad {
            Some(Arc::new(NonZeroVad))
        } else {
            None
        },
        vlm: None,
    };

    let ctx = ConnectContext {
        device_id: "dev-1".into(),
        client_id: "client-1".into(),
        session_id: "sess-1".into(),
        transport_type: "websocket".into(),
        user_id: "42".into(),
        enable_vad: options.enable_vad,
        headers: Default::default(),
    };

    let handler = SessionHandler::new(
        Arc::new(options.config),
        conn.clone(),
        providers,
        &ctx,
        Arc::new(ExternalMcpPool::new()),
        options.sqlite,
        None,
    );

    let run = tokio::spawn(handler.clone().run());

    TestSession {
        handler,
        conn,
        asr,
        llm,
        tts,
        run,
        tempdir,
    }
}

/// Poll `predicate` until it holds or `timeout_ms` elapses.
pub async fn wait_for<F: Fn() -> bool>(predicate: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The client hello used by most scenarios: raw PCM at 16 kHz.
pub fn pcm_hello() -> serde_json::Value {
    serde_json::json!({
        "type": "hello",
        "audio_params": {
            "format": "pcm",
            "sample_rate": 16000,
            "channels": 1,
            "frame_duration": 20,
        }
    })
}

/// Collect `(state, text, index)` tuples of every tts event sent.
pub fn tts_states(events: &[serde_json::Value]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e["type"] == "tts")
        .map(|e| e["state"].as_str().unwrap_or_default().to_string())
        .collect()
}
