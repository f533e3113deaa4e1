//! Domain error types for voxserve.
//!
//! Typed errors at module boundaries replace string-encoded errors and
//! enable structured error handling via pattern matching.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors from the transport layer (WebSocket, MQTT, UDP sidechannel).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("write timed out after {0}s")]
    WriteTimeout(u64),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("UDP packet malformed: {0}")]
    UdpMalformed(String),

    #[error("UDP decrypt failed: {0}")]
    UdpDecrypt(String),

    #[error("UDP sequence regressed: expected >= {expected}, got {got}")]
    UdpSequence { expected: u32, got: u32 },

    #[error("queue full, message dropped")]
    QueueFull,
}

// ---------------------------------------------------------------------------
// Auth errors
// ---------------------------------------------------------------------------

/// Errors from token verification.
///
/// Every variant maps to the one-shot `error{AUTH_FAILED}` frame; the
/// distinction matters only for logging.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingToken,

    #[error("token verification failed: {0}")]
    InvalidToken(String),

    #[error("device id mismatch: request={request}, token={token}")]
    DeviceMismatch { request: String, token: String },
}

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Errors from ASR/LLM/TTS/VAD/VLM provider operations.
///
/// Embedded in `anyhow::Error` so provider trait signatures
/// (`-> anyhow::Result<...>`) stay unchanged while callers can downcast:
/// `e.downcast_ref::<ProviderError>()`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("failed to parse response JSON: {0}")]
    JsonParseError(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("missing API key for provider {0}")]
    MissingApiKey(String),

    #[error("synthesis produced no audio for text: {0}")]
    EmptySynthesis(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Structured error code for the client-facing refusal path.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProviderError::MissingApiKey(_) => "MISSING_API_KEY",
            ProviderError::Unavailable(_) => "PROVIDER_UNAVAILABLE",
            _ => "PROVIDER_ERROR",
        }
    }
}

// ---------------------------------------------------------------------------
// Memory errors
// ---------------------------------------------------------------------------

/// Errors from dialogue memory backends.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serde(e.to_string())
    }
}
