//! Configuration schema for voxserve.
//!
//! The YAML file uses the key names the device fleet already ships with
//! (`dialogStorage`, `CMD_exit`, upper-case provider sections); serde
//! renames keep Rust fields snake_case.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Server / auth
// ---------------------------------------------------------------------------

/// Token entry for the static token store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenEntry {
    #[serde(default)]
    pub token: String,
}

/// Auth store and allow-list configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store: AuthStoreConfig,
    #[serde(default)]
    pub allowed_devices: Vec<String>,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStoreConfig {
    /// memory | file | redis
    #[serde(default = "default_auth_store_type")]
    pub r#type: String,
    /// Expiry in hours.
    #[serde(default = "default_auth_expiry")]
    pub expiry: u32,
}

fn default_auth_store_type() -> String {
    "memory".to_string()
}

fn default_auth_expiry() -> u32 {
    24
}

impl Default for AuthStoreConfig {
    fn default() -> Self {
        Self {
            r#type: default_auth_store_type(),
            expiry: default_auth_expiry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_ip")]
    pub ip: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Shared HMAC secret for device JWTs.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_server_ip(),
            port: default_server_port(),
            token: String::new(),
            auth: AuthConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_server_ip")]
    pub ip: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Allow header injection from query parameters (browser clients cannot
    /// set custom headers on the upgrade request).
    #[serde(default)]
    pub browser: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip: default_server_ip(),
            port: default_server_port(),
            browser: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MqttTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default = "default_true")]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttUdpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_server_ip")]
    pub listen_host: String,
    #[serde(default = "default_udp_port")]
    pub listen_port: u16,
    #[serde(default = "default_localhost")]
    pub external_host: String,
    #[serde(default = "default_udp_port")]
    pub external_port: u16,
}

fn default_udp_port() -> u16 {
    8990
}

fn default_localhost() -> String {
    "127.0.0.1".to_string()
}

impl Default for MqttUdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_host: default_server_ip(),
            listen_port: default_udp_port(),
            external_host: default_localhost(),
            external_port: default_udp_port(),
        }
    }
}

/// UDP sidechannel config alias used by the transport layer.
pub type UdpConfig = MqttUdpConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_in_suffix")]
    pub in_suffix: String,
    #[serde(default = "default_out_suffix")]
    pub out_suffix: String,
    #[serde(default)]
    pub tls: MqttTlsConfig,
    #[serde(default)]
    pub udp: MqttUdpConfig,
}

fn default_broker() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_topic_root() -> String {
    "vox_topic".to_string()
}

fn default_client_id_prefix() -> String {
    "voxserve".to_string()
}

fn default_in_suffix() -> String {
    "in".to_string()
}

fn default_out_suffix() -> String {
    "out".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: default_broker(),
            username: String::new(),
            password: String::new(),
            topic_root: default_topic_root(),
            qos: 0,
            client_id_prefix: default_client_id_prefix(),
            in_suffix: default_in_suffix(),
            out_suffix: default_out_suffix(),
            tls: MqttTlsConfig::default(),
            udp: MqttUdpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport started when nothing else is enabled explicitly.
    #[serde(default = "default_transport")]
    pub default: String,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

fn default_transport() -> String {
    "websocket".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default: default_transport(),
            websocket: WebSocketConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// ASR provider config — vendor-specific, passed through opaquely.
pub type AsrConfig = HashMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub output_dir: String,
    #[serde(default)]
    pub appid: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub cluster: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default, rename = "url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub top_p: f64,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VllmConfig {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default, rename = "url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub top_p: f64,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default)]
    pub r#type: String,
    /// 0..3, higher is more sensitive.
    #[serde(default = "default_vad_aggressiveness")]
    pub aggressiveness: u8,
    /// Frame duration in ms: 10, 20 or 30.
    #[serde(default = "default_vad_frame_duration")]
    pub frame_duration: u32,
}

fn default_vad_aggressiveness() -> u8 {
    2
}

fn default_vad_frame_duration() -> u32 {
    20
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            r#type: String::new(),
            aggressiveness: default_vad_aggressiveness(),
            frame_duration: default_vad_frame_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSizing {
    #[serde(default)]
    pub pool_min_size: usize,
    #[serde(default = "default_pool_max")]
    pub pool_max_size: usize,
    #[serde(default)]
    pub pool_refill_size: usize,
    /// Seconds between pool maintenance passes.
    #[serde(default = "default_pool_check_interval")]
    pub pool_check_interval: u64,
}

fn default_pool_max() -> usize {
    8
}

fn default_pool_check_interval() -> u64 {
    30
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            pool_min_size: 0,
            pool_max_size: default_pool_max(),
            pool_refill_size: 0,
            pool_check_interval: default_pool_check_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage / session tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub service: String,
}

/// Session behavior knobs that are not part of the public config surface
/// but preserve quirks devices depend on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTuning {
    /// In manual listen mode, a `start` with unfinished accumulated ASR
    /// text aborts current playback first.
    #[serde(default = "default_true")]
    pub manual_start_abort: bool,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            manual_start_abort: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub redis_cache: RedisConfig,

    /// System prompt prepended to every dialogue.
    #[serde(default, rename = "prompt")]
    pub default_prompt: String,

    /// postgres | sqlite | redis (postgres and sqlite share the relational
    /// backend; this build ships sqlite).
    #[serde(default, rename = "dialogStorage")]
    pub dialog_storage: String,

    /// SQLite database path for the relational dialogue store.
    #[serde(default = "default_dialog_db")]
    pub dialog_db_path: String,

    #[serde(default)]
    pub delete_audio: bool,

    #[serde(default)]
    pub quick_reply: bool,
    #[serde(default)]
    pub quick_reply_words: Vec<String>,

    /// Spoken commands that close the session without an LLM round trip.
    #[serde(default, rename = "CMD_exit")]
    pub cmd_exit: Vec<String>,

    /// Names of builtin functions exposed to the model.
    #[serde(default)]
    pub local_mcp_fun: Vec<String>,

    /// Directory for media uploads.
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    #[serde(default)]
    pub selected_module: HashMap<String, String>,

    #[serde(default)]
    pub pool_config: PoolSizing,

    #[serde(default, rename = "ASR")]
    pub asr: HashMap<String, AsrConfig>,
    #[serde(default, rename = "TTS")]
    pub tts: HashMap<String, TtsConfig>,
    #[serde(default, rename = "LLM")]
    pub llm: HashMap<String, LlmConfig>,
    #[serde(default, rename = "VLLLM")]
    pub vllm: HashMap<String, VllmConfig>,
    #[serde(default, rename = "VAD")]
    pub vad: HashMap<String, VadConfig>,
    #[serde(default, rename = "AUC")]
    pub auc: HashMap<String, AsrConfig>,

    #[serde(default)]
    pub session: SessionTuning,
}

fn default_dialog_db() -> String {
    "voxserve.db".to_string()
}

fn default_media_dir() -> String {
    "media".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            transport: TransportConfig::default(),
            redis_cache: RedisConfig::default(),
            default_prompt: String::new(),
            dialog_storage: String::new(),
            dialog_db_path: default_dialog_db(),
            delete_audio: false,
            quick_reply: false,
            quick_reply_words: Vec::new(),
            cmd_exit: Vec::new(),
            local_mcp_fun: Vec::new(),
            media_dir: default_media_dir(),
            selected_module: HashMap::new(),
            pool_config: PoolSizing::default(),
            asr: HashMap::new(),
            tts: HashMap::new(),
            llm: HashMap::new(),
            vllm: HashMap::new(),
            vad: HashMap::new(),
            auc: HashMap::new(),
            session: SessionTuning::default(),
        }
    }
}

impl Config {
    /// Look up the selected provider config for a module slot (e.g. "LLM").
    pub fn selected<'a, T>(&self, slot: &str, table: &'a HashMap<String, T>) -> Option<&'a T> {
        let name = self.selected_module.get(slot)?;
        table.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.transport.default, "websocket");
        assert!(cfg.transport.websocket.enabled);
        assert!(!cfg.transport.mqtt.enabled);
        assert_eq!(cfg.transport.mqtt.topic_root, "vox_topic");
        assert_eq!(cfg.transport.mqtt.udp.listen_port, 8990);
        assert!(cfg.session.manual_start_abort);
    }

    #[test]
    fn test_yaml_surface_keys() {
        let yaml = r#"
server:
  ip: 127.0.0.1
  port: 9000
  token: secret
transport:
  default: mqtt
  mqtt:
    enabled: true
    broker: tcp://broker:1883
    topic_root: devices
    udp:
      enabled: true
      listen_port: 9990
selected_module:
  LLM: main
LLM:
  main:
    type: openai
    model_name: gpt-x
    url: https://api.example.com/v1
    api_key: k
dialogStorage: sqlite
CMD_exit: ["goodbye", "exit"]
quick_reply: true
quick_reply_words: ["hello there"]
prompt: you are a helpful assistant
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert!(cfg.transport.mqtt.enabled);
        assert!(cfg.transport.mqtt.udp.enabled);
        assert_eq!(cfg.dialog_storage, "sqlite");
        assert_eq!(cfg.cmd_exit, vec!["goodbye", "exit"]);
        let llm = cfg.selected("LLM", &cfg.llm).unwrap();
        assert_eq!(llm.model_name, "gpt-x");
        assert_eq!(llm.base_url, "https://api.example.com/v1");
        assert_eq!(cfg.default_prompt, "you are a helpful assistant");
    }

    #[test]
    fn test_selected_module_missing() {
        let cfg = Config::default();
        assert!(cfg.selected("LLM", &cfg.llm).is_none());
    }
}
