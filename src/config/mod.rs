//! Server configuration: YAML schema and loader.

mod loader;
mod schema;

pub use loader::{load_config, save_config};
pub use schema::{
    AsrConfig, AuthConfig, Config, LlmConfig, MqttConfig, MqttTlsConfig, MqttUdpConfig,
    PoolSizing, RedisConfig, ServerConfig, SessionTuning, TransportConfig, TtsConfig, UdpConfig,
    VadConfig, VllmConfig, WebSocketConfig,
};
