//! voxserve — realtime voice dialogue server.
//!
//! Devices connect over WebSocket or MQTT, stream speech in, and get
//! streamed model replies back as synthesized audio.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use voxserve::auth::AuthToken;
use voxserve::config::load_config;
use voxserve::dialogue::memory::SqliteStore;
use voxserve::mcp::external::ExternalMcpPool;
use voxserve::providers::factory::provider_factory;
use voxserve::providers::pool::ProviderPool;
use voxserve::session::SessionAcceptor;
use voxserve::transport::mqtt::MqttTransport;
use voxserve::transport::websocket::WebSocketTransport;

#[derive(Parser)]
#[command(name = "voxserve", about = "Realtime voice dialogue server", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (e.g. "info", "voxserve=debug").
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(load_config(cli.config.as_deref()));
    if config.server.token.is_empty() {
        warn!("server.token is empty; device authentication will reject everything");
    }

    let auth = Arc::new(AuthToken::with_topic_root(
        &config.server.token,
        &config.transport.mqtt.topic_root,
    ));

    let sqlite = match config.dialog_storage.to_lowercase().as_str() {
        "postgres" | "sqlite" => Some(Arc::new(SqliteStore::open(Path::new(
            &config.dialog_db_path,
        ))?)),
        _ => None,
    };

    let external_mcp = Arc::new(ExternalMcpPool::new());
    let pool = ProviderPool::new(config.pool_config.clone(), provider_factory(config.clone()))?;
    pool.start_maintenance();

    let acceptor = SessionAcceptor::new(
        config.clone(),
        pool.clone(),
        external_mcp.clone(),
        sqlite,
        None,
    );

    let mut websocket = None;
    if config.transport.websocket.enabled {
        let transport = WebSocketTransport::new(config.clone(), auth.clone(), acceptor.clone());
        transport.start().await?;
        websocket = Some(transport);
    }

    let mut mqtt = None;
    if config.transport.mqtt.enabled {
        let transport = MqttTransport::new(config.clone(), auth.clone(), acceptor.clone());
        transport.clone().start().await?;
        mqtt = Some(transport);
    }

    if websocket.is_none() && mqtt.is_none() {
        anyhow::bail!("no transport enabled; enable transport.websocket or transport.mqtt");
    }

    info!("voxserve running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(transport) = &websocket {
        transport.stop();
    }
    if let Some(transport) = &mqtt {
        transport.stop();
    }
    pool.stop();
    external_mcp.shutdown().await;

    Ok(())
}
