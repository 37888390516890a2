//! Nodelink - device agent host
//!
//! Runs the agent against a gateway until Ctrl+C. Reconnection, cooldowns and
//! backoff are handled inside the agent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nodelink_agent::{Agent, AgentConfig, FileStore, KeyValueStore, StaticIdentity};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Key under which a generated node id is remembered
const NODE_ID_KEY: &str = "node_id";

/// Nodelink - serve tunnels and proxy requests for a gateway
#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(about = "Nodelink - serve tunnels and proxy requests for a gateway")]
#[command(version)]
struct Cli {
    /// Gateway URL (ws:// or wss://)
    #[arg(long, env = "NODELINK_SERVER")]
    server: Option<String>,

    /// Node id (generated and remembered in the state file if not set)
    #[arg(long, env = "NODELINK_NODE_ID")]
    node_id: Option<String>,

    /// Device model reported to the gateway (defaults to the host OS)
    #[arg(long, env = "NODELINK_DEVICE_MODEL")]
    device_model: Option<String>,

    /// YAML config file
    #[arg(short, long, env = "NODELINK_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file caching the node id and IP lookups across restarts
    #[arg(long, env = "NODELINK_STATE_FILE", default_value = "nodelink-state.json")]
    state_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "NODELINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,
}

/// Setup logging with the specified log level; `RUST_LOG` wins when set
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let Some(path) = path else {
        return Ok(AgentConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Fold command line flags over the file config
fn apply_cli(mut config: AgentConfig, cli: &Cli) -> Result<AgentConfig> {
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(node_id) = &cli.node_id {
        config.node_id = Some(node_id.clone());
    }
    if let Some(device_model) = &cli.device_model {
        config.device_model = Some(device_model.clone());
    }
    if cli.insecure {
        config.insecure_skip_verify = true;
    }
    if config.server_url.trim().is_empty() {
        anyhow::bail!("No gateway URL: pass --server or set server_url in the config file");
    }
    Ok(config)
}

/// Configured node id, else the remembered one, else a fresh one
fn resolve_node_id(config: &AgentConfig, store: &dyn KeyValueStore) -> Result<String> {
    if let Some(node_id) = config.node_id.as_ref().filter(|id| !id.trim().is_empty()) {
        return Ok(node_id.clone());
    }
    if let Some(node_id) = store.get(NODE_ID_KEY) {
        return Ok(node_id);
    }

    let node_id = format!("node-{}", uuid::Uuid::new_v4());
    store
        .set(NODE_ID_KEY, &node_id)
        .context("Failed to persist generated node id")?;
    info!("Auto-generated node ID: {}", node_id);
    Ok(node_id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    let mut config = apply_cli(load_config(cli.config.as_deref())?, &cli)?;

    let store = Arc::new(
        FileStore::open(&cli.state_file)
            .with_context(|| format!("Failed to open state file {}", cli.state_file.display()))?,
    );
    config.node_id = Some(resolve_node_id(&config, store.as_ref())?);

    if config.insecure_skip_verify {
        warn!("Certificate verification disabled (insecure mode)");
    }

    let agent = Agent::new(config, Arc::new(StaticIdentity::from_host()), store);

    info!("Node ID: {}", agent.node_id());
    info!("Device model: {}", agent.device_model());
    info!("Gateway: {}", agent.config().server_url);

    agent.start().await.context("Failed to start agent")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    agent.stop().await;

    let stats = agent.stats();
    info!(
        connections = stats.total_connections,
        disconnections = stats.total_disconnections,
        "Nodelink stopped"
    );
    Ok(())
}
