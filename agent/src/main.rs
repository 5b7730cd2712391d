//! octoporty Agent
//!
//! Runs beside your internal services, dials out to a Gateway over a
//! persistent WebSocket tunnel, and forwards HTTP requests the Gateway
//! routes to it back to the configured internal hosts.

mod config;
mod config_source;
mod connection;
mod driver;
mod forwarder;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::config::AgentConfig;
use crate::config_source::YamlConfigSource;
use crate::driver::{AgentHandle, Driver};

/// octoporty Agent CLI
#[derive(Parser, Debug)]
#[command(name = "octoporty-agent")]
#[command(about = "octoporty Agent - tunnels internal services out through a Gateway")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/octoporty/agent.yaml")]
    config: PathBuf,

    /// Override gateway URL
    #[arg(long)]
    gateway_url: Option<String>,

    /// Override agent ID
    #[arg(long)]
    agent_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config.display(),
        "starting octoporty agent"
    );

    let mut config = config::load_config(&args.config)?;

    if let Some(url) = args.gateway_url {
        config.gateway.url = url;
    }
    if let Some(id) = args.agent_id {
        config.agent.id = id;
    }
    if config.agent.id.is_empty() || config.agent.id == "auto" {
        config.agent.id = generate_agent_id();
        info!(agent_id = %config.agent.id, "generated agent id");
    }

    let config_source = Arc::new(YamlConfigSource::new(
        config.mappings.file_path.clone(),
        config.mappings.landing_page_file.clone(),
    ));
    config_source.spawn_watcher(std::time::Duration::from_secs(config.mappings.poll_interval_secs));

    let (driver, mut state_rx) = Driver::new(config, config_source)?;
    let _handle = AgentHandle::new(driver.clone());

    tokio::spawn(async move {
        loop {
            if state_rx.changed().await.is_err() {
                return;
            }
            let state = state_rx.borrow().clone();
            info!(state = ?state, "driver state changed");
        }
    });

    driver.run().await
}

/// Initialize logging
fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .json()
        .init();

    Ok(())
}

/// Generate a unique agent ID based on hostname and random suffix
fn generate_agent_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let suffix = uuid::Uuid::new_v4().to_string()[..8].to_string();

    format!("{}-{}", hostname, suffix)
}
