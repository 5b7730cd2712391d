//! octoporty Gateway
//!
//! Terminates one Agent's tunnel at a time, reconciles the edge proxy's
//! routes against the Agent's configuration, and relays external HTTP
//! traffic over the tunnel and back.

mod acceptor;
mod config;
mod edge_proxy;
mod log_ring;
mod router;
mod session;
mod transport;
mod update;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::edge_proxy::EdgeProxyController;
use crate::log_ring::{LogRing, TunnelLogLayer};
use crate::session::SessionManager;
use crate::update::UpdateCoordinator;

/// octoporty Gateway CLI
#[derive(Parser, Debug)]
#[command(name = "octoporty-gateway")]
#[command(about = "octoporty Gateway - public-facing relay between the internet and tunnel-connected agents")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/octoporty/gateway.yaml")]
    config: PathBuf,

    /// Override the listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Shared gateway state, reachable from every axum handler.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub gateway_version: String,
    pub session_manager: SessionManager,
    pub edge_proxy: edge_proxy::SharedEdgeProxy,
    pub update_coordinator: Arc<UpdateCoordinator>,
    pub log_ring: Arc<LogRing>,
    pub log_layer: Arc<TunnelLogLayer>,
    pub landing_page: ArcSwapOption<(String, String)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(&args.config)?;
    if let Some(port) = args.listen_port {
        config.gateway.listen_port = port;
    }

    let log_ring = Arc::new(LogRing::default());
    let log_layer = Arc::new(TunnelLogLayer::new(log_ring.clone()));
    init_logging(&args.log_level, log_layer.clone())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config.display(),
        gateway_id = %config.gateway.id,
        "starting octoporty gateway"
    );

    let edge_proxy = Arc::new(EdgeProxyController::new(
        config.edge_proxy.caddy_admin_url.clone(),
        format!("{}:{}", config.gateway.listen_addr, config.gateway.listen_port),
        std::time::Duration::from_secs(config.edge_proxy.reconcile_timeout_secs),
    ));

    let update_coordinator = Arc::new(UpdateCoordinator::new(
        config.update.allow_remote_update,
        config.update.signal_path.clone(),
        env!("CARGO_PKG_VERSION").to_string(),
    ));

    let state = Arc::new(GatewayState {
        gateway_version: env!("CARGO_PKG_VERSION").to_string(),
        session_manager: SessionManager::new(),
        edge_proxy,
        update_coordinator,
        log_ring,
        log_layer,
        landing_page: ArcSwapOption::empty(),
        config: config.clone(),
    });

    let app = Router::new()
        .route("/tunnel", get(acceptor::upgrade))
        .route("/health", get(health_handler))
        .fallback(router::handle)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.gateway.listen_addr, config.gateway.listen_port).parse()?;
    info!(addr = %addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Install the standard formatted logger alongside the tunnel log sink
/// layer, so every event is both printed locally and captured in the
/// log ring for replay over the tunnel.
fn init_logging(level: &str, log_layer: Arc<TunnelLogLayer>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logging subscriber: {e}"))
}
