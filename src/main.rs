//! SSR Bridge CLI entry point.
//!
//! This is the main entry point for running the ssr-bridge HTTP server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssr_bridge_common::ConfigFile;
use ssr_bridge_server::{AppState, BridgeServer, ServerConfig};

/// Serve server-side rendered pages from an embedded JavaScript runtime.
#[derive(Debug, Parser)]
#[command(name = "ssr-bridge", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "SSR_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, overriding the configuration file.
    #[arg(short, long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Directory of the render bundle, overriding the configuration file.
    #[arg(long, env = "SSR_SCRIPT_ROOT")]
    script_root: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting SSR Bridge");

    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ConfigFile::default(),
    };
    if let Some(root) = cli.script_root {
        file.bridge.worker.script_root = root;
    }

    let mut server_config =
        ServerConfig::from_file(&file.server).context("Invalid [server] configuration")?;
    if let Some(bind) = cli.bind {
        server_config = server_config.with_bind_addr(bind);
    }

    info!(
        bind_addr = %server_config.bind_addr,
        script_root = %file.bridge.worker.script_root.display(),
        entry_module = %file.bridge.worker.entry_module,
        "Configuration loaded"
    );

    let state = AppState::start(&file.bridge)
        .await
        .context("Failed to start the runtime worker")?;
    let server = BridgeServer::with_state(state, server_config).with_admin(&file.admin)?;

    info!("Server initialized. Available endpoints:");
    info!("  GET  /health              - Health check");
    info!("  GET  /ready               - Readiness check");
    info!("  GET  /*path               - Render a page");
    if file.admin.enabled {
        info!(prefix = %file.admin.prefix, "  Admin API enabled");
    }

    server.run().await?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,ssr_bridge=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
