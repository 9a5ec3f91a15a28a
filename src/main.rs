//! mcp-hub: serves every configured backend's tools on stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mcp_hub::local::register_local_tools;
use mcp_hub::orchestrator::BridgeStatus;
use mcp_hub::{
    load_config_from_file, server, BridgeOrchestrator, EnvSnapshot, HubRegistry,
    InMemoryHubRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "mcp-hub", version, about = "Aggregate MCP tool backends behind one endpoint")]
struct Cli {
    /// Backend configuration file (YAML or JSON)
    #[arg(long, env = "MCP_HUB_CONFIG", default_value = "bridges/hub.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "starting mcp-hub");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "mcp-hub stopped");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let env = EnvSnapshot::capture();
    let config = load_config_from_file(&cli.config, &env)
        .await
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let registry = Arc::new(InMemoryHubRegistry::new());
    register_local_tools(registry.as_ref())
        .await
        .context("failed to register local tools")?;

    let orchestrator = BridgeOrchestrator::new(registry.clone(), env).with_timeouts(config.timeouts);
    let bridges = orchestrator
        .start_all(config.servers)
        .context("invalid backend configuration")?;

    for report in bridges.ready().await {
        match &report.status {
            BridgeStatus::Bridged { registered, rejected } if rejected.is_empty() => {
                info!(prefix = %report.prefix, registered, "backend ready")
            }
            BridgeStatus::Bridged { registered, rejected } => warn!(
                prefix = %report.prefix,
                registered,
                rejected = ?rejected,
                "backend ready with rejected tools"
            ),
            BridgeStatus::ConnectFailed(reason) => {
                warn!(prefix = %report.prefix, error = %reason, "backend unavailable")
            }
            BridgeStatus::CatalogFailed(reason) => {
                warn!(prefix = %report.prefix, error = %reason, "backend has no usable catalog")
            }
        }
    }
    info!(tools = registry.len().await, "hub ready");

    server::serve(registry, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("hub server stopped")
}
