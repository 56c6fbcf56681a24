//! # wd-daemon
//!
//! Warden MCP server daemon.
//!
//! Loads `warden.toml`, opens the audit log and policy bundle, and serves
//! the gateway's MCP tools on stdio. Agents submit tasks through
//! `wd_submit`; operators use the admin tools with the operator token.
//! The policy file is watched and hot-reloaded.
//!
//! ## Usage
//!
//! Typically started by the MCP client via `.mcp.json`:
//! ```json
//! {
//!   "mcpServers": {
//!     "warden": {
//!       "type": "stdio",
//!       "command": "warden-daemon",
//!       "args": ["--config", "/etc/warden/warden.toml"]
//!     }
//!   }
//! }
//! ```

mod watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::ServiceExt;
use tracing_subscriber::EnvFilter;

use wd_gateway::{Gateway, GatewayConfig, OverrideController, WardenServer};

/// How often expired and spent leases are dropped from the vault.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Warden MCP server.
#[derive(Parser)]
#[command(name = "warden-daemon", about = "Warden task-mediation gateway (MCP server)")]
struct Cli {
    /// Gateway configuration file.
    #[arg(long, default_value = "warden.toml")]
    config: PathBuf,

    /// Do not watch the policy file for changes.
    #[arg(long)]
    no_watch: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they don't interfere with MCP on stdout.
    let filter = EnvFilter::from_default_env()
        .add_directive("wd_gateway=info".parse()?)
        .add_directive("wd_credentials=info".parse()?)
        .add_directive("wd_daemon=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    }

    tracing::info!("Starting Warden MCP server");
    tracing::info!("Config: {}", cli.config.display());

    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let gateway = Arc::new(Gateway::open(&config).context("opening gateway")?);

    if config.admin.token_sha256.is_none() {
        tracing::warn!("no admin.token_sha256 configured: operator commands are disabled");
    }
    let overrides = OverrideController::new(Arc::clone(&gateway), config.admin.token_sha256.clone())
        .with_policy_path(&config.paths.policy);

    let _watcher = if cli.no_watch {
        None
    } else {
        Some(
            watch::watch_policy(Arc::clone(&gateway), config.paths.policy.clone())
                .context("watching policy file")?,
        )
    };

    let sweeper = Arc::clone(&gateway);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match sweeper.vault().sweep(sweeper.now()) {
                Ok(0) => {}
                Ok(dropped) => tracing::debug!(dropped, "swept dead leases"),
                Err(e) => tracing::warn!("lease sweep failed: {}", e),
            }
        }
    });

    let server = WardenServer::new(Arc::new(overrides));
    tracing::info!("MCP server ready, waiting for client connection");

    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {:?}", e))?;

    service.waiting().await?;

    tracing::info!("MCP server shutting down");
    Ok(())
}
