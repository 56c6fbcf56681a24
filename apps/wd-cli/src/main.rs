//! # wd-cli
//!
//! Operator command line for Warden.
//!
//! Works offline against the files the daemon writes and reads:
//! - `warden audit verify/tail/page` — inspect the hash-chained audit log
//! - `warden policy validate/explain` — check a bundle and dry-run a decision
//! - `warden schedule show` — which autonomy window applies at a given time
//! - `warden admin-token` — generate an operator token and its config hash
//! - `warden registry keygen/sign` — approver keys and signatures for registry changes

mod commands;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use wd_gateway::GatewayConfig;

/// Warden CLI: audit, policy and operator credentials.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Gateway configuration file. Defaults apply when it does not exist.
    #[arg(long, default_value = "warden.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the audit trail.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
    /// Validate policy bundles and explain decisions.
    Policy {
        #[command(subcommand)]
        command: commands::policy::PolicyCommands,
    },
    /// Show the autonomy schedule.
    Schedule {
        #[command(subcommand)]
        command: commands::schedule::ScheduleCommands,
    },
    /// Generate a new operator token and the hash to put in the config.
    AdminToken,
    /// Dual-control registry helpers.
    Registry {
        #[command(subcommand)]
        command: commands::registry::RegistryCommands,
    },
}

fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    if path.exists() {
        return Ok(GatewayConfig::load(path)?);
    }
    let root = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(GatewayConfig::for_dir(root))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::AdminToken => commands::admin::execute(),
        Commands::Registry { command } => commands::registry::execute(command),
        Commands::Audit { command } => commands::audit::execute(command, &load_config(&cli.config)?),
        Commands::Policy { command } => {
            commands::policy::execute(command, &load_config(&cli.config)?)
        }
        Commands::Schedule { command } => {
            commands::schedule::execute(command, &load_config(&cli.config)?)
        }
    }
}
