// schedule.rs — Schedule subcommands: show.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use wd_gateway::GatewayConfig;

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Show the configured autonomous window and the window in effect.
    Show {
        /// Evaluate at this RFC 3339 time instead of now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

pub fn execute(cmd: &ScheduleCommands, config: &GatewayConfig) -> anyhow::Result<()> {
    match cmd {
        ScheduleCommands::Show { at } => {
            let schedule = config.scheduler.compile()?;
            let at = at.unwrap_or_else(Utc::now);
            let cfg = schedule.to_config();
            if cfg.autonomous_start == cfg.autonomous_end {
                println!("Autonomous window: none (always supervised)");
            } else {
                println!(
                    "Autonomous window: {} to {} (UTC{:+03}:{:02})",
                    cfg.autonomous_start,
                    cfg.autonomous_end,
                    cfg.utc_offset_minutes / 60,
                    (cfg.utc_offset_minutes % 60).abs()
                );
            }
            println!(
                "At {}: {:?}",
                at.format("%Y-%m-%d %H:%M:%S UTC"),
                schedule.window_at(at)
            );
            println!("(Manual overrides live in the running daemon; see wd_schedule_status.)");
            Ok(())
        }
    }
}
