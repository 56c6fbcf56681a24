// audit.rs — Audit subcommands: verify, tail, page.

use std::path::PathBuf;

use clap::Subcommand;
use wd_audit::{AuditError, AuditEvent, AuditLog};
use wd_gateway::GatewayConfig;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify the audit log hash chain integrity.
    Verify {
        /// Path to audit log (defaults to paths.audit_log from the config).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Show recent audit events.
    Tail {
        #[arg(long)]
        log: Option<PathBuf>,
        /// Number of events to show.
        #[arg(short, default_value = "10")]
        n: usize,
    },
    /// Print a page of events as JSON.
    Page {
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

pub fn execute(cmd: &AuditCommands, config: &GatewayConfig) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::Verify { log } => {
            let path = log_path(log, config);
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }

            // Recomputes every hash, not just the links.
            match AuditLog::verify_file(&path) {
                Ok(_) => {
                    let events = AuditLog::read_all(&path)?;
                    println!(
                        "Audit log verified: {} event(s), hash chain intact.",
                        events.len()
                    );
                }
                Err(AuditError::IntegrityViolation { line, detail }) => {
                    println!("INTEGRITY VIOLATION at line {}:", line);
                    println!("  {}", detail);
                    println!();
                    println!("The audit log may have been tampered with.");
                    anyhow::bail!("Audit log integrity check failed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        AuditCommands::Tail { log, n } => {
            let path = log_path(log, config);
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }

            let events = AuditLog::read_all(&path)?;
            let start = events.len().saturating_sub(*n);
            let recent = &events[start..];
            if recent.is_empty() {
                println!("No audit events.");
                return Ok(());
            }

            println!(
                "{:<6} {:<20} {:<16} {:<22} {:<9} REASON",
                "SEQ", "TIMESTAMP", "SUBJECT", "ACTION", "DECISION"
            );
            println!("{}", "-".repeat(100));
            for event in recent {
                println!("{}", tail_line(event));
            }
        }

        AuditCommands::Page { log, offset, limit } => {
            let path = log_path(log, config);
            let events = if path.exists() {
                AuditLog::read_all(&path)?
            } else {
                Vec::new()
            };
            let chain_valid = path.exists() && AuditLog::verify_file(&path).is_ok();
            let page: Vec<&AuditEvent> = events.iter().skip(*offset).take(*limit).collect();
            let out = serde_json::json!({
                "events": page,
                "offset": offset,
                "total": events.len(),
                "chain_valid": chain_valid,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}

fn log_path(log: &Option<PathBuf>, config: &GatewayConfig) -> PathBuf {
    log.clone()
        .unwrap_or_else(|| config.paths.audit_log.clone())
}

fn tail_line(event: &AuditEvent) -> String {
    let decision = serde_json::to_value(&event.decision)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!(
        "{:<6} {:<20} {:<16} {:<22} {:<9} {}",
        event.sequence,
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        truncate(&event.subject, 16),
        truncate(&event.action, 22),
        decision,
        if event.reason.is_empty() { "-" } else { event.reason.as_str() },
    )
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let cut: String = s.chars().take(width.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use wd_audit::{AuditDecision, AuditStage};

    fn write_log(path: &Path, n: usize) {
        let log = AuditLog::open(path).unwrap();
        for i in 0..n {
            let mut e = AuditEvent::new(
                AuditStage::Policy,
                "agent-1",
                "policy_decision",
                AuditDecision::Allow,
            )
            .with_reason(format!("rule {}", i));
            log.append(&mut e).unwrap();
        }
    }

    #[test]
    fn verify_accepts_intact_log_and_rejects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        write_log(&path, 3);
        let config = GatewayConfig::for_dir(dir.path());
        let verify = AuditCommands::Verify {
            log: Some(path.clone()),
        };
        assert!(execute(&verify, &config).is_ok());

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replacen("rule 1", "rule 9", 1)).unwrap();
        assert!(execute(&verify, &config).is_err());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::for_dir(dir.path());
        assert!(execute(&AuditCommands::Tail { log: None, n: 5 }, &config).is_ok());
        assert!(execute(
            &AuditCommands::Page {
                log: None,
                offset: 0,
                limit: 10
            },
            &config
        )
        .is_ok());
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate("agent-1", 16), "agent-1");
        assert_eq!(truncate("abcdefgh", 5), "abcd…");
    }
}
