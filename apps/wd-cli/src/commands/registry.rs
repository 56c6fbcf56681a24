// registry.rs — Dual-control helpers for tool registry changes.
//
// A registry change takes effect only with signatures from two distinct
// approvers. Each approver signs the change offline with `registry sign`
// and hands the resulting approval to whoever submits `wd_registry_change`.

use std::path::PathBuf;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Subcommand;
use rand::RngCore;
use wd_policy::{sign_change, Approval, RegistryChange};

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// Generate a new approver key (base64) for `[[approvers]]`.
    Keygen,
    /// Sign a registry change and print the approval as JSON.
    Sign {
        /// Approver id as configured in `[[approvers]]`.
        #[arg(long)]
        approver: String,
        /// File holding the approver's base64 key.
        #[arg(long)]
        key_file: PathBuf,
        /// The change as JSON, e.g. {"op": "revoke", "name": "web-search"}.
        #[arg(long)]
        change: PathBuf,
    },
}

pub fn execute(cmd: &RegistryCommands) -> anyhow::Result<()> {
    match cmd {
        RegistryCommands::Keygen => {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            println!("{}", STANDARD.encode(key));
            Ok(())
        }
        RegistryCommands::Sign {
            approver,
            key_file,
            change,
        } => {
            let key = std::fs::read_to_string(key_file)
                .with_context(|| format!("reading {}", key_file.display()))?;
            let change_text = std::fs::read_to_string(change)
                .with_context(|| format!("reading {}", change.display()))?;
            let approval = sign(approver, key.trim(), &change_text)?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
            Ok(())
        }
    }
}

fn sign(approver: &str, key_b64: &str, change_json: &str) -> anyhow::Result<Approval> {
    let key = STANDARD
        .decode(key_b64)
        .context("approver key is not base64")?;
    let change: RegistryChange =
        serde_json::from_str(change_json).context("change is not a registry change")?;
    Ok(Approval {
        approver_id: approver.to_string(),
        signature: sign_change(&change, &key)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_library_signing() {
        let key = b"approver-key";
        let change_json = r#"{"op": "revoke", "name": "web-search"}"#;
        let approval = sign("alice", &STANDARD.encode(key), change_json).unwrap();

        let change: RegistryChange = serde_json::from_str(change_json).unwrap();
        assert_eq!(approval.approver_id, "alice");
        assert_eq!(approval.signature, sign_change(&change, key).unwrap());
    }

    #[test]
    fn bad_inputs_are_reported() {
        assert!(sign("alice", "not base64!", r#"{"op": "revoke", "name": "x"}"#).is_err());
        assert!(sign("alice", "a2V5", r#"{"op": "rename"}"#).is_err());
    }
}
