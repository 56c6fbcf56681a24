// registry.rs — Vetted tool registry with dual-control changes.
//
// The registry answers "is there a vetted tool that may fulfil this
// capability?" with a HashMap lookup. Runtime changes go through two
// steps: `verify` checks that two distinct configured approvers signed the
// change digest (HMAC-SHA256 with each approver's key) and returns a
// VerifiedChange; `apply` makes it visible. The gateway audits between the
// two, so a change the audit log never saw never takes effect.

use std::collections::{BTreeSet, HashMap};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDate;
use ring::hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capability::{Capability, CapabilityPattern};
use crate::error::RegistryError;

/// Number of distinct approvers a runtime change needs.
const REQUIRED_APPROVALS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolRegistryEntry {
    pub name: String,
    pub version: String,
    pub vetted: bool,
    pub last_audit: NaiveDate,
    /// Capabilities this tool may fulfil.
    pub capabilities: Vec<CapabilityPattern>,
}

impl ToolRegistryEntry {
    pub fn fulfils(&self, capability: &Capability) -> bool {
        self.capabilities.iter().any(|p| p.matches(capability))
    }

    fn validate(&self) -> Result<(), RegistryError> {
        for pattern in &self.capabilities {
            pattern.validate()?;
        }
        Ok(())
    }
}

/// A proposed registry change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryChange {
    Register { entry: ToolRegistryEntry },
    Update { entry: ToolRegistryEntry },
    /// Mark a tool as no longer vetted. The entry stays for the record.
    Revoke { name: String },
}

impl RegistryChange {
    pub fn tool_name(&self) -> &str {
        match self {
            RegistryChange::Register { entry } | RegistryChange::Update { entry } => &entry.name,
            RegistryChange::Revoke { name } => name,
        }
    }

    /// Hex SHA-256 of the change's JSON form. This is what approvers sign.
    pub fn digest(&self) -> Result<String, RegistryError> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&json)))
    }
}

/// One approver's signature over a change digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Approval {
    pub approver_id: String,
    /// Base64 HMAC-SHA256 of the change digest.
    pub signature: String,
}

/// Produce the signature an approver attaches to a change.
pub fn sign_change(change: &RegistryChange, key: &[u8]) -> Result<String, RegistryError> {
    let digest = change.digest()?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    Ok(STANDARD.encode(hmac::sign(&key, digest.as_bytes()).as_ref()))
}

/// A change whose approvals checked out. Only [`ToolRegistry::verify`]
/// creates one.
#[derive(Debug, Clone)]
pub struct VerifiedChange {
    change: RegistryChange,
    digest: String,
    approvers: Vec<String>,
}

impl VerifiedChange {
    pub fn change(&self) -> &RegistryChange {
        &self.change
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn approvers(&self) -> &[String] {
        &self.approvers
    }
}

pub struct ToolRegistry {
    entries: HashMap<String, ToolRegistryEntry>,
    approver_keys: HashMap<String, hmac::Key>,
}

impl ToolRegistry {
    /// An empty registry. `approvers` maps approver id to HMAC key bytes.
    pub fn new(approvers: HashMap<String, Vec<u8>>) -> Self {
        let approver_keys = approvers
            .into_iter()
            .map(|(id, key)| (id, hmac::Key::new(hmac::HMAC_SHA256, &key)))
            .collect();
        Self {
            entries: HashMap::new(),
            approver_keys,
        }
    }

    /// Load the operator-authored baseline. Later entries replace earlier
    /// ones with the same name.
    pub fn bootstrap(&mut self, entries: Vec<ToolRegistryEntry>) -> Result<(), RegistryError> {
        for entry in &entries {
            entry.validate()?;
        }
        for entry in entries {
            self.entries.insert(entry.name.clone(), entry);
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolRegistryEntry, RegistryError> {
        self.entries.get(name).ok_or_else(|| RegistryError::NotFound {
            name: name.to_string(),
        })
    }

    pub fn is_vetted(&self, name: &str, version: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| e.vetted && e.version == version)
            .unwrap_or(false)
    }

    /// A vetted tool able to fulfil the capability. Ties go to the
    /// lexicographically first name so the answer is stable.
    pub fn find_fulfilling(&self, capability: &Capability) -> Option<&ToolRegistryEntry> {
        self.entries
            .values()
            .filter(|e| e.vetted && e.fulfils(capability))
            .min_by(|a, b| a.name.cmp(&b.name))
    }

    /// All entries, sorted by name.
    pub fn entries(&self) -> Vec<&ToolRegistryEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that the change is well-formed, applicable, and signed by two
    /// distinct configured approvers. Any bad approval rejects the change.
    pub fn verify(
        &self,
        change: RegistryChange,
        approvals: &[Approval],
    ) -> Result<VerifiedChange, RegistryError> {
        match &change {
            RegistryChange::Register { entry } => {
                entry.validate()?;
                if self.entries.contains_key(&entry.name) {
                    return Err(RegistryError::AlreadyRegistered {
                        name: entry.name.clone(),
                    });
                }
            }
            RegistryChange::Update { entry } => {
                entry.validate()?;
                self.lookup(&entry.name)?;
            }
            RegistryChange::Revoke { name } => {
                self.lookup(name)?;
            }
        }

        let digest = change.digest()?;
        let mut approvers = BTreeSet::new();
        for approval in approvals {
            let key = self.approver_keys.get(&approval.approver_id).ok_or_else(|| {
                RegistryError::UnknownApprover {
                    approver_id: approval.approver_id.clone(),
                }
            })?;
            let bad_signature = || RegistryError::BadSignature {
                approver_id: approval.approver_id.clone(),
            };
            let tag = STANDARD
                .decode(approval.signature.as_bytes())
                .map_err(|_| bad_signature())?;
            hmac::verify(key, digest.as_bytes(), &tag).map_err(|_| bad_signature())?;
            approvers.insert(approval.approver_id.clone());
        }

        if approvers.len() < REQUIRED_APPROVALS {
            return Err(RegistryError::InsufficientApprovals {
                valid: approvers.len(),
            });
        }

        Ok(VerifiedChange {
            change,
            digest,
            approvers: approvers.into_iter().collect(),
        })
    }

    /// Make a verified change visible.
    pub fn apply(&mut self, verified: VerifiedChange) -> Result<(), RegistryError> {
        match verified.change {
            RegistryChange::Register { entry } | RegistryChange::Update { entry } => {
                tracing::info!(
                    tool = %entry.name,
                    version = %entry.version,
                    vetted = entry.vetted,
                    "registry entry applied"
                );
                self.entries.insert(entry.name.clone(), entry);
            }
            RegistryChange::Revoke { name } => {
                let entry = self
                    .entries
                    .get_mut(&name)
                    .ok_or_else(|| RegistryError::NotFound { name: name.clone() })?;
                entry.vetted = false;
                tracing::info!(tool = %name, "registry entry unvetted");
            }
        }
        Ok(())
    }
}
