// identity.rs — Agent identities.
//
// An identity is issued once and never edited afterwards; the only state
// change is revocation. Grants bound what any rule can allow for the agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilityPattern};
use crate::error::PolicyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    /// Capability patterns this agent may ever be granted.
    pub grants: Vec<CapabilityPattern>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

impl AgentIdentity {
    pub fn new(
        agent_id: impl Into<String>,
        grants: Vec<CapabilityPattern>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, PolicyError> {
        for grant in &grants {
            grant.validate()?;
        }
        Ok(Self {
            agent_id: agent_id.into(),
            grants,
            created_at,
            revoked: false,
        })
    }

    /// The first grant covering the capability, if any.
    pub fn grant_for(&self, capability: &Capability) -> Option<&CapabilityPattern> {
        self.grants.iter().find(|g| g.matches(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_lookup() {
        let identity = AgentIdentity::new(
            "ci-bot",
            vec![CapabilityPattern::new("repository", "read", "*")],
            Utc::now(),
        )
        .unwrap();
        assert!(identity
            .grant_for(&Capability::new("repository", "read", "src/a.rs"))
            .is_some());
        assert!(identity
            .grant_for(&Capability::new("repository", "write-pr", "src/a.rs"))
            .is_none());
    }

    #[test]
    fn invalid_grant_rejected() {
        let result = AgentIdentity::new(
            "ci-bot",
            vec![CapabilityPattern::new("[bad", "read", "*")],
            Utc::now(),
        );
        assert!(result.is_err());
    }
}
