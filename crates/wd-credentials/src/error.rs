// error.rs — Error types for the credential vault.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum VaultError {
    /// `revoke_all` ran; the vault issues nothing until restart.
    #[error("credential vault is sealed")]
    Sealed,

    #[error("unknown agent identity '{agent_id}'")]
    UnknownIdentity { agent_id: String },

    /// Identities are issued once and never replaced.
    #[error("agent identity '{agent_id}' already exists")]
    IdentityExists { agent_id: String },

    #[error("agent identity '{agent_id}' is revoked")]
    IdentityRevoked { agent_id: String },

    /// No vetted registry tool can fulfil the capability.
    #[error("no vetted tool fulfils {capability}")]
    ToolNotVetted { capability: String },

    /// A live lease already occupies the slot and the reissue policy is deny.
    #[error("a live lease ({lease_id}) already exists for this agent and capability")]
    LeaseConflict { lease_id: Uuid },

    #[error("lease {0} not found")]
    LeaseNotFound(Uuid),

    #[error("lease {0} has expired")]
    Expired(Uuid),

    #[error("lease {0} has been revoked")]
    Revoked(Uuid),

    /// A single-use lease was already used.
    #[error("lease {0} has no uses left")]
    Exhausted(Uuid),

    #[error("lease {lease_id} authorizes {leased}, not {requested}")]
    CapabilityMismatch {
        lease_id: Uuid,
        leased: String,
        requested: String,
    },

    #[error("invalid lease token: {0}")]
    InvalidToken(String),

    #[error("lease TTL must be between 1 and {max} seconds, got {got}")]
    InvalidTtl { got: u64, max: u64 },

    #[error("failed to generate the lease signing key")]
    KeyGeneration,

    /// Another thread panicked while holding a vault lock.
    #[error("credential vault lock poisoned")]
    Poisoned,

    #[error("failed to serialize lease claims: {0}")]
    Serialization(#[from] serde_json::Error),
}
