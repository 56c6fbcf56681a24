// error.rs — Error types for the policy subsystem.

use thiserror::Error;

/// Errors that can occur while loading rules or identities.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A capability or subject pattern is malformed and cannot be parsed as a glob.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Two rules in one set share an id.
    #[error("duplicate rule id '{id}'")]
    DuplicateRule { id: String },

    /// A rule set could not be parsed.
    #[error("failed to parse rule set: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors from the tool registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No tool with this name is registered.
    #[error("tool '{name}' is not registered")]
    NotFound { name: String },

    /// A Register change named a tool that already exists.
    #[error("tool '{name}' is already registered")]
    AlreadyRegistered { name: String },

    /// Fewer than two distinct configured approvers signed the change.
    #[error("registry change needs two distinct approvers, got {valid} valid approval(s)")]
    InsufficientApprovals { valid: usize },

    /// An approval names an approver that is not configured.
    #[error("unknown approver '{approver_id}'")]
    UnknownApprover { approver_id: String },

    /// An approval's signature does not verify against the change digest.
    #[error("invalid signature from approver '{approver_id}'")]
    BadSignature { approver_id: String },

    /// A capability pattern on an entry does not compile.
    #[error(transparent)]
    InvalidPattern(#[from] PolicyError),

    /// The change could not be serialized for digesting.
    #[error("failed to digest registry change: {0}")]
    Digest(#[from] serde_json::Error),
}
