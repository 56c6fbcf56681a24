// error.rs — Error types for the gateway, and the caller-facing reason codes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from gateway construction and operator commands.
///
/// Task submission never returns this type: a failed submission is a
/// `TaskResponse` with a [`ReasonCode`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid gateway config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid gateway config: {0}")]
    Config(String),

    #[error("invalid policy bundle: {0}")]
    BundleParse(#[from] serde_yaml::Error),

    #[error("audit error: {0}")]
    Audit(#[from] wd_audit::AuditError),

    #[error("policy error: {0}")]
    Policy(#[from] wd_policy::PolicyError),

    #[error("registry error: {0}")]
    Registry(#[from] wd_policy::RegistryError),

    #[error("budget error: {0}")]
    Budget(#[from] wd_budget::BudgetError),

    #[error("vault error: {0}")]
    Vault(#[from] wd_credentials::VaultError),

    #[error("inspection rules error: {0}")]
    Inspect(#[from] wd_inspect::InspectError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The admin token was missing or did not match.
    #[error("unauthorized: admin credential rejected")]
    Unauthorized,

    /// The kill switch has fired; the gateway accepts nothing until restart.
    #[error("gateway is halted")]
    Halted,

    #[error("no pending escalation {0}")]
    UnknownEscalation(Uuid),

    #[error("{what} lock poisoned")]
    Poisoned { what: &'static str },
}

/// Why a task was not allowed. Returned to the submitting agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InjectionDetected,
    PolicyDenied,
    Escalated,
    BudgetExceeded,
    VaultUnavailable,
    LeaseConflict,
    ToolNotRegistered,
    AuditWriteFailure,
    ExecutorTimeout,
    ExecutorFailed,
    OutputRejected,
    InspectionFailed,
    Throttled,
    Halted,
    Unauthorized,
    InvalidRequest,
    /// A gateway component is in a state it should never reach.
    Internal,
}

impl ReasonCode {
    /// Whether resubmitting the same request later may succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ReasonCode::BudgetExceeded
                | ReasonCode::LeaseConflict
                | ReasonCode::ExecutorTimeout
                | ReasonCode::Throttled
        )
    }

    /// Whether a denial with this code raises an operator alert.
    pub fn security_relevant(&self) -> bool {
        matches!(
            self,
            ReasonCode::InjectionDetected | ReasonCode::OutputRejected | ReasonCode::Unauthorized
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::InjectionDetected => "injection_detected",
            ReasonCode::PolicyDenied => "policy_denied",
            ReasonCode::Escalated => "escalated",
            ReasonCode::BudgetExceeded => "budget_exceeded",
            ReasonCode::VaultUnavailable => "vault_unavailable",
            ReasonCode::LeaseConflict => "lease_conflict",
            ReasonCode::ToolNotRegistered => "tool_not_registered",
            ReasonCode::AuditWriteFailure => "audit_write_failure",
            ReasonCode::ExecutorTimeout => "executor_timeout",
            ReasonCode::ExecutorFailed => "executor_failed",
            ReasonCode::OutputRejected => "output_rejected",
            ReasonCode::InspectionFailed => "inspection_failed",
            ReasonCode::Throttled => "throttled",
            ReasonCode::Halted => "halted",
            ReasonCode::Unauthorized => "unauthorized",
            ReasonCode::InvalidRequest => "invalid_request",
            ReasonCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
