// event.rs — Audit event data model.
//
// Every significant step in the gateway (inspection verdict, policy decision,
// lease grant, dispatch, budget commit, operator command) is recorded as an
// AuditEvent. Events form a chain: each event stores `previous_hash` (the
// `this_hash` of the prior event) and `this_hash`, a SHA-256 over its own
// content plus `previous_hash`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hasher;

/// `previous_hash` of the first event in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Which pipeline stage (or operator surface) produced the event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    /// Request accepted at the front door (or rejected as halted/malformed).
    Intake,
    /// Per-identity rate limiting.
    Throttle,
    /// Input inspection pipeline.
    InputInspection,
    /// Tool registry lookup or registry change.
    Registry,
    /// Budget ledger reserve/commit/release/override.
    Budget,
    /// Policy engine decision.
    Policy,
    /// Credential vault lease issue/revoke.
    Vault,
    /// Executor dispatch and its result.
    Executor,
    /// Output inspection pipeline.
    OutputInspection,
    /// Escalation parked or resolved.
    Escalation,
    /// Human override controller (kill switch, throttle, schedule).
    Override,
    /// Policy bundle reload and configuration bootstrap.
    Config,
}

/// The outcome an event records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Pass,
    Allow,
    Deny,
    Escalate,
    Grant,
    Commit,
    Release,
    Revoke,
    Halt,
    Record,
}

/// A single audit event: one line in the JSONL audit log.
///
/// `sequence`, `timestamp`, `previous_hash` and `this_hash` are assigned by
/// [`crate::AuditLog::append`]; callers fill in the rest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Position in the chain, starting at 1.
    pub sequence: u64,

    /// When the event was appended (UTC).
    pub timestamp: DateTime<Utc>,

    /// Which stage produced this event.
    pub stage: AuditStage,

    /// Who the event is about: an agent id, or "operator".
    pub subject: String,

    /// Machine-readable event name, e.g. "lease_granted", "budget_commit".
    pub action: String,

    /// The outcome recorded.
    pub decision: AuditDecision,

    /// Human-readable reason or detail.
    pub reason: String,

    /// Task request this event belongs to, if any.
    pub request_id: Option<Uuid>,

    /// Arbitrary additional data. `serde_json::Value` can hold any JSON.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// `this_hash` of the preceding event ([`GENESIS_HASH`] for the first).
    pub previous_hash: String,

    /// SHA-256 over `previous_hash` and this event's content.
    pub this_hash: String,
}

/// The hashed portion of an event: everything except `this_hash`.
///
/// Field order here is the canonical order; serde_json writes struct fields
/// in declaration order and `metadata` maps as sorted keys.
#[derive(Serialize)]
struct HashedBody<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    stage: AuditStage,
    subject: &'a str,
    action: &'a str,
    decision: AuditDecision,
    reason: &'a str,
    request_id: Option<Uuid>,
    metadata: &'a serde_json::Value,
}

impl AuditEvent {
    /// Create a new, not-yet-appended event.
    pub fn new(
        stage: AuditStage,
        subject: impl Into<String>,
        action: impl Into<String>,
        decision: AuditDecision,
    ) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            stage,
            subject: subject.into(),
            action: action.into(),
            decision,
            reason: String::new(),
            request_id: None,
            metadata: serde_json::Value::Null,
            previous_hash: String::new(),
            this_hash: String::new(),
        }
    }

    /// Set the reason and return self (builder pattern).
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Attach the task request id and return self.
    pub fn with_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Set arbitrary metadata and return self.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Compute the chain hash for this event's current content and
    /// `previous_hash`. Does not read `this_hash`.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let body = HashedBody {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            stage: self.stage,
            subject: &self.subject,
            action: &self.action,
            decision: self.decision,
            reason: &self.reason,
            request_id: self.request_id,
            metadata: &self.metadata,
        };
        let body_json = serde_json::to_string(&body)?;
        Ok(hasher::chain_hash(&self.previous_hash, &body_json))
    }
}
