// request.rs — What agents submit and what they get back.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wd_policy::{AutonomyRequirement, Capability, Priority};

use crate::error::ReasonCode;

fn default_priority() -> Priority {
    Priority::Medium
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    pub agent_id: String,
    pub capability: Capability,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub declared_cost_cents: u64,
    #[serde(default)]
    pub autonomy: AutonomyRequirement,
    #[serde(default)]
    pub irreversible: bool,
}

impl TaskRequest {
    pub fn new(agent_id: impl Into<String>, capability: Capability) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            capability,
            payload: serde_json::Value::Null,
            priority: Priority::Medium,
            declared_cost_cents: 0,
            autonomy: AutonomyRequirement::default(),
            irreversible: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_cost(mut self, cents: u64) -> Self {
        self.declared_cost_cents = cents;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn supervised(mut self) -> Self {
        self.autonomy = AutonomyRequirement::MustBeSupervised;
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }

    /// Shape problems that make the request meaningless.
    pub(crate) fn malformed(&self) -> Option<&'static str> {
        if self.agent_id.trim().is_empty() {
            Some("agent_id is empty")
        } else if self.capability.resource.is_empty() || self.capability.action.is_empty() {
            Some("capability resource and action are required")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskDecision {
    Allow,
    Deny,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResponse {
    pub request_id: Uuid,
    pub decision: TaskDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<Uuid>,
}

impl TaskResponse {
    pub fn allow(request_id: Uuid, lease_token: String, result: serde_json::Value) -> Self {
        Self {
            request_id,
            decision: TaskDecision::Allow,
            lease_token: Some(lease_token),
            result: Some(result),
            reason: None,
            reason_code: None,
            retryable: false,
            escalation_id: None,
        }
    }

    pub fn deny(request_id: Uuid, code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            decision: TaskDecision::Deny,
            lease_token: None,
            result: None,
            reason: Some(reason.into()),
            reason_code: Some(code),
            retryable: code.retryable(),
            escalation_id: None,
        }
    }

    pub fn escalate(request_id: Uuid, escalation_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            decision: TaskDecision::Escalate,
            lease_token: None,
            result: None,
            reason: Some(reason.into()),
            reason_code: Some(ReasonCode::Escalated),
            retryable: false,
            escalation_id: Some(escalation_id),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == TaskDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_request_fills_defaults() {
        let req: TaskRequest = serde_json::from_value(serde_json::json!({
            "agent_id": "agent-1",
            "capability": { "resource": "search", "action": "web" }
        }))
        .unwrap();
        assert_eq!(req.priority, Priority::Medium);
        assert_eq!(req.autonomy, AutonomyRequirement::AutonomousOk);
        assert_eq!(req.declared_cost_cents, 0);
        assert!(req.malformed().is_none());
    }

    #[test]
    fn empty_agent_is_malformed() {
        let req = TaskRequest::new(" ", Capability::new("search", "web", ""));
        assert_eq!(req.malformed(), Some("agent_id is empty"));
    }

    #[test]
    fn deny_response_carries_retryable_flag() {
        let id = Uuid::new_v4();
        assert!(TaskResponse::deny(id, ReasonCode::Throttled, "slow down").retryable);
        let r = TaskResponse::deny(id, ReasonCode::PolicyDenied, "no");
        assert!(!r.retryable);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["decision"], "deny");
        assert_eq!(json["reason_code"], "policy_denied");
        assert!(json.get("lease_token").is_none());
    }
}
