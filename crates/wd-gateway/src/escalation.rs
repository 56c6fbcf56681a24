// escalation.rs — Requests parked for a human decision.
//
// An escalated request holds no reservation and no lease while it waits.
// Resolving it removes it from the queue exactly once.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::request::TaskRequest;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEscalation {
    pub escalation_id: Uuid,
    pub request: TaskRequest,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
    /// Bundle version that escalated the request.
    pub bundle_version: String,
}

/// An operator's answer to an escalation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Allow,
    Deny,
}

#[derive(Default)]
pub struct EscalationQueue {
    pending: Mutex<HashMap<Uuid, PendingEscalation>>,
}

impl EscalationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, escalation: PendingEscalation) -> Result<(), GatewayError> {
        self.lock()?
            .insert(escalation.escalation_id, escalation);
        Ok(())
    }

    /// Remove and return a pending escalation.
    pub fn take(&self, escalation_id: Uuid) -> Result<PendingEscalation, GatewayError> {
        self.lock()?
            .remove(&escalation_id)
            .ok_or(GatewayError::UnknownEscalation(escalation_id))
    }

    /// Pending escalations, oldest first.
    pub fn list(&self) -> Result<Vec<PendingEscalation>, GatewayError> {
        let mut all: Vec<_> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| {
            a.parked_at
                .cmp(&b.parked_at)
                .then(a.escalation_id.cmp(&b.escalation_id))
        });
        Ok(all)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, PendingEscalation>>, GatewayError> {
        self.pending
            .lock()
            .map_err(|_| GatewayError::Poisoned { what: "escalation queue" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wd_policy::Capability;

    fn pending() -> PendingEscalation {
        PendingEscalation {
            escalation_id: Uuid::new_v4(),
            request: TaskRequest::new("agent-1", Capability::new("deploy", "production", "")),
            reason: "supervised window".into(),
            parked_at: Utc::now(),
            bundle_version: "v1".into(),
        }
    }

    #[test]
    fn take_removes_exactly_once() {
        let queue = EscalationQueue::new();
        let p = pending();
        let id = p.escalation_id;
        queue.park(p).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take(id).unwrap().escalation_id, id);
        assert!(matches!(
            queue.take(id),
            Err(GatewayError::UnknownEscalation(_))
        ));
        assert!(queue.is_empty());
    }
}
