// throttle.rs — Per-agent request rate limits.
//
// A limit is N admitted requests per sliding one-minute window. Agents
// without a limit are not throttled. A limit of zero blocks the agent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::error::GatewayError;

struct Limit {
    per_minute: u32,
    admitted: VecDeque<DateTime<Utc>>,
}

#[derive(Default)]
pub struct Throttle {
    limits: Mutex<HashMap<String, Limit>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit `agent_id` to `per_minute`. Replaces an existing limit and
    /// forgets its history.
    pub fn set(&self, agent_id: &str, per_minute: u32) -> Result<(), GatewayError> {
        let mut limits = self.lock()?;
        limits.insert(
            agent_id.to_string(),
            Limit {
                per_minute,
                admitted: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Remove the limit. Returns whether one existed.
    pub fn clear(&self, agent_id: &str) -> Result<bool, GatewayError> {
        Ok(self.lock()?.remove(agent_id).is_some())
    }

    pub fn limit_for(&self, agent_id: &str) -> Result<Option<u32>, GatewayError> {
        Ok(self.lock()?.get(agent_id).map(|l| l.per_minute))
    }

    /// Admit or reject one request at `now`. Admitted requests count
    /// against the window; rejected ones do not.
    pub fn admit(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool, GatewayError> {
        let mut limits = self.lock()?;
        let Some(limit) = limits.get_mut(agent_id) else {
            return Ok(true);
        };
        let window_start = now - Duration::minutes(1);
        while limit.admitted.front().is_some_and(|t| *t <= window_start) {
            limit.admitted.pop_front();
        }
        if limit.admitted.len() as u64 >= limit.per_minute as u64 {
            return Ok(false);
        }
        limit.admitted.push_back(now);
        Ok(true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Limit>>, GatewayError> {
        self.limits
            .lock()
            .map_err(|_| GatewayError::Poisoned { what: "throttle" })
    }
}
