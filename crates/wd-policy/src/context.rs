// context.rs — Everything a policy decision may depend on.
//
// The engine reads nothing but this struct. In particular it never reads the
// clock: `now` is passed in, so replaying a context replays the decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wd_budget::BudgetSnapshot;
use wd_inspect::InspectionVerdict;

use crate::capability::Capability;
use crate::identity::AgentIdentity;

/// The scheduler's current operating mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyWindow {
    /// A human is expected to be watching; sensitive actions escalate.
    Supervised,
    /// Unattended operation.
    Autonomous,
}

/// Request priority. Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Whether the agent says the task needs a human in the loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyRequirement {
    MustBeSupervised,
    #[default]
    AutonomousOk,
}

#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub identity: &'a AgentIdentity,
    pub capability: &'a Capability,
    pub budget: BudgetSnapshot,
    pub inspection: &'a InspectionVerdict,
    pub risk_score: u32,
    pub window: AutonomyWindow,
    pub priority: Priority,
    pub autonomy: AutonomyRequirement,
    pub irreversible: bool,
    pub declared_cost_cents: u64,
    pub now: DateTime<Utc>,
}
