//! # wd-policy
//!
//! Capability-based policy engine and tool registry for the Warden gateway.
//!
//! Implements the "default deny" security boundary: an agent can only
//! perform an action that (1) passed inspection, (2) falls within its
//! identity's grants, and (3) is allowed by the highest-specificity matching
//! [`PolicyRule`]. The [`PolicyEngine`] is a pure function of its
//! [`PolicyContext`]; the same context always produces the same decision.
//!
//! ## Key invariants
//!
//! - **Default deny**: no matching rule → denied.
//! - **Deny wins ties**: at equal specificity Deny beats Escalate beats Allow.
//! - **Path traversal blocked**: scopes containing ".." are always denied.
//! - **Dual control**: registry changes need two distinct approver signatures.

pub mod capability;
pub mod context;
pub mod engine;
pub mod error;
pub mod identity;
pub mod registry;
pub mod rule;

pub use capability::{Capability, CapabilityPattern};
pub use context::{AutonomyRequirement, AutonomyWindow, PolicyContext, Priority};
pub use engine::{EvaluationStep, EvaluationTrace, PolicyDecision, PolicyEngine};
pub use error::{PolicyError, RegistryError};
pub use identity::AgentIdentity;
pub use registry::{
    sign_change, Approval, RegistryChange, ToolRegistry, ToolRegistryEntry, VerifiedChange,
};
pub use rule::{Condition, PolicyRule, RuleDecision, RuleSet};
