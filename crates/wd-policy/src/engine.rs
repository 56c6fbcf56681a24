// engine.rs — Policy evaluation engine.
//
// The PolicyEngine is the core of the "default deny" security model.
// Every request that survives inspection passes through `decide()` which
// checks, in order:
//
// 1. Did input inspection pass? → No → Deny
// 2. Does the scope contain path traversal? → Yes → Deny
// 3. Is the identity revoked? → Yes → Deny
// 4. Does an identity grant cover the capability? → No → Deny
// 5. Which rules apply (subject, capability, `when`)? → None → Deny
// 6. Highest rank wins; ties go Deny > Escalate > Allow, then rule id
// 7. Winning Allow with `escalate_when` holding → Escalate
// 8. Winning Allow, request must be supervised, window Autonomous → Escalate
//
// The engine holds only its rule set. It reads no clock and no global
// state, so identical contexts always produce identical decisions.

use serde::{Deserialize, Serialize};
use wd_inspect::InspectionVerdict;

use crate::context::{AutonomyRequirement, AutonomyWindow, PolicyContext};
use crate::rule::{PolicyRule, RuleDecision, RuleSet};

/// The result of a policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    /// The action is allowed; proceed to the vault.
    Allow,
    /// The action is denied.
    Deny { reason: String },
    /// The action needs explicit human confirmation before proceeding.
    Escalate { reason: String },
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// A step in the policy evaluation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationStep {
    /// Which check was performed (e.g., "inspection", "identity_grants").
    pub check: String,
    /// The outcome of this check (e.g., "passed", "failed: revoked").
    pub outcome: String,
    /// Whether this step was the terminal decision point.
    pub terminal: bool,
}

/// Full evaluation trace returned alongside a PolicyDecision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationTrace {
    pub decision: PolicyDecision,
    pub steps: Vec<EvaluationStep>,
    /// Ids of the rules whose patterns and conditions applied.
    pub rules_considered: Vec<String>,
    /// Id of the winning rule, if any.
    pub matching_rule: Option<String>,
}

struct TraceBuilder {
    steps: Vec<EvaluationStep>,
    rules_considered: Vec<String>,
    matching_rule: Option<String>,
}

impl TraceBuilder {
    fn pass(&mut self, check: &str, outcome: impl Into<String>) {
        self.steps.push(EvaluationStep {
            check: check.to_string(),
            outcome: outcome.into(),
            terminal: false,
        });
    }

    fn finish(
        mut self,
        check: &str,
        outcome: impl Into<String>,
        decision: PolicyDecision,
    ) -> EvaluationTrace {
        self.steps.push(EvaluationStep {
            check: check.to_string(),
            outcome: outcome.into(),
            terminal: true,
        });
        EvaluationTrace {
            decision,
            steps: self.steps,
            rules_considered: self.rules_considered,
            matching_rule: self.matching_rule,
        }
    }
}

/// Evaluates contexts against one immutable rule set.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: RuleSet,
}

impl PolicyEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Evaluate a context and return a decision.
    pub fn decide(&self, ctx: &PolicyContext<'_>) -> PolicyDecision {
        self.decide_with_trace(ctx).decision
    }

    /// Evaluate a context and return the decision with every step recorded.
    pub fn decide_with_trace(&self, ctx: &PolicyContext<'_>) -> EvaluationTrace {
        let mut trace = TraceBuilder {
            steps: Vec::new(),
            rules_considered: Vec::new(),
            matching_rule: None,
        };
        let agent = ctx.identity.agent_id.as_str();

        // Step 1: inspection verdict.
        if let InspectionVerdict::Deny { stage, reason, .. } = ctx.inspection {
            let reason = format!("inspection stage '{}' denied: {}", stage, reason);
            return trace.finish("inspection", format!("failed: {}", reason), deny(reason));
        }
        trace.pass("inspection", format!("passed: risk {}", ctx.risk_score));

        // Step 2: path traversal.
        if ctx.capability.has_path_traversal() {
            let reason = format!(
                "path traversal detected in scope: '{}'",
                ctx.capability.scope
            );
            return trace.finish("path_traversal", format!("failed: {}", reason), deny(reason));
        }
        trace.pass("path_traversal", "passed");

        // Step 3: identity state.
        if ctx.identity.revoked {
            let reason = format!("identity '{}' is revoked", agent);
            return trace.finish("identity_revoked", "failed: revoked", deny(reason));
        }
        trace.pass("identity_revoked", "passed");

        // Step 4: identity grants.
        match ctx.identity.grant_for(ctx.capability) {
            Some(grant) => trace.pass("identity_grants", format!("covered by {}", grant)),
            None => {
                let reason = format!("identity '{}' has no grant for {}", agent, ctx.capability);
                return trace.finish(
                    "identity_grants",
                    format!("failed: {}", reason),
                    deny(reason),
                );
            }
        }

        // Step 5: applicable rules.
        let applicable: Vec<&PolicyRule> =
            self.rules.rules.iter().filter(|r| r.applies(ctx)).collect();
        trace.rules_considered = applicable.iter().map(|r| r.id.clone()).collect();
        let winner = match pick_winner(&applicable) {
            Some(rule) => rule,
            None => {
                let reason = format!(
                    "no rule allows {} for '{}' (default deny)",
                    ctx.capability, agent
                );
                return trace.finish("rule_match", "failed: no applicable rule", deny(reason));
            }
        };
        trace.matching_rule = Some(winner.id.clone());
        trace.pass(
            "rule_match",
            format!(
                "{} applicable; winner '{}' rank {} decides {:?}",
                applicable.len(),
                winner.id,
                winner.rank(),
                winner.decision
            ),
        );

        // Step 6: the winning rule's decision.
        match winner.decision {
            RuleDecision::Deny => {
                let reason = format!("denied by rule '{}'", winner.id);
                return trace.finish("rule_decision", "deny", deny(reason));
            }
            RuleDecision::Escalate => {
                let reason = format!("rule '{}' requires human confirmation", winner.id);
                return trace.finish(
                    "rule_decision",
                    "escalate",
                    PolicyDecision::Escalate { reason },
                );
            }
            RuleDecision::Allow => trace.pass("rule_decision", "allow"),
        }

        // Step 7: escalate_when on the winning Allow.
        if let Some(cond) = &winner.escalate_when {
            if cond.holds(ctx) {
                let reason = format!("rule '{}' escalation condition holds", winner.id);
                return trace.finish(
                    "escalate_when",
                    "holds",
                    PolicyDecision::Escalate { reason },
                );
            }
            trace.pass("escalate_when", "does not hold");
        }

        // Step 8: supervision requirement.
        if ctx.autonomy == AutonomyRequirement::MustBeSupervised
            && ctx.window == AutonomyWindow::Autonomous
        {
            let reason =
                "task must be supervised but the scheduler is in the autonomous window".to_string();
            return trace.finish(
                "supervision",
                "escalate: autonomous window",
                PolicyDecision::Escalate { reason },
            );
        }

        tracing::debug!(agent, rule = %winner.id, capability = %ctx.capability, "policy allow");
        trace.finish("supervision", "passed", PolicyDecision::Allow)
    }
}

fn deny(reason: String) -> PolicyDecision {
    PolicyDecision::Deny { reason }
}

/// Highest rank, then strictest decision, then lowest rule id.
fn pick_winner<'r>(rules: &[&'r PolicyRule]) -> Option<&'r PolicyRule> {
    rules.iter().copied().max_by(|a, b| {
        a.rank()
            .cmp(&b.rank())
            .then(a.decision.strictness().cmp(&b.decision.strictness()))
            .then(b.id.cmp(&a.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityPattern};
    use crate::context::Priority;
    use crate::identity::AgentIdentity;
    use crate::rule::Condition;
    use chrono::{TimeZone, Utc};
    use wd_budget::{BudgetPeriod, BudgetSnapshot};
    use wd_inspect::DenyKind;

    fn rule(id: &str, resource: &str, action: &str, decision: RuleDecision) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            subject: "*".to_string(),
            capability: CapabilityPattern::new(resource, action, "*"),
            when: Condition::default(),
            escalate_when: None,
            decision,
            specificity: None,
            description: String::new(),
        }
    }

    fn identity() -> AgentIdentity {
        AgentIdentity::new(
            "agent-1",
            vec![CapabilityPattern::new("*", "*", "*")],
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn budget(remaining: u64) -> BudgetSnapshot {
        BudgetSnapshot {
            period: BudgetPeriod { year: 2026, month: 10 },
            cap_cents: 10_000,
            spent_cents: 10_000 - remaining,
            reserved_cents: 0,
            remaining_cents: remaining,
        }
    }

    struct Fixture {
        identity: AgentIdentity,
        capability: Capability,
        verdict: InspectionVerdict,
    }

    impl Fixture {
        fn new(resource: &str, action: &str) -> Self {
            Self {
                identity: identity(),
                capability: Capability::new(resource, action, "src/main.rs"),
                verdict: InspectionVerdict::Pass,
            }
        }

        fn ctx(&self) -> PolicyContext<'_> {
            PolicyContext {
                identity: &self.identity,
                capability: &self.capability,
                budget: budget(5_000),
                inspection: &self.verdict,
                risk_score: 0,
                window: AutonomyWindow::Supervised,
                priority: Priority::Medium,
                autonomy: AutonomyRequirement::AutonomousOk,
                irreversible: false,
                declared_cost_cents: 100,
                now: Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
            }
        }
    }

    fn engine(rules: Vec<PolicyRule>) -> PolicyEngine {
        PolicyEngine::new(RuleSet::new("test", rules).unwrap())
    }

    #[test]
    fn default_deny_without_rules() {
        let f = Fixture::new("repository", "read");
        let decision = engine(vec![]).decide(&f.ctx());
        assert!(matches!(decision, PolicyDecision::Deny { .. }));
    }

    #[test]
    fn matching_allow_rule_allows() {
        let f = Fixture::new("repository", "read");
        let e = engine(vec![rule("read", "repository", "read", RuleDecision::Allow)]);
        assert_eq!(e.decide(&f.ctx()), PolicyDecision::Allow);
    }

    #[test]
    fn inspection_deny_overrides_allow_rule() {
        let mut f = Fixture::new("repository", "read");
        f.verdict = InspectionVerdict::Deny {
            stage: "injection_scan".into(),
            kind: DenyKind::Injection,
            reason: "hit".into(),
        };
        let e = engine(vec![rule("read", "repository", "read", RuleDecision::Allow)]);
        let trace = e.decide_with_trace(&f.ctx());
        assert!(matches!(trace.decision, PolicyDecision::Deny { .. }));
        assert_eq!(trace.steps.len(), 1);
        assert!(trace.steps[0].terminal);
    }

    #[test]
    fn revoked_identity_denied() {
        let mut f = Fixture::new("repository", "read");
        f.identity.revoked = true;
        let e = engine(vec![rule("read", "repository", "read", RuleDecision::Allow)]);
        assert!(matches!(e.decide(&f.ctx()), PolicyDecision::Deny { .. }));
    }

    #[test]
    fn capability_outside_grants_denied() {
        let mut f = Fixture::new("deploy", "production");
        f.identity.grants = vec![CapabilityPattern::new("repository", "*", "*")];
        let e = engine(vec![rule("any", "*", "*", RuleDecision::Allow)]);
        match e.decide(&f.ctx()) {
            PolicyDecision::Deny { reason } => assert!(reason.contains("no grant")),
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn path_traversal_denied() {
        let mut f = Fixture::new("repository", "read");
        f.capability.scope = "../../etc/passwd".into();
        let e = engine(vec![rule("read", "repository", "read", RuleDecision::Allow)]);
        assert!(matches!(e.decide(&f.ctx()), PolicyDecision::Deny { .. }));
    }

    #[test]
    fn more_specific_rule_wins() {
        let f = Fixture::new("repository", "write-pr");
        let e = engine(vec![
            rule("broad-deny", "*", "*", RuleDecision::Deny),
            rule("pr-allow", "repository", "write-pr", RuleDecision::Allow),
        ]);
        let trace = e.decide_with_trace(&f.ctx());
        assert_eq!(trace.decision, PolicyDecision::Allow);
        assert_eq!(trace.matching_rule.as_deref(), Some("pr-allow"));
        assert_eq!(trace.rules_considered.len(), 2);
    }

    #[test]
    fn deny_wins_at_equal_specificity() {
        let f = Fixture::new("repository", "read");
        let e = engine(vec![
            rule("a-allow", "repository", "read", RuleDecision::Allow),
            rule("b-escalate", "repository", "read", RuleDecision::Escalate),
            rule("c-deny", "repository", "read", RuleDecision::Deny),
        ]);
        let trace = e.decide_with_trace(&f.ctx());
        assert!(matches!(trace.decision, PolicyDecision::Deny { .. }));
        assert_eq!(trace.matching_rule.as_deref(), Some("c-deny"));
    }

    #[test]
    fn escalate_beats_allow_at_equal_specificity() {
        let f = Fixture::new("repository", "read");
        let e = engine(vec![
            rule("allow", "repository", "read", RuleDecision::Allow),
            rule("escalate", "repository", "read", RuleDecision::Escalate),
        ]);
        assert!(matches!(e.decide(&f.ctx()), PolicyDecision::Escalate { .. }));
    }

    #[test]
    fn when_condition_gates_applicability() {
        let f = Fixture::new("deploy", "production");
        let mut gated = rule("autonomous-only", "deploy", "production", RuleDecision::Allow);
        gated.when.window = Some(AutonomyWindow::Autonomous);
        let e = engine(vec![gated]);
        // Supervised window: the only rule does not apply → default deny.
        assert!(matches!(e.decide(&f.ctx()), PolicyDecision::Deny { .. }));
    }

    #[test]
    fn escalate_when_turns_allow_into_escalate() {
        let f = Fixture::new("deploy", "production");
        let mut r = rule("deploy", "deploy", "production", RuleDecision::Allow);
        r.escalate_when = Some(Condition {
            window: Some(AutonomyWindow::Supervised),
            ..Default::default()
        });
        let e = engine(vec![r]);
        assert!(matches!(e.decide(&f.ctx()), PolicyDecision::Escalate { .. }));
    }

    #[test]
    fn budget_condition_escalates_when_low() {
        let f = Fixture::new("search", "query");
        let mut r = rule("search", "search", "query", RuleDecision::Allow);
        r.escalate_when = Some(Condition {
            budget_remaining_below: Some(10_000),
            ..Default::default()
        });
        let e = engine(vec![r]);
        assert!(matches!(e.decide(&f.ctx()), PolicyDecision::Escalate { .. }));
    }

    #[test]
    fn must_be_supervised_escalates_in_autonomous_window() {
        let f = Fixture::new("repository", "read");
        let e = engine(vec![rule("read", "repository", "read", RuleDecision::Allow)]);
        let mut ctx = f.ctx();
        ctx.autonomy = AutonomyRequirement::MustBeSupervised;
        ctx.window = AutonomyWindow::Autonomous;
        assert!(matches!(e.decide(&ctx), PolicyDecision::Escalate { .. }));
        ctx.window = AutonomyWindow::Supervised;
        assert_eq!(e.decide(&ctx), PolicyDecision::Allow);
    }

    #[test]
    fn decisions_are_deterministic() {
        let f = Fixture::new("repository", "write-pr");
        let e = engine(vec![
            rule("x", "repository", "*", RuleDecision::Allow),
            rule("y", "repository", "*", RuleDecision::Allow),
            rule("z", "*", "write-pr", RuleDecision::Escalate),
        ]);
        let first = e.decide_with_trace(&f.ctx());
        for _ in 0..100 {
            assert_eq!(e.decide_with_trace(&f.ctx()), first);
        }
        // Equal rank and decision: lowest id wins.
        assert_eq!(first.matching_rule.as_deref(), Some("x"));
    }

    #[test]
    fn trace_serializes_decision_tag() {
        let f = Fixture::new("repository", "read");
        let trace = engine(vec![]).decide_with_trace(&f.ctx());
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["decision"]["decision"], "deny");
    }
}
