// rule.rs — Policy rules and rule sets.
//
// A rule applies when its subject pattern matches the agent id, its
// capability pattern matches the request, and its `when` condition holds.
// Among applicable rules the most specific wins. Rules are data: they are
// loaded from the policy bundle's YAML and never edited in place.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::capability::{glob_matches, literal_len, CapabilityPattern};
use crate::context::{AutonomyWindow, PolicyContext, Priority};
use crate::error::PolicyError;

/// Points added to a computed rank for each condition clause.
const CLAUSE_WEIGHT: u32 = 8;

/// What a rule decides when it wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleDecision {
    Allow,
    Deny,
    Escalate,
}

impl RuleDecision {
    /// Tie-break weight at equal specificity: Deny > Escalate > Allow.
    pub(crate) fn strictness(&self) -> u8 {
        match self {
            RuleDecision::Deny => 2,
            RuleDecision::Escalate => 1,
            RuleDecision::Allow => 0,
        }
    }
}

/// A conjunction of optional clauses. An empty condition always holds.
///
/// Budget clauses test `remaining_cents` of the snapshot in the context,
/// which already excludes this request's own reservation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<AutonomyWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_remaining_below: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_remaining_at_least: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_risk_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub irreversible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_above: Option<u64>,
}

impl Condition {
    pub fn holds(&self, ctx: &PolicyContext<'_>) -> bool {
        let remaining = ctx.budget.remaining_cents;
        self.window.map_or(true, |w| w == ctx.window)
            && self.budget_remaining_below.map_or(true, |v| remaining < v)
            && self.budget_remaining_at_least.map_or(true, |v| remaining >= v)
            && self.min_risk_score.map_or(true, |v| ctx.risk_score >= v)
            && self.max_risk_score.map_or(true, |v| ctx.risk_score <= v)
            && self.min_priority.map_or(true, |p| ctx.priority >= p)
            && self.irreversible.map_or(true, |i| i == ctx.irreversible)
            && self.cost_above.map_or(true, |v| ctx.declared_cost_cents > v)
    }

    /// Number of clauses that are set.
    pub fn clause_count(&self) -> u32 {
        [
            self.window.is_some(),
            self.budget_remaining_below.is_some(),
            self.budget_remaining_at_least.is_some(),
            self.min_risk_score.is_some(),
            self.max_risk_score.is_some(),
            self.min_priority.is_some(),
            self.irreversible.is_some(),
            self.cost_above.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.clause_count() == 0
    }
}

fn any_subject() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    pub id: String,
    /// Glob over agent ids.
    #[serde(default = "any_subject")]
    pub subject: String,
    pub capability: CapabilityPattern,
    /// Applicability: the rule is only considered when this holds.
    #[serde(default)]
    pub when: Condition,
    /// For Allow rules: escalate instead when this holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_when: Option<Condition>,
    pub decision: RuleDecision,
    /// Explicit rank; overrides the computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specificity: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl PolicyRule {
    /// The rank used to pick a winner among applicable rules.
    pub fn rank(&self) -> u32 {
        self.specificity.unwrap_or_else(|| {
            literal_len(&self.subject)
                + self.capability.literal_len()
                + CLAUSE_WEIGHT * self.when.clause_count()
        })
    }

    pub fn subject_matches(&self, agent_id: &str) -> bool {
        glob_matches(&self.subject, agent_id)
    }

    /// Whether the rule applies to this context.
    pub fn applies(&self, ctx: &PolicyContext<'_>) -> bool {
        self.subject_matches(&ctx.identity.agent_id)
            && self.capability.matches(ctx.capability)
            && self.when.holds(ctx)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        glob::Pattern::new(&self.subject).map_err(|e| PolicyError::InvalidPattern {
            pattern: self.subject.clone(),
            reason: e.to_string(),
        })?;
        self.capability.validate()
    }
}

/// A validated, versioned list of rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSet {
    pub version: String,
    pub rules: Vec<PolicyRule>,
}

impl RuleSet {
    pub fn new(version: impl Into<String>, rules: Vec<PolicyRule>) -> Result<Self, PolicyError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateRule {
                    id: rule.id.clone(),
                });
            }
            rule.validate()?;
        }
        Ok(Self {
            version: version.into(),
            rules,
        })
    }

    /// Parse and validate a YAML document with `version` and `rules`.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let raw: RuleSet = serde_yaml::from_str(yaml)?;
        Self::new(raw.version, raw.rules)
    }

    pub fn empty() -> Self {
        Self {
            version: "empty".to_string(),
            rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
version: "2026.10"
rules:
  - id: ci-read
    subject: "ci-*"
    capability: { resource: repository, action: read, scope: "**" }
    decision: allow
  - id: prod-deploy
    capability: { resource: deploy, action: production }
    when: { window: autonomous }
    decision: escalate
"#;

    #[test]
    fn parse_rule_set() {
        let set = RuleSet::from_yaml(YAML).unwrap();
        assert_eq!(set.version, "2026.10");
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].subject, "ci-*");
        assert_eq!(set.rules[1].subject, "*");
        assert_eq!(set.rules[1].when.window, Some(AutonomyWindow::Autonomous));
    }

    #[test]
    fn computed_rank_counts_literals_and_clauses() {
        let set = RuleSet::from_yaml(YAML).unwrap();
        // "ci-" (3) + "repository" (10) + "read" (4) + "**" (0)
        assert_eq!(set.rules[0].rank(), 17);
        // "" + "deploy" (6) + "production" (10) + "*" (0) + one clause (8)
        assert_eq!(set.rules[1].rank(), 24);
    }

    #[test]
    fn explicit_specificity_overrides() {
        let mut set = RuleSet::from_yaml(YAML).unwrap();
        set.rules[0].specificity = Some(1000);
        assert_eq!(set.rules[0].rank(), 1000);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let rule = PolicyRule {
            id: "dup".into(),
            subject: "*".into(),
            capability: CapabilityPattern::new("*", "*", "*"),
            when: Condition::default(),
            escalate_when: None,
            decision: RuleDecision::Deny,
            specificity: None,
            description: String::new(),
        };
        let err = RuleSet::new("v1", vec![rule.clone(), rule]).unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateRule { .. }));
    }

    #[test]
    fn unknown_condition_field_rejected() {
        let yaml = r#"
version: "1"
rules:
  - id: r
    capability: { resource: x, action: y }
    when: { weekday: monday }
    decision: allow
"#;
        assert!(RuleSet::from_yaml(yaml).is_err());
    }
}
