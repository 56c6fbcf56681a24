// policy.rs — Policy subcommands: validate, explain.
//
// `explain` is a dry run of the decision the gateway would make: it runs
// input inspection and the policy engine against the configured identity,
// with no budget reservation, no lease and no audit event.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use wd_budget::BudgetLedger;
use wd_gateway::{GatewayConfig, PolicyBundle};
use wd_policy::{
    AgentIdentity, AutonomyRequirement, Capability, EvaluationTrace, PolicyContext,
    PolicyDecision, Priority,
};

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Parse and compile a policy bundle.
    Validate {
        /// Bundle file (defaults to paths.policy from the config).
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
    /// Show how a request would be decided, step by step.
    Explain {
        #[arg(long)]
        bundle: Option<PathBuf>,
        /// Agent id; must be one of the configured identities.
        #[arg(long)]
        agent: String,
        #[arg(long)]
        resource: String,
        #[arg(long)]
        action: String,
        #[arg(long, default_value = "")]
        scope: String,
        /// Task payload as JSON.
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long, default_value = "0")]
        cost_cents: u64,
        /// Budget left this month (defaults to the configured cap).
        #[arg(long)]
        remaining_cents: Option<u64>,
        #[arg(long)]
        supervised: bool,
        #[arg(long)]
        irreversible: bool,
        /// Evaluate at this RFC 3339 time instead of now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

pub fn execute(cmd: &PolicyCommands, config: &GatewayConfig) -> anyhow::Result<()> {
    match cmd {
        PolicyCommands::Validate { bundle } => {
            let path = bundle.clone().unwrap_or_else(|| config.paths.policy.clone());
            let compiled = PolicyBundle::load(&path)
                .with_context(|| format!("policy bundle {}", path.display()))?;
            println!("Bundle {} is valid.", path.display());
            println!("  version: {}", compiled.version());
            println!("  digest:  {}", compiled.digest());
            println!("  rules:   {}", compiled.engine().rules().rules.len());
            Ok(())
        }

        PolicyCommands::Explain {
            bundle,
            agent,
            resource,
            action,
            scope,
            payload,
            priority,
            cost_cents,
            remaining_cents,
            supervised,
            irreversible,
            at,
        } => {
            let path = bundle.clone().unwrap_or_else(|| config.paths.policy.clone());
            let compiled = PolicyBundle::load(&path)
                .with_context(|| format!("policy bundle {}", path.display()))?;
            let request = ExplainRequest {
                agent,
                capability: Capability::new(resource.as_str(), action.as_str(), scope.as_str()),
                payload: serde_json::from_str(payload).context("--payload is not JSON")?,
                priority: parse_priority(priority)?,
                cost_cents: *cost_cents,
                remaining_cents: *remaining_cents,
                supervised: *supervised,
                irreversible: *irreversible,
                at: at.unwrap_or_else(Utc::now),
            };
            let explained = explain(config, &compiled, &request)?;
            print_trace(&explained);
            Ok(())
        }
    }
}

struct ExplainRequest<'a> {
    agent: &'a str,
    capability: Capability,
    payload: serde_json::Value,
    priority: Priority,
    cost_cents: u64,
    remaining_cents: Option<u64>,
    supervised: bool,
    irreversible: bool,
    at: DateTime<Utc>,
}

struct Explained {
    window: wd_policy::AutonomyWindow,
    risk_score: u32,
    trace: EvaluationTrace,
}

fn explain(
    config: &GatewayConfig,
    bundle: &PolicyBundle,
    req: &ExplainRequest<'_>,
) -> anyhow::Result<Explained> {
    let grants = config
        .identities
        .iter()
        .find(|i| i.agent_id == req.agent)
        .map(|i| i.grants.clone())
        .with_context(|| format!("no identity '{}' in the config", req.agent))?;
    let identity = AgentIdentity::new(req.agent, grants, req.at)?;

    let report = bundle.inspector().inspect_input(
        &req.capability.resource,
        &req.capability.action,
        &req.payload,
    );

    let cap = config.budget.monthly_cap_cents;
    let mut budget = BudgetLedger::new(cap, req.at).snapshot(req.at)?;
    if let Some(remaining) = req.remaining_cents {
        budget.remaining_cents = remaining.min(cap);
        budget.spent_cents = cap - budget.remaining_cents;
    }

    let window = config.scheduler.compile()?.window_at(req.at);
    let ctx = PolicyContext {
        identity: &identity,
        capability: &req.capability,
        budget,
        inspection: &report.verdict,
        risk_score: report.risk_score,
        window,
        priority: req.priority,
        autonomy: if req.supervised {
            AutonomyRequirement::MustBeSupervised
        } else {
            AutonomyRequirement::AutonomousOk
        },
        irreversible: req.irreversible,
        declared_cost_cents: req.cost_cents,
        now: req.at,
    };
    Ok(Explained {
        window,
        risk_score: report.risk_score,
        trace: bundle.engine().decide_with_trace(&ctx),
    })
}

fn parse_priority(s: &str) -> anyhow::Result<Priority> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| anyhow::anyhow!("unknown priority '{}' (critical, high, medium, low)", s))
}

fn print_trace(explained: &Explained) {
    println!("Window:     {:?}", explained.window);
    println!("Risk score: {}", explained.risk_score);
    println!();
    for step in &explained.trace.steps {
        let marker = if step.terminal { "=>" } else { "  " };
        println!("{} {:<18} {}", marker, step.check, step.outcome);
    }
    println!();
    if !explained.trace.rules_considered.is_empty() {
        println!("Rules considered: {}", explained.trace.rules_considered.join(", "));
    }
    match &explained.trace.decision {
        PolicyDecision::Allow => println!("Decision: ALLOW"),
        PolicyDecision::Deny { reason } => println!("Decision: DENY ({})", reason),
        PolicyDecision::Escalate { reason } => println!("Decision: ESCALATE ({})", reason),
    }
}
