// router.rs — The task pipeline.
//
// submit() runs one request through every stage in order:
//
//   halted? → intake → throttle → input inspection → registry → identity
//   → budget reserve → policy → executor route → vault issue
//   → authorize_use → halted? → dispatch (timeout) → output inspection → budget commit
//
// Each stage appends its outcome to the audit log before the next stage
// starts. A stage that stops the request records a deny event and returns
// a Stop; unwinding then revokes a lease issued by this request, releases
// its reservation, and raises an alert for security-relevant codes.
// An audit write failure is itself a Stop (AuditWriteFailure). Nothing is
// retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wd_audit::{AuditDecision, AuditError, AuditEvent, AuditLog, AuditStage};
use wd_budget::{BudgetError, BudgetLedger, BudgetSnapshot, Reservation};
use wd_credentials::{CredentialVault, IssueOutcome, VaultError};
use wd_inspect::{DenyKind, InspectionVerdict};
use wd_policy::{AgentIdentity, PolicyContext, PolicyDecision, ToolRegistry};

use crate::alerts::{Alert, AlertDispatcher, JsonlAlertSink, TracingAlertSink};
use crate::bundle::PolicyBundle;
use crate::clock::{Clock, SystemClock};
use crate::config::{GatewayConfig, LeaseConfig};
use crate::error::{GatewayError, ReasonCode};
use crate::escalation::{EscalationQueue, PendingEscalation, Resolution};
use crate::executor::{AuthorizedTask, ExecutorSet};
use crate::request::{TaskRequest, TaskResponse};
use crate::scheduler::Scheduler;
use crate::throttle::Throttle;

/// Audit subject for operator and system events.
pub const OPERATOR: &str = "operator";

/// Everything a gateway needs besides its config.
pub struct GatewayParts {
    pub audit: AuditLog,
    pub bundle: PolicyBundle,
    pub executors: ExecutorSet,
    pub alerts: AlertDispatcher,
    pub clock: Arc<dyn Clock>,
}

/// What the kill switch reports once revocation is done.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillSwitchReport {
    pub revoked: usize,
    /// Live leases after revocation. Zero on success.
    pub remaining: usize,
    pub audit_sequence: u64,
}

pub struct Gateway {
    audit: AuditLog,
    ledger: BudgetLedger,
    vault: CredentialVault,
    registry: Arc<RwLock<ToolRegistry>>,
    bundle: RwLock<Arc<PolicyBundle>>,
    scheduler: Scheduler,
    throttle: Throttle,
    escalations: EscalationQueue,
    executors: ExecutorSet,
    leases: LeaseConfig,
    alerts: AlertDispatcher,
    clock: Arc<dyn Clock>,
    halted: AtomicBool,
    /// Read-held from the last halt check to the executor spawn; `halt`
    /// takes it for writing so no dispatch starts after it returns.
    dispatch_gate: RwLock<()>,
    auto_throttle_per_minute: Option<u32>,
}

impl Gateway {
    /// Build a production gateway: file-backed audit log, policy bundle
    /// from disk, executors from config, alerts to tracing and JSONL.
    pub fn open(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let audit = AuditLog::open(&config.paths.audit_log)?;
        let bundle = PolicyBundle::load(&config.paths.policy)?;
        let mut alerts = AlertDispatcher::new();
        alerts.add_sink(Box::new(TracingAlertSink));
        alerts.add_sink(Box::new(JsonlAlertSink::new(&config.paths.alerts_log)));
        Self::assemble(
            config,
            GatewayParts {
                audit,
                bundle,
                executors: ExecutorSet::from_config(&config.executors),
                alerts,
                clock: Arc::new(SystemClock),
            },
        )
    }

    /// Build a gateway from explicit parts. Records `gateway_started` and
    /// `registry_bootstrap` before returning.
    pub fn assemble(config: &GatewayConfig, parts: GatewayParts) -> Result<Self, GatewayError> {
        let now = parts.clock.now();

        let mut approvers = HashMap::new();
        for approver in &config.approvers {
            let key = STANDARD.decode(&approver.key).map_err(|e| {
                GatewayError::Config(format!("approver '{}' key is not base64: {}", approver.id, e))
            })?;
            approvers.insert(approver.id.clone(), key);
        }
        let mut registry = ToolRegistry::new(approvers);
        registry.bootstrap(config.tools.clone())?;
        let registry = Arc::new(RwLock::new(registry));

        let vault = CredentialVault::new(registry.clone())?;
        for identity in &config.identities {
            vault.register_identity(AgentIdentity::new(
                &identity.agent_id,
                identity.grants.clone(),
                now,
            )?)?;
        }

        let gateway = Self {
            audit: parts.audit,
            ledger: BudgetLedger::new(config.budget.monthly_cap_cents, now),
            vault,
            registry,
            bundle: RwLock::new(Arc::new(parts.bundle)),
            scheduler: Scheduler::new(config.scheduler.compile()?),
            throttle: Throttle::new(),
            escalations: EscalationQueue::new(),
            executors: parts.executors,
            leases: config.leases.clone(),
            alerts: parts.alerts,
            clock: parts.clock,
            halted: AtomicBool::new(false),
            dispatch_gate: RwLock::new(()),
            auto_throttle_per_minute: config.admin.auto_throttle_per_minute,
        };

        let bundle = gateway.current_bundle()?;
        gateway.record(
            AuditEvent::new(AuditStage::Config, OPERATOR, "gateway_started", AuditDecision::Record)
                .with_metadata(json!({
                    "bundle_version": bundle.version(),
                    "bundle_digest": bundle.digest(),
                    "monthly_cap_cents": config.budget.monthly_cap_cents,
                    "identities": config.identities.iter().map(|i| &i.agent_id).collect::<Vec<_>>(),
                    "executors": gateway.executors.len(),
                })),
        )?;
        gateway.record(
            AuditEvent::new(
                AuditStage::Registry,
                OPERATOR,
                "registry_bootstrap",
                AuditDecision::Record,
            )
            .with_reason("operator-authored baseline from config")
            .with_metadata(json!({
                "tools": config
                    .tools
                    .iter()
                    .map(|t| json!({"name": t.name, "version": t.version, "vetted": t.vetted}))
                    .collect::<Vec<_>>(),
            })),
        )?;
        info!(
            bundle_version = %bundle.version(),
            tools = config.tools.len(),
            identities = config.identities.len(),
            "gateway assembled"
        );
        Ok(gateway)
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn escalations(&self) -> &EscalationQueue {
        &self.escalations
    }

    pub fn registry(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// The bundle new requests will use.
    pub fn current_bundle(&self) -> Result<Arc<PolicyBundle>, GatewayError> {
        self.bundle
            .read()
            .map(|b| Arc::clone(&b))
            .map_err(|_| GatewayError::Poisoned { what: "policy bundle" })
    }

    pub fn budget_status(&self) -> Result<BudgetSnapshot, GatewayError> {
        Ok(self.ledger.snapshot(self.clock.now())?)
    }

    pub(crate) fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub(crate) fn record(&self, mut event: AuditEvent) -> Result<u64, AuditError> {
        self.audit.append(&mut event)
    }

    pub(crate) fn raise_alert(&self, alert: &Alert) {
        self.alerts.dispatch(alert);
    }

    // ── Operator-side effects (authorized by the override controller) ──

    /// Swap in a new bundle. Requests already running keep the old one.
    ///
    /// The swap is audited first; if the audit write fails the old bundle
    /// stays. Also called by the daemon's policy file watcher.
    pub fn reload_bundle(&self, bundle: PolicyBundle, actor: &str) -> Result<u64, GatewayError> {
        let previous = self.current_bundle()?;
        let seq = self.record(
            AuditEvent::new(AuditStage::Config, actor, "policy_reload", AuditDecision::Record)
                .with_metadata(json!({
                    "from_version": previous.version(),
                    "from_digest": previous.digest(),
                    "to_version": bundle.version(),
                    "to_digest": bundle.digest(),
                })),
        )?;
        let mut slot = self
            .bundle
            .write()
            .map_err(|_| GatewayError::Poisoned { what: "policy bundle" })?;
        info!(
            from = %previous.version(),
            to = %bundle.version(),
            audit_sequence = seq,
            "policy bundle reloaded"
        );
        *slot = Arc::new(bundle);
        Ok(seq)
    }

    /// Halt the router, seal the vault and revoke every lease.
    pub(crate) fn halt(&self, reason: &str, actor: &str) -> Result<KillSwitchReport, GatewayError> {
        self.halted.store(true, Ordering::Release);
        // Wait out dispatches that passed their halt check before the store.
        drop(self.dispatch_gate.write().unwrap_or_else(|p| p.into_inner()));
        let report = self.vault.revoke_all()?;
        let remaining = self.vault.active_count(self.clock.now())?;
        let seq = self.record(
            AuditEvent::new(AuditStage::Override, actor, "kill_switch", AuditDecision::Halt)
                .with_reason(reason)
                .with_metadata(json!({
                    "revoked": report.revoked,
                    "remaining": remaining,
                    "pending_escalations": self.escalations.len(),
                })),
        )?;
        error!(
            revoked = report.revoked,
            remaining,
            audit_sequence = seq,
            "kill switch engaged: {}",
            reason
        );
        Ok(KillSwitchReport {
            revoked: report.revoked,
            remaining,
            audit_sequence: seq,
        })
    }

    // ── Task submission ─────────────────────────────────────────

    /// Run a request through the pipeline. Never panics and never returns
    /// an error: every failure is a deny response with a reason code.
    pub async fn submit(&self, request: TaskRequest) -> TaskResponse {
        if self.is_halted() {
            let flight = Flight::new(self, &request, self.clock.now());
            let stop = flight.deny(
                AuditStage::Intake,
                "halted",
                ReasonCode::Halted,
                "gateway halted by kill switch".to_string(),
                json!({}),
            );
            return self.unwind(flight, stop);
        }
        let bundle = match self.current_bundle() {
            Ok(b) => b,
            Err(e) => {
                return TaskResponse::deny(request.request_id, ReasonCode::Internal, e.to_string())
            }
        };
        let mut flight = Flight::new(self, &request, self.clock.now());
        let outcome = self.run(&mut flight, &bundle).await;
        self.finish(flight, outcome)
    }

    /// Apply an operator's answer to a parked escalation. Allow resumes
    /// the request at the budget reservation.
    pub(crate) async fn resolve(
        &self,
        escalation_id: Uuid,
        resolution: Resolution,
        note: &str,
        actor: &str,
    ) -> Result<TaskResponse, GatewayError> {
        if self.is_halted() {
            return Err(GatewayError::Halted);
        }
        let pending = self.escalations.take(escalation_id)?;
        let decision = match resolution {
            Resolution::Allow => AuditDecision::Allow,
            Resolution::Deny => AuditDecision::Deny,
        };
        let recorded = self.record(
            AuditEvent::new(AuditStage::Escalation, actor, "escalation_resolved", decision)
                .with_request(pending.request.request_id)
                .with_reason(note)
                .with_metadata(json!({
                    "escalation_id": escalation_id,
                    "agent_id": pending.request.agent_id,
                    "capability": pending.request.capability,
                })),
        );
        if let Err(e) = recorded {
            self.escalations.park(pending)?;
            return Err(e.into());
        }
        info!(%escalation_id, ?resolution, "escalation resolved");

        match resolution {
            Resolution::Deny => Ok(TaskResponse::deny(
                pending.request.request_id,
                ReasonCode::PolicyDenied,
                format!("denied by operator: {}", note),
            )),
            Resolution::Allow => {
                let bundle = self.current_bundle()?;
                let mut flight = Flight::new(self, &pending.request, self.clock.now());
                let outcome = self.resume(&mut flight, &bundle).await;
                Ok(self.finish(flight, outcome))
            }
        }
    }

    async fn run(
        &self,
        flight: &mut Flight<'_>,
        bundle: &PolicyBundle,
    ) -> Result<TaskResponse, Stop> {
        let request = flight.request;
        let capability = &request.capability;

        // Intake
        if let Some(problem) = request.malformed() {
            return Err(flight.deny(
                AuditStage::Intake,
                "request_rejected",
                ReasonCode::InvalidRequest,
                problem.to_string(),
                serde_json::Value::Null,
            ));
        }
        flight.record(
            flight
                .event(AuditStage::Intake, "task_received", AuditDecision::Record)
                .with_metadata(json!({
                    "capability": capability,
                    "priority": request.priority,
                    "declared_cost_cents": request.declared_cost_cents,
                    "autonomy": request.autonomy,
                    "irreversible": request.irreversible,
                    "bundle_version": bundle.version(),
                })),
        )?;

        // Throttle
        if !self.throttle.admit(&request.agent_id, flight.now).map_err(Stop::internal)? {
            let limit = self.throttle.limit_for(&request.agent_id).map_err(Stop::internal)?;
            return Err(flight.deny(
                AuditStage::Throttle,
                "throttled",
                ReasonCode::Throttled,
                "agent is over its per-minute request limit".to_string(),
                json!({ "per_minute": limit }),
            ));
        }
        flight.record(flight.event(AuditStage::Throttle, "throttle_check", AuditDecision::Pass))?;

        // Input inspection
        let report =
            bundle
                .inspector()
                .inspect_input(&capability.resource, &capability.action, &request.payload);
        if let InspectionVerdict::Deny {
            stage,
            kind,
            reason,
        } = &report.verdict
        {
            let code = if *kind == DenyKind::Injection {
                ReasonCode::InjectionDetected
            } else {
                ReasonCode::InspectionFailed
            };
            return Err(flight.deny(
                AuditStage::InputInspection,
                "input_rejected",
                code,
                format!("{}: {}", stage, reason),
                json!({ "kind": kind, "stages_run": report.stages_run }),
            ));
        }
        flight.record(
            flight
                .event(AuditStage::InputInspection, "input_inspected", AuditDecision::Pass)
                .with_metadata(json!({
                    "risk_score": report.risk_score,
                    "stages_run": report.stages_run,
                })),
        )?;

        // Registry
        let tool = {
            let registry = self
                .registry
                .read()
                .map_err(|_| Stop::new(ReasonCode::Internal, "registry lock poisoned"))?;
            registry
                .find_fulfilling(capability)
                .map(|e| (e.name.clone(), e.version.clone()))
        };
        let Some((tool, version)) = tool else {
            return Err(flight.deny(
                AuditStage::Registry,
                "tool_not_registered",
                ReasonCode::ToolNotRegistered,
                format!("no vetted tool fulfils {}", capability),
                serde_json::Value::Null,
            ));
        };
        flight.record(
            flight
                .event(AuditStage::Registry, "tool_resolved", AuditDecision::Pass)
                .with_metadata(json!({ "tool": tool, "version": version })),
        )?;

        // Identity
        let identity = match self.vault.identity(&request.agent_id) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                return Err(flight.deny(
                    AuditStage::Policy,
                    "unknown_identity",
                    ReasonCode::PolicyDenied,
                    format!("unknown agent identity '{}'", request.agent_id),
                    serde_json::Value::Null,
                ))
            }
            Err(e) => {
                return Err(flight.deny(
                    AuditStage::Vault,
                    "vault_unavailable",
                    ReasonCode::VaultUnavailable,
                    e.to_string(),
                    serde_json::Value::Null,
                ))
            }
        };

        // Budget
        self.reserve(flight)?;

        // Policy
        let budget = self.ledger.snapshot(flight.now).map_err(Stop::internal)?;
        let window = self.scheduler.current(flight.now);
        let ctx = PolicyContext {
            identity: &identity,
            capability,
            budget,
            inspection: &report.verdict,
            risk_score: report.risk_score,
            window,
            priority: request.priority,
            autonomy: request.autonomy,
            irreversible: request.irreversible,
            declared_cost_cents: request.declared_cost_cents,
            now: flight.now,
        };
        let trace = bundle.engine().decide_with_trace(&ctx);
        let metadata = json!({
            "bundle_version": bundle.version(),
            "window": window,
            "remaining_cents": budget.remaining_cents,
            "matching_rule": trace.matching_rule,
            "rules_considered": trace.rules_considered,
            "steps": trace.steps,
        });
        match trace.decision {
            PolicyDecision::Allow => {
                flight.record(
                    flight
                        .event(AuditStage::Policy, "policy_decision", AuditDecision::Allow)
                        .with_metadata(metadata),
                )?;
            }
            PolicyDecision::Deny { reason } => {
                return Err(flight.deny(
                    AuditStage::Policy,
                    "policy_decision",
                    ReasonCode::PolicyDenied,
                    reason,
                    metadata,
                ));
            }
            PolicyDecision::Escalate { reason } => {
                flight.record(
                    flight
                        .event(AuditStage::Policy, "policy_decision", AuditDecision::Escalate)
                        .with_reason(reason.clone())
                        .with_metadata(metadata),
                )?;
                return self.park(flight, bundle, reason);
            }
        }

        self.execute_allowed(flight, bundle).await
    }

    /// The tail of the pipeline for a resolved escalation.
    async fn resume(
        &self,
        flight: &mut Flight<'_>,
        bundle: &PolicyBundle,
    ) -> Result<TaskResponse, Stop> {
        self.reserve(flight)?;
        self.execute_allowed(flight, bundle).await
    }

    fn reserve(&self, flight: &mut Flight<'_>) -> Result<(), Stop> {
        let amount = flight.request.declared_cost_cents;
        match self.ledger.reserve(amount, flight.now) {
            Ok(reservation) => {
                let metadata = json!({
                    "reservation_id": reservation.id,
                    "amount_cents": reservation.amount_cents,
                });
                flight.reservation = Some(reservation);
                flight.record(
                    flight
                        .event(AuditStage::Budget, "budget_reserve", AuditDecision::Pass)
                        .with_metadata(metadata),
                )?;
                Ok(())
            }
            Err(e @ BudgetError::BudgetExceeded { .. }) => Err(flight.deny(
                AuditStage::Budget,
                "budget_exceeded",
                ReasonCode::BudgetExceeded,
                e.to_string(),
                json!({ "requested_cents": amount }),
            )),
            Err(e) => Err(flight.deny(
                AuditStage::Budget,
                "budget_unavailable",
                ReasonCode::Internal,
                e.to_string(),
                serde_json::Value::Null,
            )),
        }
    }

    fn park(
        &self,
        flight: &mut Flight<'_>,
        bundle: &PolicyBundle,
        reason: String,
    ) -> Result<TaskResponse, Stop> {
        flight.release("escalated")?;
        let escalation_id = Uuid::new_v4();
        flight.record(
            flight
                .event(AuditStage::Escalation, "escalation_parked", AuditDecision::Escalate)
                .with_reason(reason.clone())
                .with_metadata(json!({ "escalation_id": escalation_id })),
        )?;
        self.escalations
            .park(PendingEscalation {
                escalation_id,
                request: flight.request.clone(),
                reason: reason.clone(),
                parked_at: flight.now,
                bundle_version: bundle.version().to_string(),
            })
            .map_err(Stop::internal)?;
        info!(
            request_id = %flight.request.request_id,
            %escalation_id,
            "request escalated: {}",
            reason
        );
        Ok(TaskResponse::escalate(
            flight.request.request_id,
            escalation_id,
            reason,
        ))
    }

    /// Vault issue through budget commit, for a request policy allowed.
    async fn execute_allowed(
        &self,
        flight: &mut Flight<'_>,
        bundle: &PolicyBundle,
    ) -> Result<TaskResponse, Stop> {
        let request = flight.request;
        let capability = &request.capability;

        let Some(route) = self.executors.route(&capability.resource).cloned() else {
            return Err(flight.deny(
                AuditStage::Executor,
                "no_executor",
                ReasonCode::ExecutorFailed,
                format!("no executor serves resource '{}'", capability.resource),
                serde_json::Value::Null,
            ));
        };

        // Vault
        let policy = self.leases.policy_for(capability);
        let grant = match self
            .vault
            .issue(&request.agent_id, capability, &policy, flight.now)
        {
            Ok(grant) => grant,
            Err(VaultError::LeaseConflict { lease_id }) => {
                return Err(flight.deny(
                    AuditStage::Vault,
                    "lease_conflict",
                    ReasonCode::LeaseConflict,
                    format!("a live lease already holds {} for this agent", capability),
                    json!({ "existing_lease_id": lease_id }),
                ))
            }
            Err(e @ VaultError::ToolNotVetted { .. }) => {
                return Err(flight.deny(
                    AuditStage::Vault,
                    "lease_refused",
                    ReasonCode::ToolNotRegistered,
                    e.to_string(),
                    serde_json::Value::Null,
                ))
            }
            Err(e) => {
                return Err(flight.deny(
                    AuditStage::Vault,
                    "lease_refused",
                    ReasonCode::VaultUnavailable,
                    e.to_string(),
                    serde_json::Value::Null,
                ))
            }
        };
        let lease_id = grant.lease.lease_id;
        if grant.outcome == IssueOutcome::Fresh {
            flight.fresh_lease = Some(lease_id);
        }
        let action = match grant.outcome {
            IssueOutcome::Fresh => "lease_granted",
            IssueOutcome::Extended => "lease_extended",
            IssueOutcome::Reused => "lease_reused",
        };
        flight.record(
            flight
                .event(AuditStage::Vault, action, AuditDecision::Grant)
                .with_metadata(json!({
                    "lease_id": lease_id,
                    "expires_at": grant.lease.expires_at(),
                    "usage": grant.lease.usage,
                })),
        )?;

        if let Err(e) = self.vault.authorize_use(lease_id, capability, flight.now) {
            return Err(flight.deny(
                AuditStage::Vault,
                "lease_use_denied",
                ReasonCode::VaultUnavailable,
                e.to_string(),
                json!({ "lease_id": lease_id }),
            ));
        }

        // Dispatch
        let task = AuthorizedTask {
            request_id: request.request_id,
            agent_id: request.agent_id.clone(),
            capability: capability.clone(),
            payload: request.payload.clone(),
            lease_token: grant.token.clone(),
        };
        let executor = Arc::clone(&route.executor);
        let handle = {
            let _gate = self.dispatch_gate.read().unwrap_or_else(|p| p.into_inner());
            // A kill switch may have landed while the earlier stages ran.
            if self.is_halted() {
                return Err(flight.deny(
                    AuditStage::Executor,
                    "halted",
                    ReasonCode::Halted,
                    "gateway halted by kill switch".to_string(),
                    json!({ "lease_id": lease_id }),
                ));
            }
            flight.record(
                flight
                    .event(AuditStage::Executor, "executor_dispatched", AuditDecision::Pass)
                    .with_metadata(json!({
                        "executor": route.executor.name(),
                        "lease_id": lease_id,
                        "timeout_secs": route.timeout.as_secs(),
                    })),
            )?;
            // The lease is spent on this dispatch; from here it lapses on its own.
            flight.fresh_lease = None;
            // Spawned so a timeout drops only our handle, not the backend call.
            tokio::spawn(async move { executor.execute(task).await })
        };
        let result = match tokio::time::timeout(route.timeout, handle).await {
            Err(_) => {
                return Err(flight.deny(
                    AuditStage::Executor,
                    "executor_timeout",
                    ReasonCode::ExecutorTimeout,
                    format!(
                        "executor did not answer within {}s",
                        route.timeout.as_secs_f64()
                    ),
                    json!({ "lease_id": lease_id }),
                ))
            }
            Ok(Err(join)) => {
                return Err(flight.deny(
                    AuditStage::Executor,
                    "executor_failed",
                    ReasonCode::ExecutorFailed,
                    format!("executor task aborted: {}", join),
                    serde_json::Value::Null,
                ))
            }
            Ok(Ok(Err(e))) => {
                return Err(flight.deny(
                    AuditStage::Executor,
                    "executor_failed",
                    ReasonCode::ExecutorFailed,
                    e.to_string(),
                    serde_json::Value::Null,
                ))
            }
            Ok(Ok(Ok(value))) => value,
        };
        flight.record(flight.event(
            AuditStage::Executor,
            "executor_completed",
            AuditDecision::Pass,
        ))?;

        // Output inspection
        let report =
            bundle
                .inspector()
                .inspect_output(&capability.resource, &capability.action, &result);
        if let InspectionVerdict::Deny {
            stage,
            kind,
            reason,
        } = &report.verdict
        {
            return Err(flight.deny(
                AuditStage::OutputInspection,
                "output_rejected",
                ReasonCode::OutputRejected,
                format!("{}: {}", stage, reason),
                json!({ "kind": kind, "stages_run": report.stages_run }),
            ));
        }
        flight.record(
            flight
                .event(AuditStage::OutputInspection, "output_inspected", AuditDecision::Pass)
                .with_metadata(json!({ "stages_run": report.stages_run })),
        )?;

        // Commit
        let Some(reservation) = flight.reservation.clone() else {
            return Err(Stop::new(ReasonCode::Internal, "no reservation to commit"));
        };
        let sequence = flight.record(
            flight
                .event(AuditStage::Budget, "budget_commit", AuditDecision::Commit)
                .with_metadata(json!({
                    "reservation_id": reservation.id,
                    "amount_cents": reservation.amount_cents,
                })),
        )?;
        self.ledger
            .commit(reservation.id, sequence)
            .map_err(Stop::internal)?;
        flight.reservation = None;

        info!(
            request_id = %request.request_id,
            agent_id = %request.agent_id,
            capability = %capability,
            amount_cents = reservation.amount_cents,
            "task completed"
        );
        Ok(TaskResponse::allow(request.request_id, grant.token, result))
    }

    fn finish(&self, flight: Flight<'_>, outcome: Result<TaskResponse, Stop>) -> TaskResponse {
        match outcome {
            Ok(response) => response,
            Err(stop) => self.unwind(flight, stop),
        }
    }

    /// Give back what the request holds and turn the stop into a response.
    fn unwind(&self, mut flight: Flight<'_>, stop: Stop) -> TaskResponse {
        let request = flight.request;

        if let Some(lease_id) = flight.fresh_lease.take() {
            match self.vault.revoke(lease_id) {
                Ok(()) => {
                    if let Err(e) = flight.record(
                        flight
                            .event(AuditStage::Vault, "lease_revoked", AuditDecision::Revoke)
                            .with_reason(stop.code.as_str())
                            .with_metadata(json!({ "lease_id": lease_id })),
                    ) {
                        warn!(%lease_id, "lease revoked but not audited: {}", e.reason);
                    }
                }
                Err(e) => warn!(%lease_id, "failed to revoke lease: {}", e),
            }
        }

        if let Err(e) = flight.release(stop.code.as_str()) {
            warn!(
                request_id = %request.request_id,
                "failed to release reservation: {}",
                e.reason
            );
        }

        if stop.code.security_relevant() {
            self.alerts.dispatch(&Alert::new(
                stop.code,
                request.agent_id.clone(),
                Some(request.request_id),
                stop.reason.clone(),
                flight.now,
            ));
        }

        if stop.code == ReasonCode::InjectionDetected {
            if let Some(per_minute) = self.auto_throttle_per_minute {
                self.auto_throttle(&flight, per_minute);
            }
        }

        warn!(
            request_id = %request.request_id,
            agent_id = %request.agent_id,
            reason_code = %stop.code,
            "task denied: {}",
            stop.reason
        );
        TaskResponse::deny(request.request_id, stop.code, stop.reason)
    }

    fn auto_throttle(&self, flight: &Flight<'_>, per_minute: u32) {
        let agent_id = &flight.request.agent_id;
        if let Err(e) = self.throttle.set(agent_id, per_minute) {
            warn!(%agent_id, "auto-throttle failed: {}", e);
            return;
        }
        let recorded = self.record(
            AuditEvent::new(
                AuditStage::Override,
                agent_id.as_str(),
                "auto_throttle",
                AuditDecision::Record,
            )
            .with_request(flight.request.request_id)
            .with_reason("injection attempt")
            .with_metadata(json!({ "per_minute": per_minute })),
        );
        if let Err(e) = recorded {
            warn!(%agent_id, "auto-throttle not audited: {}", e);
        }
    }
}

/// Why a request stopped.
#[derive(Debug)]
struct Stop {
    code: ReasonCode,
    reason: String,
}

impl Stop {
    fn new(code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(ReasonCode::Internal, e.to_string())
    }
}

impl From<AuditError> for Stop {
    fn from(e: AuditError) -> Self {
        Self::new(
            ReasonCode::AuditWriteFailure,
            format!("audit write failed: {}", e),
        )
    }
}

/// One request's passage through the pipeline and what it holds.
struct Flight<'g> {
    gateway: &'g Gateway,
    request: &'g TaskRequest,
    now: DateTime<Utc>,
    reservation: Option<Reservation>,
    /// A lease this request created and has not yet spent.
    fresh_lease: Option<Uuid>,
}

impl<'g> Flight<'g> {
    fn new(gateway: &'g Gateway, request: &'g TaskRequest, now: DateTime<Utc>) -> Self {
        debug!(request_id = %request.request_id, agent_id = %request.agent_id, "request in flight");
        Self {
            gateway,
            request,
            now,
            reservation: None,
            fresh_lease: None,
        }
    }

    fn event(&self, stage: AuditStage, action: &str, decision: AuditDecision) -> AuditEvent {
        AuditEvent::new(stage, self.request.agent_id.as_str(), action, decision)
            .with_request(self.request.request_id)
    }

    fn record(&self, event: AuditEvent) -> Result<u64, Stop> {
        Ok(self.gateway.record(event)?)
    }

    /// Record a deny event and return the stop it implies. If the deny
    /// itself cannot be recorded, the stop is AuditWriteFailure.
    fn deny(
        &self,
        stage: AuditStage,
        action: &str,
        code: ReasonCode,
        reason: String,
        metadata: serde_json::Value,
    ) -> Stop {
        let event = self
            .event(stage, action, AuditDecision::Deny)
            .with_reason(reason.clone())
            .with_metadata(json!({ "reason_code": code, "detail": metadata }));
        match self.record(event) {
            Ok(_) => Stop::new(code, reason),
            Err(stop) => stop,
        }
    }

    /// Release the held reservation, if any, and record it.
    fn release(&mut self, why: &str) -> Result<(), Stop> {
        if let Some(reservation) = self.reservation.take() {
            self.gateway
                .ledger()
                .release(reservation.id)
                .map_err(Stop::internal)?;
            self.record(
                self.event(AuditStage::Budget, "budget_release", AuditDecision::Release)
                    .with_reason(why)
                    .with_metadata(json!({
                        "reservation_id": reservation.id,
                        "amount_cents": reservation.amount_cents,
                    })),
            )?;
        }
        Ok(())
    }
}
