// override_ctl.rs — Human override commands.
//
// Every command takes the operator token and checks it against the SHA-256
// configured in `[admin] token_sha256` before doing anything. Agent lease
// tokens are never accepted here. Rejected attempts are audited and raise
// an alert.
//
// Each command records its audit event before its effect becomes visible,
// so an audit failure leaves the gateway as it was. The kill switch is the
// exception: halting and revoking come first and the event confirms them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;
use wd_audit::hasher::hash_str;
use wd_audit::{AuditDecision, AuditEvent, AuditStage};
use wd_budget::BudgetSnapshot;
use wd_credentials::VaultError;
use wd_policy::{Approval, RegistryChange};

use crate::alerts::Alert;
use crate::bundle::PolicyBundle;
use crate::error::{GatewayError, ReasonCode};
use crate::escalation::{PendingEscalation, Resolution};
use crate::request::TaskResponse;
use crate::router::{Gateway, KillSwitchReport, OPERATOR};
use crate::scheduler::{ScheduleConfig, ScheduleStatus};

pub struct OverrideController {
    gateway: Arc<Gateway>,
    token_sha256: Option<String>,
    policy_path: Option<PathBuf>,
}

impl OverrideController {
    /// `token_sha256` is the hex digest of the operator token. `None`
    /// rejects every command.
    pub fn new(gateway: Arc<Gateway>, token_sha256: Option<String>) -> Self {
        Self {
            gateway,
            token_sha256: token_sha256.map(|h| h.to_ascii_lowercase()),
            policy_path: None,
        }
    }

    /// Where `reload_policy` reads from when given no bundle text.
    pub fn with_policy_path(mut self, path: impl AsRef<Path>) -> Self {
        self.policy_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Check the operator token.
    pub fn authorize(&self, token: &str, command: &str) -> Result<(), GatewayError> {
        let accepted = match &self.token_sha256 {
            Some(expected) => hash_str(token)
                .as_bytes()
                .ct_eq(expected.as_bytes())
                .into(),
            None => false,
        };
        if accepted {
            return Ok(());
        }
        let now = self.gateway.now();
        warn!(command, "admin command rejected: bad operator token");
        let recorded = self.gateway.record(
            AuditEvent::new(
                AuditStage::Override,
                OPERATOR,
                "admin_unauthorized",
                AuditDecision::Deny,
            )
            .with_reason(format!("rejected operator token for '{}'", command)),
        );
        if let Err(e) = recorded {
            warn!("unauthorized attempt not audited: {}", e);
        }
        self.gateway.raise_alert(&Alert::new(
            ReasonCode::Unauthorized,
            OPERATOR,
            None,
            format!("admin command '{}' with a bad operator token", command),
            now,
        ));
        Err(GatewayError::Unauthorized)
    }

    /// Halt the router and revoke every lease. Returns once revocation is
    /// confirmed.
    pub fn kill_switch(
        &self,
        token: &str,
        reason: &str,
    ) -> Result<KillSwitchReport, GatewayError> {
        self.authorize(token, "kill_switch")?;
        self.gateway.halt(reason, OPERATOR)
    }

    /// Limit an agent to `per_minute` admitted requests.
    pub fn throttle(
        &self,
        token: &str,
        agent_id: &str,
        per_minute: u32,
    ) -> Result<u64, GatewayError> {
        self.authorize(token, "throttle")?;
        let seq = self.record(
            AuditEvent::new(AuditStage::Override, agent_id, "throttle_set", AuditDecision::Record)
                .with_metadata(json!({ "per_minute": per_minute })),
        )?;
        self.gateway.throttle().set(agent_id, per_minute)?;
        info!(agent_id, per_minute, "agent throttled");
        Ok(seq)
    }

    /// Lift an agent's limit. Returns whether one was set.
    pub fn clear_throttle(&self, token: &str, agent_id: &str) -> Result<bool, GatewayError> {
        self.authorize(token, "clear_throttle")?;
        self.record(AuditEvent::new(
            AuditStage::Override,
            agent_id,
            "throttle_cleared",
            AuditDecision::Record,
        ))?;
        let existed = self.gateway.throttle().clear(agent_id)?;
        info!(agent_id, existed, "agent throttle cleared");
        Ok(existed)
    }

    /// Answer a parked escalation. Allow runs the rest of the pipeline and
    /// returns its response.
    pub async fn resolve_escalation(
        &self,
        token: &str,
        escalation_id: Uuid,
        resolution: Resolution,
        note: &str,
    ) -> Result<TaskResponse, GatewayError> {
        self.authorize(token, "resolve_escalation")?;
        self.gateway
            .resolve(escalation_id, resolution, note, OPERATOR)
            .await
    }

    pub fn list_escalations(&self, token: &str) -> Result<Vec<PendingEscalation>, GatewayError> {
        self.authorize(token, "list_escalations")?;
        self.gateway.escalations().list()
    }

    /// Raise this period's cap. The `budget_override` event carrying
    /// `authorization` is appended before the cap moves.
    pub fn override_budget(
        &self,
        token: &str,
        additional_cents: u64,
        authorization: &str,
    ) -> Result<BudgetSnapshot, GatewayError> {
        self.authorize(token, "budget_override")?;
        if authorization.trim().is_empty() {
            return Err(GatewayError::Config(
                "budget override needs a written authorization".into(),
            ));
        }
        let seq = self.record(
            AuditEvent::new(
                AuditStage::Override,
                OPERATOR,
                "budget_override",
                AuditDecision::Record,
            )
            .with_reason(authorization)
            .with_metadata(json!({ "additional_cents": additional_cents })),
        )?;
        let snapshot = self
            .gateway
            .ledger()
            .override_cap(additional_cents, seq, self.gateway.now())?;
        Ok(snapshot)
    }

    /// Force (or stop forcing) the supervised window. Returns the previous
    /// setting.
    pub fn force_supervised(&self, token: &str, force: bool) -> Result<bool, GatewayError> {
        self.authorize(token, "force_supervised")?;
        self.record(
            AuditEvent::new(
                AuditStage::Override,
                OPERATOR,
                "schedule_override",
                AuditDecision::Record,
            )
            .with_metadata(json!({ "force_supervised": force })),
        )?;
        let previous = self.gateway.scheduler().set_force_supervised(force);
        info!(force, previous, "supervised override set");
        Ok(previous)
    }

    /// Replace the autonomy schedule.
    pub fn set_schedule(
        &self,
        token: &str,
        config: ScheduleConfig,
    ) -> Result<ScheduleStatus, GatewayError> {
        self.authorize(token, "set_schedule")?;
        let schedule = config.compile()?;
        self.record(
            AuditEvent::new(
                AuditStage::Config,
                OPERATOR,
                "schedule_replaced",
                AuditDecision::Record,
            )
            .with_metadata(serde_json::to_value(&config)?),
        )?;
        self.gateway.scheduler().replace(schedule);
        Ok(self.gateway.scheduler().status(self.gateway.now()))
    }

    /// Load and swap the policy bundle. `yaml` is the new bundle text; with
    /// `None` the configured policy file is re-read. Returns the audit
    /// sequence of the reload.
    pub fn reload_policy(&self, token: &str, yaml: Option<&str>) -> Result<u64, GatewayError> {
        self.authorize(token, "reload_policy")?;
        let bundle = match (yaml, &self.policy_path) {
            (Some(text), _) => PolicyBundle::from_yaml(text),
            (None, Some(path)) => PolicyBundle::load(path),
            (None, None) => Err(GatewayError::Config(
                "no bundle given and no policy file configured".into(),
            )),
        };
        let bundle = match bundle {
            Ok(b) => b,
            Err(e) => {
                self.record(
                    AuditEvent::new(
                        AuditStage::Config,
                        OPERATOR,
                        "policy_reload_rejected",
                        AuditDecision::Deny,
                    )
                    .with_reason(e.to_string()),
                )?;
                return Err(e);
            }
        };
        self.gateway.reload_bundle(bundle, OPERATOR)
    }

    /// Apply a dual-control registry change. Verification, the
    /// `registry_change` event and the change itself happen under the
    /// registry write lock.
    pub fn apply_registry_change(
        &self,
        token: &str,
        change: RegistryChange,
        approvals: &[Approval],
    ) -> Result<u64, GatewayError> {
        self.authorize(token, "registry_change")?;
        let mut registry = self
            .gateway
            .registry()
            .write()
            .map_err(|_| GatewayError::Poisoned { what: "tool registry" })?;

        let tool = change.tool_name().to_string();
        let verified = match registry.verify(change, approvals) {
            Ok(v) => v,
            Err(e) => {
                self.record(
                    AuditEvent::new(
                        AuditStage::Registry,
                        OPERATOR,
                        "registry_change_rejected",
                        AuditDecision::Deny,
                    )
                    .with_reason(e.to_string())
                    .with_metadata(json!({
                        "tool": tool,
                        "approvers": approvals.iter().map(|a| &a.approver_id).collect::<Vec<_>>(),
                    })),
                )?;
                return Err(e.into());
            }
        };

        let seq = self.record(
            AuditEvent::new(
                AuditStage::Registry,
                OPERATOR,
                "registry_change",
                AuditDecision::Record,
            )
            .with_metadata(json!({
                "change": verified.change(),
                "digest": verified.digest(),
                "approvers": verified.approvers(),
            })),
        )?;
        registry.apply(verified)?;
        Ok(seq)
    }

    /// Revoke an agent identity and every lease it holds.
    pub fn revoke_identity(&self, token: &str, agent_id: &str) -> Result<usize, GatewayError> {
        self.authorize(token, "revoke_identity")?;
        if self.gateway.vault().identity(agent_id)?.is_none() {
            return Err(VaultError::UnknownIdentity {
                agent_id: agent_id.to_string(),
            }
            .into());
        }
        self.record(AuditEvent::new(
            AuditStage::Override,
            agent_id,
            "identity_revoked",
            AuditDecision::Revoke,
        ))?;
        Ok(self.gateway.vault().revoke_identity(agent_id)?)
    }

    fn record(&self, event: AuditEvent) -> Result<u64, GatewayError> {
        Ok(self.gateway.record(event)?)
    }
}
