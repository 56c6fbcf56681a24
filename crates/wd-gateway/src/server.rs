// server.rs — MCP surface of the Warden gateway.
//
// WardenServer implements the rmcp ServerHandler trait. Agents call
// `wd_submit`; everything else is read-only status or an operator command
// that carries the admin token.
//
// Tools (prefixed `wd_` for namespacing):
//   wd_submit              — run a task through the gateway
//   wd_audit_page          — page through the audit log
//   wd_audit_verify        — verify the audit hash chain
//   wd_schedule_status     — current autonomy window
//   wd_budget_status       — budget snapshot for this period
//   wd_kill_switch         — halt everything, revoke all leases (admin)
//   wd_throttle            — set or clear an agent's rate limit (admin)
//   wd_resolve_escalation  — allow or deny a parked request (admin)
//   wd_list_escalations    — list parked requests (admin)
//   wd_budget_override     — raise this month's cap (admin)
//   wd_reload_policy       — swap the policy bundle (admin)
//   wd_schedule_override   — force supervised / replace schedule (admin)
//   wd_registry_change     — dual-control tool registry change (admin)

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wd_policy::{Approval, AutonomyRequirement, Capability, Priority, RegistryChange};

use crate::error::GatewayError;
use crate::escalation::Resolution;
use crate::override_ctl::OverrideController;
use crate::request::TaskRequest;
use crate::router::Gateway;
use crate::scheduler::ScheduleConfig;

/// Largest page `wd_audit_page` returns.
const MAX_PAGE: usize = 500;

// ── Tool parameter types ─────────────────────────────────────────

/// Parameters for `wd_submit`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubmitParams {
    /// Submitting agent's identity.
    pub agent_id: String,
    /// Capability resource, e.g. "repository".
    pub resource: String,
    /// Capability action, e.g. "write-pr".
    pub action: String,
    /// Capability scope, e.g. "src/**". Empty when the action has none.
    #[serde(default)]
    pub scope: String,
    /// Task payload handed to the executor after inspection.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// One of critical, high, medium (default), low.
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub declared_cost_cents: u64,
    /// Ask for a human in the loop even in the autonomous window.
    #[serde(default)]
    pub must_be_supervised: bool,
    #[serde(default)]
    pub irreversible: bool,
    /// Caller-chosen request id (UUID). Generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AuditPageParams {
    #[serde(default)]
    pub offset: Option<usize>,
    /// Defaults to 50, at most 500.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AdminParams {
    pub admin_token: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct KillSwitchParams {
    pub admin_token: String,
    pub reason: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ThrottleParams {
    pub admin_token: String,
    pub agent_id: String,
    /// Requests per minute. Omit to clear the agent's limit.
    #[serde(default)]
    pub per_minute: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResolveEscalationParams {
    pub admin_token: String,
    pub escalation_id: String,
    pub resolution: Resolution,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BudgetOverrideParams {
    pub admin_token: String,
    pub additional_cents: u64,
    /// Who authorized the raise and why. Recorded in the audit log.
    pub authorization: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReloadPolicyParams {
    pub admin_token: String,
    /// New bundle as YAML. Omit to re-read the configured policy file.
    #[serde(default)]
    pub bundle_yaml: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScheduleOverrideParams {
    pub admin_token: String,
    /// Force the supervised window on or off.
    #[serde(default)]
    pub force_supervised: Option<bool>,
    /// Replace the schedule: HH:MM start of the autonomous window.
    #[serde(default)]
    pub autonomous_start: Option<String>,
    #[serde(default)]
    pub autonomous_end: Option<String>,
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ApprovalParam {
    pub approver_id: String,
    /// Base64 HMAC-SHA256 of the change digest.
    pub signature: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RegistryChangeParams {
    pub admin_token: String,
    /// `{"op": "register" | "update", "entry": {...}}` or
    /// `{"op": "revoke", "name": "..."}`.
    pub change: serde_json::Value,
    pub approvals: Vec<ApprovalParam>,
}

// ── MCP Server ───────────────────────────────────────────────────

pub struct WardenServer {
    overrides: Arc<OverrideController>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl WardenServer {
    pub fn new(overrides: Arc<OverrideController>) -> Self {
        Self {
            overrides,
            tool_router: Self::tool_router(),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        self.overrides.gateway()
    }

    // ── Agent tools ──────────────────────────────────────────

    #[tool(
        description = "Submit a task. The gateway inspects it, checks the registry, budget and policy, leases a credential, runs the executor and inspects the output. Returns allow (with result and lease token), deny (with reason_code), or escalate (with escalation_id)."
    )]
    async fn wd_submit(
        &self,
        Parameters(params): Parameters<SubmitParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = submit_request(params)?;
        let response = self.gateway().submit(request).await;
        json_result(&response)
    }

    // ── Read-only tools ──────────────────────────────────────

    #[tool(description = "Read a page of the audit log with the chain verification result.")]
    fn wd_audit_page(
        &self,
        Parameters(params): Parameters<AuditPageParams>,
    ) -> Result<CallToolResult, McpError> {
        let limit = params.limit.unwrap_or(50).min(MAX_PAGE);
        let page = self
            .gateway()
            .audit()
            .page(params.offset.unwrap_or(0), limit)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        json_result(&page)
    }

    #[tool(description = "Recompute the audit hash chain end to end.")]
    fn wd_audit_verify(&self) -> Result<CallToolResult, McpError> {
        let audit = self.gateway().audit();
        let response = match audit.verify() {
            Ok(valid) => serde_json::json!({
                "chain_valid": valid,
                "events": audit.len(),
            }),
            Err(e) => serde_json::json!({
                "chain_valid": false,
                "events": audit.len(),
                "error": e.to_string(),
            }),
        };
        json_result(&response)
    }

    #[tool(description = "Current autonomy window, manual override flag and schedule.")]
    fn wd_schedule_status(&self) -> Result<CallToolResult, McpError> {
        let gateway = self.gateway();
        json_result(&gateway.scheduler().status(gateway.now()))
    }

    #[tool(description = "Budget snapshot for the current month, in cents.")]
    fn wd_budget_status(&self) -> Result<CallToolResult, McpError> {
        let snapshot = self.gateway().budget_status().map_err(to_mcp)?;
        json_result(&snapshot)
    }

    // ── Admin tools ──────────────────────────────────────────

    #[tool(
        description = "Halt the gateway: refuse all new tasks, seal the vault and revoke every lease. Irreversible until restart."
    )]
    fn wd_kill_switch(
        &self,
        Parameters(params): Parameters<KillSwitchParams>,
    ) -> Result<CallToolResult, McpError> {
        let report = self
            .overrides
            .kill_switch(&params.admin_token, &params.reason)
            .map_err(to_mcp)?;
        json_result(&report)
    }

    #[tool(description = "Set an agent's per-minute request limit, or clear it when per_minute is omitted.")]
    fn wd_throttle(
        &self,
        Parameters(params): Parameters<ThrottleParams>,
    ) -> Result<CallToolResult, McpError> {
        let response = match params.per_minute {
            Some(per_minute) => {
                let seq = self
                    .overrides
                    .throttle(&params.admin_token, &params.agent_id, per_minute)
                    .map_err(to_mcp)?;
                serde_json::json!({
                    "agent_id": params.agent_id,
                    "per_minute": per_minute,
                    "audit_sequence": seq,
                })
            }
            None => {
                let existed = self
                    .overrides
                    .clear_throttle(&params.admin_token, &params.agent_id)
                    .map_err(to_mcp)?;
                serde_json::json!({ "agent_id": params.agent_id, "cleared": existed })
            }
        };
        json_result(&response)
    }

    #[tool(
        description = "Allow or deny a parked escalation. Allow runs the rest of the pipeline and returns the task response."
    )]
    async fn wd_resolve_escalation(
        &self,
        Parameters(params): Parameters<ResolveEscalationParams>,
    ) -> Result<CallToolResult, McpError> {
        let escalation_id = parse_uuid(&params.escalation_id)?;
        let response = self
            .overrides
            .resolve_escalation(
                &params.admin_token,
                escalation_id,
                params.resolution,
                &params.note,
            )
            .await
            .map_err(to_mcp)?;
        json_result(&response)
    }

    #[tool(description = "List escalations waiting for an operator, oldest first.")]
    fn wd_list_escalations(
        &self,
        Parameters(params): Parameters<AdminParams>,
    ) -> Result<CallToolResult, McpError> {
        let pending = self
            .overrides
            .list_escalations(&params.admin_token)
            .map_err(to_mcp)?;
        json_result(&pending)
    }

    #[tool(description = "Raise this month's budget cap. The authorization text is audited.")]
    fn wd_budget_override(
        &self,
        Parameters(params): Parameters<BudgetOverrideParams>,
    ) -> Result<CallToolResult, McpError> {
        let snapshot = self
            .overrides
            .override_budget(
                &params.admin_token,
                params.additional_cents,
                &params.authorization,
            )
            .map_err(to_mcp)?;
        json_result(&snapshot)
    }

    #[tool(
        description = "Swap the policy bundle atomically. Requests already running finish under the old bundle."
    )]
    fn wd_reload_policy(
        &self,
        Parameters(params): Parameters<ReloadPolicyParams>,
    ) -> Result<CallToolResult, McpError> {
        let seq = self
            .overrides
            .reload_policy(&params.admin_token, params.bundle_yaml.as_deref())
            .map_err(to_mcp)?;
        let bundle = self.gateway().current_bundle().map_err(to_mcp)?;
        json_result(&serde_json::json!({
            "version": bundle.version(),
            "digest": bundle.digest(),
            "audit_sequence": seq,
        }))
    }

    #[tool(
        description = "Force the supervised window on or off, and/or replace the autonomous window schedule."
    )]
    fn wd_schedule_override(
        &self,
        Parameters(params): Parameters<ScheduleOverrideParams>,
    ) -> Result<CallToolResult, McpError> {
        let replaces_schedule = params.autonomous_start.is_some()
            || params.autonomous_end.is_some()
            || params.utc_offset_minutes.is_some();
        if params.force_supervised.is_none() && !replaces_schedule {
            return Err(McpError::invalid_params(
                "nothing to change: set force_supervised or a schedule field",
                None,
            ));
        }
        if let Some(force) = params.force_supervised {
            self.overrides
                .force_supervised(&params.admin_token, force)
                .map_err(to_mcp)?;
        }
        if replaces_schedule {
            let current = self.gateway().scheduler().schedule().to_config();
            let config = ScheduleConfig {
                autonomous_start: params
                    .autonomous_start
                    .unwrap_or(current.autonomous_start),
                autonomous_end: params.autonomous_end.unwrap_or(current.autonomous_end),
                utc_offset_minutes: params
                    .utc_offset_minutes
                    .unwrap_or(current.utc_offset_minutes),
            };
            self.overrides
                .set_schedule(&params.admin_token, config)
                .map_err(to_mcp)?;
        }
        let gateway = self.gateway();
        json_result(&gateway.scheduler().status(gateway.now()))
    }

    #[tool(
        description = "Register, update or revoke a registry tool. Needs signatures from two distinct approvers over the change digest."
    )]
    fn wd_registry_change(
        &self,
        Parameters(params): Parameters<RegistryChangeParams>,
    ) -> Result<CallToolResult, McpError> {
        let change: RegistryChange = serde_json::from_value(params.change)
            .map_err(|e| McpError::invalid_params(format!("invalid change: {}", e), None))?;
        let approvals: Vec<Approval> = params
            .approvals
            .into_iter()
            .map(|a| Approval {
                approver_id: a.approver_id,
                signature: a.signature,
            })
            .collect();
        let tool = change.tool_name().to_string();
        let seq = self
            .overrides
            .apply_registry_change(&params.admin_token, change, &approvals)
            .map_err(to_mcp)?;
        json_result(&serde_json::json!({ "tool": tool, "audit_sequence": seq }))
    }
}

// ── ServerHandler implementation ─────────────────────────────────

#[tool_handler]
impl ServerHandler for WardenServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "warden".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some("Warden task-mediation gateway".into()),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Warden mediates every agent action. Submit tasks with wd_submit; \
                 nothing runs without a policy decision, a short-lived credential \
                 lease and an audit record. Operator tools need the admin token."
                    .into(),
            ),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn json_result(value: &impl Serialize) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::json(value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?]))
}

/// Parse a UUID string, returning an MCP error on failure.
fn parse_uuid(s: &str) -> Result<Uuid, McpError> {
    Uuid::parse_str(s)
        .map_err(|e| McpError::invalid_params(format!("invalid UUID '{}': {}", s, e), None))
}

fn parse_priority(s: &str) -> Result<Priority, McpError> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| McpError::invalid_params(format!("unknown priority '{}'", s), None))
}

fn submit_request(params: SubmitParams) -> Result<TaskRequest, McpError> {
    let mut request = TaskRequest::new(
        params.agent_id,
        Capability::new(params.resource, params.action, params.scope),
    )
    .with_payload(params.payload)
    .with_cost(params.declared_cost_cents);
    if let Some(id) = params.request_id.as_deref() {
        request.request_id = parse_uuid(id)?;
    }
    if let Some(p) = params.priority.as_deref() {
        request.priority = parse_priority(p)?;
    }
    if params.must_be_supervised {
        request.autonomy = AutonomyRequirement::MustBeSupervised;
    }
    request.irreversible = params.irreversible;
    Ok(request)
}

fn to_mcp(e: GatewayError) -> McpError {
    match e {
        GatewayError::Unauthorized | GatewayError::Halted => {
            McpError::invalid_request(e.to_string(), None)
        }
        GatewayError::UnknownEscalation(_)
        | GatewayError::Config(_)
        | GatewayError::BundleParse(_)
        | GatewayError::Policy(_)
        | GatewayError::Inspect(_)
        | GatewayError::Registry(_) => McpError::invalid_params(e.to_string(), None),
        _ => McpError::internal_error(e.to_string(), None),
    }
}
