// Shared harness for the gateway integration tests.
//
// Builds a gateway from an in-memory audit log, a manual clock pinned to
// 2026-10-19 12:00 UTC (inside the supervised window; the autonomous window
// is 22:00-06:00), scripted executors and a capturing alert sink.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use wd_audit::{hasher::hash_str, AuditLog, AuditSink};
use wd_gateway::{
    Alert, AlertDispatcher, AlertSink, AuthorizedTask, Executor, ExecutorError, ExecutorSet,
    Gateway, GatewayConfig, GatewayError, GatewayParts, ManualClock, OverrideController,
    PolicyBundle,
};

pub const ADMIN_TOKEN: &str = "correct horse battery staple";
pub const ALICE_KEY: &[u8] = b"alice-approver-key";
pub const BOB_KEY: &[u8] = b"bob-approver-key";

pub const BUNDLE_V1: &str = r#"
version: "2026.10-1"
rules:
  - id: search-allow
    capability: { resource: search, action: "*" }
    decision: allow
  - id: repo-allow
    capability: { resource: repository, action: "*" }
    decision: allow
  - id: delete-allow
    capability: { resource: files, action: delete }
    decision: allow
  - id: delete-escalate-supervised
    capability: { resource: files, action: delete }
    when: { window: supervised }
    decision: escalate
inspection:
  allowed_domains: ["example.com"]
"#;

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
}

pub fn late_evening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 23, 0, 0).unwrap()
}

pub fn config_toml(monthly_cap_cents: u64) -> String {
    format!(
        r#"
[budget]
monthly_cap_cents = {cap}

[scheduler]
autonomous_start = "22:00"
autonomous_end = "06:00"

[admin]
token_sha256 = "{token}"

[leases.default]
ttl_secs = 300

[[leases.overrides]]
capability = {{ resource = "search", action = "*" }}
ttl_secs = 600
usage = "reusable"
reissue = "deny"

[[approvers]]
id = "alice"
key = "{alice}"

[[approvers]]
id = "bob"
key = "{bob}"

[[identities]]
agent_id = "agent-1"
grants = [
  {{ resource = "search", action = "*" }},
  {{ resource = "repository", action = "*" }},
  {{ resource = "files", action = "delete" }},
  {{ resource = "deploy", action = "*" }},
]

[[identities]]
agent_id = "agent-2"
grants = [{{ resource = "search", action = "*" }}]

[[tools]]
name = "web-search"
version = "1.4.0"
vetted = true
last_audit = "2026-09-01"
capabilities = [{{ resource = "search", action = "*" }}]

[[tools]]
name = "git-bot"
version = "2.0.1"
vetted = true
last_audit = "2026-08-15"
capabilities = [{{ resource = "repository", action = "*" }}]

[[tools]]
name = "janitor"
version = "0.9.0"
vetted = true
last_audit = "2026-07-30"
capabilities = [{{ resource = "files", action = "delete" }}]
"#,
        cap = monthly_cap_cents,
        token = hash_str(ADMIN_TOKEN),
        alice = STANDARD.encode(ALICE_KEY),
        bob = STANDARD.encode(BOB_KEY),
    )
}

/// Executor that answers with a fixed value (or echoes the payload) after
/// an optional delay.
pub struct ScriptedExecutor {
    pub delay: Duration,
    pub output: Option<Value>,
    pub calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            output: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            output: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn returning(output: Value) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            output: Some(output),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow_returning(delay: Duration, output: Value) -> Arc<Self> {
        Arc::new(Self {
            delay,
            output: Some(output),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, task: AuthorizedTask) -> Result<Value, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .output
            .clone()
            .unwrap_or_else(|| json!({ "echo": task.payload })))
    }
}

/// Collects every alert it is sent.
#[derive(Clone, Default)]
pub struct CapturingAlerts {
    pub seen: Arc<Mutex<Vec<Alert>>>,
}

impl CapturingAlerts {
    pub fn all(&self) -> Vec<Alert> {
        self.seen.lock().unwrap().clone()
    }
}

impl AlertSink for CapturingAlerts {
    fn send(&self, alert: &Alert) -> Result<(), GatewayError> {
        self.seen.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Audit sink whose writes start failing when the switch is flipped.
pub struct SwitchableSink {
    pub failing: Arc<AtomicBool>,
}

impl AuditSink for SwitchableSink {
    fn write_line(&mut self, _line: &str) -> std::io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        } else {
            Ok(())
        }
    }

    fn describe(&self) -> String {
        "switchable".to_string()
    }
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub overrides: OverrideController,
    pub clock: Arc<ManualClock>,
    pub alerts: CapturingAlerts,
}

pub struct HarnessBuilder {
    config: String,
    bundle: String,
    executors: ExecutorSet,
    audit: Option<AuditLog>,
    start: DateTime<Utc>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: config_toml(10_000),
            bundle: BUNDLE_V1.to_string(),
            executors: ExecutorSet::new(),
            audit: None,
            start: noon(),
        }
    }

    pub fn config(mut self, toml: String) -> Self {
        self.config = toml;
        self
    }

    pub fn bundle(mut self, yaml: &str) -> Self {
        self.bundle = yaml.to_string();
        self
    }

    pub fn executor(mut self, resource: &str, executor: Arc<dyn Executor>) -> Self {
        self.executors
            .insert(resource, executor, Duration::from_secs(5));
        self
    }

    pub fn executor_with_timeout(
        mut self,
        resource: &str,
        executor: Arc<dyn Executor>,
        timeout: Duration,
    ) -> Self {
        self.executors.insert(resource, executor, timeout);
        self
    }

    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    pub fn build(self) -> Harness {
        let config = GatewayConfig::from_toml_str(&self.config).unwrap();
        let clock = Arc::new(ManualClock::new(self.start));
        let alerts = CapturingAlerts::default();
        let mut dispatcher = AlertDispatcher::new();
        dispatcher.add_sink(Box::new(alerts.clone()));
        let gateway = Gateway::assemble(
            &config,
            GatewayParts {
                audit: self.audit.unwrap_or_else(AuditLog::in_memory),
                bundle: PolicyBundle::from_yaml(&self.bundle).unwrap(),
                executors: self.executors,
                alerts: dispatcher,
                clock: clock.clone(),
            },
        )
        .unwrap();
        let gateway = Arc::new(gateway);
        let overrides =
            OverrideController::new(Arc::clone(&gateway), config.admin.token_sha256.clone());
        Harness {
            gateway,
            overrides,
            clock,
            alerts,
        }
    }
}

impl Harness {
    pub fn actions(&self) -> Vec<String> {
        let audit = self.gateway.audit();
        audit
            .page(0, audit.len())
            .unwrap()
            .events
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.gateway
            .audit()
            .events_with_action(action)
            .unwrap()
            .len()
    }
}
