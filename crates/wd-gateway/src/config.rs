// config.rs — Gateway configuration (warden.toml).
//
// GatewayConfig determines where the gateway keeps its state (audit log,
// alert log, policy bundle), the monthly budget, lease and executor
// settings, the autonomy schedule, the operator credential, registry
// approvers, agent identities and the bootstrap tool registry.
// Relative paths are resolved against the config file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wd_credentials::LeasePolicy;
use wd_policy::{Capability, CapabilityPattern, ToolRegistryEntry};

use crate::error::GatewayError;
use crate::scheduler::ScheduleConfig;

/// Default executor timeout when neither the route nor the section sets one.
pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub leases: LeaseConfig,

    #[serde(default)]
    pub executors: ExecutorConfig,

    #[serde(default)]
    pub scheduler: ScheduleConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    /// Keys allowed to sign registry changes.
    #[serde(default)]
    pub approvers: Vec<ApproverConfig>,

    #[serde(default)]
    pub identities: Vec<IdentityConfig>,

    /// The operator-authored baseline registry.
    #[serde(default)]
    pub tools: Vec<ToolRegistryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Append-only audit log (JSONL).
    pub audit_log: PathBuf,
    /// Operator alert log (JSONL).
    pub alerts_log: PathBuf,
    /// Policy bundle (YAML). Watched for changes by the daemon.
    pub policy: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let dir = PathBuf::from(".warden");
        Self {
            audit_log: dir.join("audit.jsonl"),
            alerts_log: dir.join("alerts.jsonl"),
            policy: PathBuf::from("policy.yaml"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Monthly spend cap in cents. Zero allows only zero-cost tasks.
    #[serde(default)]
    pub monthly_cap_cents: u64,
}

/// A lease policy for every capability a pattern covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseOverride {
    pub capability: CapabilityPattern,
    #[serde(flatten)]
    pub policy: LeasePolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default)]
    pub default: LeasePolicy,
    /// First matching override wins.
    #[serde(default)]
    pub overrides: Vec<LeaseOverride>,
}

impl LeaseConfig {
    pub fn policy_for(&self, capability: &Capability) -> LeasePolicy {
        self.overrides
            .iter()
            .find(|o| o.capability.matches(capability))
            .map(|o| o.policy)
            .unwrap_or(self.default)
    }
}

/// How an executor backend is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// A local program: the task is written to stdin as JSON, the result is
    /// read from stdout as JSON.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// An HTTP endpoint that accepts the task as a JSON POST.
    Http { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRoute {
    /// Capability resource this backend serves.
    pub resource: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_EXECUTOR_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub routes: Vec<ExecutorRoute>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_EXECUTOR_TIMEOUT_SECS,
            routes: Vec::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Hex SHA-256 of the operator token. Unset disables every admin command.
    #[serde(default)]
    pub token_sha256: Option<String>,

    /// Throttle an agent to this many requests per minute after an
    /// injection attempt. Unset disables auto-throttling.
    #[serde(default)]
    pub auto_throttle_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproverConfig {
    pub id: String,
    /// Base64 HMAC key.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub agent_id: String,
    #[serde(default)]
    pub grants: Vec<CapabilityPattern>,
}

impl GatewayConfig {
    /// Parse a config document. Paths are left as written.
    pub fn from_toml_str(text: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` and resolve relative paths against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GatewayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Make relative paths absolute under `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for p in [
            &mut self.paths.audit_log,
            &mut self.paths.alerts_log,
            &mut self.paths.policy,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    /// Defaults under `root/.warden/`, with no identities and no tools.
    pub fn for_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let dir = root.join(".warden");
        Self {
            paths: PathsConfig {
                audit_log: dir.join("audit.jsonl"),
                alerts_log: dir.join("alerts.jsonl"),
                policy: root.join("policy.yaml"),
            },
            budget: BudgetConfig::default(),
            leases: LeaseConfig::default(),
            executors: ExecutorConfig::default(),
            scheduler: ScheduleConfig::default(),
            admin: AdminConfig::default(),
            approvers: Vec::new(),
            identities: Vec::new(),
            tools: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), GatewayError> {
        self.scheduler.compile()?;
        if self.executors.timeout_secs == 0
            || self.executors.routes.iter().any(|r| r.timeout_secs == Some(0))
        {
            return Err(GatewayError::Config(
                "executor timeouts must be at least one second".into(),
            ));
        }
        for o in &self.leases.overrides {
            o.capability.validate()?;
        }
        for identity in &self.identities {
            for grant in &identity.grants {
                grant.validate()?;
            }
        }
        if let Some(hash) = &self.admin.token_sha256 {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(GatewayError::Config(
                    "admin.token_sha256 must be 64 hex characters".into(),
                ));
            }
        }
        Ok(())
    }
}
