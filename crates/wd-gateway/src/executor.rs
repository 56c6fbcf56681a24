// executor.rs — Execution backends.
//
// An executor receives a task the gateway has already authorized (policy
// allowed it, the vault leased it, the lease was checked) and returns a
// JSON result. The gateway treats the result as untrusted: it goes through
// output inspection before anyone sees it.
//
// Backends are picked by the capability's resource. Each route carries its
// own timeout; the router enforces it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use wd_policy::Capability;

use crate::config::{BackendConfig, ExecutorConfig};

/// What an executor receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorizedTask {
    pub request_id: Uuid,
    pub agent_id: String,
    pub capability: Capability,
    pub payload: serde_json::Value,
    /// Signed lease token; backends may verify it with the gateway.
    pub lease_token: String,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("executor I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("executor exited with status {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("executor returned invalid JSON: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("HTTP executor failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP executor returned {status}")]
    HttpStatus { status: u16 },

    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name for logs and audit metadata.
    fn name(&self) -> &str;

    async fn execute(&self, task: AuthorizedTask) -> Result<serde_json::Value, ExecutorError>;
}

/// Runs a local program per task: task JSON on stdin, result JSON on stdout.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, task: AuthorizedTask) -> Result<serde_json::Value, ExecutorError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("WARDEN_LEASE_TOKEN", &task.lease_token)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let input = serde_json::to_vec(&task)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            // Dropping stdin closes the pipe so the program sees EOF.
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecutorError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// POSTs the task to an HTTP endpoint with the lease token as bearer.
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
}

impl HttpExecutor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        &self.url
    }

    async fn execute(&self, task: AuthorizedTask) -> Result<serde_json::Value, ExecutorError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&task.lease_token)
            .json(&task)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(response.json::<serde_json::Value>().await?)
    }
}

/// One backend plus the timeout that bounds it.
#[derive(Clone)]
pub struct Route {
    pub executor: Arc<dyn Executor>,
    pub timeout: Duration,
}

/// Executors keyed by capability resource.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    routes: HashMap<String, Route>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        let mut set = Self::new();
        for route in &config.routes {
            let executor: Arc<dyn Executor> = match &route.backend {
                BackendConfig::Command { program, args } => {
                    Arc::new(CommandExecutor::new(program.clone(), args.clone()))
                }
                BackendConfig::Http { url } => Arc::new(HttpExecutor::new(url.clone())),
            };
            let timeout = route
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.default_timeout());
            set.insert(route.resource.clone(), executor, timeout);
        }
        set
    }

    pub fn insert(
        &mut self,
        resource: impl Into<String>,
        executor: Arc<dyn Executor>,
        timeout: Duration,
    ) {
        self.routes.insert(resource.into(), Route { executor, timeout });
    }

    pub fn with(
        mut self,
        resource: impl Into<String>,
        executor: Arc<dyn Executor>,
        timeout: Duration,
    ) -> Self {
        self.insert(resource, executor, timeout);
        self
    }

    pub fn route(&self, resource: &str) -> Option<&Route> {
        self.routes.get(resource)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
