// alerts.rs — Operator alerts for security-relevant denials.
//
// The router raises an alert when a request is denied for a security
// reason (injection, secret leak, exfiltration, bad admin credential).
// Sinks decide what to do with it. Delivery beyond a log line and a JSONL
// file is left to whatever tails those.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, ReasonCode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub reason_code: ReasonCode,
    /// The agent involved, or "operator" for admin-credential failures.
    pub subject: String,
    pub request_id: Option<Uuid>,
    pub detail: String,
}

impl Alert {
    pub fn new(
        reason_code: ReasonCode,
        subject: impl Into<String>,
        request_id: Option<Uuid>,
        detail: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            reason_code,
            subject: subject.into(),
            request_id,
            detail: detail.into(),
        }
    }
}

pub trait AlertSink: Send + Sync {
    /// Handle an alert. Errors are logged but don't stop the gateway.
    fn send(&self, alert: &Alert) -> Result<(), GatewayError>;
}

/// Emits each alert as a `warn!` event.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn send(&self, alert: &Alert) -> Result<(), GatewayError> {
        tracing::warn!(
            reason_code = %alert.reason_code,
            subject = %alert.subject,
            request_id = ?alert.request_id,
            "security alert: {}",
            alert.detail
        );
        Ok(())
    }
}

/// Appends alerts as JSONL to a file.
pub struct JsonlAlertSink {
    path: PathBuf,
}

impl JsonlAlertSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl AlertSink for JsonlAlertSink {
    fn send(&self, alert: &Alert) -> Result<(), GatewayError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| GatewayError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| GatewayError::Io {
                path: self.path.clone(),
                source,
            })?;

        let json = serde_json::to_string(alert)?;
        writeln!(file, "{}", json).map_err(|source| GatewayError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Fans an alert out to every sink.
pub struct AlertDispatcher {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl AlertDispatcher {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    pub fn dispatch(&self, alert: &Alert) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(alert) {
                tracing::warn!("alert sink error: {}", e);
            }
        }
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
