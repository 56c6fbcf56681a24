// capability.rs — Capabilities and capability patterns.
//
// A Capability is the concrete (resource, action, scope) triple a request
// asks for and a lease authorizes, e.g. (repository, write-pr, "src/**").
// Grants, rules and registry entries hold CapabilityPatterns instead: the
// same triple with a glob in each field.

use std::fmt;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// What a task asks to do. Leases authorize exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capability {
    /// The kind of thing acted on (e.g., "repository", "deploy", "search").
    pub resource: String,
    /// The verb (e.g., "read", "write-pr", "production").
    pub action: String,
    /// Narrows the target within the resource (e.g., "src/main.rs").
    #[serde(default)]
    pub scope: String,
}

impl Capability {
    pub fn new(
        resource: impl Into<String>,
        action: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope: scope.into(),
        }
    }

    /// Detect path traversal attempts in the scope.
    ///
    /// Checks the raw string rather than normalizing a path so encoded
    /// forms are caught too.
    pub fn has_path_traversal(&self) -> bool {
        let lower = self.scope.to_ascii_lowercase();
        ["..", "%2e%2e", "%2e.", ".%2e"]
            .iter()
            .any(|needle| lower.contains(needle))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.action)?;
        if !self.scope.is_empty() {
            write!(f, " on '{}'", self.scope)?;
        }
        Ok(())
    }
}

fn any() -> String {
    "*".to_string()
}

/// A glob over each field of a [`Capability`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CapabilityPattern {
    pub resource: String,
    pub action: String,
    #[serde(default = "any")]
    pub scope: String,
}

impl CapabilityPattern {
    pub fn new(
        resource: impl Into<String>,
        action: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope: scope.into(),
        }
    }

    /// Check that every field compiles as a glob.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for field in [&self.resource, &self.action, &self.scope] {
            Pattern::new(field).map_err(|e| PolicyError::InvalidPattern {
                pattern: field.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Whether this pattern covers the capability.
    ///
    /// Invalid globs never match (fail-closed, not fail-open).
    pub fn matches(&self, capability: &Capability) -> bool {
        glob_matches(&self.resource, &capability.resource)
            && glob_matches(&self.action, &capability.action)
            && glob_matches(&self.scope, &capability.scope)
    }

    /// Number of literal (non-wildcard) characters across all fields.
    pub fn literal_len(&self) -> u32 {
        literal_len(&self.resource) + literal_len(&self.action) + literal_len(&self.scope)
    }
}

impl fmt::Display for CapabilityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} on '{}'", self.resource, self.action, self.scope)
    }
}

pub(crate) fn glob_matches(pattern: &str, value: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => false,
    }
}

pub(crate) fn literal_len(pattern: &str) -> u32 {
    pattern
        .chars()
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']'))
        .count() as u32
}
