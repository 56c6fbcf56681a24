// rules.rs — Inspection rules as data.
//
// InspectionRules is what policy authors edit: pattern lists, schemas, and
// the outbound allow-list. It deserializes from the `inspection:` section of
// a policy bundle. Every list has a built-in default so an empty section
// still inspects for well-known injection phrasings and secret formats.

use std::collections::BTreeMap;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::InspectError;

/// JSON type a schema field must have.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JsonType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl JsonType {
    pub fn admits(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            JsonType::String => matches!(value, Value::String(_)),
            JsonType::Number => matches!(value, Value::Number(_)),
            JsonType::Bool => matches!(value, Value::Bool(_)),
            JsonType::Object => matches!(value, Value::Object(_)),
            JsonType::Array => matches!(value, Value::Array(_)),
            JsonType::Any => !value.is_null(),
        }
    }
}

/// Required top-level fields for payloads of matching capabilities.
///
/// `resource` and `action` are globs over the capability's fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaRule {
    pub resource: String,
    pub action: String,
    pub required: BTreeMap<String, JsonType>,
}

impl SchemaRule {
    pub(crate) fn validate(&self) -> Result<(), InspectError> {
        for pattern in [&self.resource, &self.action] {
            Pattern::new(pattern).map_err(|e| InspectError::InvalidGlob {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Whether this rule applies to a capability. Invalid globs never match.
    pub fn applies_to(&self, resource: &str, action: &str) -> bool {
        let matches = |pattern: &str, value: &str| {
            Pattern::new(pattern)
                .map(|p| p.matches(value))
                .unwrap_or(false)
        };
        matches(&self.resource, resource) && matches(&self.action, action)
    }
}

/// The data that configures both inspection pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InspectionRules {
    /// Upper bound on the serialized payload size.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Regexes for known prompt-injection techniques. Any hit denies.
    #[serde(default = "default_injection_patterns")]
    pub injection_patterns: Vec<String>,

    /// Regexes that raise the risk score without denying.
    #[serde(default = "default_suspicious_patterns")]
    pub suspicious_patterns: Vec<String>,

    /// Risk added per suspicious hit (score is capped at 100).
    #[serde(default = "default_risk_per_hit")]
    pub risk_per_hit: u32,

    /// Regexes for credentials/secrets that must never leave in output.
    #[serde(default = "default_secret_patterns")]
    pub secret_patterns: Vec<String>,

    /// Domains executor output may reference. Subdomains are included.
    /// Empty means no outbound reference is allowed.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default)]
    pub input_schemas: Vec<SchemaRule>,

    #[serde(default)]
    pub output_schemas: Vec<SchemaRule>,
}

impl Default for InspectionRules {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            injection_patterns: default_injection_patterns(),
            suspicious_patterns: default_suspicious_patterns(),
            risk_per_hit: default_risk_per_hit(),
            secret_patterns: default_secret_patterns(),
            allowed_domains: Vec::new(),
            input_schemas: Vec::new(),
            output_schemas: Vec::new(),
        }
    }
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_risk_per_hit() -> u32 {
    25
}

fn default_injection_patterns() -> Vec<String> {
    [
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions|prompts|rules)",
        r"(?i)disregard\s+(the\s+|your\s+)?(system|previous|prior)\s+(prompt|instructions)",
        r"(?i)you\s+are\s+now\s+(in\s+)?(developer|dan|jailbreak)\s+mode",
        r"(?i)<\s*/?\s*system\s*>",
        r"(?i)reveal\s+(your|the)\s+(system\s+prompt|hidden\s+instructions)",
        r"(?i)begin\s+(admin|system)\s+override",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_suspicious_patterns() -> Vec<String> {
    [
        r"(?i)curl\s+[^|]*\|\s*(sh|bash)",
        r"(?i)rm\s+-rf\s+/",
        r"(?i)base64\s+(-d|--decode)",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_secret_patterns() -> Vec<String> {
    [
        r"AKIA[0-9A-Z]{16}",
        r"-----BEGIN (RSA |EC |OPENSSH |DSA )?PRIVATE KEY-----",
        r"ghp_[A-Za-z0-9]{36}",
        r"xox[baprs]-[A-Za-z0-9-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r#"(?i)(password|secret|api[_-]?key)\s*[:=]\s*['"][^'"]{8,}['"]"#,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let rules: InspectionRules = serde_yaml::from_str("{}").unwrap();
        assert_eq!(rules, InspectionRules::default());
        assert!(!rules.injection_patterns.is_empty());
        assert!(rules.allowed_domains.is_empty());
    }

    #[test]
    fn schema_rule_from_yaml() {
        let yaml = r#"
resource: repository
action: "write-*"
required:
  title: string
  diff: string
"#;
        let rule: SchemaRule = serde_yaml::from_str(yaml).unwrap();
        assert!(rule.applies_to("repository", "write-pr"));
        assert!(!rule.applies_to("repository", "delete"));
        assert_eq!(rule.required.get("diff"), Some(&JsonType::String));
    }

    #[test]
    fn json_type_admits() {
        assert!(JsonType::Number.admits(&serde_json::json!(3)));
        assert!(!JsonType::Number.admits(&serde_json::json!("3")));
        assert!(!JsonType::Any.admits(&serde_json::Value::Null));
    }
}
