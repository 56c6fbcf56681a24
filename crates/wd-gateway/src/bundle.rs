// bundle.rs — Versioned policy bundles.
//
// A bundle is one YAML document carrying the rule set and the inspection
// rules. It is compiled once (globs validated, regexes built) and then
// shared read-only behind an Arc. Reloading builds a new bundle and swaps
// the Arc; requests already running keep the one they started with.

use std::path::Path;

use serde::{Deserialize, Serialize};
use wd_audit::hasher::hash_bytes;
use wd_inspect::{InspectionRules, Inspector};
use wd_policy::{PolicyEngine, PolicyRule, RuleSet};

use crate::error::GatewayError;

/// The on-disk bundle document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDocument {
    pub version: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub inspection: InspectionRules,
}

/// A compiled, immutable bundle.
pub struct PolicyBundle {
    version: String,
    digest: String,
    engine: PolicyEngine,
    inspector: Inspector,
}

impl PolicyBundle {
    pub fn from_yaml(yaml: &str) -> Result<Self, GatewayError> {
        let doc: BundleDocument = serde_yaml::from_str(yaml)?;
        let digest = hash_bytes(yaml.as_bytes());
        Self::compile(doc, digest)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| GatewayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Compile a document. `digest` identifies the source in audit events.
    pub fn compile(doc: BundleDocument, digest: String) -> Result<Self, GatewayError> {
        let rules = RuleSet::new(doc.version.clone(), doc.rules)?;
        let inspector = Inspector::new(&doc.inspection)?;
        Ok(Self {
            version: doc.version,
            digest,
            engine: PolicyEngine::new(rules),
            inspector,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Hex SHA-256 of the YAML source.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn inspector(&self) -> &Inspector {
        &self.inspector
    }
}

impl std::fmt::Debug for PolicyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyBundle")
            .field("version", &self.version)
            .field("digest", &self.digest)
            .field("rules", &self.engine.rules().rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
version: "2026.10.1"
rules:
  - id: search-any
    capability: { resource: search, action: "*" }
    decision: allow
inspection:
  max_payload_bytes: 4096
  allowed_domains: ["example.com"]
"#;

    #[test]
    fn compiles_rules_and_inspection() {
        let bundle = PolicyBundle::from_yaml(YAML).unwrap();
        assert_eq!(bundle.version(), "2026.10.1");
        assert_eq!(bundle.engine().rules().rules.len(), 1);
        assert_eq!(bundle.digest().len(), 64);
    }

    #[test]
    fn digest_tracks_source() {
        let a = PolicyBundle::from_yaml(YAML).unwrap();
        let b = PolicyBundle::from_yaml(&YAML.replace("4096", "8192")).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn bad_regex_fails_compile() {
        let yaml = "version: x\ninspection:\n  injection_patterns: [\"(unclosed\"]\n";
        assert!(matches!(
            PolicyBundle::from_yaml(yaml),
            Err(GatewayError::Inspect(_))
        ));
    }

    #[test]
    fn duplicate_rule_ids_fail_compile() {
        let yaml = r#"
version: x
rules:
  - { id: a, capability: { resource: r, action: a }, decision: allow }
  - { id: a, capability: { resource: r, action: b }, decision: deny }
"#;
        assert!(matches!(
            PolicyBundle::from_yaml(yaml),
            Err(GatewayError::Policy(_))
        ));
    }

    #[test]
    fn missing_version_is_parse_error() {
        assert!(matches!(
            PolicyBundle::from_yaml("rules: []\n"),
            Err(GatewayError::BundleParse(_))
        ));
    }

    #[test]
    fn shipped_sample_bundle_compiles() {
        let bundle = PolicyBundle::from_yaml(include_str!("../../../config/policy.yaml")).unwrap();
        assert_eq!(bundle.version(), "2026.10.1");
        assert_eq!(bundle.engine().rules().rules.len(), 5);
    }
}
