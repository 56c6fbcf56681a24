// stages.rs — Individual inspection stages.
//
// Each stage looks at one property of a payload and is testable on its own.
// Text-based stages scan every string in the JSON value, object keys
// included, so a pattern cannot hide in a nested field or in a key name.

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::InspectError;
use crate::rules::SchemaRule;

/// What a stage is inspecting.
pub struct Subject<'a> {
    pub resource: &'a str,
    pub action: &'a str,
    pub payload: &'a serde_json::Value,
}

/// Why a stage denied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenyKind {
    Oversize,
    Injection,
    Schema,
    SecretLeak,
    Exfiltration,
}

impl DenyKind {
    /// Whether a deny of this kind should alert an operator.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            DenyKind::Injection | DenyKind::SecretLeak | DenyKind::Exfiltration
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Pass { risk: u32 },
    Deny { kind: DenyKind, reason: String },
}

/// One step of a pipeline.
pub trait InspectionStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn inspect(&self, subject: &Subject<'_>) -> StageOutcome;
}

/// Visit every string (values and keys) in a JSON tree.
fn for_each_text<'v>(value: &'v serde_json::Value, f: &mut dyn FnMut(&'v str) -> bool) -> bool {
    use serde_json::Value;
    match value {
        Value::String(s) => f(s.as_str()),
        Value::Array(items) => items.iter().any(|v| for_each_text(v, &mut *f)),
        Value::Object(map) => map.iter().any(|(k, v)| f(k.as_str()) || for_each_text(v, &mut *f)),
        _ => false,
    }
}

/// Find the first regex that matches any text in the payload.
fn first_hit<'r>(patterns: &'r [Regex], payload: &serde_json::Value) -> Option<&'r Regex> {
    let mut hit = None;
    for_each_text(payload, &mut |text| {
        hit = patterns.iter().find(|re| re.is_match(text));
        hit.is_some()
    });
    hit
}

pub struct SizeBound {
    pub max_bytes: usize,
}

impl InspectionStage for SizeBound {
    fn name(&self) -> &'static str {
        "size_bound"
    }

    fn inspect(&self, subject: &Subject<'_>) -> StageOutcome {
        // Serialization of a Value cannot fail; treat failure as oversize.
        let size = serde_json::to_vec(subject.payload)
            .map(|v| v.len())
            .unwrap_or(usize::MAX);
        if size > self.max_bytes {
            StageOutcome::Deny {
                kind: DenyKind::Oversize,
                reason: format!("payload is {} bytes, limit {}", size, self.max_bytes),
            }
        } else {
            StageOutcome::Pass { risk: 0 }
        }
    }
}

pub struct InjectionScan {
    pub deny: Vec<Regex>,
    pub suspicious: Vec<Regex>,
    pub risk_per_hit: u32,
}

impl InspectionStage for InjectionScan {
    fn name(&self) -> &'static str {
        "injection_scan"
    }

    fn inspect(&self, subject: &Subject<'_>) -> StageOutcome {
        if let Some(re) = first_hit(&self.deny, subject.payload) {
            return StageOutcome::Deny {
                kind: DenyKind::Injection,
                reason: format!("payload matches injection pattern '{}'", re.as_str()),
            };
        }
        let mut hits = 0u32;
        for re in &self.suspicious {
            for_each_text(subject.payload, &mut |text| {
                if re.is_match(text) {
                    hits += 1;
                    true
                } else {
                    false
                }
            });
        }
        StageOutcome::Pass {
            risk: hits.saturating_mul(self.risk_per_hit).min(100),
        }
    }
}

pub struct SchemaCheck {
    pub label: &'static str,
    pub rules: Vec<SchemaRule>,
}

impl InspectionStage for SchemaCheck {
    fn name(&self) -> &'static str {
        self.label
    }

    fn inspect(&self, subject: &Subject<'_>) -> StageOutcome {
        let applicable: Vec<&SchemaRule> = self
            .rules
            .iter()
            .filter(|r| r.applies_to(subject.resource, subject.action))
            .collect();
        if applicable.is_empty() {
            return StageOutcome::Pass { risk: 0 };
        }
        let object = match subject.payload.as_object() {
            Some(o) => o,
            None => {
                return StageOutcome::Deny {
                    kind: DenyKind::Schema,
                    reason: "payload must be a JSON object".to_string(),
                }
            }
        };
        for rule in applicable {
            for (field, ty) in &rule.required {
                match object.get(field) {
                    Some(value) if ty.admits(value) => {}
                    Some(_) => {
                        return StageOutcome::Deny {
                            kind: DenyKind::Schema,
                            reason: format!("field '{}' must be {:?}", field, ty),
                        }
                    }
                    None => {
                        return StageOutcome::Deny {
                            kind: DenyKind::Schema,
                            reason: format!("missing required field '{}'", field),
                        }
                    }
                }
            }
        }
        StageOutcome::Pass { risk: 0 }
    }
}

pub struct SecretScan {
    pub patterns: Vec<Regex>,
}

impl InspectionStage for SecretScan {
    fn name(&self) -> &'static str {
        "secret_scan"
    }

    fn inspect(&self, subject: &Subject<'_>) -> StageOutcome {
        match first_hit(&self.patterns, subject.payload) {
            // Never echo the secret itself into the reason.
            Some(re) => StageOutcome::Deny {
                kind: DenyKind::SecretLeak,
                reason: format!("output matches secret pattern '{}'", re.as_str()),
            },
            None => StageOutcome::Pass { risk: 0 },
        }
    }
}

/// Every outbound reference in the output must name an allow-listed host.
///
/// A reference is `scheme://...` or a scheme-relative `//...` that starts a
/// token. Hosts are extracted with a real URL parser (IPv6 literals,
/// percent-decoding, IDNA). A reference without a usable host is a deny.
pub struct ExfiltrationCheck {
    pub reference: Regex,
    pub allowed_domains: Vec<String>,
}

impl ExfiltrationCheck {
    pub fn new(allowed_domains: Vec<String>) -> Result<Self, InspectError> {
        // Start of text or a non-URL character, then an optional scheme and "//".
        let pattern = r#"(?i)(?:^|[^a-z0-9+.\-/:])((?:[a-z][a-z0-9+.-]*:)?//[^\s"'<>]+)"#;
        let reference = Regex::new(pattern).map_err(|source| InspectError::InvalidPattern {
            list: "url",
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            reference,
            allowed_domains: allowed_domains
                .into_iter()
                .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        })
    }

    fn domain_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }

    fn address_allowed(&self, address: &str) -> bool {
        self.allowed_domains.iter().any(|d| d == address)
    }

    /// `Err` carries the offending destination for the deny reason.
    fn check(&self, reference: &str) -> Result<(), String> {
        let absolute = if reference.starts_with("//") {
            format!("http:{}", reference)
        } else {
            reference.to_string()
        };
        let parsed = Url::parse(&absolute)
            .map_err(|e| format!("unparseable reference '{}' ({})", reference, e))?;
        let allowed = match parsed.host() {
            // Opaque hosts of unknown schemes are not percent-decoded.
            Some(Host::Domain(domain)) => !domain.contains('%') && self.domain_allowed(domain),
            Some(Host::Ipv4(ip)) => self.address_allowed(&ip.to_string()),
            Some(Host::Ipv6(ip)) => self.address_allowed(&ip.to_string()),
            None => return Err(format!("reference '{}' has no host", reference)),
        };
        match parsed.host_str() {
            Some(host) if !allowed => Err(host.to_string()),
            _ => Ok(()),
        }
    }
}

impl InspectionStage for ExfiltrationCheck {
    fn name(&self) -> &'static str {
        "exfiltration_check"
    }

    fn inspect(&self, subject: &Subject<'_>) -> StageOutcome {
        let mut offending: Option<String> = None;
        for_each_text(subject.payload, &mut |text| {
            for caps in self.reference.captures_iter(text) {
                if let Some(reference) = caps.get(1) {
                    if let Err(destination) = self.check(reference.as_str()) {
                        offending = Some(destination);
                        return true;
                    }
                }
            }
            false
        });
        match offending {
            Some(destination) => StageOutcome::Deny {
                kind: DenyKind::Exfiltration,
                reason: format!(
                    "output references non-allow-listed destination {}",
                    destination
                ),
            },
            None => StageOutcome::Pass { risk: 0 },
        }
    }
}
