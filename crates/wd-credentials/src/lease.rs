// lease.rs — Lease records and the policies that shape them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wd_policy::Capability;

/// Default lease lifetime.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Longest lease the vault will issue.
pub const MAX_TTL_SECS: u64 = 86_400;

/// How often a lease may be presented.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeaseUsage {
    /// Valid for exactly one `authorize_use`.
    #[default]
    SingleUse,
    /// Valid for any number of uses until expiry.
    Reusable,
}

/// What `issue` does when a live lease already occupies the slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReissuePolicy {
    /// Refuse with `LeaseConflict`; the slot is exclusive.
    #[default]
    Deny,
    /// Restart the existing lease's window at `now`.
    Extend,
    /// Hand back the existing lease if it is reusable.
    Reuse,
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

/// Per-capability lease settings, usually from configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeasePolicy {
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub usage: LeaseUsage,
    #[serde(default)]
    pub reissue: ReissuePolicy,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            usage: LeaseUsage::default(),
            reissue: ReissuePolicy::default(),
        }
    }
}

/// A time-bounded authorization for one capability.
///
/// The valid window is `[renewed_at, renewed_at + ttl)`; extending a lease
/// moves `renewed_at`, so the window never exceeds the TTL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialLease {
    pub lease_id: Uuid,
    pub agent_id: String,
    pub capability: Capability,
    pub issued_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub usage: LeaseUsage,
    pub uses: u32,
    pub revoked: bool,
}

impl CredentialLease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renewed_at + Duration::seconds(self.ttl_secs.min(MAX_TTL_SECS) as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage == LeaseUsage::SingleUse && self.uses >= 1
    }

    /// Not revoked, not expired, and has uses left.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now) && !self.is_exhausted()
    }
}

/// How an `issue` call was satisfied. The router audits each kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueOutcome {
    Fresh,
    Extended,
    Reused,
}

/// A lease plus the token that presents it.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub lease: CredentialLease,
    pub token: String,
    pub outcome: IssueOutcome,
}

/// Result of `revoke_all`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationReport {
    /// Leases revoked by this call.
    pub revoked: usize,
    /// Leases still live afterwards. Zero on success.
    pub remaining: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lease(usage: LeaseUsage) -> CredentialLease {
        let t = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        CredentialLease {
            lease_id: Uuid::new_v4(),
            agent_id: "a".into(),
            capability: Capability::new("repository", "read", ""),
            issued_at: t,
            renewed_at: t,
            ttl_secs: 300,
            usage,
            uses: 0,
            revoked: false,
        }
    }

    #[test]
    fn window_is_half_open() {
        let l = lease(LeaseUsage::Reusable);
        assert!(l.is_live(l.renewed_at + Duration::seconds(299)));
        assert!(!l.is_live(l.renewed_at + Duration::seconds(300)));
    }

    #[test]
    fn single_use_exhausts() {
        let mut l = lease(LeaseUsage::SingleUse);
        assert!(l.is_live(l.issued_at));
        l.uses = 1;
        assert!(!l.is_live(l.issued_at));
    }

    #[test]
    fn policy_defaults_from_empty_object() {
        let policy: LeasePolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, LeasePolicy::default());
        assert_eq!(policy.ttl_secs, 300);
        assert_eq!(policy.reissue, ReissuePolicy::Deny);
    }
}
