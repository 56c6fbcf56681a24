// vault.rs — The credential vault.
//
// Two tables: identities (rarely written, RwLock) and leases (written on
// every grant, Mutex). The lease table is keyed by lease id with a slot
// index on (agent_id, capability); both are updated under the same lock, so
// "is the slot free? then insert" cannot interleave with another issue.
//
// Expiry is lazy. A lease past its window is dropped the next time anything
// looks at it (issue into the same slot, authorize_use, sweep).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;
use wd_policy::{AgentIdentity, Capability, ToolRegistry};

use crate::error::VaultError;
use crate::lease::{
    CredentialLease, IssueOutcome, LeaseGrant, LeasePolicy, LeaseUsage, ReissuePolicy,
    RevocationReport, MAX_TTL_SECS,
};
use crate::token::{LeaseClaims, TokenSigner};

type Slot = (String, Capability);

#[derive(Default)]
struct LeaseTable {
    leases: HashMap<Uuid, CredentialLease>,
    slots: HashMap<Slot, Uuid>,
}

impl LeaseTable {
    fn remove(&mut self, lease_id: Uuid) -> Option<CredentialLease> {
        let lease = self.leases.remove(&lease_id)?;
        let slot = (lease.agent_id.clone(), lease.capability.clone());
        if self.slots.get(&slot) == Some(&lease_id) {
            self.slots.remove(&slot);
        }
        Some(lease)
    }
}

pub struct CredentialVault {
    identities: RwLock<HashMap<String, AgentIdentity>>,
    leases: Mutex<LeaseTable>,
    registry: Arc<RwLock<ToolRegistry>>,
    signer: TokenSigner,
    sealed: AtomicBool,
}

impl CredentialVault {
    /// A vault with a freshly generated signing key.
    pub fn new(registry: Arc<RwLock<ToolRegistry>>) -> Result<Self, VaultError> {
        Ok(Self::with_signer(registry, TokenSigner::generate()?))
    }

    pub fn with_signer(registry: Arc<RwLock<ToolRegistry>>, signer: TokenSigner) -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            leases: Mutex::new(LeaseTable::default()),
            registry,
            signer,
            sealed: AtomicBool::new(false),
        }
    }

    // ── Identities ──────────────────────────────────────────────

    pub fn register_identity(&self, identity: AgentIdentity) -> Result<(), VaultError> {
        let mut identities = self.identities.write().map_err(|_| VaultError::Poisoned)?;
        if identities.contains_key(&identity.agent_id) {
            return Err(VaultError::IdentityExists {
                agent_id: identity.agent_id,
            });
        }
        tracing::info!(
            agent = %identity.agent_id,
            grants = identity.grants.len(),
            "identity registered"
        );
        identities.insert(identity.agent_id.clone(), identity);
        Ok(())
    }

    /// A copy of the identity, if registered.
    pub fn identity(&self, agent_id: &str) -> Result<Option<AgentIdentity>, VaultError> {
        let identities = self.identities.read().map_err(|_| VaultError::Poisoned)?;
        Ok(identities.get(agent_id).cloned())
    }

    /// Flag the identity revoked and revoke every lease it holds.
    /// Returns the number of leases revoked.
    pub fn revoke_identity(&self, agent_id: &str) -> Result<usize, VaultError> {
        {
            let mut identities = self.identities.write().map_err(|_| VaultError::Poisoned)?;
            let identity = identities
                .get_mut(agent_id)
                .ok_or_else(|| VaultError::UnknownIdentity {
                    agent_id: agent_id.to_string(),
                })?;
            identity.revoked = true;
        }
        let mut table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        let mut revoked = 0;
        for lease in table.leases.values_mut() {
            if lease.agent_id == agent_id && !lease.revoked {
                lease.revoked = true;
                revoked += 1;
            }
        }
        table.slots.retain(|(agent, _), _| agent != agent_id);
        tracing::warn!(agent = agent_id, leases_revoked = revoked, "identity revoked");
        Ok(revoked)
    }

    // ── Leases ──────────────────────────────────────────────────

    /// Issue (or extend, or reuse) a lease for `capability`.
    ///
    /// Call only after the policy engine allowed the request.
    pub fn issue(
        &self,
        agent_id: &str,
        capability: &Capability,
        policy: &LeasePolicy,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant, VaultError> {
        if self.is_sealed() {
            return Err(VaultError::Sealed);
        }
        if policy.ttl_secs == 0 || policy.ttl_secs > MAX_TTL_SECS {
            return Err(VaultError::InvalidTtl {
                got: policy.ttl_secs,
                max: MAX_TTL_SECS,
            });
        }
        self.check_identity(agent_id)?;
        {
            let registry = self.registry.read().map_err(|_| VaultError::Poisoned)?;
            if registry.find_fulfilling(capability).is_none() {
                return Err(VaultError::ToolNotVetted {
                    capability: capability.to_string(),
                });
            }
        }

        let mut table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        // Re-check under the lock: revoke_all may have sealed meanwhile.
        if self.is_sealed() {
            return Err(VaultError::Sealed);
        }

        let slot: Slot = (agent_id.to_string(), capability.clone());
        if let Some(existing_id) = table.slots.get(&slot).copied() {
            let live = table
                .leases
                .get(&existing_id)
                .map(|l| l.is_live(now))
                .unwrap_or(false);
            if live {
                return self.reissue(&mut table, existing_id, policy, now);
            }
            table.remove(existing_id);
        }

        let lease = CredentialLease {
            lease_id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            capability: capability.clone(),
            issued_at: now,
            renewed_at: now,
            ttl_secs: policy.ttl_secs,
            usage: policy.usage,
            uses: 0,
            revoked: false,
        };
        let token = self.signer.sign(&LeaseClaims::from(&lease))?;
        table.slots.insert(slot, lease.lease_id);
        table.leases.insert(lease.lease_id, lease.clone());
        tracing::info!(
            agent = agent_id,
            lease = %lease.lease_id,
            capability = %capability,
            ttl_secs = lease.ttl_secs,
            "lease issued"
        );
        Ok(LeaseGrant {
            lease,
            token,
            outcome: IssueOutcome::Fresh,
        })
    }

    fn reissue(
        &self,
        table: &mut LeaseTable,
        lease_id: Uuid,
        policy: &LeasePolicy,
        now: DateTime<Utc>,
    ) -> Result<LeaseGrant, VaultError> {
        let lease = table
            .leases
            .get_mut(&lease_id)
            .ok_or(VaultError::LeaseNotFound(lease_id))?;
        let outcome = match policy.reissue {
            ReissuePolicy::Deny => return Err(VaultError::LeaseConflict { lease_id }),
            ReissuePolicy::Reuse if lease.usage == LeaseUsage::Reusable => IssueOutcome::Reused,
            // A single-use lease handed to two callers would be used twice.
            ReissuePolicy::Reuse => return Err(VaultError::LeaseConflict { lease_id }),
            ReissuePolicy::Extend => {
                lease.renewed_at = now;
                lease.ttl_secs = policy.ttl_secs;
                IssueOutcome::Extended
            }
        };
        let lease = lease.clone();
        let token = self.signer.sign(&LeaseClaims::from(&lease))?;
        tracing::info!(lease = %lease_id, outcome = ?outcome, "lease reissued");
        Ok(LeaseGrant {
            lease,
            token,
            outcome,
        })
    }

    fn check_identity(&self, agent_id: &str) -> Result<(), VaultError> {
        let identities = self.identities.read().map_err(|_| VaultError::Poisoned)?;
        match identities.get(agent_id) {
            None => Err(VaultError::UnknownIdentity {
                agent_id: agent_id.to_string(),
            }),
            Some(identity) if identity.revoked => Err(VaultError::IdentityRevoked {
                agent_id: agent_id.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Validate a lease for one use of `capability` at `now`.
    ///
    /// Expired leases are removed here. The capability must equal the
    /// leased one exactly. A single-use lease is consumed.
    pub fn authorize_use(
        &self,
        lease_id: Uuid,
        capability: &Capability,
        now: DateTime<Utc>,
    ) -> Result<CredentialLease, VaultError> {
        let mut table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        let lease = table
            .leases
            .get(&lease_id)
            .ok_or(VaultError::LeaseNotFound(lease_id))?;

        if lease.revoked {
            return Err(VaultError::Revoked(lease_id));
        }
        if lease.is_expired(now) {
            table.remove(lease_id);
            tracing::debug!(lease = %lease_id, "expired lease invalidated");
            return Err(VaultError::Expired(lease_id));
        }
        if lease.capability != *capability {
            return Err(VaultError::CapabilityMismatch {
                lease_id,
                leased: lease.capability.to_string(),
                requested: capability.to_string(),
            });
        }
        if lease.is_exhausted() {
            return Err(VaultError::Exhausted(lease_id));
        }
        let agent_id = lease.agent_id.clone();
        drop(table);
        self.check_identity(&agent_id)?;

        let mut table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        let lease = table
            .leases
            .get_mut(&lease_id)
            .ok_or(VaultError::LeaseNotFound(lease_id))?;
        // Revocation or another use may have landed between the two locks.
        if !lease.is_live(now) {
            return Err(if lease.revoked {
                VaultError::Revoked(lease_id)
            } else {
                VaultError::Exhausted(lease_id)
            });
        }
        lease.uses += 1;
        Ok(lease.clone())
    }

    /// Verify a token's signature and authorize the lease it names.
    ///
    /// A token is good until the expiry it was signed with, even when the
    /// lease has since been extended; the extension comes with a new token.
    pub fn authorize_token(
        &self,
        token: &str,
        capability: &Capability,
        now: DateTime<Utc>,
    ) -> Result<CredentialLease, VaultError> {
        let claims = self.decode_token(token)?;
        if now >= claims.expires_at {
            return Err(VaultError::Expired(claims.lease_id));
        }
        self.authorize_use(claims.lease_id, capability, now)
    }

    pub fn decode_token(&self, token: &str) -> Result<LeaseClaims, VaultError> {
        self.signer.verify(token)
    }

    pub fn revoke(&self, lease_id: Uuid) -> Result<(), VaultError> {
        let mut table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        let lease = table
            .leases
            .get_mut(&lease_id)
            .ok_or(VaultError::LeaseNotFound(lease_id))?;
        lease.revoked = true;
        let slot = (lease.agent_id.clone(), lease.capability.clone());
        if table.slots.get(&slot) == Some(&lease_id) {
            table.slots.remove(&slot);
        }
        tracing::info!(lease = %lease_id, "lease revoked");
        Ok(())
    }

    /// Seal the vault and revoke every lease. Returns after the table has
    /// been rewritten and recounted.
    pub fn revoke_all(&self) -> Result<RevocationReport, VaultError> {
        self.seal();
        let mut table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        let mut revoked = 0;
        for lease in table.leases.values_mut() {
            if !lease.revoked {
                lease.revoked = true;
                revoked += 1;
            }
        }
        table.slots.clear();
        let remaining = table.leases.values().filter(|l| !l.revoked).count();
        tracing::warn!(revoked, remaining, "all leases revoked");
        Ok(RevocationReport { revoked, remaining })
    }

    /// Stop issuing. There is no unseal.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Drop leases that can never be used again. Returns how many.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, VaultError> {
        let mut table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        let dead: Vec<Uuid> = table
            .leases
            .values()
            .filter(|l| !l.is_live(now))
            .map(|l| l.lease_id)
            .collect();
        for id in &dead {
            table.remove(*id);
        }
        Ok(dead.len())
    }

    /// Leases that could still authorize a use at `now`.
    pub fn active_count(&self, now: DateTime<Utc>) -> Result<usize, VaultError> {
        let table = self.leases.lock().map_err(|_| VaultError::Poisoned)?;
        Ok(table.leases.values().filter(|l| l.is_live(now)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use std::thread;
    use wd_policy::{CapabilityPattern, ToolRegistryEntry};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()
    }

    fn vault() -> CredentialVault {
        let mut registry = ToolRegistry::new(HashMap::new());
        registry
            .bootstrap(vec![ToolRegistryEntry {
                name: "git-tool".into(),
                version: "1.0.0".into(),
                vetted: true,
                last_audit: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                capabilities: vec![CapabilityPattern::new("repository", "*", "*")],
            }])
            .unwrap();
        let vault = CredentialVault::new(Arc::new(RwLock::new(registry))).unwrap();
        vault
            .register_identity(
                AgentIdentity::new(
                    "agent-1",
                    vec![CapabilityPattern::new("*", "*", "*")],
                    t0(),
                )
                .unwrap(),
            )
            .unwrap();
        vault
    }

    fn cap() -> Capability {
        Capability::new("repository", "write-pr", "src/lib.rs")
    }

    #[test]
    fn fresh_lease_authorizes_exact_capability_once() {
        let v = vault();
        let grant = v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        assert_eq!(grant.outcome, IssueOutcome::Fresh);

        let other = Capability::new("repository", "write-pr", "src/main.rs");
        assert!(matches!(
            v.authorize_use(grant.lease.lease_id, &other, t0()),
            Err(VaultError::CapabilityMismatch { .. })
        ));

        v.authorize_use(grant.lease.lease_id, &cap(), t0()).unwrap();
        assert!(matches!(
            v.authorize_use(grant.lease.lease_id, &cap(), t0()),
            Err(VaultError::Exhausted(_))
        ));
    }

    #[test]
    fn expired_lease_is_invalidated_lazily() {
        let v = vault();
        let grant = v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        let later = t0() + Duration::seconds(301);
        assert!(matches!(
            v.authorize_use(grant.lease.lease_id, &cap(), later),
            Err(VaultError::Expired(_))
        ));
        assert!(matches!(
            v.authorize_use(grant.lease.lease_id, &cap(), later),
            Err(VaultError::LeaseNotFound(_))
        ));
    }

    #[test]
    fn live_slot_conflicts_by_default() {
        let v = vault();
        let first = v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        match v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()) {
            Err(VaultError::LeaseConflict { lease_id }) => {
                assert_eq!(lease_id, first.lease.lease_id)
            }
            other => panic!("expected conflict, got {:?}", other.map(|g| g.outcome)),
        }
    }

    #[test]
    fn slot_frees_after_expiry() {
        let v = vault();
        v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        let later = t0() + Duration::seconds(300);
        let grant = v.issue("agent-1", &cap(), &LeasePolicy::default(), later).unwrap();
        assert_eq!(grant.outcome, IssueOutcome::Fresh);
    }

    #[test]
    fn extend_restarts_window_without_exceeding_ttl() {
        let v = vault();
        let policy = LeasePolicy {
            reissue: ReissuePolicy::Extend,
            ..LeasePolicy::default()
        };
        let first = v.issue("agent-1", &cap(), &policy, t0()).unwrap();
        let mid = t0() + Duration::seconds(200);
        let second = v.issue("agent-1", &cap(), &policy, mid).unwrap();
        assert_eq!(second.outcome, IssueOutcome::Extended);
        assert_eq!(second.lease.lease_id, first.lease.lease_id);
        assert_eq!(
            second.lease.expires_at() - second.lease.renewed_at,
            Duration::seconds(300)
        );
        assert_eq!(second.lease.expires_at(), mid + Duration::seconds(300));
    }

    #[test]
    fn token_stops_at_its_own_expiry_after_extend() {
        let v = vault();
        let policy = LeasePolicy {
            usage: LeaseUsage::Reusable,
            reissue: ReissuePolicy::Extend,
            ..LeasePolicy::default()
        };
        let first = v.issue("agent-1", &cap(), &policy, t0()).unwrap();
        let second = v
            .issue("agent-1", &cap(), &policy, t0() + Duration::seconds(200))
            .unwrap();
        assert_eq!(second.outcome, IssueOutcome::Extended);

        let after_first_expiry = t0() + Duration::seconds(350);
        assert!(matches!(
            v.authorize_token(&first.token, &cap(), after_first_expiry),
            Err(VaultError::Expired(id)) if id == first.lease.lease_id
        ));
        v.authorize_token(&second.token, &cap(), after_first_expiry)
            .unwrap();
        assert!(matches!(
            v.authorize_token(&second.token, &cap(), t0() + Duration::seconds(500)),
            Err(VaultError::Expired(_))
        ));
    }

    #[test]
    fn reuse_only_for_reusable_leases() {
        let v = vault();
        let reusable = LeasePolicy {
            usage: LeaseUsage::Reusable,
            reissue: ReissuePolicy::Reuse,
            ..LeasePolicy::default()
        };
        let first = v.issue("agent-1", &cap(), &reusable, t0()).unwrap();
        let again = v.issue("agent-1", &cap(), &reusable, t0()).unwrap();
        assert_eq!(again.outcome, IssueOutcome::Reused);
        assert_eq!(again.lease.lease_id, first.lease.lease_id);

        let single = LeasePolicy {
            reissue: ReissuePolicy::Reuse,
            ..LeasePolicy::default()
        };
        let other = Capability::new("repository", "read", "");
        v.issue("agent-1", &other, &single, t0()).unwrap();
        assert!(matches!(
            v.issue("agent-1", &other, &single, t0()),
            Err(VaultError::LeaseConflict { .. })
        ));
    }

    #[test]
    fn concurrent_issue_grants_exactly_one() {
        let v = Arc::new(vault());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let v = Arc::clone(&v);
                thread::spawn(move || v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let granted = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(VaultError::LeaseConflict { .. })))
            .count();
        assert_eq!(granted, 1);
        assert_eq!(conflicts, 15);
    }

    #[test]
    fn unvetted_capability_refused() {
        let v = vault();
        let deploy = Capability::new("deploy", "production", "");
        assert!(matches!(
            v.issue("agent-1", &deploy, &LeasePolicy::default(), t0()),
            Err(VaultError::ToolNotVetted { .. })
        ));
    }

    #[test]
    fn revoke_all_seals_and_invalidates() {
        let v = vault();
        let grant = v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        let report = v.revoke_all().unwrap();
        assert_eq!(report, RevocationReport { revoked: 1, remaining: 0 });
        assert_eq!(v.active_count(t0()).unwrap(), 0);
        assert!(matches!(
            v.authorize_use(grant.lease.lease_id, &cap(), t0()),
            Err(VaultError::Revoked(_))
        ));
        let other = Capability::new("repository", "read", "");
        assert!(matches!(
            v.issue("agent-1", &other, &LeasePolicy::default(), t0()),
            Err(VaultError::Sealed)
        ));
    }

    #[test]
    fn token_names_the_lease() {
        let v = vault();
        let grant = v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        let claims = v.decode_token(&grant.token).unwrap();
        assert_eq!(claims.lease_id, grant.lease.lease_id);
        assert_eq!(claims.capability, cap());
        assert_eq!(claims.expires_at, t0() + Duration::seconds(300));
        v.authorize_token(&grant.token, &cap(), t0()).unwrap();
    }

    #[test]
    fn revoked_identity_cannot_lease_or_use() {
        let v = vault();
        let grant = v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        assert_eq!(v.revoke_identity("agent-1").unwrap(), 1);
        assert!(v.authorize_use(grant.lease.lease_id, &cap(), t0()).is_err());
        assert!(matches!(
            v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()),
            Err(VaultError::IdentityRevoked { .. })
        ));
    }

    #[test]
    fn identities_are_issued_once() {
        let v = vault();
        let dup = AgentIdentity::new("agent-1", vec![], t0()).unwrap();
        assert!(matches!(
            v.register_identity(dup),
            Err(VaultError::IdentityExists { .. })
        ));
    }

    #[test]
    fn sweep_drops_dead_leases() {
        let v = vault();
        v.issue("agent-1", &cap(), &LeasePolicy::default(), t0()).unwrap();
        assert_eq!(v.sweep(t0()).unwrap(), 0);
        assert_eq!(v.sweep(t0() + Duration::seconds(301)).unwrap(), 1);
        assert_eq!(v.active_count(t0()).unwrap(), 0);
    }

    #[test]
    fn zero_ttl_rejected() {
        let v = vault();
        let policy = LeasePolicy {
            ttl_secs: 0,
            ..LeasePolicy::default()
        };
        assert!(matches!(
            v.issue("agent-1", &cap(), &policy, t0()),
            Err(VaultError::InvalidTtl { .. })
        ));
    }
}
