//! # wd-credentials
//!
//! Credential vault for the Warden gateway.
//!
//! Agents never hold long-lived credentials. After the policy engine allows
//! a task, the [`CredentialVault`] issues a [`CredentialLease`]: a grant for
//! exactly one capability, valid for a short TTL (300 s by default), handed
//! to the executor as an HMAC-signed lease token.
//!
//! ## Key invariants
//!
//! - One live lease per `(agent, capability)` slot; check-and-insert is
//!   atomic under the lease table lock.
//! - A lease authorizes only the capability it names, compared exactly.
//! - Expired leases are invalidated when checked, not by a background task.
//! - After [`CredentialVault::revoke_all`] the vault is sealed and refuses
//!   to issue.

pub mod error;
pub mod lease;
pub mod token;
pub mod vault;

pub use error::VaultError;
pub use lease::{
    CredentialLease, IssueOutcome, LeaseGrant, LeasePolicy, LeaseUsage, ReissuePolicy,
    RevocationReport,
};
pub use token::{LeaseClaims, TokenSigner};
pub use vault::CredentialVault;
