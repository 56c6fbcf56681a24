// token.rs — Signed lease tokens.
//
// Format: base64url(claims JSON) "." base64url(HMAC-SHA256 over the first
// part). The key is generated per process, so tokens do not survive a
// restart; neither do leases.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::hmac;
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wd_policy::Capability;

use crate::error::VaultError;
use crate::lease::CredentialLease;

/// What a lease token asserts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseClaims {
    pub lease_id: Uuid,
    pub agent_id: String,
    pub capability: Capability,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&CredentialLease> for LeaseClaims {
    fn from(lease: &CredentialLease) -> Self {
        Self {
            lease_id: lease.lease_id,
            agent_id: lease.agent_id.clone(),
            capability: lease.capability.clone(),
            issued_at: lease.issued_at,
            expires_at: lease.expires_at(),
        }
    }
}

pub struct TokenSigner {
    key: hmac::Key,
}

impl TokenSigner {
    /// A signer with a fresh random key.
    pub fn generate() -> Result<Self, VaultError> {
        let rng = SystemRandom::new();
        let key =
            hmac::Key::generate(hmac::HMAC_SHA256, &rng).map_err(|_| VaultError::KeyGeneration)?;
        Ok(Self { key })
    }

    /// A signer with a caller-supplied key.
    pub fn from_key(key: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, key),
        }
    }

    pub fn sign(&self, claims: &LeaseClaims) -> Result<String, VaultError> {
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let tag = hmac::sign(&self.key, body.as_bytes());
        Ok(format!("{}.{}", body, URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Check the signature and return the claims. Expiry is checked by
    /// the vault, against both the claims and its own table.
    pub fn verify(&self, token: &str) -> Result<LeaseClaims, VaultError> {
        let (body, tag) = token
            .split_once('.')
            .ok_or_else(|| VaultError::InvalidToken("missing separator".into()))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| VaultError::InvalidToken("signature is not base64url".into()))?;
        hmac::verify(&self.key, body.as_bytes(), &tag)
            .map_err(|_| VaultError::InvalidToken("signature mismatch".into()))?;
        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| VaultError::InvalidToken("claims are not base64url".into()))?;
        serde_json::from_slice(&json)
            .map_err(|e| VaultError::InvalidToken(format!("malformed claims: {}", e)))
    }
}
