// hasher.rs — SHA-256 hashing utilities.
//
// All hashes in Warden are SHA-256, lowercase hex-encoded (64 characters).
// The chain hash feeds the previous event's hash and the canonical body JSON
// into one digest, separated by a newline so the two parts cannot bleed into
// each other.

use sha2::{Digest, Sha256};

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash a UTF-8 string, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash of one chain link: `SHA-256(previous_hash || "\n" || body_json)`.
pub fn chain_hash(previous_hash: &str, body_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(body_json.as_bytes());
    format!("{:x}", hasher.finalize())
}
