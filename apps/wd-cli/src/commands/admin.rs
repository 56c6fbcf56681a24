// admin.rs — Operator token generation.
//
// The token is shown once. Only its SHA-256 goes into warden.toml; the
// daemon compares hashes and never stores the token itself.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use wd_audit::hasher::hash_str;

/// Random bytes in a generated token.
const TOKEN_BYTES: usize = 32;

pub fn execute() -> anyhow::Result<()> {
    let (token, hash) = generate();
    println!("Operator token (store it somewhere safe; it is not shown again):");
    println!();
    println!("  {}", token);
    println!();
    println!("Add this to warden.toml:");
    println!();
    println!("  [admin]");
    println!("  token_sha256 = \"{}\"", hash);
    Ok(())
}

fn generate() -> (String, String) {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = format!("wdo_{}", URL_SAFE_NO_PAD.encode(bytes));
    let hash = hash_str(&token);
    (token, hash)
}
