// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential hashing.
//!
//! Two different one-way functions, deliberately:
//!
//! - passwords and API keys use Argon2id (salted, slow, tens of
//!   milliseconds per verification);
//! - provisioning tokens use SHA-256, because token validation must scan
//!   candidate rows and each candidate comparison has to be cheap. Tokens
//!   carry 256 bits of entropy, so a fast hash is not a brute-force
//!   concern the way human-chosen passwords are.

use argon2::password_hash::rand_core::OsRng as SaltRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use fbp_error::{FleetError, FleetResult};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Generate 32 bytes of cryptographic randomness, hex-encoded (64 chars).
///
/// Used for MQTT passwords, API keys, and provisioning tokens.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password or API key with Argon2id and a fresh random salt.
pub fn hash_password(plaintext: &str) -> FleetResult<String> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| FleetError::crypto("password hashing failed").with_source(e))
}

/// Verify a password or API key against its stored Argon2 hash.
///
/// Returns `false` on any parse or verification failure (fail-closed).
pub fn verify_password(plaintext: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// One-way SHA-256 digest of a provisioning token, lower-hex.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compare a plaintext token against a stored digest in constant time.
pub fn token_matches(token: &str, stored_hash: &str) -> bool {
    constant_time_eq(hash_token(token).as_bytes(), stored_hash.as_bytes())
}

/// Length-guarded constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Secrets
    // -----------------------------------------------------------------------

    #[test]
    fn secrets_are_64_hex_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn secrets_are_unique() {
        assert_ne!(generate_secret(), generate_secret());
    }

    // -----------------------------------------------------------------------
    // Argon2
    // -----------------------------------------------------------------------

    #[test]
    fn password_roundtrip() {
        let plaintext = generate_secret();
        let hash = hash_password(&plaintext).unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&plaintext, &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn salts_differ_per_hash() {
        let hash_a = hash_password("pw").unwrap();
        let hash_b = hash_password("pw").unwrap();
        assert_ne!(hash_a, hash_b);
        assert!(verify_password("pw", &hash_a));
        assert!(verify_password("pw", &hash_b));
    }

    #[test]
    fn malformed_stored_hash_fails_closed() {
        assert!(!verify_password("pw", "not-a-phc-string"));
        assert!(!verify_password("pw", ""));
    }

    // -----------------------------------------------------------------------
    // Token digests
    // -----------------------------------------------------------------------

    #[test]
    fn token_digest_roundtrip() {
        let token = generate_secret();
        let digest = hash_token(&token);
        assert_eq!(digest.len(), 64);
        assert!(token_matches(&token, &digest));
        assert!(!token_matches("other", &digest));
    }

    #[test]
    fn token_digest_is_deterministic() {
        assert_eq!(hash_token("K"), hash_token("K"));
        assert_ne!(hash_token("K"), hash_token("L"));
    }

    #[test]
    fn constant_time_eq_length_guard() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(constant_time_eq(b"", b""));
    }
}
