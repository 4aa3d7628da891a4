// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cryptographic primitives for the fleet backplane.
//!
//! Four concerns live here, each in its own module:
//!
//! - [`keys`]: the platform RSA key pair and the hybrid wrap/unwrap used
//!   by phase-2 provisioning (RSA-OAEP key transport + AES-256-GCM body);
//! - [`license`]: Ed25519 verification of signed license envelopes;
//! - [`canonical`]: canonical JSON serialization and the content hash
//!   over desired/reported state;
//! - [`password`]: Argon2id credential hashing and SHA-256 token digests
//!   with constant-time comparison.
//!
//! Every failure on an inbound payload collapses into the single
//! `CRYPTO_FAILURE` code so that callers cannot be turned into padding or
//! timing oracles.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod keys;
pub mod license;
pub mod password;

pub use canonical::{canonical_json, hash_state};
pub use keys::PlatformKeyPair;
pub use license::verify_license;
pub use password::{
    generate_secret, hash_password, hash_token, token_matches, verify_password,
};
