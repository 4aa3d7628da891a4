// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed license envelope verification.
//!
//! An envelope is `base64url(claims_json) + "." + base64url(signature)`,
//! signed with Ed25519 over the exact payload bytes. Verification yields
//! the decoded claim set or one of two failures: `LICENSE_EXPIRED` (good
//! signature, window elapsed) and `LICENSE_INVALID` (everything else).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use fbp_core::LicenseClaims;
use fbp_error::{ErrorCode, FleetError, FleetResult};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Claim fields as they appear inside the signed payload.
#[derive(Debug, Deserialize)]
struct EnvelopeClaims {
    customer_id: String,
    plan: String,
    #[serde(default)]
    features: BTreeSet<String>,
    #[serde(default)]
    limits: BTreeMap<String, i64>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// Decode a base64-encoded 32-byte Ed25519 verifying key.
pub fn decode_verifying_key(encoded: &str) -> FleetResult<VerifyingKey> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| {
            FleetError::new(ErrorCode::ConfigInvalid, "license public key is not base64")
                .with_source(e)
        })?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        FleetError::new(ErrorCode::ConfigInvalid, "license public key must be 32 bytes")
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| {
        FleetError::new(ErrorCode::ConfigInvalid, "license public key is not a valid point")
            .with_source(e)
    })
}

/// Verify `envelope` against `key` and decode its claims.
///
/// On success the returned claims carry `cached_at = now`.
pub fn verify_license(envelope: &str, key: &VerifyingKey) -> FleetResult<LicenseClaims> {
    verify_license_at(envelope, key, Utc::now())
}

/// [`verify_license`] with an explicit clock, for tests and cache refresh.
pub fn verify_license_at(
    envelope: &str,
    key: &VerifyingKey,
    now: DateTime<Utc>,
) -> FleetResult<LicenseClaims> {
    let invalid = |msg: &str| FleetError::new(ErrorCode::LicenseInvalid, msg.to_string());

    let (payload_b64, signature_b64) = envelope
        .trim()
        .split_once('.')
        .ok_or_else(|| invalid("license envelope is not payload.signature"))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| invalid("license payload is not base64url"))?;
    let signature_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| invalid("license signature is not base64url"))?;
    let signature_bytes: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| invalid("license signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&signature_bytes);

    key.verify(&payload, &signature)
        .map_err(|_| invalid("license signature verification failed"))?;

    let claims: EnvelopeClaims = serde_json::from_slice(&payload)
        .map_err(|e| invalid("license claims are malformed").with_source(e))?;

    if now < claims.not_before || now > claims.not_after {
        return Err(FleetError::new(
            ErrorCode::LicenseExpired,
            "license is outside its validity window",
        )
        .with_context("not_before", claims.not_before.to_rfc3339())
        .with_context("not_after", claims.not_after.to_rfc3339()));
    }

    Ok(LicenseClaims {
        customer_id: claims.customer_id,
        plan: claims.plan,
        features: claims.features,
        limits: claims.limits,
        not_before: claims.not_before,
        not_after: claims.not_after,
        cached_at: now,
    })
}
