// SPDX-License-Identifier: MIT OR Apache-2.0
//! The process-wide license authority.
//!
//! One [`LicenseAuthority`] answers every "is X allowed?" question. At
//! startup it verifies the configured envelope (if any), caches the
//! decoded claims in the store, and installs either the licensed claim set
//! or the documented unlicensed trial policy. The active claim set lives
//! behind a copy-on-write pointer: readers clone an `Arc`, writers swap it
//! atomically, and no caller can observe a torn set.
//!
//! Expiry is evaluated at [`LicenseAuthority::init`] and
//! [`LicenseAuthority::reload`] time; an envelope that lapses while the
//! process runs degrades at the next refresh.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use fbp_core::{
    Actor, AuditKind, AuditRecord, AuditSeverity, LicenseClaims, PlatformEvent,
};
use fbp_error::{ErrorCode, FleetError, FleetResult};
use fbp_store::Store;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// System-config key holding the cached decoded claims.
pub const CONFIG_LICENSE_CLAIMS: &str = "license.claims";

/// System-config key anchoring the unlicensed trial window.
pub const CONFIG_LICENSE_FIRST_SEEN: &str = "license.first_seen";

/// Licensed limit name for admission control.
pub const LIMIT_MAX_DEVICES: &str = "max_devices";

/// Single process-wide authority over features and limits.
pub struct LicenseAuthority {
    claims: RwLock<Arc<LicenseClaims>>,
    store: Store,
    envelope: Option<String>,
    verifying_key: Option<VerifyingKey>,
}

impl LicenseAuthority {
    /// Create an authority that will verify `envelope` against
    /// `verifying_key` at [`init`](Self::init) time.
    ///
    /// Until `init` runs, the unlicensed policy anchored at "now" is in
    /// force; `init` replaces it with the persisted anchor.
    pub fn new(
        store: Store,
        envelope: Option<String>,
        verifying_key: Option<VerifyingKey>,
    ) -> Self {
        Self {
            claims: RwLock::new(Arc::new(LicenseClaims::unlicensed(Utc::now()))),
            store,
            envelope,
            verifying_key,
        }
    }

    /// Verify the configured envelope and install the resulting claim set.
    ///
    /// Outcomes are audited. Verification failure is not an error here;
    /// it degrades to the unlicensed policy.
    pub async fn init(&self) -> FleetResult<()> {
        let outcome = match (&self.envelope, &self.verifying_key) {
            (Some(envelope), Some(key)) => match fbp_crypto::verify_license(envelope, key) {
                Ok(claims) => Outcome::Licensed(claims),
                Err(err) => Outcome::Rejected(err),
            },
            (Some(_), None) => Outcome::Rejected(FleetError::new(
                ErrorCode::LicenseInvalid,
                "license envelope configured without a verification key",
            )),
            (None, _) => Outcome::Absent,
        };

        let claims = match outcome {
            Outcome::Licensed(claims) => {
                info!(plan = %claims.plan, customer = %claims.customer_id, "license accepted");
                self.store
                    .append_audit(&AuditRecord::now(
                        AuditKind::LicenseAccepted,
                        AuditSeverity::Info,
                        Actor::System,
                        serde_json::json!({
                            "plan": claims.plan,
                            "customer_id": claims.customer_id,
                            "not_after": claims.not_after.to_rfc3339(),
                        }),
                    ))
                    .await?;
                claims
            }
            Outcome::Rejected(err) => {
                warn!(error = %err, "license rejected; installing unlicensed policy");
                self.store
                    .append_audit(&AuditRecord::now(
                        AuditKind::LicenseRejected,
                        AuditSeverity::Warning,
                        Actor::System,
                        serde_json::json!({
                            "code": err.code.as_str(),
                            "reason": err.message,
                        }),
                    ))
                    .await?;
                self.unlicensed_claims().await?
            }
            Outcome::Absent => {
                info!("no license configured; unlicensed trial policy applies");
                self.store
                    .append_audit(&AuditRecord::now(
                        AuditKind::LicenseRejected,
                        AuditSeverity::Info,
                        Actor::System,
                        serde_json::json!({"reason": "no license envelope configured"}),
                    ))
                    .await?;
                self.unlicensed_claims().await?
            }
        };

        self.store
            .set_config(CONFIG_LICENSE_CLAIMS, &serde_json::to_value(&claims).map_err(
                |e| FleetError::internal("claims serialization failed").with_source(e),
            )?)
            .await?;
        self.install(claims);
        self.store.bus().publish(PlatformEvent::LicenseReloaded);
        Ok(())
    }

    /// Re-run verification; callers observe the swap atomically.
    pub async fn reload(&self) -> FleetResult<()> {
        self.init().await
    }

    /// Returns `true` iff the feature appears in the active claim set.
    pub fn has_feature(&self, name: &str) -> bool {
        self.snapshot().has_feature(name)
    }

    /// Returns `true` iff `proposed_count` fits under the named limit.
    pub fn within_limit(&self, name: &str, proposed_count: i64) -> bool {
        self.snapshot().within_limit(name, proposed_count)
    }

    /// Error-typed variant of [`has_feature`](Self::has_feature).
    pub fn require_feature(&self, name: &str) -> FleetResult<()> {
        if self.has_feature(name) {
            Ok(())
        } else {
            Err(FleetError::new(
                ErrorCode::LicenseFeatureDenied,
                format!("feature '{name}' is not covered by the current plan"),
            )
            .with_context("feature", name)
            .with_context("plan", self.snapshot().plan.clone())
            .with_context("hint", "upgrade the license to enable this feature"))
        }
    }

    /// Error-typed variant of [`within_limit`](Self::within_limit).
    pub fn check_limit(&self, name: &str, proposed_count: i64) -> FleetResult<()> {
        let claims = self.snapshot();
        if claims.within_limit(name, proposed_count) {
            Ok(())
        } else {
            Err(FleetError::new(
                ErrorCode::LicenseLimitExceeded,
                format!("limit '{name}' would be exceeded"),
            )
            .with_context("limit", name)
            .with_context("proposed", proposed_count)
            .with_context("allowed", claims.limits.get(name).copied().unwrap_or(0))
            .with_context("hint", "upgrade the license to raise this limit"))
        }
    }

    /// Read-only snapshot of the active claim set.
    pub fn snapshot(&self) -> Arc<LicenseClaims> {
        Arc::clone(&self.claims.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn install(&self, claims: LicenseClaims) {
        let mut guard = self.claims.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(claims);
    }

    /// Build the unlicensed policy anchored at the persisted first-seen
    /// instant, creating the anchor on first use.
    async fn unlicensed_claims(&self) -> FleetResult<LicenseClaims> {
        let first_seen = match self.store.get_config(CONFIG_LICENSE_FIRST_SEEN).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| FleetError::invariant("license.first_seen is malformed").with_source(e))?,
            None => {
                let now = Utc::now();
                self.store
                    .set_config(CONFIG_LICENSE_FIRST_SEEN, &serde_json::to_value(now).map_err(
                        |e| FleetError::internal("timestamp serialization failed").with_source(e),
                    )?)
                    .await?;
                now
            }
        };
        Ok(LicenseClaims::unlicensed(first_seen))
    }
}

enum Outcome {
    Licensed(LicenseClaims),
    Rejected(FleetError),
    Absent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use chrono::Duration;
    use ed25519_dalek::{Signer, SigningKey};
    use fbp_bus::EventBus;

    async fn store() -> Store {
        Store::in_memory(Arc::new(EventBus::new())).await.unwrap()
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[3u8; 32])
    }

    fn envelope(days_valid: i64, max_devices: i64) -> String {
        let now = Utc::now();
        let payload = serde_json::json!({
            "customer_id": "acme",
            "plan": "fleet-pro",
            "features": ["ota_updates", "basic_jobs", "scheduled_jobs"],
            "limits": {"max_devices": max_devices},
            "not_before": (now - Duration::days(1)).to_rfc3339(),
            "not_after": (now + Duration::days(days_valid)).to_rfc3339(),
        })
        .to_string();
        let signature = signing_key().sign(payload.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    #[tokio::test]
    async fn valid_license_installs_claims() {
        let store = store().await;
        let authority = LicenseAuthority::new(
            store.clone(),
            Some(envelope(30, 100)),
            Some(signing_key().verifying_key()),
        );
        authority.init().await.unwrap();

        assert_eq!(authority.snapshot().plan, "fleet-pro");
        assert!(authority.has_feature("scheduled_jobs"));
        assert!(authority.within_limit(LIMIT_MAX_DEVICES, 100));
        assert!(!authority.within_limit(LIMIT_MAX_DEVICES, 101));

        // Claims are cached in the store.
        let cached = store.get_config(CONFIG_LICENSE_CLAIMS).await.unwrap().unwrap();
        assert_eq!(cached["plan"], "fleet-pro");
    }

    #[tokio::test]
    async fn absent_license_installs_trial_policy() {
        let store = store().await;
        let authority = LicenseAuthority::new(store.clone(), None, None);
        authority.init().await.unwrap();

        let claims = authority.snapshot();
        assert_eq!(claims.plan, "trial");
        assert!(authority.within_limit(LIMIT_MAX_DEVICES, 3));
        assert!(!authority.within_limit(LIMIT_MAX_DEVICES, 4));
        assert!(!authority.has_feature("scheduled_jobs"));
    }

    #[tokio::test]
    async fn expired_license_degrades_to_trial() {
        let store = store().await;
        let authority = LicenseAuthority::new(
            store.clone(),
            Some(envelope(-1, 100)),
            Some(signing_key().verifying_key()),
        );
        authority.init().await.unwrap();
        assert_eq!(authority.snapshot().plan, "trial");
    }

    #[tokio::test]
    async fn tampered_license_degrades_to_trial() {
        let store = store().await;
        let mut bad = envelope(30, 100);
        bad.replace_range(..4, "AAAA");
        let authority = LicenseAuthority::new(
            store.clone(),
            Some(bad),
            Some(signing_key().verifying_key()),
        );
        authority.init().await.unwrap();
        assert_eq!(authority.snapshot().plan, "trial");
    }

    #[tokio::test]
    async fn trial_window_anchor_survives_reinit() {
        let store = store().await;
        let authority = LicenseAuthority::new(store.clone(), None, None);
        authority.init().await.unwrap();
        let first = authority.snapshot().not_after;

        // A second authority over the same store sees the same anchor.
        let again = LicenseAuthority::new(store.clone(), None, None);
        again.init().await.unwrap();
        assert_eq!(again.snapshot().not_after, first);
    }

    #[tokio::test]
    async fn feature_and_limit_errors_carry_hints() {
        let store = store().await;
        let authority = LicenseAuthority::new(store.clone(), None, None);
        authority.init().await.unwrap();

        let err = authority.require_feature("vpn").unwrap_err();
        assert_eq!(err.code, ErrorCode::LicenseFeatureDenied);
        assert!(err.context.contains_key("hint"));

        let err = authority.check_limit(LIMIT_MAX_DEVICES, 4).unwrap_err();
        assert_eq!(err.code, ErrorCode::LicenseLimitExceeded);
        assert_eq!(err.context["allowed"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn init_outcomes_are_audited() {
        let store = store().await;
        let authority = LicenseAuthority::new(store.clone(), None, None);
        authority.init().await.unwrap();
        assert!(store.count_audit_records().await.unwrap() >= 1);
    }
}
