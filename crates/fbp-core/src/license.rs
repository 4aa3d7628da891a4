// SPDX-License-Identifier: MIT OR Apache-2.0
//! License claims and the unlicensed fallback policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Length of the trial window granted when no valid license is installed.
pub const UNLICENSED_TRIAL_DAYS: i64 = 14;

/// The decoded claim set of a signed license envelope.
///
/// Also represents the unlicensed fallback policy (see
/// [`LicenseClaims::unlicensed`]); callers cannot tell the difference and
/// always go through the same feature/limit queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseClaims {
    /// Licensee identifier.
    pub customer_id: String,
    /// Commercial plan name (e.g. `"trial"`, `"fleet-pro"`).
    pub plan: String,
    /// Enabled boolean capabilities. Unknown features are disabled.
    pub features: BTreeSet<String>,
    /// Numeric limits by name; `-1` denotes unlimited.
    pub limits: BTreeMap<String, i64>,
    /// Validity window start.
    pub not_before: DateTime<Utc>,
    /// Validity window end.
    pub not_after: DateTime<Utc>,
    /// When this claim set was cached locally.
    pub cached_at: DateTime<Utc>,
}

impl LicenseClaims {
    /// The authoritative unlicensed policy, anchored at `first_seen` so the
    /// trial window survives process restarts.
    ///
    /// ```text
    /// plan = trial
    /// features = { ota_updates, basic_jobs }
    /// limits  = { max_devices: 3, max_users: 1 }
    /// valid for 14 days from first observation
    /// ```
    pub fn unlicensed(first_seen: DateTime<Utc>) -> Self {
        Self {
            customer_id: "unlicensed".into(),
            plan: "trial".into(),
            features: ["ota_updates", "basic_jobs"]
                .into_iter()
                .map(String::from)
                .collect(),
            limits: [("max_devices", 3), ("max_users", 1)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            not_before: first_seen,
            not_after: first_seen + Duration::days(UNLICENSED_TRIAL_DAYS),
            cached_at: first_seen,
        }
    }

    /// Returns `true` iff the feature appears in the claim set.
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains(name)
    }

    /// Returns `true` iff the named limit is unlimited (`-1`) or
    /// `proposed_count` fits under it. Unknown limits deny.
    pub fn within_limit(&self, name: &str, proposed_count: i64) -> bool {
        match self.limits.get(name) {
            Some(-1) => true,
            Some(limit) => proposed_count <= *limit,
            None => false,
        }
    }

    /// Returns `true` when `now` falls inside the validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now <= self.not_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlicensed_policy_shape() {
        let t0 = Utc::now();
        let claims = LicenseClaims::unlicensed(t0);
        assert_eq!(claims.plan, "trial");
        assert!(claims.has_feature("ota_updates"));
        assert!(claims.has_feature("basic_jobs"));
        assert!(!claims.has_feature("vpn"));
        assert_eq!(claims.limits["max_devices"], 3);
        assert_eq!(claims.limits["max_users"], 1);
        assert_eq!(claims.not_after - claims.not_before, Duration::days(14));
    }

    #[test]
    fn within_limit_boundaries() {
        let claims = LicenseClaims::unlicensed(Utc::now());
        assert!(claims.within_limit("max_devices", 3));
        assert!(!claims.within_limit("max_devices", 4));
        assert!(!claims.within_limit("max_peers", 0));
    }

    #[test]
    fn negative_one_is_unlimited() {
        let mut claims = LicenseClaims::unlicensed(Utc::now());
        claims.limits.insert("max_devices".into(), -1);
        assert!(claims.within_limit("max_devices", i64::MAX));
    }

    #[test]
    fn validity_window() {
        let t0 = Utc::now();
        let claims = LicenseClaims::unlicensed(t0);
        assert!(claims.is_valid_at(t0));
        assert!(claims.is_valid_at(t0 + Duration::days(13)));
        assert!(!claims.is_valid_at(t0 + Duration::days(15)));
        assert!(!claims.is_valid_at(t0 - Duration::seconds(1)));
    }
}
