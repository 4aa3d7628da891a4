// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provisioning-key registry and device credential issuance.
//!
//! Every credential plaintext the platform ever hands out is produced
//! here, returned up exactly once, and stored only as a hash:
//!
//! - provisioning tokens (SHA-256 at rest, constant-time match);
//! - per-device MQTT passwords (Argon2id at rest);
//! - per-device API keys (Argon2id at rest).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use fbp_core::{
    Actor, AuditKind, AuditRecord, AuditSeverity, Device, MqttUser, ProvisioningKey,
    device_username, topic::device_acl_set,
};
use fbp_error::{ErrorCode, FleetError, FleetResult};
use fbp_store::{DeviceTx, Store};
use tracing::{debug, warn};

/// A freshly created provisioning key with its one-time plaintext.
#[derive(Debug)]
pub struct IssuedProvisioningKey {
    /// The stored registry record.
    pub key: ProvisioningKey,
    /// Plaintext token; visible only in this response.
    pub token: String,
}

/// A freshly materialized broker credential set.
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    /// Canonical `device-<device_id>` username.
    pub username: String,
    /// Plaintext password; visible only in this response.
    pub password: String,
}

/// A freshly issued device API key.
#[derive(Debug)]
pub struct IssuedApiKey {
    /// Plaintext key; visible only in this response.
    pub plaintext: String,
    /// Argon2 hash to persist on the device record.
    pub hash: String,
}

/// Registry and issuance operations over the store.
#[derive(Clone)]
pub struct IdentityService {
    store: Store,
}

impl IdentityService {
    /// Create the service.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // -- provisioning keys ----------------------------------------------------

    /// Create a provisioning key. The returned token is shown exactly once.
    pub async fn create_provisioning_key(
        &self,
        fleet_tag: Option<&str>,
        max_uses: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> FleetResult<IssuedProvisioningKey> {
        let token = fbp_crypto::generate_secret();
        let key = self
            .store
            .create_provisioning_key(&fbp_crypto::hash_token(&token), fleet_tag, max_uses, expires_at)
            .await?;

        self.store
            .append_audit(&AuditRecord::now(
                AuditKind::ProvisioningKeyChanged,
                AuditSeverity::Info,
                Actor::System,
                serde_json::json!({
                    "action": "created",
                    "key_id": key.id,
                    "fleet_tag": fleet_tag,
                    "max_uses": max_uses,
                }),
            ))
            .await?;
        debug!(key_id = key.id, "provisioning key created");
        Ok(IssuedProvisioningKey { key, token })
    }

    /// List registered keys (hashes stay redacted in serialization).
    pub async fn list_provisioning_keys(&self) -> FleetResult<Vec<ProvisioningKey>> {
        self.store.list_provisioning_keys().await
    }

    /// Deactivate a key. Returns `false` when the id is unknown.
    pub async fn deactivate_provisioning_key(&self, id: i64) -> FleetResult<bool> {
        let changed = self.store.set_provisioning_key_active(id, false).await?;
        if changed {
            self.store
                .append_audit(&AuditRecord::now(
                    AuditKind::ProvisioningKeyChanged,
                    AuditSeverity::Info,
                    Actor::System,
                    serde_json::json!({"action": "deactivated", "key_id": id}),
                ))
                .await?;
        }
        Ok(changed)
    }

    /// Validate a plaintext provisioning token.
    ///
    /// Scans candidate rows with a constant-time digest comparison and
    /// re-checks usability. Failed attempts are audited with the caller
    /// address and claimed device id.
    pub async fn validate_token(
        &self,
        token: &str,
        device_id: &str,
        caller_addr: &str,
    ) -> FleetResult<ProvisioningKey> {
        let now = Utc::now();
        let candidates = self.store.candidate_provisioning_keys(None).await?;

        let matched = candidates
            .into_iter()
            .find(|key| fbp_crypto::token_matches(token, &key.key_hash));

        match matched {
            Some(key) if key.is_usable(now) => Ok(key),
            _ => {
                warn!(device_id, caller_addr, "provisioning token rejected");
                self.store
                    .append_audit(&AuditRecord::now(
                        AuditKind::ProvisioningRejected,
                        AuditSeverity::Warning,
                        Actor::Device {
                            device_id: device_id.to_string(),
                        },
                        serde_json::json!({
                            "caller_addr": caller_addr,
                            "reason": "unknown, exhausted, or expired provisioning token",
                        }),
                    ))
                    .await?;
                Err(FleetError::new(
                    ErrorCode::ProvisioningKeyInvalid,
                    "provisioning token rejected",
                ))
            }
        }
    }

    // -- device credentials ---------------------------------------------------

    /// Materialize a fresh broker account for a device inside `tx`.
    ///
    /// Any previous account is deleted first; an old password hash is
    /// never reused. The ACL triple is inserted atomically with the user.
    pub async fn materialize_mqtt_account(
        &self,
        tx: &mut DeviceTx,
    ) -> FleetResult<MqttCredentials> {
        let device_id = tx.device_id().to_string();
        let username = device_username(&device_id);
        let password = fbp_crypto::generate_secret();

        let user = MqttUser {
            username: username.clone(),
            password_hash: fbp_crypto::hash_password(&password)?,
            active: true,
            created_at: Utc::now(),
        };
        let acls = device_acl_set(&device_id);
        tx.replace_mqtt_account(&user, &acls).await?;

        Ok(MqttCredentials { username, password })
    }

    /// Issue a fresh API key pair (plaintext + hash) for a device.
    pub fn issue_api_key(&self) -> FleetResult<IssuedApiKey> {
        let plaintext = fbp_crypto::generate_secret();
        let hash = fbp_crypto::hash_password(&plaintext)?;
        Ok(IssuedApiKey { plaintext, hash })
    }

    /// Verify a presented API key against a device record.
    pub fn verify_api_key(&self, device: &Device, presented: &str) -> bool {
        !device.api_key_hash.is_empty() && fbp_crypto::verify_password(presented, &device.api_key_hash)
    }
}
