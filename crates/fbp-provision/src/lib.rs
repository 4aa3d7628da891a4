// SPDX-License-Identifier: MIT OR Apache-2.0
//! The two-phase provisioning coordinator.
//!
//! Phase 1 exchanges keys: the device authenticates with a provisioning
//! token and either fetches the platform public key or registers its own.
//! Phase 2 carries a hybrid-wrapped registration payload; a successful
//! registration admits the device, rotates its MQTT and API credentials,
//! seeds its default desired state, and returns the full bootstrap
//! bundle.
//!
//! The coordinator is exactly-once per device from the caller's
//! perspective: concurrent attempts for one device serialise on the
//! device lock, and re-running phase 2 succeeds but supersedes all
//! previously issued credentials, so a replayed response is worthless to
//! an attacker.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use fbp_core::{Actor, AdmissionState, AuditKind, AuditRecord, AuditSeverity, Device, PlatformEvent};
use fbp_crypto::PlatformKeyPair;
use fbp_error::{ErrorCode, FleetError, FleetResult};
use fbp_identity::IdentityService;
use fbp_license::{LIMIT_MAX_DEVICES, LicenseAuthority};
use fbp_state::StateEngine;
use fbp_store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Identifier of the platform key returned by phase 1.
const PLATFORM_KEY_ID: &str = "primary";

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Phase-1 request.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyExchangeRequest {
    /// Caller-assigned device identifier.
    pub device_id: String,
    /// Plaintext provisioning token.
    pub provisioning_token: String,
    /// The device's public key; absent on the first call.
    #[serde(default)]
    pub device_public_key: Option<String>,
}

/// Phase-1 response.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum KeyExchangeResponse {
    /// Returned when no device key was supplied.
    PlatformKey {
        /// PEM-encoded platform public key for wrapping phase 2.
        platform_public_key: String,
        /// Which platform key signed/wraps (rotation hook).
        key_id: &'static str,
    },
    /// Returned once the device key is stored.
    Accepted {
        /// Always `true`.
        ok: bool,
    },
}

/// The decrypted phase-2 registration payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationPayload {
    /// Caller-assigned device identifier.
    pub device_id: String,
    /// Plaintext provisioning token; one use is consumed on success.
    pub provisioning_token: String,
    /// Human-friendly name.
    pub display_name: String,
    /// Free-form classification.
    pub kind: String,
    /// Hardware address.
    #[serde(default)]
    pub mac_address: String,
    /// Operating system version.
    #[serde(default)]
    pub os_version: String,
    /// Agent software version.
    #[serde(default)]
    pub agent_version: String,
}

/// Phase-2 success response: everything an agent needs to come online.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionBundle {
    /// Identity echo.
    pub device: BundleDevice,
    /// Control-plane API access.
    pub api: BundleApi,
    /// Broker access with the freshly rotated credentials.
    pub mqtt: BundleMqtt,
    /// Opaque VPN peer descriptor from the external collaborator, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn: Option<serde_json::Value>,
}

/// Identity section of the bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleDevice {
    /// Device identifier.
    pub device_id: String,
    /// Display name as registered.
    pub display_name: String,
}

/// API section of the bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleApi {
    /// Advertised control-plane endpoint.
    pub endpoint: String,
    /// Fresh API key plaintext. Stored only as a hash.
    pub api_key: String,
    /// CA bundle for API TLS, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_ca: Option<String>,
}

/// MQTT section of the bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleMqtt {
    /// Broker connection descriptor.
    pub broker_url: String,
    /// Canonical device username.
    pub username: String,
    /// Fresh password plaintext. Stored only as a hash.
    pub password: String,
    /// TLS material for the broker connection.
    pub tls: BundleTls,
}

/// TLS sub-section of the MQTT bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleTls {
    /// CA certificate, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    /// Whether the device should verify the broker certificate.
    pub verify: bool,
}

/// Deployment facts baked into every bundle.
#[derive(Debug, Clone, Default)]
pub struct BundleConfig {
    /// Advertised API endpoint.
    pub api_endpoint: String,
    /// Broker URL devices connect to.
    pub broker_url: String,
    /// CA bundle distributed to devices.
    pub tls_ca: Option<String>,
    /// Whether devices verify broker TLS.
    pub tls_verify: bool,
}

// ---------------------------------------------------------------------------
// VPN seam
// ---------------------------------------------------------------------------

/// External collaborator producing opaque VPN peer descriptors.
#[async_trait]
pub trait VpnProvisioner: Send + Sync {
    /// Produce a peer descriptor for the device, or `None` when VPN is not
    /// part of this deployment.
    async fn peer_descriptor(&self, device_id: &str) -> FleetResult<Option<serde_json::Value>>;
}

/// Default collaborator: no VPN.
pub struct NoVpn;

#[async_trait]
impl VpnProvisioner for NoVpn {
    async fn peer_descriptor(&self, _device_id: &str) -> FleetResult<Option<serde_json::Value>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Orchestrates the two-phase handshake.
pub struct ProvisioningCoordinator {
    store: Store,
    identity: IdentityService,
    license: Arc<LicenseAuthority>,
    state: StateEngine,
    keys: Arc<PlatformKeyPair>,
    bundle: BundleConfig,
    vpn: Arc<dyn VpnProvisioner>,
}

impl ProvisioningCoordinator {
    /// Wire the coordinator to its collaborators.
    pub fn new(
        store: Store,
        identity: IdentityService,
        license: Arc<LicenseAuthority>,
        state: StateEngine,
        keys: Arc<PlatformKeyPair>,
        bundle: BundleConfig,
        vpn: Arc<dyn VpnProvisioner>,
    ) -> Self {
        Self {
            store,
            identity,
            license,
            state,
            keys,
            bundle,
            vpn,
        }
    }

    // -- phase 1 --------------------------------------------------------------

    /// Phase 1: key exchange.
    ///
    /// Without a device key this is a pure read and idempotent; with one,
    /// the key is upserted (re-key allowed) under the device lock.
    pub async fn key_exchange(
        &self,
        request: KeyExchangeRequest,
        caller_addr: &str,
    ) -> FleetResult<KeyExchangeResponse> {
        if request.device_id.is_empty() {
            return Err(FleetError::bad_request("device_id must not be empty"));
        }

        self.identity
            .validate_token(&request.provisioning_token, &request.device_id, caller_addr)
            .await
            .map_err(unauthorized)?;

        match request.device_public_key {
            None => Ok(KeyExchangeResponse::PlatformKey {
                platform_public_key: self.keys.public_pem()?,
                key_id: PLATFORM_KEY_ID,
            }),
            Some(pem) => {
                if pem.trim().is_empty() {
                    return Err(FleetError::bad_request("device_public_key must not be empty"));
                }
                let mut tx = self.store.begin_device(&request.device_id).await?;
                tx.upsert_public_key(&pem, Utc::now()).await?;
                tx.commit().await?;
                info!(device_id = %request.device_id, "device public key registered");
                Ok(KeyExchangeResponse::Accepted { ok: true })
            }
        }
    }

    // -- phase 2 --------------------------------------------------------------

    /// Phase 2: encrypted registration.
    ///
    /// Succeeds for fresh and already-known devices alike; every success
    /// rotates MQTT and API credentials, so earlier responses stop
    /// working. Failures roll back completely; there are no partial
    /// devices.
    pub async fn register(
        &self,
        encrypted_payload_b64: &str,
        caller_addr: &str,
    ) -> FleetResult<ProvisionBundle> {
        let wrapped = BASE64
            .decode(encrypted_payload_b64.trim())
            .map_err(|e| FleetError::bad_request("encrypted_payload is not base64").with_source(e))?;

        let plaintext = match self.keys.unwrap_payload(&wrapped) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.audit_crypto_rejected(caller_addr).await;
                return Err(err);
            }
        };
        let payload: RegistrationPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| FleetError::bad_request("registration payload is malformed").with_source(e))?;
        if payload.device_id.is_empty() {
            return Err(FleetError::bad_request("device_id must not be empty"));
        }

        let key = self
            .identity
            .validate_token(&payload.provisioning_token, &payload.device_id, caller_addr)
            .await
            .map_err(unauthorized)?;

        let now = Utc::now();
        let mut tx = self.store.begin_device(&payload.device_id).await?;

        tx.consume_provisioning_key(key.id, now)
            .await
            .map_err(unauthorized)?;

        // Admission: an existing device re-registers freely; a new one
        // must fit under the licensed cap.
        let existing = tx.get_device().await?;
        let proposed = tx.count_active_devices().await? + if existing.is_some() { 0 } else { 1 };
        if let Err(err) = self.license.check_limit(LIMIT_MAX_DEVICES, proposed) {
            drop(tx);
            self.audit_admission_denied(&payload.device_id, caller_addr, proposed).await;
            return Err(err);
        }

        let api_key = self.identity.issue_api_key()?;
        let device = Device {
            device_id: payload.device_id.clone(),
            display_name: payload.display_name.clone(),
            kind: payload.kind.clone(),
            mac_address: payload.mac_address.clone(),
            os_version: payload.os_version.clone(),
            agent_version: payload.agent_version.clone(),
            fleet_tag: key.fleet_tag.clone(),
            admission_state: AdmissionState::Active,
            last_contact_at: Some(now),
            api_key_hash: api_key.hash,
            created_at: existing.as_ref().map(|d| d.created_at).unwrap_or(now),
        };
        tx.upsert_device(&device).await?;

        let mqtt = self.identity.materialize_mqtt_account(&mut tx).await?;
        self.state.ensure_default_desired(&mut tx).await?;

        tx.publish(PlatformEvent::DeviceProvisioned {
            device_id: payload.device_id.clone(),
        });
        tx.commit().await?;

        info!(
            device_id = %payload.device_id,
            rekeyed = existing.is_some(),
            "device provisioned"
        );
        self.store
            .append_audit(&AuditRecord::now(
                AuditKind::DeviceProvisioned,
                AuditSeverity::Info,
                Actor::Device {
                    device_id: payload.device_id.clone(),
                },
                serde_json::json!({
                    "caller_addr": caller_addr,
                    "reprovisioned": existing.is_some(),
                    "provisioning_key_id": key.id,
                }),
            ))
            .await?;

        // The VPN hook runs outside the lock; it only reads identity.
        let vpn = self.vpn.peer_descriptor(&payload.device_id).await?;

        Ok(ProvisionBundle {
            device: BundleDevice {
                device_id: payload.device_id,
                display_name: payload.display_name,
            },
            api: BundleApi {
                endpoint: self.bundle.api_endpoint.clone(),
                api_key: api_key.plaintext,
                tls_ca: self.bundle.tls_ca.clone(),
            },
            mqtt: BundleMqtt {
                broker_url: self.bundle.broker_url.clone(),
                username: mqtt.username,
                password: mqtt.password,
                tls: BundleTls {
                    ca: self.bundle.tls_ca.clone(),
                    verify: self.bundle.tls_verify,
                },
            },
            vpn,
        })
    }

    /// Retire a device: admission state flips, broker account is removed,
    /// and caches are invalidated via the retirement event.
    pub async fn retire(&self, device_id: &str) -> FleetResult<()> {
        let mut tx = self.store.begin_device(device_id).await?;
        let Some(mut device) = tx.get_device().await? else {
            return Err(FleetError::not_found(format!("unknown device '{device_id}'")));
        };
        device.admission_state = AdmissionState::Retired;
        tx.upsert_device(&device).await?;
        tx.delete_mqtt_account(&fbp_core::device_username(device_id)).await?;
        tx.publish(PlatformEvent::DeviceRetired {
            device_id: device_id.to_string(),
        });
        tx.commit().await?;

        self.store
            .append_audit(&AuditRecord::now(
                AuditKind::DeviceRetired,
                AuditSeverity::Info,
                Actor::System,
                serde_json::json!({"device_id": device_id}),
            ))
            .await?;
        info!(device_id, "device retired");
        Ok(())
    }

    async fn audit_crypto_rejected(&self, caller_addr: &str) {
        warn!(caller_addr, "phase-2 payload failed to unwrap");
        let record = AuditRecord::now(
            AuditKind::CryptoRejected,
            AuditSeverity::Alert,
            Actor::System,
            serde_json::json!({"caller_addr": caller_addr, "phase": 2}),
        );
        if let Err(err) = self.store.append_audit(&record).await {
            warn!(error = %err, "crypto-rejection audit write failed");
        }
    }

    async fn audit_admission_denied(&self, device_id: &str, caller_addr: &str, proposed: i64) {
        let record = AuditRecord::now(
            AuditKind::AdmissionDenied,
            AuditSeverity::Warning,
            Actor::Device {
                device_id: device_id.to_string(),
            },
            serde_json::json!({"caller_addr": caller_addr, "proposed_active": proposed}),
        );
        if let Err(err) = self.store.append_audit(&record).await {
            warn!(error = %err, "admission-denial audit write failed");
        }
    }
}

/// Surface conversion: every provisioning credential failure leaves this
/// component as plain `UNAUTHORIZED`.
fn unauthorized(err: FleetError) -> FleetError {
    if err.code == ErrorCode::ProvisioningKeyInvalid {
        FleetError::unauthorized("provisioning token rejected")
    } else {
        err
    }
}
