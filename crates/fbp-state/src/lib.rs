// SPDX-License-Identifier: MIT OR Apache-2.0
//! The desired/reported state engine.
//!
//! Two mirrored records per device with identical operations and
//! independent version sequences. Writes are content-addressed: a set
//! whose canonical hash equals the stored hash is a no-op and returns the
//! existing `(version, hash)` unchanged; otherwise the version advances by
//! exactly one and a change event is published after commit.
//!
//! The engine stores and surfaces state; it never executes convergence on
//! the device. Agents poll `(version, hash)` ETag-style.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use fbp_core::{PlatformEvent, StateKind, StateRecord};
use fbp_error::{FleetError, FleetResult};
use fbp_store::{DeviceTx, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// The `(version, hash)` pair agents synchronise against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    /// Monotonic version, starting at 1.
    pub version: i64,
    /// 64-hex-char canonical content hash.
    pub hash: String,
}

/// Optional device-reported system facts attached to a reported-state
/// update. They refresh device metadata, not the state record itself.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SystemInfo {
    /// Agent software version currently running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    /// Operating system version currently running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

/// Stores desired and reported state per device.
#[derive(Clone)]
pub struct StateEngine {
    store: Store,
    template_apps: Value,
    template_config: Value,
}

impl StateEngine {
    /// Create the engine with the configured default desired-state
    /// template.
    pub fn new(store: Store, template_apps: Value, template_config: Value) -> Self {
        Self {
            store,
            template_apps,
            template_config,
        }
    }

    // -- writes ---------------------------------------------------------------

    /// Set the desired state for a device.
    pub async fn set_desired(
        &self,
        device_id: &str,
        apps: Value,
        config: Value,
    ) -> FleetResult<StateVersion> {
        let mut tx = self.store.begin_device(device_id).await?;
        let result = Self::write_state(&mut tx, StateKind::Desired, apps, config).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Set the reported state for a device, refreshing last-contact and any
    /// supplied system facts.
    pub async fn set_reported(
        &self,
        device_id: &str,
        apps: Value,
        config: Value,
        system_info: Option<SystemInfo>,
    ) -> FleetResult<StateVersion> {
        let mut tx = self.store.begin_device(device_id).await?;
        let result = Self::write_state(&mut tx, StateKind::Reported, apps, config).await?;

        tx.touch_last_contact(Utc::now()).await?;
        if let Some(info) = system_info {
            if let Some(mut device) = tx.get_device().await? {
                if let Some(agent_version) = info.agent_version {
                    device.agent_version = agent_version;
                }
                if let Some(os_version) = info.os_version {
                    device.os_version = os_version;
                }
                tx.upsert_device(&device).await?;
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Shared write path: content-addressed, monotonic, event on change.
    async fn write_state(
        tx: &mut DeviceTx,
        kind: StateKind,
        apps: Value,
        config: Value,
    ) -> FleetResult<StateVersion> {
        if !apps.is_object() || !config.is_object() {
            return Err(FleetError::bad_request("apps and config must be JSON objects"));
        }

        let hash = fbp_crypto::hash_state(&apps, &config);
        let existing = tx.get_state(kind).await?;

        if let Some(ref record) = existing {
            if record.content_hash == hash {
                debug!(device_id = tx.device_id(), kind = kind.as_str(), version = record.version,
                       "state unchanged");
                return Ok(StateVersion {
                    version: record.version,
                    hash,
                });
            }
        }

        let version = existing.map(|r| r.version + 1).unwrap_or(1);
        let record = StateRecord {
            device_id: tx.device_id().to_string(),
            apps,
            config,
            version,
            content_hash: hash.clone(),
            updated_at: Utc::now(),
        };
        tx.replace_state(kind, &record).await?;

        let device_id = tx.device_id().to_string();
        tx.publish(match kind {
            StateKind::Desired => PlatformEvent::DesiredStateChanged {
                device_id,
                version,
                hash: hash.clone(),
            },
            StateKind::Reported => PlatformEvent::ReportedStateChanged {
                device_id,
                version,
                hash: hash.clone(),
            },
        });

        Ok(StateVersion { version, hash })
    }

    /// Create the default desired state at version 1 inside an existing
    /// provisioning transaction, unless a record already exists.
    pub async fn ensure_default_desired(&self, tx: &mut DeviceTx) -> FleetResult<StateVersion> {
        if let Some(existing) = tx.get_state(StateKind::Desired).await? {
            return Ok(StateVersion {
                version: existing.version,
                hash: existing.content_hash,
            });
        }

        let (apps, config) = self.default_template_for(tx.device_id());
        let hash = fbp_crypto::hash_state(&apps, &config);
        let record = StateRecord {
            device_id: tx.device_id().to_string(),
            apps,
            config,
            version: 1,
            content_hash: hash.clone(),
            updated_at: Utc::now(),
        };
        tx.replace_state(StateKind::Desired, &record).await?;
        tx.publish(PlatformEvent::DesiredStateChanged {
            device_id: tx.device_id().to_string(),
            version: 1,
            hash: hash.clone(),
        });
        Ok(StateVersion { version: 1, hash })
    }

    // -- reads ----------------------------------------------------------------

    /// Read-only snapshot of the desired state.
    pub async fn get_desired(&self, device_id: &str) -> FleetResult<Option<StateRecord>> {
        self.store.get_state(device_id, StateKind::Desired).await
    }

    /// Read-only snapshot of the reported state.
    pub async fn get_reported(&self, device_id: &str) -> FleetResult<Option<StateRecord>> {
        self.store.get_state(device_id, StateKind::Reported).await
    }

    /// Resolve the default template for one device, substituting the
    /// `{{device_id}}` placeholder in every string value.
    pub fn default_template_for(&self, device_id: &str) -> (Value, Value) {
        (
            substitute(&self.template_apps, device_id),
            substitute(&self.template_config, device_id),
        )
    }
}

/// Recursively substitute `{{device_id}}` in string values (and nothing
/// else; keys are left untouched).
fn substitute(template: &Value, device_id: &str) -> Value {
    match template {
        Value::String(s) => Value::String(s.replace("{{device_id}}", device_id)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, device_id)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, device_id)))
                .collect(),
        ),
        other => other.clone(),
    }
}
