// SPDX-License-Identifier: MIT OR Apache-2.0
//! Device identity and lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AdmissionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a device with respect to admission control.
///
/// Only `active` devices count against the licensed device limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    /// Known but not yet fully provisioned.
    Pending,
    /// Provisioned and counted against license limits.
    Active,
    /// Explicitly retired by an operator; excluded from admission counts.
    Retired,
}

impl AdmissionState {
    /// Stable string form used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

impl std::fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A registered edge device.
///
/// `device_id` is an opaque, caller-assigned identifier and the primary key
/// for every per-device record in the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable opaque identifier, unique across the deployment.
    pub device_id: String,
    /// Human-friendly display name.
    pub display_name: String,
    /// Free-form classification (e.g. `"gateway"`, `"sensor-node"`).
    pub kind: String,
    /// Hardware address reported at registration.
    pub mac_address: String,
    /// Operating system version reported at registration.
    pub os_version: String,
    /// Agent software version reported at registration.
    pub agent_version: String,
    /// Fleet grouping label inherited from the provisioning key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fleet_tag: Option<String>,
    /// Current admission state.
    pub admission_state: AdmissionState,
    /// Last time the device talked to the platform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_contact_at: Option<DateTime<Utc>>,
    /// Argon2 hash of the device API key. Never serialized outward.
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
    /// When the device record was created.
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Returns `true` when the device counts against license limits.
    pub fn is_active(&self) -> bool {
        self.admission_state == AdmissionState::Active
    }
}

// ---------------------------------------------------------------------------
// DevicePublicKey
// ---------------------------------------------------------------------------

/// The asymmetric public key a device registered during phase 1 of
/// provisioning. Rewritten on re-key; never deleted before the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePublicKey {
    /// Owning device.
    pub device_id: String,
    /// PEM-encoded public key bytes as presented by the device.
    pub public_key_pem: String,
    /// Last write time (initial registration or re-key).
    pub updated_at: DateTime<Utc>,
}
