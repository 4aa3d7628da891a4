// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provisioning keys, MQTT accounts, and topic ACL records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ProvisioningKey
// ---------------------------------------------------------------------------

/// A bearer credential that authorizes device enrollment.
///
/// The plaintext is visible exactly once, at creation; only a one-way hash
/// is stored. A key is usable iff it is active, unexpired, and has uses
/// remaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningKey {
    /// Registry identifier.
    pub id: i64,
    /// One-way hash of the plaintext token. Never serialized outward.
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    /// Optional grouping label for fleets of devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fleet_tag: Option<String>,
    /// Maximum number of successful uses; `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<i64>,
    /// Successful uses so far. Monotonically increasing.
    pub uses: i64,
    /// Whether the key is administratively enabled.
    pub active: bool,
    /// Optional expiry instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ProvisioningKey {
    /// Returns `true` when the key may authorize a provisioning attempt at
    /// `now`: active, unexpired, and with uses remaining.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return false;
            }
        }
        match self.max_uses {
            Some(max) => self.uses < max,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// A single topic operation, as evaluated by the broker auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOp {
    /// Subscribe / receive.
    Read,
    /// Publish.
    Write,
}

/// The permission set attached to one ACL record.
///
/// The wire encoding used by Mosquitto-compatible brokers is an integer:
/// `1 = read`, `2 = write`, `3 = read+write`. Internally the model is a
/// pair of flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    /// Subscribe / receive allowed.
    pub read: bool,
    /// Publish allowed.
    pub write: bool,
}

impl Permissions {
    /// Read-only permission set.
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    /// Write-only permission set.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    /// Read and write.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    /// Decode the broker wire encoding (`1`/`2`/`3`).
    pub fn from_acc(acc: i64) -> Option<Self> {
        match acc {
            1 => Some(Self::READ),
            2 => Some(Self::WRITE),
            3 => Some(Self::READ_WRITE),
            _ => None,
        }
    }

    /// Encode to the broker wire encoding (`1`/`2`/`3`), or `0` when empty.
    pub fn as_acc(&self) -> i64 {
        (self.read as i64) | ((self.write as i64) << 1)
    }

    /// Returns `true` when this set covers the given operation.
    pub fn allows(&self, op: AccessOp) -> bool {
        match op {
            AccessOp::Read => self.read,
            AccessOp::Write => self.write,
        }
    }
}

// ---------------------------------------------------------------------------
// MqttUser / MqttAcl
// ---------------------------------------------------------------------------

/// A broker account. Device accounts use the canonical
/// `device-<device_id>` username; everything else is a service account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttUser {
    /// Unique username.
    pub username: String,
    /// Salted slow hash of the password. Never serialized outward.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// Whether the account may authenticate.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// An access-control record binding a username and topic pattern to a
/// permission set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttAcl {
    /// Account this record applies to.
    pub username: String,
    /// Topic pattern with `+`/`#` wildcards (see [`crate::topic`]).
    pub topic_pattern: String,
    /// Operations granted on matching topics.
    pub permissions: Permissions,
}
