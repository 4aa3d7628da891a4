// SPDX-License-Identifier: MIT OR Apache-2.0
//! Platform event vocabulary.
//!
//! Events are published on the in-process bus after the originating
//! transaction commits; all facts they describe are also persisted, so
//! delivery is at-most-once and subscribers needing durability keep their
//! own queues.

use crate::JobStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A committed fact broadcast to in-process subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlatformEvent {
    /// A device completed phase-2 provisioning (fresh or re-provisioned).
    DeviceProvisioned {
        /// Provisioned device.
        device_id: String,
    },
    /// A device was retired by an operator.
    DeviceRetired {
        /// Retired device.
        device_id: String,
    },
    /// The desired state record advanced to a new version.
    DesiredStateChanged {
        /// Owning device.
        device_id: String,
        /// New version.
        version: i64,
        /// New content hash.
        hash: String,
    },
    /// The reported state record advanced to a new version.
    ReportedStateChanged {
        /// Owning device.
        device_id: String,
        /// New version.
        version: i64,
        /// New content hash.
        hash: String,
    },
    /// A job was inserted in `pending` status.
    JobEnqueued {
        /// Target device.
        device_id: String,
        /// Job identifier.
        job_id: Uuid,
    },
    /// A job reached a terminal status.
    JobFinished {
        /// Target device.
        device_id: String,
        /// Job identifier.
        job_id: Uuid,
        /// Terminal status.
        status: JobStatus,
    },
    /// The ACL set for an account changed outside of provisioning.
    AclChanged {
        /// Affected account.
        username: String,
    },
    /// The license authority installed a new claim snapshot.
    LicenseReloaded,
}

impl PlatformEvent {
    /// The device this event concerns, if it is device-scoped.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceProvisioned { device_id }
            | Self::DeviceRetired { device_id }
            | Self::DesiredStateChanged { device_id, .. }
            | Self::ReportedStateChanged { device_id, .. }
            | Self::JobEnqueued { device_id, .. }
            | Self::JobFinished { device_id, .. } => Some(device_id),
            Self::AclChanged { .. } | Self::LicenseReloaded => None,
        }
    }
}
