// SPDX-License-Identifier: MIT OR Apache-2.0
//! Domain model for the fleet backplane.
//!
//! This crate defines the entities shared by every backplane subsystem
//! (devices, credentials, desired/reported state, jobs, license claims,
//! audit records) together with the platform event vocabulary and the
//! MQTT topic grammar used for ACL evaluation.
//!
//! It is intentionally free of I/O: persistence lives in `fbp-store`,
//! crypto in `fbp-crypto`, and transport in `fbp-daemon`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod audit;
mod credential;
mod device;
mod event;
mod job;
mod license;
mod state;
pub mod topic;

pub use audit::{Actor, AuditKind, AuditRecord, AuditSeverity};
pub use credential::{AccessOp, MqttAcl, MqttUser, Permissions, ProvisioningKey};
pub use device::{AdmissionState, Device, DevicePublicKey};
pub use event::PlatformEvent;
pub use job::{DeviceSelector, Job, JobKind, JobStatus, ScheduledJob};
pub use license::{LicenseClaims, UNLICENSED_TRIAL_DAYS};
pub use state::{StateKind, StateRecord};

/// Canonical MQTT username for a device account.
///
/// Usernames outside this form are reserved for service accounts.
pub fn device_username(device_id: &str) -> String {
    format!("device-{device_id}")
}

/// Inverse of [`device_username`]: extracts the device id from a device
/// account username, or `None` for service accounts.
pub fn device_id_from_username(username: &str) -> Option<&str> {
    username.strip_prefix("device-").filter(|s| !s.is_empty())
}
