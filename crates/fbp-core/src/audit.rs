// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who performed the audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    /// A device, identified by its opaque id.
    Device {
        /// Device id.
        device_id: String,
    },
    /// A human operator.
    User {
        /// Operator identifier.
        user_id: String,
    },
    /// The platform itself (startup, background tasks).
    System,
}

/// Classification of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A provisioning attempt was rejected.
    ProvisioningRejected,
    /// A device completed provisioning.
    DeviceProvisioned,
    /// Admission was denied by license limits.
    AdmissionDenied,
    /// A device was retired by an operator.
    DeviceRetired,
    /// License verification succeeded at startup or reload.
    LicenseAccepted,
    /// License verification failed; unlicensed policy installed.
    LicenseRejected,
    /// A cryptographic operation failed on an inbound payload.
    CryptoRejected,
    /// A provisioning key was created or deactivated.
    ProvisioningKeyChanged,
}

impl AuditKind {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProvisioningRejected => "provisioning_rejected",
            Self::DeviceProvisioned => "device_provisioned",
            Self::AdmissionDenied => "admission_denied",
            Self::DeviceRetired => "device_retired",
            Self::LicenseAccepted => "license_accepted",
            Self::LicenseRejected => "license_rejected",
            Self::CryptoRejected => "crypto_rejected",
            Self::ProvisioningKeyChanged => "provisioning_key_changed",
        }
    }
}

/// How alarming the record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Routine lifecycle event.
    Info,
    /// Rejected request; expected under normal abuse levels.
    Warning,
    /// Elevated: repeated crypto failures, invariant violations.
    Alert,
}

impl AuditSeverity {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Alert => "alert",
        }
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// What happened.
    pub kind: AuditKind,
    /// How alarming it is.
    pub severity: AuditSeverity,
    /// Who did it.
    pub actor: Actor,
    /// Structured detail (caller address, device id, reason).
    pub details: serde_json::Value,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Convenience constructor stamped with the current time.
    pub fn now(kind: AuditKind, severity: AuditSeverity, actor: Actor, details: serde_json::Value) -> Self {
        Self {
            kind,
            severity,
            actor,
            details,
            occurred_at: Utc::now(),
        }
    }
}
