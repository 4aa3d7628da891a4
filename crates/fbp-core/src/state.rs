// SPDX-License-Identifier: MIT OR Apache-2.0
//! Desired and reported state records.
//!
//! The two records share one shape and one set of operations, but their
//! version counters advance in independent sequences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which of the two mirrored state records a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// The configuration the device should converge to.
    Desired,
    /// What the device last said it is running.
    Reported,
}

impl StateKind {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desired => "desired",
            Self::Reported => "reported",
        }
    }
}

/// One versioned state record for a device.
///
/// `version` starts at 1 and strictly increases on every content change;
/// `content_hash` is the SHA-256 of the canonical serialization of
/// `apps` and `config` and doubles as an ETag for pull-based sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Owning device.
    pub device_id: String,
    /// Applications keyed by application identifier.
    pub apps: serde_json::Value,
    /// Free-form configuration object.
    pub config: serde_json::Value,
    /// Monotonic version, starting at 1.
    pub version: i64,
    /// 64-hex-char content hash of the canonical `apps`/`config` form.
    pub content_hash: String,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// The `(version, hash)` pair agents poll against.
    pub fn etag(&self) -> (i64, &str) {
        (self.version, &self.content_hash)
    }
}
