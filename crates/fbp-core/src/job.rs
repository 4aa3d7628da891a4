// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job records, the job status state machine, and scheduled-job templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Job`].
///
/// Transitions are validated server-side; see [`JobStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet delivered to the device.
    Pending,
    /// Delivery notification published to the device.
    Dispatched,
    /// The device reported it is executing the job.
    Running,
    /// Terminal: completed successfully.
    Succeeded,
    /// Terminal: failed on the device or timed out during dispatch.
    Failed,
    /// Terminal: canceled before the device started executing.
    Canceled,
}

impl JobStatus {
    /// Returns `true` if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Dispatched, Self::Canceled],
            Self::Dispatched => &[Self::Running, Self::Failed, Self::Canceled],
            Self::Running => &[Self::Succeeded, Self::Failed],
            Self::Succeeded | Self::Failed | Self::Canceled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "dispatched" => Some(Self::Dispatched),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// What the device is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Restart the agent or a managed application.
    Restart,
    /// Apply a software update.
    Update,
    /// Execute an arbitrary command described by the payload.
    RunCommand,
}

impl JobKind {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Update => "update",
            Self::RunCommand => "run_command",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restart" => Some(Self::Restart),
            "update" => Some(Self::Update),
            "run_command" => Some(Self::RunCommand),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work dispatched to one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,
    /// Target device.
    pub device_id: String,
    /// What to do.
    pub kind: JobKind,
    /// Current status.
    pub status: JobStatus,
    /// Opaque parameters forwarded to the device.
    pub payload: serde_json::Value,
    /// Device-reported result, present once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the dispatch notification was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    /// When a terminal status was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ScheduledJob
// ---------------------------------------------------------------------------

/// Which devices a [`ScheduledJob`] template fans out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceSelector {
    /// One specific device.
    Device {
        /// Target device id.
        device_id: String,
    },
    /// Every active device provisioned under the given fleet tag.
    FleetTag {
        /// Fleet grouping label.
        fleet_tag: String,
    },
    /// Every active device.
    All,
}

/// A cron-driven template that produces [`Job`] instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Template identifier.
    pub id: Uuid,
    /// Which devices to target when firing.
    pub device_selector: DeviceSelector,
    /// Job kind for produced instances.
    pub kind: JobKind,
    /// Payload for produced instances.
    pub payload: serde_json::Value,
    /// Standard cron expression governing the firing schedule.
    pub cron_expression: String,
    /// Next instant at which this template fires.
    pub next_fire_at: DateTime<Utc>,
    /// Whether the template currently fires.
    pub active: bool,
}
