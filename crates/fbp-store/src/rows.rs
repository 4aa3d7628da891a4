// SPDX-License-Identifier: MIT OR Apache-2.0
//! Row shapes and conversions between SQL rows and domain types.

use chrono::{DateTime, Utc};
use fbp_core::{
    AdmissionState, AuditRecord, Device, DevicePublicKey, DeviceSelector, Job, JobKind, JobStatus,
    MqttAcl, MqttUser, Permissions, ProvisioningKey, ScheduledJob, StateRecord,
};
use fbp_error::{ErrorCode, FleetError};
use sqlx::FromRow;
use uuid::Uuid;

/// Map a sqlx error into the backplane taxonomy.
///
/// Busy/locked conditions become `RETRYABLE_STORAGE`; missing rows become
/// `NOT_FOUND`; everything else is `INTERNAL` with the cause attached.
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> FleetError {
    match &err {
        sqlx::Error::RowNotFound => FleetError::not_found("row not found"),
        sqlx::Error::PoolTimedOut => {
            FleetError::retryable_storage("connection pool exhausted").with_source(err)
        }
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            if message.contains("locked") || message.contains("busy") {
                FleetError::retryable_storage("database busy").with_source(err)
            } else if message.contains("unique constraint") {
                FleetError::retryable_storage("write conflict").with_source(err)
            } else {
                FleetError::internal("database failure").with_source(err)
            }
        }
        _ => FleetError::internal("database failure").with_source(err),
    }
}

/// Decode a JSON TEXT column, surfacing garbage as an invariant violation.
pub(crate) fn decode_json(column: &str, raw: &str) -> Result<serde_json::Value, FleetError> {
    serde_json::from_str(raw).map_err(|e| {
        FleetError::invariant(format!("column {column} holds malformed JSON")).with_source(e)
    })
}

fn invariant(what: impl Into<String>) -> FleetError {
    FleetError::new(ErrorCode::InvariantViolation, what)
}

// ---------------------------------------------------------------------------
// devices
// ---------------------------------------------------------------------------

#[derive(FromRow)]
pub(crate) struct DeviceRow {
    pub device_id: String,
    pub display_name: String,
    pub kind: String,
    pub mac_address: String,
    pub os_version: String,
    pub agent_version: String,
    pub fleet_tag: Option<String>,
    pub admission_state: String,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub api_key_hash: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = FleetError;

    fn try_from(row: DeviceRow) -> Result<Self, FleetError> {
        let admission_state = AdmissionState::parse(&row.admission_state)
            .ok_or_else(|| invariant(format!("unknown admission_state '{}'", row.admission_state)))?;
        Ok(Device {
            device_id: row.device_id,
            display_name: row.display_name,
            kind: row.kind,
            mac_address: row.mac_address,
            os_version: row.os_version,
            agent_version: row.agent_version,
            fleet_tag: row.fleet_tag,
            admission_state,
            last_contact_at: row.last_contact_at,
            api_key_hash: row.api_key_hash,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct DevicePublicKeyRow {
    pub device_id: String,
    pub public_key_pem: String,
    pub updated_at: DateTime<Utc>,
}

impl From<DevicePublicKeyRow> for DevicePublicKey {
    fn from(row: DevicePublicKeyRow) -> Self {
        DevicePublicKey {
            device_id: row.device_id,
            public_key_pem: row.public_key_pem,
            updated_at: row.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// provisioning_keys
// ---------------------------------------------------------------------------

#[derive(FromRow)]
pub(crate) struct ProvisioningKeyRow {
    pub id: i64,
    pub key_hash: String,
    pub fleet_tag: Option<String>,
    pub max_uses: Option<i64>,
    pub uses: i64,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ProvisioningKeyRow> for ProvisioningKey {
    fn from(row: ProvisioningKeyRow) -> Self {
        ProvisioningKey {
            id: row.id,
            key_hash: row.key_hash,
            fleet_tag: row.fleet_tag,
            max_uses: row.max_uses,
            uses: row.uses,
            active: row.active,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// device_states
// ---------------------------------------------------------------------------

#[derive(FromRow)]
pub(crate) struct StateRow {
    pub device_id: String,
    pub apps: String,
    pub config: String,
    pub version: i64,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<StateRow> for StateRecord {
    type Error = FleetError;

    fn try_from(row: StateRow) -> Result<Self, FleetError> {
        Ok(StateRecord {
            apps: decode_json("device_states.apps", &row.apps)?,
            config: decode_json("device_states.config", &row.config)?,
            device_id: row.device_id,
            version: row.version,
            content_hash: row.content_hash,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// mqtt_users / mqtt_acls
// ---------------------------------------------------------------------------

#[derive(FromRow)]
pub(crate) struct MqttUserRow {
    pub username: String,
    pub password_hash: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<MqttUserRow> for MqttUser {
    fn from(row: MqttUserRow) -> Self {
        MqttUser {
            username: row.username,
            password_hash: row.password_hash,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct MqttAclRow {
    pub username: String,
    pub topic_pattern: String,
    pub permissions: i64,
}

impl TryFrom<MqttAclRow> for MqttAcl {
    type Error = FleetError;

    fn try_from(row: MqttAclRow) -> Result<Self, FleetError> {
        let permissions = Permissions::from_acc(row.permissions)
            .ok_or_else(|| invariant(format!("acl permissions out of range: {}", row.permissions)))?;
        Ok(MqttAcl {
            username: row.username,
            topic_pattern: row.topic_pattern,
            permissions,
        })
    }
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

#[derive(FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub device_id: String,
    pub kind: String,
    pub status: String,
    pub payload: String,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = FleetError;

    fn try_from(row: JobRow) -> Result<Self, FleetError> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|_| invariant(format!("job id is not a uuid: '{}'", row.id)))?;
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| invariant(format!("unknown job kind '{}'", row.kind)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| invariant(format!("unknown job status '{}'", row.status)))?;
        let result = match row.result {
            Some(ref raw) => Some(decode_json("jobs.result", raw)?),
            None => None,
        };
        Ok(Job {
            payload: decode_json("jobs.payload", &row.payload)?,
            id,
            device_id: row.device_id,
            kind,
            status,
            result,
            created_at: row.created_at,
            dispatched_at: row.dispatched_at,
            finished_at: row.finished_at,
        })
    }
}

// ---------------------------------------------------------------------------
// scheduled_jobs
// ---------------------------------------------------------------------------

#[derive(FromRow)]
pub(crate) struct ScheduledJobRow {
    pub id: String,
    pub device_selector: String,
    pub kind: String,
    pub payload: String,
    pub cron_expression: String,
    pub next_fire_at: DateTime<Utc>,
    pub active: bool,
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = FleetError;

    fn try_from(row: ScheduledJobRow) -> Result<Self, FleetError> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|_| invariant(format!("scheduled job id is not a uuid: '{}'", row.id)))?;
        let device_selector: DeviceSelector = serde_json::from_str(&row.device_selector)
            .map_err(|e| invariant("scheduled job selector is malformed").with_source(e))?;
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| invariant(format!("unknown job kind '{}'", row.kind)))?;
        Ok(ScheduledJob {
            payload: decode_json("scheduled_jobs.payload", &row.payload)?,
            id,
            device_selector,
            kind,
            cron_expression: row.cron_expression,
            next_fire_at: row.next_fire_at,
            active: row.active,
        })
    }
}

// ---------------------------------------------------------------------------
// audit_records
// ---------------------------------------------------------------------------

pub(crate) fn audit_to_columns(record: &AuditRecord) -> (String, String, String, String) {
    (
        record.kind.as_str().to_string(),
        record.severity.as_str().to_string(),
        serde_json::to_string(&record.actor).unwrap_or_else(|_| "{\"type\":\"system\"}".into()),
        record.details.to_string(),
    )
}
