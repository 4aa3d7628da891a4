// SPDX-License-Identifier: MIT OR Apache-2.0
//! Device-scoped transactions.

use crate::rows::{
    DevicePublicKeyRow, DeviceRow, JobRow, StateRow, map_sqlx_err,
};
use chrono::{DateTime, Utc};
use fbp_bus::{EventBuffer, EventBus};
use fbp_core::{
    Device, DevicePublicKey, Job, MqttAcl, MqttUser, PlatformEvent, StateKind, StateRecord,
};
use fbp_error::{ErrorCode, FleetError, FleetResult};
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// A transaction holding the advisory lock for one device.
///
/// Every mutation of per-device rows goes through these accessors. Events
/// pushed via [`DeviceTx::publish`] are delivered to the bus only after
/// [`DeviceTx::commit`] succeeds; dropping the transaction rolls back and
/// discards them.
pub struct DeviceTx {
    tx: Transaction<'static, Sqlite>,
    device_id: String,
    events: EventBuffer,
    bus: Arc<EventBus>,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceTx {
    pub(crate) fn new(
        tx: Transaction<'static, Sqlite>,
        device_id: String,
        guard: OwnedMutexGuard<()>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tx,
            device_id,
            events: EventBuffer::new(),
            bus,
            _guard: guard,
        }
    }

    /// The device this transaction is scoped to.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Defer an event until commit.
    pub fn publish(&mut self, event: PlatformEvent) {
        self.events.push(event);
    }

    /// Commit the transaction, release the device lock, and flush deferred
    /// events to the bus in order.
    pub async fn commit(self) -> FleetResult<()> {
        self.tx.commit().await.map_err(map_sqlx_err)?;
        debug!(device_id = %self.device_id, events = self.events.len(), "device tx committed");
        self.events.flush_into(&self.bus);
        Ok(())
    }

    // -- devices ------------------------------------------------------------

    /// Load this device's record, if present.
    pub async fn get_device(&mut self) -> FleetResult<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE device_id = ?")
            .bind(&self.device_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;
        row.map(Device::try_from).transpose()
    }

    /// Insert or fully replace this device's record.
    pub async fn upsert_device(&mut self, device: &Device) -> FleetResult<()> {
        if device.device_id != self.device_id {
            return Err(FleetError::invariant("device row outside transaction scope"));
        }
        sqlx::query(
            r#"
            INSERT INTO devices
                (device_id, display_name, kind, mac_address, os_version, agent_version,
                 fleet_tag, admission_state, last_contact_at, api_key_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                display_name = excluded.display_name,
                kind = excluded.kind,
                mac_address = excluded.mac_address,
                os_version = excluded.os_version,
                agent_version = excluded.agent_version,
                fleet_tag = excluded.fleet_tag,
                admission_state = excluded.admission_state,
                last_contact_at = excluded.last_contact_at,
                api_key_hash = excluded.api_key_hash
            "#,
        )
        .bind(&device.device_id)
        .bind(&device.display_name)
        .bind(&device.kind)
        .bind(&device.mac_address)
        .bind(&device.os_version)
        .bind(&device.agent_version)
        .bind(&device.fleet_tag)
        .bind(device.admission_state.as_str())
        .bind(device.last_contact_at)
        .bind(&device.api_key_hash)
        .bind(device.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Bump the device's last-contact timestamp.
    pub async fn touch_last_contact(&mut self, now: DateTime<Utc>) -> FleetResult<()> {
        sqlx::query("UPDATE devices SET last_contact_at = ? WHERE device_id = ?")
            .bind(now)
            .bind(&self.device_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Count devices in `active` admission state, inside this transaction.
    pub async fn count_active_devices(&mut self) -> FleetResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM devices WHERE admission_state = 'active'")
                .fetch_one(&mut *self.tx)
                .await
                .map_err(map_sqlx_err)?;
        Ok(count)
    }

    // -- device public keys --------------------------------------------------

    /// Load the device's registered public key, if any.
    pub async fn get_public_key(&mut self) -> FleetResult<Option<DevicePublicKey>> {
        let row = sqlx::query_as::<_, DevicePublicKeyRow>(
            "SELECT * FROM device_public_keys WHERE device_id = ?",
        )
        .bind(&self.device_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.map(DevicePublicKey::from))
    }

    /// Write (or re-key) the device's public key.
    pub async fn upsert_public_key(&mut self, pem: &str, now: DateTime<Utc>) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_public_keys (device_id, public_key_pem, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                public_key_pem = excluded.public_key_pem,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.device_id)
        .bind(pem)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    // -- provisioning keys ----------------------------------------------------

    /// Consume one use of a provisioning key, re-checking usability in the
    /// same statement so concurrent consumers cannot push `uses` past
    /// `max_uses`.
    pub async fn consume_provisioning_key(
        &mut self,
        key_id: i64,
        now: DateTime<Utc>,
    ) -> FleetResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE provisioning_keys
            SET uses = uses + 1
            WHERE id = ?
              AND active = 1
              AND (expires_at IS NULL OR expires_at > ?)
              AND (max_uses IS NULL OR uses < max_uses)
            "#,
        )
        .bind(key_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(FleetError::new(
                ErrorCode::ProvisioningKeyInvalid,
                "provisioning key is no longer usable",
            ))
        }
    }

    // -- mqtt credentials -----------------------------------------------------

    /// Replace the device's broker account and ACL set in one shot.
    ///
    /// Old rows are deleted first; an old password hash is never reused.
    pub async fn replace_mqtt_account(
        &mut self,
        user: &MqttUser,
        acls: &[MqttAcl],
    ) -> FleetResult<()> {
        self.delete_mqtt_account(&user.username).await?;

        sqlx::query(
            "INSERT INTO mqtt_users (username, password_hash, active, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.active)
        .bind(user.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;

        for acl in acls {
            sqlx::query(
                "INSERT INTO mqtt_acls (username, topic_pattern, permissions) VALUES (?, ?, ?)",
            )
            .bind(&acl.username)
            .bind(&acl.topic_pattern)
            .bind(acl.permissions.as_acc())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    /// Remove a broker account and its ACL rows.
    pub async fn delete_mqtt_account(&mut self, username: &str) -> FleetResult<()> {
        sqlx::query("DELETE FROM mqtt_acls WHERE username = ?")
            .bind(username)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;
        sqlx::query("DELETE FROM mqtt_users WHERE username = ?")
            .bind(username)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    // -- state records --------------------------------------------------------

    /// Load one of the device's state records.
    pub async fn get_state(&mut self, kind: StateKind) -> FleetResult<Option<StateRecord>> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT device_id, apps, config, version, content_hash, updated_at
             FROM device_states WHERE device_id = ? AND kind = ?",
        )
        .bind(&self.device_id)
        .bind(kind.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;
        row.map(StateRecord::try_from).transpose()
    }

    /// Insert or replace one of the device's state records.
    pub async fn replace_state(&mut self, kind: StateKind, record: &StateRecord) -> FleetResult<()> {
        if record.device_id != self.device_id {
            return Err(FleetError::invariant("state row outside transaction scope"));
        }
        sqlx::query(
            r#"
            INSERT INTO device_states (device_id, kind, apps, config, version, content_hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id, kind) DO UPDATE SET
                apps = excluded.apps,
                config = excluded.config,
                version = excluded.version,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.device_id)
        .bind(kind.as_str())
        .bind(record.apps.to_string())
        .bind(record.config.to_string())
        .bind(record.version)
        .bind(&record.content_hash)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    // -- jobs -----------------------------------------------------------------

    /// Load a job owned by this device.
    pub async fn get_job(&mut self, job_id: uuid::Uuid) -> FleetResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ? AND device_id = ?")
            .bind(job_id.to_string())
            .bind(&self.device_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;
        row.map(Job::try_from).transpose()
    }

    /// Insert a freshly enqueued job.
    pub async fn insert_job(&mut self, job: &Job) -> FleetResult<()> {
        if job.device_id != self.device_id {
            return Err(FleetError::invariant("job row outside transaction scope"));
        }
        sqlx::query(
            r#"
            INSERT INTO jobs (id, device_id, kind, status, payload, result,
                              created_at, dispatched_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.device_id)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.payload.to_string())
        .bind(job.result.as_ref().map(|r| r.to_string()))
        .bind(job.created_at)
        .bind(job.dispatched_at)
        .bind(job.finished_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Persist a job's status, result, and timestamps.
    pub async fn update_job(&mut self, job: &Job) -> FleetResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, result = ?, dispatched_at = ?, finished_at = ?
            WHERE id = ? AND device_id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.result.as_ref().map(|r| r.to_string()))
        .bind(job.dispatched_at)
        .bind(job.finished_at)
        .bind(job.id.to_string())
        .bind(&job.device_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}
