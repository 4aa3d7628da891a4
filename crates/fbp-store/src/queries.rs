// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pool-level typed accessors (reads and non-device-scoped writes).

use crate::rows::{
    DeviceRow, JobRow, MqttAclRow, MqttUserRow, ProvisioningKeyRow, ScheduledJobRow, StateRow,
    audit_to_columns, map_sqlx_err,
};
use crate::Store;
use chrono::{DateTime, Utc};
use fbp_core::{
    AuditRecord, Device, Job, MqttAcl, MqttUser, ProvisioningKey, ScheduledJob, StateKind,
    StateRecord,
};
use fbp_error::{FleetError, FleetResult};
use uuid::Uuid;

impl Store {
    // -- devices --------------------------------------------------------------

    /// Read-only snapshot of one device.
    pub async fn get_device(&self, device_id: &str) -> FleetResult<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        row.map(Device::try_from).transpose()
    }

    /// All devices, newest first.
    pub async fn list_devices(&self) -> FleetResult<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT * FROM devices ORDER BY created_at DESC, device_id",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(Device::try_from).collect()
    }

    /// Number of devices counted against the license limit.
    pub async fn count_active_devices(&self) -> FleetResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM devices WHERE admission_state = 'active'")
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_err)?;
        Ok(count)
    }

    /// Active device ids, optionally restricted to a fleet tag.
    pub async fn list_active_device_ids(&self, fleet_tag: Option<&str>) -> FleetResult<Vec<String>> {
        let rows: Vec<(String,)> = match fleet_tag {
            Some(tag) => sqlx::query_as(
                "SELECT device_id FROM devices
                 WHERE admission_state = 'active' AND fleet_tag = ? ORDER BY device_id",
            )
            .bind(tag)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?,
            None => sqlx::query_as(
                "SELECT device_id FROM devices WHERE admission_state = 'active' ORDER BY device_id",
            )
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?,
        };
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // -- provisioning keys ----------------------------------------------------

    /// Register a new provisioning key hash. Returns the stored record.
    pub async fn create_provisioning_key(
        &self,
        key_hash: &str,
        fleet_tag: Option<&str>,
        max_uses: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> FleetResult<ProvisioningKey> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO provisioning_keys (key_hash, fleet_tag, max_uses, uses, active, expires_at, created_at)
            VALUES (?, ?, ?, 0, 1, ?, ?)
            "#,
        )
        .bind(key_hash)
        .bind(fleet_tag)
        .bind(max_uses)
        .bind(expires_at)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(ProvisioningKey {
            id: result.last_insert_rowid(),
            key_hash: key_hash.to_string(),
            fleet_tag: fleet_tag.map(String::from),
            max_uses,
            uses: 0,
            active: true,
            expires_at,
            created_at: now,
        })
    }

    /// Every registered provisioning key, newest first.
    pub async fn list_provisioning_keys(&self) -> FleetResult<Vec<ProvisioningKey>> {
        let rows = sqlx::query_as::<_, ProvisioningKeyRow>(
            "SELECT * FROM provisioning_keys ORDER BY id DESC",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(ProvisioningKey::from).collect())
    }

    /// Active keys a presented token could match, bounded by fleet tag when
    /// the caller knows it.
    pub async fn candidate_provisioning_keys(
        &self,
        fleet_tag: Option<&str>,
    ) -> FleetResult<Vec<ProvisioningKey>> {
        let rows = match fleet_tag {
            Some(tag) => sqlx::query_as::<_, ProvisioningKeyRow>(
                "SELECT * FROM provisioning_keys WHERE active = 1 AND fleet_tag = ?",
            )
            .bind(tag)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?,
            None => sqlx::query_as::<_, ProvisioningKeyRow>(
                "SELECT * FROM provisioning_keys WHERE active = 1",
            )
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?,
        };
        Ok(rows.into_iter().map(ProvisioningKey::from).collect())
    }

    /// Enable or disable a provisioning key. Returns `false` when the id is
    /// unknown.
    pub async fn set_provisioning_key_active(&self, id: i64, active: bool) -> FleetResult<bool> {
        let result = sqlx::query("UPDATE provisioning_keys SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() == 1)
    }

    // -- broker accounts ------------------------------------------------------

    /// Look up a broker account by username.
    pub async fn get_mqtt_user(&self, username: &str) -> FleetResult<Option<MqttUser>> {
        let row = sqlx::query_as::<_, MqttUserRow>("SELECT * FROM mqtt_users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.map(MqttUser::from))
    }

    /// The ACL set for one account.
    pub async fn list_acls(&self, username: &str) -> FleetResult<Vec<MqttAcl>> {
        let rows = sqlx::query_as::<_, MqttAclRow>(
            "SELECT * FROM mqtt_acls WHERE username = ? ORDER BY topic_pattern",
        )
        .bind(username)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(MqttAcl::try_from).collect()
    }

    // -- state records --------------------------------------------------------

    /// Read-only snapshot of one state record.
    pub async fn get_state(
        &self,
        device_id: &str,
        kind: StateKind,
    ) -> FleetResult<Option<StateRecord>> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT device_id, apps, config, version, content_hash, updated_at
             FROM device_states WHERE device_id = ? AND kind = ?",
        )
        .bind(device_id)
        .bind(kind.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(StateRecord::try_from).transpose()
    }

    // -- jobs -----------------------------------------------------------------

    /// Look up a job by id, regardless of owner.
    pub async fn get_job(&self, job_id: Uuid) -> FleetResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        row.map(Job::try_from).transpose()
    }

    /// A device's jobs, newest first.
    pub async fn list_jobs(&self, device_id: &str, limit: i64) -> FleetResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE device_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Jobs awaiting dispatch for one device, oldest first.
    pub async fn pending_jobs(&self, device_id: &str) -> FleetResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE device_id = ? AND status = 'pending' ORDER BY created_at",
        )
        .bind(device_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Jobs stuck in `dispatched` since before `cutoff` (dispatch timeout).
    pub async fn stale_dispatched_jobs(&self, cutoff: DateTime<Utc>) -> FleetResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs
             WHERE status = 'dispatched' AND dispatched_at IS NOT NULL AND dispatched_at < ?
             ORDER BY dispatched_at",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Delete terminal jobs finished before `cutoff`. Returns rows removed.
    pub async fn delete_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> FleetResult<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs
             WHERE status IN ('succeeded', 'failed', 'canceled')
               AND finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    // -- scheduled jobs -------------------------------------------------------

    /// Insert a scheduled-job template.
    pub async fn insert_scheduled_job(&self, template: &ScheduledJob) -> FleetResult<()> {
        let selector = serde_json::to_string(&template.device_selector)
            .map_err(|e| FleetError::internal("selector serialization failed").with_source(e))?;
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (id, device_selector, kind, payload, cron_expression, next_fire_at, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template.id.to_string())
        .bind(selector)
        .bind(template.kind.as_str())
        .bind(template.payload.to_string())
        .bind(&template.cron_expression)
        .bind(template.next_fire_at)
        .bind(template.active)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Every template, due-first.
    pub async fn list_scheduled_jobs(&self) -> FleetResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs ORDER BY next_fire_at",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    /// Active templates whose `next_fire_at` has passed.
    pub async fn due_scheduled_jobs(&self, now: DateTime<Utc>) -> FleetResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs WHERE active = 1 AND next_fire_at <= ? ORDER BY next_fire_at",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    /// Advance a template's next firing instant.
    pub async fn set_scheduled_job_next_fire(
        &self,
        id: Uuid,
        next_fire_at: DateTime<Utc>,
    ) -> FleetResult<()> {
        sqlx::query("UPDATE scheduled_jobs SET next_fire_at = ? WHERE id = ?")
            .bind(next_fire_at)
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    // -- audit ----------------------------------------------------------------

    /// Append one audit record.
    ///
    /// Every persisted record is also mirrored once to the dedicated
    /// `audit` tracing target, so operators can ship the audit stream
    /// independently of application logs.
    pub async fn append_audit(&self, record: &AuditRecord) -> FleetResult<()> {
        let (kind, severity, actor, details) = audit_to_columns(record);
        sqlx::query(
            "INSERT INTO audit_records (kind, severity, actor, details, occurred_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&kind)
        .bind(&severity)
        .bind(&actor)
        .bind(&details)
        .bind(record.occurred_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        tracing::info!(
            target: "audit",
            kind = %kind,
            severity = %severity,
            actor = %actor,
            details = %details,
            occurred_at = %record.occurred_at.to_rfc3339(),
            "audit record"
        );
        Ok(())
    }

    /// Number of stored audit records (used by health reporting and tests).
    pub async fn count_audit_records(&self) -> FleetResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_records")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Ok(count)
    }

    // -- system config --------------------------------------------------------

    /// Read a system-config value.
    pub async fn get_config(&self, key: &str) -> FleetResult<Option<serde_json::Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM system_config WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        row.map(|(raw,)| crate::rows::decode_json("system_config.value", &raw))
            .transpose()
    }

    /// Write a system-config value.
    pub async fn set_config(&self, key: &str, value: &serde_json::Value) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_config (key, value) VALUES (?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbp_bus::EventBus;
    use fbp_core::{AdmissionState, JobKind, JobStatus, PlatformEvent, Permissions};
    use std::sync::Arc;

    async fn store() -> Store {
        Store::in_memory(Arc::new(EventBus::new())).await.unwrap()
    }

    fn device(id: &str, state: AdmissionState) -> Device {
        Device {
            device_id: id.into(),
            display_name: format!("dev {id}"),
            kind: "gateway".into(),
            mac_address: "AA:BB:CC:DD:EE:01".into(),
            os_version: "x".into(),
            agent_version: "1.0".into(),
            fleet_tag: None,
            admission_state: state,
            last_contact_at: None,
            api_key_hash: "hash".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn device_roundtrip_through_tx() {
        let store = store().await;
        let mut tx = store.begin_device("D1").await.unwrap();
        assert!(tx.get_device().await.unwrap().is_none());
        tx.upsert_device(&device("D1", AdmissionState::Active)).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.get_device("D1").await.unwrap().unwrap();
        assert_eq!(loaded.display_name, "dev D1");
        assert!(loaded.is_active());
        assert_eq!(loaded.api_key_hash, "hash");
    }

    #[tokio::test]
    async fn tx_scope_is_enforced() {
        let store = store().await;
        let mut tx = store.begin_device("D1").await.unwrap();
        let err = tx.upsert_device(&device("D2", AdmissionState::Active)).await.unwrap_err();
        assert_eq!(err.code, fbp_error::ErrorCode::InvariantViolation);
    }

    #[tokio::test]
    async fn active_count_ignores_retired_and_pending() {
        let store = store().await;
        for (id, state) in [
            ("D1", AdmissionState::Active),
            ("D2", AdmissionState::Active),
            ("D3", AdmissionState::Retired),
            ("D4", AdmissionState::Pending),
        ] {
            let mut tx = store.begin_device(id).await.unwrap();
            tx.upsert_device(&device(id, state)).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.count_active_devices().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fleet_tag_filter() {
        let store = store().await;
        for (id, tag) in [("D1", Some("lab")), ("D2", Some("prod")), ("D3", Some("lab"))] {
            let mut dev = device(id, AdmissionState::Active);
            dev.fleet_tag = tag.map(String::from);
            let mut tx = store.begin_device(id).await.unwrap();
            tx.upsert_device(&dev).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(
            store.list_active_device_ids(Some("lab")).await.unwrap(),
            vec!["D1".to_string(), "D3".to_string()]
        );
        assert_eq!(store.list_active_device_ids(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn provisioning_key_consume_respects_max_uses() {
        let store = store().await;
        let key = store
            .create_provisioning_key("hash-1", None, Some(1), None)
            .await
            .unwrap();

        let mut tx = store.begin_device("D1").await.unwrap();
        tx.consume_provisioning_key(key.id, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_device("D2").await.unwrap();
        let err = tx
            .consume_provisioning_key(key.id, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.code, fbp_error::ErrorCode::ProvisioningKeyInvalid);
    }

    #[tokio::test]
    async fn expired_key_cannot_be_consumed() {
        let store = store().await;
        let key = store
            .create_provisioning_key(
                "hash-2",
                None,
                None,
                Some(Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        let mut tx = store.begin_device("D1").await.unwrap();
        assert!(tx.consume_provisioning_key(key.id, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn mqtt_account_replacement_is_complete() {
        let store = store().await;
        let now = Utc::now();
        let user = MqttUser {
            username: "device-D1".into(),
            password_hash: "first".into(),
            active: true,
            created_at: now,
        };
        let acls = fbp_core::topic::device_acl_set("D1");

        let mut tx = store.begin_device("D1").await.unwrap();
        tx.replace_mqtt_account(&user, &acls).await.unwrap();
        tx.commit().await.unwrap();

        let replacement = MqttUser {
            password_hash: "second".into(),
            ..user.clone()
        };
        let mut tx = store.begin_device("D1").await.unwrap();
        tx.replace_mqtt_account(&replacement, &acls).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_mqtt_user("device-D1").await.unwrap().unwrap();
        assert_eq!(stored.password_hash, "second");
        let stored_acls = store.list_acls("device-D1").await.unwrap();
        assert_eq!(stored_acls.len(), 3);
        assert!(stored_acls
            .iter()
            .any(|a| a.topic_pattern == "sensor/D1/#" && a.permissions == Permissions::WRITE));
    }

    #[tokio::test]
    async fn state_record_roundtrip() {
        let store = store().await;
        let record = StateRecord {
            device_id: "D1".into(),
            apps: serde_json::json!({"a": {"image": "x:1"}}),
            config: serde_json::json!({"poll": 60}),
            version: 1,
            content_hash: "00".repeat(32),
            updated_at: Utc::now(),
        };
        let mut tx = store.begin_device("D1").await.unwrap();
        tx.replace_state(StateKind::Desired, &record).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store
            .get_state("D1", StateKind::Desired)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.apps["a"]["image"], "x:1");
        assert!(store
            .get_state("D1", StateKind::Reported)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn job_lifecycle_and_retention() {
        let store = store().await;
        let mut job = Job {
            id: Uuid::new_v4(),
            device_id: "D1".into(),
            kind: JobKind::Restart,
            status: JobStatus::Pending,
            payload: serde_json::json!({}),
            result: None,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
        };
        let mut tx = store.begin_device("D1").await.unwrap();
        tx.insert_job(&job).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.pending_jobs("D1").await.unwrap().len(), 1);

        job.status = JobStatus::Succeeded;
        job.finished_at = Some(Utc::now() - chrono::Duration::days(90));
        let mut tx = store.begin_device("D1").await.unwrap();
        tx.update_job(&job).await.unwrap();
        tx.commit().await.unwrap();

        let removed = store
            .delete_terminal_jobs_before(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deferred_events_flush_on_commit_only() {
        let bus = Arc::new(EventBus::new());
        let store = Store::in_memory(Arc::clone(&bus)).await.unwrap();
        let mut sub = bus.subscribe();

        // Rolled back: nothing reaches the bus.
        {
            let mut tx = store.begin_device("D1").await.unwrap();
            tx.publish(PlatformEvent::DeviceProvisioned {
                device_id: "D1".into(),
            });
            drop(tx);
        }
        assert!(sub.try_recv().is_none());

        let mut tx = store.begin_device("D1").await.unwrap();
        tx.publish(PlatformEvent::DeviceProvisioned {
            device_id: "D1".into(),
        });
        tx.commit().await.unwrap();
        assert!(matches!(
            sub.try_recv(),
            Some(PlatformEvent::DeviceProvisioned { .. })
        ));
    }

    #[tokio::test]
    async fn system_config_roundtrip() {
        let store = store().await;
        assert!(store.get_config("license.claims").await.unwrap().is_none());
        store
            .set_config("license.claims", &serde_json::json!({"plan": "trial"}))
            .await
            .unwrap();
        let value = store.get_config("license.claims").await.unwrap().unwrap();
        assert_eq!(value["plan"], "trial");
    }

    #[tokio::test]
    async fn audit_appends() {
        let store = store().await;
        store
            .append_audit(&fbp_core::AuditRecord::now(
                fbp_core::AuditKind::ProvisioningRejected,
                fbp_core::AuditSeverity::Warning,
                fbp_core::Actor::System,
                serde_json::json!({"reason": "bad token"}),
            ))
            .await
            .unwrap();
        assert_eq!(store.count_audit_records().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scheduled_job_due_query() {
        let store = store().await;
        let template = ScheduledJob {
            id: Uuid::new_v4(),
            device_selector: fbp_core::DeviceSelector::All,
            kind: JobKind::Restart,
            payload: serde_json::json!({}),
            cron_expression: "0 0 3 * * *".into(),
            next_fire_at: Utc::now() - chrono::Duration::minutes(1),
            active: true,
        };
        store.insert_scheduled_job(&template).await.unwrap();

        let due = store.due_scheduled_jobs(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        store
            .set_scheduled_job_next_fire(template.id, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(store.due_scheduled_jobs(Utc::now()).await.unwrap().is_empty());
    }
}
