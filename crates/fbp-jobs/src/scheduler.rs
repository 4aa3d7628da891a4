// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cron-driven scheduled-job templates.
//!
//! Templates fire when `now >= next_fire_at`, fan out to the selected
//! devices as ordinary `pending` jobs, and advance `next_fire_at` per the
//! cron expression. Only the replica holding the store lease fires;
//! everyone else observes.

use crate::JobEngine;
use chrono::{DateTime, Utc};
use cron::Schedule;
use fbp_core::{DeviceSelector, JobKind, ScheduledJob};
use fbp_error::{FleetError, FleetResult};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Compute the next firing instant after `after` for a cron expression.
///
/// Expressions use the seconds-resolution form
/// (`sec min hour day-of-month month day-of-week`).
pub fn next_fire(cron_expression: &str, after: DateTime<Utc>) -> FleetResult<DateTime<Utc>> {
    let schedule = Schedule::from_str(cron_expression).map_err(|e| {
        FleetError::bad_request(format!("invalid cron expression '{cron_expression}'"))
            .with_source(e)
    })?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| FleetError::bad_request("cron expression never fires"))
}

impl JobEngine {
    /// Create a scheduled-job template. The cron expression is validated
    /// and the first firing instant computed immediately.
    pub async fn create_scheduled_job(
        &self,
        device_selector: DeviceSelector,
        kind: JobKind,
        payload: serde_json::Value,
        cron_expression: &str,
    ) -> FleetResult<ScheduledJob> {
        let template = ScheduledJob {
            id: Uuid::new_v4(),
            device_selector,
            kind,
            payload,
            cron_expression: cron_expression.to_string(),
            next_fire_at: next_fire(cron_expression, Utc::now())?,
            active: true,
        };
        self.store().insert_scheduled_job(&template).await?;
        info!(template_id = %template.id, cron = cron_expression, "scheduled job created");
        Ok(template)
    }

    /// List every template.
    pub async fn list_scheduled_jobs(&self) -> FleetResult<Vec<ScheduledJob>> {
        self.store().list_scheduled_jobs().await
    }

    /// Fire every due template once. Returns the number of jobs produced.
    pub async fn fire_due_templates(&self, now: DateTime<Utc>) -> FleetResult<usize> {
        let mut produced = 0usize;

        for template in self.store().due_scheduled_jobs(now).await? {
            let device_ids = self.resolve_selector(&template.device_selector).await?;
            for device_id in &device_ids {
                match self
                    .enqueue(device_id, template.kind, template.payload.clone())
                    .await
                {
                    Ok(_) => produced += 1,
                    Err(err) => {
                        warn!(template_id = %template.id, device_id, error = %err,
                              "scheduled enqueue failed");
                    }
                }
            }

            // Advance even when no device matched, otherwise the template
            // busy-loops on every pass.
            match next_fire(&template.cron_expression, now) {
                Ok(next) => {
                    self.store()
                        .set_scheduled_job_next_fire(template.id, next)
                        .await?;
                    debug!(template_id = %template.id, next = %next, "template advanced");
                }
                Err(err) => {
                    warn!(template_id = %template.id, error = %err,
                          "stored cron expression no longer parses");
                }
            }
        }
        Ok(produced)
    }

    /// Scheduler loop: on each tick, take the lease and fire due
    /// templates. Replicas that fail to take the lease observe only.
    pub async fn run_scheduler(self: Arc<Self>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(lease) = self.store().try_scheduler_lease() else {
                continue;
            };
            if let Err(err) = self.fire_due_templates(Utc::now()).await {
                warn!(error = %err, "scheduler pass failed");
            }
            drop(lease);
        }
    }

    async fn resolve_selector(&self, selector: &DeviceSelector) -> FleetResult<Vec<String>> {
        match selector {
            DeviceSelector::Device { device_id } => Ok(vec![device_id.clone()]),
            DeviceSelector::FleetTag { fleet_tag } => {
                self.store().list_active_device_ids(Some(fleet_tag)).await
            }
            DeviceSelector::All => self.store().list_active_device_ids(None).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingPublisher, seed_device};
    use chrono::Duration as ChronoDuration;
    use fbp_bus::EventBus;
    use fbp_error::ErrorCode;
    use fbp_mqtt::Publisher;
    use fbp_store::Store;

    async fn engine() -> (Arc<JobEngine>, Store) {
        let bus = Arc::new(EventBus::new());
        let store = Store::in_memory(bus).await.unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        (
            Arc::new(JobEngine::new(store.clone(), publisher as Arc<dyn Publisher>)),
            store,
        )
    }

    #[test]
    fn next_fire_advances() {
        let now = Utc::now();
        let next = next_fire("0 0 3 * * *", now).unwrap();
        assert!(next > now);
        let after = next_fire("0 0 3 * * *", next).unwrap();
        assert_eq!(after - next, ChronoDuration::days(1));
    }

    #[test]
    fn invalid_cron_is_bad_request() {
        let err = next_fire("not cron", Utc::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn create_validates_expression() {
        let (engine, _store) = engine().await;
        let err = engine
            .create_scheduled_job(
                DeviceSelector::All,
                JobKind::Restart,
                serde_json::json!({}),
                "every tuesday-ish",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn due_template_fans_out_to_selected_devices() {
        let (engine, store) = engine().await;
        seed_device(&store, "D1", Some("lab")).await;
        seed_device(&store, "D2", Some("prod")).await;
        seed_device(&store, "D3", Some("lab")).await;

        let template = engine
            .create_scheduled_job(
                DeviceSelector::FleetTag {
                    fleet_tag: "lab".into(),
                },
                JobKind::Restart,
                serde_json::json!({}),
                "0 0 3 * * *",
            )
            .await
            .unwrap();

        // Backdate so it is due now.
        store
            .set_scheduled_job_next_fire(template.id, Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();

        let produced = engine.fire_due_templates(Utc::now()).await.unwrap();
        assert_eq!(produced, 2);
        assert_eq!(store.pending_jobs("D1").await.unwrap().len(), 1);
        assert_eq!(store.pending_jobs("D2").await.unwrap().len(), 0);
        assert_eq!(store.pending_jobs("D3").await.unwrap().len(), 1);

        // The template advanced: nothing is due anymore.
        assert_eq!(engine.fire_due_templates(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inactive_templates_do_not_fire() {
        let (engine, store) = engine().await;
        seed_device(&store, "D1", None).await;
        let mut template = engine
            .create_scheduled_job(
                DeviceSelector::All,
                JobKind::Restart,
                serde_json::json!({}),
                "0 0 3 * * *",
            )
            .await
            .unwrap();
        template.active = false;

        // Re-insert as inactive under a fresh id.
        template.id = Uuid::new_v4();
        template.next_fire_at = Utc::now() - ChronoDuration::minutes(1);
        store.insert_scheduled_job(&template).await.unwrap();

        assert_eq!(engine.fire_due_templates(Utc::now()).await.unwrap(), 0);
    }
}
