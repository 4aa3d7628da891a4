// SPDX-License-Identifier: MIT OR Apache-2.0
//! The job engine: per-device job records, MQTT dispatch, status
//! ingestion, retention, and cron-driven scheduling.
//!
//! Status transitions are validated server-side against the state machine
//! in `fbp-core`. Dispatch notifications are published *outside* the
//! device lock; only the status flip back to `dispatched` happens inside
//! a device transaction. A missed notification is recovered by the agent
//! pulling over HTTP, so delivery stays best-effort.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod scheduler;

pub use scheduler::next_fire;

use chrono::{Duration as ChronoDuration, Utc};
use fbp_bus::EventSubscription;
use fbp_core::topic::{job_notify_topic, parse_job_status_topic};
use fbp_core::{Job, JobKind, JobStatus, PlatformEvent};
use fbp_error::{ErrorCode, FleetError, FleetResult};
use fbp_mqtt::{IncomingMessage, Publisher};
use fbp_store::Store;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Background-task tuning for the engine.
#[derive(Debug, Clone)]
pub struct JobEngineConfig {
    /// Days a terminal job survives before the retention sweep removes it.
    pub retention_days: u32,
    /// How long a job may sit in `dispatched` before it is failed.
    pub dispatch_timeout: Duration,
    /// Interval between maintenance sweeps.
    pub sweep_interval: Duration,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            dispatch_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Status report as devices publish it on
/// `agent/<device_id>/jobs/<job_id>/status` (and POST over HTTP).
#[derive(Debug, Deserialize)]
pub struct StatusReport {
    /// New status claimed by the device.
    pub status: JobStatus,
    /// Optional result payload, stored on terminal statuses.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// The job engine.
pub struct JobEngine {
    store: Store,
    publisher: Arc<dyn Publisher>,
}

impl JobEngine {
    /// Create the engine.
    pub fn new(store: Store, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    // -- lifecycle ------------------------------------------------------------

    /// Insert a `pending` job for an existing device and announce it on
    /// the bus.
    pub async fn enqueue(
        &self,
        device_id: &str,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> FleetResult<Job> {
        let mut tx = self.store.begin_device(device_id).await?;
        if tx.get_device().await?.is_none() {
            return Err(FleetError::not_found(format!("unknown device '{device_id}'")));
        }

        let job = Job {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            kind,
            status: JobStatus::Pending,
            payload,
            result: None,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
        };
        tx.insert_job(&job).await?;
        tx.publish(PlatformEvent::JobEnqueued {
            device_id: device_id.to_string(),
            job_id: job.id,
        });
        tx.commit().await?;
        debug!(device_id, job_id = %job.id, kind = kind.as_str(), "job enqueued");
        Ok(job)
    }

    /// Best-effort delivery of every pending job for one device.
    ///
    /// The MQTT notification is published before any lock is taken; only
    /// the status flip runs inside the device transaction. A failed
    /// publish leaves the job `pending` for the next attempt.
    pub async fn dispatch_pending(&self, device_id: &str) -> FleetResult<usize> {
        let pending = self.store.pending_jobs(device_id).await?;
        let mut dispatched = 0usize;

        for job in pending {
            let notification = serde_json::json!({
                "job_id": job.id,
                "kind": job.kind,
                "payload": job.payload,
            });
            if let Err(err) = self
                .publisher
                .publish_json(&job_notify_topic(device_id), &notification)
                .await
            {
                warn!(device_id, job_id = %job.id, error = %err, "dispatch publish failed");
                continue;
            }

            let mut tx = self.store.begin_device(device_id).await?;
            if let Some(mut stored) = tx.get_job(job.id).await? {
                // Re-check under the lock; the job may have been canceled
                // between the read and the publish.
                if stored.status == JobStatus::Pending {
                    stored.status = JobStatus::Dispatched;
                    stored.dispatched_at = Some(Utc::now());
                    tx.update_job(&stored).await?;
                    dispatched += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(dispatched)
    }

    /// Apply a device-reported (or operator-requested) status transition.
    pub async fn report_status(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        result: Option<serde_json::Value>,
    ) -> FleetResult<Job> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("unknown job '{job_id}'")))?;

        let mut tx = self.store.begin_device(&job.device_id).await?;
        let mut job = tx
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("unknown job '{job_id}'")))?;

        if !job.status.can_transition_to(new_status) {
            return Err(FleetError::new(
                ErrorCode::InvalidJobTransition,
                format!("job cannot move from {} to {}", job.status, new_status),
            )
            .with_context("job_id", job_id)
            .with_context("from", job.status.as_str())
            .with_context("to", new_status.as_str()));
        }

        job.status = new_status;
        if new_status == JobStatus::Dispatched && job.dispatched_at.is_none() {
            job.dispatched_at = Some(Utc::now());
        }
        if new_status.is_terminal() {
            job.finished_at = Some(Utc::now());
            job.result = result.or(job.result.take());
        }
        tx.update_job(&job).await?;

        if new_status.is_terminal() {
            tx.publish(PlatformEvent::JobFinished {
                device_id: job.device_id.clone(),
                job_id,
                status: new_status,
            });
        }
        tx.commit().await?;
        debug!(job_id = %job_id, status = %new_status, "job status updated");
        Ok(job)
    }

    /// Cancel a job (allowed from `pending` or `dispatched` only).
    pub async fn cancel(&self, job_id: Uuid) -> FleetResult<Job> {
        self.report_status(job_id, JobStatus::Canceled, None).await
    }

    // -- background tasks -----------------------------------------------------

    /// React to bus events by delivering pending jobs. Runs until the bus
    /// closes.
    pub async fn run_dispatcher(self: Arc<Self>, mut events: EventSubscription) {
        while let Some(event) = events.recv().await {
            let device_id = match event {
                PlatformEvent::DeviceProvisioned { device_id }
                | PlatformEvent::JobEnqueued { device_id, .. } => device_id,
                _ => continue,
            };
            if let Err(err) = self.dispatch_pending(&device_id).await {
                warn!(device_id, error = %err, "dispatch sweep failed");
            }
        }
    }

    /// Consume status messages from the broker subscription. Runs until
    /// the channel closes.
    pub async fn run_status_ingest(self: Arc<Self>, mut messages: mpsc::Receiver<IncomingMessage>) {
        while let Some(message) = messages.recv().await {
            if let Err(err) = self.ingest_status_message(&message).await {
                warn!(topic = %message.topic, error = %err, "status ingestion rejected");
            }
        }
    }

    /// Parse and apply one status message from the broker.
    pub async fn ingest_status_message(&self, message: &IncomingMessage) -> FleetResult<()> {
        let (device_id, job_id) = parse_job_status_topic(&message.topic)
            .ok_or_else(|| FleetError::bad_request("not a job status topic"))?;
        let job_id = Uuid::parse_str(job_id)
            .map_err(|_| FleetError::bad_request("job id in topic is not a uuid"))?;
        let report: StatusReport = serde_json::from_slice(&message.payload)
            .map_err(|e| FleetError::bad_request("malformed status payload").with_source(e))?;

        // The broker ACLs already fence devices into their own namespace;
        // re-check ownership anyway before mutating.
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("unknown job '{job_id}'")))?;
        if job.device_id != device_id {
            return Err(FleetError::unauthorized("job does not belong to this device"));
        }

        self.report_status(job_id, report.status, report.result).await?;
        Ok(())
    }

    /// Periodic retention and dispatch-timeout sweeps. Runs forever.
    pub async fn run_maintenance(self: Arc<Self>, config: JobEngineConfig) {
        let mut ticker = tokio::time::interval(config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep(&config).await {
                warn!(error = %err, "maintenance sweep failed");
            }
        }
    }

    /// One maintenance pass: fail timed-out dispatches, drop old
    /// terminal jobs.
    pub async fn sweep(&self, config: &JobEngineConfig) -> FleetResult<()> {
        let now = Utc::now();

        let stale_cutoff = now
            - ChronoDuration::from_std(config.dispatch_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(15));
        for job in self.store.stale_dispatched_jobs(stale_cutoff).await? {
            let result = serde_json::json!({"error": "dispatch timeout"});
            match self.report_status(job.id, JobStatus::Failed, Some(result)).await {
                Ok(_) => info!(job_id = %job.id, "job failed on dispatch timeout"),
                Err(err) => warn!(job_id = %job.id, error = %err, "timeout transition failed"),
            }
        }

        let retention_cutoff = now - ChronoDuration::days(i64::from(config.retention_days));
        let removed = self.store.delete_terminal_jobs_before(retention_cutoff).await?;
        if removed > 0 {
            info!(removed, "terminal jobs removed by retention");
        }
        Ok(())
    }
}
