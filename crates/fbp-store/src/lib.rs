// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable persistence for the fleet backplane.
//!
//! [`Store`] wraps a SQLite pool and exposes strongly-typed accessors for
//! every entity the platform persists. Mutations of per-device records go
//! through [`DeviceTx`], which serialises writers on an in-process
//! advisory lock keyed by device id, runs inside one SQL transaction, and
//! defers event publication until after commit.
//!
//! Failure semantics: busy/locked/conflict conditions surface as
//! `RETRYABLE_STORAGE`; rows that violate documented invariants surface as
//! `INVARIANT_VIOLATION` and are never silently repaired.

#![deny(unsafe_code)]

mod queries;
mod rows;
mod tx;

pub use tx::DeviceTx;

use fbp_bus::EventBus;
use fbp_error::{FleetError, FleetResult};
use rows::map_sqlx_err;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Reserved advisory-lock key for scheduler leader election.
const SCHEDULER_LEASE_KEY: &str = "~scheduler";

// ---------------------------------------------------------------------------
// Advisory locks
// ---------------------------------------------------------------------------

/// In-process advisory locks keyed by device id.
///
/// Entries are created on demand and never removed; the map is bounded by
/// the number of distinct devices this process has touched.
#[derive(Clone, Default)]
struct LockMap {
    inner: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl LockMap {
    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(key.to_string()).or_default())
    }
}

/// Held by the single process-wide replica allowed to fire scheduled jobs.
///
/// Dropping the lease releases leadership.
pub struct SchedulerLease {
    _guard: OwnedMutexGuard<()>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The durable key-value and relational substrate.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    locks: LockMap,
    bus: Arc<EventBus>,
}

impl Store {
    /// Open (and create if missing) the database at `path`.
    pub async fn open(path: &str, bus: Arc<EventBus>) -> FleetResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(map_sqlx_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;
        let store = Self {
            pool,
            locks: LockMap::default(),
            bus,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Open a private in-memory database (single connection, for tests).
    pub async fn in_memory(bus: Arc<EventBus>) -> FleetResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(map_sqlx_err)?
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;
        let store = Self {
            pool,
            locks: LockMap::default(),
            bus,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// The event bus transactions flush into after commit.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the underlying pool. Used on shutdown; every subsequent
    /// operation fails.
    pub async fn pool_close(&self) {
        self.pool.close().await;
    }

    /// Begin a transaction scoped to one device.
    ///
    /// Acquires the per-device advisory lock before opening the SQL
    /// transaction; the lock is released when the returned [`DeviceTx`]
    /// commits or is dropped. All mutations of Device, DesiredState,
    /// ReportedState, MqttUser, or MqttAcl rows for a device must go
    /// through this.
    pub async fn begin_device(&self, device_id: &str) -> FleetResult<DeviceTx> {
        let guard = self.locks.entry(device_id).lock_owned().await;
        debug!(device_id, "device lock acquired");
        let tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        Ok(DeviceTx::new(
            tx,
            device_id.to_string(),
            guard,
            Arc::clone(&self.bus),
        ))
    }

    /// Try to take the scheduler leadership lease without waiting.
    ///
    /// Returns `None` when another task in this process already holds it.
    pub fn try_scheduler_lease(&self) -> Option<SchedulerLease> {
        self.locks
            .entry(SCHEDULER_LEASE_KEY)
            .try_lock_owned()
            .ok()
            .map(|guard| SchedulerLease { _guard: guard })
    }

    async fn ensure_schema(&self) -> FleetResult<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    FleetError::internal("schema creation failed")
                        .with_context("statement", statement)
                        .with_source(e)
                })?;
        }
        Ok(())
    }
}

/// Idempotent schema. JSON attributes are stored as TEXT in canonical-ish
/// serde_json form; timestamps are RFC 3339 TEXT in UTC.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id       TEXT PRIMARY KEY,
    display_name    TEXT NOT NULL DEFAULT '',
    kind            TEXT NOT NULL DEFAULT '',
    mac_address     TEXT NOT NULL DEFAULT '',
    os_version      TEXT NOT NULL DEFAULT '',
    agent_version   TEXT NOT NULL DEFAULT '',
    fleet_tag       TEXT,
    admission_state TEXT NOT NULL,
    last_contact_at TEXT,
    api_key_hash    TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device_public_keys (
    device_id      TEXT PRIMARY KEY,
    public_key_pem TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS provisioning_keys (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    key_hash   TEXT NOT NULL UNIQUE,
    fleet_tag  TEXT,
    max_uses   INTEGER,
    uses       INTEGER NOT NULL DEFAULT 0,
    active     INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device_states (
    device_id    TEXT NOT NULL,
    kind         TEXT NOT NULL,
    apps         TEXT NOT NULL,
    config       TEXT NOT NULL,
    version      INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (device_id, kind)
);

CREATE TABLE IF NOT EXISTS mqtt_users (
    username      TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mqtt_acls (
    username      TEXT NOT NULL,
    topic_pattern TEXT NOT NULL,
    permissions   INTEGER NOT NULL,
    PRIMARY KEY (username, topic_pattern)
);

CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    device_id     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    status        TEXT NOT NULL,
    payload       TEXT NOT NULL,
    result        TEXT,
    created_at    TEXT NOT NULL,
    dispatched_at TEXT,
    finished_at   TEXT
);
CREATE INDEX IF NOT EXISTS jobs_device_idx ON jobs (device_id, status);
CREATE INDEX IF NOT EXISTS jobs_finished_idx ON jobs (status, finished_at);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id              TEXT PRIMARY KEY,
    device_selector TEXT NOT NULL,
    kind            TEXT NOT NULL,
    payload         TEXT NOT NULL,
    cron_expression TEXT NOT NULL,
    next_fire_at    TEXT NOT NULL,
    active          INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS audit_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    severity    TEXT NOT NULL,
    actor       TEXT NOT NULL,
    details     TEXT NOT NULL,
    occurred_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
