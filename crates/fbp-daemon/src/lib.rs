// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control plane for the fleet backplane.
//!
//! Route map:
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /auth/user`, `POST /auth/acl` | broker authorization hooks |
//! | `POST /provision/key-exchange` | provisioning phase 1 |
//! | `POST /provision/register` | provisioning phase 2 |
//! | `GET/PUT /devices/{id}/state/...` | desired/reported state |
//! | `POST/GET /devices/{id}/jobs`, `POST /jobs/{id}/...` | job engine |
//! | `/admin/...` | provisioning keys, retirement, schedules |
//! | `GET /healthz` | liveness |
//!
//! Broker hooks answer only with status codes (200 allows; anything else
//! denies). Every other route speaks the error envelope from
//! [`error::ApiError`].

#![deny(unsafe_code)]

pub mod error;
pub mod middleware;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use error::ApiError;
use fbp_brokerauth::BrokerAuthService;
use fbp_core::{AccessOp, DeviceSelector, Job, JobKind, ProvisioningKey};
use fbp_error::{ErrorCode, FleetError, FleetResult};
use fbp_identity::IdentityService;
use fbp_jobs::JobEngine;
use fbp_license::LicenseAuthority;
use fbp_provision::{KeyExchangeRequest, KeyExchangeResponse, ProvisionBundle, ProvisioningCoordinator};
use fbp_ratelimit::SourceRateLimiter;
use fbp_state::{StateEngine, StateVersion, SystemInfo};
use fbp_store::Store;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// License feature gating ad-hoc job submission.
const FEATURE_BASIC_JOBS: &str = "basic_jobs";

/// License feature gating cron templates.
const FEATURE_SCHEDULED_JOBS: &str = "scheduled_jobs";

/// Shared handler state.
pub struct AppState {
    /// Durable storage.
    pub store: Store,
    /// Provisioning-key registry and credential issuance.
    pub identity: IdentityService,
    /// Feature/limit authority.
    pub license: Arc<LicenseAuthority>,
    /// Desired/reported state engine.
    pub state_engine: StateEngine,
    /// Job engine.
    pub jobs: Arc<JobEngine>,
    /// Broker decision service.
    pub broker_auth: Arc<BrokerAuthService>,
    /// Two-phase provisioning coordinator.
    pub coordinator: Arc<ProvisioningCoordinator>,
    /// Broker session state, for health reporting.
    pub mqtt_status: fbp_mqtt::SessionStatus,
    /// Limiter over provisioning attempts per source identity.
    pub provision_limiter: SourceRateLimiter,
    /// Server-side deadline for inbound requests.
    pub request_deadline: Duration,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// Build the Axum router with all backplane routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/user", post(auth_user))
        .route("/auth/acl", post(auth_acl))
        .route("/provision/key-exchange", post(provision_key_exchange))
        .route("/provision/register", post(provision_register))
        .route("/devices", get(list_devices))
        .route("/devices/{device_id}", get(get_device))
        .route(
            "/devices/{device_id}/state/desired",
            get(get_desired).put(put_desired),
        )
        .route(
            "/devices/{device_id}/state/reported",
            get(get_reported).put(put_reported),
        )
        .route("/devices/{device_id}/jobs", post(post_job).get(list_jobs))
        .route("/jobs/{job_id}/status", post(post_job_status))
        .route("/jobs/{job_id}/cancel", post(post_job_cancel))
        .route(
            "/admin/provisioning-keys",
            post(create_provisioning_key).get(list_provisioning_keys),
        )
        .route(
            "/admin/provisioning-keys/{key_id}",
            axum::routing::delete(deactivate_provisioning_key),
        )
        .route("/admin/devices/{device_id}/retire", post(retire_device))
        .route(
            "/admin/scheduled-jobs",
            post(create_scheduled_job).get(list_scheduled_jobs),
        )
        .layer(axum::middleware::from_fn(middleware::request_logger_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `work` under the server-side request deadline.
async fn with_deadline<T, F>(state: &AppState, work: F) -> Result<T, ApiError>
where
    F: Future<Output = FleetResult<T>>,
{
    match tokio::time::timeout(state.request_deadline, work).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => Err(ApiError::from(FleetError::new(
            ErrorCode::DeadlineExceeded,
            "request deadline elapsed",
        ))),
    }
}

/// Best-effort caller identity for rate limiting and audit trails.
///
/// Deployments front the daemon with a proxy that sets the usual headers;
/// a missing header degrades to one shared bucket rather than an error.
fn caller_addr(headers: &HeaderMap) -> String {
    for header in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    "unknown".to_string()
}

/// Extract and verify the device API key from `X-Api-Key`.
async fn require_device_api_key(
    state: &AppState,
    device_id: &str,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::from(FleetError::unauthorized("missing X-Api-Key header")))?;

    let device = state
        .store
        .get_device(device_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::from(FleetError::unauthorized("unknown device")))?;

    if state.identity.verify_api_key(&device, presented) {
        Ok(())
    } else {
        Err(ApiError::from(FleetError::unauthorized("API key rejected")))
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Liveness plus a per-component breakdown. A store failure degrades the
/// top-level status instead of erroring, so the endpoint stays useful
/// exactly when things are broken.
async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = match state.store.count_active_devices().await {
        Ok(active_devices) => json!({"status": "ok", "active_devices": active_devices}),
        Err(err) => json!({"status": "unavailable", "error": err.code.as_str()}),
    };

    let claims = state.license.snapshot();
    let license = json!({
        "status": "ok",
        "plan": claims.plan,
        "valid": claims.is_valid_at(Utc::now()),
    });

    let mqtt = json!({
        "status": if state.mqtt_status.is_connected() { "connected" } else { "disconnected" },
    });

    let cache = state.broker_auth.cache_stats();
    let broker_auth = json!({
        "status": "ok",
        "cached_acl_sets": cache.entries,
        "shards": cache.shards,
    });

    let degraded = store["status"] != "ok";
    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "license_plan": claims.plan,
        "components": {
            "store": store,
            "license": license,
            "mqtt": mqtt,
            "broker_auth": broker_auth,
        },
    }))
}

// ---------------------------------------------------------------------------
// Broker authorization hooks (wire contract: only 200 allows)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuthUserRequest {
    username: String,
    password: String,
}

async fn auth_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthUserRequest>,
) -> Response {
    if state
        .broker_auth
        .check_user(&req.username, &req.password)
        .await
        .is_allowed()
    {
        (StatusCode::OK, Json(json!({"ok": true}))).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"ok": false}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct AuthAclRequest {
    username: String,
    topic: String,
    acc: i64,
}

async fn auth_acl(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthAclRequest>,
) -> Response {
    // Wire encoding: 1 = read, 2 = write, 3 = both. Anything else denies.
    let ops: &[AccessOp] = match req.acc {
        1 => &[AccessOp::Read],
        2 => &[AccessOp::Write],
        3 => &[AccessOp::Read, AccessOp::Write],
        _ => return (StatusCode::FORBIDDEN, Json(json!({"ok": false}))).into_response(),
    };

    for op in ops {
        if !state
            .broker_auth
            .check_acl(&req.username, &req.topic, *op)
            .await
            .is_allowed()
        {
            return (StatusCode::FORBIDDEN, Json(json!({"ok": false}))).into_response();
        }
    }
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

async fn provision_key_exchange(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<KeyExchangeRequest>,
) -> Result<Json<KeyExchangeResponse>, ApiError> {
    let addr = caller_addr(&headers);
    state
        .provision_limiter
        .enforce(&format!("{addr}|{}", req.device_id))
        .map_err(ApiError::from)?;

    let response = with_deadline(&state, state.coordinator.key_exchange(req, &addr)).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    encrypted_payload: String,
}

async fn provision_register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<ProvisionBundle>, ApiError> {
    let addr = caller_addr(&headers);
    state.provision_limiter.enforce(&addr).map_err(ApiError::from)?;

    let bundle = with_deadline(
        &state,
        state.coordinator.register(&req.encrypted_payload, &addr),
    )
    .await?;
    Ok(Json(bundle))
}

// ---------------------------------------------------------------------------
// Device inventory
// ---------------------------------------------------------------------------

async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<fbp_core::Device>>, ApiError> {
    Ok(Json(state.store.list_devices().await.map_err(ApiError::from)?))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<fbp_core::Device>, ApiError> {
    state
        .store
        .get_device(&device_id)
        .await
        .map_err(ApiError::from)?
        .map(Json)
        .ok_or_else(|| ApiError::from(FleetError::not_found(format!("unknown device '{device_id}'"))))
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatePollQuery {
    /// Last version the caller has; matching versions return 304.
    version: Option<i64>,
}

async fn get_desired(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(query): Query<StatePollQuery>,
) -> Result<Response, ApiError> {
    let record = state
        .state_engine
        .get_desired(&device_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::from(FleetError::not_found("no desired state for device")))?;

    if query.version == Some(record.version) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    Ok(Json(record).into_response())
}

async fn get_reported(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(query): Query<StatePollQuery>,
) -> Result<Response, ApiError> {
    let record = state
        .state_engine
        .get_reported(&device_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::from(FleetError::not_found("no reported state for device")))?;

    if query.version == Some(record.version) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    Ok(Json(record).into_response())
}

#[derive(Debug, Deserialize)]
struct StateWriteRequest {
    apps: serde_json::Value,
    config: serde_json::Value,
    #[serde(default)]
    system_info: Option<SystemInfo>,
}

async fn put_desired(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(req): Json<StateWriteRequest>,
) -> Result<Json<StateVersion>, ApiError> {
    let version = with_deadline(
        &state,
        state.state_engine.set_desired(&device_id, req.apps, req.config),
    )
    .await?;
    Ok(Json(version))
}

async fn put_reported(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StateWriteRequest>,
) -> Result<Json<StateVersion>, ApiError> {
    require_device_api_key(&state, &device_id, &headers).await?;
    let version = with_deadline(
        &state,
        state
            .state_engine
            .set_reported(&device_id, req.apps, req.config, req.system_info),
    )
    .await?;
    Ok(Json(version))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    kind: JobKind,
    #[serde(default)]
    payload: serde_json::Value,
}

async fn post_job(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    state
        .license
        .require_feature(FEATURE_BASIC_JOBS)
        .map_err(ApiError::from)?;
    let payload = if req.payload.is_null() {
        json!({})
    } else {
        req.payload
    };
    let job = with_deadline(&state, state.jobs.enqueue(&device_id, req.kind, payload)).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
struct JobListQuery {
    limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(
        state
            .store
            .list_jobs(&device_id, limit)
            .await
            .map_err(ApiError::from)?,
    ))
}

#[derive(Debug, Deserialize)]
struct JobStatusRequest {
    status: fbp_core::JobStatus,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

/// HTTP fallback for the MQTT status path; authenticated with the
/// device's API key.
async fn post_job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<JobStatusRequest>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .store
        .get_job(job_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::from(FleetError::not_found(format!("unknown job '{job_id}'"))))?;
    require_device_api_key(&state, &job.device_id, &headers).await?;

    let job = with_deadline(
        &state,
        state.jobs.report_status(job_id, req.status, req.result),
    )
    .await?;
    Ok(Json(job))
}

async fn post_job_cancel(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = with_deadline(&state, state.jobs.cancel(job_id)).await?;
    Ok(Json(job))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    #[serde(default)]
    fleet_tag: Option<String>,
    #[serde(default)]
    max_uses: Option<i64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

async fn create_provisioning_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let issued = state
        .identity
        .create_provisioning_key(req.fleet_tag.as_deref(), req.max_uses, req.expires_at)
        .await
        .map_err(ApiError::from)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key": issued.key,
            // Plaintext appears exactly once, here.
            "token": issued.token,
        })),
    ))
}

async fn list_provisioning_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProvisioningKey>>, ApiError> {
    Ok(Json(
        state
            .identity
            .list_provisioning_keys()
            .await
            .map_err(ApiError::from)?,
    ))
}

async fn deactivate_provisioning_key(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state
        .identity
        .deactivate_provisioning_key(key_id)
        .await
        .map_err(ApiError::from)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::from(FleetError::not_found(format!(
            "unknown provisioning key {key_id}"
        ))))
    }
}

async fn retire_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    with_deadline(&state, state.coordinator.retire(&device_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    device_selector: DeviceSelector,
    kind: JobKind,
    #[serde(default)]
    payload: serde_json::Value,
    cron_expression: String,
}

async fn create_scheduled_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<fbp_core::ScheduledJob>), ApiError> {
    state
        .license
        .require_feature(FEATURE_SCHEDULED_JOBS)
        .map_err(ApiError::from)?;
    let payload = if req.payload.is_null() {
        json!({})
    } else {
        req.payload
    };
    let template = state
        .jobs
        .create_scheduled_job(req.device_selector, req.kind, payload, &req.cron_expression)
        .await
        .map_err(ApiError::from)?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_scheduled_jobs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<fbp_core::ScheduledJob>>, ApiError> {
    Ok(Json(state.jobs.list_scheduled_jobs().await.map_err(ApiError::from)?))
}
