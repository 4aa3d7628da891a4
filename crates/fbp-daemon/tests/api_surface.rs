// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire-level tests over the full router, no network involved.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fbp_brokerauth::BrokerAuthService;
use fbp_bus::EventBus;
use fbp_crypto::PlatformKeyPair;
use fbp_daemon::{AppState, build_app};
use fbp_error::FleetResult;
use fbp_identity::IdentityService;
use fbp_jobs::JobEngine;
use fbp_license::LicenseAuthority;
use fbp_mqtt::Publisher;
use fbp_provision::{BundleConfig, NoVpn, ProvisioningCoordinator};
use fbp_ratelimit::SourceRateLimiter;
use fbp_state::StateEngine;
use fbp_store::Store;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::util::ServiceExt;

/// Publisher that swallows everything (no broker in these tests).
struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish_json(&self, _topic: &str, _payload: &Value) -> FleetResult<()> {
        Ok(())
    }
}

struct Harness {
    app: Router,
    token: String,
}

async fn harness() -> Harness {
    harness_with_limiter(1_000).await
}

async fn harness_with_limiter(attempts: u32) -> Harness {
    let bus = Arc::new(EventBus::new());
    let store = Store::in_memory(Arc::clone(&bus)).await.unwrap();
    let identity = IdentityService::new(store.clone());
    let license = Arc::new(LicenseAuthority::new(store.clone(), None, None));
    license.init().await.unwrap();
    let state_engine = StateEngine::new(store.clone(), json!({}), json!({"device": "{{device_id}}"}));
    let jobs = Arc::new(JobEngine::new(store.clone(), Arc::new(NullPublisher)));
    let keys = Arc::new(PlatformKeyPair::generate().unwrap());
    let issued = identity.create_provisioning_key(None, None, None).await.unwrap();

    let coordinator = Arc::new(ProvisioningCoordinator::new(
        store.clone(),
        identity.clone(),
        Arc::clone(&license),
        state_engine.clone(),
        Arc::clone(&keys),
        BundleConfig {
            api_endpoint: "https://api.test".into(),
            broker_url: "mqtt://broker.test:1883".into(),
            tls_ca: None,
            tls_verify: false,
        },
        Arc::new(NoVpn),
    ));
    let broker_auth = BrokerAuthService::new(
        store.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );

    let state = Arc::new(AppState {
        store,
        identity,
        license,
        state_engine,
        jobs,
        broker_auth,
        coordinator,
        // No broker session in these tests; reports disconnected.
        mqtt_status: fbp_mqtt::SessionStatus::default(),
        provision_limiter: SourceRateLimiter::new(attempts, Duration::from_secs(60)),
        request_deadline: Duration::from_secs(10),
        started_at: Instant::now(),
    });

    Harness {
        app: build_app(state),
        token: issued.token,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    call_with_headers(app, method, uri, body, &[]).await
}

async fn call_with_headers(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Drive both provisioning phases over HTTP; returns the bundle.
async fn provision(h: &Harness, device_id: &str) -> Value {
    let (status, body) = call(
        &h.app,
        "POST",
        "/provision/key-exchange",
        Some(json!({"device_id": device_id, "provisioning_token": h.token})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let platform_pem = body["platform_public_key"].as_str().unwrap().to_string();
    assert_eq!(body["key_id"], "primary");

    let payload = json!({
        "device_id": device_id,
        "provisioning_token": h.token,
        "display_name": format!("Gw-{device_id}"),
        "kind": "gateway",
        "mac_address": "AA:BB:CC:DD:EE:01",
        "os_version": "x",
        "agent_version": "1.0",
    });
    let wrapped =
        fbp_crypto::keys::wrap_payload(&platform_pem, payload.to_string().as_bytes()).unwrap();
    let (status, bundle) = call(
        &h.app,
        "POST",
        "/provision/register",
        Some(json!({"encrypted_payload": BASE64.encode(wrapped)})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register failed: {bundle}");
    bundle
}

#[tokio::test]
async fn healthz_reports_per_component_status() {
    let h = harness().await;
    let (status, body) = call(&h.app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["license_plan"], "trial");

    let components = &body["components"];
    assert_eq!(components["store"]["status"], "ok");
    assert_eq!(components["store"]["active_devices"], 0);
    assert_eq!(components["license"]["plan"], "trial");
    assert_eq!(components["license"]["valid"], true);
    // The test harness runs without a broker session.
    assert_eq!(components["mqtt"]["status"], "disconnected");
    assert_eq!(components["broker_auth"]["shards"], 16);
}

#[tokio::test]
async fn provisioning_round_trip_over_http() {
    let h = harness().await;
    let bundle = provision(&h, "D1").await;

    assert_eq!(bundle["device"]["device_id"], "D1");
    assert_eq!(bundle["mqtt"]["username"], "device-D1");
    assert_eq!(bundle["api"]["endpoint"], "https://api.test");
    assert!(bundle["mqtt"]["password"].as_str().unwrap().len() == 64);

    // Fresh credentials pass the broker user hook.
    let (status, _) = call(
        &h.app,
        "POST",
        "/auth/user",
        Some(json!({
            "username": "device-D1",
            "password": bundle["mqtt"]["password"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn broker_hooks_speak_status_codes() {
    let h = harness().await;
    provision(&h, "D1").await;

    // Unknown user: 401.
    let (status, _) = call(
        &h.app,
        "POST",
        "/auth/user",
        Some(json!({"username": "device-D9", "password": "pw"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // ACL isolation over the wire: own namespace allowed, foreign denied.
    for (topic, acc, expected) in [
        ("agent/D1/cmd", 1, StatusCode::OK),
        ("sensor/D1/metric", 2, StatusCode::OK),
        ("sensor/D1/metric", 1, StatusCode::FORBIDDEN),
        ("sensor/D2/metric", 2, StatusCode::FORBIDDEN),
        ("agent/D1/cmd", 3, StatusCode::OK),
        ("agent/D1/cmd", 7, StatusCode::FORBIDDEN),
    ] {
        let (status, _) = call(
            &h.app,
            "POST",
            "/auth/acl",
            Some(json!({"username": "device-D1", "topic": topic, "acc": acc})),
        )
        .await;
        assert_eq!(status, expected, "topic {topic} acc {acc}");
    }
}

#[tokio::test]
async fn state_polling_uses_versions() {
    let h = harness().await;
    provision(&h, "D1").await;

    let (status, body) = call(&h.app, "GET", "/devices/D1/state/desired", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    assert_eq!(body["config"]["device"], "D1");

    // Matching version: 304 with empty body.
    let (status, _) = call(&h.app, "GET", "/devices/D1/state/desired?version=1", None).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    // Operator bumps the state.
    let (status, body) = call(
        &h.app,
        "PUT",
        "/devices/D1/state/desired",
        Some(json!({"apps": {"a": {"image": "x:1"}}, "config": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);

    let (status, _) = call(&h.app, "GET", "/devices/D1/state/desired?version=1", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn reported_state_requires_api_key() {
    let h = harness().await;
    let bundle = provision(&h, "D1").await;
    let api_key = bundle["api"]["api_key"].as_str().unwrap();

    let body = json!({"apps": {}, "config": {"running": true}});

    let (status, _) = call(&h.app, "PUT", "/devices/D1/state/reported", Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call_with_headers(
        &h.app,
        "PUT",
        "/devices/D1/state/reported",
        Some(body.clone()),
        &[("x-api-key", "wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, reported) = call_with_headers(
        &h.app,
        "PUT",
        "/devices/D1/state/reported",
        Some(body),
        &[("x-api-key", api_key)],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reported["version"], 1);
}

#[tokio::test]
async fn job_flow_over_http() {
    let h = harness().await;
    let bundle = provision(&h, "D1").await;
    let api_key = bundle["api"]["api_key"].as_str().unwrap();

    let (status, job) = call(
        &h.app,
        "POST",
        "/devices/D1/jobs",
        Some(json!({"kind": "restart"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["status"], "pending");
    let job_id = job["id"].as_str().unwrap().to_string();

    // Illegal transition rejected with 409.
    let (status, _) = call_with_headers(
        &h.app,
        "POST",
        &format!("/jobs/{job_id}/status"),
        Some(json!({"status": "succeeded"})),
        &[("x-api-key", api_key)],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Cancel works from pending.
    let (status, canceled) = call(&h.app, "POST", &format!("/jobs/{job_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["status"], "canceled");

    let (status, jobs) = call(&h.app, "GET", "/devices/D1/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn scheduled_jobs_are_license_gated() {
    let h = harness().await;
    // Trial plan lacks the scheduled_jobs feature.
    let (status, body) = call(
        &h.app,
        "POST",
        "/admin/scheduled-jobs",
        Some(json!({
            "device_selector": {"type": "all"},
            "kind": "restart",
            "cron_expression": "0 0 3 * * *",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "LICENSE_FEATURE_DENIED");
}

#[tokio::test]
async fn provisioning_is_rate_limited() {
    let h = harness_with_limiter(2).await;
    let request = json!({"device_id": "D1", "provisioning_token": "bogus"});

    let (first, _) = call(&h.app, "POST", "/provision/key-exchange", Some(request.clone())).await;
    let (second, _) = call(&h.app, "POST", "/provision/key-exchange", Some(request.clone())).await;
    let (third, body) = call(&h.app, "POST", "/provision/key-exchange", Some(request)).await;

    assert_eq!(first, StatusCode::UNAUTHORIZED);
    assert_eq!(second, StatusCode::UNAUTHORIZED);
    assert_eq!(third, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn admin_key_lifecycle() {
    let h = harness().await;
    let (status, created) = call(
        &h.app,
        "POST",
        "/admin/provisioning-keys",
        Some(json!({"fleet_tag": "lab", "max_uses": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["token"].as_str().unwrap().len(), 64);
    let key_id = created["key"]["id"].as_i64().unwrap();

    // Listing never leaks hashes or plaintext.
    let (status, listed) = call(&h.app, "GET", "/admin/provisioning-keys", None).await;
    assert_eq!(status, StatusCode::OK);
    let listing = listed.to_string();
    assert!(!listing.contains("key_hash"));
    assert!(!listing.contains(created["token"].as_str().unwrap()));

    let (status, _) = call(
        &h.app,
        "DELETE",
        &format!("/admin/provisioning-keys/{key_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&h.app, "DELETE", "/admin/provisioning-keys/99999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retirement_frees_the_slot_and_disables_credentials() {
    let h = harness().await;
    let bundle = provision(&h, "D1").await;

    let (status, _) = call(&h.app, "POST", "/admin/devices/D1/retire", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, device) = call(&h.app, "GET", "/devices/D1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(device["admission_state"], "retired");

    let (status, _) = call(
        &h.app,
        "POST",
        "/auth/user",
        Some(json!({
            "username": "device-D1",
            "password": bundle["mqtt"]["password"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_device_is_404_with_error_envelope() {
    let h = harness().await;
    let (status, body) = call(&h.app, "GET", "/devices/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
