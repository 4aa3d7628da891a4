// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared harness assembling the whole core over a file-backed store.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fbp_brokerauth::BrokerAuthService;
use fbp_bus::EventBus;
use fbp_crypto::PlatformKeyPair;
use fbp_error::{FleetError, FleetResult};
use fbp_identity::IdentityService;
use fbp_jobs::JobEngine;
use fbp_license::LicenseAuthority;
use fbp_mqtt::{IncomingMessage, Publisher};
use fbp_provision::{
    BundleConfig, KeyExchangeRequest, KeyExchangeResponse, NoVpn, ProvisionBundle,
    ProvisioningCoordinator,
};
use fbp_state::StateEngine;
use fbp_store::Store;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Publisher that records instead of talking to a broker.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> FleetResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

/// The assembled core, on a file-backed store so tests can exercise real
/// cross-connection concurrency.
pub struct Fleet {
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub identity: IdentityService,
    pub license: Arc<LicenseAuthority>,
    pub state_engine: StateEngine,
    pub jobs: Arc<JobEngine>,
    pub broker_auth: Arc<BrokerAuthService>,
    pub coordinator: Arc<ProvisioningCoordinator>,
    pub publisher: Arc<RecordingPublisher>,
    pub token: String,
    keys: Arc<PlatformKeyPair>,
    _workdir: tempfile::TempDir,
}

impl Fleet {
    /// Assemble the core under the unlicensed trial policy with one
    /// provisioning key (`max_uses` as given).
    pub async fn trial(max_uses: Option<i64>) -> Self {
        let workdir = tempfile::TempDir::new().expect("tempdir");
        let db_path = workdir.path().join("fleet.db");

        let bus = Arc::new(EventBus::new());
        let store = Store::open(&db_path.display().to_string(), Arc::clone(&bus))
            .await
            .expect("open store");

        let identity = IdentityService::new(store.clone());
        let license = Arc::new(LicenseAuthority::new(store.clone(), None, None));
        license.init().await.expect("license init");

        let state_engine = StateEngine::new(
            store.clone(),
            json!({"core": {"image": "registry/core:stable"}}),
            json!({"device": "{{device_id}}"}),
        );

        let publisher = Arc::new(RecordingPublisher::default());
        let jobs = Arc::new(JobEngine::new(
            store.clone(),
            Arc::clone(&publisher) as Arc<dyn Publisher>,
        ));

        let keys = Arc::new(PlatformKeyPair::generate().expect("keypair"));
        let issued = identity
            .create_provisioning_key(Some("lab"), max_uses, None)
            .await
            .expect("provisioning key");

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
        tokio::spawn(Arc::clone(&broker_auth).run_invalidation(bus.subscribe()));

        Self {
            store,
            bus,
            identity,
            license,
            state_engine,
            jobs,
            broker_auth,
            coordinator,
            publisher,
            token: issued.token,
            keys,
            _workdir: workdir,
        }
    }

    pub fn platform_public_pem(&self) -> String {
        self.keys.public_pem().expect("public pem")
    }

    /// Phase 1 without a device key: fetch the platform public key.
    pub async fn phase1_fetch_platform_key(&self, device_id: &str) -> String {
        let response = self
            .coordinator
            .key_exchange(
                KeyExchangeRequest {
                    device_id: device_id.into(),
                    provisioning_token: self.token.clone(),
                    device_public_key: None,
                },
                "test",
            )
            .await
            .expect("phase 1");
        match response {
            KeyExchangeResponse::PlatformKey {
                platform_public_key,
                ..
            } => platform_public_key,
            other => panic!("unexpected phase-1 response: {other:?}"),
        }
    }

    /// Phase 1 with a device key: register it.
    pub async fn phase1_store_device_key(&self, device_id: &str, pem: &str) {
        let response = self
            .coordinator
            .key_exchange(
                KeyExchangeRequest {
                    device_id: device_id.into(),
                    provisioning_token: self.token.clone(),
                    device_public_key: Some(pem.into()),
                },
                "test",
            )
            .await
            .expect("phase 1 with key");
        assert!(matches!(response, KeyExchangeResponse::Accepted { ok: true }));
    }

    /// Phase 2 with a well-formed wrapped payload for `device_id`.
    pub async fn register(&self, device_id: &str) -> Result<ProvisionBundle, FleetError> {
        let wrapped = wrap_registration(&self.platform_public_pem(), device_id, &self.token);
        self.coordinator.register(&wrapped, "test").await
    }

    /// Feed a status report through the MQTT ingestion path.
    pub async fn job_status_via_mqtt(
        &self,
        device_id: &str,
        job_id: Uuid,
        status: &str,
    ) -> FleetResult<()> {
        self.jobs
            .ingest_status_message(&IncomingMessage {
                topic: format!("agent/{device_id}/jobs/{job_id}/status"),
                payload: json!({"status": status}).to_string().into_bytes(),
            })
            .await
    }
}

/// Wrap a registration payload the way a device would.
pub fn wrap_registration(platform_pem: &str, device_id: &str, token: &str) -> String {
    let payload = json!({
        "device_id": device_id,
        "provisioning_token": token,
        "display_name": format!("Gw-{device_id}"),
        "kind": "gateway",
        "mac_address": "AA:BB:CC:DD:EE:01",
        "os_version": "x",
        "agent_version": "1.0",
    });
    let wrapped = fbp_crypto::keys::wrap_payload(platform_pem, payload.to_string().as_bytes())
        .expect("wrap payload");
    BASE64.encode(wrapped)
}
