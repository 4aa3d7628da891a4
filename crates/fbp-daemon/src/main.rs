// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fbp_brokerauth::BrokerAuthService;
use fbp_bus::EventBus;
use fbp_config::BackplaneConfig;
use fbp_crypto::PlatformKeyPair;
use fbp_daemon::{AppState, build_app};
use fbp_identity::IdentityService;
use fbp_jobs::{JobEngine, JobEngineConfig};
use fbp_license::LicenseAuthority;
use fbp_mqtt::{MqttConnection, MqttSettings, Publisher};
use fbp_provision::{BundleConfig, NoVpn, ProvisioningCoordinator};
use fbp_ratelimit::SourceRateLimiter;
use fbp_state::StateEngine;
use fbp_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// System-config key holding the platform private key (PKCS#8 PEM).
const CONFIG_PLATFORM_KEY: &str = "platform.private_key";

#[derive(Parser, Debug)]
#[command(name = "fbp-daemon", version, about = "Fleet backplane control-plane daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = fbp_config::load_config(args.config.as_deref()).context("load configuration")?;
    init_tracing(&config, args.debug);
    for warning in config.validate().context("validate configuration")? {
        warn!(%warning, "configuration warning");
    }

    let bus = Arc::new(EventBus::new());
    let store = Store::open(&config.database.path, Arc::clone(&bus))
        .await
        .with_context(|| format!("open database {}", config.database.path))?;

    let keys = Arc::new(platform_keys(&store).await.context("platform key pair")?);

    let verifying_key = config
        .license
        .public_key
        .as_deref()
        .map(fbp_crypto::license::decode_verifying_key)
        .transpose()
        .context("license public key")?;
    let envelope = config.license_envelope().context("license envelope")?;
    let license = Arc::new(LicenseAuthority::new(store.clone(), envelope, verifying_key));
    license.init().await.context("license init")?;

    let identity = IdentityService::new(store.clone());
    let state_engine = StateEngine::new(
        store.clone(),
        config.state.default_template.apps.clone(),
        config.state.default_template.config.clone(),
    );

    let (mqtt, status_rx) = MqttConnection::connect(&MqttSettings {
        broker_url: config.mqtt.broker_url.clone(),
        client_id: config.mqtt.client_id.clone(),
        username: config.mqtt.username.clone(),
        password: config.mqtt.password.clone(),
    })
    .context("broker session")?;
    let mqtt = Arc::new(mqtt);

    let jobs = Arc::new(JobEngine::new(
        store.clone(),
        Arc::clone(&mqtt) as Arc<dyn Publisher>,
    ));

    let coordinator = Arc::new(ProvisioningCoordinator::new(
        store.clone(),
        identity.clone(),
        Arc::clone(&license),
        state_engine.clone(),
        Arc::clone(&keys),
        BundleConfig {
            api_endpoint: config.server.api_endpoint.clone(),
            broker_url: config.mqtt.broker_url.clone(),
            tls_ca: config.ca_bundle().context("tls ca bundle")?,
            tls_verify: config.mqtt.tls_verify,
        },
        Arc::new(NoVpn),
    ));

    let broker_auth = BrokerAuthService::new(
        store.clone(),
        Duration::from_millis(config.broker_auth.cache_ttl_ms),
        Duration::from_millis(config.broker_auth.decision_deadline_ms),
    );

    // Background tasks. All of them stop with the process.
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        Arc::clone(&broker_auth).run_invalidation(bus.subscribe()),
    ));
    tasks.push(tokio::spawn(Arc::clone(&jobs).run_dispatcher(bus.subscribe())));
    tasks.push(tokio::spawn(Arc::clone(&jobs).run_status_ingest(status_rx)));
    tasks.push(tokio::spawn(Arc::clone(&jobs).run_maintenance(JobEngineConfig {
        retention_days: config.jobs.retention_days,
        ..JobEngineConfig::default()
    })));
    if config.jobs.scheduler_enabled {
        tasks.push(tokio::spawn(
            Arc::clone(&jobs).run_scheduler(Duration::from_secs(10)),
        ));
    } else {
        info!("scheduled-job firing disabled in this process");
    }

    let state = Arc::new(AppState {
        store,
        identity,
        license,
        state_engine,
        jobs,
        broker_auth,
        coordinator,
        mqtt_status: mqtt.status(),
        provision_limiter: SourceRateLimiter::new(
            config.provisioning.rate_limit_attempts,
            Duration::from_secs(config.provisioning.rate_limit_window_secs),
        ),
        request_deadline: Duration::from_millis(config.server.request_deadline_ms),
        started_at: Instant::now(),
    });

    let app = build_app(state);
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, broker = %config.mqtt.broker_url, "fbp-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!("shutting down");
    for task in &tasks {
        task.abort();
    }
    mqtt.shutdown().await;
    Ok(())
}

fn init_tracing(config: &BackplaneConfig, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        let level = config.log_level.as_deref().unwrap_or("info");
        EnvFilter::new(level.to_string())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load the platform key pair from system config, generating it on first
/// boot.
async fn platform_keys(store: &Store) -> Result<PlatformKeyPair> {
    if let Some(value) = store.get_config(CONFIG_PLATFORM_KEY).await? {
        let pem: String = serde_json::from_value(value).context("stored platform key shape")?;
        return Ok(PlatformKeyPair::from_private_pem(&pem)?);
    }

    info!("generating platform key pair (first boot)");
    let keys = PlatformKeyPair::generate()?;
    store
        .set_config(
            CONFIG_PLATFORM_KEY,
            &serde_json::to_value(keys.private_pem()?).context("platform key serialization")?,
        )
        .await?;
    Ok(keys)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
}
