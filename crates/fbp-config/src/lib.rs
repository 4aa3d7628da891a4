// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the fleet backplane.
//!
//! This crate provides [`BackplaneConfig`], the single configuration
//! snapshot resolved at startup, together with helpers for loading from
//! TOML files, applying `FBP_*` environment overrides, and producing
//! advisory [`ConfigWarning`]s. Nothing below the boundary layer reads the
//! process environment.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The terminal-job retention horizon is unusually long.
    LongRetention {
        /// Configured horizon in days.
        days: u32,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LongRetention { days } => {
                write!(f, "jobs.retention_days is very long ({days} days)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the fleet backplane.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct BackplaneConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Durable storage settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// License envelope and verification key.
    #[serde(default)]
    pub license: LicenseConfig,
    /// Provisioning admission settings.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    /// Broker connection descriptor handed to devices and used for
    /// outbound publishes.
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// TLS material distributed in provisioning responses.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Default desired-state template for newly admitted devices.
    #[serde(default)]
    pub state: StateConfig,
    /// Job engine settings.
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Broker auth decision service settings.
    #[serde(default)]
    pub broker_auth: BrokerAuthConfig,
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bind address for the control-plane API.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Advertised API endpoint returned in provisioning bundles.
    #[serde(default)]
    pub api_endpoint: String,
    /// Server-side deadline applied to every inbound request.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_endpoint: String::new(),
            request_deadline_ms: default_request_deadline_ms(),
        }
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// SQLite database path. `":memory:"` is accepted for tests.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// License envelope and verification key.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LicenseConfig {
    /// Inline signed license envelope. Absent means unlicensed policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<String>,
    /// Path to a file holding the envelope; `envelope` wins when both set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_path: Option<String>,
    /// Base64-encoded Ed25519 verification key for the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Provisioning admission settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Allowed attempts per source identity inside one window.
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_attempts: u32,
    /// Window length in seconds.
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            rate_limit_attempts: default_rate_limit_attempts(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

/// Broker connection descriptor.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MqttConfig {
    /// Broker URL returned to devices and used for outbound publishes.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Client id for the backplane's own broker session.
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    /// Service-account username for the backplane's broker session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Service-account password. Never serialized outward.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Whether devices should verify the broker TLS certificate.
    #[serde(default = "default_true")]
    pub tls_verify: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id: default_mqtt_client_id(),
            username: None,
            password: None,
            tls_verify: true,
        }
    }
}

/// TLS material distributed in provisioning responses.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsConfig {
    /// Inline PEM CA bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    /// Path to a PEM CA bundle; `ca_bundle` wins when both set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_path: Option<String>,
}

/// Default desired-state template applied to newly admitted devices.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct StateConfig {
    /// The template itself, under the `state.default_template` key.
    #[serde(default)]
    pub default_template: StateTemplate,
}

/// The default desired-state template.
///
/// String values may contain the `{{device_id}}` placeholder, substituted
/// per device at admission time.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StateTemplate {
    /// Template applications object.
    #[serde(default = "empty_object")]
    pub apps: serde_json::Value,
    /// Template configuration object.
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

impl Default for StateTemplate {
    fn default() -> Self {
        Self {
            apps: empty_object(),
            config: empty_object(),
        }
    }
}

/// Job engine settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobsConfig {
    /// Days a terminal job is kept before the retention sweep deletes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Whether this process fires `ScheduledJob` templates.
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            scheduler_enabled: true,
        }
    }
}

/// Broker auth decision service settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BrokerAuthConfig {
    /// ACL cache entry time-to-live in milliseconds.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Independent decision deadline; expiry answers deny.
    #[serde(default = "default_decision_deadline_ms")]
    pub decision_deadline_ms: u64,
}

impl Default for BrokerAuthConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl_ms(),
            decision_deadline_ms: default_decision_deadline_ms(),
        }
    }
}

// -- serde defaults ---------------------------------------------------------

fn default_bind() -> String {
    "127.0.0.1:8080".into()
}
fn default_request_deadline_ms() -> u64 {
    10_000
}
fn default_db_path() -> String {
    "fleet-backplane.db".into()
}
fn default_rate_limit_attempts() -> u32 {
    10
}
fn default_rate_limit_window_secs() -> u64 {
    60
}
fn default_broker_url() -> String {
    "mqtt://127.0.0.1:1883".into()
}
fn default_mqtt_client_id() -> String {
    "fleet-backplane".into()
}
fn default_retention_days() -> u32 {
    30
}
fn default_cache_ttl_ms() -> u64 {
    5_000
}
fn default_decision_deadline_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Threshold above which retention generates a warning.
const LONG_RETENTION_DAYS: u32 = 365;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`BackplaneConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`BackplaneConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<BackplaneConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => BackplaneConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`BackplaneConfig`].
pub fn parse_toml(content: &str) -> Result<BackplaneConfig, ConfigError> {
    toml::from_str::<BackplaneConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `FBP_BIND`
/// - `FBP_DATABASE_PATH`
/// - `FBP_LOG_LEVEL`
/// - `FBP_MQTT_BROKER_URL`
/// - `FBP_LICENSE_PUBLIC_KEY`
pub fn apply_env_overrides(config: &mut BackplaneConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

fn apply_overrides_from(
    config: &mut BackplaneConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(val) = lookup("FBP_BIND") {
        config.server.bind = val;
    }
    if let Some(val) = lookup("FBP_DATABASE_PATH") {
        config.database.path = val;
    }
    if let Some(val) = lookup("FBP_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Some(val) = lookup("FBP_MQTT_BROKER_URL") {
        config.mqtt.broker_url = val;
    }
    if let Some(val) = lookup("FBP_LICENSE_PUBLIC_KEY") {
        config.license.public_key = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl BackplaneConfig {
    /// Semantic validation. Returns advisory warnings on success.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if let Some(ref level) = self.log_level {
            if !VALID_LOG_LEVELS.contains(&level.as_str()) {
                reasons.push(format!("unknown log_level '{level}'"));
            }
        }
        if self.server.request_deadline_ms == 0 {
            reasons.push("server.request_deadline_ms must be positive".into());
        }
        if self.provisioning.rate_limit_attempts == 0 {
            reasons.push("provisioning.rate_limit_attempts must be positive".into());
        }
        if self.jobs.retention_days == 0 {
            reasons.push("jobs.retention_days must be positive".into());
        }
        if self.license.envelope.is_some() || self.license.envelope_path.is_some() {
            if self.license.public_key.is_none() {
                reasons.push("license.envelope set without license.public_key".into());
            }
        } else if self.license.public_key.is_none() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "license.public_key".into(),
                hint: "no license configured; unlicensed trial policy applies".into(),
            });
        }
        if self.tls.ca_bundle.is_none() && self.tls.ca_bundle_path.is_none() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "tls.ca_bundle".into(),
                hint: "provisioning bundles will not carry a CA certificate".into(),
            });
        }
        if !self.state.default_template.apps.is_object()
            || !self.state.default_template.config.is_object()
        {
            reasons.push("state.default_template apps and config must be objects".into());
        }
        if self.jobs.retention_days > LONG_RETENTION_DAYS {
            warnings.push(ConfigWarning::LongRetention {
                days: self.jobs.retention_days,
            });
        }

        if reasons.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Resolve the license envelope: inline value first, then file.
    pub fn license_envelope(&self) -> Result<Option<String>, ConfigError> {
        if let Some(ref inline) = self.license.envelope {
            return Ok(Some(inline.clone()));
        }
        match self.license.envelope_path {
            Some(ref path) => std::fs::read_to_string(path)
                .map(|s| Some(s.trim().to_string()))
                .map_err(|_| ConfigError::FileNotFound { path: path.clone() }),
            None => Ok(None),
        }
    }

    /// Resolve the CA bundle distributed to devices: inline first, then file.
    pub fn ca_bundle(&self) -> Result<Option<String>, ConfigError> {
        if let Some(ref inline) = self.tls.ca_bundle {
            return Ok(Some(inline.clone()));
        }
        match self.tls.ca_bundle_path {
            Some(ref path) => std::fs::read_to_string(path)
                .map(Some)
                .map_err(|_| ConfigError::FileNotFound { path: path.clone() }),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate_cleanly() {
        let config = BackplaneConfig::default();
        let warnings = config.validate().unwrap();
        // No license and no CA configured out of the box.
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn parse_full_config() {
        let config = parse_toml(
            r#"
            log_level = "debug"

            [server]
            bind = "0.0.0.0:9443"
            api_endpoint = "https://api.fleet.example"
            request_deadline_ms = 5000

            [database]
            path = "/var/lib/fleet/backplane.db"

            [license]
            envelope = "abc.def"
            public_key = "c2VjcmV0"

            [provisioning]
            rate_limit_attempts = 5
            rate_limit_window_secs = 30

            [mqtt]
            broker_url = "mqtts://broker.fleet.example:8883"
            username = "backplane"
            password = "pw"

            [state.default_template.apps.core]
            image = "registry/core:stable"

            [state.default_template.config]
            log_level = "info"
            device = "{{device_id}}"

            [jobs]
            retention_days = 14
            scheduler_enabled = false

            [broker_auth]
            cache_ttl_ms = 2000
            decision_deadline_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9443");
        assert_eq!(config.provisioning.rate_limit_attempts, 5);
        assert_eq!(config.jobs.retention_days, 14);
        assert!(!config.jobs.scheduler_enabled);
        assert_eq!(config.broker_auth.decision_deadline_ms, 250);
        assert_eq!(
            config.state.default_template.apps["core"]["image"],
            serde_json::json!("registry/core:stable")
        );
        assert_eq!(
            config.state.default_template.config["device"],
            serde_json::json!("{{device_id}}")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mqtt_password_never_serialized() {
        let mut config = BackplaneConfig::default();
        config.mqtt.password = Some("secret".into());
        let out = toml::to_string(&config).unwrap();
        assert!(!out.contains("secret"));
    }

    #[test]
    fn envelope_without_key_is_invalid() {
        let mut config = BackplaneConfig::default();
        config.license.envelope = Some("abc.def".into());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn unknown_log_level_is_invalid() {
        let mut config = BackplaneConfig::default();
        config.log_level = Some("loud".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn long_retention_warns() {
        let mut config = BackplaneConfig::default();
        config.jobs.retention_days = 3650;
        let warnings = config.validate().unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LongRetention { days: 3650 })));
    }

    #[test]
    fn inline_envelope_wins_over_path() {
        let mut config = BackplaneConfig::default();
        config.license.envelope = Some("inline".into());
        config.license.envelope_path = Some("/nonexistent".into());
        assert_eq!(config.license_envelope().unwrap().as_deref(), Some("inline"));
    }

    #[test]
    fn envelope_path_is_read_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "abc.def  ").unwrap();
        let mut config = BackplaneConfig::default();
        config.license.envelope_path = Some(file.path().display().to_string());
        assert_eq!(config.license_envelope().unwrap().as_deref(), Some("abc.def"));
    }

    #[test]
    fn missing_file_errors() {
        let err = load_config(Some(Path::new("/nonexistent/fleet.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn overrides_apply_on_top_of_file_values() {
        let mut config = BackplaneConfig::default();
        apply_overrides_from(&mut config, |name| match name {
            "FBP_MQTT_BROKER_URL" => Some("mqtt://override:1883".into()),
            "FBP_LOG_LEVEL" => Some("trace".into()),
            _ => None,
        });
        assert_eq!(config.mqtt.broker_url, "mqtt://override:1883");
        assert_eq!(config.log_level.as_deref(), Some("trace"));
        // Untouched sections keep their defaults.
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }
}
