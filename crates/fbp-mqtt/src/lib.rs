// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound MQTT publishing and job-status ingestion.
//!
//! The backplane keeps exactly one broker session of its own, used to
//! publish job dispatch notifications on `agent/<device_id>/jobs` and to
//! ingest status updates from `agent/+/jobs/+/status`. Message routing is
//! the external broker's business; this crate only speaks to it as a
//! client.
//!
//! The [`Publisher`] trait is the seam components depend on, so tests run
//! against an in-memory recorder instead of a live broker.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use fbp_core::topic::JOB_STATUS_FILTER;
use fbp_error::{FleetError, FleetResult};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cheap, cloneable view of the broker session state.
///
/// Maintained by the session's event loop: `true` after a ConnAck,
/// `false` after a session error. A default instance reports
/// disconnected.
#[derive(Clone, Default)]
pub struct SessionStatus {
    connected: Arc<AtomicBool>,
}

impl SessionStatus {
    /// Returns `true` while the broker session is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set(&self, up: bool) {
        self.connected.store(up, Ordering::Relaxed);
    }
}

/// Outbound publish seam.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a JSON payload to `topic` (QoS 1, not retained).
    async fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> FleetResult<()>;
}

/// One inbound message from the status subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Full topic the device published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Connection settings for the backplane's own broker session.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// `mqtt://host:port` or `mqtts://host:port`.
    pub broker_url: String,
    /// Client identifier.
    pub client_id: String,
    /// Optional service-account credentials.
    pub username: Option<String>,
    /// Service-account password.
    pub password: Option<String>,
}

/// Parse `mqtt://host:port` / `mqtts://host:port` into `(host, port)`.
///
/// A bare `host` or `host:port` is accepted too; the default port is 1883
/// (8883 for `mqtts`).
pub fn parse_broker_url(url: &str) -> FleetResult<(String, u16)> {
    let (default_port, rest) = match url.split_once("://") {
        Some(("mqtt", rest)) | Some(("tcp", rest)) => (1883, rest),
        Some(("mqtts", rest)) | Some(("ssl", rest)) => (8883, rest),
        Some((scheme, _)) => {
            return Err(FleetError::bad_request(format!(
                "unsupported broker scheme '{scheme}'"
            )));
        }
        None => (1883, url),
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(FleetError::bad_request("broker url has no host"));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| FleetError::bad_request(format!("invalid broker port '{port}'")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), default_port)),
    }
}

/// The backplane's broker session.
///
/// Construction is lazy: the session dials on the first event-loop poll
/// and retries with a fixed backoff, so the daemon starts cleanly while
/// the broker is still coming up.
pub struct MqttConnection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
    status: SessionStatus,
}

impl MqttConnection {
    /// Open the session and subscribe to the job-status filter.
    ///
    /// Returns the connection plus the stream of inbound status messages.
    pub fn connect(settings: &MqttSettings) -> FleetResult<(Self, mpsc::Receiver<IncomingMessage>)> {
        let (host, port) = parse_broker_url(&settings.broker_url)?;
        let mut options = MqttOptions::new(settings.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(256);
        let status = SessionStatus::default();

        let subscriber = client.clone();
        let loop_status = status.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("broker session established");
                        loop_status.set(true);
                        // (Re-)subscribe after every connect.
                        if let Err(err) =
                            subscriber.subscribe(JOB_STATUS_FILTER, QoS::AtLeastOnce).await
                        {
                            warn!(error = %err, "status subscription failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = IncomingMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(message).await.is_err() {
                            // Receiver gone: ingestion shut down.
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        loop_status.set(false);
                        warn!(error = %err, "broker session error; backing off");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Ok((
            Self {
                client,
                event_loop,
                status,
            },
            rx,
        ))
    }

    /// A cloneable handle reporting whether the session is up.
    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    /// Disconnect and stop the event-loop task.
    pub async fn shutdown(&self) {
        let _ = self.client.disconnect().await;
        self.status.set(false);
        self.event_loop.abort();
    }
}

#[async_trait]
impl Publisher for MqttConnection {
    async fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> FleetResult<()> {
        let bytes = payload.to_string().into_bytes();
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| FleetError::internal("mqtt publish failed").with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_parsing() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local:1884").unwrap(),
            ("broker.local".into(), 1884)
        );
        assert_eq!(
            parse_broker_url("mqtts://broker.local").unwrap(),
            ("broker.local".into(), 8883)
        );
        assert_eq!(
            parse_broker_url("broker.local").unwrap(),
            ("broker.local".into(), 1883)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.2:1883/").unwrap(),
            ("10.0.0.2".into(), 1883)
        );
    }

    #[test]
    fn bad_broker_urls_rejected() {
        assert!(parse_broker_url("http://broker").is_err());
        assert!(parse_broker_url("mqtt://").is_err());
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
    }

    #[test]
    fn session_status_tracks_transitions() {
        let status = SessionStatus::default();
        assert!(!status.is_connected());
        status.set(true);
        assert!(status.is_connected());
        // Clones observe the same underlying state.
        let view = status.clone();
        status.set(false);
        assert!(!view.is_connected());
    }
}
