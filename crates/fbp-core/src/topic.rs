// SPDX-License-Identifier: MIT OR Apache-2.0
//! MQTT topic grammar: pattern matching and the per-device namespace.
//!
//! Matching rules:
//! - segments are separated by `/`;
//! - `+` matches exactly one non-empty segment;
//! - `#` matches one or more trailing segments and may appear only as the
//!   last segment;
//! - every other character is literal.

use crate::{MqttAcl, Permissions, device_username};

/// Returns `true` when `pattern` is well-formed: non-empty, and `#` appears
/// only as the final segment.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let segments: Vec<&str> = pattern.split('/').collect();
    let last = segments.len() - 1;
    segments
        .iter()
        .enumerate()
        .all(|(i, seg)| !seg.contains('#') || (*seg == "#" && i == last))
}

/// Evaluate `topic` against `pattern`.
///
/// Ill-formed patterns never match; this keeps ACL evaluation fail-closed
/// even if a malformed row reaches the store.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if !is_valid_pattern(pattern) || topic.is_empty() {
        return false;
    }

    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();

    for (i, pat) in pattern_segments.iter().enumerate() {
        match *pat {
            // `#` consumes one or more remaining segments.
            "#" => return topic_segments.len() > i,
            "+" => match topic_segments.get(i) {
                Some(seg) if !seg.is_empty() => {}
                _ => return false,
            },
            literal => match topic_segments.get(i) {
                Some(seg) if *seg == literal => {}
                _ => return false,
            },
        }
    }

    topic_segments.len() == pattern_segments.len()
}

// ---------------------------------------------------------------------------
// Device namespace
// ---------------------------------------------------------------------------

/// The ACL triple every device account holds, and nothing beyond it:
/// read+write on `agent/<id>/#` and `state/<id>/#`, write-only on
/// `sensor/<id>/#`.
pub fn device_acl_set(device_id: &str) -> Vec<MqttAcl> {
    let username = device_username(device_id);
    vec![
        MqttAcl {
            username: username.clone(),
            topic_pattern: format!("agent/{device_id}/#"),
            permissions: Permissions::READ_WRITE,
        },
        MqttAcl {
            username: username.clone(),
            topic_pattern: format!("state/{device_id}/#"),
            permissions: Permissions::READ_WRITE,
        },
        MqttAcl {
            username,
            topic_pattern: format!("sensor/{device_id}/#"),
            permissions: Permissions::WRITE,
        },
    ]
}

/// Topic the job engine publishes dispatch notifications on.
pub fn job_notify_topic(device_id: &str) -> String {
    format!("agent/{device_id}/jobs")
}

/// Subscription filter covering every device's job status topic.
pub const JOB_STATUS_FILTER: &str = "agent/+/jobs/+/status";

/// Parse `agent/<device_id>/jobs/<job_id>/status` into its identifiers.
pub fn parse_job_status_topic(topic: &str) -> Option<(&str, &str)> {
    let mut segments = topic.split('/');
    match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some("agent"), Some(device_id), Some("jobs"), Some(job_id), Some("status"), None)
            if !device_id.is_empty() && !job_id.is_empty() =>
        {
            Some((device_id, job_id))
        }
        _ => None,
    }
}
