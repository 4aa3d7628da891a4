// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON serialization and the state content hash.
//!
//! Canonical form: object keys sorted lexicographically at every depth,
//! no insignificant whitespace, integers without a fractional part, floats
//! in shortest-round-trip decimal form. Two equal logical states always
//! produce byte-identical output, so the derived hash is a stable ETag.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

/// Compute the 64-hex-char content hash over a state record's `apps` and
/// `config` objects.
///
/// The two objects are wrapped in a fixed envelope so that
/// `hash_state(a, b) != hash_state(b, a)`.
pub fn hash_state(apps: &Value, config: &Value) -> String {
    let mut out = String::from("{\"apps\":");
    write_canonical(&mut out, apps);
    out.push_str(",\"config\":");
    write_canonical(&mut out, config);
    out.push('}');

    let mut hasher = Sha256::new();
    hasher.update(out.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders integers without a fractional part and floats
        // via shortest-round-trip (ryu); NaN/Infinity are unrepresentable.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_canonical(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

/// Minimal JSON string escaping: quote, backslash, and control characters.
fn write_escaped(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
