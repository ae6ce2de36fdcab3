//! Canonical JSON for signed operations.
//!
//! Canonical form: UTF-8, object keys sorted ASCII-ascending at every
//! level, no insignificant whitespace, integers without trailing decimals,
//! strings NFC-normalised. Signature verification happens outside the
//! core; the core records the canonical payload hash on the transaction
//! record for auditing.

use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::hash::sha256;

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Hex SHA-256 of the canonical rendering.
pub fn payload_hash(value: &Value) -> String {
    hex::encode(sha256(canonical_json(value).as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json's default map is a BTreeMap, but sort explicitly
            // so canonicalisation does not depend on a feature flag.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    let normalised: String = s.nfc().collect();
    out.push('"');
    for c in normalised.chars() {
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
