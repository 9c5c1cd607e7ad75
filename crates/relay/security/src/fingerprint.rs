//! Canonical fingerprints used as idempotency keys.

use serde_json::Value;

use relay_types::BackendRef;

/// Serialize `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
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
        other => out.push_str(&other.to_string()),
    }
}

/// Blake3 hex digest over target, template and canonical input.
///
/// Identical inputs always produce the same key regardless of object key
/// order; any change to target, template or input yields a different key.
pub fn fingerprint(target: &BackendRef, template: Option<&str>, input: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(target.kind.to_string().as_bytes());
    hasher.update(&[0]);
    hasher.update(target.name.as_bytes());
    hasher.update(&[0]);
    match template {
        Some(t) => {
            hasher.update(&[1]);
            hasher.update(t.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&[0]);
    hasher.update(canonical_json(input).as_bytes());
    hasher.finalize().to_hex().to_string()
}
