//! Stable-key-order JSON serialization used to compare peer results for
//! quorum agreement (SPEC_FULL.md §4.4 "Canonical form").
//!
//! Two peer responses agree iff their canonical strings are byte-identical.
//! Numerically-equal-but-textually-different values (`1` vs `1.0`) disagree
//! by design: Electrum payloads are strings/hex/fixed objects, so false
//! mismatches are rare and false matches would be far more dangerous.

use serde_json::Value;

/// Serializes `value` with object keys sorted lexicographically at every
/// level. Array element order is preserved; only object key order is
/// unstable in JSON.
pub fn canonicalize(value: &Value) -> String {
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
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string keys always serialize"));
                out.push(':');
                write_canonical(&map[*key], out);
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
