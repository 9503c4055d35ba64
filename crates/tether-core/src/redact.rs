//! Secret redaction for structured values.
//!
//! Every payload-bearing structured-log field goes through [`redact_value`]
//! before serialization. A key is sensitive when it equals `authorization`
//! or contains one of the substrings `secret`, `token`, `apikey`,
//! `password` (case-insensitive). Nested objects and arrays are walked
//! recursively.

use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_SUBSTRINGS: &[&str] = &["secret", "token", "apikey", "password"];

pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    if key == "authorization" {
        return true;
    }
    SENSITIVE_SUBSTRINGS.iter().any(|s| key.contains(s))
}

/// Replace values under sensitive keys with `"[REDACTED]"`, in place.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact_value(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        _ => {}
    }
}

/// Owned-value convenience wrapper around [`redact_value`].
pub fn redacted(mut value: Value) -> Value {
    redact_value(&mut value);
    value
}
