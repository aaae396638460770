//! Inbound payload normalization.
//!
//! Depending on server-side serialization the broker may deliver the
//! application payload wrapped in one or two framing layers: a JSON string
//! instead of an object, a `body` envelope whose value is itself a JSON
//! string, and a nested `payload` field. Every inbound message goes through
//! [`normalize_payload`] before reaching application callbacks so callbacks
//! always see the innermost value.

use serde_json::Value;

/// Normalize a raw message body to the innermost application value.
///
/// Idempotent and infallible: anything that cannot be unwrapped further is
/// passed through as-is rather than dropped.
pub fn normalize_payload(raw: &str) -> Value {
    unwrap_envelopes(parse_lenient(raw))
}

/// Normalize a value that has already been parsed (or constructed) as JSON.
pub fn normalize_value(value: Value) -> Value {
    unwrap_envelopes(value)
}

/// Parse a string as JSON, falling back to the raw string.
fn parse_lenient(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn unwrap_envelopes(value: Value) -> Value {
    // One `body` envelope level; a string body may itself be JSON.
    let value = match take_field(value, "body") {
        Ok(Value::String(s)) => parse_lenient(&s),
        Ok(inner) => inner,
        Err(original) => original,
    };

    // One nested `payload` level.
    match take_field(value, "payload") {
        Ok(inner) => inner,
        Err(original) => original,
    }
}

/// Extract `field` from an object, or give the value back unchanged.
fn take_field(value: Value, field: &str) -> Result<Value, Value> {
    match value {
        Value::Object(mut map) if map.contains_key(field) => {
            Ok(map.remove(field).unwrap_or(Value::Null))
        }
        other => Err(other),
    }
}
