//! Recursive masking of sensitive argument values.
//!
//! Any value stored under a key matching the sensitive-key pattern is
//! replaced with the literal `[REDACTED]`.  The sanitised copy is what the
//! approval queue, audit hooks, and `accepted` responses carry; downstream
//! components never see the raw secret.

use std::sync::LazyLock;

use regex::RegexBuilder;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

static SENSITIVE_KEYS: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"password|secret|token|api_key|cvv|card|ssn|credentials")
        .case_insensitive(true)
        .build()
        .expect("static sensitive-key pattern compiles")
});

/// Return a copy of `value` with every sensitive-keyed entry masked.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if SENSITIVE_KEYS.is_match(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_owned()));
                } else {
                    out.insert(k.clone(), sanitize(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}
