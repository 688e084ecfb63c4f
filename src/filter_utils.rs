use serde_json::{Map, Value};
use std::collections::HashMap;

/// Checks a raw exchange market record against `key = value` filters.
///
/// String fields must match exactly, array fields (e.g. `"permissions": ["SPOT"]`)
/// must contain the value, and numbers/booleans are compared as text.
/// A record missing a filtered key never matches.
pub fn matches_filters(record: &Map<String, Value>, filters: &HashMap<String, String>) -> bool {
    filters.iter().all(|(key, required_value)| match record.get(key) {
        Some(Value::String(s)) => s == required_value,
        Some(Value::Array(arr)) => arr.iter().any(|v| v.as_str() == Some(required_value.as_str())),
        Some(v) => &v.to_string() == required_value,
        None => false,
    })
}
