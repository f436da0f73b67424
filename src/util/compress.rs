//! Compressing state and history into compact, token-frugal prompt views.
//!
//! Shared by ParameterBuilder's LLM-fallback phase, ReplanManager's replan
//! prompts, and the consistency checker's pre-execution prompt: all three
//! need a bounded, stable textual rendering of the current state rather
//! than the full JSON tree.

use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const LIST_TRUNCATE_AFTER: usize = 5;
const DICT_CHAR_LIMIT: usize = 500;
const STRING_CHAR_LIMIT: usize = 500;

/// Recursively compresses a JSON value for inclusion in an LLM prompt.
///
/// - Arrays longer than 5 elements are replaced by their first 5 elements
///   plus a `"...N more"` marker.
/// - Objects whose compact JSON rendering exceeds 500 characters are
///   replaced by a `"{...N keys}"` summary.
/// - Strings longer than 500 characters are truncated with an ellipsis.
pub fn compress_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            if items.len() > LIST_TRUNCATE_AFTER {
                let mut out: Vec<Value> = items[..LIST_TRUNCATE_AFTER]
                    .iter()
                    .map(compress_value)
                    .collect();
                out.push(Value::String(format!("...{} more", items.len() - LIST_TRUNCATE_AFTER)));
                Value::Array(out)
            } else {
                Value::Array(items.iter().map(compress_value).collect())
            }
        }
        Value::Object(map) => {
            let rendered = serde_json::to_string(value).unwrap_or_default();
            if rendered.len() > DICT_CHAR_LIMIT {
                Value::String(format!("{{...{} keys}}", map.len()))
            } else {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), compress_value(v));
                }
                Value::Object(out)
            }
        }
        Value::String(s) => {
            if s.len() > STRING_CHAR_LIMIT {
                Value::String(format!("{}...", &s[..STRING_CHAR_LIMIT]))
            } else {
                Value::String(s.clone())
            }
        }
        other => other.clone(),
    }
}

/// Renders a compressed value as a compact JSON string for prompt inclusion.
pub fn compress_state_for_prompt(state: &Value) -> String {
    serde_json::to_string(&compress_value(state)).unwrap_or_default()
}

/// A stable hash of the compressed-state string, used as the `stateFingerprint`
/// component of the parameter-builder cache key (§9 Design Notes: two
/// syntactically different but semantically identical states must hash
/// equal after compression — compressing first and hashing the compressed
/// form, not the raw state, achieves that).
pub fn state_fingerprint(state: &Value) -> u64 {
    let compressed = compress_state_for_prompt(state);
    let mut hasher = DefaultHasher::new();
    compressed.hash(&mut hasher);
    hasher.finish()
}

/// Truncates free text to `limit` characters, appending an ellipsis marker
/// if truncated. Used for trace overview previews (§4.8: prompt/response
/// truncated to 500 chars for overview, full text for detailed reports).
pub fn truncate_preview(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(limit).collect();
        format!("{truncated}...")
    }
}
