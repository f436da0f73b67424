//! Execution history: `StepRecord` and semantic-description derivation (§3).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One attempt at executing a step. A step is "in history" iff it has at
/// least one record; the number of records for a given id equals the
/// number of attempts (invariant iii).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub step_num: u32,
    pub tool_name: String,
    pub description: String,
    pub arguments: Map<String, Value>,
    pub output: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub target: String,
    pub semantic_description: String,
    pub input_summary: String,
    pub output_summary: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Auto-derives a short human/LLM-readable summary of a step's output
/// when the tool did not provide one (§3, §4.5 step 6), by inspecting a
/// handful of well-known output keys.
pub fn derive_semantic_description(output: &Value) -> String {
    let obj = match output.as_object() {
        Some(o) => o,
        None => return "produced a result".to_string(),
    };

    if let Some(len) = array_len(obj, &["documents", "docs"]) {
        return format!("returned {len} documents");
    }
    if let Some(len) = array_len(obj, &["results"]) {
        return format!("returned {len} results");
    }
    if let Some(len) = array_len(obj, &["queries"]) {
        return format!("generated {len} queries");
    }
    if let Some(len) = array_len(obj, &["outline"]) {
        return format!("produced an outline with {len} sections");
    }
    if let Some(text) = obj.get("content").and_then(Value::as_str) {
        return format!("produced content ({} chars)", text.len());
    }
    if let Some(msg) = obj.get("message").and_then(Value::as_str) {
        return msg.to_string();
    }
    "produced a result".to_string()
}

fn array_len(obj: &Map<String, Value>, keys: &[&str]) -> Option<usize> {
    for key in keys {
        if let Some(Value::Array(items)) = obj.get(*key) {
            return Some(items.len());
        }
    }
    None
}

/// Ordered, append-only execution history for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    records: Vec<StepRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn attempts_for(&self, step_id: &str) -> usize {
        self.records.iter().filter(|r| r.step_id == step_id).count()
    }

    pub fn has_record(&self, step_id: &str) -> bool {
        self.attempts_for(step_id) > 0
    }

    pub fn last(&self, n: usize) -> &[StepRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// Repeated-failure detection (§4.7): of the last 5 results, >= 3 failed.
    pub fn has_repeated_failure(&self) -> bool {
        let recent = self.last(5);
        recent.iter().filter(|r| !r.success).count() >= 3 && recent.len() >= 3
    }

    /// Cyclic-repetition detection (§4.7): any step id appears > 3 times.
    pub fn has_circular_repetition(&self) -> Option<String> {
        use std::collections::HashMap;
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for r in &self.records {
            *counts.entry(r.step_id.as_str()).or_insert(0) += 1;
        }
        counts.into_iter().find(|(_, c)| *c > 3).map(|(id, _)| id.to_string())
    }

    /// Two failures in the trailing three steps (§4.7 failure-driven rule).
    pub fn two_failures_in_trailing_three(&self) -> bool {
        self.last(3).iter().filter(|r| !r.success).count() >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, success: bool) -> StepRecord {
        StepRecord {
            step_id: id.to_string(),
            step_num: 1,
            tool_name: "t".into(),
            description: "d".into(),
            arguments: Map::new(),
            output: json!({}),
            success,
            error: None,
            target: "t".into(),
            semantic_description: "ok".into(),
            input_summary: String::new(),
            output_summary: String::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn derives_document_count_description() {
        let out = json!({"documents": ["a", "b", "c"]});
        assert_eq!(derive_semantic_description(&out), "returned 3 documents");
    }

    #[test]
    fn derives_query_count_description() {
        let out = json!({"queries": ["q1", "q2"]});
        assert_eq!(derive_semantic_description(&out), "generated 2 queries");
    }

    #[test]
    fn falls_back_to_generic_description() {
        let out = json!({"unrelated": true});
        assert_eq!(derive_semantic_description(&out), "produced a result");
    }

    #[test]
    fn attempts_for_counts_all_records_for_id() {
        let mut h = History::new();
        h.push(record("s1", false));
        h.push(record("s1", true));
        h.push(record("s2", true));
        assert_eq!(h.attempts_for("s1"), 2);
        assert_eq!(h.attempts_for("s2"), 1);
        assert_eq!(h.attempts_for("s3"), 0);
    }

    #[test]
    fn detects_repeated_failure_in_last_five() {
        let mut h = History::new();
        h.push(record("s1", false));
        h.push(record("s2", false));
        h.push(record("s3", true));
        h.push(record("s4", false));
        assert!(h.has_repeated_failure());
    }

    #[test]
    fn detects_circular_repetition_past_three_occurrences() {
        let mut h = History::new();
        for _ in 0..4 {
            h.push(record("loop_step", false));
        }
        assert_eq!(h.has_circular_repetition(), Some("loop_step".to_string()));
    }

    #[test]
    fn no_circular_repetition_at_exactly_three() {
        let mut h = History::new();
        for _ in 0..3 {
            h.push(record("loop_step", false));
        }
        assert_eq!(h.has_circular_repetition(), None);
    }
}
