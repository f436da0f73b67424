//! The task-local blackboard: a single nested mapping keyed by dotted
//! paths, with three reserved top-level keys (`inputs`, `control`,
//! `steps`) and otherwise open, flat keys written by tools.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kernel-owned execution control block (`control.*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlBlock {
    pub iterations: u32,
    pub max_iterations: u32,
    pub failed_steps: Vec<String>,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self { iterations: 0, max_iterations: 20, failed_steps: Vec::new() }
    }
}

/// A single step's recorded output (`steps.<id>.output`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutput {
    pub tool: String,
    pub output: Value,
}

/// The task-local nested mapping that carries data between steps.
///
/// Reserved top-level keys: `inputs` (immutable, user-provided), `control`
/// (kernel-owned), `steps` (per-step output). All other top-level keys are
/// flat, tool-written state written according to a tool's output schema
/// and `stateMapping`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    root: Map<String, Value>,
}

impl Default for State {
    fn default() -> Self {
        let mut root = Map::new();
        root.insert("inputs".to_string(), Value::Object(Map::new()));
        root.insert(
            "control".to_string(),
            serde_json::to_value(ControlBlock::default()).expect("control block serializes"),
        );
        root.insert("steps".to_string(), Value::Object(Map::new()));
        Self { root }
    }
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a state with a given set of immutable user inputs.
    pub fn with_inputs(inputs: Map<String, Value>) -> Self {
        let mut s = Self::default();
        s.root.insert("inputs".to_string(), Value::Object(inputs));
        s
    }

    /// Returns the whole blackboard as a raw JSON value (e.g. for a trace
    /// `done` payload, or for persistence).
    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(root) => Some(Self { root }),
            _ => None,
        }
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        match self.root.get("inputs") {
            Some(Value::Object(m)) => m,
            _ => unreachable!("inputs is always an object"),
        }
    }

    pub fn control(&self) -> ControlBlock {
        self.root
            .get("control")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_control(&mut self, control: ControlBlock) {
        self.root.insert(
            "control".to_string(),
            serde_json::to_value(control).expect("control block serializes"),
        );
    }

    pub fn increment_iterations(&mut self) -> u32 {
        let mut c = self.control();
        c.iterations += 1;
        let n = c.iterations;
        self.set_control(c);
        n
    }

    pub fn mark_step_failed(&mut self, step_id: &str) {
        let mut c = self.control();
        if !c.failed_steps.iter().any(|s| s == step_id) {
            c.failed_steps.push(step_id.to_string());
        }
        self.set_control(c);
    }

    /// `steps.<id>.output`, if that step has executed and succeeded.
    pub fn step_output(&self, step_id: &str) -> Option<StepOutput> {
        self.root
            .get("steps")?
            .as_object()?
            .get(step_id)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Records a step's output. Satisfies invariant (i): a `steps.<id>.output`
    /// entry exists iff the step executed and its tool returned success.
    pub fn set_step_output(&mut self, step_id: &str, tool: &str, output: Value) {
        let steps = self
            .root
            .entry("steps".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = steps {
            map.insert(
                step_id.to_string(),
                serde_json::to_value(StepOutput { tool: tool.to_string(), output })
                    .expect("step output serializes"),
            );
        }
    }

    /// Writes a flat top-level key (a tool's mapped output field).
    pub fn set_flat(&mut self, key: &str, value: Value) {
        self.root.insert(key.to_string(), value);
    }

    /// Looks up a dotted path against the full blackboard, e.g.
    /// `inputs.query`, `steps.step_1.output.documents`, or a flat
    /// top-level key like `last_failure.search`.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        get_path_in(&Value::Object(self.root.clone()), path)
    }

    pub fn set_path(&mut self, path: &str, value: Value) {
        set_path_in(&mut self.root, path, value);
    }
}

/// Navigates a dotted path (`a.b.c`, `a.0.b` for array indices) through a
/// JSON tree. Returns `None` on any missing segment — dotted-path lookup
/// never panics on schema-unknown keys.
pub fn get_path_in(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

fn set_path_in(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_path_segments(root, &segments, value);
}

fn set_path_segments(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(nested) = entry {
                set_path_segments(nested, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_state_has_reserved_keys() {
        let s = State::new();
        assert!(s.inputs().is_empty());
        assert_eq!(s.control(), ControlBlock::default());
        assert!(s.step_output("anything").is_none());
    }

    #[test]
    fn set_and_get_step_output_roundtrips() {
        let mut s = State::new();
        s.set_step_output("step_1", "search", json!({"documents": ["a", "b"]}));
        let out = s.step_output("step_1").unwrap();
        assert_eq!(out.tool, "search");
        assert_eq!(out.output["documents"][0], "a");
    }

    #[test]
    fn dotted_path_lookup_into_step_output() {
        let mut s = State::new();
        s.set_step_output("step_1", "search", json!({"documents": ["a", "b"]}));
        let v = s.get_path("steps.step_1.output.documents.1").unwrap();
        assert_eq!(v, json!("b"));
    }

    #[test]
    fn dotted_path_lookup_into_inputs() {
        let s = State::with_inputs(
            json!({"query": "hello"}).as_object().unwrap().clone(),
        );
        assert_eq!(s.get_path("inputs.query").unwrap(), json!("hello"));
    }

    #[test]
    fn set_path_creates_nested_objects() {
        let mut s = State::new();
        s.set_path("last_failure.search", json!("timeout"));
        assert_eq!(s.get_path("last_failure.search").unwrap(), json!("timeout"));
    }

    #[test]
    fn missing_path_returns_none_without_panicking() {
        let s = State::new();
        assert!(s.get_path("does.not.exist").is_none());
        assert!(s.get_path("inputs.missing.nested").is_none());
    }

    #[test]
    fn increment_iterations_and_mark_failed() {
        let mut s = State::new();
        assert_eq!(s.increment_iterations(), 1);
        assert_eq!(s.increment_iterations(), 2);
        s.mark_step_failed("step_3");
        s.mark_step_failed("step_3");
        assert_eq!(s.control().failed_steps, vec!["step_3".to_string()]);
    }

    #[test]
    fn invariant_control_iterations_never_exceeds_max() {
        let mut s = State::new();
        let mut c = s.control();
        c.max_iterations = 2;
        s.set_control(c);
        s.increment_iterations();
        s.increment_iterations();
        assert!(s.control().iterations <= s.control().max_iterations);
    }
}
