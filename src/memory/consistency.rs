//! `ConsistencyChecker`: per-task checkpoints and violation detection (§4.6).

use crate::llm::{ChatMessage, ChatRequest, LlmClient, LlmPurpose};
use crate::tool::ArtifactType;
use crate::trace::{traced_chat, Tracer};
use crate::util::extract_json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

/// A distilled snapshot of a step's output used by later steps to check
/// consistency (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsistencyCheckpoint {
    pub step_id: String,
    pub artifact_type: ArtifactType,
    pub key_elements: Map<String, Value>,
    pub constraints_for_future: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsistencyViolation {
    pub checkpoint_id: String,
    pub current_step_id: String,
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    pub suggestion: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsistencyError {
    #[error("a checkpoint is already registered for step {0}")]
    DuplicateCheckpoint(String),
}

/// Registers checkpoints (at most one per step id, invariant (vi)) and
/// checks an about-to-be-dispatched call against them.
///
/// Both `ConsistencyChecker` and `WorkingMemory` are owned per
/// `ExecutionContext` (§9 Design Notes: "global consistency checker as
/// per-task data, not a singleton") — multiple concurrent tasks never
/// share this state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsistencyChecker {
    checkpoints: Vec<ConsistencyCheckpoint>,
    /// Flat constraint list accumulated from every checkpoint's
    /// `constraintsForFuture`.
    constraints: Vec<String>,
    violations: Vec<ConsistencyViolation>,
}

impl ConsistencyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_checkpoint(
        &mut self,
        step_id: impl Into<String>,
        artifact_type: ArtifactType,
        key_elements: Map<String, Value>,
        constraints_for_future: Vec<String>,
        description: impl Into<String>,
    ) -> Result<(), ConsistencyError> {
        let step_id = step_id.into();
        if self.checkpoints.iter().any(|c| c.step_id == step_id) {
            return Err(ConsistencyError::DuplicateCheckpoint(step_id));
        }
        self.constraints.extend(constraints_for_future.iter().cloned());
        self.checkpoints.push(ConsistencyCheckpoint {
            step_id,
            artifact_type,
            key_elements,
            constraints_for_future,
            description: description.into(),
        });
        Ok(())
    }

    pub fn checkpoints(&self) -> &[ConsistencyCheckpoint] {
        &self.checkpoints
    }

    pub fn violations(&self) -> &[ConsistencyViolation] {
        &self.violations
    }

    pub fn has_critical_violations(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Critical)
    }

    fn relevant_checkpoints(&self, filter: Option<&[ArtifactType]>) -> Vec<&ConsistencyCheckpoint> {
        match filter {
            Some(types) => {
                let set: HashSet<ArtifactType> = types.iter().copied().collect();
                self.checkpoints.iter().filter(|c| set.contains(&c.artifact_type)).collect()
            }
            None => self.checkpoints.iter().collect(),
        }
    }

    /// Pre-execution consistency check (§4.5 step 2): renders all
    /// relevant checkpoints into a prompt and asks the LLM to return a
    /// JSON array of violations against the about-to-be-dispatched call.
    /// On any parsing failure, no violations are recorded — checkpoints
    /// advise, they never block dispatch.
    pub async fn check(
        &mut self,
        llm: &dyn LlmClient,
        current_step_id: &str,
        call_description: &str,
        filter: Option<&[ArtifactType]>,
        tracer: Option<&mut Tracer>,
    ) -> Vec<ConsistencyViolation> {
        let relevant = self.relevant_checkpoints(filter);
        if relevant.is_empty() {
            return Vec::new();
        }

        let checkpoints_text = relevant
            .iter()
            .map(|c| {
                format!(
                    "checkpoint[{}] ({:?}): {} key_elements={}",
                    c.step_id,
                    c.artifact_type,
                    c.description,
                    serde_json::to_string(&c.key_elements).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Compare the upcoming call against each checkpoint below and list any \
             violations as a JSON array of objects with keys checkpoint_id, \
             violation_type, severity (critical|warning|info), description, suggestion. \
             Return an empty array if there are none.\n\n\
             Checkpoints:\n{checkpoints_text}\n\nUpcoming call: {call_description}"
        );
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::ConsistencyCheck);

        let response = match traced_chat(llm, tracer, request).await {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };

        let parsed: Vec<ConsistencyViolation> = match extract_json(&response.content) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| {
                    let checkpoint_id =
                        item.get("checkpoint_id").and_then(Value::as_str)?.to_string();
                    let violation_type =
                        item.get("violation_type").and_then(Value::as_str)?.to_string();
                    let severity: Severity =
                        serde_json::from_value(item.get("severity")?.clone()).ok()?;
                    let description = item.get("description").and_then(Value::as_str)?.to_string();
                    let suggestion =
                        item.get("suggestion").and_then(Value::as_str).unwrap_or("").to_string();
                    Some(ConsistencyViolation {
                        checkpoint_id,
                        current_step_id: current_step_id.to_string(),
                        violation_type,
                        severity,
                        description,
                        suggestion,
                    })
                })
                .collect(),
            _ => Vec::new(),
        };

        self.violations.extend(parsed.clone());
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedLlmClient;
    use crate::llm::ChatResponse;

    #[test]
    fn register_checkpoint_rejects_duplicate_step_id() {
        let mut checker = ConsistencyChecker::new();
        checker
            .register_checkpoint("step_a", ArtifactType::Interface, Map::new(), vec![], "d")
            .unwrap();
        let err = checker
            .register_checkpoint("step_a", ArtifactType::Interface, Map::new(), vec![], "d2")
            .unwrap_err();
        assert!(matches!(err, ConsistencyError::DuplicateCheckpoint(_)));
    }

    #[test]
    fn register_checkpoint_accumulates_global_constraints() {
        let mut checker = ConsistencyChecker::new();
        checker
            .register_checkpoint(
                "step_a",
                ArtifactType::Interface,
                Map::new(),
                vec!["ids are int".into()],
                "d",
            )
            .unwrap();
        assert_eq!(checker.constraints, vec!["ids are int".to_string()]);
    }

    #[tokio::test]
    async fn check_returns_empty_when_no_relevant_checkpoints() {
        let mut checker = ConsistencyChecker::new();
        let llm = ScriptedLlmClient::new(vec![]);
        let violations = checker.check(&llm, "step_b", "call description", None, None).await;
        assert!(violations.is_empty());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn check_parses_critical_violation() {
        let mut checker = ConsistencyChecker::new();
        let mut elements = Map::new();
        elements.insert("endpoints".to_string(), serde_json::json!([{"path": "/users/{id}"}]));
        checker
            .register_checkpoint(
                "step_a",
                ArtifactType::Interface,
                elements,
                vec!["ids are int".into()],
                "user API defined",
            )
            .unwrap();

        let llm = ScriptedLlmClient::text(
            r#"[{"checkpoint_id": "step_a", "violation_type": "type_mismatch",
            "severity": "critical", "description": "user_id is str not int",
            "suggestion": "change user_id to int"}]"#,
        );
        let violations = checker
            .check(&llm, "step_b", "get_user(user_id: str)", None, None)
            .await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Critical);
        assert!(checker.has_critical_violations());
    }

    #[tokio::test]
    async fn check_filters_by_artifact_type() {
        let mut checker = ConsistencyChecker::new();
        checker
            .register_checkpoint("step_a", ArtifactType::Code, Map::new(), vec![], "d")
            .unwrap();
        let llm = ScriptedLlmClient::new(vec![]);
        let filter = [ArtifactType::Interface];
        let violations = checker.check(&llm, "step_b", "call", Some(&filter), None).await;
        assert!(violations.is_empty());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_llm_response_yields_no_violations_and_does_not_block() {
        let mut checker = ConsistencyChecker::new();
        checker
            .register_checkpoint("step_a", ArtifactType::Code, Map::new(), vec![], "d")
            .unwrap();
        let llm = ScriptedLlmClient::text("not json");
        let violations = checker.check(&llm, "step_b", "call", None, None).await;
        assert!(violations.is_empty());
    }

    #[test]
    fn round_trip_preserves_checkpoints_and_violations() {
        let mut checker = ConsistencyChecker::new();
        checker
            .register_checkpoint("step_a", ArtifactType::Schema, Map::new(), vec![], "d")
            .unwrap();
        let json = serde_json::to_string(&checker).unwrap();
        let restored: ConsistencyChecker = serde_json::from_str(&json).unwrap();
        assert_eq!(checker, restored);
    }
}
