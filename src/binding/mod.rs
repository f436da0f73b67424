//! Parameter binding plan (§3 `ParameterBinding`, §4.3 `BindingPlanner`).

use crate::plan::ExecutionPlan;
use crate::state::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    UserInput,
    StepOutput,
    State,
    Literal,
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    LlmInfer,
    UseDefault,
    Error,
}

/// A declaration of how one parameter of one step derives its value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub source: String,
    pub source_type: SourceType,
    pub confidence: f32,
    pub reasoning: String,
    pub fallback: FallbackPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl ParameterBinding {
    pub fn user_input(path: impl Into<String>, confidence: f32) -> Self {
        Self {
            source: path.into(),
            source_type: SourceType::UserInput,
            confidence,
            reasoning: String::new(),
            fallback: FallbackPolicy::LlmInfer,
            default_value: None,
        }
    }
}

/// All bindings for a single step's parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBindings {
    pub step_id: String,
    pub tool: String,
    pub bindings: HashMap<String, ParameterBinding>,
}

/// The binding planner's full output for a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingPlan {
    pub steps: Vec<StepBindings>,
    pub confidence_threshold: f32,
    pub reasoning: String,
}

impl Default for BindingPlan {
    fn default() -> Self {
        Self { steps: Vec::new(), confidence_threshold: 0.7, reasoning: String::new() }
    }
}

impl BindingPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn for_step(&self, step_id: &str) -> Option<&StepBindings> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("binding for parameter {param} on step {step} could not be resolved: {reason}")]
    Unresolvable { step: String, param: String, reason: String },
}

/// The binding planner contract (§4.3, external collaborator).
///
/// Its output is advisory: a missing or low-confidence binding is
/// recoverable at execution time by LLM fallback in ParameterBuilder
/// Phase 5. The kernel invokes it once before execution, and again
/// whenever a replan alters the remaining steps.
#[async_trait]
pub trait BindingPlanner: Send + Sync {
    async fn plan(&self, plan: &ExecutionPlan, user_query: &str, initial_state: &State) -> BindingPlan;
}

/// A binding planner that never resolves anything — every parameter
/// defers straight to ParameterBuilder's LLM fallback. Used when no real
/// binding planner is configured; the kernel must continue gracefully on
/// an empty `BindingPlan` (§4.3c).
pub struct NullBindingPlanner;

#[async_trait]
impl BindingPlanner for NullBindingPlanner {
    async fn plan(&self, _plan: &ExecutionPlan, _user_query: &str, _initial_state: &State) -> BindingPlan {
        BindingPlan::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;

    fn sample_plan() -> ExecutionPlan {
        let mut plan = ExecutionPlan::empty("test");
        plan.subtasks.push(PlanStep::new("step_1", "echo").with_tool("echo"));
        plan
    }

    #[tokio::test]
    async fn null_binding_planner_yields_empty_plan() {
        let planner = NullBindingPlanner;
        let binding_plan = planner.plan(&sample_plan(), "hi", &State::new()).await;
        assert!(binding_plan.is_empty());
        assert_eq!(binding_plan.confidence_threshold, 0.7);
    }

    #[test]
    fn for_step_looks_up_by_id() {
        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), ParameterBinding::user_input("inputs.query", 1.0));
        let plan = BindingPlan {
            steps: vec![StepBindings { step_id: "step_1".into(), tool: "echo".into(), bindings }],
            confidence_threshold: 0.7,
            reasoning: String::new(),
        };
        assert!(plan.for_step("step_1").is_some());
        assert!(plan.for_step("nope").is_none());
    }
}
