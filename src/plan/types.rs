//! Plan data model: `PlanStep`, `ExecutionPlan`, `TaskProfile`,
//! `ExecutionStrategy` (§3).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};

/// One step of a plan.
///
/// `readFields`/`writeFields` declare what state paths the step consumes
/// and produces; the ReplanManager's incremental-replan prompt relies on
/// these to tell the LLM which prior outputs the new suffix may reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail_strategy: Option<String>,
    #[serde(default)]
    pub read_fields: Vec<String>,
    #[serde(default)]
    pub write_fields: Vec<String>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_template: Option<Map<String, Value>>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: None,
            parameters: Map::new(),
            dependencies: Vec::new(),
            expectations: None,
            on_fail_strategy: None,
            read_fields: Vec::new(),
            write_fields: Vec::new(),
            is_pinned: false,
            pinned_parameters: None,
            parameter_template: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn pinned(mut self) -> Self {
        self.is_pinned = true;
        self
    }

    /// Two steps are "byte-identical" for the pinned-prefix invariant when
    /// id, tool, and parameters all match (Scenario F).
    pub fn matches_pinned(&self, other: &PlanStep) -> bool {
        self.id == other.id && self.tool == other.tool && self.parameters == other.parameters
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Simple,
    Moderate,
    Complex,
    Project,
}

/// Classification of a task's complexity (§4.2 `classifyTaskComplexity`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProfile {
    pub complexity: TaskComplexity,
    pub estimated_steps: u32,
    pub has_code_generation: bool,
    pub has_cross_dependencies: bool,
    pub requires_consistency: bool,
    pub is_reversible: bool,
    pub reasoning: String,
}

impl TaskProfile {
    /// The fallback profile used when classification fails or is skipped:
    /// `moderate / 3 steps / reasoning="fallback"` (§4.2).
    pub fn fallback() -> Self {
        Self {
            complexity: TaskComplexity::Moderate,
            estimated_steps: 3,
            has_code_generation: false,
            has_cross_dependencies: false,
            requires_consistency: false,
            is_reversible: true,
            reasoning: "fallback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanTrigger {
    OnFailure,
    Periodic,
    Proactive,
}

/// Derived from [`TaskProfile`] by table lookup on complexity (§4.2, §9.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStrategy {
    pub enable_replan: bool,
    pub replan_trigger: ReplanTrigger,
    pub replan_interval: u32,
    pub enable_consistency_check: bool,
    pub consistency_check_on: Vec<crate::tool::ArtifactType>,
    pub enable_lookahead: bool,
    pub checkpoint_interval: u32,
    pub require_phase_review: bool,
}

impl ExecutionStrategy {
    /// Table lookup on task complexity (§4.2):
    /// - simple: no replan.
    /// - moderate: replan on failure only.
    /// - complex: periodic replan every 3 steps + consistency checking for
    ///   code-generation and interface-definition artifacts.
    /// - project: proactive replanning + lookahead + phase review.
    pub fn derive(profile: &TaskProfile) -> Self {
        use crate::tool::ArtifactType;
        match profile.complexity {
            TaskComplexity::Simple => Self {
                enable_replan: false,
                replan_trigger: ReplanTrigger::OnFailure,
                replan_interval: 0,
                enable_consistency_check: false,
                consistency_check_on: Vec::new(),
                enable_lookahead: false,
                checkpoint_interval: 0,
                require_phase_review: false,
            },
            TaskComplexity::Moderate => Self {
                enable_replan: true,
                replan_trigger: ReplanTrigger::OnFailure,
                replan_interval: 0,
                enable_consistency_check: false,
                consistency_check_on: Vec::new(),
                enable_lookahead: false,
                checkpoint_interval: 0,
                require_phase_review: false,
            },
            TaskComplexity::Complex => Self {
                enable_replan: true,
                replan_trigger: ReplanTrigger::Periodic,
                replan_interval: 3,
                enable_consistency_check: true,
                consistency_check_on: vec![ArtifactType::Code, ArtifactType::Interface],
                enable_lookahead: false,
                checkpoint_interval: 3,
                require_phase_review: false,
            },
            TaskComplexity::Project => Self {
                enable_replan: true,
                replan_trigger: ReplanTrigger::Proactive,
                replan_interval: 1,
                enable_consistency_check: true,
                consistency_check_on: vec![ArtifactType::Code, ArtifactType::Interface, ArtifactType::Schema],
                enable_lookahead: true,
                checkpoint_interval: 1,
                require_phase_review: true,
            },
        }
    }
}

/// An ordered plan of steps over a declared state schema (§3 `ExecutionPlan`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub intent: String,
    pub subtasks: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub state_schema: Map<String, Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_profile: Option<TaskProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_strategy: Option<ExecutionStrategy>,
}

impl ExecutionPlan {
    pub fn empty(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            subtasks: Vec::new(),
            expected_outcome: None,
            state_schema: Map::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            task_profile: None,
            execution_strategy: None,
        }
    }

    /// A single-step plan that forwards the query to no tool — the
    /// fallback used when LLM plan parsing fails completely (§4.2).
    pub fn single_step_fallback(intent: impl Into<String>, query: &str) -> Self {
        let intent = intent.into();
        let mut step = PlanStep::new("step_1", format!("forward query: {query}"));
        step.parameters.insert("query".to_string(), Value::String(query.to_string()));
        let mut plan = Self::empty(intent);
        plan.subtasks.push(step);
        plan.warnings.push("planner produced no usable plan; falling back to single-step forward".into());
        plan
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    /// Validates the DAG shape: no duplicate ids, no dangling dependency
    /// references, no cycles.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for step in &self.subtasks {
            if !seen.insert(step.id.clone()) {
                return Err(format!("duplicate step id: {}", step.id));
            }
        }
        for step in &self.subtasks {
            for dep in &step.dependencies {
                if !seen.contains(dep) {
                    return Err(format!("step {} depends on unknown step {}", step.id, dep));
                }
            }
        }
        self.topological_order().map(|_| ()).map_err(|_| "plan contains a dependency cycle".to_string())
    }

    /// A deterministic topological order (Kahn's algorithm, ties broken by
    /// id) used by the engine to validate dependency satisfiability before
    /// execution. Execution itself is strictly sequential over
    /// `subtasks`'s declared order (§5: no intra-task step parallelism);
    /// this order is only used for validation.
    pub fn topological_order(&self) -> Result<Vec<String>, String> {
        let mut in_degree: HashMap<String, usize> =
            self.subtasks.iter().map(|s| (s.id.clone(), 0)).collect();
        let mut dependents: HashMap<String, Vec<String>> =
            self.subtasks.iter().map(|s| (s.id.clone(), Vec::new())).collect();

        for step in &self.subtasks {
            for dep in &step.dependencies {
                *in_degree.get_mut(&step.id).unwrap() += 1;
                dependents.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }

        let mut ready: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .collect();
        let mut ready_sorted: Vec<String> = ready.drain(..).collect();
        ready_sorted.sort();
        let mut queue: VecDeque<String> = ready_sorted.into();

        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(deps) = dependents.get(&id) {
                let mut newly_ready = Vec::new();
                for dependent in deps {
                    let deg = in_degree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(dependent.clone());
                    }
                }
                newly_ready.sort();
                for id in newly_ready {
                    queue.push_back(id);
                }
            }
        }

        if order.len() != self.subtasks.len() {
            return Err("cycle detected".to_string());
        }
        Ok(order)
    }

    /// True when every subtask is pinned — the short-circuit condition for
    /// `TaskPlanner::plan` (§4.2 step 1): an all-pinned `initialPlan` is
    /// returned verbatim, no LLM call.
    pub fn all_pinned(&self) -> bool {
        !self.subtasks.is_empty() && self.subtasks.iter().all(|s| s.is_pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(id, "desc").with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn validate_detects_duplicate_ids() {
        let mut plan = ExecutionPlan::empty("x");
        plan.subtasks.push(step("a", &[]));
        plan.subtasks.push(step("a", &[]));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validate_detects_dangling_dependency() {
        let mut plan = ExecutionPlan::empty("x");
        plan.subtasks.push(step("a", &["ghost"]));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validate_detects_cycle() {
        let mut plan = ExecutionPlan::empty("x");
        plan.subtasks.push(step("a", &["b"]));
        plan.subtasks.push(step("b", &["a"]));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn topological_order_linear_chain() {
        let mut plan = ExecutionPlan::empty("x");
        plan.subtasks.push(step("a", &[]));
        plan.subtasks.push(step("b", &["a"]));
        plan.subtasks.push(step("c", &["b"]));
        assert_eq!(plan.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn topological_order_diamond_is_deterministic() {
        let mut plan = ExecutionPlan::empty("x");
        plan.subtasks.push(step("a", &[]));
        plan.subtasks.push(step("c", &["a"]));
        plan.subtasks.push(step("b", &["a"]));
        plan.subtasks.push(step("d", &["b", "c"]));
        assert_eq!(plan.topological_order().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn all_pinned_requires_nonempty_and_every_step_pinned() {
        let mut plan = ExecutionPlan::empty("x");
        assert!(!plan.all_pinned());
        plan.subtasks.push(step("a", &[]).pinned());
        assert!(plan.all_pinned());
        plan.subtasks.push(step("b", &[]));
        assert!(!plan.all_pinned());
    }

    #[test]
    fn execution_strategy_simple_disables_replan() {
        let mut profile = TaskProfile::fallback();
        profile.complexity = TaskComplexity::Simple;
        let strategy = ExecutionStrategy::derive(&profile);
        assert!(!strategy.enable_replan);
    }

    #[test]
    fn execution_strategy_project_enables_lookahead_and_phase_review() {
        let mut profile = TaskProfile::fallback();
        profile.complexity = TaskComplexity::Project;
        let strategy = ExecutionStrategy::derive(&profile);
        assert!(strategy.enable_lookahead);
        assert!(strategy.require_phase_review);
        assert_eq!(strategy.replan_trigger, ReplanTrigger::Proactive);
    }

    #[test]
    fn single_step_fallback_carries_a_warning() {
        let plan = ExecutionPlan::single_step_fallback("unparseable", "do the thing");
        assert_eq!(plan.subtasks.len(), 1);
        assert!(!plan.warnings.is_empty());
    }

    #[test]
    fn pinned_steps_match_by_id_tool_and_parameters() {
        let a = PlanStep::new("s1", "desc").with_tool("echo");
        let mut b = a.clone();
        assert!(a.matches_pinned(&b));
        b.parameters.insert("x".into(), Value::String("y".into()));
        assert!(!a.matches_pinned(&b));
    }
}
