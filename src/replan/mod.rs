//! `ReplanManager`: pathology detection and incremental/full replanning (§4.7).

use crate::history::History;
use crate::llm::{ChatMessage, ChatRequest, LlmClient, LlmPurpose};
use crate::memory::{ConsistencyChecker, WorkingMemory};
use crate::plan::{ExecutionPlan, ExecutionStrategy, PlanStep, ReplanTrigger};
use crate::state::State;
use crate::tool::{PostSuccessPolicy, ToolRegistry};
use crate::trace::{traced_chat, Tracer};
use crate::util::{compress_state_for_prompt, extract_json};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ReplanError {
    #[error("replan LLM call failed: {0}")]
    LlmFailed(String),
}

/// Why a replan was triggered (reported in the engine's `stage_replan`
/// event payload as `trigger_reason`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplanReason {
    RepeatedFailure,
    CircularDependency(String),
    ToolForced,
    Periodic,
    Proactive,
    OnFailure,
    TrailingTwoFailures,
}

impl ReplanReason {
    pub fn description(&self) -> String {
        match self {
            Self::RepeatedFailure => "连续 3 次失败".to_string(),
            Self::CircularDependency(step) => format!("step {step} repeated more than 3 times"),
            Self::ToolForced => "tool declared forceReplanCheck and its condition evaluated true".to_string(),
            Self::Periodic => "periodic replan interval reached".to_string(),
            Self::Proactive => "high-impact tool dispatched under proactive strategy".to_string(),
            Self::OnFailure => "step failed under on_failure replan trigger".to_string(),
            Self::TrailingTwoFailures => "two failures in the trailing three steps".to_string(),
        }
    }
}

pub struct ReplanManager {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
}

impl ReplanManager {
    pub fn new(llm: Arc<dyn LlmClient>, tools: ToolRegistry) -> Self {
        Self { llm, tools }
    }

    /// Evaluates the detection rules after a step completes (§4.7). Does
    /// not itself build a new plan — see [`ReplanManager::replan`].
    pub async fn detect(
        &self,
        history: &History,
        strategy: Option<&ExecutionStrategy>,
        steps_since_last_replan: u32,
        just_failed: bool,
        current_tool_policy: Option<&PostSuccessPolicy>,
        call_description: &str,
        tracer: Option<&mut Tracer>,
    ) -> Option<ReplanReason> {
        if history.has_repeated_failure() {
            return Some(ReplanReason::RepeatedFailure);
        }
        if let Some(step_id) = history.has_circular_repetition() {
            return Some(ReplanReason::CircularDependency(step_id));
        }

        if let Some(policy) = current_tool_policy {
            if policy.force_replan_check {
                if let Some(condition) = &policy.replan_condition {
                    if self.evaluate_condition(condition, call_description, tracer).await {
                        return Some(ReplanReason::ToolForced);
                    }
                }
            }
        }

        if let Some(strategy) = strategy {
            if strategy.enable_replan {
                match strategy.replan_trigger {
                    ReplanTrigger::Periodic => {
                        let high_impact = current_tool_policy.map(|p| p.high_impact).unwrap_or(false);
                        if high_impact && steps_since_last_replan >= strategy.replan_interval {
                            return Some(ReplanReason::Periodic);
                        }
                    }
                    ReplanTrigger::Proactive => {
                        let high_impact = current_tool_policy.map(|p| p.high_impact).unwrap_or(false);
                        if high_impact {
                            return Some(ReplanReason::Proactive);
                        }
                    }
                    ReplanTrigger::OnFailure => {
                        if just_failed {
                            return Some(ReplanReason::OnFailure);
                        }
                    }
                }
            }
        }

        if history.two_failures_in_trailing_three() {
            return Some(ReplanReason::TrailingTwoFailures);
        }

        None
    }

    async fn evaluate_condition(
        &self,
        condition: &str,
        call_description: &str,
        tracer: Option<&mut Tracer>,
    ) -> bool {
        let prompt = format!(
            "Answer strictly true or false (as JSON {{\"result\": bool}}): \
             does the following condition hold? Condition: {condition}\nContext: {call_description}"
        );
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::Replan);
        match traced_chat(self.llm.as_ref(), tracer, request).await {
            Ok(response) => extract_json(&response.content)
                .and_then(|v| v.get("result").and_then(Value::as_bool))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Builds a replacement plan. Chooses incremental replan unless a
    /// circular-dependency pattern was detected or there are no completed
    /// steps, in which case a full replan is built instead. Returns
    /// `None` on any parsing failure, meaning "keep executing as is"
    /// (§4.7). The returned `usize` is the length of the frozen completed
    /// prefix at the front of the new plan's subtasks — 0 for a full
    /// replan, since that discards the old plan entirely — so the caller
    /// can resume execution without re-dispatching already-completed steps.
    pub async fn replan(
        &self,
        reason: &ReplanReason,
        old_plan: &ExecutionPlan,
        history: &History,
        state: &State,
        working_memory: &WorkingMemory,
        consistency: &ConsistencyChecker,
        completed_step_ids: &[String],
        tracer: Option<&mut Tracer>,
    ) -> Option<(ExecutionPlan, usize)> {
        let use_full = matches!(reason, ReplanReason::CircularDependency(_)) || completed_step_ids.is_empty();
        let (new_plan, prefix_len) = if use_full {
            (self.full_replan(reason, old_plan, history, state, working_memory, consistency, tracer).await, 0)
        } else {
            let prefix_len =
                old_plan.subtasks.iter().filter(|s| completed_step_ids.contains(&s.id)).count();
            let plan = self
                .incremental_replan(
                    reason,
                    old_plan,
                    history,
                    state,
                    working_memory,
                    consistency,
                    completed_step_ids,
                    tracer,
                )
                .await;
            (plan, prefix_len)
        };

        new_plan.and_then(|mut plan| {
            plan.task_profile = old_plan.task_profile.clone();
            plan.execution_strategy = old_plan.execution_strategy.clone();
            if plan.validate().is_ok() {
                Some((plan, prefix_len))
            } else {
                None
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn incremental_replan(
        &self,
        reason: &ReplanReason,
        old_plan: &ExecutionPlan,
        history: &History,
        state: &State,
        working_memory: &WorkingMemory,
        consistency: &ConsistencyChecker,
        completed_step_ids: &[String],
        tracer: Option<&mut Tracer>,
    ) -> Option<ExecutionPlan> {
        let prefix: Vec<PlanStep> = old_plan
            .subtasks
            .iter()
            .filter(|s| completed_step_ids.contains(&s.id))
            .cloned()
            .collect();
        let remaining: Vec<&PlanStep> =
            old_plan.subtasks.iter().filter(|s| !completed_step_ids.contains(&s.id)).collect();

        let twice_failed: Vec<String> = old_plan
            .subtasks
            .iter()
            .filter(|s| history.attempts_for(&s.id) >= 2)
            .map(|s| s.id.clone())
            .collect();

        let prompt = format!(
            "The current plan hit a problem ({reason}). Completed steps (frozen, do not \
             change): {prefix}\nRemaining steps from the old plan: {remaining}\nSteps that \
             already failed twice and should be avoided: {twice_failed:?}\n\
             Current state: {state}\nWorking memory:\n{wm}\nConsistency constraints: \
             {constraints:?}\nTools catalog:\n{tools}\n\nReturn a JSON object \
             {{\"steps\": [...]}} containing ONLY the new suffix of steps (not the \
             completed prefix). Steps should reference completed-step outputs via their \
             read_fields where useful.",
            reason = reason.description(),
            prefix = serde_json::to_string(&prefix).unwrap_or_default(),
            remaining = serde_json::to_string(&remaining).unwrap_or_default(),
            state = compress_state_for_prompt(&state.as_value()),
            wm = working_memory.render_context(),
            constraints = consistency.checkpoints().iter().map(|c| c.description.clone()).collect::<Vec<_>>(),
            tools = self.tools.catalog_text(),
        );

        let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::IncrementalReplan);
        let response = traced_chat(self.llm.as_ref(), tracer, request).await.ok()?;
        let json = extract_json(&response.content)?;
        let suffix = parse_steps(json.get("steps")?.as_array()?);

        let mut plan = ExecutionPlan::empty(old_plan.intent.clone());
        plan.state_schema = old_plan.state_schema.clone();
        plan.subtasks = prefix.into_iter().chain(suffix).collect();
        plan.warnings.push(format!("incremental replan triggered: {}", reason.description()));
        Some(plan)
    }

    async fn full_replan(
        &self,
        reason: &ReplanReason,
        old_plan: &ExecutionPlan,
        history: &History,
        state: &State,
        working_memory: &WorkingMemory,
        consistency: &ConsistencyChecker,
        tracer: Option<&mut Tracer>,
    ) -> Option<ExecutionPlan> {
        let recent = history.last(10);
        let prompt = format!(
            "Execution hit a severe problem ({reason}) and needs a completely new plan.\n\
             Recent history: {recent}\nCurrent state: {state}\nWorking memory:\n{wm}\n\
             Consistency constraints: {constraints:?}\nTools catalog:\n{tools}\n\n\
             Return a JSON object {{\"intent\": string, \"steps\": [...]}}.",
            reason = reason.description(),
            recent = serde_json::to_string(recent).unwrap_or_default(),
            state = compress_state_for_prompt(&state.as_value()),
            wm = working_memory.render_context(),
            constraints = consistency.checkpoints().iter().map(|c| c.description.clone()).collect::<Vec<_>>(),
            tools = self.tools.catalog_text(),
        );

        let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::Replan);
        let response = traced_chat(self.llm.as_ref(), tracer, request).await.ok()?;
        let json = extract_json(&response.content)?;
        let steps = parse_steps(json.get("steps")?.as_array()?);

        let mut plan = ExecutionPlan::empty(json.get("intent").and_then(Value::as_str).unwrap_or(&old_plan.intent));
        plan.state_schema = old_plan.state_schema.clone();
        plan.subtasks = steps;
        plan.warnings.push(format!("full replan triggered: {}", reason.description()));
        Some(plan)
    }
}

fn parse_steps(steps_json: &[Value]) -> Vec<PlanStep> {
    steps_json
        .iter()
        .enumerate()
        .map(|(idx, v)| {
            let id = v.get("id").and_then(Value::as_str).map(str::to_string).unwrap_or_else(|| format!("step_{}", idx + 1));
            let description = v.get("description").and_then(Value::as_str).unwrap_or("").to_string();
            let mut step = PlanStep::new(id, description);
            step.tool = v.get("tool").and_then(Value::as_str).map(str::to_string);
            if let Some(params) = v.get("parameters").and_then(Value::as_object) {
                step.parameters = params.clone();
            }
            if let Some(deps) = v.get("dependencies").and_then(Value::as_array) {
                step.dependencies = deps.iter().filter_map(Value::as_str).map(str::to_string).collect();
            }
            if let Some(rf) = v.get("read_fields").and_then(Value::as_array) {
                step.read_fields = rf.iter().filter_map(Value::as_str).map(str::to_string).collect();
            }
            step
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedLlmClient;
    use crate::llm::ChatResponse;
    use crate::plan::TaskComplexity;
    use crate::plan::TaskProfile;

    fn manager_with(responses: Vec<Result<ChatResponse, crate::llm::LlmError>>) -> ReplanManager {
        ReplanManager::new(Arc::new(ScriptedLlmClient::new(responses)), ToolRegistry::new())
    }

    fn failing_record(id: &str) -> crate::history::StepRecord {
        crate::history::StepRecord {
            step_id: id.into(),
            step_num: 1,
            tool_name: "t".into(),
            description: "d".into(),
            arguments: Default::default(),
            output: Value::Null,
            success: false,
            error: Some("boom".into()),
            target: "t".into(),
            semantic_description: "failed".into(),
            input_summary: String::new(),
            output_summary: String::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn detects_repeated_failure_before_strategy_checks() {
        let manager = manager_with(vec![]);
        let mut history = History::new();
        for id in ["s1", "s2", "s3"] {
            history.push(failing_record(id));
        }
        let reason = manager.detect(&history, None, 0, false, None, "", None).await;
        assert_eq!(reason, Some(ReplanReason::RepeatedFailure));
    }

    #[tokio::test]
    async fn no_replan_when_nothing_triggers() {
        let manager = manager_with(vec![]);
        let history = History::new();
        let profile = TaskProfile { complexity: TaskComplexity::Simple, ..TaskProfile::fallback() };
        let strategy = ExecutionStrategy::derive(&profile);
        let reason = manager.detect(&history, Some(&strategy), 0, false, None, "", None).await;
        assert_eq!(reason, None);
    }

    #[tokio::test]
    async fn on_failure_strategy_triggers_on_individual_failure() {
        let manager = manager_with(vec![]);
        let history = History::new();
        let mut profile = TaskProfile::fallback();
        profile.complexity = TaskComplexity::Moderate;
        let strategy = ExecutionStrategy::derive(&profile);
        let reason = manager.detect(&history, Some(&strategy), 0, true, None, "", None).await;
        assert_eq!(reason, Some(ReplanReason::OnFailure));
    }

    #[tokio::test]
    async fn circular_dependency_forces_full_replan_even_with_completed_steps() {
        let manager = manager_with(vec![Ok(ChatResponse::text(
            r#"{"intent": "new", "steps": [{"id": "step_1", "description": "retry differently"}]}"#,
        ))]);
        let old_plan = ExecutionPlan::empty("x");
        let history = History::new();
        let (plan, prefix_len) = manager
            .replan(
                &ReplanReason::CircularDependency("step_3".into()),
                &old_plan,
                &history,
                &State::new(),
                &WorkingMemory::new(),
                &ConsistencyChecker::new(),
                &["step_1".to_string(), "step_2".to_string()],
                None,
            )
            .await
            .unwrap();
        assert_eq!(plan.intent, "new");
        assert!(plan.warnings[0].contains("full replan"));
        assert_eq!(prefix_len, 0);
    }

    #[tokio::test]
    async fn incremental_replan_preserves_completed_prefix_byte_identical() {
        let manager = manager_with(vec![Ok(ChatResponse::text(
            r#"{"steps": [{"id": "step_3", "description": "alternate approach", "tool": "search"}]}"#,
        ))]);
        let mut old_plan = ExecutionPlan::empty("x");
        old_plan.subtasks.push(PlanStep::new("step_1", "first").with_tool("echo").pinned());
        old_plan.subtasks.push(PlanStep::new("step_2", "second").with_tool("echo"));
        old_plan.subtasks.push(PlanStep::new("step_3", "third").with_tool("search"));

        let history = History::new();
        let (plan, prefix_len) = manager
            .replan(
                &ReplanReason::RepeatedFailure,
                &old_plan,
                &history,
                &State::new(),
                &WorkingMemory::new(),
                &ConsistencyChecker::new(),
                &["step_1".to_string(), "step_2".to_string()],
                None,
            )
            .await
            .unwrap();

        assert_eq!(plan.subtasks[0], old_plan.subtasks[0]);
        assert_eq!(plan.subtasks[1], old_plan.subtasks[1]);
        assert_eq!(plan.subtasks[2].description, "alternate approach");
        assert_eq!(prefix_len, 2);
    }

    #[tokio::test]
    async fn returns_none_on_unparseable_llm_response() {
        let manager = manager_with(vec![Ok(ChatResponse::text("not json"))]);
        let old_plan = ExecutionPlan::empty("x");
        let plan = manager
            .replan(
                &ReplanReason::RepeatedFailure,
                &old_plan,
                &History::new(),
                &State::new(),
                &WorkingMemory::new(),
                &ConsistencyChecker::new(),
                &[],
                None,
            )
            .await;
        assert!(plan.is_none());
    }
}
