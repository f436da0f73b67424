//! `TaskPlanner`: classifies task complexity and produces an
//! `ExecutionPlan` (§4.2).

use super::types::{ExecutionPlan, ExecutionStrategy, PlanStep, TaskProfile};
use crate::llm::{ChatMessage, ChatRequest, LlmClient, LlmPurpose};
use crate::tool::ToolRegistry;
use crate::trace::{traced_chat, Tracer};
use crate::util::extract_json;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Everything the caller supplies around the raw query: the agent's
/// standing goals and constraints, a long-term-memory excerpt, free-form
/// conversation context, and any steps the caller wants pinned into the
/// new plan verbatim.
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    pub agent_goals: Vec<String>,
    pub agent_constraints: Vec<String>,
    pub long_term_memory_excerpt: Option<String>,
    pub conversation_context: Option<String>,
    pub pinned_steps: Vec<PlanStep>,
}

/// A lightweight pre-pass that decides whether a query needs planning at
/// all, or can be answered directly (SPEC_FULL.md §10 supplement; the
/// distilled spec doesn't describe this and no invariant requires it —
/// `TaskPlanner` works identically with no router configured).
#[async_trait]
pub trait IntentRouter: Send + Sync {
    async fn route(&self, query: &str) -> IntentDecision;
}

#[derive(Debug, Clone)]
pub struct IntentDecision {
    pub needs_planning: bool,
    pub direct_answer: Option<String>,
}

pub struct TaskPlanner {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    intent_router: Option<Arc<dyn IntentRouter>>,
}

impl TaskPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, tools: ToolRegistry) -> Self {
        Self { llm, tools, intent_router: None }
    }

    pub fn with_intent_router(mut self, router: Arc<dyn IntentRouter>) -> Self {
        self.intent_router = Some(router);
        self
    }

    pub async fn route_intent(&self, query: &str) -> Option<IntentDecision> {
        match &self.intent_router {
            Some(router) => Some(router.route(query).await),
            None => None,
        }
    }

    /// Classifies a query's complexity via a single LLM call. Malformed
    /// JSON or an LLM failure both fall back to `TaskProfile::fallback()`
    /// (§4.2).
    pub async fn classify_task_complexity(&self, query: &str, tracer: Option<&mut Tracer>) -> TaskProfile {
        let prompt = format!(
            "Classify the complexity of this task and respond with a JSON object \
             with keys complexity (simple|moderate|complex|project), estimated_steps, \
             has_code_generation, has_cross_dependencies, requires_consistency, \
             is_reversible, reasoning.\n\nTask: {query}"
        );
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::Planning);
        let response = match traced_chat(self.llm.as_ref(), tracer, request).await {
            Ok(r) => r,
            Err(_) => return TaskProfile::fallback(),
        };
        match extract_json(&response.content).and_then(|v| serde_json::from_value(v).ok()) {
            Some(profile) => profile,
            None => TaskProfile::fallback(),
        }
    }

    /// Produces an ordered plan for `query` (§4.2).
    ///
    /// `initial_plan`, when every step is pinned, is returned verbatim
    /// with zero LLM calls. `skip_profiling` is set by the engine when
    /// this call is itself a replan, to avoid reclassifying mid-task.
    pub async fn plan(
        &self,
        query: &str,
        context: &PlanningContext,
        initial_plan: Option<&ExecutionPlan>,
        skip_profiling: bool,
        mut tracer: Option<&mut Tracer>,
    ) -> ExecutionPlan {
        if let Some(plan) = initial_plan {
            if plan.all_pinned() {
                return plan.clone();
            }
        }

        let task_profile = if skip_profiling {
            None
        } else {
            Some(self.classify_task_complexity(query, tracer.as_deref_mut()).await)
        };
        let execution_strategy = task_profile.as_ref().map(ExecutionStrategy::derive);

        let prompt = self.build_planning_prompt(query, context);
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::Planning);

        let mut plan = match traced_chat(self.llm.as_ref(), tracer, request).await {
            Ok(response) => match extract_json(&response.content) {
                Some(json) => match parse_plan_json(&json, query) {
                    Ok(plan) => plan,
                    Err(msg) => {
                        let mut plan = ExecutionPlan::single_step_fallback(query, query);
                        plan.errors.push(msg);
                        plan
                    }
                },
                None => {
                    let mut plan = ExecutionPlan::single_step_fallback(query, query);
                    plan.warnings.push("LLM response contained no parseable JSON".into());
                    plan
                }
            },
            Err(err) => {
                let mut plan = ExecutionPlan::single_step_fallback(query, query);
                plan.warnings.push(format!("LLM call failed: {err}"));
                plan
            }
        };

        plan.task_profile = task_profile;
        plan.execution_strategy = execution_strategy;
        plan
    }

    fn build_planning_prompt(&self, query: &str, context: &PlanningContext) -> String {
        let mut sections = vec![format!("User query: {query}")];
        if !context.agent_goals.is_empty() {
            sections.push(format!("Agent goals:\n{}", context.agent_goals.join("\n")));
        }
        if !context.agent_constraints.is_empty() {
            sections.push(format!("Agent constraints:\n{}", context.agent_constraints.join("\n")));
        }
        sections.push(format!("Available tools:\n{}", self.tools.catalog_text()));
        if let Some(ltm) = &context.long_term_memory_excerpt {
            sections.push(format!("Relevant long-term memory:\n{ltm}"));
        }
        if let Some(conv) = &context.conversation_context {
            sections.push(format!("Conversation context:\n{conv}"));
        }
        if !context.pinned_steps.is_empty() {
            let pinned = serde_json::to_string(&context.pinned_steps).unwrap_or_default();
            sections.push(format!("These steps are pinned and must appear unchanged:\n{pinned}"));
        }
        sections.push(
            "Respond with a single JSON object: \
             {\"intent\": string, \"steps\": [...], \"state_schema\": object, \
             \"expected_outcome\": string, \"errors\": [string], \"warnings\": [string]}."
                .to_string(),
        );
        sections.join("\n\n")
    }
}

fn parse_plan_json(json: &Value, query: &str) -> Result<ExecutionPlan, String> {
    let intent = json
        .get("intent")
        .and_then(Value::as_str)
        .unwrap_or(query)
        .to_string();
    let steps_json = json.get("steps").and_then(Value::as_array).ok_or("missing steps array")?;

    let mut subtasks = Vec::with_capacity(steps_json.len());
    for (idx, step_json) in steps_json.iter().enumerate() {
        let id = step_json
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("step_{}", idx + 1));
        let description = step_json
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let mut step = PlanStep::new(id, description);
        step.tool = step_json.get("tool").and_then(Value::as_str).map(str::to_string);
        if let Some(params) = step_json.get("parameters").and_then(Value::as_object) {
            step.parameters = params.clone();
        }
        if let Some(deps) = step_json.get("dependencies").and_then(Value::as_array) {
            step.dependencies = deps.iter().filter_map(Value::as_str).map(str::to_string).collect();
        }
        step.expectations = step_json.get("expectations").and_then(Value::as_str).map(str::to_string);
        step.on_fail_strategy =
            step_json.get("on_fail_strategy").and_then(Value::as_str).map(str::to_string);
        if let Some(rf) = step_json.get("read_fields").and_then(Value::as_array) {
            step.read_fields = rf.iter().filter_map(Value::as_str).map(str::to_string).collect();
        }
        if let Some(wf) = step_json.get("write_fields").and_then(Value::as_array) {
            step.write_fields = wf.iter().filter_map(Value::as_str).map(str::to_string).collect();
        }
        step.is_pinned = step_json.get("is_pinned").and_then(Value::as_bool).unwrap_or(false);
        subtasks.push(step);
    }

    let mut plan = ExecutionPlan::empty(intent);
    plan.subtasks = subtasks;
    plan.expected_outcome = json.get("expected_outcome").and_then(Value::as_str).map(str::to_string);
    if let Some(schema) = json.get("state_schema").and_then(Value::as_object) {
        plan.state_schema = schema.clone();
    }
    if let Some(errors) = json.get("errors").and_then(Value::as_array) {
        plan.errors = errors.iter().filter_map(Value::as_str).map(str::to_string).collect();
    }
    if let Some(warnings) = json.get("warnings").and_then(Value::as_array) {
        plan.warnings = warnings.iter().filter_map(Value::as_str).map(str::to_string).collect();
    }

    plan.validate().map_err(|e| format!("plan validation failed: {e}"))?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedLlmClient;
    use crate::llm::ChatResponse;

    fn planner_with(responses: Vec<Result<ChatResponse, crate::llm::LlmError>>) -> TaskPlanner {
        TaskPlanner::new(Arc::new(ScriptedLlmClient::new(responses)), ToolRegistry::new())
    }

    #[tokio::test]
    async fn all_pinned_initial_plan_short_circuits_with_no_llm_call() {
        let planner = planner_with(vec![]);
        let mut initial = ExecutionPlan::empty("redo");
        initial.subtasks.push(PlanStep::new("s1", "echo").pinned());
        let plan = planner.plan("redo it", &PlanningContext::default(), Some(&initial), false, None).await;
        assert_eq!(plan.subtasks.len(), 1);
        assert_eq!(plan.intent, "redo");
    }

    #[tokio::test]
    async fn classification_falls_back_on_malformed_json() {
        let planner = planner_with(vec![Ok(ChatResponse::text("not json at all"))]);
        let profile = planner.classify_task_complexity("do something", None).await;
        assert_eq!(profile.reasoning, "fallback");
        assert_eq!(profile.estimated_steps, 3);
    }

    #[tokio::test]
    async fn plan_parses_steps_and_attaches_profile() {
        let classify_response = Ok(ChatResponse::text(
            r#"{"complexity":"simple","estimated_steps":1,"has_code_generation":false,
            "has_cross_dependencies":false,"requires_consistency":false,"is_reversible":true,
            "reasoning":"trivial"}"#,
        ));
        let plan_response = Ok(ChatResponse::text(
            r#"```json
            {"intent": "greet", "steps": [{"id": "step_1", "description": "say hi", "tool": "echo"}],
             "state_schema": {}, "expected_outcome": "a greeting", "errors": [], "warnings": []}
            ```"#,
        ));
        let planner = planner_with(vec![classify_response, plan_response]);
        let plan = planner.plan("say hi", &PlanningContext::default(), None, false, None).await;
        assert_eq!(plan.intent, "greet");
        assert_eq!(plan.subtasks.len(), 1);
        assert!(plan.task_profile.is_some());
        assert!(plan.execution_strategy.is_some());
    }

    #[tokio::test]
    async fn unparseable_plan_response_falls_back_to_single_step() {
        let classify_response = Ok(ChatResponse::text(
            r#"{"complexity":"simple","estimated_steps":1,"has_code_generation":false,
            "has_cross_dependencies":false,"requires_consistency":false,"is_reversible":true,
            "reasoning":"trivial"}"#,
        ));
        let planner = planner_with(vec![classify_response, Ok(ChatResponse::text("garbage"))]);
        let plan = planner.plan("say hi", &PlanningContext::default(), None, false, None).await;
        assert_eq!(plan.subtasks.len(), 1);
        assert!(!plan.warnings.is_empty());
    }

    #[tokio::test]
    async fn skip_profiling_avoids_classification_call() {
        let plan_response = Ok(ChatResponse::text(
            r#"{"intent": "x", "steps": [], "state_schema": {}, "errors": [], "warnings": []}"#,
        ));
        let planner = planner_with(vec![plan_response]);
        let plan = planner.plan("x", &PlanningContext::default(), None, true, None).await;
        assert!(plan.task_profile.is_none());
    }

    #[tokio::test]
    async fn empty_plan_is_accepted() {
        let classify_response = Ok(ChatResponse::text(
            r#"{"complexity":"simple","estimated_steps":0,"has_code_generation":false,
            "has_cross_dependencies":false,"requires_consistency":false,"is_reversible":true,
            "reasoning":"noop"}"#,
        ));
        let plan_response =
            Ok(ChatResponse::text(r#"{"intent": "noop", "steps": [], "state_schema": {}}"#));
        let planner = planner_with(vec![classify_response, plan_response]);
        let plan = planner.plan("noop", &PlanningContext::default(), None, false, None).await;
        assert!(plan.subtasks.is_empty());
    }
}
