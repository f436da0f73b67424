//! `ParameterBuilder`: resolves a step's final argument map in six ordered
//! phases (§4.4).

use crate::binding::{BindingPlan, FallbackPolicy, SourceType};
use crate::history::History;
use crate::llm::{ChatMessage, ChatRequest, LlmClient, LlmPurpose};
use crate::plan::PlanStep;
use crate::state::State;
use crate::tool::{ParameterValidatorKind, Tool};
use crate::trace::{traced_chat, BindingAction, BindingEvent, Tracer};
use crate::util::{compress_state_for_prompt, extract_json, state_fingerprint, truncate_preview};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("required parameter {param} missing for step {step}")]
    MissingRequired { step: String, param: String },
    #[error("binding for parameter {param} on step {step} failed: {reason}")]
    TerminalBinding { step: String, param: String, reason: String },
    #[error("parameter {param} on step {step} failed validation after repair: {reason}")]
    ValidationFailed { step: String, param: String, reason: String },
}

/// Outcome of building a step's arguments: either a complete map, or a
/// [`ParamError`] the engine must turn into a step failure.
pub type ParamResult = Result<Map<String, Value>, ParamError>;

/// Key for the per-task LLM-fallback cache (§4.4 Phase 5, §5 "requires no
/// synchronization" — the cache itself still uses interior mutability
/// since `build` takes `&self`, but is never shared across tasks).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    step_id: String,
    tool_name: String,
    missing_params: Vec<String>,
    state_fingerprint: u64,
}

/// Resolves a step's complete argument map given its binding plan, prior
/// history, and current state (§4.4). Owns a per-task LLM-fallback cache;
/// one instance is created per [`crate::context::ExecutionContext`].
pub struct ParameterBuilder {
    llm: std::sync::Arc<dyn LlmClient>,
    cache: Mutex<HashMap<CacheKey, Map<String, Value>>>,
}

impl ParameterBuilder {
    pub fn new(llm: std::sync::Arc<dyn LlmClient>) -> Self {
        Self { llm, cache: Mutex::new(HashMap::new()) }
    }

    /// Builds the final argument map for `step` against `tool`. `tracer`
    /// is optional so the builder is usable standalone in tests.
    pub async fn build(
        &self,
        step: &PlanStep,
        tool: &Tool,
        state: &State,
        binding_plan: &BindingPlan,
        history: &History,
        user_query: &str,
        mut tracer: Option<&mut Tracer>,
    ) -> ParamResult {
        // Phase 1 — seed.
        let mut args: Map<String, Value> = step.pinned_parameters.clone().unwrap_or_default();
        for (k, v) in &step.parameters {
            args.entry(k.clone()).or_insert_with(|| v.clone());
        }

        // Phase 2 — loop detection.
        let is_loop_execution = history.has_record(&step.id);

        let mut missing: Vec<String> = Vec::new();
        let mut needs_llm_fallback = is_loop_execution;

        let step_bindings = binding_plan.for_step(&step.id);

        if let Some(bindings) = step_bindings {
            if !is_loop_execution {
                // Phase 3 — static binding resolution.
                for (param, binding) in &bindings.bindings {
                    if args.get(param).map(|v| !v.is_null()).unwrap_or(false) {
                        continue;
                    }

                    if binding.confidence < binding_plan.confidence_threshold {
                        match binding.fallback {
                            FallbackPolicy::UseDefault => {
                                if let Some(default) = &binding.default_value {
                                    args.insert(param.clone(), default.clone());
                                    self.trace_binding(
                                        &mut tracer,
                                        BindingAction::Resolve,
                                        &step.id,
                                        param,
                                        "resolved_default",
                                    );
                                    continue;
                                }
                            }
                            FallbackPolicy::Error => {
                                match self.resolve_source(binding, state) {
                                    Some(v) => {
                                        args.insert(param.clone(), v);
                                        continue;
                                    }
                                    None => {
                                        return Err(ParamError::TerminalBinding {
                                            step: step.id.clone(),
                                            param: param.clone(),
                                            reason: "low-confidence binding with no resolvable source and fallback=error".into(),
                                        });
                                    }
                                }
                            }
                            FallbackPolicy::LlmInfer => {}
                        }
                        missing.push(param.clone());
                        needs_llm_fallback = true;
                        self.trace_binding(
                            &mut tracer,
                            BindingAction::Fallback,
                            &step.id,
                            param,
                            "resolved_low_confidence; deferred to LLM fallback",
                        );
                        continue;
                    }

                    match self.resolve_source(binding, state) {
                        Some(v) => {
                            args.insert(param.clone(), v);
                            self.trace_binding(&mut tracer, BindingAction::Resolve, &step.id, param, "resolved");
                        }
                        None => {
                            missing.push(param.clone());
                            needs_llm_fallback = true;
                            self.trace_binding(&mut tracer, BindingAction::Fallback, &step.id, param, "skipped; deferred");
                        }
                    }
                }
            }
        } else {
            // Phase 4 — legacy fills: per-step readFields + tool paramAliases.
            for field in &step.read_fields {
                if let Some(v) = state.get_path(field) {
                    args.entry(field.clone()).or_insert(v);
                }
            }
            for (param, path) in &tool.param_aliases {
                if args.get(param).map(|v| !v.is_null()).unwrap_or(false) {
                    continue;
                }
                if let Some(v) = state.get_path(path) {
                    args.insert(param.clone(), v);
                }
            }
            for param in &tool.parameters {
                if param.required {
                    if !args.contains_key(&param.name) {
                        if let Some(default) = &param.default {
                            args.insert(param.name.clone(), default.clone());
                        }
                    }
                }
            }
        }

        // Any still-missing required parameter forces Phase 5 too.
        for param in tool.required_parameters() {
            if !args.get(&param.name).map(|v| !v.is_null()).unwrap_or(false)
                && !missing.contains(&param.name)
            {
                missing.push(param.name.clone());
                needs_llm_fallback = true;
            }
        }

        // Phase 5 — LLM fallback.
        if needs_llm_fallback && !missing.is_empty() {
            let filled = self
                .llm_fallback(step, tool, state, history, user_query, &missing, &mut args, tracer.as_deref_mut())
                .await;
            args.extend(filled);
        }

        for param in tool.required_parameters() {
            if !args.get(&param.name).map(|v| !v.is_null()).unwrap_or(false) {
                return Err(ParamError::MissingRequired { step: step.id.clone(), param: param.name.clone() });
            }
        }

        // Phase 6 — validate & repair.
        self.validate_and_repair(step, tool, state, &mut args, tracer).await?;

        Ok(args)
    }

    fn trace_binding(
        &self,
        tracer: &mut Option<&mut Tracer>,
        action: BindingAction,
        step: &str,
        param: &str,
        detail: &str,
    ) {
        if let Some(tracer) = tracer.as_deref_mut() {
            tracer.record_binding(BindingEvent {
                action,
                step: Some(step.to_string()),
                param: Some(param.to_string()),
                detail: detail.to_string(),
            });
        }
    }

    /// Resolves a binding's source value by `source_type` (§4.4 Phase 3).
    /// `generated` always defers (returns `None`).
    fn resolve_source(&self, binding: &crate::binding::ParameterBinding, state: &State) -> Option<Value> {
        match binding.source_type {
            SourceType::UserInput => state.get_path(&format!("inputs.{}", binding.source)),
            SourceType::StepOutput => state.get_path(&format!("steps.{}", binding.source)),
            SourceType::State => state.get_path(&binding.source),
            SourceType::Literal => binding.default_value.clone(),
            SourceType::Generated => None,
        }
    }

    async fn llm_fallback(
        &self,
        step: &PlanStep,
        tool: &Tool,
        state: &State,
        history: &History,
        user_query: &str,
        missing: &[String],
        known_args: &mut Map<String, Value>,
        tracer: Option<&mut Tracer>,
    ) -> Map<String, Value> {
        let mut sorted_missing = missing.to_vec();
        sorted_missing.sort();
        let key = CacheKey {
            step_id: step.id.clone(),
            tool_name: tool.name.clone(),
            missing_params: sorted_missing.clone(),
            state_fingerprint: state_fingerprint(&state.as_value()),
        };

        let cached = self.cache.lock().expect("param cache lock poisoned").get(&key).cloned();
        if let Some(cached) = cached {
            return cached;
        }

        let history_summary = history
            .last(10)
            .iter()
            .map(|r| format!("- {} ({}): {}", r.step_id, r.tool_name, r.semantic_description))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "User query (most important — fill requirement/intent-like parameters from \
             this): {user_query}\n\nTool: {tool_name}\nParameter schema: {schema}\n\
             Arguments already known: {known}\nMissing or low-confidence parameters: \
             {missing:?}\n\nRecent step history:\n{history_summary}\n\nCurrent state \
             (compressed): {state}\n\nReturn a JSON object containing only the missing \
             parameters. A string value prefixed with \"state.\" will be resolved against \
             the state tree and substituted.",
            tool_name = tool.name,
            schema = serde_json::to_string(&tool.to_function_schema()).unwrap_or_default(),
            known = serde_json::to_string(known_args).unwrap_or_default(),
            state = compress_state_for_prompt(&state.as_value()),
        );

        let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::ParamBuild);
        let filled = match traced_chat(self.llm.as_ref(), tracer, request).await {
            Ok(response) => match extract_json(&response.content) {
                Some(Value::Object(map)) => map
                    .into_iter()
                    .map(|(k, v)| (k, resolve_state_prefixed(v, state)))
                    .collect(),
                _ => Map::new(),
            },
            Err(_) => Map::new(),
        };

        self.cache.lock().expect("param cache lock poisoned").insert(key, filled.clone());
        filled
    }

    /// Phase 6: runs declared validators, repairing via up to two LLM
    /// calls on failure.
    async fn validate_and_repair(
        &self,
        step: &PlanStep,
        tool: &Tool,
        state: &State,
        args: &mut Map<String, Value>,
        mut tracer: Option<&mut Tracer>,
    ) -> Result<(), ParamError> {
        for attempt in 0..=2 {
            let failures = self.run_validators(tool, args);
            if failures.is_empty() {
                return Ok(());
            }
            if attempt == 2 {
                let (param, reason) = failures.into_iter().next().unwrap();
                return Err(ParamError::ValidationFailed { step: step.id.clone(), param, reason });
            }

            let prompt = format!(
                "The following tool arguments failed validation.\nArguments: {}\n\
                 Validation errors: {:?}\nSchema: {}\nState (compressed): {}\n\
                 Return a JSON object with corrected values for only the failing parameters.",
                serde_json::to_string(args).unwrap_or_default(),
                failures,
                serde_json::to_string(&tool.to_function_schema()).unwrap_or_default(),
                compress_state_for_prompt(&state.as_value()),
            );
            let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::Validation);
            if let Ok(response) = traced_chat(self.llm.as_ref(), tracer.as_deref_mut(), request).await {
                if let Some(Value::Object(patch)) = extract_json(&response.content) {
                    for (k, v) in patch {
                        args.insert(k, v);
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns `(param, reason)` for every failing validator.
    fn run_validators(&self, tool: &Tool, args: &Map<String, Value>) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        for spec in &tool.parameter_validators {
            let value = match args.get(&spec.param) {
                Some(v) => v,
                None => continue,
            };
            match &spec.kind {
                ParameterValidatorKind::Regex(pattern) => {
                    if !regex_matches(pattern, &value_to_string(value)) {
                        failures.push((spec.param.clone(), format!("does not match regex {pattern}")));
                    }
                }
                ParameterValidatorKind::Range(range) => {
                    if !range_ok(range, value) {
                        failures.push((spec.param.clone(), format!("out of range {range}")));
                    }
                }
                ParameterValidatorKind::Enum(values) => {
                    let s = value_to_string(value);
                    if !values.iter().any(|v| v == &s) {
                        failures.push((spec.param.clone(), format!("not one of {values:?}")));
                    }
                }
                ParameterValidatorKind::Custom => {
                    if let Some(validator) = &tool.custom_param_validator {
                        let (ok, message) = validator.validate(args);
                        if !ok {
                            failures.push((spec.param.clone(), message));
                        }
                    }
                }
            }
        }
        failures
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn regex_matches(pattern: &str, value: &str) -> bool {
    regex::Regex::new(pattern).map(|re| re.is_match(value)).unwrap_or(false)
}

fn range_ok(range: &str, value: &Value) -> bool {
    let number = match value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok())) {
        Some(n) => n,
        None => return false,
    };
    let mut parts = range.splitn(2, ',');
    let min = parts.next().unwrap_or("").trim();
    let max = parts.next().unwrap_or("").trim();
    if !min.is_empty() {
        if let Ok(min) = min.parse::<f64>() {
            if number < min {
                return false;
            }
        }
    }
    if !max.is_empty() {
        if let Ok(max) = max.parse::<f64>() {
            if number > max {
                return false;
            }
        }
    }
    true
}

fn resolve_state_prefixed(value: Value, state: &State) -> Value {
    match &value {
        Value::String(s) if s.starts_with("state.") => {
            state.get_path(&s["state.".len()..]).unwrap_or(value)
        }
        _ => value,
    }
}

/// Truncated preview of an argument map for the `param_build` trace event
/// (§4.5 step 3).
pub fn args_preview(args: &Map<String, Value>) -> String {
    truncate_preview(&serde_json::to_string(args).unwrap_or_default(), 500)
}
