//! The tool data model: parameters, post-execution policy, and the
//! external tool-executor contract (§3, §6).

use crate::state::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// The declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// One entry in a tool's ordered parameter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            enum_values: None,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, default: Value) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: Some(default),
            enum_values: None,
            description: None,
        }
    }
}

/// A declared per-parameter validator, applied in ParameterBuilder Phase 6.
#[derive(Debug, Clone)]
pub enum ParameterValidatorKind {
    /// Stringified value must match this regex.
    Regex(String),
    /// `"min,max"`; either side empty means unbounded. Value must parse as
    /// a number within the closed interval.
    Range(String),
    /// Comma-separated membership list.
    Enum(Vec<String>),
    /// Delegates to the tool's [`CustomParamValidator`].
    Custom,
}

#[derive(Debug, Clone)]
pub struct ParameterValidatorSpec {
    pub param: String,
    pub kind: ParameterValidatorKind,
}

/// A tool-supplied custom argument validator (the `custom` kind of
/// [`ParameterValidatorKind`]).
pub trait CustomParamValidator: Send + Sync {
    fn validate(&self, args: &Map<String, Value>) -> (bool, String);
}

/// The artifact type a consistency checkpoint or post-policy refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Code,
    Document,
    Config,
    Interface,
    Schema,
    Requirements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    Retry,
    Replan,
    Abort,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub on_fail: OnFail,
    pub max_retries: u32,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self { on_fail: OnFail::Continue, max_retries: 3 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostSuccessPolicy {
    pub high_impact: bool,
    pub requires_consistency_check: bool,
    pub extract_working_memory: bool,
    /// Tool-level replan forcing (§4.7 "Tool-level forcing"): when true,
    /// `replan_condition` is evaluated via a tiny LLM call after every
    /// successful dispatch of this tool.
    #[serde(default)]
    pub force_replan_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replan_condition: Option<String>,
    #[serde(default)]
    pub consistency_check_against: Vec<ArtifactType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultHandlingPolicy {
    pub register_as_checkpoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_type: Option<ArtifactType>,
    /// Maps a key in the tool's result to a flat state key (`stateMapping`).
    #[serde(default)]
    pub state_mapping: HashMap<String, String>,
}

/// A tool's post-execution policy (§3 `ToolPostPolicy`).
///
/// The source additionally carries a legacy `replan_policy` field merged
/// via `get_effective_post_policy`; per §9 Design Notes this crate exposes
/// only `ToolPostPolicy` externally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPostPolicy {
    pub validation: ValidationPolicyOpt,
    pub post_success: PostSuccessPolicy,
    pub result_handling: ResultHandlingPolicy,
}

/// `ValidationPolicy` is itself optional-by-default at the tool level
/// (most tools don't override on-fail behavior), so `ToolPostPolicy`
/// derives `Default` while still nesting a fully-populated default
/// `ValidationPolicy` when present.
pub type ValidationPolicyOpt = ValidationPolicy;

/// The result of dispatching a tool (external tool-executor contract,
/// §6): `{success, error?, ...}` with arbitrary extra keys preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Every key the tool returned, `success`/`error` included, so callers
    /// that want the raw object (e.g. for `stateMapping`) can read it.
    #[serde(flatten)]
    pub data: Map<String, Value>,
    /// Set when a step's `expectations` validator ran and failed even
    /// though the tool itself reported success (§4.5.2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectation_failed: Option<bool>,
}

impl ToolCallResult {
    pub fn success(data: Map<String, Value>) -> Self {
        Self { success: true, error: None, data, expectation_failed: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), data: Map::new(), expectation_failed: None }
    }

    /// Any additional key beyond `success`/`error`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn as_value(&self) -> Value {
        let mut m = self.data.clone();
        m.insert("success".to_string(), Value::Bool(self.success));
        if let Some(err) = &self.error {
            m.insert("error".to_string(), Value::String(err.clone()));
        }
        Value::Object(m)
    }
}

/// Validates a tool's result against a natural-language expectation; may
/// consult the LLM (§3, §9 Design Notes: `Validator{Validate(result,
/// expectation, state, mode) → (bool, string)}`).
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        result: &ToolCallResult,
        expectation: &str,
        state: &State,
        mode: &str,
    ) -> (bool, String);
}

/// Compresses a tool's result into a compact form for future LLM prompts
/// (§3, §9 Design Notes: `Compressor{Compress(result, state) → result}`).
pub trait Compressor: Send + Sync {
    fn compress(&self, result: &Value, state: &State) -> Value;
}

/// Dispatches a tool call given resolved arguments. Implementations live
/// outside this crate (§1: tool implementations are an external
/// collaborator); the kernel only depends on this trait.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, args: Map<String, Value>) -> ToolCallResult;
}

/// A registered tool: metadata, policies, and dispatch handler.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub output_schema: Option<Value>,
    pub validator: Option<Arc<dyn Validator>>,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub alternative_tools: Vec<String>,
    pub parameter_validators: Vec<ParameterValidatorSpec>,
    pub custom_param_validator: Option<Arc<dyn CustomParamValidator>>,
    pub post_policy: ToolPostPolicy,
    /// Deprecated: non-LLM fallback mapping parameter name -> state path
    /// (§9 Design Notes: treat as a compatibility shim).
    pub param_aliases: HashMap<String, String>,
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            output_schema: None,
            validator: None,
            compressor: None,
            alternative_tools: Vec::new(),
            parameter_validators: Vec::new(),
            custom_param_validator: None,
            post_policy: ToolPostPolicy::default(),
            param_aliases: HashMap::new(),
            handler,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ToolParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_post_policy(mut self, policy: ToolPostPolicy) -> Self {
        self.post_policy = policy;
        self
    }

    pub fn with_alternative_tools(mut self, alternatives: Vec<String>) -> Self {
        self.alternative_tools = alternatives;
        self
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ToolParameter> {
        self.parameters.iter().filter(|p| p.required)
    }

    /// One-line sketch used by the tools catalog (§4.1): `name(p1, p2*): description`
    /// where `*` marks required parameters.
    pub fn catalog_line(&self) -> String {
        let params = self
            .parameters
            .iter()
            .map(|p| if p.required { format!("{}*", p.name) } else { p.name.clone() })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({}): {}", self.name, params, self.description)
    }

    /// An OpenAI-style function-calling schema for this tool.
    pub fn to_function_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let mut prop = Map::new();
            prop.insert("type".to_string(), Value::String(param_type_json(p.param_type).to_string()));
            if let Some(desc) = &p.description {
                prop.insert("description".to_string(), Value::String(desc.clone()));
            }
            if let Some(enum_values) = &p.enum_values {
                prop.insert("enum".to_string(), Value::Array(enum_values.clone()));
            }
            properties.insert(p.name.clone(), Value::Object(prop));
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": Value::Object(properties),
                "required": Value::Array(required),
            }
        })
    }
}

fn param_type_json(t: ParamType) -> &'static str {
    match t {
        ParamType::String => "string",
        ParamType::Number => "number",
        ParamType::Boolean => "boolean",
        ParamType::Object => "object",
        ParamType::Array => "array",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool already registered: {0}")]
    AlreadyRegistered(String),
    #[error("malformed tool declaration for {0}: {1}")]
    Malformed(String, String),
    #[error("all alternatives exhausted for tool {0}")]
    AlternativesExhausted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn execute(&self, args: Map<String, Value>) -> ToolCallResult {
            ToolCallResult::success(args)
        }
    }

    #[test]
    fn catalog_line_marks_required_parameters() {
        let tool = Tool::new("echo", "echoes its input", Arc::new(EchoHandler))
            .with_parameters(vec![ToolParameter::required("x", ParamType::String)]);
        assert_eq!(tool.catalog_line(), "echo(x*): echoes its input");
    }

    #[test]
    fn function_schema_lists_required_and_enum() {
        let mut p = ToolParameter::required("mode", ParamType::String);
        p.enum_values = Some(vec![Value::String("fast".into()), Value::String("slow".into())]);
        let tool = Tool::new("run", "runs", Arc::new(EchoHandler)).with_parameters(vec![p]);
        let schema = tool.to_function_schema();
        assert_eq!(schema["parameters"]["required"], serde_json::json!(["mode"]));
        assert_eq!(schema["parameters"]["properties"]["mode"]["enum"][0], "fast");
    }

    #[tokio::test]
    async fn tool_call_result_preserves_extra_keys() {
        let mut data = Map::new();
        data.insert("documents".to_string(), serde_json::json!(["a", "b"]));
        let result = ToolCallResult::success(data);
        assert!(result.success);
        assert_eq!(result.get("documents").unwrap(), &serde_json::json!(["a", "b"]));
    }

    #[test]
    fn as_value_includes_success_flag() {
        let result = ToolCallResult::failure("boom");
        let v = result.as_value();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "boom");
    }
}
