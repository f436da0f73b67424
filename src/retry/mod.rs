//! Smart retry: error classification and backoff policy (§4.5.1).

use crate::llm::{ChatMessage, ChatRequest, LlmClient, LlmPurpose};
use crate::trace::{traced_chat, Tracer};
use crate::util::extract_json;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ParameterError,
    NetworkError,
    TimeoutError,
    ResourceError,
    LogicError,
    DependencyError,
    PermissionError,
    UnknownError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub is_recoverable: bool,
    pub root_cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_fix_suggestions: Option<Map<String, Value>>,
}

impl ErrorClassification {
    fn unknown(message: &str) -> Self {
        Self {
            error_type: ErrorType::UnknownError,
            is_recoverable: false,
            root_cause: message.to_string(),
            param_fix_suggestions: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    ExponentialBackoff,
    LinearBackoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    #[serde(default)]
    pub retry_on_exceptions: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::ExponentialBackoff,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retry_on_exceptions: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// The delay before attempt `n` (0-indexed, i.e. the delay taken
    /// *after* the nth failure and before the (n+1)th attempt).
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::ExponentialBackoff => {
                let millis = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(n as i32);
                Duration::from_millis(millis as u64)
            }
            RetryStrategy::LinearBackoff => self.base_delay * (n + 1),
        };
        delay.min(self.max_delay)
    }
}

/// A tool's declared recovered-error memory lookup, queried before LLM
/// classification (§4.5.1 tier (a), external collaborator — the long-term
/// memory persistence format itself is out of scope).
#[async_trait]
pub trait RecoveryMemory: Send + Sync {
    /// Returns a previously-successful parameter patch for this
    /// `(tool, error signature)` pair, if one exists with high confidence.
    async fn lookup(&self, tool: &str, error_signature: &str) -> Option<Map<String, Value>>;

    /// Records a successful recovery for future lookup.
    async fn record(
        &self,
        tool: &str,
        error_type: ErrorType,
        message: &str,
        original_params: &Map<String, Value>,
        fixed_params: &Map<String, Value>,
    );
}

/// A no-op recovery memory: every lookup misses, every record is dropped.
/// Used when the caller has not wired a real long-term memory backend.
pub struct NullRecoveryMemory;

#[async_trait]
impl RecoveryMemory for NullRecoveryMemory {
    async fn lookup(&self, _tool: &str, _error_signature: &str) -> Option<Map<String, Value>> {
        None
    }

    async fn record(
        &self,
        _tool: &str,
        _error_type: ErrorType,
        _message: &str,
        _original_params: &Map<String, Value>,
        _fixed_params: &Map<String, Value>,
    ) {
    }
}

/// Tier (c): a deterministic keyword fallback used when no recovery
/// memory hit exists and the LLM call itself fails (recovered from the
/// original's `retry/controller.py` keyword table).
pub fn classify_by_keywords(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    let (error_type, is_recoverable) = if lower.contains("timeout") || lower.contains("timed out") {
        (ErrorType::TimeoutError, true)
    } else if lower.contains("connection") || lower.contains("network") || lower.contains("dns") {
        (ErrorType::NetworkError, true)
    } else if lower.contains("permission denied") || lower.contains("forbidden") || lower.contains("unauthorized") {
        (ErrorType::PermissionError, false)
    } else if lower.contains("not found") || lower.contains("missing") {
        (ErrorType::DependencyError, false)
    } else if lower.contains("invalid") || lower.contains("required parameter") || lower.contains("validation") {
        (ErrorType::ParameterError, true)
    } else if lower.contains("rate limit") || lower.contains("quota") || lower.contains("resource") {
        (ErrorType::ResourceError, true)
    } else {
        (ErrorType::UnknownError, false)
    };
    ErrorClassification {
        error_type,
        is_recoverable,
        root_cause: message.to_string(),
        param_fix_suggestions: None,
    }
}

/// Classifies a tool failure via the LLM (tier (b)); falls back to the
/// keyword table on a malformed or failed LLM response.
pub async fn classify_error(
    llm: &dyn LlmClient,
    tool: &str,
    message: &str,
    tracer: Option<&mut Tracer>,
) -> ErrorClassification {
    let prompt = format!(
        "Classify this tool error into one of parameter_error, network_error, \
         timeout_error, resource_error, logic_error, dependency_error, \
         permission_error, unknown_error. Respond with JSON \
         {{\"error_type\": ..., \"is_recoverable\": bool, \"root_cause\": string}}.\n\n\
         Tool: {tool}\nError: {message}"
    );
    let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::ErrorAnalysis);
    match traced_chat(llm, tracer, request).await {
        Ok(response) => extract_json(&response.content)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| classify_by_keywords(message)),
        Err(_) => classify_by_keywords(message),
    }
}

/// Secondary LLM call proposing concrete parameter patches for a
/// `parameter_error` classification.
pub async fn propose_parameter_fix(
    llm: &dyn LlmClient,
    failed_args: &Map<String, Value>,
    classification: &ErrorClassification,
    tracer: Option<&mut Tracer>,
) -> Option<Map<String, Value>> {
    let prompt = format!(
        "The following tool arguments failed with root cause: {}\n\
         Current arguments: {}\n\
         Return a JSON object containing only the parameters that need to change, \
         with corrected values.",
        classification.root_cause,
        serde_json::to_string(failed_args).unwrap_or_default()
    );
    let request = ChatRequest::new(vec![ChatMessage::user(prompt)], LlmPurpose::ParamFix);
    let response = traced_chat(llm, tracer, request).await.ok()?;
    match extract_json(&response.content) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("retries exhausted for tool {tool} after {attempts} attempts")]
    Exhausted { tool: String, attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedLlmClient;
    use crate::llm::ChatResponse;

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            strategy: RetryStrategy::ExponentialBackoff,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            retry_on_exceptions: vec![],
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(500)); // capped
    }

    #[test]
    fn linear_backoff_grows_linearly() {
        let config = RetryConfig { strategy: RetryStrategy::LinearBackoff, ..RetryConfig::default() };
        assert_eq!(config.delay_for_attempt(0), config.base_delay);
        assert_eq!(config.delay_for_attempt(1), config.base_delay * 2);
    }

    #[test]
    fn immediate_strategy_has_zero_delay() {
        let config = RetryConfig { strategy: RetryStrategy::Immediate, ..RetryConfig::default() };
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(10), Duration::ZERO);
    }

    #[test]
    fn keyword_fallback_classifies_timeout_as_recoverable() {
        let c = classify_by_keywords("request timed out after 30s");
        assert_eq!(c.error_type, ErrorType::TimeoutError);
        assert!(c.is_recoverable);
    }

    #[test]
    fn keyword_fallback_classifies_permission_as_unrecoverable() {
        let c = classify_by_keywords("permission denied for resource");
        assert_eq!(c.error_type, ErrorType::PermissionError);
        assert!(!c.is_recoverable);
    }

    #[tokio::test]
    async fn classify_error_prefers_llm_and_falls_back_on_garbage() {
        let llm = ScriptedLlmClient::text("nonsense");
        let c = classify_error(&llm, "search", "connection refused", None).await;
        assert_eq!(c.error_type, ErrorType::NetworkError);
    }

    #[tokio::test]
    async fn classify_error_uses_llm_classification_when_parseable() {
        let llm = ScriptedLlmClient::text(
            r#"{"error_type": "logic_error", "is_recoverable": false, "root_cause": "bad state"}"#,
        );
        let c = classify_error(&llm, "search", "something weird", None).await;
        assert_eq!(c.error_type, ErrorType::LogicError);
        assert!(!c.is_recoverable);
    }

    #[tokio::test]
    async fn propose_parameter_fix_returns_patch_object() {
        let llm = ScriptedLlmClient::text(r#"{"limit": 10}"#);
        let classification = classify_by_keywords("invalid parameter limit");
        let mut args = Map::new();
        args.insert("limit".to_string(), Value::String("abc".into()));
        let patch = propose_parameter_fix(&llm, &args, &classification, None).await.unwrap();
        assert_eq!(patch["limit"], 10);
    }

    #[tokio::test]
    async fn null_recovery_memory_always_misses() {
        let memory = NullRecoveryMemory;
        assert!(memory.lookup("search", "sig").await.is_none());
        memory.record("search", ErrorType::TimeoutError, "msg", &Map::new(), &Map::new()).await;
    }
}
