//! The LLM client contract (external collaborator, §6).
//!
//! The kernel never implements a concrete chat-completion endpoint; it
//! only depends on this trait. Implementations live outside this crate
//! (an HTTP client against a provider API, a mock for tests, etc.), the
//! same way `mofa-kernel::llm::provider::LLMProvider` is a trait the
//! kernel defines and `mofa-foundation` implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of reasons the kernel invokes the LLM, used to tag every
/// call for tracing and reporting (§4.8, §9 Design Notes: "LLM-prompt
/// purposes as an enum").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmPurpose {
    Planning,
    BindingPlan,
    ParamBuild,
    Validation,
    ErrorAnalysis,
    ParamFix,
    MemoryQuery,
    MemorySummary,
    PromptGen,
    Replan,
    IncrementalReplan,
    ConsistencyCheck,
    CheckpointRegister,
    WorkingMemory,
    Other,
}

impl LlmPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::BindingPlan => "binding_plan",
            Self::ParamBuild => "param_build",
            Self::Validation => "validation",
            Self::ErrorAnalysis => "error_analysis",
            Self::ParamFix => "param_fix",
            Self::MemoryQuery => "memory_query",
            Self::MemorySummary => "memory_summary",
            Self::PromptGen => "prompt_gen",
            Self::Replan => "replan",
            Self::IncrementalReplan => "incremental_replan",
            Self::ConsistencyCheck => "consistency_check",
            Self::CheckpointRegister => "checkpoint_register",
            Self::WorkingMemory => "working_memory",
            Self::Other => "other",
        }
    }
}

/// A single message in a chat-completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat-completion request. Mirrors the external contract's
/// `chat(messages[], temperature, maxTokens?, tracePurpose)` signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub purpose: LlmPurpose,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, purpose: LlmPurpose) -> Self {
        Self { messages, temperature: 0.2, max_tokens: None, purpose }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Optional token accounting, when the provider reports it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub response_tokens: u32,
    pub total_tokens: u32,
}

/// The result of a chat completion. The response string is treated by the
/// kernel as opaque natural language — only [`crate::util::extract_json`]
/// ever tries to find structure in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), model: None, usage: None }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call timed out")]
    Timeout,
    #[error("LLM call failed: {0}")]
    Provider(String),
}

/// The LLM client contract. The kernel calls this at every LLM-dependent
/// decision point (classification, planning, binding, argument fallback,
/// validation, retry classification, replanning, consistency checks,
/// memory summarization). Every call carries an operation timeout
/// inherited from the client (default 120s, §5); timed-out calls surface
/// as [`LlmError::Timeout`], which smart retry reports as `timeout_error`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}
