//! Structured per-span tracing (§4.8).
//!
//! Tracing is task-local: each `ExecutionContext` owns one `Tracer`: a
//! tree of spans rooted at the task's top-level query, with a stack
//! tracking the currently active span (the Rust analogue of the source's
//! coroutine-local "current span" propagation).

use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError, LlmPurpose};
use crate::util::truncate_preview;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

const OVERVIEW_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Retry,
    Jump,
    Abort,
    Fallback,
    Replan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingAction {
    PlanCreate,
    Resolve,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallEvent {
    pub purpose: LlmPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    pub temperature: f32,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub tool: String,
    pub args_preview: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub kind: FlowKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub operation: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingEvent {
    pub action: BindingAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    LlmCall(LlmCallEvent),
    ToolCall(ToolCallEvent),
    Flow(FlowEvent),
    Memory(MemoryEvent),
    Binding(BindingEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub span_type: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub events: Vec<TraceEvent>,
    pub children: Vec<Span>,
    #[serde(default)]
    pub aborted: bool,
}

impl Span {
    fn new(parent_id: Option<String>, name: &str, span_type: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            name: name.to_string(),
            span_type: span_type.to_string(),
            start_time: Utc::now(),
            end_time: None,
            events: Vec::new(),
            children: Vec::new(),
            aborted: false,
        }
    }

    fn find_mut(&mut self, path: &[usize]) -> &mut Span {
        match path {
            [] => self,
            [head, rest @ ..] => self.children[*head].find_mut(rest),
        }
    }
}

/// Per-purpose LLM call counts, token totals, tool success/failure
/// counts, flow-event counters, and binding aggregates, produced at trace
/// end (§4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub llm_call_counts: HashMap<String, u32>,
    pub total_prompt_tokens: u64,
    pub total_response_tokens: u64,
    pub tool_success_count: u32,
    pub tool_failure_count: u32,
    pub flow_event_counts: HashMap<String, u32>,
    pub binding_total: u32,
    pub binding_resolved: u32,
    pub binding_fallback: u32,
}

pub struct Tracer {
    query: String,
    user_id: String,
    root: Span,
    /// Path of child indices from `root` to the currently active span.
    current_path: Vec<usize>,
}

impl Tracer {
    pub fn start(query: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            root: Span::new(None, "root", "root"),
            current_path: Vec::new(),
        }
    }

    fn current_span_mut(&mut self) -> &mut Span {
        self.root.find_mut(&self.current_path)
    }

    /// Opens a child span under the current span and makes it current.
    /// Returns the new span's id.
    pub fn start_span(&mut self, name: &str, span_type: &str) -> String {
        let parent_id = self.current_span_mut().id.clone();
        let span = Span::new(Some(parent_id), name, span_type);
        let id = span.id.clone();
        self.current_span_mut().children.push(span);
        let new_index = self.current_span_mut().children.len() - 1;
        self.current_path.push(new_index);
        id
    }

    /// Closes the current span and returns control to its parent.
    pub fn end_span(&mut self) {
        if self.current_path.is_empty() {
            return; // root never ends explicitly; see `finish`.
        }
        self.current_span_mut().end_time = Some(Utc::now());
        self.current_path.pop();
    }

    /// Closes the current span with an `aborted` marker (§5 cancellation).
    pub fn abort_current_span(&mut self) {
        if self.current_path.is_empty() {
            self.root.aborted = true;
            self.root.end_time = Some(Utc::now());
            return;
        }
        let span = self.current_span_mut();
        span.aborted = true;
        span.end_time = Some(Utc::now());
        self.current_path.pop();
    }

    pub fn record_llm_call(&mut self, event: LlmCallEvent) {
        self.current_span_mut().events.push(TraceEvent::LlmCall(event));
    }

    pub fn record_tool_call(&mut self, event: ToolCallEvent) {
        self.current_span_mut().events.push(TraceEvent::ToolCall(event));
    }

    pub fn record_flow(&mut self, event: FlowEvent) {
        self.current_span_mut().events.push(TraceEvent::Flow(event));
    }

    pub fn record_memory(&mut self, event: MemoryEvent) {
        self.current_span_mut().events.push(TraceEvent::Memory(event));
    }

    pub fn record_binding(&mut self, event: BindingEvent) {
        self.current_span_mut().events.push(TraceEvent::Binding(event));
    }

    /// Ends the root span and returns the finished trace tree alongside
    /// its aggregate summary.
    pub fn finish(mut self) -> (Span, TraceSummary) {
        while !self.current_path.is_empty() {
            self.end_span();
        }
        self.root.end_time = Some(Utc::now());
        let summary = summarize(&self.root);
        (self.root, summary)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Issues a chat completion and, if a tracer is supplied, records it as an
/// [`LlmCallEvent`] on the current span before returning the result (§4.8).
/// Every LLM-dependent decision point in the kernel routes through this
/// instead of calling [`LlmClient::chat`] directly, so the trace summary's
/// per-purpose call counts (§8) reflect what actually ran.
pub async fn traced_chat(
    llm: &dyn LlmClient,
    tracer: Option<&mut Tracer>,
    request: ChatRequest,
) -> Result<ChatResponse, LlmError> {
    let purpose = request.purpose;
    let temperature = request.temperature;
    let prompt = request
        .messages
        .iter()
        .map(|m| format!("[{:?}] {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let start = std::time::Instant::now();
    let result = llm.chat(request).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    if let Some(tracer) = tracer {
        let event = match &result {
            Ok(response) => LlmCallEvent {
                purpose,
                model: response.model.clone(),
                prompt_tokens: response.usage.map(|u| u.prompt_tokens),
                response_tokens: response.usage.map(|u| u.response_tokens),
                total_tokens: response.usage.map(|u| u.total_tokens),
                temperature,
                duration_ms,
                success: true,
                error: None,
                prompt,
                response: response.content.clone(),
            },
            Err(err) => LlmCallEvent {
                purpose,
                model: None,
                prompt_tokens: None,
                response_tokens: None,
                total_tokens: None,
                temperature,
                duration_ms,
                success: false,
                error: Some(err.to_string()),
                prompt,
                response: String::new(),
            },
        };
        tracer.record_llm_call(event);
    }

    result
}

fn summarize(span: &Span) -> TraceSummary {
    let mut summary = TraceSummary::default();
    accumulate(span, &mut summary);
    summary
}

fn accumulate(span: &Span, summary: &mut TraceSummary) {
    for event in &span.events {
        match event {
            TraceEvent::LlmCall(e) => {
                *summary.llm_call_counts.entry(e.purpose.as_str().to_string()).or_insert(0) += 1;
                summary.total_prompt_tokens += e.prompt_tokens.unwrap_or(0) as u64;
                summary.total_response_tokens += e.response_tokens.unwrap_or(0) as u64;
            }
            TraceEvent::ToolCall(e) => {
                if e.success {
                    summary.tool_success_count += 1;
                } else {
                    summary.tool_failure_count += 1;
                }
            }
            TraceEvent::Flow(e) => {
                let key = format!("{:?}", e.kind).to_lowercase();
                *summary.flow_event_counts.entry(key).or_insert(0) += 1;
            }
            TraceEvent::Binding(e) => {
                summary.binding_total += 1;
                match e.action {
                    BindingAction::Resolve => summary.binding_resolved += 1,
                    BindingAction::Fallback => summary.binding_fallback += 1,
                    BindingAction::PlanCreate => {}
                }
            }
            TraceEvent::Memory(_) => {}
        }
    }
    for child in &span.children {
        accumulate(child, summary);
    }
}

/// Renders an overview of a span tree with prompt/response text truncated
/// to 500 chars (§4.8); the full span tree itself always carries the
/// untruncated text for detailed reports.
pub fn truncated_overview(span: &Span) -> Span {
    let mut clone = span.clone();
    for event in &mut clone.events {
        if let TraceEvent::LlmCall(e) = event {
            e.prompt = truncate_preview(&e.prompt, OVERVIEW_PREVIEW_CHARS);
            e.response = truncate_preview(&e.response, OVERVIEW_PREVIEW_CHARS);
        }
    }
    clone.children = clone.children.iter().map(truncated_overview).collect();
    clone
}
