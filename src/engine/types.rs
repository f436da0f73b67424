//! The closed event vocabulary emitted by `ExecutionEngine::execute_plan_*`
//! (§4.8's "external contract of `executePlanStream`").

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The sixteen event names the engine may emit, in the order they're
/// introduced by §4.5-§4.8. Nothing outside this set ever reaches the
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Planning,
    ExecutionPlan,
    StageStart,
    ParamBuild,
    StageComplete,
    StageRetry,
    StageJump,
    StageAbort,
    StageError,
    ConsistencyViolation,
    StageReplan,
    BindingPlan,
    ExecutionComplete,
    Error,
    Answer,
    Done,
}

/// One item on the event stream: a name plus an arbitrary JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: EventName,
    pub data: Value,
}

impl Event {
    pub fn new(event: EventName, data: Value) -> Self {
        Self { event, data }
    }
}

/// What a step's `on_fail_strategy` natural-language hint resolves to
/// (§4.5 step 9): a retry of the same step, a jump to a specific step, an
/// abort of the whole plan, or the default fallback (advance past the
/// failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnFailAction {
    Retry,
    Goto(u32),
    Abort,
    Fallback,
}

/// Parses a step's `on_fail_strategy` hint (Chinese or English; the
/// teacher's plans mix both) into an [`OnFailAction`]. Absent a hint, or
/// one that matches nothing recognized, falls back to `Fallback`.
pub fn parse_on_fail_strategy(hint: Option<&str>) -> OnFailAction {
    let hint = match hint {
        Some(h) if !h.trim().is_empty() => h.to_lowercase(),
        _ => return OnFailAction::Fallback,
    };

    if contains_any(&hint, &["回退", "返回", "goto", "jump"]) {
        if let Some(n) = extract_step_number(&hint) {
            return OnFailAction::Goto(n);
        }
    }
    if contains_any(&hint, &["重试", "retry"]) {
        return OnFailAction::Retry;
    }
    if contains_any(&hint, &["停止", "终止", "abort", "stop"]) {
        return OnFailAction::Abort;
    }
    OnFailAction::Fallback
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn extract_step_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}
