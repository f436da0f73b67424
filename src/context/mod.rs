//! Per-task execution context.
//!
//! Every task owns one `ExecutionContext`, and nothing inside it is ever
//! shared with another task (§5): its own `State`, `WorkingMemory`,
//! `ConsistencyChecker`, `History`, `Tracer`, and `ParameterBuilder`
//! (whose LLM-argument cache is itself per-task). This mirrors the
//! teacher's `AgentContext`, but since a task is a single cooperative
//! flow rather than a tree of concurrently-racing readers/writers, the
//! owned data here needs no internal `RwLock` — only the cancellation
//! signal is shared (cloned into whatever spawns the task's future).

use crate::history::History;
use crate::llm::LlmClient;
use crate::memory::{ConsistencyChecker, WorkingMemory};
use crate::param::ParameterBuilder;
use crate::state::State;
use crate::trace::Tracer;
use async_trait::async_trait;
use std::sync::Arc;

/// A cooperative cancellation signal, checked at every suspension point:
/// every LLM call, tool call, and retry delay (§5).
///
/// Under the `streaming` feature this wraps `tokio_util`'s
/// `CancellationToken` directly, since `executePlanStream` already spawns
/// the run loop onto its own task (mirroring the teacher's
/// `StateGraphImpl::stream`) and a shared, clonable, waitable signal is
/// exactly what that needs. Without `streaming` there's no spawned task to
/// coordinate with, so a plain `AtomicBool` is enough and avoids the extra
/// dependency.
#[cfg(feature = "streaming")]
#[derive(Clone, Default)]
pub struct CancellationToken(tokio_util::sync::CancellationToken);

#[cfg(feature = "streaming")]
impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[cfg(not(feature = "streaming"))]
#[derive(Clone, Default)]
pub struct CancellationToken {
    triggered: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(not(feature = "streaming"))]
impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.triggered.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.triggered.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Invoked on every terminal path — normal completion, abort, *and*
/// cancellation alike (§10 supplemental: the original promotes working
/// memory to long-term storage on any of the three, not cancellation
/// only). An external collaborator; the kernel only depends on this
/// trait.
#[async_trait]
pub trait TaskLifecycle: Send + Sync {
    async fn end_task(&self, user_id: &str, working_memory: &WorkingMemory, promote_to_long_term: bool);
}

/// A no-op lifecycle hook, used when the caller hasn't wired a real
/// long-term memory backend.
pub struct NullTaskLifecycle;

#[async_trait]
impl TaskLifecycle for NullTaskLifecycle {
    async fn end_task(&self, _user_id: &str, _working_memory: &WorkingMemory, _promote_to_long_term: bool) {}
}

/// Everything a single running task owns exclusively.
pub struct ExecutionContext {
    pub task_id: String,
    pub user_id: String,
    pub state: State,
    pub working_memory: WorkingMemory,
    pub consistency: ConsistencyChecker,
    pub history: History,
    pub tracer: Tracer,
    pub param_builder: ParameterBuilder,
    /// Steps dispatched since the last replan; feeds `ExecutionStrategy`'s
    /// periodic/proactive triggers (§4.7).
    pub steps_since_last_replan: u32,
    cancellation: CancellationToken,
    lifecycle: Arc<dyn TaskLifecycle>,
}

impl ExecutionContext {
    pub fn new(
        task_id: impl Into<String>,
        user_id: impl Into<String>,
        query: impl Into<String>,
        state: State,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let user_id = user_id.into();
        let query = query.into();
        Self {
            task_id: task_id.into(),
            tracer: Tracer::start(query, user_id.clone()),
            user_id,
            state,
            working_memory: WorkingMemory::new(),
            consistency: ConsistencyChecker::new(),
            history: History::new(),
            param_builder: ParameterBuilder::new(llm),
            steps_since_last_replan: 0,
            cancellation: CancellationToken::new(),
            lifecycle: Arc::new(NullTaskLifecycle),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn TaskLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// A clone of this task's cancellation signal, to be handed to
    /// whatever drives the task's future (a caller wanting to cancel
    /// mid-flight, a per-task supervisor, etc.).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Runs the task-lifecycle hook (§5 cancellation, §10 supplemental).
    pub async fn end_task(&self, promote_to_long_term: bool) {
        self.lifecycle.end_task(&self.user_id, &self.working_memory, promote_to_long_term).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedLlmClient;
    use std::sync::Mutex;

    struct RecordingLifecycle {
        calls: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl TaskLifecycle for RecordingLifecycle {
        async fn end_task(&self, _user_id: &str, _working_memory: &WorkingMemory, promote_to_long_term: bool) {
            self.calls.lock().unwrap().push(promote_to_long_term);
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("task-1", "user-1", "do the thing", State::new(), Arc::new(ScriptedLlmClient::new(vec![])))
    }

    #[test]
    fn new_context_starts_with_empty_owned_state() {
        let c = ctx();
        assert!(c.working_memory.pending_todos().is_empty());
        assert!(c.consistency.checkpoints().is_empty());
        assert!(c.history.records().is_empty());
        assert!(!c.is_cancelled());
    }

    #[test]
    fn cancellation_token_clone_observes_cancel() {
        let c = ctx();
        let token = c.cancellation_token();
        assert!(!token.is_cancelled());
        c.cancel();
        assert!(token.is_cancelled());
        assert!(c.is_cancelled());
    }

    #[tokio::test]
    async fn end_task_invokes_lifecycle_hook_with_promote_flag() {
        let lifecycle = Arc::new(RecordingLifecycle { calls: Mutex::new(Vec::new()) });
        let c = ctx().with_lifecycle(lifecycle.clone());
        c.end_task(false).await;
        c.end_task(true).await;
        assert_eq!(*lifecycle.calls.lock().unwrap(), vec![false, true]);
    }
}
