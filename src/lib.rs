//! An autonomous agent execution kernel: plans a query into steps,
//! resolves each step's arguments against user input/prior output/state,
//! dispatches tools with smart retry, and tracks working memory and
//! cross-step consistency, replanning when execution goes pathological.
//!
//! The kernel never talks to an LLM provider or a tool implementation
//! directly — [`llm::LlmClient`], [`tool::ToolHandler`], and the other
//! traits under each module are the seams external collaborators plug
//! into.

// error module
pub mod error;
pub use error::{KernelError, KernelResult};

// state module (the task-local blackboard)
pub mod state;
pub use state::State;

// execution history
pub mod history;
pub use history::History;

// tool registry and contracts
pub mod tool;
pub use tool::ToolRegistry;

// task planning
pub mod plan;
pub use plan::{ExecutionPlan, TaskPlanner};

// parameter binding
pub mod binding;
pub use binding::BindingPlan;

// argument resolution
pub mod param;
pub use param::ParameterBuilder;

// smart retry
pub mod retry;
pub use retry::RetryConfig;

// pathology detection and replanning
pub mod replan;
pub use replan::ReplanManager;

// working memory and consistency checking
pub mod memory;
pub use memory::{ConsistencyChecker, WorkingMemory};

// structured tracing
pub mod trace;
pub use trace::Tracer;

// per-task LLM client contract
pub mod llm;
pub use llm::LlmClient;

// per-task execution context
pub mod context;
pub use context::ExecutionContext;

// small shared utilities
pub mod util;

// the driver
pub mod engine;
pub use engine::{Event, EventName, ExecutionEngine};

// configuration loading (file + env overlay)
#[cfg(feature = "config-loader")]
pub mod config;
#[cfg(feature = "config-loader")]
pub use config::KernelSettings;
