//! Task planning: complexity classification and plan synthesis (§4.2).

pub mod planner;
pub mod types;

pub use planner::{IntentDecision, IntentRouter, PlanningContext, TaskPlanner};
pub use types::{
    ExecutionPlan, ExecutionStrategy, PlanStep, ReplanTrigger, TaskComplexity, TaskProfile,
};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("LLM returned an unparseable plan: {0}")]
    Unparseable(String),
    #[error("plan failed validation: {0}")]
    Invalid(String),
}
