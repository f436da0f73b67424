//! Crate-level error types.
//!
//! Wraps each sub-module's typed error via `#[from]` so the `?` operator
//! converts them automatically, and pairs with [`error_stack::Report`] for
//! context-carrying propagation across component boundaries (e.g. which
//! step, which tool, which plan revision was in flight).
//!
//! The five error kinds named by the kernel design (planning, binding,
//! parameter-validation, tool-execution, expectation-validation) are not
//! all represented as `KernelError` variants: most of them are handled
//! locally by the component that detects them (see each module's own
//! error enum) and only escalate to `KernelError` when they cross a
//! component boundary unresolved.

use thiserror::Error;

/// Crate-level error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// An error from the planning stage (§4.2).
    #[error("planning error: {0}")]
    Plan(#[from] crate::plan::PlanError),

    /// An error resolving a parameter binding (§4.3/§4.4).
    #[error("binding error: {0}")]
    Binding(#[from] crate::binding::BindingError),

    /// An error building or validating step arguments (§4.4).
    #[error("parameter error: {0}")]
    Param(#[from] crate::param::ParamError),

    /// An error dispatching or retrying a tool call (§4.5.1).
    #[error("tool error: {0}")]
    Tool(#[from] crate::tool::ToolError),

    /// An error produced while detecting or building a replan (§4.7).
    #[error("replan error: {0}")]
    Replan(#[from] crate::replan::ReplanError),

    /// An error from the configuration loader (requires `config-loader`).
    #[cfg(feature = "config-loader")]
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal or untyped error described by a message string.
    #[error("{0}")]
    Internal(String),
}

impl KernelError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::{Report, ResultExt};

    #[test]
    fn plan_error_converts_via_from() {
        let plan_err = crate::plan::PlanError::Unparseable("bad json".into());
        let kernel_err: KernelError = plan_err.into();
        assert!(matches!(kernel_err, KernelError::Plan(_)));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let kernel_err: KernelError = io_err.into();
        assert!(matches!(kernel_err, KernelError::Io(_)));
        assert!(kernel_err.to_string().contains("file missing"));
    }

    #[test]
    fn serde_error_converts_via_from() {
        let bad_json = serde_json::from_str::<serde_json::Value>("not json");
        let kernel_err: KernelError = bad_json.unwrap_err().into();
        assert!(matches!(kernel_err, KernelError::Serialization(_)));
    }

    #[test]
    fn internal_error_display() {
        let err = KernelError::internal("something broke");
        assert_eq!(err.to_string(), "something broke");
    }

    #[test]
    fn report_carries_context() {
        let result: KernelResult<()> = Err(Report::new(KernelError::internal("root cause")))
            .attach("while loading plan");
        let report = result.unwrap_err();
        let display = format!("{report:?}");
        assert!(display.contains("root cause"));
        assert!(display.contains("while loading plan"));
    }
}
