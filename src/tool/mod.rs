//! Tool data model and registry (§3 `Tool`/`ToolPostPolicy`, §4.1 ToolRegistry).

pub mod registry;
pub mod types;

pub use registry::ToolRegistry;
pub use types::{
    ArtifactType, Compressor, CustomParamValidator, OnFail, ParamType, ParameterValidatorKind,
    ParameterValidatorSpec, PostSuccessPolicy, ResultHandlingPolicy, Tool, ToolCallResult,
    ToolError, ToolHandler, ToolParameter, ToolPostPolicy, ValidationPolicy, Validator,
};
