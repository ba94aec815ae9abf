pub mod echo;
pub mod executor;
pub mod local;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use local::{LocalToolRegistry, Tool};
pub use registry::{
    InputSchema, ParamCategorization, PromptArgument, PromptDescriptor, ToolDescriptor,
    ToolError, ToolRegistryAdapter, ValidationContext, ValidationReport,
};
pub use schema::{is_identifier_field, is_missing_value, lookup_schema, ActionKind, ActionSchema};
