//! 工具层：注册表、参数校验、资源足迹、执行器与内置运维工具

pub mod builtin;
pub mod echo;
pub mod executor;
pub mod footprint;
pub mod registry;
pub mod schema;

pub use builtin::{builtin_registry, SentEmail, ServiceState};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use footprint::{plan_waves, ResourceFootprint};
pub use registry::{ActionSpec, Tool, ToolError, ToolRegistry};
pub use schema::{missing_fields, schema_of, validate_args, ValidationError};
