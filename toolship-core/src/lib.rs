//! # Toolship Core
//!
//! Runs containerized security, compliance and IaC tools behind one
//! invocation model. Provides target resolution, option rendering,
//! invocation plans, exit-code tolerant execution, multi-stage pipelines
//! and bounded fan-out, plus the built-in tool catalog.

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod operations;
pub mod options;
pub mod pipeline;
pub mod plan;
pub mod policy;
pub mod runtime;
pub mod target;

// Re-export commonly used types at the crate root.
pub use aggregate::{FanOutResult, aggregate};
pub use catalog::{OperationDef, ToolCatalog, ToolDefinition};
pub use config::{ToolshipConfig, config_exists, load_config};
pub use error::{
    CatalogError, ConfigError, ExecError, OptionError, PipelineError, Result, ToolshipError,
};
pub use executor::{Execute, ExecutionResult, StageInput, StageIo, TolerantExecutor};
pub use operations::Toolship;
pub use options::{OptionValue, ToolOptions};
pub use pipeline::{PartialFailure, Pipeline, PipelineOutcome, PipelineStage, StageReport};
pub use plan::{ArgumentVector, EnvBindings, InvocationPlan, PlanStep, ToolSpec};
pub use policy::{ExitClassification, ExitPolicy};
pub use runtime::{ContainerRuntime, DockerRuntime, ScriptedRuntime};
pub use target::{MountPlan, PrepareCommand, Target, TargetKind};
