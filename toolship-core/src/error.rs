//! Error types for toolship.
//!
//! Uses `thiserror` for structured variants. Execution failures keep the
//! tool and stage names so callers can render a useful message without
//! re-deriving context, and infrastructure failures stay distinguishable
//! from tools that ran and reported problems.

use std::path::PathBuf;

use crate::pipeline::PartialFailure;

/// Top-level error type for the toolship library.
#[derive(Debug, thiserror::Error)]
pub enum ToolshipError {
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Option error: {0}")]
    Option(#[from] OptionError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolshipError {
    /// True when a wrapped tool ran and classified its own run as failed.
    ///
    /// This is an informative outcome (e.g. "issues were found"), not an
    /// infrastructure problem.
    pub fn is_tool_failure(&self) -> bool {
        match self {
            ToolshipError::Exec(e) => e.is_tool_failure(),
            ToolshipError::Pipeline(PipelineError::StageFailed(failure)) => {
                failure.reason.is_tool_failure()
            }
            _ => false,
        }
    }
}

/// Errors from resolving, starting and classifying a single tool invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("Target not found: {}", .path.display())]
    TargetNotFound { path: PathBuf },

    #[error("Invalid target {}: {reason}", .path.display())]
    InvalidTarget { path: PathBuf, reason: String },

    #[error("Container for '{tool}' failed to start from image {image}: {message}")]
    ContainerStart {
        tool: String,
        image: String,
        message: String,
    },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Tool '{tool}' was cancelled")]
    Cancelled { tool: String },

    #[error("Tool '{tool}' reported failure (exit code {exit_code}): {message}")]
    ToolReportedFailure {
        tool: String,
        exit_code: i32,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Tool '{tool}' produced no output (exit code {exit_code})")]
    EmptyOutput {
        tool: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Runtime error while running '{tool}': {message}")]
    Runtime { tool: String, message: String },
}

impl ExecError {
    /// Name of the tool involved, when the error happened after resolution.
    pub fn tool(&self) -> Option<&str> {
        match self {
            ExecError::TargetNotFound { .. } | ExecError::InvalidTarget { .. } => None,
            ExecError::ContainerStart { tool, .. }
            | ExecError::Timeout { tool, .. }
            | ExecError::Cancelled { tool }
            | ExecError::ToolReportedFailure { tool, .. }
            | ExecError::EmptyOutput { tool, .. }
            | ExecError::Runtime { tool, .. } => Some(tool),
        }
    }

    /// The tool ran to completion and its exit policy classified the run as failed.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            ExecError::ToolReportedFailure { .. } | ExecError::EmptyOutput { .. }
        )
    }

    /// The run was stopped by a deadline or an explicit cancellation.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExecError::Timeout { .. } | ExecError::Cancelled { .. })
    }
}

/// Errors from composing and running multi-stage pipelines.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline has no stages")]
    Empty,

    #[error("Stage {index} ('{stage}') reads previous output but is the first stage")]
    DanglingInput { index: usize, stage: String },

    #[error(
        "Stage {} ('{}', tool '{}') failed after {} completed stage(s): {}",
        .0.failed_stage_index,
        .0.stage,
        .0.tool,
        .0.completed_stages.len(),
        .0.reason
    )]
    StageFailed(Box<PartialFailure>),
}

/// Errors from rendering tool options into an argument vector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    #[error("Tool '{tool}' has no option named '{option}'")]
    Unknown { tool: String, option: String },

    #[error("Option '{option}' of tool '{tool}' expects {expected}")]
    TypeMismatch {
        tool: String,
        option: String,
        expected: &'static str,
    },

    #[error("Tool '{tool}' requires option '{option}'")]
    MissingRequired { tool: String, option: String },
}

/// Errors from looking up tools and operations in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("Tool '{tool}' has no operation '{operation}'")]
    UnknownOperation { tool: String, operation: String },

    #[error("Operation '{tool} {operation}' does not accept {kind} targets")]
    UnsupportedTarget {
        tool: String,
        operation: String,
        kind: &'static str,
    },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

/// Errors reported by a container execution service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Image not found: {image}")]
    ImageNotFound { image: String },

    #[error("Failed to pull {image}: {message}")]
    PullFailed { image: String, message: String },

    #[error("Unknown container handle: {id}")]
    UnknownHandle { id: String },

    #[error("Path {path} is outside the container scratch area")]
    OutsideScratch { path: String },

    #[error("Container command could not be started: {message}")]
    Spawn { message: String },

    #[error("Container I/O failed: {message}")]
    Io { message: String },
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io {
            message: err.to_string(),
        }
    }
}

pub type Result<T, E = ToolshipError> = std::result::Result<T, E>;
