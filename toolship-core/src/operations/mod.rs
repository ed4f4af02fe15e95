//! End-to-end operations.
//!
//! [`Toolship`] ties the components together: catalog lookup, option
//! rendering, target resolution, plan building and tolerant execution. The
//! submodules compose several tools into single logical operations.

pub mod cost;
pub mod iac;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::ToolCatalog;
use crate::config::ToolshipConfig;
use crate::error::ToolshipError;
use crate::executor::{Execute, ExecutionResult, StageIo, TolerantExecutor};
use crate::options::{ToolOptions, render};
use crate::plan::{EnvBindings, InvocationPlan, build};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::target::{MountPlan, Target, resolve_at};

pub struct Toolship {
    catalog: ToolCatalog,
    executor: TolerantExecutor,
    config: ToolshipConfig,
}

impl Toolship {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ToolshipConfig) -> Self {
        let mut catalog = ToolCatalog::builtin();
        catalog.apply_overrides(&config.tools);
        let mut executor = TolerantExecutor::new(runtime);
        if let Some(timeout) = config.execution.timeout() {
            executor = executor.with_timeout(timeout);
        }
        Self {
            catalog,
            executor,
            config,
        }
    }

    /// Backed by the Docker CLI named in the configuration.
    pub fn with_docker(config: ToolshipConfig) -> Self {
        let runtime =
            DockerRuntime::new(config.docker_binary.clone(), config.execution.pull_policy);
        Self::new(Arc::new(runtime), config)
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &ToolshipConfig {
        &self.config
    }

    pub fn executor(&self) -> &TolerantExecutor {
        &self.executor
    }

    /// Build the invocation plan `run_tool` would execute, without touching
    /// the container runtime. Local targets are still checked.
    pub fn dry_run(
        &self,
        tool: &str,
        operation: &str,
        target: &Target,
        options: &ToolOptions,
    ) -> Result<InvocationPlan, ToolshipError> {
        self.catalog.resolve(tool, operation, target.kind())?;
        let mount = resolve_at(target, &self.config.workspace_mount)?;
        let plan = self.plan_with_mount(tool, operation, &mount, options)?;
        debug!(tool, operation, target = %target.kind(), "Built invocation plan");
        Ok(plan)
    }

    /// Run one tool operation against a target.
    ///
    /// A run the tool itself classified as failed comes back as an
    /// `ExecutionResult` with `succeeded() == false`.
    pub async fn run_tool(
        &self,
        tool: &str,
        operation: &str,
        target: &Target,
        options: &ToolOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ToolshipError> {
        let plan = self.dry_run(tool, operation, target, options)?;
        Ok(self.executor.execute(&plan, StageIo::default(), cancel).await?)
    }

    /// Plan an operation over an already resolved mount plan.
    pub(crate) fn plan_with_mount(
        &self,
        tool: &str,
        operation: &str,
        mount: &MountPlan,
        options: &ToolOptions,
    ) -> Result<InvocationPlan, ToolshipError> {
        let (def, op) = self.catalog.operation(tool, operation)?;
        let args = render(&def.name, &op.grammar, options, mount.target_arg.as_deref())?;
        Ok(build(&def.spec(op), mount, &args, &self.tool_env(&def.name)))
    }

    /// Configured environment for a tool, treated as secret.
    fn tool_env(&self, tool: &str) -> EnvBindings {
        let mut env = EnvBindings::new();
        if let Some(ov) = self.config.tools.get(tool) {
            for (key, value) in &ov.env {
                env.insert_secret(key.clone(), value.clone());
            }
        }
        env
    }
}
