//! Tolerant executor.
//!
//! Runs an [`InvocationPlan`] against a [`ContainerRuntime`] and classifies
//! the outcome with the tool's [`ExitPolicy`](crate::policy::ExitPolicy).
//! A scanner that exits non-zero because it found problems still yields an
//! [`ExecutionResult`]; only infrastructure trouble, deadlines and
//! cancellation come back as errors.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExecError, RuntimeError};
use crate::pipeline::OutputBinding;
use crate::plan::{InvocationPlan, PlanStep, shell_words};
use crate::policy::{ExitClassification, OutputStream, has_content};
use crate::runtime::{ContainerHandle, ContainerRuntime, ExecOutput};

/// What a stage is fed before its command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StageInput {
    #[default]
    None,
    /// Bytes handed to the command's standard input.
    Stdin(Vec<u8>),
    /// Bytes materialized as a file inside the container.
    File {
        container_path: String,
        contents: Vec<u8>,
    },
}

/// Input and output wiring for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageIo {
    pub input: StageInput,
    pub output: OutputBinding,
}

impl StageIo {
    pub fn stdin(bytes: Vec<u8>) -> Self {
        Self {
            input: StageInput::Stdin(bytes),
            ..Self::default()
        }
    }
}

/// Anything that can execute an invocation plan.
#[async_trait]
pub trait Execute: Send + Sync {
    async fn execute(
        &self,
        plan: &InvocationPlan,
        io: StageIo,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError>;
}

/// Outcome of one classified run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub tool: String,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub classification: ExitClassification,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Contents of the stage's output file, when bound to one.
    pub artifact: Option<Vec<u8>>,
    /// Setup command that failed, if the run stopped before the tool command.
    pub failed_setup: Option<String>,
}

impl ExecutionResult {
    /// Derived from the classification, never from the raw exit code.
    pub fn succeeded(&self) -> bool {
        self.classification.succeeded()
    }

    /// The stream the classification selected as the result.
    pub fn output(&self) -> &[u8] {
        match self.classification.output_stream() {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.output())
    }

    /// What the next pipeline stage receives.
    pub fn stage_output(&self) -> &[u8] {
        self.artifact.as_deref().unwrap_or_else(|| self.output())
    }

    pub fn into_stage_output(self) -> Vec<u8> {
        if let Some(artifact) = self.artifact {
            return artifact;
        }
        match self.classification.output_stream() {
            OutputStream::Stdout => self.stdout,
            OutputStream::Stderr => self.stderr,
        }
    }

    /// The error matching a failed classification.
    pub fn failure(&self) -> Option<ExecError> {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        match self.classification {
            ExitClassification::ToolReportedFailure => {
                let detail = if has_content(&self.stderr) {
                    stderr.clone()
                } else {
                    "no output received".to_string()
                };
                let message = match &self.failed_setup {
                    Some(step) => format!("setup step `{step}` failed: {detail}"),
                    None => detail,
                };
                Some(ExecError::ToolReportedFailure {
                    tool: self.tool.clone(),
                    exit_code: self.exit_code,
                    message,
                    stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
                    stderr,
                })
            }
            ExitClassification::EmptyOutput => Some(ExecError::EmptyOutput {
                tool: self.tool.clone(),
                exit_code: self.exit_code,
                stderr,
            }),
            _ => None,
        }
    }

    /// The result text, or the classification's error.
    pub fn into_output(self) -> Result<String, ExecError> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        Ok(String::from_utf8_lossy(&self.into_stage_output()).into_owned())
    }
}

impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ExecutionResult", 10)?;
        s.serialize_field("tool", &self.tool)?;
        s.serialize_field("succeeded", &self.succeeded())?;
        s.serialize_field("classification", &self.classification)?;
        s.serialize_field("exit_code", &self.exit_code)?;
        s.serialize_field("started_at", &self.started_at)?;
        s.serialize_field("duration_ms", &self.duration_ms)?;
        s.serialize_field("stdout", &String::from_utf8_lossy(&self.stdout))?;
        s.serialize_field("stderr", &String::from_utf8_lossy(&self.stderr))?;
        s.serialize_field(
            "artifact",
            &self.artifact.as_deref().map(String::from_utf8_lossy),
        )?;
        s.serialize_field("failed_setup", &self.failed_setup)?;
        s.end()
    }
}

/// The executor backed by a container runtime.
#[derive(Clone)]
pub struct TolerantExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Option<Duration>,
}

/// Stops a handle when dropped, unless [`StopGuard::stop`] got to it
/// first. An execution future dropped mid-run (client gone, outer
/// timeout) still releases its container.
struct StopGuard {
    runtime: Arc<dyn ContainerRuntime>,
    tool: String,
    handle: Option<ContainerHandle>,
}

impl StopGuard {
    async fn stop(mut self) {
        if let Some(handle) = &self.handle
            && let Err(e) = self.runtime.stop(handle).await
        {
            warn!(tool = %self.tool, error = %e, "Failed to stop container");
        }
        self.handle = None;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let tool = std::mem::take(&mut self.tool);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!(tool = %tool, handle = %handle.id, "Execution dropped, stopping container");
                rt.spawn(async move {
                    if let Err(e) = runtime.stop(&handle).await {
                        warn!(tool = %tool, error = %e, "Failed to stop abandoned container");
                    }
                });
            }
            Err(_) => {
                warn!(tool = %tool, handle = %handle.id, "No async runtime left to stop container");
            }
        }
    }
}

enum Driven {
    Finished {
        output: ExecOutput,
        handle: ContainerHandle,
    },
    SetupFailed {
        step: String,
        output: ExecOutput,
    },
}

impl TolerantExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            timeout: None,
        }
    }

    /// Deadline for each execution, container start included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Race `work` against cancellation and the deadline.
    async fn guarded<T>(
        &self,
        tool: &str,
        deadline: Option<tokio::time::Instant>,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T, ExecError>>,
    ) -> Result<T, ExecError> {
        let expired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Cancelled { tool: tool.to_string() }),
            _ = expired => Err(ExecError::Timeout {
                tool: tool.to_string(),
                timeout_ms: self.timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            }),
            result = work => result,
        }
    }

    async fn drive(
        &self,
        plan: &InvocationPlan,
        handle: &ContainerHandle,
        input: StageInput,
    ) -> Result<Driven, ExecError> {
        let tool = plan.tool();
        let start_err = |e: RuntimeError| ExecError::ContainerStart {
            tool: tool.name.clone(),
            image: tool.image.clone(),
            message: e.to_string(),
        };
        let runtime_err = |e: RuntimeError| ExecError::Runtime {
            tool: tool.name.clone(),
            message: e.to_string(),
        };

        let stdin = match input {
            StageInput::None => None,
            StageInput::Stdin(bytes) => Some(bytes),
            StageInput::File {
                container_path,
                contents,
            } => {
                debug!(
                    tool = %tool.name,
                    path = %container_path,
                    bytes = contents.len(),
                    "Materializing stage input"
                );
                self.runtime
                    .write_file(handle, &container_path, &contents)
                    .await
                    .map_err(runtime_err)?;
                None
            }
        };

        for step in plan.steps() {
            match step {
                PlanStep::Mount(mount) => {
                    debug!(
                        tool = %tool.name,
                        host = %mount.host_path.display(),
                        container = %mount.container_path,
                        "mount"
                    );
                    self.runtime.mount(handle, mount).await.map_err(start_err)?;
                }
                PlanStep::Env { key, value } => {
                    debug!(tool = %tool.name, key = %key, value = %value, "env");
                    self.runtime
                        .set_env(handle, key, value.expose())
                        .await
                        .map_err(start_err)?;
                }
                PlanStep::Workdir { path } => {
                    debug!(tool = %tool.name, path = %path, "workdir");
                    self.runtime
                        .set_workdir(handle, path)
                        .await
                        .map_err(start_err)?;
                }
                PlanStep::Prepare { argv, env } => {
                    debug!(tool = %tool.name, command = %shell_words(argv), "prepare");
                    let output = self
                        .runtime
                        .exec_with_env(handle, argv, env, None)
                        .await
                        .map_err(start_err)?;
                    if output.exit_code != 0 {
                        return Err(ExecError::ContainerStart {
                            tool: tool.name.clone(),
                            image: tool.image.clone(),
                            message: format!(
                                "preparatory step `{}` exited with {}: {}",
                                shell_words(argv),
                                output.exit_code,
                                output.stderr_text()
                            ),
                        });
                    }
                }
                PlanStep::Setup { argv } => {
                    debug!(tool = %tool.name, command = %shell_words(argv), "setup");
                    let output = self
                        .runtime
                        .exec(handle, argv, None)
                        .await
                        .map_err(runtime_err)?;
                    if output.exit_code != 0 {
                        return Ok(Driven::SetupFailed {
                            step: shell_words(argv),
                            output,
                        });
                    }
                }
                PlanStep::Exec { argv } => {
                    debug!(tool = %tool.name, command = %shell_words(argv), "exec");
                    let output = self
                        .runtime
                        .exec(handle, argv, stdin.as_deref())
                        .await
                        .map_err(runtime_err)?;
                    return Ok(Driven::Finished {
                        output,
                        handle: handle.clone(),
                    });
                }
            }
        }

        Err(ExecError::Runtime {
            tool: tool.name.clone(),
            message: "plan has no command".into(),
        })
    }

    /// Read the bound output file and copy exports once the run succeeded.
    async fn collect(
        &self,
        plan: &InvocationPlan,
        handle: &ContainerHandle,
        output: &OutputBinding,
    ) -> Result<Option<Vec<u8>>, ExecError> {
        let runtime_err = |e: RuntimeError| ExecError::Runtime {
            tool: plan.tool().name.clone(),
            message: e.to_string(),
        };
        let artifact = match output {
            OutputBinding::FullStdout => None,
            OutputBinding::File { container_path } => Some(
                self.runtime
                    .read_file(handle, container_path)
                    .await
                    .map_err(runtime_err)?,
            ),
        };
        for export in plan.exports() {
            debug!(
                tool = %plan.tool().name,
                from = %export.container_path,
                to = %export.host_path.display(),
                "export"
            );
            self.runtime
                .export_directory(handle, &export.container_path, &export.host_path)
                .await
                .map_err(runtime_err)?;
        }
        Ok(artifact)
    }
}

#[async_trait]
impl Execute for TolerantExecutor {
    async fn execute(
        &self,
        plan: &InvocationPlan,
        io: StageIo,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let tool = plan.tool();
        let started = Instant::now();
        let started_at = Utc::now();
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);

        info!(
            tool = %tool.name,
            image = %tool.image,
            runtime = self.runtime.name(),
            "Starting tool"
        );

        let handle = self
            .guarded(&tool.name, deadline, cancel, async {
                self.runtime
                    .pull_and_start(&tool.image)
                    .await
                    .map_err(|e| ExecError::ContainerStart {
                        tool: tool.name.clone(),
                        image: tool.image.clone(),
                        message: e.to_string(),
                    })
            })
            .await?;
        let guard = StopGuard {
            runtime: Arc::clone(&self.runtime),
            tool: tool.name.clone(),
            handle: Some(handle.clone()),
        };

        let output_binding = io.output;
        let outcome = self
            .guarded(&tool.name, deadline, cancel, async {
                let driven = self.drive(plan, &handle, io.input).await?;
                match driven {
                    Driven::Finished { output, handle } => {
                        let classification = tool.exit_policy.classify(&output.raw());
                        let artifact = if classification.succeeded() {
                            self.collect(plan, &handle, &output_binding).await?
                        } else {
                            None
                        };
                        Ok((output, classification, artifact, None))
                    }
                    Driven::SetupFailed { step, output } => Ok((
                        output,
                        ExitClassification::ToolReportedFailure,
                        None,
                        Some(step),
                    )),
                }
            })
            .await;

        guard.stop().await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let (output, classification, artifact, failed_setup) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                if e.is_interrupted() {
                    info!(
                        tool = %tool.name,
                        duration_ms,
                        reason = %e,
                        "Tool execution interrupted"
                    );
                } else {
                    warn!(tool = %tool.name, duration_ms, error = %e, "Tool execution aborted");
                }
                return Err(e);
            }
        };

        match classification {
            ExitClassification::FindingsTolerated => warn!(
                tool = %tool.name,
                exit_code = output.exit_code,
                "Non-zero exit tolerated, tool produced output"
            ),
            ExitClassification::StderrFallback => warn!(
                tool = %tool.name,
                exit_code = output.exit_code,
                "Using stderr as the tool's result"
            ),
            _ => {}
        }
        info!(
            tool = %tool.name,
            exit_code = output.exit_code,
            classification = %classification,
            duration_ms,
            "Tool finished"
        );

        Ok(ExecutionResult {
            tool: tool.name.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout.unwrap_or_default(),
            stderr: output.stderr.unwrap_or_default(),
            classification,
            started_at,
            duration_ms,
            artifact,
            failed_setup,
        })
    }
}
