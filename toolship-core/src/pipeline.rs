//! Multi-stage pipelines.
//!
//! A [`Pipeline`] runs its stages strictly in order, each in its own
//! container. A stage may take the previous stage's output on stdin or as a
//! file. The first stage that does not succeed stops the pipeline and is
//! reported as a [`PartialFailure`].

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ExecError, PipelineError};
use crate::executor::{Execute, ExecutionResult, StageInput, StageIo};
use crate::plan::InvocationPlan;
use crate::policy::ExitClassification;

/// Directory where file inputs are materialized inside a stage's container.
pub const INPUT_DIR: &str = "/toolship/input";

/// How a stage receives the previous stage's output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputBinding {
    #[default]
    None,
    /// The previous output, byte for byte, on standard input.
    StdinFromPrevious,
    /// The previous output written to `container_path` before the command runs.
    FileFromPrevious { container_path: String },
}

/// What a stage hands on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputBinding {
    /// The stream selected by the exit classification.
    #[default]
    FullStdout,
    /// A file the command leaves behind.
    File { container_path: String },
}

#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub name: String,
    pub plan: InvocationPlan,
    pub input: InputBinding,
    pub output: OutputBinding,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>, plan: InvocationPlan) -> Self {
        Self {
            name: name.into(),
            plan,
            input: InputBinding::None,
            output: OutputBinding::FullStdout,
        }
    }

    pub fn stdin_from_previous(mut self) -> Self {
        self.input = InputBinding::StdinFromPrevious;
        self
    }

    pub fn file_from_previous(mut self, container_path: impl Into<String>) -> Self {
        self.input = InputBinding::FileFromPrevious {
            container_path: container_path.into(),
        };
        self
    }

    pub fn output_file(mut self, container_path: impl Into<String>) -> Self {
        self.output = OutputBinding::File {
            container_path: container_path.into(),
        };
        self
    }
}

/// Summary of a stage that ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub index: usize,
    pub name: String,
    pub tool: String,
    pub classification: ExitClassification,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub output_bytes: usize,
}

impl StageReport {
    fn new(index: usize, stage: &PipelineStage, result: &ExecutionResult) -> Self {
        Self {
            index,
            name: stage.name.clone(),
            tool: result.tool.clone(),
            classification: result.classification,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            output_bytes: result.stage_output().len(),
        }
    }
}

/// The final stage's result plus a report for every stage.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub result: ExecutionResult,
    pub stages: Vec<StageReport>,
}

/// A pipeline stopped at `failed_stage_index`.
#[derive(Debug, Clone)]
pub struct PartialFailure {
    pub completed_stages: Vec<StageReport>,
    pub failed_stage_index: usize,
    pub stage: String,
    pub tool: String,
    pub reason: ExecError,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    /// Validate and assemble a pipeline. The first stage has nothing to
    /// read from, so it may not declare an input binding.
    pub fn new(name: impl Into<String>, stages: Vec<PipelineStage>) -> Result<Self, PipelineError> {
        let Some(first) = stages.first() else {
            return Err(PipelineError::Empty);
        };
        if first.input != InputBinding::None {
            return Err(PipelineError::DanglingInput {
                index: 0,
                stage: first.name.clone(),
            });
        }
        Ok(Self {
            name: name.into(),
            stages,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Run every stage in order, stopping at the first that fails.
    pub async fn run(
        &self,
        executor: &dyn Execute,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut reports: Vec<StageReport> = Vec::with_capacity(self.stages.len());
        let mut previous: Option<Vec<u8>> = None;

        for (index, stage) in self.stages.iter().enumerate() {
            let input = match &stage.input {
                InputBinding::None => StageInput::None,
                InputBinding::StdinFromPrevious => {
                    StageInput::Stdin(previous.take().unwrap_or_default())
                }
                InputBinding::FileFromPrevious { container_path } => StageInput::File {
                    container_path: container_path.clone(),
                    contents: previous.take().unwrap_or_default(),
                },
            };
            let tool = stage.plan.tool().name.clone();
            info!(
                pipeline = %self.name,
                stage = %stage.name,
                index,
                tool = %tool,
                "Running pipeline stage"
            );

            let io = StageIo {
                input,
                output: stage.output.clone(),
            };
            let result = match executor.execute(&stage.plan, io, cancel).await {
                Ok(result) => result,
                Err(reason) => return Err(self.stopped(reports, index, stage, tool, reason)),
            };
            if let Some(reason) = result.failure() {
                return Err(self.stopped(reports, index, stage, tool, reason));
            }

            reports.push(StageReport::new(index, stage, &result));
            if index + 1 == self.stages.len() {
                info!(pipeline = %self.name, stages = reports.len(), "Pipeline finished");
                return Ok(PipelineOutcome {
                    result,
                    stages: reports,
                });
            }
            previous = Some(result.into_stage_output());
        }

        Err(PipelineError::Empty)
    }

    fn stopped(
        &self,
        completed_stages: Vec<StageReport>,
        index: usize,
        stage: &PipelineStage,
        tool: String,
        reason: ExecError,
    ) -> PipelineError {
        warn!(
            pipeline = %self.name,
            stage = %stage.name,
            index,
            tool = %tool,
            error = %reason,
            "Pipeline stopped"
        );
        PipelineError::StageFailed(Box::new(PartialFailure {
            completed_stages,
            failed_stage_index: index,
            stage: stage.name.clone(),
            tool,
            reason,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TolerantExecutor;
    use crate::plan::{ArgumentVector, EnvBindings, ToolSpec, build};
    use crate::policy::ExitPolicy;
    use crate::runtime::scripted::{Response, ScriptedRuntime};
    use crate::target::MountPlan;
    use std::sync::Arc;

    fn stage(name: &str, image: &str, args: &[&str]) -> PipelineStage {
        let tool = ToolSpec::new(name, image, name, ExitPolicy::Strict);
        let plan = build(
            &tool,
            &MountPlan::default(),
            &ArgumentVector::from_iter(args.iter().copied()),
            &EnvBindings::new(),
        );
        PipelineStage::new(name, plan)
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(matches!(Pipeline::new("p", vec![]), Err(PipelineError::Empty)));
    }

    #[test]
    fn test_first_stage_cannot_read_previous() {
        let err =
            Pipeline::new("p", vec![stage("a", "a:1", &[]).stdin_from_previous()]).unwrap_err();
        assert!(matches!(err, PipelineError::DanglingInput { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_stdin_binding_passes_bytes_verbatim() {
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on("a:1", &["a"], Response::stdout("line1\n\0binary\n"))
                .on("b:1", &["b"], Response::echo_stdin()),
        );
        let executor = TolerantExecutor::new(runtime.clone());
        let pipeline = Pipeline::new(
            "echo",
            vec![
                stage("a", "a:1", &[]),
                stage("b", "b:1", &[]).stdin_from_previous(),
            ],
        )
        .unwrap();

        let outcome = pipeline.run(&executor, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result.stdout, b"line1\n\0binary\n");
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(outcome.stages[1].index, 1);
        assert_eq!(runtime.started(), vec!["a:1".to_string(), "b:1".to_string()]);
    }

    #[tokio::test]
    async fn test_file_binding_materializes_previous_output() {
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on("a:1", &["a"], Response::stdout("{\"plan\":true}"))
                .on("b:1", &["b"], Response::cat("/toolship/input/plan.json")),
        );
        let executor = TolerantExecutor::new(runtime);
        let pipeline = Pipeline::new(
            "files",
            vec![
                stage("a", "a:1", &[]),
                stage("b", "b:1", &[]).file_from_previous("/toolship/input/plan.json"),
            ],
        )
        .unwrap();
        let outcome = pipeline.run(&executor, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result.stdout, b"{\"plan\":true}");
    }

    #[tokio::test]
    async fn test_fail_fast_names_failing_stage() {
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on("a:1", &["a"], Response::exit(2, "", "no matching pricesheet"))
                .on("b:1", &["b"], Response::echo_stdin()),
        );
        let executor = TolerantExecutor::new(runtime.clone());
        let pipeline = Pipeline::new(
            "cost",
            vec![
                stage("a", "a:1", &[]),
                stage("b", "b:1", &[]).stdin_from_previous(),
            ],
        )
        .unwrap();

        let err = pipeline.run(&executor, &CancellationToken::new()).await.unwrap_err();
        let PipelineError::StageFailed(failure) = err else {
            panic!("expected stage failure");
        };
        assert_eq!(failure.failed_stage_index, 0);
        assert_eq!(failure.tool, "a");
        assert!(failure.completed_stages.is_empty());
        assert!(failure.reason.to_string().contains("no matching pricesheet"));
        assert_eq!(runtime.exec_count("b:1"), 0);
    }

    #[tokio::test]
    async fn test_last_stage_failure_keeps_completed_reports() {
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on("a:1", &["a"], Response::stdout("ok"))
                .on("b:1", &["b"], Response::exit(1, "", "bad region")),
        );
        let executor = TolerantExecutor::new(runtime);
        let pipeline = Pipeline::new(
            "two",
            vec![
                stage("a", "a:1", &[]),
                stage("b", "b:1", &[]).stdin_from_previous(),
            ],
        )
        .unwrap();

        let err = pipeline.run(&executor, &CancellationToken::new()).await.unwrap_err();
        let PipelineError::StageFailed(failure) = err else {
            panic!("expected stage failure");
        };
        assert_eq!(failure.failed_stage_index, 1);
        assert_eq!(failure.completed_stages.len(), 1);
        assert_eq!(failure.completed_stages[0].output_bytes, 2);
    }
}
