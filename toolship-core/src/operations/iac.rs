//! Plan-then-scan for infrastructure code.
//!
//! A Terraform or OpenTofu module is planned in one container, the JSON plan
//! is handed to checkov as a file in a second container.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::Toolship;
use crate::error::ToolshipError;
use crate::options::ToolOptions;
use crate::pipeline::{Pipeline, PipelineOutcome, PipelineStage};
use crate::target::{MountPlan, Target};

/// Where the scanning stage finds the plan, under the pipeline input directory.
pub const PLAN_INPUT: &str = "/toolship/input/tfplan.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanEngine {
    #[default]
    Terraform,
    Tofu,
}

impl PlanEngine {
    /// Catalog name of the planning tool.
    pub fn tool(&self) -> &'static str {
        match self {
            PlanEngine::Terraform => "terraform",
            PlanEngine::Tofu => "tofu",
        }
    }
}

impl fmt::Display for PlanEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool())
    }
}

impl FromStr for PlanEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "terraform" => Ok(PlanEngine::Terraform),
            "tofu" | "opentofu" => Ok(PlanEngine::Tofu),
            other => Err(format!("unknown plan engine '{other}' (expected terraform or tofu)")),
        }
    }
}

/// Build the plan-and-scan pipeline for a module directory or repository.
///
/// `scan_options` go to checkov; `framework` defaults to `terraform_plan`.
pub fn plan_scan_pipeline(
    toolship: &Toolship,
    module: &Target,
    engine: PlanEngine,
    scan_options: &ToolOptions,
) -> Result<Pipeline, ToolshipError> {
    let planning = toolship.dry_run(engine.tool(), "plan", module, &ToolOptions::new())?;

    let mut options = scan_options.clone();
    if options.get("framework").is_none() {
        options.insert("framework", "terraform_plan");
    }
    let scanning = toolship.plan_with_mount(
        "checkov",
        "scan-file",
        &MountPlan::for_argument(PLAN_INPUT),
        &options,
    )?;

    Ok(Pipeline::new(
        format!("plan-scan:{engine}"),
        vec![
            PipelineStage::new("plan", planning),
            PipelineStage::new("scan", scanning).file_from_previous(PLAN_INPUT),
        ],
    )?)
}

/// Plan a module and scan the resulting plan.
pub async fn plan_and_scan(
    toolship: &Toolship,
    module: &Target,
    engine: PlanEngine,
    scan_options: &ToolOptions,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome, ToolshipError> {
    let pipeline = plan_scan_pipeline(toolship, module, engine, scan_options)?;
    Ok(pipeline.run(toolship.executor(), cancel).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolshipConfig;
    use crate::error::PipelineError;
    use crate::plan::PlanStep;
    use crate::policy::ExitClassification;
    use crate::runtime::scripted::{Response, ScriptedRuntime};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    const PLAN_JSON: &str = r#"{"format_version":"1.2","resource_changes":[]}"#;

    fn module() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.tf"), "resource \"null_resource\" \"x\" {}").unwrap();
        dir
    }

    #[test]
    fn test_engine_parsing() {
        assert_eq!("tofu".parse::<PlanEngine>().unwrap(), PlanEngine::Tofu);
        assert_eq!("OpenTofu".parse::<PlanEngine>().unwrap(), PlanEngine::Tofu);
        assert_eq!("terraform".parse::<PlanEngine>().unwrap(), PlanEngine::Terraform);
        assert!("pulumi".parse::<PlanEngine>().is_err());
    }

    #[test]
    fn test_pipeline_shape() {
        let dir = module();
        let ts = Toolship::new(Arc::new(ScriptedRuntime::new()), ToolshipConfig::default());
        let pipeline = plan_scan_pipeline(
            &ts,
            &Target::directory(dir.path()),
            PlanEngine::Tofu,
            &ToolOptions::new(),
        )
        .unwrap();

        let plan = &pipeline.stages()[0].plan;
        let setups: Vec<_> = plan
            .steps()
            .iter()
            .filter_map(|s| match s {
                PlanStep::Setup { argv } => Some(argv[1].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(setups, vec!["init", "plan"]);
        assert_eq!(plan.command(), ["tofu", "show", "-json", "-no-color", "tfplan"]);

        assert_eq!(
            pipeline.stages()[1].plan.command(),
            [
                "checkov",
                "--output",
                "json",
                "--framework",
                "terraform_plan",
                "--file",
                PLAN_INPUT
            ]
        );
    }

    #[tokio::test]
    async fn test_plan_is_scanned_as_file() {
        let dir = module();
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(
                    "hashicorp/terraform:latest",
                    &["terraform", "show"],
                    Response::stdout(PLAN_JSON),
                )
                .on(
                    "bridgecrew/checkov:latest",
                    &["checkov"],
                    Response::cat(PLAN_INPUT).with_exit_code(1),
                ),
        );
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let outcome = plan_and_scan(
            &ts,
            &Target::directory(dir.path()),
            PlanEngine::Terraform,
            &ToolOptions::new().set("compact", true),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // checkov saw exactly the plan terraform printed.
        assert_eq!(outcome.result.stdout, PLAN_JSON.as_bytes());
        assert_eq!(outcome.result.classification, ExitClassification::FindingsTolerated);
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(runtime.stopped_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_init_stops_pipeline() {
        let dir = module();
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(
                    "hashicorp/terraform:latest",
                    &["terraform", "init"],
                    Response::exit(1, "", "Error: Failed to query available provider packages"),
                )
                .on("bridgecrew/checkov:latest", &["checkov"], Response::stdout("{}")),
        );
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let err = plan_and_scan(
            &ts,
            &Target::directory(dir.path()),
            PlanEngine::Terraform,
            &ToolOptions::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            ToolshipError::Pipeline(PipelineError::StageFailed(failure)) => {
                assert_eq!(failure.stage, "plan");
                assert!(failure.reason.to_string().contains("provider packages"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runtime.started(), vec!["hashicorp/terraform:latest".to_string()]);
    }
}
