//! Cost estimation with OpenInfraQuote.
//!
//! `estimate` is a two-stage pipeline: `oiq match` pairs the resources of a
//! JSON infrastructure plan with a pricing catalog, then `oiq price` reads
//! that match output on stdin and prices it for one region. Both stages are
//! strict, so an empty match never reaches the pricing stage.
//!
//! `estimate_module` puts a Terraform or OpenTofu plan stage in front, so a
//! module directory goes from plan to price in one pipeline.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Toolship;
use super::iac::{PLAN_INPUT, PlanEngine};
use crate::aggregate::{FanOutResult, aggregate};
use crate::error::{ConfigError, ToolshipError};
use crate::executor::{Execute, ExecutionResult, StageIo};
use crate::options::ToolOptions;
use crate::pipeline::{Pipeline, PipelineOutcome, PipelineStage};
use crate::target::{MountPlan, Target};

const OIQ: &str = "openinfraquote";

/// Container directory the pricing catalog is downloaded into.
pub const PRICESHEET_DIR: &str = "/toolship/pricesheet";

/// Mount the plan and the pricesheet side by side.
fn match_mount(
    toolship: &Toolship,
    plan_json: &Path,
    pricesheet: &Path,
) -> Result<(MountPlan, String), ToolshipError> {
    let root = toolship.config().workspace_mount.as_str();
    let mut mount = MountPlan {
        workdir: Some(root.to_string()),
        ..MountPlan::default()
    };
    let plan_path = mount.add_file(plan_json, root)?;
    let sheet_path = mount.add_file(pricesheet, root)?;
    mount.target_arg = Some(plan_path);
    Ok((mount, sheet_path))
}

/// The match and price stages. Price reads match output on stdin.
fn pricing_stages(
    toolship: &Toolship,
    mount: &MountPlan,
    sheet_path: &str,
    region: &str,
) -> Result<(PipelineStage, PipelineStage), ToolshipError> {
    let matching = toolship.plan_with_mount(
        OIQ,
        "match",
        mount,
        &ToolOptions::new().set("pricesheet", sheet_path),
    )?;
    let pricing = toolship.plan_with_mount(
        OIQ,
        "price",
        &MountPlan::default(),
        &ToolOptions::new().set("region", region),
    )?;
    Ok((
        PipelineStage::new("match", matching),
        PipelineStage::new("price", pricing).stdin_from_previous(),
    ))
}

fn pipeline_for(
    toolship: &Toolship,
    mount: &MountPlan,
    sheet_path: &str,
    region: &str,
) -> Result<Pipeline, ToolshipError> {
    let (matching, pricing) = pricing_stages(toolship, mount, sheet_path, region)?;
    Ok(Pipeline::new(
        format!("cost-estimate:{region}"),
        vec![matching, pricing],
    )?)
}

/// Build the estimate pipeline without running it.
pub fn estimate_pipeline(
    toolship: &Toolship,
    plan_json: &Path,
    pricesheet: &Path,
    region: &str,
) -> Result<Pipeline, ToolshipError> {
    let (mount, sheet_path) = match_mount(toolship, plan_json, pricesheet)?;
    pipeline_for(toolship, &mount, &sheet_path, region)
}

/// Price a JSON infrastructure plan for one region.
pub async fn estimate(
    toolship: &Toolship,
    plan_json: &Path,
    pricesheet: &Path,
    region: &str,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome, ToolshipError> {
    let pipeline = estimate_pipeline(toolship, plan_json, pricesheet, region)?;
    Ok(pipeline.run(toolship.executor(), cancel).await?)
}

/// Build the plan, match and price pipeline for a module.
///
/// The plan stage's JSON lands at [`PLAN_INPUT`] in the match stage's
/// container; only the pricesheet is mounted from the host.
pub fn module_estimate_pipeline(
    toolship: &Toolship,
    module: &Target,
    engine: PlanEngine,
    pricesheet: &Path,
    region: &str,
) -> Result<Pipeline, ToolshipError> {
    let planning = toolship.dry_run(engine.tool(), "plan", module, &ToolOptions::new())?;

    let root = toolship.config().workspace_mount.as_str();
    let mut mount = MountPlan {
        workdir: Some(root.to_string()),
        ..MountPlan::for_argument(PLAN_INPUT)
    };
    let sheet_path = mount.add_file(pricesheet, root)?;
    let (matching, pricing) = pricing_stages(toolship, &mount, &sheet_path, region)?;

    Ok(Pipeline::new(
        format!("module-cost:{engine}:{region}"),
        vec![
            PipelineStage::new("plan", planning),
            matching.file_from_previous(PLAN_INPUT),
            pricing,
        ],
    )?)
}

/// Plan a module and price the plan for one region.
pub async fn estimate_module(
    toolship: &Toolship,
    module: &Target,
    engine: PlanEngine,
    pricesheet: &Path,
    region: &str,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome, ToolshipError> {
    let pipeline = module_estimate_pipeline(toolship, module, engine, pricesheet, region)?;
    Ok(pipeline.run(toolship.executor(), cancel).await?)
}

/// Run [`estimate`] once per region, concurrently up to the configured
/// limit. Local files are checked once, before anything starts.
pub async fn compare_regions(
    toolship: &Toolship,
    plan_json: &Path,
    pricesheet: &Path,
    regions: &[String],
    cancel: &CancellationToken,
) -> Result<FanOutResult<String, ExecutionResult, ToolshipError>, ToolshipError> {
    let (mount, sheet_path) = match_mount(toolship, plan_json, pricesheet)?;
    let (mount, sheet_path) = (&mount, sheet_path.as_str());

    let results = aggregate(
        regions.iter().cloned(),
        toolship.config().execution.max_concurrency,
        |region| async move {
            let pipeline = pipeline_for(toolship, mount, sheet_path, &region)?;
            let outcome = pipeline.run(toolship.executor(), cancel).await?;
            Ok::<_, ToolshipError>(outcome.result)
        },
    )
    .await;

    info!(
        regions = results.len(),
        failed = results.failure_count(),
        "Region comparison finished"
    );
    Ok(results)
}

fn pricesheet_url(toolship: &Toolship) -> Result<String, ToolshipError> {
    toolship
        .config()
        .cost
        .pricesheet_url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            ConfigError::MissingField {
                field: "cost.pricesheet_url".into(),
            }
            .into()
        })
}

/// Last path segment of `url`, query and fragment removed.
fn remote_file_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or("prices.csv")
        .to_string()
}

/// Name of the usable pricesheet once any `.gz` suffix is dropped.
fn pricesheet_file_name(url: &str) -> String {
    let name = remote_file_name(url);
    match name.strip_suffix(".gz") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}

/// Download the pricing catalog from `cost.pricesheet_url` into `dest`.
/// Gzip catalogs are decompressed in a second container. Returns the path
/// of the usable pricesheet.
pub async fn download_pricesheet(
    toolship: &Toolship,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, ToolshipError> {
    let url = pricesheet_url(toolship)?;
    let file_name = remote_file_name(&url);
    tokio::fs::create_dir_all(dest).await?;

    let plan = toolship
        .plan_with_mount(
            "curl",
            "download",
            &MountPlan::default(),
            &ToolOptions::new()
                .set("output", format!("{PRICESHEET_DIR}/{file_name}"))
                .set("url", vec![url.clone()]),
        )?
        .with_export(PRICESHEET_DIR, dest);

    let result = toolship
        .executor()
        .execute(&plan, StageIo::default(), cancel)
        .await?;
    if let Some(err) = result.failure() {
        return Err(err.into());
    }
    let downloaded = dest.join(&file_name);

    let usable = pricesheet_file_name(&url);
    if usable == file_name {
        info!(path = %downloaded.display(), "Pricesheet downloaded");
        return Ok(downloaded);
    }

    let result = toolship
        .run_tool(
            "gunzip",
            "decompress",
            &Target::file(&downloaded),
            &ToolOptions::new(),
            cancel,
        )
        .await?;
    if let Some(err) = result.failure() {
        return Err(err.into());
    }
    let path = dest.join(usable);
    tokio::fs::write(&path, result.stage_output()).await?;
    info!(path = %path.display(), "Pricesheet downloaded and decompressed");
    Ok(path)
}

/// Path of a cached pricesheet in `cache_dir`, downloading it first when
/// it is not there yet.
pub async fn ensure_pricesheet(
    toolship: &Toolship,
    cache_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, ToolshipError> {
    let url = pricesheet_url(toolship)?;
    let cached = cache_dir.join(pricesheet_file_name(&url));
    if tokio::fs::try_exists(&cached).await? {
        info!(path = %cached.display(), "Using cached pricesheet");
        return Ok(cached);
    }
    download_pricesheet(toolship, cache_dir, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PRICESHEET_URL, ToolshipConfig};
    use crate::error::PipelineError;
    use crate::runtime::scripted::{Response, ScriptedRuntime};
    use std::sync::Arc;
    use tempfile::TempDir;

    const IMAGE: &str = "ghcr.io/initech-consulting/openinfraquote:latest";

    fn inputs() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let plan = dir.path().join("tfplan.json");
        let sheet = dir.path().join("prices.csv");
        std::fs::write(&plan, "{\"resource_changes\":[]}").unwrap();
        std::fs::write(&sheet, "service,price\n").unwrap();
        (dir, plan, sheet)
    }

    #[test]
    fn test_pipeline_shape() {
        let (_dir, plan, sheet) = inputs();
        let ts = Toolship::new(Arc::new(ScriptedRuntime::new()), ToolshipConfig::default());
        let pipeline = estimate_pipeline(&ts, &plan, &sheet, "eu-west-1").unwrap();
        let stages = pipeline.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(
            stages[0].plan.command(),
            [
                "oiq",
                "match",
                "--pricesheet",
                "/workspace/prices.csv",
                "/workspace/tfplan.json"
            ]
        );
        assert_eq!(
            stages[1].plan.command(),
            ["oiq", "price", "--format", "json", "--region", "eu-west-1"]
        );
    }

    #[tokio::test]
    async fn test_estimate_feeds_match_output_to_price() {
        let (_dir, plan, sheet) = inputs();
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(IMAGE, &["oiq", "match"], Response::stdout("{\"matched\":3}"))
                .on(IMAGE, &["oiq", "price"], Response::echo_stdin()),
        );
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let outcome = estimate(&ts, &plan, &sheet, "us-east-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.result.stdout, b"{\"matched\":3}");
        let price_call = &runtime.calls()[1];
        assert_eq!(price_call.stdin.as_deref(), Some(&b"{\"matched\":3}"[..]));
    }

    #[tokio::test]
    async fn test_failed_match_skips_pricing() {
        let (_dir, plan, sheet) = inputs();
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(IMAGE, &["oiq", "match"], Response::exit(2, "", "no matching pricesheet"))
                .on(IMAGE, &["oiq", "price"], Response::echo_stdin()),
        );
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let err = estimate(&ts, &plan, &sheet, "us-east-1", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ToolshipError::Pipeline(PipelineError::StageFailed(failure)) => {
                assert_eq!(failure.failed_stage_index, 0);
                assert!(failure.reason.to_string().contains("no matching pricesheet"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runtime.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_compare_regions_keeps_partial_results() {
        let (_dir, plan, sheet) = inputs();
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(IMAGE, &["oiq", "match"], Response::stdout("{}"))
                .on(IMAGE, &["oiq", "price"], Response::stdout("{\"total\":1}"))
                .on(
                    IMAGE,
                    &["oiq", "price", "--format", "json", "--region", "mars-1"],
                    Response::exit(1, "", "unknown region"),
                ),
        );
        let ts = Toolship::new(runtime, ToolshipConfig::default());
        let regions = vec!["us-east-1".to_string(), "mars-1".to_string(), "eu-west-1".to_string()];
        let results = compare_regions(&ts, &plan, &sheet, &regions, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results.success_count(), 2);
        assert!(results.get(&"mars-1".to_string()).unwrap().is_err());
    }

    #[tokio::test]
    async fn test_compare_regions_checks_files_first() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let err = compare_regions(
            &ts,
            Path::new("/missing/plan.json"),
            Path::new("/missing/prices.csv"),
            &["us-east-1".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolshipError::Exec(_)));
        assert!(runtime.started().is_empty());
    }

    #[tokio::test]
    async fn test_download_requires_url() {
        let mut config = ToolshipConfig::default();
        config.cost.pricesheet_url = None;
        let ts = Toolship::new(Arc::new(ScriptedRuntime::new()), config);
        let dest = TempDir::new().unwrap();
        let err = download_pricesheet(&ts, dest.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolshipError::Config(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_pricesheet_names_from_url() {
        let url = "https://prices.example.com/v1/prices.csv.gz?sig=1";
        assert_eq!(remote_file_name(url), "prices.csv.gz");
        assert_eq!(pricesheet_file_name(url), "prices.csv");
        assert_eq!(pricesheet_file_name("https://example.com/sheet.csv"), "sheet.csv");
        assert_eq!(remote_file_name("https://example.com/"), "prices.csv");
    }

    #[tokio::test]
    async fn test_download_exports_scratch_directory() {
        let mut config = ToolshipConfig::default();
        config.cost.pricesheet_url = Some("https://prices.example.com/v1/prices.csv".into());
        let runtime = ScriptedRuntime::new().on(
            "curlimages/curl:latest",
            &["curl"],
            Response::stdout("").writing("/toolship/pricesheet/prices.csv", "sku,price\n"),
        );
        let ts = Toolship::new(Arc::new(runtime), config);
        let dest = TempDir::new().unwrap();

        let path = download_pricesheet(&ts, dest.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, dest.path().join("prices.csv"));
        assert_eq!(std::fs::read(&path).unwrap(), b"sku,price\n");
    }

    #[tokio::test]
    async fn test_default_download_is_decompressed() {
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(
                    "curlimages/curl:latest",
                    &["curl"],
                    Response::stdout("").writing("/toolship/pricesheet/prices.csv.gz", "gz-bytes"),
                )
                .on("busybox:stable", &["gunzip"], Response::stdout("sku,price\n")),
        );
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let dest = TempDir::new().unwrap();

        let path = download_pricesheet(&ts, dest.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, dest.path().join("prices.csv"));
        assert_eq!(std::fs::read(&path).unwrap(), b"sku,price\n");
        assert!(dest.path().join("prices.csv.gz").exists());

        let calls = runtime.calls();
        assert_eq!(calls[0].argv.last().map(String::as_str), Some(DEFAULT_PRICESHEET_URL));
        assert_eq!(calls[1].argv, ["gunzip", "-c", "prices.csv.gz"]);
    }

    #[tokio::test]
    async fn test_cached_pricesheet_skips_download() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let cache = TempDir::new().unwrap();
        std::fs::write(cache.path().join("prices.csv"), "sku,price\n").unwrap();

        let path = ensure_pricesheet(&ts, cache.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, cache.path().join("prices.csv"));
        assert!(runtime.started().is_empty());
    }

    fn module_with_sheet() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.tf"), "resource \"aws_instance\" \"web\" {}")
            .unwrap();
        let sheet = dir.path().join("prices.csv");
        std::fs::write(&sheet, "service,price\n").unwrap();
        (dir, sheet)
    }

    #[test]
    fn test_module_pipeline_has_three_stages() {
        let (dir, sheet) = module_with_sheet();
        let ts = Toolship::new(Arc::new(ScriptedRuntime::new()), ToolshipConfig::default());
        let pipeline = module_estimate_pipeline(
            &ts,
            &Target::directory(dir.path()),
            PlanEngine::Tofu,
            &sheet,
            "us-east-1",
        )
        .unwrap();

        assert_eq!(pipeline.name(), "module-cost:tofu:us-east-1");
        let stages = pipeline.stages();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].plan.tool().name, "tofu");
        assert_eq!(
            stages[1].plan.command(),
            [
                "oiq",
                "match",
                "--pricesheet",
                "/workspace/prices.csv",
                PLAN_INPUT
            ]
        );
        assert_eq!(stages[2].plan.command()[..2], ["oiq", "price"]);
    }

    #[tokio::test]
    async fn test_module_plan_flows_to_match_then_price() {
        let (dir, sheet) = module_with_sheet();
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(
                    "hashicorp/terraform:latest",
                    &["terraform", "show"],
                    Response::stdout("{\"resource_changes\":[1]}"),
                )
                .on(IMAGE, &["oiq", "match"], Response::cat(PLAN_INPUT))
                .on(IMAGE, &["oiq", "price"], Response::echo_stdin()),
        );
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let outcome = estimate_module(
            &ts,
            &Target::directory(dir.path()),
            PlanEngine::Terraform,
            &sheet,
            "eu-west-1",
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // The plan JSON was materialized for match, and match output piped to price.
        assert_eq!(outcome.result.stdout, b"{\"resource_changes\":[1]}");
        assert_eq!(outcome.stages.len(), 3);
        let price = runtime.calls().into_iter().last().unwrap();
        assert_eq!(price.stdin.as_deref(), Some(&b"{\"resource_changes\":[1]}"[..]));
    }

    #[tokio::test]
    async fn test_module_plan_failure_skips_pricing() {
        let (dir, sheet) = module_with_sheet();
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .on(
                    "hashicorp/terraform:latest",
                    &["terraform", "init"],
                    Response::exit(1, "", "Error: Failed to query available provider packages"),
                )
                .on(IMAGE, &["oiq"], Response::stdout("{}")),
        );
        let ts = Toolship::new(runtime.clone(), ToolshipConfig::default());
        let err = estimate_module(
            &ts,
            &Target::directory(dir.path()),
            PlanEngine::Terraform,
            &sheet,
            "eu-west-1",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            ToolshipError::Pipeline(PipelineError::StageFailed(failure)) => {
                assert_eq!(failure.failed_stage_index, 0);
                assert_eq!(failure.tool, "terraform");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runtime.exec_count(IMAGE), 0);
    }
}
