//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, CostAction, IacAction, TargetArgs};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use toolship_core::operations::{cost, iac};
use toolship_core::target::RepoCredentials;
use toolship_core::{
    ExecutionResult, PipelineOutcome, Target, ToolOptions, Toolship, ToolshipConfig,
    ToolshipError,
};
use tracing::warn;

/// How the process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// A tool ran and reported failure, or produced no output.
    ToolFailure,
    /// Toolship could not run the tool at all.
    Infrastructure,
}

impl Status {
    pub fn for_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<ToolshipError>() {
            Some(e) if e.is_tool_failure() => Status::ToolFailure,
            _ => Status::Infrastructure,
        }
    }
}

impl From<Status> for ExitCode {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => ExitCode::SUCCESS,
            Status::ToolFailure => ExitCode::from(1),
            Status::Infrastructure => ExitCode::from(2),
        }
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<Status> {
    match command {
        Commands::Tools => handle_tools(workspace),
        Commands::Run {
            tool,
            operation,
            target,
            token_env,
            options,
            dry_run,
            json,
        } => {
            let target = target_from(target, token_env.as_deref())?;
            let options = ToolOptions::from_pairs(options.iter().map(String::as_str));
            let toolship = load_toolship(workspace)?;
            if dry_run {
                let plan = toolship.dry_run(&tool, &operation, &target, &options)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                } else {
                    print!("{plan}");
                }
                return Ok(Status::Success);
            }
            let cancel = cancel_on_ctrl_c();
            let result = toolship
                .run_tool(&tool, &operation, &target, &options, &cancel)
                .await?;
            report_result(&result, json)
        }
        Commands::Cost { action } => handle_cost(action, workspace).await,
        Commands::Iac { action } => handle_iac(action, workspace).await,
        Commands::Config { action } => handle_config(action, workspace),
        Commands::Serve { bind } => {
            let toolship = load_toolship(workspace)?;
            let bind = bind.unwrap_or_else(|| toolship.config().server.bind.clone());
            crate::serve::run(toolship, &bind, cancel_on_ctrl_c()).await?;
            Ok(Status::Success)
        }
    }
}

fn load_toolship(workspace: &Path) -> anyhow::Result<Toolship> {
    let config = toolship_core::load_config(Some(workspace), None)
        .context("Failed to load configuration")?;
    Ok(Toolship::with_docker(config))
}

/// Cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running containers");
            trigger.cancel();
        }
    });
    token
}

fn target_from(args: TargetArgs, token_env: Option<&str>) -> anyhow::Result<Target> {
    let target = match args {
        TargetArgs { dir: Some(path), .. } => Target::directory(path),
        TargetArgs { file: Some(path), .. } => Target::file(path),
        TargetArgs { image: Some(reference), .. } => Target::image(reference),
        TargetArgs { blob: Some(path), .. } => Target::blob(path),
        TargetArgs { repo: Some(url), .. } => {
            let credentials = match token_env {
                Some(var) => {
                    let token = std::env::var(var)
                        .with_context(|| format!("Environment variable {var} is not set"))?;
                    Some(RepoCredentials::token(token))
                }
                None => None,
            };
            Target::RemoteRepository { url, credentials }
        }
        _ => anyhow::bail!("A target is required: --dir, --file, --image, --repo or --blob"),
    };
    Ok(target)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_output(result: &ExecutionResult) {
    let text = result.output_text();
    if text.ends_with('\n') {
        print!("{text}");
    } else {
        println!("{text}");
    }
}

/// Print a single result; a failed classification becomes exit status 1.
fn report_result(result: &ExecutionResult, json: bool) -> anyhow::Result<Status> {
    if json {
        print_json(result)?;
    }
    if let Some(err) = result.failure() {
        eprintln!("{err}");
        return Ok(Status::ToolFailure);
    }
    if !json {
        print_output(result);
    }
    Ok(Status::Success)
}

/// Region from the command line, else the first configured default.
fn region_or_default(toolship: &Toolship, region: Option<String>) -> anyhow::Result<String> {
    region
        .or_else(|| toolship.config().cost.default_regions.first().cloned())
        .context("No region given and cost.default_regions is empty")
}

/// The given pricesheet, or the cached download of `cost.pricesheet_url`.
async fn pricesheet_or_cached(
    toolship: &Toolship,
    pricesheet: Option<PathBuf>,
    cancel: &CancellationToken,
) -> anyhow::Result<PathBuf> {
    if let Some(path) = pricesheet {
        return Ok(path);
    }
    let cache_dir = directories::ProjectDirs::from("dev", "toolship", "toolship")
        .map(|d| d.cache_dir().join("pricesheet"))
        .context("No cache directory available, pass --pricesheet")?;
    Ok(cost::ensure_pricesheet(toolship, &cache_dir, cancel).await?)
}

fn print_outcome(outcome: &PipelineOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(outcome)?;
    } else {
        print_output(&outcome.result);
    }
    Ok(())
}

async fn handle_cost(action: CostAction, workspace: &Path) -> anyhow::Result<Status> {
    let toolship = load_toolship(workspace)?;
    let cancel = cancel_on_ctrl_c();
    match action {
        CostAction::Estimate {
            plan,
            pricesheet,
            region,
            json,
        } => {
            let region = region_or_default(&toolship, region)?;
            let pricesheet = pricesheet_or_cached(&toolship, pricesheet, &cancel).await?;
            let outcome = cost::estimate(&toolship, &plan, &pricesheet, &region, &cancel).await?;
            print_outcome(&outcome, json)?;
            Ok(Status::Success)
        }
        CostAction::Module {
            dir,
            engine,
            pricesheet,
            region,
            json,
        } => {
            let region = region_or_default(&toolship, region)?;
            let pricesheet = pricesheet_or_cached(&toolship, pricesheet, &cancel).await?;
            let outcome = cost::estimate_module(
                &toolship,
                &Target::directory(dir),
                engine,
                &pricesheet,
                &region,
                &cancel,
            )
            .await?;
            print_outcome(&outcome, json)?;
            Ok(Status::Success)
        }
        CostAction::Compare {
            plan,
            pricesheet,
            regions,
        } => {
            let regions = if regions.is_empty() {
                toolship.config().cost.default_regions.clone()
            } else {
                regions
            };
            let pricesheet = pricesheet_or_cached(&toolship, pricesheet, &cancel).await?;
            let results =
                cost::compare_regions(&toolship, &plan, &pricesheet, &regions, &cancel).await?;
            print_json(&results)?;
            let status = if results.failures().any(|(_, e)| !e.is_tool_failure()) {
                Status::Infrastructure
            } else if results.failure_count() > 0 {
                Status::ToolFailure
            } else {
                Status::Success
            };
            Ok(status)
        }
        CostAction::DownloadPricesheet { dest } => {
            let path = cost::download_pricesheet(&toolship, &dest, &cancel).await?;
            println!("{}", path.display());
            Ok(Status::Success)
        }
    }
}

async fn handle_iac(action: IacAction, workspace: &Path) -> anyhow::Result<Status> {
    match action {
        IacAction::PlanScan {
            dir,
            engine,
            options,
            json,
        } => {
            let toolship = load_toolship(workspace)?;
            let options = ToolOptions::from_pairs(options.iter().map(String::as_str));
            let outcome = iac::plan_and_scan(
                &toolship,
                &Target::directory(dir),
                engine,
                &options,
                &cancel_on_ctrl_c(),
            )
            .await?;
            print_outcome(&outcome, json)?;
            Ok(Status::Success)
        }
    }
}

fn handle_tools(workspace: &Path) -> anyhow::Result<Status> {
    let toolship = load_toolship(workspace)?;
    for tool in toolship.catalog().tools() {
        println!("{:<16} {}  ({})", tool.name, tool.description, tool.image);
        for op in tool.operations.values() {
            let targets: Vec<&str> = op.targets.iter().map(|k| k.as_str()).collect();
            let targets = if targets.is_empty() {
                "pipeline only".to_string()
            } else {
                targets.join(", ")
            };
            println!(
                "  {:<20} {:<32} [{}] {}",
                op.name,
                op.exit_policy.as_str(),
                targets,
                op.description
            );
        }
    }
    Ok(Status::Success)
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<Status> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".toolship");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(Status::Success);
            }

            let toml_str = toml::to_string_pretty(&ToolshipConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!("Created default configuration at: {}", config_path.display());
            Ok(Status::Success)
        }
        ConfigAction::Show => {
            let config = toolship_core::load_config(Some(workspace), None)
                .context("Failed to load configuration")?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(Status::Success)
        }
    }
}
