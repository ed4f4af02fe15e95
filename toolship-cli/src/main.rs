//! Toolship CLI: run containerized security, compliance and IaC tools.
//!
//! Every subcommand resolves a target, builds an invocation plan and runs it
//! through the tolerant executor. `serve` exposes the same calls over HTTP.

mod commands;
mod serve;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use toolship_core::operations::iac::PlanEngine;

/// Toolship: one invocation model for containerized security tools
#[derive(Parser, Debug)]
#[command(name = "toolship", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (for `.toolship/config.toml`)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List the tool catalog
    Tools,
    /// Run one tool operation against a target
    Run {
        /// Catalog tool name (e.g. checkov, trivy)
        tool: String,
        /// Operation of the tool (e.g. scan, fs)
        operation: String,
        #[command(flatten)]
        target: TargetArgs,
        /// Environment variable holding a token for --repo
        #[arg(long, value_name = "VAR", requires = "repo")]
        token_env: Option<String>,
        /// Tool option as key=value; a bare key sets a switch
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
        /// Print the invocation plan instead of running it
        #[arg(long)]
        dry_run: bool,
        /// Print the full result envelope as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cost estimation with OpenInfraQuote
    Cost {
        #[command(subcommand)]
        action: CostAction,
    },
    /// Infrastructure-as-code pipelines
    Iac {
        #[command(subcommand)]
        action: IacAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Serve the catalog over HTTP
    Serve {
        /// Address to bind (defaults to server.bind)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Local directory
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Local file
    #[arg(long)]
    file: Option<PathBuf>,
    /// Container image reference
    #[arg(long)]
    image: Option<String>,
    /// Remote git repository URL
    #[arg(long)]
    repo: Option<String>,
    /// Local file mounted as an opaque blob
    #[arg(long)]
    blob: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum CostAction {
    /// Price a JSON infrastructure plan for one region
    Estimate {
        /// JSON plan (`terraform show -json`)
        plan: PathBuf,
        /// Pricing catalog (defaults to a cached download of cost.pricesheet_url)
        #[arg(long)]
        pricesheet: Option<PathBuf>,
        /// Region (defaults to the first of cost.default_regions)
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Plan a module, then match and price the plan
    Module {
        /// Module directory
        dir: PathBuf,
        /// Plan engine: terraform or tofu
        #[arg(long, default_value = "terraform")]
        engine: PlanEngine,
        #[arg(long)]
        pricesheet: Option<PathBuf>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Price a plan in several regions concurrently
    Compare {
        plan: PathBuf,
        #[arg(long)]
        pricesheet: Option<PathBuf>,
        /// Region to compare; repeatable (defaults to cost.default_regions)
        #[arg(long = "region")]
        regions: Vec<String>,
    },
    /// Download the pricing catalog from cost.pricesheet_url
    DownloadPricesheet {
        /// Host directory to write into
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },
}

#[derive(clap::Subcommand, Debug)]
enum IacAction {
    /// Plan a module, then scan the plan with checkov
    PlanScan {
        /// Module directory
        dir: PathBuf,
        /// Plan engine: terraform or tofu
        #[arg(long, default_value = "terraform")]
        engine: PlanEngine,
        /// checkov option as key=value
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default .toolship/config.toml in the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable logs on stderr; stdout carries tool output.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "toolship", "toolship")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "toolship.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    match commands::handle_command(cli.command, &workspace).await {
        Ok(status) => status.into(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            commands::Status::for_error(&e).into()
        }
    }
}
