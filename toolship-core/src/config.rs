//! Configuration for toolship.
//!
//! Layered with figment: built-in defaults, then the user config file,
//! then `.toolship/config.toml` in the workspace, then `TOOLSHIP_*`
//! environment variables, then explicit overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runtime::PullPolicy;
use crate::target::WORKSPACE_PATH;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolshipConfig {
    /// Container CLI used by the Docker runtime.
    pub docker_binary: String,
    /// In-container path where local targets are mounted.
    pub workspace_mount: String,
    pub execution: ExecutionConfig,
    /// Per-tool overrides, keyed by catalog name.
    pub tools: BTreeMap<String, ToolOverride>,
    pub cost: CostConfig,
    pub server: ServerConfig,
}

impl Default for ToolshipConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".into(),
            workspace_mount: WORKSPACE_PATH.into(),
            execution: ExecutionConfig::default(),
            tools: BTreeMap::new(),
            cost: CostConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl ToolshipConfig {
    /// Reject values no component could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.docker_binary.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "docker_binary must not be empty".into(),
            });
        }
        if !self.workspace_mount.starts_with('/') {
            return Err(ConfigError::Invalid {
                message: format!(
                    "workspace_mount must be an absolute container path, got '{}'",
                    self.workspace_mount
                ),
            });
        }
        if self.execution.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                message: "execution.max_concurrency must be at least 1".into(),
            });
        }
        for (name, tool) in &self.tools {
            if tool.image.as_deref().is_some_and(|i| i.trim().is_empty()) {
                return Err(ConfigError::Invalid {
                    message: format!("tools.{name}.image must not be empty"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-invocation deadline; 0 disables it.
    pub timeout_secs: u64,
    /// Upper bound on concurrently running containers during fan-out.
    pub max_concurrency: usize,
    pub pull_policy: PullPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            max_concurrency: 4,
            pull_policy: PullPolicy::Missing,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Image, binary and environment overrides for one catalog tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOverride {
    pub image: Option<String>,
    pub binary: Option<String>,
    /// Passed to the container as secrets (masked in plans and logs).
    pub env: BTreeMap<String, String>,
}

/// Public OpenInfraQuote pricing catalog.
pub const DEFAULT_PRICESHEET_URL: &str = "https://oiq.terrateam.io/prices.csv.gz";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Where the pricing catalog is downloaded from. A `.gz` catalog is
    /// decompressed after download.
    pub pricesheet_url: Option<String>,
    pub default_regions: Vec<String>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            pricesheet_url: Some(DEFAULT_PRICESHEET_URL.into()),
            default_regions: vec!["us-east-1".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8087".into(),
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "toolship", "toolship")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".toolship").join("config.toml")
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ToolshipConfig>,
) -> Result<ToolshipConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ToolshipConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TOOLSHIP_EXECUTION__TIMEOUT_SECS, TOOLSHIP_TOOLS__CHECKOV__IMAGE, ...
    figment = figment.merge(Env::prefixed("TOOLSHIP_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: ToolshipConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    user_config_path().is_some_and(|p| p.exists())
        || workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
