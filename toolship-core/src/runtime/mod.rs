//! Container execution service.
//!
//! Everything toolship needs from a container engine goes through
//! [`ContainerRuntime`]. A [`ContainerHandle`] names one logical container:
//! its mounts, environment and working directory apply to every command
//! executed against it, and it owns a scratch area at [`SCRATCH_PATH`]
//! whose contents survive between those commands.

pub mod docker;
pub mod scripted;

use std::path::{Component, Path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::error::RuntimeError;
use crate::plan::EnvBindings;
use crate::policy::RawOutput;
use crate::target::Mount;

pub use docker::{DockerRuntime, PullPolicy};
pub use scripted::{Response, ScriptedRuntime};

/// In-container directory shared by all commands of a handle.
pub const SCRATCH_PATH: &str = "/toolship";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub image: String,
}

/// Result of one command. Streams are captured independently and are
/// available whatever the exit code; `None` means capture failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl ExecOutput {
    pub fn raw(&self) -> RawOutput<'_> {
        RawOutput {
            exit_code: self.exit_code,
            stdout: self.stdout.as_deref(),
            stderr: self.stderr.as_deref(),
        }
    }

    pub fn stderr_text(&self) -> String {
        self.stderr
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).trim().to_string())
            .unwrap_or_default()
    }
}

/// Contract of the external container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Make `image` available and open a handle on it.
    async fn pull_and_start(&self, image: &str) -> Result<ContainerHandle, RuntimeError>;

    /// Bind a host path into the container. Mounting the same container
    /// path twice replaces the earlier binding.
    async fn mount(&self, handle: &ContainerHandle, mount: &Mount) -> Result<(), RuntimeError>;

    async fn set_env(
        &self,
        handle: &ContainerHandle,
        key: &str,
        value: &str,
    ) -> Result<(), RuntimeError>;

    async fn set_workdir(&self, handle: &ContainerHandle, path: &str) -> Result<(), RuntimeError>;

    /// Run `argv` to completion. A non-zero exit is not an error.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        self.exec_with_env(handle, argv, &EnvBindings::new(), stdin)
            .await
    }

    /// Like [`exec`](Self::exec), with `env` added on top of the handle's
    /// environment for this command only.
    async fn exec_with_env(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        env: &EnvBindings,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Create a file under [`SCRATCH_PATH`].
    async fn write_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        contents: &[u8],
    ) -> Result<(), RuntimeError>;

    async fn read_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
    ) -> Result<Vec<u8>, RuntimeError>;

    /// Copy a container directory to the host.
    async fn export_directory(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), RuntimeError>;

    /// Terminate anything still running for the handle and release it.
    /// Stopping an unknown or already stopped handle succeeds.
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}

/// Path of `container_path` relative to the scratch area.
pub fn scratch_relative(container_path: &str) -> Result<&str, RuntimeError> {
    let outside = || RuntimeError::OutsideScratch {
        path: container_path.to_string(),
    };
    let rest = container_path
        .strip_prefix(SCRATCH_PATH)
        .ok_or_else(outside)?;
    let rest = match rest {
        "" => "",
        r if r.starts_with('/') => r.trim_start_matches('/'),
        _ => return Err(outside()),
    };
    let escapes = Path::new(rest)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(outside());
    }
    Ok(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_relative() {
        assert_eq!(scratch_relative("/toolship/input/plan.json").unwrap(), "input/plan.json");
        assert_eq!(scratch_relative("/toolship").unwrap(), "");
        assert!(scratch_relative("/toolshipx/a").is_err());
        assert!(scratch_relative("/workspace/a").is_err());
        assert!(scratch_relative("/toolship/../etc/passwd").is_err());
    }

    #[test]
    fn test_exec_output_raw_keeps_lost_streams() {
        let out = ExecOutput {
            exit_code: 3,
            stdout: None,
            stderr: Some(b" boom \n".to_vec()),
        };
        let raw = out.raw();
        assert_eq!(raw.exit_code, 3);
        assert!(raw.stdout.is_none());
        assert_eq!(out.stderr_text(), "boom");
    }
}
