//! Docker CLI backed runtime.
//!
//! A handle is not a long-lived container. Each `exec` is a fresh
//! `docker run --rm` with the handle's mounts, environment and working
//! directory, so tool images never need a shell or a keep-alive command.
//! The handle's scratch area is a host temporary directory bind-mounted at
//! [`SCRATCH_PATH`], which is what lets preparatory steps, input files and
//! exports share state across those runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ContainerHandle, ContainerRuntime, ExecOutput, SCRATCH_PATH, scratch_relative};
use crate::error::RuntimeError;
use crate::plan::EnvBindings;
use crate::target::{Mount, MountKind};

/// When images are pulled before use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull only if the image is not present locally.
    #[default]
    Missing,
    Always,
    /// Never pull; a missing image is an error.
    Never,
}

/// Exit statuses the Docker CLI reserves for its own failures. Tools may
/// exit 126 or 127 themselves, so those only count when Docker said so.
const DOCKER_RUN_FAILED: i32 = 125;
const COMMAND_NOT_EXECUTABLE: i32 = 126;
const COMMAND_NOT_FOUND: i32 = 127;

struct HandleState {
    image: String,
    mounts: BTreeMap<String, Mount>,
    env: BTreeMap<String, String>,
    workdir: Option<String>,
    scratch: TempDir,
    runs: u32,
    active: Option<String>,
}

/// Invocation snapshot taken under the lock so no lock is held while the
/// process runs.
struct RunSpec {
    name: String,
    image: String,
    mounts: Vec<Mount>,
    env: BTreeMap<String, String>,
    workdir: Option<String>,
    scratch: PathBuf,
}

pub struct DockerRuntime {
    binary: String,
    pull_policy: PullPolicy,
    handles: Mutex<HashMap<String, HandleState>>,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>, pull_policy: PullPolicy) -> Self {
        Self {
            binary: binary.into(),
            pull_policy,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let status = self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| RuntimeError::Spawn {
                message: format!("{}: {e}", self.binary),
            })?;
        Ok(status.success())
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling image");
        let output = self
            .command()
            .args(["pull", "--quiet", image])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                message: format!("{}: {e}", self.binary),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lower = message.to_lowercase();
        if ["not found", "manifest unknown", "pull access denied"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            Err(RuntimeError::ImageNotFound {
                image: image.to_string(),
            })
        } else {
            Err(RuntimeError::PullFailed {
                image: image.to_string(),
                message,
            })
        }
    }

    async fn snapshot(&self, handle: &ContainerHandle) -> Result<RunSpec, RuntimeError> {
        let mut handles = self.handles.lock().await;
        let state = handles.get_mut(&handle.id).ok_or_else(|| unknown(handle))?;
        state.runs += 1;
        let name = format!("{}-{}", handle.id, state.runs);
        state.active = Some(name.clone());
        Ok(RunSpec {
            name,
            image: state.image.clone(),
            mounts: state.mounts.values().cloned().collect(),
            env: state.env.clone(),
            workdir: state.workdir.clone(),
            scratch: state.scratch.path().to_path_buf(),
        })
    }

    async fn finish_run(&self, handle: &ContainerHandle, name: &str) {
        let mut handles = self.handles.lock().await;
        if let Some(state) = handles.get_mut(&handle.id)
            && state.active.as_deref() == Some(name)
        {
            state.active = None;
        }
    }

    /// Host location backing a container path: the scratch area first,
    /// then any mounted directory.
    async fn host_path(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
    ) -> Result<PathBuf, RuntimeError> {
        let handles = self.handles.lock().await;
        let state = handles.get(&handle.id).ok_or_else(|| unknown(handle))?;
        if let Ok(rel) = scratch_relative(container_path) {
            return Ok(state.scratch.path().join(rel));
        }
        for mount in state.mounts.values() {
            match mount.kind {
                MountKind::File if mount.container_path == container_path => {
                    return Ok(mount.host_path.clone());
                }
                MountKind::Directory => {
                    if let Some(rest) = container_path.strip_prefix(&mount.container_path)
                        && (rest.is_empty() || rest.starts_with('/'))
                        && !rest.split('/').any(|part| part == "..")
                    {
                        return Ok(mount.host_path.join(rest.trim_start_matches('/')));
                    }
                }
                MountKind::File => {}
            }
        }
        Err(RuntimeError::OutsideScratch {
            path: container_path.to_string(),
        })
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker", PullPolicy::default())
    }
}

fn unknown(handle: &ContainerHandle) -> RuntimeError {
    RuntimeError::UnknownHandle {
        id: handle.id.clone(),
    }
}

/// Whether `docker run` failed before the tool itself got to run.
fn launch_failed(exit_code: i32, stdout: &[u8], stderr: &[u8]) -> bool {
    match exit_code {
        DOCKER_RUN_FAILED => true,
        COMMAND_NOT_EXECUTABLE | COMMAND_NOT_FOUND if stdout.is_empty() => {
            let stderr = String::from_utf8_lossy(stderr);
            let stderr = stderr.trim_start();
            stderr.starts_with("docker:") || stderr.contains("OCI runtime")
        }
        _ => false,
    }
}

fn volume_arg(host: &Path, container: &str, read_only: bool) -> String {
    let mut arg = format!("{}:{}", host.display(), container);
    if read_only {
        arg.push_str(":ro");
    }
    arg
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn pull_and_start(&self, image: &str) -> Result<ContainerHandle, RuntimeError> {
        match self.pull_policy {
            PullPolicy::Always => self.pull(image).await?,
            PullPolicy::Missing => {
                if !self.image_present(image).await? {
                    self.pull(image).await?;
                }
            }
            PullPolicy::Never => {
                if !self.image_present(image).await? {
                    return Err(RuntimeError::ImageNotFound {
                        image: image.to_string(),
                    });
                }
            }
        }

        let scratch = tempfile::Builder::new().prefix("toolship-").tempdir()?;
        // Tool images often run as an unprivileged user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(scratch.path(), std::fs::Permissions::from_mode(0o777))?;
        }

        let id = format!("toolship-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        debug!(id = %id, image, scratch = %scratch.path().display(), "Opened container handle");
        self.handles.lock().await.insert(
            id.clone(),
            HandleState {
                image: image.to_string(),
                mounts: BTreeMap::new(),
                env: BTreeMap::new(),
                workdir: None,
                scratch,
                runs: 0,
                active: None,
            },
        );
        Ok(ContainerHandle {
            id,
            image: image.to_string(),
        })
    }

    async fn mount(&self, handle: &ContainerHandle, mount: &Mount) -> Result<(), RuntimeError> {
        let mut handles = self.handles.lock().await;
        let state = handles.get_mut(&handle.id).ok_or_else(|| unknown(handle))?;
        state
            .mounts
            .insert(mount.container_path.clone(), mount.clone());
        Ok(())
    }

    async fn set_env(
        &self,
        handle: &ContainerHandle,
        key: &str,
        value: &str,
    ) -> Result<(), RuntimeError> {
        let mut handles = self.handles.lock().await;
        let state = handles.get_mut(&handle.id).ok_or_else(|| unknown(handle))?;
        state.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_workdir(&self, handle: &ContainerHandle, path: &str) -> Result<(), RuntimeError> {
        let mut handles = self.handles.lock().await;
        let state = handles.get_mut(&handle.id).ok_or_else(|| unknown(handle))?;
        state.workdir = Some(path.to_string());
        Ok(())
    }

    async fn exec_with_env(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        env: &EnvBindings,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::Spawn {
                message: "empty command".into(),
            });
        };
        let mut spec = self.snapshot(handle).await?;
        spec.env
            .extend(env.iter().map(|(k, v)| (k.to_string(), v.expose().to_string())));

        let mut cmd = self.command();
        cmd.args(["run", "--rm", "--name", spec.name.as_str()]);
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.arg("-v")
            .arg(volume_arg(&spec.scratch, SCRATCH_PATH, false));
        for mount in &spec.mounts {
            cmd.arg("-v")
                .arg(volume_arg(&mount.host_path, &mount.container_path, mount.read_only));
        }
        // Values travel through the CLI's own environment so they never
        // show up in the process table.
        for (key, value) in &spec.env {
            cmd.arg("-e").arg(key);
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.workdir {
            cmd.arg("-w").arg(dir);
        }
        cmd.arg("--entrypoint").arg(program);
        cmd.arg(&spec.image);
        cmd.args(args);

        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        debug!(container = %spec.name, image = %spec.image, program, "docker run");
        let mut child = cmd.spawn().map_err(|e| RuntimeError::Spawn {
            message: format!("{}: {e}", self.binary),
        })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let bytes = bytes.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&bytes).await {
                    warn!(error = %e, "Failed to write container stdin");
                }
            });
        }

        let output = child.wait_with_output().await;
        self.finish_run(handle, &spec.name).await;
        let output = output?;

        let Some(exit_code) = output.status.code() else {
            return Err(RuntimeError::Spawn {
                message: format!("container {} was terminated by a signal", spec.name),
            });
        };
        if launch_failed(exit_code, &output.stdout, &output.stderr) {
            return Err(RuntimeError::Spawn {
                message: format!(
                    "`{program}` could not be run in {} (exit {exit_code}): {}",
                    spec.image,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(ExecOutput {
            exit_code,
            stdout: Some(output.stdout),
            stderr: Some(output.stderr),
        })
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        contents: &[u8],
    ) -> Result<(), RuntimeError> {
        scratch_relative(container_path)?;
        let path = self.host_path(handle, container_path).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    async fn read_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        let path = self.host_path(handle, container_path).await?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn export_directory(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), RuntimeError> {
        let source = self.host_path(handle, container_path).await?;
        let dest = host_path.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| RuntimeError::Io {
                message: e.to_string(),
            })??;
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let Some(state) = self.handles.lock().await.remove(&handle.id) else {
            return Ok(());
        };
        if let Some(name) = state.active {
            debug!(container = %name, "Removing running container");
            let output = self
                .command()
                .args(["rm", "--force", name.as_str()])
                .stdin(Stdio::null())
                .output()
                .await?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() && !stderr.contains("No such container") {
                return Err(RuntimeError::Io {
                    message: format!("docker rm {name}: {}", stderr.trim()),
                });
            }
        }
        Ok(())
    }
}

fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_file() {
        std::fs::create_dir_all(dest)?;
        if let Some(name) = source.file_name() {
            std::fs::copy(source, dest.join(name))?;
        }
        return Ok(());
    }
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
