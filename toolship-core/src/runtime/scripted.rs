//! Deterministic in-memory runtime.
//!
//! Commands are answered from registered [`Response`]s keyed by image and
//! argument prefix. Every call is recorded so tests can assert on what ran,
//! in which order and with which input.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerHandle, ContainerRuntime, ExecOutput, scratch_relative};
use crate::error::RuntimeError;
use crate::plan::EnvBindings;
use crate::target::Mount;

/// Matches every image.
pub const ANY_IMAGE: &str = "*";

#[derive(Debug, Clone)]
enum Reply {
    Output(ExecOutput),
    /// Stdout is the bytes received on stdin.
    EchoStdin,
    /// Stdout is the contents of a file in the handle's filesystem.
    Cat(String),
    Error(RuntimeError),
}

/// What the runtime answers for a matching command.
#[derive(Debug, Clone)]
pub struct Response {
    reply: Reply,
    exit_code: i32,
    writes: Vec<(String, Vec<u8>)>,
}

impl Response {
    fn new(reply: Reply, exit_code: i32) -> Self {
        Self {
            reply,
            exit_code,
            writes: Vec::new(),
        }
    }

    /// Exit 0 with the given stdout.
    pub fn stdout(stdout: impl Into<Vec<u8>>) -> Self {
        Self::exit(0, stdout, Vec::new())
    }

    pub fn exit(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self::new(
            Reply::Output(ExecOutput {
                exit_code,
                stdout: Some(stdout.into()),
                stderr: Some(stderr.into()),
            }),
            exit_code,
        )
    }

    /// A run whose stdout could not be captured.
    pub fn lost_stdout(exit_code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self::new(
            Reply::Output(ExecOutput {
                exit_code,
                stdout: None,
                stderr: Some(stderr.into()),
            }),
            exit_code,
        )
    }

    pub fn echo_stdin() -> Self {
        Self::new(Reply::EchoStdin, 0)
    }

    pub fn cat(container_path: impl Into<String>) -> Self {
        Self::new(Reply::Cat(container_path.into()), 0)
    }

    pub fn error(err: RuntimeError) -> Self {
        Self::new(Reply::Error(err), 0)
    }

    /// Exit code used by echo and cat replies.
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Also leave a file behind in the handle's filesystem.
    pub fn writing(
        mut self,
        container_path: impl Into<String>,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        self.writes.push((container_path.into(), contents.into()));
        self
    }
}

struct Rule {
    image: String,
    prefix: Vec<String>,
    response: Response,
}

/// One `exec` as the runtime saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub handle: String,
    pub image: String,
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub mounts: Vec<Mount>,
}

#[derive(Default)]
struct HandleState {
    image: String,
    mounts: BTreeMap<String, Mount>,
    env: BTreeMap<String, String>,
    workdir: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    handles: HashMap<String, HandleState>,
    calls: Vec<RecordedCall>,
    started: Vec<String>,
    stopped: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedRuntime {
    rules: Vec<Rule>,
    missing: HashSet<String>,
    delay: Option<Duration>,
    state: Mutex<State>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands on `image` whose argv starts with `prefix`. The
    /// longest matching prefix wins; among equals the latest rule wins.
    pub fn on(mut self, image: &str, prefix: &[&str], response: Response) -> Self {
        self.rules.push(Rule {
            image: image.to_string(),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            response,
        });
        self
    }

    /// Pulling `image` fails with `ImageNotFound`.
    pub fn missing_image(mut self, image: &str) -> Self {
        self.missing.insert(image.to_string());
        self
    }

    /// Every `exec` takes this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Number of `exec` calls against handles on `image`.
    pub fn exec_count(&self, image: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.image == image)
            .count()
    }

    /// Images started, in order.
    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    pub fn stopped_count(&self) -> usize {
        self.state().stopped.len()
    }

    /// Handles started and not yet stopped.
    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    fn respond(&self, image: &str, argv: &[String]) -> Response {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                (r.image == image || r.image == ANY_IMAGE) && argv.starts_with(&r.prefix)
            })
            .max_by_key(|(i, r)| (r.prefix.len(), *i))
            .map(|(_, r)| r.response.clone())
            .unwrap_or_else(|| Response::stdout(Vec::new()))
    }

    fn with_handle<T>(
        &self,
        handle: &ContainerHandle,
        f: impl FnOnce(&mut HandleState) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state();
        let entry = state
            .handles
            .get_mut(&handle.id)
            .ok_or_else(|| RuntimeError::UnknownHandle {
                id: handle.id.clone(),
            })?;
        f(entry)
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn pull_and_start(&self, image: &str) -> Result<ContainerHandle, RuntimeError> {
        if self.missing.contains(image) {
            return Err(RuntimeError::ImageNotFound {
                image: image.to_string(),
            });
        }
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("scripted-{}", state.next_id);
        state.handles.insert(
            id.clone(),
            HandleState {
                image: image.to_string(),
                ..HandleState::default()
            },
        );
        state.started.push(image.to_string());
        Ok(ContainerHandle {
            id,
            image: image.to_string(),
        })
    }

    async fn mount(&self, handle: &ContainerHandle, mount: &Mount) -> Result<(), RuntimeError> {
        self.with_handle(handle, |h| {
            h.mounts.insert(mount.container_path.clone(), mount.clone());
            Ok(())
        })
    }

    async fn set_env(
        &self,
        handle: &ContainerHandle,
        key: &str,
        value: &str,
    ) -> Result<(), RuntimeError> {
        self.with_handle(handle, |h| {
            h.env.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn set_workdir(&self, handle: &ContainerHandle, path: &str) -> Result<(), RuntimeError> {
        self.with_handle(handle, |h| {
            h.workdir = Some(path.to_string());
            Ok(())
        })
    }

    async fn exec_with_env(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        env: &EnvBindings,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let (image, call) = self.with_handle(handle, |h| {
            let mut call_env = h.env.clone();
            call_env.extend(env.iter().map(|(k, v)| (k.to_string(), v.expose().to_string())));
            let call = RecordedCall {
                handle: handle.id.clone(),
                image: h.image.clone(),
                argv: argv.to_vec(),
                stdin: stdin.map(<[u8]>::to_vec),
                env: call_env,
                workdir: h.workdir.clone(),
                mounts: h.mounts.values().cloned().collect(),
            };
            Ok((h.image.clone(), call))
        })?;
        self.state().calls.push(call);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.respond(&image, argv);
        self.with_handle(handle, |h| {
            for (path, contents) in &response.writes {
                h.files.insert(path.clone(), contents.clone());
            }
            let stdout = match response.reply {
                Reply::Output(output) => return Ok(output),
                Reply::Error(err) => return Err(err),
                Reply::EchoStdin => stdin.map(<[u8]>::to_vec).unwrap_or_default(),
                Reply::Cat(path) => h.files.get(&path).cloned().ok_or_else(|| {
                    RuntimeError::Io {
                        message: format!("{path}: no such file"),
                    }
                })?,
            };
            Ok(ExecOutput {
                exit_code: response.exit_code,
                stdout: Some(stdout),
                stderr: Some(Vec::new()),
            })
        })
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        contents: &[u8],
    ) -> Result<(), RuntimeError> {
        scratch_relative(container_path)?;
        self.with_handle(handle, |h| {
            h.files.insert(container_path.to_string(), contents.to_vec());
            Ok(())
        })
    }

    async fn read_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        self.with_handle(handle, |h| {
            h.files
                .get(container_path)
                .cloned()
                .ok_or_else(|| RuntimeError::Io {
                    message: format!("{container_path}: no such file"),
                })
        })
    }

    async fn export_directory(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), RuntimeError> {
        let prefix = format!("{}/", container_path.trim_end_matches('/'));
        let files: Vec<(String, Vec<u8>)> = self.with_handle(handle, |h| {
            Ok(h.files
                .iter()
                .filter_map(|(path, bytes)| {
                    path.strip_prefix(&prefix)
                        .map(|rel| (rel.to_string(), bytes.clone()))
                })
                .collect())
        })?;
        if files.is_empty() {
            return Err(RuntimeError::Io {
                message: format!("{container_path}: no such directory"),
            });
        }
        for (rel, bytes) in files {
            let dest = host_path.join(rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, bytes).await?;
        }
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.handles.remove(&handle.id).is_some() {
            state.stopped.push(handle.id.clone());
        }
        Ok(())
    }
}
