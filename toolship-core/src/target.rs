//! Execution target resolution.
//!
//! Turns a logical [`Target`] into a [`MountPlan`]: the host-to-container
//! bindings, preparatory commands and the argument a tool should be pointed
//! at. Local paths are checked here, before any container is started.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::plan::EnvBindings;

/// Default in-container location for mounted local targets.
pub const WORKSPACE_PATH: &str = "/workspace";

/// Default in-container location for mounted blobs.
pub const BLOB_PATH: &str = "/blob";

/// Where remote repositories are cloned inside the container. Lives in the
/// runtime scratch area so every command of the handle sees the clone.
pub const REPO_CLONE_PATH: &str = "/toolship/repo";

/// The thing a tool is pointed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    LocalDirectory {
        path: PathBuf,
    },
    LocalFile {
        path: PathBuf,
    },
    ContainerImage {
        reference: String,
    },
    RemoteRepository {
        url: String,
        #[serde(default)]
        credentials: Option<RepoCredentials>,
    },
    Blob {
        path: PathBuf,
    },
}

impl Target {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Target::LocalDirectory { path: path.into() }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Target::LocalFile { path: path.into() }
    }

    pub fn image(reference: impl Into<String>) -> Self {
        Target::ContainerImage {
            reference: reference.into(),
        }
    }

    pub fn repository(url: impl Into<String>) -> Self {
        Target::RemoteRepository {
            url: url.into(),
            credentials: None,
        }
    }

    pub fn blob(path: impl Into<PathBuf>) -> Self {
        Target::Blob { path: path.into() }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Target::LocalDirectory { .. } => TargetKind::LocalDirectory,
            Target::LocalFile { .. } => TargetKind::LocalFile,
            Target::ContainerImage { .. } => TargetKind::ContainerImage,
            Target::RemoteRepository { .. } => TargetKind::RemoteRepository,
            Target::Blob { .. } => TargetKind::Blob,
        }
    }
}

/// Discriminant of [`Target`], used by the catalog to declare what an
/// operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    LocalDirectory,
    LocalFile,
    ContainerImage,
    RemoteRepository,
    Blob,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::LocalDirectory => "directory",
            TargetKind::LocalFile => "file",
            TargetKind::ContainerImage => "image",
            TargetKind::RemoteRepository => "repository",
            TargetKind::Blob => "blob",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials for cloning a private repository.
///
/// The token is handed to the container through the environment and is
/// never rendered in logs, plans or serialized output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCredentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub token: String,
}

impl RepoCredentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            username: None,
            token: token.into(),
        }
    }
}

impl fmt::Debug for RepoCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCredentials")
            .field("username", &self.username)
            .field("token", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountKind {
    File,
    Directory,
}

/// One host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub kind: MountKind,
    pub read_only: bool,
}

/// A command that materializes the target, with environment only it sees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrepareCommand {
    pub argv: Vec<String>,
    #[serde(skip_serializing_if = "EnvBindings::is_empty")]
    pub env: EnvBindings,
}

impl PrepareCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: EnvBindings::new(),
        }
    }
}

/// How a target is materialized inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountPlan {
    pub mounts: Vec<Mount>,
    pub env: EnvBindings,
    pub workdir: Option<String>,
    /// Commands that materialize the target inside the container
    /// (e.g. a clone), run before the tool.
    pub prepare: Vec<PrepareCommand>,
    /// Argument that points the tool at the target, if it takes one.
    pub target_arg: Option<String>,
}

impl MountPlan {
    /// A plan with nothing mounted that hands `arg` to the tool.
    pub fn for_argument(arg: impl Into<String>) -> Self {
        Self {
            target_arg: Some(arg.into()),
            ..Self::default()
        }
    }

    /// Add another file mount next to the existing ones. Returns the
    /// in-container path of the new file.
    pub fn add_file(&mut self, host_path: &Path, root: &str) -> Result<String, ExecError> {
        let host_path = existing_path(host_path)?;
        if !host_path.is_file() {
            return Err(ExecError::InvalidTarget {
                path: host_path,
                reason: "expected a file".into(),
            });
        }
        let container_path = join_container(root, &file_name(&host_path)?);
        if self.mounts.iter().any(|m| m.container_path == container_path) {
            return Err(ExecError::InvalidTarget {
                path: host_path,
                reason: format!("{container_path} is already mounted"),
            });
        }
        self.mounts.push(Mount {
            host_path,
            container_path: container_path.clone(),
            kind: MountKind::File,
            read_only: true,
        });
        Ok(container_path)
    }
}

/// Resolve a target against the default workspace path.
pub fn resolve(target: &Target) -> Result<MountPlan, ExecError> {
    resolve_at(target, WORKSPACE_PATH)
}

/// Resolve a target, mounting local paths under `root`.
pub fn resolve_at(target: &Target, root: &str) -> Result<MountPlan, ExecError> {
    match target {
        Target::LocalDirectory { path } => {
            let host_path = existing_path(path)?;
            if !host_path.is_dir() {
                return Err(ExecError::InvalidTarget {
                    path: host_path,
                    reason: "expected a directory".into(),
                });
            }
            Ok(MountPlan {
                mounts: vec![Mount {
                    host_path,
                    container_path: root.to_string(),
                    kind: MountKind::Directory,
                    read_only: false,
                }],
                workdir: Some(root.to_string()),
                target_arg: Some(".".into()),
                ..MountPlan::default()
            })
        }
        Target::LocalFile { path } => {
            let mut plan = MountPlan {
                workdir: Some(root.to_string()),
                ..MountPlan::default()
            };
            let container_path = plan.add_file(path, root)?;
            plan.target_arg = container_path
                .rsplit('/')
                .next()
                .map(str::to_string);
            Ok(plan)
        }
        Target::Blob { path } => {
            let mut plan = MountPlan::default();
            let container_path = plan.add_file(path, BLOB_PATH)?;
            plan.target_arg = Some(container_path);
            Ok(plan)
        }
        Target::ContainerImage { reference } => {
            if reference.trim().is_empty() {
                return Err(ExecError::InvalidTarget {
                    path: PathBuf::from(reference),
                    reason: "image reference is empty".into(),
                });
            }
            Ok(MountPlan::for_argument(reference.clone()))
        }
        Target::RemoteRepository { url, credentials } => {
            resolve_repository(url, credentials.as_ref())
        }
    }
}

fn resolve_repository(
    url: &str,
    credentials: Option<&RepoCredentials>,
) -> Result<MountPlan, ExecError> {
    const SCHEMES: [&str; 4] = ["https://", "http://", "ssh://", "git@"];
    if !SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(ExecError::InvalidTarget {
            path: PathBuf::from(url),
            reason: "repository URL must start with https://, http://, ssh:// or git@".into(),
        });
    }
    let mut clone = PrepareCommand::new(["git"]);
    if let Some(creds) = credentials {
        clone.env.insert_secret("GIT_TOKEN", creds.token.clone());
        clone.env.insert(
            "GIT_USERNAME",
            creds
                .username
                .clone()
                .unwrap_or_else(|| "x-access-token".into()),
        );
        // The helper runs through git's shell, so the token is expanded
        // inside the container and never appears in an argument vector.
        clone.argv.push("-c".into());
        clone.argv.push(
            "credential.helper=!f() { echo username=$GIT_USERNAME; echo password=$GIT_TOKEN; }; f"
                .into(),
        );
    }
    clone.argv.extend(
        ["clone", "--depth", "1", url, REPO_CLONE_PATH]
            .into_iter()
            .map(str::to_string),
    );

    Ok(MountPlan {
        workdir: Some(REPO_CLONE_PATH.into()),
        prepare: vec![clone],
        target_arg: Some(".".into()),
        ..MountPlan::default()
    })
}

fn existing_path(path: &Path) -> Result<PathBuf, ExecError> {
    std::fs::canonicalize(path).map_err(|_| ExecError::TargetNotFound {
        path: path.to_path_buf(),
    })
}

fn file_name(path: &Path) -> Result<String, ExecError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ExecError::InvalidTarget {
            path: path.to_path_buf(),
            reason: "path has no file name".into(),
        })
}

fn join_container(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), name)
}
