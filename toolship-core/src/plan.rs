//! Container plan building.
//!
//! [`build`] assembles the ordered steps of one container lifecycle from a
//! tool, a resolved target and rendered arguments. The order is fixed:
//! mounts, environment, working directory, preparatory commands, tool
//! setup commands and finally the tool command itself.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

use serde::{Deserialize, Serialize, Serializer};

use crate::policy::ExitPolicy;
use crate::target::{Mount, MountKind, MountPlan};

/// Identifies one wrapped tool for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub image: String,
    /// Binary path or name inside the image.
    pub binary: String,
    pub exit_policy: ExitPolicy,
    /// Commands run with the tool binary before the main command, such as
    /// `init` for infrastructure planners. Each entry is the argument list
    /// after the binary. A failing setup command fails the invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<Vec<String>>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        binary: impl Into<String>,
        exit_policy: ExitPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            binary: binary.into(),
            exit_policy,
            setup: Vec::new(),
        }
    }

    pub fn with_setup<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.setup.push(args.into_iter().map(Into::into).collect());
        self
    }
}

/// Flat, ordered command-line arguments for a tool, excluding the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentVector(Vec<String>);

impl ArgumentVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.0.push(arg.into());
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl Deref for ArgumentVector {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for ArgumentVector {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

impl<S: Into<String>> FromIterator<S> for ArgumentVector {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl Extend<String> for ArgumentVector {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

/// An environment value. Secrets reach the container but are masked
/// everywhere else.
#[derive(Clone, PartialEq, Eq)]
pub enum EnvValue {
    Plain(String),
    Secret(String),
}

impl EnvValue {
    /// The real value, for handing to the runtime.
    pub fn expose(&self) -> &str {
        match self {
            EnvValue::Plain(v) | EnvValue::Secret(v) => v,
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, EnvValue::Secret(_))
    }
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::Plain(v) => f.write_str(v),
            EnvValue::Secret(_) => f.write_str("***"),
        }
    }
}

impl fmt::Debug for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string())
    }
}

impl Serialize for EnvValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Environment variables for a container, kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvBindings(BTreeMap<String, EnvValue>);

impl EnvBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), EnvValue::Plain(value.into()));
    }

    pub fn insert_secret(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), EnvValue::Secret(value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(EnvValue::expose)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries of `other` replace entries with the same name.
    pub fn merge(&mut self, other: &EnvBindings) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvBindings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (k, v) in iter {
            env.insert(k, v);
        }
        env
    }
}

/// One step of a container lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    Mount(Mount),
    Env { key: String, value: EnvValue },
    Workdir { path: String },
    /// Materializes the target (e.g. a clone). Failure means the
    /// container could not be prepared. `env` reaches this command only.
    Prepare {
        argv: Vec<String>,
        #[serde(skip_serializing_if = "EnvBindings::is_empty")]
        env: EnvBindings,
    },
    /// Tool setup command. Failure is reported by the tool.
    Setup { argv: Vec<String> },
    /// The tool command whose output is the result.
    Exec { argv: Vec<String> },
}

/// Container directory copied to the host after a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Export {
    pub container_path: String,
    pub host_path: PathBuf,
}

/// The ordered, immutable steps of one container lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationPlan {
    tool: ToolSpec,
    steps: Vec<PlanStep>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    exports: Vec<Export>,
}

impl InvocationPlan {
    pub fn tool(&self) -> &ToolSpec {
        &self.tool
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// The final command's argument vector, binary included.
    pub fn command(&self) -> &[String] {
        self.steps
            .iter()
            .rev()
            .find_map(|step| match step {
                PlanStep::Exec { argv } => Some(argv.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Request that `container_path` be copied to `host_path` once the
    /// command has succeeded.
    pub fn with_export(
        mut self,
        container_path: impl Into<String>,
        host_path: impl Into<PathBuf>,
    ) -> Self {
        self.exports.push(Export {
            container_path: container_path.into(),
            host_path: host_path.into(),
        });
        self
    }
}

impl fmt::Display for InvocationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({}, {})",
            self.tool.name, self.tool.image, self.tool.exit_policy
        )?;
        for step in &self.steps {
            match step {
                PlanStep::Mount(m) => {
                    let kind = match m.kind {
                        MountKind::File => "file",
                        MountKind::Directory => "dir",
                    };
                    let mode = if m.read_only { "ro" } else { "rw" };
                    writeln!(
                        f,
                        "  mount    {} -> {} ({kind}, {mode})",
                        m.host_path.display(),
                        m.container_path
                    )?;
                }
                PlanStep::Env { key, value } => writeln!(f, "  env      {key}={value}")?,
                PlanStep::Workdir { path } => writeln!(f, "  workdir  {path}")?,
                PlanStep::Prepare { argv, env } => {
                    write!(f, "  prepare  ")?;
                    for (key, value) in env.iter() {
                        write!(f, "{key}={value} ")?;
                    }
                    writeln!(f, "{}", shell_words(argv))?;
                }
                PlanStep::Setup { argv } => writeln!(f, "  setup    {}", shell_words(argv))?,
                PlanStep::Exec { argv } => writeln!(f, "  exec     {}", shell_words(argv))?,
            }
        }
        for export in &self.exports {
            writeln!(
                f,
                "  export   {} -> {}",
                export.container_path,
                export.host_path.display()
            )?;
        }
        Ok(())
    }
}

/// Build the plan for one container lifecycle.
///
/// Pure: the same inputs always yield the same plan. `env` entries
/// override bindings the mount plan brings with it.
pub fn build(
    tool: &ToolSpec,
    mount: &MountPlan,
    args: &ArgumentVector,
    env: &EnvBindings,
) -> InvocationPlan {
    let mut steps = Vec::with_capacity(
        mount.mounts.len() + mount.env.len() + env.len() + mount.prepare.len() + 3,
    );

    steps.extend(mount.mounts.iter().cloned().map(PlanStep::Mount));

    let mut merged = mount.env.clone();
    merged.merge(env);
    steps.extend(merged.0.into_iter().map(|(key, value)| PlanStep::Env { key, value }));

    if let Some(path) = &mount.workdir {
        steps.push(PlanStep::Workdir { path: path.clone() });
    }

    steps.extend(
        mount
            .prepare
            .iter()
            .map(|cmd| PlanStep::Prepare {
                argv: cmd.argv.clone(),
                env: cmd.env.clone(),
            }),
    );

    for setup in &tool.setup {
        let mut argv = Vec::with_capacity(setup.len() + 1);
        argv.push(tool.binary.clone());
        argv.extend(setup.iter().cloned());
        steps.push(PlanStep::Setup { argv });
    }

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(tool.binary.clone());
    argv.extend(args.iter().cloned());
    steps.push(PlanStep::Exec { argv });

    InvocationPlan {
        tool: tool.clone(),
        steps,
        exports: Vec::new(),
    }
}

/// Render an argument vector for display, quoting where a shell would need it.
pub fn shell_words(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let plain = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c));
            if plain {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
