//! Exit-code policies.
//!
//! Many scanners exit non-zero to mean "the scan ran and found problems".
//! An [`ExitPolicy`] is fixed per operation and turns the raw exit code and
//! captured streams into an [`ExitClassification`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a tool's exit code and output are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitPolicy {
    /// Non-zero exit is a failure.
    Strict,
    /// Exit code is ignored; non-empty stdout is success, empty stdout is failure.
    AnySucceedsIfOutputNonEmpty,
    /// On a failing exit (or lost stdout), non-empty stderr is taken as the result.
    FallbackToStderr,
}

impl ExitPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitPolicy::Strict => "strict",
            ExitPolicy::AnySucceedsIfOutputNonEmpty => "any-succeeds-if-output-non-empty",
            ExitPolicy::FallbackToStderr => "fallback-to-stderr",
        }
    }

    /// Classify one finished process run.
    pub fn classify(&self, raw: &RawOutput<'_>) -> ExitClassification {
        let stdout_present = raw.stdout.is_some_and(has_content);
        let stderr_present = raw.stderr.is_some_and(has_content);

        match self {
            ExitPolicy::Strict => {
                if raw.exit_code == 0 && raw.stdout.is_some() {
                    ExitClassification::Success
                } else {
                    ExitClassification::ToolReportedFailure
                }
            }
            ExitPolicy::AnySucceedsIfOutputNonEmpty => {
                if !stdout_present {
                    ExitClassification::EmptyOutput
                } else if raw.exit_code == 0 {
                    ExitClassification::Success
                } else {
                    ExitClassification::FindingsTolerated
                }
            }
            ExitPolicy::FallbackToStderr => {
                if raw.exit_code == 0 && raw.stdout.is_some() {
                    ExitClassification::Success
                } else if stderr_present {
                    ExitClassification::StderrFallback
                } else if stdout_present {
                    ExitClassification::FindingsTolerated
                } else {
                    ExitClassification::ToolReportedFailure
                }
            }
        }
    }
}

impl fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying an [`ExitPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClassification {
    /// Exit code zero.
    Success,
    /// Non-zero exit accepted because the tool produced output.
    FindingsTolerated,
    /// The result is the tool's stderr.
    StderrFallback,
    /// The tool's run counts as failed.
    ToolReportedFailure,
    /// Best-effort tool that produced nothing at all.
    EmptyOutput,
}

impl ExitClassification {
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            ExitClassification::Success
                | ExitClassification::FindingsTolerated
                | ExitClassification::StderrFallback
        )
    }

    /// Which captured stream carries the result.
    pub fn output_stream(&self) -> OutputStream {
        match self {
            ExitClassification::StderrFallback => OutputStream::Stderr,
            _ => OutputStream::Stdout,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitClassification::Success => "success",
            ExitClassification::FindingsTolerated => "findings_tolerated",
            ExitClassification::StderrFallback => "stderr_fallback",
            ExitClassification::ToolReportedFailure => "tool_reported_failure",
            ExitClassification::EmptyOutput => "empty_output",
        }
    }
}

impl fmt::Display for ExitClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A finished process run as seen by the classifier. A stream is `None`
/// when it could not be captured.
#[derive(Debug, Clone, Copy)]
pub struct RawOutput<'a> {
    pub exit_code: i32,
    pub stdout: Option<&'a [u8]>,
    pub stderr: Option<&'a [u8]>,
}

/// Whitespace-only output counts as empty.
pub fn has_content(bytes: &[u8]) -> bool {
    bytes.iter().any(|b| !b.is_ascii_whitespace())
}
