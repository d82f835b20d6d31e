//! Build step definitions and per-step state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work inside a builder's sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Display name ("cmake", "compile", "upload").
    pub name: String,
    /// Working directory relative to the builder's build dir, fully
    /// resolved at configuration time.
    pub workdir: String,
    /// Environment overrides applied on top of the worker environment.
    pub env: HashMap<String, String>,
    /// Abort the remaining sequence if this step fails.
    pub halt_on_failure: bool,
    pub action: StepAction,
}

/// What a step does. A closed set: there are no user-defined step
/// types, only parameterizations of these four.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepAction {
    /// Fetch source from a configured repository. The only retryable
    /// action.
    Checkout {
        /// Project key of the source to fetch.
        source: String,
        retry: RetryPolicy,
    },
    /// Run an opaque command on the worker.
    Run {
        command: CommandLine,
        /// Optional post-processing of stdout into a run property.
        capture: Option<Capture>,
    },
    /// Resolve the newest file matching a glob and record it in the
    /// run properties. Failing to match anything halts the run.
    LocateArtifact { pattern: String },
    /// Copy the located artifact into the publication tree under the
    /// named channel.
    Publish { channel: String },
}

/// A command as either an argument vector or a shell string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandLine {
    /// Human-readable rendering for logs and status output.
    pub fn display(&self) -> String {
        match self {
            CommandLine::Argv(argv) => argv.join(" "),
            CommandLine::Shell(script) => script.clone(),
        }
    }
}

/// Post-processing of a run step's stdout into a run property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub property: String,
    pub extractor: Extractor,
}

/// How to reduce captured stdout to a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extractor {
    /// First line, trimmed.
    FirstLine,
    /// Whole output, trimmed.
    Trimmed,
    /// Basename of the first line, for commands that print a path.
    Basename,
}

impl Extractor {
    pub fn apply(&self, output: &str) -> String {
        let first = || output.lines().next().unwrap_or("").trim();
        match self {
            Extractor::FirstLine => first().to_string(),
            Extractor::Trimmed => output.trim().to_string(),
            Extractor::Basename => {
                let line = first();
                line.rsplit('/').next().unwrap_or(line).to_string()
            }
        }
    }
}

/// Retry policy for checkout steps: a bounded number of attempts with
/// a fixed delay between them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5 * 60),
        }
    }
}

/// Per-step execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed { message: String },
    /// Not executed because an earlier halting step failed.
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Recorded outcome of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Tail of the captured command output, for failure reporting.
    pub output: Option<String>,
}

impl StepResult {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractor_first_line() {
        assert_eq!(
            Extractor::FirstLine.apply("bin/a.deb\nbin/b.deb\n"),
            "bin/a.deb"
        );
    }

    #[test]
    fn extractor_basename_strips_directories() {
        assert_eq!(
            Extractor::Basename.apply("dist/windows/Setup-1.2.exe\n"),
            "Setup-1.2.exe"
        );
    }

    #[test]
    fn extractor_trimmed_keeps_inner_lines() {
        assert_eq!(Extractor::Trimmed.apply("  a\nb  \n"), "a\nb");
    }

    #[test]
    fn extractors_tolerate_empty_output() {
        assert_eq!(Extractor::FirstLine.apply(""), "");
        assert_eq!(Extractor::Basename.apply(""), "");
    }
}
