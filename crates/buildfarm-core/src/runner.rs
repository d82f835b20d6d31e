//! The execution seam between the coordinator and workers.
//!
//! The coordinator never runs build commands itself; it hands fully
//! resolved [`CommandSpec`]s to a [`CommandRunner`] and observes exit
//! status and captured output. Implementations decide how a worker
//! name maps to an execution environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// A fully resolved command to run on a worker.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Argument vector; shell strings are wrapped in `sh -c` by the
    /// caller before reaching the runner.
    pub argv: Vec<String>,
    /// Absolute working directory on the worker.
    pub workdir: PathBuf,
    /// Environment overrides.
    pub env: HashMap<String, String>,
    /// Maximum execution time, if any.
    pub timeout: Option<Duration>,
}

/// Outcome of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Exit code; None when the process died without one.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, for capture extractors and failure
    /// reporting.
    pub output: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs commands on behalf of the coordinator.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Name of this runner, for logs.
    fn name(&self) -> &'static str;

    /// Run a command to completion on the named worker.
    async fn run(&self, worker: &str, spec: CommandSpec) -> Result<CommandOutcome>;

    /// Absolute base directory for a worker's build trees.
    fn base_dir(&self, worker: &str) -> PathBuf;
}
