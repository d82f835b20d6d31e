//! Process-spawning runner for workers co-located with the
//! coordinator.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

use buildfarm_core::runner::{CommandOutcome, CommandRunner, CommandSpec};
use buildfarm_core::{Error, Result};

/// Runs commands as local child processes. Each worker gets its own
/// build tree under the runner's base directory.
#[derive(Debug)]
pub struct LocalRunner {
    base: PathBuf,
}

impl LocalRunner {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    fn base_dir(&self, worker: &str) -> PathBuf {
        self.base.join(worker)
    }

    async fn run(&self, worker: &str, spec: CommandSpec) -> Result<CommandOutcome> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty command".to_string()))?;

        tokio::fs::create_dir_all(&spec.workdir).await?;
        debug!(worker, command = %spec.argv.join(" "), "spawning");

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&spec.workdir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| {
                    Error::Timeout(format!("'{}' after {:?}", spec.argv.join(" "), limit))
                })??,
            None => command.output().await?,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(CommandOutcome {
            exit_code: output.status.code(),
            output: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec(argv: &[&str], workdir: &std::path::Path) -> CommandSpec {
        CommandSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            workdir: workdir.to_path_buf(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new(dir.path());
        let workdir = runner.base_dir("zaphod");

        let outcome = runner
            .run("zaphod", spec(&["sh", "-c", "echo hello"], &workdir))
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.output.trim(), "hello");
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new(dir.path());
        let workdir = runner.base_dir("zaphod");

        let outcome = runner
            .run("zaphod", spec(&["sh", "-c", "exit 3"], &workdir))
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn creates_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new(dir.path());
        let workdir = runner.base_dir("zaphod").join("deep/nested");

        let outcome = runner
            .run("zaphod", spec(&["pwd"], &workdir))
            .await
            .unwrap();
        assert!(outcome.success());
        assert!(workdir.is_dir());
    }
}
