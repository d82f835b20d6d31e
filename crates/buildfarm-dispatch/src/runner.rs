//! Step sequence execution for one build run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use buildfarm_config::{FarmConfig, SourceConfig};
use buildfarm_core::build::{BuildRun, BuildState};
use buildfarm_core::builder::BuilderDefinition;
use buildfarm_core::runner::{CommandRunner, CommandSpec};
use buildfarm_core::step::{CommandLine, RetryPolicy, Step, StepAction, StepStatus};
use buildfarm_core::{Error, Result};

use crate::artifact;
use crate::interp::RunContext;

/// Longest output tail kept on a step result.
const OUTPUT_TAIL: usize = 4096;

/// Run properties the artifact steps communicate through.
const PROP_ARTIFACT_PATH: &str = "artifact-path";
const PROP_ARTIFACT_NAME: &str = "artifact-name";

/// Executes builder step sequences against a command runner.
///
/// One instance per dispatched run; the dispatcher observes progress
/// through the snapshot channel and never blocks on the sequence.
pub struct SequenceRunner {
    runner: Arc<dyn CommandRunner>,
    config: Arc<FarmConfig>,
}

impl SequenceRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<FarmConfig>) -> Self {
        Self { runner, config }
    }

    /// Run every step of `def` for `run`, sending a snapshot after
    /// each state transition. The final snapshot carries a terminal
    /// state.
    pub async fn execute(
        &self,
        mut run: BuildRun,
        def: Arc<BuilderDefinition>,
        updates: mpsc::Sender<BuildRun>,
    ) {
        let base = self.runner.base_dir(&run.worker).join(&def.build_dir);
        let mut ctx = RunContext {
            builder: run.builder.clone(),
            branch: run.branch.clone(),
            revision: run
                .change
                .as_ref()
                .map(|c| c.revision.clone())
                .unwrap_or_default(),
            properties: run.properties.clone(),
        };

        run.state = BuildState::Running;
        let _ = updates.send(run.clone()).await;

        let mut halted = false;
        for index in 0..def.steps.len() {
            let step = &def.steps[index];
            if halted {
                run.steps[index].status = StepStatus::Skipped;
                continue;
            }

            run.steps[index].status = StepStatus::Running;
            run.steps[index].started_at = Some(Utc::now());
            let _ = updates.send(run.clone()).await;

            let result = self.run_step(step, index, &base, &mut ctx, &mut run).await;
            run.properties = ctx.properties.clone();
            match result {
                Ok(()) => {
                    info!(builder = %run.builder, step = %step.name, "step succeeded");
                    run.steps[index].status = StepStatus::Success;
                }
                Err(error) => {
                    warn!(builder = %run.builder, step = %step.name, %error, "step failed");
                    run.steps[index].status = StepStatus::Failed {
                        message: error.to_string(),
                    };
                    if step.halt_on_failure {
                        run.state = BuildState::Failure {
                            step: step.name.clone(),
                        };
                        halted = true;
                    }
                }
            }
            run.steps[index].finished_at = Some(Utc::now());
            let _ = updates.send(run.clone()).await;
        }

        if !halted {
            run.state = BuildState::Success;
        }
        run.finished_at = Some(Utc::now());
        let _ = updates.send(run).await;
    }

    async fn run_step(
        &self,
        step: &Step,
        index: usize,
        base: &Path,
        ctx: &mut RunContext,
        run: &mut BuildRun,
    ) -> Result<()> {
        let workdir = base.join(&step.workdir);
        match &step.action {
            StepAction::Checkout { source, retry } => {
                let source = self
                    .config
                    .source(source)
                    .ok_or_else(|| {
                        Error::Internal(format!("source '{source}' vanished from configuration"))
                    })?
                    .clone();
                let worker = run.worker.clone();
                self.checkout(&worker, &source, *retry, &workdir, ctx).await
            }
            StepAction::Run { command, capture } => {
                let spec = command_spec(command, &workdir, &step.env, ctx);
                let outcome = self.runner.run(&run.worker, spec).await?;
                run.steps[index].output = Some(tail(&outcome.output));
                if !outcome.success() {
                    return Err(Error::StepFailed {
                        step: step.name.clone(),
                        exit_code: outcome.exit_code,
                    });
                }
                if let Some(capture) = capture {
                    ctx.properties.insert(
                        capture.property.clone(),
                        capture.extractor.apply(&outcome.output),
                    );
                }
                Ok(())
            }
            StepAction::LocateArtifact { pattern } => {
                let pattern = ctx.interpolate(pattern);
                let path = artifact::locate(&workdir, &pattern)?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                run.steps[index].output = Some(path.display().to_string());
                ctx.properties
                    .insert(PROP_ARTIFACT_PATH.to_string(), path.display().to_string());
                ctx.properties.insert(PROP_ARTIFACT_NAME.to_string(), name);
                Ok(())
            }
            StepAction::Publish { channel } => {
                let channel = ctx.interpolate(channel);
                let located = ctx.properties.get(PROP_ARTIFACT_PATH).ok_or_else(|| {
                    Error::Internal("publish step ran before locate-artifact".to_string())
                })?;
                let published = artifact::publish(
                    Path::new(located),
                    &self.config.upload_base,
                    &self.config.upload_url,
                    &channel,
                )
                .await?;
                run.steps[index].output = Some(published.url.clone());
                run.artifact = Some(published);
                Ok(())
            }
        }
    }

    /// Fetch source with the step's retry policy: transient failures
    /// get a fixed delay and another attempt, up to the bound.
    async fn checkout(
        &self,
        worker: &str,
        source: &SourceConfig,
        retry: RetryPolicy,
        workdir: &Path,
        ctx: &RunContext,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.checkout_once(worker, source, workdir, ctx).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < retry.attempts => {
                    warn!(worker, attempt, %error, "checkout failed, retrying");
                    tokio::time::sleep(retry.delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn checkout_once(
        &self,
        worker: &str,
        source: &SourceConfig,
        workdir: &Path,
        ctx: &RunContext,
    ) -> Result<()> {
        let branch = if ctx.branch.is_empty() {
            source.branch.as_str()
        } else {
            ctx.branch.as_str()
        };
        let target = if ctx.revision.is_empty() {
            "FETCH_HEAD"
        } else {
            ctx.revision.as_str()
        };
        let commands = [
            argv(&["git", "init", "--quiet", "."]),
            argv(&["git", "fetch", "--quiet", source.url.as_str(), branch]),
            argv(&["git", "checkout", "--force", "--quiet", target]),
        ];
        for command in commands {
            let spec = CommandSpec {
                argv: command,
                workdir: workdir.to_path_buf(),
                env: HashMap::new(),
                timeout: None,
            };
            let outcome = self.runner.run(worker, spec).await?;
            if !outcome.success() {
                return Err(Error::TransientFetch(tail(&outcome.output)));
            }
        }
        Ok(())
    }
}

fn command_spec(
    command: &CommandLine,
    workdir: &Path,
    env: &HashMap<String, String>,
    ctx: &RunContext,
) -> CommandSpec {
    let argv = match command {
        CommandLine::Argv(args) => ctx.interpolate_argv(args),
        CommandLine::Shell(script) => argv(&["/bin/sh", "-c", &ctx.interpolate(script)]),
    };
    CommandSpec {
        argv,
        workdir: workdir.to_path_buf(),
        env: ctx.interpolate_map(env),
        timeout: None,
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn tail(output: &str) -> String {
    if output.len() <= OUTPUT_TAIL {
        return output.to_string();
    }
    let mut start = output.len() - OUTPUT_TAIL;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}
