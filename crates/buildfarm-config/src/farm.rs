//! The merged, validated farm configuration value.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use buildfarm_core::builder::{BuilderDefinition, LockDefinition};
use buildfarm_core::step::StepAction;
use buildfarm_core::worker::WorkerDefinition;

use crate::error::{ConfigError, ConfigResult};
use crate::parse;

/// Everything the coordinator needs to run, built once at startup (or
/// on reload) and passed around read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Display name of the project this farm builds.
    pub project: String,
    /// Directory for poller mirrors, cursors, and worker build trees.
    pub state_dir: PathBuf,
    /// Root of the publication tree artifacts are copied into.
    pub upload_base: PathBuf,
    /// Public base URL the publication tree is served from.
    pub upload_url: Url,
    /// Address the status/force-build API listens on.
    pub listen: SocketAddr,
    pub workers: Vec<WorkerDefinition>,
    pub locks: Vec<LockDefinition>,
    pub sources: Vec<SourceConfig>,
    pub builders: Vec<BuilderDefinition>,
    pub schedulers: Vec<SchedulerConfig>,
}

/// A polled change source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Project key changes from this repository are tagged with.
    pub project: String,
    pub url: Url,
    pub branch: String,
    pub poll_interval: Duration,
}

/// A scheduler: a trigger condition plus the builders it governs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,
    pub builders: Vec<String>,
    pub kind: SchedulerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Debounced change-triggered scheduler: waits until the tree has
    /// been quiet for `stable_for` after a matching change.
    TreeStable {
        project: String,
        branch: String,
        stable_for: Duration,
    },
    /// Fires at a fixed time of day, optionally on one weekday
    /// (0 = Monday .. 6 = Sunday).
    Nightly {
        hour: u32,
        minute: u32,
        weekday: Option<u32>,
        branch: String,
    },
    /// Fires when one of the named upstream builders completes
    /// successfully.
    Dependent { upstream: Vec<String> },
}

impl FarmConfig {
    /// Load and validate a configuration document, merging in the
    /// credentials file it names (resolved relative to the document).
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let (mut config, credentials) = parse::parse_document(&text)?;
        if let Some(rel) = credentials {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let cred_text = std::fs::read_to_string(base.join(&rel))?;
            let creds = parse::parse_credentials(&cred_text)?;
            merge_credentials(&mut config.workers, &creds);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn source(&self, project: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.project == project)
    }

    pub fn builder(&self, name: &str) -> Option<&BuilderDefinition> {
        self.builders.iter().find(|b| b.name == name)
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerDefinition> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Check the configuration for internal consistency. Any failure
    /// here is fatal: the process must refuse to start rather than run
    /// with a partial configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        let workers = unique_names(self.workers.iter().map(|w| w.name.as_str()), "worker")?;
        let locks = unique_names(self.locks.iter().map(|l| l.name.as_str()), "lock")?;
        let sources = unique_names(self.sources.iter().map(|s| s.project.as_str()), "source")?;
        let builders = unique_names(self.builders.iter().map(|b| b.name.as_str()), "builder")?;
        unique_names(self.schedulers.iter().map(|s| s.name.as_str()), "scheduler")?;

        for worker in &self.workers {
            if worker.credential.is_empty() {
                return Err(ConfigError::MissingCredential(worker.name.clone()));
            }
            if worker.max_builds == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("worker '{}' max-builds", worker.name),
                    message: "must be at least 1".to_string(),
                });
            }
        }

        for lock in &self.locks {
            if lock.max_count == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("lock '{}' max-count", lock.name),
                    message: "must be at least 1".to_string(),
                });
            }
        }

        for builder in &self.builders {
            if !workers.contains(builder.worker.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "builder '{}' is assigned to unknown worker '{}'",
                    builder.name, builder.worker
                )));
            }
            for req in &builder.locks {
                if !locks.contains(req.lock.as_str()) {
                    return Err(ConfigError::InvalidReference(format!(
                        "builder '{}' requires unknown lock '{}'",
                        builder.name, req.lock
                    )));
                }
            }
            if builder.steps.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("builder '{}'", builder.name),
                    message: "has no steps".to_string(),
                });
            }
            let mut located = false;
            for step in &builder.steps {
                match &step.action {
                    StepAction::Checkout { source, .. } => {
                        if !sources.contains(source.as_str()) {
                            return Err(ConfigError::InvalidReference(format!(
                                "builder '{}' checks out unknown source '{}'",
                                builder.name, source
                            )));
                        }
                    }
                    StepAction::LocateArtifact { .. } => located = true,
                    StepAction::Publish { .. } if !located => {
                        return Err(ConfigError::InvalidValue {
                            field: format!("builder '{}'", builder.name),
                            message: format!(
                                "publish step '{}' has no locate-artifact before it",
                                step.name
                            ),
                        });
                    }
                    _ => {}
                }
            }
        }

        for scheduler in &self.schedulers {
            for name in &scheduler.builders {
                if !builders.contains(name.as_str()) {
                    return Err(ConfigError::InvalidReference(format!(
                        "scheduler '{}' governs unknown builder '{}'",
                        scheduler.name, name
                    )));
                }
            }
            match &scheduler.kind {
                SchedulerKind::TreeStable { project, .. } => {
                    if !sources.contains(project.as_str()) {
                        return Err(ConfigError::InvalidReference(format!(
                            "scheduler '{}' filters on unknown source '{}'",
                            scheduler.name, project
                        )));
                    }
                }
                SchedulerKind::Nightly {
                    hour,
                    minute,
                    weekday,
                    ..
                } => {
                    if *hour > 23 || *minute > 59 || weekday.is_some_and(|d| d > 6) {
                        return Err(ConfigError::InvalidValue {
                            field: format!("scheduler '{}'", scheduler.name),
                            message: "nightly time out of range".to_string(),
                        });
                    }
                }
                SchedulerKind::Dependent { upstream } => {
                    for name in upstream {
                        if !builders.contains(name.as_str()) {
                            return Err(ConfigError::InvalidReference(format!(
                                "scheduler '{}' depends on unknown builder '{}'",
                                scheduler.name, name
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Apply a credentials map to the worker list. File entries win over
/// inline credentials.
pub fn merge_credentials(workers: &mut [WorkerDefinition], creds: &HashMap<String, String>) {
    for worker in workers {
        if let Some(secret) = creds.get(&worker.name) {
            worker.credential = secret.clone();
        }
    }
}

fn unique_names<'a>(
    names: impl Iterator<Item = &'a str>,
    kind: &str,
) -> ConfigResult<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate(format!("{kind} '{name}'")));
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_merges_the_credentials_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("passwords.kdl"),
            r#"credential "zaphod" "sekrit""#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("farm.kdl"),
            r#"
            farm {
                project "clementine"
                state-dir "/var/lib/buildfarm"
                upload-base "/var/www/builds"
                upload-url "http://builds.example.org"
                credentials "passwords.kdl"
            }

            worker "zaphod"

            source "clementine" url="https://example.org/clementine.git"

            builder "Source Tarball" worker="zaphod" {
                checkout "clementine"
                step "maketarball" workdir="source/dist" halt-on-failure=true {
                    run "./maketarball.sh"
                }
            }

            scheduler "automatic" {
                tree-stable project="clementine"
                builders "Source Tarball"
            }
            "#,
        )
        .unwrap();

        let config = FarmConfig::load(&dir.path().join("farm.kdl")).unwrap();
        assert_eq!(config.worker("zaphod").unwrap().credential, "sekrit");
        assert_eq!(config.worker("zaphod").unwrap().max_builds, 1);
        assert_eq!(
            config.source("clementine").unwrap().poll_interval,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn load_fails_on_a_missing_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("farm.kdl"),
            r#"
            farm {
                project "clementine"
                state-dir "/var/lib/buildfarm"
                upload-base "/var/www/builds"
                upload-url "http://builds.example.org"
                credentials "nope.kdl"
            }
            "#,
        )
        .unwrap();

        assert!(matches!(
            FarmConfig::load(&dir.path().join("farm.kdl")),
            Err(ConfigError::Io(_))
        ));
    }
}
