//! KDL document parsing.

use std::collections::HashMap;
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use url::Url;

use buildfarm_core::builder::{
    BuilderDefinition, LockDefinition, LockMode, LockRequirement, LockScope, build_dir_slug,
};
use buildfarm_core::step::{Capture, CommandLine, Extractor, RetryPolicy, Step, StepAction};
use buildfarm_core::worker::WorkerDefinition;

use crate::error::{ConfigError, ConfigResult};
use crate::farm::{FarmConfig, SchedulerConfig, SchedulerKind, SourceConfig};

const DEFAULT_LISTEN: &str = "127.0.0.1:8010";
const DEFAULT_POLL_INTERVAL: u64 = 5 * 60;
const DEFAULT_STABLE_FOR: u64 = 2 * 60;
const DEFAULT_CHECKOUT_WORKDIR: &str = "source";

/// Parse a farm document. Returns the configuration (not yet
/// validated) and the credentials file path it names, if any.
pub fn parse_document(text: &str) -> ConfigResult<(FarmConfig, Option<String>)> {
    let doc: KdlDocument = text.parse()?;

    let mut farm: Option<(FarmConfig, Option<String>)> = None;
    let mut workers = Vec::new();
    let mut locks = Vec::new();
    let mut sources = Vec::new();
    let mut builders = Vec::new();
    let mut schedulers = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "farm" => farm = Some(parse_farm(node)?),
            "worker" => workers.push(parse_worker(node)?),
            "lock" => locks.push(parse_lock(node)?),
            "source" => sources.push(parse_source(node)?),
            "builder" => builders.push(parse_builder(node)?),
            "scheduler" => schedulers.push(parse_scheduler(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let (mut config, credentials) =
        farm.ok_or_else(|| ConfigError::MissingField("farm".to_string()))?;
    config.workers = workers;
    config.locks = locks;
    config.sources = sources;
    config.builders = builders;
    config.schedulers = schedulers;
    Ok((config, credentials))
}

/// Parse a credentials document: `credential "worker" "secret"` nodes.
pub fn parse_credentials(text: &str) -> ConfigResult<HashMap<String, String>> {
    let doc: KdlDocument = text.parse()?;
    let mut creds = HashMap::new();
    for node in doc.nodes() {
        if node.name().value() != "credential" {
            continue;
        }
        let mut args = string_args(node).into_iter();
        let (Some(worker), Some(secret)) = (args.next(), args.next()) else {
            return Err(ConfigError::MissingField(
                "credential worker and secret".to_string(),
            ));
        };
        if creds.insert(worker.clone(), secret).is_some() {
            return Err(ConfigError::Duplicate(format!("credential '{worker}'")));
        }
    }
    Ok(creds)
}

fn parse_farm(node: &KdlNode) -> ConfigResult<(FarmConfig, Option<String>)> {
    let children = node
        .children()
        .ok_or_else(|| ConfigError::MissingField("farm body".to_string()))?;

    let field = |name: &str| -> Option<String> {
        children
            .nodes()
            .iter()
            .find(|n| n.name().value() == name)
            .and_then(first_string_arg)
    };
    let require = |name: &str| -> ConfigResult<String> {
        field(name).ok_or_else(|| ConfigError::MissingField(format!("farm {name}")))
    };

    let listen = field("listen").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen = listen
        .parse()
        .map_err(|e| ConfigError::InvalidValue {
            field: "farm listen".to_string(),
            message: format!("{e}"),
        })?;

    let config = FarmConfig {
        project: require("project")?,
        state_dir: require("state-dir")?.into(),
        upload_base: require("upload-base")?.into(),
        upload_url: Url::parse(&require("upload-url")?)?,
        listen,
        workers: Vec::new(),
        locks: Vec::new(),
        sources: Vec::new(),
        builders: Vec::new(),
        schedulers: Vec::new(),
    };
    Ok((config, field("credentials")))
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerDefinition> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;
    let mut worker = WorkerDefinition::new(name, string_prop(node, "credential").unwrap_or_default());
    if let Some(max) = int_prop(node, "max-builds") {
        worker.max_builds = usize::try_from(max).map_err(|_| ConfigError::InvalidValue {
            field: format!("worker '{}' max-builds", worker.name),
            message: "must be a positive integer".to_string(),
        })?;
    }
    Ok(worker)
}

fn parse_lock(node: &KdlNode) -> ConfigResult<LockDefinition> {
    let name =
        first_string_arg(node).ok_or_else(|| ConfigError::MissingField("lock name".to_string()))?;
    let scope = match string_prop(node, "scope").as_deref() {
        Some("master") | None => LockScope::Master,
        Some("worker") => LockScope::Worker,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: format!("lock '{name}' scope"),
                message: format!("unknown scope '{other}'"),
            });
        }
    };
    let max_count = match int_prop(node, "max-count") {
        Some(n) => usize::try_from(n).map_err(|_| ConfigError::InvalidValue {
            field: format!("lock '{name}' max-count"),
            message: "must be a positive integer".to_string(),
        })?,
        None => 1,
    };
    Ok(LockDefinition {
        name,
        scope,
        max_count,
    })
}

fn parse_source(node: &KdlNode) -> ConfigResult<SourceConfig> {
    let project = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("source project".to_string()))?;
    let url = string_prop(node, "url")
        .ok_or_else(|| ConfigError::MissingField(format!("source '{project}' url")))?;
    Ok(SourceConfig {
        url: Url::parse(&url)?,
        branch: string_prop(node, "branch").unwrap_or_else(|| "master".to_string()),
        poll_interval: Duration::from_secs(
            int_prop(node, "poll-interval")
                .map(|n| n as u64)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        ),
        project,
    })
}

fn parse_builder(node: &KdlNode) -> ConfigResult<BuilderDefinition> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("builder name".to_string()))?;
    let worker = string_prop(node, "worker")
        .ok_or_else(|| ConfigError::MissingField(format!("builder '{name}' worker")))?;
    let auto = bool_prop(node, "auto").unwrap_or(true);

    let mut steps = Vec::new();
    let mut locks = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "lock" => locks.push(parse_lock_requirement(child, &name)?),
                "checkout" => steps.push(parse_checkout(child)?),
                "step" => steps.push(parse_step(child)?),
                "locate-artifact" => steps.push(parse_locate(child)?),
                "publish" => steps.push(parse_publish(child)?),
                _ => {}
            }
        }
    }

    Ok(BuilderDefinition {
        build_dir: build_dir_slug(&name),
        name,
        worker,
        steps,
        locks,
        auto,
    })
}

fn parse_lock_requirement(node: &KdlNode, builder: &str) -> ConfigResult<LockRequirement> {
    let lock = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("builder '{builder}' lock name")))?;
    let mode = match string_prop(node, "mode").as_deref() {
        Some("counting") | None => LockMode::Counting,
        Some("exclusive") => LockMode::Exclusive,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: format!("builder '{builder}' lock '{lock}' mode"),
                message: format!("unknown mode '{other}'"),
            });
        }
    };
    Ok(LockRequirement { lock, mode })
}

fn parse_checkout(node: &KdlNode) -> ConfigResult<Step> {
    let source = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("checkout source".to_string()))?;
    let mut retry = RetryPolicy::default();
    if let Some(attempts) = int_prop(node, "retry-attempts") {
        retry.attempts = attempts as u32;
    }
    if let Some(delay) = int_prop(node, "retry-delay") {
        retry.delay = Duration::from_secs(delay as u64);
    }
    Ok(Step {
        name: "checkout".to_string(),
        workdir: string_prop(node, "workdir")
            .unwrap_or_else(|| DEFAULT_CHECKOUT_WORKDIR.to_string()),
        env: HashMap::new(),
        halt_on_failure: true,
        action: StepAction::Checkout { source, retry },
    })
}

fn parse_step(node: &KdlNode) -> ConfigResult<Step> {
    let name =
        first_string_arg(node).ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let mut command = None;
    let mut capture = None;
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    let argv = string_args(child);
                    if argv.is_empty() {
                        return Err(ConfigError::MissingField(format!(
                            "step '{name}' run arguments"
                        )));
                    }
                    command = Some(CommandLine::Argv(argv));
                }
                "shell" => {
                    let script = first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("step '{name}' shell script"))
                    })?;
                    command = Some(CommandLine::Shell(script));
                }
                "capture" => capture = Some(parse_capture(child, &name)?),
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            if let Some(val) = first_string_arg(gc) {
                                env.insert(key, val);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let command = command
        .ok_or_else(|| ConfigError::MissingField(format!("step '{name}' run or shell command")))?;

    Ok(Step {
        workdir: string_prop(node, "workdir")
            .unwrap_or_else(|| DEFAULT_CHECKOUT_WORKDIR.to_string()),
        env,
        halt_on_failure: bool_prop(node, "halt-on-failure").unwrap_or(false),
        action: StepAction::Run { command, capture },
        name,
    })
}

fn parse_capture(node: &KdlNode, step: &str) -> ConfigResult<Capture> {
    let property = string_prop(node, "property")
        .ok_or_else(|| ConfigError::MissingField(format!("step '{step}' capture property")))?;
    let extractor = match string_prop(node, "extractor").as_deref() {
        Some("first-line") | None => Extractor::FirstLine,
        Some("trimmed") => Extractor::Trimmed,
        Some("basename") => Extractor::Basename,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: format!("step '{step}' capture extractor"),
                message: format!("unknown extractor '{other}'"),
            });
        }
    };
    Ok(Capture {
        property,
        extractor,
    })
}

fn parse_locate(node: &KdlNode) -> ConfigResult<Step> {
    let pattern = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("locate-artifact pattern".to_string()))?;
    Ok(Step {
        name: "get output filename".to_string(),
        workdir: string_prop(node, "workdir")
            .unwrap_or_else(|| DEFAULT_CHECKOUT_WORKDIR.to_string()),
        env: HashMap::new(),
        // No artifact is always a halting failure.
        halt_on_failure: true,
        action: StepAction::LocateArtifact { pattern },
    })
}

fn parse_publish(node: &KdlNode) -> ConfigResult<Step> {
    let channel = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("publish channel".to_string()))?;
    Ok(Step {
        name: "upload".to_string(),
        workdir: ".".to_string(),
        env: HashMap::new(),
        halt_on_failure: true,
        action: StepAction::Publish { channel },
    })
}

fn parse_scheduler(node: &KdlNode) -> ConfigResult<SchedulerConfig> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("scheduler name".to_string()))?;
    let children = node
        .children()
        .ok_or_else(|| ConfigError::MissingField(format!("scheduler '{name}' body")))?;

    let mut kind = None;
    let mut builders = Vec::new();

    for child in children.nodes() {
        match child.name().value() {
            "tree-stable" => {
                let project = string_prop(child, "project")
                    .ok_or_else(|| ConfigError::MissingField(format!("scheduler '{name}' project")))?;
                kind = Some(SchedulerKind::TreeStable {
                    project,
                    branch: string_prop(child, "branch").unwrap_or_else(|| "master".to_string()),
                    stable_for: Duration::from_secs(
                        int_prop(child, "stable-for")
                            .map(|n| n as u64)
                            .unwrap_or(DEFAULT_STABLE_FOR),
                    ),
                });
            }
            "nightly" => {
                kind = Some(SchedulerKind::Nightly {
                    hour: int_prop(child, "hour").unwrap_or(0) as u32,
                    minute: int_prop(child, "minute").unwrap_or(0) as u32,
                    weekday: int_prop(child, "weekday").map(|d| d as u32),
                    branch: string_prop(child, "branch").unwrap_or_else(|| "master".to_string()),
                });
            }
            "dependent" => {
                let upstream = string_args(child);
                if upstream.is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "scheduler '{name}' dependent upstream builders"
                    )));
                }
                kind = Some(SchedulerKind::Dependent { upstream });
            }
            "builders" => builders.extend(string_args(child)),
            _ => {}
        }
    }

    let kind = kind.ok_or_else(|| {
        ConfigError::MissingField(format!(
            "scheduler '{name}' trigger (tree-stable, nightly, or dependent)"
        ))
    })?;
    if builders.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "scheduler '{name}' builders"
        )));
    }

    Ok(SchedulerConfig {
        name,
        builders,
        kind,
    })
}

// Helper functions for extracting values from KDL nodes

fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_FARM: &str = r#"
        farm {
            project "clementine"
            state-dir "/var/lib/buildfarm"
            upload-base "/var/www/builds"
            upload-url "http://builds.example.org"
        }

        worker "zaphod" credential="sekrit" max-builds=2

        lock "local" scope="master" max-count=2
        lock "deps" scope="worker"

        source "clementine" url="https://example.org/clementine.git" branch="master" poll-interval=300

        builder "Ubuntu Focal 64-bit" worker="zaphod" {
            lock "local" mode="counting"
            checkout "clementine" retry-attempts=3 retry-delay=300
            step "cmake" workdir="source/bin" halt-on-failure=true {
                run "cmake" ".." "-DWITH_DEBIAN=ON"
            }
            step "compile" workdir="source/bin" halt-on-failure=true {
                shell "make deb"
                env {
                    DEB_BUILD_OPTIONS "parallel=4"
                }
            }
            locate-artifact "bin/clementine_*.deb"
            publish "ubuntu-focal"
        }

        scheduler "automatic" {
            tree-stable project="clementine" branch="master" stable-for=120
            builders "Ubuntu Focal 64-bit"
        }
    "#;

    fn parse_valid(text: &str) -> FarmConfig {
        let (config, _) = parse_document(text).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn parses_a_full_farm() {
        let config = parse_valid(MINIMAL_FARM);
        assert_eq!(config.project, "clementine");
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].max_builds, 2);
        assert_eq!(config.locks.len(), 2);
        assert_eq!(config.sources[0].poll_interval, Duration::from_secs(300));

        let builder = &config.builders[0];
        assert_eq!(builder.build_dir, "ubuntu-focal-64-bit");
        assert_eq!(builder.worker, "zaphod");
        assert!(builder.auto);
        assert_eq!(builder.steps.len(), 5);
        assert!(matches!(
            builder.steps[0].action,
            StepAction::Checkout { .. }
        ));
        assert!(builder.steps[1].halt_on_failure);
        assert_eq!(
            builder.steps[2].env.get("DEB_BUILD_OPTIONS"),
            Some(&"parallel=4".to_string())
        );
        assert!(matches!(
            builder.steps[4].action,
            StepAction::Publish { ref channel } if channel == "ubuntu-focal"
        ));
    }

    #[test]
    fn checkout_retry_fields_parse() {
        let config = parse_valid(MINIMAL_FARM);
        let StepAction::Checkout { retry, .. } = &config.builders[0].steps[0].action else {
            panic!("expected checkout step");
        };
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.delay, Duration::from_secs(300));
    }

    #[test]
    fn scheduler_with_unknown_builder_is_fatal() {
        let text = MINIMAL_FARM.replace(
            r#"builders "Ubuntu Focal 64-bit""#,
            r#"builders "No Such Builder""#,
        );
        let (config, _) = parse_document(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn duplicate_worker_is_fatal() {
        let text = MINIMAL_FARM.replace(
            r#"worker "zaphod" credential="sekrit" max-builds=2"#,
            "worker \"zaphod\" credential=\"sekrit\" max-builds=2\nworker \"zaphod\" credential=\"x\"",
        );
        let (config, _) = parse_document(&text).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn missing_credential_is_fatal() {
        let text = MINIMAL_FARM.replace(r#" credential="sekrit""#, "");
        let (config, _) = parse_document(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential(ref w)) if w == "zaphod"
        ));
    }

    #[test]
    fn publish_without_locate_is_fatal() {
        let text = MINIMAL_FARM.replace("locate-artifact \"bin/clementine_*.deb\"\n", "");
        let (config, _) = parse_document(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn auto_flag_defaults_true_and_parses_false() {
        let text = format!(
            "{MINIMAL_FARM}\nbuilder \"Official PPA\" worker=\"zaphod\" auto=false {{\n    step \"upload\" {{\n        run \"uploadtoppa.sh\"\n    }}\n}}\n"
        );
        let config = parse_valid(&text);
        assert!(config.builder("Ubuntu Focal 64-bit").unwrap().auto);
        assert!(!config.builder("Official PPA").unwrap().auto);
    }

    #[test]
    fn credentials_document_merges_over_inline() {
        let creds = parse_credentials(r#"credential "zaphod" "from-file""#).unwrap();
        let (mut config, _) = parse_document(MINIMAL_FARM).unwrap();
        crate::farm::merge_credentials(&mut config.workers, &creds);
        assert_eq!(config.workers[0].credential, "from-file");
    }

    #[test]
    fn nightly_scheduler_parses_weekday() {
        let text = MINIMAL_FARM.replace(
            r#"tree-stable project="clementine" branch="master" stable-for=120"#,
            r#"nightly hour=10 minute=0 weekday=6"#,
        );
        let config = parse_valid(&text);
        let SchedulerKind::Nightly {
            hour,
            minute,
            weekday,
            ..
        } = &config.schedulers[0].kind
        else {
            panic!("expected nightly scheduler");
        };
        assert_eq!((*hour, *minute, *weekday), (10, 0, Some(6)));
    }

    #[test]
    fn dependent_scheduler_requires_known_upstream() {
        let text = MINIMAL_FARM.replace(
            r#"tree-stable project="clementine" branch="master" stable-for=120"#,
            r#"dependent "Not A Builder""#,
        );
        let (config, _) = parse_document(&text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReference(_))
        ));
    }
}
