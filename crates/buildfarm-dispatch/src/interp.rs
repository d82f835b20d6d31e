//! `${...}` interpolation for step commands and environments.
//!
//! Supported variables:
//! - `${builder}` - builder name
//! - `${branch}` - branch being built
//! - `${revision}` - triggering revision, empty for forced/timed builds
//! - `${prop:NAME}` - a run property captured by an earlier step
//!
//! Unknown variables are left untouched so opaque shell syntax like
//! `${HOME}` passes through to the worker.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(prop:)?([A-Za-z0-9_.-]+)\}").unwrap());

/// Values available to a running build's steps.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub builder: String,
    pub branch: String,
    pub revision: String,
    pub properties: HashMap<String, String>,
}

impl RunContext {
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                match (caps.get(1).is_some(), &caps[2]) {
                    (true, name) => self.properties.get(name).cloned().unwrap_or_default(),
                    (false, "builder") => self.builder.clone(),
                    (false, "branch") => self.branch.clone(),
                    (false, "revision") => self.revision.clone(),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    pub fn interpolate_argv(&self, argv: &[String]) -> Vec<String> {
        argv.iter().map(|arg| self.interpolate(arg)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext {
            builder: "Mac Release".to_string(),
            branch: "master".to_string(),
            revision: "deadbeef".to_string(),
            properties: HashMap::from([(
                "artifact-name".to_string(),
                "clementine-1.2.dmg".to_string(),
            )]),
        }
    }

    #[test]
    fn substitutes_run_variables() {
        assert_eq!(
            ctx().interpolate("checkout ${branch} at ${revision}"),
            "checkout master at deadbeef"
        );
    }

    #[test]
    fn substitutes_properties() {
        assert_eq!(
            ctx().interpolate("scp ${prop:artifact-name} upload/"),
            "scp clementine-1.2.dmg upload/"
        );
    }

    #[test]
    fn missing_property_becomes_empty() {
        assert_eq!(ctx().interpolate("x${prop:nope}y"), "xy");
    }

    #[test]
    fn unknown_variables_pass_through() {
        assert_eq!(ctx().interpolate("echo ${HOME}"), "echo ${HOME}");
    }

    #[test]
    fn interpolates_env_values() {
        let env = HashMap::from([("DIST".to_string(), "${branch}".to_string())]);
        assert_eq!(
            ctx().interpolate_map(&env).get("DIST"),
            Some(&"master".to_string())
        );
    }
}
