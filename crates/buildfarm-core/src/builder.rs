//! Builder definitions and lock declarations.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::step::Step;

/// A named, fixed pipeline producing one artifact type on one worker.
///
/// Created at configuration load and immutable for the lifetime of
/// that configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderDefinition {
    /// Unique name ("Ubuntu Focal 64-bit").
    pub name: String,
    /// Directory slug this builder's runs live under, derived from the
    /// name via [`build_dir_slug`].
    pub build_dir: String,
    /// Statically assigned worker.
    pub worker: String,
    pub steps: Vec<Step>,
    /// Locks held for the whole run, acquired in lock-name order.
    pub locks: Vec<LockRequirement>,
    /// Whether automatic schedulers may trigger this builder. Forced
    /// builds ignore this.
    pub auto: bool,
}

/// One lock acquisition a builder requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequirement {
    pub lock: String,
    pub mode: LockMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// One of up to `max_count` simultaneous holders.
    Counting,
    /// Sole holder; excludes counting holders too.
    Exclusive,
}

/// Declaration of a lock, referenced by builders by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDefinition {
    pub name: String,
    pub scope: LockScope,
    pub max_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    /// One instance shared by every worker.
    Master,
    /// One independent instance per worker.
    Worker,
}

static SLUG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9_-]").unwrap());

/// Directory slug for a builder name: lowercased, with every character
/// outside `[a-z0-9_-]` replaced by `-`.
pub fn build_dir_slug(name: &str) -> String {
    SLUG_REGEX
        .replace_all(&name.to_lowercase(), "-")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_replaces_spaces_and_dots() {
        assert_eq!(build_dir_slug("Ubuntu Focal 64-bit"), "ubuntu-focal-64-bit");
        assert_eq!(build_dir_slug("Rpm Fedora 17 64-bit"), "rpm-fedora-17-64-bit");
    }

    #[test]
    fn slug_keeps_underscores_and_dashes() {
        assert_eq!(build_dir_slug("a_b-c"), "a_b-c");
    }
}
