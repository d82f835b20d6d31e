//! Worker registration.

use serde::{Deserialize, Serialize};

/// A remote execution agent that runs commands for the coordinator.
///
/// Registered at startup; the dispatcher tracks the running-build
/// count against `max_builds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Unique name.
    pub name: String,
    /// Shared secret the agent authenticates with. Opaque to the
    /// coordinator.
    pub credential: String,
    /// Maximum simultaneous builds.
    pub max_builds: usize,
}

impl WorkerDefinition {
    pub fn new(name: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential: credential.into(),
            max_builds: 1,
        }
    }
}
