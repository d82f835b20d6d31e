//! Build requests and runs.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::ChangeEvent;
use crate::id::BuildId;
use crate::step::StepResult;

/// A queued wish for one build of one builder.
///
/// Created by a scheduler or a force-build call; consumed by the
/// dispatcher once a worker slot and the required locks are free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildId,
    pub builder: String,
    /// The change that triggered this request; None for forced and
    /// timed builds.
    pub change: Option<ChangeEvent>,
    /// Branch override; falls back to the change's branch.
    pub branch: Option<String>,
    pub properties: HashMap<String, String>,
    /// Why this request exists ("tree stable", "force build", ...).
    pub reason: String,
    /// Name of the scheduler that emitted it, used for coalescing.
    /// None for forced builds.
    pub scheduler: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl BuildRequest {
    /// Branch this request wants built, if it names one.
    pub fn effective_branch(&self) -> Option<&str> {
        self.branch
            .as_deref()
            .or_else(|| self.change.as_ref().map(|c| c.branch.as_str()))
    }
}

/// Intermediate and terminal states of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildState {
    Pending,
    Running,
    Success,
    /// A halting step failed.
    Failure { step: String },
    /// Cancelled from outside.
    Aborted,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Success | BuildState::Failure { .. } | BuildState::Aborted
        )
    }
}

/// A build in progress or archived: one builder, one worker, at most
/// one triggering change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRun {
    pub id: BuildId,
    pub builder: String,
    pub worker: String,
    pub change: Option<ChangeEvent>,
    pub branch: String,
    pub state: BuildState,
    pub steps: Vec<StepResult>,
    /// Captured step outputs ("artifact-name", ...), visible to later
    /// steps through interpolation and to status queries.
    pub properties: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Publication result, when a publish step ran.
    pub artifact: Option<Artifact>,
}

impl BuildRun {
    /// Name of the step that failed, for terminal failure states.
    pub fn failing_step(&self) -> Option<&str> {
        match &self.state {
            BuildState::Failure { step } => Some(step),
            _ => None,
        }
    }
}

/// A published build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Filesystem destination under the upload base.
    pub path: PathBuf,
    /// Public URL the artifact is reachable at.
    pub url: String,
}
