//! Change events emitted by source pollers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A new revision observed on a watched repository.
///
/// Immutable once created. A poller never emits the same
/// (project, revision) pair twice; events for one branch arrive in
/// revision order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Project key of the repository this change belongs to.
    pub project: String,
    pub branch: String,
    /// Full revision id (a git commit sha).
    pub revision: String,
    pub author: String,
    /// First line of the commit message.
    pub comment: String,
    pub at: DateTime<Utc>,
}
