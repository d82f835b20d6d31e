//! Edge-triggered failure notifications.

use std::collections::HashMap;

use buildfarm_core::BuildId;
use buildfarm_core::build::{BuildRun, BuildState};

/// One "builder started failing" event.
#[derive(Debug, Clone)]
pub struct BuildNotification {
    pub builder: String,
    pub run: BuildId,
    pub failing_step: Option<String>,
}

/// Tracks each builder's last terminal outcome and reports only the
/// passing-to-failing edge, so a builder that stays red does not
/// produce a notification storm.
#[derive(Debug, Default)]
pub struct Notifier {
    last_succeeded: HashMap<String, bool>,
}

impl Notifier {
    /// Record a terminal run. Returns a notification when this run
    /// flips its builder from passing (or never seen) to failing.
    pub fn observe(&mut self, run: &BuildRun) -> Option<BuildNotification> {
        let succeeded = match run.state {
            BuildState::Success => true,
            BuildState::Failure { .. } => false,
            // Aborts say nothing about the tree's health.
            _ => return None,
        };
        let was_passing = self
            .last_succeeded
            .insert(run.builder.clone(), succeeded)
            .unwrap_or(true);
        if !succeeded && was_passing {
            Some(BuildNotification {
                builder: run.builder.clone(),
                run: run.id,
                failing_step: run.failing_step().map(str::to_string),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn run(builder: &str, state: BuildState) -> BuildRun {
        BuildRun {
            id: BuildId::new(),
            builder: builder.to_string(),
            worker: "zaphod".to_string(),
            change: None,
            branch: "master".to_string(),
            state,
            steps: Vec::new(),
            properties: HashMap::new(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            artifact: None,
        }
    }

    fn failure() -> BuildState {
        BuildState::Failure {
            step: "compile".to_string(),
        }
    }

    #[test]
    fn first_failure_notifies() {
        let mut notifier = Notifier::default();
        let notification = notifier.observe(&run("Linux", failure())).unwrap();
        assert_eq!(notification.failing_step.as_deref(), Some("compile"));
    }

    #[test]
    fn repeated_failures_stay_quiet() {
        let mut notifier = Notifier::default();
        assert!(notifier.observe(&run("Linux", failure())).is_some());
        assert!(notifier.observe(&run("Linux", failure())).is_none());
        assert!(notifier.observe(&run("Linux", failure())).is_none());
    }

    #[test]
    fn recovery_rearms_the_edge() {
        let mut notifier = Notifier::default();
        assert!(notifier.observe(&run("Linux", failure())).is_some());
        assert!(notifier.observe(&run("Linux", BuildState::Success)).is_none());
        assert!(notifier.observe(&run("Linux", failure())).is_some());
    }

    #[test]
    fn aborts_do_not_flip_the_edge() {
        let mut notifier = Notifier::default();
        assert!(notifier.observe(&run("Linux", BuildState::Aborted)).is_none());
        assert!(notifier.observe(&run("Linux", failure())).is_some());
        assert!(notifier.observe(&run("Linux", BuildState::Aborted)).is_none());
        assert!(notifier.observe(&run("Linux", failure())).is_none());
    }

    #[test]
    fn builders_are_tracked_independently() {
        let mut notifier = Notifier::default();
        assert!(notifier.observe(&run("Linux", failure())).is_some());
        assert!(notifier.observe(&run("Mac", failure())).is_some());
    }
}
