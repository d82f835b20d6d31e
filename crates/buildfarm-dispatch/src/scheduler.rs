//! Scheduler variants: tree-stable debounce, nightly, dependent.
//!
//! Each scheduler is an independent task that watches its input
//! (change events or build results) and emits [`BuildRequest`]s for
//! the dispatcher. Forced builds skip this module entirely: they go
//! straight through [`crate::DispatcherHandle::force_build`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use buildfarm_core::BuildId;
use buildfarm_core::build::{BuildRequest, BuildState};
use buildfarm_core::change::ChangeEvent;

use crate::dispatcher::BuildEvent;

/// Project/branch filter a tree-stable scheduler applies to incoming
/// changes.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    pub project: String,
    pub branch: String,
}

impl ChangeFilter {
    pub fn matches(&self, change: &ChangeEvent) -> bool {
        change.project == self.project && change.branch == self.branch
    }
}

fn request(
    scheduler: &str,
    builder: &str,
    change: Option<ChangeEvent>,
    branch: Option<String>,
    reason: String,
) -> BuildRequest {
    BuildRequest {
        id: BuildId::new(),
        builder: builder.to_string(),
        change,
        branch,
        properties: HashMap::new(),
        reason,
        scheduler: Some(scheduler.to_string()),
        submitted_at: Utc::now(),
    }
}

/// Debounced change-triggered scheduling: the first matching change
/// starts the tree-stable timer, every further match resets it, and
/// only when the tree has been quiet for the whole window does one
/// request per governed builder go out, carrying the newest change.
pub async fn run_tree_stable(
    name: String,
    filter: ChangeFilter,
    stable_for: Duration,
    builders: Vec<String>,
    mut changes: broadcast::Receiver<ChangeEvent>,
    requests: mpsc::Sender<BuildRequest>,
) {
    let mut pending: Option<ChangeEvent> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) if filter.matches(&change) => {
                    debug!(scheduler = %name, revision = %change.revision, "tree unstable, resetting timer");
                    pending = Some(change);
                    deadline = Some(Instant::now() + stable_for);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(scheduler = %name, missed, "change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                deadline = None;
                let Some(change) = pending.take() else { continue };
                info!(scheduler = %name, revision = %change.revision, "tree stable, requesting builds");
                let reason = format!("tree stable for {}s", stable_for.as_secs());
                for builder in &builders {
                    let request = request(&name, builder, Some(change.clone()), None, reason.clone());
                    if requests.send(request).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Fixed time-of-day scheduling for periodic maintenance builds,
/// regardless of change activity.
pub async fn run_nightly(
    name: String,
    hour: u32,
    minute: u32,
    weekday: Option<u32>,
    branch: String,
    builders: Vec<String>,
    requests: mpsc::Sender<BuildRequest>,
) {
    loop {
        let now = Utc::now();
        let next = next_nightly(now, hour, minute, weekday);
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        info!(scheduler = %name, "nightly fire");
        for builder in &builders {
            let request = request(
                &name,
                builder,
                None,
                Some(branch.clone()),
                "nightly build".to_string(),
            );
            if requests.send(request).await.is_err() {
                return;
            }
        }
    }
}

/// First instant strictly after `after` matching hour/minute and the
/// optional weekday (0 = Monday .. 6 = Sunday).
fn next_nightly(
    after: DateTime<Utc>,
    hour: u32,
    minute: u32,
    weekday: Option<u32>,
) -> DateTime<Utc> {
    let mut date = after.date_naive();
    if at(date, hour, minute) <= after {
        date = next_day(date);
    }
    if let Some(target) = weekday {
        while date.weekday().num_days_from_monday() != target {
            date = next_day(date);
        }
    }
    at(date, hour, minute)
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, minute, 0)
        .expect("hour/minute validated at configuration load")
        .and_utc()
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().expect("date overflow")
}

/// Fan-out scheduling: when one of the upstream builders completes
/// successfully, request the governed builders with the same change.
pub async fn run_dependent(
    name: String,
    upstream: Vec<String>,
    builders: Vec<String>,
    mut events: broadcast::Receiver<BuildEvent>,
    requests: mpsc::Sender<BuildRequest>,
) {
    loop {
        match events.recv().await {
            Ok(BuildEvent::Finished { run })
                if run.state == BuildState::Success && upstream.contains(&run.builder) =>
            {
                info!(scheduler = %name, upstream = %run.builder, "upstream succeeded, requesting builds");
                let reason = format!("after '{}'", run.builder);
                for builder in &builders {
                    let request = request(
                        &name,
                        builder,
                        run.change.clone(),
                        Some(run.branch.clone()),
                        reason.clone(),
                    );
                    if requests.send(request).await.is_err() {
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(scheduler = %name, missed, "build event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn change(project: &str, revision: &str) -> ChangeEvent {
        ChangeEvent {
            project: project.to_string(),
            branch: "master".to_string(),
            revision: revision.to_string(),
            author: "David <d@example.org>".to_string(),
            comment: "a change".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_yields_one_request_per_builder() {
        let (change_tx, change_rx) = broadcast::channel(64);
        let (request_tx, mut request_rx) = mpsc::channel(64);
        tokio::spawn(run_tree_stable(
            "automatic".to_string(),
            ChangeFilter {
                project: "clementine".to_string(),
                branch: "master".to_string(),
            },
            Duration::from_secs(120),
            vec!["Linux Release".to_string(), "Linux Debug".to_string()],
            change_rx,
            request_tx,
        ));

        for i in 1..=5 {
            change_tx.send(change("clementine", &format!("rev{i}"))).unwrap();
            tokio::task::yield_now().await;
        }

        let first = request_rx.recv().await.unwrap();
        let second = request_rx.recv().await.unwrap();
        assert_eq!(first.builder, "Linux Release");
        assert_eq!(second.builder, "Linux Debug");
        assert_eq!(first.change.as_ref().unwrap().revision, "rev5");
        assert_eq!(second.change.as_ref().unwrap().revision, "rev5");
        assert_eq!(first.scheduler.as_deref(), Some("automatic"));

        // One debounce window, one batch: nothing else is pending.
        tokio::task::yield_now().await;
        assert!(request_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_out_changes_do_not_trigger() {
        let (change_tx, change_rx) = broadcast::channel(64);
        let (request_tx, mut request_rx) = mpsc::channel(64);
        tokio::spawn(run_tree_stable(
            "automatic".to_string(),
            ChangeFilter {
                project: "clementine".to_string(),
                branch: "master".to_string(),
            },
            Duration::from_secs(120),
            vec!["Linux Release".to_string()],
            change_rx,
            request_tx,
        ));

        change_tx.send(change("website", "rev1")).unwrap();
        let mut off_branch = change("clementine", "rev2");
        off_branch.branch = "qt5".to_string();
        change_tx.send(off_branch).unwrap();
        drop(change_tx);

        // The task exits without emitting anything.
        assert!(request_rx.recv().await.is_none());
    }

    #[test]
    fn next_nightly_rolls_to_tomorrow_when_past() {
        let after = Utc.with_ymd_and_hms(2018, 6, 6, 12, 0, 0).unwrap();
        let next = next_nightly(after, 10, 0, None);
        assert_eq!(next, Utc.with_ymd_and_hms(2018, 6, 7, 10, 0, 0).unwrap());
    }

    #[test]
    fn next_nightly_fires_today_when_still_ahead() {
        let after = Utc.with_ymd_and_hms(2018, 6, 6, 8, 0, 0).unwrap();
        let next = next_nightly(after, 10, 0, None);
        assert_eq!(next, Utc.with_ymd_and_hms(2018, 6, 6, 10, 0, 0).unwrap());
    }

    #[test]
    fn next_nightly_honors_the_weekday() {
        // 2018-06-06 was a Wednesday; 6 = Sunday.
        let after = Utc.with_ymd_and_hms(2018, 6, 6, 12, 0, 0).unwrap();
        let next = next_nightly(after, 10, 0, Some(6));
        assert_eq!(next, Utc.with_ymd_and_hms(2018, 6, 10, 10, 0, 0).unwrap());
    }

    #[test]
    fn next_nightly_skips_a_week_when_today_just_fired() {
        // A Sunday, right at the scheduled minute.
        let after = Utc.with_ymd_and_hms(2018, 6, 10, 10, 0, 0).unwrap();
        let next = next_nightly(after, 10, 0, Some(6));
        assert_eq!(next, Utc.with_ymd_and_hms(2018, 6, 17, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn dependent_fires_on_upstream_success_only() {
        use buildfarm_core::build::BuildRun;
        use buildfarm_core::step::StepResult;

        fn finished(builder: &str, state: BuildState) -> BuildEvent {
            BuildEvent::Finished {
                run: BuildRun {
                    id: BuildId::new(),
                    builder: builder.to_string(),
                    worker: "zaphod".to_string(),
                    change: Some(ChangeEvent {
                        project: "clementine".to_string(),
                        branch: "master".to_string(),
                        revision: "rev9".to_string(),
                        author: "D".to_string(),
                        comment: "c".to_string(),
                        at: Utc::now(),
                    }),
                    branch: "master".to_string(),
                    state,
                    steps: Vec::<StepResult>::new(),
                    properties: HashMap::new(),
                    started_at: Utc::now(),
                    finished_at: Some(Utc::now()),
                    artifact: None,
                },
            }
        }

        let (event_tx, event_rx) = broadcast::channel(64);
        let (request_tx, mut request_rx) = mpsc::channel(64);
        tokio::spawn(run_dependent(
            "packages".to_string(),
            vec!["Linux Release".to_string()],
            vec!["Deb Focal 64-bit".to_string()],
            event_rx,
            request_tx,
        ));

        event_tx
            .send(finished(
                "Linux Release",
                BuildState::Failure {
                    step: "compile".to_string(),
                },
            ))
            .unwrap();
        event_tx
            .send(finished("Unrelated Builder", BuildState::Success))
            .unwrap();
        event_tx
            .send(finished("Linux Release", BuildState::Success))
            .unwrap();
        drop(event_tx);

        let fired = request_rx.recv().await.unwrap();
        assert_eq!(fired.builder, "Deb Focal 64-bit");
        assert_eq!(fired.change.unwrap().revision, "rev9");
        assert!(request_rx.recv().await.is_none());
    }
}
