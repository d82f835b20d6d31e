//! Poller and scheduler task supervision.
//!
//! Pollers and schedulers are derived from the configuration, so a
//! reload tears the whole set down and spawns it afresh from the new
//! value. The dispatcher itself (and its in-flight runs) is untouched.

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

use buildfarm_config::{FarmConfig, SchedulerKind};
use buildfarm_core::change::ChangeEvent;
use buildfarm_dispatch::DispatcherHandle;
use buildfarm_dispatch::scheduler::{self, ChangeFilter};
use buildfarm_vcs::{ChangeSource, GitPoller, run_poller};

pub async fn run(dispatcher: DispatcherHandle) {
    let mut config_rx = dispatcher.config_watch();
    loop {
        let config = config_rx.borrow_and_update().clone();
        let mut tasks = JoinSet::new();
        spawn_all(&config, &dispatcher, &mut tasks);

        // Park until the next reload, then rebuild everything.
        if config_rx.changed().await.is_err() {
            break;
        }
        info!("configuration changed, restarting pollers and schedulers");
        tasks.abort_all();
    }
}

fn spawn_all(config: &FarmConfig, dispatcher: &DispatcherHandle, tasks: &mut JoinSet<()>) {
    let (changes_tx, _) = broadcast::channel::<ChangeEvent>(256);
    let requests = dispatcher.request_sender();

    for source in &config.sources {
        let poller = match GitPoller::new(
            source.project.clone(),
            source.url.clone(),
            source.branch.clone(),
            source.poll_interval,
            &config.state_dir,
        ) {
            Ok(poller) => poller,
            Err(error) => {
                warn!(project = %source.project, %error, "cannot start poller");
                continue;
            }
        };
        info!(project = %poller.project(), "watching repository");
        let tx = changes_tx.clone();
        tasks.spawn(run_poller(poller, tx));
    }

    for sched in &config.schedulers {
        match &sched.kind {
            SchedulerKind::TreeStable {
                project,
                branch,
                stable_for,
            } => {
                tasks.spawn(scheduler::run_tree_stable(
                    sched.name.clone(),
                    ChangeFilter {
                        project: project.clone(),
                        branch: branch.clone(),
                    },
                    *stable_for,
                    sched.builders.clone(),
                    changes_tx.subscribe(),
                    requests.clone(),
                ));
            }
            SchedulerKind::Nightly {
                hour,
                minute,
                weekday,
                branch,
            } => {
                tasks.spawn(scheduler::run_nightly(
                    sched.name.clone(),
                    *hour,
                    *minute,
                    *weekday,
                    branch.clone(),
                    sched.builders.clone(),
                    requests.clone(),
                ));
            }
            SchedulerKind::Dependent { upstream } => {
                tasks.spawn(scheduler::run_dependent(
                    sched.name.clone(),
                    upstream.clone(),
                    sched.builders.clone(),
                    dispatcher.subscribe(),
                    requests.clone(),
                ));
            }
        }
        info!(scheduler = %sched.name, builders = sched.builders.len(), "scheduler up");
    }
}
