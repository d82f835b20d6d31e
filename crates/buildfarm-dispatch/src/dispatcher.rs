//! The coordinator: queues, assignment, run tracking.
//!
//! One task owns every piece of mutable shared state and applies all
//! transitions (assignment, completion, abort, reload) sequentially.
//! Build runs, schedulers, and pollers are separate tasks that only
//! talk to it through messages, so no counter or lock table is ever
//! touched by two writers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use buildfarm_config::FarmConfig;
use buildfarm_core::build::{BuildRequest, BuildRun, BuildState};
use buildfarm_core::builder::BuilderDefinition;
use buildfarm_core::runner::CommandRunner;
use buildfarm_core::step::{StepAction, StepResult, StepStatus};
use buildfarm_core::{BuildId, Error, Result};

use crate::lock::{LockGuard, LockManager};
use crate::notify::{BuildNotification, Notifier};
use crate::pool::WorkerPool;
use crate::runner::SequenceRunner;

/// Terminal runs kept queryable before the oldest are dropped.
const ARCHIVE_LIMIT: usize = 256;

/// Events published to schedulers, notification sinks, and log taps.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    Started {
        id: BuildId,
        builder: String,
        worker: String,
    },
    Finished {
        run: BuildRun,
    },
    /// Edge-triggered: fired when a builder goes from passing (or
    /// unknown) to failing, not on every failing run.
    FailureEdge(BuildNotification),
}

/// Point-in-time view of one builder.
#[derive(Debug, Clone, Serialize)]
pub struct BuilderStatus {
    pub name: String,
    pub queued: usize,
    pub running: Vec<BuildId>,
    /// Most recently finished run.
    pub last: Option<BuildRun>,
}

enum Msg {
    Submit(BuildRequest),
    /// Re-run the scheduling pass (sent once a finished run's task has
    /// fully terminated and its lock guards are dropped).
    Pass,
    Force {
        request: BuildRequest,
        reply: oneshot::Sender<Result<BuildId>>,
    },
    RunUpdate(BuildRun),
    Abort {
        id: BuildId,
        reply: oneshot::Sender<Result<()>>,
    },
    RunStatus {
        id: BuildId,
        reply: oneshot::Sender<Result<BuildRun>>,
    },
    BuilderStatus {
        name: String,
        reply: oneshot::Sender<Result<BuilderStatus>>,
    },
    Reload {
        config: Arc<FarmConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct ActiveRun {
    run: BuildRun,
    task: JoinHandle<()>,
}

/// The coordinator task's state. Constructed through [`Dispatcher::spawn`].
pub struct Dispatcher {
    config: Arc<FarmConfig>,
    registry: HashMap<String, Arc<BuilderDefinition>>,
    pool: WorkerPool,
    locks: LockManager,
    queues: HashMap<String, VecDeque<BuildRequest>>,
    active: HashMap<BuildId, ActiveRun>,
    archive: HashMap<BuildId, BuildRun>,
    archive_order: VecDeque<BuildId>,
    notifier: Notifier,
    command_runner: Arc<dyn CommandRunner>,
    tx: mpsc::Sender<Msg>,
    events: broadcast::Sender<BuildEvent>,
    config_tx: watch::Sender<Arc<FarmConfig>>,
}

/// Cheap, cloneable handle other tasks use to talk to the coordinator.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Msg>,
    events: broadcast::Sender<BuildEvent>,
    config: watch::Receiver<Arc<FarmConfig>>,
}

impl Dispatcher {
    /// Start the coordinator task.
    pub fn spawn(
        config: Arc<FarmConfig>,
        command_runner: Arc<dyn CommandRunner>,
    ) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);
        let (config_tx, config_rx) = watch::channel(config.clone());

        let dispatcher = Dispatcher {
            registry: build_registry(&config),
            pool: WorkerPool::new(&config.workers),
            locks: LockManager::new(&config.locks),
            queues: HashMap::new(),
            active: HashMap::new(),
            archive: HashMap::new(),
            archive_order: VecDeque::new(),
            notifier: Notifier::default(),
            command_runner,
            tx: tx.clone(),
            events: events.clone(),
            config_tx,
            config,
        };
        let handle = DispatcherHandle {
            tx,
            events,
            config: config_rx,
        };
        let task = tokio::spawn(dispatcher.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Submit(request) => self.submit(request),
                Msg::Pass => self.schedule_pass(),
                Msg::Force { request, reply } => {
                    let _ = reply.send(self.force(request));
                }
                Msg::RunUpdate(run) => self.run_update(run),
                Msg::Abort { id, reply } => {
                    let _ = reply.send(self.abort(id));
                }
                Msg::RunStatus { id, reply } => {
                    let _ = reply.send(self.run_status(id));
                }
                Msg::BuilderStatus { name, reply } => {
                    let _ = reply.send(self.builder_status(&name));
                }
                Msg::Reload { config, reply } => {
                    let _ = reply.send(self.reload(config));
                }
            }
        }
    }

    fn submit(&mut self, request: BuildRequest) {
        let Some(def) = self.registry.get(&request.builder) else {
            warn!(builder = %request.builder, "dropping request for unknown builder");
            return;
        };
        if request.scheduler.is_some() && !def.auto {
            debug!(
                builder = %request.builder,
                "builder is not auto-eligible, ignoring scheduled request"
            );
            return;
        }
        self.enqueue(request);
        self.schedule_pass();
    }

    fn force(&mut self, request: BuildRequest) -> Result<BuildId> {
        if !self.registry.contains_key(&request.builder) {
            return Err(Error::UnknownBuilder(request.builder));
        }
        let id = request.id;
        info!(builder = %request.builder, %id, reason = %request.reason, "force build");
        self.enqueue(request);
        self.schedule_pass();
        Ok(id)
    }

    fn enqueue(&mut self, request: BuildRequest) {
        let queue = self.queues.entry(request.builder.clone()).or_default();
        // Coalesce: a newer request from the same scheduler replaces
        // the queued one instead of piling up behind it.
        if let Some(scheduler) = request.scheduler.clone() {
            if let Some(existing) = queue
                .iter_mut()
                .find(|r| r.scheduler.as_deref() == Some(scheduler.as_str()))
            {
                debug!(builder = %request.builder, scheduler = %scheduler, "coalescing queued request");
                *existing = request;
                return;
            }
        }
        queue.push_back(request);
    }

    /// One scheduling pass: per builder (FIFO within each), start
    /// whatever has an idle worker and satisfiable locks. Anything
    /// else stays queued for the next pass; nothing here blocks.
    fn schedule_pass(&mut self) {
        let mut names: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();

        for name in names {
            loop {
                let Some(def) = self.registry.get(&name).cloned() else {
                    break;
                };
                if self.queues.get(&name).is_none_or(|q| q.is_empty()) {
                    break;
                }
                let Some(worker) = self.pool.find_idle(&def).map(str::to_string) else {
                    break;
                };
                let Some(guards) = self.locks.try_acquire_all(&def.locks, &worker) else {
                    debug!(builder = %name, "locks unavailable, deferring");
                    break;
                };
                let Some(request) = self.queues.get_mut(&name).and_then(|q| q.pop_front()) else {
                    break;
                };
                match self.pool.start(&worker) {
                    Ok(()) => self.start_run(request, def, worker, guards),
                    Err(error) => {
                        warn!(%error, "worker claim failed after idle check");
                        if let Some(queue) = self.queues.get_mut(&name) {
                            queue.push_front(request);
                        }
                        break;
                    }
                }
            }
        }
    }

    fn start_run(
        &mut self,
        request: BuildRequest,
        def: Arc<BuilderDefinition>,
        worker: String,
        guards: Vec<LockGuard>,
    ) {
        let branch = request
            .effective_branch()
            .map(str::to_string)
            .unwrap_or_else(|| self.default_branch_for(&def));
        let run = BuildRun {
            id: request.id,
            builder: def.name.clone(),
            worker,
            change: request.change,
            branch,
            state: BuildState::Pending,
            steps: def
                .steps
                .iter()
                .map(|s| StepResult::pending(s.name.clone()))
                .collect(),
            properties: request.properties,
            started_at: Utc::now(),
            finished_at: None,
            artifact: None,
        };

        info!(builder = %run.builder, worker = %run.worker, id = %run.id, "starting build");
        let _ = self.events.send(BuildEvent::Started {
            id: run.id,
            builder: run.builder.clone(),
            worker: run.worker.clone(),
        });

        let sequence = SequenceRunner::new(self.command_runner.clone(), self.config.clone());
        let (updates_tx, mut updates_rx) = mpsc::channel(16);
        let main_tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = updates_rx.recv().await {
                if main_tx.send(Msg::RunUpdate(snapshot)).await.is_err() {
                    break;
                }
            }
        });

        let task = tokio::spawn({
            let run = run.clone();
            async move {
                // Guards live inside the run task: dropping them on
                // completion or abort releases the locks either way.
                let _guards = guards;
                sequence.execute(run, def, updates_tx).await;
            }
        });
        self.active.insert(run.id, ActiveRun { run, task });
    }

    /// Default branch for a forced/timed build with no override: the
    /// branch of the first source the builder checks out.
    fn default_branch_for(&self, def: &BuilderDefinition) -> String {
        def.steps
            .iter()
            .find_map(|step| match &step.action {
                StepAction::Checkout { source, .. } => {
                    self.config.source(source).map(|s| s.branch.clone())
                }
                _ => None,
            })
            .unwrap_or_else(|| "master".to_string())
    }

    fn run_update(&mut self, run: BuildRun) {
        if !self.active.contains_key(&run.id) {
            // Raced with an abort; the archived state wins.
            return;
        }
        if run.state.is_terminal() {
            if let Some(active) = self.active.remove(&run.id) {
                self.pass_when_done(active.task);
            }
            self.finish_run(run);
            self.schedule_pass();
        } else if let Some(active) = self.active.get_mut(&run.id) {
            active.run = run;
        }
    }

    /// The run task drops its lock guards only once it has fully
    /// terminated, which can be just after its final status message.
    /// Schedule another pass at that point so a request deferred on
    /// those locks is picked up.
    fn pass_when_done(&self, task: JoinHandle<()>) {
        let main_tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = task.await;
            let _ = main_tx.send(Msg::Pass).await;
        });
    }

    fn finish_run(&mut self, run: BuildRun) {
        info!(builder = %run.builder, id = %run.id, state = ?run.state, "build finished");
        self.pool.finish(&run.worker);
        if let Some(notification) = self.notifier.observe(&run) {
            warn!(
                builder = %notification.builder,
                step = ?notification.failing_step,
                "builder started failing"
            );
            let _ = self.events.send(BuildEvent::FailureEdge(notification));
        }
        let _ = self.events.send(BuildEvent::Finished { run: run.clone() });

        let id = run.id;
        self.archive.insert(id, run);
        self.archive_order.push_back(id);
        while self.archive_order.len() > ARCHIVE_LIMIT {
            if let Some(oldest) = self.archive_order.pop_front() {
                self.archive.remove(&oldest);
            }
        }
    }

    fn abort(&mut self, id: BuildId) -> Result<()> {
        if let Some(active) = self.active.remove(&id) {
            info!(%id, builder = %active.run.builder, "aborting build");
            active.task.abort();
            self.pass_when_done(active.task);
            let mut run = active.run;
            run.state = BuildState::Aborted;
            run.finished_at = Some(Utc::now());
            for step in &mut run.steps {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Skipped;
                }
            }
            self.finish_run(run);
            self.schedule_pass();
            return Ok(());
        }
        if self.archive.contains_key(&id) {
            // Stopping an already-terminal run is a no-op.
            return Ok(());
        }
        for queue in self.queues.values_mut() {
            if let Some(position) = queue.iter().position(|r| r.id == id) {
                queue.remove(position);
                return Ok(());
            }
        }
        Err(Error::UnknownBuild(id.to_string()))
    }

    fn run_status(&self, id: BuildId) -> Result<BuildRun> {
        if let Some(active) = self.active.get(&id) {
            return Ok(active.run.clone());
        }
        if let Some(run) = self.archive.get(&id) {
            return Ok(run.clone());
        }
        for queue in self.queues.values() {
            if let Some(request) = queue.iter().find(|r| r.id == id) {
                return Ok(queued_run_view(request));
            }
        }
        Err(Error::UnknownBuild(id.to_string()))
    }

    fn builder_status(&self, name: &str) -> Result<BuilderStatus> {
        if !self.registry.contains_key(name) {
            return Err(Error::UnknownBuilder(name.to_string()));
        }
        let running: Vec<BuildId> = self
            .active
            .values()
            .filter(|active| active.run.builder == name)
            .map(|active| active.run.id)
            .collect();
        let last = self
            .archive
            .values()
            .filter(|run| run.builder == name)
            .max_by_key(|run| run.finished_at)
            .cloned();
        Ok(BuilderStatus {
            name: name.to_string(),
            queued: self.queues.get(name).map(|q| q.len()).unwrap_or(0),
            running,
            last,
        })
    }

    /// Swap in a new configuration without touching in-flight runs.
    /// Queued requests for builders that no longer exist are dropped.
    fn reload(&mut self, config: Arc<FarmConfig>) -> Result<()> {
        info!(
            builders = config.builders.len(),
            workers = config.workers.len(),
            "applying new configuration"
        );
        self.registry = build_registry(&config);
        self.pool.reload(&config.workers);
        self.locks.reload(&config.locks);

        let known: HashSet<String> = self.registry.keys().cloned().collect();
        self.queues.retain(|name, _| {
            if known.contains(name) {
                true
            } else {
                warn!(builder = %name, "dropping queued requests for removed builder");
                false
            }
        });

        self.config = config.clone();
        let _ = self.config_tx.send(config);
        self.schedule_pass();
        Ok(())
    }
}

impl DispatcherHandle {
    /// Enqueue a scheduler-originated request. Fire and forget; the
    /// dispatcher applies the auto-eligibility gate and coalescing.
    pub async fn submit(&self, request: BuildRequest) {
        let _ = self.tx.send(Msg::Submit(request)).await;
    }

    /// A sender that feeds [`submit`](Self::submit), for scheduler
    /// tasks that only know about channels.
    pub fn request_sender(&self) -> mpsc::Sender<BuildRequest> {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                handle.submit(request).await;
            }
        });
        tx
    }

    /// Synchronously enqueue a forced build, bypassing auto-eligibility
    /// and debounce. Returns the id to poll status with.
    pub async fn force_build(
        &self,
        builder: &str,
        branch: Option<String>,
        properties: HashMap<String, String>,
        reason: Option<String>,
    ) -> Result<BuildId> {
        let request = BuildRequest {
            id: BuildId::new(),
            builder: builder.to_string(),
            change: None,
            branch,
            properties,
            reason: reason.unwrap_or_else(|| "force build".to_string()),
            scheduler: None,
            submitted_at: Utc::now(),
        };
        self.call(|reply| Msg::Force { request, reply }).await?
    }

    /// Cancel a queued or running build. Idempotent for terminal runs.
    pub async fn abort(&self, id: BuildId) -> Result<()> {
        self.call(|reply| Msg::Abort { id, reply }).await?
    }

    pub async fn run_status(&self, id: BuildId) -> Result<BuildRun> {
        self.call(|reply| Msg::RunStatus { id, reply }).await?
    }

    pub async fn builder_status(&self, name: &str) -> Result<BuilderStatus> {
        let name = name.to_string();
        self.call(|reply| Msg::BuilderStatus { name, reply }).await?
    }

    /// Atomically swap in a new configuration.
    pub async fn reload(&self, config: FarmConfig) -> Result<()> {
        let config = Arc::new(config);
        self.call(|reply| Msg::Reload { config, reply }).await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    /// Watch for configuration swaps (used to restart pollers and
    /// schedulers after a reload).
    pub fn config_watch(&self) -> watch::Receiver<Arc<FarmConfig>> {
        self.config.clone()
    }

    pub fn current_config(&self) -> Arc<FarmConfig> {
        self.config.borrow().clone()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Msg) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Internal("dispatcher unavailable".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("dispatcher unavailable".to_string()))
    }
}

fn build_registry(config: &FarmConfig) -> HashMap<String, Arc<BuilderDefinition>> {
    config
        .builders
        .iter()
        .map(|def| (def.name.clone(), Arc::new(def.clone())))
        .collect()
}

/// Status view for a request still waiting in the queue.
fn queued_run_view(request: &BuildRequest) -> BuildRun {
    BuildRun {
        id: request.id,
        builder: request.builder.clone(),
        worker: String::new(),
        change: request.change.clone(),
        branch: request
            .effective_branch()
            .unwrap_or_default()
            .to_string(),
        state: BuildState::Pending,
        steps: Vec::new(),
        properties: request.properties.clone(),
        started_at: request.submitted_at,
        finished_at: None,
        artifact: None,
    }
}
