//! Counting and exclusive resource locks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use buildfarm_core::builder::{LockDefinition, LockMode, LockRequirement, LockScope};

/// A held lock. Dropping the guard releases it on every exit path,
/// including abort of the task holding it.
#[derive(Debug)]
pub struct LockGuard {
    _permits: OwnedSemaphorePermit,
}

/// One materialized lock instance: master-wide, or one worker's copy
/// of a worker-scoped lock.
///
/// Counting acquisition takes one of `capacity` permits; exclusive
/// acquisition takes all of them, which is what excludes counting
/// holders too.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl ResourceLock {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    fn permits(&self, mode: LockMode) -> u32 {
        match mode {
            LockMode::Counting => 1,
            LockMode::Exclusive => self.capacity as u32,
        }
    }

    /// Wait (cooperatively) until the mode's capacity constraint is
    /// satisfiable.
    pub async fn acquire(&self, mode: LockMode) -> LockGuard {
        let permits = self
            .sem
            .clone()
            .acquire_many_owned(self.permits(mode))
            .await
            .expect("lock semaphore never closes");
        LockGuard { _permits: permits }
    }

    /// Non-blocking acquisition. None is a deferral, not an error.
    pub fn try_acquire(&self, mode: LockMode) -> Option<LockGuard> {
        self.sem
            .clone()
            .try_acquire_many_owned(self.permits(mode))
            .ok()
            .map(|permits| LockGuard { _permits: permits })
    }
}

#[derive(Debug)]
struct LockState {
    def: LockDefinition,
    instances: HashMap<String, ResourceLock>,
}

/// All configured locks and their lazily materialized per-scope
/// instances.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: HashMap<String, LockState>,
}

impl LockManager {
    pub fn new(defs: &[LockDefinition]) -> Self {
        let mut manager = Self::default();
        manager.reload(defs);
        manager
    }

    /// Swap in new definitions. Instances (and their current holders)
    /// carry over for locks whose definition is unchanged, so a reload
    /// cannot over-subscribe a lock that in-flight runs still hold.
    pub fn reload(&mut self, defs: &[LockDefinition]) {
        let mut next = HashMap::new();
        for def in defs {
            let state = match self.locks.remove(&def.name) {
                Some(state) if state.def == *def => state,
                _ => LockState {
                    def: def.clone(),
                    instances: HashMap::new(),
                },
            };
            next.insert(def.name.clone(), state);
        }
        self.locks = next;
    }

    fn instance(&mut self, name: &str, worker: &str) -> Option<ResourceLock> {
        let state = self.locks.get_mut(name)?;
        let key = match state.def.scope {
            LockScope::Master => String::new(),
            LockScope::Worker => worker.to_string(),
        };
        let capacity = state.def.max_count;
        Some(
            state
                .instances
                .entry(key)
                .or_insert_with(|| ResourceLock::new(capacity))
                .clone(),
        )
    }

    /// Try to acquire every requirement for a run on `worker`, all or
    /// nothing. Requirements are taken in ascending lock-name order;
    /// the fixed global order keeps overlapping lock sets deadlock-free
    /// across concurrent runs.
    pub fn try_acquire_all(
        &mut self,
        reqs: &[LockRequirement],
        worker: &str,
    ) -> Option<Vec<LockGuard>> {
        let mut sorted: Vec<&LockRequirement> = reqs.iter().collect();
        sorted.sort_by(|a, b| a.lock.cmp(&b.lock));

        let mut guards = Vec::with_capacity(sorted.len());
        for req in sorted {
            let Some(lock) = self.instance(&req.lock, worker) else {
                warn!(lock = %req.lock, "lock not configured, deferring request");
                return None;
            };
            match lock.try_acquire(req.mode) {
                Some(guard) => guards.push(guard),
                // Dropping `guards` releases the prefix we did get.
                None => return None,
            }
        }
        Some(guards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn defs() -> Vec<LockDefinition> {
        vec![
            LockDefinition {
                name: "local".to_string(),
                scope: LockScope::Master,
                max_count: 2,
            },
            LockDefinition {
                name: "deps".to_string(),
                scope: LockScope::Worker,
                max_count: 1,
            },
        ]
    }

    fn counting(name: &str) -> LockRequirement {
        LockRequirement {
            lock: name.to_string(),
            mode: LockMode::Counting,
        }
    }

    fn exclusive(name: &str) -> LockRequirement {
        LockRequirement {
            lock: name.to_string(),
            mode: LockMode::Exclusive,
        }
    }

    #[test]
    fn counting_respects_capacity() {
        let mut manager = LockManager::new(&defs());
        let a = manager.try_acquire_all(&[counting("local")], "w1");
        let b = manager.try_acquire_all(&[counting("local")], "w2");
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(manager.try_acquire_all(&[counting("local")], "w3").is_none());
        drop(a);
        assert!(manager.try_acquire_all(&[counting("local")], "w3").is_some());
    }

    #[test]
    fn exclusive_excludes_counting_holders() {
        let mut manager = LockManager::new(&defs());
        let held = manager.try_acquire_all(&[counting("local")], "w1");
        assert!(manager.try_acquire_all(&[exclusive("local")], "w2").is_none());
        drop(held);
        let exclusive_guard = manager.try_acquire_all(&[exclusive("local")], "w2");
        assert!(exclusive_guard.is_some());
        assert!(manager.try_acquire_all(&[counting("local")], "w1").is_none());
    }

    #[test]
    fn worker_scope_is_independent_per_worker() {
        let mut manager = LockManager::new(&defs());
        let a = manager.try_acquire_all(&[counting("deps")], "w1");
        assert!(a.is_some());
        assert!(manager.try_acquire_all(&[counting("deps")], "w1").is_none());
        assert!(manager.try_acquire_all(&[counting("deps")], "w2").is_some());
    }

    #[test]
    fn failed_acquisition_releases_the_prefix() {
        let mut manager = LockManager::new(&defs());
        let deps_held = manager.try_acquire_all(&[counting("deps")], "w1");
        assert!(deps_held.is_some());
        // "deps" sorts before "local", so the acquisition fails on
        // deps before touching local, leaving local fully free.
        assert!(
            manager
                .try_acquire_all(&[counting("local"), counting("deps")], "w1")
                .is_none()
        );
        assert!(
            manager
                .try_acquire_all(&[exclusive("local")], "w1")
                .is_some()
        );
    }

    #[test]
    fn reload_keeps_holders_of_unchanged_locks() {
        let mut manager = LockManager::new(&defs());
        let _held = manager.try_acquire_all(&[exclusive("deps")], "w1");
        manager.reload(&defs());
        // Still held: the instance survived the reload.
        assert!(manager.try_acquire_all(&[counting("deps")], "w1").is_none());
        assert!(manager.try_acquire_all(&[counting("deps")], "w2").is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_wakes_when_released() {
        let lock = ResourceLock::new(1);
        let guard = lock.acquire(LockMode::Exclusive).await;
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(LockMode::Counting).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn overlapping_lock_sets_never_deadlock() {
        let manager = Arc::new(Mutex::new(LockManager::new(&defs())));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let worker = format!("w{}", i % 2);
                let reqs = [exclusive("deps"), exclusive("local")];
                loop {
                    let guards = manager.lock().unwrap().try_acquire_all(&reqs, &worker);
                    match guards {
                        Some(guards) => {
                            tokio::task::yield_now().await;
                            drop(guards);
                            break;
                        }
                        None => tokio::task::yield_now().await,
                    }
                }
            }));
        }
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("no deadlock")
                .unwrap();
        }
    }
}
