//! Builder registry and worker pool.

use std::collections::HashMap;

use buildfarm_core::builder::BuilderDefinition;
use buildfarm_core::worker::WorkerDefinition;
use buildfarm_core::{Error, Result};

#[derive(Debug)]
struct WorkerSlot {
    def: WorkerDefinition,
    running: usize,
}

/// Tracks each worker's running-build count against its cap.
///
/// Builder-to-worker assignment is static: a builder runs on exactly
/// the worker its definition names, never on a dynamically matched
/// one.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: HashMap<String, WorkerSlot>,
}

impl WorkerPool {
    pub fn new(defs: &[WorkerDefinition]) -> Self {
        let mut pool = Self::default();
        pool.reload(defs);
        pool
    }

    /// Swap in new definitions, keeping running counts for workers
    /// that survive the reload.
    pub fn reload(&mut self, defs: &[WorkerDefinition]) {
        let mut next = HashMap::new();
        for def in defs {
            let running = self
                .workers
                .remove(&def.name)
                .map(|slot| slot.running)
                .unwrap_or(0);
            next.insert(
                def.name.clone(),
                WorkerSlot {
                    def: def.clone(),
                    running,
                },
            );
        }
        self.workers = next;
    }

    /// The statically assigned worker for `builder`, if it currently
    /// has a free build slot.
    pub fn find_idle(&self, builder: &BuilderDefinition) -> Option<&str> {
        let slot = self.workers.get(&builder.worker)?;
        (slot.running < slot.def.max_builds).then_some(slot.def.name.as_str())
    }

    /// Claim a build slot. Callers check [`find_idle`] first; claiming
    /// past the cap is an invariant breach.
    ///
    /// [`find_idle`]: WorkerPool::find_idle
    pub fn start(&mut self, worker: &str) -> Result<()> {
        let slot = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| Error::Internal(format!("unknown worker '{worker}'")))?;
        if slot.running >= slot.def.max_builds {
            return Err(Error::Internal(format!(
                "worker '{worker}' is already at capacity"
            )));
        }
        slot.running += 1;
        Ok(())
    }

    /// Release a build slot on any terminal state.
    pub fn finish(&mut self, worker: &str) {
        if let Some(slot) = self.workers.get_mut(worker) {
            slot.running = slot.running.saturating_sub(1);
        }
    }

    pub fn running(&self, worker: &str) -> usize {
        self.workers.get(worker).map(|slot| slot.running).unwrap_or(0)
    }
}
