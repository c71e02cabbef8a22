//! Worker contexts spawned on behalf of the main context.
//!
//! The registry owns every worker it spawns until that worker is stopped.
//! Its id-to-handle map is the only state shared across contexts, and it is
//! only ever touched under its mutex, never across an await.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ContextHandle, ContextId, ContextSpawner, ContextUnit};
use crate::engine::ContextInit;
use crate::error::Result;

/// Registry-unique worker identifier. Never reused after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl WorkerId {
    pub fn context_id(self) -> ContextId {
        ContextId::Worker(self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A running worker: its context and the thread behind it.
struct WorkerHandle {
    id: WorkerId,
    context: ContextHandle,
    unit: ContextUnit,
}

impl WorkerHandle {
    /// Drain the worker, then wait for its thread and output forwarding to finish.
    async fn shutdown(self) -> Result<()> {
        self.context.stop().await?;
        self.unit.reap().await;
        tracing::debug!("Worker {} stopped", self.id);
        Ok(())
    }
}

pub struct WorkerRegistry {
    spawner: Arc<ContextSpawner>,
    workers: Mutex<FxHashMap<WorkerId, WorkerHandle>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    pub(crate) fn new(spawner: Arc<ContextSpawner>) -> Self {
        Self {
            spawner,
            workers: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    // No code panics while holding the lock, so a poisoned map is still consistent.
    fn workers(&self) -> MutexGuard<'_, FxHashMap<WorkerId, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a worker and wait for it to report ready.
    pub async fn spawn(&self, argv: Vec<String>, payload: Value) -> Result<WorkerId> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context_id = id.context_id();

        tracing::debug!("Spawning worker {} with {} args", id, argv.len());
        let (context, unit) = self
            .spawner
            .spawn(ContextInit {
                id: context_id,
                kind: context_id.kind(),
                argv,
                payload,
            })
            .await?;

        self.workers().insert(id, WorkerHandle { id, context, unit });
        Ok(id)
    }

    /// Handle for submitting actions to a worker.
    pub fn context(&self, id: WorkerId) -> Option<ContextHandle> {
        self.workers().get(&id).map(|worker| worker.context.clone())
    }

    /// Ids of the registered workers, in spawn order.
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.workers().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers().is_empty()
    }

    /// Drain and terminate a worker. Unknown ids are a no-op success.
    pub async fn stop(&self, id: WorkerId) -> Result<()> {
        // Removing first means only one caller ever shuts a worker down.
        let Some(worker) = self.workers().remove(&id) else {
            tracing::debug!("Stop requested for unknown worker {}", id);
            return Ok(());
        };
        worker.shutdown().await
    }

    /// Stop every registered worker, one after another.
    pub async fn stop_all(&self) -> Result<()> {
        let mut workers: Vec<_> = self.workers().drain().map(|(_, worker)| worker).collect();
        workers.sort_by_key(|worker| worker.id);

        tracing::debug!("Stopping {} workers", workers.len());
        let mut first_error = None;
        for worker in workers {
            let id = worker.id;
            if let Err(e) = worker.shutdown().await {
                tracing::warn!("Failed to stop worker {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }

        // Let cleanup scheduled by the terminations settle.
        tokio::task::yield_now().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.ids())
            .finish()
    }
}
