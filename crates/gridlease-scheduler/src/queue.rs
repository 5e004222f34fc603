//! Pending-Work Queue and completion registry.
//!
//! Admitted work is pushed onto a durable queue in the record store and
//! drained wholesale by the batch stage. Each item carries a correlation id;
//! the admitting task holds the receiving half of a oneshot channel
//! registered under that id and the batch stage resolves it per item.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use gridlease_grid::{ClusterDefinition, NetworkDefinition, VmDefinition};
use gridlease_state::{DeploymentKind, StateStore};

use crate::error::{SchedulerError, SchedulerResult};

/// The deployable unit of a pending item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Workload {
    Vm(VmDefinition),
    Cluster(ClusterDefinition),
}

impl Workload {
    pub fn kind(&self) -> DeploymentKind {
        match self {
            Workload::Vm(_) => DeploymentKind::Vm,
            Workload::Cluster(_) => DeploymentKind::Cluster,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Workload::Vm(vm) => &vm.name,
            Workload::Cluster(k) => &k.name,
        }
    }
}

/// One admitted-but-not-yet-deployed workload with its network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWork {
    pub correlation_id: Uuid,
    pub network: NetworkDefinition,
    pub workload: Workload,
}

/// Durable FIFO of pending work, backed by the record store.
#[derive(Clone)]
pub struct WorkQueue {
    store: StateStore,
}

impl WorkQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn push(&self, work: &PendingWork) -> SchedulerResult<u64> {
        let seq = self.store.push_pending(work)?;
        debug!(
            seq,
            correlation_id = %work.correlation_id,
            kind = %work.workload.kind(),
            name = work.workload.name(),
            "work queued"
        );
        Ok(seq)
    }

    pub fn push_vm(&self, correlation_id: Uuid, network: NetworkDefinition, vm: VmDefinition) -> SchedulerResult<u64> {
        self.push(&PendingWork {
            correlation_id,
            network,
            workload: Workload::Vm(vm),
        })
    }

    pub fn push_cluster(
        &self,
        correlation_id: Uuid,
        network: NetworkDefinition,
        cluster: ClusterDefinition,
    ) -> SchedulerResult<u64> {
        self.push(&PendingWork {
            correlation_id,
            network,
            workload: Workload::Cluster(cluster),
        })
    }

    /// Atomically take every pending item, in push order.
    pub fn drain_all(&self) -> SchedulerResult<Vec<PendingWork>> {
        Ok(self.store.drain_pending()?)
    }

    pub fn len(&self) -> SchedulerResult<u64> {
        Ok(self.store.pending_len()?)
    }

    pub fn is_empty(&self) -> SchedulerResult<bool> {
        Ok(self.len()? == 0)
    }
}

type Sender = oneshot::Sender<SchedulerResult<()>>;

/// Correlation id to completion sender.
#[derive(Default)]
pub struct CompletionRegistry {
    waiters: Mutex<HashMap<Uuid, Sender>>,
    closed: AtomicBool,
}

impl CompletionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Sender>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh correlation id and return the waiting half. Fails
    /// once the registry has been closed.
    pub fn register(self: &Arc<Self>) -> SchedulerResult<PendingCompletion> {
        let mut waiters = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::TransientInfra(
                "scheduler is shutting down".to_string(),
            ));
        }
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        waiters.insert(id, tx);
        Ok(PendingCompletion {
            id,
            rx,
            registry: Arc::clone(self),
        })
    }

    /// Refuse new registrations and fail every current waiter.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<Sender> = {
            let mut waiters = self.lock();
            self.closed.store(true, Ordering::Release);
            waiters.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(SchedulerError::TransientInfra(reason.to_string())));
        }
        debug!(count, "completion registry closed");
        count
    }

    /// Whether someone is still waiting on `id`.
    pub fn is_waiting(&self, id: &Uuid) -> bool {
        self.lock().get(id).is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver `result` to the waiter for `id`. Returns false when nobody was
    /// listening any more.
    pub fn resolve(&self, id: &Uuid, result: SchedulerResult<()>) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            return false;
        };
        tx.send(result).is_ok()
    }

    fn forget(&self, id: &Uuid) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The admitting side of one correlated completion.
pub struct PendingCompletion {
    id: Uuid,
    rx: oneshot::Receiver<SchedulerResult<()>>,
    registry: Arc<CompletionRegistry>,
}

impl PendingCompletion {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the batch stage to resolve this item, at most `timeout`.
    /// `name` only labels the timeout error.
    pub async fn wait(self, timeout: Duration, name: &str) -> SchedulerResult<()> {
        let PendingCompletion { id, rx, registry } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SchedulerError::TransientInfra(format!(
                "completion for {name} was dropped"
            ))),
            Err(_) => {
                registry.forget(&id);
                warn!(correlation_id = %id, %name, "deployment wait timed out");
                Err(SchedulerError::DeploymentTimedOut(name.to_string()))
            }
        }
    }

    /// Give up without waiting, e.g. when the push itself failed.
    pub fn abandon(self) {
        self.registry.forget(&self.id);
    }
}
