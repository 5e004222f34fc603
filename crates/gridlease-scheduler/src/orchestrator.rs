//! Wires the scheduler components together and runs the four periodic tasks:
//! request polling, batch deployment, VM reaping, and cluster reaping.
//!
//! The tasks share only the store, the pending queue, the completion
//! registry, and the grid client. Each gets its own shutdown receiver.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use gridlease_grid::GridClient;
use gridlease_metrics::DeploymentCounter;
use gridlease_state::StateStore;

use crate::admission::Admission;
use crate::batch::BatchDeployer;
use crate::cancel::Canceller;
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;
use crate::poller::RequestPoller;
use crate::queue::{CompletionRegistry, WorkQueue};
use crate::reaper::Lifecycle;
use crate::resources::{ResourceCalculator, TierTable};

pub struct Orchestrator {
    admission: Arc<Admission>,
    poller: RequestPoller,
    batch: BatchDeployer,
    lifecycle: Lifecycle,
    config: SchedulerConfig,
}

impl Orchestrator {
    /// Fails only if the tier table is invalid.
    pub fn new(
        store: StateStore,
        grid: Arc<dyn GridClient>,
        tiers: TierTable,
        config: SchedulerConfig,
        metrics: Arc<DeploymentCounter>,
    ) -> SchedulerResult<Self> {
        let calculator = Arc::new(ResourceCalculator::new(tiers)?);
        let queue = WorkQueue::new(store.clone());
        let registry = CompletionRegistry::new();

        let admission = Arc::new(Admission::new(
            store.clone(),
            Arc::clone(&grid),
            calculator,
            queue.clone(),
            Arc::clone(&registry),
            metrics,
            config.clone(),
        ));
        let poller = RequestPoller::new(store.clone(), Arc::clone(&admission), Arc::clone(&registry));
        let batch = BatchDeployer::new(Arc::clone(&grid), queue, registry);
        let lifecycle = Lifecycle::new(store, Canceller::new(grid));

        Ok(Self {
            admission,
            poller,
            batch,
            lifecycle,
            config,
        })
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    pub fn poller(&self) -> &RequestPoller {
        &self.poller
    }

    pub fn batch(&self) -> &BatchDeployer {
        &self.batch
    }

    /// Explicit deletion and reaping.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Spawn the periodic tasks.
    pub fn start(&self) -> Running {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(4);

        let poller = self.poller.clone();
        let interval = self.config.request_interval();
        let rx = shutdown_rx.clone();
        handles.push(("request-poller", tokio::spawn(async move { poller.run(interval, rx).await })));

        let batch = self.batch.clone();
        let interval = self.config.deploy_interval();
        let rx = shutdown_rx.clone();
        handles.push(("batch-deployer", tokio::spawn(async move { batch.run(interval, rx).await })));

        let lifecycle = self.lifecycle.clone();
        let interval = self.config.reap_interval();
        let rx = shutdown_rx.clone();
        handles.push((
            "vm-reaper",
            tokio::spawn(async move { lifecycle.run_vm_reaper(interval, rx).await }),
        ));

        let lifecycle = self.lifecycle.clone();
        let interval = self.config.reap_interval();
        handles.push((
            "cluster-reaper",
            tokio::spawn(async move { lifecycle.run_cluster_reaper(interval, shutdown_rx).await }),
        ));

        info!(tasks = handles.len(), "orchestrator started");
        Running { shutdown_tx, handles }
    }
}

/// Handles to the spawned periodic tasks.
pub struct Running {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Running {
    /// Broadcast shutdown and wait for every task to finish. In-flight
    /// admissions are failed and their quota released.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }
}
