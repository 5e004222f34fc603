//! Batch Deployment Stage.
//!
//! Each tick drains the whole pending queue, drops items whose admitting
//! task no longer waits, deploys every network in one call, then every VM
//! in one call and every cluster in one call. Each drained item is resolved
//! in drain order with the outcome of the calls it depended on. An item that
//! deployed after its waiter gave up is cancelled again, since no record will
//! ever point at it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gridlease_grid::{ClusterDefinition, GridClient, NetworkDefinition, VmDefinition};
use gridlease_state::DeploymentKind;

use crate::error::{SchedulerError, SchedulerResult};
use crate::queue::{CompletionRegistry, PendingWork, WorkQueue, Workload};

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub drained: usize,
    /// Items nobody waited for any more; never deployed.
    pub dropped: usize,
    pub deployed: usize,
    pub failed: usize,
    /// Deployed, but the waiter was gone by resolve time; cancelled again.
    pub orphaned: usize,
}

#[derive(Clone)]
pub struct BatchDeployer {
    grid: Arc<dyn GridClient>,
    queue: WorkQueue,
    registry: Arc<CompletionRegistry>,
}

impl BatchDeployer {
    pub fn new(grid: Arc<dyn GridClient>, queue: WorkQueue, registry: Arc<CompletionRegistry>) -> Self {
        Self { grid, queue, registry }
    }

    pub async fn tick(&self) -> SchedulerResult<TickSummary> {
        let drained = self.queue.drain_all()?;
        let mut summary = TickSummary {
            drained: drained.len(),
            ..TickSummary::default()
        };

        let (live, stale): (Vec<PendingWork>, Vec<PendingWork>) = drained
            .into_iter()
            .partition(|w| self.registry.is_waiting(&w.correlation_id));
        for w in &stale {
            warn!(
                correlation_id = %w.correlation_id,
                name = w.workload.name(),
                "dropping pending work with no waiter"
            );
        }
        summary.dropped = stale.len();
        if live.is_empty() {
            return Ok(summary);
        }

        let networks: Vec<NetworkDefinition> = live.iter().map(|w| w.network.clone()).collect();
        let mut vms: Vec<VmDefinition> = Vec::new();
        let mut clusters: Vec<ClusterDefinition> = Vec::new();
        for w in &live {
            match &w.workload {
                Workload::Vm(vm) => vms.push(vm.clone()),
                Workload::Cluster(k) => clusters.push(k.clone()),
            }
        }

        let network_result = self.grid.batch_deploy_networks(&networks).await;
        let networks_deployed = network_result.is_ok();
        let (vm_outcome, cluster_outcome) = match network_result {
            Err(e) => {
                error!(error = %e, count = networks.len(), "failed to batch deploy networks");
                let msg = format!("network batch failed: {e}");
                (Err(msg.clone()), Err(msg))
            }
            Ok(()) => {
                debug!(count = networks.len(), "network batch deployed");
                let vm_outcome = self.deploy_vms(&vms).await;
                let cluster_outcome = self.deploy_clusters(&clusters).await;
                (vm_outcome, cluster_outcome)
            }
        };

        let mut orphaned_networks = Vec::new();
        let mut orphans = Vec::new();
        for w in &live {
            let outcome = match w.workload.kind() {
                DeploymentKind::Vm => &vm_outcome,
                DeploymentKind::Cluster => &cluster_outcome,
            };
            match outcome {
                Ok(()) => {
                    if self.registry.resolve(&w.correlation_id, Ok(())) {
                        summary.deployed += 1;
                    } else {
                        warn!(
                            correlation_id = %w.correlation_id,
                            name = w.workload.name(),
                            "deployed item has no waiter, cancelling it"
                        );
                        summary.orphaned += 1;
                        orphans.push(w);
                    }
                }
                Err(msg) => {
                    summary.failed += 1;
                    if networks_deployed {
                        orphaned_networks.push(w.network.name.clone());
                    }
                    self.registry
                        .resolve(&w.correlation_id, Err(SchedulerError::TransientInfra(msg.clone())));
                }
            }
        }

        self.cancel_orphans(&orphans).await;
        orphaned_networks.extend(orphans.iter().map(|w| w.network.name.clone()));
        self.cancel_networks(&orphaned_networks).await;

        info!(
            drained = summary.drained,
            deployed = summary.deployed,
            failed = summary.failed,
            dropped = summary.dropped,
            orphaned = summary.orphaned,
            "batch tick complete"
        );
        Ok(summary)
    }

    async fn deploy_vms(&self, vms: &[VmDefinition]) -> Result<(), String> {
        if vms.is_empty() {
            return Ok(());
        }
        self.grid.batch_deploy_vms(vms).await.map_err(|e| {
            error!(error = %e, count = vms.len(), "failed to batch deploy vms");
            format!("vm batch failed: {e}")
        })
    }

    async fn deploy_clusters(&self, clusters: &[ClusterDefinition]) -> Result<(), String> {
        if clusters.is_empty() {
            return Ok(());
        }
        self.grid.batch_deploy_clusters(clusters).await.map_err(|e| {
            error!(error = %e, count = clusters.len(), "failed to batch deploy clusters");
            format!("cluster batch failed: {e}")
        })
    }

    /// Best-effort teardown of the workload contracts of orphaned items.
    async fn cancel_orphans(&self, orphans: &[&PendingWork]) {
        for w in orphans {
            let name = w.workload.name();
            let workload = match self.grid.load_workload_state(&w.network.nodes, name).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(workload = %name, error = %e, "orphaned workload not found");
                    continue;
                }
            };
            for contract_id in workload.node_contracts.values() {
                if let Err(e) = self.grid.cancel_contract(*contract_id).await {
                    warn!(workload = %name, contract_id, error = %e, "failed to cancel orphaned workload");
                }
            }
            self.grid
                .state()
                .untrack_contracts(&workload.node_contracts.values().copied().collect::<Vec<_>>());
        }
    }

    /// Best-effort teardown of networks whose workload failed or was
    /// orphaned, so a resubmission can reuse the name.
    async fn cancel_networks(&self, names: &[String]) {
        for name in names {
            let network = match self.grid.load_network_state(name).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(network = %name, error = %e, "network of failed item not found");
                    continue;
                }
            };
            for contract_id in network.node_contracts.values() {
                if let Err(e) = self.grid.cancel_contract(*contract_id).await {
                    warn!(network = %name, contract_id, error = %e, "failed to cancel network of failed item");
                }
            }
            self.grid
                .state()
                .untrack_contracts(&network.node_contracts.values().copied().collect::<Vec<_>>());
            self.grid.state().remove_network(name);
        }
    }

    /// Run the batch loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "batch deployer started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "batch tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("batch deployer shutting down");
                    break;
                }
            }
        }
    }
}
