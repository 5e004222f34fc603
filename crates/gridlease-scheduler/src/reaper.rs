//! Lifecycle Reaper and explicit deletion.
//!
//! VM reaping and cluster reaping are independent passes over every user's
//! records. A failed cancellation leaves that record for the next run; a
//! failure to list users or records ends only the current pass.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gridlease_state::{ClusterRecord, DeploymentKind, StateStore, VmRecord};

use crate::cancel::Canceller;
use crate::error::SchedulerResult;

/// What one reaper pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub scanned: usize,
    pub reaped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Lifecycle {
    store: StateStore,
    canceller: Canceller,
}

impl Lifecycle {
    pub fn new(store: StateStore, canceller: Canceller) -> Self {
        Self { store, canceller }
    }

    async fn teardown_vm(&self, vm: &VmRecord) -> SchedulerResult<bool> {
        self.canceller
            .cancel(DeploymentKind::Vm, &vm.name, vm.contract_id, vm.network_contract_id)
            .await?;
        Ok(self.store.delete_vm(&vm.id)?)
    }

    async fn teardown_cluster(&self, cluster: &ClusterRecord) -> SchedulerResult<bool> {
        self.canceller
            .cancel(
                DeploymentKind::Cluster,
                &cluster.master.name,
                cluster.cluster_contract_id,
                cluster.network_contract_id,
            )
            .await?;
        Ok(self.store.delete_cluster(&cluster.id)?)
    }

    /// Cancel and delete every VM whose expiration has passed.
    pub async fn reap_vms(&self, now: DateTime<Utc>) -> SchedulerResult<ReapSummary> {
        let mut summary = ReapSummary::default();
        for user in self.store.list_users()? {
            for vm in self.store.list_vms_for_user(&user.id)? {
                summary.scanned += 1;
                if !vm.is_expired(now) {
                    continue;
                }
                match self.teardown_vm(&vm).await {
                    Ok(existed) => {
                        summary.reaped += 1;
                        info!(user_id = %vm.user_id, vm = %vm.name, existed, "expired vm reaped");
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!(user_id = %vm.user_id, vm = %vm.name, error = %e, "failed to reap vm");
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Cancel and delete every cluster whose expiration has passed.
    pub async fn reap_clusters(&self, now: DateTime<Utc>) -> SchedulerResult<ReapSummary> {
        let mut summary = ReapSummary::default();
        for user in self.store.list_users()? {
            for cluster in self.store.list_clusters_for_user(&user.id)? {
                summary.scanned += 1;
                if !cluster.is_expired(now) {
                    continue;
                }
                match self.teardown_cluster(&cluster).await {
                    Ok(existed) => {
                        summary.reaped += 1;
                        info!(user_id = %cluster.user_id, cluster = %cluster.master.name, existed, "expired cluster reaped");
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!(
                            user_id = %cluster.user_id,
                            cluster = %cluster.master.name,
                            error = %e,
                            "failed to reap cluster"
                        );
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Delete one of `user_id`'s VMs on request. Returns false if there was
    /// nothing to delete.
    pub async fn delete_vm(&self, user_id: &str, id: &str) -> SchedulerResult<bool> {
        let Some(vm) = self.store.get_vm(id)?.filter(|vm| vm.user_id == user_id) else {
            debug!(%user_id, vm_id = %id, "vm already gone");
            return Ok(false);
        };
        let existed = self.teardown_vm(&vm).await?;
        info!(%user_id, vm = %vm.name, "vm deleted");
        Ok(existed)
    }

    /// Delete one of `user_id`'s clusters, master and workers included.
    pub async fn delete_cluster(&self, user_id: &str, id: &str) -> SchedulerResult<bool> {
        let Some(cluster) = self.store.get_cluster(id)?.filter(|c| c.user_id == user_id) else {
            debug!(%user_id, cluster_id = %id, "cluster already gone");
            return Ok(false);
        };
        let existed = self.teardown_cluster(&cluster).await?;
        info!(%user_id, cluster = %cluster.master.name, "cluster deleted");
        Ok(existed)
    }

    pub async fn run_vm_reaper(&self, interval: Duration, shutdown: watch::Receiver<bool>) {
        self.run(DeploymentKind::Vm, interval, shutdown).await;
    }

    pub async fn run_cluster_reaper(&self, interval: Duration, shutdown: watch::Receiver<bool>) {
        self.run(DeploymentKind::Cluster, interval, shutdown).await;
    }

    async fn run(&self, kind: DeploymentKind, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(%kind, interval_secs = interval.as_secs(), "reaper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let now = Utc::now();
                    let result = match kind {
                        DeploymentKind::Vm => self.reap_vms(now).await,
                        DeploymentKind::Cluster => self.reap_clusters(now).await,
                    };
                    match result {
                        Ok(s) if s.reaped > 0 || s.failed > 0 => {
                            info!(%kind, scanned = s.scanned, reaped = s.reaped, failed = s.failed, "reaper pass complete");
                        }
                        Ok(s) => debug!(%kind, scanned = s.scanned, "nothing to reap"),
                        Err(e) => warn!(%kind, error = %e, "reaper pass aborted"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(%kind, "reaper shutting down");
                    break;
                }
            }
        }
    }
}
