//! Request Poller.
//!
//! Periodically claims every queued inbound request and runs one admission
//! per request concurrently. The outcome is written back to the request:
//! `Deployed` with the record id, or `Failed` with the caller-facing message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use gridlease_state::{DeploymentRequest, RequestRecord, RequestStatus, StateStore};

use crate::admission::Admission;
use crate::error::{INTERNAL_ERROR_MSG, SchedulerResult};
use crate::queue::CompletionRegistry;

#[derive(Clone)]
pub struct RequestPoller {
    store: StateStore,
    admission: Arc<Admission>,
    registry: Arc<CompletionRegistry>,
}

impl RequestPoller {
    pub fn new(store: StateStore, admission: Arc<Admission>, registry: Arc<CompletionRegistry>) -> Self {
        Self {
            store,
            admission,
            registry,
        }
    }

    /// Settle requests left in `Processing` by a previous run. A request
    /// whose record exists is marked deployed; anything else failed. Quota
    /// reserved by the interrupted admission is not refunded. Name claims the
    /// interrupted admissions held are dropped.
    pub fn recover_stranded(&self) -> SchedulerResult<usize> {
        let claims = self.store.clear_name_claims()?;
        if claims > 0 {
            warn!(count = claims, "dropped name claims left by a previous run");
        }
        let stranded = self.store.requests_with_status(RequestStatus::Processing)?;
        for record in &stranded {
            let request = &record.request;
            let existing = match request {
                DeploymentRequest::Vm(vm) => self
                    .store
                    .find_vm_by_name(&vm.name)?
                    .filter(|r| r.user_id == vm.user_id)
                    .map(|r| r.id),
                DeploymentRequest::Cluster(k) => self
                    .store
                    .find_cluster_by_master(&k.master_name)?
                    .filter(|r| r.user_id == k.user_id)
                    .map(|r| r.id),
            };
            match existing {
                Some(record_id) => {
                    self.store
                        .finish_request(record.id, RequestStatus::Deployed, None, Some(record_id))?;
                    info!(request_id = record.id, name = request.name(), "stranded request was deployed");
                }
                None => {
                    self.store.finish_request(
                        record.id,
                        RequestStatus::Failed,
                        Some(INTERNAL_ERROR_MSG.to_string()),
                        None,
                    )?;
                    warn!(
                        request_id = record.id,
                        user_id = request.user_id(),
                        name = request.name(),
                        "stranded request marked failed, its quota reservation may be lost"
                    );
                }
            }
        }
        Ok(stranded.len())
    }

    /// Admit one claimed request and record the outcome.
    pub async fn handle(&self, record: RequestRecord) -> RequestStatus {
        let request = &record.request;
        let outcome = match request {
            DeploymentRequest::Vm(vm) => self.admission.admit_vm(vm).await.map(|r| r.id),
            DeploymentRequest::Cluster(k) => self.admission.admit_cluster(k).await.map(|r| r.id),
        };

        let (status, message, record_id) = match outcome {
            Ok(id) => (RequestStatus::Deployed, None, Some(id)),
            Err(e) if e.is_user_error() => {
                info!(
                    request_id = record.id,
                    user_id = request.user_id(),
                    name = request.name(),
                    reason = %e,
                    "request rejected"
                );
                (RequestStatus::Failed, Some(e.public_message()), None)
            }
            Err(e) => {
                error!(
                    request_id = record.id,
                    user_id = request.user_id(),
                    name = request.name(),
                    error = %e,
                    "request failed"
                );
                (RequestStatus::Failed, Some(e.public_message()), None)
            }
        };

        if let Err(e) = self.store.finish_request(record.id, status, message, record_id) {
            error!(request_id = record.id, error = %e, "failed to record request outcome");
        }
        status
    }

    /// Claim all queued requests and spawn their admissions onto `tasks`.
    pub fn poll(&self, tasks: &mut JoinSet<RequestStatus>) -> SchedulerResult<usize> {
        let claimed = self.store.claim_queued_requests()?;
        let count = claimed.len();
        for record in claimed {
            debug!(request_id = record.id, kind = %record.request.kind(), "admitting request");
            let poller = self.clone();
            tasks.spawn(async move { poller.handle(record).await });
        }
        Ok(count)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "request poller started");

        match self.recover_stranded() {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "settled requests stranded by a previous run"),
            Err(e) => error!(error = %e, "failed to settle stranded requests"),
        }

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    while let Some(joined) = tasks.try_join_next() {
                        if let Err(e) = joined {
                            error!(error = %e, "admission task panicked");
                        }
                    }
                    match self.poll(&mut tasks) {
                        Ok(0) => {}
                        Ok(n) => info!(claimed = n, in_flight = tasks.len(), "requests claimed"),
                        Err(e) => error!(error = %e, "failed to claim queued requests"),
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        let woken = self.registry.close("scheduler is shutting down");
        info!(in_flight = tasks.len(), woken, "request poller shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "admission task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridlease_grid::{MemoryGrid, NodeInfo, NodeStatus};
    use gridlease_metrics::DeploymentCounter;
    use gridlease_state::{
        DeploymentKind, NameClaim, Package, Quota, ResourceSnapshot, Tier, User, VmRecord, VmRequest,
    };

    use crate::batch::BatchDeployer;
    use crate::config::SchedulerConfig;
    use crate::queue::WorkQueue;
    use crate::resources::{ResourceCalculator, TierTable};

    struct Fixture {
        store: StateStore,
        poller: RequestPoller,
        batch: BatchDeployer,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_user(&User {
                id: "u1".to_string(),
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                ssh_key: "ssh-ed25519 USER".to_string(),
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .put_package(&Package { id: "p1".to_string(), name: "term".to_string(), period_months: 1 })
            .unwrap();
        store.put_quota("u1", &Quota { units: 2, public_ips: 0 }).unwrap();

        let grid = Arc::new(MemoryGrid::new([NodeInfo {
            node_id: 3,
            farm_id: 1,
            status: NodeStatus::Up,
            free_cpu: 16,
            free_memory_gb: 64,
            free_disk_gb: 1000,
            free_ips: 0,
            ipv4: true,
            ipv6: true,
        }]));
        let queue = WorkQueue::new(store.clone());
        let registry = CompletionRegistry::new();
        let admission = Arc::new(Admission::new(
            store.clone(),
            grid.clone(),
            Arc::new(ResourceCalculator::new(TierTable::default()).unwrap()),
            queue.clone(),
            Arc::clone(&registry),
            Arc::new(DeploymentCounter::new()),
            SchedulerConfig::default(),
        ));
        Fixture {
            poller: RequestPoller::new(store.clone(), admission, Arc::clone(&registry)),
            batch: BatchDeployer::new(grid, queue, registry),
            store,
        }
    }

    fn vm(name: &str, tier: Tier) -> DeploymentRequest {
        DeploymentRequest::Vm(VmRequest {
            name: name.to_string(),
            tier,
            public_ip: false,
            user_id: "u1".to_string(),
            ssh_key: String::new(),
            package_id: "p1".to_string(),
        })
    }

    async fn settle(f: &Fixture, tasks: &mut JoinSet<RequestStatus>) -> Vec<RequestStatus> {
        // Let the admissions reach the queue, then run one batch.
        for _ in 0..100 {
            if f.batch.tick().await.unwrap().drained > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let mut statuses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            statuses.push(joined.unwrap());
        }
        statuses
    }

    #[tokio::test]
    async fn claimed_requests_are_admitted_and_recorded() {
        let f = fixture();
        let ok = f.store.submit_request(&vm("box", Tier::Small)).unwrap();
        let mut tasks = JoinSet::new();
        assert_eq!(f.poller.poll(&mut tasks).unwrap(), 1);
        assert_eq!(
            f.store.get_request(ok.id).unwrap().unwrap().status,
            RequestStatus::Processing
        );

        let statuses = settle(&f, &mut tasks).await;
        assert_eq!(statuses, vec![RequestStatus::Deployed]);

        let done = f.store.get_request(ok.id).unwrap().unwrap();
        let vm = f.store.find_vm_by_name("box").unwrap().unwrap();
        assert_eq!(done.record_id.as_deref(), Some(vm.id.as_str()));
        assert_eq!(f.poller.poll(&mut tasks).unwrap(), 0);
    }

    #[tokio::test]
    async fn user_errors_are_written_back_verbatim() {
        let f = fixture();
        let req = f.store.submit_request(&vm("big", Tier::Large)).unwrap();
        let mut tasks = JoinSet::new();
        f.poller.poll(&mut tasks).unwrap();
        let status = tasks.join_next().await.unwrap().unwrap();
        assert_eq!(status, RequestStatus::Failed);

        let done = f.store.get_request(req.id).unwrap().unwrap();
        assert_eq!(
            done.message.as_deref(),
            Some("no available quota 2 for vm deployment, you can request a new voucher")
        );
    }

    #[test]
    fn stranded_requests_are_settled() {
        let f = fixture();
        let deployed = f.store.submit_request(&vm("live", Tier::Small)).unwrap();
        let lost = f.store.submit_request(&vm("lost", Tier::Small)).unwrap();
        f.store.claim_queued_requests().unwrap();
        f.store
            .claim_name(
                "lost",
                &NameClaim {
                    kind: DeploymentKind::Vm,
                    user_id: "u1".to_string(),
                    claimed_at: Utc::now(),
                },
            )
            .unwrap();

        let now = Utc::now();
        f.store
            .put_vm(&VmRecord {
                id: "vm-1".to_string(),
                user_id: "u1".to_string(),
                name: "live".to_string(),
                tier: Tier::Small,
                public_ip: false,
                node_id: 3,
                contract_id: 1,
                network_contract_id: 2,
                resources: ResourceSnapshot { cpu: 1, memory_gb: 2, disk_gb: 25 },
                public_ipv4: None,
                private_ip: None,
                planetary_ip: None,
                created_at: now,
                expires_at: now,
            })
            .unwrap();

        assert_eq!(f.poller.recover_stranded().unwrap(), 2);
        let deployed = f.store.get_request(deployed.id).unwrap().unwrap();
        assert_eq!(deployed.status, RequestStatus::Deployed);
        assert_eq!(deployed.record_id.as_deref(), Some("vm-1"));
        let lost = f.store.get_request(lost.id).unwrap().unwrap();
        assert_eq!(lost.status, RequestStatus::Failed);
        assert_eq!(lost.message.as_deref(), Some(INTERNAL_ERROR_MSG));
        assert!(f.store.get_name_claim("lost").unwrap().is_none());
        assert_eq!(f.poller.recover_stranded().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_in_flight_admissions_and_releases_quota() {
        let f = fixture();
        let req = f.store.submit_request(&vm("box", Tier::Small)).unwrap();
        let (tx, rx) = watch::channel(false);
        let poller = f.poller.clone();
        let handle = tokio::spawn(async move { poller.run(Duration::from_secs(1), rx).await });

        // One poll claims the request; no batch ever runs.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            f.store.get_request(req.id).unwrap().unwrap().status,
            RequestStatus::Processing
        );

        tx.send(true).unwrap();
        handle.await.unwrap();

        let done = f.store.get_request(req.id).unwrap().unwrap();
        assert_eq!(done.status, RequestStatus::Failed);
        assert_eq!(done.message.as_deref(), Some(INTERNAL_ERROR_MSG));
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 2);
    }
}
