//! Admission Stage.
//!
//! Takes one deployment request from validation to a persisted record:
//!
//! 1. claim the workload name, reject unknown users and unknown packages
//! 2. reserve quota (validate + atomic decrement)
//! 3. select a node
//! 4. push the network and workload definitions onto the pending queue
//! 5. wait, bounded, for the batch stage to resolve this item
//! 6. load the deployed state back from the grid and persist the record
//! 7. commit the quota reservation and count the deployment
//!
//! Any failure after step 2 and before the record is persisted releases the
//! reservation. A failure to persist after a successful deploy cancels the
//! deployment on the grid. The name claim is dropped when admission ends;
//! by then either the persisted record holds the name or nothing does.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use gridlease_grid::{
    ClusterDefinition, GridClient, K8sNodeDefinition, NETWORK_IP_RANGE, NetworkDefinition,
    NetworkInfo, NodeId, VmDefinition, WorkloadInfo,
};
use gridlease_metrics::{DeploymentCounter, Role};
use gridlease_state::{
    ClusterRecord, ClusterRequest, DeploymentKind, MasterRecord, NameClaim, Package, StateResult,
    StateStore, Tier, User, VmRecord, VmRequest, WorkerRecord,
};

use crate::cancel::{Canceller, network_name};
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::quota::{QuotaLedger, Reservation};
use crate::queue::{CompletionRegistry, WorkQueue};
use crate::resources::ResourceCalculator;
use crate::selector::NodeSelector;

/// `now` plus the package period plus the tolerance window.
pub fn expiration_date(
    now: DateTime<Utc>,
    period_months: u32,
    tolerance_days: u32,
) -> SchedulerResult<DateTime<Utc>> {
    now.checked_add_months(Months::new(period_months))
        .and_then(|t| t.checked_add_signed(ChronoDuration::days(i64::from(tolerance_days))))
        .ok_or_else(|| {
            SchedulerError::InvalidRequest(format!("package period of {period_months} months is out of range"))
        })
}

/// A claimed workload name, released on drop.
struct ClaimedName<'a> {
    store: &'a StateStore,
    name: &'a str,
}

impl Drop for ClaimedName<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_name(self.name) {
            error!(name = %self.name, error = %e, "failed to release name claim");
        }
    }
}

/// Shared dependencies of the admission stage.
pub struct Admission {
    store: StateStore,
    grid: Arc<dyn GridClient>,
    calculator: Arc<ResourceCalculator>,
    selector: NodeSelector,
    ledger: QuotaLedger,
    queue: WorkQueue,
    registry: Arc<CompletionRegistry>,
    canceller: Canceller,
    metrics: Arc<DeploymentCounter>,
    config: SchedulerConfig,
}

impl Admission {
    pub fn new(
        store: StateStore,
        grid: Arc<dyn GridClient>,
        calculator: Arc<ResourceCalculator>,
        queue: WorkQueue,
        registry: Arc<CompletionRegistry>,
        metrics: Arc<DeploymentCounter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            selector: NodeSelector::new(Arc::clone(&grid), Arc::clone(&calculator), config.farm_id),
            ledger: QuotaLedger::new(store.clone(), Arc::clone(&calculator)),
            canceller: Canceller::new(Arc::clone(&grid)),
            store,
            grid,
            calculator,
            queue,
            registry,
            metrics,
            config,
        }
    }

    fn lookup(&self, user_id: &str, package_id: &str) -> SchedulerResult<(User, Package)> {
        let user = self
            .store
            .get_user(user_id)?
            .ok_or_else(|| SchedulerError::UnknownUser(user_id.to_string()))?;
        let package = self
            .store
            .get_package(package_id)?
            .ok_or_else(|| SchedulerError::UnknownPackage(package_id.to_string()))?;
        Ok((user, package))
    }

    /// Claim `name` across both deployment kinds, or fail with
    /// `DuplicateName`.
    fn claim_name<'a>(
        &'a self,
        kind: DeploymentKind,
        name: &'a str,
        user_id: &str,
    ) -> SchedulerResult<ClaimedName<'a>> {
        let claim = NameClaim {
            kind,
            user_id: user_id.to_string(),
            claimed_at: Utc::now(),
        };
        if !self.store.claim_name(name, &claim)? {
            return Err(SchedulerError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
        Ok(ClaimedName { store: &self.store, name })
    }

    fn ssh_keys(&self, request_key: &str, user: &User) -> String {
        let key = if request_key.trim().is_empty() { &user.ssh_key } else { request_key };
        self.config.ssh_keys_for(key)
    }

    /// Run `deploy` under a quota reservation: release on failure, commit on
    /// success.
    ///
    /// A successful `deploy` has already persisted its record, so a commit
    /// failure is logged and does not fail the admission.
    async fn with_reservation<T, F>(&self, reservation: Reservation, deploy: F) -> SchedulerResult<T>
    where
        F: std::future::Future<Output = SchedulerResult<T>>,
    {
        match deploy.await {
            Ok(value) => {
                if let Err(e) = self.ledger.commit(&reservation) {
                    error!(
                        user_id = %reservation.user_id,
                        units = reservation.charge.units,
                        error = %e,
                        "deployment persisted but its quota reservation could not be committed"
                    );
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(release_err) = self.ledger.release(&reservation) {
                    error!(user_id = %reservation.user_id, error = %release_err, "failed to release quota reservation");
                }
                Err(e)
            }
        }
    }

    /// Push one item and wait for its batch.
    async fn enqueue_and_wait(
        &self,
        name: &str,
        push: impl FnOnce(Uuid) -> SchedulerResult<u64>,
    ) -> SchedulerResult<()> {
        let pending = self.registry.register()?;
        if let Err(e) = push(pending.id()) {
            pending.abandon();
            return Err(e);
        }
        pending.wait(self.config.deployment_timeout(), name).await
    }

    async fn load_state(
        &self,
        kind: DeploymentKind,
        name: &str,
        node_id: NodeId,
    ) -> SchedulerResult<(NetworkInfo, WorkloadInfo)> {
        let loaded = async {
            let network = self
                .grid
                .load_network_state(&network_name(kind, name))
                .await
                .map_err(|e| SchedulerError::TransientInfra(format!("failed to load network of {name}: {e}")))?;
            let workload = self
                .grid
                .load_workload_state(&[node_id], name)
                .await
                .map_err(|e| SchedulerError::TransientInfra(format!("failed to load {kind} {name}: {e}")))?;
            Ok::<_, SchedulerError>((network, workload))
        }
        .await;
        if let Err(e) = &loaded {
            error!(%kind, %name, node_id, error = %e, "deployed but state not loaded, contracts left on the grid");
        }
        loaded
    }

    fn contracts(
        name: &str,
        node_id: NodeId,
        network: &NetworkInfo,
        workload: &WorkloadInfo,
    ) -> SchedulerResult<(u64, u64)> {
        let missing = || SchedulerError::TransientInfra(format!("no contract for {name} on node {node_id}"));
        let workload_contract = *workload.node_contracts.get(&node_id).ok_or_else(missing)?;
        let network_contract = *network.node_contracts.get(&node_id).ok_or_else(missing)?;
        Ok((workload_contract, network_contract))
    }

    // ── VMs ──────────────────────────────────────────────────────

    pub async fn admit_vm(&self, request: &VmRequest) -> SchedulerResult<VmRecord> {
        if request.name.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("vm name must not be empty".to_string()));
        }
        let _claim = self.claim_name(DeploymentKind::Vm, &request.name, &request.user_id)?;
        let (user, package) = self.lookup(&request.user_id, &request.package_id)?;

        let reservation =
            self.ledger
                .reserve(&request.user_id, DeploymentKind::Vm, &[request.tier], request.public_ip)?;

        let record = self
            .with_reservation(reservation, self.deploy_vm(request, &user, &package))
            .await?;

        self.metrics.record(&record.user_id, record.tier, Role::Vm).await;
        info!(
            user_id = %record.user_id,
            vm = %record.name,
            node_id = record.node_id,
            contract_id = record.contract_id,
            "vm admitted"
        );
        Ok(record)
    }

    async fn deploy_vm(&self, request: &VmRequest, user: &User, package: &Package) -> SchedulerResult<VmRecord> {
        let filter = self.selector.vm_filter(request.tier, request.public_ip);
        let node_id = self.selector.select(&filter).await?;
        let resources = self.calculator.resources(request.tier, request.public_ip);
        let net_name = network_name(DeploymentKind::Vm, &request.name);

        let network = NetworkDefinition {
            name: net_name.clone(),
            nodes: vec![node_id],
            ip_range: NETWORK_IP_RANGE.to_string(),
            add_wg_access: false,
        };
        let vm = VmDefinition {
            name: request.name.clone(),
            node_id,
            network_name: net_name,
            flist: self.config.vm_flist.clone(),
            entrypoint: self.config.vm_entrypoint.clone(),
            cpu: resources.cpu,
            memory_mb: resources.memory_mb(),
            disk_gb: resources.disk_gb,
            public_ip: request.public_ip,
            planetary: true,
            ssh_keys: self.ssh_keys(&request.ssh_key, user),
        };

        self.enqueue_and_wait(&request.name, |id| self.queue.push_vm(id, network, vm))
            .await?;

        let (network, workload) = self.load_state(DeploymentKind::Vm, &request.name, node_id).await?;
        let (contract_id, network_contract_id) = Self::contracts(&request.name, node_id, &network, &workload)?;

        let now = Utc::now();
        let record = VmRecord {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            name: request.name.clone(),
            tier: request.tier,
            public_ip: request.public_ip,
            node_id,
            contract_id,
            network_contract_id,
            resources: resources.snapshot(),
            public_ipv4: workload.public_ipv4,
            private_ip: workload.private_ip,
            planetary_ip: workload.planetary_ip,
            created_at: now,
            expires_at: expiration_date(now, package.period_months, self.config.expiration_tolerance_days)?,
        };

        self.persist(DeploymentKind::Vm, &record.name, contract_id, network_contract_id, || {
            self.store.put_vm(&record)
        })
        .await?;
        Ok(record)
    }

    // ── Clusters ─────────────────────────────────────────────────

    fn validate_cluster_names(request: &ClusterRequest) -> SchedulerResult<()> {
        let mut seen = HashSet::new();
        for name in std::iter::once(&request.master_name).chain(request.workers.iter().map(|w| &w.name)) {
            if name.trim().is_empty() {
                return Err(SchedulerError::InvalidRequest(
                    "cluster node names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(SchedulerError::InvalidRequest(format!(
                    "cluster node name {name} is used twice"
                )));
            }
        }
        Ok(())
    }

    pub async fn admit_cluster(&self, request: &ClusterRequest) -> SchedulerResult<ClusterRecord> {
        Self::validate_cluster_names(request)?;
        let _claim = self.claim_name(DeploymentKind::Cluster, &request.master_name, &request.user_id)?;
        let (user, package) = self.lookup(&request.user_id, &request.package_id)?;

        let tiers: Vec<Tier> = std::iter::once(request.tier)
            .chain(request.workers.iter().map(|w| w.tier))
            .collect();
        let reservation =
            self.ledger
                .reserve(&request.user_id, DeploymentKind::Cluster, &tiers, request.public_ip)?;

        let record = self
            .with_reservation(reservation, self.deploy_cluster(request, &user, &package))
            .await?;

        self.metrics
            .record(&record.user_id, record.master.tier, Role::Master)
            .await;
        for worker in &record.workers {
            self.metrics.record(&record.user_id, worker.tier, Role::Worker).await;
        }
        info!(
            user_id = %record.user_id,
            cluster = %record.master.name,
            workers = record.workers.len(),
            node_id = record.node_id,
            "cluster admitted"
        );
        Ok(record)
    }

    async fn deploy_cluster(
        &self,
        request: &ClusterRequest,
        user: &User,
        package: &Package,
    ) -> SchedulerResult<ClusterRecord> {
        let worker_tiers: Vec<Tier> = request.workers.iter().map(|w| w.tier).collect();
        let filter = self
            .selector
            .cluster_filter(request.tier, request.public_ip, &worker_tiers);
        let node_id = self.selector.select(&filter).await?;
        let net_name = network_name(DeploymentKind::Cluster, &request.master_name);

        let k8s_node = |name: &str, tier: Tier, public_ip: bool| {
            let r = self.calculator.resources(tier, public_ip);
            K8sNodeDefinition {
                name: name.to_string(),
                node_id,
                flist: self.config.k8s_flist.clone(),
                cpu: r.cpu,
                memory_mb: r.memory_mb(),
                disk_gb: r.disk_gb,
                public_ip,
                planetary: true,
            }
        };

        let network = NetworkDefinition {
            name: net_name.clone(),
            nodes: vec![node_id],
            ip_range: NETWORK_IP_RANGE.to_string(),
            add_wg_access: false,
        };
        let cluster = ClusterDefinition {
            name: request.master_name.clone(),
            network_name: net_name,
            token: self.config.cluster_token.clone(),
            ssh_keys: self.ssh_keys(&request.ssh_key, user),
            master: k8s_node(&request.master_name, request.tier, request.public_ip),
            workers: request
                .workers
                .iter()
                .map(|w| k8s_node(&w.name, w.tier, false))
                .collect(),
        };

        self.enqueue_and_wait(&request.master_name, |id| {
            self.queue.push_cluster(id, network, cluster)
        })
        .await?;

        let (network, workload) = self
            .load_state(DeploymentKind::Cluster, &request.master_name, node_id)
            .await?;
        let (cluster_contract_id, network_contract_id) =
            Self::contracts(&request.master_name, node_id, &network, &workload)?;

        let now = Utc::now();
        let record = ClusterRecord {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            node_id,
            cluster_contract_id,
            network_contract_id,
            master: MasterRecord {
                name: request.master_name.clone(),
                tier: request.tier,
                public_ip: request.public_ip,
                resources: self.calculator.resources(request.tier, request.public_ip).snapshot(),
                public_ipv4: workload.public_ipv4,
                planetary_ip: workload.planetary_ip,
            },
            workers: request
                .workers
                .iter()
                .map(|w| WorkerRecord {
                    name: w.name.clone(),
                    tier: w.tier,
                    resources: self.calculator.resources(w.tier, false).snapshot(),
                })
                .collect(),
            created_at: now,
            expires_at: expiration_date(now, package.period_months, self.config.expiration_tolerance_days)?,
        };

        self.persist(
            DeploymentKind::Cluster,
            &record.master.name,
            cluster_contract_id,
            network_contract_id,
            || self.store.put_cluster(&record),
        )
        .await?;
        Ok(record)
    }

    /// Write the record of a deployed workload. If that fails the deployment
    /// is torn down again, since nothing would ever reap it.
    async fn persist(
        &self,
        kind: DeploymentKind,
        name: &str,
        workload_contract: u64,
        network_contract: u64,
        write: impl FnOnce() -> StateResult<()>,
    ) -> SchedulerResult<()> {
        let Err(e) = write() else {
            return Ok(());
        };
        warn!(%kind, %name, error = %e, "record not persisted, cancelling deployment");
        if let Err(cancel_err) = self
            .canceller
            .cancel(kind, name, workload_contract, network_contract)
            .await
        {
            error!(%kind, %name, error = %cancel_err, "failed to cancel unpersisted deployment");
        }
        Err(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gridlease_grid::{CallKind, MemoryGrid, NodeInfo, NodeStatus};
    use gridlease_state::{Quota, WorkerRequest};

    use crate::resources::TierTable;

    #[test]
    fn expiration_adds_months_then_tolerance() {
        let now = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(
            expiration_date(now, 1, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
        );
        assert_eq!(
            expiration_date(now, 3, 5).unwrap(),
            Utc.with_ymd_and_hms(2026, 5, 5, 12, 0, 0).unwrap()
        );
    }

    struct Fixture {
        store: StateStore,
        grid: Arc<MemoryGrid>,
        admission: Arc<Admission>,
    }

    fn fixture(units: u32) -> Fixture {
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
            .put_package(&Package {
                id: "p1".to_string(),
                name: "semester".to_string(),
                period_months: 3,
            })
            .unwrap();
        store.put_quota("u1", &Quota { units, public_ips: 1 }).unwrap();

        let grid = Arc::new(MemoryGrid::new([NodeInfo {
            node_id: 11,
            farm_id: 1,
            status: NodeStatus::Up,
            free_cpu: 16,
            free_memory_gb: 64,
            free_disk_gb: 1000,
            free_ips: 1,
            ipv4: true,
            ipv6: true,
        }]));
        let calculator = Arc::new(ResourceCalculator::new(TierTable::default()).unwrap());
        let admission = Arc::new(Admission::new(
            store.clone(),
            grid.clone(),
            calculator,
            WorkQueue::new(store.clone()),
            CompletionRegistry::new(),
            Arc::new(DeploymentCounter::new()),
            SchedulerConfig {
                admin_ssh_key: Some("ssh-ed25519 ADMIN".to_string()),
                ..SchedulerConfig::default()
            },
        ));
        Fixture { store, grid, admission }
    }

    fn vm_request(name: &str, tier: Tier) -> VmRequest {
        VmRequest {
            name: name.to_string(),
            tier,
            public_ip: false,
            user_id: "u1".to_string(),
            ssh_key: String::new(),
            package_id: "p1".to_string(),
        }
    }

    fn vm_record(name: &str) -> VmRecord {
        VmRecord {
            id: format!("rec-{name}"),
            user_id: "u1".to_string(),
            name: name.to_string(),
            tier: Tier::Small,
            public_ip: false,
            node_id: 11,
            contract_id: 1,
            network_contract_id: 2,
            resources: gridlease_state::ResourceSnapshot { cpu: 1, memory_gb: 2, disk_gb: 25 },
            public_ipv4: None,
            private_ip: None,
            planetary_ip: None,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    fn cluster_request(master: &str) -> ClusterRequest {
        ClusterRequest {
            master_name: master.to_string(),
            tier: Tier::Small,
            public_ip: false,
            user_id: "u1".to_string(),
            ssh_key: String::new(),
            package_id: "p1".to_string(),
            workers: vec![WorkerRequest {
                name: format!("{master}w1"),
                tier: Tier::Small,
            }],
        }
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected_before_quota() {
        let f = fixture(3);
        f.store.put_vm(&vm_record("box")).unwrap();

        let err = f.admission.admit_vm(&vm_request("box", Tier::Small)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName { .. }));
        assert_eq!(err.public_message(), "vm name box is already taken");
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 3);
    }

    #[tokio::test]
    async fn cluster_cannot_take_a_vm_name() {
        let f = fixture(5);
        f.store.put_vm(&vm_record("box")).unwrap();

        let err = f.admission.admit_cluster(&cluster_request("box")).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::DuplicateName { kind: DeploymentKind::Cluster, .. }
        ));
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 5);
        assert!(f.admission.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn in_flight_name_is_taken_until_admission_ends() {
        let f = fixture(10);
        let held = NameClaim {
            kind: DeploymentKind::Cluster,
            user_id: "u2".to_string(),
            claimed_at: Utc::now(),
        };
        assert!(f.store.claim_name("box", &held).unwrap());

        let err = f.admission.admit_vm(&vm_request("box", Tier::Small)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName { .. }));
        // The losing admission leaves the winner's claim alone.
        assert_eq!(f.store.get_name_claim("box").unwrap(), Some(held));

        f.store.release_name("box").unwrap();
        f.grid.set_failing(CallKind::FilterNodes, true);
        f.admission.admit_vm(&vm_request("box", Tier::Small)).await.unwrap_err();
        assert!(f.store.get_name_claim("box").unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_package_is_a_user_error() {
        let f = fixture(3);
        let mut req = vm_request("box", Tier::Small);
        req.package_id = "nope".to_string();
        let err = f.admission.admit_vm(&req).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownPackage(_)));
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn no_capacity_releases_the_reservation() {
        let f = fixture(10);
        f.grid.set_failing(CallKind::FilterNodes, true);
        let err = f.admission.admit_vm(&vm_request("box", Tier::Small)).await.unwrap_err();
        assert_eq!(err.public_message(), crate::error::INTERNAL_ERROR_MSG);
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 10);
        assert_eq!(f.admission.queue.len().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_wait_times_out_and_releases() {
        let f = fixture(3);
        let err = f.admission.admit_vm(&vm_request("box", Tier::Medium)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DeploymentTimedOut(_)));
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 3);
        // The definition is still queued but nobody waits for it any more.
        assert_eq!(f.admission.queue.len().unwrap(), 1);
        assert!(f.admission.registry.is_empty());
    }

    #[tokio::test]
    async fn vm_definition_carries_tier_resources_and_keys() {
        let f = fixture(3);
        let admission = Arc::clone(&f.admission);
        let task = tokio::spawn(async move { admission.admit_vm(&vm_request("box", Tier::Medium)).await });

        let item = loop {
            let mut items = f.admission.queue.drain_all().unwrap();
            if let Some(item) = items.pop() {
                break item;
            }
            tokio::task::yield_now().await;
        };
        let crate::queue::Workload::Vm(vm) = &item.workload else {
            panic!("expected a vm");
        };
        assert_eq!((vm.cpu, vm.memory_mb, vm.disk_gb), (2, 4096, 50));
        assert_eq!(vm.ssh_keys, "ssh-ed25519 USER\nssh-ed25519 ADMIN");
        assert_eq!(vm.network_name, "vmboxNet");
        assert_eq!(item.network.nodes, vec![11]);
        assert!(f.admission.registry.resolve(&item.correlation_id, Err(SchedulerError::TransientInfra("boom".into()))));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SchedulerError::TransientInfra(_)));
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 3);
    }

    #[tokio::test]
    async fn cluster_names_must_be_distinct() {
        let f = fixture(5);
        let mut req = cluster_request("kube");
        req.workers[0].name = "kube".to_string();
        let err = f.admission.admit_cluster(&req).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 5);
    }

    #[tokio::test]
    async fn public_ip_without_ip_quota_is_rejected() {
        let f = fixture(5);
        f.store.put_quota("u1", &Quota { units: 5, public_ips: 0 }).unwrap();

        let mut vm = vm_request("box", Tier::Small);
        vm.public_ip = true;
        let err = f.admission.admit_vm(&vm).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InsufficientIpQuota { available: 0 }));

        let mut cluster = cluster_request("kube");
        cluster.public_ip = true;
        let err = f.admission.admit_cluster(&cluster).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InsufficientIpQuota { available: 0 }));

        assert_eq!(f.store.get_quota("u1").unwrap(), Some(Quota { units: 5, public_ips: 0 }));
        assert!(f.store.get_name_claim("box").unwrap().is_none());
    }

    async fn deploy_box(grid: &MemoryGrid) -> (u64, u64) {
        grid.batch_deploy_networks(&[NetworkDefinition {
            name: "vmboxNet".to_string(),
            nodes: vec![11],
            ip_range: NETWORK_IP_RANGE.to_string(),
            add_wg_access: false,
        }])
        .await
        .unwrap();
        grid.batch_deploy_vms(&[VmDefinition {
            name: "box".to_string(),
            node_id: 11,
            network_name: "vmboxNet".to_string(),
            flist: String::new(),
            entrypoint: String::new(),
            cpu: 1,
            memory_mb: 2048,
            disk_gb: 25,
            public_ip: false,
            planetary: true,
            ssh_keys: String::new(),
        }])
        .await
        .unwrap();
        let network = grid.load_network_state("vmboxNet").await.unwrap();
        let workload = grid.load_workload_state(&[11], "box").await.unwrap();
        (workload.node_contracts[&11], network.node_contracts[&11])
    }

    #[tokio::test]
    async fn unpersisted_record_cancels_the_deployment() {
        let f = fixture(3);
        let (workload, network) = deploy_box(&f.grid).await;
        assert_eq!(f.grid.contract_count(), 2);

        let err = f
            .admission
            .persist(DeploymentKind::Vm, "box", workload, network, || {
                Err(gridlease_state::StateError::Write("disk full".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::State(_)));
        assert_eq!(err.public_message(), crate::error::INTERNAL_ERROR_MSG);
        assert_eq!(f.grid.contract_count(), 0);
        assert!(f.grid.workload("box").is_none());
        assert!(f.grid.state().network("vmboxNet").is_none());
    }

    #[tokio::test]
    async fn persisted_record_keeps_the_deployment() {
        let f = fixture(3);
        let (workload, network) = deploy_box(&f.grid).await;

        f.admission
            .persist(DeploymentKind::Vm, "box", workload, network, || Ok(()))
            .await
            .unwrap();
        assert_eq!(f.grid.contract_count(), 2);
    }

    #[tokio::test]
    async fn commit_failure_after_persist_keeps_the_result() {
        let f = fixture(3);
        let reservation = f
            .admission
            .ledger
            .reserve("u1", DeploymentKind::Vm, &[Tier::Small], false)
            .unwrap();
        // A reservation whose quota row has disappeared cannot be committed.
        let orphan = Reservation {
            user_id: "ghost".to_string(),
            ..reservation
        };

        let value = f.admission.with_reservation(orphan, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(f.store.get_quota("u1").unwrap().unwrap().units, 2);
    }
}
