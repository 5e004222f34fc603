//! In-process simulated grid.
//!
//! `MemoryGrid` keeps node capacity, contracts, networks, and workloads in
//! memory. Each batch is applied to a scratch copy and swapped in only when
//! every definition succeeds, so a failed batch leaves no partial state.
//! Individual calls can be made to fail on demand for exercising error paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::GridClient;
use crate::error::{GridError, GridResult};
use crate::tracking::GridState;
use crate::types::*;

/// Grid calls that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    FilterNodes,
    DeployNetworks,
    DeployVms,
    DeployClusters,
    LoadState,
    Cancel,
}

#[derive(Debug, Clone)]
enum Owner {
    Network(String),
    Workload(String),
}

/// Capacity held by a contract, returned to its node on cancel.
#[derive(Debug, Clone)]
struct ContractEntry {
    node_id: NodeId,
    owner: Owner,
    cpu: u64,
    memory_gb: u64,
    disk_gb: u64,
    ips: u64,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    nodes: BTreeMap<NodeId, NodeInfo>,
    contracts: HashMap<ContractId, ContractEntry>,
    networks: HashMap<String, NetworkInfo>,
    workloads: HashMap<String, WorkloadInfo>,
    next_contract: ContractId,
    next_host: u32,
}

/// Per-node demand of one workload, summed before capacity is checked.
#[derive(Debug, Default, Clone, Copy)]
struct Demand {
    cpu: u64,
    memory_gb: u64,
    disk_gb: u64,
    ips: u64,
}

impl Inner {
    fn allocate_contract(&mut self) -> ContractId {
        self.next_contract += 1;
        self.next_contract
    }

    fn allocate_host(&mut self) -> u32 {
        self.next_host += 1;
        self.next_host
    }

    fn reserve(&mut self, node_id: NodeId, demand: Demand) -> GridResult<()> {
        let node = self.nodes.get_mut(&node_id).ok_or_else(|| GridError::Capacity {
            node_id,
            reason: "unknown node".to_string(),
        })?;
        if node.status != NodeStatus::Up {
            return Err(GridError::Capacity {
                node_id,
                reason: "node is not up".to_string(),
            });
        }
        let short = if node.free_cpu < demand.cpu {
            Some("cpu")
        } else if node.free_memory_gb < demand.memory_gb {
            Some("memory")
        } else if node.free_disk_gb < demand.disk_gb {
            Some("disk")
        } else if node.free_ips < demand.ips {
            Some("public ips")
        } else {
            None
        };
        if let Some(resource) = short {
            return Err(GridError::Capacity {
                node_id,
                reason: format!("not enough {resource}"),
            });
        }
        node.free_cpu -= demand.cpu;
        node.free_memory_gb -= demand.memory_gb;
        node.free_disk_gb -= demand.disk_gb;
        node.free_ips -= demand.ips;
        Ok(())
    }

    fn ensure_on_network(&self, network: &str, node_id: NodeId) -> GridResult<()> {
        let net = self
            .networks
            .get(network)
            .ok_or_else(|| GridError::NetworkNotFound(network.to_string()))?;
        if !net.node_contracts.contains_key(&node_id) {
            return Err(GridError::Request(format!(
                "network {network} does not span node {node_id}"
            )));
        }
        Ok(())
    }

    fn deploy_network(&mut self, def: &NetworkDefinition) -> GridResult<NetworkInfo> {
        if self.networks.contains_key(&def.name) {
            return Err(GridError::Request(format!(
                "network {} already exists",
                def.name
            )));
        }
        let mut node_contracts = BTreeMap::new();
        for &node_id in &def.nodes {
            self.reserve(node_id, Demand::default())?;
            let contract_id = self.allocate_contract();
            self.contracts.insert(
                contract_id,
                ContractEntry {
                    node_id,
                    owner: Owner::Network(def.name.clone()),
                    cpu: 0,
                    memory_gb: 0,
                    disk_gb: 0,
                    ips: 0,
                },
            );
            node_contracts.insert(node_id, contract_id);
        }
        let info = NetworkInfo {
            name: def.name.clone(),
            ip_range: def.ip_range.clone(),
            node_contracts,
        };
        self.networks.insert(def.name.clone(), info.clone());
        Ok(info)
    }

    /// Deploy a workload whose nodes have the given per-node demand.
    fn deploy_workload(
        &mut self,
        name: &str,
        network: &str,
        demands: BTreeMap<NodeId, Demand>,
        public_ip: bool,
        planetary: bool,
    ) -> GridResult<WorkloadInfo> {
        if self.workloads.contains_key(name) {
            return Err(GridError::Request(format!("workload {name} already exists")));
        }
        let mut node_contracts = BTreeMap::new();
        for (&node_id, &demand) in &demands {
            self.ensure_on_network(network, node_id)?;
            self.reserve(node_id, demand)?;
            let contract_id = self.allocate_contract();
            self.contracts.insert(
                contract_id,
                ContractEntry {
                    node_id,
                    owner: Owner::Workload(name.to_string()),
                    cpu: demand.cpu,
                    memory_gb: demand.memory_gb,
                    disk_gb: demand.disk_gb,
                    ips: demand.ips,
                },
            );
            node_contracts.insert(node_id, contract_id);
        }
        let host = self.allocate_host();
        let info = WorkloadInfo {
            name: name.to_string(),
            node_contracts,
            public_ipv4: public_ip.then(|| format!("185.69.{}.{}/24", host / 250, host % 250 + 2)),
            private_ip: Some(format!("10.20.{}.{}", host / 250 + 2, host % 250 + 2)),
            planetary_ip: planetary.then(|| format!("300:{host:x}::1")),
        };
        self.workloads.insert(name.to_string(), info.clone());
        Ok(info)
    }

    fn cancel(&mut self, contract_id: ContractId) -> GridResult<Option<String>> {
        let entry = self
            .contracts
            .remove(&contract_id)
            .ok_or(GridError::ContractNotFound(contract_id))?;
        if let Some(node) = self.nodes.get_mut(&entry.node_id) {
            node.free_cpu += entry.cpu;
            node.free_memory_gb += entry.memory_gb;
            node.free_disk_gb += entry.disk_gb;
            node.free_ips += entry.ips;
        }
        match entry.owner {
            Owner::Network(name) => {
                if let Some(net) = self.networks.get_mut(&name) {
                    net.node_contracts.retain(|_, c| *c != contract_id);
                    if net.node_contracts.is_empty() {
                        self.networks.remove(&name);
                        return Ok(Some(name));
                    }
                }
            }
            Owner::Workload(name) => {
                if let Some(workload) = self.workloads.get_mut(&name) {
                    workload.node_contracts.retain(|_, c| *c != contract_id);
                    if workload.node_contracts.is_empty() {
                        self.workloads.remove(&name);
                    }
                }
            }
        }
        Ok(None)
    }
}

fn vm_demand(vm: &VmDefinition) -> Demand {
    Demand {
        cpu: vm.cpu,
        memory_gb: vm.memory_mb.div_ceil(1024),
        disk_gb: vm.disk_gb,
        ips: u64::from(vm.public_ip),
    }
}

fn cluster_demands(cluster: &ClusterDefinition) -> BTreeMap<NodeId, Demand> {
    let mut demands: BTreeMap<NodeId, Demand> = BTreeMap::new();
    for node in std::iter::once(&cluster.master).chain(&cluster.workers) {
        let d = demands.entry(node.node_id).or_default();
        d.cpu += node.cpu;
        d.memory_gb += node.memory_mb.div_ceil(1024);
        d.disk_gb += node.disk_gb;
        d.ips += u64::from(node.public_ip);
    }
    demands
}

/// A simulated grid backed by in-memory node inventory.
#[derive(Debug, Default)]
pub struct MemoryGrid {
    inner: Mutex<Inner>,
    failing: Mutex<HashSet<CallKind>>,
    calls: Mutex<HashMap<CallKind, usize>>,
    state: GridState,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryGrid {
    pub fn new(nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        let grid = Self::default();
        {
            let mut inner = lock(&grid.inner);
            for node in nodes {
                inner.nodes.insert(node.node_id, node);
            }
        }
        grid
    }

    /// Make every subsequent call of `kind` fail (or succeed again).
    pub fn set_failing(&self, kind: CallKind, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(kind);
        } else {
            set.remove(&kind);
        }
    }

    /// Number of times a call of `kind` has been made.
    pub fn calls(&self, kind: CallKind) -> usize {
        lock(&self.calls).get(&kind).copied().unwrap_or(0)
    }

    /// Current view of a node's free capacity.
    pub fn node(&self, node_id: NodeId) -> Option<NodeInfo> {
        lock(&self.inner).nodes.get(&node_id).cloned()
    }

    pub fn workload(&self, name: &str) -> Option<WorkloadInfo> {
        lock(&self.inner).workloads.get(name).cloned()
    }

    /// Number of live contracts of any kind.
    pub fn contract_count(&self) -> usize {
        lock(&self.inner).contracts.len()
    }

    fn enter(&self, kind: CallKind) -> GridResult<()> {
        *lock(&self.calls).entry(kind).or_insert(0) += 1;
        if lock(&self.failing).contains(&kind) {
            return Err(GridError::Request(format!("{kind:?} unavailable")));
        }
        Ok(())
    }

    /// Apply `f` to a scratch copy and commit it only on success.
    fn transact<T>(&self, f: impl FnOnce(&mut Inner) -> GridResult<T>) -> GridResult<T> {
        let mut inner = lock(&self.inner);
        let mut scratch = inner.clone();
        let out = f(&mut scratch)?;
        *inner = scratch;
        Ok(out)
    }

    fn track_workloads(&self, infos: &[WorkloadInfo]) {
        for info in infos {
            for (&node_id, &contract_id) in &info.node_contracts {
                self.state.track(node_id, contract_id);
            }
        }
    }
}

#[async_trait]
impl GridClient for MemoryGrid {
    async fn filter_nodes(&self, filter: &NodeFilter) -> GridResult<Vec<NodeInfo>> {
        self.enter(CallKind::FilterNodes)?;
        let inner = lock(&self.inner);
        Ok(inner
            .nodes
            .values()
            .filter(|n| filter.accepts(n))
            .cloned()
            .collect())
    }

    async fn batch_deploy_networks(&self, networks: &[NetworkDefinition]) -> GridResult<()> {
        self.enter(CallKind::DeployNetworks)?;
        let infos = self.transact(|inner| {
            networks
                .iter()
                .map(|def| inner.deploy_network(def))
                .collect::<GridResult<Vec<_>>>()
        })?;
        for info in infos {
            for (&node_id, &contract_id) in &info.node_contracts {
                self.state.track(node_id, contract_id);
            }
            self.state.register_network(info);
        }
        info!(count = networks.len(), "networks deployed");
        Ok(())
    }

    async fn batch_deploy_vms(&self, vms: &[VmDefinition]) -> GridResult<()> {
        self.enter(CallKind::DeployVms)?;
        let infos = self.transact(|inner| {
            vms.iter()
                .map(|vm| {
                    let demands = BTreeMap::from([(vm.node_id, vm_demand(vm))]);
                    inner.deploy_workload(&vm.name, &vm.network_name, demands, vm.public_ip, vm.planetary)
                })
                .collect::<GridResult<Vec<_>>>()
        })?;
        self.track_workloads(&infos);
        info!(count = vms.len(), "vms deployed");
        Ok(())
    }

    async fn batch_deploy_clusters(&self, clusters: &[ClusterDefinition]) -> GridResult<()> {
        self.enter(CallKind::DeployClusters)?;
        let infos = self.transact(|inner| {
            clusters
                .iter()
                .map(|k| {
                    inner.deploy_workload(
                        &k.name,
                        &k.network_name,
                        cluster_demands(k),
                        k.master.public_ip,
                        k.master.planetary,
                    )
                })
                .collect::<GridResult<Vec<_>>>()
        })?;
        self.track_workloads(&infos);
        info!(count = clusters.len(), "clusters deployed");
        Ok(())
    }

    async fn load_network_state(&self, name: &str) -> GridResult<NetworkInfo> {
        self.enter(CallKind::LoadState)?;
        lock(&self.inner)
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| GridError::NetworkNotFound(name.to_string()))
    }

    async fn load_workload_state(&self, nodes: &[NodeId], name: &str) -> GridResult<WorkloadInfo> {
        self.enter(CallKind::LoadState)?;
        lock(&self.inner)
            .workloads
            .get(name)
            .filter(|w| w.node_contracts.keys().any(|n| nodes.contains(n)))
            .cloned()
            .ok_or_else(|| GridError::WorkloadNotFound(name.to_string()))
    }

    async fn cancel_contract(&self, contract_id: ContractId) -> GridResult<()> {
        self.enter(CallKind::Cancel)?;
        let emptied = lock(&self.inner).cancel(contract_id)?;
        self.state.untrack_contracts(&[contract_id]);
        if let Some(network) = emptied {
            self.state.remove_network(&network);
        }
        debug!(contract_id, "contract cancelled");
        Ok(())
    }

    fn state(&self) -> &GridState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, cpu: u64) -> NodeInfo {
        NodeInfo {
            node_id: id,
            farm_id: 1,
            status: NodeStatus::Up,
            free_cpu: cpu,
            free_memory_gb: 16,
            free_disk_gb: 500,
            free_ips: 1,
            ipv4: true,
            ipv6: true,
        }
    }

    fn network(name: &str, node_id: NodeId) -> NetworkDefinition {
        NetworkDefinition {
            name: name.to_string(),
            nodes: vec![node_id],
            ip_range: NETWORK_IP_RANGE.to_string(),
            add_wg_access: false,
        }
    }

    fn vm(name: &str, node_id: NodeId, cpu: u64) -> VmDefinition {
        VmDefinition {
            name: name.to_string(),
            node_id,
            network_name: format!("vm{name}Net"),
            flist: "https://hub.example/ubuntu.flist".to_string(),
            entrypoint: "/sbin/zinit init".to_string(),
            cpu,
            memory_mb: 2048,
            disk_gb: 25,
            public_ip: false,
            planetary: true,
            ssh_keys: "ssh-ed25519 AAAA".to_string(),
        }
    }

    #[tokio::test]
    async fn deploy_vm_consumes_capacity_and_tracks_contracts() {
        let grid = MemoryGrid::new([node(1, 8)]);
        grid.batch_deploy_networks(&[network("vmboxNet", 1)]).await.unwrap();
        grid.batch_deploy_vms(&[vm("box", 1, 2)]).await.unwrap();

        let n = grid.node(1).unwrap();
        assert_eq!(n.free_cpu, 6);
        assert_eq!(n.free_memory_gb, 14);
        assert_eq!(n.free_disk_gb, 475);

        let net = grid.load_network_state("vmboxNet").await.unwrap();
        let wl = grid.load_workload_state(&[1], "box").await.unwrap();
        assert!(wl.planetary_ip.is_some());
        assert!(wl.public_ipv4.is_none());

        let tracked = grid.state().contracts_on(1);
        assert!(tracked.contains(&net.node_contracts[&1]));
        assert!(tracked.contains(&wl.node_contracts[&1]));
        assert!(grid.state().network("vmboxNet").is_some());
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_state() {
        let grid = MemoryGrid::new([node(1, 3)]);
        grid.batch_deploy_networks(&[network("vmaNet", 1), network("vmbNet", 1)])
            .await
            .unwrap();

        let mut b = vm("b", 1, 2);
        b.network_name = "vmbNet".to_string();
        let err = grid
            .batch_deploy_vms(&[vm("a", 1, 2), b])
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Capacity { node_id: 1, .. }));

        assert_eq!(grid.node(1).unwrap().free_cpu, 3);
        assert!(grid.workload("a").is_none());
        assert_eq!(grid.contract_count(), 2);
    }

    #[tokio::test]
    async fn vm_requires_its_network() {
        let grid = MemoryGrid::new([node(1, 8)]);
        let err = grid.batch_deploy_vms(&[vm("box", 1, 1)]).await.unwrap_err();
        assert!(matches!(err, GridError::NetworkNotFound(_)));
    }

    #[tokio::test]
    async fn cluster_demand_is_summed_per_node() {
        let grid = MemoryGrid::new([node(1, 2)]);
        grid.batch_deploy_networks(&[network("k8smNet", 1)]).await.unwrap();

        let k8s = |name: &str| K8sNodeDefinition {
            name: name.to_string(),
            node_id: 1,
            flist: "k3s.flist".to_string(),
            cpu: 1,
            memory_mb: 2048,
            disk_gb: 25,
            public_ip: false,
            planetary: true,
        };
        let cluster = ClusterDefinition {
            name: "m".to_string(),
            network_name: "k8smNet".to_string(),
            token: "secret".to_string(),
            ssh_keys: String::new(),
            master: k8s("m"),
            workers: vec![k8s("w1"), k8s("w2")],
        };
        let err = grid.batch_deploy_clusters(&[cluster.clone()]).await.unwrap_err();
        assert!(matches!(err, GridError::Capacity { .. }));

        let mut smaller = cluster;
        smaller.workers.pop();
        grid.batch_deploy_clusters(&[smaller]).await.unwrap();
        assert_eq!(grid.node(1).unwrap().free_cpu, 0);
        assert_eq!(grid.workload("m").unwrap().node_contracts.len(), 1);
    }

    #[tokio::test]
    async fn cancel_returns_capacity_and_untracks() {
        let grid = MemoryGrid::new([node(1, 8)]);
        grid.batch_deploy_networks(&[network("vmboxNet", 1)]).await.unwrap();
        let mut def = vm("box", 1, 2);
        def.public_ip = true;
        grid.batch_deploy_vms(&[def]).await.unwrap();
        assert_eq!(grid.node(1).unwrap().free_ips, 0);

        let wl = grid.load_workload_state(&[1], "box").await.unwrap();
        let net = grid.load_network_state("vmboxNet").await.unwrap();
        grid.cancel_contract(wl.node_contracts[&1]).await.unwrap();
        grid.cancel_contract(net.node_contracts[&1]).await.unwrap();

        let n = grid.node(1).unwrap();
        assert_eq!((n.free_cpu, n.free_ips), (8, 1));
        assert!(grid.state().contracts_on(1).is_empty());
        assert!(grid.state().network("vmboxNet").is_none());
        assert!(matches!(
            grid.load_network_state("vmboxNet").await,
            Err(GridError::NetworkNotFound(_))
        ));

        let err = grid.cancel_contract(wl.node_contracts[&1]).await.unwrap_err();
        assert!(matches!(err, GridError::ContractNotFound(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let grid = MemoryGrid::new([node(1, 8)]);
        grid.set_failing(CallKind::FilterNodes, true);
        let filter = NodeFilter {
            farm_ids: vec![],
            min_free_cpu: 0,
            min_free_memory_gb: 0,
            min_free_disk_gb: 0,
            min_free_ips: 0,
            require_ipv4: false,
            require_ipv6: false,
            status: NodeStatus::Up,
        };
        assert!(grid.filter_nodes(&filter).await.is_err());

        grid.set_failing(CallKind::FilterNodes, false);
        assert_eq!(grid.filter_nodes(&filter).await.unwrap().len(), 1);
        assert_eq!(grid.calls(CallKind::FilterNodes), 2);
        assert_eq!(grid.calls(CallKind::DeployVms), 0);
    }

    #[tokio::test]
    async fn workload_lookup_is_scoped_to_nodes() {
        let grid = MemoryGrid::new([node(1, 8), node(2, 8)]);
        grid.batch_deploy_networks(&[network("vmboxNet", 1)]).await.unwrap();
        grid.batch_deploy_vms(&[vm("box", 1, 1)]).await.unwrap();

        assert!(grid.load_workload_state(&[2], "box").await.is_err());
        assert!(grid.load_workload_state(&[2, 1], "box").await.is_ok());
    }
}
