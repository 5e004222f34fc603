//! Node Selector: builds node filters from resource demand and picks a node.

use std::sync::Arc;

use tracing::{debug, warn};

use gridlease_grid::{FarmId, GridClient, NodeFilter, NodeId, NodeStatus};
use gridlease_state::Tier;

use crate::error::{SchedulerError, SchedulerResult};
use crate::resources::{ResourceCalculator, ResourceTuple};

pub struct NodeSelector {
    grid: Arc<dyn GridClient>,
    calculator: Arc<ResourceCalculator>,
    farm_id: FarmId,
}

impl NodeSelector {
    pub fn new(grid: Arc<dyn GridClient>, calculator: Arc<ResourceCalculator>, farm_id: FarmId) -> Self {
        Self { grid, calculator, farm_id }
    }

    fn base_filter(&self, demand: ResourceTuple) -> NodeFilter {
        NodeFilter {
            farm_ids: vec![self.farm_id],
            min_free_cpu: demand.cpu,
            min_free_memory_gb: demand.memory_gb,
            min_free_disk_gb: demand.disk_gb,
            min_free_ips: demand.ip_count,
            require_ipv4: false,
            require_ipv6: true,
            status: NodeStatus::Up,
        }
    }

    /// Filter for a single VM. VMs additionally need IPv4 reachability.
    pub fn vm_filter(&self, tier: Tier, public_ip: bool) -> NodeFilter {
        let mut filter = self.base_filter(self.calculator.resources(tier, public_ip));
        filter.require_ipv4 = true;
        filter
    }

    /// Filter for a whole cluster on one node: compute, memory, and storage
    /// are summed across the master and every worker. Only the master may
    /// hold a public IP.
    pub fn cluster_filter(&self, master: Tier, public_ip: bool, workers: &[Tier]) -> NodeFilter {
        let demand = workers.iter().fold(
            self.calculator.resources(master, public_ip),
            |acc, &tier| {
                let w = self.calculator.resources(tier, false);
                ResourceTuple {
                    cpu: acc.cpu + w.cpu,
                    memory_gb: acc.memory_gb + w.memory_gb,
                    disk_gb: acc.disk_gb + w.disk_gb,
                    ip_count: acc.ip_count,
                }
            },
        );
        self.base_filter(demand)
    }

    /// First node, in the grid's ordering, that satisfies `filter`.
    pub async fn select(&self, filter: &NodeFilter) -> SchedulerResult<NodeId> {
        let nodes = self.grid.filter_nodes(filter).await.map_err(|e| {
            warn!(error = %e, "node query failed");
            SchedulerError::TransientInfra(format!("node query failed: {e}"))
        })?;

        let node = nodes
            .iter()
            .find(|n| filter.accepts(n))
            .ok_or(SchedulerError::NoCapacity)?;
        debug!(node_id = node.node_id, candidates = nodes.len(), "node selected");
        Ok(node.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlease_grid::{CallKind, MemoryGrid, NodeInfo};

    use crate::resources::TierTable;

    fn node(id: NodeId, cpu: u64, ipv4: bool) -> NodeInfo {
        NodeInfo {
            node_id: id,
            farm_id: 1,
            status: NodeStatus::Up,
            free_cpu: cpu,
            free_memory_gb: 32,
            free_disk_gb: 1000,
            free_ips: 1,
            ipv4,
            ipv6: true,
        }
    }

    fn selector(nodes: Vec<NodeInfo>) -> (Arc<MemoryGrid>, NodeSelector) {
        let grid = Arc::new(MemoryGrid::new(nodes));
        let calc = Arc::new(ResourceCalculator::new(TierTable::default()).unwrap());
        (grid.clone(), NodeSelector::new(grid, calc, 1))
    }

    #[test]
    fn cluster_filter_sums_every_dimension() {
        let (_, s) = selector(vec![]);
        let f = s.cluster_filter(Tier::Small, true, &[Tier::Medium, Tier::Small]);
        assert_eq!(f.min_free_cpu, 1 + 2 + 1);
        assert_eq!(f.min_free_memory_gb, 2 + 4 + 2);
        assert_eq!(f.min_free_disk_gb, 25 + 50 + 25);
        assert_eq!(f.min_free_ips, 1);
        assert!(!f.require_ipv4);
        assert_eq!(f.farm_ids, vec![1]);
    }

    #[test]
    fn vm_filter_requires_ipv4() {
        let (_, s) = selector(vec![]);
        let f = s.vm_filter(Tier::Large, false);
        assert!(f.require_ipv4 && f.require_ipv6);
        assert_eq!((f.min_free_cpu, f.min_free_ips), (4, 0));
    }

    #[tokio::test]
    async fn selects_first_satisfying_node() {
        let (_, s) = selector(vec![node(1, 1, true), node(2, 8, false), node(3, 8, true), node(4, 8, true)]);
        let f = s.vm_filter(Tier::Medium, false);
        assert_eq!(s.select(&f).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn no_candidate_is_no_capacity() {
        let (_, s) = selector(vec![node(1, 1, true)]);
        let f = s.vm_filter(Tier::Large, false);
        assert!(matches!(s.select(&f).await, Err(SchedulerError::NoCapacity)));
    }

    #[tokio::test]
    async fn grid_failure_is_transient() {
        let (grid, s) = selector(vec![node(1, 8, true)]);
        grid.set_failing(CallKind::FilterNodes, true);
        let f = s.vm_filter(Tier::Small, false);
        let err = s.select(&f).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TransientInfra(_)));
        assert!(!err.is_user_error());
    }
}
