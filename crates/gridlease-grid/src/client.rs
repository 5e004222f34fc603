//! The grid capability trait.

use async_trait::async_trait;

use crate::error::GridResult;
use crate::tracking::GridState;
use crate::types::*;

/// Everything the orchestration engine needs from the compute grid.
///
/// Batch calls are all-or-nothing from the caller's point of view: an `Err`
/// means none of the definitions in that call may be assumed deployed.
#[async_trait]
pub trait GridClient: Send + Sync {
    /// Nodes matching `filter`, in the grid's own ordering.
    async fn filter_nodes(&self, filter: &NodeFilter) -> GridResult<Vec<NodeInfo>>;

    async fn batch_deploy_networks(&self, networks: &[NetworkDefinition]) -> GridResult<()>;

    async fn batch_deploy_vms(&self, vms: &[VmDefinition]) -> GridResult<()>;

    async fn batch_deploy_clusters(&self, clusters: &[ClusterDefinition]) -> GridResult<()>;

    /// Load a deployed network by name.
    async fn load_network_state(&self, name: &str) -> GridResult<NetworkInfo>;

    /// Load a deployed VM or cluster (by master name) on one of `nodes`.
    async fn load_workload_state(&self, nodes: &[NodeId], name: &str) -> GridResult<WorkloadInfo>;

    /// Cancel a contract with the client's signing identity.
    async fn cancel_contract(&self, contract_id: ContractId) -> GridResult<()>;

    /// Client-side deployment-state tracking.
    fn state(&self) -> &GridState;
}
