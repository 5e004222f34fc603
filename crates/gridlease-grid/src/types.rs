//! Grid-side data types: node inventory, node filters, and the network and
//! workload definitions submitted in provisioning batches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use gridlease_state::{ContractId, NodeId};

/// Identifier of a farm, a capacity pool of nodes.
pub type FarmId = u64;

/// Private range every deployment network is carved from.
pub const NETWORK_IP_RANGE: &str = "10.20.0.0/16";

// ── Nodes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Up,
    Down,
    Standby,
}

/// Free capacity and capabilities of a grid node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub farm_id: FarmId,
    pub status: NodeStatus,
    pub free_cpu: u64,
    pub free_memory_gb: u64,
    pub free_disk_gb: u64,
    pub free_ips: u64,
    pub ipv4: bool,
    pub ipv6: bool,
}

/// Lower bounds and capability predicates a node must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Empty means any farm.
    pub farm_ids: Vec<FarmId>,
    pub min_free_cpu: u64,
    pub min_free_memory_gb: u64,
    pub min_free_disk_gb: u64,
    pub min_free_ips: u64,
    pub require_ipv4: bool,
    pub require_ipv6: bool,
    pub status: NodeStatus,
}

impl NodeFilter {
    /// Whether `node` satisfies every bound and predicate of this filter.
    pub fn accepts(&self, node: &NodeInfo) -> bool {
        if node.status != self.status {
            return false;
        }
        if !self.farm_ids.is_empty() && !self.farm_ids.contains(&node.farm_id) {
            return false;
        }
        if (self.require_ipv4 && !node.ipv4) || (self.require_ipv6 && !node.ipv6) {
            return false;
        }
        node.free_cpu >= self.min_free_cpu
            && node.free_memory_gb >= self.min_free_memory_gb
            && node.free_disk_gb >= self.min_free_disk_gb
            && node.free_ips >= self.min_free_ips
    }
}

// ── Definitions ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub name: String,
    pub nodes: Vec<NodeId>,
    pub ip_range: String,
    pub add_wg_access: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub name: String,
    pub node_id: NodeId,
    pub network_name: String,
    pub flist: String,
    pub entrypoint: String,
    pub cpu: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub public_ip: bool,
    pub planetary: bool,
    /// Newline-separated authorized keys.
    pub ssh_keys: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K8sNodeDefinition {
    pub name: String,
    pub node_id: NodeId,
    pub flist: String,
    pub cpu: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub public_ip: bool,
    pub planetary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDefinition {
    /// Solution name; the master's name.
    pub name: String,
    pub network_name: String,
    pub token: String,
    pub ssh_keys: String,
    pub master: K8sNodeDefinition,
    pub workers: Vec<K8sNodeDefinition>,
}

// ── Loaded state ──────────────────────────────────────────────────

/// A deployed network as loaded back from the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub ip_range: String,
    pub node_contracts: BTreeMap<NodeId, ContractId>,
}

/// A deployed VM or cluster as loaded back from the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub name: String,
    pub node_contracts: BTreeMap<NodeId, ContractId>,
    /// Computed public IPv4 (CIDR), if one was requested.
    pub public_ipv4: Option<String>,
    pub private_ip: Option<String>,
    pub planetary_ip: Option<String>,
}
