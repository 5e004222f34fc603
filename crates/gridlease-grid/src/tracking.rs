//! Client-side deployment-state tracking.
//!
//! Mirrors what the grid client believes is deployed: contract IDs per node
//! and a registry of networks by name. Deploys add to it; the cancellation
//! path removes from it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{ContractId, NetworkInfo, NodeId};

#[derive(Debug, Default)]
struct Tracked {
    node_deployments: HashMap<NodeId, Vec<ContractId>>,
    networks: HashMap<String, NetworkInfo>,
}

/// Per-node contract tracking and network registry.
#[derive(Debug, Default)]
pub struct GridState {
    inner: Mutex<Tracked>,
}

impl GridState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `contract_id` is deployed on `node_id`.
    pub fn track(&self, node_id: NodeId, contract_id: ContractId) {
        let mut inner = self.lock();
        let contracts = inner.node_deployments.entry(node_id).or_default();
        if !contracts.contains(&contract_id) {
            contracts.push(contract_id);
        }
    }

    pub fn contracts_on(&self, node_id: NodeId) -> Vec<ContractId> {
        self.lock()
            .node_deployments
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the given contracts from every node's tracking list.
    pub fn untrack_contracts(&self, contract_ids: &[ContractId]) {
        let mut inner = self.lock();
        for contracts in inner.node_deployments.values_mut() {
            contracts.retain(|c| !contract_ids.contains(c));
        }
    }

    pub fn register_network(&self, network: NetworkInfo) {
        self.lock().networks.insert(network.name.clone(), network);
    }

    pub fn network(&self, name: &str) -> Option<NetworkInfo> {
        self.lock().networks.get(name).cloned()
    }

    /// Remove a network from the registry. Returns true if it was present.
    pub fn remove_network(&self, name: &str) -> bool {
        self.lock().networks.remove(name).is_some()
    }
}
