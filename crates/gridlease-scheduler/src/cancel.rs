//! Cancellation Path: tears a deployment's contracts down on the grid.

use std::sync::Arc;

use tracing::{debug, info};

use gridlease_grid::{ContractId, GridClient, GridError};
use gridlease_state::DeploymentKind;

use crate::error::SchedulerResult;

/// Grid-side name of the network that carries deployment `name`.
pub fn network_name(kind: DeploymentKind, name: &str) -> String {
    format!("{}{}Net", kind.prefix(), name)
}

#[derive(Clone)]
pub struct Canceller {
    grid: Arc<dyn GridClient>,
}

impl Canceller {
    pub fn new(grid: Arc<dyn GridClient>) -> Self {
        Self { grid }
    }

    /// Cancel the workload contract, then the network contract. The first
    /// failure aborts the rest. A contract the grid no longer knows counts
    /// as cancelled.
    pub async fn cancel(
        &self,
        kind: DeploymentKind,
        name: &str,
        workload_contract: ContractId,
        network_contract: ContractId,
    ) -> SchedulerResult<()> {
        self.cancel_one(workload_contract).await?;
        self.cancel_one(network_contract).await?;

        let state = self.grid.state();
        state.untrack_contracts(&[workload_contract, network_contract]);
        state.remove_network(&network_name(kind, name));

        info!(%kind, %name, workload_contract, network_contract, "deployment cancelled");
        Ok(())
    }

    async fn cancel_one(&self, contract_id: ContractId) -> SchedulerResult<()> {
        match self.grid.cancel_contract(contract_id).await {
            Ok(()) => Ok(()),
            Err(GridError::ContractNotFound(_)) => {
                debug!(contract_id, "contract already cancelled");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
