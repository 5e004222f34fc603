//! gridlease.toml configuration and startup seeding.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use gridlease_grid::{FarmId, NodeId, NodeInfo, NodeStatus};
use gridlease_scheduler::{Order, ResourceCalculator, SchedulerConfig, TierTable, intake};
use gridlease_state::{Package, Quota, RequestStatus, StateStore, User};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub scheduler: SchedulerConfig,
    pub tiers: TierTable,
    pub state: StateConfig,
    pub grid: GridConfig,
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/gridlease"),
        }
    }
}

impl StateConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("gridlease.redb")
    }
}

/// Node inventory of the simulated grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub farm_id: FarmId,
    #[serde(default = "default_status")]
    pub status: NodeStatus,
    pub cpu: u64,
    pub memory_gb: u64,
    pub disk_gb: u64,
    #[serde(default)]
    pub public_ips: u64,
    #[serde(default = "yes")]
    pub ipv4: bool,
    #[serde(default = "yes")]
    pub ipv6: bool,
}

fn default_status() -> NodeStatus {
    NodeStatus::Up
}

fn yes() -> bool {
    true
}

impl From<&NodeConfig> for NodeInfo {
    fn from(node: &NodeConfig) -> Self {
        NodeInfo {
            node_id: node.node_id,
            farm_id: node.farm_id,
            status: node.status,
            free_cpu: node.cpu,
            free_memory_gb: node.memory_gb,
            free_disk_gb: node.disk_gb,
            free_ips: node.public_ips,
            ipv4: node.ipv4,
            ipv6: node.ipv6,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub users: Vec<SeedUser>,
    pub packages: Vec<Package>,
    pub requests: Vec<Order>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub ssh_key: String,
    #[serde(default)]
    pub units: u32,
    #[serde(default)]
    pub public_ips: u32,
}

/// What [`DaemonConfig::apply_seed`] wrote.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub users: usize,
    pub packages: usize,
    pub requests: usize,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scheduler;
        for (key, value) in [
            ("request_interval_secs", s.request_interval_secs),
            ("deploy_interval_secs", s.deploy_interval_secs),
            ("reap_interval_secs", s.reap_interval_secs),
            ("deployment_timeout_secs", s.deployment_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("scheduler.{key} must be greater than zero");
            }
        }
        ResourceCalculator::new(self.tiers.clone())?;
        if !self.grid.nodes.iter().any(|n| n.farm_id == self.scheduler.farm_id) {
            anyhow::bail!("no grid node belongs to farm {}", self.scheduler.farm_id);
        }
        Ok(())
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.grid.nodes.iter().map(NodeInfo::from).collect()
    }

    /// Write the bootstrap records. Existing users keep their quota, and a
    /// seeded request is only submitted once.
    pub fn apply_seed(&self, store: &StateStore) -> anyhow::Result<SeedSummary> {
        let mut summary = SeedSummary::default();

        for user in &self.seed.users {
            if store.get_user(&user.id)?.is_some() {
                debug!(user_id = %user.id, "seed user already present");
                continue;
            }
            store.put_user(&User {
                id: user.id.clone(),
                name: user.name.clone(),
                email: user.email.clone(),
                ssh_key: user.ssh_key.clone(),
                created_at: Utc::now(),
            })?;
            store.put_quota(
                &user.id,
                &Quota {
                    units: user.units,
                    public_ips: user.public_ips,
                },
            )?;
            summary.users += 1;
        }

        for package in &self.seed.packages {
            store.put_package(package)?;
            summary.packages += 1;
        }

        let mut known = Vec::new();
        for status in [RequestStatus::Queued, RequestStatus::Processing, RequestStatus::Deployed] {
            known.extend(
                store
                    .requests_with_status(status)?
                    .into_iter()
                    .map(|r| r.request.name().to_string()),
            );
        }
        for order in &self.seed.requests {
            let request = order.parse()?;
            if known.iter().any(|name| name == request.name()) {
                debug!(name = request.name(), "seed request already submitted");
                continue;
            }
            intake::submit(store, order)?;
            known.push(request.name().to_string());
            summary.requests += 1;
        }

        info!(
            users = summary.users,
            packages = summary.packages,
            requests = summary.requests,
            "seed applied"
        );
        Ok(summary)
    }
}
