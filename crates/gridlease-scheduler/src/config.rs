//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use gridlease_grid::FarmId;

/// Intervals, timeouts, and deployment defaults for the scheduler tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the inbound request source is polled.
    pub request_interval_secs: u64,
    /// Batch tick interval.
    pub deploy_interval_secs: u64,
    /// Reaper interval.
    pub reap_interval_secs: u64,
    /// Days added to every expiration date on top of the package period.
    pub expiration_tolerance_days: u32,
    /// Upper bound on how long an admission waits for its batch.
    pub deployment_timeout_secs: u64,
    /// Node selection is restricted to this farm.
    pub farm_id: FarmId,
    pub vm_flist: String,
    pub vm_entrypoint: String,
    pub k8s_flist: String,
    pub cluster_token: String,
    /// Appended to every deployment's authorized keys.
    pub admin_ssh_key: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_interval_secs: 10,
            deploy_interval_secs: 30,
            reap_interval_secs: 86_400,
            expiration_tolerance_days: 0,
            deployment_timeout_secs: 600,
            farm_id: 1,
            vm_flist: "https://hub.grid.tf/tf-official-vms/ubuntu-22.04.flist".to_string(),
            vm_entrypoint: "/init.sh".to_string(),
            k8s_flist: "https://hub.grid.tf/tf-official-apps/threefoldtech-k3s-latest.flist"
                .to_string(),
            cluster_token: "random".to_string(),
            admin_ssh_key: None,
        }
    }
}

impl SchedulerConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_secs(self.request_interval_secs)
    }

    pub fn deploy_interval(&self) -> Duration {
        Duration::from_secs(self.deploy_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    /// The user's key plus the admin key, newline separated.
    pub fn ssh_keys_for(&self, user_key: &str) -> String {
        match self.admin_ssh_key.as_deref() {
            Some(admin) if !admin.trim().is_empty() => format!("{}\n{}", user_key.trim(), admin.trim()),
            _ => user_key.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.request_interval(), Duration::from_secs(10));
        assert_eq!(config.deploy_interval(), Duration::from_secs(30));
        assert_eq!(config.reap_interval(), Duration::from_secs(86_400));
        assert_eq!(config.farm_id, 1);
    }

    #[test]
    fn admin_key_is_appended() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.ssh_keys_for("ssh-ed25519 USER"), "ssh-ed25519 USER");

        config.admin_ssh_key = Some("ssh-ed25519 ADMIN".to_string());
        assert_eq!(
            config.ssh_keys_for("ssh-ed25519 USER\n"),
            "ssh-ed25519 USER\nssh-ed25519 ADMIN"
        );
    }
}
