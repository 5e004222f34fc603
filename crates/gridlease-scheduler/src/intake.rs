//! Inbound orders.
//!
//! Orders arrive with tier names as plain strings. They are parsed into
//! typed [`DeploymentRequest`]s here so an unknown tier is rejected as a user
//! error before the request ever reaches the store.

use serde::{Deserialize, Serialize};
use tracing::info;

use gridlease_state::{
    ClusterRequest, DeploymentRequest, RequestRecord, StateStore, VmRequest, WorkerRequest,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::resources::parse_tier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOrder {
    pub name: String,
    pub tier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Order {
    Vm {
        name: String,
        tier: String,
        #[serde(default)]
        public_ip: bool,
        user_id: String,
        #[serde(default)]
        ssh_key: String,
        package_id: String,
    },
    Cluster {
        master_name: String,
        tier: String,
        #[serde(default)]
        public_ip: bool,
        user_id: String,
        #[serde(default)]
        ssh_key: String,
        package_id: String,
        #[serde(default)]
        workers: Vec<WorkerOrder>,
    },
}

fn require(field: &str, value: &str) -> SchedulerResult<()> {
    if value.trim().is_empty() {
        return Err(SchedulerError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

impl Order {
    pub fn parse(&self) -> SchedulerResult<DeploymentRequest> {
        match self {
            Order::Vm { name, tier, public_ip, user_id, ssh_key, package_id } => {
                require("name", name)?;
                require("user_id", user_id)?;
                Ok(DeploymentRequest::Vm(VmRequest {
                    name: name.clone(),
                    tier: parse_tier(tier)?,
                    public_ip: *public_ip,
                    user_id: user_id.clone(),
                    ssh_key: ssh_key.clone(),
                    package_id: package_id.clone(),
                }))
            }
            Order::Cluster {
                master_name,
                tier,
                public_ip,
                user_id,
                ssh_key,
                package_id,
                workers,
            } => {
                require("master_name", master_name)?;
                require("user_id", user_id)?;
                let workers = workers
                    .iter()
                    .map(|w| {
                        require("worker name", &w.name)?;
                        Ok(WorkerRequest {
                            name: w.name.clone(),
                            tier: parse_tier(&w.tier)?,
                        })
                    })
                    .collect::<SchedulerResult<Vec<_>>>()?;
                Ok(DeploymentRequest::Cluster(ClusterRequest {
                    master_name: master_name.clone(),
                    tier: parse_tier(tier)?,
                    public_ip: *public_ip,
                    user_id: user_id.clone(),
                    ssh_key: ssh_key.clone(),
                    package_id: package_id.clone(),
                    workers,
                }))
            }
        }
    }
}

/// Parse `order` and queue it for the request poller.
pub fn submit(store: &StateStore, order: &Order) -> SchedulerResult<RequestRecord> {
    let request = order.parse()?;
    let record = store.submit_request(&request)?;
    info!(
        request_id = record.id,
        kind = %request.kind(),
        name = request.name(),
        user_id = request.user_id(),
        "deployment request submitted"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlease_state::{RequestStatus, Tier};

    fn vm_order(tier: &str) -> Order {
        Order::Vm {
            name: "box".to_string(),
            tier: tier.to_string(),
            public_ip: true,
            user_id: "u1".to_string(),
            ssh_key: String::new(),
            package_id: "p1".to_string(),
        }
    }

    #[test]
    fn tiers_parse_case_insensitively() {
        let DeploymentRequest::Vm(vm) = vm_order("Medium").parse().unwrap() else {
            panic!("expected a vm request");
        };
        assert_eq!(vm.tier, Tier::Medium);
        assert!(vm.public_ip);
    }

    #[test]
    fn unknown_tier_is_a_user_error() {
        let err = vm_order("huge").parse().unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(err.public_message(), "unknown resource type huge");
    }

    #[test]
    fn unknown_worker_tier_rejects_the_whole_cluster() {
        let order = Order::Cluster {
            master_name: "kube".to_string(),
            tier: "small".to_string(),
            public_ip: false,
            user_id: "u1".to_string(),
            ssh_key: String::new(),
            package_id: "p1".to_string(),
            workers: vec![
                WorkerOrder { name: "w1".to_string(), tier: "large".to_string() },
                WorkerOrder { name: "w2".to_string(), tier: "xl".to_string() },
            ],
        };
        assert!(matches!(order.parse(), Err(SchedulerError::UnknownTier(_))));
    }

    #[test]
    fn empty_name_is_rejected() {
        let order = Order::Vm {
            name: " ".to_string(),
            tier: "small".to_string(),
            public_ip: false,
            user_id: "u1".to_string(),
            ssh_key: String::new(),
            package_id: "p1".to_string(),
        };
        assert!(matches!(order.parse(), Err(SchedulerError::InvalidRequest(_))));
    }

    #[test]
    fn orders_deserialize_from_toml() {
        let order: Order = toml::from_str(
            r#"
            kind = "cluster"
            master_name = "kube"
            tier = "small"
            user_id = "u1"
            package_id = "p1"

            [[workers]]
            name = "w1"
            tier = "medium"
            "#,
        )
        .unwrap();
        let DeploymentRequest::Cluster(k) = order.parse().unwrap() else {
            panic!("expected a cluster request");
        };
        assert_eq!(k.workers[0].tier, Tier::Medium);
        assert!(!k.public_ip);
    }

    #[test]
    fn submit_queues_the_request() {
        let store = StateStore::open_in_memory().unwrap();
        let record = submit(&store, &vm_order("small")).unwrap();
        assert_eq!(record.status, RequestStatus::Queued);
        assert_eq!(store.get_request(record.id).unwrap().unwrap().request.name(), "box");
        assert!(submit(&store, &vm_order("tiny")).is_err());
    }
}
