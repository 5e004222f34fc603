//! Domain types for the gridlease record store.
//!
//! These types represent users, their remaining quota, the packages that
//! bound a deployment's lifetime, inbound deployment requests, and the
//! persisted VM and cluster records. All types are serializable to/from JSON
//! for storage in redb tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a user.
pub type UserId = String;

/// Unique identifier for a persisted deployment record.
pub type RecordId = String;

/// Grid node identifier.
pub type NodeId = u32;

/// Grid contract identifier for a deployed network or workload.
pub type ContractId = u64;

// ── Tier ──────────────────────────────────────────────────────────

/// Size tier of a VM or cluster node. Ordered `Small < Medium < Large`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

/// A tier name outside `small|medium|large`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource type {0}")]
pub struct UnknownTier(pub String);

impl Tier {
    /// All tiers in ascending order.
    pub const ALL: [Tier; 3] = [Tier::Small, Tier::Medium, Tier::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(Tier::Small),
            "medium" => Ok(Tier::Medium),
            "large" => Ok(Tier::Large),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

// ── Users, packages, quota ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    /// Public SSH key injected into every deployment the user owns.
    pub ssh_key: String,
    pub created_at: DateTime<Utc>,
}

/// A subscription package; bounds how long a deployment lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub period_months: u32,
}

/// Remaining quota for a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quota {
    /// Remaining compute units.
    pub units: u32,
    /// Remaining public IPv4 addresses.
    pub public_ips: u32,
}

// ── Requests ──────────────────────────────────────────────────────

/// Which kind of deployable unit a request or record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Vm,
    Cluster,
}

impl DeploymentKind {
    /// Prefix used when deriving grid-side names (`vm`, `k8s`).
    pub fn prefix(&self) -> &'static str {
        match self {
            DeploymentKind::Vm => "vm",
            DeploymentKind::Cluster => "k8s",
        }
    }
}

impl fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentKind::Vm => f.write_str("vm"),
            DeploymentKind::Cluster => f.write_str("cluster"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmRequest {
    pub name: String,
    pub tier: Tier,
    pub public_ip: bool,
    pub user_id: UserId,
    pub ssh_key: String,
    pub package_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRequest {
    pub name: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRequest {
    pub master_name: String,
    /// Tier of the master node.
    pub tier: Tier,
    /// Only the master may request a public IP.
    pub public_ip: bool,
    pub user_id: UserId,
    pub ssh_key: String,
    pub package_id: String,
    pub workers: Vec<WorkerRequest>,
}

/// A user-facing deployment request. Immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploymentRequest {
    Vm(VmRequest),
    Cluster(ClusterRequest),
}

impl DeploymentRequest {
    pub fn kind(&self) -> DeploymentKind {
        match self {
            DeploymentRequest::Vm(_) => DeploymentKind::Vm,
            DeploymentRequest::Cluster(_) => DeploymentKind::Cluster,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            DeploymentRequest::Vm(vm) => &vm.user_id,
            DeploymentRequest::Cluster(k) => &k.user_id,
        }
    }

    /// The VM name, or the cluster's master name.
    pub fn name(&self) -> &str {
        match self {
            DeploymentRequest::Vm(vm) => &vm.name,
            DeploymentRequest::Cluster(k) => &k.master_name,
        }
    }
}

/// Processing status of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Deployed,
    Failed,
}

/// An inbound request together with its processing outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub id: u64,
    pub request: DeploymentRequest,
    pub status: RequestStatus,
    /// Caller-facing failure message, set when `status` is `Failed`.
    pub message: Option<String>,
    /// ID of the created record, set when `status` is `Deployed`.
    pub record_id: Option<RecordId>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A workload name held by an admission that has not persisted its record
/// yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameClaim {
    pub kind: DeploymentKind,
    pub user_id: UserId,
    pub claimed_at: DateTime<Utc>,
}

// ── Deployment records ────────────────────────────────────────────

/// Resources allotted to one VM or cluster node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub cpu: u64,
    pub memory_gb: u64,
    pub disk_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmRecord {
    pub id: RecordId,
    pub user_id: UserId,
    pub name: String,
    pub tier: Tier,
    pub public_ip: bool,
    pub node_id: NodeId,
    pub contract_id: ContractId,
    pub network_contract_id: ContractId,
    pub resources: ResourceSnapshot,
    pub public_ipv4: Option<String>,
    pub private_ip: Option<String>,
    pub planetary_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterRecord {
    pub name: String,
    pub tier: Tier,
    pub public_ip: bool,
    pub resources: ResourceSnapshot,
    pub public_ipv4: Option<String>,
    pub planetary_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub name: String,
    pub tier: Tier,
    pub resources: ResourceSnapshot,
}

/// A cluster record embeds its master and workers, so deleting it cascades.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRecord {
    pub id: RecordId,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub cluster_contract_id: ContractId,
    pub network_contract_id: ContractId,
    pub master: MasterRecord,
    pub workers: Vec<WorkerRecord>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

impl ClusterRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(Tier::Small < Tier::Medium);
        assert!(Tier::Medium < Tier::Large);
        assert_eq!(Tier::ALL.iter().max(), Some(&Tier::Large));
    }

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("small".parse::<Tier>(), Ok(Tier::Small));
        assert_eq!(" Medium ".parse::<Tier>(), Ok(Tier::Medium));
        assert_eq!("LARGE".parse::<Tier>(), Ok(Tier::Large));
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let err = "huge".parse::<Tier>().unwrap_err();
        assert_eq!(err, UnknownTier("huge".to_string()));
        assert_eq!(err.to_string(), "unknown resource type huge");
    }

    #[test]
    fn request_serializes_with_kind_tag() {
        let req = DeploymentRequest::Vm(VmRequest {
            name: "box".to_string(),
            tier: Tier::Small,
            public_ip: false,
            user_id: "u1".to_string(),
            ssh_key: "ssh-ed25519 AAAA".to_string(),
            package_id: "p1".to_string(),
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "vm");
        assert_eq!(json["tier"], "small");
    }

    #[test]
    fn kind_prefixes() {
        assert_eq!(DeploymentKind::Vm.prefix(), "vm");
        assert_eq!(DeploymentKind::Cluster.prefix(), "k8s");
    }
}
