//! Deployment counter keyed by (user, tier, role).
//!
//! Counters are atomics behind a read-mostly map; a new key takes the write
//! lock once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use gridlease_state::Tier;

/// What part of a deployment a count refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Vm,
    Master,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Vm => "vm",
            Role::Master => "master",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Key {
    user_id: String,
    tier: Tier,
    role: Role,
}

/// One row of a counter snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentCount {
    pub user_id: String,
    pub tier: Tier,
    pub role: Role,
    pub count: u64,
}

#[derive(Default)]
pub struct DeploymentCounter {
    counts: RwLock<HashMap<Key, Arc<AtomicU64>>>,
}

impl DeploymentCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one deployed VM or cluster node.
    pub async fn record(&self, user_id: &str, tier: Tier, role: Role) {
        let key = Key {
            user_id: user_id.to_string(),
            tier,
            role,
        };
        let existing = self.counts.read().await.get(&key).cloned();
        let counter = match existing {
            Some(c) => c,
            None => self.counts.write().await.entry(key).or_default().clone(),
        };
        let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(%user_id, %tier, %role, total, "deployment counted");
    }

    /// All counters, sorted by user, tier, then role.
    pub async fn snapshot(&self) -> Vec<DeploymentCount> {
        let counts = self.counts.read().await;
        let mut rows: Vec<_> = counts
            .iter()
            .map(|(k, v)| DeploymentCount {
                user_id: k.user_id.clone(),
                tier: k.tier,
                role: k.role,
                count: v.load(Ordering::Relaxed),
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.user_id, a.tier, a.role).cmp(&(&b.user_id, b.tier, b.role))
        });
        rows
    }

    /// Sum across every key.
    pub async fn total(&self) -> u64 {
        self.counts
            .read()
            .await
            .values()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }
}
