//! Resource Calculator: maps a size tier to its resource allotment and quota
//! cost.
//!
//! The tier table is injected at construction and immutable afterwards.

use serde::{Deserialize, Serialize};

use gridlease_state::{ResourceSnapshot, Tier};

use crate::error::{SchedulerError, SchedulerResult};

/// Allotment and cost of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub cpu: u64,
    pub memory_gb: u64,
    pub disk_gb: u64,
    pub quota_units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub small: TierSpec,
    pub medium: TierSpec,
    pub large: TierSpec,
    /// Public-IP quota consumed by a deployment that requests one.
    pub public_ip_units: u32,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            small: TierSpec { cpu: 1, memory_gb: 2, disk_gb: 25, quota_units: 1 },
            medium: TierSpec { cpu: 2, memory_gb: 4, disk_gb: 50, quota_units: 2 },
            large: TierSpec { cpu: 4, memory_gb: 8, disk_gb: 100, quota_units: 3 },
            public_ip_units: 1,
        }
    }
}

impl TierTable {
    pub fn spec(&self, tier: Tier) -> &TierSpec {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }

    /// Every dimension must strictly increase with tier order.
    pub fn validate(&self) -> SchedulerResult<()> {
        for pair in Tier::ALL.windows(2) {
            let (lo, hi) = (self.spec(pair[0]), self.spec(pair[1]));
            let dims = [
                ("cpu", lo.cpu, hi.cpu),
                ("memory_gb", lo.memory_gb, hi.memory_gb),
                ("disk_gb", lo.disk_gb, hi.disk_gb),
                ("quota_units", u64::from(lo.quota_units), u64::from(hi.quota_units)),
            ];
            for (dim, a, b) in dims {
                if a >= b {
                    return Err(SchedulerError::InvalidTierTable(format!(
                        "{dim} of {} ({a}) must be below {} ({b})",
                        pair[0], pair[1]
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Resources needed by one VM or cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTuple {
    pub cpu: u64,
    pub memory_gb: u64,
    pub disk_gb: u64,
    pub ip_count: u64,
}

impl ResourceTuple {
    pub fn memory_mb(&self) -> u64 {
        self.memory_gb * 1024
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu: self.cpu,
            memory_gb: self.memory_gb,
            disk_gb: self.disk_gb,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceCalculator {
    table: TierTable,
}

impl ResourceCalculator {
    pub fn new(table: TierTable) -> SchedulerResult<Self> {
        table.validate()?;
        Ok(Self { table })
    }

    pub fn resources(&self, tier: Tier, public_ip: bool) -> ResourceTuple {
        let spec = self.table.spec(tier);
        ResourceTuple {
            cpu: spec.cpu,
            memory_gb: spec.memory_gb,
            disk_gb: spec.disk_gb,
            ip_count: u64::from(public_ip),
        }
    }

    pub fn cost(&self, tier: Tier) -> u32 {
        self.table.spec(tier).quota_units
    }

    pub fn public_ip_cost(&self) -> u32 {
        self.table.public_ip_units
    }
}

/// Parse a caller-supplied tier name.
pub fn parse_tier(name: &str) -> SchedulerResult<Tier> {
    Ok(name.parse::<Tier>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> ResourceCalculator {
        ResourceCalculator::new(TierTable::default()).unwrap()
    }

    #[test]
    fn default_table_values() {
        let c = calc();
        assert_eq!(
            c.resources(Tier::Medium, false),
            ResourceTuple { cpu: 2, memory_gb: 4, disk_gb: 50, ip_count: 0 }
        );
        assert_eq!(c.resources(Tier::Large, true).ip_count, 1);
        assert_eq!(c.resources(Tier::Small, false).memory_mb(), 2048);
        assert_eq!(c.public_ip_cost(), 1);
    }

    #[test]
    fn cost_strictly_increases_with_tier() {
        let c = calc();
        let costs: Vec<u32> = Tier::ALL.iter().map(|t| c.cost(*t)).collect();
        assert_eq!(costs, vec![1, 2, 3]);
        assert!(costs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn resources_are_deterministic() {
        let c = calc();
        for tier in Tier::ALL {
            assert_eq!(c.resources(tier, true), c.resources(tier, true));
        }
    }

    #[test]
    fn non_increasing_table_is_rejected() {
        let mut table = TierTable::default();
        table.medium.disk_gb = 25;
        let err = ResourceCalculator::new(table).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTierTable(_)));

        let mut table = TierTable::default();
        table.large.quota_units = 2;
        assert!(ResourceCalculator::new(table).is_err());
    }

    #[test]
    fn unknown_tier_name_is_a_user_error() {
        let err = parse_tier("xlarge").unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(parse_tier("Large").unwrap(), Tier::Large);
    }
}
