//! Quota Ledger.
//!
//! Quota is taken in three steps. `reserve` validates and decrements the
//! balance in one record-store transaction, so concurrent admissions for the
//! same user serialize and can never drive it negative. `release` gives a
//! reservation back when the deployment does not go through. `commit`
//! finalizes a reservation once the deployment record is persisted.

use std::sync::Arc;

use tracing::{debug, info, warn};

use gridlease_state::{DeploymentKind, Quota, StateError, StateStore, Tier};

use crate::error::{SchedulerError, SchedulerResult};
use crate::resources::ResourceCalculator;

/// Units and public IPs one deployment consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCharge {
    pub units: u32,
    pub public_ips: u32,
}

/// Quota taken out of a user's balance for one in-flight deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub user_id: String,
    pub charge: QuotaCharge,
    /// Balance right after the reservation was taken.
    pub balance: Quota,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: StateStore,
    calculator: Arc<ResourceCalculator>,
}

impl QuotaLedger {
    pub fn new(store: StateStore, calculator: Arc<ResourceCalculator>) -> Self {
        Self { store, calculator }
    }

    /// Check `tiers` (master first for clusters) against the given balance
    /// and return what the deployment costs.
    pub fn validate(
        &self,
        kind: DeploymentKind,
        tiers: &[Tier],
        public_ip: bool,
        available: &Quota,
    ) -> SchedulerResult<QuotaCharge> {
        let units: u32 = tiers.iter().map(|t| self.calculator.cost(*t)).sum();
        let public_ips = if public_ip { self.calculator.public_ip_cost() } else { 0 };

        if available.units < units {
            return Err(SchedulerError::InsufficientQuota {
                kind,
                available: available.units,
            });
        }
        if available.public_ips < public_ips {
            return Err(SchedulerError::InsufficientIpQuota {
                available: available.public_ips,
            });
        }
        Ok(QuotaCharge { units, public_ips })
    }

    /// Validate and decrement atomically.
    pub fn reserve(
        &self,
        user_id: &str,
        kind: DeploymentKind,
        tiers: &[Tier],
        public_ip: bool,
    ) -> SchedulerResult<Reservation> {
        let mut charge = None;
        let outcome = self
            .store
            .modify_quota(user_id, |current| {
                let c = self.validate(kind, tiers, public_ip, current)?;
                charge = Some(c);
                Ok::<_, SchedulerError>(Quota {
                    units: current.units - c.units,
                    public_ips: current.public_ips - c.public_ips,
                })
            })
            .map_err(|e| quota_error(user_id, e))?;

        let (_, balance) = outcome?;
        let charge = charge.ok_or_else(|| SchedulerError::QuotaNotFound(user_id.to_string()))?;
        debug!(%user_id, units = charge.units, public_ips = charge.public_ips, "quota reserved");
        Ok(Reservation {
            user_id: user_id.to_string(),
            charge,
            balance,
        })
    }

    /// Return a reservation to the user's balance.
    pub fn release(&self, reservation: &Reservation) -> SchedulerResult<Quota> {
        let c = reservation.charge;
        let (_, after) = self
            .store
            .modify_quota(&reservation.user_id, |current| {
                Ok::<_, SchedulerError>(Quota {
                    units: current.units.saturating_add(c.units),
                    public_ips: current.public_ips.saturating_add(c.public_ips),
                })
            })
            .map_err(|e| quota_error(&reservation.user_id, e))??;
        info!(user_id = %reservation.user_id, units = c.units, public_ips = c.public_ips, "quota released");
        Ok(after)
    }

    /// Finalize a reservation after its deployment record is persisted. The
    /// decrement already happened at reservation time; this confirms the
    /// quota row still exists.
    pub fn commit(&self, reservation: &Reservation) -> SchedulerResult<Quota> {
        let current = self
            .store
            .get_quota(&reservation.user_id)?
            .ok_or_else(|| SchedulerError::QuotaNotFound(reservation.user_id.clone()))?;
        if current.units > reservation.balance.units {
            warn!(
                user_id = %reservation.user_id,
                expected = reservation.balance.units,
                actual = current.units,
                "quota balance grew while a deployment was in flight"
            );
        }
        info!(user_id = %reservation.user_id, units = current.units, public_ips = current.public_ips, "quota committed");
        Ok(current)
    }
}

fn quota_error(user_id: &str, e: StateError) -> SchedulerError {
    if e.is_not_found() {
        SchedulerError::QuotaNotFound(user_id.to_string())
    } else {
        SchedulerError::State(e)
    }
}
