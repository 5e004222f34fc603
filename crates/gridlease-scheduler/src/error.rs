//! Scheduler error types.

use thiserror::Error;

use gridlease_state::{DeploymentKind, UnknownTier};

/// Message returned to callers for every infrastructure failure.
pub const INTERNAL_ERROR_MSG: &str = "Something went wrong";

/// Errors that can occur while admitting, deploying, or reaping deployments.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    UnknownTier(#[from] UnknownTier),

    #[error("no available quota {available} for {kind} deployment, you can request a new voucher")]
    InsufficientQuota { kind: DeploymentKind, available: u32 },

    #[error("no available quota {available} for public ips")]
    InsufficientIpQuota { available: u32 },

    #[error("{kind} name {name} is already taken")]
    DuplicateName { kind: DeploymentKind, name: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("package not found: {0}")]
    UnknownPackage(String),

    #[error("user not found: {0}")]
    UnknownUser(String),

    #[error("no node satisfies the requested resources")]
    NoCapacity,

    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    #[error("deployment {0} timed out waiting for a batch")]
    DeploymentTimedOut(String),

    #[error("quota not found for user {0}")]
    QuotaNotFound(String),

    #[error("invalid tier table: {0}")]
    InvalidTierTable(String),

    #[error("state store error: {0}")]
    State(#[from] gridlease_state::StateError),

    #[error("grid error: {0}")]
    Grid(#[from] gridlease_grid::GridError),
}

impl SchedulerError {
    /// User errors are surfaced verbatim and never retried.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnknownTier(_)
                | SchedulerError::InsufficientQuota { .. }
                | SchedulerError::InsufficientIpQuota { .. }
                | SchedulerError::DuplicateName { .. }
                | SchedulerError::InvalidRequest(_)
                | SchedulerError::UnknownPackage(_)
                | SchedulerError::UnknownUser(_)
        )
    }

    /// The message a caller is allowed to see. Infrastructure detail stays
    /// in the log.
    pub fn public_message(&self) -> String {
        if self.is_user_error() {
            self.to_string()
        } else {
            INTERNAL_ERROR_MSG.to_string()
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
