//! gridlease-metrics — deployment observability.
//!
//! Counts successful deployments keyed by user, tier, and role, and renders
//! them in the Prometheus text exposition format.
//!
//! ```text
//! DeploymentCounter
//!   ├── record()   ← called by admission after a record is persisted
//!   └── snapshot() → Vec<DeploymentCount>
//!
//! render_prometheus(&[DeploymentCount]) → text/plain
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{DeploymentCount, DeploymentCounter, Role};
pub use prometheus::render_prometheus;
