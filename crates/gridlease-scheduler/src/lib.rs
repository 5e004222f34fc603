//! gridlease-scheduler — admission, batched grid deployment, and lifecycle
//! reaping.
//!
//! Turns user deployment requests into running VMs and Kubernetes clusters
//! on the grid, charging each user's quota exactly once per successful
//! deployment, and tears them down again when they expire.
//!
//! # Architecture
//!
//! ```text
//! RequestPoller (every request_interval)
//!   └── Admission, one task per claimed request
//!         ├── QuotaLedger::reserve   (validate + atomic decrement)
//!         ├── NodeSelector::select   (grid node query)
//!         ├── WorkQueue::push        ──┐
//!         └── PendingCompletion::wait  │ correlation id
//!                                      │
//! BatchDeployer (every deploy_interval)│
//!   ├── WorkQueue::drain_all         ◄─┘
//!   ├── networks, then VMs, then clusters in one call each
//!   └── CompletionRegistry::resolve per item
//!
//! Lifecycle (every reap_interval, VMs and clusters independently)
//!   └── Canceller: workload contract, then network contract
//! ```
//!
//! [`Orchestrator`] builds the components and owns the four periodic tasks.

pub mod admission;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod error;
pub mod intake;
pub mod orchestrator;
pub mod poller;
pub mod queue;
pub mod quota;
pub mod reaper;
pub mod resources;
pub mod selector;

pub use admission::{Admission, expiration_date};
pub use batch::{BatchDeployer, TickSummary};
pub use cancel::{Canceller, network_name};
pub use config::SchedulerConfig;
pub use error::{INTERNAL_ERROR_MSG, SchedulerError, SchedulerResult};
pub use intake::{Order, WorkerOrder};
pub use orchestrator::{Orchestrator, Running};
pub use poller::RequestPoller;
pub use queue::{CompletionRegistry, PendingCompletion, PendingWork, WorkQueue, Workload};
pub use quota::{QuotaCharge, QuotaLedger, Reservation};
pub use reaper::{Lifecycle, ReapSummary};
pub use resources::{ResourceCalculator, ResourceTuple, TierSpec, TierTable, parse_tier};
pub use selector::NodeSelector;
