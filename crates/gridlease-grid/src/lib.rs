//! gridlease-grid — the narrow capability interface to the compute grid.
//!
//! The orchestration engine never talks to a concrete grid SDK. It depends
//! only on [`GridClient`]: node queries, batched network/workload
//! provisioning, on-grid state lookups, and contract cancellation. Contract
//! signing and chain submission live behind the implementation.
//!
//! # Components
//!
//! - **`types`** — node filters, network and workload definitions, loaded state
//! - **`client`** — the `GridClient` trait
//! - **`tracking`** — per-node contract tracking and the network registry
//! - **`memory`** — `MemoryGrid`, an in-process simulated grid

pub mod client;
pub mod error;
pub mod memory;
pub mod tracking;
pub mod types;

pub use client::GridClient;
pub use error::{GridError, GridResult};
pub use memory::{CallKind, MemoryGrid};
pub use tracking::GridState;
pub use types::*;
