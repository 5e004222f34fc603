//! gridlease-state — embedded record store for gridlease.
//!
//! Backed by [redb](https://docs.rs/redb), holds users, packages, quota,
//! inbound deployment requests, the durable pending-work queue, and the
//! VM and cluster deployment records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Record tables are keyed by record ID; the request and pending tables use
//! monotonically increasing `u64` keys so iteration order is submission order.
//!
//! Every mutation runs in a single redb write transaction. redb serializes
//! write transactions, which is what gives quota updates their test-and-set
//! behaviour and makes a pending-queue drain atomic with respect to pushes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
