//! redb table definitions for the gridlease record store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Queue-like tables use `u64` sequence keys.

use redb::TableDefinition;

/// Users keyed by `{user_id}`.
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Packages keyed by `{package_id}`.
pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");

/// Remaining quota keyed by `{user_id}`.
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");

/// Inbound deployment requests keyed by submission sequence.
pub const REQUESTS: TableDefinition<u64, &[u8]> = TableDefinition::new("requests");

/// Admitted-but-not-yet-deployed work keyed by push sequence.
pub const PENDING: TableDefinition<u64, &[u8]> = TableDefinition::new("pending");

/// VM deployment records keyed by `{record_id}`.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Cluster deployment records keyed by `{record_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// In-flight workload name claims keyed by `{name}`. VMs and clusters share
/// this namespace.
pub const NAMES: TableDefinition<&str, &[u8]> = TableDefinition::new("names");
