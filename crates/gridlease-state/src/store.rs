//! StateStore — redb-backed record persistence for gridlease.
//!
//! Provides typed operations over users, packages, quota, inbound requests,
//! the pending-work queue, and deployment records. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports both
//! on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type StrTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent record store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "record store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory record store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory record store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [USERS, PACKAGES, QUOTAS, VMS, CLUSTERS, NAMES] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        txn.open_table(PENDING).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Keyed JSON helpers ─────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: StrTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: StrTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: StrTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn remove_key(&self, table: StrTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Users ──────────────────────────────────────────────────────

    /// Insert or update a user.
    pub fn put_user(&self, user: &User) -> StateResult<()> {
        self.put_json(USERS, &user.id, user)?;
        debug!(user_id = %user.id, "user stored");
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> StateResult<Option<User>> {
        self.get_json(USERS, user_id)
    }

    pub fn list_users(&self) -> StateResult<Vec<User>> {
        self.list_json(USERS)
    }

    // ── Packages ───────────────────────────────────────────────────

    pub fn put_package(&self, package: &Package) -> StateResult<()> {
        self.put_json(PACKAGES, &package.id, package)
    }

    pub fn get_package(&self, package_id: &str) -> StateResult<Option<Package>> {
        self.get_json(PACKAGES, package_id)
    }

    // ── Quota ──────────────────────────────────────────────────────

    /// Set a user's remaining quota unconditionally.
    pub fn put_quota(&self, user_id: &str, quota: &Quota) -> StateResult<()> {
        self.put_json(QUOTAS, user_id, quota)
    }

    pub fn get_quota(&self, user_id: &str) -> StateResult<Option<Quota>> {
        self.get_json(QUOTAS, user_id)
    }

    /// Read-check-write a user's quota inside one write transaction.
    ///
    /// `f` receives the current balance and returns the new one, or an error
    /// that aborts the transaction untouched. Returns `(before, after)` on
    /// success. Fails with `StateError::NotFound` if the user has no quota row.
    pub fn modify_quota<E>(
        &self,
        user_id: &str,
        f: impl FnOnce(&Quota) -> Result<Quota, E>,
    ) -> StateResult<Result<(Quota, Quota), E>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(QUOTAS).map_err(map_err!(Table))?;
            let current: Option<Quota> = match table.get(user_id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                None => None,
                Some(before) => match f(&before) {
                    Ok(after) => {
                        let bytes = encode(&after)?;
                        table
                            .insert(user_id, bytes.as_slice())
                            .map_err(map_err!(Write))?;
                        Some(Ok((before, after)))
                    }
                    Err(e) => Some(Err(e)),
                },
            }
        };

        match outcome {
            Some(Ok(pair)) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(%user_id, units = pair.1.units, public_ips = pair.1.public_ips, "quota updated");
                Ok(Ok(pair))
            }
            Some(Err(e)) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Ok(Err(e))
            }
            None => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(StateError::NotFound(format!("quota for user {user_id}")))
            }
        }
    }

    // ── Inbound requests ───────────────────────────────────────────

    /// Queue a deployment request for admission.
    pub fn submit_request(&self, request: &DeploymentRequest) -> StateResult<RequestRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            let id = next_sequence(&table)?;
            let now = Utc::now();
            record = RequestRecord {
                id,
                request: request.clone(),
                status: RequestStatus::Queued,
                message: None,
                record_id: None,
                submitted_at: now,
                updated_at: now,
            };
            let bytes = encode(&record)?;
            table.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(request_id = record.id, kind = %request.kind(), "request queued");
        Ok(record)
    }

    pub fn get_request(&self, id: u64) -> StateResult<Option<RequestRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Atomically move every `Queued` request to `Processing` and return them
    /// in submission order.
    pub fn claim_queued_requests(&self) -> StateResult<Vec<RequestRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut claimed = Vec::new();
        {
            let mut table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: RequestRecord = decode(value.value())?;
                if record.status == RequestStatus::Queued {
                    claimed.push(record);
                }
            }
            let now = Utc::now();
            for record in &mut claimed {
                record.status = RequestStatus::Processing;
                record.updated_at = now;
                let bytes = encode(&*record)?;
                table
                    .insert(record.id, bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    /// Requests currently in `status`, in submission order.
    pub fn requests_with_status(&self, status: RequestStatus) -> StateResult<Vec<RequestRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: RequestRecord = decode(value.value())?;
            if record.status == status {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Record the outcome of an admitted request.
    pub fn finish_request(
        &self,
        id: u64,
        status: RequestStatus,
        message: Option<String>,
        record_id: Option<RecordId>,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            let mut record: RequestRecord = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("request {id}"))),
            };
            record.status = status;
            record.message = message;
            record.record_id = record_id;
            record.updated_at = Utc::now();
            let bytes = encode(&record)?;
            table.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Pending-work queue ─────────────────────────────────────────

    /// Append an item to the pending-work queue. Returns its sequence number.
    pub fn push_pending<T: Serialize>(&self, item: &T) -> StateResult<u64> {
        let bytes = encode(item)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(PENDING).map_err(map_err!(Table))?;
            seq = next_sequence(&table)?;
            table.insert(seq, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// Remove and return every pending item in push order.
    ///
    /// Runs in one write transaction: a concurrent push lands either wholly
    /// before the drain (and is returned) or wholly after it (and stays).
    pub fn drain_pending<T: DeserializeOwned>(&self) -> StateResult<Vec<T>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut items = Vec::new();
        {
            let mut table = txn.open_table(PENDING).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                keys.push(key.value());
                items.push(decode(value.value())?);
            }
            for key in keys {
                table.remove(key).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(items)
    }

    pub fn pending_len(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    // ── VM records ─────────────────────────────────────────────────

    pub fn put_vm(&self, vm: &VmRecord) -> StateResult<()> {
        self.put_json(VMS, &vm.id, vm)?;
        debug!(vm_id = %vm.id, user_id = %vm.user_id, "vm record stored");
        Ok(())
    }

    pub fn get_vm(&self, id: &str) -> StateResult<Option<VmRecord>> {
        self.get_json(VMS, id)
    }

    pub fn list_all_vms(&self) -> StateResult<Vec<VmRecord>> {
        self.list_json(VMS)
    }

    pub fn list_vms_for_user(&self, user_id: &str) -> StateResult<Vec<VmRecord>> {
        let mut vms = self.list_all_vms()?;
        vms.retain(|vm| vm.user_id == user_id);
        Ok(vms)
    }

    /// Delete a VM record. Returns false if it was already gone.
    pub fn delete_vm(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove_key(VMS, id)?;
        debug!(vm_id = %id, existed, "vm record deleted");
        Ok(existed)
    }

    pub fn find_vm_by_name(&self, name: &str) -> StateResult<Option<VmRecord>> {
        Ok(self.list_all_vms()?.into_iter().find(|vm| vm.name == name))
    }

    // ── Cluster records ────────────────────────────────────────────

    pub fn put_cluster(&self, cluster: &ClusterRecord) -> StateResult<()> {
        self.put_json(CLUSTERS, &cluster.id, cluster)?;
        debug!(cluster_id = %cluster.id, user_id = %cluster.user_id, "cluster record stored");
        Ok(())
    }

    pub fn get_cluster(&self, id: &str) -> StateResult<Option<ClusterRecord>> {
        self.get_json(CLUSTERS, id)
    }

    pub fn list_all_clusters(&self) -> StateResult<Vec<ClusterRecord>> {
        self.list_json(CLUSTERS)
    }

    pub fn list_clusters_for_user(&self, user_id: &str) -> StateResult<Vec<ClusterRecord>> {
        let mut clusters = self.list_all_clusters()?;
        clusters.retain(|c| c.user_id == user_id);
        Ok(clusters)
    }

    /// Delete a cluster record with its master and workers. Returns false if
    /// it was already gone.
    pub fn delete_cluster(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove_key(CLUSTERS, id)?;
        debug!(cluster_id = %id, existed, "cluster record deleted");
        Ok(existed)
    }

    pub fn find_cluster_by_master(&self, master_name: &str) -> StateResult<Option<ClusterRecord>> {
        Ok(self
            .list_all_clusters()?
            .into_iter()
            .find(|c| c.master.name == master_name))
    }

    // ── Name claims ────────────────────────────────────────────────

    /// Claim a workload name for an in-flight admission.
    ///
    /// VM names and cluster master names share one namespace on the grid. The
    /// name is checked against outstanding claims and both record tables in
    /// the same write transaction that inserts the claim, so of two
    /// concurrent claims for one name exactly one wins. Returns false if the
    /// name is already claimed or belongs to a record.
    pub fn claim_name(&self, name: &str, claim: &NameClaim) -> StateResult<bool> {
        let bytes = encode(claim)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed = {
            let mut claims = txn.open_table(NAMES).map_err(map_err!(Table))?;
            let held = claims.get(name).map_err(map_err!(Read))?.is_some();
            let taken = held
                || any_record(&txn.open_table(VMS).map_err(map_err!(Table))?, |vm: &VmRecord| {
                    vm.name == name
                })?
                || any_record(
                    &txn.open_table(CLUSTERS).map_err(map_err!(Table))?,
                    |c: &ClusterRecord| c.master.name == name,
                )?;
            if !taken {
                claims.insert(name, bytes.as_slice()).map_err(map_err!(Write))?;
            }
            !taken
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, kind = %claim.kind, claimed, "name claim");
        Ok(claimed)
    }

    /// Drop a claim. Returns false if it was not held.
    pub fn release_name(&self, name: &str) -> StateResult<bool> {
        self.remove_key(NAMES, name)
    }

    pub fn get_name_claim(&self, name: &str) -> StateResult<Option<NameClaim>> {
        self.get_json(NAMES, name)
    }

    /// Drop every claim. Only safe while no admission is in flight.
    pub fn clear_name_claims(&self) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut names = Vec::new();
        {
            let mut table = txn.open_table(NAMES).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                names.push(key.value().to_string());
            }
            for name in &names {
                table.remove(name.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(names.len())
    }
}

fn any_record<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    matches: impl Fn(&T) -> bool,
) -> StateResult<bool> {
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        if matches(&decode(value.value())?) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Next key for a `u64`-keyed append-only table.
fn next_sequence(table: &redb::Table<'_, u64, &'static [u8]>) -> StateResult<u64> {
    let last = table.last().map_err(map_err!(Read))?;
    Ok(last.map(|(key, _)| key.value() + 1).unwrap_or(1))
}
