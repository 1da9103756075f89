//! The durable store contract
//!
//! A disk store groups units into named storages (a relational backend would
//! map a storage to a table). Each `save`/`save_inserts` call is one physical
//! transaction: it lands whole or not at all, so the persister can retry a
//! failed batch on the next cycle without half-written state.

use gridstore_core::{EntityId, LogRef, RawRecord, Result};
use std::collections::HashMap;

/// Durable persistence provider.
pub trait DiskStore: Send + Sync {
    /// Write-behind save: apply upserts and deletes in one transaction and
    /// record `timestamp_ms` as the new last-saved time.
    fn save(&self, upserts: Vec<RawRecord>, deletes: Vec<LogRef>, timestamp_ms: i64)
        -> Result<()>;

    /// Restore-path save: plain inserts, one transaction. Used when replaying
    /// backups into a freshly initialized store.
    fn save_inserts(&self, records: Vec<RawRecord>) -> Result<()>;

    /// Stream every record of a storage through the callback.
    fn load_by_storage(
        &self,
        storage: &str,
        callback: &mut dyn FnMut(RawRecord) -> Result<()>,
    ) -> Result<()>;

    /// Highest stored ID per ID generator, for seeding generators after a
    /// cold start.
    fn load_max_ids(&self) -> Result<HashMap<String, EntityId>>;

    /// Every storage the store holds.
    fn storages(&self) -> Result<Vec<String>>;

    /// Storage a unit belongs to.
    fn unit_storage(&self, unit: &str) -> String;

    /// Wipe and recreate the store. Restore calls this before replaying.
    fn init(&self) -> Result<()>;

    /// Reclaim space after deletes. May be a no-op.
    fn compact(&self) -> Result<()>;

    /// Timestamp of the last write-behind save, in epoch milliseconds.
    /// Zero when the store has never been written.
    fn last_saved(&self) -> Result<i64>;
}
