//! The grid storage provider contract
//!
//! A provider hosts named units (tenant-scoped record partitions), keyed
//! transient values, cluster-wide ID generators, atomic longs, named locks
//! and a broadcast topic bus. The engine drives all writes through the atomic
//! [`GridProvider::save`] entry so a commit either lands whole or not at all.

use gridstore_core::{
    EntityDescriptor, EntityId, FieldDef, Filter, GridRecord, Result, SortOrder,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Subscriber callback for a broadcast topic.
pub type TopicCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Held cluster lock; releasing is dropping.
pub trait LockGuard: Send {}

/// Streaming view over a unit's records, already filtered and ordered.
pub trait RecordCursor: Send {
    /// Next record, or None when exhausted.
    fn next_record(&mut self) -> Option<GridRecord>;
}

/// Batched write path used when loading a storage from the durable store.
pub trait BulkLoader: Send {
    /// Insert a batch of records, creating units as needed.
    fn load(&mut self, records: Vec<GridRecord>) -> Result<()>;

    /// Flush anything buffered.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Delete staged within a save batch.
#[derive(Debug)]
pub enum DeleteOp {
    /// Delete one record by key.
    ById {
        /// Entity type name for the resulting descriptor
        entity_name: String,
        /// Unit to delete from
        unit: String,
        /// Record ID
        id: EntityId,
    },
    /// Delete every record matching a filter.
    ByFilter {
        /// Entity type name for the resulting descriptors
        entity_name: String,
        /// Unit to delete from
        unit: String,
        /// Criteria resolved at save time
        filter: Filter,
    },
}

/// In-place mutation of one stored record, bypassing the optimistic check.
pub struct InPlaceOp {
    /// Staging order number within the transaction
    pub order_no: u32,
    /// Unit of the target record
    pub unit: String,
    /// Target record ID
    pub id: EntityId,
    /// Mutation applied to the stored field map
    pub mutate: Box<dyn FnOnce(&mut JsonValue) -> Result<()> + Send>,
}

impl std::fmt::Debug for InPlaceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InPlaceOp")
            .field("order_no", &self.order_no)
            .field("unit", &self.unit)
            .field("id", &self.id)
            .finish()
    }
}

/// One transaction's worth of staged operations, applied atomically.
///
/// Conventional operations (inserts, updates, deletes) carry the order
/// numbers they were staged under. Every conventional order number must be
/// greater than every in-place order number; in-place updates execute first
/// and cannot be interleaved.
#[derive(Debug, Default)]
pub struct SaveBatch {
    /// Inserts with staging order numbers
    pub inserts: Vec<(u32, GridRecord)>,
    /// Full-record updates with staging order numbers
    pub updates: Vec<(u32, GridRecord)>,
    /// Deletes with staging order numbers
    pub deletes: Vec<(u32, DeleteOp)>,
    /// In-place updates, executed before everything else
    pub in_place: Vec<InPlaceOp>,
}

impl SaveBatch {
    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.in_place.is_empty()
    }
}

/// The grid storage backend contract.
///
/// `limit` of zero on search means unlimited. Lock timeout of zero means try
/// once without waiting. Atomic longs spring into existence at zero.
pub trait GridProvider: Send + Sync {
    /// Bring the backend up.
    fn start(&self) -> Result<()>;

    /// Tear the backend down. Idempotent.
    fn shutdown(&self) -> Result<()>;

    /// Create a unit if it does not exist yet. Transient units hold
    /// non-persisted runtime state.
    fn create_unit(&self, unit: &str, indexed_fields: &[FieldDef], transient: bool) -> Result<()>;

    /// Fetch one record by key.
    fn get(&self, unit: &str, id: EntityId) -> Result<Option<GridRecord>>;

    /// Fetch a keyed transient value.
    fn get_value(&self, unit: &str, key: &str) -> Result<Option<JsonValue>>;

    /// Store a keyed transient value.
    fn put_value(&self, unit: &str, key: &str, value: JsonValue) -> Result<()>;

    /// Drop a keyed transient value.
    fn delete_value(&self, unit: &str, key: &str) -> Result<()>;

    /// Filtered search over a unit's keyed transient values.
    fn search_values(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<JsonValue>>;

    /// Filtered, ordered search over a unit.
    fn search(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        order: &[SortOrder],
        limit: usize,
    ) -> Result<Vec<GridRecord>>;

    /// Streaming variant of [`GridProvider::search`], unlimited.
    fn cursor(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        order: &[SortOrder],
    ) -> Result<Box<dyn RecordCursor>>;

    /// Count matching records.
    fn count(&self, unit: &str, filter: Option<&Filter>) -> Result<usize>;

    /// Remove every record in a unit.
    fn delete_all(&self, unit: &str) -> Result<()>;

    /// Apply one transaction's staged operations atomically, alongside
    /// engine service records (persistence-log entries). Returns descriptors
    /// of every deleted record.
    fn save(
        &self,
        batch: SaveBatch,
        service_records: Vec<GridRecord>,
    ) -> Result<Vec<EntityDescriptor>>;

    /// Create an ID generator positioned at `start`; the next issued ID is
    /// `start + 1`. No-op when the generator exists.
    fn create_id_generator(&self, name: &str, start: EntityId) -> Result<()>;

    /// Issue the next ID from a generator.
    fn next_id(&self, name: &str) -> Result<EntityId>;

    /// Read an atomic long.
    fn atomic_long(&self, name: &str) -> Result<i64>;

    /// Set an atomic long.
    fn set_atomic_long(&self, name: &str, value: i64) -> Result<()>;

    /// Increment and return the new value.
    fn increment_atomic_long(&self, name: &str) -> Result<i64>;

    /// Decrement and return the new value.
    fn decrement_atomic_long(&self, name: &str) -> Result<i64>;

    /// Acquire a named cluster lock, waiting up to `timeout`. Zero timeout
    /// tries once. None when the lock could not be acquired in time.
    fn lock(&self, name: &str, timeout: Duration) -> Result<Option<Box<dyn LockGuard>>>;

    /// Subscribe to a broadcast topic.
    fn subscribe(&self, topic: &str, callback: TopicCallback) -> Result<()>;

    /// Broadcast a message to every subscriber, the local one included.
    fn broadcast(&self, topic: &str, message: &str) -> Result<()>;

    /// Batched write path for restore-time loading.
    fn loader(&self) -> Box<dyn BulkLoader>;
}
