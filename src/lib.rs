//! gridstore: persistence engine for a partitioned, multi-tenant in-memory
//! data grid
//!
//! The grid is the system of record at runtime; a pluggable disk store is
//! the durable copy, written behind the grid (or through it) by the
//! persister. Commits are optimistic units of work staged in a
//! [`Transaction`] and applied atomically.
//!
//! The workspace layers, bottom up:
//! - `gridstore-core`: entities, filters, records, the persistence log
//! - `gridstore-storage`: the grid provider contract and the in-process grid
//! - `gridstore-durability`: write-behind persister, disk store contract,
//!   backup files
//! - `gridstore-engine`: transactions, cluster lifecycle, persistence policy
//!
//! This facade re-exports the public API of all four.

#![warn(clippy::all)]

pub use gridstore_core::{
    entity::META_FIELDS, millis_to_datetime, now_millis, to_millis, unit_name, DeleteSink,
    Entity, EntityDescriptor, EntityId, EntityMeta, Error, FieldDef, FieldKind, Filter,
    FilterValue, GridRecord, LogEntry, LogRef, RawRecord, Result, SortOrder, TenantId,
    LOG_ID_GENERATOR, LOG_UNIT, TENANT_DELIMITER,
};

pub use gridstore_storage::{
    BulkLoader, DeleteOp, GridProvider, InPlaceOp, LockGuard, MemoryGrid, RecordCursor,
    RuntimeStorage, SaveBatch, TopicCallback,
};

pub use gridstore_durability::{
    backups_in, compare_backups, restore_backups, BackupFile, CompareReport, DiskStore,
    MemoryDiskStore, Persister, PersisterConfig, RestoreSummary, BACKUP_EXTENSION,
    WATERMARK_COUNTER,
};

pub use gridstore_engine::{
    database::{CLUSTER_TOPIC, MSG_CLUSTER_START, MSG_CLUSTER_STOP},
    ClusterObserver, DatabaseConfig, Datastore, EntityRegistry, InMemoryDatabase,
    PersistenceMode, Transaction,
};
