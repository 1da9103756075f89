//! The in-memory database: cluster lifecycle and persistence policy
//!
//! Cluster state lives in the grid itself: an atomic long tracks the status
//! (0 uninitialized, 1 loading, 2 active), cold start runs under a cluster
//! lock, and every storage is loaded at most once behind a try-once lock.
//! The last loader seeds the ID generators from the durable store and
//! broadcasts `cluster_start`; a `cluster_stop` broadcast is terminal.
//!
//! The database also enforces the persistence policy on every commit: in
//! write-behind mode it appends one persistence-log entry per commit, in
//! load (write-through) mode it saves to the disk store synchronously.

use crate::config::{DatabaseConfig, PersistenceMode};
use crate::registry::EntityRegistry;
use crate::transaction::Transaction;
use gridstore_core::types::{entity_part, tenant_part};
use gridstore_core::{
    now_millis, unit_name, EntityDescriptor, EntityId, Error, Filter, GridRecord, LogEntry,
    LogRef, RawRecord, Result, SortOrder, LOG_ID_GENERATOR, LOG_UNIT,
};
use gridstore_durability::{BackupFile, Persister, WATERMARK_COUNTER};
use gridstore_storage::{DeleteOp, RuntimeStorage, SaveBatch};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Broadcast topic for cluster lifecycle messages.
pub const CLUSTER_TOPIC: &str = "cluster_events";

/// Broadcast when the cluster finishes initializing.
pub const MSG_CLUSTER_START: &str = "cluster_start";

/// Broadcast to stop the cluster. Terminal.
pub const MSG_CLUSTER_STOP: &str = "cluster_stop";

const CLUSTER_STATUS: &str = "cluster_status";
const LOADED_STORAGES: &str = "loaded_storages";
const COLD_START_LOCK: &str = "cold_cluster_start";
const LOAD_COUNT_LOCK: &str = "load_storage_count";

const STATUS_LOADING: i64 = 1;
const STATUS_ACTIVE: i64 = 2;

/// Lifecycle callbacks, all optional no-ops by default.
pub trait ClusterObserver: Send + Sync {
    /// The cluster finished initializing.
    fn cluster_started(&self) {}

    /// The cluster was stopped.
    fn cluster_stopped(&self) {}

    /// This node began an emergency shutdown.
    fn emergency_shutdown_started(&self, _host: &str) {}

    /// This node finished writing emergency backups.
    fn emergency_shutdown_finished(&self, _host: &str) {}
}

/// The contract transactions run against.
pub trait Datastore: Send + Sync {
    /// Node and cluster are ready for commits.
    fn is_active(&self) -> bool;

    /// Registered entity types.
    fn registry(&self) -> &EntityRegistry;

    /// Next ID from a named generator.
    fn next_id(&self, generator: &str) -> Result<EntityId>;

    /// Read one record.
    fn get(&self, unit: &str, id: EntityId) -> Result<Option<GridRecord>>;

    /// Filtered, ordered search.
    fn search(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        order: &[SortOrder],
        limit: usize,
    ) -> Result<Vec<GridRecord>>;

    /// Count matching records.
    fn count(&self, unit: &str, filter: Option<&Filter>) -> Result<usize>;

    /// Apply a staged batch atomically.
    fn save(&self, batch: SaveBatch) -> Result<Vec<EntityDescriptor>>;

    /// Persistence-policy hook, invoked after a successful save with the
    /// identities the commit touched.
    fn after_save(
        &self,
        now_ms: i64,
        inserted: Vec<LogRef>,
        updated: Vec<LogRef>,
        deleted: Vec<LogRef>,
    ) -> Result<()>;
}

/// The partitioned in-memory database.
pub struct InMemoryDatabase {
    config: DatabaseConfig,
    runtime: RuntimeStorage,
    registry: EntityRegistry,
    persister: Option<Arc<Persister>>,
    observer: Option<Arc<dyn ClusterObserver>>,
    active: AtomicBool,
    stopped: AtomicBool,
}

impl InMemoryDatabase {
    /// Build a database. Write-behind and load modes need a persister; its
    /// log retention must exceed the maximum persistence delay, otherwise
    /// the stall detector could race the log cleanup.
    pub fn new(
        config: DatabaseConfig,
        runtime: RuntimeStorage,
        registry: EntityRegistry,
        persister: Option<Arc<Persister>>,
        observer: Option<Arc<dyn ClusterObserver>>,
    ) -> Result<Arc<Self>> {
        if let Some(p) = &persister {
            if p.cleanup_after() <= config.max_persistence_delay {
                return Err(Error::Config(
                    "log retention (cleanup_after) must exceed max_persistence_delay"
                        .to_string(),
                ));
            }
        }
        if config.persistence != PersistenceMode::None && persister.is_none() {
            return Err(Error::Config(
                "persistence mode requires a persister".to_string(),
            ));
        }

        let db = Arc::new(InMemoryDatabase {
            config,
            runtime,
            registry,
            persister,
            observer,
            active: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&db);
        db.runtime.subscribe(
            CLUSTER_TOPIC,
            Arc::new(move |message| {
                if let Some(db) = weak.upgrade() {
                    match message {
                        MSG_CLUSTER_START => db.on_cluster_start(),
                        MSG_CLUSTER_STOP => db.on_cluster_stop(),
                        other => warn!(message = other, "unknown cluster message"),
                    }
                }
            }),
        )?;
        Ok(db)
    }

    /// The transient-state facade this database runs on.
    pub fn runtime(&self) -> &RuntimeStorage {
        &self.runtime
    }

    /// Initialize or join the cluster.
    ///
    /// Cold start (status 0) runs under the cluster init lock: create the
    /// persistence-log unit and every entity unit, load each storage from
    /// the durable store at most once, seed ID generators from the stored
    /// maxima, then broadcast `cluster_start`. Joining an active cluster
    /// (status 2) skips all loading.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Config("cluster has been stopped".to_string()));
        }
        let provider = self.runtime.provider();
        provider.start()?;

        if provider.atomic_long(CLUSTER_STATUS)? == STATUS_ACTIVE {
            self.active.store(true, Ordering::SeqCst);
            info!("joined active cluster");
            return Ok(());
        }

        let guard = provider
            .lock(COLD_START_LOCK, self.config.lock_timeout)?
            .ok_or_else(|| {
                Error::Grid("timed out waiting for cluster initialization".to_string())
            })?;
        // Another node may have finished initializing while we waited.
        if provider.atomic_long(CLUSTER_STATUS)? == STATUS_ACTIVE {
            drop(guard);
            self.active.store(true, Ordering::SeqCst);
            info!("joined active cluster");
            return Ok(());
        }

        info!("cold cluster start");
        provider.set_atomic_long(CLUSTER_STATUS, STATUS_LOADING)?;
        provider.create_unit(LOG_UNIT, &[], false)?;
        provider.create_id_generator(LOG_ID_GENERATOR, 0)?;
        // The published watermark doubles as the stall clock. It starts at
        // init time; the persister keeps its own catch-up position at the
        // store's last_saved and only ever advances the published value.
        provider.set_atomic_long(WATERMARK_COUNTER, now_millis())?;

        for tenant in &self.config.tenants {
            for entity in self.registry.types() {
                provider.create_unit(&unit_name(entity.name, *tenant), entity.fields, false)?;
            }
        }

        let storages = match &self.persister {
            Some(p) => p.storages()?,
            None => Vec::new(),
        };
        if storages.is_empty() {
            self.finish_cold_start()?;
        } else {
            let persister = self.persister.as_ref().ok_or_else(|| {
                Error::Config("storages present without a persister".to_string())
            })?;
            let total = storages.len() as i64;
            // Held until start returns, so no other node re-loads a storage
            // this node already took.
            let mut load_guards = Vec::new();
            for storage in &storages {
                let lock_name = format!("load_{storage}");
                match provider.lock(&lock_name, Duration::ZERO)? {
                    Some(load_guard) => {
                        info!(storage = %storage, "loading storage");
                        persister.load(storage)?;
                        load_guards.push(load_guard);
                        let count_guard =
                            provider.lock(LOAD_COUNT_LOCK, self.config.lock_timeout)?;
                        let loaded = provider.increment_atomic_long(LOADED_STORAGES)?;
                        drop(count_guard);
                        if loaded >= total {
                            self.finish_cold_start()?;
                        }
                    }
                    None => continue,
                }
            }
        }
        drop(guard);

        if self.config.persistence == PersistenceMode::WriteBehind {
            if let Some(persister) = &self.persister {
                persister.start()?;
            }
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn finish_cold_start(&self) -> Result<()> {
        self.seed_generators()?;
        let provider = self.runtime.provider();
        provider.set_atomic_long(CLUSTER_STATUS, STATUS_ACTIVE)?;
        provider.broadcast(CLUSTER_TOPIC, MSG_CLUSTER_START)?;
        info!("cluster initialized");
        Ok(())
    }

    fn seed_generators(&self) -> Result<()> {
        let max_ids = match &self.persister {
            Some(p) => p.load_max_ids()?,
            None => Default::default(),
        };
        let provider = self.runtime.provider();
        for tenant in &self.config.tenants {
            for entity in self.registry.types() {
                let name = (entity.generator)(*tenant);
                let start = max_ids.get(&name).copied().unwrap_or(0);
                provider.create_id_generator(&name, start)?;
            }
        }
        // Stored data may cover tenants beyond the configured list.
        for (name, max) in &max_ids {
            provider.create_id_generator(name, *max)?;
        }
        Ok(())
    }

    fn on_cluster_start(&self) {
        self.active.store(true, Ordering::SeqCst);
        if let Some(observer) = &self.observer {
            observer.cluster_started();
        }
    }

    fn on_cluster_stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        if let Some(persister) = &self.persister {
            persister.stop();
        }
        if let Some(observer) = &self.observer {
            observer.cluster_stopped();
        }
        info!("cluster stop received");
    }

    /// Node readiness: locally active, cluster status active, and the
    /// write-behind pipeline not stalled. Detecting a stall triggers an
    /// emergency shutdown and reports inactive.
    pub fn is_active(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) || !self.active.load(Ordering::SeqCst) {
            return false;
        }
        match self.runtime.provider().atomic_long(CLUSTER_STATUS) {
            Ok(STATUS_ACTIVE) => {}
            _ => return false,
        }
        match self.stalled() {
            Ok(false) => true,
            Ok(true) => {
                error!("persistence stalled; starting emergency shutdown");
                if let Err(e) = self.emergency_shutdown() {
                    error!(error = %e, "emergency shutdown failed");
                }
                false
            }
            Err(e) => {
                warn!(error = %e, "stall check failed");
                false
            }
        }
    }

    /// Stalled means both: the watermark is older than the maximum
    /// persistence delay AND the log holds entries newer than it. An idle
    /// grid with an old watermark is healthy.
    fn stalled(&self) -> Result<bool> {
        if self.config.persistence != PersistenceMode::WriteBehind || self.persister.is_none() {
            return Ok(false);
        }
        let provider = self.runtime.provider();
        let watermark = provider.atomic_long(WATERMARK_COUNTER)?;
        let delay = self.config.max_persistence_delay.as_millis() as i64;
        if now_millis() - watermark <= delay {
            return Ok(false);
        }
        Ok(provider.count(LOG_UNIT, Some(&LogEntry::newer_than(watermark)))? > 0)
    }

    /// Stop the whole cluster and dump every non-empty unit to one backup
    /// file each, recreating the backup directory first.
    pub fn emergency_shutdown(&self) -> Result<()> {
        let host = hostname();
        self.runtime.broadcast(CLUSTER_TOPIC, MSG_CLUSTER_STOP)?;
        if let Some(observer) = &self.observer {
            observer.emergency_shutdown_started(&host);
        }

        let dir = &self.config.backup_directory;
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;

        let provider = self.runtime.provider();
        let mut units: Vec<(String, String, String)> = Vec::new();
        for tenant in &self.config.tenants {
            for entity in self.registry.types() {
                units.push((
                    unit_name(entity.name, *tenant),
                    (entity.generator)(*tenant),
                    entity.name.to_string(),
                ));
            }
        }
        units.push((
            LOG_UNIT.to_string(),
            LOG_ID_GENERATOR.to_string(),
            entity_part(LOG_UNIT).to_string(),
        ));

        for (unit, generator, entity) in units {
            let mut cursor = provider.cursor(&unit, None, &[])?;
            let mut records = Vec::new();
            while let Some(record) = cursor.next_record() {
                records.push(RawRecord::from_grid(&record, &generator, &entity)?);
            }
            if records.is_empty() {
                continue;
            }
            BackupFile::new(dir, &unit).write(records)?;
        }

        if let Some(observer) = &self.observer {
            observer.emergency_shutdown_finished(&host);
        }
        warn!(directory = %dir.display(), "emergency shutdown complete");
        Ok(())
    }

    /// Graceful local shutdown: final flush, then provider teardown.
    pub fn shutdown(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(persister) = &self.persister {
            persister.flush_and_stop();
        }
        self.runtime.provider().shutdown()
    }

    /// Open a transaction for a tenant.
    pub fn transaction(self: &Arc<Self>, tenant_id: gridstore_core::TenantId) -> Transaction {
        let db: Arc<dyn Datastore> = self.clone();
        Transaction::new(db, tenant_id)
    }

    /// Log entries strictly newer than a timestamp, in replay order.
    pub fn persistence_log(&self, from_ms: i64) -> Result<Vec<LogEntry>> {
        let records = self.runtime.provider().search(
            LOG_UNIT,
            Some(&LogEntry::newer_than(from_ms)),
            &LogEntry::chronological(),
            0,
        )?;
        records.iter().map(LogEntry::from_record).collect()
    }

    /// Current state of a record referenced by the log.
    pub fn persistence_record(&self, unit: &str, id: EntityId) -> Result<Option<GridRecord>> {
        self.runtime.provider().get(unit, id)
    }

    /// The published persister watermark.
    pub fn log_save_time(&self) -> Result<i64> {
        self.runtime.provider().atomic_long(WATERMARK_COUNTER)
    }

    /// Overwrite the published watermark. Administrative.
    pub fn set_log_save_time(&self, timestamp_ms: i64) -> Result<()> {
        self.runtime
            .provider()
            .set_atomic_long(WATERMARK_COUNTER, timestamp_ms)
    }

    /// Drop log entries at or before a timestamp. Administrative; the
    /// persister's cleanup task does this on a schedule.
    pub fn purge_persistence_log(&self, older_than_ms: i64) -> Result<usize> {
        let batch = SaveBatch {
            deletes: vec![(
                1,
                DeleteOp::ByFilter {
                    entity_name: entity_part(LOG_UNIT).to_string(),
                    unit: LOG_UNIT.to_string(),
                    filter: LogEntry::at_or_before(older_than_ms),
                },
            )],
            ..Default::default()
        };
        Ok(self.runtime.provider().save(batch, Vec::new())?.len())
    }

    fn append_log_entry(
        &self,
        now_ms: i64,
        inserted: Vec<LogRef>,
        updated: Vec<LogRef>,
        deleted: Vec<LogRef>,
    ) -> Result<()> {
        if inserted.is_empty() && updated.is_empty() && deleted.is_empty() {
            return Ok(());
        }
        let provider = self.runtime.provider();
        let mut entry = LogEntry::new(provider.next_id(LOG_ID_GENERATOR)?, now_ms);
        // A record inserted or updated and then deleted in the same commit
        // replays as a delete only.
        let deleted = dedup(deleted);
        {
            let doomed: HashSet<(&str, EntityId)> = deleted
                .iter()
                .map(|r| (r.unit_name.as_str(), r.id))
                .collect();
            entry.new_entities = dedup(inserted)
                .into_iter()
                .filter(|r| !doomed.contains(&(r.unit_name.as_str(), r.id)))
                .collect();
            entry.updated_entities = dedup(updated)
                .into_iter()
                .filter(|r| !doomed.contains(&(r.unit_name.as_str(), r.id)))
                .collect();
        }
        entry.deleted_entities = deleted;
        provider.save(SaveBatch::default(), vec![entry.to_record()?])?;
        Ok(())
    }

    fn write_through(
        &self,
        now_ms: i64,
        inserted: Vec<LogRef>,
        updated: Vec<LogRef>,
        deleted: Vec<LogRef>,
    ) -> Result<()> {
        let persister = match &self.persister {
            Some(p) => p,
            None => return Ok(()),
        };
        let provider = self.runtime.provider();
        let mut upserts = Vec::new();
        let mut touched = inserted;
        touched.extend(updated);
        for log_ref in dedup(touched) {
            if let Some(record) = provider.get(&log_ref.unit_name, log_ref.id)? {
                let generator = self.generator_for(&log_ref.unit_name);
                upserts.push(RawRecord::from_grid(
                    &record,
                    &generator,
                    entity_part(&log_ref.unit_name),
                )?);
            }
        }
        persister.save_now(upserts, dedup(deleted), now_ms)
    }

    fn generator_for(&self, unit: &str) -> String {
        match self.registry.get(entity_part(unit)) {
            Some(entity) => (entity.generator)(tenant_part(unit)),
            None => unit.to_string(),
        }
    }
}

impl Datastore for InMemoryDatabase {
    fn is_active(&self) -> bool {
        InMemoryDatabase::is_active(self)
    }

    fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    fn next_id(&self, generator: &str) -> Result<EntityId> {
        self.runtime.provider().next_id(generator)
    }

    fn get(&self, unit: &str, id: EntityId) -> Result<Option<GridRecord>> {
        self.runtime.provider().get(unit, id)
    }

    fn search(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        order: &[SortOrder],
        limit: usize,
    ) -> Result<Vec<GridRecord>> {
        self.runtime.provider().search(unit, filter, order, limit)
    }

    fn count(&self, unit: &str, filter: Option<&Filter>) -> Result<usize> {
        self.runtime.provider().count(unit, filter)
    }

    fn save(&self, batch: SaveBatch) -> Result<Vec<EntityDescriptor>> {
        self.runtime.provider().save(batch, Vec::new())
    }

    fn after_save(
        &self,
        now_ms: i64,
        inserted: Vec<LogRef>,
        updated: Vec<LogRef>,
        deleted: Vec<LogRef>,
    ) -> Result<()> {
        match self.config.persistence {
            PersistenceMode::WriteBehind => {
                self.append_log_entry(now_ms, inserted, updated, deleted)
            }
            PersistenceMode::Load => self.write_through(now_ms, inserted, updated, deleted),
            PersistenceMode::None => Ok(()),
        }
    }
}

fn dedup(refs: Vec<LogRef>) -> Vec<LogRef> {
    let mut seen = HashSet::new();
    refs.into_iter()
        .filter(|r| seen.insert((r.unit_name.clone(), r.id)))
        .collect()
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
