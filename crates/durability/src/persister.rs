//! The write-behind persistence server
//!
//! One node in the cluster runs a `Persister`. It drains the persistence log
//! into the durable store on a schedule, purges persisted log entries after a
//! retention window, and compacts the store. The watermark (epoch millis of
//! the last persisted log entry) lives in two places: the store's own
//! `last_saved` and the grid atomic long [`WATERMARK_COUNTER`], which the
//! engine's stall detector reads.

use crate::provider::DiskStore;
use crate::scheduler::{PeriodicScheduler, PeriodicTask};
use gridstore_core::types::entity_part;
use gridstore_core::{
    to_millis, Error, LogEntry, LogRef, RawRecord, Result, LOG_UNIT,
};
use gridstore_storage::{DeleteOp, GridProvider, SaveBatch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grid atomic long publishing the persister watermark cluster-wide.
pub const WATERMARK_COUNTER: &str = "last_persist";

/// Cluster lock serializing log cleanup across nodes.
const CLEANUP_LOCK: &str = "log_cleanup";

/// Records streamed per bulk-loader batch during storage load.
const LOAD_BATCH: usize = 100;

/// Write-behind persister tuning.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Skip writing a record whose stored copy is already newer than the log
    /// entry being replayed; a later entry covers it.
    pub merge_updates: bool,
    /// Log entries folded into one physical store transaction.
    pub log_entries_per_transaction: usize,
    /// Period of the flush task.
    pub write_behind_interval: Duration,
    /// Retention window for persisted log entries; also the cleanup period.
    pub cleanup_after: Duration,
    /// Period of the store compaction task.
    pub compact_every: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        PersisterConfig {
            merge_updates: true,
            log_entries_per_transaction: 20,
            write_behind_interval: Duration::from_secs(120),
            cleanup_after: Duration::from_secs(25 * 3600),
            compact_every: Duration::from_secs(3 * 3600),
        }
    }
}

impl PersisterConfig {
    /// Disable or enable merge mode.
    pub fn with_merge_updates(mut self, merge: bool) -> Self {
        self.merge_updates = merge;
        self
    }

    /// Log entries per physical store transaction.
    pub fn with_log_entries_per_transaction(mut self, n: usize) -> Self {
        self.log_entries_per_transaction = n;
        self
    }

    /// Flush period.
    pub fn with_write_behind_interval(mut self, interval: Duration) -> Self {
        self.write_behind_interval = interval;
        self
    }

    /// Log retention window.
    pub fn with_cleanup_after(mut self, window: Duration) -> Self {
        self.cleanup_after = window;
        self
    }

    /// Compaction period.
    pub fn with_compact_every(mut self, period: Duration) -> Self {
        self.compact_every = period;
        self
    }

    /// Tiny batches, hour-long periods: tests drive the persister manually.
    pub fn for_testing() -> Self {
        PersisterConfig::default()
            .with_log_entries_per_transaction(2)
            .with_write_behind_interval(Duration::from_secs(3600))
            .with_compact_every(Duration::from_secs(3600))
    }
}

enum Pending {
    Upsert { entry_time: i64 },
    Delete,
}

/// The write-behind persistence server.
pub struct Persister {
    grid: Arc<dyn GridProvider>,
    store: Arc<dyn DiskStore>,
    config: PersisterConfig,
    watermark: AtomicI64,
    active: AtomicBool,
    scheduler: Mutex<Option<PeriodicScheduler>>,
}

impl Persister {
    /// Build a persister over a grid and a durable store. The watermark
    /// starts at the store's `last_saved`.
    pub fn new(
        grid: Arc<dyn GridProvider>,
        store: Arc<dyn DiskStore>,
        config: PersisterConfig,
    ) -> Result<Self> {
        if config.log_entries_per_transaction == 0 {
            return Err(Error::Config(
                "log_entries_per_transaction must be at least 1".to_string(),
            ));
        }
        if config.write_behind_interval.is_zero() {
            return Err(Error::Config(
                "write_behind_interval must be non-zero".to_string(),
            ));
        }
        let initial = store.last_saved()?;
        Ok(Persister {
            grid,
            store,
            config,
            watermark: AtomicI64::new(initial),
            active: AtomicBool::new(true),
            scheduler: Mutex::new(None),
        })
    }

    /// Retention window, for the engine's configuration check against its
    /// maximum persistence delay.
    pub fn cleanup_after(&self) -> Duration {
        self.config.cleanup_after
    }

    /// Current watermark in epoch milliseconds.
    pub fn watermark(&self) -> i64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Start the write-behind schedule: one immediate flush, then flush,
    /// cleanup and compaction at their periods on a single thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let initial = self.store.last_saved()?;
        self.watermark.store(initial, Ordering::SeqCst);
        // The published value is the cluster stall clock, seeded by the
        // engine at init; an older store position must not rewind it.
        if self.grid.atomic_long(WATERMARK_COUNTER)? < initial {
            self.publish_watermark(initial)?;
        }
        self.active.store(true, Ordering::SeqCst);
        info!(watermark = initial, "persister starting");

        match self.flush_once() {
            Ok(n) if n > 0 => info!(entries = n, "initial flush complete"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "initial flush failed"),
        }

        let flusher = Arc::clone(self);
        let cleaner = Arc::clone(self);
        let compactor = Arc::clone(self);
        let tasks = vec![
            PeriodicTask::new("flush", self.config.write_behind_interval, move || {
                if let Err(e) = flusher.flush_once() {
                    warn!(error = %e, "write-behind flush failed");
                }
            }),
            PeriodicTask::new("cleanup", self.config.cleanup_after, move || {
                if let Err(e) = cleaner.cleanup_once() {
                    warn!(error = %e, "log cleanup failed");
                }
            }),
            PeriodicTask::new("compact", self.config.compact_every, move || {
                if let Err(e) = compactor.store.compact() {
                    warn!(error = %e, "store compaction failed");
                }
            }),
        ];
        *self.scheduler.lock() = Some(PeriodicScheduler::start("gridstore-persister", tasks));
        Ok(())
    }

    /// Stop the schedule. Idempotent; does not flush.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
            info!("persister stopped");
        }
    }

    /// Graceful shutdown: one final flush, then stop.
    pub fn flush_and_stop(&self) {
        if let Err(e) = self.flush_once() {
            warn!(error = %e, "final flush failed");
        }
        self.stop();
    }

    /// Drain every log entry newer than the watermark into the store.
    ///
    /// Entries are folded into physical transactions of
    /// `log_entries_per_transaction`; within a transaction the changes are
    /// deduplicated per record, a delete superseding any pending upsert. The
    /// watermark advances after each transaction, so a store failure leaves
    /// the remaining entries for the next cycle and replay stays idempotent.
    /// Store failures are swallowed; grid failures propagate.
    pub fn flush_once(&self) -> Result<usize> {
        let watermark = self.watermark.load(Ordering::SeqCst);
        let records = self.grid.search(
            LOG_UNIT,
            Some(&LogEntry::newer_than(watermark)),
            &LogEntry::chronological(),
            0,
        )?;
        if records.is_empty() {
            return Ok(0);
        }
        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            entries.push(LogEntry::from_record(record)?);
        }

        let mut flushed = 0;
        for chunk in entries.chunks(self.config.log_entries_per_transaction) {
            if !self.active.load(Ordering::SeqCst) {
                debug!("flush abandoned mid-cycle");
                break;
            }

            let mut pending: Vec<(LogRef, Pending)> = Vec::new();
            let mut index: HashMap<LogRef, usize> = HashMap::new();
            let mut stage = |log_ref: &LogRef, op: Pending| match index.get(log_ref) {
                Some(&i) => pending[i].1 = op,
                None => {
                    index.insert(log_ref.clone(), pending.len());
                    pending.push((log_ref.clone(), op));
                }
            };
            for entry in chunk {
                for log_ref in entry.new_entities.iter().chain(&entry.updated_entities) {
                    stage(log_ref, Pending::Upsert { entry_time: entry.time });
                }
                for log_ref in &entry.deleted_entities {
                    stage(log_ref, Pending::Delete);
                }
            }

            let mut upserts = Vec::new();
            let mut deletes = Vec::new();
            for (log_ref, op) in pending {
                match op {
                    Pending::Delete => deletes.push(log_ref),
                    Pending::Upsert { entry_time } => {
                        let record = match self.grid.get(&log_ref.unit_name, log_ref.id)? {
                            Some(record) => record,
                            // Gone from the grid; a later entry carries the
                            // delete.
                            None => continue,
                        };
                        let modified = record.modified_at.map(to_millis).unwrap_or(0);
                        if self.config.merge_updates && modified > entry_time {
                            debug!(
                                unit = %log_ref.unit_name,
                                id = log_ref.id,
                                "skipping superseded update"
                            );
                            continue;
                        }
                        upserts.push(RawRecord::from_grid(
                            &record,
                            &log_ref.unit_name,
                            entity_part(&log_ref.unit_name),
                        )?);
                    }
                }
            }

            let batch_time = chunk.iter().map(|e| e.time).max().unwrap_or(watermark);
            if let Err(e) = self.store.save(upserts, deletes, batch_time) {
                warn!(error = %e, "store save failed; will retry next cycle");
                return Ok(flushed);
            }
            flushed += chunk.len();
            self.watermark.store(batch_time, Ordering::SeqCst);
            self.publish_watermark(batch_time)?;
        }
        if flushed > 0 {
            info!(entries = flushed, watermark = self.watermark(), "flushed persistence log");
        }
        Ok(flushed)
    }

    /// Synchronous write-through save, for engines persisting at commit time
    /// instead of through the log. Advances the watermark.
    pub fn save_now(
        &self,
        upserts: Vec<RawRecord>,
        deletes: Vec<LogRef>,
        timestamp_ms: i64,
    ) -> Result<()> {
        self.store.save(upserts, deletes, timestamp_ms)?;
        self.watermark.store(timestamp_ms, Ordering::SeqCst);
        self.publish_watermark(timestamp_ms)
    }

    /// Purge persisted log entries older than the retention window. Guarded
    /// by a try-once cluster lock so only one node cleans per period.
    pub fn cleanup_once(&self) -> Result<usize> {
        let guard = match self.grid.lock(CLEANUP_LOCK, Duration::ZERO)? {
            Some(guard) => guard,
            None => return Ok(0),
        };
        // Retention counts back from the watermark, so a lagging persister
        // never purges entries other consumers have yet to see.
        let cutoff =
            self.watermark.load(Ordering::SeqCst) - self.config.cleanup_after.as_millis() as i64;
        let batch = SaveBatch {
            deletes: vec![(
                1,
                DeleteOp::ByFilter {
                    entity_name: entity_part(LOG_UNIT).to_string(),
                    unit: LOG_UNIT.to_string(),
                    filter: LogEntry::at_or_before(cutoff),
                },
            )],
            ..Default::default()
        };
        let purged = self.grid.save(batch, Vec::new())?.len();
        drop(guard);
        if purged > 0 {
            info!(purged, cutoff, "purged persistence log");
        }
        Ok(purged)
    }

    /// Stream a storage from the durable store into the grid through the
    /// bulk loader, in batches of 100. Returns the number of records loaded.
    pub fn load(&self, storage: &str) -> Result<usize> {
        let mut loader = self.grid.loader();
        let mut buffer = Vec::with_capacity(LOAD_BATCH);
        let mut loaded = 0usize;
        self.store.load_by_storage(storage, &mut |raw| {
            buffer.push(raw.to_grid()?);
            if buffer.len() >= LOAD_BATCH {
                loader.load(std::mem::take(&mut buffer))?;
            }
            loaded += 1;
            Ok(())
        })?;
        if !buffer.is_empty() {
            loader.load(buffer)?;
        }
        loader.finish()?;
        info!(storage, loaded, "storage loaded");
        Ok(loaded)
    }

    /// Highest stored ID per generator, for seeding after a cold start.
    pub fn load_max_ids(&self) -> Result<HashMap<String, i64>> {
        self.store.load_max_ids()
    }

    /// Storages present in the durable store.
    pub fn storages(&self) -> Result<Vec<String>> {
        self.store.storages()
    }

    fn publish_watermark(&self, timestamp_ms: i64) -> Result<()> {
        self.grid.set_atomic_long(WATERMARK_COUNTER, timestamp_ms)
    }
}
