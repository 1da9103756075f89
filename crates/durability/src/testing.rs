//! In-memory reference disk store
//!
//! Used by unit and integration tests wherever a [`DiskStore`] is needed.
//! Units map to storages by their entity-name prefix; the failure switch
//! exercises the persister's retry path.

use crate::provider::DiskStore;
use gridstore_core::types::entity_part;
use gridstore_core::{EntityId, Error, LogRef, RawRecord, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

type UnitRecords = BTreeMap<EntityId, RawRecord>;

/// In-memory [`DiskStore`] for tests.
#[derive(Default)]
pub struct MemoryDiskStore {
    units: Mutex<BTreeMap<String, UnitRecords>>,
    last_saved: AtomicI64,
    save_calls: AtomicUsize,
    compactions: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryDiskStore {
    /// Fresh empty store.
    pub fn new() -> Self {
        MemoryDiskStore::default()
    }

    /// Make every subsequent save fail, or stop failing.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Pin the last-saved watermark, for catch-up tests.
    pub fn set_last_saved(&self, timestamp_ms: i64) {
        self.last_saved.store(timestamp_ms, Ordering::SeqCst);
    }

    /// Stored record, if any.
    pub fn record(&self, unit: &str, id: EntityId) -> Option<RawRecord> {
        self.units
            .lock()
            .get(unit)
            .and_then(|records| records.get(&id).cloned())
    }

    /// Number of records stored for a unit.
    pub fn unit_len(&self, unit: &str) -> usize {
        self.units.lock().get(unit).map_or(0, BTreeMap::len)
    }

    /// Total number of stored records.
    pub fn total_len(&self) -> usize {
        self.units.lock().values().map(BTreeMap::len).sum()
    }

    /// How many save transactions have been applied.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// How many compactions have run.
    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::SeqCst)
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::Provider("simulated disk failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl DiskStore for MemoryDiskStore {
    fn save(
        &self,
        upserts: Vec<RawRecord>,
        deletes: Vec<LogRef>,
        timestamp_ms: i64,
    ) -> Result<()> {
        self.check_fail()?;
        let mut units = self.units.lock();
        for record in upserts {
            units
                .entry(record.unit_name.clone())
                .or_default()
                .insert(record.id, record);
        }
        for delete in deletes {
            if let Some(records) = units.get_mut(&delete.unit_name) {
                records.remove(&delete.id);
            }
        }
        self.last_saved.store(timestamp_ms, Ordering::SeqCst);
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn save_inserts(&self, records: Vec<RawRecord>) -> Result<()> {
        self.check_fail()?;
        let mut units = self.units.lock();
        for record in records {
            units
                .entry(record.unit_name.clone())
                .or_default()
                .insert(record.id, record);
        }
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_by_storage(
        &self,
        storage: &str,
        callback: &mut dyn FnMut(RawRecord) -> Result<()>,
    ) -> Result<()> {
        let units = self.units.lock();
        for (unit, records) in units.iter() {
            if entity_part(unit) == storage {
                for record in records.values() {
                    callback(record.clone())?;
                }
            }
        }
        Ok(())
    }

    fn load_max_ids(&self) -> Result<HashMap<String, EntityId>> {
        let units = self.units.lock();
        let mut max_ids: HashMap<String, EntityId> = HashMap::new();
        for records in units.values() {
            for record in records.values() {
                let entry = max_ids
                    .entry(record.id_generator_name.clone())
                    .or_insert(0);
                if record.id > *entry {
                    *entry = record.id;
                }
            }
        }
        Ok(max_ids)
    }

    fn storages(&self) -> Result<Vec<String>> {
        let units = self.units.lock();
        let mut storages: Vec<String> = units.keys().map(|u| entity_part(u).to_string()).collect();
        storages.dedup();
        Ok(storages)
    }

    fn unit_storage(&self, unit: &str) -> String {
        entity_part(unit).to_string()
    }

    fn init(&self) -> Result<()> {
        self.units.lock().clear();
        self.last_saved.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        self.compactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn last_saved(&self) -> Result<i64> {
        Ok(self.last_saved.load(Ordering::SeqCst))
    }
}
