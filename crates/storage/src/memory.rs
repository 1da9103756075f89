//! Single-process in-memory grid backend
//!
//! Reference implementation of [`GridProvider`] used by tests and embedded
//! deployments. Units are `BTreeMap`s behind `parking_lot` locks inside a
//! `dashmap` registry; batch saves are serialized by one save mutex and
//! applied to scratch copies so a failed commit leaves nothing behind.

use crate::provider::{
    BulkLoader, DeleteOp, GridProvider, InPlaceOp, LockGuard, RecordCursor, SaveBatch,
    TopicCallback,
};
use dashmap::DashMap;
use gridstore_core::filter::compare_records;
use gridstore_core::{
    EntityDescriptor, EntityId, Error, FieldDef, Filter, GridRecord, Result, SortOrder,
};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Default)]
struct UnitStore {
    records: RwLock<BTreeMap<EntityId, GridRecord>>,
    values: RwLock<HashMap<String, JsonValue>>,
}

#[derive(Default)]
struct LockCell {
    locked: Mutex<bool>,
    available: Condvar,
}

struct MemoryLockGuard {
    cell: Arc<LockCell>,
}

impl LockGuard for MemoryLockGuard {}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        let mut locked = self.cell.locked.lock();
        *locked = false;
        self.cell.available.notify_one();
    }
}

#[derive(Default)]
struct Inner {
    units: DashMap<String, Arc<UnitStore>>,
    generators: DashMap<String, AtomicI64>,
    longs: DashMap<String, AtomicI64>,
    locks: DashMap<String, Arc<LockCell>>,
    topics: Mutex<HashMap<String, Vec<TopicCallback>>>,
    save_lock: Mutex<()>,
    running: AtomicBool,
}

impl Inner {
    fn unit(&self, name: &str) -> Option<Arc<UnitStore>> {
        self.units.get(name).map(|entry| entry.value().clone())
    }

    fn unit_or_create(&self, name: &str) -> Arc<UnitStore> {
        self.units
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(UnitStore::default()))
            .clone()
    }

    fn restore_images(&self, images: Vec<(Arc<UnitStore>, GridRecord)>) {
        for (store, record) in images {
            store.records.write().insert(record.id, record);
        }
    }
}

/// In-memory reference grid. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryGrid {
    inner: Arc<Inner>,
}

impl MemoryGrid {
    /// Fresh empty grid.
    pub fn new() -> Self {
        MemoryGrid::default()
    }
}

struct VecCursor {
    items: std::vec::IntoIter<GridRecord>,
}

impl RecordCursor for VecCursor {
    fn next_record(&mut self) -> Option<GridRecord> {
        self.items.next()
    }
}

struct MemoryLoader {
    inner: Arc<Inner>,
}

impl BulkLoader for MemoryLoader {
    fn load(&mut self, records: Vec<GridRecord>) -> Result<()> {
        for record in records {
            let store = self.inner.unit_or_create(&record.unit);
            store.records.write().insert(record.id, record);
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

enum ConventionalOp {
    Insert(GridRecord),
    Update(GridRecord),
    Delete(DeleteOp),
}

impl GridProvider for MemoryGrid {
    fn start(&self) -> Result<()> {
        self.inner.running.store(true, Ordering::SeqCst);
        info!("in-memory grid started");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!("in-memory grid shut down");
        }
        Ok(())
    }

    fn create_unit(
        &self,
        unit: &str,
        _indexed_fields: &[FieldDef],
        transient: bool,
    ) -> Result<()> {
        self.inner.unit_or_create(unit);
        debug!(unit, transient, "unit created");
        Ok(())
    }

    fn get(&self, unit: &str, id: EntityId) -> Result<Option<GridRecord>> {
        Ok(self
            .inner
            .unit(unit)
            .and_then(|store| store.records.read().get(&id).cloned()))
    }

    fn get_value(&self, unit: &str, key: &str) -> Result<Option<JsonValue>> {
        Ok(self
            .inner
            .unit(unit)
            .and_then(|store| store.values.read().get(key).cloned()))
    }

    fn put_value(&self, unit: &str, key: &str, value: JsonValue) -> Result<()> {
        let store = self.inner.unit_or_create(unit);
        store.values.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete_value(&self, unit: &str, key: &str) -> Result<()> {
        if let Some(store) = self.inner.unit(unit) {
            store.values.write().remove(key);
        }
        Ok(())
    }

    fn search_values(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<JsonValue>> {
        let store = match self.inner.unit(unit) {
            Some(store) => store,
            None => return Ok(Vec::new()),
        };
        let values = store.values.read();
        let mut out: Vec<JsonValue> = values
            .values()
            .filter(|v| filter.map_or(true, |f| f.matches(v)))
            .cloned()
            .collect();
        if limit > 0 {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn search(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        order: &[SortOrder],
        limit: usize,
    ) -> Result<Vec<GridRecord>> {
        let store = match self.inner.unit(unit) {
            Some(store) => store,
            None => return Ok(Vec::new()),
        };
        let mut out: Vec<GridRecord> = store
            .records
            .read()
            .values()
            .filter(|r| filter.map_or(true, |f| f.matches(&r.data)))
            .cloned()
            .collect();
        if !order.is_empty() {
            out.sort_by(|a, b| compare_records(&a.data, &b.data, order).then(a.id.cmp(&b.id)));
        }
        if limit > 0 {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn cursor(
        &self,
        unit: &str,
        filter: Option<&Filter>,
        order: &[SortOrder],
    ) -> Result<Box<dyn RecordCursor>> {
        let items = self.search(unit, filter, order, 0)?;
        Ok(Box::new(VecCursor {
            items: items.into_iter(),
        }))
    }

    fn count(&self, unit: &str, filter: Option<&Filter>) -> Result<usize> {
        let store = match self.inner.unit(unit) {
            Some(store) => store,
            None => return Ok(0),
        };
        let records = store.records.read();
        Ok(match filter {
            Some(f) => records.values().filter(|r| f.matches(&r.data)).count(),
            None => records.len(),
        })
    }

    fn delete_all(&self, unit: &str) -> Result<()> {
        if let Some(store) = self.inner.unit(unit) {
            store.records.write().clear();
        }
        Ok(())
    }

    fn save(
        &self,
        batch: SaveBatch,
        service_records: Vec<GridRecord>,
    ) -> Result<Vec<EntityDescriptor>> {
        // Conventional operations may not be staged before any in-place
        // update; the in-place path executes first and cannot be reordered.
        if let Some(max_in_place) = batch.in_place.iter().map(|op| op.order_no).max() {
            let min_conventional = batch
                .inserts
                .iter()
                .map(|(n, _)| *n)
                .chain(batch.updates.iter().map(|(n, _)| *n))
                .chain(batch.deletes.iter().map(|(n, _)| *n))
                .min();
            if matches!(min_conventional, Some(min) if min <= max_in_place) {
                return Err(Error::InPlaceOrdering);
            }
        }

        // The save lock covers the in-place section too: a concurrent save
        // commits by swapping whole unit maps, and an in-place mutation
        // landing between its clone and its swap would be lost.
        let _serial = self.inner.save_lock.lock();

        // In-place updates run against the live maps, keeping before-images
        // for compensation if the conventional section fails.
        let mut images: Vec<(Arc<UnitStore>, GridRecord)> = Vec::new();
        let mut in_place = batch.in_place;
        in_place.sort_by_key(|op| op.order_no);
        for op in in_place {
            let store = match self.inner.unit(&op.unit) {
                Some(store) => store,
                None => {
                    self.inner.restore_images(images);
                    return Err(Error::Stale {
                        unit_name: op.unit,
                        id: op.id,
                    });
                }
            };
            let mut records = store.records.write();
            match records.get_mut(&op.id) {
                Some(record) => {
                    let before = record.clone();
                    if let Err(e) = (op.mutate)(&mut record.data) {
                        drop(records);
                        self.inner.restore_images(images);
                        return Err(e);
                    }
                    record.refresh_header();
                    drop(records);
                    images.push((store, before));
                }
                None => {
                    drop(records);
                    self.inner.restore_images(images);
                    return Err(Error::Stale {
                        unit_name: op.unit,
                        id: op.id,
                    });
                }
            }
        }

        let mut ops: Vec<(u32, ConventionalOp)> = Vec::new();
        for (n, record) in batch.inserts {
            ops.push((n, ConventionalOp::Insert(record)));
        }
        for (n, record) in batch.updates {
            ops.push((n, ConventionalOp::Update(record)));
        }
        for (n, delete) in batch.deletes {
            ops.push((n, ConventionalOp::Delete(delete)));
        }
        ops.sort_by_key(|(n, _)| *n);

        // Apply to scratch copies of the touched units; commit by swapping
        // the copies in only after every operation succeeded.
        let mut touched: HashMap<String, BTreeMap<EntityId, GridRecord>> = HashMap::new();
        let mut descriptors = Vec::new();
        let mut failure: Option<Error> = None;

        'apply: for (_, op) in ops {
            let unit = match &op {
                ConventionalOp::Insert(r) | ConventionalOp::Update(r) => r.unit.clone(),
                ConventionalOp::Delete(DeleteOp::ById { unit, .. })
                | ConventionalOp::Delete(DeleteOp::ByFilter { unit, .. }) => unit.clone(),
            };
            let map = touched.entry(unit).or_insert_with_key(|name| {
                self.inner
                    .unit(name)
                    .map(|store| store.records.read().clone())
                    .unwrap_or_default()
            });
            match op {
                ConventionalOp::Insert(record) => {
                    if map.contains_key(&record.id) {
                        failure = Some(Error::BadIdGenerator {
                            unit_name: record.unit,
                            id: record.id,
                        });
                        break 'apply;
                    }
                    map.insert(record.id, record);
                }
                ConventionalOp::Update(record) => {
                    if !map.contains_key(&record.id) {
                        failure = Some(Error::Stale {
                            unit_name: record.unit,
                            id: record.id,
                        });
                        break 'apply;
                    }
                    map.insert(record.id, record);
                }
                ConventionalOp::Delete(DeleteOp::ById {
                    entity_name,
                    unit,
                    id,
                }) => {
                    if map.remove(&id).is_some() {
                        descriptors.push(EntityDescriptor {
                            entity_name,
                            unit_name: unit,
                            id,
                        });
                    }
                }
                ConventionalOp::Delete(DeleteOp::ByFilter {
                    entity_name,
                    unit,
                    filter,
                }) => {
                    let matching: Vec<EntityId> = map
                        .values()
                        .filter(|r| filter.matches(&r.data))
                        .map(|r| r.id)
                        .collect();
                    for id in matching {
                        map.remove(&id);
                        descriptors.push(EntityDescriptor {
                            entity_name: entity_name.clone(),
                            unit_name: unit.clone(),
                            id,
                        });
                    }
                }
            }
        }

        if let Some(err) = failure {
            self.inner.restore_images(images);
            return Err(err);
        }

        for record in service_records {
            let map = touched.entry(record.unit.clone()).or_insert_with_key(|name| {
                self.inner
                    .unit(name)
                    .map(|store| store.records.read().clone())
                    .unwrap_or_default()
            });
            map.insert(record.id, record);
        }

        for (unit, map) in touched {
            let store = self.inner.unit_or_create(&unit);
            *store.records.write() = map;
        }
        Ok(descriptors)
    }

    fn create_id_generator(&self, name: &str, start: EntityId) -> Result<()> {
        self.inner
            .generators
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(start));
        Ok(())
    }

    fn next_id(&self, name: &str) -> Result<EntityId> {
        let next = self
            .inner
            .generators
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        Ok(next)
    }

    fn atomic_long(&self, name: &str) -> Result<i64> {
        Ok(self
            .inner
            .longs
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .load(Ordering::SeqCst))
    }

    fn set_atomic_long(&self, name: &str, value: i64) -> Result<()> {
        self.inner
            .longs
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::SeqCst);
        Ok(())
    }

    fn increment_atomic_long(&self, name: &str) -> Result<i64> {
        Ok(self
            .inner
            .longs
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1)
    }

    fn decrement_atomic_long(&self, name: &str) -> Result<i64> {
        Ok(self
            .inner
            .longs
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_sub(1, Ordering::SeqCst)
            - 1)
    }

    fn lock(&self, name: &str, timeout: Duration) -> Result<Option<Box<dyn LockGuard>>> {
        let cell = self
            .inner
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LockCell::default()))
            .clone();
        let mut locked = cell.locked.lock();
        if *locked {
            if timeout.is_zero() {
                return Ok(None);
            }
            let deadline = Instant::now() + timeout;
            while *locked {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                let _ = cell.available.wait_for(&mut locked, remaining);
            }
        }
        *locked = true;
        drop(locked);
        Ok(Some(Box::new(MemoryLockGuard { cell })))
    }

    fn subscribe(&self, topic: &str, callback: TopicCallback) -> Result<()> {
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    fn broadcast(&self, topic: &str, message: &str) -> Result<()> {
        let subscribers: Vec<TopicCallback> = self
            .inner
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.to_vec())
            .unwrap_or_default();
        for callback in subscribers {
            callback(message);
        }
        Ok(())
    }

    fn loader(&self) -> Box<dyn BulkLoader> {
        Box::new(MemoryLoader {
            inner: self.inner.clone(),
        })
    }
}
