//! The unit-of-work transaction
//!
//! Changes are staged locally in staging order and applied in one atomic
//! grid save at commit. Staging is idempotent per record: re-inserting an
//! entity that already has an ID is a no-op, an update folds into a staged
//! insert of the same record, and a re-update replaces the previously staged
//! state. Commit is one-shot; a failed optimistic check abandons the whole
//! transaction with nothing applied.

use crate::database::Datastore;
use gridstore_core::{
    millis_to_datetime, now_millis, unit_name, DeleteSink, Entity, EntityId, Error, Filter,
    GridRecord, LogRef, Result, SortOrder, TenantId,
};
use chrono::{DateTime, Utc};
use gridstore_storage::{DeleteOp, InPlaceOp, SaveBatch};
use std::sync::Arc;

struct StagedInsert {
    order: u32,
    record: GridRecord,
}

struct StagedUpdate {
    order: u32,
    record: GridRecord,
    optimistic: bool,
    /// modified_at of the in-hand copy when the update was staged
    base_modified: Option<DateTime<Utc>>,
}

/// A tenant-scoped unit of work.
pub struct Transaction {
    db: Arc<dyn Datastore>,
    tenant_id: TenantId,
    next_order: u32,
    committed: bool,
    inserts: Vec<StagedInsert>,
    updates: Vec<StagedUpdate>,
    deletes: Vec<(u32, DeleteOp)>,
    in_place: Vec<InPlaceOp>,
}

impl Transaction {
    /// Open a transaction against a datastore.
    pub fn new(db: Arc<dyn Datastore>, tenant_id: TenantId) -> Self {
        Transaction {
            db,
            tenant_id,
            next_order: 0,
            committed: false,
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            in_place: Vec::new(),
        }
    }

    /// Tenant this transaction operates in.
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Sibling transaction for batch processing, possibly in another tenant.
    pub fn transaction(&self, tenant_id: TenantId) -> Transaction {
        Transaction::new(Arc::clone(&self.db), tenant_id)
    }

    fn order(&mut self) -> u32 {
        self.next_order += 1;
        self.next_order
    }

    /// Stage an insert, assigning an ID from the entity's generator. No-op
    /// when the entity already carries an ID.
    pub fn insert<T: Entity>(&mut self, entity: &mut T) -> Result<()> {
        if entity.meta().id.is_some() {
            return Ok(());
        }
        entity.meta_mut().tenant_id = self.tenant_id;
        let id = self.db.next_id(&T::id_generator_name(self.tenant_id))?;
        entity.meta_mut().id = Some(id);
        let record = GridRecord::from_entity(entity)?;
        let order = self.order();
        self.inserts.push(StagedInsert { order, record });
        Ok(())
    }

    /// Stage a full-record update (last writer wins).
    pub fn update<T: Entity>(&mut self, entity: &T) -> Result<()> {
        self.stage_update(entity, false)
    }

    /// Stage an optimistic update: commit re-reads the stored copy and
    /// abandons the transaction when it changed since this copy was read.
    pub fn update_optimistic<T: Entity>(&mut self, entity: &T) -> Result<()> {
        self.stage_update(entity, true)
    }

    fn stage_update<T: Entity>(&mut self, entity: &T, optimistic: bool) -> Result<()> {
        let record = GridRecord::from_entity(entity)?;
        if let Some(staged) = self
            .inserts
            .iter_mut()
            .find(|s| s.record.unit == record.unit && s.record.id == record.id)
        {
            // Updating a record this transaction inserts: fold the state
            // into the insert.
            staged.record = record;
            return Ok(());
        }
        if let Some(staged) = self
            .updates
            .iter_mut()
            .find(|s| s.record.unit == record.unit && s.record.id == record.id)
        {
            staged.record = record;
            staged.optimistic = staged.optimistic || optimistic;
            return Ok(());
        }
        let order = self.order();
        self.updates.push(StagedUpdate {
            order,
            base_modified: entity.meta().modified_at,
            optimistic,
            record,
        });
        Ok(())
    }

    /// Stage an in-place mutation of the stored record, bypassing the
    /// optimistic check. In-place updates must be staged before any insert,
    /// update or delete.
    pub fn update_in_place<T, F>(&mut self, id: EntityId, mutate: F) -> Result<()>
    where
        T: Entity,
        F: FnOnce(&mut T) -> Result<()> + Send + 'static,
    {
        let unit = unit_name(T::NAME, self.tenant_id);
        let order = self.order();
        self.in_place.push(InPlaceOp {
            order_no: order,
            unit,
            id,
            mutate: Box::new(move |data| {
                let mut entity: T = serde_json::from_value(data.clone())?;
                mutate(&mut entity)?;
                *data = serde_json::to_value(&entity)?;
                Ok(())
            }),
        });
        Ok(())
    }

    /// Stage a delete of one entity.
    pub fn delete<T: Entity>(&mut self, entity: &T) -> Result<()> {
        let id = entity.meta().id.ok_or_else(|| {
            Error::Serialization(format!("{} entity has no ID", T::NAME))
        })?;
        self.delete_by_id::<T>(id)
    }

    /// Stage a delete by key.
    pub fn delete_by_id<T: Entity>(&mut self, id: EntityId) -> Result<()> {
        let order = self.order();
        self.deletes.push((
            order,
            DeleteOp::ById {
                entity_name: T::NAME.to_string(),
                unit: unit_name(T::NAME, self.tenant_id),
                id,
            },
        ));
        Ok(())
    }

    /// Stage a filter-based delete.
    pub fn delete_matching<T: Entity>(&mut self, filter: Filter) -> Result<()> {
        self.db.registry().validate_filter(T::NAME, &filter)?;
        let order = self.order();
        self.deletes.push((
            order,
            DeleteOp::ByFilter {
                entity_name: T::NAME.to_string(),
                unit: unit_name(T::NAME, self.tenant_id),
                filter,
            },
        ));
        Ok(())
    }

    /// Stage the entity's cascade deletes, then its own.
    pub fn delete_with_dependents<T: Entity>(&mut self, entity: &T) -> Result<()> {
        entity.cascade_delete(self)?;
        self.delete(entity)
    }

    /// Read one entity. Read-through; staged changes are not visible.
    pub fn get<T: Entity>(&self, id: EntityId) -> Result<Option<T>> {
        match self.db.get(&unit_name(T::NAME, self.tenant_id), id)? {
            Some(record) => Ok(Some(record.to_entity()?)),
            None => Ok(None),
        }
    }

    /// Filtered, ordered search. Filter fields are validated against the
    /// entity's registered fields before any I/O.
    pub fn find<T: Entity>(
        &self,
        filter: Option<&Filter>,
        order: &[SortOrder],
        limit: usize,
    ) -> Result<Vec<T>> {
        if let Some(f) = filter {
            self.db.registry().validate_filter(T::NAME, f)?;
        }
        let records =
            self.db
                .search(&unit_name(T::NAME, self.tenant_id), filter, order, limit)?;
        records.iter().map(GridRecord::to_entity).collect()
    }

    /// First match, if any.
    pub fn find_one<T: Entity>(&self, filter: &Filter) -> Result<Option<T>> {
        Ok(self.find::<T>(Some(filter), &[], 1)?.pop())
    }

    /// Count matching entities.
    pub fn count<T: Entity>(&self, filter: Option<&Filter>) -> Result<usize> {
        if let Some(f) = filter {
            self.db.registry().validate_filter(T::NAME, f)?;
        }
        self.db.count(&unit_name(T::NAME, self.tenant_id), filter)
    }

    /// True when at least one entity matches.
    pub fn exists<T: Entity>(&self, filter: &Filter) -> Result<bool> {
        Ok(!self.find::<T>(Some(filter), &[], 1)?.is_empty())
    }

    fn is_staged_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.in_place.is_empty()
    }

    /// Commit the staged changes atomically.
    ///
    /// Returns `Ok(true)` on success (trivially for an empty transaction),
    /// `Ok(false)` when the datastore is not active, `Err(Committed)` on
    /// re-commit, and `Err(Stale)` when an optimistic update lost the race.
    /// Timestamps are stamped here: inserts get `created_at` and every
    /// touched record gets the same commit-wide `modified_at`.
    pub fn commit(&mut self) -> Result<bool> {
        if self.committed {
            return Err(Error::Committed);
        }
        if self.is_staged_empty() {
            self.committed = true;
            return Ok(true);
        }
        if !self.db.is_active() {
            return Ok(false);
        }
        self.committed = true;

        for staged in self.updates.iter().filter(|u| u.optimistic) {
            let current = self.db.get(&staged.record.unit, staged.record.id)?;
            let current_modified = current.as_ref().and_then(|r| r.modified_at);
            if current.is_none() || current_modified != staged.base_modified {
                return Err(Error::Stale {
                    unit_name: staged.record.unit.clone(),
                    id: staged.record.id,
                });
            }
        }

        let now = now_millis();
        let now_dt = millis_to_datetime(now);

        let mut batch = SaveBatch::default();
        let mut inserted = Vec::new();
        let mut updated = Vec::new();

        for staged in self.inserts.drain(..) {
            let mut record = staged.record;
            record.stamp_created(now_dt);
            record.touch(now_dt);
            inserted.push(LogRef::new(record.unit.clone(), record.id));
            batch.inserts.push((staged.order, record));
        }
        for staged in self.updates.drain(..) {
            let mut record = staged.record;
            record.touch(now_dt);
            updated.push(LogRef::new(record.unit.clone(), record.id));
            batch.updates.push((staged.order, record));
        }
        for op in self.in_place.drain(..) {
            updated.push(LogRef::new(op.unit.clone(), op.id));
            let inner = op.mutate;
            batch.in_place.push(InPlaceOp {
                order_no: op.order_no,
                unit: op.unit,
                id: op.id,
                mutate: Box::new(move |data| {
                    inner(data)?;
                    if let Some(map) = data.as_object_mut() {
                        map.insert("modified_at".to_string(), serde_json::to_value(now_dt)?);
                    }
                    Ok(())
                }),
            });
        }
        batch.deletes = std::mem::take(&mut self.deletes);

        let descriptors = self.db.save(batch)?;
        let deleted = descriptors
            .into_iter()
            .map(|d| LogRef::new(d.unit_name, d.id))
            .collect();
        self.db.after_save(now, inserted, updated, deleted)?;
        Ok(true)
    }
}

impl DeleteSink for Transaction {
    fn stage_delete(&mut self, entity_name: &str, filter: Filter) -> Result<()> {
        self.db.registry().validate_filter(entity_name, &filter)?;
        let order = self.order();
        self.deletes.push((
            order,
            DeleteOp::ByFilter {
                entity_name: entity_name.to_string(),
                unit: unit_name(entity_name, self.tenant_id),
                filter,
            },
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, PersistenceMode};
    use crate::database::InMemoryDatabase;
    use crate::registry::EntityRegistry;
    use gridstore_core::{EntityMeta, FieldDef, FieldKind};
    use gridstore_storage::{MemoryGrid, RuntimeStorage};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Order {
        #[serde(flatten)]
        meta: EntityMeta,
        customer: String,
        total: i64,
    }

    impl Entity for Order {
        const NAME: &'static str = "Order";

        fn fields() -> &'static [FieldDef] {
            const FIELDS: [FieldDef; 2] = [
                FieldDef::indexed("customer", FieldKind::Text),
                FieldDef::indexed("total", FieldKind::Int),
            ];
            &FIELDS
        }

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }

        fn cascade_delete(&self, deletes: &mut dyn DeleteSink) -> Result<()> {
            if let Some(id) = self.meta.id {
                deletes.stage_delete("LineItem", Filter::eq("order_id", id))?;
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct LineItem {
        #[serde(flatten)]
        meta: EntityMeta,
        order_id: i64,
        sku: String,
    }

    impl Entity for LineItem {
        const NAME: &'static str = "LineItem";

        fn fields() -> &'static [FieldDef] {
            const FIELDS: [FieldDef; 2] = [
                FieldDef::indexed("order_id", FieldKind::Int),
                FieldDef::plain("sku", FieldKind::Text),
            ];
            &FIELDS
        }

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    fn order(customer: &str, total: i64) -> Order {
        Order {
            meta: EntityMeta::default(),
            customer: customer.to_string(),
            total,
        }
    }

    fn database(started: bool) -> Arc<InMemoryDatabase> {
        let mut registry = EntityRegistry::new();
        registry.register::<Order>().unwrap();
        registry.register::<LineItem>().unwrap();
        let runtime = RuntimeStorage::new(Arc::new(MemoryGrid::new()));
        let config = DatabaseConfig::for_testing()
            .with_persistence(PersistenceMode::None)
            .with_backup_directory(std::env::temp_dir());
        let db = InMemoryDatabase::new(config, runtime, registry, None, None).unwrap();
        if started {
            db.start().unwrap();
        }
        db
    }

    #[test]
    fn test_insert_assigns_id_and_commits() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        assert_eq!(o.meta.id, Some(1));
        assert!(tx.commit().unwrap());

        let tx = db.transaction(0);
        let stored: Order = tx.get(1).unwrap().unwrap();
        assert_eq!(stored.customer, "ava");
        // Timestamps stamped in commit, equal for a fresh insert
        assert!(stored.meta.created_at.is_some());
        assert_eq!(stored.meta.created_at, stored.meta.modified_at);
    }

    #[test]
    fn test_insert_idempotent() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        let id = o.meta.id;
        tx.insert(&mut o).unwrap();
        assert_eq!(o.meta.id, id);
        tx.commit().unwrap();
        let tx = db.transaction(0);
        assert_eq!(tx.count::<Order>(None).unwrap(), 1);
    }

    #[test]
    fn test_update_folds_into_staged_insert() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        o.total = 250;
        tx.update(&o).unwrap();
        tx.commit().unwrap();
        let tx = db.transaction(0);
        let stored: Order = tx.get(o.meta.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.total, 250);
    }

    #[test]
    fn test_update_replaces_staged_update() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        tx.commit().unwrap();

        let mut tx = db.transaction(0);
        let mut stored: Order = tx.get(o.meta.id.unwrap()).unwrap().unwrap();
        stored.total = 1;
        tx.update(&stored).unwrap();
        stored.total = 2;
        tx.update(&stored).unwrap();
        tx.commit().unwrap();

        let tx = db.transaction(0);
        let after: Order = tx.get(o.meta.id.unwrap()).unwrap().unwrap();
        assert_eq!(after.total, 2);
    }

    #[test]
    fn test_empty_commit_and_double_commit() {
        let db = database(true);
        let mut tx = db.transaction(0);
        assert!(tx.commit().unwrap());
        assert!(matches!(tx.commit(), Err(Error::Committed)));
    }

    #[test]
    fn test_commit_inactive_returns_false() {
        let db = database(false);
        let mut tx = db.transaction(0);
        tx.delete_by_id::<Order>(1).unwrap();
        assert!(!tx.commit().unwrap());
    }

    #[test]
    fn test_optimistic_conflict_aborts() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        tx.commit().unwrap();
        let id = o.meta.id.unwrap();
        // Timestamps have millisecond resolution
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Both transactions read the same copy
        let reader1 = db.transaction(0);
        let mut copy1: Order = reader1.get(id).unwrap().unwrap();
        let reader2 = db.transaction(0);
        let mut copy2: Order = reader2.get(id).unwrap().unwrap();

        let mut tx1 = db.transaction(0);
        copy1.total = 150;
        tx1.update_optimistic(&copy1).unwrap();
        assert!(tx1.commit().unwrap());

        let mut tx2 = db.transaction(0);
        copy2.total = 175;
        tx2.update_optimistic(&copy2).unwrap();
        assert!(matches!(tx2.commit(), Err(Error::Stale { .. })));

        // The loser applied nothing
        let tx = db.transaction(0);
        let stored: Order = tx.get(id).unwrap().unwrap();
        assert_eq!(stored.total, 150);
    }

    #[test]
    fn test_plain_update_last_writer_wins() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        tx.commit().unwrap();
        let id = o.meta.id.unwrap();

        let mut copy: Order = db.transaction(0).get(id).unwrap().unwrap();
        copy.total = 999;
        let mut tx1 = db.transaction(0);
        let mut fresh: Order = tx1.get(id).unwrap().unwrap();
        fresh.total = 150;
        tx1.update(&fresh).unwrap();
        tx1.commit().unwrap();

        let mut tx2 = db.transaction(0);
        tx2.update(&copy).unwrap();
        assert!(tx2.commit().unwrap());
        let stored: Order = db.transaction(0).get(id).unwrap().unwrap();
        assert_eq!(stored.total, 999);
    }

    #[test]
    fn test_in_place_update() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        tx.commit().unwrap();
        let id = o.meta.id.unwrap();

        let mut tx = db.transaction(0);
        tx.update_in_place::<Order, _>(id, |order| {
            order.total += 50;
            Ok(())
        })
        .unwrap();
        tx.commit().unwrap();

        let stored: Order = db.transaction(0).get(id).unwrap().unwrap();
        assert_eq!(stored.total, 150);
        assert!(stored.meta.modified_at.is_some());
    }

    #[test]
    fn test_in_place_after_conventional_rejected() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        tx.commit().unwrap();
        let id = o.meta.id.unwrap();

        let mut tx = db.transaction(0);
        tx.delete_by_id::<Order>(id).unwrap();
        tx.update_in_place::<Order, _>(id, |_| Ok(())).unwrap();
        assert!(matches!(tx.commit(), Err(Error::InPlaceOrdering)));
    }

    #[test]
    fn test_delete_with_dependents_cascades() {
        let db = database(true);
        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        let order_id = o.meta.id.unwrap();
        let mut item = LineItem {
            meta: EntityMeta::default(),
            order_id,
            sku: "sku-1".to_string(),
        };
        tx.insert(&mut item).unwrap();
        tx.commit().unwrap();

        let mut tx = db.transaction(0);
        let stored: Order = tx.get(order_id).unwrap().unwrap();
        tx.delete_with_dependents(&stored).unwrap();
        tx.commit().unwrap();

        let tx = db.transaction(0);
        assert_eq!(tx.count::<Order>(None).unwrap(), 0);
        assert_eq!(tx.count::<LineItem>(None).unwrap(), 0);
    }

    #[test]
    fn test_find_with_order_and_unknown_field() {
        let db = database(true);
        let mut tx = db.transaction(0);
        for (customer, total) in [("ava", 300), ("bo", 100), ("cy", 200)] {
            let mut o = order(customer, total);
            tx.insert(&mut o).unwrap();
        }
        tx.commit().unwrap();

        let tx = db.transaction(0);
        let by_total: Vec<Order> = tx
            .find(None, &[SortOrder::asc("total")], 0)
            .unwrap();
        let customers: Vec<&str> = by_total.iter().map(|o| o.customer.as_str()).collect();
        assert_eq!(customers, vec!["bo", "cy", "ava"]);

        let found: Option<Order> = tx.find_one(&Filter::eq("customer", "cy")).unwrap();
        assert_eq!(found.unwrap().total, 200);
        assert!(tx.exists::<Order>(&Filter::gt("total", 250)).unwrap());

        let err = tx
            .find::<Order>(Some(&Filter::eq("nickname", "x")), &[], 0)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[test]
    fn test_tenant_isolation() {
        let mut registry = EntityRegistry::new();
        registry.register::<Order>().unwrap();
        registry.register::<LineItem>().unwrap();
        let runtime = RuntimeStorage::new(Arc::new(MemoryGrid::new()));
        let config = DatabaseConfig::for_testing()
            .with_persistence(PersistenceMode::None)
            .with_backup_directory(std::env::temp_dir())
            .with_tenants(vec![0, 1]);
        let db = InMemoryDatabase::new(config, runtime, registry, None, None).unwrap();
        db.start().unwrap();

        let mut tx = db.transaction(0);
        let mut o = order("ava", 100);
        tx.insert(&mut o).unwrap();
        tx.commit().unwrap();

        let other = db.transaction(1);
        assert_eq!(other.count::<Order>(None).unwrap(), 0);
        let sibling = other.transaction(0);
        assert_eq!(sibling.count::<Order>(None).unwrap(), 1);
    }
}
