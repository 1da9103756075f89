//! Application-facing facade over the grid provider
//!
//! `RuntimeStorage` covers the non-persisted side of the grid: transient
//! key/value units, tenant-scoped counters, named locks and the broadcast
//! bus. The persisted side (entities, transactions, the persistence log)
//! goes through the engine instead.

use crate::provider::{GridProvider, LockGuard, TopicCallback};
use gridstore_core::{unit_name, EntityId, FieldDef, Filter, Result, TenantId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Facade for transient grid state. Clones share the underlying provider.
#[derive(Clone)]
pub struct RuntimeStorage {
    provider: Arc<dyn GridProvider>,
}

impl RuntimeStorage {
    /// Wrap a grid provider.
    pub fn new(provider: Arc<dyn GridProvider>) -> Self {
        RuntimeStorage { provider }
    }

    /// The wrapped provider, for the engine's persisted-data paths.
    pub fn provider(&self) -> &Arc<dyn GridProvider> {
        &self.provider
    }

    /// Create a transient unit for a name and tenant.
    pub fn create_transient_unit(
        &self,
        name: &str,
        tenant_id: TenantId,
        indexed_fields: &[FieldDef],
    ) -> Result<()> {
        self.provider
            .create_unit(&unit_name(name, tenant_id), indexed_fields, true)
    }

    /// Create a named ID generator positioned at `initial`.
    pub fn create_id_generator(&self, name: &str, initial: EntityId) -> Result<()> {
        self.provider.create_id_generator(name, initial)
    }

    /// Issue the next ID from a named generator.
    pub fn generate_id(&self, name: &str) -> Result<EntityId> {
        self.provider.next_id(name)
    }

    /// Read a tenant-scoped counter.
    pub fn get_long(&self, name: &str, tenant_id: TenantId) -> Result<i64> {
        self.provider.atomic_long(&unit_name(name, tenant_id))
    }

    /// Set a tenant-scoped counter.
    pub fn set_long(&self, name: &str, tenant_id: TenantId, value: i64) -> Result<()> {
        self.provider
            .set_atomic_long(&unit_name(name, tenant_id), value)
    }

    /// Increment a tenant-scoped counter; returns the new value.
    pub fn increment_long(&self, name: &str, tenant_id: TenantId) -> Result<i64> {
        self.provider
            .increment_atomic_long(&unit_name(name, tenant_id))
    }

    /// Decrement a tenant-scoped counter; returns the new value.
    pub fn decrement_long(&self, name: &str, tenant_id: TenantId) -> Result<i64> {
        self.provider
            .decrement_atomic_long(&unit_name(name, tenant_id))
    }

    /// Fetch a typed transient value by key.
    pub fn get_transient<T: DeserializeOwned>(
        &self,
        name: &str,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<T>> {
        match self.provider.get_value(&unit_name(name, tenant_id), key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store a typed transient value under a key.
    pub fn save_transient<T: Serialize>(
        &self,
        name: &str,
        tenant_id: TenantId,
        key: &str,
        value: &T,
    ) -> Result<()> {
        self.provider.put_value(
            &unit_name(name, tenant_id),
            key,
            serde_json::to_value(value)?,
        )
    }

    /// Drop a transient value.
    pub fn delete_transient(&self, name: &str, tenant_id: TenantId, key: &str) -> Result<()> {
        self.provider.delete_value(&unit_name(name, tenant_id), key)
    }

    /// Find transient values matching a filter.
    pub fn find_transient<T: DeserializeOwned>(
        &self,
        name: &str,
        tenant_id: TenantId,
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<T>> {
        let values =
            self.provider
                .search_values(&unit_name(name, tenant_id), filter, limit)?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    /// Count transient values matching a filter.
    pub fn count_transient(
        &self,
        name: &str,
        tenant_id: TenantId,
        filter: Option<&Filter>,
    ) -> Result<usize> {
        Ok(self
            .provider
            .search_values(&unit_name(name, tenant_id), filter, 0)?
            .len())
    }

    /// True when at least one transient value matches.
    pub fn exists_transient(
        &self,
        name: &str,
        tenant_id: TenantId,
        filter: Option<&Filter>,
    ) -> Result<bool> {
        Ok(!self
            .provider
            .search_values(&unit_name(name, tenant_id), filter, 1)?
            .is_empty())
    }

    /// Acquire a named cluster lock.
    pub fn lock(&self, name: &str, timeout: Duration) -> Result<Option<Box<dyn LockGuard>>> {
        self.provider.lock(name, timeout)
    }

    /// Subscribe to a broadcast topic.
    pub fn subscribe(&self, topic: &str, callback: TopicCallback) -> Result<()> {
        self.provider.subscribe(topic, callback)
    }

    /// Broadcast to every subscriber.
    pub fn broadcast(&self, topic: &str, message: &str) -> Result<()> {
        self.provider.broadcast(topic, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGrid;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        hits: i64,
    }

    fn storage() -> RuntimeStorage {
        RuntimeStorage::new(Arc::new(MemoryGrid::new()))
    }

    #[test]
    fn test_transient_round_trip() {
        let rt = storage();
        rt.create_transient_unit("Session", 0, &[]).unwrap();
        let s = Session {
            user: "ava".to_string(),
            hits: 3,
        };
        rt.save_transient("Session", 0, "s1", &s).unwrap();
        let back: Option<Session> = rt.get_transient("Session", 0, "s1").unwrap();
        assert_eq!(back, Some(s));
        rt.delete_transient("Session", 0, "s1").unwrap();
        let gone: Option<Session> = rt.get_transient("Session", 0, "s1").unwrap();
        assert!(gone.is_none());
    }

    #[test]
    fn test_transient_find_count_exists() {
        let rt = storage();
        rt.create_transient_unit("Session", 0, &[]).unwrap();
        for (key, hits) in [("a", 1), ("b", 5), ("c", 9)] {
            rt.save_transient(
                "Session",
                0,
                key,
                &Session {
                    user: key.to_string(),
                    hits,
                },
            )
            .unwrap();
        }
        let filter = Filter::gt("hits", 2);
        let found: Vec<Session> = rt.find_transient("Session", 0, Some(&filter), 0).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(rt.count_transient("Session", 0, Some(&filter)).unwrap(), 2);
        assert!(rt.exists_transient("Session", 0, Some(&filter)).unwrap());
        assert!(!rt
            .exists_transient("Session", 0, Some(&Filter::gt("hits", 100)))
            .unwrap());
    }

    #[test]
    fn test_tenant_scoped_counters() {
        let rt = storage();
        assert_eq!(rt.increment_long("visits", 1).unwrap(), 1);
        assert_eq!(rt.increment_long("visits", 2).unwrap(), 1);
        rt.set_long("visits", 1, 10).unwrap();
        assert_eq!(rt.get_long("visits", 1).unwrap(), 10);
        assert_eq!(rt.decrement_long("visits", 1).unwrap(), 9);
        assert_eq!(rt.get_long("visits", 2).unwrap(), 1);
    }

    #[test]
    fn test_generate_id() {
        let rt = storage();
        rt.create_id_generator("Session___0", 100).unwrap();
        assert_eq!(rt.generate_id("Session___0").unwrap(), 101);
    }
}
