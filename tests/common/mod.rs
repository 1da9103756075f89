#![allow(dead_code)]

use gridstore::{
    ClusterObserver, DatabaseConfig, DeleteSink, Entity, EntityMeta, EntityRegistry, FieldDef,
    FieldKind, Filter, InMemoryDatabase, MemoryDiskStore, MemoryGrid, PersistenceMode,
    Persister, PersisterConfig, RawRecord, Result, RuntimeStorage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub owner: String,
    pub balance: i64,
}

impl Entity for Account {
    const NAME: &'static str = "Account";

    fn fields() -> &'static [FieldDef] {
        const FIELDS: [FieldDef; 2] = [
            FieldDef::indexed("owner", FieldKind::Text),
            FieldDef::indexed("balance", FieldKind::Int),
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
            deletes.stage_delete("Entry", Filter::eq("account_id", id))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub account_id: i64,
    pub amount: i64,
}

impl Entity for Entry {
    const NAME: &'static str = "Entry";

    fn fields() -> &'static [FieldDef] {
        const FIELDS: [FieldDef; 2] = [
            FieldDef::indexed("account_id", FieldKind::Int),
            FieldDef::plain("amount", FieldKind::Int),
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

pub fn account(owner: &str, balance: i64) -> Account {
    Account {
        meta: EntityMeta::default(),
        owner: owner.to_string(),
        balance,
    }
}

pub fn entry(account_id: i64, amount: i64) -> Entry {
    Entry {
        meta: EntityMeta::default(),
        account_id,
        amount,
    }
}

pub fn raw_account(id: i64, balance: i64) -> RawRecord {
    RawRecord {
        unit_name: "Account___0".to_string(),
        id_generator_name: "Account___0".to_string(),
        id,
        last_update: None,
        entity_name: "Account".to_string(),
        payload: format!("{{\"id\":{id},\"tenant_id\":0,\"owner\":\"seed\",\"balance\":{balance}}}"),
    }
}

pub fn registry() -> EntityRegistry {
    let mut r = EntityRegistry::new();
    r.register::<Account>().unwrap();
    r.register::<Entry>().unwrap();
    r
}

/// One database node plus the grid and disk store it runs on. Tests share
/// the grid and store between nodes to simulate a cluster.
pub struct Node {
    pub grid: MemoryGrid,
    pub store: Arc<MemoryDiskStore>,
    pub persister: Option<Arc<Persister>>,
    pub backup_dir: tempfile::TempDir,
    pub db: Arc<InMemoryDatabase>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn node(mode: PersistenceMode) -> Node {
    node_on(mode, MemoryGrid::new(), Arc::new(MemoryDiskStore::new()), None)
}

pub fn node_on(
    mode: PersistenceMode,
    grid: MemoryGrid,
    store: Arc<MemoryDiskStore>,
    observer: Option<Arc<dyn ClusterObserver>>,
) -> Node {
    init_tracing();
    let backup_dir = tempfile::tempdir().unwrap();
    let persister = if mode == PersistenceMode::None {
        None
    } else {
        Some(Arc::new(
            Persister::new(
                Arc::new(grid.clone()),
                store.clone(),
                PersisterConfig::for_testing(),
            )
            .unwrap(),
        ))
    };
    let config = DatabaseConfig::for_testing()
        .with_persistence(mode)
        .with_backup_directory(backup_dir.path())
        .with_max_persistence_delay(Duration::from_secs(3600));
    let db = InMemoryDatabase::new(
        config,
        RuntimeStorage::new(Arc::new(grid.clone())),
        registry(),
        persister.clone(),
        observer,
    )
    .unwrap();
    Node {
        grid,
        store,
        persister,
        backup_dir,
        db,
    }
}
