//! The stored-entity contract
//!
//! Entities are typed, tenant-scoped records. Instead of runtime scanning,
//! every entity declares its queryable fields explicitly through
//! [`Entity::fields`]; the engine registers them at startup and validates
//! filters against that registry.
//!
//! The [`EntityMeta`] header is flattened into the entity's serialized form,
//! so the grid and the durable store see `id`, `tenant_id`, `created_at`
//! and `modified_at` as plain top-level fields.

use crate::error::Result;
use crate::filter::Filter;
use crate::types::{unit_name, EntityId, TenantId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Kind of a declared entity field. Mirrors the scalar types the grid and
/// the durable backends can index and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// 64-bit signed integer
    Int,
    /// 64-bit float
    Float,
    /// UTF-8 text
    Text,
    /// Boolean
    Bool,
    /// UTC timestamp
    Time,
}

/// A declared queryable field of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name as it appears in the serialized record
    pub name: &'static str,
    /// Scalar kind
    pub kind: FieldKind,
    /// Whether the grid should build an ordered index for it
    pub indexed: bool,
}

impl FieldDef {
    /// Declare an indexed field.
    pub const fn indexed(name: &'static str, kind: FieldKind) -> Self {
        FieldDef {
            name,
            kind,
            indexed: true,
        }
    }

    /// Declare a queryable but unindexed field.
    pub const fn plain(name: &'static str, kind: FieldKind) -> Self {
        FieldDef {
            name,
            kind,
            indexed: false,
        }
    }
}

/// Fields every entity carries through its [`EntityMeta`] header. Always
/// valid in filters regardless of the declared field list.
pub const META_FIELDS: [FieldDef; 4] = [
    FieldDef::indexed("id", FieldKind::Int),
    FieldDef::plain("tenant_id", FieldKind::Int),
    FieldDef::indexed("created_at", FieldKind::Time),
    FieldDef::indexed("modified_at", FieldKind::Time),
];

/// Engine-owned header embedded in every entity.
///
/// The ID is assigned from the entity's ID generator during
/// `Transaction::insert` and is immutable afterwards; both timestamps are
/// stamped inside commit and never by callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Primary key, None until the entity is staged for insert
    pub id: Option<EntityId>,
    /// Owning tenant (0 for single-tenant deployments)
    #[serde(default)]
    pub tenant_id: TenantId,
    /// Set once, inside the commit that inserts the entity
    pub created_at: Option<DateTime<Utc>>,
    /// Set inside every commit that touches the entity
    pub modified_at: Option<DateTime<Utc>>,
}

/// Sink for dependent deletes staged by [`Entity::cascade_delete`].
///
/// The transaction implements this; the hook stays decoupled from the
/// transaction type itself so entities can live below the engine layer.
pub trait DeleteSink {
    /// Stage a filter-based delete for the named entity type within the
    /// current transaction's tenant.
    fn stage_delete(&mut self, entity_name: &str, filter: Filter) -> Result<()>;
}

/// The stored-entity contract.
///
/// Implementations declare their name and queryable fields statically; the
/// registry is built by explicit registration, never by scanning.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Entity type name; also the first half of its unit names.
    const NAME: &'static str;

    /// Declared queryable fields (header fields are implicit).
    fn fields() -> &'static [FieldDef];

    /// Shared header access.
    fn meta(&self) -> &EntityMeta;

    /// Mutable header access, reserved for the engine.
    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Unit this instance belongs to.
    fn unit_name(&self) -> String {
        unit_name(Self::NAME, self.meta().tenant_id)
    }

    /// Name of the ID generator feeding inserts of this type. One generator
    /// per unit by default; override to share a generator across types.
    fn id_generator_name(tenant_id: TenantId) -> String {
        unit_name(Self::NAME, tenant_id)
    }

    /// Cascade hook invoked by `delete_with_dependents` before the entity's
    /// own delete is staged. Stage dependent deletes through the sink.
    fn cascade_delete(&self, _deletes: &mut dyn DeleteSink) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Gadget {
        #[serde(flatten)]
        meta: EntityMeta,
        label: String,
    }

    impl Entity for Gadget {
        const NAME: &'static str = "Gadget";

        fn fields() -> &'static [FieldDef] {
            const FIELDS: [FieldDef; 1] = [FieldDef::indexed("label", FieldKind::Text)];
            &FIELDS
        }

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    #[test]
    fn test_unit_and_generator_names() {
        let mut g = Gadget {
            meta: EntityMeta::default(),
            label: "a".to_string(),
        };
        g.meta_mut().tenant_id = 3;
        assert_eq!(g.unit_name(), "Gadget___3");
        assert_eq!(Gadget::id_generator_name(3), "Gadget___3");
    }

    #[test]
    fn test_meta_flattens_into_payload() {
        let g = Gadget {
            meta: EntityMeta {
                id: Some(5),
                tenant_id: 0,
                created_at: None,
                modified_at: None,
            },
            label: "x".to_string(),
        };
        let value = serde_json::to_value(&g).unwrap();
        assert_eq!(value["id"], serde_json::json!(5));
        assert_eq!(value["label"], serde_json::json!("x"));
    }

    #[test]
    fn test_meta_defaults() {
        let meta = EntityMeta::default();
        assert!(meta.id.is_none());
        assert_eq!(meta.tenant_id, 0);
        assert!(meta.created_at.is_none());
        assert!(meta.modified_at.is_none());
    }
}
