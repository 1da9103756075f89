//! Explicit entity type registry
//!
//! Every entity type is registered once at build time; the registry is the
//! single source of truth for unit creation, filter validation and backup
//! enumeration. There is no runtime type scanning.

use gridstore_core::entity::META_FIELDS;
use gridstore_core::{Entity, Error, FieldDef, Filter, Result, TenantId};
use std::collections::HashMap;

/// A registered entity type.
#[derive(Clone)]
pub struct RegisteredType {
    /// Entity type name
    pub name: &'static str,
    /// Declared queryable fields
    pub fields: &'static [FieldDef],
    /// ID generator name for a tenant
    pub generator: fn(TenantId) -> String,
}

/// Registry of entity types, keyed by name.
#[derive(Default)]
pub struct EntityRegistry {
    types: Vec<RegisteredType>,
    by_name: HashMap<&'static str, usize>,
}

impl EntityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        EntityRegistry::default()
    }

    /// Register an entity type. Duplicate names are rejected.
    pub fn register<T: Entity>(&mut self) -> Result<()> {
        if self.by_name.contains_key(T::NAME) {
            return Err(Error::Config(format!(
                "entity '{}' registered twice",
                T::NAME
            )));
        }
        self.by_name.insert(T::NAME, self.types.len());
        self.types.push(RegisteredType {
            name: T::NAME,
            fields: T::fields(),
            generator: T::id_generator_name,
        });
        Ok(())
    }

    /// All registered types, in registration order.
    pub fn types(&self) -> &[RegisteredType] {
        &self.types
    }

    /// Look a type up by name.
    pub fn get(&self, entity_name: &str) -> Option<&RegisteredType> {
        self.by_name.get(entity_name).map(|&i| &self.types[i])
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check every field a filter references against the entity's declared
    /// fields plus the implicit header fields. Fails before any I/O.
    pub fn validate_filter(&self, entity_name: &str, filter: &Filter) -> Result<()> {
        let registered = self.get(entity_name).ok_or_else(|| Error::Config(format!(
            "entity '{entity_name}' is not registered"
        )))?;
        for field in filter.fields() {
            let known = registered.fields.iter().any(|f| f.name == field)
                || META_FIELDS.iter().any(|f| f.name == field);
            if !known {
                return Err(Error::UnknownField {
                    field: field.to_string(),
                    entity: entity_name.to_string(),
                });
            }
        }
        Ok(())
    }
}
