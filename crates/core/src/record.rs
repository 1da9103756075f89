//! Grid-stored and durable record forms
//!
//! [`GridRecord`] is what the grid actually holds: the entity serialized to a
//! JSON field map, with the identity and timestamps lifted out of the map for
//! cheap access during saves and optimistic checks. [`RawRecord`] is the
//! durable form written to disk stores and backup files; its payload is the
//! same field map rendered to JSON text.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::types::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The stored form of an entity in the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRecord {
    /// Unit the record lives in
    pub unit: String,
    /// Primary key within the unit
    pub id: EntityId,
    /// Insert timestamp, mirrored from the field map
    pub created_at: Option<DateTime<Utc>>,
    /// Last-commit timestamp, mirrored from the field map
    pub modified_at: Option<DateTime<Utc>>,
    /// Serialized field map, the authoritative payload
    pub data: JsonValue,
}

impl GridRecord {
    /// Capture an entity's current state. The entity must already carry an
    /// assigned ID.
    pub fn from_entity<T: Entity>(entity: &T) -> Result<Self> {
        let meta = entity.meta();
        let id = meta
            .id
            .ok_or_else(|| Error::Serialization(format!("{} entity has no ID", T::NAME)))?;
        Ok(GridRecord {
            unit: entity.unit_name(),
            id,
            created_at: meta.created_at,
            modified_at: meta.modified_at,
            data: serde_json::to_value(entity)?,
        })
    }

    /// Rebuild the typed entity from the field map.
    pub fn to_entity<T: Entity>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Stamp the last-commit timestamp in both the header and the field map.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.modified_at = Some(now);
        if let JsonValue::Object(map) = &mut self.data {
            map.insert(
                "modified_at".to_string(),
                serde_json::to_value(now).unwrap_or(JsonValue::Null),
            );
        }
    }

    /// Stamp the insert timestamp in both the header and the field map.
    pub fn stamp_created(&mut self, now: DateTime<Utc>) {
        self.created_at = Some(now);
        if let JsonValue::Object(map) = &mut self.data {
            map.insert(
                "created_at".to_string(),
                serde_json::to_value(now).unwrap_or(JsonValue::Null),
            );
        }
    }

    /// Re-read the mirrored header fields from the field map, after an
    /// in-place mutation of `data`.
    pub fn refresh_header(&mut self) {
        self.created_at = self
            .data
            .get("created_at")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        self.modified_at = self
            .data
            .get("modified_at")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
    }
}

/// The durable form of a record: what disk stores persist and backup files
/// carry. The payload is JSON text so providers can store it opaquely.
///
/// Equality ignores the generator name, which is engine bookkeeping rather
/// than record state; the backup compare utility relies on this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Unit the record belongs to
    pub unit_name: String,
    /// ID generator that produced (or will reproduce) this record's ID
    pub id_generator_name: String,
    /// Primary key within the unit
    pub id: EntityId,
    /// Last-commit timestamp at the time the record was captured
    pub last_update: Option<DateTime<Utc>>,
    /// Entity type name
    pub entity_name: String,
    /// Serialized field map as JSON text
    pub payload: String,
}

impl PartialEq for RawRecord {
    fn eq(&self, other: &Self) -> bool {
        self.unit_name == other.unit_name
            && self.id == other.id
            && self.last_update == other.last_update
            && self.payload == other.payload
    }
}

impl RawRecord {
    /// Capture a grid record in durable form.
    pub fn from_grid(
        record: &GridRecord,
        id_generator_name: &str,
        entity_name: &str,
    ) -> Result<Self> {
        Ok(RawRecord {
            unit_name: record.unit.clone(),
            id_generator_name: id_generator_name.to_string(),
            id: record.id,
            last_update: record.modified_at,
            entity_name: entity_name.to_string(),
            payload: serde_json::to_string(&record.data)?,
        })
    }

    /// Rebuild the grid form from the durable payload.
    pub fn to_grid(&self) -> Result<GridRecord> {
        let data: JsonValue = serde_json::from_str(&self.payload)?;
        let created_at = data
            .get("created_at")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        Ok(GridRecord {
            unit: self.unit_name.clone(),
            id: self.id,
            created_at,
            modified_at: self.last_update,
            data,
        })
    }
}

/// Identity of a record affected by a delete, reported back from the grid so
/// the engine can journal it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity type name
    pub entity_name: String,
    /// Unit the record lived in
    pub unit_name: String,
    /// Record ID
    pub id: EntityId,
}
