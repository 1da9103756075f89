//! Core types for the gridstore data grid persistence engine
//!
//! This crate defines the foundational types shared by every layer:
//! - Entity: the stored-record contract (header, field registry, cascade hook)
//! - Filter / SortOrder: backend-independent query criteria
//! - GridRecord / RawRecord: the grid-stored and durable forms of an entity
//! - LogEntry: the persistence-log journal record driving write-behind
//! - Error: the error taxonomy for the whole workspace

#![warn(clippy::all)]

pub mod entity;
pub mod error;
pub mod filter;
pub mod log;
pub mod record;
pub mod types;

pub use entity::{DeleteSink, Entity, EntityMeta, FieldDef, FieldKind};
pub use error::{Error, Result};
pub use filter::{Filter, FilterValue, SortOrder};
pub use log::{LogEntry, LogRef, LOG_ID_GENERATOR, LOG_UNIT};
pub use record::{EntityDescriptor, GridRecord, RawRecord};
pub use types::{millis_to_datetime, now_millis, to_millis, unit_name, EntityId, TenantId, TENANT_DELIMITER};
