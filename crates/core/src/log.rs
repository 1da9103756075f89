//! Persistence-log journal entries
//!
//! Every write-behind commit appends one [`LogEntry`] describing the records
//! it touched. The persister replays entries newer than its watermark; the
//! cleanup task purges entries already persisted and older than the retention
//! window. Entries are immutable once appended.

use crate::error::Result;
use crate::filter::{Filter, SortOrder};
use crate::record::GridRecord;
use crate::types::EntityId;
use serde::{Deserialize, Serialize};

/// Unit holding the persistence log. Tenant 0 regardless of the tenants the
/// logged records belong to.
pub const LOG_UNIT: &str = "persistence_log___0";

/// ID generator feeding log entry IDs, separate from entity generators.
pub const LOG_ID_GENERATOR: &str = "persistence_log___0";

/// Identity of one record touched by a logged commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogRef {
    /// Unit of the touched record
    pub unit_name: String,
    /// Record ID
    pub id: EntityId,
}

impl LogRef {
    /// Reference a record by unit and ID.
    pub fn new(unit_name: impl Into<String>, id: EntityId) -> Self {
        LogRef {
            unit_name: unit_name.into(),
            id,
        }
    }
}

/// One commit's worth of journaled changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry ID from [`LOG_ID_GENERATOR`]
    pub id: EntityId,
    /// Commit time in epoch milliseconds; the watermark scale
    pub time: i64,
    /// Records inserted by the commit
    pub new_entities: Vec<LogRef>,
    /// Records updated by the commit (in-place updates included)
    pub updated_entities: Vec<LogRef>,
    /// Records deleted by the commit
    pub deleted_entities: Vec<LogRef>,
}

impl LogEntry {
    /// An entry with no changes recorded yet.
    pub fn new(id: EntityId, time: i64) -> Self {
        LogEntry {
            id,
            time,
            new_entities: Vec::new(),
            updated_entities: Vec::new(),
            deleted_entities: Vec::new(),
        }
    }

    /// True when the entry records no changes at all.
    pub fn is_empty(&self) -> bool {
        self.new_entities.is_empty()
            && self.updated_entities.is_empty()
            && self.deleted_entities.is_empty()
    }

    /// Filter selecting entries strictly newer than a watermark.
    pub fn newer_than(watermark_ms: i64) -> Filter {
        Filter::gt("time", watermark_ms)
    }

    /// Filter selecting entries at or before a cutoff, for purging.
    pub fn at_or_before(cutoff_ms: i64) -> Filter {
        Filter::le("time", cutoff_ms)
    }

    /// Replay order: by commit time, entry ID breaking ties.
    pub fn chronological() -> Vec<SortOrder> {
        vec![SortOrder::asc("time"), SortOrder::asc("id")]
    }

    /// Render the entry as a grid record in [`LOG_UNIT`].
    pub fn to_record(&self) -> Result<GridRecord> {
        Ok(GridRecord {
            unit: LOG_UNIT.to_string(),
            id: self.id,
            created_at: None,
            modified_at: None,
            data: serde_json::to_value(self)?,
        })
    }

    /// Parse an entry back out of its grid record.
    pub fn from_record(record: &GridRecord) -> Result<Self> {
        Ok(serde_json::from_value(record.data.clone())?)
    }
}
