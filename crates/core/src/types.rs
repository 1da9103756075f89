//! Identity and time primitives
//!
//! A "unit" is the tenant-scoped partition of one entity type in the grid or
//! the durable store: entity name + tenant ID joined by [`TENANT_DELIMITER`].
//! Entity identity is (unit name, ID).

use chrono::{DateTime, TimeZone, Utc};

/// Tenant identifier. Zero for single-tenant deployments.
pub type TenantId = i32;

/// Entity primary key, assigned from a named ID generator at insert time.
pub type EntityId = i64;

/// Separator between the entity name and the tenant ID in a unit name.
pub const TENANT_DELIMITER: &str = "___";

/// Build the unit name for an entity type and tenant.
pub fn unit_name(entity_name: &str, tenant_id: TenantId) -> String {
    format!("{entity_name}{TENANT_DELIMITER}{tenant_id}")
}

/// Entity-name part of a unit name (everything before the delimiter).
pub fn entity_part(unit_name: &str) -> &str {
    match unit_name.rfind(TENANT_DELIMITER) {
        Some(pos) => &unit_name[..pos],
        None => unit_name,
    }
}

/// Tenant part of a unit name. Zero when the delimiter is missing or the
/// suffix does not parse.
pub fn tenant_part(unit_name: &str) -> TenantId {
    unit_name
        .rfind(TENANT_DELIMITER)
        .and_then(|pos| unit_name[pos + TENANT_DELIMITER.len()..].parse().ok())
        .unwrap_or(0)
}

/// Current time in milliseconds since the epoch, the grid watermark scale.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a timestamp to watermark milliseconds.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Convert watermark milliseconds back to a timestamp.
pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}
