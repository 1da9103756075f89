//! Backend-independent query criteria
//!
//! Filters form a small predicate tree over named fields. Backends either
//! translate them to a native query language or, like the in-memory grid,
//! evaluate them directly against a record's serialized field map.
//!
//! `fields()` lists every referenced field so the engine can validate a
//! filter against the entity's field registry before any I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Scalar comparison operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Text
    Text(String),
    /// Boolean
    Bool(bool),
    /// UTC timestamp
    Time(DateTime<Utc>),
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        FilterValue::Float(v)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Text(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::Text(v)
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        FilterValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(v: DateTime<Utc>) -> Self {
        FilterValue::Time(v)
    }
}

/// Filter predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// field == value
    Eq(String, FilterValue),
    /// field != value
    Ne(String, FilterValue),
    /// field > value
    Gt(String, FilterValue),
    /// field >= value
    Ge(String, FilterValue),
    /// field < value
    Lt(String, FilterValue),
    /// field <= value
    Le(String, FilterValue),
    /// low <= field <= high
    Between(String, FilterValue, FilterValue),
    /// field is null or absent
    IsNull(String),
    /// field is present and non-null
    NotNull(String),
    /// All sub-filters match
    And(Vec<Filter>),
    /// Any sub-filter matches
    Or(Vec<Filter>),
    /// Sub-filter does not match
    Not(Box<Filter>),
}

impl Filter {
    /// field == value
    pub fn eq(field: &str, value: impl Into<FilterValue>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    /// field != value
    pub fn ne(field: &str, value: impl Into<FilterValue>) -> Self {
        Filter::Ne(field.to_string(), value.into())
    }

    /// field > value
    pub fn gt(field: &str, value: impl Into<FilterValue>) -> Self {
        Filter::Gt(field.to_string(), value.into())
    }

    /// field >= value
    pub fn ge(field: &str, value: impl Into<FilterValue>) -> Self {
        Filter::Ge(field.to_string(), value.into())
    }

    /// field < value
    pub fn lt(field: &str, value: impl Into<FilterValue>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    /// field <= value
    pub fn le(field: &str, value: impl Into<FilterValue>) -> Self {
        Filter::Le(field.to_string(), value.into())
    }

    /// low <= field <= high
    pub fn between(
        field: &str,
        low: impl Into<FilterValue>,
        high: impl Into<FilterValue>,
    ) -> Self {
        Filter::Between(field.to_string(), low.into(), high.into())
    }

    /// field is null or absent
    pub fn is_null(field: &str) -> Self {
        Filter::IsNull(field.to_string())
    }

    /// field is present and non-null
    pub fn not_null(field: &str) -> Self {
        Filter::NotNull(field.to_string())
    }

    /// All sub-filters match
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    /// Any sub-filter matches
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Negation
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Every field name referenced anywhere in the tree.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::Eq(f, _)
            | Filter::Ne(f, _)
            | Filter::Gt(f, _)
            | Filter::Ge(f, _)
            | Filter::Lt(f, _)
            | Filter::Le(f, _)
            | Filter::Between(f, _, _)
            | Filter::IsNull(f)
            | Filter::NotNull(f) => out.push(f.as_str()),
            Filter::And(fs) | Filter::Or(fs) => {
                for f in fs {
                    f.collect_fields(out);
                }
            }
            Filter::Not(f) => f.collect_fields(out),
        }
    }

    /// Evaluate the filter against a record's serialized field map.
    ///
    /// Missing and null fields never satisfy a comparison; they satisfy
    /// `IsNull` only.
    pub fn matches(&self, data: &JsonValue) -> bool {
        match self {
            Filter::Eq(f, v) => compare(data, f, v) == Some(Ordering::Equal),
            Filter::Ne(f, v) => {
                matches!(compare(data, f, v), Some(o) if o != Ordering::Equal)
            }
            Filter::Gt(f, v) => compare(data, f, v) == Some(Ordering::Greater),
            Filter::Ge(f, v) => {
                matches!(compare(data, f, v), Some(Ordering::Greater | Ordering::Equal))
            }
            Filter::Lt(f, v) => compare(data, f, v) == Some(Ordering::Less),
            Filter::Le(f, v) => {
                matches!(compare(data, f, v), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::Between(f, low, high) => {
                matches!(compare(data, f, low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(data, f, high), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::IsNull(f) => field_of(data, f).map_or(true, JsonValue::is_null),
            Filter::NotNull(f) => field_of(data, f).map_or(false, |v| !v.is_null()),
            Filter::And(fs) => fs.iter().all(|f| f.matches(data)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(data)),
            Filter::Not(f) => !f.matches(data),
        }
    }
}

/// One ordering term of a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    /// Field to order by
    pub field: String,
    /// Descending instead of the default ascending
    pub descending: bool,
}

impl SortOrder {
    /// Ascending order on a field.
    pub fn asc(field: &str) -> Self {
        SortOrder {
            field: field.to_string(),
            descending: false,
        }
    }

    /// Descending order on a field.
    pub fn desc(field: &str) -> Self {
        SortOrder {
            field: field.to_string(),
            descending: true,
        }
    }
}

/// Compare two records' field maps under an ordering list; ties broken by
/// the caller (typically on ID).
pub fn compare_records(a: &JsonValue, b: &JsonValue, order: &[SortOrder]) -> Ordering {
    for term in order {
        let va = field_of(a, &term.field);
        let vb = field_of(b, &term.field);
        let ord = compare_json(va, vb);
        let ord = if term.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn field_of<'a>(data: &'a JsonValue, field: &str) -> Option<&'a JsonValue> {
    data.get(field)
}

// Nulls sort first; mismatched kinds compare by kind tag so ordering stays
// total for sorting purposes.
fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    fn rank(v: Option<&JsonValue>) -> u8 {
        match v {
            None | Some(JsonValue::Null) => 0,
            Some(JsonValue::Bool(_)) => 1,
            Some(JsonValue::Number(_)) => 2,
            Some(JsonValue::String(_)) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Some(JsonValue::Bool(x)), Some(JsonValue::Bool(y))) => x.cmp(y),
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => {
            let xf = x.as_f64().unwrap_or(f64::NAN);
            let yf = y.as_f64().unwrap_or(f64::NAN);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn compare(data: &JsonValue, field: &str, operand: &FilterValue) -> Option<Ordering> {
    let value = field_of(data, field)?;
    if value.is_null() {
        return None;
    }
    match operand {
        FilterValue::Int(i) => {
            let v = value.as_i64()?;
            Some(v.cmp(i))
        }
        FilterValue::Float(f) => {
            let v = value.as_f64()?;
            v.partial_cmp(f)
        }
        FilterValue::Text(s) => {
            let v = value.as_str()?;
            Some(v.cmp(s.as_str()))
        }
        FilterValue::Bool(b) => {
            let v = value.as_bool()?;
            Some(v.cmp(b))
        }
        FilterValue::Time(t) => {
            let v = value.as_str()?.parse::<DateTime<Utc>>().ok()?;
            Some(v.cmp(t))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> JsonValue {
        json!({
            "id": 10,
            "name": "widget",
            "qty": 3,
            "price": 1.5,
            "active": true,
            "retired_at": null,
        })
    }

    #[test]
    fn test_eq_and_ne() {
        let r = record();
        assert!(Filter::eq("name", "widget").matches(&r));
        assert!(!Filter::eq("name", "gadget").matches(&r));
        assert!(Filter::ne("qty", 4).matches(&r));
        assert!(!Filter::ne("qty", 3).matches(&r));
    }

    #[test]
    fn test_ordering_comparisons() {
        let r = record();
        assert!(Filter::gt("qty", 2).matches(&r));
        assert!(Filter::ge("qty", 3).matches(&r));
        assert!(Filter::lt("price", 2.0).matches(&r));
        assert!(Filter::le("qty", 3).matches(&r));
        assert!(Filter::between("qty", 1, 5).matches(&r));
        assert!(!Filter::between("qty", 4, 5).matches(&r));
    }

    #[test]
    fn test_null_handling() {
        let r = record();
        assert!(Filter::is_null("retired_at").matches(&r));
        assert!(Filter::is_null("missing").matches(&r));
        assert!(Filter::not_null("name").matches(&r));
        assert!(!Filter::not_null("retired_at").matches(&r));
        // A null field never satisfies a comparison
        assert!(!Filter::eq("retired_at", 1).matches(&r));
        assert!(!Filter::ne("missing", 1).matches(&r));
    }

    #[test]
    fn test_boolean_combinators() {
        let r = record();
        let f = Filter::and(vec![Filter::eq("active", true), Filter::gt("qty", 1)]);
        assert!(f.matches(&r));
        let f = Filter::or(vec![Filter::eq("name", "nope"), Filter::eq("qty", 3)]);
        assert!(f.matches(&r));
        assert!(Filter::not(Filter::eq("qty", 4)).matches(&r));
    }

    #[test]
    fn test_time_comparison() {
        let t1: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let t2: DateTime<Utc> = "2024-06-01T00:00:00Z".parse().unwrap();
        let r = json!({ "modified_at": serde_json::to_value(t2).unwrap() });
        assert!(Filter::gt("modified_at", t1).matches(&r));
        assert!(!Filter::lt("modified_at", t1).matches(&r));
    }

    #[test]
    fn test_fields_collection() {
        let f = Filter::and(vec![
            Filter::eq("a", 1),
            Filter::or(vec![Filter::is_null("b"), Filter::not(Filter::gt("c", 2))]),
        ]);
        let mut fields = f.fields();
        fields.sort_unstable();
        assert_eq!(fields, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_compare_records_ordering() {
        let a = json!({ "qty": 1, "name": "b" });
        let b = json!({ "qty": 1, "name": "a" });
        let order = vec![SortOrder::asc("qty"), SortOrder::desc("name")];
        assert_eq!(compare_records(&a, &b, &order), Ordering::Less);
        let order = vec![SortOrder::asc("name")];
        assert_eq!(compare_records(&a, &b, &order), Ordering::Greater);
    }
}
