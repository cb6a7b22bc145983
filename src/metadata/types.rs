use chrono::{DateTime, NaiveDate, Utc};
use compact_str::CompactString;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Closed registry of scalar types a tenant field may take. The validator,
/// query builder, and memory backend all match on this exhaustively, so a
/// new variant is a compile-time-checked change across the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Reference,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Reference => "reference",
        }
    }

    /// Whether `<`/`>`/`Between` predicates make sense for this type.
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::Decimal | FieldType::Date | FieldType::DateTime
        )
    }
}

/// A coerced scalar: one variant per [`FieldType`] plus `Null`. Everything
/// past the validator boundary carries these, never free-form JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Decimal(Decimal),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Reference(Uuid),
    Null,
}

/// Engine-level row shape: field code to coerced scalar. Physical rows at
/// the storage boundary are keyed by column name instead.
pub type Record = BTreeMap<CompactString, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The registry type this scalar belongs to; `None` for `Null`.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Text(_) => Some(FieldType::Text),
            Value::Integer(_) => Some(FieldType::Integer),
            Value::Decimal(_) => Some(FieldType::Decimal),
            Value::Boolean(_) => Some(FieldType::Boolean),
            Value::Date(_) => Some(FieldType::Date),
            Value::DateTime(_) => Some(FieldType::DateTime),
            Value::Reference(_) => Some(FieldType::Reference),
            Value::Null => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.field_type() {
            Some(ft) => ft.as_str(),
            None => "null",
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Boundary representation used for caller payload echoes and audit
    /// images. Decimals render as strings so precision survives JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Text(s) => serde_json::Value::String(s.to_string()),
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Decimal(d) => serde_json::Value::String(d.to_string()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Reference(id) => serde_json::Value::String(id.to_string()),
            Value::Null => serde_json::Value::Null,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Decimal(_) => 3,
            Value::Date(_) => 4,
            Value::DateTime(_) => 5,
            Value::Text(_) => 6,
            Value::Reference(_) => 7,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Reference(a), Value::Reference(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Render a record as a JSON object keyed by field code.
pub fn record_to_json(record: &Record) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = record
        .iter()
        .map(|(code, value)| (code.to_string(), value.to_json()))
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::{record_to_json, FieldType, Record, Value};
    use chrono::{NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Integer),
            any::<i64>().prop_map(|n| Value::Decimal(Decimal::new(n, 4))),
            (1970i32..2100, 1u32..13, 1u32..29).prop_map(|(y, m, d)| {
                Value::Date(NaiveDate::from_ymd_opt(y, m, d).expect("valid date"))
            }),
            (0i64..4_000_000_000).prop_map(|secs| {
                Value::DateTime(Utc.timestamp_opt(secs, 0).single().expect("valid timestamp"))
            }),
            "\\PC{0,32}".prop_map(|s| Value::Text(s.into())),
            prop::array::uniform16(any::<u8>()).prop_map(|b| Value::Reference(Uuid::from_bytes(b))),
            Just(Value::Null),
        ]
    }

    proptest! {
        #[test]
        fn ordering_is_total_and_symmetric(a in arb_value(), b in arb_value()) {
            let forward = a.cmp(&b);
            let backward = b.cmp(&a);
            prop_assert_eq!(forward, backward.reverse());
        }

        #[test]
        fn serde_roundtrip_preserves_ordering(a in arb_value(), b in arb_value()) {
            let a2: Value = serde_json::from_str(&serde_json::to_string(&a).expect("encode"))
                .expect("decode");
            let b2: Value = serde_json::from_str(&serde_json::to_string(&b).expect("encode"))
                .expect("decode");
            prop_assert_eq!(a.cmp(&b), a2.cmp(&b2));
        }
    }

    #[test]
    fn null_sorts_before_everything() {
        assert!(Value::Null < Value::Boolean(false));
        assert!(Value::Null < Value::Integer(i64::MIN));
        assert!(Value::Null < Value::Text("".into()));
    }

    #[test]
    fn ordered_types_cover_range_predicates() {
        assert!(FieldType::Integer.is_ordered());
        assert!(FieldType::Date.is_ordered());
        assert!(!FieldType::Text.is_ordered());
        assert!(!FieldType::Reference.is_ordered());
    }

    #[test]
    fn json_rendering_keeps_decimal_precision() {
        let mut record = Record::new();
        record.insert("amount".into(), Value::Decimal(Decimal::new(10001, 2)));
        record.insert("note".into(), Value::Null);
        let json = record_to_json(&record);
        assert_eq!(json["amount"], serde_json::json!("100.01"));
        assert_eq!(json["note"], serde_json::Value::Null);
    }
}
