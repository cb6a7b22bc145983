use crate::error::{FieldViolation, ViolationRule};
use crate::metadata::types::{FieldType, Record, Value};
use crate::metadata::FieldDef;
use crate::schema::EntitySchema;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateMode {
    /// Full-record validation: every schema field is considered, defaults
    /// are applied, absent required fields are violations.
    Create,
    /// Partial patch: only supplied fields are validated; an explicit null
    /// clears the field (and violates `required` if the field demands one).
    Patch,
}

/// Coerce one untyped JSON scalar into the field type's native
/// representation. Type-only; constraint checks come after. The error
/// string describes the expected shape, never the offending value.
pub fn coerce_scalar(field_type: FieldType, raw: &JsonValue) -> Result<Value, String> {
    match field_type {
        FieldType::Text => match raw {
            JsonValue::String(s) => Ok(Value::Text(s.as_str().into())),
            _ => Err("expected a string".to_string()),
        },
        FieldType::Integer => match raw.as_i64() {
            Some(n) => Ok(Value::Integer(n)),
            None => Err("expected an integer".to_string()),
        },
        FieldType::Decimal => match raw {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Decimal(Decimal::from(i)))
                } else if let Some(f) = n.as_f64() {
                    Decimal::from_f64(f)
                        .map(Value::Decimal)
                        .ok_or_else(|| "expected a finite decimal number".to_string())
                } else {
                    Err("expected a decimal number".to_string())
                }
            }
            JsonValue::String(s) => s
                .parse::<Decimal>()
                .map(Value::Decimal)
                .map_err(|_| "expected a decimal number".to_string()),
            _ => Err("expected a decimal number".to_string()),
        },
        FieldType::Boolean => match raw {
            JsonValue::Bool(b) => Ok(Value::Boolean(*b)),
            _ => Err("expected a boolean".to_string()),
        },
        FieldType::Date => match raw {
            JsonValue::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| "expected an ISO date (YYYY-MM-DD)".to_string()),
            _ => Err("expected an ISO date string".to_string()),
        },
        FieldType::DateTime => match raw {
            JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::DateTime(dt.with_timezone(&Utc)))
                .map_err(|_| "expected an RFC 3339 datetime".to_string()),
            _ => Err("expected an RFC 3339 datetime string".to_string()),
        },
        FieldType::Reference => match raw {
            JsonValue::String(s) => Uuid::parse_str(s)
                .map(Value::Reference)
                .map_err(|_| "expected a UUID".to_string()),
            _ => Err("expected a UUID string".to_string()),
        },
    }
}

fn check_constraints(
    field: &FieldDef,
    pattern: Option<&Regex>,
    value: &Value,
    violations: &mut Vec<FieldViolation>,
) {
    match value {
        Value::Text(text) => {
            let length = text.chars().count();
            if let Some(min) = field.min_length {
                if length < min {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::MinLength,
                        format!("value must be at least {min} characters"),
                    ));
                }
            }
            if let Some(max) = field.max_length {
                if length > max {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::MaxLength,
                        format!("value must be at most {max} characters"),
                    ));
                }
            }
            if let Some(regex) = pattern {
                if !regex.is_match(text.as_str()) {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::Pattern,
                        "value does not match the required pattern",
                    ));
                }
            }
        }
        Value::Integer(_) | Value::Decimal(_) => {
            let numeric = match value {
                Value::Integer(n) => Decimal::from(*n),
                Value::Decimal(d) => *d,
                _ => unreachable!(),
            };
            if let Some(min) = field.min_value {
                if numeric < min {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::MinValue,
                        format!("value must be at least {min}"),
                    ));
                }
            }
            if let Some(max) = field.max_value {
                if numeric > max {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::MaxValue,
                        format!("value must be at most {max}"),
                    ));
                }
            }
        }
        Value::Boolean(_)
        | Value::Date(_)
        | Value::DateTime(_)
        | Value::Reference(_)
        | Value::Null => {}
    }
}

/// Validate and coerce a caller payload against one entity's schema.
///
/// All violations across all fields are collected and returned together;
/// a caller repairing a request sees every problem at once. Unknown input
/// fields are rejected, never silently dropped. Uniqueness is deliberately
/// absent here: it is enforced inside the storage transaction so there is
/// no check-then-act window.
pub fn validate_payload(
    entity: &EntitySchema,
    payload: &serde_json::Map<String, JsonValue>,
    mode: ValidateMode,
) -> Result<Record, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    let mut record = Record::new();

    for key in payload.keys() {
        if entity.field(key).is_none() {
            violations.push(FieldViolation::new(
                key.as_str(),
                ViolationRule::UnknownField,
                format!("entity '{}' has no such field", entity.code()),
            ));
        }
    }

    for field in entity.fields() {
        let supplied = payload.get(&field.code);
        match (supplied, mode) {
            (None, ValidateMode::Patch) => {}
            (None, ValidateMode::Create) => {
                if let Some(default) = &field.default_value {
                    record.insert(field.code.as_str().into(), default.clone());
                } else if field.is_required {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::Required,
                        "value is required",
                    ));
                }
            }
            (Some(JsonValue::Null), _) => {
                if field.is_required {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::Required,
                        "value is required",
                    ));
                } else if mode == ValidateMode::Patch {
                    record.insert(field.code.as_str().into(), Value::Null);
                }
            }
            (Some(raw), _) => match coerce_scalar(field.field_type, raw) {
                Ok(value) => {
                    check_constraints(field, entity.pattern(&field.code), &value, &mut violations);
                    record.insert(field.code.as_str().into(), value);
                }
                Err(message) => {
                    violations.push(FieldViolation::new(
                        field.code.as_str(),
                        ViolationRule::Type,
                        message,
                    ));
                }
            },
        }
    }

    if violations.is_empty() {
        Ok(record)
    } else {
        Err(violations)
    }
}
