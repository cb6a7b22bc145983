use crate::metadata::types::{record_to_json, Record, Value};
use crate::storage::InsertStatement;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

/// One append-only before/after record of a mutation. Written in the same
/// transaction as the mutation itself; the engine has no code path that
/// updates or deletes one.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub entity: CompactString,
    pub record_id: Uuid,
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub old_values: serde_json::Value,
    pub new_values: serde_json::Value,
    pub changed_fields: Vec<CompactString>,
    pub at: DateTime<Utc>,
}

/// Field codes whose value differs between the old record and the patch.
/// A patched field equal to its stored value does not count as changed.
pub fn changed_fields(old: &Record, patch: &Record) -> Vec<CompactString> {
    patch
        .iter()
        .filter(|(code, new_value)| {
            let old_value = old.get(*code).unwrap_or(&Value::Null);
            old_value != *new_value
        })
        .map(|(code, _)| code.clone())
        .collect()
}

fn restrict(record: &Record, fields: &[CompactString]) -> serde_json::Value {
    let restricted: Record = record
        .iter()
        .filter(|(code, _)| fields.contains(*code))
        .map(|(code, value)| (code.clone(), value.clone()))
        .collect();
    record_to_json(&restricted)
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl AuditEntry {
    pub fn created(
        entity: impl Into<CompactString>,
        record_id: Uuid,
        actor_id: Uuid,
        record: &Record,
    ) -> Self {
        Self {
            entity: entity.into(),
            record_id,
            action: AuditAction::Create,
            actor_id,
            old_values: empty_object(),
            new_values: record_to_json(record),
            changed_fields: record.keys().cloned().collect(),
            at: Utc::now(),
        }
    }

    /// Update entry with images restricted to the changed fields, so the
    /// log answers "what changed" without duplicating the whole row.
    pub fn updated(
        entity: impl Into<CompactString>,
        record_id: Uuid,
        actor_id: Uuid,
        old: &Record,
        new: &Record,
        changed: Vec<CompactString>,
    ) -> Self {
        Self {
            entity: entity.into(),
            record_id,
            action: AuditAction::Update,
            actor_id,
            old_values: restrict(old, &changed),
            new_values: restrict(new, &changed),
            changed_fields: changed,
            at: Utc::now(),
        }
    }

    pub fn deleted(
        entity: impl Into<CompactString>,
        record_id: Uuid,
        actor_id: Uuid,
        record: &Record,
    ) -> Self {
        Self {
            entity: entity.into(),
            record_id,
            action: AuditAction::Delete,
            actor_id,
            old_values: record_to_json(record),
            new_values: empty_object(),
            changed_fields: record.keys().cloned().collect(),
            at: Utc::now(),
        }
    }

    /// The audit-table insert to append to the mutation's transaction.
    pub fn insert_statement(&self, audit_table: &CompactString, audit_id: Uuid) -> InsertStatement {
        let changed = serde_json::Value::Array(
            self.changed_fields
                .iter()
                .map(|code| serde_json::Value::String(code.to_string()))
                .collect(),
        );
        InsertStatement {
            table: audit_table.clone(),
            columns: vec![
                "id".into(),
                "entity".into(),
                "record_id".into(),
                "action".into(),
                "actor_id".into(),
                "old_values".into(),
                "new_values".into(),
                "changed_fields".into(),
                "at".into(),
            ],
            values: vec![
                Value::Reference(audit_id),
                Value::Text(self.entity.clone()),
                Value::Reference(self.record_id),
                Value::Text(self.action.as_str().into()),
                Value::Reference(self.actor_id),
                Value::Text(self.old_values.to_string().into()),
                Value::Text(self.new_values.to_string().into()),
                Value::Text(changed.to_string().into()),
                Value::DateTime(self.at),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{changed_fields, AuditEntry};
    use crate::metadata::types::{Record, Value};
    use uuid::Uuid;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(code, value)| ((*code).into(), value.clone()))
            .collect()
    }

    #[test]
    fn changed_fields_ignores_equal_and_absent() {
        let old = record(&[
            ("status", Value::Text("new".into())),
            ("name", Value::Text("Ann".into())),
        ]);
        let patch = record(&[
            ("status", Value::Text("won".into())),
            ("name", Value::Text("Ann".into())),
        ]);
        assert_eq!(changed_fields(&old, &patch), vec!["status"]);
    }

    #[test]
    fn clearing_a_field_counts_as_change() {
        let old = record(&[("email", Value::Text("a@x.com".into()))]);
        let patch = record(&[("email", Value::Null)]);
        assert_eq!(changed_fields(&old, &patch), vec!["email"]);
        // Clearing an already-absent field is not a change.
        let patch = record(&[("email", Value::Null)]);
        assert!(changed_fields(&Record::new(), &patch).is_empty());
    }

    #[test]
    fn update_entry_restricts_images_to_changed_fields() {
        let old = record(&[
            ("status", Value::Text("new".into())),
            ("name", Value::Text("Ann".into())),
        ]);
        let new = record(&[
            ("status", Value::Text("won".into())),
            ("name", Value::Text("Ann".into())),
        ]);
        let entry = AuditEntry::updated(
            "contact",
            Uuid::now_v7(),
            Uuid::now_v7(),
            &old,
            &new,
            vec!["status".into()],
        );
        assert_eq!(entry.old_values, serde_json::json!({"status": "new"}));
        assert_eq!(entry.new_values, serde_json::json!({"status": "won"}));
    }

    #[test]
    fn insert_statement_binds_one_value_per_column() {
        let entry = AuditEntry::created(
            "contact",
            Uuid::now_v7(),
            Uuid::now_v7(),
            &record(&[("name", Value::Text("Ann".into()))]),
        );
        let statement = entry.insert_statement(&"audit_log".into(), Uuid::now_v7());
        assert_eq!(statement.columns.len(), statement.values.len());
        assert_eq!(statement.table.as_str(), "audit_log");
    }
}
