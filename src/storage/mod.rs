pub mod memory;

use crate::metadata::types::Value;
use crate::query::plan::SortOrder;
use async_trait::async_trait;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Column name under which a count projection returns its single value.
pub const COUNT_COLUMN: &str = "count";

/// A physical row at the storage boundary, keyed by column name. Absent
/// optional columns are simply missing from the map.
pub type StoredRow = BTreeMap<CompactString, Value>;

/// Bound predicate over physical column names. Produced exclusively by the
/// query builder from a schema snapshot; column names never originate from
/// caller strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Eq(CompactString, Value),
    Ne(CompactString, Value),
    Lt(CompactString, Value),
    Lte(CompactString, Value),
    Gt(CompactString, Value),
    Gte(CompactString, Value),
    In(CompactString, Vec<Value>),
    Between(CompactString, Value, Value),
    IsNull(CompactString),
    IsNotNull(CompactString),
    Contains(CompactString, CompactString),
    StartsWith(CompactString, CompactString),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn and(self, rhs: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(rhs))
    }
}

/// Combine optional predicate fragments with AND.
pub fn combine_and(parts: impl IntoIterator<Item = Option<Predicate>>) -> Option<Predicate> {
    parts
        .into_iter()
        .flatten()
        .reduce(|acc, next| acc.and(next))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    Columns(Vec<CompactString>),
    CountAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub table: CompactString,
    pub projection: Projection,
    pub predicate: Option<Predicate>,
    pub order_by: Vec<(CompactString, SortOrder)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SelectStatement {
    pub fn columns(table: impl Into<CompactString>, columns: Vec<CompactString>) -> Self {
        Self {
            table: table.into(),
            projection: Projection::Columns(columns),
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn count(table: impl Into<CompactString>) -> Self {
        Self {
            table: table.into(),
            projection: Projection::CountAll,
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn filtered(mut self, predicate: Option<Predicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn ordered(mut self, order_by: Vec<(CompactString, SortOrder)>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn paged(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub table: CompactString,
    pub columns: Vec<CompactString>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub table: CompactString,
    pub assignments: Vec<(CompactString, Value)>,
    pub predicate: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub table: CompactString,
    pub predicate: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

/// Rendered statement text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedSql {
    pub text: String,
    pub params: Vec<Value>,
}

impl Statement {
    /// Render to `$n`-placeholder SQL. Values only ever enter the parameter
    /// vector; identifiers come from the statement structure, which the
    /// builder populates from the trusted snapshot alone. This is the
    /// engine's injection-safety boundary.
    pub fn to_sql(&self) -> ParameterizedSql {
        let mut params = Vec::new();
        let text = match self {
            Statement::Select(select) => render_select(select, &mut params),
            Statement::Insert(insert) => render_insert(insert, &mut params),
            Statement::Update(update) => render_update(update, &mut params),
            Statement::Delete(delete) => render_delete(delete, &mut params),
        };
        ParameterizedSql { text, params }
    }
}

fn ident(name: &str) -> String {
    // Snapshot compilation restricts identifiers to [a-z_][a-z0-9_]*, so
    // quoting needs no escaping.
    format!("\"{name}\"")
}

fn push_param(params: &mut Vec<Value>, value: Value) -> String {
    params.push(value);
    format!("${}", params.len())
}

fn render_select(select: &SelectStatement, params: &mut Vec<Value>) -> String {
    let projection = match &select.projection {
        Projection::Columns(columns) => columns
            .iter()
            .map(|c| ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        Projection::CountAll => format!("COUNT(*) AS {}", ident(COUNT_COLUMN)),
    };
    let mut text = format!("SELECT {projection} FROM {}", ident(&select.table));
    if let Some(predicate) = &select.predicate {
        text.push_str(" WHERE ");
        text.push_str(&render_predicate(predicate, params));
    }
    if !select.order_by.is_empty() {
        let order = select
            .order_by
            .iter()
            .map(|(column, order)| {
                let direction = match order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                format!("{} {direction}", ident(column))
            })
            .collect::<Vec<_>>()
            .join(", ");
        text.push_str(" ORDER BY ");
        text.push_str(&order);
    }
    if let Some(limit) = select.limit {
        let placeholder = push_param(params, Value::Integer(limit as i64));
        text.push_str(&format!(" LIMIT {placeholder}"));
    }
    if let Some(offset) = select.offset {
        let placeholder = push_param(params, Value::Integer(offset as i64));
        text.push_str(&format!(" OFFSET {placeholder}"));
    }
    text
}

fn render_insert(insert: &InsertStatement, params: &mut Vec<Value>) -> String {
    let columns = insert
        .columns
        .iter()
        .map(|c| ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = insert
        .values
        .iter()
        .map(|value| push_param(params, value.clone()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders})",
        ident(&insert.table)
    )
}

fn render_update(update: &UpdateStatement, params: &mut Vec<Value>) -> String {
    let assignments = update
        .assignments
        .iter()
        .map(|(column, value)| {
            let placeholder = push_param(params, value.clone());
            format!("{} = {placeholder}", ident(column))
        })
        .collect::<Vec<_>>()
        .join(", ");
    let mut text = format!("UPDATE {} SET {assignments}", ident(&update.table));
    if let Some(predicate) = &update.predicate {
        text.push_str(" WHERE ");
        text.push_str(&render_predicate(predicate, params));
    }
    text
}

fn render_delete(delete: &DeleteStatement, params: &mut Vec<Value>) -> String {
    let mut text = format!("DELETE FROM {}", ident(&delete.table));
    if let Some(predicate) = &delete.predicate {
        text.push_str(" WHERE ");
        text.push_str(&render_predicate(predicate, params));
    }
    text
}

/// Escape LIKE wildcards in a caller-supplied fragment. The fragment still
/// travels as a bound parameter; this only keeps `%`/`_` literal.
fn like_fragment(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn render_predicate(predicate: &Predicate, params: &mut Vec<Value>) -> String {
    match predicate {
        Predicate::Eq(column, value) => {
            let p = push_param(params, value.clone());
            format!("{} = {p}", ident(column))
        }
        Predicate::Ne(column, value) => {
            let p = push_param(params, value.clone());
            format!("{} <> {p}", ident(column))
        }
        Predicate::Lt(column, value) => {
            let p = push_param(params, value.clone());
            format!("{} < {p}", ident(column))
        }
        Predicate::Lte(column, value) => {
            let p = push_param(params, value.clone());
            format!("{} <= {p}", ident(column))
        }
        Predicate::Gt(column, value) => {
            let p = push_param(params, value.clone());
            format!("{} > {p}", ident(column))
        }
        Predicate::Gte(column, value) => {
            let p = push_param(params, value.clone());
            format!("{} >= {p}", ident(column))
        }
        Predicate::In(column, values) => {
            let placeholders = values
                .iter()
                .map(|value| push_param(params, value.clone()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} IN ({placeholders})", ident(column))
        }
        Predicate::Between(column, low, high) => {
            let low_p = push_param(params, low.clone());
            let high_p = push_param(params, high.clone());
            format!("{} BETWEEN {low_p} AND {high_p}", ident(column))
        }
        Predicate::IsNull(column) => format!("{} IS NULL", ident(column)),
        Predicate::IsNotNull(column) => format!("{} IS NOT NULL", ident(column)),
        Predicate::Contains(column, fragment) => {
            let pattern = format!("%{}%", like_fragment(fragment));
            let p = push_param(params, Value::Text(pattern.into()));
            format!("{} LIKE {p} ESCAPE '\\'", ident(column))
        }
        Predicate::StartsWith(column, fragment) => {
            let pattern = format!("{}%", like_fragment(fragment));
            let p = push_param(params, Value::Text(pattern.into()));
            format!("{} LIKE {p} ESCAPE '\\'", ident(column))
        }
        Predicate::And(left, right) => format!(
            "({} AND {})",
            render_predicate(left, params),
            render_predicate(right, params)
        ),
        Predicate::Or(left, right) => format!(
            "({} OR {})",
            render_predicate(left, params),
            render_predicate(right, params)
        ),
        Predicate::Not(inner) => format!("NOT ({})", render_predicate(inner, params)),
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("unique constraint violated on {table} ({columns})")]
    UniqueViolation { table: String, columns: String },
    #[error("storage error: {0}")]
    Fatal(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<StorageError> for crate::error::MedbError {
    fn from(err: StorageError) -> Self {
        use crate::error::{ConflictCause, MedbError, StorageErrorKind};
        match err {
            StorageError::Transient(message) => MedbError::Storage {
                kind: StorageErrorKind::Transient,
                message,
            },
            // Deferred uniqueness checks surface here, inside the
            // transaction, as the caller-visible conflict.
            StorageError::UniqueViolation { .. } => MedbError::Conflict {
                cause: ConflictCause::Unique,
            },
            StorageError::Fatal(message) => MedbError::Storage {
                kind: StorageErrorKind::Fatal,
                message,
            },
        }
    }
}

/// One open storage transaction. All statements issued through it commit
/// together or not at all; dropping without `commit` discards the writes.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn query(&mut self, statement: &SelectStatement) -> Result<Vec<StoredRow>, StorageError>;
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StorageError>;
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Physical storage boundary. The engine issues single read statements
/// directly and opens a transaction for every mutating operation.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn query(
        &self,
        tenant_id: &str,
        statement: &SelectStatement,
    ) -> Result<Vec<StoredRow>, StorageError>;

    async fn begin(&self, tenant_id: &str) -> Result<Box<dyn StorageTransaction>, StorageError>;
}

/// Read the single value of a count projection result.
pub fn count_from_rows(rows: &[StoredRow]) -> u64 {
    rows.first()
        .and_then(|row| row.get(COUNT_COLUMN))
        .and_then(|value| value.as_i64())
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{
        InsertStatement, Predicate, Projection, SelectStatement, Statement, UpdateStatement,
    };
    use crate::metadata::types::Value;
    use crate::query::plan::SortOrder;

    fn assert_placeholders_only(rendered: &super::ParameterizedSql) {
        // Every bound value must appear as a placeholder, never inline.
        for (index, _) in rendered.params.iter().enumerate() {
            assert!(
                rendered.text.contains(&format!("${}", index + 1)),
                "missing placeholder ${} in: {}",
                index + 1,
                rendered.text
            );
        }
        for value in &rendered.params {
            if let Value::Text(text) = value {
                if !text.is_empty() {
                    assert!(
                        !rendered.text.contains(text.as_str()),
                        "parameter value leaked into statement text: {}",
                        rendered.text
                    );
                }
            }
        }
    }

    #[test]
    fn select_renders_bound_parameters() {
        let statement = Statement::Select(
            SelectStatement::columns("contact", vec!["id".into(), "name".into()])
                .filtered(Some(
                    Predicate::Eq("name".into(), Value::Text("Ann'; DROP TABLE x;--".into()))
                        .and(Predicate::IsNull("deleted_at".into())),
                ))
                .ordered(vec![("id".into(), SortOrder::Asc)])
                .paged(10, 20),
        );
        let rendered = statement.to_sql();
        assert_eq!(
            rendered.text,
            "SELECT \"id\", \"name\" FROM \"contact\" WHERE (\"name\" = $1 AND \
             \"deleted_at\" IS NULL) ORDER BY \"id\" ASC LIMIT $2 OFFSET $3"
        );
        assert_eq!(rendered.params.len(), 3);
        assert_placeholders_only(&rendered);
    }

    #[test]
    fn count_projection_renders_alias() {
        let statement = Statement::Select(SelectStatement::count("contact"));
        let rendered = statement.to_sql();
        assert_eq!(
            rendered.text,
            "SELECT COUNT(*) AS \"count\" FROM \"contact\""
        );
        assert!(rendered.params.is_empty());
    }

    #[test]
    fn insert_and_update_render_placeholders() {
        let insert = Statement::Insert(InsertStatement {
            table: "contact".into(),
            columns: vec!["id".into(), "name".into()],
            values: vec![Value::Null, Value::Text("Ann".into())],
        });
        let rendered = insert.to_sql();
        assert_eq!(
            rendered.text,
            "INSERT INTO \"contact\" (\"id\", \"name\") VALUES ($1, $2)"
        );
        assert_placeholders_only(&rendered);

        let update = Statement::Update(UpdateStatement {
            table: "contact".into(),
            assignments: vec![("name".into(), Value::Text("Bea".into()))],
            predicate: Some(Predicate::Eq("id".into(), Value::Integer(7))),
        });
        let rendered = update.to_sql();
        assert_eq!(
            rendered.text,
            "UPDATE \"contact\" SET \"name\" = $1 WHERE \"id\" = $2"
        );
        assert_placeholders_only(&rendered);
    }

    #[test]
    fn contains_escapes_like_wildcards_in_parameter() {
        let statement = Statement::Select(
            SelectStatement {
                table: "contact".into(),
                projection: Projection::Columns(vec!["id".into()]),
                predicate: Some(Predicate::Contains("name".into(), "50%_off".into())),
                order_by: Vec::new(),
                limit: None,
                offset: None,
            },
        );
        let rendered = statement.to_sql();
        assert!(rendered.text.contains("LIKE $1 ESCAPE"));
        assert_eq!(
            rendered.params,
            vec![Value::Text("%50\\%\\_off%".into())]
        );
    }
}
