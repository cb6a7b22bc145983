use crate::metadata::types::Value;
use crate::query::plan::SortOrder;
use crate::storage::{
    DeleteStatement, InsertStatement, Predicate, Projection, SelectStatement, Statement,
    StorageBackend, StorageError, StorageTransaction, StoredRow, UpdateStatement, COUNT_COLUMN,
};
use async_trait::async_trait;
use compact_str::CompactString;
use im::{HashMap as ImHashMap, Vector};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Physical column of a provisioned table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: CompactString,
    pub nullable: bool,
}

/// Physical table definition. Provisioning tables belongs to the
/// out-of-scope admin layer; tests and embedded deployments call
/// [`MemoryBackend::provision`] directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: CompactString,
    pub columns: Vec<ColumnSpec>,
    pub unique: Vec<Vec<CompactString>>,
}

impl TableSpec {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            unique: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<CompactString>, nullable: bool) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            nullable,
        });
        self
    }

    pub fn unique_on<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        self.unique
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

#[derive(Clone)]
struct Table {
    spec: Arc<TableSpec>,
    rows: Vector<StoredRow>,
}

type TenantTables = ImHashMap<CompactString, Table>;
type State = ImHashMap<String, TenantTables>;

/// In-memory storage backend. Persistent (`im`) maps make transaction
/// staging a cheap structural copy; transactions serialize on one lock,
/// which is the storage engine's write ordering.
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    fail_next: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Create a physical table for a tenant. Replaces any existing table of
    /// the same name, dropping its rows.
    pub async fn provision(&self, tenant_id: &str, spec: TableSpec) {
        let mut state = self.state.lock().await;
        let mut tables = state.get(tenant_id).cloned().unwrap_or_default();
        tables.insert(
            spec.name.clone(),
            Table {
                spec: Arc::new(spec),
                rows: Vector::new(),
            },
        );
        state.insert(tenant_id.to_string(), tables);
    }

    /// Make the next `n` backend entry points fail with a transient error.
    /// Test hook for the engine's retry path.
    pub fn inject_transient_failures(&self, n: usize) {
        self.fail_next.store(n, AtomicOrdering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn query(
        &self,
        tenant_id: &str,
        statement: &SelectStatement,
    ) -> Result<Vec<StoredRow>, StorageError> {
        if self.take_injected_failure() {
            return Err(StorageError::Transient("injected failure".to_string()));
        }
        let tables = {
            let state = self.state.lock().await;
            state.get(tenant_id).cloned().unwrap_or_default()
        };
        run_select(&tables, statement)
    }

    async fn begin(&self, tenant_id: &str) -> Result<Box<dyn StorageTransaction>, StorageError> {
        if self.take_injected_failure() {
            return Err(StorageError::Transient("injected failure".to_string()));
        }
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.get(tenant_id).cloned().unwrap_or_default();
        Ok(Box::new(MemoryTransaction {
            guard,
            tenant_id: tenant_id.to_string(),
            staged,
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    tenant_id: String,
    staged: TenantTables,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn query(&mut self, statement: &SelectStatement) -> Result<Vec<StoredRow>, StorageError> {
        run_select(&self.staged, statement)
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, StorageError> {
        match statement {
            Statement::Select(_) => Err(StorageError::Fatal(
                "selects go through query, not execute".to_string(),
            )),
            Statement::Insert(insert) => run_insert(&mut self.staged, insert),
            Statement::Update(update) => run_update(&mut self.staged, update),
            Statement::Delete(delete) => run_delete(&mut self.staged, delete),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let staged = std::mem::take(&mut self.staged);
        self.guard.insert(self.tenant_id.clone(), staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        // Staged tables are discarded with the transaction.
        Ok(())
    }
}

fn table<'a>(tables: &'a TenantTables, name: &str) -> Result<&'a Table, StorageError> {
    tables
        .get(name)
        .ok_or_else(|| StorageError::Fatal(format!("unknown table '{name}'")))
}

fn run_select(
    tables: &TenantTables,
    statement: &SelectStatement,
) -> Result<Vec<StoredRow>, StorageError> {
    let table = table(tables, &statement.table)?;
    let mut rows: Vec<&StoredRow> = table
        .rows
        .iter()
        .filter(|row| match &statement.predicate {
            Some(predicate) => eval_predicate(predicate, row),
            None => true,
        })
        .collect();

    if let Projection::CountAll = statement.projection {
        let mut row = StoredRow::new();
        row.insert(COUNT_COLUMN.into(), Value::Integer(rows.len() as i64));
        return Ok(vec![row]);
    }

    if !statement.order_by.is_empty() {
        rows.sort_by(|a, b| compare_rows(a, b, &statement.order_by));
    }

    let offset = statement.offset.unwrap_or(0);
    let rows = rows.into_iter().skip(offset);
    let rows: Vec<&StoredRow> = match statement.limit {
        Some(limit) => rows.take(limit).collect(),
        None => rows.collect(),
    };

    let Projection::Columns(columns) = &statement.projection else {
        unreachable!("count handled above");
    };
    Ok(rows
        .into_iter()
        .map(|row| {
            columns
                .iter()
                .filter_map(|column| {
                    row.get(column)
                        .filter(|value| !value.is_null())
                        .map(|value| (column.clone(), value.clone()))
                })
                .collect()
        })
        .collect())
}

fn run_insert(tables: &mut TenantTables, statement: &InsertStatement) -> Result<u64, StorageError> {
    let mut current = table(tables, &statement.table)?.clone();
    if statement.columns.len() != statement.values.len() {
        return Err(StorageError::Fatal(
            "column/value arity mismatch".to_string(),
        ));
    }

    let mut row = StoredRow::new();
    for (column, value) in statement.columns.iter().zip(&statement.values) {
        if !current.spec.has_column(column) {
            return Err(StorageError::Fatal(format!(
                "unknown column '{column}' in table '{}'",
                statement.table
            )));
        }
        if !value.is_null() {
            row.insert(column.clone(), value.clone());
        }
    }
    for column in &current.spec.columns {
        if !column.nullable && !row.contains_key(&column.name) {
            return Err(StorageError::Fatal(format!(
                "null value in non-nullable column '{}' of table '{}'",
                column.name, statement.table
            )));
        }
    }
    check_unique(&current, &row, None)?;

    current.rows.push_back(row);
    tables.insert(statement.table.clone(), current);
    Ok(1)
}

fn run_update(tables: &mut TenantTables, statement: &UpdateStatement) -> Result<u64, StorageError> {
    let mut current = table(tables, &statement.table)?.clone();
    for (column, _) in &statement.assignments {
        if !current.spec.has_column(column) {
            return Err(StorageError::Fatal(format!(
                "unknown column '{column}' in table '{}'",
                statement.table
            )));
        }
    }

    let mut affected = 0u64;
    let mut updated: Vec<(usize, StoredRow)> = Vec::new();
    for (index, row) in current.rows.iter().enumerate() {
        let matches = match &statement.predicate {
            Some(predicate) => eval_predicate(predicate, row),
            None => true,
        };
        if !matches {
            continue;
        }
        let mut next = row.clone();
        for (column, value) in &statement.assignments {
            if value.is_null() {
                next.remove(column);
            } else {
                next.insert(column.clone(), value.clone());
            }
        }
        for column in &current.spec.columns {
            if !column.nullable && !next.contains_key(&column.name) {
                return Err(StorageError::Fatal(format!(
                    "null value in non-nullable column '{}' of table '{}'",
                    column.name, statement.table
                )));
            }
        }
        updated.push((index, next));
        affected += 1;
    }

    for (index, next) in &updated {
        check_unique(&current, next, Some(*index))?;
    }
    for (index, next) in updated {
        current.rows.set(index, next);
    }
    tables.insert(statement.table.clone(), current);
    Ok(affected)
}

fn run_delete(tables: &mut TenantTables, statement: &DeleteStatement) -> Result<u64, StorageError> {
    let mut current = table(tables, &statement.table)?.clone();
    let before = current.rows.len();
    current.rows = current
        .rows
        .iter()
        .filter(|row| match &statement.predicate {
            Some(predicate) => !eval_predicate(predicate, row),
            None => false,
        })
        .cloned()
        .collect();
    let affected = (before - current.rows.len()) as u64;
    tables.insert(statement.table.clone(), current);
    Ok(affected)
}

/// Reject a row that collides with another row on any unique column set.
/// Rows missing a value anywhere in the set are exempt, matching SQL's
/// multiple-NULLs-allowed semantics.
fn check_unique(
    table: &Table,
    candidate: &StoredRow,
    skip_index: Option<usize>,
) -> Result<(), StorageError> {
    for unique_set in &table.spec.unique {
        let candidate_key: Option<Vec<&Value>> = unique_set
            .iter()
            .map(|column| candidate.get(column))
            .collect();
        let Some(candidate_key) = candidate_key else {
            continue;
        };
        for (index, row) in table.rows.iter().enumerate() {
            if Some(index) == skip_index {
                continue;
            }
            let row_key: Option<Vec<&Value>> =
                unique_set.iter().map(|column| row.get(column)).collect();
            if row_key == Some(candidate_key.clone()) {
                return Err(StorageError::UniqueViolation {
                    table: table.spec.name.to_string(),
                    columns: unique_set
                        .iter()
                        .map(CompactString::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
    }
    Ok(())
}

fn compare_rows(a: &StoredRow, b: &StoredRow, order_by: &[(CompactString, SortOrder)]) -> Ordering {
    for (column, order) in order_by {
        let left = a.get(column).cloned().unwrap_or(Value::Null);
        let right = b.get(column).cloned().unwrap_or(Value::Null);
        let cmp = left.cmp(&right);
        let cmp = match order {
            SortOrder::Asc => cmp,
            SortOrder::Desc => cmp.reverse(),
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Two-valued predicate semantics: any comparison against an absent value
/// is false, and `Not` is plain boolean negation.
fn eval_predicate(predicate: &Predicate, row: &StoredRow) -> bool {
    match predicate {
        Predicate::Eq(column, value) => row.get(column).is_some_and(|v| v == value),
        Predicate::Ne(column, value) => row.get(column).is_some_and(|v| v != value),
        Predicate::Lt(column, value) => row.get(column).is_some_and(|v| v < value),
        Predicate::Lte(column, value) => row.get(column).is_some_and(|v| v <= value),
        Predicate::Gt(column, value) => row.get(column).is_some_and(|v| v > value),
        Predicate::Gte(column, value) => row.get(column).is_some_and(|v| v >= value),
        Predicate::In(column, values) => row.get(column).is_some_and(|v| values.contains(v)),
        Predicate::Between(column, low, high) => row
            .get(column)
            .is_some_and(|v| v >= low && v <= high),
        Predicate::IsNull(column) => row.get(column).map_or(true, Value::is_null),
        Predicate::IsNotNull(column) => row.get(column).is_some_and(|v| !v.is_null()),
        Predicate::Contains(column, fragment) => row
            .get(column)
            .and_then(Value::as_text)
            .is_some_and(|text| text.contains(fragment.as_str())),
        Predicate::StartsWith(column, fragment) => row
            .get(column)
            .and_then(Value::as_text)
            .is_some_and(|text| text.starts_with(fragment.as_str())),
        Predicate::And(left, right) => eval_predicate(left, row) && eval_predicate(right, row),
        Predicate::Or(left, right) => eval_predicate(left, row) || eval_predicate(right, row),
        Predicate::Not(inner) => !eval_predicate(inner, row),
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryBackend, TableSpec};
    use crate::metadata::types::Value;
    use crate::query::plan::SortOrder;
    use crate::storage::{
        count_from_rows, InsertStatement, Predicate, SelectStatement, Statement, StorageBackend,
        StorageError, UpdateStatement,
    };

    fn contact_spec() -> TableSpec {
        TableSpec::new("contact")
            .column("id", false)
            .column("name", false)
            .column("email", true)
            .unique_on(["email"])
    }

    fn insert(name: &str, email: Option<&str>, id: u128) -> Statement {
        Statement::Insert(InsertStatement {
            table: "contact".into(),
            columns: vec!["id".into(), "name".into(), "email".into()],
            values: vec![
                Value::Reference(uuid::Uuid::from_u128(id)),
                Value::Text(name.into()),
                email.map(|e| Value::Text(e.into())).unwrap_or(Value::Null),
            ],
        })
    }

    #[tokio::test]
    async fn transaction_is_atomic() {
        let backend = MemoryBackend::new();
        backend.provision("acme", contact_spec()).await;

        let mut tx = backend.begin("acme").await.expect("begin");
        tx.execute(&insert("Ann", Some("a@x.com"), 1)).await.expect("insert");
        tx.rollback().await.expect("rollback");
        let rows = backend
            .query("acme", &SelectStatement::count("contact"))
            .await
            .expect("count");
        assert_eq!(count_from_rows(&rows), 0);

        let mut tx = backend.begin("acme").await.expect("begin");
        tx.execute(&insert("Ann", Some("a@x.com"), 1)).await.expect("insert");
        tx.commit().await.expect("commit");
        let rows = backend
            .query("acme", &SelectStatement::count("contact"))
            .await
            .expect("count");
        assert_eq!(count_from_rows(&rows), 1);
    }

    #[tokio::test]
    async fn unique_constraint_rejects_duplicates_but_allows_nulls() {
        let backend = MemoryBackend::new();
        backend.provision("acme", contact_spec()).await;

        let mut tx = backend.begin("acme").await.expect("begin");
        tx.execute(&insert("Ann", Some("a@x.com"), 1)).await.expect("first");
        let err = tx
            .execute(&insert("Bea", Some("a@x.com"), 2))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StorageError::UniqueViolation { .. }));
        // Multiple rows without the unique value are fine.
        tx.execute(&insert("Cal", None, 3)).await.expect("null one");
        tx.execute(&insert("Dee", None, 4)).await.expect("null two");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn update_null_assignment_clears_column() {
        let backend = MemoryBackend::new();
        backend.provision("acme", contact_spec()).await;
        let mut tx = backend.begin("acme").await.expect("begin");
        tx.execute(&insert("Ann", Some("a@x.com"), 1)).await.expect("insert");
        tx.execute(&Statement::Update(UpdateStatement {
            table: "contact".into(),
            assignments: vec![("email".into(), Value::Null)],
            predicate: None,
        }))
        .await
        .expect("update");
        tx.commit().await.expect("commit");

        let rows = backend
            .query(
                "acme",
                &SelectStatement::columns("contact", vec!["id".into(), "email".into()])
                    .filtered(Some(Predicate::IsNull("email".into()))),
            )
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].contains_key("email"));
    }

    #[tokio::test]
    async fn select_orders_pages_and_projects() {
        let backend = MemoryBackend::new();
        backend.provision("acme", contact_spec()).await;
        let mut tx = backend.begin("acme").await.expect("begin");
        for (i, name) in ["Cal", "Ann", "Bea"].iter().enumerate() {
            tx.execute(&insert(name, None, i as u128 + 1)).await.expect("insert");
        }
        tx.commit().await.expect("commit");

        let rows = backend
            .query(
                "acme",
                &SelectStatement::columns("contact", vec!["name".into()])
                    .ordered(vec![("name".into(), SortOrder::Asc)])
                    .paged(2, 1),
            )
            .await
            .expect("query");
        let names: Vec<_> = rows
            .iter()
            .map(|row| row.get("name").and_then(Value::as_text).unwrap_or(""))
            .collect();
        assert_eq!(names, vec!["Bea", "Cal"]);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_consumed() {
        let backend = MemoryBackend::new();
        backend.provision("acme", contact_spec()).await;
        backend.inject_transient_failures(1);
        let err = backend.begin("acme").await.err().expect("failure");
        assert!(err.is_transient());
        assert!(backend.begin("acme").await.is_ok());
    }
}
