use crate::config::MedbConfig;
use crate::error::MedbError;
use crate::metadata::types::{FieldType, Record, Value};
use crate::metadata::FieldDef;
use crate::permission::FieldMask;
use crate::query::plan::{Filter, Page, Sort, SortOrder};
use crate::schema::EntitySchema;
use crate::storage::{
    DeleteStatement, InsertStatement, Predicate, SelectStatement, UpdateStatement,
};
use crate::validate::coerce_scalar;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Where a filter expression came from. Caller filters are checked against
/// the per-field eligibility flags; permission row predicates are trusted
/// metadata and skip the flag gate (but never the type gate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOrigin {
    Caller,
    Policy,
}

/// Compiles caller-shaped requests into bound statements for one entity.
/// Every identifier it emits is taken from the schema snapshot; caller
/// strings only ever select fields by code and are rejected when unknown.
pub struct QueryBuilder<'a> {
    entity: &'a EntitySchema,
    config: &'a MedbConfig,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(entity: &'a EntitySchema, config: &'a MedbConfig) -> Self {
        Self { entity, config }
    }

    fn table(&self) -> CompactString {
        self.entity.table_name().into()
    }

    fn field_for_predicate(
        &self,
        code: &str,
        origin: FilterOrigin,
        substring: bool,
    ) -> Result<&FieldDef, MedbError> {
        let field = self.entity.field(code).ok_or_else(|| {
            MedbError::Query(format!(
                "unknown field '{code}' on entity '{}'",
                self.entity.code()
            ))
        })?;
        if origin == FilterOrigin::Caller {
            if substring && !field.in_search {
                return Err(MedbError::Query(format!(
                    "field '{code}' is not searchable"
                )));
            }
            if !substring && !field.in_filter {
                return Err(MedbError::Query(format!(
                    "field '{code}' is not filterable"
                )));
            }
        }
        Ok(field)
    }

    fn coerce(&self, field: &FieldDef, raw: &JsonValue) -> Result<Value, MedbError> {
        if raw.is_null() {
            // Null literals only make sense through IsNull/IsNotNull.
            return Err(MedbError::Query(format!(
                "null literal for field '{}'; use an is-null predicate",
                field.code
            )));
        }
        coerce_scalar(field.field_type, raw).map_err(|message| {
            MedbError::Query(format!("literal for field '{}': {message}", field.code))
        })
    }

    fn ordered_only(&self, field: &FieldDef) -> Result<(), MedbError> {
        if !field.field_type.is_ordered() {
            return Err(MedbError::Query(format!(
                "range predicate not valid for {} field '{}'",
                field.field_type.as_str(),
                field.code
            )));
        }
        Ok(())
    }

    /// Lower a structured filter into a bound predicate over physical
    /// columns.
    pub fn compile_filter(
        &self,
        filter: &Filter,
        origin: FilterOrigin,
    ) -> Result<Predicate, MedbError> {
        filter.validate_depth(self.config.max_filter_depth)?;
        self.compile_filter_inner(filter, origin)
    }

    fn compile_filter_inner(
        &self,
        filter: &Filter,
        origin: FilterOrigin,
    ) -> Result<Predicate, MedbError> {
        let predicate = match filter {
            Filter::Eq(code, raw) => {
                let field = self.field_for_predicate(code, origin, false)?;
                Predicate::Eq(field.column_name.as_str().into(), self.coerce(field, raw)?)
            }
            Filter::Ne(code, raw) => {
                let field = self.field_for_predicate(code, origin, false)?;
                Predicate::Ne(field.column_name.as_str().into(), self.coerce(field, raw)?)
            }
            Filter::Lt(code, raw) => {
                let field = self.field_for_predicate(code, origin, false)?;
                self.ordered_only(field)?;
                Predicate::Lt(field.column_name.as_str().into(), self.coerce(field, raw)?)
            }
            Filter::Lte(code, raw) => {
                let field = self.field_for_predicate(code, origin, false)?;
                self.ordered_only(field)?;
                Predicate::Lte(field.column_name.as_str().into(), self.coerce(field, raw)?)
            }
            Filter::Gt(code, raw) => {
                let field = self.field_for_predicate(code, origin, false)?;
                self.ordered_only(field)?;
                Predicate::Gt(field.column_name.as_str().into(), self.coerce(field, raw)?)
            }
            Filter::Gte(code, raw) => {
                let field = self.field_for_predicate(code, origin, false)?;
                self.ordered_only(field)?;
                Predicate::Gte(field.column_name.as_str().into(), self.coerce(field, raw)?)
            }
            Filter::In(code, raws) => {
                let field = self.field_for_predicate(code, origin, false)?;
                if raws.is_empty() {
                    return Err(MedbError::Query(format!(
                        "empty value list for field '{code}'"
                    )));
                }
                if raws.len() > self.config.max_in_list_len {
                    return Err(MedbError::Query(format!(
                        "value list for field '{code}' exceeds {} entries",
                        self.config.max_in_list_len
                    )));
                }
                let values = raws
                    .iter()
                    .map(|raw| self.coerce(field, raw))
                    .collect::<Result<Vec<_>, _>>()?;
                Predicate::In(field.column_name.as_str().into(), values)
            }
            Filter::Between(code, low, high) => {
                let field = self.field_for_predicate(code, origin, false)?;
                self.ordered_only(field)?;
                Predicate::Between(
                    field.column_name.as_str().into(),
                    self.coerce(field, low)?,
                    self.coerce(field, high)?,
                )
            }
            Filter::IsNull(code) => {
                let field = self.field_for_predicate(code, origin, false)?;
                Predicate::IsNull(field.column_name.as_str().into())
            }
            Filter::IsNotNull(code) => {
                let field = self.field_for_predicate(code, origin, false)?;
                Predicate::IsNotNull(field.column_name.as_str().into())
            }
            Filter::Contains(code, fragment) => {
                let field = self.field_for_predicate(code, origin, true)?;
                if field.field_type != FieldType::Text {
                    return Err(MedbError::Query(format!(
                        "substring match not valid for {} field '{code}'",
                        field.field_type.as_str()
                    )));
                }
                Predicate::Contains(
                    field.column_name.as_str().into(),
                    fragment.as_str().into(),
                )
            }
            Filter::StartsWith(code, fragment) => {
                let field = self.field_for_predicate(code, origin, true)?;
                if field.field_type != FieldType::Text {
                    return Err(MedbError::Query(format!(
                        "substring match not valid for {} field '{code}'",
                        field.field_type.as_str()
                    )));
                }
                Predicate::StartsWith(
                    field.column_name.as_str().into(),
                    fragment.as_str().into(),
                )
            }
            Filter::And(left, right) => self
                .compile_filter_inner(left, origin)?
                .and(self.compile_filter_inner(right, origin)?),
            Filter::Or(left, right) => self
                .compile_filter_inner(left, origin)?
                .or(self.compile_filter_inner(right, origin)?),
            Filter::Not(inner) => {
                Predicate::Not(Box::new(self.compile_filter_inner(inner, origin)?))
            }
        };
        Ok(predicate)
    }

    /// Lower sort keys, enforcing the per-field sort flag. The id column is
    /// appended as the final tiebreak so pagination order is total;
    /// creation order (v7 ids) is the default when no key is given.
    pub fn compile_sort(
        &self,
        sorts: &[Sort],
    ) -> Result<Vec<(CompactString, SortOrder)>, MedbError> {
        let mut order_by = Vec::with_capacity(sorts.len() + 1);
        for sort in sorts {
            let field = self.entity.field(&sort.field).ok_or_else(|| {
                MedbError::Query(format!(
                    "unknown field '{}' on entity '{}'",
                    sort.field,
                    self.entity.code()
                ))
            })?;
            if !field.in_sort {
                return Err(MedbError::Query(format!(
                    "field '{}' is not sortable",
                    sort.field
                )));
            }
            order_by.push((field.column_name.as_str().into(), sort.order));
        }
        order_by.push((self.config.id_column.clone(), SortOrder::Asc));
        Ok(order_by)
    }

    /// Clamp pagination to the configured bounds.
    pub fn page(&self, page: Option<&Page>) -> (usize, usize) {
        match page {
            Some(page) => (
                page.limit.clamp(1, self.config.max_page_size),
                page.offset,
            ),
            None => (self.config.default_page_size, 0),
        }
    }

    pub fn id_predicate(&self, id: Uuid) -> Predicate {
        Predicate::Eq(self.config.id_column.clone(), Value::Reference(id))
    }

    /// Predicate excluding soft-deleted rows, when the entity keeps them.
    pub fn not_deleted(&self) -> Option<Predicate> {
        self.entity
            .def
            .use_soft_delete
            .then(|| Predicate::IsNull(self.config.soft_delete_column.clone()))
    }

    /// Projection for list calls: id plus the list-eligible fields the mask
    /// leaves visible.
    pub fn list_columns(&self, mask: &FieldMask) -> Vec<CompactString> {
        let mut columns = vec![self.config.id_column.clone()];
        columns.extend(
            self.entity
                .fields()
                .iter()
                .filter(|field| field.in_list && mask.allows(&field.code))
                .map(|field| CompactString::from(field.column_name.as_str())),
        );
        columns
    }

    /// Projection for get/update/delete: id plus every field column.
    pub fn all_columns(&self) -> Vec<CompactString> {
        let mut columns = vec![self.config.id_column.clone()];
        columns.extend(
            self.entity
                .fields()
                .iter()
                .map(|field| CompactString::from(field.column_name.as_str())),
        );
        columns
    }

    pub fn select(&self, columns: Vec<CompactString>) -> SelectStatement {
        SelectStatement::columns(self.table(), columns)
    }

    pub fn select_count(&self) -> SelectStatement {
        SelectStatement::count(self.table())
    }

    pub fn insert_statement(&self, id: Uuid, record: &Record) -> InsertStatement {
        let mut columns = vec![self.config.id_column.clone()];
        let mut values = vec![Value::Reference(id)];
        for (code, value) in record {
            // Record keys come from the validator, which only admits known
            // field codes.
            if let Some(field) = self.entity.field(code) {
                columns.push(field.column_name.as_str().into());
                values.push(value.clone());
            }
        }
        InsertStatement {
            table: self.table(),
            columns,
            values,
        }
    }

    pub fn update_statement(&self, id: Uuid, changes: &Record) -> UpdateStatement {
        let assignments = changes
            .iter()
            .filter_map(|(code, value)| {
                self.entity
                    .field(code)
                    .map(|field| (CompactString::from(field.column_name.as_str()), value.clone()))
            })
            .collect();
        UpdateStatement {
            table: self.table(),
            assignments,
            predicate: Some(self.id_predicate(id)),
        }
    }

    pub fn delete_statement(&self, id: Uuid) -> DeleteStatement {
        DeleteStatement {
            table: self.table(),
            predicate: Some(self.id_predicate(id)),
        }
    }

    pub fn soft_delete_statement(&self, id: Uuid, at: DateTime<Utc>) -> UpdateStatement {
        UpdateStatement {
            table: self.table(),
            assignments: vec![(self.config.soft_delete_column.clone(), Value::DateTime(at))],
            predicate: Some(self.id_predicate(id)),
        }
    }
}
