//! medb: a metadata-driven dynamic data engine.
//!
//! Tenant-defined entities, fields, relations, and permissions live as
//! metadata rows; the engine compiles them into immutable schema snapshots
//! and serves validated, permission-scoped CRUD against whatever physical
//! tables the metadata describes. Every mutating operation runs in one
//! storage transaction together with its audit record.

pub mod audit;
pub mod config;
pub mod error;
pub mod metadata;
pub mod permission;
pub mod query;
pub mod schema;
pub mod storage;
pub mod validate;

#[cfg(test)]
mod lib_tests;

pub use crate::audit::{AuditAction, AuditEntry};
pub use crate::config::MedbConfig;
pub use crate::error::{
    ConflictCause, FieldViolation, MedbError, MedbErrorCode, StorageErrorKind, ViolationRule,
};
pub use crate::metadata::types::{FieldType, Record, Value};
pub use crate::metadata::{
    Cardinality, EntityDef, FieldDef, MetadataSource, OnDeletePolicy, PermissionDef, RelationDef,
    StaticMetadata, TenantMetadata,
};
pub use crate::permission::{Action, Decision, FieldMask, Principal, RowFilterExpr, RowOperand};
pub use crate::query::plan::{Filter, ListRequest, Page, Sort, SortOrder};
pub use crate::schema::cache::SchemaCache;
pub use crate::schema::{EntitySchema, SchemaSnapshot};
pub use crate::storage::memory::{ColumnSpec, MemoryBackend, TableSpec};
pub use crate::storage::{StorageBackend, StorageError, StorageTransaction};

use crate::audit::changed_fields;
use crate::permission::authorize;
use crate::query::builder::{FilterOrigin, QueryBuilder};
use crate::storage::{
    combine_and, count_from_rows, Predicate, SelectStatement, Statement, StorageTransaction as Tx,
    StoredRow,
};
use crate::validate::{validate_payload, ValidateMode};
use chrono::Utc;
use compact_str::CompactString;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::{ContextV7, Timestamp, Uuid};

/// Untyped caller payload for create/update, as decoded by the HTTP layer.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Per-call context: tenant, acting principal, optional deadline. Stateless
/// across calls; the engine keeps no per-request state anywhere else.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub tenant_id: String,
    pub principal: Principal,
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new(tenant_id: impl Into<String>, principal: Principal) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            principal,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListResult {
    pub records: Vec<Record>,
    /// Total row count under the same filter, ignoring pagination.
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The row was soft-marked rather than physically removed.
    pub soft_deleted: bool,
    /// Dependent rows removed through `CASCADE` relations.
    pub cascade_deleted: u64,
    /// Referencing fields nulled through `SET NULL` relations.
    pub cleared_references: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    operations: AtomicU64,
    validation_failures: AtomicU64,
    permission_denials: AtomicU64,
    conflicts: AtomicU64,
    transient_retries: AtomicU64,
}

/// Point-in-time operational counters. Counts only; no field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub operations: u64,
    pub validation_failures: u64,
    pub permission_denials: u64,
    pub conflicts: u64,
    pub transient_retries: u64,
    pub snapshot_builds: u64,
}

/// The dynamic data engine. One instance serves every tenant; all
/// tenant-specific behavior comes from the schema snapshot captured at the
/// start of each call.
pub struct DataEngine {
    cache: Arc<SchemaCache>,
    backend: Arc<dyn StorageBackend>,
    config: Arc<MedbConfig>,
    counters: EngineCounters,
    // Monotonic v7 ids: creation order and id order agree even within one
    // millisecond, which the default list order relies on.
    id_context: ContextV7,
}

impl DataEngine {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        backend: Arc<dyn StorageBackend>,
        config: MedbConfig,
    ) -> Result<Self, MedbError> {
        config.validate()?;
        info!(
            default_page_size = config.default_page_size,
            max_page_size = config.max_page_size,
            "data engine initialized"
        );
        Ok(Self {
            cache: Arc::new(SchemaCache::new(source, config.clone())),
            backend,
            config: Arc::new(config),
            counters: EngineCounters::default(),
            id_context: ContextV7::new(),
        })
    }

    fn new_id(&self) -> Uuid {
        Uuid::new_v7(Timestamp::now(&self.id_context))
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.cache
    }

    /// Drop the tenant's cached snapshot after an admin-side metadata write.
    pub fn invalidate_schema(&self, tenant_id: &str) {
        self.cache.invalidate(tenant_id);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self.counters.operations.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            permission_denials: self.counters.permission_denials.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            transient_retries: self.counters.transient_retries.load(Ordering::Relaxed),
            snapshot_builds: self.cache.builds(),
        }
    }

    /// Resolve what the principal may do on the entity, without touching
    /// data. Consumers such as export tooling gate themselves with this.
    pub fn check(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        action: Action,
    ) -> Result<Decision, MedbError> {
        let snapshot = self.cache.snapshot(&ctx.tenant_id)?;
        snapshot.entity(entity_code)?;
        let result = authorize(&snapshot, &ctx.principal, entity_code, action);
        self.observe(&result);
        result
    }

    /// List records: caller filter AND permission row predicate, field mask
    /// applied to every returned record, total counted under the same
    /// filter.
    pub async fn list(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        request: ListRequest,
    ) -> Result<ListResult, MedbError> {
        let result = self.list_inner(ctx, entity_code, request).await;
        self.observe(&result);
        result
    }

    async fn list_inner(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        request: ListRequest,
    ) -> Result<ListResult, MedbError> {
        let snapshot = self.cache.snapshot(&ctx.tenant_id)?;
        let entity = snapshot.entity(entity_code)?.clone();
        let builder = QueryBuilder::new(&entity, &self.config);
        let decision = authorize(&snapshot, &ctx.principal, entity_code, Action::View)?;

        let caller_predicate = request
            .filter
            .as_ref()
            .map(|filter| builder.compile_filter(filter, FilterOrigin::Caller))
            .transpose()?;
        let row_predicate = self.compile_row_filter(&builder, &decision)?;
        let soft_delete = if request.include_deleted {
            None
        } else {
            builder.not_deleted()
        };
        let predicate = combine_and([caller_predicate, row_predicate, soft_delete]);

        let order_by = builder.compile_sort(&request.sort)?;
        let (limit, offset) = builder.page(request.page.as_ref());
        let select = builder
            .select(builder.list_columns(&decision.field_mask))
            .filtered(predicate.clone())
            .ordered(order_by)
            .paged(limit, offset);
        let count = builder.select_count().filtered(predicate);

        debug!(tenant = %ctx.tenant_id, entity = entity_code, limit, offset, "list");
        let rows = self.read(ctx, &select).await?;
        let total = count_from_rows(&self.read(ctx, &count).await?);

        let records = rows
            .iter()
            .map(|row| {
                let (id, record) = record_from_row(&entity, &self.config, row);
                finish_record(&self.config, decision.field_mask.apply(record), id)
            })
            .collect();
        Ok(ListResult {
            records,
            total,
            limit,
            offset,
        })
    }

    /// Fetch one record by id. Rows hidden by the permission row predicate
    /// are reported as `NotFound`; existence is not distinguishable from
    /// denial, and a principal with no view grant at all gets the same
    /// answer.
    pub async fn get(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        id: Uuid,
    ) -> Result<Record, MedbError> {
        let result = self.get_inner(ctx, entity_code, id).await;
        self.observe(&result);
        result
    }

    async fn get_inner(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        id: Uuid,
    ) -> Result<Record, MedbError> {
        let snapshot = self.cache.snapshot(&ctx.tenant_id)?;
        let entity = snapshot.entity(entity_code)?.clone();
        let builder = QueryBuilder::new(&entity, &self.config);
        let decision = match authorize(&snapshot, &ctx.principal, entity_code, Action::View) {
            Ok(decision) => decision,
            Err(MedbError::PermissionDenied { .. }) => {
                return Err(MedbError::NotFound {
                    entity: entity_code.to_string(),
                })
            }
            Err(err) => return Err(err),
        };

        let predicate = combine_and([
            Some(builder.id_predicate(id)),
            self.compile_row_filter(&builder, &decision)?,
            builder.not_deleted(),
        ]);
        let select = builder
            .select(builder.all_columns())
            .filtered(predicate)
            .paged(1, 0);

        let rows = self.read(ctx, &select).await?;
        let row = rows.first().ok_or_else(|| MedbError::NotFound {
            entity: entity_code.to_string(),
        })?;
        let (row_id, record) = record_from_row(&entity, &self.config, row);
        Ok(finish_record(
            &self.config,
            decision.field_mask.apply(record),
            row_id.or(Some(id)),
        ))
    }

    /// Create a record. The full payload is validated against the entity's
    /// fields (all violations batched), defaults applied, then the insert
    /// and its audit entry commit in one transaction.
    pub async fn create(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        payload: Payload,
    ) -> Result<Record, MedbError> {
        let result = self.create_inner(ctx, entity_code, payload).await;
        self.observe(&result);
        result
    }

    async fn create_inner(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        payload: Payload,
    ) -> Result<Record, MedbError> {
        let snapshot = self.cache.snapshot(&ctx.tenant_id)?;
        let entity = snapshot.entity(entity_code)?.clone();
        if !entity.def.allow_create {
            return Err(MedbError::PermissionDenied {
                entity: entity_code.to_string(),
                action: Action::Create.as_str(),
            });
        }

        let record =
            validate_payload(&entity, &payload, ValidateMode::Create).map_err(MedbError::Validation)?;
        authorize(&snapshot, &ctx.principal, entity_code, Action::Create)?;

        let builder = QueryBuilder::new(&entity, &self.config);
        let id = self.new_id();
        let mut statements = vec![Statement::Insert(builder.insert_statement(id, &record))];
        if entity.def.use_audit_log {
            let entry = AuditEntry::created(entity.code(), id, ctx.principal.id, &record);
            statements.push(Statement::Insert(
                entry.insert_statement(&self.config.audit_table, self.new_id()),
            ));
        }

        debug!(tenant = %ctx.tenant_id, entity = entity_code, "create");
        self.write_all(ctx, &statements).await?;
        Ok(finish_record(&self.config, record, Some(id)))
    }

    /// Partially update a record. Only supplied fields are validated and
    /// written; the changed-field list comes from comparing the fetched old
    /// row to the patch inside the transaction. Rows hidden by the row
    /// predicate are `NotFound`. Last write wins.
    pub async fn update(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        id: Uuid,
        patch: Payload,
    ) -> Result<Record, MedbError> {
        let result = self.update_inner(ctx, entity_code, id, patch).await;
        self.observe(&result);
        result
    }

    async fn update_inner(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        id: Uuid,
        patch: Payload,
    ) -> Result<Record, MedbError> {
        let snapshot = self.cache.snapshot(&ctx.tenant_id)?;
        let entity = snapshot.entity(entity_code)?.clone();
        if !entity.def.allow_edit {
            return Err(MedbError::PermissionDenied {
                entity: entity_code.to_string(),
                action: Action::Edit.as_str(),
            });
        }

        let patch =
            validate_payload(&entity, &patch, ValidateMode::Patch).map_err(MedbError::Validation)?;
        let decision = authorize(&snapshot, &ctx.principal, entity_code, Action::Edit)?;

        let builder = QueryBuilder::new(&entity, &self.config);
        let fetch = builder
            .select(builder.all_columns())
            .filtered(combine_and([
                Some(builder.id_predicate(id)),
                self.compile_row_filter(&builder, &decision)?,
                builder.not_deleted(),
            ]))
            .paged(1, 0);

        debug!(tenant = %ctx.tenant_id, entity = entity_code, "update");
        let timeout = self.timeout_for(ctx);
        let mut retried = false;
        loop {
            let attempt = self.update_once(ctx, &entity, &builder, id, &patch, &fetch);
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error()),
            };
            match result {
                Ok(record) => return Ok(record),
                Err(err) if self.should_retry(&err, &mut retried) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn update_once(
        &self,
        ctx: &CallContext,
        entity: &EntitySchema,
        builder: &QueryBuilder<'_>,
        id: Uuid,
        patch: &Record,
        fetch: &SelectStatement,
    ) -> Result<Record, MedbError> {
        let mut tx = self.backend.begin(&ctx.tenant_id).await?;
        let rows = tx.query(fetch).await?;
        let Some(old_row) = rows.first() else {
            tx.rollback().await?;
            return Err(MedbError::NotFound {
                entity: entity.code().to_string(),
            });
        };
        let (_, old_record) = record_from_row(entity, &self.config, old_row);

        let changed = changed_fields(&old_record, patch);
        let merged = merge_patch(&old_record, patch);
        if changed.is_empty() {
            // Nothing to write; a no-op patch leaves no audit trace.
            tx.rollback().await?;
            return Ok(finish_record(&self.config, merged, Some(id)));
        }

        let changes: Record = patch
            .iter()
            .filter(|(code, _)| changed.contains(*code))
            .map(|(code, value)| (code.clone(), value.clone()))
            .collect();
        tx.execute(&Statement::Update(builder.update_statement(id, &changes)))
            .await?;

        if entity.def.use_audit_log {
            let entry = AuditEntry::updated(
                entity.code(),
                id,
                ctx.principal.id,
                &old_record,
                &merged,
                changed,
            );
            tx.execute(&Statement::Insert(
                entry.insert_statement(&self.config.audit_table, self.new_id()),
            ))
            .await?;
        }
        tx.commit().await?;
        Ok(finish_record(&self.config, merged, Some(id)))
    }

    /// Delete a record, resolving relations that target its entity first:
    /// `RESTRICT` aborts while live dependents exist, `CASCADE` removes
    /// them (recursively, honoring each entity's own soft-delete and audit
    /// flags), `SET NULL` clears the referencing field. One transaction
    /// covers the fixups, the delete, and every audit entry.
    pub async fn delete(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        id: Uuid,
    ) -> Result<DeleteOutcome, MedbError> {
        let result = self.delete_inner(ctx, entity_code, id).await;
        self.observe(&result);
        result
    }

    async fn delete_inner(
        &self,
        ctx: &CallContext,
        entity_code: &str,
        id: Uuid,
    ) -> Result<DeleteOutcome, MedbError> {
        let snapshot = self.cache.snapshot(&ctx.tenant_id)?;
        let entity = snapshot.entity(entity_code)?.clone();
        if !entity.def.allow_delete {
            return Err(MedbError::PermissionDenied {
                entity: entity_code.to_string(),
                action: Action::Delete.as_str(),
            });
        }
        let decision = authorize(&snapshot, &ctx.principal, entity_code, Action::Delete)?;

        let builder = QueryBuilder::new(&entity, &self.config);
        let fetch = builder
            .select(builder.all_columns())
            .filtered(combine_and([
                Some(builder.id_predicate(id)),
                self.compile_row_filter(&builder, &decision)?,
                builder.not_deleted(),
            ]))
            .paged(1, 0);

        debug!(tenant = %ctx.tenant_id, entity = entity_code, "delete");
        let timeout = self.timeout_for(ctx);
        let mut retried = false;
        loop {
            let attempt = self.delete_once(ctx, &snapshot, &entity, id, &fetch);
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error()),
            };
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) if self.should_retry(&err, &mut retried) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn delete_once(
        &self,
        ctx: &CallContext,
        snapshot: &SchemaSnapshot,
        entity: &Arc<EntitySchema>,
        id: Uuid,
        fetch: &SelectStatement,
    ) -> Result<DeleteOutcome, MedbError> {
        let mut tx = self.backend.begin(&ctx.tenant_id).await?;
        let rows = tx.query(fetch).await?;
        let Some(row) = rows.first() else {
            tx.rollback().await?;
            return Err(MedbError::NotFound {
                entity: entity.code().to_string(),
            });
        };
        let (_, record) = record_from_row(entity, &self.config, row);

        let plan = self
            .resolve_dependents(ctx, snapshot, &mut *tx, entity, id, record)
            .await?;
        let cascade_deleted = (plan.deletes.len() - 1) as u64;

        // Children first, so a relational backend with physical foreign
        // keys never sees a dangling reference mid-transaction.
        let deleted_at = Utc::now();
        for pending in plan.deletes.iter().rev() {
            let dep_builder = QueryBuilder::new(&pending.entity, &self.config);
            let statement = if pending.entity.def.use_soft_delete {
                Statement::Update(dep_builder.soft_delete_statement(pending.id, deleted_at))
            } else {
                Statement::Delete(dep_builder.delete_statement(pending.id))
            };
            tx.execute(&statement).await?;
            if pending.entity.def.use_audit_log {
                let entry = AuditEntry::deleted(
                    pending.entity.code(),
                    pending.id,
                    ctx.principal.id,
                    &pending.record,
                );
                tx.execute(&Statement::Insert(
                    entry.insert_statement(&self.config.audit_table, self.new_id()),
                ))
                .await?;
            }
        }
        tx.commit().await?;
        Ok(DeleteOutcome {
            soft_deleted: entity.def.use_soft_delete,
            cascade_deleted,
            cleared_references: plan.cleared_references,
        })
    }

    /// Walk relations targeting the doomed rows, breadth-first with a
    /// visited set (relation graphs may be cyclic). Restrict aborts,
    /// SetNull clears in bulk, Cascade enqueues dependents for deletion.
    async fn resolve_dependents(
        &self,
        ctx: &CallContext,
        snapshot: &SchemaSnapshot,
        tx: &mut dyn Tx,
        entity: &Arc<EntitySchema>,
        id: Uuid,
        record: Record,
    ) -> Result<DeletePlan, MedbError> {
        let mut plan = DeletePlan::default();
        let mut visited: HashSet<(String, Uuid)> = HashSet::new();
        visited.insert((entity.code().to_string(), id));
        let mut queue = VecDeque::new();
        queue.push_back(PendingDelete {
            entity: entity.clone(),
            id,
            record,
            depth: 0,
        });

        while let Some(pending) = queue.pop_front() {
            if pending.depth > self.config.max_cascade_depth {
                return Err(MedbError::schema(
                    &ctx.tenant_id,
                    format!(
                        "cascade from entity '{}' exceeds depth {}",
                        entity.code(),
                        self.config.max_cascade_depth
                    ),
                ));
            }
            for relation in snapshot.relations_targeting(pending.entity.code()) {
                let source = snapshot.entity(&relation.source_entity)?.clone();
                let source_builder = QueryBuilder::new(&source, &self.config);
                let source_field = source.field(&relation.source_field).ok_or_else(|| {
                    MedbError::schema(
                        &ctx.tenant_id,
                        format!("relation '{}' lost its source field", relation.code),
                    )
                })?;
                let target_value = if relation.target_field == self.config.id_column {
                    Value::Reference(pending.id)
                } else {
                    pending
                        .record
                        .get(relation.target_field.as_str())
                        .cloned()
                        .unwrap_or(Value::Null)
                };
                if target_value.is_null() {
                    continue;
                }
                let dependents = combine_and([
                    Some(Predicate::Eq(
                        source_field.column_name.as_str().into(),
                        target_value,
                    )),
                    source_builder.not_deleted(),
                ]);

                match relation.on_delete {
                    OnDeletePolicy::Restrict => {
                        let count_rows = tx
                            .query(&source_builder.select_count().filtered(dependents))
                            .await?;
                        if count_from_rows(&count_rows) > 0 {
                            return Err(MedbError::Conflict {
                                cause: ConflictCause::RelationRestrict,
                            });
                        }
                    }
                    OnDeletePolicy::SetNull => {
                        let clear = storage::UpdateStatement {
                            table: source.table_name().into(),
                            assignments: vec![(
                                source_field.column_name.as_str().into(),
                                Value::Null,
                            )],
                            predicate: dependents,
                        };
                        plan.cleared_references += tx.execute(&Statement::Update(clear)).await?;
                    }
                    OnDeletePolicy::Cascade => {
                        let rows = tx
                            .query(
                                &source_builder
                                    .select(source_builder.all_columns())
                                    .filtered(dependents),
                            )
                            .await?;
                        for row in &rows {
                            let (dep_id, dep_record) =
                                record_from_row(&source, &self.config, row);
                            let Some(dep_id) = dep_id else {
                                continue;
                            };
                            if visited.insert((source.code().to_string(), dep_id)) {
                                queue.push_back(PendingDelete {
                                    entity: source.clone(),
                                    id: dep_id,
                                    record: dep_record,
                                    depth: pending.depth + 1,
                                });
                            }
                        }
                    }
                }
            }
            plan.deletes.push(pending);
        }
        Ok(plan)
    }

    fn compile_row_filter(
        &self,
        builder: &QueryBuilder<'_>,
        decision: &Decision,
    ) -> Result<Option<Predicate>, MedbError> {
        decision
            .row_filter
            .as_ref()
            .map(|filter| builder.compile_filter(filter, FilterOrigin::Policy))
            .transpose()
    }

    fn timeout_for(&self, ctx: &CallContext) -> Duration {
        ctx.timeout.unwrap_or(self.config.request_timeout)
    }

    fn should_retry(&self, err: &MedbError, retried: &mut bool) -> bool {
        if err.is_transient() && !*retried && self.config.retry_transient {
            *retried = true;
            self.counters.transient_retries.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "transient storage error, retrying once");
            true
        } else {
            false
        }
    }

    /// Single read statement with deadline and one transient retry.
    async fn read(
        &self,
        ctx: &CallContext,
        statement: &SelectStatement,
    ) -> Result<Vec<StoredRow>, MedbError> {
        let timeout = self.timeout_for(ctx);
        let mut retried = false;
        loop {
            let attempt = self.backend.query(&ctx.tenant_id, statement);
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result.map_err(MedbError::from),
                Err(_) => Err(timeout_error()),
            };
            match result {
                Ok(rows) => return Ok(rows),
                Err(err) if self.should_retry(&err, &mut retried) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute a fixed statement list in one transaction, with deadline and
    /// one transient retry of the whole transaction.
    async fn write_all(&self, ctx: &CallContext, statements: &[Statement]) -> Result<(), MedbError> {
        let timeout = self.timeout_for(ctx);
        let mut retried = false;
        loop {
            let attempt = async {
                let mut tx = self.backend.begin(&ctx.tenant_id).await?;
                for statement in statements {
                    tx.execute(statement).await?;
                }
                tx.commit().await?;
                Ok::<(), StorageError>(())
            };
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result.map_err(MedbError::from),
                Err(_) => Err(timeout_error()),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if self.should_retry(&err, &mut retried) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn observe<T>(&self, result: &Result<T, MedbError>) {
        self.counters.operations.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(_) => {}
            Err(MedbError::Validation(_)) => {
                self.counters
                    .validation_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(MedbError::PermissionDenied { .. }) => {
                self.counters
                    .permission_denials
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(MedbError::Conflict { .. }) => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
}

struct PendingDelete {
    entity: Arc<EntitySchema>,
    id: Uuid,
    record: Record,
    depth: usize,
}

#[derive(Default)]
struct DeletePlan {
    deletes: Vec<PendingDelete>,
    cleared_references: u64,
}

fn timeout_error() -> MedbError {
    MedbError::Storage {
        kind: StorageErrorKind::Transient,
        message: "storage call exceeded the request deadline".to_string(),
    }
}

/// Convert a physical row back into an engine record keyed by field code.
fn record_from_row(
    entity: &EntitySchema,
    config: &MedbConfig,
    row: &StoredRow,
) -> (Option<Uuid>, Record) {
    let id = row.get(&config.id_column).and_then(Value::as_uuid);
    let mut record = Record::new();
    for field in entity.fields() {
        if let Some(value) = row.get(field.column_name.as_str()) {
            if !value.is_null() {
                record.insert(field.code.as_str().into(), value.clone());
            }
        }
    }
    (id, record)
}

/// Attach the id under the engine-owned id key, after masking.
fn finish_record(config: &MedbConfig, mut record: Record, id: Option<Uuid>) -> Record {
    if let Some(id) = id {
        record.insert(
            CompactString::from(config.id_column.as_str()),
            Value::Reference(id),
        );
    }
    record
}

/// Old record with the patch applied; explicit nulls clear fields.
fn merge_patch(old: &Record, patch: &Record) -> Record {
    let mut merged = old.clone();
    for (code, value) in patch {
        if value.is_null() {
            merged.remove(code);
        } else {
            merged.insert(code.clone(), value.clone());
        }
    }
    merged
}
