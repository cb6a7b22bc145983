pub mod cache;

use crate::config::MedbConfig;
use crate::error::MedbError;
use crate::metadata::{EntityDef, FieldDef, OnDeletePolicy, PermissionDef, RelationDef, TenantMetadata};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Compiled view of one entity: its definition, ordered fields, and the
/// per-field artifacts (lookup map, compiled patterns) the validator and
/// builder need on the hot path.
#[derive(Debug)]
pub struct EntitySchema {
    pub def: EntityDef,
    fields: Vec<FieldDef>,
    by_code: HashMap<String, usize>,
    patterns: HashMap<String, Regex>,
}

impl EntitySchema {
    pub fn code(&self) -> &str {
        &self.def.code
    }

    pub fn table_name(&self) -> &str {
        &self.def.table_name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, code: &str) -> Option<&FieldDef> {
        self.by_code.get(code).map(|&index| &self.fields[index])
    }

    pub fn pattern(&self, code: &str) -> Option<&Regex> {
        self.patterns.get(code)
    }
}

/// Immutable, versioned compilation of one tenant's metadata. Operations
/// capture an `Arc<SchemaSnapshot>` at the start of a request and use it
/// throughout, so a concurrent cache swap is never observed mid-request.
#[derive(Debug)]
pub struct SchemaSnapshot {
    tenant_id: String,
    version: u64,
    entities: im::HashMap<String, Arc<EntitySchema>>,
    relations: Vec<RelationDef>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    permissions: HashMap<String, Vec<PermissionDef>>,
}

impl SchemaSnapshot {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entity(&self, code: &str) -> Result<&Arc<EntitySchema>, MedbError> {
        self.entities.get(code).ok_or_else(|| MedbError::UnknownEntity {
            entity: code.to_string(),
        })
    }

    pub fn entity_codes(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Relations whose target is the given entity, the ones that must be
    /// resolved before one of its rows may be deleted.
    pub fn relations_targeting<'a>(
        &'a self,
        entity_code: &str,
    ) -> impl Iterator<Item = &'a RelationDef> {
        self.incoming
            .get(entity_code)
            .into_iter()
            .flatten()
            .map(move |&index| &self.relations[index])
    }

    pub fn relations_from<'a>(
        &'a self,
        entity_code: &str,
    ) -> impl Iterator<Item = &'a RelationDef> {
        self.outgoing
            .get(entity_code)
            .into_iter()
            .flatten()
            .map(move |&index| &self.relations[index])
    }

    pub fn permissions_for(&self, entity_code: &str) -> &[PermissionDef] {
        self.permissions
            .get(entity_code)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Compile raw metadata into a snapshot, or fail with a tenant-wide
    /// schema error. Nothing about a snapshot is mutable after this.
    pub fn compile(
        tenant_id: &str,
        version: u64,
        metadata: &TenantMetadata,
        config: &MedbConfig,
    ) -> Result<Self, MedbError> {
        let fail = |reason: String| MedbError::schema(tenant_id, reason);

        let mut active: HashMap<String, (EntityDef, Vec<FieldDef>)> = HashMap::new();
        let mut table_names: HashSet<&str> = HashSet::new();
        for entity in &metadata.entities {
            if entity.code.is_empty() {
                return Err(fail("entity with empty code".to_string()));
            }
            if !is_identifier(&entity.table_name) {
                return Err(fail(format!(
                    "entity '{}' has invalid table name '{}'",
                    entity.code, entity.table_name
                )));
            }
            if entity.table_name == config.audit_table {
                return Err(fail(format!(
                    "entity '{}' claims the audit table '{}'",
                    entity.code, entity.table_name
                )));
            }
            if !table_names.insert(entity.table_name.as_str()) {
                return Err(fail(format!(
                    "table name '{}' used by more than one entity",
                    entity.table_name
                )));
            }
            if !entity.is_active {
                continue;
            }
            if active
                .insert(entity.code.clone(), (entity.clone(), Vec::new()))
                .is_some()
            {
                return Err(fail(format!("duplicate entity code '{}'", entity.code)));
            }
        }

        for field in &metadata.fields {
            let Some((_, fields)) = active.get_mut(&field.entity_code) else {
                // Fields of inactive entities are dropped with their entity;
                // fields of unknown entities are malformed metadata.
                if metadata.entities.iter().any(|e| e.code == field.entity_code) {
                    continue;
                }
                return Err(fail(format!(
                    "field '{}' references unknown entity '{}'",
                    field.code, field.entity_code
                )));
            };
            if field.code.is_empty() {
                return Err(fail(format!(
                    "entity '{}' has a field with empty code",
                    field.entity_code
                )));
            }
            if !is_identifier(&field.column_name) {
                return Err(fail(format!(
                    "field '{}.{}' has invalid column name '{}'",
                    field.entity_code, field.code, field.column_name
                )));
            }
            if field.code == config.id_column || field.column_name == config.id_column {
                return Err(fail(format!(
                    "field '{}.{}' collides with the reserved id column",
                    field.entity_code, field.code
                )));
            }
            if field.column_name == config.soft_delete_column {
                return Err(fail(format!(
                    "field '{}.{}' collides with the reserved soft-delete column",
                    field.entity_code, field.code
                )));
            }
            if let Some(default) = &field.default_value {
                match default.field_type() {
                    Some(ft) if ft == field.field_type => {}
                    Some(ft) => {
                        return Err(fail(format!(
                            "field '{}.{}' default has type {} but field is {}",
                            field.entity_code,
                            field.code,
                            ft.as_str(),
                            field.field_type.as_str()
                        )))
                    }
                    None => {
                        return Err(fail(format!(
                            "field '{}.{}' has a null default",
                            field.entity_code, field.code
                        )))
                    }
                }
            }
            fields.push(field.clone());
        }

        let mut entities = im::HashMap::new();
        for (code, (def, fields)) in active {
            let mut by_code = HashMap::new();
            let mut columns = HashSet::new();
            let mut patterns = HashMap::new();
            for (index, field) in fields.iter().enumerate() {
                if by_code.insert(field.code.clone(), index).is_some() {
                    return Err(fail(format!(
                        "duplicate field code '{}' in entity '{}'",
                        field.code, code
                    )));
                }
                if !columns.insert(field.column_name.clone()) {
                    return Err(fail(format!(
                        "column name '{}' used twice in table '{}'",
                        field.column_name, def.table_name
                    )));
                }
                if let Some(source) = &field.pattern {
                    let regex = Regex::new(source).map_err(|err| {
                        fail(format!(
                            "field '{}.{}' has invalid pattern: {err}",
                            code, field.code
                        ))
                    })?;
                    patterns.insert(field.code.clone(), regex);
                }
            }
            entities.insert(
                code,
                Arc::new(EntitySchema {
                    def,
                    fields,
                    by_code,
                    patterns,
                }),
            );
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, relation) in metadata.relations.iter().enumerate() {
            let source = entities.get(&relation.source_entity).ok_or_else(|| {
                fail(format!(
                    "relation '{}' references missing or inactive entity '{}'",
                    relation.code, relation.source_entity
                ))
            })?;
            let target = entities.get(&relation.target_entity).ok_or_else(|| {
                fail(format!(
                    "relation '{}' references missing or inactive entity '{}'",
                    relation.code, relation.target_entity
                ))
            })?;
            let source_field = source.field(&relation.source_field).ok_or_else(|| {
                fail(format!(
                    "relation '{}' references unknown field '{}.{}'",
                    relation.code, relation.source_entity, relation.source_field
                ))
            })?;
            if relation.target_field != config.id_column
                && target.field(&relation.target_field).is_none()
            {
                return Err(fail(format!(
                    "relation '{}' references unknown field '{}.{}'",
                    relation.code, relation.target_entity, relation.target_field
                )));
            }
            if relation.on_delete == OnDeletePolicy::SetNull && source_field.is_required {
                return Err(fail(format!(
                    "relation '{}' cannot SET NULL through required field '{}.{}'",
                    relation.code, relation.source_entity, relation.source_field
                )));
            }
            outgoing
                .entry(relation.source_entity.clone())
                .or_default()
                .push(index);
            incoming
                .entry(relation.target_entity.clone())
                .or_default()
                .push(index);
        }

        let mut permissions: HashMap<String, Vec<PermissionDef>> = HashMap::new();
        for permission in &metadata.permissions {
            let entity = entities.get(&permission.entity_code).ok_or_else(|| {
                fail(format!(
                    "permission for role '{}' references missing or inactive entity '{}'",
                    permission.role, permission.entity_code
                ))
            })?;
            if let Some(visible) = &permission.visible_fields {
                for code in visible {
                    if entity.field(code).is_none() {
                        return Err(fail(format!(
                            "permission for role '{}' masks unknown field '{}.{}'",
                            permission.role, permission.entity_code, code
                        )));
                    }
                }
            }
            if let Some(row_filter) = &permission.row_filter {
                for code in row_filter.fields() {
                    if entity.field(code).is_none() {
                        return Err(fail(format!(
                            "permission for role '{}' filters on unknown field '{}.{}'",
                            permission.role, permission.entity_code, code
                        )));
                    }
                }
            }
            permissions
                .entry(permission.entity_code.clone())
                .or_default()
                .push(permission.clone());
        }

        tracing::debug!(
            tenant = tenant_id,
            version,
            entities = entities.len(),
            relations = metadata.relations.len(),
            "compiled schema snapshot"
        );

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            version,
            entities,
            relations: metadata.relations.clone(),
            outgoing,
            incoming,
            permissions,
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
