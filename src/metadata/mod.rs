pub mod types;

use crate::error::MedbError;
use crate::metadata::types::{FieldType, Value};
use crate::permission::RowFilterExpr;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

fn default_true() -> bool {
    true
}

/// One tenant-defined logical table. Written only by the admin subsystem;
/// the engine reads these through the schema cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityDef {
    pub code: String,
    pub table_name: String,
    #[serde(default = "default_true")]
    pub allow_create: bool,
    #[serde(default = "default_true")]
    pub allow_edit: bool,
    #[serde(default = "default_true")]
    pub allow_delete: bool,
    #[serde(default)]
    pub use_soft_delete: bool,
    #[serde(default)]
    pub use_audit_log: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl EntityDef {
    pub fn new(code: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            table_name: table_name.into(),
            allow_create: true,
            allow_edit: true,
            allow_delete: true,
            use_soft_delete: false,
            use_audit_log: false,
            is_active: true,
        }
    }

    pub fn soft_delete(mut self, on: bool) -> Self {
        self.use_soft_delete = on;
        self
    }

    pub fn audit_log(mut self, on: bool) -> Self {
        self.use_audit_log = on;
        self
    }
}

/// One tenant-defined column with its coercion and validation rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDef {
    pub entity_code: String,
    pub code: String,
    pub column_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min_value: Option<Decimal>,
    #[serde(default)]
    pub max_value: Option<Decimal>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default = "default_true")]
    pub in_list: bool,
    #[serde(default = "default_true")]
    pub in_filter: bool,
    #[serde(default)]
    pub in_search: bool,
    #[serde(default = "default_true")]
    pub in_sort: bool,
}

impl FieldDef {
    pub fn new(
        entity_code: impl Into<String>,
        code: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        let code = code.into();
        Self {
            entity_code: entity_code.into(),
            column_name: code.clone(),
            code,
            field_type,
            is_required: false,
            is_unique: false,
            min_length: None,
            max_length: None,
            min_value: None,
            max_value: None,
            pattern: None,
            default_value: None,
            in_list: true,
            in_filter: true,
            in_search: field_type == FieldType::Text,
            in_sort: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_range(mut self, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnDeletePolicy {
    Cascade,
    SetNull,
    Restrict,
}

/// Foreign-key-like link between two entities. Owned by the snapshot as a
/// whole, not by either endpoint, so cyclic graphs stay representable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationDef {
    pub code: String,
    pub source_entity: String,
    pub source_field: String,
    pub target_entity: String,
    pub target_field: String,
    pub cardinality: Cardinality,
    pub on_delete: OnDeletePolicy,
}

/// Role-scoped capabilities plus optional row/field visibility restriction
/// on one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionDef {
    pub role: String,
    pub entity_code: String,
    #[serde(default)]
    pub can_view: bool,
    #[serde(default)]
    pub can_create: bool,
    #[serde(default)]
    pub can_edit: bool,
    #[serde(default)]
    pub can_delete: bool,
    #[serde(default)]
    pub can_export: bool,
    #[serde(default)]
    pub can_import: bool,
    /// `None` exposes every field; `Some` restricts to the named codes.
    #[serde(default)]
    pub visible_fields: Option<BTreeSet<String>>,
    /// Predicate limiting which rows the role may see. Stored structured,
    /// never as a string.
    #[serde(default)]
    pub row_filter: Option<RowFilterExpr>,
}

impl PermissionDef {
    pub fn new(role: impl Into<String>, entity_code: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            entity_code: entity_code.into(),
            can_view: false,
            can_create: false,
            can_edit: false,
            can_delete: false,
            can_export: false,
            can_import: false,
            visible_fields: None,
            row_filter: None,
        }
    }

    pub fn full_access(role: impl Into<String>, entity_code: impl Into<String>) -> Self {
        Self {
            can_view: true,
            can_create: true,
            can_edit: true,
            can_delete: true,
            can_export: true,
            can_import: true,
            ..Self::new(role, entity_code)
        }
    }

    pub fn view_only(role: impl Into<String>, entity_code: impl Into<String>) -> Self {
        Self {
            can_view: true,
            ..Self::new(role, entity_code)
        }
    }

    pub fn with_row_filter(mut self, filter: RowFilterExpr) -> Self {
        self.row_filter = Some(filter);
        self
    }

    pub fn with_visible_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.visible_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Everything the engine reads about one tenant, as stored by the admin
/// subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TenantMetadata {
    pub entities: Vec<EntityDef>,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
    pub permissions: Vec<PermissionDef>,
}

/// Read access to the metadata tables. Implemented by the admin/metadata
/// layer; the engine only ever calls `load`, and only on cache misses.
pub trait MetadataSource: Send + Sync {
    fn load(&self, tenant_id: &str) -> Result<TenantMetadata, MedbError>;
}

/// In-memory metadata source. Stands in for the admin layer in tests and
/// embedded deployments; `replace` models an admin-side metadata write
/// (the caller still has to invalidate the schema cache).
#[derive(Default)]
pub struct StaticMetadata {
    tenants: RwLock<HashMap<String, TenantMetadata>>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, tenant_id: impl Into<String>, metadata: TenantMetadata) {
        self.tenants.write().insert(tenant_id.into(), metadata);
    }
}

impl MetadataSource for StaticMetadata {
    fn load(&self, tenant_id: &str) -> Result<TenantMetadata, MedbError> {
        self.tenants
            .read()
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| MedbError::schema(tenant_id, "tenant has no metadata"))
    }
}
