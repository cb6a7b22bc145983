use crate::error::MedbError;
use crate::metadata::types::{Record, Value};
use crate::metadata::PermissionDef;
use crate::query::plan::Filter;
use crate::schema::SchemaSnapshot;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    Create,
    Edit,
    Delete,
    Export,
    Import,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Edit => "edit",
            Action::Delete => "delete",
            Action::Export => "export",
            Action::Import => "import",
        }
    }
}

/// The acting caller, with roles already resolved by the (out-of-scope)
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(id: Uuid, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    fn holds(&self, role: &str) -> bool {
        self.roles.iter().any(|held| held == role)
    }
}

/// Operand of a stored row filter: a literal, or the acting principal's id
/// substituted at authorization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowOperand {
    Value(Value),
    PrincipalId,
}

impl RowOperand {
    fn resolve(&self, principal: &Principal) -> serde_json::Value {
        match self {
            RowOperand::Value(value) => value.to_json(),
            RowOperand::PrincipalId => serde_json::Value::String(principal.id.to_string()),
        }
    }
}

/// Structured row-visibility predicate stored in permission metadata.
/// Field references are metadata codes; resolution produces a
/// builder-compatible [`Filter`], never a raw string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowFilterExpr {
    Eq(String, RowOperand),
    Ne(String, RowOperand),
    Lt(String, RowOperand),
    Lte(String, RowOperand),
    Gt(String, RowOperand),
    Gte(String, RowOperand),
    In(String, Vec<RowOperand>),
    IsNull(String),
    IsNotNull(String),
    And(Box<RowFilterExpr>, Box<RowFilterExpr>),
    Or(Box<RowFilterExpr>, Box<RowFilterExpr>),
    Not(Box<RowFilterExpr>),
}

impl RowFilterExpr {
    pub fn and(self, rhs: RowFilterExpr) -> RowFilterExpr {
        RowFilterExpr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: RowFilterExpr) -> RowFilterExpr {
        RowFilterExpr::Or(Box::new(self), Box::new(rhs))
    }

    /// Every field code the expression references, for schema-compile-time
    /// validation.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RowFilterExpr::Eq(field, _)
            | RowFilterExpr::Ne(field, _)
            | RowFilterExpr::Lt(field, _)
            | RowFilterExpr::Lte(field, _)
            | RowFilterExpr::Gt(field, _)
            | RowFilterExpr::Gte(field, _)
            | RowFilterExpr::In(field, _)
            | RowFilterExpr::IsNull(field)
            | RowFilterExpr::IsNotNull(field) => out.push(field.as_str()),
            RowFilterExpr::And(left, right) | RowFilterExpr::Or(left, right) => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            RowFilterExpr::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Substitute principal references and lower into a caller-shaped
    /// [`Filter`] for the query builder.
    pub fn resolve(&self, principal: &Principal) -> Filter {
        match self {
            RowFilterExpr::Eq(field, operand) => {
                Filter::Eq(field.clone(), operand.resolve(principal))
            }
            RowFilterExpr::Ne(field, operand) => {
                Filter::Ne(field.clone(), operand.resolve(principal))
            }
            RowFilterExpr::Lt(field, operand) => {
                Filter::Lt(field.clone(), operand.resolve(principal))
            }
            RowFilterExpr::Lte(field, operand) => {
                Filter::Lte(field.clone(), operand.resolve(principal))
            }
            RowFilterExpr::Gt(field, operand) => {
                Filter::Gt(field.clone(), operand.resolve(principal))
            }
            RowFilterExpr::Gte(field, operand) => {
                Filter::Gte(field.clone(), operand.resolve(principal))
            }
            RowFilterExpr::In(field, operands) => Filter::In(
                field.clone(),
                operands.iter().map(|o| o.resolve(principal)).collect(),
            ),
            RowFilterExpr::IsNull(field) => Filter::IsNull(field.clone()),
            RowFilterExpr::IsNotNull(field) => Filter::IsNotNull(field.clone()),
            RowFilterExpr::And(left, right) => left
                .resolve(principal)
                .and(right.resolve(principal)),
            RowFilterExpr::Or(left, right) => left
                .resolve(principal)
                .or(right.resolve(principal)),
            RowFilterExpr::Not(inner) => inner.resolve(principal).not(),
        }
    }
}

/// Which fields a decision allows the caller to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMask {
    All,
    Only(BTreeSet<CompactString>),
}

impl FieldMask {
    pub fn allows(&self, field_code: &str) -> bool {
        match self {
            FieldMask::All => true,
            FieldMask::Only(visible) => visible.contains(field_code),
        }
    }

    /// Strip masked fields from a record before it leaves the engine.
    pub fn apply(&self, record: Record) -> Record {
        match self {
            FieldMask::All => record,
            FieldMask::Only(visible) => record
                .into_iter()
                .filter(|(code, _)| visible.contains(code))
                .collect(),
        }
    }
}

/// Outcome of a successful authorization: what the caller may see and the
/// predicate bounding which rows the operation may touch.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub field_mask: FieldMask,
    pub row_filter: Option<Filter>,
}

impl PermissionDef {
    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::View => self.can_view,
            Action::Create => self.can_create,
            Action::Edit => self.can_edit,
            Action::Delete => self.can_delete,
            Action::Export => self.can_export,
            Action::Import => self.can_import,
        }
    }
}

/// Resolve what the principal may do on the entity.
///
/// Multi-role combination is a permissive union: the capability is granted
/// if any held role grants it; row predicates of granting roles OR together
/// (a granting role with no predicate is an unbounded window, erasing the
/// combined predicate); visible-field masks union (a field is hidden only
/// if every granting role hides it).
pub fn authorize(
    snapshot: &SchemaSnapshot,
    principal: &Principal,
    entity_code: &str,
    action: Action,
) -> Result<Decision, MedbError> {
    let grants: Vec<&PermissionDef> = snapshot
        .permissions_for(entity_code)
        .iter()
        .filter(|grant| grant.allows(action) && principal.holds(&grant.role))
        .collect();

    if grants.is_empty() {
        return Err(MedbError::PermissionDenied {
            entity: entity_code.to_string(),
            action: action.as_str(),
        });
    }

    let row_filter = if grants.iter().any(|grant| grant.row_filter.is_none()) {
        None
    } else {
        grants
            .iter()
            .filter_map(|grant| grant.row_filter.as_ref())
            .map(|expr| expr.resolve(principal))
            .reduce(Filter::or)
    };

    let field_mask = if grants.iter().any(|grant| grant.visible_fields.is_none()) {
        FieldMask::All
    } else {
        let mut visible = BTreeSet::new();
        for grant in &grants {
            if let Some(fields) = &grant.visible_fields {
                visible.extend(fields.iter().map(|code| CompactString::from(code.as_str())));
            }
        }
        FieldMask::Only(visible)
    };

    Ok(Decision {
        field_mask,
        row_filter,
    })
}
