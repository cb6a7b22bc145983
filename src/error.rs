use compact_str::CompactString;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCause {
    Unique,
    RelationRestrict,
}

impl std::fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictCause::Unique => write!(f, "unique"),
            ConflictCause::RelationRestrict => write!(f, "relation_restrict"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Transient,
    Fatal,
}

/// Stable rule identifiers for field-level validation failures. The HTTP
/// layer forwards these verbatim so callers can repair the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViolationRule {
    Required,
    Type,
    MinLength,
    MaxLength,
    MinValue,
    MaxValue,
    Pattern,
    UnknownField,
}

impl ViolationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationRule::Required => "required",
            ViolationRule::Type => "type",
            ViolationRule::MinLength => "min_length",
            ViolationRule::MaxLength => "max_length",
            ViolationRule::MinValue => "min_value",
            ViolationRule::MaxValue => "max_value",
            ViolationRule::Pattern => "pattern",
            ViolationRule::UnknownField => "unknown_field",
        }
    }
}

/// One field-scoped validation failure. A single create/update call reports
/// every violating field at once, so these always travel as a batch.
///
/// The message names the rule and its parameters, never the offending value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: CompactString,
    pub rule: ViolationRule,
    pub message: String,
}

impl FieldViolation {
    pub fn new(
        field: impl Into<CompactString>,
        rule: ViolationRule,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            rule,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.rule.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MedbErrorCode {
    Validation,
    PermissionDenied,
    NotFound,
    UnknownEntity,
    ConflictUnique,
    ConflictRelationRestrict,
    Schema,
    Query,
    StorageTransient,
    StorageFatal,
    InvalidConfig,
}

impl MedbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MedbErrorCode::Validation => "validation",
            MedbErrorCode::PermissionDenied => "permission_denied",
            MedbErrorCode::NotFound => "not_found",
            MedbErrorCode::UnknownEntity => "unknown_entity",
            MedbErrorCode::ConflictUnique => "conflict_unique",
            MedbErrorCode::ConflictRelationRestrict => "conflict_relation_restrict",
            MedbErrorCode::Schema => "schema",
            MedbErrorCode::Query => "query",
            MedbErrorCode::StorageTransient => "storage_transient",
            MedbErrorCode::StorageFatal => "storage_fatal",
            MedbErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Debug, Error)]
pub enum MedbError {
    #[error("validation failed on {} field(s)", .0.len())]
    Validation(Vec<FieldViolation>),
    #[error("permission denied: {action} on '{entity}'")]
    PermissionDenied { entity: String, action: &'static str },
    #[error("record not found in '{entity}'")]
    NotFound { entity: String },
    #[error("unknown entity '{entity}'")]
    UnknownEntity { entity: String },
    #[error("conflict: {cause}")]
    Conflict { cause: ConflictCause },
    #[error("schema error for tenant '{tenant}': {reason}")]
    Schema { tenant: String, reason: String },
    #[error("invalid query: {0}")]
    Query(String),
    #[error("storage error: {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl MedbError {
    pub fn code(&self) -> MedbErrorCode {
        match self {
            MedbError::Validation(_) => MedbErrorCode::Validation,
            MedbError::PermissionDenied { .. } => MedbErrorCode::PermissionDenied,
            MedbError::NotFound { .. } => MedbErrorCode::NotFound,
            MedbError::UnknownEntity { .. } => MedbErrorCode::UnknownEntity,
            MedbError::Conflict { cause } => match cause {
                ConflictCause::Unique => MedbErrorCode::ConflictUnique,
                ConflictCause::RelationRestrict => MedbErrorCode::ConflictRelationRestrict,
            },
            MedbError::Schema { .. } => MedbErrorCode::Schema,
            MedbError::Query(_) => MedbErrorCode::Query,
            MedbError::Storage { kind, .. } => match kind {
                StorageErrorKind::Transient => MedbErrorCode::StorageTransient,
                StorageErrorKind::Fatal => MedbErrorCode::StorageFatal,
            },
            MedbError::InvalidConfig(_) => MedbErrorCode::InvalidConfig,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MedbError::Storage {
                kind: StorageErrorKind::Transient,
                ..
            }
        )
    }

    pub(crate) fn schema(tenant: impl Into<String>, reason: impl Into<String>) -> Self {
        MedbError::Schema {
            tenant: tenant.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConflictCause, FieldViolation, MedbError, MedbErrorCode, ViolationRule};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(MedbErrorCode::Validation.as_str(), "validation");
        assert_eq!(MedbErrorCode::ConflictUnique.as_str(), "conflict_unique");
        assert_eq!(
            MedbErrorCode::ConflictRelationRestrict.as_str(),
            "conflict_relation_restrict"
        );
        assert_eq!(MedbErrorCode::StorageTransient.as_str(), "storage_transient");
    }

    #[test]
    fn error_code_matches_variant_mapping() {
        let err = MedbError::Conflict {
            cause: ConflictCause::Unique,
        };
        assert_eq!(err.code(), MedbErrorCode::ConflictUnique);
        assert_eq!(err.code_str(), "conflict_unique");

        let err = MedbError::NotFound {
            entity: "contact".into(),
        };
        assert_eq!(err.code_str(), "not_found");
    }

    #[test]
    fn violation_rules_are_stable() {
        assert_eq!(ViolationRule::Required.as_str(), "required");
        assert_eq!(ViolationRule::Pattern.as_str(), "pattern");
        assert_eq!(ViolationRule::UnknownField.as_str(), "unknown_field");
    }

    #[test]
    fn validation_error_reports_batch_size() {
        let err = MedbError::Validation(vec![
            FieldViolation::new("name", ViolationRule::Required, "value is required"),
            FieldViolation::new("email", ViolationRule::Pattern, "value does not match pattern"),
        ]);
        assert_eq!(err.to_string(), "validation failed on 2 field(s)");
    }
}
