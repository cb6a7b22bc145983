use crate::error::MedbError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Caller-facing structured predicate. Field references are metadata codes
/// and literals are untyped JSON; the query builder resolves both against a
/// schema snapshot before anything reaches storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(String, JsonValue),
    Ne(String, JsonValue),
    Lt(String, JsonValue),
    Lte(String, JsonValue),
    Gt(String, JsonValue),
    Gte(String, JsonValue),
    In(String, Vec<JsonValue>),
    Between(String, JsonValue, JsonValue),
    IsNull(String),
    IsNotNull(String),
    Contains(String, String),
    StartsWith(String, String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn and(self, rhs: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Maximum nesting depth of this expression tree.
    pub fn depth(&self) -> usize {
        match self {
            Filter::Eq(_, _)
            | Filter::Ne(_, _)
            | Filter::Lt(_, _)
            | Filter::Lte(_, _)
            | Filter::Gt(_, _)
            | Filter::Gte(_, _)
            | Filter::In(_, _)
            | Filter::Between(_, _, _)
            | Filter::IsNull(_)
            | Filter::IsNotNull(_)
            | Filter::Contains(_, _)
            | Filter::StartsWith(_, _) => 1,
            Filter::Not(inner) => 1 + inner.depth(),
            Filter::And(left, right) | Filter::Or(left, right) => {
                1 + left.depth().max(right.depth())
            }
        }
    }

    /// Rejects expressions nested past `max_depth` before compilation, so a
    /// hostile filter cannot overflow the builder's recursion.
    pub fn validate_depth(&self, max_depth: usize) -> Result<(), MedbError> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(MedbError::Query(format!(
                "filter depth {depth} exceeds maximum {max_depth}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Explicit limit/offset pagination. The engine clamps `limit` to its
/// configured hard maximum before building the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// One list call's worth of caller input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub sort: Vec<Sort>,
    #[serde(default)]
    pub page: Option<Page>,
    /// Include soft-deleted rows. Only widens the soft-delete predicate;
    /// the permission row predicate always applies.
    #[serde(default)]
    pub include_deleted: bool,
}

impl ListRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_page(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::Filter;
    use serde_json::json;

    #[test]
    fn depth_counts_nested_combinators() {
        let leaf = Filter::Eq("status".to_string(), json!("new"));
        assert_eq!(leaf.depth(), 1);

        let nested = Filter::Eq("status".to_string(), json!("new"))
            .and(Filter::Gt("amount".to_string(), json!(10)).not());
        assert_eq!(nested.depth(), 3);
    }

    #[test]
    fn validate_depth_rejects_deep_filters() {
        let mut filter = Filter::IsNull("status".to_string());
        for _ in 0..8 {
            filter = filter.not();
        }
        assert!(filter.validate_depth(4).is_err());
        assert!(filter.validate_depth(16).is_ok());
    }
}
