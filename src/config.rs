use crate::error::MedbError;
use compact_str::CompactString;
use std::time::Duration;

/// Runtime configuration for a [`crate::DataEngine`].
///
/// Column names listed here are engine-owned conventions; schema compilation
/// rejects tenant fields that collide with them.
#[derive(Debug, Clone)]
pub struct MedbConfig {
    /// Page size applied when a list request carries no explicit limit.
    pub default_page_size: usize,
    /// Hard upper bound on list page size; larger requests are clamped.
    pub max_page_size: usize,
    /// Maximum nesting depth accepted for caller filter expressions.
    pub max_filter_depth: usize,
    /// Maximum number of literals in one `In` predicate.
    pub max_in_list_len: usize,
    /// Maximum depth of a cascade-delete traversal before the operation is
    /// rejected as a schema anomaly.
    pub max_cascade_depth: usize,
    /// Primary-key column present on every physical entity table.
    pub id_column: CompactString,
    /// Nullable marker column on tables of soft-deleting entities.
    pub soft_delete_column: CompactString,
    /// Physical table receiving audit entries.
    pub audit_table: CompactString,
    /// Retry a mutating operation once after a transient storage failure.
    pub retry_transient: bool,
    /// Deadline applied to each operation when the caller supplies none.
    pub request_timeout: Duration,
}

impl Default for MedbConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
            max_filter_depth: 16,
            max_in_list_len: 256,
            max_cascade_depth: 32,
            id_column: CompactString::const_new("id"),
            soft_delete_column: CompactString::const_new("deleted_at"),
            audit_table: CompactString::const_new("audit_log"),
            retry_transient: true,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl MedbConfig {
    pub fn with_page_limits(mut self, default_page_size: usize, max_page_size: usize) -> Self {
        self.default_page_size = default_page_size;
        self.max_page_size = max_page_size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), MedbError> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(MedbError::InvalidConfig(
                "page sizes must be non-zero".to_string(),
            ));
        }
        if self.default_page_size > self.max_page_size {
            return Err(MedbError::InvalidConfig(format!(
                "default_page_size {} exceeds max_page_size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.max_filter_depth == 0 || self.max_cascade_depth == 0 {
            return Err(MedbError::InvalidConfig(
                "depth limits must be non-zero".to_string(),
            ));
        }
        if self.id_column.is_empty() || self.soft_delete_column.is_empty() {
            return Err(MedbError::InvalidConfig(
                "system column names must be non-empty".to_string(),
            ));
        }
        if self.id_column == self.soft_delete_column {
            return Err(MedbError::InvalidConfig(
                "id and soft-delete columns must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MedbConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(MedbConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_page_limits() {
        let config = MedbConfig::default().with_page_limits(100, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_colliding_system_columns() {
        let mut config = MedbConfig::default();
        config.soft_delete_column = config.id_column.clone();
        assert!(config.validate().is_err());
    }
}
