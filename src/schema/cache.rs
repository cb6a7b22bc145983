use crate::config::MedbConfig;
use crate::error::MedbError;
use crate::metadata::MetadataSource;
use crate::schema::SchemaSnapshot;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Holds the current [`SchemaSnapshot`] per tenant. Read-mostly: a request
/// clones the Arc once and never blocks on rebuilds. Invalidation swaps the
/// whole Arc; a snapshot is never mutated in place, so an in-flight request
/// that captured version N finishes on version N.
pub struct SchemaCache {
    source: Arc<dyn MetadataSource>,
    config: MedbConfig,
    snapshots: RwLock<HashMap<String, Arc<SchemaSnapshot>>>,
    next_version: AtomicU64,
    builds: AtomicU64,
}

impl SchemaCache {
    pub fn new(source: Arc<dyn MetadataSource>, config: MedbConfig) -> Self {
        Self {
            source,
            config,
            snapshots: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            builds: AtomicU64::new(0),
        }
    }

    /// Current snapshot for the tenant, building one from the metadata
    /// source on a miss. Once cached, reads never touch the source.
    pub fn snapshot(&self, tenant_id: &str) -> Result<Arc<SchemaSnapshot>, MedbError> {
        if let Some(snapshot) = self.snapshots.read().get(tenant_id) {
            return Ok(snapshot.clone());
        }
        let built = self.build(tenant_id)?;
        let mut snapshots = self.snapshots.write();
        // A concurrent builder may have won the race; either snapshot is a
        // valid compilation of current metadata, so first insert wins.
        Ok(snapshots
            .entry(tenant_id.to_string())
            .or_insert(built)
            .clone())
    }

    /// Drop the tenant's snapshot; the next request rebuilds from metadata.
    /// Called on any admin-side write to the metadata tables.
    pub fn invalidate(&self, tenant_id: &str) {
        let removed = self.snapshots.write().remove(tenant_id);
        if let Some(old) = removed {
            info!(
                tenant = tenant_id,
                version = old.version(),
                "schema snapshot invalidated"
            );
        }
    }

    /// Eagerly rebuild and atomically install the tenant's snapshot,
    /// returning the new version. Useful when the admin layer wants build
    /// errors surfaced at metadata-write time instead of on the next read.
    pub fn refresh(&self, tenant_id: &str) -> Result<Arc<SchemaSnapshot>, MedbError> {
        let built = self.build(tenant_id)?;
        self.snapshots
            .write()
            .insert(tenant_id.to_string(), built.clone());
        Ok(built)
    }

    /// Number of snapshot compilations performed since construction.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn build(&self, tenant_id: &str) -> Result<Arc<SchemaSnapshot>, MedbError> {
        let metadata = self.source.load(tenant_id)?;
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let snapshot =
            SchemaSnapshot::compile(tenant_id, version, &metadata, &self.config).map_err(
                |err| {
                    // Snapshot failures block the whole tenant; operators need
                    // to see them, not just the request that tripped them.
                    tracing::error!(tenant = tenant_id, error = %err, "schema snapshot build failed");
                    err
                },
            )?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        info!(
            tenant = tenant_id,
            version,
            "schema snapshot installed"
        );
        Ok(Arc::new(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::SchemaCache;
    use crate::config::MedbConfig;
    use crate::metadata::types::FieldType;
    use crate::metadata::{EntityDef, FieldDef, StaticMetadata, TenantMetadata};
    use std::sync::Arc;

    fn metadata_with_fields(fields: Vec<FieldDef>) -> TenantMetadata {
        TenantMetadata {
            entities: vec![EntityDef::new("contact", "contact")],
            fields,
            relations: Vec::new(),
            permissions: Vec::new(),
        }
    }

    #[test]
    fn caches_until_invalidated() {
        let source = Arc::new(StaticMetadata::new());
        source.replace(
            "acme",
            metadata_with_fields(vec![FieldDef::new("contact", "name", FieldType::Text)]),
        );
        let cache = SchemaCache::new(source.clone(), MedbConfig::default());

        let first = cache.snapshot("acme").expect("snapshot");
        let second = cache.snapshot("acme").expect("snapshot");
        assert_eq!(first.version(), second.version());
        assert_eq!(cache.builds(), 1);

        // Admin adds a field: invisible until invalidation.
        source.replace(
            "acme",
            metadata_with_fields(vec![
                FieldDef::new("contact", "name", FieldType::Text),
                FieldDef::new("contact", "email", FieldType::Text),
            ]),
        );
        let stale = cache.snapshot("acme").expect("snapshot");
        assert!(stale.entity("contact").expect("entity").field("email").is_none());

        cache.invalidate("acme");
        let fresh = cache.snapshot("acme").expect("snapshot");
        assert!(fresh.version() > first.version());
        assert!(fresh.entity("contact").expect("entity").field("email").is_some());

        // The captured pre-invalidation snapshot is untouched.
        assert!(first.entity("contact").expect("entity").field("email").is_none());
    }

    #[test]
    fn refresh_installs_eagerly() {
        let source = Arc::new(StaticMetadata::new());
        source.replace("acme", metadata_with_fields(Vec::new()));
        let cache = SchemaCache::new(source.clone(), MedbConfig::default());
        let v1 = cache.snapshot("acme").expect("snapshot").version();
        let refreshed = cache.refresh("acme").expect("refresh");
        assert!(refreshed.version() > v1);
        assert_eq!(
            cache.snapshot("acme").expect("snapshot").version(),
            refreshed.version()
        );
    }

    #[test]
    fn unknown_tenant_is_a_schema_error() {
        let cache = SchemaCache::new(Arc::new(StaticMetadata::new()), MedbConfig::default());
        assert!(cache.snapshot("ghost").is_err());
    }
}
