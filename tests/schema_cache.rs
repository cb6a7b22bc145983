//! Schema lifecycle through the engine: lazy builds, invalidation after
//! admin-side metadata writes, tenant-wide schema failures, and snapshot
//! stability for captured references.

use medb::{
    CallContext, DataEngine, EntityDef, FieldDef, FieldType, ListRequest, MedbConfig, MedbError,
    MemoryBackend, MetadataSource, PermissionDef, Principal, StaticMetadata, TableSpec,
    TenantMetadata,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const TENANT: &str = "acme";

fn base_metadata() -> TenantMetadata {
    TenantMetadata {
        entities: vec![EntityDef::new("contact", "contact")],
        fields: vec![FieldDef::new("contact", "name", FieldType::Text).required()],
        relations: Vec::new(),
        permissions: vec![PermissionDef::full_access("admin", "contact")],
    }
}

async fn setup(metadata: TenantMetadata) -> (DataEngine, Arc<StaticMetadata>, Arc<MemoryBackend>) {
    let source = Arc::new(StaticMetadata::new());
    source.replace(TENANT, metadata);
    let backend = Arc::new(MemoryBackend::new());
    backend
        .provision(
            TENANT,
            TableSpec::new("contact")
                .column("id", false)
                .column("name", false)
                .column("phone", true),
        )
        .await;
    let engine = DataEngine::new(
        source.clone() as Arc<dyn MetadataSource>,
        backend.clone(),
        MedbConfig::default(),
    )
    .expect("engine");
    (engine, source, backend)
}

fn admin() -> CallContext {
    CallContext::new(TENANT, Principal::new(Uuid::now_v7(), ["admin"]))
}

fn payload(value: serde_json::Value) -> medb::Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("payload must be an object"),
    }
}

#[tokio::test]
async fn metadata_edits_become_visible_on_invalidation() {
    let (engine, source, _) = setup(base_metadata()).await;
    let ctx = admin();

    // "phone" is not yet part of the schema.
    let err = engine
        .create(&ctx, "contact", payload(json!({"name": "Ann", "phone": "555"})))
        .await
        .expect_err("unknown field before refresh");
    assert!(matches!(err, MedbError::Validation(_)));

    // Admin layer adds the field and signals the cache.
    let mut updated = base_metadata();
    updated
        .fields
        .push(FieldDef::new("contact", "phone", FieldType::Text));
    source.replace(TENANT, updated);

    // Still stale until invalidated.
    assert!(engine
        .create(&ctx, "contact", payload(json!({"name": "Ann", "phone": "555"})))
        .await
        .is_err());

    engine.invalidate_schema(TENANT);
    engine
        .create(&ctx, "contact", payload(json!({"name": "Ann", "phone": "555"})))
        .await
        .expect("field visible after invalidation");
}

#[tokio::test]
async fn malformed_metadata_fails_the_whole_tenant() {
    let mut metadata = base_metadata();
    // Two fields claiming one physical column.
    metadata
        .fields
        .push(FieldDef::new("contact", "alias", FieldType::Text));
    metadata.fields[1].column_name = "name".to_string();
    let (engine, source, _) = setup(metadata).await;
    let ctx = admin();

    let err = engine
        .list(&ctx, "contact", ListRequest::new())
        .await
        .expect_err("schema error");
    assert!(matches!(err, MedbError::Schema { .. }));
    assert_eq!(err.code_str(), "schema");

    // Repairing the metadata and invalidating recovers the tenant.
    source.replace(TENANT, base_metadata());
    engine.invalidate_schema(TENANT);
    engine
        .list(&ctx, "contact", ListRequest::new())
        .await
        .expect("recovered");
}

#[tokio::test]
async fn captured_snapshots_survive_invalidation() {
    let (engine, source, _) = setup(base_metadata()).await;

    let before = engine.schema_cache().snapshot(TENANT).expect("snapshot");
    let mut updated = base_metadata();
    updated
        .fields
        .push(FieldDef::new("contact", "phone", FieldType::Text));
    source.replace(TENANT, updated);
    engine.invalidate_schema(TENANT);
    let after = engine.schema_cache().snapshot(TENANT).expect("snapshot");

    // The in-flight reference still describes the old schema; the new one
    // is a distinct, higher version.
    assert!(before.entity("contact").expect("entity").field("phone").is_none());
    assert!(after.entity("contact").expect("entity").field("phone").is_some());
    assert!(after.version() > before.version());
}

#[tokio::test]
async fn unknown_entities_and_tenants_are_reported_distinctly() {
    let (engine, _, _) = setup(base_metadata()).await;
    let ctx = admin();
    assert!(matches!(
        engine.list(&ctx, "deal", ListRequest::new()).await,
        Err(MedbError::UnknownEntity { .. })
    ));

    let ghost = CallContext::new("ghost", Principal::new(Uuid::now_v7(), ["admin"]));
    assert!(matches!(
        engine.list(&ghost, "contact", ListRequest::new()).await,
        Err(MedbError::Schema { .. })
    ));
}
