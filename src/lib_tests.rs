use crate::metadata::types::FieldType;
use crate::storage::memory::{MemoryBackend, TableSpec};
use crate::{
    Action, CallContext, DataEngine, EntityDef, FieldDef, MedbConfig, MedbError, MetadataSource,
    PermissionDef, Principal, StaticMetadata, TenantMetadata,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn contact_metadata() -> TenantMetadata {
    TenantMetadata {
        entities: vec![EntityDef::new("contact", "contact")],
        fields: vec![
            FieldDef::new("contact", "name", FieldType::Text).required(),
            FieldDef::new("contact", "email", FieldType::Text),
        ],
        relations: Vec::new(),
        permissions: vec![
            PermissionDef::full_access("admin", "contact"),
            PermissionDef {
                can_export: true,
                ..PermissionDef::view_only("analyst", "contact")
            },
        ],
    }
}

fn contact_table() -> TableSpec {
    TableSpec::new("contact")
        .column("id", false)
        .column("name", false)
        .column("email", true)
}

async fn engine() -> (DataEngine, Arc<MemoryBackend>) {
    let source = Arc::new(StaticMetadata::new());
    source.replace("acme", contact_metadata());
    let backend = Arc::new(MemoryBackend::new());
    backend.provision("acme", contact_table()).await;
    let engine = DataEngine::new(
        source as Arc<dyn MetadataSource>,
        backend.clone(),
        MedbConfig::default(),
    )
    .expect("engine");
    (engine, backend)
}

fn ctx(roles: &[&str]) -> CallContext {
    CallContext::new("acme", Principal::new(Uuid::now_v7(), roles.iter().copied()))
}

fn payload(value: serde_json::Value) -> crate::Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("payload must be an object"),
    }
}

#[test]
fn rejects_invalid_config_at_construction() {
    let source = Arc::new(StaticMetadata::new());
    let backend = Arc::new(MemoryBackend::new());
    let config = MedbConfig::default().with_page_limits(0, 0);
    assert!(matches!(
        DataEngine::new(source, backend, config),
        Err(MedbError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn check_resolves_capabilities_without_data_access() {
    let (engine, _) = engine().await;
    assert!(engine.check(&ctx(&["analyst"]), "contact", Action::Export).is_ok());
    assert!(engine.check(&ctx(&["analyst"]), "contact", Action::Import).is_err());
    assert!(engine.check(&ctx(&["admin"]), "contact", Action::Delete).is_ok());
    assert!(matches!(
        engine.check(&ctx(&["admin"]), "ghost", Action::View),
        Err(MedbError::UnknownEntity { .. })
    ));
}

#[tokio::test]
async fn metrics_track_operation_outcomes() {
    let (engine, backend) = engine().await;
    let admin = ctx(&["admin"]);

    engine
        .create(&admin, "contact", payload(json!({"name": "Ann"})))
        .await
        .expect("create");
    let err = engine
        .create(&admin, "contact", payload(json!({})))
        .await
        .expect_err("validation");
    assert!(matches!(err, MedbError::Validation(_)));
    engine
        .list(&ctx(&["nobody"]), "contact", Default::default())
        .await
        .expect_err("denied");

    backend.inject_transient_failures(1);
    engine
        .list(&admin, "contact", Default::default())
        .await
        .expect("retried");

    let metrics = engine.metrics();
    assert_eq!(metrics.validation_failures, 1);
    assert_eq!(metrics.permission_denials, 1);
    assert_eq!(metrics.transient_retries, 1);
    assert!(metrics.operations >= 4);
    assert_eq!(metrics.snapshot_builds, 1);
}

#[tokio::test]
async fn get_of_unknown_id_is_not_found() {
    let (engine, _) = engine().await;
    let err = engine
        .get(&ctx(&["admin"]), "contact", Uuid::now_v7())
        .await
        .expect_err("missing");
    assert!(matches!(err, MedbError::NotFound { .. }));
}

#[tokio::test]
async fn second_transient_failure_propagates() {
    let (engine, backend) = engine().await;
    backend.inject_transient_failures(2);
    let err = engine
        .list(&ctx(&["admin"]), "contact", Default::default())
        .await
        .expect_err("exhausted");
    assert!(err.is_transient());
}
