use criterion::{black_box, criterion_group, criterion_main, Criterion};
use medb::{
    CallContext, DataEngine, EntityDef, FieldDef, FieldType, Filter, ListRequest, MedbConfig,
    MemoryBackend, MetadataSource, Page, PermissionDef, Principal, StaticMetadata, TableSpec,
    TenantMetadata, Value,
};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

const TENANT: &str = "bench";
const SEEDED_ROWS: usize = 10_000;

fn contact_metadata() -> TenantMetadata {
    TenantMetadata {
        entities: vec![EntityDef::new("contact", "contact")],
        fields: vec![
            FieldDef::new("contact", "name", FieldType::Text).required(),
            FieldDef::new("contact", "status", FieldType::Text)
                .with_default(Value::Text("new".into())),
            FieldDef::new("contact", "score", FieldType::Integer),
        ],
        relations: Vec::new(),
        permissions: vec![PermissionDef::full_access("admin", "contact")],
    }
}

async fn setup(seed_rows: usize) -> (DataEngine, CallContext, Vec<Uuid>) {
    let source = Arc::new(StaticMetadata::new());
    source.replace(TENANT, contact_metadata());
    let backend = Arc::new(MemoryBackend::new());
    backend
        .provision(
            TENANT,
            TableSpec::new("contact")
                .column("id", false)
                .column("name", false)
                .column("status", true)
                .column("score", true),
        )
        .await;
    let engine = DataEngine::new(
        source as Arc<dyn MetadataSource>,
        backend,
        MedbConfig::default(),
    )
    .expect("engine");
    let ctx = CallContext::new(TENANT, Principal::new(Uuid::now_v7(), ["admin"]));

    let mut ids = Vec::with_capacity(seed_rows);
    for index in 0..seed_rows {
        let payload = match json!({"name": format!("contact-{index}"), "score": index as i64 % 100}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let record = engine
            .create(&ctx, "contact", payload)
            .await
            .expect("seed create");
        ids.push(record.get("id").and_then(Value::as_uuid).expect("id"));
    }
    (engine, ctx, ids)
}

fn bench_create(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (engine, ctx, _) = rt.block_on(setup(0));
    let mut counter = 0u64;
    c.bench_function("create_single", |b| {
        b.iter(|| {
            counter += 1;
            let payload = match json!({"name": format!("bench-{counter}")}) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            };
            let record = rt
                .block_on(engine.create(&ctx, "contact", payload))
                .expect("create");
            black_box(record);
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (engine, ctx, ids) = rt.block_on(setup(SEEDED_ROWS));
    let mut cursor = 0usize;
    c.bench_function("get_by_id", |b| {
        b.iter(|| {
            cursor = (cursor + 1) % ids.len();
            let record = rt
                .block_on(engine.get(&ctx, "contact", ids[cursor]))
                .expect("get");
            black_box(record);
        })
    });
}

fn bench_list_filtered(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (engine, ctx, _) = rt.block_on(setup(SEEDED_ROWS));
    c.bench_function("list_filtered_page", |b| {
        b.iter(|| {
            let request = ListRequest::new()
                .with_filter(Filter::Gte("score".to_string(), json!(50)))
                .with_page(Page::new(50));
            let page = rt
                .block_on(engine.list(&ctx, "contact", request))
                .expect("list");
            black_box(page);
        })
    });
}

criterion_group!(benches, bench_create, bench_get, bench_list_filtered);
criterion_main!(benches);
