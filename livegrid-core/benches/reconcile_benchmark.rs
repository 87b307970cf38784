use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use livegrid_core::{Record, RecordCache, RecordData};
use serde_json::json;

fn row(id: u64, version: u64) -> Record {
    let data: RecordData = json!({"title": format!("Item {id}"), "score": id})
        .as_object()
        .cloned()
        .unwrap_or_default();
    let mut record = Record::new_created(id, data, Utc::now());
    record.version = version;
    record
}

fn loaded_cache(rows: u64) -> RecordCache {
    let cache = RecordCache::new();
    cache.merge_page((1..=rows).map(|id| row(id, 1)).collect(), Some(rows), rows);
    cache
}

fn bench_apply_incoming(c: &mut Criterion) {
    let cache = loaded_cache(1_000);
    let mut version = 1;

    c.bench_function("apply_incoming_1k_rows", |b| {
        b.iter(|| {
            version += 1;
            black_box(cache.apply_incoming(row(500, version)));
        })
    });
}

fn bench_apply_incoming_with_reader(c: &mut Criterion) {
    let cache = loaded_cache(1_000);
    let mut version = 1;

    // A held snapshot forces copy-on-write on every merge.
    c.bench_function("apply_incoming_1k_rows_snapshot_held", |b| {
        b.iter(|| {
            let _reader = cache.snapshot();
            version += 1;
            black_box(cache.apply_incoming(row(500, version)));
        })
    });
}

fn bench_edit_and_resolve(c: &mut Criterion) {
    let cache = loaded_cache(1_000);
    let mut version = 1;
    let patch: RecordData = json!({"title": "edited"}).as_object().cloned().unwrap_or_default();

    c.bench_function("begin_edit_resolve", |b| {
        b.iter(|| {
            let ticket = cache.begin_edit(10, patch.clone()).unwrap();
            version += 1;
            let mut server = row(10, version);
            server.data.insert("title".into(), json!("edited"));
            black_box(cache.resolve_mutation_result(ticket, server));
        })
    });
}

criterion_group!(
    benches,
    bench_apply_incoming,
    bench_apply_incoming_with_reader,
    bench_edit_and_resolve
);
criterion_main!(benches);
