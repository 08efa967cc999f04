//! Store-layer benchmarks: columnar write throughput and query-cache
//! lookups at simulation-realistic entity counts.
//!
//! Run with: `cargo bench --bench store_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use squall_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A store with one match and `entity_count` entities, each carrying
/// POSITION_X/Y and VELOCITY_X/Y.
fn setup(entity_count: usize) -> (Store, ModuleId, [ComponentId; 4], Vec<EntityId>) {
    let store = Store::new();
    let mut w = store.write(ModuleId::CORE);
    let movement = w.register_module("movement");
    let components = [
        w.register_component(movement, "POSITION_X", PermissionLevel::Write),
        w.register_component(movement, "POSITION_Y", PermissionLevel::Write),
        w.register_component(movement, "VELOCITY_X", PermissionLevel::Write),
        w.register_component(movement, "VELOCITY_Y", PermissionLevel::Write),
    ];
    let m = w.create_match();

    let mut entities = Vec::with_capacity(entity_count);
    for i in 0..entity_count {
        let e = w.spawn(m).unwrap();
        w.set(e, components[0], i as f64).unwrap();
        w.set(e, components[1], 0.0).unwrap();
        w.set(e, components[2], 1.0).unwrap();
        w.set(e, components[3], -1.0).unwrap();
        entities.push(e);
    }
    drop(w);
    (store, movement, components, entities)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// Raw cell write throughput: one full movement pass over every entity.
fn bench_write_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_pass");
    for entity_count in [1_000usize, 10_000] {
        let (store, movement, [px, py, vx, vy], entities) = setup(entity_count);
        group.bench_with_input(
            BenchmarkId::from_parameter(entity_count),
            &entity_count,
            |b, _| {
                b.iter(|| {
                    let mut w = store.write(movement);
                    for &e in &entities {
                        let x = w.get(e, px).unwrap().unwrap();
                        let y = w.get(e, py).unwrap().unwrap();
                        let dx = w.get(e, vx).unwrap().unwrap();
                        let dy = w.get(e, vy).unwrap().unwrap();
                        w.set(e, px, x + dx).unwrap();
                        w.set(e, py, y + dy).unwrap();
                    }
                    black_box(w.entity_count())
                });
            },
        );
    }
    group.finish();
}

/// Cache-hit query lookups: versions unchanged between iterations.
fn bench_query_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_hit");
    for entity_count in [1_000usize, 10_000] {
        let (store, _, [px, _, vx, _], _) = setup(entity_count);
        // Warm the cache.
        let _ = store.read().query(&[px, vx]);
        group.bench_with_input(
            BenchmarkId::from_parameter(entity_count),
            &entity_count,
            |b, _| {
                b.iter(|| {
                    let r = store.read();
                    black_box(r.query(&[px, vx]).len())
                });
            },
        );
    }
    group.finish();
}

/// Cold-recompute query lookups: a write between iterations forces a miss.
fn bench_query_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_miss");
    for entity_count in [1_000usize, 10_000] {
        let (store, movement, [px, _, vx, _], entities) = setup(entity_count);
        group.bench_with_input(
            BenchmarkId::from_parameter(entity_count),
            &entity_count,
            |b, _| {
                b.iter(|| {
                    {
                        let mut w = store.write(movement);
                        let x = w.get(entities[0], px).unwrap().unwrap();
                        w.set(entities[0], px, x + 1.0).unwrap();
                    }
                    let r = store.read();
                    black_box(r.query(&[px, vx]).len())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_write_pass, bench_query_hit, bench_query_miss);
criterion_main!(benches);
