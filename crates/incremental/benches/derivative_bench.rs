//! Benchmarks for derivative construction and delta evaluation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ravel_core::{attr, Row, Scheme, Value};
use ravel_incremental::RelationDifferentiator;
use ravel_relation::{Relation, RelationChange};
use std::sync::Arc;

fn seeded_table(rows: usize) -> Relation {
    Relation::with_rows(
        Scheme::from(["id", "kind"]),
        (0..rows as i64).map(|i| {
            Row::new([("id", Value::Integer(i)), ("kind", Value::Integer(i % 16))])
        }),
    )
    .unwrap()
}

fn bench_derivative_construction(c: &mut Criterion) {
    let pets = seeded_table(1_000);
    let view = pets
        .select(attr("kind").eq(3i64))
        .unwrap()
        .project(["id"])
        .unwrap();

    c.bench_function("derivative_construction", |b| {
        b.iter(|| black_box(RelationDifferentiator::derivative(&view)))
    });
}

fn bench_small_delta_on_large_base(c: &mut Criterion) {
    c.bench_function("small_delta_on_1k_rows", |b| {
        b.iter_batched(
            || {
                let pets = seeded_table(1_000);
                let view = pets
                    .select(attr("kind").eq(3i64))
                    .unwrap()
                    .project(["id"])
                    .unwrap();
                let derivative = Arc::new(RelationDifferentiator::derivative(&view));
                let routed = derivative.clone();
                let id = pets.id();
                let _ = pets
                    .observe(move |change: &RelationChange| {
                        routed.add_change(id, change).unwrap();
                    })
                    .unwrap();
                (pets, derivative)
            },
            |(pets, derivative)| {
                pets.add(Row::new([
                    ("id", Value::Integer(5_000)),
                    ("kind", Value::Integer(3)),
                ]))
                .unwrap();
                let change = derivative.change().unwrap().unwrap();
                black_box(change.added_rows().unwrap());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_derivative_construction,
    bench_small_delta_on_large_base
);
criterion_main!(benches);
