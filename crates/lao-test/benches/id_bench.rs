//! Benchmarks for identifier hashing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lao_core::{EntityId, MessageId, PublicKey, Timestamp};
use lao_wire::ids;

fn bench_message_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_id");
    let signature = [7u8; 64];

    for size in [64usize, 1024, 16 * 1024] {
        let payload = vec![0xAB; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| MessageId::compute(black_box(payload), black_box(&signature)))
        });
    }
    group.finish();
}

fn bench_entity_ids(c: &mut Criterion) {
    let organizer = PublicKey::from_bytes([1; 32]);
    let lao = ids::lao(&organizer, Timestamp(1_000), "LAO");

    c.bench_function("entity_id_lao", |b| {
        b.iter(|| ids::lao(black_box(&organizer), black_box(Timestamp(1_000)), black_box("LAO")))
    });

    c.bench_function("entity_id_roll_call", |b| {
        b.iter(|| ids::roll_call(black_box(&lao), black_box(Timestamp(1_100)), black_box("Check-in")))
    });

    c.bench_function("entity_id_parse", |b| {
        let text = lao.as_str().to_string();
        b.iter(|| black_box(&text).parse::<EntityId>())
    });
}

criterion_group!(benches, bench_message_id, bench_entity_ids);
criterion_main!(benches);
