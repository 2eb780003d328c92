//! Benchmarks for envelope sealing and verification

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lao_crypto::{Ed25519Verifier, Identity, SignedEnvelope};
use lao_test::LaoFixture;

fn bench_seal(c: &mut Criterion) {
    let identity = Identity::from_bytes(&[1; 32]);
    let payload = vec![0x42u8; 512];

    c.bench_function("envelope_seal", |b| {
        b.iter(|| SignedEnvelope::seal(black_box(payload.clone()), &identity))
    });
}

fn bench_verify(c: &mut Criterion) {
    let identity = Identity::from_bytes(&[1; 32]);
    let envelope = SignedEnvelope::seal(vec![0x42u8; 512], &identity);

    c.bench_function("envelope_verify", |b| {
        b.iter(|| black_box(&envelope).verify(&Ed25519Verifier))
    });
}

fn bench_witnesses(c: &mut Criterion) {
    let Ok(lao) = LaoFixture::new("Bench", 8) else {
        return;
    };
    let Ok(update) = lao.update_envelope("Renamed", lao_core::Timestamp(2_000)) else {
        return;
    };
    let witnessed = lao
        .witnesses
        .iter()
        .fold(update, |envelope, w| {
            let entry = envelope.witness(w);
            envelope
                .add_witness(entry.witness, entry.signature, &Ed25519Verifier)
                .unwrap_or(envelope)
        });

    c.bench_function("verified_witnesses_8", |b| {
        b.iter(|| black_box(&witnessed).verified_witnesses(&Ed25519Verifier).count())
    });
}

criterion_group!(benches, bench_seal, bench_verify, bench_witnesses);
criterion_main!(benches);
