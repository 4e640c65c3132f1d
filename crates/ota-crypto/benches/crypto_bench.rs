//! Benchmarks for image signature operations
//!
//! Run with: cargo bench --bench crypto_bench

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ota_crypto::prelude::*;
use std::hint::black_box;

const SIGNING_PEM: &str = include_str!("../tests/fixtures/signing_key.pem");

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("sha256");
    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let data = vec![0xA5u8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| compute_sha256(black_box(data)));
        });
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let Ok(signer) = ImageSigningKey::from_pem(SIGNING_PEM) else {
        return;
    };
    let verifier = signer.verifying_key();
    let digest = compute_sha256(b"bench image");
    let Ok(signature) = signer.sign_digest(&digest) else {
        return;
    };

    c.bench_function("rsa2048_verify_digest", |b| {
        b.iter(|| verifier.verify_digest(black_box(&digest), black_box(&signature)));
    });
}

criterion_group!(benches, bench_digest, bench_verify);
criterion_main!(benches);
