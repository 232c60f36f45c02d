use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use commit_reveal_rng::crypto::{generate_and_commit, Combine, Secret};
use commit_reveal_rng::{GENERATION_ID_LEN, IDENTITY_KEY_LEN};

fn bench_commit(c: &mut Criterion) {
    let context = vec![0x5Au8; GENERATION_ID_LEN + 4 * IDENTITY_KEY_LEN + 64];

    c.bench_function("generate_and_commit", |b| {
        b.iter(|| generate_and_commit(&context).unwrap());
    });
}

fn bench_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("combine");

    for n in [2usize, 4, 8, 16, 64] {
        let secrets: Vec<Secret> = (0..n).map(|_| Secret::generate()).collect();
        let trailing = vec![0xA5u8; GENERATION_ID_LEN + n * IDENTITY_KEY_LEN + 64];

        group.bench_with_input(
            BenchmarkId::from_parameter(n),
            &(secrets, trailing),
            |b, (secrets, trailing)| {
                b.iter(|| {
                    let mut acc = Combine::new(&secrets[0]);
                    for secret in &secrets[1..] {
                        acc.fold(secret);
                    }
                    acc.finish(trailing)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_commit, bench_combine);
criterion_main!(benches);
