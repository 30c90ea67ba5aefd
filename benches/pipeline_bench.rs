use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use psi_hashing::{
    build_table, generate_seeds, HashingConfig, SeededHasher, Sha3Seeded, TableLayout,
    TableReader, Xxh3Seeded,
};
use std::io::Write;

fn elements(n: u32) -> Vec<[u8; 16]> {
    (0..n)
        .map(|i| {
            let mut e = [0u8; 16];
            e[..4].copy_from_slice(&i.to_le_bytes());
            e[4..8].copy_from_slice(&i.wrapping_mul(0x9e3779b9).to_le_bytes());
            e
        })
        .collect()
}

fn bench_digest<H: SeededHasher>(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");
    let seed = generate_seeds(1, 7)[0];
    let data = elements(4096);
    group.throughput(Throughput::Elements(data.len() as u64));
    group.bench_function(H::NAME, |b| {
        b.iter(|| {
            data.iter()
                .fold(0u64, |acc, e| acc ^ H::digest(black_box(&seed), e))
        })
    });
    group.finish();
}

fn bench_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign_bucket");
    for buckets in [16usize, 1024, 65536] {
        let layout = TableLayout::new(buckets, 9, 1.2, None).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(buckets), &layout, |b, layout| {
            let mut digest = 0u64;
            b.iter(|| {
                digest = digest.wrapping_add(0x9e37_79b9_7f4a_7c15);
                black_box(layout.assign_bucket(black_box(digest)))
            })
        });
    }
    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_table");
    group.sample_size(10);

    for size in [10_000u32, 100_000] {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let mut f = std::fs::File::create(&source).unwrap();
        for e in elements(size) {
            f.write_all(&e).unwrap();
        }
        drop(f);

        let config = HashingConfig::new(&source, dir.path().join("buckets"), generate_seeds(3, 1))
            .with_bucket_count(64)
            .with_queue_capacity(1024)
            .with_dataset_size_exponent(size.ilog10());

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &config, |b, config| {
            b.iter(|| build_table(config).unwrap())
        });

        let table = TableReader::open_dir(&config.bucket_dir).unwrap();
        let probes = elements(256);
        group.bench_with_input(BenchmarkId::new("probe", size), &table, |b, table| {
            let mut i = 0;
            b.iter(|| {
                let e = &probes[i % probes.len()];
                i += 1;
                black_box(table.contains::<Xxh3Seeded>(e).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_digest::<Xxh3Seeded>,
    bench_digest::<Sha3Seeded>,
    bench_assign,
    bench_build
);
criterion_main!(benches);
