//! Benchmarks for distance kernels and the vector index hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use triaxdb_core::distance::{cosine_distance, euclidean_distance};
use triaxdb_core::{CancelToken, DistanceMetric, HnswConfig, HnswIndex, NounType};

fn generate_random_vector(dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn bench_euclidean(c: &mut Criterion) {
    let mut group = c.benchmark_group("euclidean_distance");

    for dim in [128, 384, 768, 1536].iter() {
        let a = generate_random_vector(*dim);
        let b = generate_random_vector(*dim);

        group.throughput(Throughput::Elements(*dim as u64));
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |bench, _| {
            bench.iter(|| euclidean_distance(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

fn bench_cosine(c: &mut Criterion) {
    let mut group = c.benchmark_group("cosine_distance");

    for dim in [128, 384, 768, 1536].iter() {
        let a = generate_random_vector(*dim);
        let b = generate_random_vector(*dim);

        group.throughput(Throughput::Elements(*dim as u64));
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |bench, _| {
            bench.iter(|| cosine_distance(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

fn bench_knn_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn_search");

    for num_vectors in [1000, 10000].iter() {
        let dim = 384;
        let index = HnswIndex::new(DistanceMetric::Cosine, dim, HnswConfig::default());
        let partition = NounType::CONCEPT;

        for i in 0..*num_vectors {
            index
                .insert(&partition, i as u32, &generate_random_vector(dim))
                .unwrap();
        }

        let query = generate_random_vector(dim);
        let cancel = CancelToken::new();

        group.throughput(Throughput::Elements(*num_vectors as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_vectors),
            num_vectors,
            |bench, _| {
                bench.iter(|| {
                    index.search(
                        std::slice::from_ref(&partition),
                        black_box(&query),
                        10,
                        None,
                        &cancel,
                    )
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_euclidean, bench_cosine, bench_knn_search);
criterion_main!(benches);
