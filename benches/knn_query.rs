use astrolabe::index::{FeatureSpaceIndex, FeatureSubspace, MetricSpec};
use astrolabe::{Catalog, CatalogRole, ObjectId};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

const DIM: usize = 5;
const QUERIES: usize = 1_000;

fn random_points(n: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0x5EED_0A57 + seed);
    Array2::from_shape_fn((n, DIM), |_| rng.gen_range(-1.0..1.0))
}

fn random_catalog(n: usize) -> Catalog {
    Catalog::new(
        "bench",
        CatalogRole::Training,
        (0..DIM).map(|j| format!("f{j}")).collect(),
        (0..n).map(|i| ObjectId(format!("o{i:07}"))).collect(),
        random_points(n, n as u64),
    )
    .unwrap()
}

fn benchmark_knn(c: &mut Criterion) {
    let queries = random_points(QUERIES, 1);
    let mut group = c.benchmark_group("knn_query");
    group.throughput(Throughput::Elements(QUERIES as u64));
    for size in [1_000_usize, 10_000, 100_000] {
        let catalog = random_catalog(size);
        let index = FeatureSpaceIndex::build(&catalog, &FeatureSubspace::All, MetricSpec::default()).unwrap();
        for k in [10_usize, 50] {
            group.bench_with_input(BenchmarkId::new(format!("k{k}"), size), &index, |b, index| {
                b.iter(|| {
                    let neighbours = index.query_many(black_box(queries.view()), k).unwrap();
                    black_box(neighbours);
                });
            });
        }
    }
    group.finish();
}

criterion_group!(knn_query, benchmark_knn);
criterion_main!(knn_query);
