//! Flurry benchmark suite.
//!
//! Benchmarks for key operations:
//! - Catalog parsing
//! - Shaping the catalog into projections
//! - Encoding projections as snapshot JSON and warehouse NDJSON

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};


use flurry::source::parse_catalog;
use flurry::transform::{ProjectionName, shape};

const SIZES: [usize; 3] = [20, 1_000, 50_000];

fn parse_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_catalog");

    for size in SIZES {
        let payload = bench_utils::generate_catalog_json(size);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| parse_catalog(payload.as_bytes()).unwrap());
        });
    }

    group.finish();
}

fn shape_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("shape");

    for size in SIZES {
        let catalog = bench_utils::generate_catalog(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &catalog, |b, catalog| {
            b.iter(|| shape(catalog));
        });
    }

    group.finish();
}

fn encoding_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");

    for size in SIZES {
        let projections = shape(&bench_utils::generate_catalog(size));
        group.throughput(Throughput::Elements(size as u64));

        // Finance carries the nullable rating column.
        group.bench_with_input(
            BenchmarkId::new("ndjson_finance", size),
            &projections,
            |b, projections| {
                b.iter(|| projections.get(ProjectionName::Finance).to_ndjson().unwrap());
            },
        );

        group.bench_with_input(
            BenchmarkId::new("pretty_json_product", size),
            &projections,
            |b, projections| {
                b.iter(|| {
                    projections
                        .get(ProjectionName::Product)
                        .to_pretty_json()
                        .unwrap()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    parse_benchmarks,
    shape_benchmarks,
    encoding_benchmarks
);
criterion_main!(benches);
