//! Benchmarks for surface-recon stages.
//!
//! Run with: cargo bench -p surface-recon
//!
//! To compare against baseline:
//! 1. First run: cargo bench -p surface-recon -- --save-baseline main
//! 2. After changes: cargo bench -p surface-recon -- --baseline main

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nalgebra::{Point3, Vector3};
use surface_recon::{
    CloudPoint, NormalParams, OutlierParams, PoissonParams, PointSet, SpatialIndex,
    estimate_normals, reconstruct, remove_outliers, voxel_downsample,
};

// =============================================================================
// Test Cloud Generation
// =============================================================================

/// Unit sphere sampled on a Fibonacci spiral, with exact outward normals.
fn create_sphere(n: usize) -> PointSet {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f64;
            let dir = Vector3::new(r * theta.cos(), y, r * theta.sin());
            CloudPoint::with_normal(Point3::from(dir), dir)
        })
        .collect()
}

/// The same sphere without normals.
fn create_bare_sphere(n: usize) -> PointSet {
    let mut cloud = create_sphere(n);
    for p in &mut cloud.points {
        p.normal = None;
    }
    cloud
}

// =============================================================================
// Spatial Index
// =============================================================================

fn bench_spatial_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("SpatialIndex");

    for n in [1_000, 10_000, 100_000] {
        let cloud = create_bare_sphere(n);
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("build", n), &cloud, |b, cloud| {
            b.iter(|| SpatialIndex::build(black_box(cloud)))
        });

        let index = SpatialIndex::build(&cloud).unwrap();
        group.bench_with_input(BenchmarkId::new("knn_16_all", n), &index, |b, index| {
            b.iter(|| {
                for i in 0..index.len() {
                    black_box(index.k_nearest_of(i, 16));
                }
            })
        });
    }

    group.finish();
}

// =============================================================================
// Point Stages
// =============================================================================

fn bench_point_stages(c: &mut Criterion) {
    let mut group = c.benchmark_group("PointStages");
    group.sample_size(20);

    for n in [5_000, 50_000] {
        let cloud = create_bare_sphere(n);
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("remove_outliers", n), &cloud, |b, cloud| {
            b.iter(|| remove_outliers(black_box(cloud), &OutlierParams::default()))
        });

        group.bench_with_input(BenchmarkId::new("estimate_normals", n), &cloud, |b, cloud| {
            b.iter(|| estimate_normals(black_box(cloud), &NormalParams::with_k(16)))
        });

        group.bench_with_input(BenchmarkId::new("voxel_downsample", n), &cloud, |b, cloud| {
            b.iter(|| voxel_downsample(black_box(cloud), 0.02))
        });
    }

    group.finish();
}

// =============================================================================
// Reconstruction
// =============================================================================

fn bench_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reconstruction");
    group.sample_size(10); // Poisson solves are slow

    let cloud = create_sphere(20_000);
    group.throughput(Throughput::Elements(cloud.len() as u64));

    for depth in [5u8, 6, 7] {
        group.bench_with_input(BenchmarkId::new("poisson_depth", depth), &depth, |b, &depth| {
            b.iter(|| reconstruct(black_box(&cloud), &PoissonParams::with_depth(depth)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_spatial_index,
    bench_point_stages,
    bench_reconstruction
);
criterion_main!(benches);
