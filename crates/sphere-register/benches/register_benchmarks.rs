//! Benchmarks for sphere-register operations.
//!
//! Run with: cargo bench -p sphere-register
//!
//! To compare against baseline:
//! 1. First run: cargo bench -p sphere-register -- --save-baseline main
//! 2. After changes: cargo bench -p sphere-register -- --baseline main

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nalgebra::Point3;
use sphere_register::smoothing::areal_smoothing;
use sphere_register::sphere::regular_sphere;
use sphere_register::{
    ClusterParams, Mesh, MorphConstraints, MorphParams, Morpher, NodeMapping, PointProjector,
    SurfaceHint, find_clusters,
};

const RADIUS: f64 = 100.0;

// =============================================================================
// Test Data
// =============================================================================

/// Points spread over the sphere along a spiral.
fn spiral_points(count: usize) -> Vec<Point3<f64>> {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..count)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / count as f64;
            let r = (1.0 - z * z).sqrt();
            let theta = golden * i as f64;
            Point3::new(RADIUS * r * theta.cos(), RADIUS * r * theta.sin(), RADIUS * z)
        })
        .collect()
}

/// Sphere with every node nudged sideways, pushed back onto the radius.
fn perturbed_sphere(level: usize) -> Mesh {
    let mut mesh = regular_sphere(level, RADIUS);
    for (i, v) in mesh.vertices.iter_mut().enumerate() {
        let shift = if i % 2 == 0 { 1.5 } else { -1.5 };
        v.position.x += shift;
        v.position.y -= shift;
    }
    mesh.project_to_sphere(RADIUS);
    mesh
}

// =============================================================================
// Projection
// =============================================================================

fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection");
    let points = spiral_points(1000);

    for level in [2, 3, 4] {
        let mesh = regular_sphere(level, RADIUS);
        group.throughput(Throughput::Elements(points.len() as u64));

        group.bench_with_input(BenchmarkId::new("build", mesh.node_count()), &mesh, |b, mesh| {
            b.iter(|| PointProjector::new(black_box(mesh), SurfaceHint::Sphere));
        });

        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        group.bench_with_input(
            BenchmarkId::new("barycentric", mesh.node_count()),
            &mesh,
            |b, mesh| {
                b.iter(|| {
                    points
                        .iter()
                        .filter(|p| projector.project_barycentric(mesh, black_box(p)).is_found())
                        .count()
                });
            },
        );
    }

    group.finish();
}

fn bench_node_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_mapping");

    for level in [2, 3] {
        let target = regular_sphere(level, RADIUS);
        let deformed = perturbed_sphere(level + 1);
        group.throughput(Throughput::Elements(target.node_count() as u64));
        group.bench_function(BenchmarkId::from_parameter(target.node_count()), |b| {
            b.iter(|| NodeMapping::build(black_box(&target), black_box(&deformed)));
        });
    }

    group.finish();
}

// =============================================================================
// Morphing and Smoothing
// =============================================================================

fn bench_morph(c: &mut Criterion) {
    let mut group = c.benchmark_group("morph");
    group.sample_size(20);

    for level in [2, 3] {
        let reference = regular_sphere(level, RADIUS).snapshot();
        let start = perturbed_sphere(level);
        let morpher = Morpher::new(&reference, MorphParams::spherical().with_iterations(20));
        let constraints = MorphConstraints::default();

        group.throughput(Throughput::Elements(start.node_count() as u64));
        group.bench_function(BenchmarkId::new("20_iterations", start.node_count()), |b| {
            b.iter(|| {
                let mut mesh = start.clone();
                morpher.run(black_box(&mut mesh), &constraints)
            });
        });
    }

    group.finish();
}

fn bench_areal_smoothing(c: &mut Criterion) {
    let mut group = c.benchmark_group("areal_smoothing");

    for level in [2, 3, 4] {
        let start = perturbed_sphere(level);
        group.throughput(Throughput::Elements(start.node_count() as u64));
        group.bench_function(BenchmarkId::from_parameter(start.node_count()), |b| {
            b.iter(|| {
                let mut mesh = start.clone();
                areal_smoothing(black_box(&mut mesh), 1.0, 10, None, Some(RADIUS));
                mesh
            });
        });
    }

    group.finish();
}

// =============================================================================
// Clustering
// =============================================================================

fn bench_clustering(c: &mut Criterion) {
    let mut group = c.benchmark_group("clustering");

    for level in [3, 4] {
        let mesh = regular_sphere(level, RADIUS);
        let values: Vec<f64> = mesh
            .vertices
            .iter()
            .map(|v| (v.position.x * 0.1).sin() * (v.position.z * 0.1).cos())
            .collect();
        let params = ClusterParams::positive(0.2, 1.0).with_negative(-1.0, -0.2);

        group.throughput(Throughput::Elements(mesh.node_count() as u64));
        group.bench_function(BenchmarkId::from_parameter(mesh.node_count()), |b| {
            b.iter(|| find_clusters(black_box(&mesh), black_box(&values), &params));
        });
    }

    group.finish();
}

// =============================================================================
// Criterion Setup
// =============================================================================

criterion_group!(
    benches,
    bench_projection,
    bench_node_mapping,
    bench_morph,
    bench_areal_smoothing,
    bench_clustering,
);

criterion_main!(benches);
