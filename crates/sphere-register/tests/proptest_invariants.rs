//! Property-based tests for sphere-register.
//!
//! Run with: cargo test -p sphere-register --test proptest_invariants

use nalgebra::Point3;
use proptest::prelude::*;
use sphere_register::projector::unproject_point;
use sphere_register::sphere::regular_sphere;
use sphere_register::tessellate::{tessellate_source, tessellate_target};
use sphere_register::{
    Border, BorderSet, ClusterParams, Mesh, PointProjector, RangeSign, RetryPolicy, SurfaceHint,
    find_clusters,
};

const RADIUS: f64 = 100.0;

// ============================================================================
// Strategies
// ============================================================================

fn arb_point_on_sphere() -> impl Strategy<Value = Point3<f64>> {
    (-80.0f64..80.0, 0.0f64..360.0).prop_map(|(lat, lon)| {
        let (lat, lon) = (lat.to_radians(), lon.to_radians());
        Point3::new(
            RADIUS * lat.cos() * lon.cos(),
            RADIUS * lat.cos() * lon.sin(),
            RADIUS * lat.sin(),
        )
    })
}

fn arb_border(name: &'static str) -> impl Strategy<Value = Border> {
    prop::collection::vec(arb_point_on_sphere(), 1..6).prop_map(move |links| Border::new(name, links))
}

fn arb_borders() -> impl Strategy<Value = BorderSet> {
    (arb_border("a"), arb_border("b")).prop_map(|(a, b)| [a, b].into_iter().collect())
}

fn sphere_290() -> Mesh {
    regular_sphere(2, RADIUS)
}

// ============================================================================
// Projection
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_node_projects_onto_itself(node in 0usize..290) {
        let mesh = sphere_290();
        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        let projection = projector.project_barycentric(&mesh, &mesh.position(node));

        prop_assert!(projection.is_located());
        let back = projection.unproject(&mesh.positions()).unwrap();
        prop_assert!((back - mesh.position(node)).norm() < 1e-6);
    }

    #[test]
    fn prop_weights_are_barycentric(p in arb_point_on_sphere()) {
        let mesh = sphere_290();
        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        let projection = projector.project_barycentric(&mesh, &p);

        prop_assert!(projection.is_found());
        let sum: f64 = projection.weights.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-9);
        for w in projection.weights {
            prop_assert!(w >= -1e-9);
        }
    }

    #[test]
    fn prop_unprojection_follows_the_other_embedding(
        p in arb_point_on_sphere(),
        scale in 0.5f64..2.0,
    ) {
        let mesh = sphere_290();
        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        let projection = projector.project_barycentric(&mesh, &p);
        prop_assume!(projection.is_found());

        let moved: Vec<Point3<f64>> = mesh
            .positions()
            .iter()
            .map(|q| Point3::new(q.x * scale, q.y, q.z + 1.0))
            .collect();
        let expected = unproject_point(&projection.nodes, &projection.weights, &moved);
        let actual = projection.unproject(&moved).unwrap();
        prop_assert!((expected - actual).norm() < 1e-12);
    }
}

// ============================================================================
// Tessellation
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_tessellated_spheres_stay_on_radius(borders in arb_borders()) {
        let mut target = sphere_290();
        let result = tessellate_target(&mut target, &borders, RADIUS).unwrap();

        prop_assert_eq!(result.original_node_count, 290);
        prop_assert_eq!(target.node_count(), 290 + result.mapping.len());
        prop_assert_eq!(result.mapping.len() + result.skipped.len(), borders.total_links());
        for v in &target.vertices {
            prop_assert!((v.position.coords.norm() - RADIUS).abs() < 1e-6);
        }
    }

    #[test]
    fn prop_source_and_target_node_counts_match(borders in arb_borders()) {
        let mut target = sphere_290();
        let result = tessellate_target(&mut target, &borders, RADIUS).unwrap();

        let mut source = sphere_290();
        let tessellation = tessellate_source(
            &mut source,
            &borders,
            &borders,
            &result.mapping,
            &RetryPolicy::default(),
            1.0,
            RADIUS,
        )
        .unwrap();

        prop_assert_eq!(source.node_count(), target.node_count());
        prop_assert_eq!(tessellation.variances.len(), source.node_count());
        for v in &source.vertices {
            prop_assert!((v.position.coords.norm() - RADIUS).abs() < 1e-6);
        }
    }
}

// ============================================================================
// Clustering
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_clusters_partition_qualifying_nodes(
        values in prop::collection::vec(-1.0f64..1.0, 74),
        min in -0.5f64..0.5,
    ) {
        let mesh = regular_sphere(1, RADIUS);
        let params = ClusterParams::positive(min, 1.0).with_negative(-1.0, -0.5);
        let analysis = find_clusters(&mesh, &values, &params).unwrap();

        let mut seen = vec![false; values.len()];
        for cluster in &analysis.clusters {
            prop_assert!(!cluster.nodes.is_empty());
            for &n in &cluster.nodes {
                prop_assert!(!seen[n], "node {} in two clusters", n);
                seen[n] = true;
                let range = match cluster.range {
                    RangeSign::Positive => params.positive,
                    RangeSign::Negative => params.negative,
                };
                prop_assert!(range.is_some_and(|r| r.contains(values[n])));
            }
        }
        let covered = seen.iter().filter(|&&s| s).count();
        prop_assert_eq!(covered, analysis.qualifying_nodes);

        let total_area: f64 = analysis.clusters.iter().map(|c| c.area).sum();
        prop_assert!(total_area <= mesh.surface_area() + 1e-6);
    }
}
