//! Smoothing kernels used between registration steps.
//!
//! Every sweep is synchronous: new positions are computed from the previous
//! iteration's positions only and written back after the whole sweep.

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::trace;

use crate::topology::Topology;
use crate::types::{Mesh, Triangle};

/// Move each node toward the area-weighted average of the centers of the
/// tiles in its ring.
///
/// New position = `(1 - strength) * p + strength * sum(area_j / total * center_j)`.
/// Only nodes with more than one neighbour and a closed ring are moved.
/// `only` restricts smoothing to flagged nodes; `project_radius` pushes
/// every node back onto that sphere after each iteration.
pub fn areal_smoothing(
    mesh: &mut Mesh,
    strength: f64,
    iterations: usize,
    only: Option<&[bool]>,
    project_radius: Option<f64>,
) {
    if iterations == 0 || mesh.is_empty() {
        return;
    }
    let topology = mesh.topology();
    let only = only.filter(|flags| flags.len() == mesh.node_count());
    let mut coords = mesh.positions();

    for iteration in 0..iterations {
        let mut next: Vec<Point3<f64>> = (0..coords.len())
            .into_par_iter()
            .map(|node| {
                let p = coords[node];
                if topology.is_boundary(node) || only.is_some_and(|flags| !flags[node]) {
                    return p;
                }
                let ring = topology.neighbors(node);
                if ring.len() < 2 {
                    return p;
                }

                let mut total = 0.0;
                let mut weighted = Vector3::zeros();
                for (j, &n1) in ring.iter().enumerate() {
                    let n2 = ring[(j + 1) % ring.len()];
                    let tri = Triangle::new(p, coords[n1], coords[n2]);
                    let area = tri.area();
                    if area > 0.0 {
                        total += area;
                        weighted += tri.centroid().coords * area;
                    }
                }
                if total <= 0.0 {
                    return p;
                }
                Point3::from(p.coords * (1.0 - strength) + (weighted / total) * strength)
            })
            .collect();

        if let Some(radius) = project_radius {
            project_points(&mut next, radius);
        }
        trace!(iteration, "Areal smoothing iteration");
        coords = next;
    }

    mesh.set_positions(&coords);
}

/// Smooth around fixed landmarks.
///
/// Landmark nodes never move. Before smoothing, each landmark's offset from
/// the average of its neighbours is measured and every landmark neighbour
/// is shifted by the mean offset of its landmark neighbours, so the
/// landmark stays "above" its ring. Then, per iteration, ordinary nodes are
/// moved toward the average of their neighbours; landmark neighbours only
/// every `smooth_neighbors_every` iterations.
pub fn landmark_neighbor_constrained_smoothing(
    mesh: &mut Mesh,
    strength: f64,
    iterations: usize,
    landmarks: &[bool],
    smooth_neighbors_every: usize,
) {
    let node_count = mesh.node_count();
    assert_eq!(landmarks.len(), node_count, "one landmark flag per node");
    let topology = mesh.topology();
    let mut coords = mesh.positions();

    let kinds: Vec<NodeKind> = (0..node_count)
        .map(|n| {
            if landmarks[n] {
                NodeKind::Landmark
            } else if topology.neighbors(n).iter().any(|&m| landmarks[m]) {
                NodeKind::LandmarkNeighbor
            } else {
                NodeKind::Normal
            }
        })
        .collect();

    let offsets: Vec<Vector3<f64>> = (0..node_count)
        .map(|n| match kinds[n] {
            NodeKind::Landmark => neighbor_average(&topology, &coords, n)
                .map_or_else(Vector3::zeros, |avg| coords[n] - avg),
            _ => Vector3::zeros(),
        })
        .collect();

    for n in 0..node_count {
        if kinds[n] != NodeKind::LandmarkNeighbor {
            continue;
        }
        let landmark_offsets: Vec<Vector3<f64>> = topology
            .neighbors(n)
            .iter()
            .filter(|&&m| kinds[m] == NodeKind::Landmark)
            .map(|&m| offsets[m])
            .collect();
        let mean = landmark_offsets.iter().sum::<Vector3<f64>>() / landmark_offsets.len() as f64;
        coords[n] += mean;
    }

    let every = smooth_neighbors_every.max(1);
    let mut counter = 1;
    for _ in 0..iterations {
        let smooth_neighbors = counter == every;
        coords = (0..node_count)
            .into_par_iter()
            .map(|n| {
                let p = coords[n];
                let eligible = match kinds[n] {
                    NodeKind::Normal => true,
                    NodeKind::LandmarkNeighbor => smooth_neighbors,
                    NodeKind::Landmark => false,
                };
                match (eligible, neighbor_average(&topology, &coords, n)) {
                    (true, Some(avg)) => Point3::from(p.coords * (1.0 - strength) + avg.coords * strength),
                    _ => p,
                }
            })
            .collect();
        counter = if counter >= every { 1 } else { counter + 1 };
    }

    mesh.set_positions(&coords);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Normal,
    Landmark,
    LandmarkNeighbor,
}

/// Average-neighbours smoothing of a per-node vector field.
///
/// New value = `(1 - strength) * v + strength * mean(neighbour values)`.
pub fn smooth_vectors(topology: &Topology, vectors: &mut [Vector3<f64>], strength: f64, iterations: usize) {
    for _ in 0..iterations {
        let next: Vec<Vector3<f64>> = (0..vectors.len())
            .into_par_iter()
            .map(|n| {
                let ring = topology.neighbors(n);
                if ring.is_empty() {
                    return vectors[n];
                }
                let mean = ring.iter().map(|&m| vectors[m]).sum::<Vector3<f64>>() / ring.len() as f64;
                vectors[n] * (1.0 - strength) + mean * strength
            })
            .collect();
        vectors.copy_from_slice(&next);
    }
}

/// Move every flagged node to the average of its neighbours.
///
/// Flags are read in node order; nodes later in the order see the new
/// positions of earlier ones. Nodes without neighbours stay put.
pub fn move_landmarks_to_neighbor_average(mesh: &mut Mesh, landmarks: &[bool]) {
    let topology = mesh.topology();
    for node in (0..mesh.node_count()).filter(|&n| landmarks.get(n).copied().unwrap_or(false)) {
        let ring = topology.neighbors(node);
        if ring.is_empty() {
            continue;
        }
        let sum: Vector3<f64> = ring.iter().map(|&m| mesh.vertices[m].position.coords).sum();
        mesh.vertices[node].position = Point3::from(sum / ring.len() as f64);
    }
}

fn neighbor_average(topology: &Topology, coords: &[Point3<f64>], node: usize) -> Option<Point3<f64>> {
    let ring = topology.neighbors(node);
    if ring.is_empty() {
        return None;
    }
    let sum: Vector3<f64> = ring.iter().map(|&m| coords[m].coords).sum();
    Some(Point3::from(sum / ring.len() as f64))
}

fn project_points(points: &mut [Point3<f64>], radius: f64) {
    for p in points {
        let len = p.coords.norm();
        if len > 0.0 {
            p.coords *= radius / len;
        }
    }
}
