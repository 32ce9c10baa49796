//! Force-based morphing.
//!
//! Morphing relaxes a mesh toward the local shape of a reference embedding
//! of the same topology. Each node feels two kinds of force from its ring:
//!
//! - a linear (spring) force per neighbour, pulling the edge back to its
//!   reference length;
//! - an angular force per ring triangle, pulling the triangle's two base
//!   angles back to their reference values.
//!
//! Forces are averaged over the ring and scaled by the step size. On a
//! sphere the total force is first mapped into the node's tangent plane and
//! the moved node is pushed back onto the radius.
//!
//! All nodes read the previous iteration's coordinates and write into a
//! second buffer; the buffers are swapped once every node is done.
//!
//! # Example
//!
//! ```
//! use sphere_register::morph::{MorphConstraints, MorphParams, Morpher};
//! use sphere_register::sphere::regular_sphere;
//!
//! let reference = regular_sphere(1, 100.0);
//! let mut mesh = reference.clone();
//! mesh.vertices[3].position.x += 4.0;
//! mesh.project_to_sphere(100.0);
//!
//! let morpher = Morpher::new(&reference.snapshot(), MorphParams::spherical().with_iterations(20));
//! let result = morpher.run(&mut mesh, &MorphConstraints::default());
//! assert!(result.final_residual < result.initial_residual);
//! ```

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::topology::Topology;
use crate::tracing_ext::OperationTimer;
use crate::types::{Mesh, MeshSnapshot, Triangle};

/// Shape of the surface being morphed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MorphSurface {
    /// Forces are kept tangent to the sphere and nodes stay on its radius.
    #[default]
    Spherical,
    /// Forces are applied as computed.
    Flat,
}

/// Parameters for one morphing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MorphParams {
    /// Number of iterations. Zero computes forces without moving anything.
    pub iterations: usize,

    /// Strength of the edge-length springs.
    pub linear_force: f64,

    /// Strength of the ring-angle force.
    pub angular_force: f64,

    /// Fraction of the total force applied per iteration.
    pub step_size: f64,

    pub surface: MorphSurface,
}

impl Default for MorphParams {
    fn default() -> Self {
        Self {
            iterations: 1,
            linear_force: 0.5,
            angular_force: 0.3,
            step_size: 0.5,
            surface: MorphSurface::Spherical,
        }
    }
}

impl MorphParams {
    /// Defaults for spherical morphing.
    pub fn spherical() -> Self {
        Self::default()
    }

    /// Defaults for flat morphing.
    pub fn flat() -> Self {
        Self {
            surface: MorphSurface::Flat,
            ..Default::default()
        }
    }

    /// Set the iteration count.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the linear and angular force strengths.
    pub fn with_forces(mut self, linear: f64, angular: f64) -> Self {
        self.linear_force = linear;
        self.angular_force = angular;
        self
    }

    /// Set the step size.
    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }
}

/// Per-node distortion weights blended into the step size.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionCorrection {
    /// One ratio per node.
    pub ratios: Vec<f64>,
    /// Blend between no correction (0) and full correction (1).
    pub strength: f64,
}

impl DistortionCorrection {
    fn factor(&self, node: usize) -> f64 {
        let ratio = self.ratios.get(node).copied().unwrap_or(1.0);
        (1.0 - self.strength) + self.strength * ratio
    }
}

/// Which nodes move, and how fast.
#[derive(Debug, Clone, PartialEq)]
pub struct MorphConstraints {
    /// Nodes flagged false are anchored and move with `anchor_step_size`.
    /// `None` morphs every node.
    pub should_morph: Option<Vec<bool>>,
    /// Step size for anchored nodes.
    pub anchor_step_size: f64,
    pub distortion: Option<DistortionCorrection>,
}

impl Default for MorphConstraints {
    fn default() -> Self {
        Self {
            should_morph: None,
            anchor_step_size: 0.5,
            distortion: None,
        }
    }
}

impl MorphConstraints {
    /// Anchor the nodes flagged false in `should_morph`.
    pub fn anchored(should_morph: Vec<bool>, anchor_step_size: f64) -> Self {
        Self {
            should_morph: Some(should_morph),
            anchor_step_size,
            distortion: None,
        }
    }

    /// Attach distortion correction ratios.
    pub fn with_distortion(mut self, ratios: Vec<f64>, strength: f64) -> Self {
        self.distortion = Some(DistortionCorrection { ratios, strength });
        self
    }

    fn step_size(&self, params: &MorphParams, node: usize) -> f64 {
        let moving = self
            .should_morph
            .as_ref()
            .and_then(|mask| mask.get(node).copied())
            .unwrap_or(true);
        let step = if moving {
            params.step_size
        } else {
            self.anchor_step_size
        };
        match &self.distortion {
            Some(correction) => step * correction.factor(node),
            None => step,
        }
    }
}

/// Outcome of [`Morpher::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MorphResult {
    /// Iterations performed.
    pub iterations: usize,
    /// Linear residual before the first iteration.
    pub initial_residual: f64,
    /// Linear residual after the last iteration.
    pub final_residual: f64,
    /// Residual after each iteration.
    pub residual_history: Vec<f64>,
    pub elapsed_ms: f64,
}

impl MorphResult {
    /// Fractional reduction of the residual.
    pub fn improvement(&self) -> f64 {
        if self.initial_residual > 0.0 {
            1.0 - self.final_residual / self.initial_residual
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for MorphResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} iterations, residual {:.4} -> {:.4} ({:.1}% better) in {:.1}ms",
            self.iterations,
            self.initial_residual,
            self.final_residual,
            self.improvement() * 100.0,
            self.elapsed_ms
        )
    }
}

/// Reference ring of one node.
#[derive(Debug, Clone, Default)]
struct NodeReference {
    neighbors: Vec<usize>,
    /// Reference length of the edge to each neighbour.
    distances: Vec<f64>,
    /// Reference base angles of the triangle (node, ring[k], ring[k+1]):
    /// at `ring[k]` and at `ring[k+1]`.
    angles: Vec<(f64, f64)>,
    /// Ring wraps around (interior node).
    closed: bool,
}

impl NodeReference {
    fn pair(&self, k: usize) -> (usize, usize) {
        (self.neighbors[k], self.neighbors[(k + 1) % self.neighbors.len()])
    }
}

/// Morphs meshes toward a fixed reference embedding.
#[derive(Debug, Clone)]
pub struct Morpher {
    params: MorphParams,
    nodes: Vec<NodeReference>,
}

impl Morpher {
    /// Measure the reference rings.
    ///
    /// # Panics
    /// Panics if a node of the reference has no neighbours.
    pub fn new(reference: &MeshSnapshot, params: MorphParams) -> Self {
        let topology = Topology::build(reference.node_count(), reference.tiles());
        let coords = reference.positions();

        let nodes = (0..reference.node_count())
            .into_par_iter()
            .map(|node| {
                assert!(
                    topology.has_neighbors(node),
                    "node {node} has no neighbours and cannot be morphed"
                );
                let neighbors = topology.neighbors(node).to_vec();
                let p = coords[node];
                let distances = neighbors.iter().map(|&m| (coords[m] - p).norm()).collect();
                let closed = !topology.is_boundary(node);
                let mut reference = NodeReference {
                    neighbors,
                    distances,
                    angles: Vec::new(),
                    closed,
                };
                reference.angles = (0..pair_count(&reference))
                    .map(|k| {
                        let (a, b) = reference.pair(k);
                        base_angles(&p, &coords[a], &coords[b])
                    })
                    .collect();
                reference
            })
            .collect();

        Self { params, nodes }
    }

    /// The parameters this morpher runs with.
    pub fn params(&self) -> &MorphParams {
        &self.params
    }

    /// Morph `mesh` in place.
    ///
    /// # Panics
    /// Panics if `mesh` does not have the reference's node count.
    pub fn run(&self, mesh: &mut Mesh, constraints: &MorphConstraints) -> MorphResult {
        assert_eq!(
            mesh.node_count(),
            self.nodes.len(),
            "morphed mesh must share the reference's nodes"
        );
        let timer = OperationTimer::with_context("morph", mesh.tile_count(), mesh.node_count());

        let radius = match self.params.surface {
            MorphSurface::Spherical => Some(mesh.spherical_radius()),
            MorphSurface::Flat => None,
        };

        let mut current = mesh.positions();
        let mut next = current.clone();
        let initial_residual = self.linear_residual(&current);
        let mut residual_history = Vec::with_capacity(self.params.iterations);

        for iteration in 0..self.params.iterations {
            next.par_iter_mut().enumerate().for_each(|(node, out)| {
                *out = self.step(node, &current, constraints, radius);
            });
            std::mem::swap(&mut current, &mut next);

            let residual = self.linear_residual(&current);
            trace!(iteration, residual, "Morph iteration");
            residual_history.push(residual);
        }

        if self.params.iterations > 0 {
            mesh.set_positions(&current);
        }

        let result = MorphResult {
            iterations: self.params.iterations,
            initial_residual,
            final_residual: residual_history.last().copied().unwrap_or(initial_residual),
            residual_history,
            elapsed_ms: timer.elapsed_ms(),
        };
        debug!(
            iterations = result.iterations,
            initial = result.initial_residual,
            final_residual = result.final_residual,
            "Morphing complete"
        );
        result
    }

    /// Total force on every node for the given coordinates.
    ///
    /// Spherical forces are already mapped to the tangent plane.
    pub fn forces(&self, coords: &[Point3<f64>]) -> Vec<Vector3<f64>> {
        (0..self.nodes.len())
            .into_par_iter()
            .map(|node| self.total_force(node, coords))
            .collect()
    }

    /// Sum over directed edges of `(reference length - current length)^2`.
    pub fn linear_residual(&self, coords: &[Point3<f64>]) -> f64 {
        self.nodes
            .par_iter()
            .enumerate()
            .map(|(node, reference)| {
                reference
                    .neighbors
                    .iter()
                    .zip(&reference.distances)
                    .map(|(&m, &d)| {
                        let error = d - (coords[m] - coords[node]).norm();
                        error * error
                    })
                    .sum::<f64>()
            })
            .sum()
    }

    fn step(
        &self,
        node: usize,
        coords: &[Point3<f64>],
        constraints: &MorphConstraints,
        radius: Option<f64>,
    ) -> Point3<f64> {
        let p = coords[node];
        if self.nodes[node].neighbors.len() < 2 {
            return p;
        }
        let step = constraints.step_size(&self.params, node);
        let moved = p + self.total_force(node, coords) * step;
        match radius {
            Some(r) => {
                let len = moved.coords.norm();
                if len > 0.0 {
                    Point3::from(moved.coords * (r / len))
                } else {
                    moved
                }
            }
            None => moved,
        }
    }

    fn total_force(&self, node: usize, coords: &[Point3<f64>]) -> Vector3<f64> {
        let reference = &self.nodes[node];
        let count = reference.neighbors.len();
        if count < 2 {
            return Vector3::zeros();
        }
        let p = coords[node];
        let mut force = Vector3::zeros();

        if self.params.linear_force > 0.0 {
            for (&m, &d) in reference.neighbors.iter().zip(&reference.distances) {
                force += self.linear_force(&p, &coords[m], d);
            }
        }

        if self.params.angular_force > 0.0 {
            for (k, &(angle1, angle2)) in reference.angles.iter().enumerate() {
                let (a, b) = reference.pair(k);
                force += self.angular_force(&p, &coords[a], &coords[b], angle1, angle2);
            }
        }

        force /= count as f64;

        if self.params.surface == MorphSurface::Spherical
            && let Some(normal) = p.coords.try_normalize(0.0)
        {
            force -= normal * normal.dot(&force);
        }
        force
    }

    fn linear_force(&self, p: &Point3<f64>, q: &Point3<f64>, reference: f64) -> Vector3<f64> {
        let offset = p - q;
        let distance = offset.norm();
        if distance <= 0.0 {
            return Vector3::zeros();
        }
        let mut error = reference - distance;
        let ratio = if reference != 0.0 { distance / reference } else { 0.0 };
        // Compressed edges push back twice as hard.
        if ratio < 0.5 {
            error *= 2.0;
        }
        offset * (error * self.params.linear_force / distance)
    }

    fn angular_force(
        &self,
        p: &Point3<f64>,
        a: &Point3<f64>,
        b: &Point3<f64>,
        reference_at_a: f64,
        reference_at_b: f64,
    ) -> Vector3<f64> {
        let Some(normal) = Triangle::new(*p, *a, *b).normal() else {
            return Vector3::zeros();
        };
        let (angle_at_a, angle_at_b) = base_angles(p, a, b);
        let mut force = Vector3::zeros();

        let to_a = a - p;
        if let Some(direction) = to_a.cross(&normal).try_normalize(0.0) {
            let magnitude = to_a.norm() * (reference_at_a - angle_at_a).sin();
            force += direction * (self.params.angular_force * magnitude);
        }

        let to_b = b - p;
        if let Some(direction) = normal.cross(&to_b).try_normalize(0.0) {
            let magnitude = to_b.norm() * (reference_at_b - angle_at_b).sin();
            force += direction * (self.params.angular_force * magnitude);
        }

        force
    }
}

fn pair_count(reference: &NodeReference) -> usize {
    let n = reference.neighbors.len();
    match (n, reference.closed) {
        (0 | 1, _) => 0,
        (_, true) => n,
        (_, false) => n - 1,
    }
}

/// Angles of triangle (p, a, b) at `a` and at `b`.
fn base_angles(p: &Point3<f64>, a: &Point3<f64>, b: &Point3<f64>) -> (f64, f64) {
    (angle_between(&(p - a), &(b - a)), angle_between(&(a - b), &(p - b)))
}

fn angle_between(u: &Vector3<f64>, v: &Vector3<f64>) -> f64 {
    let denom = u.norm() * v.norm();
    if denom <= 0.0 {
        return 0.0;
    }
    (u.dot(v) / denom).clamp(-1.0, 1.0).acos()
}
