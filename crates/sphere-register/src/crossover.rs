//! Crossover detection.
//!
//! A crossover is a tile whose orientation has flipped relative to the
//! surface around it, a sign of local self-intersection. How "flipped" is
//! judged depends on the surface:
//!
//! - Sphere: the tile normal must be within 30 degrees of the ray from the
//!   origin through the tile's center.
//! - Flat: the tile normal must be within 30 degrees of +z.
//! - Other: an edge is bad when it is shared by more than two tiles, is
//!   shorter than 1e-5, runs the same way in both of its tiles, or the two
//!   tiles fold back onto each other (about 180 degrees apart).
//!
//! Every node of a flagged tile or edge is flagged.

use nalgebra::Vector3;
use serde::Serialize;

use crate::projector::SurfaceHint;
use crate::types::{Mesh, Triangle};

const COS_30_DEGREES: f64 = 0.866;
const FOLD_COSINE: f64 = -0.999_847_7;
const TOO_SMALL: f64 = 0.00001;

/// Counts returned by [`crossover_check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrossoverCount {
    /// Flagged tiles (edges for [`SurfaceHint::Other`]).
    pub tiles: usize,
    /// Flagged nodes.
    pub nodes: usize,
    /// Per-node flag.
    #[serde(skip)]
    pub node_flags: Vec<bool>,
}

impl CrossoverCount {
    /// True if nothing was flagged.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.nodes == 0
    }
}

/// Count crossovers of `mesh`.
pub fn crossover_check(mesh: &Mesh, hint: SurfaceHint) -> CrossoverCount {
    let mut flags = vec![false; mesh.node_count()];
    let mut tiles = 0;

    match hint {
        SurfaceHint::Sphere | SurfaceHint::Flat => {
            for (t, tri) in mesh.triangles().enumerate() {
                let normal = tri.normal().unwrap_or_else(Vector3::zeros);
                let expected = match hint {
                    SurfaceHint::Flat => Vector3::z(),
                    _ => tri.centroid().coords.try_normalize(0.0).unwrap_or_else(Vector3::zeros),
                };
                if normal.dot(&expected) < COS_30_DEGREES {
                    tiles += 1;
                    for n in mesh.tile(t) {
                        flags[n] = true;
                    }
                }
            }
        }
        SurfaceHint::Other => {
            let topology = mesh.topology();
            for (a, b) in topology.edges() {
                let (a, b) = (a as usize, b as usize);
                let shared = topology.tiles_for_edge(a as u32, b as u32).unwrap_or(&[]);
                let bad = if shared.len() > 2 {
                    true
                } else if (mesh.position(a) - mesh.position(b)).norm() < TOO_SMALL {
                    true
                } else if let [t1, t2] = *shared {
                    let n1 = mesh.triangle(t1).and_then(|tri: Triangle| tri.normal());
                    let n2 = mesh.triangle(t2).and_then(|tri: Triangle| tri.normal());
                    let same_direction = runs_forward(mesh.tile(t1), a, b) == runs_forward(mesh.tile(t2), a, b);
                    let folded = match (n1, n2) {
                        (Some(n1), Some(n2)) => n1.dot(&n2) < FOLD_COSINE,
                        _ => true,
                    };
                    same_direction || folded
                } else {
                    false
                };
                if bad {
                    tiles += 1;
                    flags[a] = true;
                    flags[b] = true;
                }
            }
        }
    }

    let nodes = flags.iter().filter(|&&f| f).count();
    CrossoverCount {
        tiles,
        nodes,
        node_flags: flags,
    }
}

/// True if the tile visits `a` immediately before `b`.
fn runs_forward(tile: [usize; 3], a: usize, b: usize) -> bool {
    (0..3).any(|i| tile[i] == a && tile[(i + 1) % 3] == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphere::regular_sphere;
    use nalgebra::Point3;

    #[test]
    fn test_regular_sphere_is_clean() {
        let mesh = regular_sphere(2, 100.0);
        let count = crossover_check(&mesh, SurfaceHint::Sphere);
        assert!(count.is_clean());
        assert_eq!(count.tiles, 0);
        assert!(crossover_check(&mesh, SurfaceHint::Other).is_clean());
    }

    #[test]
    fn test_dragged_node_creates_crossover() {
        let mut mesh = regular_sphere(2, 100.0);
        let ring = mesh.topology().neighbors(0).to_vec();
        // Pull node 0 past its ring.
        let far = mesh.position(ring[0]).coords * 2.0 - mesh.position(0).coords;
        mesh.vertices[0].position = Point3::from(far.normalize() * 100.0);

        let count = crossover_check(&mesh, SurfaceHint::Sphere);
        assert!(count.tiles > 0);
        assert!(count.node_flags[0]);
        assert_eq!(count.nodes, count.node_flags.iter().filter(|&&f| f).count());
    }

    #[test]
    fn test_flat_flipped_tile() {
        let mesh = Mesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [1, 2, 3]],
        );
        let count = crossover_check(&mesh, SurfaceHint::Flat);
        assert_eq!(count.tiles, 1);
        assert_eq!(count.nodes, 3);
        assert!(!count.node_flags[0]);
    }
}
