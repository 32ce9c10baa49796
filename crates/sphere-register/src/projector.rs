//! Barycentric point projection onto a triangulated surface.
//!
//! A [`PointProjector`] is built once against a reference mesh. Queries
//! find the node nearest to the point through a KD-tree, then test the tiles
//! around that node and, failing that, the tiles around its neighbours. A hit
//! yields the tile, its three nodes and normalized barycentric weights, which
//! can be replayed against a second embedding of the same topology with
//! [`unproject_point`].
//!
//! # Surface hints
//!
//! - [`SurfaceHint::Sphere`]: the query is the intersection of the ray from
//!   the origin through the point with the tile plane.
//! - [`SurfaceHint::Flat`]: the mesh lies in z = 0; areas are taken in 2D.
//! - [`SurfaceHint::Other`]: the point is dropped orthogonally onto the tile
//!   plane. A mesh whose nodes all have z = 0 is treated as flat.

use hashbrown::HashSet;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{Mesh, Triangle};

/// Tiles whose signed sub-areas are all above this value still count as a hit.
const AREA_TOLERANCE: f64 = -0.01;

/// A query closer than this to the nearest node snaps onto it.
const NEAREST_NODE_TOLERANCE: f64 = 0.01;

/// Shape of the surface, used to pick the projection geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceHint {
    Sphere,
    Flat,
    Other,
}

/// How a projection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionStatus {
    /// Strictly inside a tile.
    Inside,
    /// On an edge or vertex of a tile, within the area tolerance.
    Degenerate,
    /// No tile matched but the point sits on the nearest node.
    OnNode,
    /// No tile matched.
    NotFound,
}

/// Result of [`PointProjector::project_barycentric`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Tile that contains the point.
    pub tile: Option<usize>,
    /// Nodes of the tile (all equal to the nearest node for [`ProjectionStatus::OnNode`]).
    pub nodes: [usize; 3],
    /// Barycentric weights summing to one; `weights[i]` belongs to `nodes[i]`.
    pub weights: [f64; 3],
    /// Nearest connected node, if the mesh has any.
    pub nearest_node: Option<usize>,
    pub status: ProjectionStatus,
}

impl Projection {
    fn not_found(nearest_node: Option<usize>) -> Self {
        Self {
            tile: None,
            nodes: [0; 3],
            weights: [0.0; 3],
            nearest_node,
            status: ProjectionStatus::NotFound,
        }
    }

    /// True if the point landed in a tile.
    #[inline]
    pub fn is_found(&self) -> bool {
        self.tile.is_some()
    }

    /// True if the nodes/weights describe a usable position.
    #[inline]
    pub fn is_located(&self) -> bool {
        self.tile.is_some() || self.status == ProjectionStatus::OnNode
    }

    /// Map the projection through another embedding of the same mesh.
    ///
    /// Falls back to the nearest node when no tile was found; `None` if the
    /// mesh had no connected node at all.
    pub fn unproject(&self, coords: &[Point3<f64>]) -> Option<Point3<f64>> {
        if self.is_located() {
            Some(unproject_point(&self.nodes, &self.weights, coords))
        } else {
            self.nearest_node.map(|n| coords[n])
        }
    }
}

/// Bounded perturb-and-retry policy for failed projections.
///
/// Each retry shifts the query point by `epsilon` along every axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: usize,
    /// Per-axis shift applied before each retry.
    pub epsilon: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            epsilon: 0.001,
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(attempts: usize, epsilon: f64) -> Self {
        Self { attempts, epsilon }
    }

    /// Set the number of attempts.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the per-axis shift.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Nearest-node and tile search against one reference mesh.
#[derive(Debug, Clone)]
pub struct PointProjector {
    hint: SurfaceHint,
    locator: NodeLocator,
    node_tiles: Vec<Vec<usize>>,
}

impl PointProjector {
    /// Build a projector for `mesh`.
    ///
    /// Only nodes used by at least one tile can be found as nearest nodes.
    pub fn new(mesh: &Mesh, hint: SurfaceHint) -> Self {
        let hint = match hint {
            SurfaceHint::Other if mesh.vertices.iter().all(|v| v.position.z == 0.0) => {
                SurfaceHint::Flat
            }
            other => other,
        };

        let mut node_tiles: Vec<Vec<usize>> = vec![Vec::new(); mesh.node_count()];
        for (t, tile) in mesh.tiles().iter().enumerate() {
            for &v in tile {
                node_tiles[v as usize].push(t);
            }
        }

        let connected: Vec<(usize, Point3<f64>)> = node_tiles
            .iter()
            .enumerate()
            .filter(|(_, tiles)| !tiles.is_empty())
            .map(|(n, _)| (n, mesh.position(n)))
            .collect();

        let locator = NodeLocator::build(hint, &connected);

        debug!(
            nodes = connected.len(),
            hint = ?hint,
            "Built point projector"
        );

        Self {
            hint,
            locator,
            node_tiles,
        }
    }

    /// Effective surface hint after flat detection.
    #[inline]
    pub fn hint(&self) -> SurfaceHint {
        self.hint
    }

    /// Nearest connected node to `p`.
    pub fn project_to_nearest_node(&self, p: &Point3<f64>) -> Option<usize> {
        self.locator.nearest(p)
    }

    /// Keep the projector in step with [`Mesh::split_tile`].
    ///
    /// `mesh` must already contain the split: `tile` is `(v1, v2, node)` and
    /// `new_tiles` are `(v2, v3, node)` and `(v3, v1, node)`.
    pub fn record_split(&mut self, mesh: &Mesh, tile: usize, new_tiles: [usize; 2], node: usize) {
        let [v1, v2, _] = mesh.tile(tile);
        let [_, v3, _] = mesh.tile(new_tiles[0]);

        if self.node_tiles.len() <= node {
            self.node_tiles.resize(node + 1, Vec::new());
        }
        self.node_tiles[v3].retain(|&t| t != tile);
        self.node_tiles[v3].extend_from_slice(&new_tiles);
        self.node_tiles[v1].push(new_tiles[1]);
        self.node_tiles[v2].push(new_tiles[0]);
        self.node_tiles[node] = vec![tile, new_tiles[0], new_tiles[1]];

        self.locator.insert(node, mesh.position(node));
    }

    /// Find the tile containing `p` and its barycentric weights.
    pub fn project_barycentric(&self, mesh: &Mesh, p: &Point3<f64>) -> Projection {
        let Some(nearest) = self.locator.nearest(p) else {
            return Projection::not_found(None);
        };

        let mut search = TileSearch::default();
        self.check_node_tiles(mesh, p, nearest, &mut search);

        if search.status() != ProjectionStatus::Inside {
            for neighbor in self.node_neighbors(mesh, nearest) {
                self.check_node_tiles(mesh, p, neighbor, &mut search);
                if search.status() == ProjectionStatus::Inside {
                    break;
                }
            }
        }

        if let Some(hit) = search.best {
            return Projection {
                tile: Some(hit.tile),
                nodes: hit.nodes,
                weights: hit.weights,
                nearest_node: Some(nearest),
                status: hit.status,
            };
        }

        if (p - mesh.position(nearest)).norm() <= NEAREST_NODE_TOLERANCE {
            trace!(node = nearest, "Point is on nearest node");
            return Projection {
                tile: None,
                nodes: [nearest; 3],
                weights: [1.0, 0.0, 0.0],
                nearest_node: Some(nearest),
                status: ProjectionStatus::OnNode,
            };
        }

        Projection::not_found(Some(nearest))
    }

    /// Project, shifting the point by `policy.epsilon` per axis after each
    /// miss. Returns the projection and the point that finally landed.
    pub fn project_with_retry(
        &self,
        mesh: &Mesh,
        p: &Point3<f64>,
        policy: &RetryPolicy,
    ) -> Option<(Projection, Point3<f64>)> {
        let shift = Vector3::repeat(policy.epsilon);
        let mut query = *p;
        for attempt in 0..policy.attempts.max(1) {
            if attempt > 0 {
                query += shift;
                debug!(attempt, x = query.x, y = query.y, z = query.z, "Retrying projection");
            }
            let projection = self.project_barycentric(mesh, &query);
            if projection.is_found() {
                return Some((projection, query));
            }
        }
        None
    }

    fn node_neighbors(&self, mesh: &Mesh, node: usize) -> Vec<usize> {
        let mut neighbors = Vec::new();
        for &t in self.node_tiles.get(node).map_or(&[][..], Vec::as_slice) {
            for v in mesh.tile(t) {
                if v != node && !neighbors.contains(&v) {
                    neighbors.push(v);
                }
            }
        }
        neighbors
    }

    fn check_node_tiles(&self, mesh: &Mesh, p: &Point3<f64>, node: usize, search: &mut TileSearch) {
        let Some(tiles) = self.node_tiles.get(node) else {
            return;
        };
        for &t in tiles {
            if !search.searched.insert(t) {
                continue;
            }
            if let Some(hit) = self.check_tile(mesh, p, t) {
                let inside = hit.status == ProjectionStatus::Inside;
                if inside || search.best.is_none() {
                    search.best = Some(hit);
                }
                if inside {
                    return;
                }
            }
        }
    }

    fn check_tile(&self, mesh: &Mesh, p: &Point3<f64>, tile: usize) -> Option<TileHit> {
        let nodes = mesh.tile(tile);
        let tri = Triangle::new(
            mesh.position(nodes[0]),
            mesh.position(nodes[1]),
            mesh.position(nodes[2]),
        );

        let (normal, q) = match self.hint {
            SurfaceHint::Flat => (Vector3::z(), Point3::new(p.x, p.y, 0.0)),
            SurfaceHint::Sphere => {
                let normal = tri.normal_unnormalized();
                let denom = normal.dot(&p.coords);
                if denom.abs() <= f64::EPSILON {
                    return None;
                }
                let t = normal.dot(&tri.v0.coords) / denom;
                if t <= 0.0 {
                    return None;
                }
                (normal, Point3::from(p.coords * t))
            }
            SurfaceHint::Other => {
                let normal = tri.normal()?;
                let q = p - normal * (p - tri.v0).dot(&normal);
                (normal, q)
            }
        };

        let a3 = Triangle::new(tri.v0, tri.v1, q).signed_area(&normal);
        if a3 < AREA_TOLERANCE {
            return None;
        }
        let a1 = Triangle::new(tri.v1, tri.v2, q).signed_area(&normal);
        if a1 < AREA_TOLERANCE {
            return None;
        }
        let a2 = Triangle::new(tri.v2, tri.v0, q).signed_area(&normal);
        if a2 < AREA_TOLERANCE {
            return None;
        }

        let status = if a1 > 0.0 && a2 > 0.0 && a3 > 0.0 {
            ProjectionStatus::Inside
        } else {
            ProjectionStatus::Degenerate
        };

        let areas = [a1.abs(), a2.abs(), a3.abs()];
        let total: f64 = areas.iter().sum();
        let weights = if tri.area() > 0.0 && total > 0.0 {
            areas.map(|a| a / total)
        } else {
            [1.0, 0.0, 0.0]
        };

        Some(TileHit {
            tile,
            nodes,
            weights,
            status,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct TileHit {
    tile: usize,
    nodes: [usize; 3],
    weights: [f64; 3],
    status: ProjectionStatus,
}

#[derive(Debug, Default)]
struct TileSearch {
    searched: HashSet<usize>,
    best: Option<TileHit>,
}

impl TileSearch {
    fn status(&self) -> ProjectionStatus {
        self.best
            .map_or(ProjectionStatus::NotFound, |hit| hit.status)
    }
}

/// Interpolate a barycentric position through another embedding.
///
/// `weights[i]` belongs to `nodes[i]`. A zero total weight returns the
/// first node's coordinate.
pub fn unproject_point(nodes: &[usize; 3], weights: &[f64; 3], coords: &[Point3<f64>]) -> Point3<f64> {
    let total: f64 = weights.iter().sum();
    if total == 0.0 {
        return coords[nodes[0]];
    }
    let sum = coords[nodes[0]].coords * weights[0]
        + coords[nodes[1]].coords * weights[1]
        + coords[nodes[2]].coords * weights[2];
    Point3::from(sum / total)
}

/// Axis-aligned node layouts (canonical spheres, flat grids) put many nodes on
/// the same split value, which the KD-tree buckets cannot hold. Keys are taken
/// in this rotated frame instead; distances are unchanged.
const KEY_FRAME: (f64, f64, f64) = (0.318, 0.671, 1.137);

/// KD-tree over the connected nodes. Flat meshes are indexed in the plane.
#[derive(Debug, Clone)]
struct NodeLocator {
    frame: Rotation3<f64>,
    tree: NodeTree,
    len: usize,
}

#[derive(Debug, Clone)]
enum NodeTree {
    Space(KdTree<f64, 3>),
    Plane(KdTree<f64, 2>),
}

impl NodeLocator {
    fn build(hint: SurfaceHint, points: &[(usize, Point3<f64>)]) -> Self {
        let (roll, pitch, yaw) = KEY_FRAME;
        let (frame, tree) = match hint {
            SurfaceHint::Flat => (
                Rotation3::from_axis_angle(&Vector3::z_axis(), yaw),
                NodeTree::Plane(KdTree::with_capacity(points.len())),
            ),
            SurfaceHint::Sphere | SurfaceHint::Other => (
                Rotation3::from_euler_angles(roll, pitch, yaw),
                NodeTree::Space(KdTree::with_capacity(points.len())),
            ),
        };
        let mut locator = Self { frame, tree, len: 0 };
        for &(node, p) in points {
            locator.insert(node, p);
        }
        locator
    }

    fn insert(&mut self, node: usize, p: Point3<f64>) {
        let key = self.frame * p;
        match &mut self.tree {
            NodeTree::Space(tree) => tree.add(&[key.x, key.y, key.z], node as u64),
            NodeTree::Plane(tree) => tree.add(&[key.x, key.y], node as u64),
        }
        self.len += 1;
    }

    fn nearest(&self, p: &Point3<f64>) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let key = self.frame * p;
        let item = match &self.tree {
            NodeTree::Space(tree) => tree.nearest_one::<SquaredEuclidean>(&[key.x, key.y, key.z]).item,
            NodeTree::Plane(tree) => tree.nearest_one::<SquaredEuclidean>(&[key.x, key.y]).item,
        };
        Some(item as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphere::regular_sphere;

    fn flat_square() -> Mesh {
        Mesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(10.0, 0.0, 0.0),
                Point3::new(10.0, 10.0, 0.0),
                Point3::new(0.0, 10.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn test_flat_detection() {
        let mesh = flat_square();
        let projector = PointProjector::new(&mesh, SurfaceHint::Other);
        assert_eq!(projector.hint(), SurfaceHint::Flat);
    }

    #[test]
    fn test_flat_projection_weights() {
        let mesh = flat_square();
        let projector = PointProjector::new(&mesh, SurfaceHint::Flat);
        let p = Point3::new(6.0, 2.0, 0.0);
        let projection = projector.project_barycentric(&mesh, &p);

        assert_eq!(projection.tile, Some(0));
        assert_eq!(projection.status, ProjectionStatus::Inside);
        let sum: f64 = projection.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);

        let back = unproject_point(&projection.nodes, &projection.weights, &mesh.positions());
        assert!((back - p).norm() < 1e-9);
    }

    #[test]
    fn test_self_projection_on_sphere() {
        let mesh = regular_sphere(2, 100.0);
        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        for n in (0..mesh.node_count()).step_by(7) {
            let projection = projector.project_barycentric(&mesh, &mesh.position(n));
            assert!(projection.is_located());
            let i = projection.nodes.iter().position(|&v| v == n).unwrap();
            assert!((projection.weights[i] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_sphere_projection_follows_ray() {
        let mesh = regular_sphere(1, 100.0);
        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        let p = Point3::new(30.0, 40.0, 86.0);
        let projection = projector.project_barycentric(&mesh, &p);
        assert!(projection.is_found());

        let q = unproject_point(&projection.nodes, &projection.weights, &mesh.positions());
        let cos = q.coords.normalize().dot(&p.coords.normalize());
        assert!((cos - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_outside_flat_mesh() {
        let mesh = flat_square();
        let projector = PointProjector::new(&mesh, SurfaceHint::Flat);
        let projection = projector.project_barycentric(&mesh, &Point3::new(50.0, 50.0, 0.0));
        assert!(!projection.is_found());
        assert_eq!(projection.status, ProjectionStatus::NotFound);
        assert_eq!(projection.nearest_node, Some(2));
        let retried =
            projector.project_with_retry(&mesh, &Point3::new(50.0, 50.0, 0.0), &RetryPolicy::default());
        assert!(retried.is_none());
    }

    #[test]
    fn test_empty_mesh() {
        let mesh = Mesh::new();
        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        let projection = projector.project_barycentric(&mesh, &Point3::new(1.0, 0.0, 0.0));
        assert_eq!(projection.nearest_node, None);
        assert!(projection.unproject(&[]).is_none());
    }

    #[test]
    fn test_nearest_node_matches_brute_force() {
        let mesh = regular_sphere(2, 50.0);
        let projector = PointProjector::new(&mesh, SurfaceHint::Other);
        for k in 0..40 {
            let t = k as f64 * 0.37;
            let p = Point3::new(t.cos() * 40.0, t.sin() * 30.0, (t * 0.5).sin() * 45.0);
            let found = projector.project_to_nearest_node(&p).unwrap();
            let best = (0..mesh.node_count())
                .min_by(|&a, &b| {
                    (mesh.position(a) - p)
                        .norm()
                        .total_cmp(&(mesh.position(b) - p).norm())
                })
                .unwrap();
            let d_found = (mesh.position(found) - p).norm();
            let d_best = (mesh.position(best) - p).norm();
            assert!(d_found <= d_best + 1e-9, "{} vs {}", d_found, d_best);
        }
    }

    #[test]
    fn test_nodes_found_near_themselves() {
        let mesh = regular_sphere(2, 50.0);
        let projector = PointProjector::new(&mesh, SurfaceHint::Sphere);
        for n in 0..mesh.node_count() {
            let p = mesh.position(n) + Vector3::repeat(0.001);
            assert_eq!(projector.project_to_nearest_node(&p), Some(n));
        }
    }

    #[test]
    fn test_record_split_keeps_projector_current() {
        let mut mesh = flat_square();
        let mut projector = PointProjector::new(&mesh, SurfaceHint::Flat);

        let p = Point3::new(6.0, 2.0, 0.0);
        let tile = projector.project_barycentric(&mesh, &p).tile.unwrap();
        let node = mesh.split_tile(tile, p);
        let count = mesh.tile_count();
        projector.record_split(&mesh, tile, [count - 2, count - 1], node);

        assert_eq!(projector.project_to_nearest_node(&p), Some(node));
        let q = Point3::new(7.0, 1.0, 0.0);
        let projection = projector.project_barycentric(&mesh, &q);
        assert!(projection.is_found());
        assert!(projection.nodes.contains(&node));
        let back = unproject_point(&projection.nodes, &projection.weights, &mesh.positions());
        assert!((back - q).norm() < 1e-9);
    }

    #[test]
    fn test_unproject_zero_weights() {
        let coords = vec![Point3::new(1.0, 2.0, 3.0), Point3::new(4.0, 5.0, 6.0)];
        let p = unproject_point(&[1, 0, 0], &[0.0, 0.0, 0.0], &coords);
        assert_eq!(p, coords[1]);
    }
}
