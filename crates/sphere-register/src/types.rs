//! Core mesh data types.
//!
//! A [`Mesh`] is an arena of nodes addressed by stable integer indices plus a
//! list of triangular tiles. Nodes are append-only: once a node has an index
//! it keeps it for the lifetime of the mesh. Tiles may be rewritten in place,
//! which is how border tessellation splits a tile around an inserted node.
//!
//! Neighbour information lives in a derived [`Topology`] that is computed on
//! first use and dropped whenever a node or tile changes.

use std::ops::Range;
use std::sync::{Arc, OnceLock};

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::topology::Topology;

/// A node of the mesh.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// 3D position.
    pub position: Point3<f64>,

    /// Unit normal vector, computed from adjacent tiles.
    ///
    /// Refreshed by [`Mesh::compute_normals`]; it goes stale when the
    /// position changes.
    pub normal: Option<Vector3<f64>>,
}

impl Vertex {
    /// Create a new vertex with only position set.
    #[inline]
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
        }
    }

    /// Create a vertex from raw coordinates.
    #[inline]
    pub fn from_coords(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z))
    }
}

/// A triangle mesh with indexed nodes and tiles.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    /// Node data. Index = node id.
    ///
    /// Positions may be edited in place. No position edit, here or through
    /// the setters below, refreshes normals: call [`Mesh::compute_normals`]
    /// once the edits are done. Adding or removing entries bypasses the
    /// topology cache, so grow the mesh with [`Mesh::add_node`] instead.
    pub vertices: Vec<Vertex>,

    /// Tiles as indices into the vertex array, counter-clockwise seen from
    /// outside.
    tiles: Vec<[u32; 3]>,

    topology: OnceLock<Arc<Topology>>,
}

impl Mesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mesh with pre-allocated capacity.
    pub fn with_capacity(node_count: usize, tile_count: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(node_count),
            tiles: Vec::with_capacity(tile_count),
            topology: OnceLock::new(),
        }
    }

    /// Build a mesh from positions and tiles.
    ///
    /// # Panics
    /// Panics if a tile references a node that does not exist.
    pub fn from_parts(positions: Vec<Point3<f64>>, tiles: Vec<[u32; 3]>) -> Self {
        let mut mesh = Self::with_capacity(positions.len(), tiles.len());
        mesh.vertices = positions.into_iter().map(Vertex::new).collect();
        for tile in tiles {
            mesh.add_tile(tile.map(|n| n as usize));
        }
        mesh
    }

    /// Number of nodes in the mesh.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of tiles in the mesh.
    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Check if mesh is empty (no nodes or tiles).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.tiles.is_empty()
    }

    /// All tiles.
    #[inline]
    pub fn tiles(&self) -> &[[u32; 3]] {
        &self.tiles
    }

    /// Node indices of one tile.
    #[inline]
    pub fn tile(&self, index: usize) -> [usize; 3] {
        let [a, b, c] = self.tiles[index];
        [a as usize, b as usize, c as usize]
    }

    /// Position of one node.
    #[inline]
    pub fn position(&self, node: usize) -> Point3<f64> {
        self.vertices[node].position
    }

    /// Copy of every node position, in node order.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.vertices.iter().map(|v| v.position).collect()
    }

    /// Overwrite every node position. Normals are left as they were.
    ///
    /// # Panics
    /// Panics if the slice length differs from the node count.
    pub fn set_positions(&mut self, positions: &[Point3<f64>]) {
        assert_eq!(
            positions.len(),
            self.vertices.len(),
            "position count must match node count"
        );
        for (vertex, p) in self.vertices.iter_mut().zip(positions) {
            vertex.position = *p;
        }
    }

    /// Append a node and return its index.
    pub fn add_node(&mut self, position: Point3<f64>) -> usize {
        self.vertices.push(Vertex::new(position));
        self.invalidate_topology();
        self.vertices.len() - 1
    }

    /// Replace the tile at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range or a node index is not `< node_count`.
    pub fn set_tile(&mut self, index: usize, nodes: [usize; 3]) {
        let tile = self.checked_tile(nodes);
        self.tiles[index] = tile;
        self.invalidate_topology();
    }

    /// Append a tile and return its index.
    ///
    /// # Panics
    /// Panics if a node index is not `< node_count`.
    pub fn add_tile(&mut self, nodes: [usize; 3]) -> usize {
        let tile = self.checked_tile(nodes);
        self.tiles.push(tile);
        self.invalidate_topology();
        self.tiles.len() - 1
    }

    fn checked_tile(&self, nodes: [usize; 3]) -> [u32; 3] {
        let count = self.vertices.len();
        for &n in &nodes {
            assert!(
                n < count,
                "tile references node {} but the mesh has {} nodes",
                n,
                count
            );
        }
        [nodes[0] as u32, nodes[1] as u32, nodes[2] as u32]
    }

    fn invalidate_topology(&mut self) {
        self.topology = OnceLock::new();
    }

    /// Neighbour lists for this mesh, computed on first use.
    pub fn topology(&self) -> Arc<Topology> {
        self.topology
            .get_or_init(|| Arc::new(Topology::build(self.vertices.len(), &self.tiles)))
            .clone()
    }

    /// Insert a node at `position` inside `tile`.
    ///
    /// Tile `(v1, v2, v3)` becomes `(v1, v2, n)` in place and `(v2, v3, n)`,
    /// `(v3, v1, n)` are appended. Returns the new node index; the two new
    /// tiles are the last two in the tile list.
    pub fn split_tile(&mut self, tile: usize, position: Point3<f64>) -> usize {
        let [v1, v2, v3] = self.tile(tile);
        let node = self.add_node(position);
        self.set_tile(tile, [v1, v2, node]);
        self.add_tile([v2, v3, node]);
        self.add_tile([v3, v1, node]);
        node
    }

    /// Distance of the first connected node from the origin.
    ///
    /// Returns 0.0 when no node has a neighbour.
    pub fn spherical_radius(&self) -> f64 {
        let topology = self.topology();
        (0..self.node_count())
            .find(|&n| topology.has_neighbors(n))
            .map(|n| self.vertices[n].position.coords.norm())
            .unwrap_or(0.0)
    }

    /// Push every node onto the sphere of the given radius.
    pub fn project_to_sphere(&mut self, radius: f64) {
        let count = self.node_count();
        self.project_range_to_sphere(radius, 0..count);
    }

    /// Push the nodes in `range` onto the sphere of the given radius.
    ///
    /// Nodes at the origin have no direction and are left alone.
    pub fn project_range_to_sphere(&mut self, radius: f64, range: Range<usize>) {
        for vertex in &mut self.vertices[range] {
            let len = vertex.position.coords.norm();
            if len > 0.0 {
                vertex.position.coords *= radius / len;
            }
        }
    }

    /// Recompute node normals as the area-weighted average of incident
    /// tile normals. Isolated nodes get no normal.
    pub fn compute_normals(&mut self) {
        let mut sums = vec![Vector3::zeros(); self.vertices.len()];
        for &[a, b, c] in &self.tiles {
            let tri = Triangle::new(
                self.vertices[a as usize].position,
                self.vertices[b as usize].position,
                self.vertices[c as usize].position,
            );
            let n = tri.normal_unnormalized();
            sums[a as usize] += n;
            sums[b as usize] += n;
            sums[c as usize] += n;
        }
        for (vertex, sum) in self.vertices.iter_mut().zip(sums) {
            let len = sum.norm();
            vertex.normal = (len > f64::EPSILON).then(|| sum / len);
        }
    }

    /// Compute the axis-aligned bounding box.
    /// Returns (min_corner, max_corner) or None if mesh has no nodes.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.vertices.first()?.position;
        let mut min = first;
        let mut max = first;

        for vertex in &self.vertices[1..] {
            let p = &vertex.position;
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        Some((min, max))
    }

    /// Iterate over tiles, yielding Triangle structs with actual positions.
    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.tiles.iter().map(|&[i0, i1, i2]| Triangle {
            v0: self.vertices[i0 as usize].position,
            v1: self.vertices[i1 as usize].position,
            v2: self.vertices[i2 as usize].position,
        })
    }

    /// Get a specific triangle by tile index.
    pub fn triangle(&self, tile: usize) -> Option<Triangle> {
        self.tiles.get(tile).map(|&[i0, i1, i2]| Triangle {
            v0: self.vertices[i0 as usize].position,
            v1: self.vertices[i1 as usize].position,
            v2: self.vertices[i2 as usize].position,
        })
    }

    /// Area of every tile, in tile order.
    pub fn tile_areas(&self) -> Vec<f64> {
        self.tiles
            .par_iter()
            .map(|&[i0, i1, i2]| {
                Triangle::new(
                    self.vertices[i0 as usize].position,
                    self.vertices[i1 as usize].position,
                    self.vertices[i2 as usize].position,
                )
                .area()
            })
            .collect()
    }

    /// Total surface area of the mesh.
    pub fn surface_area(&self) -> f64 {
        self.triangles().map(|tri| tri.area()).sum()
    }

    /// Translate mesh by the given vector.
    pub fn translate(&mut self, offset: Vector3<f64>) {
        for vertex in &mut self.vertices {
            vertex.position += offset;
        }
    }

    /// Scale mesh uniformly around the origin.
    pub fn scale(&mut self, factor: f64) {
        for vertex in &mut self.vertices {
            vertex.position.coords *= factor;
        }
    }

    /// Mirror the mesh through the YZ plane.
    ///
    /// Tile winding is left as is, so the mirrored surface is seen
    /// clockwise from outside.
    pub fn negate_x(&mut self) {
        for vertex in &mut self.vertices {
            vertex.position.x = -vertex.position.x;
            if let Some(normal) = vertex.normal.as_mut() {
                normal.x = -normal.x;
            }
        }
    }

    /// Reverse the winding of every tile.
    pub fn reverse_winding(&mut self) {
        for tile in &mut self.tiles {
            tile.swap(1, 2);
        }
        self.invalidate_topology();
    }

    /// Immutable copy of the current positions and tiles.
    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            positions: self.positions().into(),
            tiles: self.tiles.clone().into(),
        }
    }
}

/// Frozen copy of a mesh taken at a checkpoint.
///
/// Cheap to clone; later edits to the working mesh never show through.
#[derive(Debug, Clone)]
pub struct MeshSnapshot {
    positions: Arc<[Point3<f64>]>,
    tiles: Arc<[[u32; 3]]>,
}

impl MeshSnapshot {
    /// Number of nodes captured.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.positions.len()
    }

    /// Captured node positions.
    #[inline]
    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    /// Position of one node.
    #[inline]
    pub fn position(&self, node: usize) -> Point3<f64> {
        self.positions[node]
    }

    /// Captured tiles.
    #[inline]
    pub fn tiles(&self) -> &[[u32; 3]] {
        &self.tiles
    }

    /// Rebuild a working mesh from the snapshot.
    pub fn to_mesh(&self) -> Mesh {
        Mesh::from_parts(self.positions.to_vec(), self.tiles.to_vec())
    }
}

/// A triangle with concrete vertex positions.
///
/// Utility type for geometric calculations. Winding is counter-clockwise
/// when viewed from the front (normal points toward viewer).
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub v0: Point3<f64>,
    pub v1: Point3<f64>,
    pub v2: Point3<f64>,
}

impl Triangle {
    /// Create a new triangle from three points.
    #[inline]
    pub fn new(v0: Point3<f64>, v1: Point3<f64>, v2: Point3<f64>) -> Self {
        Self { v0, v1, v2 }
    }

    /// Compute the (unnormalized) normal via cross product.
    #[inline]
    pub fn normal_unnormalized(&self) -> Vector3<f64> {
        let e1 = self.v1 - self.v0;
        let e2 = self.v2 - self.v0;
        e1.cross(&e2)
    }

    /// Compute the unit normal.
    /// Returns None for degenerate triangles (zero area).
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let n = self.normal_unnormalized();
        let len_sq = n.norm_squared();
        if len_sq > f64::EPSILON * f64::EPSILON {
            Some(n / len_sq.sqrt())
        } else {
            None
        }
    }

    /// Compute the area of the triangle.
    #[inline]
    pub fn area(&self) -> f64 {
        self.normal_unnormalized().norm() * 0.5
    }

    /// Area signed by orientation against `reference`.
    ///
    /// Negative when the triangle winds clockwise seen from the side
    /// `reference` points to.
    #[inline]
    pub fn signed_area(&self, reference: &Vector3<f64>) -> f64 {
        let n = self.normal_unnormalized();
        let area = n.norm() * 0.5;
        if n.dot(reference) < 0.0 { -area } else { area }
    }

    /// Compute the centroid (center of mass).
    #[inline]
    pub fn centroid(&self) -> Point3<f64> {
        Point3::from((self.v0.coords + self.v1.coords + self.v2.coords) / 3.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    fn tetrahedron() -> Mesh {
        Mesh::from_parts(
            vec![
                Point3::new(1.0, 1.0, 1.0),
                Point3::new(1.0, -1.0, -1.0),
                Point3::new(-1.0, 1.0, -1.0),
                Point3::new(-1.0, -1.0, 1.0),
            ],
            vec![[0, 1, 2], [0, 3, 1], [0, 2, 3], [1, 3, 2]],
        )
    }

    #[test]
    fn test_triangle_area_and_normal() {
        let tri = Triangle::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        );
        assert!(approx_eq(tri.area(), 0.5));
        let n = tri.normal().unwrap();
        assert!(approx_eq(n.z, 1.0));
        assert!(approx_eq(tri.signed_area(&Vector3::z()), 0.5));
        assert!(approx_eq(tri.signed_area(&-Vector3::z()), -0.5));
    }

    #[test]
    fn test_degenerate_triangle_has_no_normal() {
        let tri = Triangle::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        );
        assert!(tri.normal().is_none());
        assert!(approx_eq(tri.area(), 0.0));
    }

    #[test]
    fn test_add_node_returns_index() {
        let mut mesh = Mesh::new();
        assert_eq!(mesh.add_node(Point3::origin()), 0);
        assert_eq!(mesh.add_node(Point3::new(1.0, 0.0, 0.0)), 1);
        assert_eq!(mesh.node_count(), 2);
    }

    #[test]
    #[should_panic(expected = "tile references node")]
    fn test_add_tile_out_of_range_panics() {
        let mut mesh = Mesh::new();
        mesh.add_node(Point3::origin());
        mesh.add_tile([0, 1, 2]);
    }

    #[test]
    fn test_split_tile() {
        let mut mesh = tetrahedron();
        let area_before = mesh.surface_area();
        let centroid = mesh.triangle(0).unwrap().centroid();

        let node = mesh.split_tile(0, centroid);
        assert_eq!(node, 4);
        assert_eq!(mesh.tile_count(), 6);
        assert_eq!(mesh.tile(0), [0, 1, 4]);
        assert_eq!(mesh.tile(4), [1, 2, 4]);
        assert_eq!(mesh.tile(5), [2, 0, 4]);
        assert!((mesh.surface_area() - area_before).abs() < 1e-9);
    }

    #[test]
    fn test_topology_invalidated_on_mutation() {
        let mut mesh = tetrahedron();
        assert_eq!(mesh.topology().neighbors(0).len(), 3);

        let centroid = mesh.triangle(0).unwrap().centroid();
        let node = mesh.split_tile(0, centroid);
        let topology = mesh.topology();
        assert_eq!(topology.neighbors(0).len(), 4);
        assert_eq!(topology.neighbors(node).len(), 3);
    }

    #[test]
    fn test_project_to_sphere() {
        let mut mesh = tetrahedron();
        mesh.project_to_sphere(100.0);
        for v in &mesh.vertices {
            assert!((v.position.coords.norm() - 100.0).abs() < 1e-9);
        }
        assert!((mesh.spherical_radius() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_project_range_only_touches_range() {
        let mut mesh = tetrahedron();
        mesh.project_range_to_sphere(10.0, 2..4);
        assert!((mesh.position(0).coords.norm() - 3f64.sqrt()).abs() < 1e-12);
        assert!((mesh.position(3).coords.norm() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_normals_point_outward() {
        let mut mesh = tetrahedron();
        mesh.compute_normals();
        for v in &mesh.vertices {
            let n = v.normal.unwrap();
            assert!(n.dot(&v.position.coords) > 0.0);
        }
    }

    #[test]
    fn test_normals_follow_positions_after_compute_normals() {
        let mut mesh = tetrahedron();
        mesh.compute_normals();
        let before = mesh.vertices[0].normal.unwrap();

        for vertex in &mut mesh.vertices {
            vertex.position.z *= 3.0;
        }
        assert_eq!(mesh.vertices[0].normal, Some(before));

        mesh.compute_normals();
        let after = mesh.vertices[0].normal.unwrap();
        assert!((after - before).norm() > 1e-3);
        for v in &mesh.vertices {
            assert!(v.normal.unwrap().dot(&v.position.coords) > 0.0);
        }
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut mesh = tetrahedron();
        let snapshot = mesh.snapshot();
        mesh.scale(2.0);
        assert!(approx_eq(snapshot.position(0).x, 1.0));
        assert!(approx_eq(mesh.position(0).x, 2.0));
        assert_eq!(snapshot.to_mesh().tile_count(), 4);
    }

    #[test]
    fn test_negate_x() {
        let mut mesh = tetrahedron();
        mesh.negate_x();
        assert!(approx_eq(mesh.position(0).x, -1.0));
        assert!(approx_eq(mesh.position(0).y, 1.0));
    }

    #[test]
    fn test_tile_areas_sum_to_surface_area() {
        let mesh = tetrahedron();
        let total: f64 = mesh.tile_areas().iter().sum();
        assert!(approx_eq(total, mesh.surface_area()));
    }
}
