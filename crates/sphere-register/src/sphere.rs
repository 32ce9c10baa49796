//! Canonical regular-tessellation spheres.
//!
//! The registration pipeline rebuilds its deformation spheres at a fixed set
//! of resolutions. [`GeneratedSphereLibrary`] builds them on the fly: a
//! dodecahedron whose pentagons are fan-triangulated gives the 20-node base
//! sphere, and each further resolution is a 1:4 subdivision of the previous
//! one pushed back onto the sphere, so node counts follow
//! `N(k+1) = 4 N(k) - 6`.
//!
//! [`DirectorySphereLibrary`] loads the same spheres from mesh files instead.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::error::{RegisterError, RegisterResult};
use crate::io::{MeshFormat, load_mesh};
use crate::types::Mesh;

/// Node counts of the available canonical spheres.
pub const SPHERE_RESOLUTIONS: [usize; 7] = [20, 74, 290, 1154, 4610, 18434, 73730];

/// Radius of generated spheres.
pub const CANONICAL_RADIUS: f64 = 100.0;

/// Source of canonical spheres, keyed by node count.
pub trait SphereLibrary {
    /// Load the canonical sphere with `resolution` nodes.
    fn load(&self, resolution: usize) -> RegisterResult<Mesh>;

    /// True if `resolution` can be loaded.
    fn supports(&self, resolution: usize) -> bool {
        SPHERE_RESOLUTIONS.contains(&resolution)
    }
}

/// Spheres generated in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratedSphereLibrary;

impl SphereLibrary for GeneratedSphereLibrary {
    fn load(&self, resolution: usize) -> RegisterResult<Mesh> {
        let level = SPHERE_RESOLUTIONS
            .iter()
            .position(|&r| r == resolution)
            .ok_or_else(|| RegisterError::invalid_resolution(resolution))?;
        let mesh = regular_sphere(level, CANONICAL_RADIUS);
        if mesh.node_count() != resolution {
            return Err(RegisterError::node_count_mismatch(
                format!("generated sphere level {level}"),
                resolution,
                mesh.node_count(),
            ));
        }
        Ok(mesh)
    }
}

/// Spheres stored as `sphere.<N>.obj` or `sphere.<N>.ply` in a directory.
#[derive(Debug, Clone)]
pub struct DirectorySphereLibrary {
    dir: PathBuf,
}

impl DirectorySphereLibrary {
    /// Library rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory searched for sphere files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, resolution: usize) -> Option<PathBuf> {
        [MeshFormat::Obj, MeshFormat::Ply]
            .iter()
            .map(|format| {
                self.dir
                    .join(format!("sphere.{}.{}", resolution, format.extension()))
            })
            .find(|path| path.is_file())
    }
}

impl SphereLibrary for DirectorySphereLibrary {
    fn load(&self, resolution: usize) -> RegisterResult<Mesh> {
        if !SPHERE_RESOLUTIONS.contains(&resolution) {
            return Err(RegisterError::invalid_resolution(resolution));
        }
        let path = self.path_for(resolution).ok_or_else(|| {
            RegisterError::io_read(
                self.dir.join(format!("sphere.{}.obj", resolution)),
                std::io::Error::new(std::io::ErrorKind::NotFound, "sphere file not found"),
            )
        })?;
        let mesh = load_mesh(&path)?;
        if mesh.node_count() != resolution {
            return Err(RegisterError::node_count_mismatch(
                path.display().to_string(),
                resolution,
                mesh.node_count(),
            ));
        }
        Ok(mesh)
    }

    fn supports(&self, resolution: usize) -> bool {
        SPHERE_RESOLUTIONS.contains(&resolution) && self.path_for(resolution).is_some()
    }
}

/// Regular sphere after `level` subdivisions of the base dodecahedron.
pub fn regular_sphere(level: usize, radius: f64) -> Mesh {
    let (mut positions, mut tiles) = dodecahedron();
    for _ in 0..level {
        subdivide(&mut positions, &mut tiles);
    }
    debug!(
        level,
        nodes = positions.len(),
        tiles = tiles.len(),
        "Generated regular sphere"
    );

    let mut mesh = Mesh::from_parts(positions, tiles);
    mesh.project_to_sphere(radius);
    mesh.compute_normals();
    mesh
}

/// Unit dodecahedron with each pentagon split into a three-tile fan.
fn dodecahedron() -> (Vec<Point3<f64>>, Vec<[u32; 3]>) {
    let phi = (1.0 + 5f64.sqrt()) / 2.0;
    let inv = 1.0 / phi;

    let mut positions = Vec::with_capacity(20);
    for x in [-1.0, 1.0] {
        for y in [-1.0, 1.0] {
            for z in [-1.0, 1.0] {
                positions.push(Vector3::new(x, y, z));
            }
        }
    }
    for a in [-1.0, 1.0] {
        for b in [-1.0, 1.0] {
            positions.push(Vector3::new(0.0, a * inv, b * phi));
            positions.push(Vector3::new(a * inv, b * phi, 0.0));
            positions.push(Vector3::new(a * phi, 0.0, b * inv));
        }
    }
    let positions: Vec<Vector3<f64>> = positions.into_iter().map(|p| p.normalize()).collect();

    // Pentagon centers are the icosahedron's vertex directions.
    let mut centers = Vec::with_capacity(12);
    for a in [-1.0, 1.0] {
        for b in [-1.0, 1.0] {
            centers.push(Vector3::new(0.0, a * phi, b));
            centers.push(Vector3::new(a, 0.0, b * phi));
            centers.push(Vector3::new(a * phi, b, 0.0));
        }
    }

    let mut tiles = Vec::with_capacity(36);
    for center in centers {
        let d = center.normalize();
        let mut nearest: Vec<(usize, f64)> = positions
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.dot(&d)))
            .collect();
        nearest.sort_by(|a, b| b.1.total_cmp(&a.1));
        nearest.truncate(5);

        // Angle around d; increasing angle is counter-clockwise from outside.
        let seed = if d.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        let u = (seed - d * seed.dot(&d)).normalize();
        let w = d.cross(&u);
        let mut pentagon: Vec<(usize, f64)> = nearest
            .into_iter()
            .map(|(i, _)| (i, positions[i].dot(&w).atan2(positions[i].dot(&u))))
            .collect();
        pentagon.sort_by(|a, b| a.1.total_cmp(&b.1));

        let p: Vec<u32> = pentagon.iter().map(|&(i, _)| i as u32).collect();
        tiles.push([p[0], p[1], p[2]]);
        tiles.push([p[0], p[2], p[3]]);
        tiles.push([p[0], p[3], p[4]]);
    }

    (positions.into_iter().map(Point3::from).collect(), tiles)
}

/// Split every tile into four, placing new nodes on the unit sphere.
fn subdivide(positions: &mut Vec<Point3<f64>>, tiles: &mut Vec<[u32; 3]>) {
    let mut midpoints: HashMap<(u32, u32), u32> = HashMap::new();
    let mut midpoint = |a: u32, b: u32, positions: &mut Vec<Point3<f64>>| -> u32 {
        let key = if a < b { (a, b) } else { (b, a) };
        *midpoints.entry(key).or_insert_with(|| {
            let m = (positions[a as usize].coords + positions[b as usize].coords).normalize();
            positions.push(Point3::from(m));
            (positions.len() - 1) as u32
        })
    };

    let mut next = Vec::with_capacity(tiles.len() * 4);
    for &[a, b, c] in tiles.iter() {
        let ab = midpoint(a, b, positions);
        let bc = midpoint(b, c, positions);
        let ca = midpoint(c, a, positions);
        next.push([a, ab, ca]);
        next.push([ab, b, bc]);
        next.push([ca, bc, c]);
        next.push([ab, bc, ca]);
    }
    *tiles = next;
}
