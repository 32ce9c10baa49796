//! Fiducial/sphere areal distortion.
//!
//! Mapping a folded cortical surface to a sphere stretches some regions and
//! shrinks others. The ratio of a tile's fiducial area to its spherical area
//! measures that. The registration samples the ratio at every deformation
//! sphere node for both the target and the source and damps morphing where
//! the two disagree.

use nalgebra::Point3;
use rayon::prelude::*;
use tracing::debug;

use crate::projector::{PointProjector, SurfaceHint};
use crate::types::Mesh;

/// Fiducial area divided by spherical area, per tile of `sphere`.
///
/// Tiles with zero spherical area get 1.
///
/// # Panics
/// Panics if the two meshes have different node counts.
pub fn tile_distortion(fiducial: &Mesh, sphere: &Mesh) -> Vec<f64> {
    assert_eq!(
        fiducial.node_count(),
        sphere.node_count(),
        "fiducial and spherical surfaces must share nodes"
    );
    let fiducial_coords = fiducial.positions();
    sphere
        .tiles()
        .par_iter()
        .enumerate()
        .map(|(t, _)| {
            let sphere_area = sphere.triangle(t).map_or(0.0, |tri| tri.area());
            if sphere_area == 0.0 {
                return 1.0;
            }
            let [a, b, c] = sphere.tile(t);
            let fid = crate::types::Triangle::new(fiducial_coords[a], fiducial_coords[b], fiducial_coords[c]);
            fid.area() / sphere_area
        })
        .collect()
}

/// Look up a per-tile value at each point by projecting it onto `surface`.
///
/// Points that miss every tile get 1.
pub fn sample_tile_values(surface: &Mesh, tile_values: &[f64], points: &[Point3<f64>]) -> Vec<f64> {
    let projector = PointProjector::new(surface, SurfaceHint::Sphere);
    let samples: Vec<f64> = points
        .par_iter()
        .map(|p| {
            projector
                .project_barycentric(surface, p)
                .tile
                .and_then(|t| tile_values.get(t).copied())
                .unwrap_or(1.0)
        })
        .collect();
    debug!(points = points.len(), "Sampled tile distortion");
    samples
}

/// Per-node distortion columns for one stage/cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionSamples {
    /// Target fiducial/sphere ratio.
    pub target: Vec<f64>,
    /// Source fiducial/sphere ratio.
    pub source: Vec<f64>,
    /// `sqrt(target / source)`, fed to the morphing engine.
    pub correction: Vec<f64>,
}

impl DistortionSamples {
    /// Column names, in the order of [`DistortionSamples::columns`].
    pub const COLUMN_NAMES: [&'static str; 3] =
        ["Target Distortion", "Source Distortion", "sqrt(Target/Source)"];

    /// Combine target and source samples.
    ///
    /// A non-positive source ratio gives a correction of 1.
    ///
    /// # Panics
    /// Panics if the columns have different lengths.
    pub fn new(target: Vec<f64>, source: Vec<f64>) -> Self {
        assert_eq!(target.len(), source.len(), "distortion columns must match");
        let correction = target
            .iter()
            .zip(&source)
            .map(|(&t, &s)| if s > 0.0 && t >= 0.0 { (t / s).sqrt() } else { 1.0 })
            .collect();
        Self {
            target,
            source,
            correction,
        }
    }

    /// Number of nodes sampled.
    #[inline]
    pub fn len(&self) -> usize {
        self.correction.len()
    }

    /// True if no node was sampled.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.correction.is_empty()
    }

    /// The three columns, in [`DistortionSamples::COLUMN_NAMES`] order.
    pub fn columns(&self) -> [&[f64]; 3] {
        [&self.target, &self.source, &self.correction]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphere::regular_sphere;

    #[test]
    fn test_scaled_fiducial_distortion() {
        let sphere = regular_sphere(1, 10.0);
        let mut fiducial = sphere.clone();
        fiducial.scale(2.0);
        for ratio in tile_distortion(&fiducial, &sphere) {
            assert!((ratio - 4.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_zero_area_tile_is_one() {
        let sphere = Mesh::from_parts(
            vec![Point3::origin(), Point3::origin(), Point3::origin()],
            vec![[0, 1, 2]],
        );
        let fiducial = sphere.clone();
        assert_eq!(tile_distortion(&fiducial, &sphere), vec![1.0]);
    }

    #[test]
    fn test_sample_tile_values() {
        let sphere = regular_sphere(1, 100.0);
        let values: Vec<f64> = (0..sphere.tile_count()).map(|t| t as f64).collect();
        let points: Vec<Point3<f64>> = (0..sphere.tile_count())
            .step_by(11)
            .map(|t| sphere.triangle(t).unwrap().centroid())
            .collect();
        let samples = sample_tile_values(&sphere, &values, &points);
        for (k, t) in (0..sphere.tile_count()).step_by(11).enumerate() {
            assert_eq!(samples[k], t as f64);
        }
    }

    #[test]
    fn test_correction_column() {
        let samples = DistortionSamples::new(vec![4.0, 1.0, 2.0], vec![1.0, 4.0, 0.0]);
        assert!((samples.correction[0] - 2.0).abs() < 1e-12);
        assert!((samples.correction[1] - 0.5).abs() < 1e-12);
        assert_eq!(samples.correction[2], 1.0);
        assert_eq!(samples.columns()[0], &[4.0, 1.0, 2.0]);
    }
}
