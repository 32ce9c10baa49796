//! Inserting border links into deformation spheres.
//!
//! The target pass decides which links make it into the mesh: a link that
//! cannot be projected is skipped. The source pass must then insert exactly
//! the same links, in the same order, so node `original_node_count + k`
//! is the same landmark on both spheres.

use nalgebra::Point3;
use tracing::{debug, info, warn};

use crate::border::BorderSet;
use crate::crossover::crossover_check;
use crate::error::{RegisterError, RegisterResult};
use crate::projector::{PointProjector, RetryPolicy, SurfaceHint};
use crate::smoothing::areal_smoothing;
use crate::types::Mesh;

/// A link of a border, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BorderLinkRef {
    pub border: usize,
    pub link: usize,
}

/// Links inserted into a sphere, in insertion order.
///
/// Entry `k` corresponds to node `original_node_count + k`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMapping(pub Vec<BorderLinkRef>);

impl LinkMapping {
    /// Number of inserted links.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if nothing was inserted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the inserted links.
    pub fn iter(&self) -> std::slice::Iter<'_, BorderLinkRef> {
        self.0.iter()
    }

    /// True if entry `k` is the first or last link of its border run.
    pub fn is_endpoint(&self, k: usize) -> bool {
        let border = self.0[k].border;
        let first = k == 0 || self.0[k - 1].border != border;
        let last = k + 1 >= self.0.len() || self.0[k + 1].border != border;
        first || last
    }
}

/// Outcome of inserting target borders.
#[derive(Debug, Clone)]
pub struct TessellationResult {
    /// Node count before any insertion.
    pub original_node_count: usize,
    pub mapping: LinkMapping,
    /// Links that could not be placed.
    pub skipped: Vec<BorderLinkRef>,
}

/// Outcome of inserting source borders.
#[derive(Debug, Clone)]
pub struct SourceTessellation {
    pub original_node_count: usize,
    /// Per-node border variance; zero for nodes of the base sphere.
    pub variances: Vec<f64>,
    /// Node crossovers found before the links went in.
    pub crossovers_before: usize,
    /// Node crossovers found after insertion and smoothing.
    pub crossovers_after: usize,
}

/// Insert every target border link into `mesh`, in border then link order.
///
/// Links that fail to project are logged and skipped. Afterwards every node
/// is pushed onto `radius` and normals are recomputed.
///
/// # Errors
/// [`RegisterError::TessellationFailed`] if no link could be inserted.
pub fn tessellate_target(
    mesh: &mut Mesh,
    borders: &BorderSet,
    radius: f64,
) -> RegisterResult<TessellationResult> {
    let original_node_count = mesh.node_count();
    let mut projector = PointProjector::new(mesh, SurfaceHint::Sphere);
    let mut mapping = Vec::with_capacity(borders.total_links());
    let mut skipped = Vec::new();

    for (b, border) in borders.iter().enumerate() {
        for (l, link) in border.links.iter().enumerate() {
            let link_ref = BorderLinkRef { border: b, link: l };
            let projection = projector.project_barycentric(mesh, link);
            match projection.tile {
                Some(tile) => {
                    insert_link(mesh, &mut projector, tile, *link);
                    mapping.push(link_ref);
                }
                None => {
                    warn!(
                        border = %border.name,
                        link = l,
                        has_nearest = projection.nearest_node.is_some(),
                        "Border link ignored"
                    );
                    skipped.push(link_ref);
                }
            }
        }
    }

    if mesh.node_count() == original_node_count {
        return Err(RegisterError::TessellationFailed);
    }

    mesh.project_to_sphere(radius);
    mesh.compute_normals();

    info!(
        inserted = mapping.len(),
        skipped = skipped.len(),
        nodes = mesh.node_count(),
        "Tessellated target borders"
    );

    Ok(TessellationResult {
        original_node_count,
        mapping: LinkMapping(mapping),
        skipped,
    })
}

/// Insert the source links that match `mapping` into `mesh`.
///
/// Each mapped target border is looked up by name in `source_borders`.
/// Failed projections are retried per `policy`. Inserted nodes receive the
/// target border's variance, scaled by `endpoint_factor` at the first and
/// last link of each border run. The mesh is then pushed onto `radius`,
/// smoothed once (strength 0.5) and pushed back onto `radius`.
///
/// # Errors
/// - [`RegisterError::MissingBorder`] if a source border is missing.
/// - [`RegisterError::UnableToTessellate`] if a link never lands in a tile.
pub fn tessellate_source(
    mesh: &mut Mesh,
    source_borders: &BorderSet,
    target_borders: &BorderSet,
    mapping: &LinkMapping,
    policy: &RetryPolicy,
    endpoint_factor: f64,
    radius: f64,
) -> RegisterResult<SourceTessellation> {
    // Name lookup first so a missing border leaves the mesh untouched.
    let mut links = Vec::with_capacity(mapping.len());
    for link_ref in mapping.iter() {
        let target = target_borders
            .get(link_ref.border)
            .ok_or_else(|| RegisterError::MissingBorder {
                name: format!("#{}", link_ref.border),
            })?;
        let source = source_borders.find_by_name(&target.name).ok_or_else(|| {
            RegisterError::MissingBorder {
                name: target.name.clone(),
            }
        })?;
        let point = source.links.get(link_ref.link).copied().ok_or_else(|| {
            RegisterError::UnableToTessellate {
                border: target.name.clone(),
                link: link_ref.link,
            }
        })?;
        links.push((target.name.as_str(), target.variance, link_ref.link, point));
    }

    let crossovers_before = crossover_check(mesh, SurfaceHint::Sphere).nodes;
    if crossovers_before > 0 {
        warn!(
            crossovers = crossovers_before,
            "Source deformation sphere has crossovers before landmark insertion"
        );
    }

    let original_node_count = mesh.node_count();
    let mut variances = vec![0.0; original_node_count];
    let mut projector = PointProjector::new(mesh, SurfaceHint::Sphere);

    for (k, &(name, variance, link, point)) in links.iter().enumerate() {
        let (projection, landed) = projector
            .project_with_retry(mesh, &point, policy)
            .ok_or_else(|| RegisterError::UnableToTessellate {
                border: name.to_string(),
                link,
            })?;
        if landed != point {
            debug!(border = name, link, "Source border link moved to project");
        }
        let Some(tile) = projection.tile else {
            return Err(RegisterError::UnableToTessellate {
                border: name.to_string(),
                link,
            });
        };
        insert_link(mesh, &mut projector, tile, landed);

        let factor = if mapping.is_endpoint(k) { endpoint_factor } else { 1.0 };
        variances.push(variance * factor);
    }

    mesh.project_to_sphere(radius);
    mesh.compute_normals();
    areal_smoothing(mesh, 0.5, 1, None, None);
    mesh.project_to_sphere(radius);
    mesh.compute_normals();

    let crossovers_after = crossover_check(mesh, SurfaceHint::Sphere).nodes;
    if crossovers_after > 0 {
        warn!(
            crossovers = crossovers_after,
            "Source deformation sphere has crossovers after landmark insertion"
        );
    }

    info!(
        inserted = links.len(),
        nodes = mesh.node_count(),
        "Tessellated source borders"
    );

    Ok(SourceTessellation {
        original_node_count,
        variances,
        crossovers_before,
        crossovers_after,
    })
}

fn insert_link(mesh: &mut Mesh, projector: &mut PointProjector, tile: usize, position: Point3<f64>) {
    let node = mesh.split_tile(tile, position);
    let count = mesh.tile_count();
    projector.record_split(mesh, tile, [count - 2, count - 1], node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::border::Border;
    use crate::sphere::regular_sphere;

    fn arc(name: &str, radius: f64, offset: f64) -> Border {
        let links = (0..4)
            .map(|i| {
                let t = 0.3 + i as f64 * 0.12 + offset;
                Point3::new(t.sin() * radius * 0.5, t.cos() * radius * 0.3, radius)
            })
            .map(|p| Point3::from(p.coords.normalize() * radius))
            .collect();
        Border::new(name, links).with_variance(2.0)
    }

    #[test]
    fn test_target_tessellation_inserts_every_link() {
        let mut mesh = regular_sphere(1, 100.0);
        let borders: BorderSet = [arc("CeS", 100.0, 0.0)].into_iter().collect();

        let result = tessellate_target(&mut mesh, &borders, 100.0).unwrap();
        assert_eq!(result.original_node_count, 74);
        assert_eq!(result.mapping.len(), 4);
        assert_eq!(mesh.node_count(), 78);
        assert_eq!(mesh.tile_count(), 144 + 8);
        for v in &mesh.vertices {
            assert!((v.position.coords.norm() - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_target_tessellation_with_nothing_inserted_fails() {
        let mut mesh = regular_sphere(1, 100.0);
        let borders = BorderSet::new();
        let err = tessellate_target(&mut mesh, &borders, 100.0).unwrap_err();
        assert!(matches!(err, RegisterError::TessellationFailed));
    }

    #[test]
    fn test_source_matches_target_counts_and_variances() {
        let mut target = regular_sphere(1, 100.0);
        let mut source = regular_sphere(1, 100.0);
        let target_borders: BorderSet = [arc("CeS", 100.0, 0.0)].into_iter().collect();
        let source_borders: BorderSet = [arc("CeS", 100.0, 0.05)].into_iter().collect();

        let result = tessellate_target(&mut target, &target_borders, 100.0).unwrap();
        let source_result = tessellate_source(
            &mut source,
            &source_borders,
            &target_borders,
            &result.mapping,
            &RetryPolicy::default(),
            0.5,
            100.0,
        )
        .unwrap();

        assert_eq!(source.node_count(), target.node_count());
        let v = &source_result.variances;
        assert_eq!(v.len(), source.node_count());
        assert_eq!(v[0], 0.0);
        assert_eq!(v[74], 1.0);
        assert_eq!(v[75], 2.0);
        assert_eq!(v[77], 1.0);
    }

    #[test]
    fn test_source_missing_border_is_configuration_error() {
        let mut target = regular_sphere(1, 100.0);
        let mut source = regular_sphere(1, 100.0);
        let target_borders: BorderSet = [arc("CeS", 100.0, 0.0)].into_iter().collect();
        let source_borders: BorderSet = [arc("SF", 100.0, 0.0)].into_iter().collect();

        let result = tessellate_target(&mut target, &target_borders, 100.0).unwrap();
        let err = tessellate_source(
            &mut source,
            &source_borders,
            &target_borders,
            &result.mapping,
            &RetryPolicy::default(),
            1.0,
            100.0,
        )
        .unwrap_err();
        assert!(matches!(err, RegisterError::MissingBorder { ref name } if name == "CeS"));
        assert_eq!(source.node_count(), 74);
    }

    #[test]
    fn test_endpoint_detection() {
        let mapping = LinkMapping(vec![
            BorderLinkRef { border: 0, link: 0 },
            BorderLinkRef { border: 0, link: 1 },
            BorderLinkRef { border: 0, link: 2 },
            BorderLinkRef { border: 1, link: 0 },
        ]);
        assert!(mapping.is_endpoint(0));
        assert!(!mapping.is_endpoint(1));
        assert!(mapping.is_endpoint(2));
        assert!(mapping.is_endpoint(3));
    }
}
