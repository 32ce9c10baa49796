//! Connected clusters of thresholded per-node values.
//!
//! A node qualifies when its value falls in the positive or the negative
//! threshold range. Clusters grow breadth-first from the lowest-numbered
//! unclaimed qualifying node, through neighbours that qualify for the same
//! range. A node is claimed as soon as it is queued, so every qualifying
//! node ends up in exactly one cluster.

use std::collections::VecDeque;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegisterError, RegisterResult};
use crate::types::Mesh;

/// Inclusive value range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRange {
    pub min: f64,
    pub max: f64,
}

impl ThresholdRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// True if `value` lies in `[min, max]`.
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Which threshold range a cluster belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSign {
    Positive,
    Negative,
}

/// Smallest cluster that counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum MinimumSize {
    /// Every cluster counts.
    #[default]
    Any,
    /// At least this many nodes.
    Nodes(usize),
    /// At least this much surface area.
    Area(f64),
}

/// What to do with clusters below the minimum size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SmallClusterPolicy {
    /// Leave them out of [`ClusterAnalysis::kept`].
    #[default]
    Discard,
    /// Keep them, flagged.
    Keep,
}

/// Clustering parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClusterParams {
    pub positive: Option<ThresholdRange>,
    pub negative: Option<ThresholdRange>,
    pub minimum: MinimumSize,
    pub policy: SmallClusterPolicy,
}

impl ClusterParams {
    /// Cluster values in `[min, max]`.
    pub fn positive(min: f64, max: f64) -> Self {
        Self {
            positive: Some(ThresholdRange::new(min, max)),
            ..Default::default()
        }
    }

    /// Also cluster values in `[min, max]` as a separate, negative range.
    pub fn with_negative(mut self, min: f64, max: f64) -> Self {
        self.negative = Some(ThresholdRange::new(min, max));
        self
    }

    pub fn with_minimum(mut self, minimum: MinimumSize) -> Self {
        self.minimum = minimum;
        self
    }

    pub fn with_policy(mut self, policy: SmallClusterPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn range_of(&self, value: f64) -> Option<RangeSign> {
        if self.positive.is_some_and(|r| r.contains(value)) {
            Some(RangeSign::Positive)
        } else if self.negative.is_some_and(|r| r.contains(value)) {
            Some(RangeSign::Negative)
        } else {
            None
        }
    }

    fn is_below_minimum(&self, node_count: usize, area: f64) -> bool {
        match self.minimum {
            MinimumSize::Any => false,
            MinimumSize::Nodes(min) => node_count < min,
            MinimumSize::Area(min) => area < min,
        }
    }
}

/// One connected cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    /// Member nodes, in discovery order.
    pub nodes: Vec<usize>,
    /// Sum of member node areas (a third of each incident tile).
    pub area: f64,
    /// Mean member position.
    pub center_of_gravity: Point3<f64>,
    pub range: RangeSign,
    pub below_minimum: bool,
}

impl Cluster {
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Result of [`find_clusters`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterAnalysis {
    /// All clusters, in discovery order.
    pub clusters: Vec<Cluster>,
    /// Nodes whose value fell in a threshold range.
    pub qualifying_nodes: usize,
    pub policy: SmallClusterPolicy,
}

impl ClusterAnalysis {
    /// The cluster with the most nodes.
    pub fn largest(&self) -> Option<&Cluster> {
        self.clusters.iter().max_by_key(|c| c.node_count())
    }

    /// Clusters that survive the small-cluster policy.
    pub fn kept(&self) -> impl Iterator<Item = &Cluster> + '_ {
        self.clusters
            .iter()
            .filter(|c| self.policy == SmallClusterPolicy::Keep || !c.below_minimum)
    }

    /// Cluster index of every node, `None` for nodes outside all clusters.
    pub fn node_clusters(&self, node_count: usize) -> Vec<Option<usize>> {
        let mut owner = vec![None; node_count];
        for (i, cluster) in self.clusters.iter().enumerate() {
            for &n in &cluster.nodes {
                owner[n] = Some(i);
            }
        }
        owner
    }
}

impl std::fmt::Display for ClusterAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cluster Analysis:")?;
        writeln!(f, "  Qualifying nodes: {}", self.qualifying_nodes)?;
        writeln!(
            f,
            "  Clusters: {} ({} kept)",
            self.clusters.len(),
            self.kept().count()
        )?;
        for (i, c) in self.clusters.iter().enumerate() {
            writeln!(
                f,
                "    Cluster {}: {} nodes, area {:.3}, {:?}, center ({:.2}, {:.2}, {:.2}){}",
                i + 1,
                c.node_count(),
                c.area,
                c.range,
                c.center_of_gravity.x,
                c.center_of_gravity.y,
                c.center_of_gravity.z,
                if c.below_minimum { " [below minimum]" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// Find the clusters of `values` on `mesh`.
///
/// # Errors
/// [`RegisterError::NodeCountMismatch`] if there is not one value per node.
///
/// # Example
/// ```
/// use sphere_register::clustering::{ClusterParams, find_clusters};
/// use sphere_register::sphere::regular_sphere;
///
/// let sphere = regular_sphere(1, 100.0);
/// let values: Vec<f64> = sphere.vertices.iter().map(|v| v.position.z).collect();
/// let analysis = find_clusters(&sphere, &values, &ClusterParams::positive(0.0, 100.0)).unwrap();
/// assert_eq!(analysis.clusters.len(), 1);
/// ```
pub fn find_clusters(mesh: &Mesh, values: &[f64], params: &ClusterParams) -> RegisterResult<ClusterAnalysis> {
    let node_count = mesh.node_count();
    if values.len() != node_count {
        return Err(RegisterError::node_count_mismatch("cluster values", node_count, values.len()));
    }

    let ranges: Vec<Option<RangeSign>> = values.iter().map(|&v| params.range_of(v)).collect();
    let qualifying_nodes = ranges.iter().filter(|r| r.is_some()).count();
    let node_areas = node_areas(mesh);
    let topology = mesh.topology();

    let mut claimed = vec![false; node_count];
    let mut clusters = Vec::new();
    let mut queue = VecDeque::new();

    for seed in 0..node_count {
        let Some(range) = ranges[seed] else {
            continue;
        };
        if claimed[seed] {
            continue;
        }

        claimed[seed] = true;
        queue.push_back(seed);
        let mut nodes = Vec::new();
        while let Some(node) = queue.pop_front() {
            nodes.push(node);
            for &neighbor in topology.neighbors(node) {
                if !claimed[neighbor] && ranges[neighbor] == Some(range) {
                    claimed[neighbor] = true;
                    queue.push_back(neighbor);
                }
            }
        }

        let area: f64 = nodes.iter().map(|&n| node_areas[n]).sum();
        let sum: Vector3<f64> = nodes.iter().map(|&n| mesh.position(n).coords).sum();
        let center_of_gravity = Point3::from(sum / nodes.len() as f64);
        let below_minimum = params.is_below_minimum(nodes.len(), area);
        debug!(seed, nodes = nodes.len(), area, ?range, below_minimum, "Cluster found");

        clusters.push(Cluster {
            nodes,
            area,
            center_of_gravity,
            range,
            below_minimum,
        });
    }

    let analysis = ClusterAnalysis {
        clusters,
        qualifying_nodes,
        policy: params.policy,
    };
    info!(
        clusters = analysis.clusters.len(),
        kept = analysis.kept().count(),
        qualifying = qualifying_nodes,
        "Clustering complete"
    );
    Ok(analysis)
}

/// Zero every value outside the kept clusters.
pub fn mask_small_clusters(values: &[f64], analysis: &ClusterAnalysis) -> Vec<f64> {
    let mut keep = vec![false; values.len()];
    for cluster in analysis.kept() {
        for &n in &cluster.nodes {
            if let Some(flag) = keep.get_mut(n) {
                *flag = true;
            }
        }
    }
    values
        .iter()
        .zip(&keep)
        .map(|(&v, &k)| if k { v } else { 0.0 })
        .collect()
}

/// A third of the area of every tile, credited to each of its nodes.
fn node_areas(mesh: &Mesh) -> Vec<f64> {
    let mut areas = vec![0.0; mesh.node_count()];
    for (tile, area) in mesh.tiles().iter().zip(mesh.tile_areas()) {
        for &n in tile {
            areas[n as usize] += area / 3.0;
        }
    }
    areas
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `width` x `height` grid of unit squares in z = 0.
    fn grid(width: usize, height: usize) -> Mesh {
        let mut positions = Vec::new();
        for y in 0..=height {
            for x in 0..=width {
                positions.push(Point3::new(x as f64, y as f64, 0.0));
            }
        }
        let row = (width + 1) as u32;
        let mut tiles = Vec::new();
        for y in 0..height as u32 {
            for x in 0..width as u32 {
                let a = y * row + x;
                tiles.push([a, a + 1, a + row + 1]);
                tiles.push([a, a + row + 1, a + row]);
            }
        }
        Mesh::from_parts(positions, tiles)
    }

    /// Values set to 1 in the given columns of a grid, 0 elsewhere.
    fn column_values(width: usize, height: usize, columns: &[usize]) -> Vec<f64> {
        let mut values = Vec::new();
        for _ in 0..=height {
            for x in 0..=width {
                values.push(if columns.contains(&x) { 1.0 } else { 0.0 });
            }
        }
        values
    }

    #[test]
    fn test_two_separate_clusters() {
        let mesh = grid(6, 3);
        let values = column_values(6, 3, &[0, 1, 5, 6]);
        let analysis = find_clusters(&mesh, &values, &ClusterParams::positive(0.5, 2.0)).unwrap();

        assert_eq!(analysis.clusters.len(), 2);
        assert_eq!(analysis.qualifying_nodes, 16);
        assert_eq!(analysis.clusters[0].node_count(), 8);
        assert!((analysis.clusters[0].center_of_gravity.x - 0.5).abs() < 1e-12);
        assert!((analysis.clusters[1].center_of_gravity.x - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_partition() {
        let mesh = grid(5, 5);
        let values: Vec<f64> = (0..mesh.node_count()).map(|n| ((n * 7) % 5) as f64).collect();
        let params = ClusterParams::positive(2.0, 3.0).with_negative(0.0, 0.0);
        let analysis = find_clusters(&mesh, &values, &params).unwrap();

        let mut seen = vec![0; mesh.node_count()];
        for cluster in &analysis.clusters {
            for &n in &cluster.nodes {
                seen[n] += 1;
            }
        }
        for (n, &count) in seen.iter().enumerate() {
            let qualifies = params.range_of(values[n]).is_some();
            assert_eq!(count, usize::from(qualifies), "node {n}");
        }
    }

    #[test]
    fn test_ranges_do_not_merge() {
        let mesh = grid(3, 1);
        let values = vec![1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0];
        let params = ClusterParams::positive(0.5, 2.0).with_negative(-2.0, -0.5);
        let analysis = find_clusters(&mesh, &values, &params).unwrap();

        assert_eq!(analysis.clusters.len(), 2);
        assert_eq!(analysis.clusters[0].range, RangeSign::Positive);
        assert_eq!(analysis.clusters[1].range, RangeSign::Negative);
    }

    #[test]
    fn test_small_clusters_discarded_or_kept() {
        let mesh = grid(6, 3);
        let values = column_values(6, 3, &[0, 1, 2, 6]);

        let discard = ClusterParams::positive(0.5, 2.0).with_minimum(MinimumSize::Nodes(5));
        let analysis = find_clusters(&mesh, &values, &discard).unwrap();
        assert_eq!(analysis.clusters.len(), 2);
        assert_eq!(analysis.kept().count(), 1);
        assert!(analysis.clusters[1].below_minimum);

        let masked = mask_small_clusters(&values, &analysis);
        assert_eq!(masked[6], 0.0);
        assert_eq!(masked[0], 1.0);

        let keep = discard.with_policy(SmallClusterPolicy::Keep);
        let analysis = find_clusters(&mesh, &values, &keep).unwrap();
        assert_eq!(analysis.kept().count(), 2);
        assert_eq!(mask_small_clusters(&values, &analysis), values);
    }

    #[test]
    fn test_minimum_area() {
        let mesh = grid(4, 4);
        let values = vec![1.0; mesh.node_count()];
        let analysis = find_clusters(
            &mesh,
            &values,
            &ClusterParams::positive(0.0, 1.0).with_minimum(MinimumSize::Area(15.0)),
        )
        .unwrap();
        assert_eq!(analysis.clusters.len(), 1);
        assert!((analysis.clusters[0].area - 16.0).abs() < 1e-9);
        assert!(!analysis.clusters[0].below_minimum);
    }

    #[test]
    fn test_value_count_mismatch() {
        let mesh = grid(2, 2);
        let err = find_clusters(&mesh, &[1.0], &ClusterParams::positive(0.0, 1.0)).unwrap_err();
        assert!(matches!(err, RegisterError::NodeCountMismatch { .. }));
    }

    #[test]
    fn test_display() {
        let mesh = grid(2, 1);
        let values = vec![1.0; mesh.node_count()];
        let analysis = find_clusters(&mesh, &values, &ClusterParams::positive(0.0, 1.0)).unwrap();
        let text = analysis.to_string();
        assert!(text.contains("Qualifying nodes: 6"));
        assert!(text.contains("Cluster 1: 6 nodes"));
        assert_eq!(analysis.largest().map(Cluster::node_count), Some(6));
    }
}
