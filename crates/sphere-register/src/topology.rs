//! Neighbour lists derived from a tile list.
//!
//! Each node's neighbours are stored as an ordered ring: consecutive entries
//! share a tile with the node, walking counter-clockwise as seen from outside
//! (the winding of the tiles). On a closed manifold surface the ring wraps
//! around; on a boundary node it starts and ends at the two boundary edges.

use hashbrown::HashMap;

/// Read-only adjacency view of a mesh.
#[derive(Debug, Clone)]
pub struct Topology {
    rings: Vec<Vec<usize>>,
    node_tiles: Vec<Vec<usize>>,
    boundary: Vec<bool>,
    /// Maps edge (v0, v1) to list of tile indices. v0 < v1.
    edge_to_tiles: HashMap<(u32, u32), Vec<usize>>,
}

impl Topology {
    /// Build adjacency for `node_count` nodes from a tile list.
    pub fn build(node_count: usize, tiles: &[[u32; 3]]) -> Self {
        let mut node_tiles: Vec<Vec<usize>> = vec![Vec::new(); node_count];
        let mut edge_to_tiles: HashMap<(u32, u32), Vec<usize>> = HashMap::new();

        for (tile_idx, tile) in tiles.iter().enumerate() {
            for &v in tile {
                node_tiles[v as usize].push(tile_idx);
            }

            let edges = [
                normalize_edge(tile[0], tile[1]),
                normalize_edge(tile[1], tile[2]),
                normalize_edge(tile[2], tile[0]),
            ];
            for edge in edges {
                edge_to_tiles.entry(edge).or_default().push(tile_idx);
            }
        }

        let mut rings = Vec::with_capacity(node_count);
        let mut boundary = Vec::with_capacity(node_count);
        for (node, incident) in node_tiles.iter().enumerate() {
            let (ring, open) = order_ring(node, incident, tiles);
            rings.push(ring);
            boundary.push(open);
        }

        Self {
            rings,
            node_tiles,
            boundary,
            edge_to_tiles,
        }
    }

    /// Number of nodes covered.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.rings.len()
    }

    /// Ordered neighbour ring of a node. Empty for unknown or isolated nodes.
    #[inline]
    pub fn neighbors(&self, node: usize) -> &[usize] {
        self.rings.get(node).map_or(&[], Vec::as_slice)
    }

    /// Tiles that use a node.
    #[inline]
    pub fn node_tiles(&self, node: usize) -> &[usize] {
        self.node_tiles.get(node).map_or(&[], Vec::as_slice)
    }

    /// True if the node has at least one neighbour.
    #[inline]
    pub fn has_neighbors(&self, node: usize) -> bool {
        !self.neighbors(node).is_empty()
    }

    /// True if the node's ring does not close (it lies on an open edge).
    #[inline]
    pub fn is_boundary(&self, node: usize) -> bool {
        self.boundary.get(node).copied().unwrap_or(false)
    }

    /// Tiles adjacent to an edge.
    pub fn tiles_for_edge(&self, v0: u32, v1: u32) -> Option<&[usize]> {
        self.edge_to_tiles
            .get(&normalize_edge(v0, v1))
            .map(Vec::as_slice)
    }

    /// Iterate over all undirected edges.
    pub fn edges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.edge_to_tiles.keys().copied()
    }

    /// Number of undirected edges.
    #[inline]
    pub fn edge_count(&self) -> usize {
        self.edge_to_tiles.len()
    }
}

/// Normalize an edge so the smaller index comes first.
#[inline]
fn normalize_edge(v0: u32, v1: u32) -> (u32, u32) {
    if v0 < v1 { (v0, v1) } else { (v1, v0) }
}

/// Chain the tiles around `node` into an ordered ring.
///
/// Returns the ring and whether it is open.
fn order_ring(node: usize, incident: &[usize], tiles: &[[u32; 3]]) -> (Vec<usize>, bool) {
    // Each tile (node, a, b) contributes the directed step a -> b.
    let steps: Vec<(usize, usize)> = incident
        .iter()
        .filter_map(|&t| {
            let [a, b, c] = tiles[t].map(|v| v as usize);
            if a == node {
                Some((b, c))
            } else if b == node {
                Some((c, a))
            } else if c == node {
                Some((a, b))
            } else {
                None
            }
        })
        .collect();

    if steps.is_empty() {
        return (Vec::new(), false);
    }

    // An open ring starts where no step arrives.
    let start = steps
        .iter()
        .map(|&(from, _)| from)
        .find(|from| !steps.iter().any(|&(_, to)| to == *from))
        .unwrap_or(steps[0].0);

    let mut used = vec![false; steps.len()];
    let mut ring = vec![start];
    let mut current = start;
    let mut closed = false;

    while let Some(i) = (0..steps.len()).find(|&i| !used[i] && steps[i].0 == current) {
        used[i] = true;
        current = steps[i].1;
        if current == start {
            closed = true;
            break;
        }
        ring.push(current);
    }

    // Non-manifold leftovers: keep every neighbour, but the ring is not a
    // clean fan any more.
    let mut open = !closed;
    for (i, &(from, to)) in steps.iter().enumerate() {
        if used[i] {
            continue;
        }
        open = true;
        for v in [from, to] {
            if !ring.contains(&v) {
                ring.push(v);
            }
        }
    }

    (ring, open)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn octahedron_tiles() -> Vec<[u32; 3]> {
        // 0:+x 1:-x 2:+y 3:-y 4:+z 5:-z
        vec![
            [0, 2, 4],
            [2, 1, 4],
            [1, 3, 4],
            [3, 0, 4],
            [2, 0, 5],
            [1, 2, 5],
            [3, 1, 5],
            [0, 3, 5],
        ]
    }

    #[test]
    fn test_closed_ring_is_ordered() {
        let topology = Topology::build(6, &octahedron_tiles());
        let ring = topology.neighbors(4);
        assert_eq!(ring.len(), 4);
        assert!(!topology.is_boundary(4));

        // Consecutive ring entries share a tile with the node.
        for k in 0..ring.len() {
            let a = ring[k] as u32;
            let b = ring[(k + 1) % ring.len()] as u32;
            let shared = topology.tiles_for_edge(a, b).unwrap();
            assert!(shared.iter().any(|&t| octahedron_tiles()[t].contains(&4)));
        }
    }

    #[test]
    fn test_ring_direction_follows_winding() {
        let topology = Topology::build(6, &octahedron_tiles());
        let ring = topology.neighbors(4);
        // Tile [0, 2, 4] puts 2 right after 0 around node 4.
        let i = ring.iter().position(|&n| n == 0).unwrap();
        assert_eq!(ring[(i + 1) % ring.len()], 2);
    }

    #[test]
    fn test_open_ring() {
        let tiles = vec![[0, 1, 2], [0, 2, 3]];
        let topology = Topology::build(4, &tiles);
        assert_eq!(topology.neighbors(0), &[1, 2, 3]);
        assert!(topology.is_boundary(0));
        assert!(topology.is_boundary(1));
    }

    #[test]
    fn test_edges() {
        let topology = Topology::build(6, &octahedron_tiles());
        assert_eq!(topology.edge_count(), 12);
        for (a, b) in topology.edges() {
            assert_eq!(topology.tiles_for_edge(a, b).unwrap().len(), 2);
        }
    }

    #[test]
    fn test_isolated_node() {
        let topology = Topology::build(7, &octahedron_tiles());
        assert!(!topology.has_neighbors(6));
        assert!(topology.node_tiles(6).is_empty());
        assert!(topology.neighbors(99).is_empty());
    }
}
