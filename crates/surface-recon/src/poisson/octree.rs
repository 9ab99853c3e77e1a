//! Adaptive octree over the unit cube, stored as an arena.
//!
//! Nodes are addressed by [`NodeId`]; children are an optional array of eight
//! ids ordered by `x | y << 1 | z << 2`. A node at depth `d` with integer key
//! `(i, j, k)` covers `[i, i+1] x [j, j+1] x [k, k+1]` scaled by `2^-d`.
//!
//! The tree is complete down to `full_depth`. Below that a node is split when
//! it, or any of its 26 same-depth neighbours, holds more than
//! `samples_per_node` samples. The neighbour rule keeps every sample's
//! finest-level basis support inside refined space.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::debug;

/// Index of a node in [`Octree::nodes`].
pub type NodeId = u32;

/// Integer cube coordinates at a given depth.
pub type CellKey = [u32; 3];

/// An oriented sample in unit-cube coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub position: Point3<f64>,
    /// Unit normal.
    pub normal: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct OctreeNode {
    pub depth: u8,
    pub key: CellKey,
    pub children: Option<[NodeId; 8]>,
    /// Samples inside this node's cube.
    pub samples: u32,
}

impl OctreeNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Edge length in unit-cube coordinates.
    #[inline]
    pub fn width(&self) -> f64 {
        1.0 / (1u64 << self.depth) as f64
    }
}

/// Octree shape parameters.
#[derive(Debug, Clone, Copy)]
pub struct OctreeParams {
    pub max_depth: u8,
    pub full_depth: u8,
    pub samples_per_node: f64,
}

/// Arena octree with per-depth lookup tables.
#[derive(Debug, Clone)]
pub struct Octree {
    pub nodes: Vec<OctreeNode>,
    /// Node ids per depth, in creation order.
    levels: Vec<Vec<NodeId>>,
    /// Key lookup per depth.
    lookup: Vec<HashMap<CellKey, NodeId>>,
}

/// Cube key containing `p` at `depth`, clamped into the unit cube.
#[inline]
pub fn cell_key(p: &Point3<f64>, depth: u8) -> CellKey {
    let res = (1u64 << depth) as f64;
    let max = (1u64 << depth) - 1;
    let axis = |c: f64| ((c * res).floor().max(0.0) as u64).min(max) as u32;
    [axis(p.x), axis(p.y), axis(p.z)]
}

/// Child slot of `key` inside its parent.
#[inline]
fn child_slot(key: CellKey) -> usize {
    (key[0] & 1) as usize | ((key[1] & 1) as usize) << 1 | ((key[2] & 1) as usize) << 2
}

impl Octree {
    /// Build the tree over samples already mapped into the unit cube.
    pub fn build(samples: &[Sample], params: &OctreeParams) -> Self {
        let max_depth = params.max_depth;
        let full_depth = params.full_depth.min(max_depth);

        // Sample counts per occupied cube, per depth.
        let mut counts: Vec<HashMap<CellKey, u32>> = vec![HashMap::new(); max_depth as usize + 1];
        for sample in samples {
            for (depth, map) in counts.iter_mut().enumerate() {
                *map.entry(cell_key(&sample.position, depth as u8)).or_insert(0) += 1;
            }
        }

        let mut tree = Octree {
            nodes: vec![OctreeNode {
                depth: 0,
                key: [0, 0, 0],
                children: None,
                samples: samples.len() as u32,
            }],
            levels: vec![vec![0]],
            lookup: Vec::new(),
        };
        let mut root_lookup = HashMap::new();
        root_lookup.insert([0, 0, 0], 0);
        tree.lookup.push(root_lookup);

        for depth in 0..max_depth {
            let level_counts = &counts[depth as usize];
            let wants = |key: CellKey| {
                level_counts
                    .get(&key)
                    .is_some_and(|&c| c as f64 > params.samples_per_node)
            };
            let res = 1i64 << depth;

            let parents = tree.levels[depth as usize].clone();
            let mut next_level = Vec::new();
            let mut next_lookup = HashMap::new();

            for parent in parents {
                let key = tree.nodes[parent as usize].key;
                let refine = depth < full_depth || {
                    let mut any = false;
                    'search: for dz in -1i64..=1 {
                        for dy in -1i64..=1 {
                            for dx in -1i64..=1 {
                                let n = [key[0] as i64 + dx, key[1] as i64 + dy, key[2] as i64 + dz];
                                if n.iter().any(|&c| c < 0 || c >= res) {
                                    continue;
                                }
                                if wants([n[0] as u32, n[1] as u32, n[2] as u32]) {
                                    any = true;
                                    break 'search;
                                }
                            }
                        }
                    }
                    any
                };
                if !refine {
                    continue;
                }

                let child_counts = &counts[depth as usize + 1];
                let mut children = [0; 8];
                for (slot, child) in children.iter_mut().enumerate() {
                    let child_key = [
                        key[0] * 2 + (slot & 1) as u32,
                        key[1] * 2 + ((slot >> 1) & 1) as u32,
                        key[2] * 2 + ((slot >> 2) & 1) as u32,
                    ];
                    let id = tree.nodes.len() as NodeId;
                    tree.nodes.push(OctreeNode {
                        depth: depth + 1,
                        key: child_key,
                        children: None,
                        samples: child_counts.get(&child_key).copied().unwrap_or(0),
                    });
                    next_level.push(id);
                    next_lookup.insert(child_key, id);
                    *child = id;
                }
                tree.nodes[parent as usize].children = Some(children);
            }

            if next_level.is_empty() {
                break;
            }
            tree.levels.push(next_level);
            tree.lookup.push(next_lookup);
        }

        debug!(
            nodes = tree.nodes.len(),
            depth = tree.max_depth(),
            per_depth = ?tree.nodes_per_depth(),
            "Built octree"
        );
        tree
    }

    /// Deepest depth that has nodes.
    #[inline]
    pub fn max_depth(&self) -> u8 {
        (self.levels.len() - 1) as u8
    }

    pub fn nodes_per_depth(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    /// Ids of the nodes at `depth`, empty beyond the deepest level.
    pub fn level(&self, depth: u8) -> &[NodeId] {
        self.levels
            .get(depth as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Node at `depth` with the given key, if the tree reaches it.
    #[inline]
    pub fn find(&self, depth: u8, key: CellKey) -> Option<NodeId> {
        self.lookup.get(depth as usize)?.get(&key).copied()
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &OctreeNode {
        &self.nodes[id as usize]
    }

    /// Deepest node containing `p`, not descending past `depth_limit`.
    pub fn locate(&self, p: &Point3<f64>, depth_limit: u8) -> NodeId {
        let mut id: NodeId = 0;
        loop {
            let node = &self.nodes[id as usize];
            let Some(children) = node.children else {
                return id;
            };
            if node.depth >= depth_limit {
                return id;
            }
            id = children[child_slot(cell_key(p, node.depth + 1))];
        }
    }

    /// Leaf ids, in arena order.
    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_leaf())
            .map(|(i, _)| i as NodeId)
    }
}
