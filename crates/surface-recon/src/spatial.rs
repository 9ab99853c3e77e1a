//! Nearest-neighbor index over a point set.
//!
//! [`SpatialIndex`] wraps a `kiddo` k-d tree and adds the guarantees the rest
//! of the crate relies on:
//!
//! - building fails with [`ReconError::DegenerateInput`] for empty sets,
//!   non-finite coordinates, or zero spatial extent
//! - k-NN results are ordered by ascending distance with ties broken by point
//!   id, so every downstream stage is deterministic
//!
//! The tree stores each distinct position once and maps it to the ids of
//! every point at that position, so duplicate-heavy scans never overfill a
//! kiddo leaf bucket. Coordinates in the tree sit in a fixed rotated frame:
//! kiddo cannot split a bucket whose entries all share one value on the split
//! axis, and axis-aligned grids and planes produce exactly that. Distances are
//! always recomputed from the original positions, so neither the rotation nor
//! the deduplication shows in results.
//!
//! The index is read-only once built. It is built once per stage and shared
//! by reference across the stage's parallel per-point queries.

use hashbrown::HashMap;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point3, Rotation3};
use tracing::debug;

use crate::error::{ReconError, ReconResult};
use crate::types::PointSet;

/// One k-NN result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index of the point in the indexed set.
    pub id: usize,
    /// Euclidean distance to the query.
    pub distance: f64,
}

/// Read-only k-d tree snapshot of a point set's positions.
pub struct SpatialIndex {
    /// Tree items are slot indices into `slots`.
    tree: KdTree<f64, 3>,
    positions: Vec<[f64; 3]>,
    /// Ids sharing one position, ascending.
    slots: Vec<Vec<usize>>,
    slot_of: Vec<usize>,
    frame: Rotation3<f64>,
}

/// Relative slack when comparing tree distances against exact ones.
const TREE_SLACK: f64 = 1e-9;

#[inline]
fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

#[inline]
fn rotate(frame: &Rotation3<f64>, p: &[f64; 3]) -> [f64; 3] {
    let r = frame * Point3::new(p[0], p[1], p[2]);
    [r.x, r.y, r.z]
}

/// Bit pattern of a position, with -0.0 folded into 0.0.
#[inline]
fn position_key(p: &[f64; 3]) -> [u64; 3] {
    [(p[0] + 0.0).to_bits(), (p[1] + 0.0).to_bits(), (p[2] + 0.0).to_bits()]
}

impl SpatialIndex {
    /// Build an index over a point set.
    pub fn build(points: &PointSet) -> ReconResult<Self> {
        let positions: Vec<[f64; 3]> = points
            .points
            .iter()
            .map(|p| [p.position.x, p.position.y, p.position.z])
            .collect();
        Self::from_coords(positions)
    }

    /// Build an index over bare positions.
    pub fn from_positions(positions: &[Point3<f64>]) -> ReconResult<Self> {
        Self::from_coords(positions.iter().map(|p| [p.x, p.y, p.z]).collect())
    }

    fn from_coords(positions: Vec<[f64; 3]>) -> ReconResult<Self> {
        if positions.is_empty() {
            return Err(ReconError::degenerate_input(
                "cannot build a spatial index over an empty point set",
            ));
        }
        if let Some(i) = positions
            .iter()
            .position(|p| p.iter().any(|c| !c.is_finite()))
        {
            return Err(ReconError::degenerate_input(format!(
                "point {} has a non-finite coordinate",
                i
            )));
        }

        let mut lookup: HashMap<[u64; 3], usize> = HashMap::with_capacity(positions.len());
        let mut slots: Vec<Vec<usize>> = Vec::new();
        let mut slot_of = Vec::with_capacity(positions.len());
        for (i, p) in positions.iter().enumerate() {
            let slot = *lookup.entry(position_key(p)).or_insert_with(|| {
                slots.push(Vec::with_capacity(1));
                slots.len() - 1
            });
            slots[slot].push(i);
            slot_of.push(slot);
        }

        if slots.len() == 1 {
            return Err(ReconError::degenerate_input(format!(
                "all {} points are coincident; zero spatial extent",
                positions.len()
            )));
        }

        let frame = Rotation3::from_euler_angles(0.613, 0.371, 0.937);
        let mut tree: KdTree<f64, 3> = KdTree::with_capacity(slots.len());
        for (s, ids) in slots.iter().enumerate() {
            tree.add(&rotate(&frame, &positions[ids[0]]), s as u64);
        }

        debug!(
            points = positions.len(),
            distinct = slots.len(),
            "Built spatial index"
        );

        Ok(Self {
            tree,
            positions,
            slots,
            slot_of,
            frame,
        })
    }

    /// Number of indexed points.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always false: an index cannot be built over an empty set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of distinct positions.
    #[inline]
    pub fn distinct_len(&self) -> usize {
        self.slots.len()
    }

    /// Position of an indexed point.
    #[inline]
    pub fn position(&self, id: usize) -> Point3<f64> {
        let [x, y, z] = self.positions[id];
        Point3::new(x, y, z)
    }

    /// The `k` nearest indexed points to `query`, ascending by distance, ties
    /// broken by id. Returns `min(k, len)` results.
    pub fn k_nearest(&self, query: &Point3<f64>, k: usize) -> Vec<Neighbor> {
        let k = k.min(self.len());
        self.nearest_by_slot(query, k, |_, ids, d2, out| {
            out.extend(ids.iter().map(|&i| (d2, i)));
        })
    }

    /// The `k` nearest neighbors of indexed point `id`, excluding the point
    /// itself (but not other points at the same position).
    pub fn k_nearest_of(&self, id: usize, k: usize) -> Vec<Neighbor> {
        let k = k.min(self.len() - 1);
        let query = self.position(id);
        self.nearest_by_slot(&query, k, |_, ids, d2, out| {
            out.extend(ids.iter().filter(|&&i| i != id).map(|&i| (d2, i)));
        })
    }

    /// The `k` nearest distinct positions around indexed point `id`, skipping
    /// its own position. Each position is reported by its smallest id.
    pub fn k_nearest_distinct_of(&self, id: usize, k: usize) -> Vec<Neighbor> {
        let own = self.slot_of[id];
        let k = k.min(self.slots.len() - 1);
        let query = self.position(id);
        self.nearest_by_slot(&query, k, |slot, ids, d2, out| {
            if slot != own {
                out.push((d2, ids[0]));
            }
        })
    }

    /// Shared k-NN walk. `emit` turns one slot into candidates; it may emit
    /// nothing for at most one slot.
    fn nearest_by_slot<F>(&self, query: &Point3<f64>, k: usize, emit: F) -> Vec<Neighbor>
    where
        F: Fn(usize, &[usize], f64, &mut Vec<(f64, usize)>),
    {
        if k == 0 {
            return Vec::new();
        }

        let q = [query.x, query.y, query.z];
        let tq = rotate(&self.frame, &q);

        // One slot may be skipped, one more detects a tie at the boundary.
        let want = (k + 2).min(self.slots.len());
        let mut candidates = self.expand_slots(
            self.tree
                .nearest_n::<SquaredEuclidean>(&tq, want)
                .into_iter()
                .map(|n| n.item as usize),
            &q,
            &emit,
        );
        sort_candidates(&mut candidates);

        // If the k-th and (k+1)-th candidates are (nearly) equidistant, points
        // with a smaller id may have been cut off: collect the whole shell.
        if candidates.len() > k && candidates[k].0 <= candidates[k - 1].0 * (1.0 + TREE_SLACK) {
            let boundary = candidates[k - 1].0;
            let radius = boundary * (1.0 + 4.0 * TREE_SLACK) + f64::MIN_POSITIVE;
            candidates = self.expand_slots(
                self.tree
                    .within_unsorted::<SquaredEuclidean>(&tq, radius)
                    .into_iter()
                    .map(|n| n.item as usize),
                &q,
                &emit,
            );
            candidates.retain(|&(d, _)| d <= boundary);
            sort_candidates(&mut candidates);
        }

        candidates
            .into_iter()
            .take(k)
            .map(|(d2, id)| Neighbor {
                id,
                distance: d2.sqrt(),
            })
            .collect()
    }

    fn expand_slots<F>(
        &self,
        slots: impl Iterator<Item = usize>,
        q: &[f64; 3],
        emit: &F,
    ) -> Vec<(f64, usize)>
    where
        F: Fn(usize, &[usize], f64, &mut Vec<(f64, usize)>),
    {
        let mut out = Vec::new();
        for s in slots {
            let ids = &self.slots[s];
            emit(s, ids, squared_distance(&self.positions[ids[0]], q), &mut out);
        }
        out
    }

    /// Ids of all indexed points within distance `r` of `query` (inclusive),
    /// in no particular order.
    pub fn within_radius(&self, query: &Point3<f64>, r: f64) -> Vec<usize> {
        if r.is_nan() || r < 0.0 {
            return Vec::new();
        }
        let r2 = r * r;
        let q = [query.x, query.y, query.z];
        self.tree
            .within_unsorted::<SquaredEuclidean>(
                &rotate(&self.frame, &q),
                r2 * (1.0 + TREE_SLACK) + f64::MIN_POSITIVE,
            )
            .into_iter()
            .map(|n| &self.slots[n.item as usize])
            .filter(|ids| squared_distance(&self.positions[ids[0]], &q) <= r2)
            .flat_map(|ids| ids.iter().copied())
            .collect()
    }

    /// The single nearest indexed point; among points sharing that position,
    /// the smallest id.
    pub fn nearest(&self, query: &Point3<f64>) -> Neighbor {
        let q = [query.x, query.y, query.z];
        let n = self
            .tree
            .nearest_one::<SquaredEuclidean>(&rotate(&self.frame, &q));
        let id = self.slots[n.item as usize][0];
        Neighbor {
            id,
            distance: squared_distance(&self.positions[id], &q).sqrt(),
        }
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("points", &self.positions.len())
            .field("distinct", &self.slots.len())
            .finish()
    }
}

fn sort_candidates(candidates: &mut [(f64, usize)]) {
    candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
}
