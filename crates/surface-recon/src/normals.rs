//! Tangent-plane normal estimation with consistent orientation.
//!
//! Each point's normal is the eigenvector of smallest eigenvalue of the
//! covariance of its neighborhood (the point plus its k nearest neighbors,
//! optionally limited to a search radius). That fixes the normal up to sign.
//! Neighbors are distinct positions: copies of a point carry no plane
//! information, so every copy in a duplicate cluster fits the plane of the
//! surrounding surface. A neighborhood whose covariance has no well-defined
//! smallest axis counts as insufficient.
//! Signs are made consistent by propagating orientation over a minimum
//! spanning tree of the neighbor graph weighted by `1 - |n_i . n_j|`, so the
//! propagation crosses smooth regions first and sharp creases last.
//!
//! Each tree is seeded at its highest point (largest z), whose normal is
//! turned to face +z. For closed scans that makes the normals point outward.

use nalgebra::{Matrix3, Vector3};
use petgraph::algo::min_spanning_tree;
use petgraph::data::Element;
use petgraph::graph::{NodeIndex, UnGraph};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ReconError, ReconResult};
use crate::pipeline::Stage;
use crate::progress::ProgressTracker;
use crate::spatial::SpatialIndex;
use crate::tracing_ext::OperationTimer;
use crate::types::{CloudPoint, PointSet};

/// Smallest neighborhood (excluding the point itself) that defines a plane.
pub const MIN_NEIGHBORS: usize = 3;

/// Neighbors per point kept as edges of the orientation graph.
const ORIENTATION_NEIGHBORS: usize = 8;

/// Second-largest covariance eigenvalue, relative to the largest, below
/// which a neighborhood is treated as a line.
const PLANE_EPS: f64 = 1e-12;

/// Points processed between cancellation checks.
const CHECK_INTERVAL: usize = 4096;

/// How to make normal signs globally consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalOrientation {
    /// Propagate along a minimum spanning tree of the neighbor graph.
    #[default]
    SpanningTree,
    /// Flip normals that point toward the centroid.
    AwayFromCentroid,
}

/// What to do with points whose neighborhood is too small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborPolicy {
    /// Fail the stage with [`ReconError::InsufficientNeighbors`].
    #[default]
    Abort,
    /// Drop the point and count it in [`NormalEstimate::skipped`].
    Skip,
}

/// Parameters for normal estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalParams {
    /// Neighborhood size.
    pub k: usize,
    /// Optional search radius; neighbors farther than this are ignored.
    pub radius: Option<f64>,
    /// Sign consistency strategy.
    pub orientation: NormalOrientation,
    /// Handling of under-populated neighborhoods.
    pub policy: NeighborPolicy,
}

impl Default for NormalParams {
    fn default() -> Self {
        Self {
            k: 30,
            radius: None,
            orientation: NormalOrientation::SpanningTree,
            policy: NeighborPolicy::Abort,
        }
    }
}

impl NormalParams {
    /// Parameters with neighborhood size `k` and defaults otherwise.
    pub fn with_k(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }
}

/// Output of normal estimation.
#[derive(Debug, Clone)]
pub struct NormalEstimate {
    /// Retained points, in input order, each with a unit normal.
    pub points: PointSet,
    /// Input indices of points dropped under [`NeighborPolicy::Skip`].
    pub skipped: Vec<usize>,
}

/// Estimate oriented unit normals for every point.
pub fn estimate_normals(points: &PointSet, params: &NormalParams) -> ReconResult<NormalEstimate> {
    estimate_normals_with_progress(points, params, &ProgressTracker::silent(Stage::EstimatingNormals))
}

/// [`estimate_normals`] with progress reporting and cancellation.
pub fn estimate_normals_with_progress(
    points: &PointSet,
    params: &NormalParams,
    tracker: &ProgressTracker<'_>,
) -> ReconResult<NormalEstimate> {
    let _timer = OperationTimer::with_points("estimate_normals", points.len());
    let index = SpatialIndex::build(points)?;
    let n = points.len();

    info!(
        k = params.k,
        radius = ?params.radius,
        points = n,
        "Estimating normals"
    );

    let fits: Vec<PlaneFit> = (0..n)
        .into_par_iter()
        .map(|i| {
            if i % CHECK_INTERVAL == 0 {
                tracker.report(0.8 * i as f64 / n as f64, "fitting tangent planes")?;
            }
            Ok(fit_plane(&index, i, params))
        })
        .collect::<ReconResult<_>>()?;

    let mut skipped = Vec::new();
    for (i, fit) in fits.iter().enumerate() {
        if let PlaneFit::Insufficient { found } = fit {
            match params.policy {
                NeighborPolicy::Abort => {
                    return Err(ReconError::insufficient_neighbors(i, *found, MIN_NEIGHBORS));
                }
                NeighborPolicy::Skip => skipped.push(i),
            }
        }
    }
    if !skipped.is_empty() {
        warn!(
            skipped = skipped.len(),
            "Dropped points with fewer than {} neighbors", MIN_NEIGHBORS
        );
    }

    // Compact to retained points, remapping neighbor ids.
    let mut remap = vec![u32::MAX; n];
    let mut kept_points = Vec::with_capacity(n - skipped.len());
    let mut normals = Vec::with_capacity(n - skipped.len());
    let mut neighbors = Vec::with_capacity(n - skipped.len());
    for (i, fit) in fits.into_iter().enumerate() {
        if let PlaneFit::Fitted { normal, neighbors: nbrs } = fit {
            remap[i] = kept_points.len() as u32;
            kept_points.push(&points.points[i]);
            normals.push(normal);
            neighbors.push(nbrs);
        }
    }
    for nbrs in &mut neighbors {
        nbrs.retain_mut(|j| {
            *j = remap[*j as usize];
            *j != u32::MAX
        });
    }

    tracker.report_now(0.8, "orienting normals")?;

    match params.orientation {
        NormalOrientation::SpanningTree => {
            let heights: Vec<f64> = kept_points.iter().map(|p| p.position.z).collect();
            orient_along_spanning_tree(&mut normals, &neighbors, &heights);
        }
        NormalOrientation::AwayFromCentroid => {}
    }

    let mut out: PointSet = kept_points
        .into_iter()
        .zip(normals)
        .map(|(p, normal)| CloudPoint {
            position: p.position,
            normal: Some(normal),
            color: p.color,
        })
        .collect();
    if params.orientation == NormalOrientation::AwayFromCentroid {
        out.orient_normals_outward();
    }

    tracker.report_now(1.0, "normals estimated")?;
    debug!(
        retained = out.len(),
        skipped = skipped.len(),
        "Normal estimation finished"
    );

    Ok(NormalEstimate {
        points: out,
        skipped,
    })
}

enum PlaneFit {
    Fitted {
        normal: Vector3<f64>,
        neighbors: Vec<u32>,
    },
    Insufficient {
        found: usize,
    },
}

fn fit_plane(index: &SpatialIndex, i: usize, params: &NormalParams) -> PlaneFit {
    let mut nbrs = index.k_nearest_distinct_of(i, params.k);
    if let Some(r) = params.radius {
        nbrs.retain(|n| n.distance <= r);
    }
    if nbrs.len() < MIN_NEIGHBORS {
        return PlaneFit::Insufficient { found: nbrs.len() };
    }

    let origin = index.position(i);
    let count = (nbrs.len() + 1) as f64;
    let centroid = nbrs
        .iter()
        .fold(origin.coords, |acc, n| acc + index.position(n.id).coords)
        / count;

    let mut cov = Matrix3::zeros();
    let d = origin.coords - centroid;
    cov += d * d.transpose();
    for n in &nbrs {
        let d = index.position(n.id).coords - centroid;
        cov += d * d.transpose();
    }

    let eig = cov.symmetric_eigen();
    let mut spread: Vec<f64> = eig.eigenvalues.iter().map(|v| v.abs()).collect();
    spread.sort_unstable_by(f64::total_cmp);
    // Collinear or coincident neighborhoods leave the plane unconstrained.
    if !(spread[1] > PLANE_EPS * spread[2]) {
        return PlaneFit::Insufficient { found: nbrs.len() };
    }
    let min_idx = eig.eigenvalues.imin();
    let v = eig.eigenvectors.column(min_idx).into_owned();
    let norm = v.norm();
    if !(norm.is_finite() && norm > 1e-12) {
        return PlaneFit::Insufficient { found: nbrs.len() };
    }
    let normal = v / norm;

    PlaneFit::Fitted {
        normal,
        neighbors: nbrs
            .iter()
            .take(ORIENTATION_NEIGHBORS)
            .map(|n| n.id as u32)
            .collect(),
    }
}

/// Flip normals so each agrees with its parent in a minimum spanning tree of
/// the neighbor graph. `heights` is the z coordinate per point.
fn orient_along_spanning_tree(normals: &mut [Vector3<f64>], neighbors: &[Vec<u32>], heights: &[f64]) {
    let n = normals.len();
    if n == 0 {
        return;
    }

    let mut graph: UnGraph<(), f64> = UnGraph::with_capacity(n, n * ORIENTATION_NEIGHBORS);
    for _ in 0..n {
        graph.add_node(());
    }
    for (i, nbrs) in neighbors.iter().enumerate() {
        for &j in nbrs {
            let j = j as usize;
            // Keep one edge per pair.
            if j > i || !neighbors[j].contains(&(i as u32)) {
                let w = 1.0 - normals[i].dot(&normals[j]).abs();
                graph.add_edge(NodeIndex::new(i), NodeIndex::new(j), w.max(0.0));
            }
        }
    }

    let mut tree: Vec<Vec<usize>> = vec![Vec::new(); n];
    for element in min_spanning_tree(&graph) {
        if let Element::Edge { source, target, .. } = element {
            tree[source].push(target);
            tree[target].push(source);
        }
    }

    // Visiting roots from the top down makes each component's first root its
    // highest point.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| heights[b].total_cmp(&heights[a]).then(a.cmp(&b)));

    let mut visited = vec![false; n];
    let mut stack = Vec::new();
    let mut components = 0usize;
    let mut flipped = 0usize;
    for root in order {
        if visited[root] {
            continue;
        }
        components += 1;
        visited[root] = true;
        if normals[root].z < 0.0 {
            normals[root] = -normals[root];
            flipped += 1;
        }
        stack.push(root);
        while let Some(parent) = stack.pop() {
            for &child in &tree[parent] {
                if visited[child] {
                    continue;
                }
                visited[child] = true;
                if normals[child].dot(&normals[parent]) < 0.0 {
                    normals[child] = -normals[child];
                    flipped += 1;
                }
                stack.push(child);
            }
        }
    }

    debug!(components, flipped, "Propagated normal orientation");
}
