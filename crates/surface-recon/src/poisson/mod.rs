//! Screened Poisson surface reconstruction over an adaptive octree.
//!
//! Stages:
//! 1. Map the oriented samples into a unit cube around their bounding box.
//! 2. Build an adaptive octree, refined where samples are dense.
//! 3. Solve for an indicator-like function whose gradient matches the sample
//!    normals, coarse level first, each finer level adding a correction.
//! 4. Pick the isovalue as the mean function value over the samples.
//! 5. Polygonize the level set over the octree leaves.
//! 6. Optionally trim vertices in low-density regions.
//!
//! Normals must point out of the solid; the function then increases outward
//! and output triangles face outward.

pub mod extract;
pub mod octree;
pub mod solver;
pub mod trim;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ReconError, ReconResult};
use crate::pipeline::Stage;
use crate::progress::ProgressTracker;
use crate::tracing_ext::{OperationTimer, log_mesh_stats};
use crate::types::{Mesh, PointSet, Vertex};

pub use extract::{ExtractedSurface, extract_isosurface};
pub use octree::{NodeId, Octree, OctreeNode, OctreeParams, Sample};
pub use solver::{ImplicitFunction, LevelStats, SolverParams};
pub use trim::{trim_low_density, vertex_densities};

/// Deepest supported octree.
pub const MAX_DEPTH: u8 = 12;

/// Parameters for Poisson reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoissonParams {
    /// Maximum octree depth.
    pub depth: u8,
    /// The octree is complete down to this depth.
    pub full_depth: u8,
    /// Weight of the interpolation (screening) term against smoothness.
    pub point_weight: f64,
    /// Nodes holding more samples than this are refined.
    pub samples_per_node: f64,
    /// Ratio between the reconstruction cube and the bounding box.
    pub scale: f64,
    /// Relative residual target per level.
    pub solver_tolerance: f64,
    /// Iteration bound per level.
    pub solver_max_iterations: usize,
    /// Vertices below this density are removed (0 disables).
    pub density_trim_threshold: f64,
    /// Vertices below this density quantile are removed.
    pub density_trim_quantile: Option<f64>,
}

impl Default for PoissonParams {
    fn default() -> Self {
        Self {
            depth: 8,
            full_depth: 5,
            point_weight: 4.0,
            samples_per_node: 1.5,
            scale: 1.1,
            solver_tolerance: 1e-6,
            solver_max_iterations: 2000,
            density_trim_threshold: 0.0,
            density_trim_quantile: None,
        }
    }
}

impl PoissonParams {
    /// Default parameters at the given depth.
    pub fn with_depth(depth: u8) -> Self {
        Self {
            depth,
            ..Default::default()
        }
    }

    /// Check ranges.
    pub fn validate(&self) -> ReconResult<()> {
        if self.depth == 0 || self.depth > MAX_DEPTH {
            return Err(ReconError::invalid_config(
                "poisson_depth",
                format!("must be in 1..={}, got {}", MAX_DEPTH, self.depth),
            ));
        }
        if !(self.point_weight.is_finite() && self.point_weight >= 0.0) {
            return Err(ReconError::invalid_config(
                "poisson_point_weight",
                format!("must be non-negative, got {}", self.point_weight),
            ));
        }
        if !(self.samples_per_node.is_finite() && self.samples_per_node > 0.0) {
            return Err(ReconError::invalid_config(
                "poisson_samples_per_node",
                format!("must be positive, got {}", self.samples_per_node),
            ));
        }
        if !(self.scale.is_finite() && self.scale >= 1.0) {
            return Err(ReconError::invalid_config(
                "poisson_scale",
                format!("must be at least 1, got {}", self.scale),
            ));
        }
        if !(self.solver_tolerance.is_finite() && self.solver_tolerance > 0.0) {
            return Err(ReconError::invalid_config(
                "solver_tolerance",
                format!("must be positive, got {}", self.solver_tolerance),
            ));
        }
        if self.solver_max_iterations == 0 {
            return Err(ReconError::invalid_config(
                "solver_max_iterations",
                "must be at least 1",
            ));
        }
        if !(self.density_trim_threshold.is_finite() && self.density_trim_threshold >= 0.0) {
            return Err(ReconError::invalid_config(
                "density_trim_threshold",
                format!("must be non-negative, got {}", self.density_trim_threshold),
            ));
        }
        if let Some(q) = self.density_trim_quantile {
            if !(0.0..1.0).contains(&q) {
                return Err(ReconError::invalid_config(
                    "density_trim_quantile",
                    format!("must be in [0, 1), got {}", q),
                ));
            }
        }
        Ok(())
    }
}

/// Statistics from one reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionStats {
    pub input_points: usize,
    pub octree_nodes: usize,
    pub octree_depth: u8,
    pub nodes_per_depth: Vec<usize>,
    pub levels: Vec<LevelStats>,
    pub isovalue: f64,
    pub extracted_vertices: usize,
    pub extracted_faces: usize,
    pub trimmed_vertices: usize,
}

impl ReconstructionStats {
    /// Solver iterations summed over levels.
    pub fn total_iterations(&self) -> usize {
        self.levels.iter().map(|l| l.iterations).sum()
    }
}

/// Mesh plus per-vertex sample density.
#[derive(Debug, Clone)]
pub struct ReconstructionOutput {
    pub mesh: Mesh,
    /// One entry per mesh vertex.
    pub densities: Vec<f64>,
    pub stats: ReconstructionStats,
}

/// Maps world positions into the unit reconstruction cube and back.
#[derive(Debug, Clone, Copy)]
struct UnitCube {
    center: Point3<f64>,
    edge: f64,
}

impl UnitCube {
    fn around(points: &PointSet, scale: f64) -> ReconResult<Self> {
        let (min, max) = points
            .bounds()
            .ok_or_else(|| ReconError::degenerate_input("no points to reconstruct"))?;
        let extent = (max - min).max();
        if extent <= 0.0 {
            return Err(ReconError::degenerate_input(
                "points have zero spatial extent",
            ));
        }
        Ok(Self {
            center: nalgebra::center(&min, &max),
            edge: extent * scale,
        })
    }

    #[inline]
    fn to_unit(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from((p - self.center) / self.edge + Vector3::repeat(0.5))
    }

    #[inline]
    fn to_world(&self, u: &Point3<f64>) -> Point3<f64> {
        self.center + (u.coords - Vector3::repeat(0.5)) * self.edge
    }
}

/// Reconstruct a mesh from oriented points.
pub fn reconstruct(points: &PointSet, params: &PoissonParams) -> ReconResult<ReconstructionOutput> {
    reconstruct_with_progress(points, params, &ProgressTracker::silent(Stage::Reconstructing))
}

/// [`reconstruct`] with progress reporting and cancellation.
pub fn reconstruct_with_progress(
    points: &PointSet,
    params: &PoissonParams,
    tracker: &ProgressTracker<'_>,
) -> ReconResult<ReconstructionOutput> {
    params.validate()?;
    if points.is_empty() {
        return Err(ReconError::degenerate_input("no points to reconstruct"));
    }
    if let Some(i) = points.first_non_finite() {
        return Err(ReconError::degenerate_input(format!(
            "point {} has a non-finite coordinate",
            i
        )));
    }

    let usable_normal = |n: &Option<Vector3<f64>>| {
        n.is_some_and(|n| n.iter().all(|c| c.is_finite()) && n.norm() > 1e-12)
    };
    let missing = points
        .points
        .iter()
        .filter(|p| !usable_normal(&p.normal))
        .count();
    if missing > 0 {
        return Err(ReconError::missing_normals(missing, points.len()));
    }

    let _timer = OperationTimer::with_points("poisson_reconstruct", points.len());
    let cube = UnitCube::around(points, params.scale)?;

    let samples: Vec<Sample> = points
        .points
        .iter()
        .filter_map(|p| {
            let n = p.normal?;
            Some(Sample {
                position: cube.to_unit(&p.position),
                normal: n.normalize(),
            })
        })
        .collect();

    tracker.report_now(0.0, "building octree")?;
    let octree = Octree::build(
        &samples,
        &OctreeParams {
            max_depth: params.depth,
            full_depth: params.full_depth,
            samples_per_node: params.samples_per_node,
        },
    );

    // Area represented by each sample: its leaf's face area shared among the
    // leaf's samples.
    let areas: Vec<f64> = samples
        .par_iter()
        .map(|s| {
            let leaf = octree.node(octree.locate(&s.position, u8::MAX));
            leaf.width().powi(2) / leaf.samples.max(1) as f64
        })
        .collect();

    let solver_params = SolverParams {
        point_weight: params.point_weight,
        tolerance: params.solver_tolerance,
        max_iterations: params.solver_max_iterations,
    };
    let (function, levels) =
        solver::solve_levels(&octree, &samples, &areas, &solver_params, tracker, (0.1, 0.75))?;

    let values: Vec<f64> = samples
        .par_iter()
        .map(|s| function.evaluate(&s.position))
        .collect();
    let isovalue = values.iter().sum::<f64>() / values.len() as f64;

    tracker.report_now(0.75, "extracting isosurface")?;
    let surface = extract_isosurface(&octree, &function, isovalue, tracker, (0.75, 0.95))?;
    let extracted_vertices = surface.positions.len();
    let extracted_faces = surface.faces.len();

    let reference_depth = params.depth.saturating_sub(2);
    let mut densities = vertex_densities(&octree, &surface.positions, reference_depth);

    let mut mesh = Mesh::with_capacity(surface.positions.len(), surface.faces.len());
    mesh.vertices = surface
        .positions
        .iter()
        .map(|u| Vertex::new(cube.to_world(u)))
        .collect();
    mesh.faces = surface.faces;

    tracker.checkpoint()?;
    let trimmed_vertices = trim_low_density(
        &mut mesh,
        &mut densities,
        params.density_trim_threshold,
        params.density_trim_quantile,
    );
    mesh.compute_vertex_normals();

    let stats = ReconstructionStats {
        input_points: points.len(),
        octree_nodes: octree.nodes.len(),
        octree_depth: octree.max_depth(),
        nodes_per_depth: octree.nodes_per_depth(),
        levels,
        isovalue,
        extracted_vertices,
        extracted_faces,
        trimmed_vertices,
    };

    if mesh.is_empty() {
        warn!(points = points.len(), "Reconstruction produced an empty mesh");
    }
    log_mesh_stats(&mesh, "poisson output");
    info!(
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        isovalue = isovalue,
        solver_iterations = stats.total_iterations(),
        coefficients = function.coefficient_count(),
        "Poisson reconstruction finished"
    );
    tracker.report_now(1.0, "reconstructed")?;

    Ok(ReconstructionOutput {
        mesh,
        densities,
        stats,
    })
}
