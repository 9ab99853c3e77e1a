//! Pipeline orchestration.
//!
//! The pipeline is a state machine:
//!
//! ```text
//! Idle -> Loading -> Filtering -> EstimatingNormals -> Downsampling -> Reconstructing -> Done
//! ```
//!
//! with a terminal `Failed` reachable from every non-terminal state. A stage
//! disabled by the configuration is skipped, giving an edge straight to the
//! next enabled state. [`transition`] performs one step; [`Pipeline`] drives
//! it to a terminal state, owning the single current artifact passed between
//! stages.
//!
//! # Example
//!
//! ```
//! use surface_recon::{Pipeline, PointSet, ReconConfig};
//! use nalgebra::Point3;
//!
//! let positions: Vec<Point3<f64>> = (0..400)
//!     .map(|i| {
//!         let t = i as f64 * 2.399963;
//!         let z = 1.0 - 2.0 * (i as f64 + 0.5) / 400.0;
//!         let r = (1.0 - z * z).sqrt();
//!         Point3::new(r * t.cos(), r * t.sin(), z)
//!     })
//!     .collect();
//!
//! let config = ReconConfig {
//!     normal_k: 12,
//!     voxel_size: 0.0,
//!     poisson_depth: 5,
//!     poisson_full_depth: 3,
//!     ..Default::default()
//! };
//!
//! let outcome = Pipeline::new(config).run(PointSet::from_positions(&positions));
//! assert!(outcome.is_done());
//! println!("{} triangles", outcome.mesh.map_or(0, |m| m.face_count()));
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ReconConfig;
use crate::downsample::voxel_downsample_with_progress;
use crate::error::{ReconError, ReconResult};
use crate::normals::estimate_normals_with_progress;
use crate::outlier::remove_outliers_with_progress;
use crate::poisson::{LevelStats, reconstruct_with_progress};
use crate::progress::{CancellationToken, ProgressCallback, ProgressTracker};
use crate::tracing_ext::{log_cloud_stats, log_mesh_stats};
use crate::types::{Mesh, PointSet};

/// A pipeline stage, as named in progress reports and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loading,
    Filtering,
    EstimatingNormals,
    Downsampling,
    Reconstructing,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Loading,
        Stage::Filtering,
        Stage::EstimatingNormals,
        Stage::Downsampling,
        Stage::Reconstructing,
    ];

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Loading => "loading",
            Stage::Filtering => "filtering",
            Stage::EstimatingNormals => "estimating normals",
            Stage::Downsampling => "downsampling",
            Stage::Reconstructing => "reconstructing",
        }
    }

    /// Whether the configuration runs this stage.
    pub fn is_enabled(&self, config: &ReconConfig) -> bool {
        match self {
            Stage::Loading | Stage::Reconstructing => true,
            Stage::Filtering => config.enable_filtering,
            Stage::EstimatingNormals => config.enable_normal_estimation,
            Stage::Downsampling => config.downsampling_active(),
        }
    }

    fn state(self) -> PipelineState {
        match self {
            Stage::Loading => PipelineState::Loading,
            Stage::Filtering => PipelineState::Filtering,
            Stage::EstimatingNormals => PipelineState::EstimatingNormals,
            Stage::Downsampling => PipelineState::Downsampling,
            Stage::Reconstructing => PipelineState::Reconstructing,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first fatal error of a run and the stage it occurred in.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: ReconError,
}

impl StageFailure {
    pub fn new(stage: Stage, error: ReconError) -> Self {
        Self { stage, error }
    }

    /// Whether the failure is a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }
}

/// Orchestrator state.
#[derive(Debug)]
pub enum PipelineState {
    Idle,
    Loading,
    Filtering,
    EstimatingNormals,
    Downsampling,
    Reconstructing,
    Done,
    Failed(StageFailure),
}

impl PipelineState {
    /// The stage this state runs, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Loading => Some(Stage::Loading),
            PipelineState::Filtering => Some(Stage::Filtering),
            PipelineState::EstimatingNormals => Some(Stage::EstimatingNormals),
            PipelineState::Downsampling => Some(Stage::Downsampling),
            PipelineState::Reconstructing => Some(Stage::Reconstructing),
            PipelineState::Idle | PipelineState::Done | PipelineState::Failed(_) => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }
}

/// First enabled state after `stage`.
fn next_state(stage: Option<Stage>, config: &ReconConfig) -> PipelineState {
    let start = match stage {
        None => 0,
        Some(s) => Stage::ALL.iter().position(|&x| x == s).map_or(0, |i| i + 1),
    };
    Stage::ALL[start.min(Stage::ALL.len())..]
        .iter()
        .find(|s| s.is_enabled(config))
        .map_or(PipelineState::Done, |s| s.state())
}

/// The data passed between stages.
#[derive(Debug, Clone, Default)]
pub enum Artifact {
    #[default]
    Empty,
    Points(PointSet),
    Mesh(Mesh),
}

/// Ingestion boundary: supplies the raw point set.
pub trait PointSource {
    fn load_point_set(&mut self) -> ReconResult<PointSet>;
}

impl PointSource for PointSet {
    fn load_point_set(&mut self) -> ReconResult<PointSet> {
        Ok(std::mem::take(self))
    }
}

impl<F> PointSource for F
where
    F: FnMut() -> ReconResult<PointSet>,
{
    fn load_point_set(&mut self) -> ReconResult<PointSet> {
        self()
    }
}

/// Export boundary: receives the finished mesh and stage transitions.
pub trait MeshSink {
    /// Called once, only when the run reaches `Done`.
    fn on_mesh_produced(&mut self, mesh: &Mesh);

    /// Called after every stage transition.
    fn on_progress(&mut self, _stage: Stage, _fraction: f64) {}
}

impl MeshSink for () {
    fn on_mesh_produced(&mut self, _mesh: &Mesh) {}
}

/// Wall time of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub millis: f64,
}

/// Counts and timings collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub original_points: usize,
    /// Points after outlier filtering, when it ran.
    pub filtered_points: Option<usize>,
    pub removed_outliers: usize,
    /// Points carrying normals after estimation, when it ran.
    pub oriented_points: Option<usize>,
    /// Points dropped for having too few neighbors.
    pub skipped_normals: usize,
    /// Points after downsampling, when it ran.
    pub downsampled_points: Option<usize>,
    /// Points handed to reconstruction.
    pub final_points: usize,
    pub mesh_vertices: usize,
    pub mesh_faces: usize,
    pub trimmed_vertices: usize,
    pub isovalue: Option<f64>,
    pub solver_levels: Vec<LevelStats>,
    pub stage_timings: Vec<StageTiming>,
}

impl PipelineReport {
    /// Total solver iterations over all levels.
    pub fn solver_iterations(&self) -> usize {
        self.solver_levels.iter().map(|l| l.iterations).sum()
    }

    /// Wall time of a stage, if it ran.
    pub fn stage_millis(&self, stage: Stage) -> Option<f64> {
        self.stage_timings
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.millis)
    }

    /// Serialize to pretty JSON.
    #[cfg(feature = "config-files")]
    pub fn to_json(&self) -> ReconResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ReconError::ConfigParse {
            format: "JSON",
            details: e.to_string(),
        })
    }
}

/// Everything a stage needs beyond its input artifact.
pub struct StageContext<'a> {
    pub source: &'a mut dyn PointSource,
    pub token: CancellationToken,
    pub callback: Option<&'a ProgressCallback>,
    pub progress_interval: Duration,
    pub report: PipelineReport,
}

impl<'a> StageContext<'a> {
    fn tracker(&self, stage: Stage) -> ProgressTracker<'a> {
        ProgressTracker::new(stage, self.token.clone(), self.callback)
            .with_interval(self.progress_interval)
    }
}

fn take_points(stage: Stage, artifact: Artifact) -> ReconResult<PointSet> {
    match artifact {
        Artifact::Points(points) => Ok(points),
        Artifact::Empty => Err(ReconError::degenerate_input(format!(
            "{} received no point set",
            stage
        ))),
        Artifact::Mesh(_) => Err(ReconError::degenerate_input(format!(
            "{} received a mesh instead of a point set",
            stage
        ))),
    }
}

fn run_stage(
    stage: Stage,
    artifact: Artifact,
    config: &ReconConfig,
    ctx: &mut StageContext<'_>,
) -> ReconResult<Artifact> {
    let tracker = ctx.tracker(stage);
    tracker.report_now(0.0, format!("starting {}", stage))?;

    let output = match stage {
        Stage::Loading => {
            let points = ctx.source.load_point_set()?;
            if points.is_empty() {
                return Err(ReconError::degenerate_input("loaded point set is empty"));
            }
            if let Some(i) = points.first_non_finite() {
                return Err(ReconError::degenerate_input(format!(
                    "point {} has a non-finite coordinate",
                    i
                )));
            }
            log_cloud_stats(&points, "loaded");
            ctx.report.original_points = points.len();
            ctx.report.final_points = points.len();
            Artifact::Points(points)
        }
        Stage::Filtering => {
            let points = take_points(stage, artifact)?;
            let filtered =
                remove_outliers_with_progress(&points, &config.outlier_params(), &tracker)?;
            ctx.report.filtered_points = Some(filtered.points.len());
            ctx.report.removed_outliers = filtered.removed.len();
            ctx.report.final_points = filtered.points.len();
            Artifact::Points(filtered.points)
        }
        Stage::EstimatingNormals => {
            let points = take_points(stage, artifact)?;
            let estimate =
                estimate_normals_with_progress(&points, &config.normal_params(), &tracker)?;
            if !estimate.skipped.is_empty() {
                warn!(
                    skipped = estimate.skipped.len(),
                    "Dropped points with too few neighbors"
                );
            }
            ctx.report.oriented_points = Some(estimate.points.len());
            ctx.report.skipped_normals = estimate.skipped.len();
            ctx.report.final_points = estimate.points.len();
            Artifact::Points(estimate.points)
        }
        Stage::Downsampling => {
            let points = take_points(stage, artifact)?;
            let reduced = voxel_downsample_with_progress(&points, config.voxel_size, &tracker)?;
            ctx.report.downsampled_points = Some(reduced.len());
            ctx.report.final_points = reduced.len();
            Artifact::Points(reduced)
        }
        Stage::Reconstructing => {
            let points = take_points(stage, artifact)?;
            let output = reconstruct_with_progress(&points, &config.poisson_params(), &tracker)?;
            log_mesh_stats(&output.mesh, "reconstructed");
            ctx.report.mesh_vertices = output.mesh.vertex_count();
            ctx.report.mesh_faces = output.mesh.face_count();
            ctx.report.trimmed_vertices = output.stats.trimmed_vertices;
            ctx.report.isovalue = Some(output.stats.isovalue);
            ctx.report.solver_levels = output.stats.levels;
            Artifact::Mesh(output.mesh)
        }
    };

    tracker.report_now(1.0, format!("finished {}", stage))?;
    ctx.report.stage_timings.push(StageTiming {
        stage,
        millis: tracker.elapsed().as_secs_f64() * 1000.0,
    });
    Ok(output)
}

/// Advance the state machine by one step.
///
/// `Idle` validates the configuration. A stage state runs its component on
/// the artifact and moves to the next enabled state. Terminal states are
/// returned unchanged. Errors carry the stage they occurred in.
pub fn transition(
    state: PipelineState,
    artifact: Artifact,
    config: &ReconConfig,
    ctx: &mut StageContext<'_>,
) -> Result<(PipelineState, Artifact), StageFailure> {
    match state {
        PipelineState::Done | PipelineState::Failed(_) => Ok((state, artifact)),
        PipelineState::Idle => {
            config
                .validate()
                .map_err(|e| StageFailure::new(Stage::Loading, e))?;
            Ok((next_state(None, config), artifact))
        }
        _ => {
            let Some(stage) = state.stage() else {
                return Ok((state, artifact));
            };
            if ctx.token.is_cancelled() {
                return Err(StageFailure::new(stage, ReconError::cancelled(stage)));
            }
            let output =
                run_stage(stage, artifact, config, ctx).map_err(|e| StageFailure::new(stage, e))?;
            Ok((next_state(Some(stage), config), output))
        }
    }
}

/// Result of a pipeline run.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// `Done` or `Failed`.
    pub state: PipelineState,
    /// The mesh, present only when the run reached `Done`.
    pub mesh: Option<Mesh>,
    pub report: PipelineReport,
}

impl PipelineOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.state, PipelineState::Done)
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match &self.state {
            PipelineState::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// The mesh, or the failure that prevented it.
    pub fn into_result(self) -> Result<Mesh, StageFailure> {
        match (self.state, self.mesh) {
            (PipelineState::Failed(failure), _) => Err(failure),
            (_, Some(mesh)) => Ok(mesh),
            (_, None) => Err(StageFailure::new(
                Stage::Reconstructing,
                ReconError::degenerate_input("pipeline finished without a mesh"),
            )),
        }
    }
}

/// Runs the stages configured by a [`ReconConfig`].
pub struct Pipeline {
    config: ReconConfig,
    callback: Option<ProgressCallback>,
    token: CancellationToken,
}

impl Pipeline {
    pub fn new(config: ReconConfig) -> Self {
        Self {
            config,
            callback: None,
            token: CancellationToken::new(),
        }
    }

    /// Set a progress callback. Returning `false` from it cancels the run.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Use a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    /// A clone of the token this pipeline polls.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Reconstruct a mesh from an in-memory point set.
    pub fn run(&self, points: PointSet) -> PipelineOutcome {
        self.run_with(points, &mut ())
    }

    /// Load from `source`, run every enabled stage, and hand the mesh to
    /// `sink` on success.
    pub fn run_with<S, K>(&self, mut source: S, sink: &mut K) -> PipelineOutcome
    where
        S: PointSource,
        K: MeshSink + ?Sized,
    {
        let started = Instant::now();
        let mut ctx = StageContext {
            source: &mut source,
            token: self.token.clone(),
            callback: self.callback.as_ref(),
            progress_interval: Duration::from_millis(self.config.progress_interval_ms),
            report: PipelineReport::default(),
        };

        let mut state = PipelineState::Idle;
        let mut artifact = Artifact::Empty;

        while !state.is_terminal() {
            let stage = state.stage();
            match transition(state, artifact, &self.config, &mut ctx) {
                Ok((next, output)) => {
                    if let Some(stage) = stage {
                        debug!(stage = %stage, next = ?next, "Stage complete");
                        sink.on_progress(stage, 1.0);
                    }
                    state = next;
                    artifact = output;
                }
                Err(failure) => {
                    warn!(
                        stage = %failure.stage,
                        code = %failure.error.code(),
                        error = %failure.error,
                        "Pipeline failed"
                    );
                    state = PipelineState::Failed(failure);
                    artifact = Artifact::Empty;
                }
            }
        }

        let report = ctx.report;
        let mesh = match (&state, artifact) {
            (PipelineState::Done, Artifact::Mesh(mesh)) => {
                info!(
                    vertices = mesh.vertex_count(),
                    faces = mesh.face_count(),
                    elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "Pipeline complete"
                );
                sink.on_mesh_produced(&mesh);
                Some(mesh)
            }
            _ => None,
        };

        PipelineOutcome {
            state,
            mesh,
            report,
        }
    }
}
