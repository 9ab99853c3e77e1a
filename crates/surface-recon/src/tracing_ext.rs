//! Tracing helpers for reconstruction stages.
//!
//! The library only emits events; installing a subscriber is up to the host
//! application:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//! // RUST_LOG=surface_recon=debug for per-stage detail,
//! // RUST_LOG=surface_recon::timing=info for stage timings only.
//! ```
//!
//! # Log Levels
//!
//! - **WARN**: skipped points, trimmed-away meshes, slow convergence
//! - **INFO**: per-stage summaries and timing
//! - **DEBUG**: octree shape, per-level solver statistics, thresholds
//! - **TRACE**: per-iteration residuals

use nalgebra::Point3;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::{Mesh, PointSet};

/// A performance timer that logs duration on drop.
///
/// The timer enters an `info` span named `recon_operation` for its lifetime,
/// so events emitted by the stage are grouped under it.
///
/// ```rust,ignore
/// fn expensive_stage() {
///     let _timer = OperationTimer::new("expensive_stage");
///     // ... do work ...
/// } // logs elapsed_ms here
/// ```
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
    _span: tracing::span::EnteredSpan,
}

impl OperationTimer {
    /// Create a new operation timer.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("recon_operation", operation = name).entered();
        debug!(target: "surface_recon::timing", operation = name, "Starting operation");
        Self {
            name,
            start: Instant::now(),
            _span: span,
        }
    }

    /// Create a timer that also records the input point count.
    pub fn with_points(name: &'static str, points: usize) -> Self {
        let span =
            tracing::info_span!("recon_operation", operation = name, points = points).entered();
        debug!(
            target: "surface_recon::timing",
            operation = name,
            points = points,
            "Starting operation"
        );
        Self {
            name,
            start: Instant::now(),
            _span: span,
        }
    }

    /// Get the elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        info!(
            target: "surface_recon::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", self.elapsed_ms()),
            "Operation completed"
        );
    }
}

/// Log point set statistics at debug level.
pub fn log_cloud_stats(points: &PointSet, context: &str) {
    let (min, max) = points.bounds().unwrap_or((Point3::origin(), Point3::origin()));
    let dims = max - min;

    debug!(
        target: "surface_recon::cloud_state",
        context = context,
        points = points.len(),
        has_normals = points.has_normals(),
        has_colors = points.has_colors(),
        dimensions = format!("{:.3} x {:.3} x {:.3}", dims.x, dims.y, dims.z),
        "Point set state"
    );
}

/// Log mesh statistics at debug level.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    let (min, max) = mesh.bounds().unwrap_or((Point3::origin(), Point3::origin()));
    let dims = max - min;

    debug!(
        target: "surface_recon::mesh_state",
        context = context,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        dimensions = format!("{:.3} x {:.3} x {:.3}", dims.x, dims.y, dims.z),
        "Mesh state"
    );
}

/// Log one solver iteration at trace level.
#[inline]
pub fn log_solver_iteration(level: u8, iteration: usize, residual: f64) {
    trace!(
        target: "surface_recon::solver",
        level = level,
        iteration = iteration,
        residual = residual,
        "Solver iteration"
    );
}
