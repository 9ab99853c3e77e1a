//! Point cloud to surface mesh reconstruction.
//!
//! This crate turns an unorganized point cloud into a triangle mesh through a
//! fixed sequence of stages:
//!
//! - **Outlier filtering**: statistical removal of points whose mean neighbor
//!   distance is far above the cloud's average
//! - **Normal estimation**: PCA tangent planes over k nearest neighbors, with
//!   signs made consistent along a minimum spanning tree
//! - **Downsampling**: one centroid per occupied voxel
//! - **Surface reconstruction**: screened Poisson reconstruction on an adaptive
//!   octree, followed by isosurface extraction and optional density trimming
//!
//! Each stage is usable on its own. The [`Pipeline`] runs them in order under a
//! [`ReconConfig`], reports progress, and honors cooperative cancellation.
//!
//! # Units
//!
//! All lengths (voxel size, normal search radius) are in the units of the input
//! coordinates. No unit conversion or coordinate transform is performed.
//!
//! # Quick Start
//!
//! ```
//! use surface_recon::{Pipeline, PointSet, ReconConfig};
//!
//! // A 12x12x12 grid of points on the surface of a cube.
//! let mut points = PointSet::new();
//! for i in 0..12 {
//!     for j in 0..12 {
//!         let (u, v) = (i as f64 / 11.0, j as f64 / 11.0);
//!         for (x, y, z) in [
//!             (0.0, u, v), (1.0, u, v),
//!             (u, 0.0, v), (u, 1.0, v),
//!             (u, v, 0.0), (u, v, 1.0),
//!         ] {
//!             points.push_coords(x, y, z);
//!         }
//!     }
//! }
//!
//! let config = ReconConfig {
//!     enable_filtering: false,
//!     normal_k: 10,
//!     voxel_size: 0.0,
//!     poisson_depth: 5,
//!     poisson_full_depth: 3,
//!     ..Default::default()
//! };
//!
//! match Pipeline::new(config).run(points).into_result() {
//!     Ok(mesh) => println!("{} vertices, {} faces", mesh.vertex_count(), mesh.face_count()),
//!     Err(failure) => eprintln!("{}", failure),
//! }
//! ```
//!
//! # Using Stages Directly
//!
//! ```
//! use surface_recon::{NormalParams, OutlierParams, PointSet, SpatialIndex};
//! use surface_recon::{estimate_normals, remove_outliers, voxel_downsample};
//!
//! let mut cloud = PointSet::new();
//! for i in 0..20 {
//!     for j in 0..20 {
//!         cloud.push_coords(i as f64 * 0.1, j as f64 * 0.1, 0.0);
//!     }
//! }
//! cloud.push_coords(1.0, 1.0, 500.0);
//!
//! let index = SpatialIndex::build(&cloud).unwrap();
//! assert_eq!(index.k_nearest_of(0, 4).len(), 4);
//!
//! let filtered = remove_outliers(&cloud, &OutlierParams { k: 8, std_dev_multiplier: 1.0 }).unwrap();
//! assert_eq!(filtered.removed, vec![400]);
//!
//! let oriented = estimate_normals(&filtered.points, &NormalParams::with_k(8)).unwrap();
//! let reduced = voxel_downsample(&oriented.points, 0.25).unwrap();
//! assert!(reduced.len() < oriented.points.len());
//! ```
//!
//! # Errors
//!
//! Every fallible operation returns [`ReconResult`]. [`ReconError`] implements
//! [`miette::Diagnostic`], carries a stable [`ErrorCode`], and offers a
//! [`RecoverySuggestion`]. Inside the pipeline the first fatal error is wrapped
//! in a [`StageFailure`] naming the stage it came from.
//!
//! # Logging
//!
//! The crate emits `tracing` events and spans but never installs a subscriber.
//! Stage timings are logged under the `surface_recon::timing` target.

mod error;
mod types;

pub mod config;
pub mod downsample;
pub mod normals;
pub mod outlier;
pub mod pipeline;
pub mod poisson;
pub mod progress;
pub mod spatial;
pub mod tracing_ext;

pub use error::{ErrorCode, ReconError, ReconResult, RecoverySuggestion};
pub use types::{CloudPoint, Mesh, PointSet, Vertex, VertexColor};

pub use config::ReconConfig;
pub use pipeline::{
    Artifact, MeshSink, Pipeline, PipelineOutcome, PipelineReport, PipelineState, PointSource,
    Stage, StageContext, StageFailure, StageTiming, transition,
};

// Re-export stage entry points
pub use downsample::{voxel_downsample, voxel_downsample_with_progress};
pub use normals::{
    NeighborPolicy, NormalEstimate, NormalOrientation, NormalParams, estimate_normals,
    estimate_normals_with_progress,
};
pub use outlier::{OutlierParams, OutlierReport, remove_outliers, remove_outliers_with_progress};
pub use poisson::{
    PoissonParams, ReconstructionOutput, ReconstructionStats, reconstruct,
    reconstruct_with_progress,
};
pub use spatial::{Neighbor, SpatialIndex};

// Re-export progress tracking types for long-running stages
pub use progress::{CancellationToken, Progress, ProgressCallback, ProgressTracker};

// Re-export tracing extensions for structured logging and performance monitoring
pub use tracing_ext::{OperationTimer, log_cloud_stats, log_mesh_stats};
