//! End-to-end scenarios for the reconstruction pipeline.
//!
//! Run with: cargo test -p surface-recon --test pipeline_scenarios

use std::sync::{Arc, Mutex};

use nalgebra::{Point3, Vector3};
use surface_recon::{
    CancellationToken, CloudPoint, Mesh, MeshSink, OutlierParams, Pipeline, PipelineState,
    PointSet, ProgressCallback, ReconConfig, ReconError, ReconResult, SpatialIndex, Stage,
    remove_outliers,
};

// =============================================================================
// Fixtures
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Points evenly spread over a sphere, without normals.
fn fibonacci_sphere(n: usize, radius: f64, center: Point3<f64>) -> PointSet {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    let positions: Vec<Point3<f64>> = (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f64;
            center + Vector3::new(r * theta.cos(), y, r * theta.sin()) * radius
        })
        .collect();
    PointSet::from_positions(&positions)
}

fn sphere_config() -> ReconConfig {
    ReconConfig {
        outlier_k: 8,
        normal_k: 12,
        voxel_size: 0.0,
        poisson_depth: 5,
        poisson_full_depth: 3,
        ..Default::default()
    }
}

/// Collects whatever the pipeline hands over.
#[derive(Default)]
struct CollectingSink {
    meshes: Vec<Mesh>,
    transitions: Vec<(Stage, f64)>,
}

impl MeshSink for CollectingSink {
    fn on_mesh_produced(&mut self, mesh: &Mesh) {
        self.meshes.push(mesh.clone());
    }

    fn on_progress(&mut self, stage: Stage, fraction: f64) {
        self.transitions.push((stage, fraction));
    }
}

// =============================================================================
// Round trip
// =============================================================================

#[test]
fn test_sphere_round_trip() {
    init_tracing();
    let center = Point3::new(3.0, -1.0, 2.0);
    let radius = 1.5;
    let mut sink = CollectingSink::default();

    let outcome = Pipeline::new(sphere_config())
        .run_with(fibonacci_sphere(2000, radius, center), &mut sink);

    assert!(outcome.is_done(), "failed: {:?}", outcome.failure());
    assert_eq!(sink.meshes.len(), 1);
    let mesh = outcome.mesh.as_ref().unwrap();
    assert_eq!(&sink.meshes[0], mesh);
    assert!(mesh.face_count() > 100);
    assert!(mesh.validate_indices());

    let mut total_error = 0.0;
    for v in &mesh.vertices {
        let error = ((v.position - center).norm() - radius).abs();
        assert!(error < 0.15 * radius, "vertex {:?} is {} off the sphere", v.position, error);
        total_error += error;
    }
    assert!(total_error / (mesh.vertex_count() as f64) < 0.05 * radius);
}

#[test]
fn test_sphere_round_trip_fine_depth() {
    let center = Point3::new(-2.0, 0.5, 1.0);
    let radius = 1.5;
    let config = ReconConfig {
        poisson_depth: 7,
        ..sphere_config()
    };

    let outcome = Pipeline::new(config).run(fibonacci_sphere(8000, radius, center));
    let mesh = outcome.into_result().unwrap();

    let errors: Vec<f64> = mesh
        .vertices
        .iter()
        .map(|v| ((v.position - center).norm() - radius).abs())
        .collect();
    let worst = errors.iter().copied().fold(0.0, f64::max);
    let mean = errors.iter().sum::<f64>() / errors.len() as f64;
    assert!(worst < 0.04 * radius, "worst vertex error {}", worst);
    assert!(mean < 0.02 * radius, "mean vertex error {}", mean);
}

#[test]
fn test_coincident_cluster_on_surface() {
    let mut cloud = fibonacci_sphere(1000, 1.0, Point3::origin());
    let spot = cloud.points[500].position;
    for _ in 0..40 {
        cloud.push(CloudPoint::new(spot));
    }

    let mut sink = CollectingSink::default();
    let outcome = Pipeline::new(sphere_config()).run_with(cloud, &mut sink);

    assert!(outcome.is_done(), "failed: {:?}", outcome.failure());
    assert_eq!(outcome.report.original_points, 1040);
    assert_eq!(outcome.report.oriented_points, Some(outcome.report.filtered_points.unwrap()));
    assert_eq!(outcome.report.skipped_normals, 0);
    assert_eq!(sink.meshes.len(), 1);

    let mesh = outcome.mesh.unwrap();
    assert!(mesh.validate_indices());
    assert!(mesh.face_count() > 100);
    for v in &mesh.vertices {
        assert!(((v.position - Point3::origin()).norm() - 1.0).abs() < 0.15);
    }
}

#[test]
fn test_thin_sheet_survives_downsampling() {
    // Both faces of a plate 1 mm thick, with outward normals, downsampled
    // with voxels larger than the thickness.
    let mut cloud = PointSet::new();
    for i in 0..40 {
        for j in 0..40 {
            let (x, y) = (i as f64 * 0.025 + 0.001, j as f64 * 0.025 + 0.001);
            cloud.push(CloudPoint::with_normal(Point3::new(x, y, 0.5001), -Vector3::z()));
            cloud.push(CloudPoint::with_normal(Point3::new(x, y, 0.5011), Vector3::z()));
        }
    }
    let config = ReconConfig {
        enable_filtering: false,
        enable_normal_estimation: false,
        voxel_size: 0.05,
        poisson_depth: 5,
        poisson_full_depth: 3,
        ..Default::default()
    };

    let outcome = Pipeline::new(config).run(cloud);
    assert!(outcome.is_done(), "failed: {:?}", outcome.failure());
    assert_eq!(outcome.report.downsampled_points, Some(400));
    assert_eq!(outcome.report.final_points, 400);
}

#[test]
fn test_unit_square_with_supplied_normals() {
    let mut cloud = PointSet::new();
    for (x, y) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
        cloud.push(CloudPoint::with_normal(Point3::new(x, y, 0.0), Vector3::z()));
    }
    let config = ReconConfig {
        enable_filtering: false,
        enable_normal_estimation: false,
        voxel_size: 0.0,
        poisson_depth: 3,
        ..Default::default()
    };

    let outcome = Pipeline::new(config).run(cloud);
    let mesh = outcome.into_result().unwrap();
    assert!(mesh.face_count() >= 2);
    assert!(
        mesh.vertices
            .iter()
            .all(|v| v.position.iter().all(|c| c.is_finite()))
    );
}

// =============================================================================
// Filtering
// =============================================================================

#[test]
fn test_extreme_outlier_removed() {
    let mut cloud = PointSet::new();
    for i in 0..5 {
        for j in 0..5 {
            for k in 0..5 {
                cloud.push_coords(i as f64, j as f64, k as f64);
            }
        }
    }
    let span = cloud.span();
    cloud.push_coords(1000.0 * span, 0.0, 0.0);

    let report = remove_outliers(
        &cloud,
        &OutlierParams {
            k: 8,
            std_dev_multiplier: 1.0,
        },
    )
    .unwrap();

    assert_eq!(report.removed, vec![125]);
    assert_eq!(report.points.len(), 125);
}

#[test]
fn test_pipeline_drops_outlier_before_reconstruction() {
    let mut cloud = fibonacci_sphere(800, 1.0, Point3::origin());
    let span = cloud.span();
    cloud.push_coords(0.0, 1000.0 * span, 0.0);

    let config = ReconConfig {
        outlier_std_dev: 1.0,
        ..sphere_config()
    };
    let outcome = Pipeline::new(config).run(cloud);
    assert!(outcome.is_done(), "failed: {:?}", outcome.failure());
    assert_eq!(outcome.report.original_points, 801);
    assert_eq!(outcome.report.removed_outliers, 1);
    assert_eq!(outcome.report.filtered_points, Some(800));

    let (_, max) = outcome.mesh.unwrap().bounds().unwrap();
    assert!(max.y < 2.0);
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_empty_index_is_degenerate() {
    let err = SpatialIndex::build(&PointSet::new()).unwrap_err();
    assert!(matches!(err, ReconError::DegenerateInput { .. }));
}

#[test]
fn test_loader_error_fails_loading() {
    let outcome = Pipeline::new(sphere_config()).run_with(
        || -> ReconResult<PointSet> { Err(ReconError::degenerate_input("scanner returned no frames")) },
        &mut (),
    );
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::Loading);
    assert!(failure.to_string().contains("scanner returned no frames"));
}

#[test]
fn test_cancel_mid_solve() {
    let token = CancellationToken::new();
    let flag = token.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_callback = Arc::clone(&seen);

    // Cancel from inside the solve; the solver must notice at its next poll.
    let callback: ProgressCallback = Box::new(move |p| {
        if let Ok(mut seen) = seen_in_callback.lock() {
            seen.push(p.message.clone());
        }
        if p.stage == Stage::Reconstructing && p.message == "solving depth 2" {
            flag.cancel();
        }
        true
    });

    let mut sink = CollectingSink::default();
    let outcome = Pipeline::new(sphere_config())
        .with_progress(callback)
        .with_cancellation(token)
        .run_with(fibonacci_sphere(1000, 1.0, Point3::origin()), &mut sink);

    match &outcome.state {
        PipelineState::Failed(failure) => {
            assert_eq!(failure.stage, Stage::Reconstructing);
            assert!(matches!(
                failure.error,
                ReconError::Cancelled {
                    stage: Stage::Reconstructing
                }
            ));
        }
        other => panic!("Expected Failed(Cancelled), got {:?}", other),
    }
    assert!(outcome.mesh.is_none());
    assert!(sink.meshes.is_empty());
    assert!(!sink.transitions.iter().any(|(s, _)| *s == Stage::Reconstructing));

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|m| m == "solving depth 2"));
    assert!(!seen.iter().any(|m| m == "extracting isosurface"));
}

#[test]
fn test_callback_veto_cancels() {
    let callback: ProgressCallback = Box::new(|p| p.stage != Stage::EstimatingNormals);
    let outcome = Pipeline::new(sphere_config())
        .with_progress(callback)
        .run(fibonacci_sphere(300, 1.0, Point3::origin()));

    let failure = outcome.failure().unwrap();
    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, Stage::EstimatingNormals);
    assert!(outcome.report.filtered_points.is_some());
    assert!(outcome.report.oriented_points.is_none());
}

// =============================================================================
// Configuration and reporting
// =============================================================================

#[cfg(feature = "config-files")]
#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recon.toml");

    let config = ReconConfig {
        voxel_size: 0.02,
        density_trim_quantile: Some(0.05),
        ..ReconConfig::preset_fast_preview()
    };
    config.save_toml(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("voxel_size = 0.02"));
    assert_eq!(ReconConfig::from_toml_file(&path).unwrap(), config);
}

#[cfg(feature = "config-files")]
#[test]
fn test_report_json() {
    let outcome = Pipeline::new(sphere_config()).run(fibonacci_sphere(600, 1.0, Point3::origin()));
    assert!(outcome.is_done());

    let json = outcome.report.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["original_points"], 600);
    assert!(value["solver_levels"].as_array().is_some_and(|l| !l.is_empty()));
    assert_eq!(value["stage_timings"][0]["stage"], "loading");
}
