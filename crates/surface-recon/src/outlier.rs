//! Statistical outlier removal.
//!
//! For every point the mean distance to its k nearest neighbors is computed.
//! Points whose mean exceeds `mu + multiplier * sigma` over all points are
//! dropped. Survivors are cloned unchanged and keep their input order.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{ReconError, ReconResult};
use crate::pipeline::Stage;
use crate::progress::ProgressTracker;
use crate::spatial::SpatialIndex;
use crate::tracing_ext::OperationTimer;
use crate::types::PointSet;

/// Points processed between cancellation checks.
const CHECK_INTERVAL: usize = 4096;

/// Relative spread below which the distance distribution counts as uniform.
const UNIFORM_SPREAD: f64 = 1e-12;

/// Parameters for statistical outlier removal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierParams {
    /// Neighbors per point.
    pub k: usize,
    /// Standard-deviation multiplier for the rejection threshold.
    pub std_dev_multiplier: f64,
}

impl Default for OutlierParams {
    fn default() -> Self {
        Self {
            k: 20,
            std_dev_multiplier: 2.0,
        }
    }
}

/// Outcome of outlier removal.
#[derive(Debug, Clone)]
pub struct OutlierReport {
    /// Retained points, input order.
    pub points: PointSet,
    /// Input indices of removed points, ascending.
    pub removed: Vec<usize>,
    /// Mean of per-point mean neighbor distances.
    pub mean: f64,
    /// Standard deviation of per-point mean neighbor distances.
    pub std_dev: f64,
    /// Rejection threshold that was applied.
    pub threshold: f64,
}

/// Remove statistical outliers.
pub fn remove_outliers(points: &PointSet, params: &OutlierParams) -> ReconResult<OutlierReport> {
    remove_outliers_with_progress(points, params, &ProgressTracker::silent(Stage::Filtering))
}

/// [`remove_outliers`] with progress reporting and cancellation.
pub fn remove_outliers_with_progress(
    points: &PointSet,
    params: &OutlierParams,
    tracker: &ProgressTracker<'_>,
) -> ReconResult<OutlierReport> {
    let n = points.len();
    if params.k == 0 {
        return Err(ReconError::invalid_config("outlier_k", "must be at least 1"));
    }
    if n < params.k + 1 {
        return Err(ReconError::degenerate_input(format!(
            "outlier filter with k={} needs at least {} points, got {}",
            params.k,
            params.k + 1,
            n
        )));
    }

    let _timer = OperationTimer::with_points("remove_outliers", n);
    let index = SpatialIndex::build(points)?;

    let mean_distances: Vec<f64> = (0..n)
        .into_par_iter()
        .map(|i| {
            if i % CHECK_INTERVAL == 0 {
                tracker.report(0.9 * i as f64 / n as f64, "measuring neighbor distances")?;
            }
            let neighbors = index.k_nearest_of(i, params.k);
            let sum: f64 = neighbors.iter().map(|nb| nb.distance).sum();
            Ok(sum / neighbors.len() as f64)
        })
        .collect::<ReconResult<_>>()?;

    let mean = mean_distances.iter().sum::<f64>() / n as f64;
    let variance = mean_distances
        .iter()
        .map(|d| (d - mean).powi(2))
        .sum::<f64>()
        / n as f64;
    let std_dev = variance.sqrt();
    let threshold = mean + params.std_dev_multiplier * std_dev;

    // A uniform cloud has sigma == 0 up to rounding; keep everything.
    let uniform = std_dev <= UNIFORM_SPREAD * mean.abs().max(f64::MIN_POSITIVE);

    let mut kept = PointSet::with_capacity(n);
    let mut removed = Vec::new();
    for (i, (point, &d)) in points.points.iter().zip(&mean_distances).enumerate() {
        if uniform || d <= threshold {
            kept.push(point.clone());
        } else {
            removed.push(i);
        }
    }

    tracker.report_now(1.0, "outliers removed")?;
    info!(
        removed = removed.len(),
        retained = kept.len(),
        "Removed statistical outliers"
    );
    debug!(
        mean = mean,
        std_dev = std_dev,
        threshold = threshold,
        "Outlier distance statistics"
    );

    Ok(OutlierReport {
        points: kept,
        removed,
        mean,
        std_dev,
        threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn jittered_grid(n: usize) -> PointSet {
        let mut set = PointSet::new();
        let mut state = 12345u64;
        let mut jitter = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64 - 0.5) * 0.02
        };
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    set.push_coords(
                        i as f64 + jitter(),
                        j as f64 + jitter(),
                        k as f64 + jitter(),
                    );
                }
            }
        }
        set
    }

    #[test]
    fn test_extreme_outlier_removed_others_kept() {
        let mut cloud = jittered_grid(5);
        let span = cloud.span();
        let inliers = cloud.len();
        cloud.push_coords(1000.0 * span, 1000.0 * span, 1000.0 * span);

        let params = OutlierParams {
            k: 8,
            std_dev_multiplier: 1.0,
        };
        let report = remove_outliers(&cloud, &params).unwrap();
        assert_eq!(report.removed, vec![inliers]);
        assert_eq!(report.points.len(), inliers);
    }

    #[test]
    fn test_uniform_cloud_keeps_everything() {
        // Equilateral arrangement: every point has identical neighbor distances.
        let cloud = PointSet::from_positions(&[
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(1.0, -1.0, -1.0),
            Point3::new(-1.0, 1.0, -1.0),
            Point3::new(-1.0, -1.0, 1.0),
        ]);
        let params = OutlierParams {
            k: 3,
            std_dev_multiplier: 0.0,
        };
        let report = remove_outliers(&cloud, &params).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.points, cloud);
    }

    #[test]
    fn test_too_few_points_is_degenerate() {
        let cloud = jittered_grid(2); // 8 points
        let params = OutlierParams {
            k: 8,
            std_dev_multiplier: 1.0,
        };
        let err = remove_outliers(&cloud, &params).unwrap_err();
        assert!(matches!(err, ReconError::DegenerateInput { .. }));
    }

    #[test]
    fn test_output_is_ordered_subset() {
        let mut cloud = jittered_grid(4);
        cloud.push_coords(40.0, 0.0, 0.0);
        cloud.push_coords(0.0, -35.0, 0.0);
        let report = remove_outliers(&cloud, &OutlierParams::default()).unwrap();

        let mut cursor = 0;
        for p in &report.points.points {
            let pos = cloud.points[cursor..].iter().position(|q| q == p).unwrap();
            cursor += pos + 1;
        }
        assert_eq!(report.points.len() + report.removed.len(), cloud.len());
    }

    #[test]
    fn test_deterministic() {
        let mut cloud = jittered_grid(4);
        cloud.push_coords(10.0, 10.0, 10.0);
        let a = remove_outliers(&cloud, &OutlierParams::default()).unwrap();
        let b = remove_outliers(&cloud, &OutlierParams::default()).unwrap();
        assert_eq!(a.removed, b.removed);
        assert_eq!(a.points, b.points);
    }
}
