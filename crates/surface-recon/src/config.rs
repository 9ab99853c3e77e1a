//! Pipeline configuration.
//!
//! [`ReconConfig`] is the single configuration surface of the pipeline. It
//! serializes with serde, so it can be embedded in a host application's own
//! settings or, with the `config-files` feature, read from and written to
//! TOML and JSON directly.
//!
//! # Example
//!
//! ```
//! use surface_recon::ReconConfig;
//!
//! # #[cfg(feature = "config-files")]
//! # {
//! let config = ReconConfig::from_toml(r#"
//!     outlier_k = 12
//!     voxel_size = 0.0
//!     poisson_depth = 7
//! "#).unwrap();
//!
//! assert_eq!(config.outlier_k, 12);
//! assert!(!config.downsampling_active());
//! assert_eq!(config.normal_k, 30); // unspecified keys keep their defaults
//! # }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ReconError, ReconResult};
use crate::normals::{NeighborPolicy, NormalOrientation, NormalParams};
use crate::outlier::OutlierParams;
use crate::poisson::{MAX_DEPTH, PoissonParams};

/// Recognized pipeline options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Neighbors per point for outlier statistics.
    pub outlier_k: usize,
    /// Standard-deviation multiplier for outlier rejection.
    pub outlier_std_dev: f64,
    /// Neighbors per point for normal estimation.
    pub normal_k: usize,
    /// Voxel edge for downsampling; 0 disables the stage.
    pub voxel_size: f64,
    /// Maximum octree depth.
    pub poisson_depth: u8,
    /// Interpolation weight of the screened Poisson solve.
    pub poisson_point_weight: f64,
    /// Minimum samples per octree node before refinement stops.
    pub poisson_samples_per_node: f64,
    /// Vertices with lower sample density are trimmed; 0 disables.
    pub density_trim_threshold: f64,
    pub enable_filtering: bool,
    pub enable_downsampling: bool,

    /// Upper bound on the normal estimation search radius.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal_radius: Option<f64>,
    pub normal_orientation: NormalOrientation,
    /// When false, input points must already carry normals.
    pub enable_normal_estimation: bool,
    pub insufficient_neighbors: NeighborPolicy,
    /// Depth to which the octree is complete.
    pub poisson_full_depth: u8,
    /// Reconstruction cube edge relative to the bounding box.
    pub poisson_scale: f64,
    /// Relative residual at which each level's solve stops.
    pub solver_tolerance: f64,
    /// Iteration bound per octree level.
    pub solver_max_iterations: usize,
    /// Vertices below this density quantile are trimmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density_trim_quantile: Option<f64>,
    /// Minimum time between throttled progress callbacks.
    pub progress_interval_ms: u64,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            outlier_k: 20,
            outlier_std_dev: 2.0,
            normal_k: 30,
            voxel_size: 0.05,
            poisson_depth: 8,
            poisson_point_weight: 4.0,
            poisson_samples_per_node: 1.5,
            density_trim_threshold: 0.0,
            enable_filtering: true,
            enable_downsampling: true,
            normal_radius: None,
            normal_orientation: NormalOrientation::SpanningTree,
            enable_normal_estimation: true,
            insufficient_neighbors: NeighborPolicy::Abort,
            poisson_full_depth: 5,
            poisson_scale: 1.1,
            solver_tolerance: 1e-6,
            solver_max_iterations: 2000,
            density_trim_quantile: None,
            progress_interval_ms: 100,
        }
    }
}

impl ReconConfig {
    /// Check every option's range.
    pub fn validate(&self) -> ReconResult<()> {
        if self.outlier_k == 0 {
            return Err(ReconError::invalid_config("outlier_k", "must be at least 1"));
        }
        if !(self.outlier_std_dev.is_finite() && self.outlier_std_dev >= 0.0) {
            return Err(ReconError::invalid_config(
                "outlier_std_dev",
                format!("must be non-negative, got {}", self.outlier_std_dev),
            ));
        }
        if self.normal_k < crate::normals::MIN_NEIGHBORS {
            return Err(ReconError::invalid_config(
                "normal_k",
                format!(
                    "must be at least {}, got {}",
                    crate::normals::MIN_NEIGHBORS,
                    self.normal_k
                ),
            ));
        }
        if let Some(r) = self.normal_radius {
            if !(r.is_finite() && r > 0.0) {
                return Err(ReconError::invalid_config(
                    "normal_radius",
                    format!("must be positive, got {}", r),
                ));
            }
        }
        if !(self.voxel_size.is_finite() && self.voxel_size >= 0.0) {
            return Err(ReconError::invalid_config(
                "voxel_size",
                format!("must be non-negative, got {}", self.voxel_size),
            ));
        }
        if self.poisson_full_depth > MAX_DEPTH {
            return Err(ReconError::invalid_config(
                "poisson_full_depth",
                format!("must be at most {}, got {}", MAX_DEPTH, self.poisson_full_depth),
            ));
        }
        self.poisson_params().validate()
    }

    /// Whether the downsampling stage runs.
    pub fn downsampling_active(&self) -> bool {
        self.enable_downsampling && self.voxel_size > 0.0
    }

    /// Normal estimation parameters.
    pub fn normal_params(&self) -> NormalParams {
        NormalParams {
            k: self.normal_k,
            radius: self.normal_radius,
            orientation: self.normal_orientation,
            policy: self.insufficient_neighbors,
        }
    }

    /// Outlier filter parameters.
    pub fn outlier_params(&self) -> OutlierParams {
        OutlierParams {
            k: self.outlier_k,
            std_dev_multiplier: self.outlier_std_dev,
        }
    }

    /// Poisson reconstruction parameters.
    pub fn poisson_params(&self) -> PoissonParams {
        PoissonParams {
            depth: self.poisson_depth,
            full_depth: self.poisson_full_depth,
            point_weight: self.poisson_point_weight,
            samples_per_node: self.poisson_samples_per_node,
            scale: self.poisson_scale,
            solver_tolerance: self.solver_tolerance,
            solver_max_iterations: self.solver_max_iterations,
            density_trim_threshold: self.density_trim_threshold,
            density_trim_quantile: self.density_trim_quantile,
        }
    }

    /// Coarse, quick settings for interactive previews.
    pub fn preset_fast_preview() -> Self {
        Self {
            outlier_k: 8,
            normal_k: 12,
            voxel_size: 0.1,
            poisson_depth: 6,
            poisson_full_depth: 4,
            solver_tolerance: 1e-5,
            ..Default::default()
        }
    }

    /// Deep octree and no downsampling, for dense scans.
    pub fn preset_high_detail() -> Self {
        Self {
            outlier_k: 30,
            outlier_std_dev: 2.5,
            normal_k: 40,
            voxel_size: 0.0,
            enable_downsampling: false,
            poisson_depth: 10,
            poisson_samples_per_node: 1.0,
            density_trim_quantile: Some(0.02),
            ..Default::default()
        }
    }
}

#[cfg(feature = "config-files")]
impl ReconConfig {
    /// Parse from a TOML string. Missing keys take their defaults.
    pub fn from_toml(toml_str: &str) -> ReconResult<Self> {
        toml::from_str(toml_str).map_err(|e| ReconError::ConfigParse {
            format: "TOML",
            details: e.to_string(),
        })
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> ReconResult<String> {
        toml::to_string_pretty(self).map_err(|e| ReconError::ConfigParse {
            format: "TOML",
            details: e.to_string(),
        })
    }

    /// Load from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> ReconResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ReconError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Write to a TOML file.
    pub fn save_toml(&self, path: impl AsRef<std::path::Path>) -> ReconResult<()> {
        let path = path.as_ref();
        let toml_str = self.to_toml()?;
        std::fs::write(path, toml_str).map_err(|source| ReconError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse from a JSON string.
    pub fn from_json(json_str: &str) -> ReconResult<Self> {
        serde_json::from_str(json_str).map_err(|e| ReconError::ConfigParse {
            format: "JSON",
            details: e.to_string(),
        })
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> ReconResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ReconError::ConfigParse {
            format: "JSON",
            details: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReconConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.downsampling_active());
        assert_eq!(config.poisson_params(), PoissonParams::default());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(ReconConfig::preset_fast_preview().validate().is_ok());
        let detail = ReconConfig::preset_high_detail();
        assert!(detail.validate().is_ok());
        assert!(!detail.downsampling_active());
    }

    #[test]
    fn test_zero_voxel_disables_downsampling() {
        let config = ReconConfig {
            voxel_size: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(!config.downsampling_active());
    }

    #[test]
    fn test_validation_errors() {
        let cases: Vec<(ReconConfig, &str)> = vec![
            (
                ReconConfig {
                    outlier_k: 0,
                    ..Default::default()
                },
                "outlier_k",
            ),
            (
                ReconConfig {
                    normal_k: 2,
                    ..Default::default()
                },
                "normal_k",
            ),
            (
                ReconConfig {
                    voxel_size: -0.1,
                    ..Default::default()
                },
                "voxel_size",
            ),
            (
                ReconConfig {
                    poisson_depth: 13,
                    ..Default::default()
                },
                "poisson_depth",
            ),
            (
                ReconConfig {
                    density_trim_quantile: Some(1.0),
                    ..Default::default()
                },
                "density_trim_quantile",
            ),
            (
                ReconConfig {
                    normal_radius: Some(0.0),
                    ..Default::default()
                },
                "normal_radius",
            ),
        ];

        for (config, expected) in cases {
            match config.validate() {
                Err(ReconError::InvalidConfig { field, .. }) => assert_eq!(field, expected),
                other => panic!("Expected InvalidConfig for {}, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_component_params() {
        let config = ReconConfig {
            normal_k: 15,
            normal_radius: Some(0.2),
            insufficient_neighbors: NeighborPolicy::Skip,
            outlier_k: 9,
            outlier_std_dev: 1.5,
            ..Default::default()
        };
        let normals = config.normal_params();
        assert_eq!(normals.k, 15);
        assert_eq!(normals.radius, Some(0.2));
        assert_eq!(normals.policy, NeighborPolicy::Skip);

        let outliers = config.outlier_params();
        assert_eq!(outliers.k, 9);
        assert_eq!(outliers.std_dev_multiplier, 1.5);
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_toml_partial_and_enums() {
        let config = ReconConfig::from_toml(
            r#"
            enable_filtering = false
            normal_orientation = "away_from_centroid"
            insufficient_neighbors = "skip"
            density_trim_quantile = 0.1
            "#,
        )
        .unwrap();
        assert!(!config.enable_filtering);
        assert_eq!(config.normal_orientation, NormalOrientation::AwayFromCentroid);
        assert_eq!(config.insufficient_neighbors, NeighborPolicy::Skip);
        assert_eq!(config.density_trim_quantile, Some(0.1));
        assert_eq!(config.outlier_k, 20);
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_toml_roundtrip() {
        let config = ReconConfig::preset_high_detail();
        let text = config.to_toml().unwrap();
        assert_eq!(ReconConfig::from_toml(&text).unwrap(), config);
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_json_roundtrip() {
        let config = ReconConfig::preset_fast_preview();
        let text = config.to_json().unwrap();
        assert!(text.contains("\"poisson_depth\": 6"));
        assert_eq!(ReconConfig::from_json(&text).unwrap(), config);
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_parse_error() {
        let err = ReconConfig::from_toml("outlier_k = \"many\"").unwrap_err();
        assert!(matches!(err, ReconError::ConfigParse { format: "TOML", .. }));
    }

    #[cfg(feature = "config-files")]
    #[test]
    fn test_missing_file() {
        let err = ReconConfig::from_toml_file("/nonexistent/recon.toml").unwrap_err();
        assert!(matches!(err, ReconError::ConfigIo { .. }));
    }
}
