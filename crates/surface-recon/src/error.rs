//! Error types for reconstruction stages with rich diagnostics.
//!
//! Every failure the core can report is a [`ReconError`] variant carrying
//! enough context to tell the caller which point, octree level, or stage was
//! involved, plus a machine-readable [`ErrorCode`] and a
//! [`RecoverySuggestion`].
//!
//! # Error Codes
//!
//! Each error has a unique code in the format `RECON-XXXX`:
//! - `RECON-1xxx`: Input errors (degenerate point sets, missing attributes)
//! - `RECON-2xxx`: Numerical errors (solver failures)
//! - `RECON-3xxx`: Control flow (cancellation)
//! - `RECON-4xxx`: Configuration errors
//!
//! # Example
//!
//! ```rust
//! use surface_recon::{ErrorCode, ReconError};
//!
//! let err = ReconError::insufficient_neighbors(17, 1, 3);
//! assert_eq!(err.code(), ErrorCode::InsufficientNeighbors);
//! assert_eq!(err.code().as_str(), "RECON-1002");
//! ```

use crate::pipeline::Stage;
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for reconstruction operations.
pub type ReconResult<T> = Result<T, ReconError>;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Input errors (1xxx)
    /// RECON-1001: Too few or degenerate points for the operation
    DegenerateInput = 1001,
    /// RECON-1002: A point's neighborhood is too small
    InsufficientNeighbors = 1002,
    /// RECON-1003: Reconstruction input lacks normals
    MissingNormals = 1003,

    // Numerical errors (2xxx)
    /// RECON-2001: Poisson solve did not converge
    SolverDivergence = 2001,

    // Control flow (3xxx)
    /// RECON-3001: Cooperative cancellation observed
    Cancelled = 3001,

    // Configuration errors (4xxx)
    /// RECON-4001: Configuration value out of range
    InvalidConfig = 4001,
    /// RECON-4002: Configuration file could not be read or written
    ConfigIo = 4002,
    /// RECON-4003: Configuration file could not be parsed
    ConfigParse = 4003,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `RECON-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DegenerateInput => "RECON-1001",
            ErrorCode::InsufficientNeighbors => "RECON-1002",
            ErrorCode::MissingNormals => "RECON-1003",
            ErrorCode::SolverDivergence => "RECON-2001",
            ErrorCode::Cancelled => "RECON-3001",
            ErrorCode::InvalidConfig => "RECON-4001",
            ErrorCode::ConfigIo => "RECON-4002",
            ErrorCode::ConfigParse => "RECON-4003",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery suggestions for reconstruction errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Adjust parameters for the operation.
    AdjustParameters { parameters: Vec<(String, String)> },
    /// Inspect or enrich the input point set.
    CheckInput { checks: Vec<String> },
    /// Enable a pipeline stage that provides the missing data.
    EnableStage { stage: String },
    /// Nothing to recover: the caller asked for this outcome.
    Retry,
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::AdjustParameters { parameters } => {
                let params: Vec<String> = parameters
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                write!(f, "Try adjusting: {}", params.join(", "))
            }
            RecoverySuggestion::CheckInput { checks } => {
                write!(f, "Check the input point set for: {}", checks.join(", "))
            }
            RecoverySuggestion::EnableStage { stage } => {
                write!(f, "Enable the {} stage", stage)
            }
            RecoverySuggestion::Retry => write!(f, "Run the pipeline again when ready"),
        }
    }
}

/// Errors that can occur while turning a point set into a mesh.
#[derive(Debug, Error, Diagnostic)]
pub enum ReconError {
    /// Too few points, all points coincident, or non-finite coordinates.
    #[error("degenerate input: {details}")]
    #[diagnostic(
        code(recon::input::degenerate),
        help("The operation needs several distinct, finite points. Check the ingestion step.")
    )]
    DegenerateInput { details: String },

    /// A point's neighborhood (excluding itself) is too small to fit a plane.
    #[error(
        "point {point_index} has {found} usable neighbors, at least {required} are required"
    )]
    #[diagnostic(
        code(recon::normals::insufficient_neighbors),
        help(
            "Increase normal_k or normal_radius, or set insufficient_neighbors = \"skip\" to drop such points."
        )
    )]
    InsufficientNeighbors {
        point_index: usize,
        found: usize,
        required: usize,
    },

    /// Reconstruction requires every point to carry a unit normal.
    #[error("{missing} of {total} points have no usable normal")]
    #[diagnostic(
        code(recon::poisson::missing_normals),
        help("Enable normal estimation or supply oriented points.")
    )]
    MissingNormals { missing: usize, total: usize },

    /// The hierarchical Poisson solve failed to converge.
    #[error(
        "Poisson solve diverged at octree level {level} after {iterations} iterations (residual {residual:.3e}, tolerance {tolerance:.1e})"
    )]
    #[diagnostic(
        code(recon::poisson::divergence),
        help(
            "Raise solver_max_iterations, loosen solver_tolerance, or lower poisson_depth."
        )
    )]
    SolverDivergence {
        level: u8,
        iterations: usize,
        residual: f64,
        tolerance: f64,
    },

    /// Cooperative cancellation was observed.
    #[error("cancelled during {stage}")]
    #[diagnostic(code(recon::cancelled))]
    Cancelled { stage: Stage },

    /// A configuration value is out of range.
    #[error("invalid configuration for `{field}`: {details}")]
    #[diagnostic(code(recon::config::invalid))]
    InvalidConfig { field: &'static str, details: String },

    /// Configuration file could not be read or written.
    #[error("configuration file {}: {source}", path.display())]
    #[diagnostic(
        code(recon::config::io),
        help("Check that the file exists and is readable/writable.")
    )]
    ConfigIo {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration text could not be parsed or serialized.
    #[error("configuration {format} error: {details}")]
    #[diagnostic(code(recon::config::parse))]
    ConfigParse {
        format: &'static str,
        details: String,
    },
}

impl ReconError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ReconError::DegenerateInput { .. } => ErrorCode::DegenerateInput,
            ReconError::InsufficientNeighbors { .. } => ErrorCode::InsufficientNeighbors,
            ReconError::MissingNormals { .. } => ErrorCode::MissingNormals,
            ReconError::SolverDivergence { .. } => ErrorCode::SolverDivergence,
            ReconError::Cancelled { .. } => ErrorCode::Cancelled,
            ReconError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            ReconError::ConfigIo { .. } => ErrorCode::ConfigIo,
            ReconError::ConfigParse { .. } => ErrorCode::ConfigParse,
        }
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            ReconError::DegenerateInput { .. } => RecoverySuggestion::CheckInput {
                checks: vec![
                    "point count".into(),
                    "spatial extent".into(),
                    "NaN or infinite coordinates".into(),
                ],
            },
            ReconError::InsufficientNeighbors { .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![
                    ("normal_k".into(), "use a larger neighborhood".into()),
                    ("insufficient_neighbors".into(), "\"skip\"".into()),
                ],
            },
            ReconError::MissingNormals { .. } => RecoverySuggestion::EnableStage {
                stage: Stage::EstimatingNormals.to_string(),
            },
            ReconError::SolverDivergence { .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![
                    ("solver_max_iterations".into(), "try a higher value".into()),
                    ("poisson_depth".into(), "try a lower value".into()),
                ],
            },
            ReconError::Cancelled { .. } => RecoverySuggestion::Retry,
            ReconError::InvalidConfig { field, .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![((*field).into(), "use a value in range".into())],
            },
            ReconError::ConfigIo { .. } | ReconError::ConfigParse { .. } => {
                RecoverySuggestion::CheckInput {
                    checks: vec!["configuration file contents".into()],
                }
            }
        }
    }

    /// True for [`ReconError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconError::Cancelled { .. })
    }

    /// Create a DegenerateInput error.
    pub fn degenerate_input(details: impl Into<String>) -> Self {
        ReconError::DegenerateInput {
            details: details.into(),
        }
    }

    /// Create an InsufficientNeighbors error.
    pub fn insufficient_neighbors(point_index: usize, found: usize, required: usize) -> Self {
        ReconError::InsufficientNeighbors {
            point_index,
            found,
            required,
        }
    }

    /// Create a MissingNormals error.
    pub fn missing_normals(missing: usize, total: usize) -> Self {
        ReconError::MissingNormals { missing, total }
    }

    /// Create a Cancelled error.
    pub fn cancelled(stage: Stage) -> Self {
        ReconError::Cancelled { stage }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(field: &'static str, details: impl Into<String>) -> Self {
        ReconError::InvalidConfig {
            field,
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ReconError::degenerate_input("empty point set");
        assert_eq!(err.code(), ErrorCode::DegenerateInput);
        assert_eq!(err.code().as_str(), "RECON-1001");

        let err = ReconError::cancelled(Stage::Reconstructing);
        assert_eq!(err.code().to_string(), "RECON-3001");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_recovery_suggestions() {
        let err = ReconError::missing_normals(3, 10);
        match err.recovery_suggestion() {
            RecoverySuggestion::EnableStage { stage } => {
                assert_eq!(stage, "estimating normals");
            }
            other => panic!("Expected EnableStage suggestion, got {:?}", other),
        }

        let err = ReconError::insufficient_neighbors(0, 1, 3);
        let text = err.recovery_suggestion().to_string();
        assert!(text.contains("normal_k"));
    }

    #[test]
    fn test_error_display() {
        let err = ReconError::insufficient_neighbors(42, 2, 3);
        let display = format!("{}", err);
        assert!(display.contains("point 42"));
        assert!(display.contains("2 usable neighbors"));

        let err = ReconError::SolverDivergence {
            level: 7,
            iterations: 2000,
            residual: 1.5e-3,
            tolerance: 1e-6,
        };
        assert!(err.to_string().contains("level 7"));
    }
}
