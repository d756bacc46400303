//! Error type shared by the cluster finder and calibration driver.
//!
//! Failures fall into three scopes. Per-candidate problems (redshift
//! non-convergence, too much masked area) never leave the finder as errors;
//! they become flags or discards on the candidate. Per-run problems
//! (configuration, unsupported mask mode, I/O) abort the partition or run.
//! Calibration fits that find no training data abort the whole driver.

use redmapper_math::integrate::IntegrateError;
use redmapper_math::{InterpError, SplineError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RedmapperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config array `{name}` has length {found}, expected {expected}")]
    ConfigArrayLength {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("No convergence: {0}")]
    NonConvergence(String),

    #[error("Masked fraction {maskfrac:.3} exceeds limit {max_maskfrac:.3}")]
    MaskCoverageExceeded { maskfrac: f64, max_maskfrac: f64 },

    #[error("Unsupported mask mode {0}; only mode 3 (healpix) is supported")]
    UnsupportedMaskMode(i32),

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, RedmapperError>;

impl From<SplineError> for RedmapperError {
    fn from(err: SplineError) -> Self {
        match err {
            SplineError::InsufficientData(msg) => RedmapperError::InsufficientData(msg),
            other => RedmapperError::Numerical(other.to_string()),
        }
    }
}

impl From<InterpError> for RedmapperError {
    fn from(err: InterpError) -> Self {
        RedmapperError::Numerical(err.to_string())
    }
}

impl From<IntegrateError> for RedmapperError {
    fn from(err: IntegrateError) -> Self {
        RedmapperError::Numerical(err.to_string())
    }
}

impl RedmapperError {
    /// Errors that only remove a single candidate.
    pub fn is_per_candidate(&self) -> bool {
        matches!(
            self,
            RedmapperError::NonConvergence(_) | RedmapperError::MaskCoverageExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spline_insufficient_data_maps_through() {
        let err: RedmapperError = SplineError::InsufficientData("node 0.3".to_string()).into();
        assert!(matches!(err, RedmapperError::InsufficientData(ref m) if m == "node 0.3"));
    }

    #[test]
    fn test_scope_classification() {
        assert!(RedmapperError::NonConvergence("z".into()).is_per_candidate());
        assert!(RedmapperError::MaskCoverageExceeded {
            maskfrac: 0.5,
            max_maskfrac: 0.2
        }
        .is_per_candidate());
        assert!(!RedmapperError::UnsupportedMaskMode(1).is_per_candidate());
        assert!(!RedmapperError::Config("x".into()).is_per_candidate());
    }
}
