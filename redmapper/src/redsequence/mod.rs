//! Red-sequence color model.
//!
//! For every color index the model holds splines in redshift for the mean
//! color at the pivot magnitude, the color-magnitude slope and the intrinsic
//! scatter, plus correlation splines for each color pair. The total color
//! covariance of a galaxy is the intrinsic covariance plus the covariance
//! implied by its magnitude errors (adjacent colors share a band, so their
//! errors are anti-correlated).
//!
//! A model is produced whole by the trainer on every calibration iteration
//! and never mutated afterwards.

pub mod colormem;
pub mod train;
pub mod zred;

use nalgebra::{DMatrix, DVector};
use redmapper_math::SplineModel;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RedmapperError, Result};

pub use colormem::ColorRegime;
pub use train::{fit_red_sequence, TrainingGalaxy};
pub use zred::ZredEstimator;

/// Lower bound on intrinsic scatter.
pub const SIGMA_FLOOR: f64 = 0.005;
/// Bound on the magnitude of intrinsic color correlations.
pub const MAX_CORRELATION: f64 = 0.9;

/// Index of pair `(i, j)` with `i < j` in the packed correlation list.
pub fn pair_index(i: usize, j: usize, ncol: usize) -> usize {
    debug_assert!(i < j && j < ncol);
    i * ncol - i * (i + 1) / 2 + (j - i - 1)
}

/// Bias correction applied to raw zred values.
///
/// `zred = zred_uncorr + offset(zred_uncorr) + slope(zred_uncorr) · (refmag - pivot(zred_uncorr))`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZredCorrection {
    pub offset: SplineModel,
    pub slope: SplineModel,
}

impl ZredCorrection {
    pub fn apply(&self, zred_uncorr: f64, refmag: f64, pivotmag: f64) -> f64 {
        zred_uncorr
            + self.offset.evaluate(zred_uncorr)
            + self.slope.evaluate(zred_uncorr) * (refmag - pivotmag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedSequenceModel {
    pub zrange: [f64; 2],
    /// Characteristic reference magnitude m*(z)
    pub mstar: SplineModel,
    pub pivotmag: SplineModel,
    pub colors: Vec<SplineModel>,
    pub slopes: Vec<SplineModel>,
    pub sigmas: Vec<SplineModel>,
    /// Packed upper triangle, see [`pair_index`]
    pub correlations: Vec<SplineModel>,
    #[serde(default)]
    pub zred_correction: Option<ZredCorrection>,
}

/// Color chi-squared of one galaxy against the model at one redshift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorChisq {
    pub chisq: f64,
    /// Log-determinant of the total covariance
    pub lndet: f64,
}

/// The model evaluated at a single redshift.
#[derive(Debug, Clone)]
pub struct RedSequenceState {
    pub z: f64,
    pub mstar: f64,
    pub pivotmag: f64,
    pub mean: DVector<f64>,
    pub slope: DVector<f64>,
    pub cov_int: DMatrix<f64>,
}

impl RedSequenceState {
    pub fn ncol(&self) -> usize {
        self.mean.len()
    }

    /// Expected colors for a galaxy of reference magnitude `refmag`.
    pub fn model_colors(&self, refmag: f64) -> DVector<f64> {
        &self.mean + &self.slope * (refmag - self.pivotmag)
    }

    /// Chi-squared of observed colors against the model.
    ///
    /// Returns `None` if the total covariance is not positive definite.
    pub fn chisq(&self, colors: &[f64], mag_err: &[f64], refmag: f64) -> Option<ColorChisq> {
        let ncol = self.ncol();
        let model = self.model_colors(refmag);
        let d = DVector::from_iterator(ncol, colors.iter().zip(model.iter()).map(|(c, m)| c - m));

        let mut cov = self.cov_int.clone();
        for i in 0..ncol {
            cov[(i, i)] += mag_err[i] * mag_err[i] + mag_err[i + 1] * mag_err[i + 1];
            if i + 1 < ncol {
                let shared = mag_err[i + 1] * mag_err[i + 1];
                cov[(i, i + 1)] -= shared;
                cov[(i + 1, i)] -= shared;
            }
        }

        let chol = cov.cholesky()?;
        let lndet = 2.0 * chol.l_dirty().diagonal().iter().map(|v| v.ln()).sum::<f64>();
        let solved = chol.solve(&d);
        Some(ColorChisq {
            chisq: d.dot(&solved),
            lndet,
        })
    }
}

impl RedSequenceModel {
    pub fn ncol(&self) -> usize {
        self.colors.len()
    }

    /// Check that every spline list matches the color count.
    pub fn validate(&self, ncol: usize) -> Result<()> {
        let npairs = ncol * ncol.saturating_sub(1) / 2;
        for (name, found, expected) in [
            ("colors", self.colors.len(), ncol),
            ("slopes", self.slopes.len(), ncol),
            ("sigmas", self.sigmas.len(), ncol),
            ("correlations", self.correlations.len(), npairs),
        ] {
            if found != expected {
                return Err(RedmapperError::ConfigArrayLength {
                    name,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    pub fn sigma(&self, i: usize, z: f64) -> f64 {
        self.sigmas[i].evaluate(z).max(SIGMA_FLOOR)
    }

    pub fn correlation(&self, i: usize, j: usize, z: f64) -> f64 {
        let (a, b) = if i < j { (i, j) } else { (j, i) };
        self.correlations[pair_index(a, b, self.ncol())]
            .evaluate(z)
            .clamp(-MAX_CORRELATION, MAX_CORRELATION)
    }

    /// Evaluate every spline at `z`.
    pub fn state_at(&self, z: f64) -> RedSequenceState {
        let ncol = self.ncol();
        let sig: Vec<f64> = (0..ncol).map(|i| self.sigma(i, z)).collect();
        let mut cov_int = DMatrix::<f64>::zeros(ncol, ncol);
        for i in 0..ncol {
            cov_int[(i, i)] = sig[i] * sig[i];
            for j in (i + 1)..ncol {
                let c = self.correlation(i, j, z) * sig[i] * sig[j];
                cov_int[(i, j)] = c;
                cov_int[(j, i)] = c;
            }
        }
        RedSequenceState {
            z,
            mstar: self.mstar.evaluate(z),
            pivotmag: self.pivotmag.evaluate(z),
            mean: DVector::from_iterator(ncol, self.colors.iter().map(|s| s.evaluate(z))),
            slope: DVector::from_iterator(ncol, self.slopes.iter().map(|s| s.evaluate(z))),
            cov_int,
        }
    }

    /// Apply the zred bias correction, if one has been calibrated.
    pub fn correct_zred(&self, zred_uncorr: f64, refmag: f64) -> f64 {
        match &self.zred_correction {
            Some(corr) => corr.apply(zred_uncorr, refmag, self.pivotmag.evaluate(zred_uncorr)),
            None => zred_uncorr,
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
