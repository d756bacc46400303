//! Central galaxy probabilities.
//!
//! Each centering class assigns every eligible candidate a log-score; the
//! probabilities are the normalised exponentials over a cluster's
//! candidates. The zred-weighted class scores candidates with a linear
//! model in brightness, softened radius and richness whose coefficients
//! are fit by penalised logistic regression against confirmed centrals.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::catalog::ZredEstimate;
use crate::config::Config;
use crate::error::{RedmapperError, Result};

/// Magnitude scale of the brightest-galaxy score.
const BCG_MAG_SCALE: f64 = 0.02;
/// Candidates with no membership signal must have zred within this many
/// sigma of the cluster redshift.
const CANDIDATE_ZRED_NSIG: f64 = 5.0;
const IRLS_MAX_ITER: usize = 50;
const IRLS_TOL: f64 = 1e-8;
/// L2 penalty keeping separable training sets finite.
const IRLS_RIDGE: f64 = 1e-2;

pub const WCEN_NFEATURES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CenterClass {
    /// Brightest eligible galaxy
    Bcg,
    /// Brightness, radius and richness model weighted by zred consistency
    WcenZred,
}

/// Possible central galaxy with the quantities the scores need.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentralInput {
    pub index: usize,
    pub r: f64,
    pub refmag: f64,
    pub zred: Option<ZredEstimate>,
    pub pmem: f64,
}

/// Cluster quantities shared by all candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterFrame {
    pub lambda: f64,
    pub z: f64,
    pub mstar: f64,
    pub r_lambda: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WcenModel {
    /// Coefficients of `[1, m* - m, ln r_soft, ln(λ/pivot) ln r_soft, ln(λ/pivot)]`
    pub coeffs: [f64; WCEN_NFEATURES],
}

impl Default for WcenModel {
    fn default() -> Self {
        Self {
            coeffs: [0.0, 2.0, -1.0, -0.5, 0.0],
        }
    }
}

/// Feature vector of one candidate.
pub fn wcen_features(config: &Config, frame: &CenterFrame, input: &CentralInput) -> [f64; WCEN_NFEATURES] {
    let rsoft = config.wcen_rsoft;
    let lnr = ((input.r * input.r + rsoft * rsoft).sqrt() / rsoft).ln();
    let lnl = (frame.lambda.max(1e-3) / config.wcen_pivot).ln();
    [1.0, frame.mstar - input.refmag, lnr, lnl * lnr, lnl]
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl WcenModel {
    pub fn linear_score(&self, features: &[f64; WCEN_NFEATURES]) -> f64 {
        self.coeffs.iter().zip(features.iter()).map(|(b, x)| b * x).sum()
    }

    /// Penalised logistic regression by iteratively reweighted least squares.
    ///
    /// # Errors
    ///
    /// * `RedmapperError::InsufficientData` - no centrals or no non-centrals
    /// * `RedmapperError::Numerical` - singular Hessian
    pub fn fit(samples: &[([f64; WCEN_NFEATURES], bool)]) -> Result<Self> {
        let npos = samples.iter().filter(|s| s.1).count();
        if npos == 0 || npos == samples.len() {
            return Err(RedmapperError::InsufficientData(format!(
                "wcen training needs centrals and satellites, got {npos} of {}",
                samples.len()
            )));
        }
        let n = samples.len();
        let x = DMatrix::from_fn(n, WCEN_NFEATURES, |i, j| samples[i].0[j]);
        let y = DVector::from_iterator(n, samples.iter().map(|s| if s.1 { 1.0 } else { 0.0 }));
        let mut beta = DVector::<f64>::zeros(WCEN_NFEATURES);

        for iter in 0..IRLS_MAX_ITER {
            let eta = &x * &beta;
            let mu = eta.map(sigmoid);
            let w = mu.map(|m| (m * (1.0 - m)).max(1e-12));
            let mut hessian = DMatrix::<f64>::identity(WCEN_NFEATURES, WCEN_NFEATURES) * IRLS_RIDGE;
            for i in 0..n {
                let row = x.row(i);
                hessian += row.transpose() * row * w[i];
            }
            let gradient = x.transpose() * (&y - &mu) - &beta * IRLS_RIDGE;
            let step = hessian
                .cholesky()
                .ok_or_else(|| RedmapperError::Numerical("wcen Hessian not positive definite".to_string()))?
                .solve(&gradient);
            beta += &step;
            if step.amax() < IRLS_TOL {
                log::debug!("wcen IRLS converged after {} iterations", iter + 1);
                break;
            }
        }

        let mut coeffs = [0.0; WCEN_NFEATURES];
        coeffs.copy_from_slice(beta.as_slice());
        Ok(Self { coeffs })
    }
}

impl CenterClass {
    /// Whether a galaxy may be considered as the central.
    pub fn eligible(&self, config: &Config, frame: &CenterFrame, input: &CentralInput) -> bool {
        if input.r > frame.r_lambda {
            return false;
        }
        match (self, input.zred) {
            (CenterClass::Bcg, None) => input.pmem > 0.0,
            (CenterClass::WcenZred, None) => false,
            (_, Some(zred)) => {
                zred.chisq < config.wcen_zred_chisq_max
                    && (input.pmem > 0.0
                        || ((zred.zred - frame.z) / zred.zred_e).abs() < CANDIDATE_ZRED_NSIG)
            }
        }
    }

    /// Unnormalised log-probability of being the central.
    pub fn score(
        &self,
        config: &Config,
        wcen: &WcenModel,
        frame: &CenterFrame,
        input: &CentralInput,
    ) -> f64 {
        match self {
            CenterClass::Bcg => -(input.refmag - frame.mstar) / BCG_MAG_SCALE,
            CenterClass::WcenZred => {
                let mut s = wcen.linear_score(&wcen_features(config, frame, input));
                if let Some(zred) = input.zred {
                    let t = (zred.zred - frame.z) / zred.zred_e;
                    s -= 0.5 * t * t;
                }
                s
            }
        }
    }

    /// Central probabilities of the eligible candidates, most probable
    /// first. Ties keep input order.
    pub fn probabilities(
        &self,
        config: &Config,
        wcen: &WcenModel,
        frame: &CenterFrame,
        inputs: &[CentralInput],
    ) -> Vec<(CentralInput, f64)> {
        let scored: Vec<(CentralInput, f64)> = inputs
            .iter()
            .filter(|c| self.eligible(config, frame, c))
            .map(|c| (*c, self.score(config, wcen, frame, c)))
            .filter(|(_, s)| s.is_finite())
            .collect();
        let Some(max) = scored.iter().map(|s| s.1).reduce(f64::max) else {
            return Vec::new();
        };
        let total: f64 = scored.iter().map(|s| (s.1 - max).exp()).sum();
        let mut probs: Vec<(CentralInput, f64)> = scored
            .into_iter()
            .map(|(c, s)| (c, (s - max).exp() / total))
            .collect();
        probs.sort_by(|a, b| b.1.total_cmp(&a.1));
        probs
    }
}
