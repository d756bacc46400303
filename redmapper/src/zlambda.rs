//! Cluster redshift from member photometric redshifts.
//!
//! The likelihood of a cluster redshift z is `Σ p (−½ ((z − zred) / σ)²)`
//! over the most probable members. It is maximised with a coarse scan
//! around the starting redshift followed by iterated parabola fits.
//! Members far from the current estimate are cleaned out and the fit
//! repeated.

use redmapper_math::optimize::{argmax, parabola_vertex};
use redmapper_math::{make_nodes, Extrapolation, SplineFitter, SplineModel, SplineTerm};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{RedmapperError, Result};

/// Half width of the coarse scan window.
const COARSE_HALF_WIDTH: f64 = 0.1;
/// Fewest members z_lambda is ever computed from.
const MIN_MEMBERS: usize = 3;
/// `z_lambda_e` of a cluster whose members carry no usable zred.
pub const ZLAMBDA_E_UNDETERMINED: f64 = -1.0;

/// Input from one cluster member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZlambdaMember {
    pub zred: f64,
    pub zred_e: f64,
    pub pmem: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZlambdaResult {
    pub z_lambda: f64,
    pub z_lambda_e: f64,
    /// Estimate before the richness-dependent correction
    pub z_lambda_uncorr: f64,
    pub converged: bool,
    /// Members used after cleaning
    pub nused: usize,
}

/// Richness-dependent bias correction
/// `z + offset(z) + slope(z) ln(λ / pivot)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZlambdaCorrection {
    pub offset: SplineModel,
    pub slope: SplineModel,
    pub pivot: f64,
    /// Correction only applies above this richness
    pub min_lambda: f64,
}

impl ZlambdaCorrection {
    pub fn apply(&self, z: f64, lambda: f64) -> f64 {
        if lambda <= self.min_lambda {
            return z;
        }
        z + self.offset.evaluate(z) + self.slope.evaluate(z) * (lambda / self.pivot).ln()
    }

    /// Fit the correction to `(z_lambda, lambda, z_spec)` triples with
    /// `calib_zlambda_correct_niter` rounds of MAD clipping.
    ///
    /// # Errors
    ///
    /// `RedmapperError::InsufficientData` when too few clusters remain for
    /// the spline nodes.
    pub fn fit(config: &Config, samples: &[(f64, f64, f64)]) -> Result<Self> {
        let usable: Vec<(f64, f64, f64)> = samples
            .iter()
            .copied()
            .filter(|s| s.1 > config.calib_zlambda_minlambda)
            .collect();
        if usable.is_empty() {
            return Err(RedmapperError::InsufficientData(
                "no calibration clusters with spectroscopic redshifts".to_string(),
            ));
        }
        let fitter = SplineFitter::new(vec![
            SplineTerm::new(
                make_nodes(config.zrange, config.calib_zlambda_nodesize, -1.0),
                Extrapolation::Constant,
            )?,
            SplineTerm::new(
                make_nodes(config.zrange, config.calib_zlambda_slope_nodesize, -1.0),
                Extrapolation::Constant,
            )?,
        ]);
        let z: Vec<f64> = usable.iter().map(|s| s.0).collect();
        let y: Vec<f64> = usable.iter().map(|s| s.2 - s.0).collect();
        let ones = vec![1.0; usable.len()];
        let lnl: Vec<f64> = usable
            .iter()
            .map(|s| (s.1 / config.zlambda_pivot).ln())
            .collect();
        let mut weights = vec![1.0; usable.len()];

        let mut splines = fitter.fit(&z, &[ones.as_slice(), lnl.as_slice()], &y, &weights)?;
        for _ in 0..config.calib_zlambda_correct_niter {
            let resid: Vec<f64> = (0..usable.len())
                .map(|i| y[i] - splines[0].evaluate(z[i]) - splines[1].evaluate(z[i]) * lnl[i])
                .collect();
            let Some(sigma) = redmapper_math::stats::mad_sigma(&resid) else {
                break;
            };
            let cut = 3.0 * sigma.max(1e-4);
            for (w, r) in weights.iter_mut().zip(resid.iter()) {
                *w = if r.abs() < cut { 1.0 } else { 0.0 };
            }
            splines = fitter.fit(&z, &[ones.as_slice(), lnl.as_slice()], &y, &weights)?;
        }

        let slope = splines.pop();
        let offset = splines.pop();
        match (offset, slope) {
            (Some(offset), Some(slope)) => Ok(Self {
                offset,
                slope,
                pivot: config.zlambda_pivot,
                min_lambda: config.calib_zlambda_minlambda,
            }),
            _ => Err(RedmapperError::Numerical(
                "z_lambda correction fit returned too few splines".to_string(),
            )),
        }
    }
}

fn ln_likelihood(members: &[ZlambdaMember], z: f64) -> f64 {
    members
        .iter()
        .map(|m| {
            let t = (z - m.zred) / m.zred_e;
            -0.5 * m.pmem * t * t
        })
        .sum()
}

/// Coarse scan on the `zlambda_binsize` grid.
fn coarse_peak(config: &Config, members: &[ZlambdaMember], z_init: f64) -> f64 {
    let lo = (z_init - COARSE_HALF_WIDTH).max(config.zrange[0]);
    let hi = (z_init + COARSE_HALF_WIDTH).min(config.zrange[1]);
    let n = ((hi - lo) / config.zlambda_binsize).floor().max(0.0) as usize + 1;
    let grid: Vec<f64> = (0..n).map(|i| lo + i as f64 * config.zlambda_binsize).collect();
    let lnl: Vec<f64> = grid.iter().map(|&z| ln_likelihood(members, z)).collect();
    argmax(&lnl).map_or(z_init, |k| grid[k])
}

/// Iterated parabola refinement around `z0`.
fn refine(config: &Config, members: &[ZlambdaMember], z0: f64) -> Result<f64> {
    let h = config.zlambda_parab_step;
    let mut z = z0;
    for _ in 0..config.zlambda_maxiter {
        let xs = [z - h, z, z + h];
        let ys = xs.map(|x| ln_likelihood(members, x));
        let vertex = parabola_vertex(xs, ys).ok_or_else(|| {
            RedmapperError::NonConvergence(format!("likelihood not concave at z = {z:.4}"))
        })?;
        let next = vertex
            .clamp(z - 2.0 * h, z + 2.0 * h)
            .clamp(config.zrange[0], config.zrange[1]);
        let step = (next - z).abs();
        z = next;
        if step < config.zlambda_tol {
            return Ok(z);
        }
    }
    Err(RedmapperError::NonConvergence(format!(
        "z_lambda still moving after {} iterations",
        config.zlambda_maxiter
    )))
}

/// Estimate z_lambda.
///
/// # Arguments
///
/// * `members` - Candidate members with zred and membership probability
/// * `z_init` - Current cluster redshift, center of the coarse scan
/// * `lambda` - Current richness, sets how many members are used
/// * `correction` - Richness-dependent bias correction, if calibrated
pub fn estimate_zlambda(
    config: &Config,
    members: &[ZlambdaMember],
    z_init: f64,
    lambda: f64,
    correction: Option<&ZlambdaCorrection>,
) -> ZlambdaResult {
    let mut sorted: Vec<ZlambdaMember> = members
        .iter()
        .copied()
        .filter(|m| m.pmem > 0.0 && m.zred_e > 0.0)
        .collect();
    sorted.sort_by(|a, b| b.pmem.total_cmp(&a.pmem));
    let ntop = ((config.zlambda_topfrac * lambda).ceil() as usize).max(MIN_MEMBERS);
    sorted.truncate(ntop);

    if sorted.is_empty() {
        return ZlambdaResult {
            z_lambda: z_init,
            z_lambda_e: ZLAMBDA_E_UNDETERMINED,
            z_lambda_uncorr: z_init,
            converged: false,
            nused: 0,
        };
    }

    let mut active = sorted;
    let mut z = z_init;
    let mut converged = true;
    for _ in 0..=config.calib_zlambda_correct_niter {
        let coarse = coarse_peak(config, &active, z);
        z = match refine(config, &active, coarse) {
            Ok(refined) => {
                converged = true;
                refined
            }
            Err(err) => {
                log::debug!("z_lambda falling back to coarse optimum: {err}");
                converged = false;
                coarse
            }
        };

        let before = active.len();
        let kept: Vec<ZlambdaMember> = active
            .iter()
            .copied()
            .filter(|m| ((m.zred - z) / m.zred_e).abs() < config.zlambda_clean_nsig)
            .collect();
        if kept.len() == before || kept.len() < MIN_MEMBERS {
            break;
        }
        active = kept;
    }

    let info: f64 = active.iter().map(|m| m.pmem / (m.zred_e * m.zred_e)).sum();
    let z_corr = correction.map_or(z, |c| c.apply(z, lambda));
    ZlambdaResult {
        z_lambda: z_corr,
        z_lambda_e: 1.0 / info.sqrt(),
        z_lambda_uncorr: z,
        converged,
        nused: active.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn symmetric_members(z: f64, n: usize, spread: f64) -> Vec<ZlambdaMember> {
        (0..n)
            .map(|i| {
                let k = (i / 2 + 1) as f64;
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                ZlambdaMember {
                    zred: z + sign * k * spread / n as f64,
                    zred_e: 0.02,
                    pmem: 0.9,
                }
            })
            .collect()
    }

    #[test]
    fn test_recovers_redshift() {
        let config = Config::default();
        let members = symmetric_members(0.3123, 40, 0.03);
        let result = estimate_zlambda(&config, &members, 0.28, 40.0, None);
        assert!(result.converged);
        assert_abs_diff_eq!(result.z_lambda, 0.3123, epsilon = config.zlambda_tol);
        assert_eq!(result.nused, 28);
        assert_abs_diff_eq!(result.z_lambda_e, 0.02 / (0.9f64 * 28.0).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_outliers_are_cleaned() {
        let config = Config::default();
        let mut members = symmetric_members(0.25, 30, 0.02);
        for i in 0..4 {
            members.push(ZlambdaMember {
                zred: 0.45 + 0.001 * i as f64,
                zred_e: 0.01,
                pmem: 0.95,
            });
        }
        let result = estimate_zlambda(&config, &members, 0.25, 60.0, None);
        assert_abs_diff_eq!(result.z_lambda, 0.25, epsilon = config.zlambda_tol);
        assert_eq!(result.nused, 30);
    }

    #[test]
    fn test_too_few_members_still_uses_three() {
        let config = Config::default();
        let members: Vec<ZlambdaMember> = [0.195, 0.2, 0.205, 0.21]
            .iter()
            .zip([0.9, 0.8, 0.9, 0.1])
            .map(|(&zred, pmem)| ZlambdaMember {
                zred,
                zred_e: 0.01,
                pmem,
            })
            .collect();
        let result = estimate_zlambda(&config, &members, 0.2, 1.0, None);
        assert_eq!(result.nused, 3);
        assert_abs_diff_eq!(result.z_lambda, 0.2, epsilon = config.zlambda_tol);
    }

    #[test]
    fn test_no_members_returns_start() {
        let config = Config::default();
        let result = estimate_zlambda(&config, &[], 0.33, 10.0, None);
        assert_eq!(result.z_lambda, 0.33);
        assert_eq!(result.z_lambda_e, ZLAMBDA_E_UNDETERMINED);
        assert!(!result.converged);
        assert_eq!(result.nused, 0);

        let no_zred_errors = [ZlambdaMember {
            zred: 0.3,
            zred_e: 0.0,
            pmem: 0.9,
        }];
        let result = estimate_zlambda(&config, &no_zred_errors, 0.3, 10.0, None);
        assert!(result.z_lambda_e.is_finite());
    }

    #[test]
    fn test_correction_only_above_min_lambda() {
        let nodes = vec![0.1, 0.3, 0.5];
        let correction = ZlambdaCorrection {
            offset: SplineModel::constant(nodes.clone(), 0.01).unwrap(),
            slope: SplineModel::constant(nodes, 0.0).unwrap(),
            pivot: 30.0,
            min_lambda: 20.0,
        };
        assert_eq!(correction.apply(0.3, 10.0), 0.3);
        assert_abs_diff_eq!(correction.apply(0.3, 40.0), 0.31, epsilon = 1e-12);

        let config = Config::default();
        let members = symmetric_members(0.3, 40, 0.03);
        let result = estimate_zlambda(&config, &members, 0.3, 40.0, Some(&correction));
        assert_abs_diff_eq!(result.z_lambda - result.z_lambda_uncorr, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_fit_recovers_constant_bias() {
        let config = Config {
            calib_zlambda_minlambda: 5.0,
            ..Config::default()
        };
        let samples: Vec<(f64, f64, f64)> = (0..400)
            .map(|i| {
                let z = 0.05 + 0.55 * (i as f64 + 0.5) / 400.0;
                let lambda = 10.0 + (i % 7) as f64 * 15.0;
                (z, lambda, z + 0.004)
            })
            .collect();
        let correction = ZlambdaCorrection::fit(&config, &samples).unwrap();
        for z in [0.1, 0.3, 0.5] {
            assert_abs_diff_eq!(correction.apply(z, 50.0) - z, 0.004, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_fit_without_clusters_is_insufficient() {
        let config = Config::default();
        let samples = vec![(0.3, 5.0, 0.31)];
        assert!(matches!(
            ZlambdaCorrection::fit(&config, &samples),
            Err(RedmapperError::InsufficientData(_))
        ));
    }
}
