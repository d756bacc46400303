//! Fitting a red-sequence model to spectroscopic training galaxies.

use redmapper_math::{make_nodes, Extrapolation, SplineFitter, SplineModel, SplineTerm};

use crate::catalog::Galaxy;
use crate::config::Config;
use crate::error::{RedmapperError, Result};

use super::{pair_index, RedSequenceModel, MAX_CORRELATION, SIGMA_FLOOR};

/// Mean/slope refits with outlier clipping.
const TRAIN_CLIP_ROUNDS: usize = 2;

/// A training galaxy at its (spectroscopic) redshift.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingGalaxy {
    pub z: f64,
    pub refmag: f64,
    pub colors: Vec<f64>,
    pub mag_err: Vec<f64>,
}

impl TrainingGalaxy {
    pub fn from_galaxy(galaxy: &Galaxy, z: f64, ref_ind: usize) -> Self {
        Self {
            z,
            refmag: galaxy.refmag(ref_ind),
            colors: galaxy.colors(),
            mag_err: galaxy.mag_err.clone(),
        }
    }

    fn color_var(&self, i: usize) -> f64 {
        self.mag_err[i].powi(2) + self.mag_err[i + 1].powi(2)
    }

    /// Photometric covariance of colors `i < j`.
    fn color_cov(&self, i: usize, j: usize) -> f64 {
        if j == i + 1 {
            -self.mag_err[j].powi(2)
        } else {
            0.0
        }
    }
}

/// Variance of a unit Gaussian truncated at `±nsig`.
fn truncated_variance_factor(nsig: f64) -> f64 {
    let phi = (-0.5 * nsig * nsig).exp() / (2.0 * std::f64::consts::PI).sqrt();
    let mass = statrs::function::erf::erf(nsig / std::f64::consts::SQRT_2);
    (1.0 - 2.0 * nsig * phi / mass).max(1e-3)
}

/// Fit a fresh red-sequence model.
///
/// `prior` supplies m*(z) (copied unchanged) and the scatter used to weight
/// the first fit and define the color window. Training galaxies outside
/// `calib_redspec_nsig` of the fitted sequence in any color are clipped and
/// the fit repeated.
///
/// # Errors
///
/// * `RedmapperError::InsufficientData` - no training galaxies, or a spline
///   node without data in its support
pub fn fit_red_sequence(
    config: &Config,
    training: &[TrainingGalaxy],
    prior: &RedSequenceModel,
) -> Result<RedSequenceModel> {
    if training.is_empty() {
        return Err(RedmapperError::InsufficientData(
            "no red-sequence training galaxies".to_string(),
        ));
    }
    let ncol = config.ncol();
    prior.validate(ncol)?;
    let zrange = config.zrange;

    let z: Vec<f64> = training.iter().map(|g| g.z).collect();
    let refmag: Vec<f64> = training.iter().map(|g| g.refmag).collect();
    let pivotmag = SplineModel::fit(
        make_nodes(zrange, config.calib_pivotmag_nodesize, -1.0),
        &z,
        &refmag,
        &vec![1.0; z.len()],
        Extrapolation::Linear,
    )?;

    let mut model = RedSequenceModel {
        zrange,
        mstar: prior.mstar.clone(),
        pivotmag,
        colors: prior.colors.clone(),
        slopes: prior.slopes.clone(),
        sigmas: prior.sigmas.clone(),
        correlations: prior.correlations.clone(),
        zred_correction: None,
    };

    let mut keep = vec![true; training.len()];
    for round in 0..TRAIN_CLIP_ROUNDS {
        let (colors, slopes) = fit_means(config, training, &keep, &model)?;
        model.colors = colors;
        model.slopes = slopes;
        model.sigmas = fit_widths(config, training, &keep, &model)?;
        model.correlations = fit_correlations(config, training, &keep, &model)?;

        let before = keep.iter().filter(|k| **k).count();
        for (g, k) in training.iter().zip(keep.iter_mut()) {
            *k = within_nsig(&model, g, config.calib_redspec_nsig);
        }
        let after = keep.iter().filter(|k| **k).count();
        log::debug!(
            "Red-sequence round {}: {} -> {} training galaxies",
            round,
            before,
            after
        );
        if after == 0 {
            return Err(RedmapperError::InsufficientData(
                "all red-sequence training galaxies clipped".to_string(),
            ));
        }
    }

    log::info!(
        "Fit red sequence to {} training galaxies over z = [{:.2}, {:.2}]",
        keep.iter().filter(|k| **k).count(),
        zrange[0],
        zrange[1]
    );
    Ok(model)
}

fn residual(model: &RedSequenceModel, g: &TrainingGalaxy, i: usize) -> f64 {
    let pivot = model.pivotmag.evaluate(g.z);
    g.colors[i] - model.colors[i].evaluate(g.z) - model.slopes[i].evaluate(g.z) * (g.refmag - pivot)
}

pub(crate) fn within_nsig(model: &RedSequenceModel, g: &TrainingGalaxy, nsig: f64) -> bool {
    (0..model.ncol()).all(|i| {
        let width = (model.sigma(i, g.z).powi(2) + g.color_var(i)).sqrt();
        residual(model, g, i).abs() < nsig * width
    })
}

/// Joint fit of mean color and color-magnitude slope for every color.
fn fit_means(
    config: &Config,
    training: &[TrainingGalaxy],
    keep: &[bool],
    model: &RedSequenceModel,
) -> Result<(Vec<SplineModel>, Vec<SplineModel>)> {
    let ncol = config.ncol();
    let mut colors = Vec::with_capacity(ncol);
    let mut slopes = Vec::with_capacity(ncol);

    let z: Vec<f64> = training.iter().map(|g| g.z).collect();
    let ones = vec![1.0; training.len()];
    let dmag: Vec<f64> = training
        .iter()
        .map(|g| g.refmag - model.pivotmag.evaluate(g.z))
        .collect();

    for i in 0..ncol {
        let maxnode = config.calib_color_maxnodes[i];
        let fitter = SplineFitter::new(vec![
            SplineTerm::new(
                make_nodes(config.zrange, config.calib_color_nodesizes[i], maxnode),
                Extrapolation::Linear,
            )?,
            SplineTerm::new(
                make_nodes(config.zrange, config.calib_slope_nodesizes[i], maxnode),
                Extrapolation::Constant,
            )?,
        ]);
        let y: Vec<f64> = training.iter().map(|g| g.colors[i]).collect();
        let w: Vec<f64> = training
            .iter()
            .zip(keep.iter())
            .map(|(g, &k)| {
                if k {
                    1.0 / (model.sigma(i, g.z).powi(2) + g.color_var(i))
                } else {
                    0.0
                }
            })
            .collect();
        let mut fitted = fitter.fit(&z, &[ones.as_slice(), dmag.as_slice()], &y, &w)?;
        let slope = fitted.pop();
        let mean = fitted.pop();
        match (mean, slope) {
            (Some(mean), Some(slope)) => {
                colors.push(mean);
                slopes.push(slope);
            }
            _ => {
                return Err(RedmapperError::Numerical(
                    "color fit returned too few splines".to_string(),
                ))
            }
        }
    }
    Ok((colors, slopes))
}

/// Intrinsic scatter per color from galaxies inside the `calib_color_nsig`
/// window, corrected for the window truncation.
fn fit_widths(
    config: &Config,
    training: &[TrainingGalaxy],
    keep: &[bool],
    model: &RedSequenceModel,
) -> Result<Vec<SplineModel>> {
    let nsig = config.calib_color_nsig;
    let factor = truncated_variance_factor(nsig);
    let mut sigmas = Vec::with_capacity(config.ncol());

    for i in 0..config.ncol() {
        let mut z = Vec::new();
        let mut y = Vec::new();
        for (g, _) in training.iter().zip(keep.iter()).filter(|(_, k)| **k) {
            let r = residual(model, g, i);
            let width = (model.sigma(i, g.z).powi(2) + g.color_var(i)).sqrt();
            if r.abs() < nsig * width {
                z.push(g.z);
                y.push(r * r / factor - g.color_var(i));
            }
        }
        let nodes = make_nodes(
            config.zrange,
            config.calib_covmat_nodesize,
            config.calib_covmat_maxnodes[i],
        );
        let variance = SplineModel::fit(
            nodes.clone(),
            &z,
            &y,
            &vec![1.0; z.len()],
            Extrapolation::Constant,
        )?;
        let values: Vec<f64> = variance
            .values()
            .iter()
            .map(|v| v.max(SIGMA_FLOOR * SIGMA_FLOOR).sqrt())
            .collect();
        sigmas.push(SplineModel::new(nodes, values, Extrapolation::Constant)?);
    }
    Ok(sigmas)
}

/// Intrinsic correlation for every color pair.
fn fit_correlations(
    config: &Config,
    training: &[TrainingGalaxy],
    keep: &[bool],
    model: &RedSequenceModel,
) -> Result<Vec<SplineModel>> {
    let ncol = config.ncol();
    let nsig = config.calib_color_nsig;
    let factor = truncated_variance_factor(nsig);
    let mut correlations = vec![None; ncol * ncol.saturating_sub(1) / 2];

    for i in 0..ncol {
        for j in (i + 1)..ncol {
            let mut z = Vec::new();
            let mut y = Vec::new();
            for (g, _) in training.iter().zip(keep.iter()).filter(|(_, k)| **k) {
                let (ri, rj) = (residual(model, g, i), residual(model, g, j));
                let (si, sj) = (model.sigma(i, g.z), model.sigma(j, g.z));
                let wi = (si * si + g.color_var(i)).sqrt();
                let wj = (sj * sj + g.color_var(j)).sqrt();
                if ri.abs() < nsig * wi && rj.abs() < nsig * wj {
                    z.push(g.z);
                    y.push((ri * rj / factor - g.color_cov(i, j)) / (si * sj));
                }
            }
            let nodes = make_nodes(config.zrange, config.calib_covmat_nodesize, -1.0);
            let fitted = match SplineModel::fit(
                nodes.clone(),
                &z,
                &y,
                &vec![1.0; z.len()],
                Extrapolation::Constant,
            ) {
                Ok(spline) => {
                    let clipped: Vec<f64> = spline
                        .values()
                        .iter()
                        .map(|v| v.clamp(-MAX_CORRELATION, MAX_CORRELATION))
                        .collect();
                    SplineModel::new(nodes, clipped, Extrapolation::Constant)?
                }
                Err(err) => {
                    // Correlations are a refinement; keep the previous ones
                    log::warn!("Keeping previous correlation for colors {i},{j}: {err}");
                    model.correlations[pair_index(i, j, ncol)].clone()
                }
            };
            correlations[pair_index(i, j, ncol)] = Some(fitted);
        }
    }
    correlations
        .into_iter()
        .map(|c| c.ok_or_else(|| RedmapperError::Numerical("missing correlation".to_string())))
        .collect()
}
