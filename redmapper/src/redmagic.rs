//! redMaGiC luminous red galaxy selections.
//!
//! Each named selection keeps galaxies brighter than `eta L*` whose color
//! chi-squared is under a redshift-dependent cut. The cut at every node is
//! the chi-squared at which the luminous red galaxies in a thin redshift
//! slice reach a target comoving density `n0 × 10⁻⁴ h³ Mpc⁻³`.
//!
//! The afterburner then calibrates the selected galaxies' redshifts against
//! spectroscopy. `zredmagic = zred - bias(zred)` and
//! `zredmagic_e = eratio(zred) zred_e`, where both splines hold clipped
//! medians over the luminous spectroscopic galaxies passing the cut, binned
//! on the nearest correction node. The cut is refit on the corrected
//! redshifts after every bias fit.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use redmapper_math::stats::median;
use redmapper_math::{make_nodes, Extrapolation, SplineModel};
use serde::{Deserialize, Serialize};

use crate::catalog::{Galaxy, GalaxyCatalog, ZredEstimate};
use crate::config::Config;
use crate::cosmology::Cosmology;
use crate::error::{RedmapperError, Result};
use crate::redsequence::RedSequenceModel;

/// Smallest chi-squared cut a node may take.
pub const MIN_CHISQ_CUT: f64 = 0.1;
/// Density unit of `n0`, h³ Mpc⁻³.
const N0_UNIT: f64 = 1e-4;
pub const BIAS_BOUNDS: [f64; 2] = [-0.1, 0.1];
pub const ERATIO_BOUNDS: [f64; 2] = [0.5, 1.5];
/// Gaussian sigma per unit absolute deviation.
const MAD_TO_SIGMA: f64 = 1.4826;
/// Bias fits and cut refits the afterburner alternates through.
const AFTERBURNER_NITER: usize = 5;

fn luminosity_at(refmag: f64, model: &RedSequenceModel, z: f64) -> f64 {
    10f64.powf(-0.4 * (refmag - model.mstar.evaluate(z)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedmagicSelection {
    pub name: String,
    /// Minimum luminosity in units of L*
    pub eta: f64,
    pub n0: f64,
    pub zmax: f64,
    /// Evaluated at the raw zred
    pub chisq_cut: SplineModel,
    /// `zred - zredmagic` against zred
    pub bias: SplineModel,
    /// `zredmagic_e / zred_e` against zred
    pub eratio: SplineModel,
}

/// A galaxy picked by a selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedmagicGalaxy {
    pub galaxy_id: u64,
    pub ra: f64,
    pub dec: f64,
    pub refmag: f64,
    pub chisq: f64,
    pub zredmagic: f64,
    pub zredmagic_e: f64,
    pub zspec: Option<f64>,
}

impl RedmagicSelection {
    /// Afterburner-corrected redshift and error.
    pub fn zredmagic(&self, zred: &ZredEstimate) -> (f64, f64) {
        (
            zred.zred - self.bias.evaluate(zred.zred),
            zred.zred_e * self.eratio.evaluate(zred.zred),
        )
    }

    pub fn select_galaxy(
        &self,
        galaxy: &Galaxy,
        model: &RedSequenceModel,
        ref_ind: usize,
    ) -> Option<RedmagicGalaxy> {
        let zred = galaxy.zred?;
        let (z, z_e) = self.zredmagic(&zred);
        let refmag = galaxy.refmag(ref_ind);
        let passes = z <= self.zmax
            && luminosity_at(refmag, model, z) > self.eta
            && zred.chisq < self.chisq_cut.evaluate(zred.zred);
        passes.then_some(RedmagicGalaxy {
            galaxy_id: galaxy.id,
            ra: galaxy.ra,
            dec: galaxy.dec,
            refmag,
            chisq: zred.chisq,
            zredmagic: z,
            zredmagic_e: z_e,
            zspec: galaxy.zspec,
        })
    }

    pub fn selects(&self, galaxy: &Galaxy, model: &RedSequenceModel, ref_ind: usize) -> bool {
        self.select_galaxy(galaxy, model, ref_ind).is_some()
    }
}

/// Photometry of a galaxy the calibration can use.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    zred: f64,
    zred_e: f64,
    chisq: f64,
    refmag: f64,
    zspec: Option<f64>,
}

/// Calibration state for one selection.
struct SelectionFit<'a> {
    config: &'a Config,
    model: &'a RedSequenceModel,
    eta: f64,
    zmax: f64,
    nodes: Vec<f64>,
    corrnodes: Vec<f64>,
    /// Target galaxy count in the slice around each node
    targets: Vec<usize>,
    candidates: &'a [Candidate],
    /// Candidates with spectra the afterburner trains on
    train: Vec<usize>,
}

impl SelectionFit<'_> {
    fn corrected(&self, c: &Candidate, bias: &SplineModel) -> f64 {
        c.zred - bias.evaluate(c.zred)
    }

    /// Chi-squared cut at every node for the corrected redshifts.
    fn fit_cuts(&self, bias: &SplineModel) -> Vec<f64> {
        let half = 0.5 * self.config.redmagic_calib_zbinsize;
        let maxchi = self.config.redmagic_calib_chisqcut;
        self.nodes
            .iter()
            .zip(self.targets.iter())
            .map(|(&z, &target)| {
                let mut chisqs: Vec<f64> = self
                    .candidates
                    .iter()
                    .filter_map(|c| {
                        let zm = self.corrected(c, bias);
                        ((zm - z).abs() < half && luminosity_at(c.refmag, self.model, zm) > self.eta)
                            .then_some(c.chisq)
                    })
                    .collect();
                chisqs.sort_by(f64::total_cmp);
                let cut = match target {
                    0 => MIN_CHISQ_CUT,
                    k if k <= chisqs.len() => chisqs[k - 1],
                    _ => maxchi,
                };
                cut.clamp(MIN_CHISQ_CUT, maxchi)
            })
            .collect()
    }

    /// Clipped node medians of the bias and error ratio over the training
    /// galaxies passing `cut`. Nodes without galaxies keep their previous
    /// values.
    fn fit_bias_eratio(
        &self,
        cut: &SplineModel,
        bias: &SplineModel,
        eratio: &SplineModel,
    ) -> Result<(SplineModel, SplineModel)> {
        let maxchi = self.config.redmagic_calib_chisqcut;
        let nnodes = self.corrnodes.len();
        let mut dz: Vec<Vec<f64>> = vec![Vec::new(); nnodes];
        let mut ratio: Vec<Vec<f64>> = vec![Vec::new(); nnodes];
        for &i in &self.train {
            let c = &self.candidates[i];
            let Some(zspec) = c.zspec else { continue };
            let zm = self.corrected(c, bias);
            let passes = c.chisq < cut.evaluate(c.zred).clamp(MIN_CHISQ_CUT, maxchi)
                && luminosity_at(c.refmag, self.model, zm) > self.eta
                && zm < self.zmax;
            if !passes {
                continue;
            }
            let j = nearest_node(&self.corrnodes, c.zred);
            dz[j].push(c.zred - zspec);
            ratio[j].push(MAD_TO_SIGMA * (c.zred - zspec).abs() / c.zred_e);
        }

        let node_medians = |samples: &[Vec<f64>], previous: &SplineModel, bounds: [f64; 2]| -> Vec<f64> {
            samples
                .iter()
                .zip(previous.values())
                .map(|(v, &prev)| median(v).map_or(prev, |m| m.clamp(bounds[0], bounds[1])))
                .collect()
        };
        let bias_values = node_medians(&dz, bias, BIAS_BOUNDS);
        let eratio_values = node_medians(&ratio, eratio, ERATIO_BOUNDS);
        Ok((
            SplineModel::new(self.corrnodes.clone(), bias_values, Extrapolation::Constant)?,
            SplineModel::new(self.corrnodes.clone(), eratio_values, Extrapolation::Constant)?,
        ))
    }
}

/// Index of the node closest to `z`.
fn nearest_node(nodes: &[f64], z: f64) -> usize {
    nodes
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - z).abs().total_cmp(&(b.1 - z).abs()))
        .map_or(0, |(j, _)| j)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedmagicModel {
    pub selections: Vec<RedmagicSelection>,
}

impl RedmagicModel {
    /// Fit the chi-squared cut of every configured selection, then run the
    /// afterburner when `redmagic_run_afterburner` is set.
    ///
    /// `catalog` must carry zred annotations and, for the afterburner,
    /// spectroscopic redshifts. `area_deg2` is the footprint area used to
    /// turn counts into densities.
    ///
    /// # Errors
    ///
    /// * `RedmapperError::Config` - the footprint area is not positive
    pub fn calibrate(
        config: &Config,
        catalog: &GalaxyCatalog,
        model: &RedSequenceModel,
        cosmology: &Cosmology,
        area_deg2: f64,
    ) -> Result<Self> {
        if area_deg2 <= 0.0 {
            return Err(RedmapperError::Config(format!(
                "redMaGiC calibration needs a positive area, got {area_deg2}"
            )));
        }
        let ref_ind = catalog.ref_ind();
        let candidates: Vec<Candidate> = catalog
            .galaxies()
            .iter()
            .filter_map(|g| {
                let zred = g.zred?;
                Some(Candidate {
                    zred: zred.zred,
                    zred_e: zred.zred_e,
                    chisq: zred.chisq,
                    refmag: g.refmag(ref_ind),
                    zspec: g.zspec,
                })
            })
            .collect();
        let with_spec: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].zspec.is_some())
            .collect();

        let half = 0.5 * config.redmagic_calib_zbinsize;
        let mut selections = Vec::with_capacity(config.redmagic_names.len());
        for (i, name) in config.redmagic_names.iter().enumerate() {
            let eta = config.redmagic_etas[i];
            let n0 = config.redmagic_n0s[i];
            let zmax = config.redmagic_zmaxes[i].min(config.zrange[1]);
            let nodes = make_nodes([config.zrange[0], zmax], config.redmagic_calib_nodesize, -1.0);
            let corrnodes = make_nodes([config.zrange[0], zmax], config.redmagic_calib_corr_nodesize, -1.0);
            let targets = nodes
                .iter()
                .map(|&z| (n0 * N0_UNIT * cosmology.comoving_volume(z - half, z + half, area_deg2)).ceil() as usize)
                .collect();

            let mut train = with_spec.clone();
            train.shuffle(&mut ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(i as u64)));
            train.truncate((config.redmagic_calib_fractrain * with_spec.len() as f64).floor() as usize);
            train.sort_unstable();

            let fit = SelectionFit {
                config,
                model,
                eta,
                zmax,
                nodes,
                corrnodes,
                targets,
                candidates: &candidates,
                train,
            };
            let mut bias = SplineModel::constant(fit.corrnodes.clone(), 0.0)?;
            let mut eratio = SplineModel::constant(fit.corrnodes.clone(), 1.0)?;
            let mut cut = SplineModel::new(fit.nodes.clone(), fit.fit_cuts(&bias), Extrapolation::Constant)?;

            if config.redmagic_run_afterburner {
                if fit.train.is_empty() {
                    log::warn!("redMaGiC {name}: no spectroscopic galaxies, afterburner skipped");
                } else {
                    for _ in 0..AFTERBURNER_NITER {
                        (bias, eratio) = fit.fit_bias_eratio(&cut, &bias, &eratio)?;
                        cut = SplineModel::new(fit.nodes.clone(), fit.fit_cuts(&bias), Extrapolation::Constant)?;
                    }
                    (bias, eratio) = fit.fit_bias_eratio(&cut, &bias, &eratio)?;
                    log::info!(
                        "redMaGiC {name}: afterburner on {} spectra, bias {:.4?}, eratio {:.2?}",
                        fit.train.len(),
                        bias.values(),
                        eratio.values()
                    );
                }
            }
            log::info!("redMaGiC {name}: eta {eta}, n0 {n0}, cuts {:.2?}", cut.values());
            selections.push(RedmagicSelection {
                name: name.clone(),
                eta,
                n0,
                zmax,
                chisq_cut: cut,
                bias,
                eratio,
            });
        }
        Ok(Self { selections })
    }

    pub fn selection(&self, name: &str) -> Option<&RedmagicSelection> {
        self.selections.iter().find(|s| s.name == name)
    }

    /// Galaxies picked by the named selection, in catalog order.
    pub fn select(
        &self,
        name: &str,
        catalog: &GalaxyCatalog,
        model: &RedSequenceModel,
    ) -> Option<Vec<RedmagicGalaxy>> {
        let selection = self.selection(name)?;
        let ref_ind = catalog.ref_ind();
        Some(
            catalog
                .galaxies()
                .iter()
                .filter_map(|g| selection.select_galaxy(g, model, ref_ind))
                .collect(),
        )
    }
}
