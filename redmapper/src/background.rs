//! Field galaxy density model.
//!
//! Two histograms built from galaxies that are not cluster members:
//!
//! - chisq space: for each redshift bin, the density of galaxies in
//!   (color chi-squared against the red sequence at that redshift,
//!   reference magnitude)
//! - zred space: the density of galaxies in (zred, reference magnitude)
//!
//! Densities are per deg² per unit chi-squared (or zred) per magnitude.

use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::catalog::GalaxyCatalog;
use crate::config::Config;
use crate::error::{RedmapperError, Result};
use crate::redsequence::RedSequenceModel;

/// Uniform binning of one histogram axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinAxis {
    pub start: f64,
    pub step: f64,
    pub nbins: usize,
}

impl BinAxis {
    /// Bins of width `step` covering `[lo, hi]`.
    pub fn covering(lo: f64, hi: f64, step: f64) -> Self {
        let nbins = (((hi - lo) / step) - 1e-9).ceil().max(1.0) as usize;
        Self {
            start: lo,
            step,
            nbins,
        }
    }

    pub fn index(&self, x: f64) -> Option<usize> {
        let f = (x - self.start) / self.step;
        if !f.is_finite() || f < 0.0 {
            return None;
        }
        let i = f.floor() as usize;
        (i < self.nbins).then_some(i)
    }

    pub fn center(&self, i: usize) -> f64 {
        self.start + (i as f64 + 0.5) * self.step
    }

    /// Bracketing bin centers and weight of the upper one, clamped at the ends.
    fn interpolation(&self, x: f64) -> (usize, usize, f64) {
        let f = ((x - self.start) / self.step - 0.5).clamp(0.0, (self.nbins - 1) as f64);
        let lo = f.floor() as usize;
        let hi = (lo + 1).min(self.nbins - 1);
        (lo, hi, f - lo as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundModel {
    pub area_deg2: f64,
    pub z_axis: BinAxis,
    pub chisq_axis: BinAxis,
    pub refmag_axis: BinAxis,
    pub zred_axis: BinAxis,
    /// `[z, chisq, refmag]`
    pub sigma_g: Array3<f64>,
    /// `[zred, refmag]`
    pub sigma_zred: Array2<f64>,
}

impl BackgroundModel {
    /// Build both histograms from the galaxies not flagged in `exclude`.
    ///
    /// # Arguments
    ///
    /// * `catalog` - Galaxies annotated with zred
    /// * `model` - Red-sequence model used for chi-squared
    /// * `exclude` - Per-galaxy flag for cluster members to leave out
    /// * `area_deg2` - Effective survey area
    ///
    /// # Errors
    ///
    /// `RedmapperError::InsufficientData` when no field galaxies remain.
    pub fn build(
        config: &Config,
        catalog: &GalaxyCatalog,
        model: &RedSequenceModel,
        exclude: &[bool],
        area_deg2: f64,
    ) -> Result<Self> {
        if config.bkg_deepmode {
            log::warn!("bkg_deepmode is set but has no effect on the background model");
        }
        let ref_ind = catalog.ref_ind();
        let field: Vec<usize> = (0..catalog.len())
            .filter(|&i| !exclude.get(i).copied().unwrap_or(false))
            .collect();
        if field.is_empty() {
            return Err(RedmapperError::InsufficientData(
                "no field galaxies for the background".to_string(),
            ));
        }

        let (mut mag_lo, mut mag_hi) = (f64::INFINITY, f64::NEG_INFINITY);
        for &i in &field {
            let m = catalog.get(i).refmag(ref_ind);
            mag_lo = mag_lo.min(m);
            mag_hi = mag_hi.max(m);
        }
        let step = config.bkg_refmagbinsize;
        let refmag_axis = BinAxis::covering(
            (mag_lo / step).floor() * step,
            (mag_hi / step).floor() * step + step,
            step,
        );
        let z_axis = BinAxis::covering(config.zrange[0], config.zrange[1], config.bkg_zbinsize);
        let chisq_axis = BinAxis::covering(0.0, config.chisq_max, config.bkg_chisqbinsize);
        let zred_axis = BinAxis::covering(config.zrange[0], config.zrange[1], config.bkg_zredbinsize);

        let mut sigma_g = Array3::<f64>::zeros((z_axis.nbins, chisq_axis.nbins, refmag_axis.nbins));
        sigma_g
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(iz, mut plane)| {
                let state = model.state_at(z_axis.center(iz));
                for &i in &field {
                    let g = catalog.get(i);
                    let refmag = g.refmag(ref_ind);
                    let Some(chi) = state.chisq(&g.colors(), &g.mag_err, refmag) else {
                        continue;
                    };
                    if let (Some(ic), Some(im)) =
                        (chisq_axis.index(chi.chisq), refmag_axis.index(refmag))
                    {
                        plane[(ic, im)] += 1.0;
                    }
                }
            });
        sigma_g /= area_deg2 * chisq_axis.step * refmag_axis.step;

        let mut sigma_zred = Array2::<f64>::zeros((zred_axis.nbins, refmag_axis.nbins));
        for &i in &field {
            let g = catalog.get(i);
            let Some(zred) = g.zred else { continue };
            if let (Some(iz), Some(im)) = (
                zred_axis.index(zred.zred),
                refmag_axis.index(g.refmag(ref_ind)),
            ) {
                sigma_zred[(iz, im)] += 1.0;
            }
        }
        sigma_zred /= area_deg2 * zred_axis.step * refmag_axis.step;

        log::info!(
            "Background from {} field galaxies over {:.2} deg² ({} z bins, refmag {:.1}-{:.1})",
            field.len(),
            area_deg2,
            z_axis.nbins,
            refmag_axis.start,
            refmag_axis.start + refmag_axis.nbins as f64 * refmag_axis.step
        );

        Ok(Self {
            area_deg2,
            z_axis,
            chisq_axis,
            refmag_axis,
            zred_axis,
            sigma_g,
            sigma_zred,
        })
    }

    /// Flat density in both spaces, for tests and dry runs.
    pub fn constant(config: &Config, refmag_range: [f64; 2], density: f64) -> Self {
        let z_axis = BinAxis::covering(config.zrange[0], config.zrange[1], config.bkg_zbinsize);
        let chisq_axis = BinAxis::covering(0.0, config.chisq_max, config.bkg_chisqbinsize);
        let refmag_axis =
            BinAxis::covering(refmag_range[0], refmag_range[1], config.bkg_refmagbinsize);
        let zred_axis = BinAxis::covering(config.zrange[0], config.zrange[1], config.bkg_zredbinsize);
        Self {
            area_deg2: 1.0,
            sigma_g: Array3::from_elem(
                (z_axis.nbins, chisq_axis.nbins, refmag_axis.nbins),
                density,
            ),
            sigma_zred: Array2::from_elem((zred_axis.nbins, refmag_axis.nbins), density),
            z_axis,
            chisq_axis,
            refmag_axis,
            zred_axis,
        }
    }

    /// Density in chi-squared space, linear in redshift between bin centers.
    /// Zero outside the chi-squared or magnitude range.
    pub fn sigma_g(&self, z: f64, chisq: f64, refmag: f64) -> f64 {
        let (Some(ic), Some(im)) = (self.chisq_axis.index(chisq), self.refmag_axis.index(refmag))
        else {
            return 0.0;
        };
        let (lo, hi, t) = self.z_axis.interpolation(z);
        (1.0 - t) * self.sigma_g[(lo, ic, im)] + t * self.sigma_g[(hi, ic, im)]
    }

    /// Density in zred space, linear in zred between bin centers.
    pub fn sigma_zred(&self, zred: f64, refmag: f64) -> f64 {
        let Some(im) = self.refmag_axis.index(refmag) else {
            return 0.0;
        };
        if zred < self.zred_axis.start
            || zred > self.zred_axis.start + self.zred_axis.nbins as f64 * self.zred_axis.step
        {
            return 0.0;
        }
        let (lo, hi, t) = self.zred_axis.interpolation(zred);
        (1.0 - t) * self.sigma_zred[(lo, im)] + t * self.sigma_zred[(hi, im)]
    }
}
