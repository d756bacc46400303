//! Red-sequence photometric redshifts.
//!
//! The likelihood of a galaxy at redshift z combines the color chi-squared
//! against the red sequence at z, the covariance normalisation, and the
//! luminosity function evaluated at m*(z). It is tabulated on a fixed grid,
//! the peak refined with a parabola, and the width taken from the
//! normalised posterior.

use rayon::prelude::*;
use redmapper_math::optimize::{argmax, parabola_vertex};

use crate::catalog::{Galaxy, GalaxyCatalog, ZredEstimate};
use crate::lumfunc::LuminosityFilter;

use super::{RedSequenceModel, RedSequenceState};

/// Default grid spacing in redshift.
pub const ZRED_GRID_STEP: f64 = 0.002;

pub struct ZredEstimator<'a> {
    model: &'a RedSequenceModel,
    lumfilter: LuminosityFilter,
    ref_ind: usize,
    step: f64,
    states: Vec<RedSequenceState>,
}

impl<'a> ZredEstimator<'a> {
    pub fn new(
        model: &'a RedSequenceModel,
        lumfilter: LuminosityFilter,
        ref_ind: usize,
        step: f64,
    ) -> Self {
        let [lo, hi] = model.zrange;
        let n = ((hi - lo) / step).round().max(1.0) as usize + 1;
        let states = (0..n)
            .map(|i| model.state_at((lo + i as f64 * step).min(hi)))
            .collect();
        Self {
            model,
            lumfilter,
            ref_ind,
            step,
            states,
        }
    }

    pub fn model(&self) -> &RedSequenceModel {
        self.model
    }

    fn ln_likelihood(&self, state: &RedSequenceState, galaxy: &Galaxy) -> Option<(f64, f64)> {
        let refmag = galaxy.refmag(self.ref_ind);
        let chi = state.chisq(&galaxy.colors(), &galaxy.mag_err, refmag)?;
        let lnl = -0.5 * chi.chisq - 0.5 * chi.lndet + self.lumfilter.ln_phi(refmag, state.mstar);
        lnl.is_finite().then_some((lnl, chi.chisq))
    }

    /// Estimate zred for one galaxy, `None` if no grid point gives a finite
    /// likelihood.
    pub fn estimate(&self, galaxy: &Galaxy) -> Option<ZredEstimate> {
        let lnl: Vec<f64> = self
            .states
            .iter()
            .map(|s| self.ln_likelihood(s, galaxy).map_or(f64::NEG_INFINITY, |v| v.0))
            .collect();
        let k = argmax(&lnl)?;
        let zs: Vec<f64> = self.states.iter().map(|s| s.z).collect();

        let mut z_peak = zs[k];
        if k > 0 && k + 1 < zs.len() {
            let xs = [zs[k - 1], zs[k], zs[k + 1]];
            let ys = [lnl[k - 1], lnl[k], lnl[k + 1]];
            if ys.iter().all(|y| y.is_finite()) {
                if let Some(vertex) = parabola_vertex(xs, ys) {
                    z_peak = vertex.clamp(xs[0], xs[2]);
                }
            }
        }

        // Posterior width from the normalised likelihood
        let peak = lnl[k];
        let mut wsum = 0.0;
        let mut zsum = 0.0;
        let mut z2sum = 0.0;
        for (z, l) in zs.iter().zip(lnl.iter()) {
            let w = (l - peak).exp();
            wsum += w;
            zsum += w * z;
            z2sum += w * z * z;
        }
        let mean = zsum / wsum;
        let var = (z2sum / wsum - mean * mean).max(0.0);
        let zred_e = var.sqrt().max(self.step);

        let state = self.model.state_at(z_peak);
        let (lkhd, chisq) = match self.ln_likelihood(&state, galaxy) {
            Some(v) => v,
            None => self.ln_likelihood(&self.states[k], galaxy)?,
        };
        let refmag = galaxy.refmag(self.ref_ind);
        Some(ZredEstimate {
            zred: self.model.correct_zred(z_peak, refmag),
            zred_e,
            zred_uncorr: z_peak,
            chisq,
            lkhd,
        })
    }

    /// Estimate zred for every galaxy in parallel, in catalog order.
    pub fn estimate_all(&self, catalog: &GalaxyCatalog) -> Vec<Option<ZredEstimate>> {
        let estimates: Vec<Option<ZredEstimate>> = catalog
            .galaxies()
            .par_iter()
            .map(|g| self.estimate(g))
            .collect();
        let missing = estimates.iter().filter(|e| e.is_none()).count();
        if missing > 0 {
            log::debug!("{missing} galaxies have no finite zred likelihood");
        }
        estimates
    }
}
