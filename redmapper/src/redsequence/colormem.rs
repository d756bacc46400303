//! Color-regime selection of seed training galaxies.
//!
//! Before any red-sequence model has been trained, training galaxies are
//! picked from the template using a single color per redshift range. The
//! choice switches discretely at the configured redshift bounds.

use crate::catalog::GalaxyCatalog;
use crate::config::Config;

use super::{RedSequenceModel, TrainingGalaxy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorRegime {
    /// `z < zbounds[0]`
    Below { color_index: usize, sigint: f64 },
    /// `zbounds[0] <= z < zbounds[1]`
    Between { color_index: usize, sigint: f64 },
    /// `z >= zbounds[1]`
    Above { color_index: usize, sigint: f64 },
}

impl ColorRegime {
    pub fn for_redshift(z: f64, config: &Config) -> Self {
        let modes = config.calib_colormem_colormodes;
        let sigint = config.calib_colormem_sigint;
        let bounds = config.calib_colormem_zbounds;
        if z < bounds[0] {
            ColorRegime::Below {
                color_index: modes[0],
                sigint: sigint[0],
            }
        } else if z < bounds[1] {
            ColorRegime::Between {
                color_index: modes[1],
                sigint: sigint[1],
            }
        } else {
            ColorRegime::Above {
                color_index: modes[2],
                sigint: sigint[2],
            }
        }
    }

    pub fn color_index(&self) -> usize {
        match *self {
            ColorRegime::Below { color_index, .. }
            | ColorRegime::Between { color_index, .. }
            | ColorRegime::Above { color_index, .. } => color_index,
        }
    }

    pub fn sigint(&self) -> f64 {
        match *self {
            ColorRegime::Below { sigint, .. }
            | ColorRegime::Between { sigint, .. }
            | ColorRegime::Above { sigint, .. } => sigint,
        }
    }

    /// Whether a color lies within `nsig` of the predicted color.
    pub fn accepts(&self, observed: f64, predicted: f64, color_err: f64, nsig: f64) -> bool {
        let width = (self.sigint().powi(2) + color_err.powi(2)).sqrt();
        (observed - predicted).abs() < nsig * width
    }
}

/// Spectroscopic galaxies consistent with the template red sequence in the
/// regime color for their redshift.
pub fn select_template_members(
    catalog: &GalaxyCatalog,
    template: &RedSequenceModel,
    config: &Config,
) -> Vec<TrainingGalaxy> {
    let ref_ind = catalog.ref_ind();
    catalog
        .galaxies()
        .iter()
        .filter_map(|g| {
            let z = g.zspec?;
            if z < config.zrange[0] || z > config.zrange[1] {
                return None;
            }
            let regime = ColorRegime::for_redshift(z, config);
            let k = regime.color_index();
            let refmag = g.refmag(ref_ind);
            let predicted = template.state_at(z).model_colors(refmag)[k];
            let observed = g.mag[k] - g.mag[k + 1];
            let err = (g.mag_err[k].powi(2) + g.mag_err[k + 1].powi(2)).sqrt();
            regime
                .accepts(observed, predicted, err, config.calib_redspec_nsig)
                .then(|| TrainingGalaxy::from_galaxy(g, z, ref_ind))
        })
        .collect()
}
