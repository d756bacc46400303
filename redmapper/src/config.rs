//! Run configuration.
//!
//! A flat key/value surface loaded from JSON. Every key is optional in the
//! file; missing keys take the defaults from [`Config::default`]. Per-color
//! arrays must have exactly `nmag - 1` entries, which [`Config::validate`]
//! checks before any stage runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::centering::CenterClass;
use crate::error::{RedmapperError, Result};

/// Only healpix coverage masks are supported.
pub const HEALPIX_MASK_MODE: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // General
    pub outbase: String,
    pub nmag: usize,
    pub ref_ind: usize,
    pub bands: Vec<String>,
    pub zrange: [f64; 2],
    /// Survey area in deg², derived from the mask when absent
    pub area: Option<f64>,
    pub omega_m: f64,
    pub chisq_max: f64,
    pub lval_reference: f64,
    /// Halo width in degrees loaded around each partition
    pub border: f64,
    pub partition_depth: u8,
    pub seed: u64,
    /// Limiting reference magnitude where no depth map is given
    pub limmag_ref: f64,

    // Mask
    pub mask_mode: i32,
    pub max_maskfrac: f64,
    pub maskgal_ngals: usize,
    pub maskgal_nsamples: usize,

    // Background
    pub bkg_chisqbinsize: f64,
    pub bkg_refmagbinsize: f64,
    pub bkg_zbinsize: f64,
    pub bkg_zredbinsize: f64,
    pub bkg_deepmode: bool,

    // Calibration
    pub calib_niter: usize,
    pub calib_nproc: usize,
    pub calib_run_nproc: usize,
    pub calib_pivotmag_nodesize: f64,
    pub calib_color_nodesizes: Vec<f64>,
    pub calib_color_maxnodes: Vec<f64>,
    pub calib_slope_nodesizes: Vec<f64>,
    pub calib_covmat_nodesize: f64,
    pub calib_covmat_maxnodes: Vec<f64>,
    pub calib_color_nsig: f64,
    pub calib_redspec_nsig: f64,
    pub calib_redgal_template: String,
    pub calib_pcut: f64,
    pub calib_use_pcol: bool,
    pub calib_lumfunc_alpha: f64,
    pub calib_corr_nodesize: f64,
    pub calib_corr_slope_nodesize: f64,
    pub calib_corr_pcut: f64,
    pub calib_colormem_colormodes: [usize; 3],
    pub calib_colormem_zbounds: [f64; 2],
    pub calib_colormem_sigint: [f64; 3],
    pub calib_zlambda_nodesize: f64,
    pub calib_zlambda_slope_nodesize: f64,
    pub calib_zlambda_minlambda: f64,
    pub calib_zlambda_correct_niter: usize,
    pub calib_minlambda: f64,

    // First pass
    pub firstpass_r0: f64,
    pub firstpass_beta: f64,
    pub firstpass_niter: usize,
    pub firstpass_minlambda: f64,
    pub firstpass_centerclass: CenterClass,

    // Likelihood pass
    pub likelihoods_r0: f64,
    pub likelihoods_beta: f64,
    pub likelihoods_use_zred: bool,
    pub likelihoods_minlambda: f64,

    // Percolation
    pub percolation_r0: f64,
    pub percolation_beta: f64,
    pub percolation_rmask_0: f64,
    pub percolation_rmask_beta: f64,
    pub percolation_rmask_gamma: f64,
    pub percolation_rmask_zpivot: f64,
    pub percolation_lmask: f64,
    pub percolation_niter: usize,
    pub percolation_minlambda: f64,
    pub percolation_maxcen: usize,
    pub percolation_pbcg_cut: f64,
    pub centerclass: CenterClass,

    // z_lambda
    pub zlambda_pivot: f64,
    pub zlambda_binsize: f64,
    pub zlambda_tol: f64,
    pub zlambda_maxiter: usize,
    pub zlambda_topfrac: f64,
    pub zlambda_epsilon: f64,
    pub zlambda_parab_step: f64,
    pub zlambda_clean_nsig: f64,

    // Centering
    pub wcen_rsoft: f64,
    pub wcen_zred_chisq_max: f64,
    pub wcen_minlambda: f64,
    pub wcen_maxlambda: f64,
    pub wcen_cal_zrange: [f64; 2],
    pub wcen_pivot: f64,

    // redMaGiC
    pub redmagic_names: Vec<String>,
    pub redmagic_etas: Vec<f64>,
    pub redmagic_n0s: Vec<f64>,
    pub redmagic_zmaxes: Vec<f64>,
    pub redmagic_calib_nodesize: f64,
    pub redmagic_calib_zbinsize: f64,
    pub redmagic_calib_chisqcut: f64,
    /// Node spacing of the zredmagic bias and error-ratio splines
    pub redmagic_calib_corr_nodesize: f64,
    /// Fraction of luminous spectroscopic galaxies the afterburner trains on
    pub redmagic_calib_fractrain: f64,
    pub redmagic_run_afterburner: bool,
}

impl Default for Config {
    fn default() -> Self {
        let ncol = 3;
        Self {
            outbase: "redmapper".to_string(),
            nmag: 4,
            ref_ind: 3,
            bands: ["g", "r", "i", "z"].iter().map(|b| b.to_string()).collect(),
            zrange: [0.05, 0.60],
            area: None,
            omega_m: 0.3,
            chisq_max: 20.0,
            lval_reference: 0.2,
            border: 0.0,
            partition_depth: 3,
            seed: 12345,
            limmag_ref: 21.5,

            mask_mode: HEALPIX_MASK_MODE,
            max_maskfrac: 0.2,
            maskgal_ngals: 6000,
            maskgal_nsamples: 100,

            bkg_chisqbinsize: 0.5,
            bkg_refmagbinsize: 0.2,
            bkg_zbinsize: 0.02,
            bkg_zredbinsize: 0.01,
            bkg_deepmode: false,

            calib_niter: 3,
            calib_nproc: 1,
            calib_run_nproc: 1,
            calib_pivotmag_nodesize: 0.1,
            calib_color_nodesizes: vec![0.05; ncol],
            calib_color_maxnodes: vec![-1.0; ncol],
            calib_slope_nodesizes: vec![0.1; ncol],
            calib_covmat_nodesize: 0.15,
            calib_covmat_maxnodes: vec![-1.0; ncol],
            calib_color_nsig: 1.5,
            calib_redspec_nsig: 3.0,
            calib_redgal_template: "red_sequence_template.json".to_string(),
            calib_pcut: 0.3,
            calib_use_pcol: true,
            calib_lumfunc_alpha: -1.0,
            calib_corr_nodesize: 0.05,
            calib_corr_slope_nodesize: 0.1,
            calib_corr_pcut: 0.9,
            calib_colormem_colormodes: [0, 1, 2],
            calib_colormem_zbounds: [0.35, 0.70],
            calib_colormem_sigint: [0.05, 0.03, 0.03],
            calib_zlambda_nodesize: 0.04,
            calib_zlambda_slope_nodesize: 0.1,
            calib_zlambda_minlambda: 20.0,
            calib_zlambda_correct_niter: 3,
            calib_minlambda: 5.0,

            firstpass_r0: 0.5,
            firstpass_beta: 0.0,
            firstpass_niter: 2,
            firstpass_minlambda: 3.0,
            firstpass_centerclass: CenterClass::Bcg,

            likelihoods_r0: 1.0,
            likelihoods_beta: 0.2,
            likelihoods_use_zred: false,
            likelihoods_minlambda: 3.0,

            percolation_r0: 1.0,
            percolation_beta: 0.2,
            percolation_rmask_0: 1.5,
            percolation_rmask_beta: 0.2,
            percolation_rmask_gamma: 0.0,
            percolation_rmask_zpivot: 0.3,
            percolation_lmask: 0.1,
            percolation_niter: 2,
            percolation_minlambda: 3.0,
            percolation_maxcen: 5,
            percolation_pbcg_cut: 0.3,
            centerclass: CenterClass::WcenZred,

            zlambda_pivot: 30.0,
            zlambda_binsize: 0.002,
            zlambda_tol: 0.0002,
            zlambda_maxiter: 20,
            zlambda_topfrac: 0.7,
            zlambda_epsilon: 0.005,
            zlambda_parab_step: 0.002,
            zlambda_clean_nsig: 5.0,

            wcen_rsoft: 0.05,
            wcen_zred_chisq_max: 100.0,
            wcen_minlambda: 10.0,
            wcen_maxlambda: 100.0,
            wcen_cal_zrange: [0.0, 1.0],
            wcen_pivot: 30.0,

            redmagic_names: vec!["highdens".to_string(), "highlum".to_string()],
            redmagic_etas: vec![0.5, 1.0],
            redmagic_n0s: vec![10.0, 4.0],
            redmagic_zmaxes: vec![0.60, 0.60],
            redmagic_calib_nodesize: 0.05,
            redmagic_calib_zbinsize: 0.02,
            redmagic_calib_chisqcut: 20.0,
            redmagic_calib_corr_nodesize: 0.05,
            redmagic_calib_fractrain: 0.5,
            redmagic_run_afterburner: true,
        }
    }
}

/// Radius-richness relation `r = r0 (lambda / 100)^beta` in h^-1 Mpc.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusRelation {
    pub r0: f64,
    pub beta: f64,
}

impl RadiusRelation {
    pub fn radius(&self, lambda: f64) -> f64 {
        self.r0 * (lambda.max(1e-3) / 100.0).powf(self.beta)
    }
}

impl Config {
    /// Number of colors (adjacent band differences).
    pub fn ncol(&self) -> usize {
        self.nmag.saturating_sub(1)
    }

    pub fn firstpass_radius(&self) -> RadiusRelation {
        RadiusRelation {
            r0: self.firstpass_r0,
            beta: self.firstpass_beta,
        }
    }

    pub fn likelihoods_radius(&self) -> RadiusRelation {
        RadiusRelation {
            r0: self.likelihoods_r0,
            beta: self.likelihoods_beta,
        }
    }

    pub fn percolation_radius(&self) -> RadiusRelation {
        RadiusRelation {
            r0: self.percolation_r0,
            beta: self.percolation_beta,
        }
    }

    /// Percolation masking radius in h^-1 Mpc.
    pub fn rmask(&self, lambda: f64, z: f64) -> f64 {
        self.percolation_rmask_0
            * (lambda.max(1e-3) / 100.0).powf(self.percolation_rmask_beta)
            * (z / self.percolation_rmask_zpivot).powf(self.percolation_rmask_gamma)
    }

    /// Check array lengths and ranges.
    ///
    /// # Errors
    ///
    /// * `RedmapperError::ConfigArrayLength` - a per-color array does not have `nmag - 1` entries
    /// * `RedmapperError::Config` - any other inconsistent value
    pub fn validate(&self) -> Result<()> {
        if self.nmag < 2 {
            return Err(RedmapperError::Config(format!(
                "nmag must be at least 2, got {}",
                self.nmag
            )));
        }
        if self.ref_ind >= self.nmag {
            return Err(RedmapperError::Config(format!(
                "ref_ind {} out of range for {} bands",
                self.ref_ind, self.nmag
            )));
        }
        if !self.bands.is_empty() && self.bands.len() != self.nmag {
            return Err(RedmapperError::ConfigArrayLength {
                name: "bands",
                expected: self.nmag,
                found: self.bands.len(),
            });
        }

        let ncol = self.ncol();
        let per_color: [(&'static str, usize); 4] = [
            ("calib_color_nodesizes", self.calib_color_nodesizes.len()),
            ("calib_color_maxnodes", self.calib_color_maxnodes.len()),
            ("calib_slope_nodesizes", self.calib_slope_nodesizes.len()),
            ("calib_covmat_maxnodes", self.calib_covmat_maxnodes.len()),
        ];
        for (name, found) in per_color {
            if found != ncol {
                return Err(RedmapperError::ConfigArrayLength {
                    name,
                    expected: ncol,
                    found,
                });
            }
        }

        if let Some(&bad) = self
            .calib_colormem_colormodes
            .iter()
            .find(|&&mode| mode >= ncol)
        {
            return Err(RedmapperError::Config(format!(
                "calib_colormem_colormodes entry {bad} is not a color index (ncol = {ncol})"
            )));
        }
        if self.calib_colormem_zbounds[0] > self.calib_colormem_zbounds[1] {
            return Err(RedmapperError::Config(
                "calib_colormem_zbounds must be ordered".to_string(),
            ));
        }

        if !(self.zrange[0] >= 0.0 && self.zrange[0] < self.zrange[1]) {
            return Err(RedmapperError::Config(format!(
                "zrange must be ordered and non-negative, got {:?}",
                self.zrange
            )));
        }
        if self.wcen_cal_zrange[0] > self.wcen_cal_zrange[1] {
            return Err(RedmapperError::Config(
                "wcen_cal_zrange must be ordered".to_string(),
            ));
        }

        let positive = [
            ("bkg_chisqbinsize", self.bkg_chisqbinsize),
            ("bkg_refmagbinsize", self.bkg_refmagbinsize),
            ("bkg_zbinsize", self.bkg_zbinsize),
            ("bkg_zredbinsize", self.bkg_zredbinsize),
            ("zlambda_binsize", self.zlambda_binsize),
            ("zlambda_parab_step", self.zlambda_parab_step),
            ("zlambda_tol", self.zlambda_tol),
            ("zlambda_epsilon", self.zlambda_epsilon),
            ("calib_pivotmag_nodesize", self.calib_pivotmag_nodesize),
            ("calib_covmat_nodesize", self.calib_covmat_nodesize),
            ("chisq_max", self.chisq_max),
            ("wcen_rsoft", self.wcen_rsoft),
            ("percolation_rmask_zpivot", self.percolation_rmask_zpivot),
            ("redmagic_calib_nodesize", self.redmagic_calib_nodesize),
            ("redmagic_calib_zbinsize", self.redmagic_calib_zbinsize),
            ("redmagic_calib_corr_nodesize", self.redmagic_calib_corr_nodesize),
        ];
        for (name, value) in positive {
            if value <= 0.0 || !value.is_finite() {
                return Err(RedmapperError::Config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if let Some(&bad) = self
            .calib_color_nodesizes
            .iter()
            .chain(self.calib_slope_nodesizes.iter())
            .find(|&&v| v <= 0.0)
        {
            return Err(RedmapperError::Config(format!(
                "color and slope node sizes must be positive, got {bad}"
            )));
        }

        if let Some(area) = self.area {
            if area <= 0.0 {
                return Err(RedmapperError::Config(format!(
                    "area must be positive, got {area}"
                )));
            }
        }
        if self.maskgal_nsamples == 0 || self.maskgal_ngals == 0 {
            return Err(RedmapperError::Config(
                "maskgal_nsamples and maskgal_ngals must be non-zero".to_string(),
            ));
        }

        if !(self.redmagic_calib_fractrain > 0.0 && self.redmagic_calib_fractrain <= 1.0) {
            return Err(RedmapperError::Config(format!(
                "redmagic_calib_fractrain must be in (0, 1], got {}",
                self.redmagic_calib_fractrain
            )));
        }

        let nrm = self.redmagic_names.len();
        for (name, found) in [
            ("redmagic_etas", self.redmagic_etas.len()),
            ("redmagic_n0s", self.redmagic_n0s.len()),
            ("redmagic_zmaxes", self.redmagic_zmaxes.len()),
        ] {
            if found != nrm {
                return Err(RedmapperError::ConfigArrayLength {
                    name,
                    expected: nrm,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Fails unless the mask mode is the healpix coverage mode.
    pub fn check_mask_mode(&self) -> Result<()> {
        if self.mask_mode != HEALPIX_MASK_MODE {
            return Err(RedmapperError::UnsupportedMaskMode(self.mask_mode));
        }
        Ok(())
    }

    /// Locate the red-sequence template: first in the package data
    /// directory, then as given.
    pub fn template_path(&self) -> Result<PathBuf> {
        let packaged = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("data")
            .join(&self.calib_redgal_template);
        if packaged.is_file() {
            return Ok(packaged);
        }
        let direct = PathBuf::from(&self.calib_redgal_template);
        if direct.is_file() {
            return Ok(direct);
        }
        Err(RedmapperError::Config(format!(
            "red-sequence template {} not found",
            self.calib_redgal_template
        )))
    }

    /// Load and validate a JSON configuration.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
