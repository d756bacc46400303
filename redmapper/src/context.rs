//! Read-only inputs shared by every stage of a cluster-finding run.

use crate::background::BackgroundModel;
use crate::centering::WcenModel;
use crate::config::Config;
use crate::cosmology::Cosmology;
use crate::error::Result;
use crate::lumfunc::LuminosityFilter;
use crate::mask::{DepthMap, HealpixMask, MaskGalaxies};
use crate::radial::NfwFilter;
use crate::redsequence::RedSequenceModel;
use crate::zlambda::ZlambdaCorrection;

/// Everything a finder worker reads. Nothing in here is mutated during a
/// run, so one context is shared by all partitions.
#[derive(Debug)]
pub struct RunContext {
    pub config: Config,
    pub model: RedSequenceModel,
    pub background: BackgroundModel,
    pub wcen: WcenModel,
    pub zlambda_correction: Option<ZlambdaCorrection>,
    pub cosmology: Cosmology,
    pub nfw: NfwFilter,
    pub lumfilter: LuminosityFilter,
    pub mask: HealpixMask,
    pub depth: DepthMap,
    pub maskgals: MaskGalaxies,
}

impl RunContext {
    /// Derive the filters and mask galaxies for a set of models.
    pub fn new(
        config: Config,
        model: RedSequenceModel,
        background: BackgroundModel,
        wcen: WcenModel,
        zlambda_correction: Option<ZlambdaCorrection>,
        mask: HealpixMask,
        depth: DepthMap,
    ) -> Result<Self> {
        config.validate()?;
        config.check_mask_mode()?;
        model.validate(config.ncol())?;
        let cosmology = Cosmology::new(config.omega_m)?;
        let nfw = NfwFilter::new()?;
        let lumfilter = LuminosityFilter::new(config.calib_lumfunc_alpha, config.lval_reference)?;
        let maskgals = MaskGalaxies::generate(
            config.maskgal_nsamples,
            config.maskgal_ngals,
            &nfw,
            &lumfilter,
            config.seed,
        );
        Ok(Self {
            config,
            model,
            background,
            wcen,
            zlambda_correction,
            cosmology,
            nfw,
            lumfilter,
            mask,
            depth,
            maskgals,
        })
    }
}
