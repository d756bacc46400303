//! Iterative calibration of every model the finder reads.
//!
//! Each of the `calib_niter` iterations retrains the red sequence from the
//! previous iteration's products, re-annotates zred, rebuilds the background
//! from galaxies that are not members of the previous calibration clusters
//! and reruns the finder with no border. The clusters found then feed the
//! zred correction, the centering model and the z_lambda correction used by
//! the next iteration. Every step returns new models; nothing is patched in
//! place.

use indicatif::ProgressBar;
use redmapper_math::{make_nodes, Extrapolation, SplineFitter, SplineTerm};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::background::BackgroundModel;
use crate::catalog::GalaxyCatalog;
use crate::centering::{wcen_features, CenterFrame, CentralInput, WcenModel, WCEN_NFEATURES};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::context::RunContext;
use crate::cosmology::Cosmology;
use crate::error::{RedmapperError, Result};
use crate::finder::FinderOutput;
use crate::lumfunc::LuminosityFilter;
use crate::mask::{DepthMap, HealpixMask};
use crate::partition::find_clusters;
use crate::redmagic::RedmagicModel;
use crate::redsequence::colormem::select_template_members;
use crate::redsequence::train::within_nsig;
use crate::redsequence::zred::ZRED_GRID_STEP;
use crate::redsequence::{
    fit_red_sequence, RedSequenceModel, TrainingGalaxy, ZredCorrection, ZredEstimator,
};
use crate::zlambda::ZlambdaCorrection;

/// Floor on the redshift window a confirmed central's zspec must fall in.
const CENTRAL_ZSPEC_MIN_TOL: f64 = 0.01;
/// Width of that window in units of `z_lambda_e`.
const CENTRAL_ZSPEC_NSIG: f64 = 3.0;

/// Everything a later finder-only run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModels {
    pub red_sequence: RedSequenceModel,
    pub background: BackgroundModel,
    pub wcen: WcenModel,
    pub zlambda_correction: Option<ZlambdaCorrection>,
    pub redmagic: RedmagicModel,
}

impl TrainedModels {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Run context for these models.
    pub fn into_context(self, config: Config, mask: HealpixMask, depth: DepthMap) -> Result<RunContext> {
        RunContext::new(
            config,
            self.red_sequence,
            self.background,
            self.wcen,
            self.zlambda_correction,
            mask,
            depth,
        )
    }
}

/// Final products of a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutput {
    pub models: TrainedModels,
    /// Clusters found with the final models
    pub clusters: FinderOutput,
}

/// Models carried from one iteration to the next.
#[derive(Debug, Clone)]
struct IterationProducts {
    red_sequence: RedSequenceModel,
    zred_correction: Option<ZredCorrection>,
    wcen: WcenModel,
    zlambda_correction: Option<ZlambdaCorrection>,
    clusters: Vec<Cluster>,
}

pub struct CalibrationDriver {
    config: Config,
    mask: HealpixMask,
    depth: DepthMap,
    area_deg2: f64,
}

impl CalibrationDriver {
    /// # Errors
    ///
    /// * `RedmapperError::Config` - invalid configuration, or no `area` and
    ///   a mask that lists no pixels
    /// * `RedmapperError::UnsupportedMaskMode` - `mask_mode` other than 3
    pub fn new(config: Config, mask: HealpixMask, depth: DepthMap) -> Result<Self> {
        config.validate()?;
        config.check_mask_mode()?;
        let area_deg2 = config
            .area
            .or_else(|| mask.listed_area_deg2())
            .ok_or_else(|| {
                RedmapperError::Config(
                    "survey area unknown: set `area` or supply a mask listing its pixels"
                        .to_string(),
                )
            })?;
        Ok(Self {
            config,
            mask,
            depth,
            area_deg2,
        })
    }

    pub fn area_deg2(&self) -> f64 {
        self.area_deg2
    }

    /// Calibrate against `catalog`, whose spectroscopic redshifts must
    /// already be attached. The catalog's zred annotations are replaced by
    /// those of the final model.
    ///
    /// # Errors
    ///
    /// Any failed red-sequence fit or background build aborts the run.
    /// Correction fits short of data keep the previous correction.
    pub fn run(
        &self,
        catalog: &mut GalaxyCatalog,
        template: &RedSequenceModel,
        progress: Option<&ProgressBar>,
    ) -> Result<CalibrationOutput> {
        template.validate(self.config.ncol())?;
        let mut products: Option<IterationProducts> = None;
        for iteration in 0..self.config.calib_niter {
            log::info!("Calibration iteration {} of {}", iteration + 1, self.config.calib_niter);
            if let Some(pb) = progress {
                pb.reset();
                pb.set_message(format!("Calibration {}", iteration + 1));
            }
            products = Some(self.iterate(catalog, template, products.as_ref(), progress)?);
        }

        let (red_sequence, wcen, zlambda_correction, calib_clusters) = match products {
            Some(p) => {
                let mut model = p.red_sequence;
                model.zred_correction = p.zred_correction;
                (model, p.wcen, p.zlambda_correction, p.clusters)
            }
            None => {
                log::warn!("calib_niter is 0, final models come from the template");
                (template.clone(), WcenModel::default(), None, Vec::new())
            }
        };

        self.annotate_zred(catalog, &red_sequence)?;
        let background = self.background(catalog, &red_sequence, &calib_clusters)?;
        let cosmology = Cosmology::new(self.config.omega_m)?;
        let redmagic = RedmagicModel::calibrate(
            &self.config,
            catalog,
            &red_sequence,
            &cosmology,
            self.area_deg2,
        )?;
        let models = TrainedModels {
            red_sequence,
            background,
            wcen,
            zlambda_correction,
            redmagic,
        };

        if let Some(pb) = progress {
            pb.reset();
            pb.set_message("Final run".to_string());
        }
        let ctx = models.clone().into_context(self.config.clone(), self.mask.clone(), self.depth.clone())?;
        let clusters = find_clusters(
            &ctx,
            catalog,
            self.config.calib_run_nproc,
            self.config.border,
            progress,
        )?;
        Ok(CalibrationOutput { models, clusters })
    }

    /// One complete retraining step.
    fn iterate(
        &self,
        catalog: &mut GalaxyCatalog,
        template: &RedSequenceModel,
        previous: Option<&IterationProducts>,
        progress: Option<&ProgressBar>,
    ) -> Result<IterationProducts> {
        let config = &self.config;
        let training = match previous {
            None => select_template_members(catalog, template, config),
            Some(p) => self.select_training(catalog, &p.red_sequence, &p.clusters),
        };
        log::info!("Red-sequence training set: {} galaxies", training.len());
        let prior = previous.map_or(template, |p| &p.red_sequence);
        let mut red_sequence = fit_red_sequence(config, &training, prior)?;
        red_sequence.zred_correction = previous.and_then(|p| p.zred_correction.clone());

        self.annotate_zred(catalog, &red_sequence)?;
        let members_of = previous.map_or(&[][..], |p| p.clusters.as_slice());
        let background = self.background(catalog, &red_sequence, members_of)?;

        // Calibration clusters are found without a border and without a
        // z_lambda correction so the correction is always fit to raw values.
        let calib_config = Config {
            border: 0.0,
            ..config.clone()
        };
        let wcen = previous.map_or_else(WcenModel::default, |p| p.wcen.clone());
        let ctx = RunContext::new(
            calib_config,
            red_sequence.clone(),
            background,
            wcen.clone(),
            None,
            self.mask.clone(),
            self.depth.clone(),
        )?;
        let output = find_clusters(&ctx, catalog, config.calib_run_nproc, 0.0, progress)?;
        let clusters: Vec<Cluster> = output
            .clusters
            .into_iter()
            .filter(|c| c.lambda >= config.calib_minlambda)
            .collect();
        log::info!("{} calibration clusters above lambda {}", clusters.len(), config.calib_minlambda);

        let zred_correction = keep_previous(
            "zred correction",
            fit_zred_correction(config, catalog, &red_sequence, &clusters),
            previous.and_then(|p| p.zred_correction.clone()),
        )?;
        let wcen = keep_previous(
            "wcen",
            fit_wcen(config, &red_sequence, &clusters),
            Some(wcen),
        )?
        .unwrap_or_default();
        let samples: Vec<(f64, f64, f64)> = clusters
            .iter()
            .filter_map(|c| Some((c.z_lambda, c.lambda, c.central_zspec()?)))
            .collect();
        let zlambda_correction = keep_previous(
            "z_lambda correction",
            ZlambdaCorrection::fit(config, &samples),
            previous.and_then(|p| p.zlambda_correction.clone()),
        )?;

        Ok(IterationProducts {
            red_sequence,
            zred_correction,
            wcen,
            zlambda_correction,
            clusters,
        })
    }

    /// Spectroscopic galaxies consistent with the previous red sequence,
    /// plus spectroscopic cluster members above the membership cut.
    fn select_training(
        &self,
        catalog: &GalaxyCatalog,
        previous: &RedSequenceModel,
        clusters: &[Cluster],
    ) -> Vec<TrainingGalaxy> {
        let config = &self.config;
        let ref_ind = catalog.ref_ind();
        let mut chosen: Vec<usize> = catalog
            .galaxies()
            .iter()
            .enumerate()
            .filter(|(_, g)| {
                g.zspec.is_some_and(|z| {
                    z >= config.zrange[0]
                        && z <= config.zrange[1]
                        && within_nsig(
                            previous,
                            &TrainingGalaxy::from_galaxy(g, z, ref_ind),
                            config.calib_redspec_nsig,
                        )
                })
            })
            .map(|(i, _)| i)
            .collect();

        let index = id_index(catalog);
        for member in clusters.iter().flat_map(|c| c.members.iter()) {
            let p = if config.calib_use_pcol { member.pcol } else { member.pmem };
            let in_range = member
                .zspec
                .is_some_and(|z| z >= config.zrange[0] && z <= config.zrange[1]);
            if p > config.calib_pcut && in_range {
                if let Some(&i) = index.get(&member.galaxy_id) {
                    chosen.push(i);
                }
            }
        }
        chosen.sort_unstable();
        chosen.dedup();

        chosen
            .into_iter()
            .filter_map(|i| {
                let g = catalog.get(i);
                Some(TrainingGalaxy::from_galaxy(g, g.zspec?, ref_ind))
            })
            .collect()
    }

    fn annotate_zred(&self, catalog: &mut GalaxyCatalog, model: &RedSequenceModel) -> Result<()> {
        let lumfilter = LuminosityFilter::new(self.config.calib_lumfunc_alpha, self.config.lval_reference)?;
        let estimator = ZredEstimator::new(model, lumfilter, self.config.ref_ind, ZRED_GRID_STEP);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.calib_nproc.max(1))
            .build()?;
        let zreds = pool.install(|| estimator.estimate_all(catalog));
        catalog.annotate_zred(zreds)
    }

    /// Background from the galaxies that are not likely members of
    /// `clusters`.
    fn background(
        &self,
        catalog: &GalaxyCatalog,
        model: &RedSequenceModel,
        clusters: &[Cluster],
    ) -> Result<BackgroundModel> {
        let exclude = member_mask(catalog, clusters, self.config.calib_pcut);
        let nexcluded = exclude.iter().filter(|&&x| x).count();
        if clusters.is_empty() {
            log::info!("No calibration clusters yet, background uses every galaxy");
        } else {
            log::info!("Background excludes {nexcluded} members of {} clusters", clusters.len());
        }
        BackgroundModel::build(&self.config, catalog, model, &exclude, self.area_deg2)
    }
}

/// Per-galaxy flag for members of `clusters` with `pmem` above `pcut`.
pub fn member_mask(catalog: &GalaxyCatalog, clusters: &[Cluster], pcut: f64) -> Vec<bool> {
    let index = id_index(catalog);
    let mut mask = vec![false; catalog.len()];
    for member in clusters.iter().flat_map(|c| c.members.iter()) {
        if member.pmem > pcut {
            if let Some(&i) = index.get(&member.galaxy_id) {
                mask[i] = true;
            }
        }
    }
    mask
}

fn id_index(catalog: &GalaxyCatalog) -> HashMap<u64, usize> {
    catalog
        .galaxies()
        .iter()
        .enumerate()
        .map(|(i, g)| (g.id, i))
        .collect()
}

/// Fall back to `previous` when a correction fit runs short of data.
fn keep_previous<T>(what: &str, fit: Result<T>, previous: Option<T>) -> Result<Option<T>> {
    match fit {
        Ok(model) => Ok(Some(model)),
        Err(RedmapperError::InsufficientData(msg) | RedmapperError::Numerical(msg)) => {
            log::warn!("Keeping previous {what}: {msg}");
            Ok(previous)
        }
        Err(e) => Err(e),
    }
}

/// Fit the zred bias correction to the high-probability members of the
/// calibration clusters.
///
/// # Errors
///
/// `RedmapperError::InsufficientData` when the members cannot constrain
/// every spline node.
pub fn fit_zred_correction(
    config: &Config,
    catalog: &GalaxyCatalog,
    model: &RedSequenceModel,
    clusters: &[Cluster],
) -> Result<ZredCorrection> {
    let index = id_index(catalog);
    let ref_ind = catalog.ref_ind();
    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut dmag = Vec::new();
    for cluster in clusters {
        for member in cluster.members.iter().filter(|m| m.p > config.calib_corr_pcut) {
            let Some(g) = index.get(&member.galaxy_id).map(|&i| catalog.get(i)) else {
                continue;
            };
            let Some(zred) = g.zred else { continue };
            let refmag = g.refmag(ref_ind);
            x.push(zred.zred_uncorr);
            y.push(cluster.z_lambda - zred.zred_uncorr);
            dmag.push(refmag - model.pivotmag.evaluate(zred.zred_uncorr));
        }
    }
    if x.is_empty() {
        return Err(RedmapperError::InsufficientData(
            "no high-probability members for the zred correction".to_string(),
        ));
    }

    let fitter = SplineFitter::new(vec![
        SplineTerm::new(
            make_nodes(config.zrange, config.calib_corr_nodesize, -1.0),
            Extrapolation::Constant,
        )?,
        SplineTerm::new(
            make_nodes(config.zrange, config.calib_corr_slope_nodesize, -1.0),
            Extrapolation::Constant,
        )?,
    ]);
    let ones = vec![1.0; x.len()];
    let mut splines = fitter.fit(&x, &[ones.as_slice(), dmag.as_slice()], &y, &ones)?;
    log::info!("Fit zred correction to {} members", x.len());
    let slope = splines.pop();
    let offset = splines.pop();
    match (offset, slope) {
        (Some(offset), Some(slope)) => Ok(ZredCorrection { offset, slope }),
        _ => Err(RedmapperError::Numerical(
            "zred correction fit returned too few splines".to_string(),
        )),
    }
}

/// Train the centering model on clusters whose central has a consistent
/// spectroscopic redshift.
///
/// The confirmed central is the brightest member with `pmem` above
/// `calib_corr_pcut` and a zspec within the z_lambda window. All other
/// members inside `r_lambda` are negatives.
///
/// # Errors
///
/// `RedmapperError::InsufficientData` when no cluster qualifies.
pub fn fit_wcen(config: &Config, model: &RedSequenceModel, clusters: &[Cluster]) -> Result<WcenModel> {
    let mut samples: Vec<([f64; WCEN_NFEATURES], bool)> = Vec::new();
    let mut ntrain = 0usize;
    for cluster in clusters {
        let lambda_ok = (config.wcen_minlambda..=config.wcen_maxlambda).contains(&cluster.lambda);
        let z_ok = (config.wcen_cal_zrange[0]..=config.wcen_cal_zrange[1]).contains(&cluster.z_lambda);
        if !lambda_ok || !z_ok {
            continue;
        }
        let tol = (CENTRAL_ZSPEC_NSIG * cluster.z_lambda_e).max(CENTRAL_ZSPEC_MIN_TOL);
        let confirmed = cluster
            .members
            .iter()
            .filter(|m| {
                m.pmem >= config.calib_corr_pcut
                    && m.zspec.is_some_and(|z| (z - cluster.z_lambda).abs() < tol)
            })
            .min_by(|a, b| a.refmag.total_cmp(&b.refmag));
        let Some(confirmed) = confirmed else {
            continue;
        };

        let frame = CenterFrame {
            lambda: cluster.lambda,
            z: cluster.z_lambda,
            mstar: model.mstar.evaluate(cluster.z_lambda),
            r_lambda: cluster.r_lambda,
        };
        for (index, member) in cluster.members.iter().enumerate() {
            if member.r > cluster.r_lambda {
                continue;
            }
            let input = CentralInput {
                index,
                r: member.r,
                refmag: member.refmag,
                zred: None,
                pmem: member.pmem,
            };
            samples.push((
                wcen_features(config, &frame, &input),
                member.galaxy_id == confirmed.galaxy_id,
            ));
        }
        ntrain += 1;
    }
    if ntrain == 0 {
        return Err(RedmapperError::InsufficientData(
            "no clusters with a spectroscopically confirmed central".to_string(),
        ));
    }
    log::info!("Training wcen on {ntrain} clusters ({} candidates)", samples.len());
    WcenModel::fit(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ZredEstimate;
    use crate::cluster::{ClusterFlags, ClusterStage, Member};
    use crate::synthetic::{
        default_template, galaxy_on_sequence, generate_survey, SurveyLayout, SyntheticCluster,
    };
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn member(id: u64, r: f64, refmag: f64, pmem: f64, zspec: Option<f64>) -> Member {
        Member {
            galaxy_id: id,
            ra: 30.0,
            dec: 0.0,
            r,
            refmag,
            zred: None,
            zspec,
            p: pmem,
            pcol: pmem,
            pmem,
            theta_i: 1.0,
            theta_r: 1.0,
        }
    }

    fn cluster(id: u64, z: f64, lambda: f64, members: Vec<Member>) -> Cluster {
        Cluster {
            id,
            seed_id: id,
            ra: 30.0,
            dec: 0.0,
            z_lambda: z,
            z_lambda_e: 0.005,
            lambda,
            lambda_e: 2.0,
            r_lambda: 0.9,
            scaleval: 1.0,
            maskfrac: 0.0,
            lnlamlike: 10.0,
            dlambda_dz: 0.0,
            stage: ClusterStage::Percolated,
            flags: ClusterFlags::default(),
            centrals: Vec::new(),
            members,
        }
    }

    #[test]
    fn test_driver_needs_an_area() {
        let config = Config::default();
        let err = CalibrationDriver::new(config.clone(), HealpixMask::full_coverage(), DepthMap::uniform(23.0));
        assert!(matches!(err, Err(RedmapperError::Config(_))));

        let with_area = Config {
            area: Some(12.0),
            ..config
        };
        let driver =
            CalibrationDriver::new(with_area, HealpixMask::full_coverage(), DepthMap::uniform(23.0)).unwrap();
        assert_abs_diff_eq!(driver.area_deg2(), 12.0);
    }

    #[test]
    fn test_keep_previous_only_swallows_data_shortfalls() {
        let short: Result<u32> = Err(RedmapperError::InsufficientData("none".to_string()));
        assert_eq!(keep_previous("x", short, Some(7)).unwrap(), Some(7));
        assert_eq!(keep_previous("x", Ok(3), Some(7)).unwrap(), Some(3));
        let fatal: Result<u32> = Err(RedmapperError::Config("bad".to_string()));
        assert!(keep_previous("x", fatal, Some(7)).is_err());
    }

    #[test]
    fn test_zred_correction_recovers_constant_offset() {
        let config = Config::default();
        let model = default_template(config.zrange).unwrap();
        let mut galaxies = Vec::new();
        let mut clusters = Vec::new();
        for k in 0..60u64 {
            let z = 0.06 + 0.53 * k as f64 / 59.0;
            let mut members = Vec::new();
            for j in 0..4u64 {
                let id = k * 10 + j;
                let refmag = model.mstar.evaluate(z) - 1.0 + 0.5 * j as f64;
                let mut g = galaxy_on_sequence(&model, id, z, refmag, 30.0, 0.0);
                g.zred = Some(ZredEstimate {
                    zred: z - 0.01,
                    zred_e: 0.01,
                    zred_uncorr: z - 0.01,
                    chisq: 1.0,
                    lkhd: 0.0,
                });
                galaxies.push(g);
                members.push(member(id, 0.1, refmag, 0.95, None));
            }
            clusters.push(cluster(k + 1, z, 30.0, members));
        }
        let catalog = GalaxyCatalog::new(galaxies, 4, 3).unwrap();
        let corr = fit_zred_correction(&config, &catalog, &model, &clusters).unwrap();
        for z in [0.1, 0.3, 0.5] {
            assert_abs_diff_eq!(corr.offset.evaluate(z), 0.01, epsilon = 1e-3);
            assert_abs_diff_eq!(corr.slope.evaluate(z), 0.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_zred_correction_without_members_is_insufficient() {
        let config = Config::default();
        let model = default_template(config.zrange).unwrap();
        let catalog = GalaxyCatalog::new(Vec::new(), 4, 3).unwrap();
        assert!(matches!(
            fit_zred_correction(&config, &catalog, &model, &[]),
            Err(RedmapperError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_wcen_prefers_bright_central_galaxies() {
        let config = Config::default();
        let model = default_template(config.zrange).unwrap();
        let clusters: Vec<Cluster> = (0..40u64)
            .map(|k| {
                let z = 0.2 + 0.005 * k as f64;
                let mstar = model.mstar.evaluate(z);
                let mut members = vec![member(k * 100, 0.01, mstar - 2.0, 0.99, Some(z + 0.001))];
                for j in 1..15u64 {
                    let r = 0.05 * j as f64;
                    let refmag = mstar - 0.8 + 0.15 * j as f64;
                    let zspec = (j % 5 == 0).then_some(z);
                    members.push(member(k * 100 + j, r, refmag, 0.8, zspec));
                }
                cluster(k + 1, z, 20.0 + k as f64, members)
            })
            .collect();
        let wcen = fit_wcen(&config, &model, &clusters).unwrap();
        let frame = CenterFrame {
            lambda: 30.0,
            z: 0.3,
            mstar: model.mstar.evaluate(0.3),
            r_lambda: 0.9,
        };
        let bright = CentralInput {
            index: 0,
            r: 0.01,
            refmag: frame.mstar - 2.0,
            zred: None,
            pmem: 1.0,
        };
        let faint = CentralInput {
            r: 0.4,
            refmag: frame.mstar,
            ..bright
        };
        let s_bright = wcen.linear_score(&wcen_features(&config, &frame, &bright));
        let s_faint = wcen.linear_score(&wcen_features(&config, &frame, &faint));
        assert!(s_bright > s_faint);
    }

    #[test]
    fn test_wcen_without_confirmed_centrals_is_insufficient() {
        let config = Config::default();
        let model = default_template(config.zrange).unwrap();
        let clusters = vec![cluster(1, 0.3, 30.0, vec![member(1, 0.1, 18.0, 0.99, None)])];
        assert!(matches!(
            fit_wcen(&config, &model, &clusters),
            Err(RedmapperError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_member_mask_uses_pmem_cut() {
        let config = Config::default();
        let model = default_template(config.zrange).unwrap();
        let galaxies = (0..4u64)
            .map(|id| galaxy_on_sequence(&model, id, 0.3, 18.0, 30.0, 0.0))
            .collect();
        let catalog = GalaxyCatalog::new(galaxies, 4, 3).unwrap();
        let members = vec![
            member(1, 0.1, 18.0, 0.9, None),
            member(2, 0.1, 18.0, 0.1, None),
            member(99, 0.1, 18.0, 0.9, None),
        ];
        let clusters = vec![cluster(1, 0.3, 30.0, members)];
        assert_eq!(member_mask(&catalog, &clusters, 0.3), vec![false, true, false, false]);
        assert_eq!(member_mask(&catalog, &[], 0.3), vec![false; 4]);
    }

    #[test]
    fn test_background_leaves_out_cluster_members() {
        let config = Config::default();
        let model = default_template(config.zrange).unwrap();
        let cosmology = Cosmology::new(config.omega_m).unwrap();
        let z = 0.3;
        let layout = SurveyLayout {
            n_background: 400,
            n_red_field: 0,
            member_spec_fraction: 0.0,
            clusters: (0..6)
                .map(|k| SyntheticCluster {
                    ra: 30.5 + 0.6 * k as f64,
                    dec: 0.0,
                    z,
                    n_members: 50,
                })
                .collect(),
            ..SurveyLayout::default()
        };
        let survey = generate_survey(&mut ChaCha8Rng::seed_from_u64(4), &model, &cosmology, &layout);
        let nmembers = 300;
        let catalog = GalaxyCatalog::new(survey.galaxies, 4, 3).unwrap();
        let clusters: Vec<Cluster> = (0..6u64)
            .map(|k| {
                let members = (k * 50..(k + 1) * 50)
                    .map(|id| member(id, 0.1, catalog.get(id as usize).refmag(3), 0.95, None))
                    .collect();
                cluster(k + 1, z, 50.0, members)
            })
            .collect();

        let driver = CalibrationDriver::new(
            Config {
                area: Some(layout.area_deg2()),
                ..config.clone()
            },
            HealpixMask::full_coverage(),
            DepthMap::uniform(23.0),
        )
        .unwrap();
        let everything = driver.background(&catalog, &model, &[]).unwrap();
        let field = driver.background(&catalog, &model, &clusters).unwrap();

        let field_indices: Vec<usize> = (nmembers..catalog.len()).collect();
        let field_catalog = catalog.subset(&field_indices).unwrap();
        let exclude = vec![false; field_catalog.len()];
        let expected =
            BackgroundModel::build(&config, &field_catalog, &model, &exclude, layout.area_deg2()).unwrap();
        assert_eq!(field.refmag_axis, expected.refmag_axis);
        assert_eq!(field.sigma_g, expected.sigma_g);

        // Red-sequence density at the cluster redshift
        let iz = field.z_axis.index(z).unwrap();
        let sequence = |bkg: &BackgroundModel| -> f64 {
            let plane = bkg.sigma_g.index_axis(ndarray::Axis(0), iz);
            plane.slice(ndarray::s![..10, ..]).sum()
        };
        assert!(sequence(&everything) > 2.0 * sequence(&field));
    }

    #[test]
    fn test_trained_models_round_trip() {
        let config = Config::default();
        let models = TrainedModels {
            red_sequence: default_template(config.zrange).unwrap(),
            background: BackgroundModel::constant(&config, [12.0, 24.0], 5.0),
            wcen: WcenModel::default(),
            zlambda_correction: None,
            redmagic: RedmagicModel::default(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        models.save_to_file(&path).unwrap();
        assert_eq!(TrainedModels::load_from_file(&path).unwrap(), models);
    }
}
