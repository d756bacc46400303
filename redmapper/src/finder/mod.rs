//! Three-pass cluster finder over one partition catalog.
//!
//! 1. First pass: every bright red galaxy seeds a candidate at its zred;
//!    the richness is measured with the first-pass radius relation and a
//!    single z_lambda update, and the candidate moves onto its brightest
//!    central.
//! 2. Likelihood pass: candidates are re-measured at their z_lambda with the
//!    full likelihood radius relation and scored by `lnlamlike`.
//! 3. Percolation: candidates are processed richest first; each survivor
//!    removes its members from the galaxy pool seen by later candidates.
//!
//! Candidates below a pass's minimum richness are discarded; nothing a
//! single candidate does aborts the partition.

mod percolation;
pub mod pool;

use rayon::prelude::*;

use crate::catalog::GalaxyCatalog;
use crate::centering::{CenterClass, CenterFrame, CentralInput};
use crate::cluster::{CentralCandidate, Cluster, ClusterFlags, ClusterStage, Discard, Member};
use crate::context::RunContext;
use crate::richness::{
    compute_richness, Center, ColorFilter, RichnessParams, RichnessResult, DEFAULT_LAMBDA_INIT,
};
use crate::zlambda::{estimate_zlambda, ZlambdaMember, ZlambdaResult};

use percolation::{center_of, stored_zlambda};
pub use percolation::percolation_order;
pub use pool::GalaxyPool;

/// Members below this membership probability are not stored.
pub const MIN_STORED_PMEM: f64 = 0.01;

/// A cluster in progress plus the catalog index of its central galaxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCandidate {
    pub cluster: Cluster,
    pub center_index: usize,
}

/// How many candidates each discard reason removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscardCounts {
    pub below_min_lambda: usize,
    pub mask_coverage: usize,
    pub seed_claimed: usize,
}

impl DiscardCounts {
    fn record(&mut self, reason: &Discard) {
        match reason {
            Discard::BelowMinLambda { .. } => self.below_min_lambda += 1,
            Discard::MaskCoverage { .. } => self.mask_coverage += 1,
            Discard::SeedClaimed => self.seed_claimed += 1,
        }
    }

    pub fn merged(&self, other: &DiscardCounts) -> DiscardCounts {
        DiscardCounts {
            below_min_lambda: self.below_min_lambda + other.below_min_lambda,
            mask_coverage: self.mask_coverage + other.mask_coverage,
            seed_claimed: self.seed_claimed + other.seed_claimed,
        }
    }

    pub fn total(&self) -> usize {
        self.below_min_lambda + self.mask_coverage + self.seed_claimed
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinderOutput {
    pub clusters: Vec<Cluster>,
    pub discards: DiscardCounts,
}

pub struct ClusterFinder<'a> {
    ctx: &'a RunContext,
    catalog: &'a GalaxyCatalog,
}

impl<'a> ClusterFinder<'a> {
    pub fn new(ctx: &'a RunContext, catalog: &'a GalaxyCatalog) -> Self {
        Self { ctx, catalog }
    }

    /// Run all three passes.
    pub fn run(&self) -> FinderOutput {
        let mut discards = DiscardCounts::default();
        let seeds = self.seeds();
        let candidates = self.first_pass(&seeds, &mut discards);
        log::info!(
            "First pass: {} of {} seeds survive",
            candidates.len(),
            seeds.len()
        );
        let n_first = candidates.len();
        let candidates = self.likelihood_pass(candidates, &mut discards);
        log::info!(
            "Likelihood pass: {} of {} candidates survive",
            candidates.len(),
            n_first
        );
        let n_like = candidates.len();
        let clusters = self.percolation_pass(candidates, &mut discards);
        log::info!(
            "Percolation: {} clusters from {} candidates",
            clusters.len(),
            n_like
        );
        FinderOutput { clusters, discards }
    }

    /// Catalog indices of galaxies bright and red enough to seed a candidate.
    pub fn seeds(&self) -> Vec<usize> {
        let config = &self.ctx.config;
        self.catalog
            .galaxies()
            .iter()
            .enumerate()
            .filter(|(_, g)| {
                g.zred.is_some_and(|zr| {
                    zr.zred >= config.zrange[0]
                        && zr.zred <= config.zrange[1]
                        && zr.chisq < config.chisq_max
                        && g.refmag(config.ref_ind) < self.ctx.model.mstar.evaluate(zr.zred)
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn first_pass(&self, seeds: &[usize], discards: &mut DiscardCounts) -> Vec<ClusterCandidate> {
        let config = &self.ctx.config;
        let params = RichnessParams {
            radius: config.firstpass_radius(),
            niter: config.firstpass_niter,
            lambda_init: DEFAULT_LAMBDA_INIT,
            filter: ColorFilter::Chisq,
        };
        let results: Vec<Result<ClusterCandidate, Discard>> = seeds
            .par_iter()
            .filter_map(|&index| {
                let galaxy = self.catalog.get(index);
                let zred = galaxy.zred?;
                let center = Center {
                    id: galaxy.id,
                    ra: galaxy.ra,
                    dec: galaxy.dec,
                    z: zred.zred,
                };
                Some(self.first_pass_candidate(index, center, &params))
            })
            .collect();
        self.keep_survivors(results, discards)
    }

    fn first_pass_candidate(
        &self,
        index: usize,
        center: Center,
        params: &RichnessParams,
    ) -> Result<ClusterCandidate, Discard> {
        let config = &self.ctx.config;
        let richness = compute_richness(self.ctx, self.catalog, &center, params, None);
        let zl = self.zlambda(&richness, center.z);
        let mut candidate = self.assemble(index, center, &richness, &zl, ClusterStage::Candidate);
        if richness.lambda < config.firstpass_minlambda {
            return Err(Discard::BelowMinLambda {
                stage: ClusterStage::Candidate,
                lambda: richness.lambda,
                min_lambda: config.firstpass_minlambda,
            });
        }
        self.recenter(&mut candidate, config.firstpass_centerclass, &richness, None);
        Ok(candidate)
    }

    pub fn likelihood_pass(
        &self,
        candidates: Vec<ClusterCandidate>,
        discards: &mut DiscardCounts,
    ) -> Vec<ClusterCandidate> {
        let config = &self.ctx.config;
        let filter = if config.likelihoods_use_zred {
            ColorFilter::Zred
        } else {
            ColorFilter::Chisq
        };
        let results: Vec<Result<ClusterCandidate, Discard>> = candidates
            .into_par_iter()
            .map(|candidate| {
                let c = &candidate.cluster;
                let center = center_of(c);
                let params = RichnessParams {
                    radius: config.likelihoods_radius(),
                    niter: config.firstpass_niter,
                    lambda_init: c.lambda,
                    filter,
                };
                let richness = compute_richness(self.ctx, self.catalog, &center, &params, None);
                if richness.lambda < config.likelihoods_minlambda {
                    return Err(Discard::BelowMinLambda {
                        stage: ClusterStage::LikelihoodScored,
                        lambda: richness.lambda,
                        min_lambda: config.likelihoods_minlambda,
                    });
                }
                let zl = stored_zlambda(c);
                Ok(self.assemble(
                    candidate.center_index,
                    center,
                    &richness,
                    &zl,
                    ClusterStage::LikelihoodScored,
                ))
            })
            .collect();
        self.keep_survivors(results, discards)
    }

    fn keep_survivors(
        &self,
        results: Vec<Result<ClusterCandidate, Discard>>,
        discards: &mut DiscardCounts,
    ) -> Vec<ClusterCandidate> {
        results
            .into_iter()
            .filter_map(|r| match r {
                Ok(candidate) => Some(candidate),
                Err(reason) => {
                    log::debug!("Discarding candidate: {reason:?}");
                    discards.record(&reason);
                    None
                }
            })
            .collect()
    }

    /// z_lambda from the members of a richness measurement.
    fn zlambda(&self, richness: &RichnessResult, z_init: f64) -> ZlambdaResult {
        let members: Vec<ZlambdaMember> = richness
            .members
            .iter()
            .filter_map(|m| {
                let zred = self.catalog.get(m.index).zred?;
                Some(ZlambdaMember {
                    zred: zred.zred,
                    zred_e: zred.zred_e,
                    pmem: m.pmem,
                })
            })
            .collect();
        estimate_zlambda(
            &self.ctx.config,
            &members,
            z_init,
            richness.lambda,
            self.ctx.zlambda_correction.as_ref(),
        )
    }

    /// Cluster record for a measurement at `center`.
    fn assemble(
        &self,
        center_index: usize,
        center: Center,
        richness: &RichnessResult,
        zl: &ZlambdaResult,
        stage: ClusterStage,
    ) -> ClusterCandidate {
        let ref_ind = self.ctx.config.ref_ind;
        let members: Vec<Member> = richness
            .members
            .iter()
            .filter(|m| m.pmem > MIN_STORED_PMEM)
            .map(|m| {
                let g = self.catalog.get(m.index);
                Member {
                    galaxy_id: g.id,
                    ra: g.ra,
                    dec: g.dec,
                    r: m.r,
                    refmag: g.refmag(ref_ind),
                    zred: g.zred.map(|z| z.zred),
                    zspec: g.zspec,
                    p: m.p,
                    pcol: m.pcol,
                    pmem: m.pmem,
                    theta_i: m.theta_i,
                    theta_r: m.theta_r,
                }
            })
            .collect();
        let z_lambda = zl
            .z_lambda
            .clamp(self.ctx.config.zrange[0], self.ctx.config.zrange[1]);
        ClusterCandidate {
            cluster: Cluster {
                id: 0,
                seed_id: center.id,
                ra: center.ra,
                dec: center.dec,
                z_lambda,
                z_lambda_e: zl.z_lambda_e,
                lambda: richness.lambda,
                lambda_e: richness.lambda_e,
                r_lambda: richness.r_lambda,
                scaleval: richness.scaleval,
                maskfrac: richness.maskfrac,
                lnlamlike: richness.lnlamlike,
                dlambda_dz: 0.0,
                stage,
                flags: ClusterFlags {
                    zlambda_nonconverged: !zl.converged,
                    richness_nonconverged: !richness.converged,
                    zlambda_undetermined: zl.z_lambda_e < 0.0,
                },
                centrals: Vec::new(),
                members,
            },
            center_index,
        }
    }

    /// Rank central candidates and move the cluster onto the most probable.
    ///
    /// Centrals are recorded when their probability reaches `pbcg_cut`, up
    /// to `maxcen` of them.
    fn recenter(
        &self,
        candidate: &mut ClusterCandidate,
        class: CenterClass,
        richness: &RichnessResult,
        record: Option<(usize, f64)>,
    ) {
        let config = &self.ctx.config;
        let ref_ind = config.ref_ind;
        let cluster = &mut candidate.cluster;
        let frame = CenterFrame {
            lambda: richness.lambda,
            z: cluster.z_lambda,
            mstar: self.ctx.model.mstar.evaluate(cluster.z_lambda),
            r_lambda: richness.r_lambda,
        };
        let inputs: Vec<CentralInput> = richness
            .members
            .iter()
            .map(|m| {
                let g = self.catalog.get(m.index);
                CentralInput {
                    index: m.index,
                    r: m.r,
                    refmag: g.refmag(ref_ind),
                    zred: g.zred,
                    pmem: m.pmem,
                }
            })
            .collect();
        let probs = class.probabilities(config, &self.ctx.wcen, &frame, &inputs);
        let Some((best, _)) = probs.first() else {
            return;
        };
        let g = self.catalog.get(best.index);
        cluster.ra = g.ra;
        cluster.dec = g.dec;
        candidate.center_index = best.index;

        if let Some((maxcen, pbcg_cut)) = record {
            cluster.centrals = probs
                .iter()
                .filter(|(_, p)| *p >= pbcg_cut)
                .take(maxcen)
                .map(|(c, p)| {
                    let g = self.catalog.get(c.index);
                    CentralCandidate {
                        galaxy_id: g.id,
                        ra: g.ra,
                        dec: g.dec,
                        refmag: c.refmag,
                        p_cen: *p,
                    }
                })
                .collect();
        }
    }
}

#[cfg(test)]
mod tests;
