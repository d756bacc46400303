//! Greedy richness-ordered percolation.

use super::{ClusterCandidate, ClusterFinder, DiscardCounts, GalaxyPool};
use crate::cluster::{Cluster, ClusterStage, Discard};
use crate::error::RedmapperError;
use crate::mask::MaskStats;
use crate::richness::{
    compute_richness, membership_within, Center, ColorFilter, RichnessParams, RichnessResult,
};
use crate::zlambda::ZlambdaResult;

/// Redshift estimate already stored on a cluster, for re-measurements that
/// keep it fixed.
pub(super) fn stored_zlambda(cluster: &Cluster) -> ZlambdaResult {
    ZlambdaResult {
        z_lambda: cluster.z_lambda,
        z_lambda_e: cluster.z_lambda_e,
        z_lambda_uncorr: cluster.z_lambda,
        converged: !cluster.flags.zlambda_nonconverged,
        nused: 0,
    }
}

pub(super) fn center_of(cluster: &Cluster) -> Center {
    Center {
        id: cluster.seed_id,
        ra: cluster.ra,
        dec: cluster.dec,
        z: cluster.z_lambda,
    }
}

/// Candidate indices richest first; equal richness keeps input order.
pub fn percolation_order(candidates: &[ClusterCandidate]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[b]
            .cluster
            .lambda
            .total_cmp(&candidates[a].cluster.lambda)
            .then(a.cmp(&b))
    });
    order
}

impl ClusterFinder<'_> {
    fn percolation_params(&self, lambda_init: f64) -> RichnessParams {
        let config = &self.ctx.config;
        RichnessParams {
            radius: config.percolation_radius(),
            niter: config.percolation_niter,
            lambda_init,
            filter: ColorFilter::Chisq,
        }
    }

    /// Percolate candidates sequentially. Survivors are numbered from 1 in
    /// the order they were accepted.
    pub fn percolation_pass(
        &self,
        candidates: Vec<ClusterCandidate>,
        discards: &mut DiscardCounts,
    ) -> Vec<Cluster> {
        let order = percolation_order(&candidates);
        let mut slots: Vec<Option<ClusterCandidate>> = candidates.into_iter().map(Some).collect();
        let mut pool = GalaxyPool::new(self.catalog.len());
        let mut clusters = Vec::new();
        for i in order {
            let Some(candidate) = slots[i].take() else {
                continue;
            };
            match self.percolate_one(candidate, &mut pool) {
                Ok(mut cluster) => {
                    cluster.id = clusters.len() as u64 + 1;
                    clusters.push(cluster);
                }
                Err(reason) => {
                    log::debug!("Percolation discards candidate: {reason:?}");
                    discards.record(&reason);
                }
            }
        }
        log::debug!("Percolation claimed {} galaxies", pool.nclaimed());
        clusters
    }

    fn percolate_one(
        &self,
        mut candidate: ClusterCandidate,
        pool: &mut GalaxyPool,
    ) -> Result<Cluster, Discard> {
        let config = &self.ctx.config;
        if pool.is_claimed(candidate.center_index) {
            return Err(Discard::SeedClaimed);
        }

        let record = Some((config.percolation_maxcen, config.percolation_pbcg_cut));
        for _ in 0..config.percolation_niter.max(1) {
            let center = center_of(&candidate.cluster);
            let params = self.percolation_params(candidate.cluster.lambda);
            let richness = compute_richness(self.ctx, self.catalog, &center, &params, Some(pool.pfree()));
            let zl = self.zlambda(&richness, center.z);
            let mut next = self.assemble(
                candidate.center_index,
                center,
                &richness,
                &zl,
                ClusterStage::Percolated,
            );
            self.recenter(&mut next, config.centerclass, &richness, record);
            candidate = next;
        }

        // Final measurement at the settled center and redshift
        let center = center_of(&candidate.cluster);
        let params = self.percolation_params(candidate.cluster.lambda);
        let richness = compute_richness(self.ctx, self.catalog, &center, &params, Some(pool.pfree()));
        let zl = stored_zlambda(&candidate.cluster);
        let centrals = std::mem::take(&mut candidate.cluster.centrals);
        let mut cluster = self
            .assemble(candidate.center_index, center, &richness, &zl, ClusterStage::Percolated)
            .cluster;
        cluster.centrals = centrals;

        let stats = MaskStats {
            maskfrac: cluster.maskfrac,
            scaleval: cluster.scaleval,
        };
        if let Err(RedmapperError::MaskCoverageExceeded { maskfrac, .. }) =
            stats.check(config.max_maskfrac)
        {
            return Err(Discard::MaskCoverage { maskfrac });
        }
        if cluster.lambda < config.percolation_minlambda {
            return Err(Discard::BelowMinLambda {
                stage: ClusterStage::Percolated,
                lambda: cluster.lambda,
                min_lambda: config.percolation_minlambda,
            });
        }

        cluster.dlambda_dz = self.dlambda_dz(&center, &params, pool);
        cluster.lambda_e = cluster.lambda_e_with_redshift();

        self.mask_members(&center, &params, &richness, pool);
        Ok(cluster)
    }

    /// Central finite difference of the richness in redshift.
    fn dlambda_dz(&self, center: &Center, params: &RichnessParams, pool: &GalaxyPool) -> f64 {
        let eps = self.ctx.config.zlambda_epsilon;
        let at = |z: f64| {
            let shifted = Center { z, ..*center };
            compute_richness(self.ctx, self.catalog, &shifted, params, Some(pool.pfree())).lambda
        };
        (at(center.z + eps) - at(center.z - eps)) / (2.0 * eps)
    }

    /// Remove this cluster's share of every bright galaxy inside `rmask`
    /// from the pool.
    fn mask_members(
        &self,
        center: &Center,
        params: &RichnessParams,
        richness: &RichnessResult,
        pool: &mut GalaxyPool,
    ) {
        let config = &self.ctx.config;
        let rmask = config
            .rmask(richness.lambda, center.z)
            .max(richness.r_lambda);
        let mag_limit =
            self.ctx.model.mstar.evaluate(center.z) - 2.5 * config.percolation_lmask.log10();
        let terms = membership_within(
            self.ctx,
            self.catalog,
            center,
            params,
            richness.lambda_obs,
            richness.r_lambda,
            rmask,
        );
        for term in terms {
            if self.catalog.get(term.index).refmag(config.ref_ind) < mag_limit {
                pool.claim(term.index, term.pcol);
            }
        }
    }
}
