use super::*;
use crate::background::BackgroundModel;
use crate::catalog::ZredEstimate;
use crate::centering::WcenModel;
use crate::config::Config;
use crate::mask::{DepthMap, HealpixMask};
use crate::redsequence::zred::{ZredEstimator, ZRED_GRID_STEP};
use crate::synthetic::{default_template, galaxy_on_sequence, generate_survey, SurveyLayout, SyntheticCluster};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const BKG_DENSITY: f64 = 20.0;

fn context(mask: HealpixMask) -> RunContext {
    let config = Config {
        maskgal_nsamples: 3,
        maskgal_ngals: 400,
        ..Config::default()
    };
    let model = default_template(config.zrange).unwrap();
    let background = BackgroundModel::constant(&config, [10.0, 25.0], BKG_DENSITY);
    RunContext::new(
        config,
        model,
        background,
        WcenModel::default(),
        None,
        mask,
        DepthMap::uniform(23.0),
    )
    .unwrap()
}

fn survey(ctx: &RunContext, clusters: Vec<SyntheticCluster>, n_background: usize) -> GalaxyCatalog {
    let layout = SurveyLayout {
        ra_range: [29.0, 31.0],
        dec_range: [4.0, 6.0],
        n_background,
        n_red_field: 0,
        member_spec_fraction: 0.0,
        clusters,
        ..SurveyLayout::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let synth = generate_survey(&mut rng, &ctx.model, &ctx.cosmology, &layout);
    let mut catalog = GalaxyCatalog::new(synth.galaxies, 4, 3).unwrap();
    let estimator = ZredEstimator::new(&ctx.model, ctx.lumfilter, 3, ZRED_GRID_STEP);
    let zreds = estimator.estimate_all(&catalog);
    catalog.annotate_zred(zreds).unwrap();
    catalog
}

fn clump(n_members: usize) -> SyntheticCluster {
    SyntheticCluster {
        ra: 30.0,
        dec: 5.0,
        z: 0.3,
        n_members,
    }
}

#[test]
fn test_seed_selection() {
    let ctx = context(HealpixMask::full_coverage());
    let mstar = ctx.model.mstar.evaluate(0.3);
    let annotated = |id: u64, refmag: f64, zred: f64, chisq: f64| {
        let mut g = galaxy_on_sequence(&ctx.model, id, 0.3, refmag, 30.0, 5.0 + 0.1 * id as f64);
        g.zred = Some(ZredEstimate {
            zred,
            zred_e: 0.01,
            zred_uncorr: zred,
            chisq,
            lkhd: 0.0,
        });
        g
    };
    let mut unannotated = galaxy_on_sequence(&ctx.model, 4, 0.3, mstar - 1.0, 30.0, 5.5);
    unannotated.zred = None;
    let galaxies = vec![
        annotated(0, mstar - 1.0, 0.3, 1.0),
        annotated(1, mstar + 0.5, 0.3, 1.0),
        annotated(2, mstar - 1.0, 0.3, 50.0),
        annotated(3, mstar - 1.0, 0.9, 1.0),
        unannotated,
    ];
    let catalog = GalaxyCatalog::new(galaxies, 4, 3).unwrap();
    let finder = ClusterFinder::new(&ctx, &catalog);
    assert_eq!(finder.seeds(), vec![0]);
}

#[test]
fn test_percolation_order_breaks_ties_by_input() {
    let ctx = context(HealpixMask::full_coverage());
    let catalog = survey(&ctx, vec![clump(30)], 0);
    let finder = ClusterFinder::new(&ctx, &catalog);
    let mut discards = DiscardCounts::default();
    let template = finder
        .first_pass(&finder.seeds(), &mut discards)
        .into_iter()
        .next()
        .unwrap();
    let with_lambda = |lambda: f64| {
        let mut c = template.clone();
        c.cluster.lambda = lambda;
        c
    };
    let candidates = vec![
        with_lambda(10.0),
        with_lambda(40.0),
        with_lambda(10.0),
        with_lambda(25.0),
    ];
    assert_eq!(percolation_order(&candidates), vec![1, 3, 0, 2]);
}

#[test]
fn test_single_clump_gives_one_cluster() {
    let ctx = context(HealpixMask::full_coverage());
    let catalog = survey(&ctx, vec![clump(50)], 300);
    let output = ClusterFinder::new(&ctx, &catalog).run();
    assert_eq!(output.clusters.len(), 1, "{:?}", output.discards);
    let cluster = &output.clusters[0];
    assert_eq!(cluster.id, 1);
    assert_eq!(cluster.stage, ClusterStage::Percolated);
    assert!((cluster.z_lambda - 0.3).abs() < 0.02, "z = {}", cluster.z_lambda);
    assert!(cluster.lambda > 35.0, "lambda = {}", cluster.lambda);
    assert!(cluster.lambda_e > 0.0);
    assert!(!cluster.centrals.is_empty());
    assert!(cluster.centrals.len() <= ctx.config.percolation_maxcen);
    assert!(cluster
        .centrals
        .iter()
        .all(|c| c.p_cen >= ctx.config.percolation_pbcg_cut));
    assert!(cluster.members.iter().all(|m| m.pmem > MIN_STORED_PMEM));
}

#[test]
fn test_overlapping_clumps_percolate_to_one() {
    let ctx = context(HealpixMask::full_coverage());
    let catalog = survey(&ctx, vec![clump(80), clump(20)], 200);
    let output = ClusterFinder::new(&ctx, &catalog).run();
    assert_eq!(output.clusters.len(), 1);
    assert!(output.clusters[0].lambda > 60.0);
    assert!(output.discards.seed_claimed > 0);
}

#[test]
fn test_percolation_is_deterministic() {
    let ctx = context(HealpixMask::full_coverage());
    let catalog = survey(&ctx, vec![clump(40)], 300);
    let finder = ClusterFinder::new(&ctx, &catalog);
    let first = finder.run();
    let second = finder.run();
    assert_eq!(first, second);
}

#[test]
fn test_final_clusters_respect_thresholds() {
    let ctx = context(HealpixMask::full_coverage());
    let far = SyntheticCluster {
        ra: 29.4,
        dec: 4.4,
        z: 0.45,
        n_members: 25,
    };
    let catalog = survey(&ctx, vec![clump(40), far], 400);
    let output = ClusterFinder::new(&ctx, &catalog).run();
    assert!(!output.clusters.is_empty());
    for cluster in &output.clusters {
        assert!(cluster.lambda >= ctx.config.percolation_minlambda);
        assert!(cluster.maskfrac <= ctx.config.max_maskfrac);
    }
    let ids: Vec<u64> = output.clusters.iter().map(|c| c.id).collect();
    assert_eq!(ids, (1..=output.clusters.len() as u64).collect::<Vec<_>>());
}

#[test]
fn test_masked_clusters_are_discarded() {
    let ctx = context(HealpixMask::new(6, Vec::new(), 0.7));
    let catalog = survey(&ctx, vec![clump(50)], 100);
    let output = ClusterFinder::new(&ctx, &catalog).run();
    assert!(output.clusters.is_empty());
    assert!(output.discards.mask_coverage > 0);
}
