//! Finder runs over synthetic surveys through the public partition runner.
//!
//! Each survey's background model is built from its field galaxies, i.e.
//! everything except the injected clumps.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use redmapper::background::BackgroundModel;
use redmapper::catalog::GalaxyCatalog;
use redmapper::centering::WcenModel;
use redmapper::cluster::{ClusterCatalog, ClusterStage};
use redmapper::context::RunContext;
use redmapper::cosmology::Cosmology;
use redmapper::lumfunc::LuminosityFilter;
use redmapper::mask::{DepthMap, HealpixMask};
use redmapper::partition::find_clusters;
use redmapper::redsequence::zred::{ZredEstimator, ZRED_GRID_STEP};
use redmapper::synthetic::{default_template, generate_survey, SurveyLayout, SyntheticCluster};
use redmapper::{Config, RedmapperError};
use rstest::rstest;

fn small_config() -> Config {
    Config {
        maskgal_nsamples: 3,
        maskgal_ngals: 400,
        border: 0.5,
        ..Config::default()
    }
}

/// Synthetic survey annotated with zred, and a run context whose background
/// is built from the galaxies outside the injected clumps.
fn survey(
    config: Config,
    clusters: Vec<SyntheticCluster>,
    n_background: usize,
    seed: u64,
) -> (RunContext, GalaxyCatalog) {
    let model = default_template(config.zrange).unwrap();
    let cosmology = Cosmology::new(config.omega_m).unwrap();
    let nclump: usize = clusters.iter().map(|c| c.n_members).sum();
    let layout = SurveyLayout {
        ra_range: [29.0, 31.0],
        dec_range: [4.0, 6.0],
        n_background,
        n_red_field: 0,
        member_spec_fraction: 0.0,
        clusters,
        ..SurveyLayout::default()
    };
    let synth = generate_survey(&mut ChaCha8Rng::seed_from_u64(seed), &model, &cosmology, &layout);
    let mut catalog = GalaxyCatalog::new(synth.galaxies, config.nmag, config.ref_ind).unwrap();
    let lumfilter = LuminosityFilter::new(config.calib_lumfunc_alpha, config.lval_reference).unwrap();
    let estimator = ZredEstimator::new(&model, lumfilter, config.ref_ind, ZRED_GRID_STEP);
    let zreds = estimator.estimate_all(&catalog);
    catalog.annotate_zred(zreds).unwrap();

    // Clump galaxies are generated first
    let exclude: Vec<bool> = (0..catalog.len()).map(|i| i < nclump).collect();
    let background = BackgroundModel::build(&config, &catalog, &model, &exclude, layout.area_deg2()).unwrap();
    let ctx = RunContext::new(
        config,
        model,
        background,
        WcenModel::default(),
        None,
        HealpixMask::full_coverage(),
        DepthMap::uniform(23.0),
    )
    .unwrap();
    (ctx, catalog)
}

#[rstest]
#[case(0.1)]
#[case(0.3)]
#[case(0.5)]
fn test_single_clump_is_recovered(#[case] z: f64) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clump = SyntheticCluster {
        ra: 30.0,
        dec: 5.0,
        z,
        n_members: 50,
    };
    let (ctx, catalog) = survey(small_config(), vec![clump], 500, 21);
    let output = find_clusters(&ctx, &catalog, 2, ctx.config.border, None).unwrap();

    assert_eq!(output.clusters.len(), 1, "{:?}", output.discards);
    let cluster = &output.clusters[0];
    assert_eq!(cluster.id, 1);
    assert_eq!(cluster.stage, ClusterStage::Percolated);
    assert!((cluster.lambda - 50.0).abs() < 0.2 * 50.0, "lambda = {}", cluster.lambda);
    assert!((cluster.z_lambda - z).abs() < 0.02, "z = {}", cluster.z_lambda);
    assert!(cluster.r_lambda > 0.0);
    let central = cluster.centrals.first().expect("a recorded central");
    assert!(central.p_cen >= ctx.config.percolation_pbcg_cut);
    // The injected central galaxy is the first galaxy of the clump
    assert_eq!(central.galaxy_id, 0);
}

#[test]
fn test_separated_clumps_are_both_found() {
    let clumps = vec![
        SyntheticCluster {
            ra: 29.5,
            dec: 4.5,
            z: 0.25,
            n_members: 45,
        },
        SyntheticCluster {
            ra: 30.5,
            dec: 5.5,
            z: 0.4,
            n_members: 35,
        },
    ];
    let (ctx, catalog) = survey(small_config(), clumps.clone(), 400, 5);
    let output = find_clusters(&ctx, &catalog, 2, ctx.config.border, None).unwrap();
    for truth in &clumps {
        let found = output.clusters.iter().any(|c| {
            (c.ra - truth.ra).abs() < 0.05 && (c.dec - truth.dec).abs() < 0.05 && (c.z_lambda - truth.z).abs() < 0.03
        });
        assert!(found, "no cluster near {truth:?}");
    }
    let ids: Vec<u64> = output.clusters.iter().map(|c| c.id).collect();
    assert_eq!(ids, (1..=output.clusters.len() as u64).collect::<Vec<_>>());
}

#[test]
fn test_thread_count_does_not_change_results() {
    let clump = SyntheticCluster {
        ra: 30.2,
        dec: 4.8,
        z: 0.35,
        n_members: 40,
    };
    let (ctx, catalog) = survey(small_config(), vec![clump], 300, 8);
    let one = find_clusters(&ctx, &catalog, 1, ctx.config.border, None).unwrap();
    let four = find_clusters(&ctx, &catalog, 4, ctx.config.border, None).unwrap();
    assert_eq!(one, four);
}

#[test]
fn test_catalog_persists() {
    let clump = SyntheticCluster {
        ra: 30.0,
        dec: 5.0,
        z: 0.3,
        n_members: 40,
    };
    let (ctx, catalog) = survey(small_config(), vec![clump], 200, 2);
    let output = find_clusters(&ctx, &catalog, 1, 0.0, None).unwrap();
    let clusters = ClusterCatalog {
        clusters: output.clusters,
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.json");
    clusters.save_to_file(&path).unwrap();
    assert_eq!(ClusterCatalog::load_from_file(&path).unwrap(), clusters);
}

#[test]
fn test_unsupported_mask_mode_aborts() {
    let config = Config {
        mask_mode: 1,
        ..small_config()
    };
    let err = RunContext::new(
        config.clone(),
        default_template(config.zrange).unwrap(),
        BackgroundModel::constant(&config, [10.0, 25.0], 20.0),
        WcenModel::default(),
        None,
        HealpixMask::full_coverage(),
        DepthMap::uniform(23.0),
    )
    .unwrap_err();
    assert!(matches!(err, RedmapperError::UnsupportedMaskMode(1)));
}
