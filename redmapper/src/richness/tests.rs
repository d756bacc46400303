use super::*;
use crate::background::BackgroundModel;
use crate::centering::WcenModel;
use crate::config::Config;
use crate::mask::{DepthMap, HealpixMask};
use crate::synthetic::{cluster_galaxies, default_template, SyntheticCluster};
use approx::assert_relative_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use redmapper_math::integrate::{linspace, trapezoid_samples};

fn context(background_density: f64) -> RunContext {
    let config = Config {
        maskgal_nsamples: 2,
        maskgal_ngals: 500,
        ..Config::default()
    };
    let model = default_template(config.zrange).unwrap();
    let background = BackgroundModel::constant(&config, [10.0, 25.0], background_density);
    RunContext::new(
        config,
        model,
        background,
        WcenModel::default(),
        None,
        HealpixMask::full_coverage(),
        DepthMap::uniform(23.0),
    )
    .unwrap()
}

fn synthetic_cluster(ctx: &RunContext, n: usize, z: f64) -> GalaxyCatalog {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let spec = SyntheticCluster {
        ra: 30.0,
        dec: 5.0,
        z,
        n_members: n,
    };
    let galaxies = cluster_galaxies(&mut rng, &ctx.model, &ctx.cosmology, &spec, 0);
    GalaxyCatalog::new(galaxies, 4, 3).unwrap()
}

fn params(niter: usize, lambda_init: f64) -> RichnessParams {
    RichnessParams {
        radius: RadiusRelation { r0: 1.0, beta: 0.2 },
        niter,
        lambda_init,
        filter: ColorFilter::Chisq,
    }
}

#[test]
fn test_solve_lambda_analytic() {
    // n identical terms with u = b = 1: n / (λ + 1) = 1
    let terms = vec![(1.0, 1.0, 1.0); 10];
    assert_relative_eq!(solve_lambda(&terms), 9.0, epsilon = 1e-5);

    // No background: λ = Σ w
    let terms = vec![(2.0, 0.0, 0.5); 8];
    assert_relative_eq!(solve_lambda(&terms), 4.0, epsilon = 1e-5);
}

#[test]
fn test_solve_lambda_background_dominated() {
    let terms = vec![(1.0, 100.0, 1.0); 10];
    assert_eq!(solve_lambda(&terms), 0.0);
    assert_eq!(solve_lambda(&[]), 0.0);
}

#[test]
fn test_chisq_pdf_normalised() {
    let xs = linspace(0.0, 60.0, 60001);
    for dof in [2usize, 3, 5] {
        let ys: Vec<f64> = xs.iter().map(|&x| chisq_pdf(x, dof)).collect();
        assert_relative_eq!(trapezoid_samples(&xs, &ys).unwrap(), 1.0, epsilon = 2e-3);
    }
    assert_eq!(chisq_pdf(0.0, 3), 0.0);
}

#[test]
fn test_recovers_injected_richness() {
    let ctx = context(0.0);
    let catalog = synthetic_cluster(&ctx, 50, 0.3);
    let center = Center {
        id: 1,
        ra: 30.0,
        dec: 5.0,
        z: 0.3,
    };
    let result = compute_richness(&ctx, &catalog, &center, &params(2, 20.0), None);
    assert!(result.converged);
    assert!(
        (result.lambda - 50.0).abs() < 0.05 * 50.0,
        "lambda = {}",
        result.lambda
    );
    assert_relative_eq!(result.scaleval, 1.0, epsilon = 1e-6);
    assert_eq!(result.maskfrac, 0.0);
    assert_relative_eq!(result.r_lambda, (result.lambda / 100.0).powf(0.2), epsilon = 0.01);
}

#[test]
fn test_radius_grows_monotonically() {
    let ctx = context(0.0);
    let catalog = synthetic_cluster(&ctx, 50, 0.3);
    let center = Center {
        id: 1,
        ra: 30.0,
        dec: 5.0,
        z: 0.3,
    };
    let radii: Vec<f64> = (1..=4)
        .map(|niter| compute_richness(&ctx, &catalog, &center, &params(niter, 10.0), None).r_lambda)
        .collect();
    for w in radii.windows(2) {
        assert!(w[1] >= w[0] - 1e-9, "radii {radii:?}");
    }
    assert_relative_eq!(radii[2], radii[3], epsilon = 0.01 * radii[3]);
}

#[test]
fn test_background_lowers_probabilities() {
    let ctx_clean = context(0.0);
    let ctx_noisy = context(2000.0);
    let catalog = synthetic_cluster(&ctx_clean, 50, 0.3);
    let center = Center {
        id: 1,
        ra: 30.0,
        dec: 5.0,
        z: 0.3,
    };
    let clean = compute_richness(&ctx_clean, &catalog, &center, &params(3, 20.0), None);
    let noisy = compute_richness(&ctx_noisy, &catalog, &center, &params(3, 20.0), None);
    assert!(noisy.lambda < clean.lambda);
    for m in &noisy.members {
        assert!(m.p >= 0.0 && m.p <= 1.0);
        assert!(m.pmem <= m.pcol + 1e-12);
        assert!(m.pcol <= m.p + 1e-12);
    }
}

#[test]
fn test_claimed_galaxies_do_not_count() {
    let ctx = context(0.0);
    let catalog = synthetic_cluster(&ctx, 50, 0.3);
    let center = Center {
        id: 1,
        ra: 30.0,
        dec: 5.0,
        z: 0.3,
    };
    let pfree = vec![0.0; catalog.len()];
    let result = compute_richness(&ctx, &catalog, &center, &params(2, 20.0), Some(&pfree));
    assert_eq!(result.lambda, 0.0);
    assert!(result.members.iter().all(|m| m.pmem == 0.0));
}

#[test]
fn test_wrong_redshift_finds_little() {
    let ctx = context(50.0);
    let catalog = synthetic_cluster(&ctx, 50, 0.3);
    let center = Center {
        id: 1,
        ra: 30.0,
        dec: 5.0,
        z: 0.5,
    };
    let result = compute_richness(&ctx, &catalog, &center, &params(2, 20.0), None);
    assert!(result.lambda < 5.0, "lambda = {}", result.lambda);
}
