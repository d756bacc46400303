//! Run the cluster finder with previously calibrated models.
//!
//! Galaxies are annotated with zred from the loaded red-sequence model, the
//! catalog is split into healpix partitions with a halo of `border` degrees,
//! and the three finder passes run on `calib_run_nproc` threads. Writes
//! `<outbase>_catalog.json` plus one `<outbase>_redmagic_<name>.json` list
//! of selected galaxies with their zredmagic per calibrated redMaGiC selection.
//!
//! Usage:
//! ```text
//! redmapper_run --config cfg.json --galaxies g.json --models models.json \
//!     [--mask m.json] [--depth d.json] --output DIR
//! ```

use clap::Parser;
use redmapper::cluster::ClusterCatalog;
use redmapper::partition::find_clusters;
use redmapper::redsequence::zred::{ZredEstimator, ZRED_GRID_STEP};
use redmapper::shared_args::{output_path, partition_progress, SharedArgs};
use redmapper::TrainedModels;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "redMaPPer Run",
    about = "Finds red-sequence galaxy clusters with calibrated models",
    long_about = None
)]
struct Args {
    #[command(flatten)]
    shared: SharedArgs,

    /// Models written by redmapper_calibrate
    #[arg(long)]
    models: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    args.shared.init_logging();

    let config = args.shared.load_config()?;
    let mut catalog = args.shared.load_galaxies(&config)?;
    let models = TrainedModels::load_from_file(&args.models)
        .map_err(|e| format!("Failed to load models from '{}': {}", args.models.display(), e))?;
    let redmagic = models.redmagic.clone();
    let mask = args.shared.load_mask(&config)?;
    let depth = args.shared.load_depth()?;
    let ctx = models.into_context(config.clone(), mask, depth)?;

    let estimator = ZredEstimator::new(&ctx.model, ctx.lumfilter, config.ref_ind, ZRED_GRID_STEP);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.calib_nproc.max(1))
        .build()?;
    let zreds = pool.install(|| estimator.estimate_all(&catalog));
    catalog.annotate_zred(zreds)?;

    let pb = partition_progress()?;
    pb.set_message("Finding clusters");
    let output = find_clusters(&ctx, &catalog, config.calib_run_nproc, config.border, Some(&pb))?;
    pb.finish_with_message("Cluster finding complete");

    std::fs::create_dir_all(&args.shared.output)?;
    let clusters = ClusterCatalog {
        clusters: output.clusters,
    };
    let catalog_path = output_path(&args.shared.output, &config.outbase, "catalog");
    clusters.save_to_file(&catalog_path)?;

    for selection in &redmagic.selections {
        let Some(galaxies) = redmagic.select(&selection.name, &catalog, &ctx.model) else {
            continue;
        };
        let path = output_path(
            &args.shared.output,
            &config.outbase,
            &format!("redmagic_{}", selection.name),
        );
        std::fs::write(&path, serde_json::to_string_pretty(&galaxies)?)?;
        println!("redMaGiC {}: {} galaxies", selection.name, galaxies.len());
    }

    println!("Clusters found: {}", clusters.len());
    println!(
        "Discarded candidates: {} below richness, {} masked, {} percolated",
        output.discards.below_min_lambda, output.discards.mask_coverage, output.discards.seed_claimed
    );
    println!("Catalog written to {}", catalog_path.display());
    Ok(())
}
