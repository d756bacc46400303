//! Calibrate the red-sequence, background, centering and correction models
//! against a galaxy catalog with spectroscopic training redshifts, then run
//! the cluster finder with the final models.
//!
//! Writes `<outbase>_models.json` and `<outbase>_catalog.json` to the output
//! directory. The models file is what `redmapper_run` loads.
//!
//! Usage:
//! ```text
//! redmapper_calibrate --config cfg.json --galaxies g.json --spec s.json \
//!     [--mask m.json] [--depth d.json] [--template t.json] --output DIR
//! ```

use clap::Parser;
use redmapper::catalog::SpecCatalog;
use redmapper::cluster::ClusterCatalog;
use redmapper::redsequence::RedSequenceModel;
use redmapper::shared_args::{output_path, partition_progress, SharedArgs};
use redmapper::CalibrationDriver;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "redMaPPer Calibration",
    about = "Iteratively calibrates red-sequence cluster-finder models",
    long_about = None
)]
struct Args {
    #[command(flatten)]
    shared: SharedArgs,

    /// Spectroscopic catalog used for training
    #[arg(long)]
    spec: PathBuf,

    /// Red-sequence template; defaults to `calib_redgal_template` from the config
    #[arg(long)]
    template: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    args.shared.init_logging();

    let config = args.shared.load_config()?;
    let mut catalog = args.shared.load_galaxies(&config)?;
    let spec = SpecCatalog::load_from_file(&args.spec)
        .map_err(|e| format!("Failed to load spectra from '{}': {}", args.spec.display(), e))?;
    let nmatched = catalog.attach_spec(&spec);
    if nmatched == 0 {
        return Err("no spectroscopic redshift matched a galaxy".into());
    }

    let template_path = match &args.template {
        Some(path) => path.clone(),
        None => config.template_path()?,
    };
    log::info!("Red-sequence template: {}", template_path.display());
    let template = RedSequenceModel::load_from_file(&template_path).map_err(|e| {
        format!(
            "Failed to load template from '{}': {}",
            template_path.display(),
            e
        )
    })?;

    let mask = args.shared.load_mask(&config)?;
    let depth = args.shared.load_depth()?;
    let driver = CalibrationDriver::new(config.clone(), mask, depth)?;
    log::info!("Survey area {:.2} deg²", driver.area_deg2());

    let pb = partition_progress()?;
    let output = driver.run(&mut catalog, &template, Some(&pb))?;
    pb.finish_with_message("Calibration complete");

    std::fs::create_dir_all(&args.shared.output)?;
    let models_path = output_path(&args.shared.output, &config.outbase, "models");
    output.models.save_to_file(&models_path)?;
    let clusters = ClusterCatalog {
        clusters: output.clusters.clusters,
    };
    let catalog_path = output_path(&args.shared.output, &config.outbase, "catalog");
    clusters.save_to_file(&catalog_path)?;

    let discards = output.clusters.discards;
    println!("Clusters found: {}", clusters.len());
    println!(
        "Discarded candidates: {} below richness, {} masked, {} percolated",
        discards.below_min_lambda, discards.mask_coverage, discards.seed_claimed
    );
    println!("Models written to {}", models_path.display());
    println!("Catalog written to {}", catalog_path.display());
    Ok(())
}
