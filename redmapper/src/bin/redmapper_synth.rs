//! Write a seeded synthetic survey for smoke-testing the pipeline.
//!
//! Produces `galaxies.json`, `spec.json`, `template.json` and `config.json`
//! in the output directory. The config points at the written template and
//! carries the footprint area, so the files feed straight into
//! `redmapper_calibrate`.

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use redmapper::catalog::GalaxyCatalog;
use redmapper::cosmology::Cosmology;
use redmapper::synthetic::{default_template, generate_survey, SurveyLayout, SyntheticCluster};
use redmapper::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "redMaPPer Synthetic Survey",
    about = "Generates a synthetic galaxy survey with injected red-sequence clusters",
    long_about = None
)]
struct Args {
    /// Output directory
    #[arg(long)]
    output: PathBuf,

    /// Random seed
    #[arg(long, default_value_t = 12345)]
    seed: u64,

    /// Number of injected clusters
    #[arg(long, default_value_t = 12)]
    clusters: usize,

    /// Number of broad-color field galaxies
    #[arg(long, default_value_t = 4000)]
    background: usize,

    /// Number of red field galaxies with spectra
    #[arg(long, default_value_t = 1500)]
    red_field: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config {
        seed: args.seed,
        ..Config::default()
    };
    let model = default_template(config.zrange)?;
    let cosmology = Cosmology::new(config.omega_m)?;
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);

    let mut layout = SurveyLayout {
        n_background: args.background,
        n_red_field: args.red_field,
        ..SurveyLayout::default()
    };
    // Keep injected clusters away from the footprint edge
    let margin = 0.3;
    layout.clusters = (0..args.clusters)
        .map(|_| SyntheticCluster {
            ra: rng.random_range(layout.ra_range[0] + margin..layout.ra_range[1] - margin),
            dec: rng.random_range(layout.dec_range[0] + margin..layout.dec_range[1] - margin),
            z: rng.random_range(0.1..0.5),
            n_members: rng.random_range(15..80),
        })
        .collect();
    let survey = generate_survey(&mut rng, &model, &cosmology, &layout);

    std::fs::create_dir_all(&args.output)?;
    let template_path = args.output.join("template.json");
    model.save_to_file(&template_path)?;
    config.area = Some(layout.area_deg2());
    config.calib_redgal_template = template_path.display().to_string();
    config.save_to_file(&args.output.join("config.json"))?;

    let ngal = survey.galaxies.len();
    let catalog = GalaxyCatalog::new(survey.galaxies, config.nmag, config.ref_ind)?;
    catalog.save_to_file(&args.output.join("galaxies.json"))?;
    survey.spec.save_to_file(&args.output.join("spec.json"))?;

    println!("Injected clusters:");
    for (i, c) in layout.clusters.iter().enumerate() {
        println!(
            "  {:>3}: ra {:.3} dec {:.3} z {:.3} members {}",
            i + 1,
            c.ra,
            c.dec,
            c.z,
            c.n_members
        );
    }
    println!(
        "Wrote {} galaxies and {} spectra over {:.2} deg² to {}",
        ngal,
        survey.spec.entries.len(),
        layout.area_deg2(),
        args.output.display()
    );
    Ok(())
}
