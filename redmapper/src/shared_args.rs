use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use crate::catalog::GalaxyCatalog;
use crate::config::Config;
use crate::mask::{DepthMap, HealpixMask};

/// Limiting magnitude assumed when no depth map is given
pub const DEFAULT_LIMMAG: f64 = 23.0;

/// Arguments shared by the calibration and finder binaries
#[derive(Parser, Debug, Clone)]
pub struct SharedArgs {
    /// JSON configuration file; missing keys take their defaults
    #[arg(long)]
    pub config: PathBuf,

    /// JSON galaxy catalog
    #[arg(long)]
    pub galaxies: PathBuf,

    /// Healpix coverage mask (mask mode 3); full coverage when omitted
    #[arg(long)]
    pub mask: Option<PathBuf>,

    /// Healpix depth map; uniform depth when omitted
    #[arg(long)]
    pub depth: Option<PathBuf>,

    /// Directory receiving the catalog and model files
    #[arg(long, default_value = ".")]
    pub output: PathBuf,

    /// Override calib_nproc (threads for model fitting)
    #[arg(long)]
    pub calib_nproc: Option<usize>,

    /// Override calib_run_nproc (threads for cluster finding)
    #[arg(long)]
    pub run_nproc: Option<usize>,

    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

impl SharedArgs {
    /// Initialise env_logger at info, or debug with `--verbose`.
    /// `RUST_LOG` still wins when set.
    pub fn init_logging(&self) {
        let level = if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .init();
    }

    /// Load the configuration and apply the thread-count overrides.
    pub fn load_config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = Config::load_from_file(&self.config).map_err(|e| {
            format!(
                "Failed to load config from '{}': {}",
                self.config.display(),
                e
            )
        })?;
        if let Some(n) = self.calib_nproc {
            config.calib_nproc = n;
        }
        if let Some(n) = self.run_nproc {
            config.calib_run_nproc = n;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load_galaxies(&self, config: &Config) -> Result<GalaxyCatalog, Box<dyn std::error::Error>> {
        log::info!("Loading galaxies from: {}", self.galaxies.display());
        let catalog = GalaxyCatalog::load_from_file(&self.galaxies, config.nmag, config.ref_ind)
            .map_err(|e| {
                format!(
                    "Failed to load galaxies from '{}': {}",
                    self.galaxies.display(),
                    e
                )
            })?;
        log::info!("Loaded catalog with {} galaxies", catalog.len());
        Ok(catalog)
    }

    pub fn load_mask(&self, config: &Config) -> Result<HealpixMask, Box<dyn std::error::Error>> {
        config.check_mask_mode()?;
        match &self.mask {
            Some(path) => Ok(HealpixMask::load_from_file(path, config.mask_mode)
                .map_err(|e| format!("Failed to load mask from '{}': {}", path.display(), e))?),
            None => {
                log::info!("No mask given, assuming full coverage");
                Ok(HealpixMask::full_coverage())
            }
        }
    }

    pub fn load_depth(&self) -> Result<DepthMap, Box<dyn std::error::Error>> {
        match &self.depth {
            Some(path) => Ok(DepthMap::load_from_file(path)
                .map_err(|e| format!("Failed to load depth map from '{}': {}", path.display(), e))?),
            None => {
                log::info!("No depth map given, assuming limiting magnitude {DEFAULT_LIMMAG}");
                Ok(DepthMap::uniform(DEFAULT_LIMMAG))
            }
        }
    }
}

/// `DIR/<outbase>_<suffix>.json`
pub fn output_path(dir: &Path, outbase: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{outbase}_{suffix}.json"))
}

/// Progress bar counting finished partitions.
pub fn partition_progress() -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} partitions ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}
