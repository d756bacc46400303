//! Red-sequence galaxy cluster finder and its calibration engine.
//!
//! A run starts from a photometric [`catalog::GalaxyCatalog`], a healpix
//! coverage mask and a depth map:
//!
//! - [`redsequence`]: the color-redshift model, its trainer and the zred
//!   photometric redshift of every galaxy
//! - [`background`]: field galaxy densities the membership likelihood
//!   subtracts
//! - [`richness`] and [`zlambda`]: richness, radius, membership
//!   probabilities and cluster redshift around a center
//! - [`centering`]: central galaxy probabilities
//! - [`finder`]: the first, likelihood and percolation passes
//! - [`partition`]: healpix partitions run on a thread pool
//! - [`calibration`]: the iterative loop that trains every model above
//! - [`redmagic`]: luminous red galaxy selections from the final model
//!
//! [`synthetic`] generates seeded mock surveys for tests and smoke runs.

pub mod background;
pub mod calibration;
pub mod catalog;
pub mod centering;
pub mod cluster;
pub mod config;
pub mod context;
pub mod cosmology;
pub mod error;
pub mod finder;
pub mod lumfunc;
pub mod mask;
pub mod partition;
pub mod radial;
pub mod redmagic;
pub mod redsequence;
pub mod richness;
pub mod shared_args;
pub mod synthetic;
pub mod zlambda;

pub use calibration::{CalibrationDriver, CalibrationOutput, TrainedModels};
pub use config::Config;
pub use error::{RedmapperError, Result};
