//! Galaxy and spectroscopic catalogs.
//!
//! Galaxies are immutable photometry records. The only in-place annotation
//! is the red-sequence photometric redshift written back after the zred
//! pass; per-cluster quantities (membership probabilities, radii) live on the
//! clusters, never on the galaxies.

mod neighbors;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RedmapperError, Result};
pub use neighbors::{angular_separation_deg, Neighbor, SkyTree};

/// Spectroscopic redshifts with an error at or above this are ignored.
pub const SPEC_ZERR_MAX: f64 = 0.001;

/// Matching radius between photometric and spectroscopic catalogs.
pub const SPEC_MATCH_RADIUS_ARCSEC: f64 = 3.0;

/// Red-sequence photometric redshift of one galaxy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZredEstimate {
    pub zred: f64,
    pub zred_e: f64,
    /// Estimate before the calibrated bias correction
    pub zred_uncorr: f64,
    /// Color chi-squared at the uncorrected zred
    pub chisq: f64,
    /// Log-likelihood at the uncorrected zred
    pub lkhd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Galaxy {
    pub id: u64,
    pub ra: f64,
    pub dec: f64,
    pub mag: Vec<f64>,
    pub mag_err: Vec<f64>,
    #[serde(default)]
    pub ztrue: Option<f64>,
    #[serde(default)]
    pub zspec: Option<f64>,
    #[serde(default)]
    pub zred: Option<ZredEstimate>,
}

impl Galaxy {
    pub fn refmag(&self, ref_ind: usize) -> f64 {
        self.mag[ref_ind]
    }

    pub fn refmag_err(&self, ref_ind: usize) -> f64 {
        self.mag_err[ref_ind]
    }

    /// Adjacent-band colors `mag[i] - mag[i+1]`.
    pub fn colors(&self) -> Vec<f64> {
        self.mag.windows(2).map(|w| w[0] - w[1]).collect()
    }

    pub fn ncol(&self) -> usize {
        self.mag.len().saturating_sub(1)
    }
}

/// Owned galaxy records plus a spatial index over them.
pub struct GalaxyCatalog {
    galaxies: Vec<Galaxy>,
    ref_ind: usize,
    tree: SkyTree,
}

impl std::fmt::Debug for GalaxyCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GalaxyCatalog")
            .field("len", &self.galaxies.len())
            .field("ref_ind", &self.ref_ind)
            .finish()
    }
}

impl GalaxyCatalog {
    /// Build a catalog; all galaxies must carry `nmag` magnitudes and errors.
    pub fn new(galaxies: Vec<Galaxy>, nmag: usize, ref_ind: usize) -> Result<Self> {
        if ref_ind >= nmag {
            return Err(RedmapperError::Config(format!(
                "ref_ind {ref_ind} out of range for {nmag} bands"
            )));
        }
        if let Some(bad) = galaxies
            .iter()
            .find(|g| g.mag.len() != nmag || g.mag_err.len() != nmag)
        {
            return Err(RedmapperError::Config(format!(
                "galaxy {} has {} magnitudes / {} errors, expected {nmag}",
                bad.id,
                bad.mag.len(),
                bad.mag_err.len()
            )));
        }
        let positions: Vec<(f64, f64)> = galaxies.iter().map(|g| (g.ra, g.dec)).collect();
        let tree = SkyTree::new(&positions);
        Ok(Self {
            galaxies,
            ref_ind,
            tree,
        })
    }

    /// Load a JSON array of galaxies.
    pub fn load_from_file(path: &Path, nmag: usize, ref_ind: usize) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let galaxies: Vec<Galaxy> = serde_json::from_str(&json)?;
        Self::new(galaxies, nmag, ref_ind)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(&self.galaxies)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.galaxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.galaxies.is_empty()
    }

    pub fn ref_ind(&self) -> usize {
        self.ref_ind
    }

    pub fn galaxies(&self) -> &[Galaxy] {
        &self.galaxies
    }

    pub fn get(&self, index: usize) -> &Galaxy {
        &self.galaxies[index]
    }

    pub fn into_galaxies(self) -> Vec<Galaxy> {
        self.galaxies
    }

    /// Galaxies within `radius_deg` of a position, nearest first.
    pub fn find_neighbors(&self, ra: f64, dec: f64, radius_deg: f64) -> Vec<Neighbor> {
        self.tree.within(ra, dec, radius_deg)
    }

    /// Nearest catalog galaxy within `radius_deg` of each query position.
    ///
    /// Returns `(query_index, galaxy_index, distance_deg)`, at most one
    /// triple per query.
    pub fn match_many(
        &self,
        ras: &[f64],
        decs: &[f64],
        radius_deg: f64,
    ) -> Vec<(usize, usize, f64)> {
        ras.iter()
            .zip(decs.iter())
            .enumerate()
            .filter_map(|(q, (&ra, &dec))| {
                self.tree
                    .within(ra, dec, radius_deg)
                    .first()
                    .map(|n| (q, n.index, n.dist_deg))
            })
            .collect()
    }

    /// New catalog holding copies of the selected galaxies, in the given order.
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let galaxies: Vec<Galaxy> = indices.iter().map(|&i| self.galaxies[i].clone()).collect();
        let nmag = self.galaxies.first().map_or(self.ref_ind + 1, |g| g.mag.len());
        Self::new(galaxies, nmag, self.ref_ind)
    }

    /// Replace the zred annotation of every galaxy.
    pub fn annotate_zred(&mut self, estimates: Vec<Option<ZredEstimate>>) -> Result<()> {
        if estimates.len() != self.galaxies.len() {
            return Err(RedmapperError::Config(format!(
                "{} zred estimates for {} galaxies",
                estimates.len(),
                self.galaxies.len()
            )));
        }
        for (galaxy, estimate) in self.galaxies.iter_mut().zip(estimates) {
            galaxy.zred = estimate;
        }
        Ok(())
    }

    /// Attach spectroscopic redshifts from `spec` to matching galaxies.
    ///
    /// Returns the number of galaxies that received a redshift.
    pub fn attach_spec(&mut self, spec: &SpecCatalog) -> usize {
        let good: Vec<&SpecGalaxy> = spec
            .entries
            .iter()
            .filter(|s| s.z_err < SPEC_ZERR_MAX)
            .collect();
        let ras: Vec<f64> = good.iter().map(|s| s.ra).collect();
        let decs: Vec<f64> = good.iter().map(|s| s.dec).collect();
        let matches = self.match_many(&ras, &decs, SPEC_MATCH_RADIUS_ARCSEC / 3600.0);
        for &(q, g, _) in &matches {
            self.galaxies[g].zspec = Some(good[q].z);
        }
        log::info!(
            "Matched {} of {} usable spectra to galaxies",
            matches.len(),
            good.len()
        );
        matches.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecGalaxy {
    pub ra: f64,
    pub dec: f64,
    pub z: f64,
    pub z_err: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecCatalog {
    pub entries: Vec<SpecGalaxy>,
}

impl SpecCatalog {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let entries: Vec<SpecGalaxy> = serde_json::from_str(&json)?;
        Ok(Self { entries })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(&self.entries)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
