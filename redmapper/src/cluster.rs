//! Cluster records and the output catalog.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Where a candidate is in the finder's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStage {
    Candidate,
    LikelihoodScored,
    Percolated,
}

/// Why a candidate left the finder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Discard {
    BelowMinLambda {
        stage: ClusterStage,
        lambda: f64,
        min_lambda: f64,
    },
    MaskCoverage {
        maskfrac: f64,
    },
    /// The seed galaxy was absorbed by a richer cluster
    SeedClaimed,
}

/// Recoverable problems recorded on a surviving cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFlags {
    /// z_lambda fell back to the coarse scan optimum
    pub zlambda_nonconverged: bool,
    /// Radius still moving when the iteration budget ran out
    pub richness_nonconverged: bool,
    /// No member had a usable zred; `z_lambda_e` holds a sentinel
    #[serde(default)]
    pub zlambda_undetermined: bool,
}

impl ClusterFlags {
    pub fn any(&self) -> bool {
        self.zlambda_nonconverged || self.richness_nonconverged || self.zlambda_undetermined
    }
}

/// Central galaxy candidate and its probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralCandidate {
    pub galaxy_id: u64,
    pub ra: f64,
    pub dec: f64,
    pub refmag: f64,
    pub p_cen: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub galaxy_id: u64,
    pub ra: f64,
    pub dec: f64,
    /// Projected radius in h⁻¹ Mpc
    pub r: f64,
    pub refmag: f64,
    pub zred: Option<f64>,
    pub zspec: Option<f64>,
    pub p: f64,
    pub pcol: f64,
    pub pmem: f64,
    pub theta_i: f64,
    pub theta_r: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: u64,
    /// Galaxy that seeded the candidate
    pub seed_id: u64,
    pub ra: f64,
    pub dec: f64,
    pub z_lambda: f64,
    pub z_lambda_e: f64,
    /// Richness corrected for masked and undetectable area
    pub lambda: f64,
    pub lambda_e: f64,
    pub r_lambda: f64,
    pub scaleval: f64,
    pub maskfrac: f64,
    pub lnlamlike: f64,
    pub dlambda_dz: f64,
    pub stage: ClusterStage,
    pub flags: ClusterFlags,
    pub centrals: Vec<CentralCandidate>,
    pub members: Vec<Member>,
}

impl Cluster {
    /// `lambda_e` with the redshift uncertainty added in quadrature through
    /// `dlambda_dz`. Left alone when z_lambda has no error estimate.
    pub fn lambda_e_with_redshift(&self) -> f64 {
        if self.flags.zlambda_undetermined || self.z_lambda_e <= 0.0 {
            return self.lambda_e;
        }
        self.lambda_e.hypot(self.dlambda_dz * self.z_lambda_e)
    }

    /// Spectroscopic redshift of the most probable central, if it has one.
    pub fn central_zspec(&self) -> Option<f64> {
        let central = self.centrals.first()?;
        self.members
            .iter()
            .find(|m| m.galaxy_id == central.galaxy_id)
            .and_then(|m| m.zspec)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterCatalog {
    pub clusters: Vec<Cluster>,
}

impl ClusterCatalog {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Clusters with at least `min_lambda`.
    pub fn richer_than(&self, min_lambda: f64) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter().filter(move |c| c.lambda >= min_lambda)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zlambda::ZLAMBDA_E_UNDETERMINED;
    use tempfile::tempdir;

    fn member(id: u64, zspec: Option<f64>) -> Member {
        Member {
            galaxy_id: id,
            ra: 10.0,
            dec: 0.0,
            r: 0.1,
            refmag: 18.0,
            zred: Some(0.3),
            zspec,
            p: 0.9,
            pcol: 0.9,
            pmem: 0.9,
            theta_i: 1.0,
            theta_r: 1.0,
        }
    }

    fn cluster() -> Cluster {
        Cluster {
            id: 1,
            seed_id: 7,
            ra: 10.0,
            dec: 0.0,
            z_lambda: 0.3,
            z_lambda_e: 0.01,
            lambda: 40.0,
            lambda_e: 3.0,
            r_lambda: 0.83,
            scaleval: 1.0,
            maskfrac: 0.0,
            lnlamlike: 120.0,
            dlambda_dz: -5.0,
            stage: ClusterStage::Percolated,
            flags: ClusterFlags::default(),
            centrals: vec![CentralCandidate {
                galaxy_id: 7,
                ra: 10.0,
                dec: 0.0,
                refmag: 17.0,
                p_cen: 0.8,
            }],
            members: vec![member(7, Some(0.301)), member(8, None)],
        }
    }

    #[test]
    fn test_central_zspec() {
        let c = cluster();
        assert_eq!(c.central_zspec(), Some(0.301));
        let mut other = c.clone();
        other.centrals[0].galaxy_id = 8;
        assert_eq!(other.central_zspec(), None);
    }

    #[test]
    fn test_catalog_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = ClusterCatalog {
            clusters: vec![cluster()],
        };
        catalog.save_to_file(&path).unwrap();
        let loaded = ClusterCatalog::load_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.clusters[0].stage, ClusterStage::Percolated);
        let zspec = loaded.clusters[0].members[0].zspec.unwrap();
        assert!((zspec - 0.301).abs() < 1e-12);
        assert_eq!(catalog.richer_than(50.0).count(), 0);
    }

    #[test]
    fn test_lambda_e_folds_in_redshift_error() {
        let c = cluster();
        assert!((c.lambda_e_with_redshift() - 3.0f64.hypot(0.05)).abs() < 1e-12);

        let mut undetermined = c.clone();
        undetermined.z_lambda_e = ZLAMBDA_E_UNDETERMINED;
        undetermined.flags.zlambda_undetermined = true;
        assert_eq!(undetermined.lambda_e_with_redshift(), 3.0);
    }

    #[test]
    fn test_undetermined_redshift_error_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut c = cluster();
        c.z_lambda_e = ZLAMBDA_E_UNDETERMINED;
        c.flags.zlambda_undetermined = true;
        c.lambda_e = c.lambda_e_with_redshift();
        let catalog = ClusterCatalog { clusters: vec![c] };
        catalog.save_to_file(&path).unwrap();
        assert_eq!(ClusterCatalog::load_from_file(&path).unwrap(), catalog);
    }
}
