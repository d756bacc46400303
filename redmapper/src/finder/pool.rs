//! Galaxies still available to lower-ranked candidates during percolation.

/// A galaxy whose free probability drops below this is claimed outright.
pub const CLAIM_THRESHOLD: f64 = 0.5;

/// Per-galaxy free probability plus a claimed flag, indexed like the
/// partition catalog. Only the candidate currently being percolated
/// writes to it.
#[derive(Debug, Clone, PartialEq)]
pub struct GalaxyPool {
    pfree: Vec<f64>,
    claimed: Vec<bool>,
}

impl GalaxyPool {
    pub fn new(ngals: usize) -> Self {
        Self {
            pfree: vec![1.0; ngals],
            claimed: vec![false; ngals],
        }
    }

    pub fn pfree(&self) -> &[f64] {
        &self.pfree
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.claimed[index]
    }

    /// Remove a cluster's share `pcol` of a galaxy.
    pub fn claim(&mut self, index: usize, pcol: f64) {
        self.pfree[index] *= 1.0 - pcol.clamp(0.0, 1.0);
        if self.pfree[index] < CLAIM_THRESHOLD {
            self.claimed[index] = true;
        }
    }

    pub fn nclaimed(&self) -> usize {
        self.claimed.iter().filter(|c| **c).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_claims_accumulate() {
        let mut pool = GalaxyPool::new(3);
        pool.claim(1, 0.3);
        assert_relative_eq!(pool.pfree()[1], 0.7);
        assert!(!pool.is_claimed(1));
        pool.claim(1, 0.4);
        assert_relative_eq!(pool.pfree()[1], 0.42);
        assert!(pool.is_claimed(1));
        assert_eq!(pool.nclaimed(), 1);
        assert_eq!(pool.pfree()[0], 1.0);
    }

    #[test]
    fn test_claim_clamps_probability() {
        let mut pool = GalaxyPool::new(1);
        pool.claim(0, 1.5);
        assert_eq!(pool.pfree()[0], 0.0);
        assert!(pool.is_claimed(0));
    }
}
