//! Schechter luminosity filter in magnitude space.

use redmapper_math::integrate::{linspace, trapezoid_samples};

use crate::error::Result;

/// How far brighter than m* the normalisation integral starts.
const BRIGHT_LIMIT_DMAG: f64 = -10.0;
const NORM_POINTS: usize = 2001;

/// Schechter function `φ(m) ∝ 10^{-0.4 (m - m*)(α + 1)} exp(-10^{-0.4 (m - m*)})`
/// normalised to unit integral brighter than `m* - 2.5 log10(lval_reference)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuminosityFilter {
    alpha: f64,
    /// Magnitude offset of the faint limit from m*
    dmag_limit: f64,
    norm: f64,
}

impl LuminosityFilter {
    pub fn new(alpha: f64, lval_reference: f64) -> Result<Self> {
        let dmag_limit = -2.5 * lval_reference.log10();
        let grid = linspace(BRIGHT_LIMIT_DMAG, dmag_limit, NORM_POINTS);
        let values: Vec<f64> = grid.iter().map(|&dm| Self::schechter(alpha, dm)).collect();
        let norm = trapezoid_samples(&grid, &values)?;
        Ok(Self {
            alpha,
            dmag_limit,
            norm,
        })
    }

    fn schechter(alpha: f64, dm: f64) -> f64 {
        let l = 10f64.powf(-0.4 * dm);
        l.powf(alpha + 1.0) * (-l).exp()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Faintest magnitude counted towards richness at this m*.
    pub fn maxmag(&self, mstar: f64) -> f64 {
        mstar + self.dmag_limit
    }

    /// Normalised density per magnitude at `mag`.
    pub fn phi(&self, mag: f64, mstar: f64) -> f64 {
        Self::schechter(self.alpha, mag - mstar) / self.norm
    }

    pub fn ln_phi(&self, mag: f64, mstar: f64) -> f64 {
        let dm = mag - mstar;
        let l = 10f64.powf(-0.4 * dm);
        (self.alpha + 1.0) * l.ln() - l - self.norm.ln()
    }

    /// Sample magnitude offsets from m*, brighter than the faint limit,
    /// by inverting the cumulative distribution on a grid.
    pub fn sample_dmags<R: rand::Rng>(&self, rng: &mut R, n: usize) -> Vec<f64> {
        let grid = linspace(BRIGHT_LIMIT_DMAG, self.dmag_limit, 1001);
        let mut cdf = Vec::with_capacity(grid.len());
        let mut total = 0.0;
        cdf.push(0.0);
        for w in grid.windows(2) {
            total += 0.5 * (w[1] - w[0]) * (self.phi(w[0], 0.0) + self.phi(w[1], 0.0));
            cdf.push(total);
        }
        (0..n)
            .map(|_| {
                let u: f64 = rng.random::<f64>() * total;
                let k = cdf.partition_point(|&c| c < u).clamp(1, grid.len() - 1);
                let (c0, c1) = (cdf[k - 1], cdf[k]);
                let t = if c1 > c0 { (u - c0) / (c1 - c0) } else { 0.5 };
                grid[k - 1] + t * (grid[k] - grid[k - 1])
            })
            .collect()
    }
}
