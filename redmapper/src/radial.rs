//! Projected NFW radial filter.
//!
//! Surface density of an NFW halo with a fixed scale radius, held constant
//! inside a small core, normalised so that its integral over a disc of
//! radius `r_lambda` is one. The cumulative profile is tabulated once.

use redmapper_math::integrate::{cumulative_trapezoid, linspace};
use redmapper_math::LinearTable;

use crate::error::Result;

/// NFW scale radius in h⁻¹ Mpc.
pub const NFW_SCALE_RADIUS: f64 = 0.15;
/// Radius inside which the profile is flat.
pub const NFW_CORE_RADIUS: f64 = 0.1;
/// Width of the soft edge at `r_lambda`.
pub const RADIAL_EDGE_WIDTH: f64 = 0.05;

const TABLE_RMAX: f64 = 10.0;
const TABLE_POINTS: usize = 10001;

#[derive(Debug, Clone)]
pub struct NfwFilter {
    /// Enclosed 2πrΣ(r) integral against radius
    enclosed: LinearTable,
}

/// Unnormalised projected NFW profile at `x = r / r_s`.
fn projected_nfw(x: f64) -> f64 {
    if (x - 1.0).abs() < 1e-4 {
        return 1.0 / 3.0;
    }
    let x2m1 = x * x - 1.0;
    if x < 1.0 {
        let s = (1.0 - x * x).sqrt();
        (1.0 - 2.0 / s * ((1.0 - x) / (1.0 + x)).sqrt().atanh()) / x2m1
    } else {
        let s = x2m1.sqrt();
        (1.0 - 2.0 / s * ((x - 1.0) / (x + 1.0)).sqrt().atan()) / x2m1
    }
}

impl NfwFilter {
    pub fn new() -> Result<Self> {
        let rs = linspace(0.0, TABLE_RMAX, TABLE_POINTS);
        let integrand: Vec<f64> = rs
            .iter()
            .map(|&r| 2.0 * std::f64::consts::PI * r * Self::sigma_unnormalised(r))
            .collect();
        let enclosed = cumulative_trapezoid(&rs, &integrand)?;
        Ok(Self {
            enclosed: LinearTable::new(rs, enclosed)?,
        })
    }

    fn sigma_unnormalised(r: f64) -> f64 {
        projected_nfw(r.max(NFW_CORE_RADIUS) / NFW_SCALE_RADIUS)
    }

    /// Normalised surface density (per h⁻² Mpc²) at radius `r`.
    pub fn sigma(&self, r: f64, r_lambda: f64) -> f64 {
        let norm = self.enclosed.eval_clamped(r_lambda);
        if norm <= 0.0 {
            return 0.0;
        }
        Self::sigma_unnormalised(r) / norm
    }

    /// Fraction of the profile inside `r` relative to inside `r_outer`.
    pub fn enclosed_fraction(&self, r: f64, r_outer: f64) -> f64 {
        let outer = self.enclosed.eval_clamped(r_outer);
        if outer <= 0.0 {
            return 0.0;
        }
        (self.enclosed.eval_clamped(r) / outer).clamp(0.0, 1.0)
    }

    /// Radius enclosing fraction `u` of the profile inside `r_outer`.
    pub fn inverse_enclosed(&self, u: f64, r_outer: f64) -> f64 {
        let target = u.clamp(0.0, 1.0) * self.enclosed.eval_clamped(r_outer);
        let ys = self.enclosed.ys();
        let xs = self.enclosed.xs();
        let k = ys.partition_point(|&v| v < target).clamp(1, ys.len() - 1);
        let (y0, y1) = (ys[k - 1], ys[k]);
        let t = if y1 > y0 { (target - y0) / (y1 - y0) } else { 0.0 };
        (xs[k - 1] + t * (xs[k] - xs[k - 1])).min(r_outer)
    }
}

/// Soft radial edge `0.5 erfc((r - r_lambda) / (sqrt(2) σ))`.
pub fn radial_edge(r: f64, r_lambda: f64) -> f64 {
    0.5 * statrs::function::erf::erfc((r - r_lambda) / (std::f64::consts::SQRT_2 * RADIAL_EDGE_WIDTH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_profile_continuous_at_scale_radius() {
        assert_relative_eq!(projected_nfw(0.9999), 1.0 / 3.0, epsilon = 1e-3);
        assert_relative_eq!(projected_nfw(1.0001), 1.0 / 3.0, epsilon = 1e-3);
        assert!(projected_nfw(0.8) > projected_nfw(1.2));
    }

    #[test]
    fn test_normalised_inside_r_lambda() {
        let nfw = NfwFilter::new().unwrap();
        let r_lambda = 0.8;
        let rs = linspace(0.0, r_lambda, 4001);
        let vals: Vec<f64> = rs
            .iter()
            .map(|&r| 2.0 * std::f64::consts::PI * r * nfw.sigma(r, r_lambda))
            .collect();
        let total = redmapper_math::integrate::trapezoid_samples(&rs, &vals).unwrap();
        assert_relative_eq!(total, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_flat_core() {
        let nfw = NfwFilter::new().unwrap();
        assert_eq!(nfw.sigma(0.0, 1.0), nfw.sigma(0.05, 1.0));
        assert!(nfw.sigma(0.05, 1.0) > nfw.sigma(0.3, 1.0));
    }

    #[test]
    fn test_inverse_enclosed_round_trip() {
        let nfw = NfwFilter::new().unwrap();
        for u in [0.1, 0.5, 0.9] {
            let r = nfw.inverse_enclosed(u, 1.5);
            assert_relative_eq!(nfw.enclosed_fraction(r, 1.5), u, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_radial_edge() {
        assert_relative_eq!(radial_edge(1.0, 1.0), 0.5);
        assert!(radial_edge(0.7, 1.0) > 0.999);
        assert!(radial_edge(1.3, 1.0) < 0.001);
    }
}
