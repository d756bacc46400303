//! Flat ΛCDM distances in h⁻¹ Mpc.
//!
//! Comoving distance is tabulated once by trapezoidal integration of
//! `1/E(z)` and interpolated afterwards. Radii throughout the finder are
//! physical h⁻¹ Mpc and are converted to angles with [`Cosmology::mpc_scale`].

use redmapper_math::integrate::{cumulative_trapezoid, linspace};
use redmapper_math::LinearTable;

use crate::error::Result;

/// Hubble distance c/H0 in h⁻¹ Mpc.
pub const HUBBLE_DISTANCE: f64 = 2997.92458;

const TABLE_ZMAX: f64 = 5.0;
const TABLE_POINTS: usize = 5001;

#[derive(Debug, Clone)]
pub struct Cosmology {
    omega_m: f64,
    comoving: LinearTable,
}

impl Cosmology {
    /// Flat cosmology with matter density `omega_m`.
    pub fn new(omega_m: f64) -> Result<Self> {
        let zs = linspace(0.0, TABLE_ZMAX, TABLE_POINTS);
        let inv_e: Vec<f64> = zs
            .iter()
            .map(|&z| 1.0 / Self::e_of_z(omega_m, z))
            .collect();
        let integral = cumulative_trapezoid(&zs, &inv_e)?;
        let dc: Vec<f64> = integral.iter().map(|v| v * HUBBLE_DISTANCE).collect();
        Ok(Self {
            omega_m,
            comoving: LinearTable::new(zs, dc)?,
        })
    }

    fn e_of_z(omega_m: f64, z: f64) -> f64 {
        let a3 = (1.0 + z).powi(3);
        (omega_m * a3 + (1.0 - omega_m)).sqrt()
    }

    pub fn omega_m(&self) -> f64 {
        self.omega_m
    }

    /// Line-of-sight comoving distance.
    pub fn comoving_distance(&self, z: f64) -> f64 {
        self.comoving.eval_clamped(z)
    }

    pub fn angular_diameter_distance(&self, z: f64) -> f64 {
        self.comoving_distance(z) / (1.0 + z)
    }

    pub fn luminosity_distance(&self, z: f64) -> f64 {
        self.comoving_distance(z) * (1.0 + z)
    }

    /// Physical h⁻¹ Mpc subtended by one degree at redshift `z`.
    pub fn mpc_scale(&self, z: f64) -> f64 {
        self.angular_diameter_distance(z) * std::f64::consts::PI / 180.0
    }

    /// Comoving volume (h⁻³ Mpc³) between two redshifts over `area_deg2`.
    pub fn comoving_volume(&self, z1: f64, z2: f64, area_deg2: f64) -> f64 {
        let steradians = area_deg2 * (std::f64::consts::PI / 180.0).powi(2);
        let d1 = self.comoving_distance(z1.min(z2));
        let d2 = self.comoving_distance(z1.max(z2));
        steradians / 3.0 * (d2.powi(3) - d1.powi(3))
    }
}
