//! Survey footprint: healpix coverage mask, depth map and Monte-Carlo mask
//! galaxies for aperture corrections.
//!
//! Both maps are nested-scheme healpix pixel lists at a fixed depth with a
//! default value for pixels not listed. The mask gives the covered fraction
//! of each pixel; the depth map gives the limiting reference-band magnitude.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{RedmapperError, Result};
use crate::lumfunc::LuminosityFilter;
use crate::radial::{radial_edge, NfwFilter};

/// Outer radius of mask galaxy samples in units of `r_lambda`.
pub const MASKGAL_RMAX_FRAC: f64 = 1.5;
/// Magnitude width of the completeness edge at the depth limit.
pub const DEPTH_EDGE_WIDTH: f64 = 0.1;

/// Nested healpix hash of a sky position in degrees.
pub fn healpix_hash(depth: u8, ra_deg: f64, dec_deg: f64) -> u64 {
    let lon = ra_deg.rem_euclid(360.0).to_radians();
    let lat = dec_deg.clamp(-90.0, 90.0).to_radians();
    cdshealpix::nested::get(depth).hash(lon, lat)
}

/// Area of one healpix pixel in deg².
pub fn healpix_pixel_area_deg2(depth: u8) -> f64 {
    let nside = cdshealpix::nside(depth) as f64;
    let npix = 12.0 * nside * nside;
    4.0 * std::f64::consts::PI * (180.0 / std::f64::consts::PI).powi(2) / npix
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelValue {
    pub pixel: u64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PixelMapFile {
    depth: u8,
    default: f64,
    pixels: Vec<PixelValue>,
}

/// Per-pixel coverage fraction.
#[derive(Debug, Clone)]
pub struct HealpixMask {
    depth: u8,
    coverage: HashMap<u64, f64>,
    default_coverage: f64,
}

impl HealpixMask {
    pub fn new(depth: u8, pixels: Vec<PixelValue>, default_coverage: f64) -> Self {
        Self {
            depth,
            coverage: pixels
                .into_iter()
                .map(|p| (p.pixel, p.value.clamp(0.0, 1.0)))
                .collect(),
            default_coverage: default_coverage.clamp(0.0, 1.0),
        }
    }

    /// Mask that covers the whole sky.
    pub fn full_coverage() -> Self {
        Self::new(0, Vec::new(), 1.0)
    }

    /// Load a `{depth, default, pixels: [{pixel, value}]}` JSON file.
    pub fn load_from_file(path: &Path, mask_mode: i32) -> Result<Self> {
        if mask_mode != crate::config::HEALPIX_MASK_MODE {
            return Err(RedmapperError::UnsupportedMaskMode(mask_mode));
        }
        let json = std::fs::read_to_string(path)?;
        let file: PixelMapFile = serde_json::from_str(&json)?;
        Ok(Self::new(file.depth, file.pixels, file.default))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut pixels: Vec<PixelValue> = self
            .coverage
            .iter()
            .map(|(&pixel, &value)| PixelValue { pixel, value })
            .collect();
        pixels.sort_by_key(|p| p.pixel);
        let file = PixelMapFile {
            depth: self.depth,
            default: self.default_coverage,
            pixels,
        };
        std::fs::write(path, serde_json::to_string(&file)?)?;
        Ok(())
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn coverage(&self, ra: f64, dec: f64) -> f64 {
        let pixel = healpix_hash(self.depth, ra, dec);
        self.coverage
            .get(&pixel)
            .copied()
            .unwrap_or(self.default_coverage)
    }

    /// Effective area of the listed pixels, `None` when the footprint is
    /// only defined by the default coverage.
    pub fn listed_area_deg2(&self) -> Option<f64> {
        if self.coverage.is_empty() {
            return None;
        }
        let total: f64 = self.coverage.values().sum();
        Some(total * healpix_pixel_area_deg2(self.depth))
    }
}

/// Per-pixel limiting magnitude in the reference band.
#[derive(Debug, Clone)]
pub struct DepthMap {
    depth: u8,
    limmag: HashMap<u64, f64>,
    default_limmag: f64,
}

impl DepthMap {
    pub fn new(depth: u8, pixels: Vec<PixelValue>, default_limmag: f64) -> Self {
        Self {
            depth,
            limmag: pixels.into_iter().map(|p| (p.pixel, p.value)).collect(),
            default_limmag,
        }
    }

    pub fn uniform(limmag: f64) -> Self {
        Self::new(0, Vec::new(), limmag)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let file: PixelMapFile = serde_json::from_str(&json)?;
        Ok(Self::new(file.depth, file.pixels, file.default))
    }

    pub fn limmag(&self, ra: f64, dec: f64) -> f64 {
        if self.limmag.is_empty() {
            return self.default_limmag;
        }
        let pixel = healpix_hash(self.depth, ra, dec);
        self.limmag
            .get(&pixel)
            .copied()
            .unwrap_or(self.default_limmag)
    }
}

/// Completeness of a galaxy of magnitude `mag` at depth `limmag`.
pub fn depth_completeness(mag: f64, limmag: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(
        (mag - limmag) / (std::f64::consts::SQRT_2 * DEPTH_EDGE_WIDTH),
    )
}

/// One synthetic galaxy placed inside a cluster aperture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskGalaxy {
    /// Radius in units of `r_lambda`
    pub r_frac: f64,
    /// Position angle in radians
    pub theta: f64,
    /// Magnitude offset from m*
    pub dmag: f64,
}

/// Aperture correction for one cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskStats {
    /// Weighted fraction of the aperture that is masked
    pub maskfrac: f64,
    /// Weighted fraction of the luminosity function that is observable
    pub scaleval: f64,
}

impl MaskStats {
    pub const UNMASKED: MaskStats = MaskStats {
        maskfrac: 0.0,
        scaleval: 1.0,
    };

    /// Error when more of the aperture is masked than allowed.
    pub fn check(&self, max_maskfrac: f64) -> Result<()> {
        if self.maskfrac > max_maskfrac {
            return Err(RedmapperError::MaskCoverageExceeded {
                maskfrac: self.maskfrac,
                max_maskfrac,
            });
        }
        Ok(())
    }
}

/// Independent Monte-Carlo samples of aperture galaxies.
#[derive(Debug, Clone)]
pub struct MaskGalaxies {
    samples: Vec<Vec<MaskGalaxy>>,
}

impl MaskGalaxies {
    /// Draw `nsamples` samples of `ngals` galaxies each. Radii follow the
    /// NFW profile out to 1.5 `r_lambda` (for a 1 h⁻¹ Mpc reference radius)
    /// and magnitudes follow the luminosity filter.
    pub fn generate(
        nsamples: usize,
        ngals: usize,
        nfw: &NfwFilter,
        lumfilter: &LuminosityFilter,
        seed: u64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let samples = (0..nsamples)
            .map(|_| {
                let dmags = lumfilter.sample_dmags(&mut rng, ngals);
                dmags
                    .into_iter()
                    .map(|dmag| {
                        let u: f64 = rng.random();
                        MaskGalaxy {
                            r_frac: nfw.inverse_enclosed(u, MASKGAL_RMAX_FRAC),
                            theta: rng.random_range(0.0..std::f64::consts::TAU),
                            dmag,
                        }
                    })
                    .collect()
            })
            .collect();
        Self { samples }
    }

    pub fn nsamples(&self) -> usize {
        self.samples.len()
    }

    /// Sample used for the cluster with this identifier.
    pub fn sample(&self, cluster_id: u64) -> &[MaskGalaxy] {
        if self.samples.is_empty() {
            return &[];
        }
        &self.samples[(cluster_id % self.samples.len() as u64) as usize]
    }

    /// Masked fraction and observable fraction for an aperture.
    ///
    /// Samples are weighted by the same soft radial edge the richness uses.
    #[allow(clippy::too_many_arguments)]
    pub fn aperture_stats(
        &self,
        cluster_id: u64,
        ra: f64,
        dec: f64,
        r_lambda: f64,
        mpc_scale: f64,
        mstar: f64,
        mask: &HealpixMask,
        depth: &DepthMap,
    ) -> MaskStats {
        let sample = self.sample(cluster_id);
        let cos_dec = dec.to_radians().cos().max(1e-6);
        let mut wsum = 0.0;
        let mut covered = 0.0;
        let mut observable = 0.0;
        for gal in sample {
            let r = gal.r_frac * r_lambda;
            let w = radial_edge(r, r_lambda);
            if w < 1e-6 {
                continue;
            }
            let d = r / mpc_scale;
            let gra = ra + d * gal.theta.cos() / cos_dec;
            let gdec = dec + d * gal.theta.sin();
            let cov = mask.coverage(gra, gdec);
            let complete = depth_completeness(mstar + gal.dmag, depth.limmag(gra, gdec));
            wsum += w;
            covered += w * cov;
            observable += w * cov * complete;
        }
        if wsum <= 0.0 {
            return MaskStats::UNMASKED;
        }
        MaskStats {
            maskfrac: (1.0 - covered / wsum).clamp(0.0, 1.0),
            scaleval: (observable / wsum).clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn maskgals() -> MaskGalaxies {
        let nfw = NfwFilter::new().unwrap();
        let lf = LuminosityFilter::new(-1.0, 0.2).unwrap();
        MaskGalaxies::generate(4, 2000, &nfw, &lf, 11)
    }

    #[test]
    fn test_pixel_area_sums_to_sky() {
        let area = healpix_pixel_area_deg2(3) * 12.0 * 64.0;
        assert_relative_eq!(area, 41252.96, epsilon = 0.01);
    }

    #[test]
    fn test_coverage_lookup() {
        let pixel = healpix_hash(6, 45.0, 10.0);
        let mask = HealpixMask::new(6, vec![PixelValue { pixel, value: 0.25 }], 0.0);
        assert_eq!(mask.coverage(45.0, 10.0), 0.25);
        assert_eq!(mask.coverage(200.0, -40.0), 0.0);
        assert_relative_eq!(
            mask.listed_area_deg2().unwrap(),
            0.25 * healpix_pixel_area_deg2(6)
        );
    }

    #[test]
    fn test_ra_wraps() {
        assert_eq!(healpix_hash(5, -10.0, 3.0), healpix_hash(5, 350.0, 3.0));
    }

    #[test]
    fn test_unmasked_aperture() {
        let stats = maskgals().aperture_stats(
            7,
            150.0,
            2.0,
            0.9,
            11.0,
            18.0,
            &HealpixMask::full_coverage(),
            &DepthMap::uniform(24.0),
        );
        assert_relative_eq!(stats.maskfrac, 0.0);
        assert_relative_eq!(stats.scaleval, 1.0, epsilon = 1e-6);
        assert!(stats.check(0.2).is_ok());
    }

    #[test]
    fn test_half_masked_aperture() {
        // Cover only pixels east of the centre at a fine depth
        let depth = 13;
        let (ra0, dec0) = (150.0, 2.0);
        let mut pixels = Vec::new();
        let step = 0.005;
        for i in 0..60 {
            for j in -60..60 {
                let ra = ra0 + step * i as f64;
                let dec = dec0 + step * j as f64;
                pixels.push(PixelValue {
                    pixel: healpix_hash(depth, ra, dec),
                    value: 1.0,
                });
            }
        }
        let mask = HealpixMask::new(depth, pixels, 0.0);
        let stats = maskgals().aperture_stats(
            1,
            ra0,
            dec0,
            0.9,
            11.0,
            18.0,
            &mask,
            &DepthMap::uniform(24.0),
        );
        assert!(stats.maskfrac > 0.35 && stats.maskfrac < 0.65, "{stats:?}");
        assert!(matches!(
            stats.check(0.2),
            Err(RedmapperError::MaskCoverageExceeded { .. })
        ));
    }

    #[test]
    fn test_shallow_depth_reduces_scaleval() {
        let stats = maskgals().aperture_stats(
            2,
            10.0,
            0.0,
            0.9,
            11.0,
            18.0,
            &HealpixMask::full_coverage(),
            &DepthMap::uniform(18.5),
        );
        assert!(stats.scaleval < 0.8);
        assert_eq!(stats.maskfrac, 0.0);
    }

    #[test]
    fn test_sample_selection_by_id() {
        let mg = maskgals();
        assert_eq!(mg.nsamples(), 4);
        assert_eq!(mg.sample(1), mg.sample(5));
        assert_ne!(mg.sample(1), mg.sample(2));
    }

    #[test]
    fn test_rejects_other_mask_modes() {
        let err = HealpixMask::load_from_file(Path::new("unused.json"), 1).unwrap_err();
        assert!(matches!(err, RedmapperError::UnsupportedMaskMode(1)));
    }
}
