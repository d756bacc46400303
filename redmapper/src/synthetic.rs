//! Synthetic red-sequence galaxies, clusters and surveys.
//!
//! Used by the tests and by the `redmapper_synth` binary. The reference band
//! is always the reddest band, so magnitudes are built blue-ward from the
//! reference magnitude by adding colors.

use nalgebra::DVector;
use rand::Rng;
use rand_distr::StandardNormal;
use redmapper_math::{make_nodes, Extrapolation, SplineModel};

use crate::catalog::{Galaxy, SpecCatalog, SpecGalaxy};
use crate::cosmology::Cosmology;
use crate::error::Result;
use crate::redsequence::{RedSequenceModel, RedSequenceState};

/// Node spacing of the default template.
const TEMPLATE_NODESIZE: f64 = 0.05;
/// Color at z = 0 and change per unit redshift for each default color.
const TEMPLATE_COLORS: [(f64, f64); 3] = [(0.75, 2.0), (0.30, 1.2), (0.18, 0.55)];
const TEMPLATE_SLOPES: [f64; 3] = [-0.04, -0.02, -0.01];
const TEMPLATE_SIGMAS: [f64; 3] = [0.05, 0.03, 0.03];

/// Satellite offsets from the cluster center, h⁻¹ Mpc.
const SATELLITE_RADIUS_SIGMA: f64 = 0.15;
/// Line-of-sight redshift scatter of satellites.
const SATELLITE_Z_SIGMA: f64 = 0.005;
/// Magnitude of the brightest galaxy relative to m*.
const BCG_DMAG: f64 = -2.0;
/// Color scatter of field galaxies.
const FIELD_COLOR_SCATTER: f64 = 0.1;
const SPEC_Z_ERR: f64 = 1e-4;

/// Characteristic reference magnitude m*(z) of the default template.
pub fn template_mstar(z: f64) -> f64 {
    let lnz = z.max(1e-3).ln();
    22.44 + 3.36 * lnz + 0.273 * lnz.powi(2) - 0.0618 * lnz.powi(3) - 0.0227 * lnz.powi(4)
}

/// Three-color red sequence with linear color evolution, used to seed
/// calibration and as test truth.
pub fn default_template(zrange: [f64; 2]) -> Result<RedSequenceModel> {
    let nodes = make_nodes(zrange, TEMPLATE_NODESIZE, -1.0);
    let mstar_values: Vec<f64> = nodes.iter().map(|&z| template_mstar(z)).collect();
    let mstar = SplineModel::new(nodes.clone(), mstar_values, Extrapolation::Linear)?;

    let colors = TEMPLATE_COLORS
        .iter()
        .map(|&(c0, dc)| {
            let values = nodes.iter().map(|&z| c0 + dc * z).collect();
            SplineModel::new(nodes.clone(), values, Extrapolation::Linear)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let slopes = TEMPLATE_SLOPES
        .iter()
        .map(|&s| SplineModel::constant(nodes.clone(), s))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let sigmas = TEMPLATE_SIGMAS
        .iter()
        .map(|&s| SplineModel::constant(nodes.clone(), s))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let correlations = (0..3)
        .map(|_| SplineModel::constant(nodes.clone(), 0.0))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(RedSequenceModel {
        zrange,
        pivotmag: mstar.clone(),
        mstar,
        colors,
        slopes,
        sigmas,
        correlations,
        zred_correction: None,
    })
}

/// Magnitude error of a survey with 10σ depth near 21.5.
pub fn photometric_error(mag: f64) -> f64 {
    0.01 + 0.03 * 10f64.powf(0.4 * (mag - 21.5))
}

/// Magnitudes whose adjacent differences are `colors`, with the reddest
/// band equal to `refmag`.
fn magnitudes(refmag: f64, colors: &[f64]) -> Vec<f64> {
    let nmag = colors.len() + 1;
    let mut mag = vec![refmag; nmag];
    for i in (0..colors.len()).rev() {
        mag[i] = mag[i + 1] + colors[i];
    }
    mag
}

fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    rng.sample(StandardNormal)
}

/// Draw intrinsic color offsets from the model covariance.
fn intrinsic_offsets<R: Rng>(rng: &mut R, state: &RedSequenceState) -> DVector<f64> {
    let normals = DVector::from_fn(state.ncol(), |_, _| rng.sample::<f64, _>(StandardNormal));
    match state.cov_int.clone().cholesky() {
        Some(chol) => chol.l() * normals,
        None => normals.component_mul(&state.cov_int.diagonal().map(f64::sqrt)),
    }
}

/// Noise-free galaxy exactly on the red sequence at `z`.
pub fn galaxy_on_sequence(
    model: &RedSequenceModel,
    id: u64,
    z: f64,
    refmag: f64,
    ra: f64,
    dec: f64,
) -> Galaxy {
    let colors: Vec<f64> = model.state_at(z).model_colors(refmag).iter().copied().collect();
    let mag = magnitudes(refmag, &colors);
    let mag_err = mag.iter().map(|&m| photometric_error(m)).collect();
    Galaxy {
        id,
        ra,
        dec,
        mag,
        mag_err,
        ztrue: Some(z),
        zspec: None,
        zred: None,
    }
}

/// Red-sequence galaxy with intrinsic color scatter (when `intrinsic`) and
/// photometric noise matching its quoted errors.
#[allow(clippy::too_many_arguments)]
pub fn scattered_galaxy<R: Rng>(
    rng: &mut R,
    model: &RedSequenceModel,
    id: u64,
    z: f64,
    refmag: f64,
    ra: f64,
    dec: f64,
    intrinsic: bool,
) -> Galaxy {
    let state = model.state_at(z);
    let mut colors = state.model_colors(refmag);
    if intrinsic {
        colors += intrinsic_offsets(rng, &state);
    }
    let clean = magnitudes(refmag, colors.as_slice());
    let mag_err: Vec<f64> = clean.iter().map(|&m| photometric_error(m)).collect();
    let mag = clean
        .iter()
        .zip(mag_err.iter())
        .map(|(&m, &e)| m + e * standard_normal(rng))
        .collect();
    Galaxy {
        id,
        ra,
        dec,
        mag,
        mag_err,
        ztrue: Some(z),
        zspec: None,
        zred: None,
    }
}

/// A cluster to inject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticCluster {
    pub ra: f64,
    pub dec: f64,
    pub z: f64,
    /// Members including the central galaxy
    pub n_members: usize,
}

/// Position offset by `(dx, dy)` h⁻¹ Mpc at angular scale `mpc_scale`.
fn offset_position(ra: f64, dec: f64, dx: f64, dy: f64, mpc_scale: f64) -> (f64, f64) {
    let cos_dec = dec.to_radians().cos().max(1e-6);
    (ra + dx / mpc_scale / cos_dec, dec + dy / mpc_scale)
}

/// Galaxies of one cluster: a central galaxy two magnitudes brighter than
/// m* at the exact center, plus Gaussian-distributed red satellites between
/// m* - 0.5 and m* + 1.5. Identifiers run from `first_id`, central first.
pub fn cluster_galaxies<R: Rng>(
    rng: &mut R,
    model: &RedSequenceModel,
    cosmology: &Cosmology,
    cluster: &SyntheticCluster,
    first_id: u64,
) -> Vec<Galaxy> {
    let mpc_scale = cosmology.mpc_scale(cluster.z);
    let mstar = model.mstar.evaluate(cluster.z);
    let mut galaxies = Vec::with_capacity(cluster.n_members);
    if cluster.n_members == 0 {
        return galaxies;
    }
    galaxies.push(scattered_galaxy(
        rng,
        model,
        first_id,
        cluster.z,
        mstar + BCG_DMAG,
        cluster.ra,
        cluster.dec,
        false,
    ));
    for k in 1..cluster.n_members {
        let dx = SATELLITE_RADIUS_SIGMA * standard_normal(rng);
        let dy = SATELLITE_RADIUS_SIGMA * standard_normal(rng);
        let (ra, dec) = offset_position(cluster.ra, cluster.dec, dx, dy, mpc_scale);
        let z = cluster.z + SATELLITE_Z_SIGMA * standard_normal(rng);
        let refmag = mstar + rng.random_range(-0.5..1.5);
        galaxies.push(scattered_galaxy(
            rng,
            model,
            first_id + k as u64,
            z,
            refmag,
            ra,
            dec,
            true,
        ));
    }
    galaxies
}

/// Layout of a synthetic survey.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyLayout {
    pub ra_range: [f64; 2],
    pub dec_range: [f64; 2],
    pub zrange: [f64; 2],
    /// Field galaxies with broad colors
    pub n_background: usize,
    /// Field red-sequence galaxies, all with spectra
    pub n_red_field: usize,
    /// Fraction of cluster members given a spectrum
    pub member_spec_fraction: f64,
    pub clusters: Vec<SyntheticCluster>,
}

impl Default for SurveyLayout {
    fn default() -> Self {
        Self {
            ra_range: [30.0, 34.0],
            dec_range: [-2.0, 2.0],
            zrange: [0.05, 0.60],
            n_background: 4000,
            n_red_field: 1500,
            member_spec_fraction: 0.3,
            clusters: Vec::new(),
        }
    }
}

impl SurveyLayout {
    /// Solid angle of the footprint in deg².
    pub fn area_deg2(&self) -> f64 {
        let dra = (self.ra_range[1] - self.ra_range[0]).to_radians();
        let dsin = self.dec_range[1].to_radians().sin() - self.dec_range[0].to_radians().sin();
        dra * dsin * (180.0 / std::f64::consts::PI).powi(2)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyntheticSurvey {
    pub galaxies: Vec<Galaxy>,
    pub spec: SpecCatalog,
}

fn spectrum(galaxy: &Galaxy, z: f64) -> SpecGalaxy {
    SpecGalaxy {
        ra: galaxy.ra,
        dec: galaxy.dec,
        z,
        z_err: SPEC_Z_ERR,
    }
}

/// Clusters, red field galaxies and broad-color background galaxies spread
/// uniformly over the layout's footprint.
pub fn generate_survey<R: Rng>(
    rng: &mut R,
    model: &RedSequenceModel,
    cosmology: &Cosmology,
    layout: &SurveyLayout,
) -> SyntheticSurvey {
    let mut survey = SyntheticSurvey::default();
    let mut next_id = 0u64;

    for cluster in &layout.clusters {
        for galaxy in cluster_galaxies(rng, model, cosmology, cluster, next_id) {
            if rng.random::<f64>() < layout.member_spec_fraction {
                if let Some(z) = galaxy.ztrue {
                    survey.spec.entries.push(spectrum(&galaxy, z));
                }
            }
            survey.galaxies.push(galaxy);
        }
        next_id += cluster.n_members as u64;
    }

    let [zlo, zhi] = layout.zrange;
    let position = |rng: &mut R| {
        (
            rng.random_range(layout.ra_range[0]..layout.ra_range[1]),
            rng.random_range(layout.dec_range[0]..layout.dec_range[1]),
        )
    };

    for _ in 0..layout.n_red_field {
        let z = rng.random_range(zlo..zhi);
        let (ra, dec) = position(rng);
        let refmag = model.mstar.evaluate(z) + rng.random_range(-1.0..1.0);
        let galaxy = scattered_galaxy(rng, model, next_id, z, refmag, ra, dec, true);
        survey.spec.entries.push(spectrum(&galaxy, z));
        survey.galaxies.push(galaxy);
        next_id += 1;
    }

    for _ in 0..layout.n_background {
        let z = rng.random_range(zlo..zhi);
        let (ra, dec) = position(rng);
        let refmag = model.mstar.evaluate(z) + rng.random_range(-1.0..3.0);
        let mut galaxy = scattered_galaxy(rng, model, next_id, z, refmag, ra, dec, false);
        let shifted: Vec<f64> = galaxy
            .colors()
            .iter()
            .map(|c| c + FIELD_COLOR_SCATTER * standard_normal(rng))
            .collect();
        galaxy.mag = magnitudes(galaxy.mag[galaxy.mag.len() - 1], &shifted);
        survey.galaxies.push(galaxy);
        next_id += 1;
    }

    log::info!(
        "Synthetic survey: {} galaxies, {} spectra, {} clusters",
        survey.galaxies.len(),
        survey.spec.entries.len(),
        layout.clusters.len()
    );
    survey
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_template_mstar_brightens_toward_low_z() {
        assert!(template_mstar(0.1) < template_mstar(0.3));
        assert!(template_mstar(0.3) < template_mstar(0.6));
        assert_relative_eq!(template_mstar(0.3), 18.85, epsilon = 0.02);
    }

    #[test]
    fn test_template_colors_follow_definition() {
        let model = default_template([0.05, 0.6]).unwrap();
        for &z in &[0.05, 0.23, 0.6] {
            assert_relative_eq!(model.colors[0].evaluate(z), 0.75 + 2.0 * z, epsilon = 1e-9);
            assert_relative_eq!(model.colors[2].evaluate(z), 0.18 + 0.55 * z, epsilon = 1e-9);
        }
        assert_relative_eq!(model.sigma(1, 0.4), 0.03, epsilon = 1e-12);
    }

    #[test]
    fn test_galaxy_on_sequence_has_model_colors() {
        let model = default_template([0.05, 0.6]).unwrap();
        let galaxy = galaxy_on_sequence(&model, 7, 0.3, 19.0, 10.0, 1.0);
        let expected = model.state_at(0.3).model_colors(19.0);
        for (c, e) in galaxy.colors().iter().zip(expected.iter()) {
            assert_relative_eq!(*c, *e, epsilon = 1e-12);
        }
        assert_eq!(galaxy.mag[3], 19.0);
        assert_eq!(galaxy.ztrue, Some(0.3));
    }

    #[test]
    fn test_cluster_galaxies_layout() {
        let model = default_template([0.05, 0.6]).unwrap();
        let cosmology = Cosmology::new(0.3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let spec = SyntheticCluster {
            ra: 40.0,
            dec: 0.0,
            z: 0.25,
            n_members: 30,
        };
        let galaxies = cluster_galaxies(&mut rng, &model, &cosmology, &spec, 100);
        assert_eq!(galaxies.len(), 30);
        assert_eq!(galaxies[0].id, 100);
        assert_eq!(galaxies[29].id, 129);
        assert_eq!((galaxies[0].ra, galaxies[0].dec), (40.0, 0.0));
        let brightest = galaxies
            .iter()
            .map(|g| g.refmag(3))
            .fold(f64::INFINITY, f64::min);
        assert!(brightest < model.mstar.evaluate(0.25) - 1.5);
    }

    #[test]
    fn test_survey_is_reproducible() {
        let model = default_template([0.05, 0.6]).unwrap();
        let cosmology = Cosmology::new(0.3).unwrap();
        let layout = SurveyLayout {
            n_background: 50,
            n_red_field: 20,
            clusters: vec![SyntheticCluster {
                ra: 31.0,
                dec: 0.0,
                z: 0.3,
                n_members: 10,
            }],
            ..SurveyLayout::default()
        };
        let a = generate_survey(&mut ChaCha8Rng::seed_from_u64(9), &model, &cosmology, &layout);
        let b = generate_survey(&mut ChaCha8Rng::seed_from_u64(9), &model, &cosmology, &layout);
        assert_eq!(a, b);
        assert_eq!(a.galaxies.len(), 80);
        assert!(a.spec.entries.len() >= 20);
        let ids: std::collections::HashSet<u64> = a.galaxies.iter().map(|g| g.id).collect();
        assert_eq!(ids.len(), 80);
    }

    #[test]
    fn test_layout_area() {
        let layout = SurveyLayout::default();
        // 4 deg of ra times 4 deg of dec at the equator
        assert_relative_eq!(layout.area_deg2(), 16.0, epsilon = 0.01);
    }
}
