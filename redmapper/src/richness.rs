//! Richness estimation around a fixed center and redshift.
//!
//! Each galaxy near the center has a cluster signal density
//! `u = Σ_nfw(r) φ(m) ρ(color)` and a background density `b`. The richness
//! λ solves `Σ w u / (λ u + b) = 1`, where `w = θ_i θ_r p_free` folds in
//! luminosity completeness, the soft radial edge and percolation. The
//! aperture radius follows λ through the radius-richness relation, so the
//! solve is repeated until the radius settles.

use redmapper_math::optimize::bisect;
use statrs::function::gamma::ln_gamma;

use crate::catalog::{Galaxy, GalaxyCatalog};
use crate::config::RadiusRelation;
use crate::context::RunContext;
use crate::radial::{radial_edge, RADIAL_EDGE_WIDTH};

/// Relative radius change treated as converged.
pub const RADIUS_TOLERANCE: f64 = 0.01;
/// Starting richness when nothing better is known.
pub const DEFAULT_LAMBDA_INIT: f64 = 20.0;
/// Floor on the magnitude error setting the width of the luminosity edge.
const MAG_EDGE_MIN_WIDTH: f64 = 0.01;
/// Galaxies further than this many edge widths outside `r_lambda` carry no weight.
const EDGE_SEARCH_WIDTHS: f64 = 5.0;

/// Which color likelihood scores membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFilter {
    /// Chi-squared density of the colors against the red sequence at z
    Chisq,
    /// Gaussian in the galaxy's zred around z
    Zred,
}

/// Position and redshift a richness is measured at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Center {
    /// Identifier selecting the mask galaxy sample
    pub id: u64,
    pub ra: f64,
    pub dec: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RichnessParams {
    pub radius: RadiusRelation,
    pub niter: usize,
    pub lambda_init: f64,
    pub filter: ColorFilter,
}

/// Per-galaxy terms of the richness sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberTerm {
    /// Index into the catalog
    pub index: usize,
    pub r: f64,
    pub u: f64,
    pub b: f64,
    pub theta_i: f64,
    pub theta_r: f64,
    pub p: f64,
    pub pcol: f64,
    pub pmem: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RichnessResult {
    /// Observed richness divided by `scaleval`
    pub lambda: f64,
    pub lambda_obs: f64,
    pub lambda_e: f64,
    pub r_lambda: f64,
    pub scaleval: f64,
    pub maskfrac: f64,
    pub lnlamlike: f64,
    pub converged: bool,
    /// Terms for galaxies inside `r_lambda`, nearest first
    pub members: Vec<MemberTerm>,
}

/// Chi-squared probability density with `dof` degrees of freedom.
pub fn chisq_pdf(chisq: f64, dof: usize) -> f64 {
    if chisq <= 0.0 {
        return 0.0;
    }
    let k2 = 0.5 * dof as f64;
    ((k2 - 1.0) * chisq.ln() - 0.5 * chisq - k2 * std::f64::consts::LN_2 - ln_gamma(k2)).exp()
}

fn gaussian_pdf(x: f64, mean: f64, sigma: f64) -> f64 {
    let t = (x - mean) / sigma;
    (-0.5 * t * t).exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt())
}

/// Richness that solves `Σ w u / (λ u + b) = 1`, zero if even λ = 0
/// cannot reach one.
pub fn solve_lambda(terms: &[(f64, f64, f64)]) -> f64 {
    let g = |lambda: f64| {
        terms
            .iter()
            .map(|&(u, b, w)| if u > 0.0 && w > 0.0 { w * u / (lambda * u + b) } else { 0.0 })
            .sum::<f64>()
            - 1.0
    };
    let wsum: f64 = terms.iter().filter(|t| t.0 > 0.0).map(|t| t.2).sum();
    if wsum <= 0.0 || g(0.0) <= 0.0 {
        return 0.0;
    }
    // g(Σw) <= 0 always, so the root is bracketed
    bisect(g, 0.0, wsum, 1e-6, 200).unwrap_or(wsum)
}

/// Static per-galaxy terms that do not depend on the aperture radius.
struct Candidate {
    index: usize,
    r: f64,
    theta_i: f64,
    /// `φ(m) ρ(color)`
    signal: f64,
    b: f64,
    pfree: f64,
}

struct Local<'a> {
    ctx: &'a RunContext,
    center: &'a Center,
    params: &'a RichnessParams,
    mpc_scale: f64,
    mstar: f64,
    maxmag: f64,
    limmag: f64,
    state: crate::redsequence::RedSequenceState,
}

impl Local<'_> {
    fn terms(&self, galaxy: &Galaxy) -> Option<(f64, f64)> {
        let config = &self.ctx.config;
        let ref_ind = config.ref_ind;
        let refmag = galaxy.refmag(ref_ind);
        let z = self.center.z;
        let (rho, bkg) = match self.params.filter {
            ColorFilter::Chisq => {
                let chi = self.state.chisq(&galaxy.colors(), &galaxy.mag_err, refmag)?;
                if chi.chisq >= config.chisq_max {
                    return None;
                }
                (
                    chisq_pdf(chi.chisq, config.ncol()),
                    self.ctx.background.sigma_g(z, chi.chisq, refmag),
                )
            }
            ColorFilter::Zred => {
                let zred = galaxy.zred?;
                if zred.chisq >= config.chisq_max {
                    return None;
                }
                (
                    gaussian_pdf(zred.zred, z, zred.zred_e),
                    self.ctx.background.sigma_zred(zred.zred, refmag),
                )
            }
        };
        let phi = self.ctx.lumfilter.phi(refmag, self.mstar);
        Some((phi * rho, bkg / (self.mpc_scale * self.mpc_scale)))
    }

    fn theta_i(&self, galaxy: &Galaxy) -> f64 {
        let ref_ind = self.ctx.config.ref_ind;
        let refmag = galaxy.refmag(ref_ind);
        if refmag > self.limmag {
            return 0.0;
        }
        let width = galaxy.refmag_err(ref_ind).max(MAG_EDGE_MIN_WIDTH);
        0.5 * statrs::function::erf::erfc(
            (refmag - self.maxmag) / (std::f64::consts::SQRT_2 * width),
        )
    }

    fn candidates(&self, catalog: &GalaxyCatalog, r_outer: f64, pfree: Option<&[f64]>) -> Vec<Candidate> {
        catalog
            .find_neighbors(self.center.ra, self.center.dec, r_outer / self.mpc_scale)
            .into_iter()
            .filter_map(|n| {
                let galaxy = catalog.get(n.index);
                let theta_i = self.theta_i(galaxy);
                if theta_i <= 0.0 {
                    return None;
                }
                let (signal, b) = self.terms(galaxy)?;
                Some(Candidate {
                    index: n.index,
                    r: n.dist_deg * self.mpc_scale,
                    theta_i,
                    signal,
                    b,
                    pfree: pfree.map_or(1.0, |p| p[n.index]),
                })
            })
            .collect()
    }
}

fn member_term(ctx: &RunContext, c: &Candidate, lambda: f64, r_lambda: f64) -> MemberTerm {
    let u = ctx.nfw.sigma(c.r, r_lambda) * c.signal;
    let theta_r = radial_edge(c.r, r_lambda);
    let p = if u > 0.0 && lambda > 0.0 {
        lambda * u / (lambda * u + c.b)
    } else {
        0.0
    };
    MemberTerm {
        index: c.index,
        r: c.r,
        u,
        b: c.b,
        theta_i: c.theta_i,
        theta_r,
        p,
        pcol: p * c.theta_i,
        pmem: p * c.theta_i * theta_r * c.pfree,
    }
}

fn local<'a>(ctx: &'a RunContext, center: &'a Center, params: &'a RichnessParams) -> Local<'a> {
    let state = ctx.model.state_at(center.z);
    let mstar = state.mstar;
    Local {
        ctx,
        center,
        params,
        mpc_scale: ctx.cosmology.mpc_scale(center.z),
        mstar,
        maxmag: ctx.lumfilter.maxmag(mstar),
        limmag: ctx.depth.limmag(center.ra, center.dec),
        state,
    }
}

/// Membership terms of every galaxy within `r_outer` of a cluster whose
/// richness and radius are already known. Used to mask galaxies beyond
/// `r_lambda` during percolation.
pub fn membership_within(
    ctx: &RunContext,
    catalog: &GalaxyCatalog,
    center: &Center,
    params: &RichnessParams,
    lambda_obs: f64,
    r_lambda: f64,
    r_outer: f64,
) -> Vec<MemberTerm> {
    let local = local(ctx, center, params);
    local
        .candidates(catalog, r_outer, None)
        .iter()
        .filter(|c| c.r < r_outer)
        .map(|c| member_term(ctx, c, lambda_obs, r_lambda))
        .collect()
}

/// Measure the richness of `catalog` around `center`.
///
/// `pfree` gives, per catalog galaxy, the probability of not already
/// belonging to a richer cluster; `None` means every galaxy is free.
pub fn compute_richness(
    ctx: &RunContext,
    catalog: &GalaxyCatalog,
    center: &Center,
    params: &RichnessParams,
    pfree: Option<&[f64]>,
) -> RichnessResult {
    let local = local(ctx, center, params);
    let mpc_scale = local.mpc_scale;
    let mstar = local.mstar;

    let mut lambda = params.lambda_init.max(1.0);
    let mut r_lambda = params.radius.radius(lambda);
    let mut converged = false;
    let mut candidates = Vec::new();
    for _ in 0..params.niter.max(1) {
        candidates = local.candidates(
            catalog,
            r_lambda + EDGE_SEARCH_WIDTHS * RADIAL_EDGE_WIDTH,
            pfree,
        );
        let terms: Vec<(f64, f64, f64)> = candidates
            .iter()
            .map(|c| {
                (
                    ctx.nfw.sigma(c.r, r_lambda) * c.signal,
                    c.b,
                    c.theta_i * radial_edge(c.r, r_lambda) * c.pfree,
                )
            })
            .collect();
        lambda = solve_lambda(&terms);
        let r_new = params.radius.radius(lambda);
        let change = (r_new - r_lambda).abs() / r_lambda;
        r_lambda = r_new;
        if change < RADIUS_TOLERANCE {
            converged = true;
            break;
        }
    }

    // Final terms at the settled radius
    let mut lnlamlike = -lambda;
    let mut var = 0.0;
    let mut members = Vec::new();
    for c in &candidates {
        let term = member_term(ctx, c, lambda, r_lambda);
        let w = c.theta_i * term.theta_r * c.pfree;
        lnlamlike -= (1.0 - term.pmem.min(1.0 - 1e-10)).ln();
        var += w * term.p * (1.0 - term.p);
        if c.r < r_lambda {
            members.push(term);
        }
    }

    let stats = ctx.maskgals.aperture_stats(
        center.id,
        center.ra,
        center.dec,
        r_lambda,
        mpc_scale,
        mstar,
        &ctx.mask,
        &ctx.depth,
    );
    let corrected = if stats.scaleval > 0.0 {
        lambda / stats.scaleval
    } else {
        0.0
    };

    RichnessResult {
        lambda: corrected,
        lambda_obs: lambda,
        lambda_e: var.sqrt(),
        r_lambda,
        scaleval: stats.scaleval,
        maskfrac: stats.maskfrac,
        lnlamlike,
        converged,
        members,
    }
}

#[cfg(test)]
mod tests;
