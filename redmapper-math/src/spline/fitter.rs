//! Joint weighted least squares for sums of splines.

use nalgebra::{DMatrix, DVector};

use super::{Extrapolation, SplineBasis, SplineError, SplineModel};

/// One additive spline component of a joint fit.
#[derive(Debug, Clone)]
pub struct SplineTerm {
    basis: SplineBasis,
    extrapolation: Extrapolation,
}

impl SplineTerm {
    pub fn new(nodes: Vec<f64>, extrapolation: Extrapolation) -> Result<Self, SplineError> {
        Ok(Self {
            basis: SplineBasis::new(nodes)?,
            extrapolation,
        })
    }

    pub fn nodes(&self) -> &[f64] {
        self.basis.nodes()
    }
}

/// Fits `y_i ≈ Σ_t c_{t,i} S_t(x_i)` for spline terms `S_t`.
///
/// The multipliers `c_{t,i}` are supplied per term and per point, which
/// covers both plain spline fits (all ones) and offset-plus-slope models such
/// as `color ≈ mean(z) + slope(z) · (refmag - pivot(z))`.
#[derive(Debug, Clone)]
pub struct SplineFitter {
    terms: Vec<SplineTerm>,
}

impl SplineFitter {
    pub fn new(terms: Vec<SplineTerm>) -> Self {
        Self { terms }
    }

    fn n_params(&self) -> usize {
        self.terms.iter().map(|t| t.basis.len()).sum()
    }

    /// Solve for the node values of every term.
    ///
    /// # Arguments
    ///
    /// * `x` - Abscissa of each data point (redshift)
    /// * `multipliers` - One slice per term, each with one coefficient per point
    /// * `y` - Target values
    /// * `weights` - Non-negative weights (inverse variance); zero excludes a point
    ///
    /// # Returns
    ///
    /// One fitted [`SplineModel`] per term, in term order.
    ///
    /// # Errors
    ///
    /// * `SplineError::MismatchedLengths` - Input slices disagree in length
    /// * `SplineError::InsufficientData` - Fewer usable points than parameters, or
    ///   a node with no usable point between its neighbouring nodes
    /// * `SplineError::SolveFailed` - The SVD solve did not produce a solution
    pub fn fit(
        &self,
        x: &[f64],
        multipliers: &[&[f64]],
        y: &[f64],
        weights: &[f64],
    ) -> Result<Vec<SplineModel>, SplineError> {
        let npts = x.len();
        if y.len() != npts {
            return Err(SplineError::MismatchedLengths(npts, y.len()));
        }
        if weights.len() != npts {
            return Err(SplineError::MismatchedLengths(npts, weights.len()));
        }
        if multipliers.len() != self.terms.len() {
            return Err(SplineError::MismatchedLengths(
                self.terms.len(),
                multipliers.len(),
            ));
        }
        if let Some(bad) = multipliers.iter().find(|m| m.len() != npts) {
            return Err(SplineError::MismatchedLengths(npts, bad.len()));
        }

        let usable: Vec<usize> = (0..npts)
            .filter(|&i| weights[i] > 0.0 && x[i].is_finite() && y[i].is_finite())
            .collect();

        let nparams = self.n_params();
        if usable.len() < nparams {
            return Err(SplineError::InsufficientData(format!(
                "{} usable points for {} spline parameters",
                usable.len(),
                nparams
            )));
        }

        for (t, term) in self.terms.iter().enumerate() {
            self.check_support(term, x, multipliers[t], &usable)?;
        }

        let mut design = DMatrix::<f64>::zeros(usable.len(), nparams);
        let mut rhs = DVector::<f64>::zeros(usable.len());
        let mut row_weights = Vec::new();
        for (row, &i) in usable.iter().enumerate() {
            let sw = weights[i].sqrt();
            rhs[row] = y[i] * sw;
            let mut col = 0;
            for (t, term) in self.terms.iter().enumerate() {
                let nb = term.basis.len();
                row_weights.resize(nb, 0.0);
                term.basis.weights_into(x[i], term.extrapolation, &mut row_weights);
                let c = multipliers[t][i] * sw;
                for (k, w) in row_weights.iter().enumerate() {
                    design[(row, col + k)] = w * c;
                }
                col += nb;
            }
        }

        let svd = design.svd(true, true);
        let solution = svd
            .solve(&rhs, 1e-12)
            .map_err(|e| SplineError::SolveFailed(e.to_string()))?;

        let mut models = Vec::with_capacity(self.terms.len());
        let mut col = 0;
        for term in &self.terms {
            let nb = term.basis.len();
            let values: Vec<f64> = solution.rows(col, nb).iter().copied().collect();
            models.push(SplineModel::from_basis(
                term.basis.clone(),
                values,
                term.extrapolation,
            ));
            col += nb;
        }
        Ok(models)
    }

    /// Every node needs at least one usable point between its neighbours.
    fn check_support(
        &self,
        term: &SplineTerm,
        x: &[f64],
        multipliers: &[f64],
        usable: &[usize],
    ) -> Result<(), SplineError> {
        let nodes = term.basis.nodes();
        let n = nodes.len();
        for k in 0..n {
            let lo = if k == 0 { f64::NEG_INFINITY } else { nodes[k - 1] };
            let hi = if k + 1 == n { f64::INFINITY } else { nodes[k + 1] };
            let covered = usable
                .iter()
                .any(|&i| multipliers[i] != 0.0 && x[i] >= lo && x[i] <= hi);
            if !covered {
                return Err(SplineError::InsufficientData(format!(
                    "no data in support of node {:.4}",
                    nodes[k]
                )));
            }
        }
        Ok(())
    }
}
