//! Natural cubic splines over redshift nodes.
//!
//! Every calibrated quantity in the cluster finder (pivot magnitude, mean
//! colors, color slopes, intrinsic scatter, zred and z_lambda corrections)
//! is a smooth function of redshift represented by its values at a small set
//! of nodes. A natural cubic spline through those node values is linear in
//! the values, so a spline can be written as a weighted sum of node values:
//!
//! ```text
//! S(x) = Σ_k w_k(x) · y_k
//! ```
//!
//! The weights `w_k(x)` depend only on the node positions, which lets the
//! fitter solve for node values with an ordinary weighted least-squares
//! problem. Several splines can be fit jointly, each multiplied by a per-point
//! coefficient (for example an offset spline plus a slope spline multiplying
//! `refmag - pivot`).

mod fitter;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fitter::{SplineFitter, SplineTerm};

/// Errors raised while building or fitting splines
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SplineError {
    #[error("Spline needs at least one node")]
    NoNodes,

    #[error("Spline nodes must be strictly increasing")]
    UnsortedNodes,

    #[error("Input vectors must have the same length ({0} vs {1})")]
    MismatchedLengths(usize, usize),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Least-squares solve failed: {0}")]
    SolveFailed(String),
}

/// Behaviour of a spline outside its node range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Extrapolation {
    /// Continue with the end slope of the spline
    #[default]
    Linear,
    /// Hold the end value
    Constant,
}

/// Build evenly spaced nodes covering `range`.
///
/// The upper end is `maxnode` when it is non-negative and inside the range,
/// otherwise `range[1]`. Nodes start at `range[0]` and step by (close to)
/// `nodesize`; the spacing is shrunk slightly so the last node lands exactly
/// on the upper end.
///
/// # Examples
///
/// ```rust
/// use redmapper_math::spline::make_nodes;
///
/// let nodes = make_nodes([0.1, 0.5], 0.1, -1.0);
/// assert_eq!(nodes.len(), 5);
/// assert!((nodes[4] - 0.5).abs() < 1e-12);
///
/// let truncated = make_nodes([0.1, 0.5], 0.1, 0.3);
/// assert_eq!(truncated.len(), 3);
/// ```
pub fn make_nodes(range: [f64; 2], nodesize: f64, maxnode: f64) -> Vec<f64> {
    let lo = range[0];
    let hi = if maxnode >= 0.0 && maxnode < range[1] && maxnode > lo {
        maxnode
    } else {
        range[1]
    };

    if hi <= lo || nodesize <= 0.0 {
        return vec![lo];
    }

    let nstep = ((hi - lo) / nodesize - 1e-6).ceil().max(1.0) as usize;
    let step = (hi - lo) / nstep as f64;
    (0..=nstep).map(|i| lo + step * i as f64).collect()
}

/// Node layout plus the linear operator mapping node values to the natural
/// spline's second derivatives.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineBasis {
    nodes: Vec<f64>,
    /// `M = second_deriv_op * y`, zero first and last rows
    second_deriv_op: DMatrix<f64>,
}

impl SplineBasis {
    /// Build the basis for strictly increasing `nodes`.
    pub fn new(nodes: Vec<f64>) -> Result<Self, SplineError> {
        let n = nodes.len();
        if n == 0 {
            return Err(SplineError::NoNodes);
        }
        if nodes.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SplineError::UnsortedNodes);
        }

        let mut op = DMatrix::<f64>::zeros(n, n);
        if n >= 3 {
            let ni = n - 2;
            let h: Vec<f64> = nodes.windows(2).map(|w| w[1] - w[0]).collect();

            let mut tri = DMatrix::<f64>::zeros(ni, ni);
            let mut rhs = DMatrix::<f64>::zeros(ni, n);
            for row in 0..ni {
                let i = row + 1;
                tri[(row, row)] = 2.0 * (h[i - 1] + h[i]);
                if row > 0 {
                    tri[(row, row - 1)] = h[i - 1];
                }
                if row + 1 < ni {
                    tri[(row, row + 1)] = h[i];
                }
                rhs[(row, i - 1)] += 6.0 / h[i - 1];
                rhs[(row, i)] -= 6.0 / h[i - 1] + 6.0 / h[i];
                rhs[(row, i + 1)] += 6.0 / h[i];
            }

            // Diagonally dominant and symmetric, so Cholesky always succeeds
            // for strictly increasing nodes.
            let chol = tri.cholesky().ok_or_else(|| {
                SplineError::SolveFailed("spline system not positive definite".to_string())
            })?;
            let interior = chol.solve(&rhs);
            op.view_mut((1, 0), (ni, n)).copy_from(&interior);
        }

        Ok(Self {
            nodes,
            second_deriv_op: op,
        })
    }

    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Second derivatives of the natural spline through `values`.
    fn second_derivatives(&self, values: &[f64]) -> Vec<f64> {
        let y = DVector::from_column_slice(values);
        (&self.second_deriv_op * y).iter().copied().collect()
    }

    /// Index of the interval `[x_k, x_{k+1}]` used for `x` (clamped to the
    /// first/last interval).
    fn interval(&self, x: f64) -> usize {
        let n = self.nodes.len();
        let k = self.nodes.partition_point(|&node| node <= x);
        k.saturating_sub(1).min(n.saturating_sub(2))
    }

    /// Weights `w_k(x)` such that `S(x) = Σ w_k y_k`, written into `out`.
    pub fn weights_into(&self, x: f64, extrapolation: Extrapolation, out: &mut [f64]) {
        let n = self.nodes.len();
        out.iter_mut().for_each(|w| *w = 0.0);
        if n == 1 {
            out[0] = 1.0;
            return;
        }

        let first = self.nodes[0];
        let last = self.nodes[n - 1];
        let op = &self.second_deriv_op;

        if x < first || x > last {
            let (end, anchor) = if x < first { (0, first) } else { (n - 1, last) };
            out[end] = 1.0;
            if extrapolation == Extrapolation::Constant {
                return;
            }
            if x < first {
                let h = self.nodes[1] - self.nodes[0];
                out[0] -= (x - anchor) / h;
                out[1] += (x - anchor) / h;
                for (j, w) in out.iter_mut().enumerate() {
                    *w -= (x - anchor) * h / 6.0 * (2.0 * op[(0, j)] + op[(1, j)]);
                }
            } else {
                let h = self.nodes[n - 1] - self.nodes[n - 2];
                out[n - 2] -= (x - anchor) / h;
                out[n - 1] += (x - anchor) / h;
                for (j, w) in out.iter_mut().enumerate() {
                    *w += (x - anchor) * h / 6.0 * (op[(n - 2, j)] + 2.0 * op[(n - 1, j)]);
                }
            }
            return;
        }

        let k = self.interval(x);
        let h = self.nodes[k + 1] - self.nodes[k];
        let a = (self.nodes[k + 1] - x) / h;
        let b = 1.0 - a;
        let ca = (a * a * a - a) * h * h / 6.0;
        let cb = (b * b * b - b) * h * h / 6.0;
        out[k] += a;
        out[k + 1] += b;
        for (j, w) in out.iter_mut().enumerate() {
            *w += ca * op[(k, j)] + cb * op[(k + 1, j)];
        }
    }

    /// Allocating variant of [`SplineBasis::weights_into`].
    pub fn weights(&self, x: f64, extrapolation: Extrapolation) -> Vec<f64> {
        let mut out = vec![0.0; self.nodes.len()];
        self.weights_into(x, extrapolation, &mut out);
        out
    }
}

#[derive(Serialize, Deserialize)]
struct SplineRepr {
    nodes: Vec<f64>,
    values: Vec<f64>,
    #[serde(default)]
    extrapolation: Extrapolation,
}

/// A natural cubic spline with its node values.
///
/// Serialises as `{nodes, values, extrapolation}`; the second derivatives are
/// rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SplineRepr", into = "SplineRepr")]
pub struct SplineModel {
    basis: SplineBasis,
    values: Vec<f64>,
    second_derivs: Vec<f64>,
    extrapolation: Extrapolation,
}

impl TryFrom<SplineRepr> for SplineModel {
    type Error = SplineError;

    fn try_from(repr: SplineRepr) -> Result<Self, Self::Error> {
        SplineModel::new(repr.nodes, repr.values, repr.extrapolation)
    }
}

impl From<SplineModel> for SplineRepr {
    fn from(model: SplineModel) -> Self {
        SplineRepr {
            nodes: model.basis.nodes,
            values: model.values,
            extrapolation: model.extrapolation,
        }
    }
}

impl SplineModel {
    /// Spline through `values` at `nodes`.
    ///
    /// # Errors
    ///
    /// * `SplineError::NoNodes` / `SplineError::UnsortedNodes` for a bad node layout
    /// * `SplineError::MismatchedLengths` when `values` does not match `nodes`
    pub fn new(
        nodes: Vec<f64>,
        values: Vec<f64>,
        extrapolation: Extrapolation,
    ) -> Result<Self, SplineError> {
        if nodes.len() != values.len() {
            return Err(SplineError::MismatchedLengths(nodes.len(), values.len()));
        }
        let basis = SplineBasis::new(nodes)?;
        Ok(Self::from_basis(basis, values, extrapolation))
    }

    pub(crate) fn from_basis(
        basis: SplineBasis,
        values: Vec<f64>,
        extrapolation: Extrapolation,
    ) -> Self {
        let second_derivs = basis.second_derivatives(&values);
        Self {
            basis,
            values,
            second_derivs,
            extrapolation,
        }
    }

    /// Spline that is `value` everywhere.
    pub fn constant(nodes: Vec<f64>, value: f64) -> Result<Self, SplineError> {
        let values = vec![value; nodes.len()];
        Self::new(nodes, values, Extrapolation::Constant)
    }

    /// Fit a single spline to weighted data.
    ///
    /// Shorthand for a one-term [`SplineFitter`] with unit multipliers.
    ///
    /// # Errors
    ///
    /// `SplineError::InsufficientData` when there are fewer points than nodes
    /// or a node has no data within its support.
    pub fn fit(
        nodes: Vec<f64>,
        x: &[f64],
        y: &[f64],
        weights: &[f64],
        extrapolation: Extrapolation,
    ) -> Result<Self, SplineError> {
        let fitter = SplineFitter::new(vec![SplineTerm::new(nodes, extrapolation)?]);
        let ones = vec![1.0; x.len()];
        let mut models = fitter.fit(x, &[ones.as_slice()], y, weights)?;
        models
            .pop()
            .ok_or_else(|| SplineError::SolveFailed("fitter returned no splines".to_string()))
    }

    pub fn nodes(&self) -> &[f64] {
        self.basis.nodes()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn extrapolation(&self) -> Extrapolation {
        self.extrapolation
    }

    pub fn basis(&self) -> &SplineBasis {
        &self.basis
    }

    /// Evaluate the spline at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        let nodes = self.basis.nodes();
        let n = nodes.len();
        let y = &self.values;
        let m = &self.second_derivs;
        if n == 1 {
            return y[0];
        }

        if x < nodes[0] {
            return match self.extrapolation {
                Extrapolation::Constant => y[0],
                Extrapolation::Linear => {
                    let h = nodes[1] - nodes[0];
                    let slope = (y[1] - y[0]) / h - h * (2.0 * m[0] + m[1]) / 6.0;
                    y[0] + slope * (x - nodes[0])
                }
            };
        }
        if x > nodes[n - 1] {
            return match self.extrapolation {
                Extrapolation::Constant => y[n - 1],
                Extrapolation::Linear => {
                    let h = nodes[n - 1] - nodes[n - 2];
                    let slope = (y[n - 1] - y[n - 2]) / h + h * (m[n - 2] + 2.0 * m[n - 1]) / 6.0;
                    y[n - 1] + slope * (x - nodes[n - 1])
                }
            };
        }

        let k = self.basis.interval(x);
        let h = nodes[k + 1] - nodes[k];
        let a = (nodes[k + 1] - x) / h;
        let b = 1.0 - a;
        a * y[k]
            + b * y[k + 1]
            + ((a * a * a - a) * m[k] + (b * b * b - b) * m[k + 1]) * h * h / 6.0
    }

    /// Evaluate at every point of `xs`.
    pub fn evaluate_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.evaluate(x)).collect()
    }
}
