//! Tabulated functions with linear interpolation.
//!
//! Used for quantities that are expensive to evaluate directly but smooth
//! enough to tabulate once: comoving distance against redshift, inverse
//! cumulative radial profiles for Monte-Carlo sampling, and similar lookups.

use thiserror::Error;

/// Errors that can occur when building or querying a table.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    #[error("Value {0} is out of bounds for interpolation range [{1}, {2}]")]
    OutOfBounds(f64, f64, f64),
    #[error("Table needs at least 2 points")]
    InsufficientData,
    #[error("Input vectors must have the same length")]
    MismatchedLengths,
    #[error("X values must be strictly increasing")]
    UnsortedData,
}

/// A piecewise-linear function defined by sorted sample points.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearTable {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl LinearTable {
    /// # Errors
    ///
    /// * `InterpError::MismatchedLengths` - xs and ys differ in length
    /// * `InterpError::InsufficientData` - fewer than two samples
    /// * `InterpError::UnsortedData` - xs not strictly increasing
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Result<Self, InterpError> {
        if xs.len() != ys.len() {
            return Err(InterpError::MismatchedLengths);
        }
        if xs.len() < 2 {
            return Err(InterpError::InsufficientData);
        }
        if xs.windows(2).any(|w| w[1] <= w[0]) {
            return Err(InterpError::UnsortedData);
        }
        Ok(Self { xs, ys })
    }

    /// Tabulate `f` on `n` evenly spaced points over `[lo, hi]`.
    pub fn from_fn<F>(lo: f64, hi: f64, n: usize, f: F) -> Result<Self, InterpError>
    where
        F: Fn(f64) -> f64,
    {
        if n < 2 {
            return Err(InterpError::InsufficientData);
        }
        let step = (hi - lo) / (n - 1) as f64;
        let xs: Vec<f64> = (0..n).map(|i| lo + step * i as f64).collect();
        let ys = xs.iter().map(|&x| f(x)).collect();
        Self::new(xs, ys)
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    /// Table with the roles of x and y swapped, for inverting a monotone
    /// increasing function.
    pub fn inverted(&self) -> Result<Self, InterpError> {
        Self::new(self.ys.clone(), self.xs.clone())
    }

    fn segment(&self, x: f64) -> usize {
        let k = self.xs.partition_point(|&v| v <= x);
        k.saturating_sub(1).min(self.xs.len() - 2)
    }

    fn eval_segment(&self, k: usize, x: f64) -> f64 {
        let (x1, x2) = (self.xs[k], self.xs[k + 1]);
        let (y1, y2) = (self.ys[k], self.ys[k + 1]);
        y1 + (x - x1) / (x2 - x1) * (y2 - y1)
    }

    /// Interpolated value; errors outside the tabulated range.
    pub fn eval(&self, x: f64) -> Result<f64, InterpError> {
        let lo = self.xs[0];
        let hi = self.xs[self.xs.len() - 1];
        if !(lo..=hi).contains(&x) {
            return Err(InterpError::OutOfBounds(x, lo, hi));
        }
        Ok(self.eval_segment(self.segment(x), x))
    }

    /// Interpolated value, holding the end values outside the range.
    pub fn eval_clamped(&self, x: f64) -> f64 {
        let lo = self.xs[0];
        let hi = self.xs[self.xs.len() - 1];
        let xc = x.clamp(lo, hi);
        self.eval_segment(self.segment(xc), xc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_eval_between_and_at_samples() {
        let table = LinearTable::new(vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 40.0]).unwrap();
        assert_eq!(table.eval(2.0).unwrap(), 20.0);
        assert_relative_eq!(table.eval(2.5).unwrap(), 30.0);
        assert_relative_eq!(table.eval(3.0).unwrap(), 40.0);
    }

    #[test]
    fn test_out_of_bounds() {
        let table = LinearTable::new(vec![1.0, 2.0], vec![0.0, 1.0]).unwrap();
        assert!(matches!(
            table.eval(0.5),
            Err(InterpError::OutOfBounds(_, _, _))
        ));
        assert_eq!(table.eval_clamped(0.5), 0.0);
        assert_eq!(table.eval_clamped(9.0), 1.0);
    }

    #[test]
    fn test_construction_errors() {
        assert_eq!(
            LinearTable::new(vec![1.0], vec![1.0]).unwrap_err(),
            InterpError::InsufficientData
        );
        assert_eq!(
            LinearTable::new(vec![1.0, 2.0], vec![1.0]).unwrap_err(),
            InterpError::MismatchedLengths
        );
        assert_eq!(
            LinearTable::new(vec![2.0, 1.0], vec![1.0, 2.0]).unwrap_err(),
            InterpError::UnsortedData
        );
    }

    #[test]
    fn test_inverted_table() {
        let table = LinearTable::from_fn(0.0, 2.0, 201, |x| x * x + x).unwrap();
        let inverse = table.inverted().unwrap();
        assert_relative_eq!(inverse.eval(2.0).unwrap(), 1.0, epsilon = 1e-3);
    }
}
