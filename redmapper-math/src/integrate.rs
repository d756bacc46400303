//! Trapezoidal integration

use thiserror::Error;

/// Errors that can occur during trapezoidal integration
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntegrateError {
    #[error("Insufficient points for integration, need at least 2 points")]
    InsufficientPoints,

    #[error("Points must be in ascending order")]
    NotAscending,

    #[error("Sample vectors must have the same length")]
    MismatchedLengths,
}

fn check_grid(xs: &[f64]) -> Result<(), IntegrateError> {
    if xs.len() < 2 {
        return Err(IntegrateError::InsufficientPoints);
    }
    if xs.windows(2).any(|w| w[1] <= w[0]) {
        return Err(IntegrateError::NotAscending);
    }
    Ok(())
}

/// Integrate `f` over the grid `xs` with the composite trapezoid rule.
///
/// # Arguments
///
/// * `xs` - Abscissae in strictly ascending order
/// * `f` - The function to integrate
pub fn trapezoid<F>(xs: &[f64], f: F) -> Result<f64, IntegrateError>
where
    F: Fn(f64) -> f64,
{
    check_grid(xs)?;
    let ys: Vec<f64> = xs.iter().map(|&x| f(x)).collect();
    trapezoid_samples(xs, &ys)
}

/// Trapezoid rule over already sampled values.
pub fn trapezoid_samples(xs: &[f64], ys: &[f64]) -> Result<f64, IntegrateError> {
    if xs.len() != ys.len() {
        return Err(IntegrateError::MismatchedLengths);
    }
    check_grid(xs)?;
    Ok(xs
        .windows(2)
        .zip(ys.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum())
}

/// Running integral: element `i` is the integral from `xs[0]` to `xs[i]`.
pub fn cumulative_trapezoid(xs: &[f64], ys: &[f64]) -> Result<Vec<f64>, IntegrateError> {
    if xs.len() != ys.len() {
        return Err(IntegrateError::MismatchedLengths);
    }
    check_grid(xs)?;
    let mut out = Vec::with_capacity(xs.len());
    let mut total = 0.0;
    out.push(total);
    for i in 1..xs.len() {
        total += (xs[i] - xs[i - 1]) * (ys[i] + ys[i - 1]) / 2.0;
        out.push(total);
    }
    Ok(out)
}

/// `n` evenly spaced points from `lo` to `hi` inclusive.
pub fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![lo],
        _ => {
            let step = (hi - lo) / (n - 1) as f64;
            (0..n).map(|i| lo + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_trapezoid() {
        // (1-0)(0+1)/2 + (2-1)(1+4)/2 + (3-2)(4+9)/2 = 9.5
        let result = trapezoid(&[0.0, 1.0, 2.0, 3.0], |x| x * x).unwrap();
        assert_relative_eq!(result, 9.5, epsilon = 1e-12);
    }

    #[test]
    fn test_fine_grid_converges() {
        let xs = linspace(0.0, std::f64::consts::PI, 2001);
        let result = trapezoid(&xs, f64::sin).unwrap();
        assert_relative_eq!(result, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_cumulative_matches_total() {
        let xs = linspace(0.0, 1.0, 11);
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * x * x).collect();
        let running = cumulative_trapezoid(&xs, &ys).unwrap();
        assert_eq!(running.len(), xs.len());
        assert_eq!(running[0], 0.0);
        assert_relative_eq!(
            running[10],
            trapezoid_samples(&xs, &ys).unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_insufficient_points() {
        assert!(matches!(
            trapezoid(&[1.0], |x| x),
            Err(IntegrateError::InsufficientPoints)
        ));
    }

    #[test]
    fn test_not_ascending() {
        assert!(matches!(
            trapezoid(&[0.0, 2.0, 1.0, 3.0], |x| x),
            Err(IntegrateError::NotAscending)
        ));
    }
}
