//! One-dimensional root finding and peak refinement.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("Root is not bracketed: f({0}) and f({1}) have the same sign")]
    NotBracketed(f64, f64),

    #[error("No convergence after {0} iterations")]
    NoConvergence(usize),
}

/// Vertex abscissa of the parabola through three points.
///
/// Returns `None` when the points are collinear or the parabola opens
/// upwards (no maximum).
///
/// # Examples
///
/// ```rust
/// use redmapper_math::optimize::parabola_vertex;
///
/// let f = |x: f64| -(x - 0.3) * (x - 0.3);
/// let xs = [0.1, 0.25, 0.5];
/// let peak = parabola_vertex(xs, [f(xs[0]), f(xs[1]), f(xs[2])]).unwrap();
/// assert!((peak - 0.3).abs() < 1e-12);
/// ```
pub fn parabola_vertex(x: [f64; 3], y: [f64; 3]) -> Option<f64> {
    let d1 = (y[1] - y[0]) / (x[1] - x[0]);
    let d2 = (y[2] - y[1]) / (x[2] - x[1]);
    let curvature = (d2 - d1) / (x[2] - x[0]);
    if !curvature.is_finite() || curvature >= 0.0 {
        return None;
    }
    // y = y0 + d1 (x - x0) + curvature (x - x0)(x - x1)
    let vertex = 0.5 * (x[0] + x[1]) - d1 / (2.0 * curvature);
    vertex.is_finite().then_some(vertex)
}

/// Second derivative of the parabola through three points.
pub fn parabola_curvature(x: [f64; 3], y: [f64; 3]) -> f64 {
    let d1 = (y[1] - y[0]) / (x[1] - x[0]);
    let d2 = (y[2] - y[1]) / (x[2] - x[1]);
    2.0 * (d2 - d1) / (x[2] - x[0])
}

/// Find a root of `f` in `[lo, hi]` by bisection.
///
/// # Errors
///
/// * `OptimizeError::NotBracketed` - `f(lo)` and `f(hi)` share a sign
/// * `OptimizeError::NoConvergence` - interval wider than `tol` after `max_iter` halvings
pub fn bisect<F>(f: F, lo: f64, hi: f64, tol: f64, max_iter: usize) -> Result<f64, OptimizeError>
where
    F: Fn(f64) -> f64,
{
    let (mut a, mut b) = (lo, hi);
    let mut fa = f(a);
    let fb = f(b);
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }
    if fa.signum() == fb.signum() {
        return Err(OptimizeError::NotBracketed(lo, hi));
    }

    for _ in 0..max_iter {
        let mid = 0.5 * (a + b);
        let fm = f(mid);
        if fm == 0.0 || (b - a).abs() < tol {
            return Ok(mid);
        }
        if fm.signum() == fa.signum() {
            a = mid;
            fa = fm;
        } else {
            b = mid;
        }
    }
    if (b - a).abs() < tol {
        Ok(0.5 * (a + b))
    } else {
        Err(OptimizeError::NoConvergence(max_iter))
    }
}

/// Index of the largest finite value.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parabola_vertex_off_centre() {
        let f = |x: f64| 2.0 - 3.0 * (x - 1.7) * (x - 1.7);
        let xs = [1.0, 1.5, 3.0];
        let v = parabola_vertex(xs, [f(xs[0]), f(xs[1]), f(xs[2])]).unwrap();
        assert_relative_eq!(v, 1.7, epsilon = 1e-12);
        assert_relative_eq!(
            parabola_curvature(xs, [f(xs[0]), f(xs[1]), f(xs[2])]),
            -6.0,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_parabola_without_maximum() {
        assert!(parabola_vertex([0.0, 1.0, 2.0], [0.0, 1.0, 2.0]).is_none());
        assert!(parabola_vertex([0.0, 1.0, 2.0], [1.0, 0.0, 1.0]).is_none());
    }

    #[test]
    fn test_bisect_finds_root() {
        let root = bisect(|x| x * x - 2.0, 0.0, 2.0, 1e-10, 200).unwrap();
        assert_relative_eq!(root, std::f64::consts::SQRT_2, epsilon = 1e-9);
    }

    #[test]
    fn test_bisect_not_bracketed() {
        assert!(matches!(
            bisect(|x| x * x + 1.0, -1.0, 1.0, 1e-8, 50),
            Err(OptimizeError::NotBracketed(_, _))
        ));
    }

    #[test]
    fn test_argmax_skips_nan() {
        assert_eq!(argmax(&[1.0, f64::NAN, 3.0, 2.0]), Some(2));
        assert_eq!(argmax(&[f64::NAN]), None);
        assert_eq!(argmax(&[]), None);
    }
}
