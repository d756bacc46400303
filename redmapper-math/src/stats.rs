//! Robust summary statistics.

/// Median of `values`, ignoring NaNs. `None` for an empty input.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    Some(if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    })
}

/// Weighted median: the smallest value whose cumulative weight reaches half
/// the total weight.
pub fn weighted_median(values: &[f64], weights: &[f64]) -> Option<f64> {
    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .zip(weights.iter())
        .filter(|(v, w)| !v.is_nan() && **w > 0.0)
        .map(|(&v, &w)| (v, w))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total: f64 = pairs.iter().map(|p| p.1).sum();
    let mut running = 0.0;
    for (v, w) in &pairs {
        running += w;
        if running >= 0.5 * total {
            return Some(*v);
        }
    }
    pairs.last().map(|p| p.0)
}

/// Median absolute deviation scaled to a Gaussian sigma (× 1.4826).
pub fn mad_sigma(values: &[f64]) -> Option<f64> {
    let med = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations).map(|m| 1.4826 * m)
}

/// Weighted mean and weighted standard deviation.
pub fn weighted_mean_sigma(values: &[f64], weights: &[f64]) -> Option<(f64, f64)> {
    let wsum: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if wsum <= 0.0 {
        return None;
    }
    let mean = values
        .iter()
        .zip(weights.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(v, w)| v * w)
        .sum::<f64>()
        / wsum;
    let var = values
        .iter()
        .zip(weights.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(v, w)| w * (v - mean) * (v - mean))
        .sum::<f64>()
        / wsum;
    Some((mean, var.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_weighted_median_follows_weight() {
        let v = [1.0, 2.0, 3.0];
        assert_eq!(weighted_median(&v, &[1.0, 1.0, 1.0]), Some(2.0));
        assert_eq!(weighted_median(&v, &[0.1, 0.1, 5.0]), Some(3.0));
        assert_eq!(weighted_median(&v, &[0.0, 0.0, 0.0]), None);
    }

    #[test]
    fn test_mad_sigma_ignores_outlier() {
        let values = [-1.0, -0.5, 0.0, 0.5, 1.0, 100.0];
        let sigma = mad_sigma(&values).unwrap();
        assert!(sigma < 2.0);
    }

    #[test]
    fn test_weighted_mean_sigma() {
        let (mean, sigma) = weighted_mean_sigma(&[1.0, 3.0], &[1.0, 1.0]).unwrap();
        assert_relative_eq!(mean, 2.0);
        assert_relative_eq!(sigma, 1.0);
    }
}
