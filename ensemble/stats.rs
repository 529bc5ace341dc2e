//! Weighted summary statistics shared by the combiner, the error estimator and the metrics.
//!
//! All functions ignore non-finite values and non-positive weights, and return `None` when
//! nothing usable remains. Weights whose length differs from the values leave nothing usable.

use itertools::Itertools;

/// Lower and upper one-sigma quantiles of a normal distribution.
pub const Q16: f64 = 0.158_655_253_931_457_05;
pub const Q84: f64 = 0.841_344_746_068_542_9;

fn usable<'a>(values: &'a [f64], weights: Option<&'a [f64]>) -> impl Iterator<Item = (f64, f64)> + 'a {
    let values = match weights {
        Some(w) if w.len() != values.len() => &values[..0],
        _ => values,
    };
    values
        .iter()
        .enumerate()
        .map(move |(i, &v)| (v, weights.map_or(1.0, |w| w[i])))
        .filter(|&(v, w)| v.is_finite() && w.is_finite() && w > 0.0)
}

/// Weighted mean and population variance.
pub fn mean_variance(values: &[f64], weights: Option<&[f64]>) -> Option<(f64, f64)> {
    let pairs: Vec<(f64, f64)> = usable(values, weights).collect();
    let total: f64 = pairs.iter().map(|&(_, w)| w).sum();
    if pairs.is_empty() || total <= 0.0 {
        return None;
    }
    // Shifting by the first value keeps a constant sample's mean exact.
    let shift = pairs[0].0;
    let mean = shift + pairs.iter().map(|&(v, w)| (v - shift) * w).sum::<f64>() / total;
    let variance = pairs
        .iter()
        .map(|&(v, w)| w * (v - mean) * (v - mean))
        .sum::<f64>()
        / total;
    Some((mean, variance.max(0.0)))
}

pub fn weighted_mean(values: &[f64], weights: Option<&[f64]>) -> Option<f64> {
    mean_variance(values, weights).map(|(m, _)| m)
}

pub fn weighted_std(values: &[f64], weights: Option<&[f64]>) -> Option<f64> {
    mean_variance(values, weights).map(|(_, v)| v.sqrt())
}

/// Kish effective sample size, `(Σw)² / Σw²`.
pub fn effective_count(values: &[f64], weights: Option<&[f64]>) -> f64 {
    let (sum, sum_sq) = usable(values, weights).fold((0.0, 0.0), |(s, s2), (_, w)| (s + w, s2 + w * w));
    if sum_sq > 0.0 { sum * sum / sum_sq } else { 0.0 }
}

/// Weighted quantiles for each `q` in `probabilities` (each in `[0, 1]`).
///
/// The quantile is the smallest value whose cumulative weight reaches `q` of the total.
pub fn weighted_quantiles(
    values: &[f64],
    weights: Option<&[f64]>,
    probabilities: &[f64],
) -> Option<Vec<f64>> {
    let sorted: Vec<(f64, f64)> = usable(values, weights)
        .sorted_by(|a, b| a.0.total_cmp(&b.0))
        .collect();
    let total: f64 = sorted.iter().map(|&(_, w)| w).sum();
    if sorted.is_empty() || total <= 0.0 {
        return None;
    }
    let quantiles = probabilities
        .iter()
        .map(|&q| {
            let target = q.clamp(0.0, 1.0) * total;
            let mut cumulative = 0.0;
            for &(v, w) in &sorted {
                cumulative += w;
                if cumulative >= target * (1.0 - 1e-12) {
                    return v;
                }
            }
            sorted[sorted.len() - 1].0
        })
        .collect();
    Some(quantiles)
}

pub fn weighted_median(values: &[f64], weights: Option<&[f64]>) -> Option<f64> {
    weighted_quantiles(values, weights, &[0.5]).map(|q| q[0])
}

/// Half-width of the central 68% interval, `|q84 - q16| / 2`.
pub fn sigma68(values: &[f64], weights: Option<&[f64]>) -> Option<f64> {
    weighted_quantiles(values, weights, &[Q16, Q84]).map(|q| 0.5 * (q[1] - q[0]).abs())
}

/// Weighted median absolute deviation from the weighted median.
pub fn median_absolute_deviation(values: &[f64], weights: Option<&[f64]>) -> Option<f64> {
    let median = weighted_median(values, weights)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    weighted_median(&deviations, weights)
}
