//! Regression quality of ensemble members on a labeled catalog.
//!
//! Metrics are computed on `delta = prediction - truth`, optionally divided by `1 + truth`,
//! and weighted by the objects' weights, which is how evaluation-mode density weights reach
//! the statistics.

use crate::engine::PredictionTable;
use crate::stats;
use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Weighted mean of delta.
    pub bias: f64,
    /// Weighted standard deviation of delta.
    pub std_dev: f64,
    /// Half-width of the central 68% interval of delta.
    pub sigma68: f64,
    /// Weighted median absolute deviation of delta.
    pub mad: f64,
    /// Weighted fraction of objects further than `2 * sigma68` from the median delta.
    pub outlier_fraction_2: f64,
    /// Same with `3 * sigma68`.
    pub outlier_fraction_3: f64,
    /// Objects with a valid prediction and positive weight.
    pub n_objects: usize,
}

/// Metrics of one prediction column. `None` when no object carries a valid prediction.
pub fn regression_metrics(
    predictions: ArrayView1<f64>,
    truth: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    scale_by_target: bool,
) -> Option<RegressionMetrics> {
    let mut deltas = Vec::with_capacity(predictions.len());
    let mut used_weights = Vec::with_capacity(predictions.len());
    for ((&p, &t), &w) in predictions.iter().zip(truth).zip(weights) {
        if !p.is_finite() || !(w > 0.0) {
            continue;
        }
        let delta = if scale_by_target { (p - t) / (1.0 + t) } else { p - t };
        if delta.is_finite() {
            deltas.push(delta);
            used_weights.push(w);
        }
    }
    if deltas.is_empty() {
        return None;
    }

    let w = Some(used_weights.as_slice());
    let (bias, variance) = stats::mean_variance(&deltas, w)?;
    let median = stats::weighted_median(&deltas, w)?;
    let sigma68 = stats::sigma68(&deltas, w)?;
    let mad = stats::median_absolute_deviation(&deltas, w)?;

    let total: f64 = used_weights.iter().sum();
    let beyond = |n: f64| {
        deltas
            .iter()
            .zip(&used_weights)
            .filter(|&(d, _)| (d - median).abs() > n * sigma68)
            .map(|(_, w)| w)
            .sum::<f64>()
            / total
    };

    Some(RegressionMetrics {
        bias,
        std_dev: variance.sqrt(),
        sigma68,
        mad,
        outlier_fraction_2: beyond(2.0),
        outlier_fraction_3: beyond(3.0),
        n_objects: deltas.len(),
    })
}

/// Metrics of every member column of a table, in column order.
pub fn member_metrics(
    table: &PredictionTable,
    truth: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    scale_by_target: bool,
) -> Vec<Option<RegressionMetrics>> {
    (0..table.n_members())
        .into_par_iter()
        .map(|column| regression_metrics(table.member_column(column), truth, weights, scale_by_target))
        .collect()
}
