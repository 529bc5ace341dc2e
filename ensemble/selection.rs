//! # Member ranking and PDF weighting
//!
//! Members are scored on the evaluation catalog, ranked by a chosen objective and turned
//! into PDF weights proportional to `metric^(-power)`. Several powers may be tried; the one
//! whose combined PDFs are best calibrated on the evaluation catalog wins. Calibration is
//! measured by the probability integral transform: the PDF's cumulative mass at the true
//! value should be uniformly distributed, and the Kolmogorov-Smirnov distance to the uniform
//! distribution scores each candidate.

use crate::binning::PdfBinning;
use crate::combine::{CombineOptions, combine};
use crate::engine::PredictionTable;
use crate::metrics::{RegressionMetrics, member_metrics};
use itertools::Itertools;
use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// What ranks members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Absolute bias.
    Bias,
    #[default]
    Sigma68,
    /// Fraction of objects beyond `2 * sigma68`.
    OutlierFraction,
}

impl Objective {
    pub const ALL: [Objective; 3] = [Self::Bias, Self::Sigma68, Self::OutlierFraction];

    /// Lower is better.
    pub fn score(self, metrics: &RegressionMetrics) -> f64 {
        match self {
            Self::Bias => metrics.bias.abs(),
            Self::Sigma68 => metrics.sigma68,
            Self::OutlierFraction => metrics.outlier_fraction_2,
        }
    }
}

/// How members are weighted inside each object's PDF.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberWeighting {
    #[default]
    Uniform,
    Ranked {
        objective: Objective,
        powers: Vec<f64>,
        min_weight: f64,
        min_members: usize,
    },
}

/// Column indices from best to worst on `objective`; members without metrics come last.
pub fn rank_members(metrics: &[Option<RegressionMetrics>], objective: Objective) -> Vec<usize> {
    (0..metrics.len())
        .sorted_by(|&a, &b| {
            let score = |i: usize| metrics[i].map_or(f64::INFINITY, |m| objective.score(&m));
            score(a).total_cmp(&score(b)).then(a.cmp(&b))
        })
        .collect()
}

/// The best member on `objective` among those outside the worst `worst_fraction` of every
/// other objective. Falls back to the plain best when that filter leaves no one.
pub fn best_member(
    metrics: &[Option<RegressionMetrics>],
    objective: Objective,
    worst_fraction: f64,
) -> Option<usize> {
    let ranked = rank_members(metrics, objective);
    let scored: Vec<usize> = ranked.iter().copied().filter(|&i| metrics[i].is_some()).collect();
    if scored.is_empty() {
        return None;
    }
    let cut = ((1.0 - worst_fraction.clamp(0.0, 1.0)) * scored.len() as f64).ceil() as usize;
    let acceptable = |member: usize| {
        Objective::ALL
            .iter()
            .filter(|&&other| other != objective)
            .all(|&other| {
                rank_members(metrics, other)
                    .iter()
                    .position(|&i| i == member)
                    .is_some_and(|p| p < cut.max(1))
            })
    };
    scored
        .iter()
        .copied()
        .find(|&member| acceptable(member))
        .or(scored.first().copied())
}

/// Weights proportional to `score^(-power)`, normalized to sum to one. Members without
/// metrics get zero.
pub fn metric_weights(
    metrics: &[Option<RegressionMetrics>],
    objective: Objective,
    power: f64,
) -> Vec<f64> {
    let raw: Vec<f64> = metrics
        .iter()
        .map(|m| match m {
            Some(m) => objective.score(m).max(1e-12).powf(-power),
            None => 0.0,
        })
        .collect();
    normalized(raw)
}

fn normalized(mut weights: Vec<f64>) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|w| *w /= total);
    }
    weights
}

/// Drops the least significant member one at a time while its normalized weight is below
/// `min_weight` and more than `min_members` members remain, renormalizing after each drop.
pub fn clip_weights(weights: &[f64], min_weight: f64, min_members: usize) -> Vec<f64> {
    let mut weights = normalized(weights.to_vec());
    loop {
        let alive = weights.iter().filter(|&&w| w > 0.0).count();
        if alive <= min_members {
            break;
        }
        let smallest = weights
            .iter()
            .enumerate()
            .filter(|&(_, &w)| w > 0.0)
            .min_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)));
        match smallest {
            Some((i, &w)) if w < min_weight => {
                weights[i] = 0.0;
                weights = normalized(weights);
            }
            _ => break,
        }
    }
    weights
}

/// Kolmogorov-Smirnov distance between the weighted PIT values of `table` combined with
/// `member_weights` and the uniform distribution. Objects with invalid PDFs are skipped.
pub fn pit_ks_distance(
    table: &PredictionTable,
    member_weights: Option<&[f64]>,
    truth: ArrayView1<f64>,
    object_weights: ArrayView1<f64>,
    binning: &PdfBinning,
    options: &CombineOptions,
) -> Option<f64> {
    let pits: Vec<(f64, f64)> = (0..table.n_objects())
        .into_par_iter()
        .filter_map(|object| {
            let w = object_weights[object];
            if !(w > 0.0) {
                return None;
            }
            let pdf = combine(&table.ensemble_vector(object), member_weights, binning, options);
            pdf.valid
                .then(|| (pdf.cumulative_at(binning, truth[object]), w))
        })
        .collect();
    if pits.is_empty() {
        return None;
    }
    let sorted: Vec<(f64, f64)> = pits
        .into_iter()
        .sorted_by(|a, b| a.0.total_cmp(&b.0))
        .collect();
    let total: f64 = sorted.iter().map(|&(_, w)| w).sum();
    let mut cumulative = 0.0;
    let mut distance: f64 = 0.0;
    for &(pit, w) in &sorted {
        let before = cumulative / total;
        cumulative += w;
        let after = cumulative / total;
        distance = distance.max((before - pit).abs()).max((after - pit).abs());
    }
    Some(distance)
}

/// The member weights chosen for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberWeightChoice {
    /// `None` means uniform.
    pub weights: Option<Vec<f64>>,
    pub power: Option<f64>,
    pub ks_distance: Option<f64>,
    pub best_member: Option<usize>,
}

/// Everything needed to score candidate weightings on the evaluation catalog.
pub struct Evaluation<'a> {
    pub table: &'a PredictionTable,
    pub truth: ArrayView1<'a, f64>,
    pub weights: ArrayView1<'a, f64>,
    pub scale_by_target: bool,
}

pub fn choose_member_weights(
    weighting: &MemberWeighting,
    evaluation: &Evaluation<'_>,
    binning: &PdfBinning,
    options: &CombineOptions,
) -> MemberWeightChoice {
    let metrics = member_metrics(
        evaluation.table,
        evaluation.truth,
        evaluation.weights,
        evaluation.scale_by_target,
    );
    let (objective, powers, min_weight, min_members) = match weighting {
        MemberWeighting::Uniform => {
            return MemberWeightChoice {
                weights: None,
                power: None,
                ks_distance: None,
                best_member: best_member(&metrics, Objective::Sigma68, 0.25),
            };
        }
        MemberWeighting::Ranked {
            objective,
            powers,
            min_weight,
            min_members,
        } => (*objective, powers, *min_weight, *min_members),
    };

    let best = best_member(&metrics, objective, 0.25);
    let mut chosen: Option<(f64, Vec<f64>, f64)> = None;
    for &power in powers {
        let weights = clip_weights(&metric_weights(&metrics, objective, power), min_weight, min_members);
        let Some(ks) = pit_ks_distance(
            evaluation.table,
            Some(&weights),
            evaluation.truth,
            evaluation.weights,
            binning,
            options,
        ) else {
            continue;
        };
        log::debug!("Member weighting with power {power}: PIT KS distance {ks:.4}");
        if chosen.as_ref().is_none_or(|(_, _, best_ks)| ks < *best_ks) {
            chosen = Some((power, weights, ks));
        }
    }

    match chosen {
        Some((power, weights, ks)) => {
            log::info!(
                "Selected member weighting by {objective:?} with power {power} (PIT KS distance {ks:.4})"
            );
            MemberWeightChoice {
                weights: Some(weights),
                power: Some(power),
                ks_distance: Some(ks),
                best_member: best,
            }
        }
        None => {
            log::warn!("No member weighting could be scored on the evaluation catalog; using uniform weights");
            MemberWeightChoice {
                weights: None,
                power: None,
                ks_distance: None,
                best_member: best,
            }
        }
    }
}
