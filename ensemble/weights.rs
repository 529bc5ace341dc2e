//! # Density-Ratio Weights
//!
//! Reweights a labeled catalog so that its density in feature space follows the density of
//! the application catalog. For every labeled object the local density of both catalogs is
//! estimated from nearest neighbours and the weight is their ratio,
//! `density_application(x) / density_labeled(x)`.
//!
//! Both densities are normalized by the total weight of their catalog, so the ratio does not
//! depend on how many objects either catalog holds. Raw ratios are clamped to a configured
//! range. The weight of an object is its prior weight times its clamped ratio, renormalized
//! to a mean of one over the labeled objects that take part.
//!
//! Repeated passes feed the weights of one pass back in as the prior of the next. The
//! labeled density of a later pass is measured with the earlier weights, so once those
//! weights match the application density the ratios settle around one and the weights stop
//! moving.
//!
//! Both indices share the application catalog's standardization, so the two neighbour
//! distances of an object are measured in the same units.

use crate::execute::{ExecutionControl, Interrupt};
use crate::index::{BuildOptions, FeatureSpaceIndex, FeatureSubspace, IndexError, MetricSpec, Neighbor};
use crate::progress::{NoopProgress, ProgressObserver, RunStage};
use crate::types::{Catalog, CatalogError};
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeightError {
    #[error(
        "Density weights need k={k} neighbours, but catalog '{catalog}' only offers {available} usable objects."
    )]
    InsufficientNeighbors {
        catalog: String,
        k: usize,
        available: usize,
    },

    #[error("Density-ratio clamp bounds [{min}, {max}] are invalid.")]
    InvalidClamp { min: f64, max: f64 },

    #[error("Feature-space index error during density weighting: {0}")]
    Index(#[from] IndexError),

    #[error("Could not attach density weights: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Density weighting exceeded the run deadline.")]
    Timeout,

    #[error("Density weighting was aborted.")]
    Aborted,
}

impl From<Interrupt> for WeightError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Aborted => Self::Aborted,
            Interrupt::TimedOut => Self::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DensityEstimator {
    /// `(W_k / W_total) / r_k^d` in each catalog.
    #[default]
    KthNeighborVolume,
    /// Weighted neighbour counts of both catalogs inside the longer of the two k-th
    /// neighbour distances, so each side counts at least k objects. The volume cancels in
    /// the ratio.
    EqualVolumeCount,
}

/// Where the weights are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightUse {
    /// Passed to the model engine as training-sample weights.
    #[default]
    Training,
    /// Used only by metrics and summary statistics.
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityWeightOptions {
    pub k: usize,
    pub subspace: FeatureSubspace,
    pub metric: MetricSpec,
    pub estimator: DensityEstimator,
    pub clamp_min: f64,
    pub clamp_max: f64,
    pub passes: usize,
    pub use_mode: WeightUse,
}

impl Default for DensityWeightOptions {
    fn default() -> Self {
        Self {
            k: 20,
            subspace: FeatureSubspace::All,
            metric: MetricSpec::default(),
            estimator: DensityEstimator::KthNeighborVolume,
            clamp_min: 0.05,
            clamp_max: 20.0,
            passes: 1,
            use_mode: WeightUse::Training,
        }
    }
}

impl DensityWeightOptions {
    pub fn validate(&self) -> Result<(), WeightError> {
        let ok = self.clamp_min.is_finite()
            && self.clamp_max.is_finite()
            && self.clamp_min >= 0.0
            && self.clamp_min < self.clamp_max;
        if !ok {
            return Err(WeightError::InvalidClamp {
                min: self.clamp_min,
                max: self.clamp_max,
            });
        }
        Ok(())
    }
}

/// Confidence attached to one object's weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightFlag {
    Nominal,
    /// The raw ratio hit a clamp bound.
    Clamped,
    /// A k-th neighbour distance was zero; the weight defaulted to one.
    ZeroDistance,
    /// Zero prior weight; the object takes no part.
    Excluded,
}

/// Weights of one labeled catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityWeights {
    /// `prior * raw`, normalized to mean one over non-excluded objects.
    pub weights: Array1<f64>,
    /// Clamped ratios of the last pass.
    pub raw: Array1<f64>,
    pub flags: Vec<WeightFlag>,
    pub passes: usize,
}

impl DensityWeights {
    pub fn count(&self, flag: WeightFlag) -> usize {
        self.flags.iter().filter(|&&f| f == flag).count()
    }

    /// The labeled catalog carrying these weights.
    pub fn apply(&self, labeled: &Catalog) -> Result<Catalog, WeightError> {
        Ok(labeled.reweighted(self.weights.clone())?)
    }
}

pub fn compute_density_weights(
    labeled: &Catalog,
    application: &Catalog,
    options: &DensityWeightOptions,
    control: &ExecutionControl,
) -> Result<DensityWeights, WeightError> {
    compute_density_weights_observed(labeled, application, options, control, &NoopProgress)
}

pub fn compute_density_weights_observed(
    labeled: &Catalog,
    application: &Catalog,
    options: &DensityWeightOptions,
    control: &ExecutionControl,
    observer: &dyn ProgressObserver,
) -> Result<DensityWeights, WeightError> {
    options.validate()?;
    let passes = options.passes.max(1);
    let mut current = labeled.weights().to_owned();
    let mut result = None;
    for pass in 1..=passes {
        let pass_result = single_pass(labeled, current.view(), application, options, control, observer)?;
        log::info!(
            "Density weights pass {}/{} for '{}' against '{}': {} clamped, {} zero-distance, {} excluded",
            pass,
            passes,
            labeled.name(),
            application.name(),
            pass_result.count(WeightFlag::Clamped),
            pass_result.count(WeightFlag::ZeroDistance),
            pass_result.count(WeightFlag::Excluded)
        );
        current = pass_result.weights.clone();
        result = Some(DensityWeights {
            passes: pass,
            ..pass_result
        });
    }
    result.ok_or(WeightError::InsufficientNeighbors {
        catalog: labeled.name().to_string(),
        k: options.k,
        available: 0,
    })
}

struct PassContext<'a> {
    application: &'a Catalog,
    app_index: FeatureSpaceIndex,
    lab_index: FeatureSpaceIndex,
    prior: ArrayView1<'a, f64>,
    app_total: f64,
    lab_total: f64,
    k: usize,
    estimator: DensityEstimator,
}

fn single_pass<'a>(
    labeled: &Catalog,
    prior: ArrayView1<'a, f64>,
    application: &'a Catalog,
    options: &DensityWeightOptions,
    control: &ExecutionControl,
    observer: &dyn ProgressObserver,
) -> Result<DensityWeights, WeightError> {
    let k = options.k;
    let app_rows = application.positive_weight_rows();
    let lab_rows: Vec<usize> = (0..labeled.len()).filter(|&r| prior[r] > 0.0).collect();
    if k == 0 || k > app_rows.len() {
        return Err(WeightError::InsufficientNeighbors {
            catalog: application.name().to_string(),
            k,
            available: app_rows.len(),
        });
    }
    // The object itself is not its own neighbour, so k others must remain.
    if k >= lab_rows.len() {
        return Err(WeightError::InsufficientNeighbors {
            catalog: labeled.name().to_string(),
            k,
            available: lab_rows.len(),
        });
    }

    check(control)?;
    let app_index = FeatureSpaceIndex::build_with(
        application,
        &options.subspace,
        options.metric,
        BuildOptions {
            rows: Some(&app_rows),
            ..BuildOptions::default()
        },
    )?;
    check(control)?;
    let lab_index = FeatureSpaceIndex::build_with(
        labeled,
        &options.subspace,
        options.metric,
        BuildOptions {
            rows: Some(&lab_rows),
            standardization: Some(app_index.standardization()),
            ..BuildOptions::default()
        },
    )?;
    check(control)?;

    let context = PassContext {
        application,
        app_index,
        lab_index,
        prior,
        app_total: app_rows.iter().map(|&r| application.weights()[r]).sum(),
        lab_total: lab_rows.iter().map(|&r| prior[r]).sum(),
        k,
        estimator: options.estimator,
    };

    observer.on_stage_start(RunStage::DensityWeights, lab_rows.len());
    let processed = AtomicUsize::new(0);
    let ratios: Vec<(usize, f64, bool)> = lab_rows
        .par_iter()
        .map(|&row| {
            check(control)?;
            let features = labeled.feature_row(row);
            let (ratio, zero_distance) = context.ratio(row, features)?;
            let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
            observer.on_stage_advance(RunStage::DensityWeights, done);
            Ok((row, ratio, zero_distance))
        })
        .collect::<Result<_, WeightError>>()?;
    observer.on_stage_finish(RunStage::DensityWeights);

    let mut raw = Array1::zeros(labeled.len());
    let mut flags = vec![WeightFlag::Excluded; labeled.len()];
    for (row, ratio, zero_distance) in ratios {
        if zero_distance {
            log::warn!(
                "Object '{}' of '{}' has a zero k-th neighbour distance; its density weight defaults to 1",
                labeled.id(row),
                labeled.name()
            );
            raw[row] = 1.0;
            flags[row] = WeightFlag::ZeroDistance;
        } else if ratio.is_nan() || ratio < options.clamp_min || ratio > options.clamp_max {
            raw[row] = if ratio > options.clamp_max {
                options.clamp_max
            } else {
                options.clamp_min
            };
            flags[row] = WeightFlag::Clamped;
        } else {
            raw[row] = ratio;
            flags[row] = WeightFlag::Nominal;
        }
    }

    let participating = lab_rows.len() as f64;
    let sum: f64 = lab_rows.iter().map(|&r| prior[r] * raw[r]).sum();
    let mut weights = Array1::zeros(labeled.len());
    if sum > 0.0 && sum.is_finite() {
        for &r in &lab_rows {
            weights[r] = prior[r] * raw[r] * participating / sum;
        }
    } else {
        // Every clamped ratio is zero; keep the prior, normalized over the participants.
        let prior_sum: f64 = lab_rows.iter().map(|&r| prior[r]).sum();
        for &r in &lab_rows {
            weights[r] = prior[r] * participating / prior_sum;
        }
    }

    Ok(DensityWeights {
        weights,
        raw,
        flags,
        passes: 1,
    })
}

fn check(control: &ExecutionControl) -> Result<(), WeightError> {
    match control.interrupted() {
        Some(interrupt) => Err(interrupt.into()),
        None => Ok(()),
    }
}

impl PassContext<'_> {
    /// The raw density ratio of one labeled object and whether a k-th distance was zero.
    fn ratio(&self, row: usize, features: ArrayView1<f64>) -> Result<(f64, bool), WeightError> {
        let point = self.app_index.query_point(features, None)?;
        let app_nb = self.app_index.query(point.view(), self.k)?;
        let mut lab_nb = self.lab_index.query(point.view(), self.k + 1)?;
        match lab_nb.iter().position(|n| n.row == row) {
            Some(own) => {
                lab_nb.remove(own);
            }
            None => lab_nb.truncate(self.k),
        }

        let r_app = app_nb[self.k - 1].distance;
        let r_lab = lab_nb[self.k - 1].distance;
        if r_app <= 0.0 || r_lab <= 0.0 {
            return Ok((1.0, true));
        }

        let app_weight = |nb: &[Neighbor]| nb.iter().map(|n| self.application.weights()[n.row]).sum::<f64>();
        let lab_weight = |nb: &[Neighbor]| nb.iter().map(|n| self.prior[n.row]).sum::<f64>();

        let ratio = match self.estimator {
            DensityEstimator::KthNeighborVolume => {
                let d = self.app_index.dim() as f64;
                let log_app = (app_weight(&app_nb) / self.app_total).ln() - d * r_app.ln();
                let log_lab = (lab_weight(&lab_nb) / self.lab_total).ln() - d * r_lab.ln();
                (log_app - log_lab).exp()
            }
            DensityEstimator::EqualVolumeCount => {
                let (app_in, lab_in) = if r_app > r_lab {
                    let inside: Vec<Neighbor> = self
                        .lab_index
                        .within(point.view(), r_app)?
                        .into_iter()
                        .filter(|n| n.row != row)
                        .collect();
                    (app_weight(&app_nb), lab_weight(&inside))
                } else if r_lab > r_app {
                    let inside = self.app_index.within(point.view(), r_lab)?;
                    (app_weight(&inside), lab_weight(&lab_nb))
                } else {
                    (app_weight(&app_nb), lab_weight(&lab_nb))
                };
                (app_in / self.app_total) / (lab_in / self.lab_total)
            }
        };
        Ok((ratio, false))
    }
}
