//! # Error Estimation
//!
//! Three ways to put an uncertainty on one object's estimate, reported side by side:
//!
//! - **Ensemble spread**: the scatter of the members' predictions for the object.
//! - **Neighbour scatter**: the scatter of target values (or of prediction residuals) among
//!   the object's nearest labeled neighbours in feature space.
//! - **Input resampling**: the object's features are perturbed by their stated
//!   uncertainties, the retained members predict each perturbed copy, and the extra
//!   predictions are pooled with the nominal ensemble before measuring the spread.
//!
//! A single reported error is then chosen by an explicit [`ErrorCombination`] policy.

use crate::combine::ObjectPdf;
use crate::engine::{EngineError, ModelEngine, predict};
use crate::execute::TrainedMember;
use crate::index::{BuildOptions, FeatureSpaceIndex, FeatureSubspace, IndexError, MetricSpec};
use crate::seeding::{SeedStream, stream_rng};
use crate::stats::{self, Q16, Q84};
use crate::types::{Catalog, CatalogError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UncertaintyError {
    #[error(
        "Only {found} labeled neighbours lie within distance {max_distance}; at least {required} are needed."
    )]
    NoNeighborsInRange {
        found: usize,
        required: usize,
        max_distance: f64,
    },

    #[error("Neighbour-scatter errors need a labeled reference catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Feature-space index error while estimating errors: {0}")]
    Index(#[from] IndexError),

    #[error("Input resampling failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Residual predictions have {found} entries, but the reference catalog has {expected}.")]
    ResidualLength { expected: usize, found: usize },

    #[error("No reference object has a usable value for neighbour-scatter errors.")]
    EmptyReference,

    #[error("Invalid error-estimation option: {0}")]
    InvalidOption(String),
}

/// Which strategy produced an error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    EnsembleSpread,
    NeighborScatter,
    InputResampling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Nominal,
    /// Local estimation was unreliable; a global default was returned instead.
    Fallback,
}

/// One error value with the strategy that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorEstimate {
    pub strategy: ErrorStrategy,
    pub value: f64,
    /// Distance from the 50th down to the 16th percentile, when quantiles are available.
    pub lower: Option<f64>,
    /// Distance from the 50th up to the 84th percentile.
    pub upper: Option<f64>,
    pub confidence: Confidence,
}

/// How the spread of a set of predictions is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadMeasure {
    /// Weighted standard deviation.
    #[default]
    StdDev,
    /// Half-width between the 16th and 84th percentiles.
    Percentile68,
    /// Standard deviation over the square root of the effective member count.
    StandardError,
}

/// Error from the scatter of the ensemble's own predictions. `None` for invalid PDFs.
pub fn ensemble_spread(pdf: &ObjectPdf, measure: SpreadMeasure) -> Option<ErrorEstimate> {
    if !pdf.valid {
        return None;
    }
    let (values, weights): (Vec<f64>, Vec<f64>) = pdf.members.iter().copied().unzip();
    let value = match measure {
        SpreadMeasure::StdDev => stats::weighted_std(&values, Some(&weights))?,
        SpreadMeasure::Percentile68 => {
            let lo = pdf.quantile_bin_value(Q16)?;
            let hi = pdf.quantile_bin_value(Q84)?;
            0.5 * (hi - lo).abs()
        }
        SpreadMeasure::StandardError => {
            let n = stats::effective_count(&values, Some(&weights));
            stats::weighted_std(&values, Some(&weights))? / n.sqrt()
        }
    };
    let (lower, upper) = asymmetric(&values, Some(&weights));
    Some(ErrorEstimate {
        strategy: ErrorStrategy::EnsembleSpread,
        value,
        lower,
        upper,
        confidence: Confidence::Nominal,
    })
}

fn asymmetric(values: &[f64], weights: Option<&[f64]>) -> (Option<f64>, Option<f64>) {
    match stats::weighted_quantiles(values, weights, &[Q16, 0.5, Q84]) {
        Some(q) => (Some(q[1] - q[0]), Some(q[2] - q[1])),
        None => (None, None),
    }
}

/// What the neighbours' scatter is measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterSource {
    /// The neighbours' true target values.
    #[default]
    Truth,
    /// The neighbours' residuals, prediction minus truth.
    Residual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterOptions {
    pub k: usize,
    pub subspace: FeatureSubspace,
    pub metric: MetricSpec,
    pub source: ScatterSource,
    /// `StandardError` is not meaningful here and is treated as `StdDev`.
    pub measure: SpreadMeasure,
    pub max_distance: Option<f64>,
    pub min_neighbors: usize,
    /// Use the reference catalog's (density) weights as neighbour weights.
    pub use_weights: bool,
    /// Returned, flagged, when the local estimate is unreliable. Defaults to the weighted
    /// scatter of the whole reference catalog.
    pub fallback: Option<f64>,
    /// Search in feature space extended by each object's ensemble spread.
    pub augment_with_spread: bool,
}

impl Default for ScatterOptions {
    fn default() -> Self {
        Self {
            k: 30,
            subspace: FeatureSubspace::All,
            metric: MetricSpec::default(),
            source: ScatterSource::Truth,
            measure: SpreadMeasure::StdDev,
            max_distance: None,
            min_neighbors: 5,
            use_weights: true,
            fallback: None,
            augment_with_spread: false,
        }
    }
}

impl ScatterOptions {
    pub fn validate(&self) -> Result<(), UncertaintyError> {
        if self.k == 0 {
            return Err(UncertaintyError::InvalidOption(
                "neighbour-scatter k must be positive".to_string(),
            ));
        }
        if let Some(d) = self.max_distance {
            if !(d > 0.0) || !d.is_finite() {
                return Err(UncertaintyError::InvalidOption(format!(
                    "max_distance must be positive and finite, got {d}"
                )));
            }
        }
        if let Some(f) = self.fallback {
            if !(f >= 0.0) || !f.is_finite() {
                return Err(UncertaintyError::InvalidOption(format!(
                    "fallback error must be non-negative and finite, got {f}"
                )));
            }
        }
        Ok(())
    }
}

/// Optional inputs of [`NeighborScatter::build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScatterInputs<'a> {
    /// Ensemble predictions for the reference objects, needed for `ScatterSource::Residual`.
    pub predictions: Option<ArrayView1<'a, f64>>,
    /// Extra index columns for the reference objects, e.g. a predicted error.
    pub derived_columns: Option<ArrayView2<'a, f64>>,
}

/// A reusable neighbour-scatter estimator over one labeled reference catalog.
#[derive(Debug, Clone)]
pub struct NeighborScatter {
    index: FeatureSpaceIndex,
    values: Array1<f64>,
    weights: Array1<f64>,
    options: ScatterOptions,
    global: ErrorEstimate,
}

impl NeighborScatter {
    pub fn build(
        reference: &Catalog,
        options: &ScatterOptions,
        inputs: ScatterInputs<'_>,
    ) -> Result<Self, UncertaintyError> {
        options.validate()?;
        let targets = reference.require_targets()?;
        let values: Array1<f64> = match options.source {
            ScatterSource::Truth => targets.to_owned(),
            ScatterSource::Residual => {
                let predictions = inputs.predictions.ok_or_else(|| {
                    UncertaintyError::InvalidOption(
                        "residual scatter needs reference predictions".to_string(),
                    )
                })?;
                if predictions.len() != reference.len() {
                    return Err(UncertaintyError::ResidualLength {
                        expected: reference.len(),
                        found: predictions.len(),
                    });
                }
                &predictions - &targets
            }
        };
        let weights: Array1<f64> = if options.use_weights {
            reference.weights().to_owned()
        } else {
            Array1::ones(reference.len())
        };

        let rows: Vec<usize> = (0..reference.len())
            .filter(|&r| weights[r] > 0.0 && values[r].is_finite())
            .filter(|&r| {
                inputs
                    .derived_columns
                    .is_none_or(|d| d.row(r).iter().all(|v| v.is_finite()))
            })
            .collect();
        if rows.is_empty() {
            return Err(UncertaintyError::EmptyReference);
        }
        let index = FeatureSpaceIndex::build_with(
            reference,
            &options.subspace,
            options.metric,
            BuildOptions {
                rows: Some(&rows),
                derived_columns: inputs.derived_columns.as_ref().map(|d| d.view()),
                ..BuildOptions::default()
            },
        )?;

        let used_values: Vec<f64> = rows.iter().map(|&r| values[r]).collect();
        let used_weights: Vec<f64> = rows.iter().map(|&r| weights[r]).collect();
        let (lower, upper) = asymmetric(&used_values, Some(&used_weights));
        let global_value = match options.fallback {
            Some(value) => value,
            None => measure_scatter(&used_values, &used_weights, options.measure).unwrap_or(0.0),
        };
        log::info!(
            "Neighbour-scatter reference '{}': {} objects, global scatter {:.5}",
            reference.name(),
            rows.len(),
            global_value
        );

        Ok(Self {
            index,
            values,
            weights,
            options: options.clone(),
            global: ErrorEstimate {
                strategy: ErrorStrategy::NeighborScatter,
                value: global_value,
                lower: options.fallback.or(lower),
                upper: options.fallback.or(upper),
                confidence: Confidence::Fallback,
            },
        })
    }

    pub fn global(&self) -> ErrorEstimate {
        self.global
    }

    pub fn index(&self) -> &FeatureSpaceIndex {
        &self.index
    }

    /// Error for one object given its full feature vector (and derived values when the
    /// estimator was built with derived columns).
    pub fn estimate(
        &self,
        features: ArrayView1<f64>,
        derived: Option<ArrayView1<f64>>,
    ) -> Result<ErrorEstimate, UncertaintyError> {
        let point = self.index.query_point(features, derived)?;
        let mut neighbours = self.index.query(point.view(), self.options.k)?;
        if let Some(max_distance) = self.options.max_distance {
            neighbours.retain(|n| n.distance <= max_distance);
            if neighbours.len() < self.options.min_neighbors.max(1) {
                return Err(UncertaintyError::NoNeighborsInRange {
                    found: neighbours.len(),
                    required: self.options.min_neighbors.max(1),
                    max_distance,
                });
            }
        }

        // Zero-distance neighbours are the object itself or exact duplicates of it.
        let (values, weights): (Vec<f64>, Vec<f64>) = neighbours
            .iter()
            .filter(|n| n.distance > 0.0)
            .map(|n| (self.values[n.row], self.weights[n.row]))
            .unzip();

        let reliable = values.len() >= self.options.min_neighbors
            && stats::effective_count(&values, Some(&weights)) >= self.options.min_neighbors as f64;
        let value = if reliable {
            measure_scatter(&values, &weights, self.options.measure)
        } else {
            None
        };
        match value {
            Some(value) => {
                let (lower, upper) = asymmetric(&values, Some(&weights));
                Ok(ErrorEstimate {
                    strategy: ErrorStrategy::NeighborScatter,
                    value,
                    lower,
                    upper,
                    confidence: Confidence::Nominal,
                })
            }
            None => Ok(self.global),
        }
    }
}

fn measure_scatter(values: &[f64], weights: &[f64], measure: SpreadMeasure) -> Option<f64> {
    match measure {
        SpreadMeasure::Percentile68 => stats::sigma68(values, Some(weights)),
        SpreadMeasure::StdDev | SpreadMeasure::StandardError => {
            stats::weighted_std(values, Some(weights))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseModel {
    /// Normal draws with the stated uncertainty as standard deviation.
    #[default]
    Gaussian,
    /// Uniform draws with the same standard deviation as the Gaussian.
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResamplingOptions {
    pub repetitions: usize,
    pub noise: NoiseModel,
    /// Shift all features of a draw in one direction; the first half of the draws go down,
    /// the second half up.
    pub antithetic: bool,
    pub measure: SpreadMeasure,
}

impl Default for ResamplingOptions {
    fn default() -> Self {
        Self {
            repetitions: 20,
            noise: NoiseModel::Gaussian,
            antithetic: true,
            measure: SpreadMeasure::StdDev,
        }
    }
}

/// Perturbed copies of one object's features, `[repetitions, n_features]`.
pub fn perturbations(
    features: ArrayView1<f64>,
    errors: ArrayView1<f64>,
    options: &ResamplingOptions,
    seed: u64,
    object: u64,
) -> Array2<f64> {
    let mut rng = stream_rng(seed, SeedStream::InputResampling, object);
    let repetitions = options.repetitions;
    let half = repetitions / 2;
    let mut draws = Array2::zeros((repetitions, features.len()));
    for r in 0..repetitions {
        for j in 0..features.len() {
            let z: f64 = match options.noise {
                NoiseModel::Gaussian => StandardNormal.sample(&mut rng),
                NoiseModel::Uniform => rng.gen_range(-1.0..1.0) * 3f64.sqrt(),
            };
            let z = if options.antithetic {
                if r < half { -z.abs() } else { z.abs() }
            } else {
                z
            };
            draws[[r, j]] = features[j] + z * errors[j];
        }
    }
    draws
}

/// Predictions for the perturbed copies of one object. Draw `r` is evaluated by member
/// `r mod n_members`, so every member sees a share of the draws.
pub fn resample_predictions<E: ModelEngine>(
    engine: &E,
    members: &[TrainedMember<E::Model>],
    draws: ArrayView2<f64>,
) -> Result<Vec<f64>, UncertaintyError> {
    let mut out = vec![f64::NAN; draws.nrows()];
    if members.is_empty() {
        return Ok(out);
    }
    for (m, member) in members.iter().enumerate() {
        let assigned: Vec<usize> = (m..draws.nrows()).step_by(members.len()).collect();
        if assigned.is_empty() {
            continue;
        }
        let inputs = draws.select(ndarray::Axis(0), &assigned);
        let predictions = predict(engine, &member.configuration, &member.model, inputs.view())?;
        for (&row, value) in assigned.iter().zip(predictions) {
            out[row] = value;
        }
    }
    Ok(out)
}

/// Spread of the nominal ensemble pooled with the resampled predictions.
pub fn input_resampling_error(
    nominal: &[f64],
    resampled: &[f64],
    measure: SpreadMeasure,
) -> Option<ErrorEstimate> {
    let pooled: Vec<f64> = nominal
        .iter()
        .chain(resampled)
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    let value = match measure {
        SpreadMeasure::StdDev => stats::weighted_std(&pooled, None)?,
        SpreadMeasure::Percentile68 => stats::sigma68(&pooled, None)?,
        SpreadMeasure::StandardError => {
            stats::weighted_std(&pooled, None)? / (pooled.len() as f64).sqrt()
        }
    };
    let (lower, upper) = asymmetric(&pooled, None);
    Some(ErrorEstimate {
        strategy: ErrorStrategy::InputResampling,
        value,
        lower,
        upper,
        confidence: Confidence::Nominal,
    })
}

/// How one reported error is chosen when several strategies ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCombination {
    /// Neighbour scatter unless it fell back to the global default, then the ensemble.
    #[default]
    PreferNeighbor,
    PreferEnsemble,
    /// `sqrt(a² + b²)` of the neighbour and ensemble errors.
    Quadrature,
    Mean,
    Larger,
}

/// Picks the reported error among the estimates of one object. Input resampling, when
/// present, stands in for the plain ensemble spread since it already contains it.
pub fn combine_errors(estimates: &[ErrorEstimate], policy: ErrorCombination) -> Option<f64> {
    let find = |s: ErrorStrategy| estimates.iter().find(|e| e.strategy == s);
    let neighbour = find(ErrorStrategy::NeighborScatter);
    let ensemble = find(ErrorStrategy::InputResampling).or(find(ErrorStrategy::EnsembleSpread));
    match (neighbour, ensemble) {
        (None, None) => None,
        (Some(n), None) => Some(n.value),
        (None, Some(e)) => Some(e.value),
        (Some(n), Some(e)) => Some(match policy {
            ErrorCombination::PreferNeighbor => {
                if n.confidence == Confidence::Nominal {
                    n.value
                } else {
                    e.value
                }
            }
            ErrorCombination::PreferEnsemble => e.value,
            ErrorCombination::Quadrature => n.value.hypot(e.value),
            ErrorCombination::Mean => 0.5 * (n.value + e.value),
            ErrorCombination::Larger => n.value.max(e.value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::PdfBinning;
    use crate::combine::{CombineOptions, combine};
    use crate::types::{CatalogRole, ObjectId};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn pdf(values: &[f64]) -> ObjectPdf {
        let binning = PdfBinning::uniform(0.0, 1.0, 20).unwrap();
        combine(values, None, &binning, &CombineOptions::default())
    }

    #[test]
    fn zero_variance_spread_is_exactly_zero() {
        let pdf = pdf(&[0.31; 9]);
        for measure in [
            SpreadMeasure::StdDev,
            SpreadMeasure::Percentile68,
            SpreadMeasure::StandardError,
        ] {
            assert_eq!(ensemble_spread(&pdf, measure).unwrap().value, 0.0);
        }
    }

    #[test]
    fn standard_error_shrinks_with_members() {
        let few = pdf(&[0.4, 0.6]);
        let many = pdf(&[0.4, 0.6, 0.4, 0.6, 0.4, 0.6, 0.4, 0.6]);
        let a = ensemble_spread(&few, SpreadMeasure::StandardError).unwrap().value;
        let b = ensemble_spread(&many, SpreadMeasure::StandardError).unwrap().value;
        assert_abs_diff_eq!(a, 0.1 / 2f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(b, 0.1 / 8f64.sqrt(), epsilon = 1e-12);
    }

    fn line_catalog(n: usize) -> Catalog {
        // Targets alternate around the line so every neighbourhood has the same scatter.
        let features = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
        let targets = Array1::from_shape_fn(n, |i| if i % 2 == 0 { 1.0 } else { -1.0 });
        Catalog::new(
            "ref",
            CatalogRole::Training,
            vec!["x".into()],
            (0..n).map(|i| ObjectId(format!("r{i:04}"))).collect(),
            features,
        )
        .unwrap()
        .with_targets(targets)
        .unwrap()
    }

    #[test]
    fn neighbour_scatter_measures_local_targets() {
        let reference = line_catalog(200);
        let options = ScatterOptions {
            k: 10,
            metric: MetricSpec {
                standardize: false,
                ..MetricSpec::default()
            },
            ..ScatterOptions::default()
        };
        let scatter = NeighborScatter::build(&reference, &options, ScatterInputs::default()).unwrap();
        let estimate = scatter.estimate(array![100.5].view(), None).unwrap();
        assert_eq!(estimate.confidence, Confidence::Nominal);
        assert_abs_diff_eq!(estimate.value, 1.0, epsilon = 1e-12);
        assert_eq!(estimate.strategy, ErrorStrategy::NeighborScatter);
    }

    #[test]
    fn cutoff_without_neighbours_is_a_soft_failure() {
        let reference = line_catalog(50);
        let options = ScatterOptions {
            k: 10,
            max_distance: Some(2.0),
            metric: MetricSpec {
                standardize: false,
                ..MetricSpec::default()
            },
            ..ScatterOptions::default()
        };
        let scatter = NeighborScatter::build(&reference, &options, ScatterInputs::default()).unwrap();
        let err = scatter.estimate(array![500.0].view(), None).unwrap_err();
        assert!(matches!(err, UncertaintyError::NoNeighborsInRange { found: 0, .. }));
    }

    #[test]
    fn unreliable_neighbourhoods_fall_back_to_the_global_scatter() {
        let reference = line_catalog(50);
        let options = ScatterOptions {
            k: 3,
            min_neighbors: 5,
            fallback: Some(0.25),
            ..ScatterOptions::default()
        };
        let scatter = NeighborScatter::build(&reference, &options, ScatterInputs::default()).unwrap();
        let estimate = scatter.estimate(array![10.0].view(), None).unwrap();
        assert_eq!(estimate.confidence, Confidence::Fallback);
        assert_eq!(estimate.value, 0.25);
    }

    #[test]
    fn residual_scatter_uses_prediction_minus_truth() {
        let reference = line_catalog(40);
        let targets = reference.targets().unwrap().to_owned();
        let predictions = &targets + 0.5;
        let options = ScatterOptions {
            k: 8,
            source: ScatterSource::Residual,
            ..ScatterOptions::default()
        };
        let scatter = NeighborScatter::build(
            &reference,
            &options,
            ScatterInputs {
                predictions: Some(predictions.view()),
                ..ScatterInputs::default()
            },
        )
        .unwrap();
        // Every residual is 0.5, so the scatter vanishes.
        let estimate = scatter.estimate(array![20.0].view(), None).unwrap();
        assert_eq!(estimate.value, 0.0);
    }

    #[test]
    fn derived_columns_join_the_neighbour_search() {
        let reference = line_catalog(200);
        // Even rows carry target 1, odd rows -1; the derived column pulls them apart.
        let derived = Array2::from_shape_fn((200, 1), |(i, _)| if i % 2 == 0 { 0.0 } else { 1000.0 });
        let options = ScatterOptions {
            k: 10,
            metric: MetricSpec {
                standardize: false,
                ..MetricSpec::default()
            },
            augment_with_spread: true,
            ..ScatterOptions::default()
        };
        let scatter = NeighborScatter::build(
            &reference,
            &options,
            ScatterInputs {
                derived_columns: Some(derived.view()),
                ..ScatterInputs::default()
            },
        )
        .unwrap();
        assert_eq!(scatter.index().dim(), 2);
        let estimate = scatter.estimate(array![100.5].view(), Some(array![0.0].view())).unwrap();
        assert_eq!(estimate.confidence, Confidence::Nominal);
        assert_eq!(estimate.value, 0.0);
    }

    #[test]
    fn antithetic_draws_split_into_low_and_high_halves() {
        let options = ResamplingOptions {
            repetitions: 6,
            ..ResamplingOptions::default()
        };
        let draws = perturbations(array![1.0, 2.0].view(), array![0.1, 0.0].view(), &options, 5, 0);
        for r in 0..3 {
            assert!(draws[[r, 0]] <= 1.0);
            assert_eq!(draws[[r, 1]], 2.0);
        }
        for r in 3..6 {
            assert!(draws[[r, 0]] >= 1.0);
        }
        let again = perturbations(array![1.0, 2.0].view(), array![0.1, 0.0].view(), &options, 5, 0);
        assert_eq!(draws, again);
    }

    #[test]
    fn combination_policies() {
        let neighbour = ErrorEstimate {
            strategy: ErrorStrategy::NeighborScatter,
            value: 0.3,
            lower: None,
            upper: None,
            confidence: Confidence::Nominal,
        };
        let ensemble = ErrorEstimate {
            strategy: ErrorStrategy::EnsembleSpread,
            value: 0.4,
            ..neighbour
        };
        let both = [neighbour, ensemble];
        assert_eq!(combine_errors(&both, ErrorCombination::PreferNeighbor), Some(0.3));
        assert_eq!(combine_errors(&both, ErrorCombination::PreferEnsemble), Some(0.4));
        assert_abs_diff_eq!(
            combine_errors(&both, ErrorCombination::Quadrature).unwrap(),
            0.5,
            epsilon = 1e-12
        );
        assert_eq!(combine_errors(&both, ErrorCombination::Larger), Some(0.4));

        let fallback = ErrorEstimate {
            confidence: Confidence::Fallback,
            ..neighbour
        };
        assert_eq!(
            combine_errors(&[fallback, ensemble], ErrorCombination::PreferNeighbor),
            Some(0.4)
        );
        assert_eq!(combine_errors(&[], ErrorCombination::Mean), None);
    }
}
