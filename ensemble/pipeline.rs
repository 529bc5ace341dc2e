//! # Run Orchestration
//!
//! A run is driven by an immutable [`RunContext`]: the catalogs, the validated options, the
//! PDF binning and the execution control. Nothing here keeps state between runs.
//!
//! ### Stages
//!
//! 1. **Density weights** (optional): ratios of application to labeled density around each
//!    labeled object. In `Training` mode they become the training weights handed to the
//!    engine, in `Evaluation` mode they only weight the member metrics and the neighbour
//!    scatter reference.
//! 2. **Members**: one configuration per member, trained and evaluated in parallel. Failed
//!    members are excluded; a deadline may leave a partial ensemble.
//! 3. **Member weighting**: uniform, or metric-ranked weights chosen on the evaluation
//!    catalog by the flatness of its PIT distribution.
//! 4. **Combination**: one PDF and point estimate set per application object.
//! 5. **Errors**: every configured strategy per object, then the reported error by the
//!    chosen [`ErrorCombination`](crate::uncertainty::ErrorCombination). With
//!    `training_coverage` set, objects far from the training catalog are flagged
//!    [`ObjectFlag::OutsideTraining`].
//!
//! [`combine_external`] runs stages 3 to 5 on prediction tables produced elsewhere.

use crate::binning::PdfBinning;
use crate::combine::{ObjectPdf, PointEstimates, combine, stack_pdfs};
use crate::configs::{SampleShape, generate};
use crate::coverage::TrainingCoverage;
use crate::engine::{ModelEngine, PredictionTable};
use crate::error::RunError;
use crate::execute::{ExecutionControl, FailureSummary, Interrupt, run_members};
use crate::metrics::{RegressionMetrics, member_metrics};
use crate::options::{PointEstimateKind, RunOptions};
use crate::progress::{ProgressObserver, RunStage};
use crate::selection::{Evaluation, MemberWeightChoice, MemberWeighting, choose_member_weights};
use crate::types::{Catalog, CatalogError, Catalogs, ObjectId};
use crate::uncertainty::{
    Confidence, ErrorEstimate, ErrorStrategy, NeighborScatter, ScatterInputs, ScatterOptions,
    ScatterSource, UncertaintyError, combine_errors, ensemble_spread, input_resampling_error,
    perturbations, resample_predictions,
};
use crate::weights::{DensityWeights, WeightUse, compute_density_weights_observed};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Everything a run reads. Built once, passed by reference, never mutated.
pub struct RunContext<'a> {
    catalogs: &'a Catalogs,
    options: &'a RunOptions,
    binning: PdfBinning,
    control: ExecutionControl,
}

impl<'a> RunContext<'a> {
    /// Validates the options and catalogs. The deadline, if any, starts now.
    pub fn new(catalogs: &'a Catalogs, options: &'a RunOptions) -> Result<Self, RunError> {
        Self::with_control(catalogs, options, options.execution.to_control())
    }

    pub fn with_control(
        catalogs: &'a Catalogs,
        options: &'a RunOptions,
        control: ExecutionControl,
    ) -> Result<Self, RunError> {
        options.validate()?;
        validate_catalogs(catalogs)?;
        options.generator.validate(catalogs.training.n_features())?;
        if options.errors.input_resampling.is_some() && catalogs.application.feature_errors().is_none()
        {
            return Err(CatalogError::MissingFeatureErrors(catalogs.application.name().to_string()).into());
        }
        let binning = options.binning.build()?;
        Ok(Self {
            catalogs,
            options,
            binning,
            control,
        })
    }

    pub fn catalogs(&self) -> &Catalogs {
        self.catalogs
    }

    pub fn options(&self) -> &RunOptions {
        self.options
    }

    pub fn binning(&self) -> &PdfBinning {
        &self.binning
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }
}

fn validate_catalogs(catalogs: &Catalogs) -> Result<(), RunError> {
    let expected = catalogs.training.n_features();
    let present = [
        Some(&catalogs.training),
        catalogs.validation.as_ref(),
        Some(&catalogs.application),
    ];
    for catalog in present.into_iter().flatten() {
        if catalog.is_empty() {
            return Err(RunError::EmptyCatalog {
                role: catalog.role(),
                catalog: catalog.name().to_string(),
            });
        }
        if catalog.n_features() != expected {
            return Err(RunError::DimensionMismatch {
                role: catalog.role(),
                catalog: catalog.name().to_string(),
                expected,
                found: catalog.n_features(),
            });
        }
    }
    catalogs.training.require_targets()?;
    if let Some(validation) = &catalogs.validation {
        validation.require_targets()?;
    }
    Ok(())
}

/// Degraded-confidence markers on one object's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectFlag {
    /// Fewer valid predictions than required; no PDF or point estimates.
    InvalidPdf,
    /// Some members failed or were skipped at the deadline.
    PartialEnsemble,
    /// The neighbour scatter was unreliable and the global default was used.
    NeighborFallback,
    /// Too few neighbours within the maximum distance; no neighbour-scatter error.
    NoNeighborsInRange,
    /// A neighbour-scatter or resampling error could not be computed.
    ErrorEstimationFailed,
    /// Too far from the training catalog in feature space; the estimate is an extrapolation.
    OutsideTraining,
}

/// The output for one application object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEstimate {
    pub id: ObjectId,
    pub estimates: Option<PointEstimates>,
    /// The point estimate selected by `RunOptions::report`.
    pub reported: Option<f64>,
    pub pdf: ObjectPdf,
    pub errors: Vec<ErrorEstimate>,
    pub combined_error: Option<f64>,
    /// Closeness to the training catalog in `[0, 1]`, when the coverage check ran.
    pub training_coverage: Option<f64>,
    pub valid: bool,
    pub flags: Vec<ObjectFlag>,
}

impl ObjectEstimate {
    pub fn has_flag(&self, flag: ObjectFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn error(&self, strategy: ErrorStrategy) -> Option<&ErrorEstimate> {
        self.errors.iter().find(|e| e.strategy == strategy)
    }
}

/// Results of the combination and error stages.
#[derive(Debug, Clone)]
pub struct CombinedOutput {
    pub objects: Vec<ObjectEstimate>,
    pub bin_centers: Vec<f64>,
    /// Normalized sum of the valid object PDFs.
    pub stacked_pdf: Vec<f64>,
    pub member_weights: MemberWeightChoice,
    /// `(member id, metrics)` on the evaluation catalog, empty without one.
    pub member_metrics: Vec<(usize, Option<RegressionMetrics>)>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub combined: CombinedOutput,
    /// Weights of the training catalog, when density weighting ran.
    pub density_weights: Option<DensityWeights>,
    pub failures: FailureSummary,
}

/// Runs the whole ensemble over the catalogs of `context`.
pub fn run<E: ModelEngine>(
    engine: &E,
    context: &RunContext<'_>,
    observer: &dyn ProgressObserver,
) -> Result<RunOutput, RunError> {
    let options = context.options;
    let catalogs = context.catalogs;
    let training = &catalogs.training;
    let application = &catalogs.application;
    let evaluation = catalogs.evaluation();

    let mut training_weights = training.weights().to_owned();
    let mut evaluation_weights = evaluation.weights().to_owned();
    let mut density_weights = None;
    if let Some(weight_options) = &options.density_weights {
        let weights = compute_density_weights_observed(
            training,
            application,
            weight_options,
            &context.control,
            observer,
        )
        .map_err(|e| RunError::from_weights(training.name(), training.len(), e))?;
        match weight_options.use_mode {
            WeightUse::Training => training_weights = weights.weights.clone(),
            WeightUse::Evaluation => {
                evaluation_weights = match &catalogs.validation {
                    Some(validation) => {
                        compute_density_weights_observed(
                            validation,
                            application,
                            weight_options,
                            &context.control,
                            observer,
                        )
                        .map_err(|e| RunError::from_weights(validation.name(), validation.len(), e))?
                        .weights
                    }
                    None => weights.weights.clone(),
                };
            }
        }
        density_weights = Some(weights);
    }

    let configurations = generate(
        options.ensemble_size,
        options.seed,
        &options.generator,
        SampleShape {
            n_features: training.n_features(),
            n_training: training.len(),
        },
    )?;
    let members = run_members(
        engine,
        &configurations,
        training,
        training_weights.view(),
        &[evaluation, application],
        &context.control,
        observer,
    )?;
    let failures = members.failures.clone();
    if failures.is_partial() {
        log::warn!(
            "Partial ensemble: {} of {} members completed ({} failed, {} skipped at the deadline)",
            failures.completed,
            failures.requested,
            failures.failed.len(),
            failures.timed_out
        );
    }

    let coverage = build_coverage(training, options)?;
    let reference = evaluation.reweighted(evaluation_weights)?;
    let (evaluation_table, application_table) = match members.tables.as_slice() {
        [evaluation_table, application_table] => (evaluation_table, application_table),
        _ => {
            return Err(RunError::PredictionTable {
                catalog: application.name().to_string(),
                reason: "member execution returned an unexpected number of tables".to_string(),
            });
        }
    };

    let resampler = |row: usize| -> Result<Vec<f64>, UncertaintyError> {
        let (Some(resampling), Some(errors)) =
            (&options.errors.input_resampling, application.feature_errors())
        else {
            return Ok(Vec::new());
        };
        let draws = perturbations(
            application.feature_row(row),
            errors.row(row),
            resampling,
            options.seed,
            row as u64,
        );
        resample_predictions(engine, &members.members, draws.view())
    };
    let resampler: Option<&Resampler<'_>> = match options.errors.input_resampling {
        Some(_) => Some(&resampler),
        None => None,
    };

    let combined = finish(
        &FinishStage {
            options,
            binning: &context.binning,
            control: &context.control,
            application,
            application_table,
            reference: Some(&reference),
            reference_table: Some(evaluation_table),
            resampler,
            coverage: coverage.as_ref(),
            partial: failures.is_partial(),
        },
        observer,
    )?;

    Ok(RunOutput {
        combined,
        density_weights,
        failures,
    })
}

/// A labeled catalog for member weighting and neighbour-scatter errors when combining
/// external predictions.
#[derive(Debug, Clone, Copy)]
pub struct ExternalReference<'a> {
    pub catalog: &'a Catalog,
    /// Member predictions for `catalog`, same member columns as the application table.
    pub predictions: Option<&'a PredictionTable>,
}

/// Combines member predictions made by an external engine. Input resampling needs the
/// trained members and is skipped here.
pub fn combine_external(
    application: &Catalog,
    predictions: &PredictionTable,
    reference: Option<ExternalReference<'_>>,
    options: &RunOptions,
    observer: &dyn ProgressObserver,
) -> Result<CombinedOutput, RunError> {
    options.validate()?;
    let binning = options.binning.build()?;
    check_table(application, predictions)?;
    if let Some(reference) = &reference {
        if reference.catalog.n_features() != application.n_features() {
            return Err(RunError::DimensionMismatch {
                role: reference.catalog.role(),
                catalog: reference.catalog.name().to_string(),
                expected: application.n_features(),
                found: reference.catalog.n_features(),
            });
        }
        if let Some(table) = reference.predictions {
            check_table(reference.catalog, table)?;
            if table.members() != predictions.members() {
                return Err(RunError::PredictionTable {
                    catalog: reference.catalog.name().to_string(),
                    reason: "member columns differ from the application table".to_string(),
                });
            }
        }
    }
    if options.errors.input_resampling.is_some() {
        log::warn!("Input resampling needs trained members and is skipped for external predictions");
    }
    // The labeled reference stands in for the training catalog.
    let coverage = match (&options.training_coverage, &reference) {
        (Some(_), Some(reference)) => build_coverage(reference.catalog, options)?,
        (Some(_), None) => {
            log::warn!("The training-coverage check needs a labeled reference catalog and is skipped");
            None
        }
        (None, _) => None,
    };

    finish(
        &FinishStage {
            options,
            binning: &binning,
            control: &options.execution.to_control(),
            application,
            application_table: predictions,
            reference: reference.map(|r| r.catalog),
            reference_table: reference.and_then(|r| r.predictions),
            resampler: None,
            coverage: coverage.as_ref(),
            partial: false,
        },
        observer,
    )
}

fn check_table(catalog: &Catalog, table: &PredictionTable) -> Result<(), RunError> {
    if table.n_objects() != catalog.len() {
        return Err(RunError::PredictionTable {
            catalog: catalog.name().to_string(),
            reason: format!(
                "{} prediction rows for {} catalog objects",
                table.n_objects(),
                catalog.len()
            ),
        });
    }
    Ok(())
}

fn build_coverage(training: &Catalog, options: &RunOptions) -> Result<Option<TrainingCoverage>, RunError> {
    options
        .training_coverage
        .as_ref()
        .map(|coverage| {
            TrainingCoverage::build(training, coverage).map_err(|source| RunError::Coverage {
                catalog: training.name().to_string(),
                source,
            })
        })
        .transpose()
}

type Resampler<'a> = dyn Fn(usize) -> Result<Vec<f64>, UncertaintyError> + Sync + 'a;

struct FinishStage<'a> {
    options: &'a RunOptions,
    binning: &'a PdfBinning,
    control: &'a ExecutionControl,
    application: &'a Catalog,
    application_table: &'a PredictionTable,
    /// Labeled catalog carrying the evaluation weights.
    reference: Option<&'a Catalog>,
    reference_table: Option<&'a PredictionTable>,
    resampler: Option<&'a Resampler<'a>>,
    coverage: Option<&'a TrainingCoverage>,
    partial: bool,
}

fn finish(stage: &FinishStage<'_>, observer: &dyn ProgressObserver) -> Result<CombinedOutput, RunError> {
    let options = stage.options;
    let (choice, metrics) = weigh_members(stage)?;
    let member_weights = choice.weights.as_deref();

    let scatter = match (&options.errors.neighbor_scatter, stage.reference) {
        (None, _) => None,
        (Some(scatter_options), Some(reference)) => Some(build_scatter(
            reference,
            stage.reference_table,
            member_weights,
            scatter_options,
            options,
            stage.binning,
        )?),
        (Some(_), None) => {
            return Err(UncertaintyError::InvalidOption(
                "neighbour-scatter errors need a labeled reference catalog".to_string(),
            )
            .into());
        }
    };

    let n_objects = stage.application.len();
    log::info!(
        "Combining {} members for {} objects of '{}'",
        stage.application_table.n_members(),
        n_objects,
        stage.application.name()
    );
    observer.on_stage_start(RunStage::Combination, n_objects);
    let processed = AtomicUsize::new(0);
    let pdfs: Vec<ObjectPdf> = (0..n_objects)
        .into_par_iter()
        .map(|row| {
            let vector = stage.application_table.ensemble_vector(row);
            let pdf = combine(&vector, member_weights, stage.binning, &options.combine);
            observer.on_stage_advance(RunStage::Combination, processed.fetch_add(1, Ordering::Relaxed) + 1);
            pdf
        })
        .collect();
    observer.on_stage_finish(RunStage::Combination);

    if stage.control.interrupted() == Some(Interrupt::Aborted) {
        return Err(RunError::Aborted {
            component: "PDF combination",
        });
    }

    observer.on_stage_start(RunStage::Errors, n_objects);
    let processed = AtomicUsize::new(0);
    let objects: Vec<ObjectEstimate> = pdfs
        .into_par_iter()
        .enumerate()
        .map(|(row, pdf)| {
            let object = estimate_object(stage, scatter.as_ref(), row, pdf);
            observer.on_stage_advance(RunStage::Errors, processed.fetch_add(1, Ordering::Relaxed) + 1);
            object
        })
        .collect();
    observer.on_stage_finish(RunStage::Errors);

    if stage.control.interrupted() == Some(Interrupt::Aborted) {
        return Err(RunError::Aborted {
            component: "error estimation",
        });
    }

    let invalid = objects.iter().filter(|o| !o.valid).count();
    let fallback = objects
        .iter()
        .filter(|o| o.has_flag(ObjectFlag::NeighborFallback))
        .count();
    if invalid > 0 {
        log::warn!("{invalid} of {n_objects} objects have too few valid predictions for a PDF");
    }
    if fallback > 0 {
        log::warn!("{fallback} of {n_objects} objects fell back to the global neighbour scatter");
    }
    let outside = objects
        .iter()
        .filter(|o| o.has_flag(ObjectFlag::OutsideTraining))
        .count();
    if outside > 0 {
        log::warn!("{outside} of {n_objects} objects lie outside the training coverage");
    }

    let stacked_pdf = stack_pdfs(objects.iter().map(|o| &o.pdf), None, stage.binning.n_bins());
    Ok(CombinedOutput {
        objects,
        bin_centers: stage.binning.centers(),
        stacked_pdf,
        member_weights: choice,
        member_metrics: metrics,
    })
}

type MemberScores = (MemberWeightChoice, Vec<(usize, Option<RegressionMetrics>)>);

fn weigh_members(stage: &FinishStage<'_>) -> Result<MemberScores, RunError> {
    let options = stage.options;
    let (Some(reference), Some(table)) = (stage.reference, stage.reference_table) else {
        if matches!(options.member_weighting, MemberWeighting::Ranked { .. }) {
            log::warn!("Ranked member weighting needs reference predictions; using uniform weights");
        }
        let uniform = MemberWeightChoice {
            weights: None,
            power: None,
            ks_distance: None,
            best_member: None,
        };
        return Ok((uniform, Vec::new()));
    };

    let truth = reference.require_targets()?;
    let evaluation = Evaluation {
        table,
        truth,
        weights: reference.weights(),
        scale_by_target: options.scale_metrics_by_target,
    };
    let choice = choose_member_weights(
        &options.member_weighting,
        &evaluation,
        stage.binning,
        &options.combine,
    );
    let metrics = member_metrics(
        table,
        truth,
        reference.weights(),
        options.scale_metrics_by_target,
    );
    if let Some(best) = choice.best_member {
        log::info!("Best single member on '{}': {}", reference.name(), best);
    }
    Ok((choice, table.members().iter().copied().zip(metrics).collect()))
}

fn build_scatter(
    reference: &Catalog,
    reference_table: Option<&PredictionTable>,
    member_weights: Option<&[f64]>,
    scatter_options: &ScatterOptions,
    options: &RunOptions,
    binning: &PdfBinning,
) -> Result<NeighborScatter, RunError> {
    let residual = scatter_options.source == ScatterSource::Residual;
    let pdfs: Option<Vec<ObjectPdf>> = if residual || scatter_options.augment_with_spread {
        let table = reference_table.ok_or_else(|| {
            UncertaintyError::InvalidOption(
                "residual or spread-augmented neighbour scatter needs reference predictions"
                    .to_string(),
            )
        })?;
        Some(
            (0..table.n_objects())
                .into_par_iter()
                .map(|row| combine(&table.ensemble_vector(row), member_weights, binning, &options.combine))
                .collect(),
        )
    } else {
        None
    };

    let predictions: Option<Array1<f64>> = pdfs
        .as_ref()
        .filter(|_| residual)
        .map(|pdfs| pdfs.iter().map(|pdf| reported(pdf, options.report)).collect());
    let derived: Option<Array2<f64>> = pdfs
        .as_ref()
        .filter(|_| scatter_options.augment_with_spread)
        .map(|pdfs| Array2::from_shape_fn((pdfs.len(), 1), |(row, _)| spread_value(&pdfs[row], options)));

    Ok(NeighborScatter::build(
        reference,
        scatter_options,
        ScatterInputs {
            predictions: predictions.as_ref().map(|p| p.view()),
            derived_columns: derived.as_ref().map(|d| d.view()),
        },
    )?)
}

fn reported(pdf: &ObjectPdf, kind: PointEstimateKind) -> f64 {
    pdf.estimates.as_ref().map_or(f64::NAN, |e| kind.pick(e))
}

fn spread_value(pdf: &ObjectPdf, options: &RunOptions) -> f64 {
    ensemble_spread(pdf, options.errors.ensemble_spread.unwrap_or_default()).map_or(f64::NAN, |e| e.value)
}

fn estimate_object(
    stage: &FinishStage<'_>,
    scatter: Option<&NeighborScatter>,
    row: usize,
    pdf: ObjectPdf,
) -> ObjectEstimate {
    let options = stage.options;
    let mut flags = Vec::new();
    if stage.partial {
        flags.push(ObjectFlag::PartialEnsemble);
    }
    if !pdf.valid {
        flags.push(ObjectFlag::InvalidPdf);
    }

    let training_coverage = stage
        .coverage
        .and_then(|coverage| match coverage.score(stage.application.feature_row(row)) {
            Ok(score) => {
                if coverage.is_outside(score) {
                    flags.push(ObjectFlag::OutsideTraining);
                }
                Some(score)
            }
            Err(error) => {
                log::debug!("Coverage check failed for object {}: {error}", stage.application.id(row));
                None
            }
        });

    let mut errors = Vec::new();
    if let Some(measure) = options.errors.ensemble_spread {
        errors.extend(ensemble_spread(&pdf, measure));
    }

    if let Some(scatter) = scatter {
        let augmented = options
            .errors
            .neighbor_scatter
            .as_ref()
            .is_some_and(|s| s.augment_with_spread);
        let derived = augmented.then(|| Array1::from_elem(1, spread_value(&pdf, options)));
        let outcome = match &derived {
            Some(d) if !d[0].is_finite() => None,
            _ => Some(scatter.estimate(
                stage.application.feature_row(row),
                derived.as_ref().map(|d| d.view()),
            )),
        };
        match outcome {
            Some(Ok(estimate)) => {
                if estimate.confidence == Confidence::Fallback {
                    flags.push(ObjectFlag::NeighborFallback);
                }
                errors.push(estimate);
            }
            Some(Err(UncertaintyError::NoNeighborsInRange { .. })) => {
                flags.push(ObjectFlag::NoNeighborsInRange);
            }
            Some(Err(error)) => {
                log::debug!("Neighbour scatter failed for object {}: {error}", stage.application.id(row));
                flags.push(ObjectFlag::ErrorEstimationFailed);
            }
            // No spread to search with; the invalid PDF is already flagged.
            None => {}
        }
    }

    if let (Some(resampler), Some(resampling), true) =
        (stage.resampler, &options.errors.input_resampling, pdf.valid)
    {
        let nominal: Vec<f64> = pdf.members.iter().map(|&(v, _)| v).collect();
        match resampler(row) {
            Ok(resampled) => match input_resampling_error(&nominal, &resampled, resampling.measure) {
                Some(estimate) => errors.push(estimate),
                None => flags.push(ObjectFlag::ErrorEstimationFailed),
            },
            Err(error) => {
                log::warn!("Input resampling failed for object {}: {error}", stage.application.id(row));
                flags.push(ObjectFlag::ErrorEstimationFailed);
            }
        }
    }

    let combined_error = combine_errors(&errors, options.errors.combination);
    ObjectEstimate {
        id: stage.application.id(row).clone(),
        estimates: pdf.estimates,
        reported: pdf.estimates.as_ref().map(|e| options.report.pick(e)),
        valid: pdf.valid,
        pdf,
        errors,
        combined_error,
        training_coverage,
        flags,
    }
}

/// Point estimates of a table's objects as one array, `NaN` where the PDF is invalid.
pub fn reported_values(objects: &[ObjectEstimate]) -> Array1<f64> {
    objects.iter().map(|o| o.reported.unwrap_or(f64::NAN)).collect()
}

