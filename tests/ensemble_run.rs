mod common;

use approx::assert_abs_diff_eq;
use astrolabe::binning::BinningSpec;
use astrolabe::configs::{FeatureSubsetPolicy, GeneratorSpec, SubsamplePolicy};
use astrolabe::coverage::CoverageOptions;
use astrolabe::execute::{AbortHandle, ExecutionControl};
use astrolabe::pipeline::run;
use astrolabe::progress::NoopProgress;
use astrolabe::selection::{MemberWeighting, Objective};
use astrolabe::types::CatalogError;
use astrolabe::uncertainty::{
    Confidence, ErrorStrategy, ResamplingOptions, ScatterOptions, ScatterSource, SpreadMeasure,
};
use astrolabe::weights::DensityWeightOptions;
use astrolabe::{
    Catalog, CatalogRole, Catalogs, ObjectFlag, RunContext, RunError, RunOptions, RunOutput,
};
use common::{LinearEngine, linear_catalog, linear_catalog_1d, truth_1d, with_feature_errors};
use ndarray::Array2;

fn options(ensemble_size: usize) -> RunOptions {
    RunOptions {
        ensemble_size,
        seed: 7,
        generator: GeneratorSpec {
            subsample: SubsamplePolicy::Bootstrap { fraction: 0.5 },
            ..GeneratorSpec::default()
        },
        binning: BinningSpec::Uniform {
            min: -3.0,
            max: 4.0,
            bins: 140,
        },
        ..RunOptions::default()
    }
}

fn catalogs(with_validation: bool) -> Catalogs {
    Catalogs {
        training: linear_catalog("train", CatalogRole::Training, 400, 0.0, 11, true),
        validation: with_validation
            .then(|| linear_catalog("valid", CatalogRole::Validation, 300, 0.0, 12, true)),
        application: linear_catalog("apply", CatalogRole::Application, 60, 0.3, 13, false),
    }
}

fn run_linear(catalogs: &Catalogs, options: &RunOptions) -> RunOutput {
    let context = RunContext::new(catalogs, options).unwrap();
    run(&LinearEngine::default(), &context, &NoopProgress).unwrap()
}

#[test]
fn repeated_runs_are_identical() {
    let catalogs = catalogs(true);
    let mut options = options(12);
    options.generator.feature_subset = FeatureSubsetPolicy::Random { min: 1, max: 2 };
    options.errors.neighbor_scatter = Some(ScatterOptions::default());

    let first = run_linear(&catalogs, &options);
    let second = run_linear(&catalogs, &options);
    assert_eq!(first.combined.objects, second.combined.objects);
    assert_eq!(first.combined.stacked_pdf, second.combined.stacked_pdf);
}

#[test]
fn valid_pdfs_have_unit_mass() {
    let catalogs = catalogs(false);
    let options = options(20);
    let output = run_linear(&catalogs, &options);

    assert_eq!(output.combined.objects.len(), 60);
    for object in &output.combined.objects {
        assert!(object.valid);
        assert_abs_diff_eq!(object.pdf.total_mass(), 1.0, epsilon = 1e-12);
        assert!(object.pdf.masses.iter().all(|&m| m >= 0.0));
        let estimates = object.estimates.unwrap();
        assert_eq!(object.reported, Some(estimates.median));
    }
    let stacked: f64 = output.combined.stacked_pdf.iter().sum();
    assert_abs_diff_eq!(stacked, 1.0, epsilon = 1e-12);
    assert_eq!(output.combined.bin_centers.len(), 140);
}

#[test]
fn identical_members_have_zero_spread() {
    let catalogs = catalogs(false);
    let mut options = options(8);
    options.generator.subsample = SubsamplePolicy::Full;
    let output = run_linear(&catalogs, &options);

    for object in &output.combined.objects {
        let estimates = object.estimates.unwrap();
        assert_eq!(estimates.mean, estimates.median);
        assert_eq!(estimates.median, estimates.mode);
        let spread = object.error(ErrorStrategy::EnsembleSpread).unwrap();
        assert_eq!(spread.value, 0.0);
        assert_eq!(object.combined_error, Some(0.0));
    }
}

#[test]
fn larger_ensembles_have_smaller_standard_errors() {
    let catalogs = catalogs(false);
    let mean_error = |ensemble_size: usize| {
        let mut options = options(ensemble_size);
        options.errors.ensemble_spread = Some(SpreadMeasure::StandardError);
        let output = run_linear(&catalogs, &options);
        let errors: Vec<f64> = output
            .combined
            .objects
            .iter()
            .map(|o| o.error(ErrorStrategy::EnsembleSpread).unwrap().value)
            .collect();
        errors.iter().sum::<f64>() / errors.len() as f64
    };
    let small = mean_error(5);
    let large = mean_error(50);
    assert!(large < small, "N=50 error {large} is not below N=5 error {small}");
}

#[test]
fn too_few_valid_predictions_invalidate_objects() {
    let catalogs = catalogs(false);
    let mut options = options(10);
    options.combine.min_valid_predictions = 5;
    let engine = LinearEngine {
        predicting_members: Some(1),
    };
    let context = RunContext::new(&catalogs, &options).unwrap();
    let output = run(&engine, &context, &NoopProgress).unwrap();

    assert_eq!(output.failures.completed, 10);
    for object in &output.combined.objects {
        assert!(!object.valid);
        assert_eq!(object.pdf.n_valid, 1);
        assert!(object.estimates.is_none());
        assert!(object.reported.is_none());
        assert!(object.combined_error.is_none());
        assert!(object.has_flag(ObjectFlag::InvalidPdf));
    }
    assert!(output.combined.stacked_pdf.iter().all(|&m| m == 0.0));
}

#[test]
fn malformed_catalog_sets_are_fatal() {
    let options = options(4);

    let mut mismatched = catalogs(false);
    mismatched.application = Catalog::new(
        "apply",
        CatalogRole::Application,
        vec!["x0".to_string()],
        vec!["a".into()],
        Array2::zeros((1, 1)),
    )
    .unwrap();
    assert!(matches!(
        RunContext::new(&mismatched, &options),
        Err(RunError::DimensionMismatch {
            expected: 2,
            found: 1,
            ..
        })
    ));

    let mut empty = catalogs(false);
    empty.application = Catalog::new(
        "apply",
        CatalogRole::Application,
        vec!["x0".to_string(), "x1".to_string()],
        Vec::new(),
        Array2::zeros((0, 2)),
    )
    .unwrap();
    assert!(matches!(
        RunContext::new(&empty, &options),
        Err(RunError::EmptyCatalog {
            role: CatalogRole::Application,
            ..
        })
    ));

    let mut resampling = options.clone();
    resampling.errors.input_resampling = Some(ResamplingOptions::default());
    assert!(matches!(
        RunContext::new(&catalogs(false), &resampling),
        Err(RunError::Catalog(CatalogError::MissingFeatureErrors(_)))
    ));
}

#[test]
fn abort_before_start_discards_the_run() {
    let catalogs = catalogs(false);
    let options = options(6);
    let handle = AbortHandle::new();
    handle.abort();
    let control = ExecutionControl::new().with_abort_handle(handle);
    let context = RunContext::with_control(&catalogs, &options, control).unwrap();
    let err = run(&LinearEngine::default(), &context, &NoopProgress).unwrap_err();
    assert!(matches!(err, RunError::Aborted { .. }));
}

#[test]
fn input_resampling_widens_the_ensemble_spread() {
    let mut catalogs = catalogs(false);
    catalogs.application = with_feature_errors(catalogs.application, 0.5);
    let mut options = options(10);
    options.errors.input_resampling = Some(ResamplingOptions {
        repetitions: 40,
        ..ResamplingOptions::default()
    });
    let output = run_linear(&catalogs, &options);

    let wider = output
        .combined
        .objects
        .iter()
        .filter(|o| {
            let spread = o.error(ErrorStrategy::EnsembleSpread).unwrap().value;
            let resampled = o.error(ErrorStrategy::InputResampling).unwrap().value;
            resampled > spread
        })
        .count();
    assert!(wider >= 55, "only {wider} of 60 objects widened");
    // Resampling stands in for the plain spread in the reported error.
    for object in &output.combined.objects {
        let resampled = object.error(ErrorStrategy::InputResampling).unwrap().value;
        assert_eq!(object.combined_error, Some(resampled));
    }
}

#[test]
fn residual_neighbour_scatter_tracks_the_noise_level() {
    let catalogs = catalogs(true);
    let mut options = options(10);
    options.errors.neighbor_scatter = Some(ScatterOptions {
        source: ScatterSource::Residual,
        ..ScatterOptions::default()
    });
    let output = run_linear(&catalogs, &options);

    let mut values: Vec<f64> = Vec::new();
    for object in &output.combined.objects {
        let scatter = object.error(ErrorStrategy::NeighborScatter).unwrap();
        assert_eq!(scatter.confidence, Confidence::Nominal);
        assert_eq!(object.combined_error, Some(scatter.value));
        values.push(scatter.value);
    }
    values.sort_by(f64::total_cmp);
    let median = values[values.len() / 2];
    assert!((0.02..0.1).contains(&median), "median residual scatter {median}");
}

#[test]
fn out_of_range_neighbour_searches_are_flagged() {
    let mut catalogs = catalogs(false);
    catalogs.application = linear_catalog("apply", CatalogRole::Application, 20, 40.0, 14, false);
    let mut options = options(6);
    options.errors.neighbor_scatter = Some(ScatterOptions {
        max_distance: Some(1.0),
        metric: astrolabe::index::MetricSpec {
            standardize: false,
            ..Default::default()
        },
        ..ScatterOptions::default()
    });
    options.binning = BinningSpec::Uniform {
        min: -3.0,
        max: 30.0,
        bins: 330,
    };
    let output = run_linear(&catalogs, &options);
    for object in &output.combined.objects {
        assert!(object.has_flag(ObjectFlag::NoNeighborsInRange));
        assert!(object.error(ErrorStrategy::NeighborScatter).is_none());
        // The ensemble spread is still reported.
        assert!(object.combined_error.is_some());
    }
}

#[test]
fn density_weights_and_ranked_members_are_reported() {
    let catalogs = catalogs(true);
    let mut options = options(10);
    options.generator.feature_subset = FeatureSubsetPolicy::Random { min: 1, max: 2 };
    options.density_weights = Some(DensityWeightOptions {
        k: 15,
        ..DensityWeightOptions::default()
    });
    options.member_weighting = MemberWeighting::Ranked {
        objective: Objective::Sigma68,
        powers: vec![0.0, 1.0],
        min_weight: 0.0,
        min_members: 1,
    };
    let output = run_linear(&catalogs, &options);

    let weights = output.density_weights.unwrap();
    assert_eq!(weights.weights.len(), 400);
    assert_abs_diff_eq!(weights.weights.mean().unwrap(), 1.0, epsilon = 1e-9);

    let choice = &output.combined.member_weights;
    assert!(choice.power.is_some());
    let member_weights = choice.weights.as_ref().unwrap();
    assert_eq!(member_weights.len(), 10);
    assert_abs_diff_eq!(member_weights.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    assert_eq!(output.combined.member_metrics.len(), 10);
}

#[test]
fn held_out_estimates_recover_a_linear_relation() {
    let catalogs = Catalogs {
        training: linear_catalog_1d("train", CatalogRole::Training, 1000, 71, true),
        validation: None,
        application: linear_catalog_1d("apply", CatalogRole::Application, 200, 72, false),
    };
    let output = run_linear(&catalogs, &options(50));

    let features = catalogs.application.features();
    let mut deviations: Vec<f64> = Vec::new();
    for (row, object) in output.combined.objects.iter().enumerate() {
        assert!(object.valid);
        let reported = object.reported.unwrap();
        let deviation = (reported - truth_1d(features[[row, 0]])).abs();
        assert!(deviation < 0.02, "object {} is off by {deviation}", object.id);
        deviations.push(deviation);
    }
    let mean_deviation = deviations.iter().sum::<f64>() / deviations.len() as f64;
    assert!(mean_deviation < 0.01, "mean deviation {mean_deviation}");
}

#[test]
fn objects_outside_the_training_coverage_are_flagged() {
    let mut catalogs = catalogs(false);
    let mut options = options(6);
    options.training_coverage = Some(CoverageOptions {
        k: 30,
        ..CoverageOptions::default()
    });
    options.binning = BinningSpec::Uniform {
        min: -3.0,
        max: 30.0,
        bins: 330,
    };

    let covered = run_linear(&catalogs, &options);
    let flagged = covered
        .combined
        .objects
        .iter()
        .filter(|o| o.has_flag(ObjectFlag::OutsideTraining))
        .count();
    assert!(flagged <= 6, "{flagged} of 60 in-distribution objects flagged");
    assert!(covered.combined.objects.iter().all(|o| o.training_coverage.is_some()));

    catalogs.application = linear_catalog("apply", CatalogRole::Application, 20, 40.0, 14, false);
    let disjoint = run_linear(&catalogs, &options);
    for object in &disjoint.combined.objects {
        assert!(object.has_flag(ObjectFlag::OutsideTraining));
        let score = object.training_coverage.unwrap();
        assert!(score < 0.1, "coverage score {score} for {}", object.id);
        // The estimate itself is still produced.
        assert!(object.valid);
    }

    options.training_coverage = None;
    let unchecked = run_linear(&catalogs, &options);
    assert!(unchecked.combined.objects.iter().all(|o| o.training_coverage.is_none()));
}
