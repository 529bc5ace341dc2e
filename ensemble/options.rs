//! Run-level options, stored as TOML.
//!
//! Every section has defaults, so a file only needs the keys it changes.

use crate::binning::BinningSpec;
use crate::combine::{CombineOptions, PointEstimates};
use crate::configs::{FeatureSubsetPolicy, GeneratorSpec};
use crate::coverage::CoverageOptions;
use crate::execute::ExecutionControl;
use crate::selection::MemberWeighting;
use crate::uncertainty::{ErrorCombination, ResamplingOptions, ScatterOptions, SpreadMeasure};
use crate::weights::DensityWeightOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("Failed to read or write the options file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the TOML options file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize options to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Option '{field}' is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> OptionsError {
    OptionsError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Which point estimate is reported as "the" estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointEstimateKind {
    Mean,
    #[default]
    Median,
    Mode,
}

impl PointEstimateKind {
    pub fn pick(self, estimates: &PointEstimates) -> f64 {
        match self {
            Self::Mean => estimates.mean,
            Self::Median => estimates.median,
            Self::Mode => estimates.mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorOptions {
    /// `None` disables the ensemble-spread strategy.
    pub ensemble_spread: Option<SpreadMeasure>,
    pub neighbor_scatter: Option<ScatterOptions>,
    pub input_resampling: Option<ResamplingOptions>,
    pub combination: ErrorCombination,
}

impl Default for ErrorOptions {
    fn default() -> Self {
        Self {
            ensemble_spread: Some(SpreadMeasure::StdDev),
            neighbor_scatter: None,
            input_resampling: None,
            combination: ErrorCombination::PreferNeighbor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub timeout_secs: Option<f64>,
    pub min_partial_members: usize,
    pub max_failure_rate: f64,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            min_partial_members: 1,
            max_failure_rate: 0.5,
        }
    }
}

impl ExecutionOptions {
    /// A fresh control whose deadline, if any, starts now.
    pub fn to_control(&self) -> ExecutionControl {
        let control = ExecutionControl::new()
            .with_min_partial_members(self.min_partial_members)
            .with_max_failure_rate(self.max_failure_rate);
        match self.timeout_secs {
            Some(secs) => control.with_timeout(Duration::from_secs_f64(secs)),
            None => control,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub ensemble_size: usize,
    pub seed: u64,
    pub generator: GeneratorSpec,
    pub binning: BinningSpec,
    pub combine: CombineOptions,
    pub report: PointEstimateKind,
    /// `None` disables density-ratio weighting.
    pub density_weights: Option<DensityWeightOptions>,
    pub errors: ErrorOptions,
    /// `None` skips the outside-training flag.
    pub training_coverage: Option<CoverageOptions>,
    pub member_weighting: MemberWeighting,
    /// Evaluate members on `(prediction - truth) / (1 + truth)`.
    pub scale_metrics_by_target: bool,
    pub execution: ExecutionOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ensemble_size: 50,
            seed: 1,
            generator: GeneratorSpec::default(),
            binning: BinningSpec::default(),
            combine: CombineOptions::default(),
            report: PointEstimateKind::Median,
            density_weights: None,
            errors: ErrorOptions::default(),
            training_coverage: None,
            member_weighting: MemberWeighting::Uniform,
            scale_metrics_by_target: false,
            execution: ExecutionOptions::default(),
        }
    }
}

impl RunOptions {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OptionsError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let toml_string = fs::read_to_string(path)?;
        let options: Self = toml::from_str(&toml_string)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks everything that does not depend on the catalogs.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.ensemble_size == 0 {
            return Err(invalid("ensemble_size", "must be at least 1"));
        }
        if let FeatureSubsetPolicy::Random { min, max } = self.generator.feature_subset {
            if min == 0 || min > max {
                return Err(invalid(
                    "generator.feature_subset",
                    format!("needs 1 <= min <= max, got {min}..={max}"),
                ));
            }
        }
        // Feature counts are checked when the run knows its catalogs.
        let without_subset = GeneratorSpec {
            feature_subset: FeatureSubsetPolicy::All,
            ..self.generator.clone()
        };
        without_subset
            .validate(0)
            .map_err(|e| invalid("generator", e.to_string()))?;
        self.binning
            .build()
            .map_err(|e| invalid("binning", e.to_string()))?;
        if self.combine.min_valid_predictions == 0 {
            return Err(invalid("combine.min_valid_predictions", "must be at least 1"));
        }
        if let Some(weights) = &self.density_weights {
            weights
                .validate()
                .map_err(|e| invalid("density_weights", e.to_string()))?;
            if weights.k == 0 {
                return Err(invalid("density_weights.k", "must be at least 1"));
            }
        }
        if let Some(coverage) = &self.training_coverage {
            coverage
                .validate()
                .map_err(|e| invalid("training_coverage", e.to_string()))?;
            if coverage.k == 0 {
                return Err(invalid("training_coverage.k", "must be at least 1"));
            }
        }
        if let Some(scatter) = &self.errors.neighbor_scatter {
            scatter
                .validate()
                .map_err(|e| invalid("errors.neighbor_scatter", e.to_string()))?;
        }
        if let Some(resampling) = &self.errors.input_resampling {
            if resampling.repetitions == 0 {
                return Err(invalid("errors.input_resampling.repetitions", "must be at least 1"));
            }
        }
        if let MemberWeighting::Ranked {
            powers, min_weight, ..
        } = &self.member_weighting
        {
            if powers.is_empty() || powers.iter().any(|p| !p.is_finite()) {
                return Err(invalid("member_weighting.powers", "needs at least one finite power"));
            }
            if !(0.0..1.0).contains(min_weight) {
                return Err(invalid("member_weighting.min_weight", "must lie in [0, 1)"));
            }
        }
        if !(0.0..=1.0).contains(&self.execution.max_failure_rate) {
            return Err(invalid("execution.max_failure_rate", "must lie in [0, 1]"));
        }
        if let Some(secs) = self.execution.timeout_secs {
            if !(secs > 0.0) || !secs.is_finite() {
                return Err(invalid("execution.timeout_secs", "must be positive and finite"));
            }
        }
        Ok(())
    }
}
