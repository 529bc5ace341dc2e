//! # Configuration Generator
//!
//! Draws the N member configurations of an ensemble. Each configuration fixes a derived seed,
//! the feature columns the member may see, the training rows it is fitted on and a map of
//! hyperparameters opaque to the core.
//!
//! Configuration `i` is drawn from its own RNG stream, `derive_seed(seed, Configuration, i)`,
//! so a run of N members is an exact prefix of a run of M > N members with the same seed.

use crate::seeding::{SeedStream, derive_seed, stream_rng};
use rand::Rng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Hyperparameter '{name}' has an invalid range: {reason}")]
    InvalidRange { name: String, reason: String },

    #[error("Hyperparameter '{0}' is a choice with no options.")]
    EmptyChoice(String),

    #[error(
        "Feature subsets of size {min}..={max} cannot be drawn from {available} features."
    )]
    InvalidFeatureSubset {
        min: usize,
        max: usize,
        available: usize,
    },

    #[error("Sub-sample fraction {0} is outside (0, 1].")]
    InvalidSubsample(f64),

    #[error("The training catalog is empty; no member can be trained.")]
    EmptyTrainingSample,

    #[error("An ensemble needs at least one member.")]
    EmptyEnsemble,
}

/// A concrete hyperparameter value handed to the model engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperparameterValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl HyperparameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for HyperparameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Where a hyperparameter is drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HyperparameterRange {
    Uniform { low: f64, high: f64 },
    LogUniform { low: f64, high: f64 },
    /// Inclusive on both ends.
    Integer { low: i64, high: i64 },
    Choice { options: Vec<String> },
    Fixed { value: HyperparameterValue },
}

impl HyperparameterRange {
    fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidRange {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        match self {
            Self::Uniform { low, high } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid("bounds must be finite"));
                }
                if low >= high {
                    return Err(invalid("low must be below high"));
                }
            }
            Self::LogUniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || *low <= 0.0 {
                    return Err(invalid("log-uniform bounds must be finite and positive"));
                }
                if low >= high {
                    return Err(invalid("low must be below high"));
                }
            }
            Self::Integer { low, high } => {
                if low > high {
                    return Err(invalid("low must not exceed high"));
                }
            }
            Self::Choice { options } => {
                if options.is_empty() {
                    return Err(ConfigurationError::EmptyChoice(name.to_string()));
                }
            }
            Self::Fixed { .. } => {}
        }
        Ok(())
    }

    fn draw<R: Rng>(&self, rng: &mut R) -> HyperparameterValue {
        match self {
            Self::Uniform { low, high } => HyperparameterValue::Float(rng.gen_range(*low..*high)),
            Self::LogUniform { low, high } => {
                HyperparameterValue::Float(rng.gen_range(low.ln()..high.ln()).exp())
            }
            Self::Integer { low, high } => HyperparameterValue::Int(rng.gen_range(*low..=*high)),
            Self::Choice { options } => {
                HyperparameterValue::Text(options[rng.gen_range(0..options.len())].clone())
            }
            Self::Fixed { value } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSubsetPolicy {
    #[default]
    All,
    Random { min: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubsamplePolicy {
    #[default]
    Full,
    /// Draw `fraction` of the training rows without replacement.
    Subset { fraction: f64 },
    /// Draw `fraction` of the training rows with replacement.
    Bootstrap { fraction: f64 },
}

/// Everything that is randomized per member.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSpec {
    pub hyperparameters: BTreeMap<String, HyperparameterRange>,
    pub feature_subset: FeatureSubsetPolicy,
    pub subsample: SubsamplePolicy,
}

impl GeneratorSpec {
    pub fn validate(&self, n_features: usize) -> Result<(), ConfigurationError> {
        for (name, range) in &self.hyperparameters {
            range.validate(name)?;
        }
        if let FeatureSubsetPolicy::Random { min, max } = self.feature_subset {
            if min == 0 || min > max || max > n_features {
                return Err(ConfigurationError::InvalidFeatureSubset {
                    min,
                    max,
                    available: n_features,
                });
            }
        }
        match self.subsample {
            SubsamplePolicy::Subset { fraction } | SubsamplePolicy::Bootstrap { fraction } => {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(ConfigurationError::InvalidSubsample(fraction));
                }
            }
            SubsamplePolicy::Full => {}
        }
        Ok(())
    }
}

/// Shape of the data the configurations are drawn against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleShape {
    pub n_features: usize,
    pub n_training: usize,
}

/// One immutable member configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: usize,
    pub seed: u64,
    /// Sorted feature column indices the member trains on.
    pub features: Vec<usize>,
    /// Training catalog rows; may repeat under bootstrap sampling.
    pub rows: Vec<usize>,
    pub hyperparameters: BTreeMap<String, HyperparameterValue>,
}

impl Configuration {
    pub fn hyperparameter(&self, name: &str) -> Option<&HyperparameterValue> {
        self.hyperparameters.get(name)
    }
}

/// Draws `n` configurations. Identical arguments give identical sequences.
pub fn generate(
    n: usize,
    seed: u64,
    spec: &GeneratorSpec,
    shape: SampleShape,
) -> Result<Vec<Configuration>, ConfigurationError> {
    if n == 0 {
        return Err(ConfigurationError::EmptyEnsemble);
    }
    if shape.n_training == 0 {
        return Err(ConfigurationError::EmptyTrainingSample);
    }
    spec.validate(shape.n_features)?;

    let configurations: Vec<Configuration> =
        (0..n).map(|i| draw_configuration(i, seed, spec, shape)).collect();
    log::debug!(
        "Generated {} configurations from seed {} over {} features and {} training rows",
        n,
        seed,
        shape.n_features,
        shape.n_training
    );
    Ok(configurations)
}

fn draw_configuration(
    id: usize,
    seed: u64,
    spec: &GeneratorSpec,
    shape: SampleShape,
) -> Configuration {
    let mut rng = stream_rng(seed, SeedStream::Configuration, id as u64);

    let hyperparameters = spec
        .hyperparameters
        .iter()
        .map(|(name, range)| (name.clone(), range.draw(&mut rng)))
        .collect();

    let features = match spec.feature_subset {
        FeatureSubsetPolicy::All => (0..shape.n_features).collect(),
        FeatureSubsetPolicy::Random { min, max } => {
            let size = rng.gen_range(min..=max);
            let mut chosen = sample(&mut rng, shape.n_features, size).into_vec();
            chosen.sort_unstable();
            chosen
        }
    };

    let sample_size = |fraction: f64| {
        ((fraction * shape.n_training as f64).round() as usize).clamp(1, shape.n_training)
    };
    let rows = match spec.subsample {
        SubsamplePolicy::Full => (0..shape.n_training).collect(),
        SubsamplePolicy::Subset { fraction } => {
            let mut rows = sample(&mut rng, shape.n_training, sample_size(fraction)).into_vec();
            rows.sort_unstable();
            rows
        }
        SubsamplePolicy::Bootstrap { fraction } => {
            let mut rows: Vec<usize> = (0..sample_size(fraction))
                .map(|_| rng.gen_range(0..shape.n_training))
                .collect();
            rows.sort_unstable();
            rows
        }
    };

    Configuration {
        id,
        seed: derive_seed(seed, SeedStream::Subsample, id as u64),
        features,
        rows,
        hyperparameters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GeneratorSpec {
        let mut hyperparameters = BTreeMap::new();
        hyperparameters.insert(
            "learning_rate".to_string(),
            HyperparameterRange::LogUniform {
                low: 1e-3,
                high: 1e-1,
            },
        );
        hyperparameters.insert(
            "depth".to_string(),
            HyperparameterRange::Integer { low: 2, high: 6 },
        );
        hyperparameters.insert(
            "loss".to_string(),
            HyperparameterRange::Choice {
                options: vec!["l1".to_string(), "l2".to_string()],
            },
        );
        GeneratorSpec {
            hyperparameters,
            feature_subset: FeatureSubsetPolicy::Random { min: 2, max: 4 },
            subsample: SubsamplePolicy::Bootstrap { fraction: 0.5 },
        }
    }

    const SHAPE: SampleShape = SampleShape {
        n_features: 5,
        n_training: 100,
    };

    #[test]
    fn same_seed_same_sequence() {
        let a = generate(20, 11, &spec(), SHAPE).unwrap();
        let b = generate(20, 11, &spec(), SHAPE).unwrap();
        assert_eq!(a, b);
        let c = generate(20, 12, &spec(), SHAPE).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn longer_runs_extend_shorter_ones() {
        let short = generate(5, 3, &spec(), SHAPE).unwrap();
        let long = generate(50, 3, &spec(), SHAPE).unwrap();
        assert_eq!(short[..], long[..5]);
    }

    #[test]
    fn draws_respect_policies() {
        for configuration in generate(30, 1, &spec(), SHAPE).unwrap() {
            assert!((2..=4).contains(&configuration.features.len()));
            assert!(configuration.features.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(configuration.rows.len(), 50);
            assert!(configuration.rows.iter().all(|&r| r < 100));
            let rate = configuration.hyperparameter("learning_rate").unwrap();
            let rate = rate.as_f64().unwrap();
            assert!((1e-3..1e-1).contains(&rate));
            match configuration.hyperparameter("depth") {
                Some(HyperparameterValue::Int(d)) => assert!((2..=6).contains(d)),
                other => panic!("unexpected depth {other:?}"),
            }
        }
    }

    #[test]
    fn subset_sampling_has_no_repeats() {
        let spec = GeneratorSpec {
            subsample: SubsamplePolicy::Subset { fraction: 0.3 },
            ..GeneratorSpec::default()
        };
        for configuration in generate(10, 9, &spec, SHAPE).unwrap() {
            assert_eq!(configuration.rows.len(), 30);
            assert!(configuration.rows.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(configuration.features, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn rejects_inverted_and_empty_ranges() {
        let mut bad = GeneratorSpec::default();
        bad.hyperparameters.insert(
            "alpha".to_string(),
            HyperparameterRange::Uniform {
                low: 2.0,
                high: 1.0,
            },
        );
        assert!(matches!(
            generate(3, 0, &bad, SHAPE),
            Err(ConfigurationError::InvalidRange { .. })
        ));

        let mut empty = GeneratorSpec::default();
        empty
            .hyperparameters
            .insert("kind".to_string(), HyperparameterRange::Choice { options: vec![] });
        assert_eq!(
            generate(3, 0, &empty, SHAPE),
            Err(ConfigurationError::EmptyChoice("kind".to_string()))
        );

        assert_eq!(
            generate(0, 0, &GeneratorSpec::default(), SHAPE),
            Err(ConfigurationError::EmptyEnsemble)
        );
    }
}
