use crate::binning::BinningError;
use crate::configs::ConfigurationError;
use crate::coverage::CoverageError;
use crate::options::OptionsError;
use crate::types::{CatalogError, CatalogRole};
use crate::uncertainty::UncertaintyError;
use crate::weights::WeightError;
use thiserror::Error;

/// Errors that end a run. Soft failures (one member, one object) never reach this type.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("The {role} catalog '{catalog}' is empty.")]
    EmptyCatalog { role: CatalogRole, catalog: String },

    #[error(
        "The {role} catalog '{catalog}' has {found} features, but the training catalog has {expected}."
    )]
    DimensionMismatch {
        role: CatalogRole,
        catalog: String,
        expected: usize,
        found: usize,
    },

    #[error("Configuration generator: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("PDF binning: {0}")]
    Binning(#[from] BinningError),

    #[error("Invalid run options: {0}")]
    Options(#[from] OptionsError),

    #[error("Density-ratio weights for '{catalog}' ({objects} objects): {source}")]
    Weights {
        catalog: String,
        objects: usize,
        #[source]
        source: WeightError,
    },

    #[error("Training coverage over '{catalog}': {source}")]
    Coverage {
        catalog: String,
        #[source]
        source: CoverageError,
    },

    #[error("The prediction table for '{catalog}' does not fit: {reason}")]
    PredictionTable { catalog: String, reason: String },

    #[error("Error estimation: {0}")]
    Uncertainty(#[from] UncertaintyError),

    #[error(
        "{component} exceeded the run deadline with {completed} units complete; at least {required} are needed to continue."
    )]
    Timeout {
        component: &'static str,
        completed: usize,
        required: usize,
    },

    #[error("{component} was aborted; in-flight work was discarded.")]
    Aborted { component: &'static str },

    #[error(
        "{failed} of {attempted} ensemble members failed, above the tolerated failure rate of {threshold}."
    )]
    ExcessiveFailures {
        failed: usize,
        attempted: usize,
        threshold: f64,
    },
}

impl RunError {
    /// Lifts a weighting failure, keeping deadline and abort as run-level causes.
    pub fn from_weights(catalog: &str, objects: usize, source: WeightError) -> Self {
        match source {
            WeightError::Timeout => Self::Timeout {
                component: "density weighting",
                completed: 0,
                required: 1,
            },
            WeightError::Aborted => Self::Aborted {
                component: "density weighting",
            },
            source => Self::Weights {
                catalog: catalog.to_string(),
                objects,
                source,
            },
        }
    }
}
