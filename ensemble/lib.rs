#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod binning;
pub mod combine;
pub mod configs;
pub mod coverage;
pub mod data;
pub mod engine;
pub mod error;
pub mod execute;
pub mod index;
pub mod metrics;
pub mod options;
pub mod pipeline;
pub mod progress;
pub mod seeding;
pub mod selection;
pub mod stats;
pub mod types;
pub mod uncertainty;
pub mod weights;

pub use engine::{EngineError, ModelEngine, PredictionTable, TrainingSample};
pub use error::RunError;
pub use options::RunOptions;
pub use pipeline::{CombinedOutput, ObjectEstimate, ObjectFlag, RunContext, RunOutput, run};
pub use types::{Catalog, CatalogRole, Catalogs, ObjectId};
