//! # Training Coverage
//!
//! Marks application objects that lie outside the part of feature space the training
//! catalog covers. Predictions there are extrapolations and carry little weight.
//!
//! Every training object has a reach: the distance to its k-th nearest training neighbour.
//! An application object at distance `d` from its own k-th nearest training object is
//! compared with the largest reach among those k training objects. Inside the training
//! distribution some neighbour usually reaches at least as far as `d`. Away from it `d`
//! keeps growing while the reaches stay at the local training scale.
//!
//! The score is `1 - max(0, d - reach) / d`, in `[0, 1]`. An object is outside the training
//! coverage when its relative excess `1 - score` is above `max_relative_distance`.

use crate::index::{BuildOptions, FeatureSpaceIndex, FeatureSubspace, IndexError, MetricSpec};
use crate::types::Catalog;
use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoverageError {
    #[error(
        "Training coverage needs k={k} neighbours, but catalog '{catalog}' only offers {available} usable objects."
    )]
    InsufficientNeighbors {
        catalog: String,
        k: usize,
        available: usize,
    },

    #[error("Coverage threshold {0} must lie in [0, 1].")]
    InvalidThreshold(f64),

    #[error("Feature-space index error during the coverage check: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageOptions {
    /// Training neighbours that define the reach of an object.
    pub k: usize,
    /// Largest tolerated relative excess of an object's distance over the local reach.
    pub max_relative_distance: f64,
    pub subspace: FeatureSubspace,
    pub metric: MetricSpec,
}

impl Default for CoverageOptions {
    fn default() -> Self {
        Self {
            k: 100,
            max_relative_distance: 0.1,
            subspace: FeatureSubspace::All,
            metric: MetricSpec::default(),
        }
    }
}

impl CoverageOptions {
    pub fn validate(&self) -> Result<(), CoverageError> {
        if !(0.0..=1.0).contains(&self.max_relative_distance) {
            return Err(CoverageError::InvalidThreshold(self.max_relative_distance));
        }
        Ok(())
    }
}

/// Reach of every training object, queried by application objects.
#[derive(Debug, Clone)]
pub struct TrainingCoverage {
    index: FeatureSpaceIndex,
    /// k-th neighbour distance by catalog row; `NaN` for rows outside the index.
    reach: Vec<f64>,
    options: CoverageOptions,
}

impl TrainingCoverage {
    pub fn build(training: &Catalog, options: &CoverageOptions) -> Result<Self, CoverageError> {
        options.validate()?;
        let k = options.k;
        let rows = training.positive_weight_rows();
        // Each training object skips itself, so k others must remain.
        if k == 0 || k >= rows.len() {
            return Err(CoverageError::InsufficientNeighbors {
                catalog: training.name().to_string(),
                k,
                available: rows.len(),
            });
        }
        let index = FeatureSpaceIndex::build_with(
            training,
            &options.subspace,
            options.metric,
            BuildOptions {
                rows: Some(&rows),
                ..BuildOptions::default()
            },
        )?;

        let reaches: Vec<(usize, f64)> = rows
            .par_iter()
            .map(|&row| {
                let point = index.query_point(training.feature_row(row), None)?;
                let mut neighbours = index.query(point.view(), k + 1)?;
                match neighbours.iter().position(|n| n.row == row) {
                    Some(own) => {
                        neighbours.remove(own);
                    }
                    None => neighbours.truncate(k),
                }
                Ok((row, neighbours.last().map_or(0.0, |n| n.distance)))
            })
            .collect::<Result<_, IndexError>>()?;
        let mut reach = vec![f64::NAN; training.len()];
        for (row, distance) in reaches {
            reach[row] = distance;
        }
        log::info!(
            "Training coverage over '{}': {} objects, k={}, threshold {}",
            training.name(),
            rows.len(),
            k,
            options.max_relative_distance
        );

        Ok(Self {
            index,
            reach,
            options: options.clone(),
        })
    }

    /// Coverage score of one object from its full feature vector, one well inside the
    /// training distribution and approaching zero far away from it.
    pub fn score(&self, features: ArrayView1<f64>) -> Result<f64, CoverageError> {
        let point = self.index.query_point(features, None)?;
        let neighbours = self.index.query(point.view(), self.options.k)?;
        let distance = neighbours.last().map_or(0.0, |n| n.distance);
        if distance <= 0.0 {
            return Ok(1.0);
        }
        let reach = neighbours
            .iter()
            .map(|n| self.reach[n.row])
            .fold(0.0, f64::max);
        let excess = ((distance - reach) / distance).clamp(0.0, 1.0);
        Ok(1.0 - excess)
    }

    pub fn is_outside(&self, score: f64) -> bool {
        1.0 - score > self.options.max_relative_distance
    }
}
