//! # Model Engine Adapter
//!
//! The ensemble core never fits a model itself. A back-end implements [`ModelEngine`], and
//! this module adapts a [`Configuration`] and a catalog into the engine's inputs: only the
//! configuration's feature columns, only its training rows, the row weights in force for
//! the run. Predictions come back as dense tables with `NaN` standing for "no prediction".

use crate::configs::Configuration;
use crate::types::Catalog;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Training member {member} failed: {reason}")]
    Training { member: usize, reason: String },

    #[error("Inference with member {member} failed: {reason}")]
    Inference { member: usize, reason: String },

    #[error("Member {member} returned {found} predictions for {expected} objects.")]
    OutputLength {
        member: usize,
        expected: usize,
        found: usize,
    },
}

impl EngineError {
    pub fn training(member: usize, reason: impl Into<String>) -> Self {
        Self::Training {
            member,
            reason: reason.into(),
        }
    }

    pub fn inference(member: usize, reason: impl Into<String>) -> Self {
        Self::Inference {
            member,
            reason: reason.into(),
        }
    }
}

/// The labeled sample handed to an engine for one member.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    /// `[n_rows, configuration.features.len()]`.
    pub features: Array2<f64>,
    pub targets: Array1<f64>,
    pub weights: Array1<f64>,
}

impl TrainingSample {
    /// Gathers the configuration's rows and columns from a labeled catalog. Rows whose weight
    /// is zero are left out.
    pub fn gather(
        configuration: &Configuration,
        catalog: &Catalog,
        weights: ArrayView1<f64>,
    ) -> Result<Self, EngineError> {
        let targets = catalog
            .require_targets()
            .map_err(|e| EngineError::training(configuration.id, e.to_string()))?;
        let rows: Vec<usize> = configuration
            .rows
            .iter()
            .copied()
            .filter(|&row| weights[row] > 0.0)
            .collect();
        if rows.is_empty() {
            return Err(EngineError::training(
                configuration.id,
                "every sampled training row has zero weight",
            ));
        }
        let features = select(catalog.features(), &rows, &configuration.features);
        Ok(Self {
            features,
            targets: rows.iter().map(|&r| targets[r]).collect(),
            weights: rows.iter().map(|&r| weights[r]).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn select(features: ArrayView2<f64>, rows: &[usize], columns: &[usize]) -> Array2<f64> {
    features.select(Axis(0), rows).select(Axis(1), columns)
}

/// A training and inference back-end.
///
/// `train` and `infer` are called concurrently from many threads, one member per call.
/// Implementations must not share mutable state between calls.
pub trait ModelEngine: Sync {
    type Model: Send + Sync;

    fn train(
        &self,
        configuration: &Configuration,
        sample: &TrainingSample,
    ) -> Result<Self::Model, EngineError>;

    /// One prediction per row of `features` (the configuration's columns only); `None` where
    /// the model cannot produce a value.
    fn infer(
        &self,
        configuration: &Configuration,
        model: &Self::Model,
        features: ArrayView2<f64>,
    ) -> Result<Vec<Option<f64>>, EngineError>;
}

/// Runs a trained member on full-schema feature rows and returns one value per row,
/// `NaN` where the engine gave nothing usable.
pub fn predict<E: ModelEngine>(
    engine: &E,
    configuration: &Configuration,
    model: &E::Model,
    features: ArrayView2<f64>,
) -> Result<Vec<f64>, EngineError> {
    let inputs = features.select(Axis(1), &configuration.features);
    let outputs = engine.infer(configuration, model, inputs.view())?;
    if outputs.len() != features.nrows() {
        return Err(EngineError::OutputLength {
            member: configuration.id,
            expected: features.nrows(),
            found: outputs.len(),
        });
    }
    Ok(outputs
        .into_iter()
        .map(|p| p.filter(|v| v.is_finite()).unwrap_or(f64::NAN))
        .collect())
}

/// Predictions of every member for every object of one catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionTable {
    /// Configuration id of each column.
    members: Vec<usize>,
    /// `[n_objects, n_members]`.
    values: Array2<f64>,
}

impl PredictionTable {
    /// Builds a table from one column per member.
    pub fn from_columns(n_objects: usize, columns: Vec<(usize, Vec<f64>)>) -> Self {
        let mut values = Array2::from_elem((n_objects, columns.len()), f64::NAN);
        let mut members = Vec::with_capacity(columns.len());
        for (j, (member, column)) in columns.into_iter().enumerate() {
            for (i, v) in column.into_iter().enumerate().take(n_objects) {
                values[[i, j]] = v;
            }
            members.push(member);
        }
        Self { members, values }
    }

    pub fn from_array(members: Vec<usize>, values: Array2<f64>) -> Self {
        Self { members, values }
    }

    pub fn n_objects(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_members(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// The ensemble vector of one object.
    pub fn ensemble_vector(&self, object: usize) -> Vec<f64> {
        self.values.row(object).to_vec()
    }

    pub fn member_column(&self, column: usize) -> ArrayView1<'_, f64> {
        self.values.column(column)
    }

    /// Keeps only the given columns, in the given order.
    pub fn select_members(&self, columns: &[usize]) -> Self {
        Self {
            members: columns.iter().map(|&c| self.members[c]).collect(),
            values: self.values.select(Axis(1), columns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CatalogRole, ObjectId};
    use ndarray::array;
    use std::collections::BTreeMap;

    struct Echo;

    impl ModelEngine for Echo {
        type Model = ();

        fn train(&self, _: &Configuration, _: &TrainingSample) -> Result<(), EngineError> {
            Ok(())
        }

        fn infer(
            &self,
            _: &Configuration,
            _: &(),
            features: ArrayView2<f64>,
        ) -> Result<Vec<Option<f64>>, EngineError> {
            Ok(features
                .rows()
                .into_iter()
                .map(|r| (r[0] >= 0.0).then_some(r[0]))
                .collect())
        }
    }

    fn configuration(features: Vec<usize>, rows: Vec<usize>) -> Configuration {
        Configuration {
            id: 4,
            seed: 0,
            features,
            rows,
            hyperparameters: BTreeMap::new(),
        }
    }

    #[test]
    fn gather_selects_rows_columns_and_skips_zero_weights() {
        let catalog = Catalog::new(
            "train",
            CatalogRole::Training,
            vec!["a".into(), "b".into()],
            vec![ObjectId::from("x"), ObjectId::from("y"), ObjectId::from("z")],
            array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]],
        )
        .unwrap()
        .with_targets(array![0.1, 0.2, 0.3])
        .unwrap();
        let config = configuration(vec![1], vec![0, 1, 2, 2]);
        let sample = TrainingSample::gather(&config, &catalog, array![1.0, 0.0, 2.0].view()).unwrap();
        assert_eq!(sample.features, array![[10.0], [30.0], [30.0]]);
        assert_eq!(sample.targets, array![0.1, 0.3, 0.3]);
        assert_eq!(sample.weights, array![1.0, 2.0, 2.0]);
    }

    #[test]
    fn predict_maps_missing_values_to_nan() {
        let config = configuration(vec![1], vec![0]);
        let out = predict(&Echo, &config, &(), array![[9.0, 0.5], [9.0, -1.0]].view()).unwrap();
        assert_eq!(out[0], 0.5);
        assert!(out[1].is_nan());
    }

    #[test]
    fn tables_expose_ensemble_vectors() {
        let table = PredictionTable::from_columns(2, vec![(3, vec![0.1, 0.2]), (7, vec![0.3, 0.4])]);
        assert_eq!(table.ensemble_vector(1), vec![0.2, 0.4]);
        let kept = table.select_members(&[1]);
        assert_eq!(kept.members(), &[7]);
        assert_eq!(kept.ensemble_vector(0), vec![0.3]);
    }
}
