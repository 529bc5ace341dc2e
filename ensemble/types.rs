//! # Catalog Data Model
//!
//! A catalog is an ordered collection of objects that share one feature schema. It is stored
//! column-wise (struct-of-arrays) so the numerical stages can work on `ndarray` views without
//! copying. Every invariant the rest of the crate relies on is checked once, here, when the
//! catalog is assembled: a `Catalog` that exists is a valid catalog.
//!
//! Catalogs are immutable for the duration of a run. The only attribute that a run may change
//! is the weight vector, and even then a new catalog is produced (`Catalog::reweighted`)
//! rather than mutating the original in place.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Unique identifier of one catalog object. Ordering is lexicographic and is the tie-break
/// used by nearest-neighbour queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The logical role a catalog plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogRole {
    Training,
    Validation,
    Application,
}

impl fmt::Display for CatalogRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Training => "training",
            Self::Validation => "validation",
            Self::Application => "application",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Catalog '{0}' declares no feature columns.")]
    NoFeatures(String),

    #[error(
        "Catalog '{catalog}': {what} has {found} entries, but the feature matrix has {expected} rows."
    )]
    RowCountMismatch {
        catalog: String,
        what: &'static str,
        found: usize,
        expected: usize,
    },

    #[error(
        "Catalog '{catalog}': {what} has {found} columns, but the catalog has {expected} features."
    )]
    ColumnCountMismatch {
        catalog: String,
        what: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("Catalog '{catalog}' contains a non-finite {what} value for object '{id}'.")]
    NonFinite {
        catalog: String,
        what: &'static str,
        id: ObjectId,
    },

    #[error(
        "Catalog '{catalog}' has weight {weight} for object '{id}'. Weights must be finite and non-negative."
    )]
    InvalidWeight {
        catalog: String,
        id: ObjectId,
        weight: f64,
    },

    #[error("Catalog '{catalog}' has a negative feature uncertainty for object '{id}'.")]
    NegativeUncertainty { catalog: String, id: ObjectId },

    #[error("Catalog '{catalog}' contains the identifier '{id}' more than once.")]
    DuplicateId { catalog: String, id: ObjectId },

    #[error("Catalog '{0}' has no target values, but a labeled catalog is required here.")]
    MissingTargets(String),

    #[error("Catalog '{0}' has no feature uncertainties, but input resampling needs them.")]
    MissingFeatureErrors(String),
}

/// A validated, immutable catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    name: String,
    role: CatalogRole,
    feature_names: Vec<String>,
    ids: Vec<ObjectId>,
    features: Array2<f64>,
    feature_errors: Option<Array2<f64>>,
    targets: Option<Array1<f64>>,
    weights: Array1<f64>,
}

impl Catalog {
    /// Assembles an unlabeled catalog with unit weights.
    ///
    /// `features` has shape `[n_objects, n_features]` and its columns follow `feature_names`.
    pub fn new(
        name: impl Into<String>,
        role: CatalogRole,
        feature_names: Vec<String>,
        ids: Vec<ObjectId>,
        features: Array2<f64>,
    ) -> Result<Self, CatalogError> {
        let name = name.into();
        if feature_names.is_empty() || features.ncols() == 0 {
            return Err(CatalogError::NoFeatures(name));
        }
        if feature_names.len() != features.ncols() {
            return Err(CatalogError::ColumnCountMismatch {
                catalog: name,
                what: "the feature-name list",
                found: feature_names.len(),
                expected: features.ncols(),
            });
        }
        if ids.len() != features.nrows() {
            return Err(CatalogError::RowCountMismatch {
                catalog: name,
                what: "the identifier list",
                found: ids.len(),
                expected: features.nrows(),
            });
        }

        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id) {
                return Err(CatalogError::DuplicateId {
                    catalog: name,
                    id: id.clone(),
                });
            }
        }

        for (row, values) in features.rows().into_iter().enumerate() {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(CatalogError::NonFinite {
                    catalog: name,
                    what: "feature",
                    id: ids[row].clone(),
                });
            }
        }

        let n = ids.len();
        Ok(Self {
            name,
            role,
            feature_names,
            ids,
            features,
            feature_errors: None,
            targets: None,
            weights: Array1::ones(n),
        })
    }

    /// Attaches true target values, turning the catalog into a labeled one.
    pub fn with_targets(mut self, targets: Array1<f64>) -> Result<Self, CatalogError> {
        self.check_rows("the target column", targets.len())?;
        if let Some(row) = targets.iter().position(|v| !v.is_finite()) {
            return Err(CatalogError::NonFinite {
                catalog: self.name,
                what: "target",
                id: self.ids[row].clone(),
            });
        }
        self.targets = Some(targets);
        Ok(self)
    }

    /// Attaches per-feature uncertainties with the same shape as the feature matrix.
    pub fn with_feature_errors(mut self, errors: Array2<f64>) -> Result<Self, CatalogError> {
        self.check_rows("the feature-uncertainty matrix", errors.nrows())?;
        if errors.ncols() != self.features.ncols() {
            return Err(CatalogError::ColumnCountMismatch {
                catalog: self.name,
                what: "the feature-uncertainty matrix",
                found: errors.ncols(),
                expected: self.features.ncols(),
            });
        }
        for (row, values) in errors.rows().into_iter().enumerate() {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(CatalogError::NonFinite {
                    catalog: self.name,
                    what: "feature uncertainty",
                    id: self.ids[row].clone(),
                });
            }
            if values.iter().any(|&v| v < 0.0) {
                return Err(CatalogError::NegativeUncertainty {
                    catalog: self.name,
                    id: self.ids[row].clone(),
                });
            }
        }
        self.feature_errors = Some(errors);
        Ok(self)
    }

    /// Replaces the default unit weights.
    pub fn with_weights(mut self, weights: Array1<f64>) -> Result<Self, CatalogError> {
        self.check_rows("the weight column", weights.len())?;
        for (row, &weight) in weights.iter().enumerate() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(CatalogError::InvalidWeight {
                    catalog: self.name,
                    id: self.ids[row].clone(),
                    weight,
                });
            }
        }
        self.weights = weights;
        Ok(self)
    }

    /// Returns a copy of this catalog carrying a new weight vector.
    pub fn reweighted(&self, weights: Array1<f64>) -> Result<Self, CatalogError> {
        self.clone().with_weights(weights)
    }

    fn check_rows(&self, what: &'static str, found: usize) -> Result<(), CatalogError> {
        if found != self.ids.len() {
            return Err(CatalogError::RowCountMismatch {
                catalog: self.name.clone(),
                what,
                found,
                expected: self.ids.len(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> CatalogRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn ids(&self) -> &[ObjectId] {
        &self.ids
    }

    pub fn id(&self, row: usize) -> &ObjectId {
        &self.ids[row]
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn feature_row(&self, row: usize) -> ArrayView1<'_, f64> {
        self.features.row(row)
    }

    pub fn feature_errors(&self) -> Option<ArrayView2<'_, f64>> {
        self.feature_errors.as_ref().map(|e| e.view())
    }

    pub fn targets(&self) -> Option<ArrayView1<'_, f64>> {
        self.targets.as_ref().map(|t| t.view())
    }

    /// Target values, or an error naming this catalog if it is unlabeled.
    pub fn require_targets(&self) -> Result<ArrayView1<'_, f64>, CatalogError> {
        self.targets()
            .ok_or_else(|| CatalogError::MissingTargets(self.name.clone()))
    }

    pub fn is_labeled(&self) -> bool {
        self.targets.is_some()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    /// Rows whose weight is strictly positive. Zero-weight objects take no part in density
    /// estimation or PDF construction.
    pub fn positive_weight_rows(&self) -> Vec<usize> {
        self.weights
            .iter()
            .enumerate()
            .filter_map(|(row, &w)| (w > 0.0).then_some(row))
            .collect()
    }
}

/// The catalogs participating in one run.
#[derive(Debug, Clone)]
pub struct Catalogs {
    pub training: Catalog,
    pub validation: Option<Catalog>,
    pub application: Catalog,
}

impl Catalogs {
    pub fn get(&self, role: CatalogRole) -> Option<&Catalog> {
        match role {
            CatalogRole::Training => Some(&self.training),
            CatalogRole::Validation => self.validation.as_ref(),
            CatalogRole::Application => Some(&self.application),
        }
    }

    /// The catalog used to evaluate members: validation when present, otherwise training.
    pub fn evaluation(&self) -> &Catalog {
        self.validation.as_ref().unwrap_or(&self.training)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{i}")).collect()
    }

    fn ids(n: usize) -> Vec<ObjectId> {
        (0..n).map(|i| ObjectId(format!("obj{i}"))).collect()
    }

    #[test]
    fn rejects_duplicate_identifiers() {
        let err = Catalog::new(
            "dup",
            CatalogRole::Training,
            names(1),
            vec![ObjectId::from("a"), ObjectId::from("a")],
            array![[1.0], [2.0]],
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateId { .. }));
    }

    #[test]
    fn rejects_non_finite_features_and_bad_weights() {
        let err = Catalog::new(
            "nan",
            CatalogRole::Training,
            names(2),
            ids(2),
            array![[1.0, f64::NAN], [2.0, 3.0]],
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::NonFinite { what: "feature", .. }));

        let catalog = Catalog::new(
            "w",
            CatalogRole::Training,
            names(1),
            ids(2),
            array![[1.0], [2.0]],
        )
        .unwrap();
        let err = catalog.reweighted(array![1.0, -0.5]).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidWeight { .. }));
    }

    #[test]
    fn reweighting_keeps_everything_else() {
        let catalog = Catalog::new(
            "cat",
            CatalogRole::Training,
            names(1),
            ids(3),
            array![[1.0], [2.0], [3.0]],
        )
        .unwrap()
        .with_targets(array![0.1, 0.2, 0.3])
        .unwrap();
        let reweighted = catalog.reweighted(array![0.0, 2.0, 1.0]).unwrap();
        assert_eq!(reweighted.positive_weight_rows(), vec![1, 2]);
        assert_eq!(reweighted.targets(), catalog.targets());
        assert_eq!(catalog.weights(), Array1::<f64>::ones(3).view());
    }

    #[test]
    fn missing_targets_are_reported_by_name() {
        let catalog = Catalog::new(
            "app",
            CatalogRole::Application,
            names(1),
            ids(1),
            array![[1.0]],
        )
        .unwrap();
        assert_eq!(
            catalog.require_targets().unwrap_err(),
            CatalogError::MissingTargets("app".to_string())
        );
    }
}
