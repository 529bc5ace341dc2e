#![allow(dead_code)]

use astrolabe::configs::Configuration;
use astrolabe::{Catalog, CatalogRole, EngineError, ModelEngine, ObjectId, TrainingSample};
use ndarray::{Array1, Array2, ArrayView2};
use rand::prelude::*;
use rand_distr::Normal;

/// Weighted least squares with an intercept and a small ridge term.
///
/// Only members whose id is below `predicting_members` return predictions; the rest train
/// normally but answer `None` for every object.
#[derive(Default)]
pub struct LinearEngine {
    pub predicting_members: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl ModelEngine for LinearEngine {
    type Model = LinearModel;

    fn train(
        &self,
        configuration: &Configuration,
        sample: &TrainingSample,
    ) -> Result<LinearModel, EngineError> {
        let p = sample.features.ncols() + 1;
        let ridge = configuration
            .hyperparameter("ridge")
            .and_then(|v| v.as_f64())
            .unwrap_or(1e-9);
        let mut normal = Array2::<f64>::zeros((p, p));
        let mut rhs = Array1::<f64>::zeros(p);
        for ((row, &y), &w) in sample
            .features
            .rows()
            .into_iter()
            .zip(&sample.targets)
            .zip(&sample.weights)
        {
            let x: Vec<f64> = std::iter::once(1.0).chain(row.iter().copied()).collect();
            for i in 0..p {
                rhs[i] += w * x[i] * y;
                for j in 0..p {
                    normal[[i, j]] += w * x[i] * x[j];
                }
            }
        }
        for i in 1..p {
            normal[[i, i]] += ridge;
        }
        let beta = solve(normal, rhs)
            .ok_or_else(|| EngineError::training(configuration.id, "singular normal equations"))?;
        Ok(LinearModel {
            intercept: beta[0],
            coefficients: beta[1..].to_vec(),
        })
    }

    fn infer(
        &self,
        configuration: &Configuration,
        model: &LinearModel,
        features: ArrayView2<f64>,
    ) -> Result<Vec<Option<f64>>, EngineError> {
        let silent = self
            .predicting_members
            .is_some_and(|n| configuration.id >= n);
        Ok(features
            .rows()
            .into_iter()
            .map(|row| {
                if silent {
                    return None;
                }
                let value = model.intercept
                    + row
                        .iter()
                        .zip(&model.coefficients)
                        .map(|(x, b)| x * b)
                        .sum::<f64>();
                Some(value)
            })
            .collect())
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot, col]].abs() < 1e-14 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([pivot, k], [col, k]);
            }
            b.swap(pivot, col);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Some(x)
}

pub fn truth(x0: f64, x1: f64) -> f64 {
    0.5 + 0.3 * x0 - 0.2 * x1
}

/// Two features, `x0 ~ N(offset, 1)` and `x1 ~ N(0, 1)`. Labeled catalogs carry
/// `truth(x0, x1)` plus `N(0, 0.05)` noise as target.
pub fn linear_catalog(
    name: &str,
    role: CatalogRole,
    n: usize,
    offset: f64,
    seed: u64,
    labeled: bool,
) -> Catalog {
    let mut rng = StdRng::seed_from_u64(seed);
    let standard = Normal::new(0.0, 1.0).unwrap();
    let noise = Normal::new(0.0, 0.05).unwrap();
    let features = Array2::from_shape_fn((n, 2), |(_, j)| {
        standard.sample(&mut rng) + if j == 0 { offset } else { 0.0 }
    });
    let catalog = Catalog::new(
        name,
        role,
        vec!["x0".to_string(), "x1".to_string()],
        ids(name, n),
        features.clone(),
    )
    .unwrap();
    if !labeled {
        return catalog;
    }
    let targets: Array1<f64> = features
        .rows()
        .into_iter()
        .map(|row| truth(row[0], row[1]) + noise.sample(&mut rng))
        .collect();
    catalog.with_targets(targets).unwrap()
}

pub fn truth_1d(x: f64) -> f64 {
    0.5 + 0.3 * x
}

/// One feature `x ~ N(0, 1)`. Labeled catalogs carry `truth_1d(x)` plus `N(0, 0.05)` noise.
pub fn linear_catalog_1d(name: &str, role: CatalogRole, n: usize, seed: u64, labeled: bool) -> Catalog {
    let catalog = gaussian_catalog_1d(name, role, n, 0.0, 1.0, seed);
    if !labeled {
        return catalog;
    }
    let mut rng = StdRng::seed_from_u64(seed ^ 0x7A26);
    let noise = Normal::new(0.0, 0.05).unwrap();
    let targets: Array1<f64> = catalog
        .features()
        .column(0)
        .iter()
        .map(|&x| truth_1d(x) + noise.sample(&mut rng))
        .collect();
    catalog.with_targets(targets).unwrap()
}

/// One feature drawn from `N(mean, sd)`.
pub fn gaussian_catalog_1d(
    name: &str,
    role: CatalogRole,
    n: usize,
    mean: f64,
    sd: f64,
    seed: u64,
) -> Catalog {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(mean, sd).unwrap();
    let features = Array2::from_shape_fn((n, 1), |_| normal.sample(&mut rng));
    Catalog::new(name, role, vec!["x".to_string()], ids(name, n), features).unwrap()
}

pub fn with_feature_errors(catalog: Catalog, sigma: f64) -> Catalog {
    let shape = (catalog.len(), catalog.n_features());
    catalog
        .with_feature_errors(Array2::from_elem(shape, sigma))
        .unwrap()
}

fn ids(name: &str, n: usize) -> Vec<ObjectId> {
    (0..n).map(|i| ObjectId(format!("{name}-{i:05}"))).collect()
}
