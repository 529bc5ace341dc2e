//! # Feature Space Index
//!
//! Exact k-nearest-neighbour search over a subspace of a catalog's features, optionally
//! augmented with derived columns (for example a predicted-error column).
//!
//! - Standardization: the per-dimension mean and scale are fitted once, on the indexed
//!   objects, and applied to every query. Queries coming from another catalog are therefore
//!   measured in the units of the indexed catalog, which is what density ratios need.
//!   An index may also be built with a standardization borrowed from another index so that
//!   two indices share one coordinate system.
//! - Determinism: neighbours are ordered by distance and then by object identifier, so the
//!   same query against the same index always returns the same sequence.
//! - Structure: a flat k-d tree with median splits on the widest dimension. The tree is
//!   immutable once built; any number of threads may query it at the same time.

use crate::types::{Catalog, ObjectId};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thiserror::Error;

const LEAF_SIZE: usize = 16;
const SCALE_FLOOR: f64 = 1.0e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Cannot build a feature-space index over catalog '{catalog}': it has no usable objects.")]
    EmptyCatalog { catalog: String },

    #[error("Query point has {found} dimensions, but the index over '{catalog}' expects {expected}.")]
    DimensionMismatch {
        catalog: String,
        expected: usize,
        found: usize,
    },

    #[error("Feature column {column} does not exist in catalog '{catalog}' ({available} features).")]
    InvalidColumn {
        catalog: String,
        column: usize,
        available: usize,
    },

    #[error("The feature subspace selects no columns.")]
    EmptySubspace,

    #[error("Derived index columns have {found} rows, but catalog '{catalog}' has {expected}.")]
    DerivedColumnRows {
        catalog: String,
        expected: usize,
        found: usize,
    },

    #[error("Non-finite coordinate found while indexing or querying catalog '{catalog}'.")]
    NonFinitePoint { catalog: String },

    #[error("Borrowed standardization has {found} dimensions, but the index needs {expected}.")]
    StandardizationMismatch { expected: usize, found: usize },
}

/// Distance between two standardized points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Manhattan,
    Chebyshev,
}

impl DistanceMetric {
    pub fn distance(self, a: &[f64], b: &[f64]) -> f64 {
        let diffs = a.iter().zip(b).map(|(x, y)| (x - y).abs());
        match self {
            Self::Euclidean => diffs.map(|d| d * d).sum::<f64>().sqrt(),
            Self::Manhattan => diffs.sum(),
            Self::Chebyshev => diffs.fold(0.0, f64::max),
        }
    }
}

/// Metric plus whether coordinates are standardized before measuring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSpec {
    pub metric: DistanceMetric,
    pub standardize: bool,
}

impl Default for MetricSpec {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Euclidean,
            standardize: true,
        }
    }
}

/// Which feature columns an index is built over.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSubspace {
    #[default]
    All,
    Columns(Vec<usize>),
}

impl FeatureSubspace {
    pub fn resolve(&self, catalog: &Catalog) -> Result<Vec<usize>, IndexError> {
        let available = catalog.n_features();
        match self {
            Self::All => Ok((0..available).collect()),
            Self::Columns(columns) => {
                if columns.is_empty() {
                    return Err(IndexError::EmptySubspace);
                }
                if let Some(&column) = columns.iter().find(|&&c| c >= available) {
                    return Err(IndexError::InvalidColumn {
                        catalog: catalog.name().to_string(),
                        column,
                        available,
                    });
                }
                Ok(columns.clone())
            }
        }
    }
}

/// Per-dimension affine map `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub means: Array1<f64>,
    pub scales: Array1<f64>,
}

impl Standardization {
    /// Fits mean and population standard deviation per column. Degenerate columns keep
    /// unit scale.
    pub fn fit(points: ArrayView2<f64>) -> Self {
        let dim = points.ncols();
        let means = points
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(dim));
        let scales = points
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s.is_finite() && s > SCALE_FLOOR { s } else { 1.0 });
        Self { means, scales }
    }

    pub fn identity(dim: usize) -> Self {
        Self {
            means: Array1::zeros(dim),
            scales: Array1::ones(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.means.len()
    }

    fn apply(&self, point: ArrayView1<f64>, out: &mut Vec<f64>) {
        out.clear();
        out.extend(
            point
                .iter()
                .zip(self.means.iter().zip(self.scales.iter()))
                .map(|(x, (m, s))| (x - m) / s),
        );
    }
}

/// Extra knobs for [`FeatureSpaceIndex::build_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions<'a> {
    /// Catalog rows to index. `None` indexes every row.
    pub rows: Option<&'a [usize]>,
    /// Derived columns appended after the selected features, one row per catalog row.
    pub derived_columns: Option<ArrayView2<'a, f64>>,
    /// Reuse this standardization instead of fitting one on the indexed rows.
    pub standardization: Option<&'a Standardization>,
}

/// One query result: the catalog row of the neighbour and its distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub distance: f64,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        dim: usize,
        value: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f64,
    rank: usize,
    point: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.rank.cmp(&other.rank))
    }
}

/// A read-only spatial index over one catalog.
#[derive(Debug, Clone)]
pub struct FeatureSpaceIndex {
    catalog: String,
    source_features: usize,
    columns: Vec<usize>,
    n_derived: usize,
    spec: MetricSpec,
    standardization: Standardization,
    dim: usize,
    coords: Vec<f64>,
    rows: Vec<usize>,
    ids: Vec<ObjectId>,
    ranks: Vec<usize>,
    order: Vec<usize>,
    nodes: Vec<Node>,
}

impl FeatureSpaceIndex {
    /// Indexes every object of `catalog` over `subspace`.
    pub fn build(
        catalog: &Catalog,
        subspace: &FeatureSubspace,
        spec: MetricSpec,
    ) -> Result<Self, IndexError> {
        Self::build_with(catalog, subspace, spec, BuildOptions::default())
    }

    pub fn build_with(
        catalog: &Catalog,
        subspace: &FeatureSubspace,
        spec: MetricSpec,
        options: BuildOptions<'_>,
    ) -> Result<Self, IndexError> {
        let columns = subspace.resolve(catalog)?;
        let n_derived = match options.derived_columns {
            Some(derived) => {
                if derived.nrows() != catalog.len() {
                    return Err(IndexError::DerivedColumnRows {
                        catalog: catalog.name().to_string(),
                        expected: catalog.len(),
                        found: derived.nrows(),
                    });
                }
                derived.ncols()
            }
            None => 0,
        };
        let rows: Vec<usize> = match options.rows {
            Some(rows) => rows.to_vec(),
            None => (0..catalog.len()).collect(),
        };
        if rows.is_empty() {
            return Err(IndexError::EmptyCatalog {
                catalog: catalog.name().to_string(),
            });
        }

        let dim = columns.len() + n_derived;
        let mut raw = Array2::<f64>::zeros((rows.len(), dim));
        for (i, &row) in rows.iter().enumerate() {
            let features = catalog.feature_row(row);
            for (j, &column) in columns.iter().enumerate() {
                raw[[i, j]] = features[column];
            }
            if let Some(derived) = options.derived_columns {
                for j in 0..n_derived {
                    raw[[i, columns.len() + j]] = derived[[row, j]];
                }
            }
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFinitePoint {
                catalog: catalog.name().to_string(),
            });
        }

        let standardization = match (options.standardization, spec.standardize) {
            (Some(borrowed), _) => {
                if borrowed.dim() != dim {
                    return Err(IndexError::StandardizationMismatch {
                        expected: dim,
                        found: borrowed.dim(),
                    });
                }
                borrowed.clone()
            }
            (None, true) => Standardization::fit(raw.view()),
            (None, false) => Standardization::identity(dim),
        };

        let mut coords = Vec::with_capacity(rows.len() * dim);
        let mut scratch = Vec::with_capacity(dim);
        for point in raw.rows() {
            standardization.apply(point, &mut scratch);
            coords.extend_from_slice(&scratch);
        }

        let ids: Vec<ObjectId> = rows.iter().map(|&r| catalog.id(r).clone()).collect();
        let mut by_id: Vec<usize> = (0..ids.len()).collect();
        by_id.sort_by(|&a, &b| ids[a].cmp(&ids[b]));
        let mut ranks = vec![0; ids.len()];
        for (rank, &point) in by_id.iter().enumerate() {
            ranks[point] = rank;
        }

        let mut order: Vec<usize> = (0..rows.len()).collect();
        let mut nodes = Vec::new();
        build_node(&coords, dim, &mut order, 0, &mut nodes);

        log::debug!(
            "Indexed {} objects of '{}' in {} dimensions ({} tree nodes)",
            rows.len(),
            catalog.name(),
            dim,
            nodes.len()
        );

        Ok(Self {
            catalog: catalog.name().to_string(),
            source_features: catalog.n_features(),
            columns,
            n_derived,
            spec,
            standardization,
            dim,
            coords,
            rows,
            ids,
            ranks,
            order,
            nodes,
        })
    }

    pub fn catalog_name(&self) -> &str {
        &self.catalog
    }

    /// Number of indexed objects.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Dimensionality of query points (selected features plus derived columns).
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn spec(&self) -> MetricSpec {
        self.spec
    }

    pub fn standardization(&self) -> &Standardization {
        &self.standardization
    }

    /// Catalog rows covered by the index, in index order.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Identifier of an indexed catalog row, if that row is indexed.
    pub fn id_of_row(&self, row: usize) -> Option<&ObjectId> {
        self.rows
            .iter()
            .position(|&r| r == row)
            .map(|point| &self.ids[point])
    }

    /// Builds a query point from a full feature vector of any catalog sharing the indexed
    /// schema, plus the derived values if the index has derived columns.
    pub fn query_point(
        &self,
        features: ArrayView1<f64>,
        derived: Option<ArrayView1<f64>>,
    ) -> Result<Array1<f64>, IndexError> {
        if features.len() != self.source_features {
            return Err(self.mismatch(features.len()));
        }
        let derived_len = derived.map_or(0, |d| d.len());
        if derived_len != self.n_derived {
            return Err(self.mismatch(self.columns.len() + derived_len));
        }
        let mut point = Array1::zeros(self.dim);
        for (j, &column) in self.columns.iter().enumerate() {
            point[j] = features[column];
        }
        if let Some(derived) = derived {
            for (j, &value) in derived.iter().enumerate() {
                point[self.columns.len() + j] = value;
            }
        }
        Ok(point)
    }

    /// The `k` nearest indexed objects to `point`, ascending by distance, ties broken by
    /// identifier. Returns fewer than `k` neighbours only when the index is smaller than `k`.
    pub fn query(&self, point: ArrayView1<f64>, k: usize) -> Result<Vec<Neighbor>, IndexError> {
        let q = self.prepare(point)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.search_knn(0, &q, k, &mut heap);
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| self.neighbor(c))
            .collect())
    }

    /// Every indexed object strictly closer than `radius`, in the same order as `query`.
    pub fn within(&self, point: ArrayView1<f64>, radius: f64) -> Result<Vec<Neighbor>, IndexError> {
        let q = self.prepare(point)?;
        let mut found = Vec::new();
        if radius > 0.0 {
            self.search_radius(0, &q, radius, &mut found);
        }
        found.sort();
        Ok(found.into_iter().map(|c| self.neighbor(c)).collect())
    }

    /// Independent queries for every row of `points`, evaluated in parallel.
    pub fn query_many(
        &self,
        points: ArrayView2<f64>,
        k: usize,
    ) -> Result<Vec<Vec<Neighbor>>, IndexError> {
        points
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|point| self.query(point, k))
            .collect()
    }

    fn mismatch(&self, found: usize) -> IndexError {
        IndexError::DimensionMismatch {
            catalog: self.catalog.clone(),
            expected: self.dim,
            found,
        }
    }

    fn prepare(&self, point: ArrayView1<f64>) -> Result<Vec<f64>, IndexError> {
        if point.len() != self.dim {
            return Err(self.mismatch(point.len()));
        }
        if point.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFinitePoint {
                catalog: self.catalog.clone(),
            });
        }
        let mut q = Vec::with_capacity(self.dim);
        self.standardization.apply(point, &mut q);
        Ok(q)
    }

    fn coords_of(&self, point: usize) -> &[f64] {
        &self.coords[point * self.dim..(point + 1) * self.dim]
    }

    fn candidate(&self, q: &[f64], point: usize) -> Candidate {
        Candidate {
            distance: self.spec.metric.distance(q, self.coords_of(point)),
            rank: self.ranks[point],
            point,
        }
    }

    fn neighbor(&self, c: Candidate) -> Neighbor {
        Neighbor {
            row: self.rows[c.point],
            distance: c.distance,
        }
    }

    fn search_knn(&self, node: usize, q: &[f64], k: usize, heap: &mut BinaryHeap<Candidate>) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for &point in &self.order[start..end] {
                    let c = self.candidate(q, point);
                    if heap.len() < k {
                        heap.push(c);
                    } else if heap.peek().is_some_and(|worst| c < *worst) {
                        heap.pop();
                        heap.push(c);
                    }
                }
            }
            Node::Split {
                dim,
                value,
                left,
                right,
            } => {
                let diff = q[dim] - value;
                let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.search_knn(near, q, k, heap);
                // Every metric here is bounded below by a single coordinate difference.
                let visit_far = heap.len() < k
                    || heap.peek().is_some_and(|worst| diff.abs() <= worst.distance);
                if visit_far {
                    self.search_knn(far, q, k, heap);
                }
            }
        }
    }

    fn search_radius(&self, node: usize, q: &[f64], radius: f64, found: &mut Vec<Candidate>) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for &point in &self.order[start..end] {
                    let c = self.candidate(q, point);
                    if c.distance < radius {
                        found.push(c);
                    }
                }
            }
            Node::Split {
                dim,
                value,
                left,
                right,
            } => {
                let diff = q[dim] - value;
                let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.search_radius(near, q, radius, found);
                if diff.abs() < radius {
                    self.search_radius(far, q, radius, found);
                }
            }
        }
    }
}

fn build_node(
    coords: &[f64],
    dim: usize,
    order: &mut [usize],
    offset: usize,
    nodes: &mut Vec<Node>,
) -> usize {
    let id = nodes.len();
    let leaf = Node::Leaf {
        start: offset,
        end: offset + order.len(),
    };
    if order.len() <= LEAF_SIZE {
        nodes.push(leaf);
        return id;
    }

    let coord = |point: usize, d: usize| coords[point * dim + d];
    let mut split_dim = 0;
    let mut widest = 0.0;
    for d in 0..dim {
        let (lo, hi) = order.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| {
            let v = coord(p, d);
            (lo.min(v), hi.max(v))
        });
        if hi - lo > widest {
            widest = hi - lo;
            split_dim = d;
        }
    }
    // All points coincide: nothing left to split.
    if widest <= 0.0 {
        nodes.push(leaf);
        return id;
    }

    let mid = order.len() / 2;
    order.select_nth_unstable_by(mid, |&a, &b| coord(a, split_dim).total_cmp(&coord(b, split_dim)));
    let value = coord(order[mid], split_dim);

    nodes.push(leaf);
    let (lower, upper) = order.split_at_mut(mid);
    let left = build_node(coords, dim, lower, offset, nodes);
    let right = build_node(coords, dim, upper, offset + mid, nodes);
    nodes[id] = Node::Split {
        dim: split_dim,
        value,
        left,
        right,
    };
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CatalogRole;
    use ndarray::array;
    use rand::prelude::*;

    fn catalog(points: Array2<f64>) -> Catalog {
        let n = points.nrows();
        let d = points.ncols();
        Catalog::new(
            "ref",
            CatalogRole::Training,
            (0..d).map(|i| format!("f{i}")).collect(),
            (0..n).map(|i| ObjectId(format!("obj{i:04}"))).collect(),
            points,
        )
        .unwrap()
    }

    fn brute_force(
        catalog: &Catalog,
        index: &FeatureSpaceIndex,
        point: ArrayView1<f64>,
        k: usize,
    ) -> Vec<usize> {
        let mut q = Vec::new();
        index.standardization.apply(point, &mut q);
        let mut all: Vec<(f64, &ObjectId, usize)> = (0..catalog.len())
            .map(|row| {
                let mut p = Vec::new();
                index.standardization.apply(catalog.feature_row(row), &mut p);
                (index.spec.metric.distance(&q, &p), catalog.id(row), row)
            })
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(b.1)));
        all.into_iter().take(k).map(|(_, _, row)| row).collect()
    }

    #[test]
    fn knn_matches_brute_force_for_every_metric() {
        let mut rng = StdRng::seed_from_u64(7);
        let points = Array2::from_shape_fn((500, 3), |(_, j)| {
            rng.gen_range(-1.0..1.0) * (j as f64 + 1.0)
        });
        let catalog = catalog(points);
        for metric in [
            DistanceMetric::Euclidean,
            DistanceMetric::Manhattan,
            DistanceMetric::Chebyshev,
        ] {
            let spec = MetricSpec {
                metric,
                standardize: true,
            };
            let index = FeatureSpaceIndex::build(&catalog, &FeatureSubspace::All, spec).unwrap();
            for probe in [array![0.0, 0.0, 0.0], array![0.9, -1.5, 2.0], array![5.0, 5.0, 5.0]] {
                let got: Vec<usize> = index
                    .query(probe.view(), 12)
                    .unwrap()
                    .iter()
                    .map(|n| n.row)
                    .collect();
                assert_eq!(got, brute_force(&catalog, &index, probe.view(), 12));
            }
        }
    }

    #[test]
    fn ties_are_broken_by_identifier() {
        // Forty copies of the same point; only identifiers distinguish them.
        let catalog = catalog(Array2::from_elem((40, 2), 1.0));
        let index =
            FeatureSpaceIndex::build(&catalog, &FeatureSubspace::All, MetricSpec::default())
                .unwrap();
        let first = index.query(array![1.0, 1.0].view(), 5).unwrap();
        let rows: Vec<usize> = first.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![0, 1, 2, 3, 4]);
        let again = index.query(array![1.0, 1.0].view(), 5).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn rejects_empty_catalogs_and_wrong_dimensions() {
        let catalog = catalog(array![[0.0, 1.0], [1.0, 0.0]]);
        let err = FeatureSpaceIndex::build_with(
            &catalog,
            &FeatureSubspace::All,
            MetricSpec::default(),
            BuildOptions {
                rows: Some(&[]),
                ..BuildOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::EmptyCatalog { .. }));

        let index =
            FeatureSpaceIndex::build(&catalog, &FeatureSubspace::Columns(vec![1]), MetricSpec::default())
                .unwrap();
        assert!(matches!(
            index.query(array![0.0, 0.0].view(), 1),
            Err(IndexError::DimensionMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));
        let point = index.query_point(catalog.feature_row(0), None).unwrap();
        assert_eq!(point, array![1.0]);
    }

    #[test]
    fn radius_query_is_strict_and_ordered() {
        let points = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let catalog = catalog(points);
        let spec = MetricSpec {
            metric: DistanceMetric::Euclidean,
            standardize: false,
        };
        let index = FeatureSpaceIndex::build(&catalog, &FeatureSubspace::All, spec).unwrap();
        let found = index.within(array![4.0].view(), 2.0).unwrap();
        let rows: Vec<usize> = found.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![4, 3, 5]);
    }

    #[test]
    fn borrowed_standardization_is_used_for_queries() {
        let wide = catalog(array![[0.0], [10.0], [20.0]]);
        let reference =
            FeatureSpaceIndex::build(&wide, &FeatureSubspace::All, MetricSpec::default()).unwrap();
        let narrow = catalog(array![[0.0], [1.0]]);
        let shared = FeatureSpaceIndex::build_with(
            &narrow,
            &FeatureSubspace::All,
            MetricSpec::default(),
            BuildOptions {
                standardization: Some(reference.standardization()),
                ..BuildOptions::default()
            },
        )
        .unwrap();
        let scale = reference.standardization().scales[0];
        let nearest = shared.query(array![0.0].view(), 2).unwrap();
        assert!((nearest[1].distance - 1.0 / scale).abs() < 1e-12);
    }
}
