//! Run-wide PDF binning of the target quantity.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BinningError {
    #[error("A PDF binning needs at least one bin (two edges); got {0} edges.")]
    TooFewEdges(usize),

    #[error("PDF bin edges must be finite and strictly increasing (problem at edge {0}).")]
    NotIncreasing(usize),

    #[error("Uniform PDF binning over [{min}, {max}] with {bins} bins is invalid.")]
    InvalidUniform { min: f64, max: f64, bins: usize },
}

/// How the binning is described in run options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BinningSpec {
    Uniform { min: f64, max: f64, bins: usize },
    Edges { edges: Vec<f64> },
}

impl Default for BinningSpec {
    fn default() -> Self {
        Self::Uniform {
            min: 0.0,
            max: 2.0,
            bins: 100,
        }
    }
}

impl BinningSpec {
    pub fn build(&self) -> Result<PdfBinning, BinningError> {
        match self {
            Self::Uniform { min, max, bins } => PdfBinning::uniform(*min, *max, *bins),
            Self::Edges { edges } => PdfBinning::from_edges(edges.clone()),
        }
    }
}

/// Where a value falls relative to the binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinPosition {
    Inside(usize),
    Below,
    Above,
}

/// Ordered, contiguous bins `[e_i, e_{i+1})`; the last bin is closed on the right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfBinning {
    edges: Vec<f64>,
}

impl PdfBinning {
    pub fn uniform(min: f64, max: f64, bins: usize) -> Result<Self, BinningError> {
        if bins == 0 || !min.is_finite() || !max.is_finite() || min >= max {
            return Err(BinningError::InvalidUniform { min, max, bins });
        }
        let width = (max - min) / bins as f64;
        let mut edges: Vec<f64> = (0..bins).map(|i| min + width * i as f64).collect();
        edges.push(max);
        // Bins narrower than the spacing of floats at this magnitude collapse to one edge.
        Self::from_edges(edges)
    }

    pub fn from_edges(edges: Vec<f64>) -> Result<Self, BinningError> {
        if edges.len() < 2 {
            return Err(BinningError::TooFewEdges(edges.len()));
        }
        if let Some(i) = edges.iter().position(|e| !e.is_finite()) {
            return Err(BinningError::NotIncreasing(i));
        }
        if let Some(i) = edges.windows(2).position(|w| w[0] >= w[1]) {
            return Err(BinningError::NotIncreasing(i + 1));
        }
        Ok(Self { edges })
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn lower(&self) -> f64 {
        self.edges[0]
    }

    pub fn upper(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    pub fn center(&self, bin: usize) -> f64 {
        0.5 * (self.edges[bin] + self.edges[bin + 1])
    }

    pub fn centers(&self) -> Vec<f64> {
        (0..self.n_bins()).map(|b| self.center(b)).collect()
    }

    pub fn position(&self, value: f64) -> BinPosition {
        if value < self.lower() {
            return BinPosition::Below;
        }
        if value > self.upper() {
            return BinPosition::Above;
        }
        // First edge strictly greater than value, minus one.
        let upper = self.edges.partition_point(|&e| e <= value);
        BinPosition::Inside(upper.saturating_sub(1).min(self.n_bins() - 1))
    }
}
