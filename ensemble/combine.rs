//! # Ensemble Combiner
//!
//! Turns one object's ensemble vector (one prediction per member, `NaN` where the member
//! produced nothing) into a binned PDF over the target and the usual point estimates.
//!
//! Each valid prediction deposits its member weight into the bin that contains it. Member
//! weights default to `1/N` and are renormalized over the members that produced a valid
//! prediction for this object, so the masses of a valid PDF sum to one. A bin reports the
//! mass-weighted centroid of the predictions it received instead of its geometric center,
//! which keeps a zero-variance ensemble at exactly its common value.

use crate::binning::{BinPosition, PdfBinning};
use serde::{Deserialize, Serialize};

/// What happens to predictions outside the binning range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRange {
    /// Deposit into the nearest edge bin.
    #[default]
    Clamp,
    /// Treat as an invalid prediction.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineOptions {
    pub min_valid_predictions: usize,
    pub out_of_range: OutOfRange,
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self {
            min_valid_predictions: 1,
            out_of_range: OutOfRange::Clamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointEstimates {
    pub mean: f64,
    pub median: f64,
    pub mode: f64,
}

/// The combined PDF of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPdf {
    /// Mass per bin, aligned with the run's binning.
    pub masses: Vec<f64>,
    /// Representative value per bin: the centroid of its predictions, or the bin center when
    /// the bin is empty.
    pub bin_values: Vec<f64>,
    pub valid: bool,
    pub n_valid: usize,
    pub estimates: Option<PointEstimates>,
    /// Valid predictions and their normalized weights, kept for spread estimates.
    pub members: Vec<(f64, f64)>,
}

impl ObjectPdf {
    fn invalid(binning: &PdfBinning, n_valid: usize) -> Self {
        Self {
            masses: vec![0.0; binning.n_bins()],
            bin_values: binning.centers(),
            valid: false,
            n_valid,
            estimates: None,
            members: Vec::new(),
        }
    }

    pub fn total_mass(&self) -> f64 {
        self.masses.iter().sum()
    }

    /// Cumulative PDF mass below `value`, interpolating linearly inside the bin that holds it.
    pub fn cumulative_at(&self, binning: &PdfBinning, value: f64) -> f64 {
        if !self.valid {
            return 0.0;
        }
        match binning.position(value) {
            BinPosition::Below => 0.0,
            BinPosition::Above => 1.0,
            BinPosition::Inside(bin) => {
                let below: f64 = self.masses[..bin].iter().sum();
                let edges = binning.edges();
                let fraction = (value - edges[bin]) / (edges[bin + 1] - edges[bin]);
                (below + fraction.clamp(0.0, 1.0) * self.masses[bin]).min(1.0)
            }
        }
    }

    /// Value at which the cumulative mass first reaches `q`.
    pub fn quantile_bin_value(&self, q: f64) -> Option<f64> {
        if !self.valid {
            return None;
        }
        let target = q * self.total_mass();
        let mut cumulative = 0.0;
        for (bin, &mass) in self.masses.iter().enumerate() {
            cumulative += mass;
            if mass > 0.0 && cumulative >= target * (1.0 - 1e-12) {
                return Some(self.bin_values[bin]);
            }
        }
        self.masses
            .iter()
            .rposition(|&m| m > 0.0)
            .map(|bin| self.bin_values[bin])
    }
}

/// Combines one object's ensemble vector into a PDF with point estimates.
///
/// `member_weights`, when given, has one non-negative entry per member. Weights of any
/// other length give an invalid PDF.
pub fn combine(
    ensemble_vector: &[f64],
    member_weights: Option<&[f64]>,
    binning: &PdfBinning,
    options: &CombineOptions,
) -> ObjectPdf {
    if let Some(w) = member_weights {
        if w.len() != ensemble_vector.len() {
            log::debug!(
                "{} member weights for an ensemble vector of {} predictions",
                w.len(),
                ensemble_vector.len()
            );
            return ObjectPdf::invalid(binning, 0);
        }
    }
    let mut members: Vec<(f64, f64)> = Vec::with_capacity(ensemble_vector.len());
    let mut binned: Vec<(usize, f64, f64)> = Vec::with_capacity(ensemble_vector.len());
    for (i, &value) in ensemble_vector.iter().enumerate() {
        let weight = member_weights.map_or(1.0, |w| w[i]);
        if !value.is_finite() || !weight.is_finite() || weight <= 0.0 {
            continue;
        }
        let (bin, deposited) = match (binning.position(value), options.out_of_range) {
            (BinPosition::Inside(bin), _) => (bin, value),
            (BinPosition::Below, OutOfRange::Clamp) => (0, binning.lower()),
            (BinPosition::Above, OutOfRange::Clamp) => (binning.n_bins() - 1, binning.upper()),
            (_, OutOfRange::Discard) => continue,
        };
        members.push((value, weight));
        binned.push((bin, deposited, weight));
    }

    let n_valid = members.len();
    let total: f64 = members.iter().map(|&(_, w)| w).sum();
    if n_valid == 0 || n_valid < options.min_valid_predictions || total <= 0.0 {
        return ObjectPdf::invalid(binning, n_valid);
    }

    let mut masses = vec![0.0; binning.n_bins()];
    let mut anchors: Vec<Option<f64>> = vec![None; binning.n_bins()];
    let mut offsets = vec![0.0; binning.n_bins()];
    for &(bin, value, weight) in &binned {
        let w = weight / total;
        masses[bin] += w;
        let anchor = *anchors[bin].get_or_insert(value);
        offsets[bin] += w * (value - anchor);
    }
    let bin_values: Vec<f64> = (0..binning.n_bins())
        .map(|bin| match anchors[bin] {
            Some(anchor) => anchor + offsets[bin] / masses[bin],
            None => binning.center(bin),
        })
        .collect();

    for pair in &mut members {
        pair.1 /= total;
    }
    let anchor = members[0].0;
    let mean = anchor + members.iter().map(|&(v, w)| w * (v - anchor)).sum::<f64>();

    let mut pdf = ObjectPdf {
        masses,
        bin_values,
        valid: true,
        n_valid,
        estimates: None,
        members,
    };

    let median = pdf.quantile_bin_value(0.5).unwrap_or(mean);
    let mode_bin = pdf
        .masses
        .iter()
        .enumerate()
        .fold(0, |best, (bin, &m)| if m > pdf.masses[best] { bin } else { best });
    let mode = pdf.bin_values[mode_bin];

    pdf.estimates = Some(PointEstimates { mean, median, mode });
    pdf
}

/// Weighted sum of the valid PDFs of a population, normalized to unit mass.
pub fn stack_pdfs<'a>(
    pdfs: impl IntoIterator<Item = &'a ObjectPdf>,
    object_weights: Option<&[f64]>,
    n_bins: usize,
) -> Vec<f64> {
    let mut stacked = vec![0.0; n_bins];
    for (i, pdf) in pdfs.into_iter().enumerate() {
        let w = object_weights.map_or(1.0, |w| w.get(i).copied().unwrap_or(0.0));
        if !pdf.valid || !(w > 0.0) {
            continue;
        }
        for (s, m) in stacked.iter_mut().zip(&pdf.masses) {
            *s += w * m;
        }
    }
    let total: f64 = stacked.iter().sum();
    if total > 0.0 {
        stacked.iter_mut().for_each(|s| *s /= total);
    }
    stacked
}
