//! # Catalog Input and Output
//!
//! Catalogs are tab-separated files with a header row. Column names carry the schema:
//!
//! - `id`: optional object identifier; sequential 1-based ids are generated when absent.
//! - `target`: optional true value, which makes the catalog labeled.
//! - `weight`: optional non-negative prior weight, 1.0 when absent.
//! - `<feature>_err`: optional one-sigma uncertainty of `<feature>`. Either every feature
//!   has one or none does.
//! - every other column is a feature, unless the caller names the features explicitly.
//!
//! Reading goes through `polars`; all numeric columns are cast to `f64` and must be
//! complete and finite. Member prediction tables are more lenient: a missing value is a
//! member that produced no prediction for that object.

use crate::engine::PredictionTable;
use crate::pipeline::{CombinedOutput, ObjectFlag};
use crate::types::{Catalog, CatalogError, CatalogRole, ObjectId};
use crate::uncertainty::ErrorStrategy;
use crate::weights::{DensityWeights, WeightFlag};
use itertools::Itertools;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

const ID_COLUMN: &str = "id";
const TARGET_COLUMN: &str = "target";
const WEIGHT_COLUMN: &str = "weight";
const ERROR_SUFFIX: &str = "_err";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to f64. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Missing values were found in the column '{0}'. Catalog columns must be complete.")]
    MissingValuesFound(String),
    #[error("The file '{0}' has no feature columns.")]
    NoFeatureColumns(String),
    #[error(
        "Only some features have '_err' columns; '{0}' is missing one. Provide uncertainties for every feature or for none."
    )]
    IncompleteErrorColumns(String),
    #[error("The prediction file '{0}' has no member columns.")]
    NoMemberColumns(String),
    #[error("Row {row} of the prediction file has id '{found}', but the catalog has '{expected}' there.")]
    IdMismatch {
        row: usize,
        expected: String,
        found: String,
    },
    #[error("Invalid catalog: {0}")]
    Catalog(#[from] CatalogError),
}

fn read_tsv(path: &Path) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    log::info!(
        "Loaded '{}': {} rows, {} columns",
        path.display(),
        df.height(),
        df.width()
    );
    Ok(df)
}

fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().into_iter().map(|s| s.to_string()).collect()
}

fn cast_f64(df: &DataFrame, column_name: &str) -> Result<Float64Chunked, DataError> {
    let column = df
        .column(column_name)
        .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", column.dtype()),
        })?;
    // The cast is not strict: unparseable entries become new nulls.
    if casted.null_count() > column.null_count() {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", column.dtype()),
        });
    }
    Ok(casted.f64()?.clone())
}

/// A complete numeric column. Finiteness is checked by the catalog.
fn required_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let values = cast_f64(df, column_name)?;
    if values.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }
    Ok(values.into_no_null_iter().collect())
}

/// A numeric column whose missing entries become `NaN`.
fn lenient_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let values = cast_f64(df, column_name)?;
    Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

fn object_ids(df: &DataFrame) -> Result<Vec<ObjectId>, DataError> {
    let n = df.height();
    let Ok(column) = df.column(ID_COLUMN) else {
        return Ok((1..=n).map(|i| ObjectId(i.to_string())).collect());
    };
    let text = column.cast(&DataType::String)?;
    let ids = text
        .str()?
        .into_iter()
        .enumerate()
        .map(|(i, id)| match id {
            Some(id) if !id.is_empty() => ObjectId(id.to_string()),
            _ => ObjectId((i + 1).to_string()),
        })
        .collect();
    Ok(ids)
}

fn matrix(df: &DataFrame, columns: &[String]) -> Result<Array2<f64>, DataError> {
    let n = df.height();
    let mut out = Array2::zeros((n, columns.len()));
    for (j, name) in columns.iter().enumerate() {
        let values = required_column(df, name)?;
        out.column_mut(j).assign(&Array1::from_vec(values));
    }
    Ok(out)
}

/// Loads a catalog. With `features == None` every non-reserved column is a feature, in
/// file order.
pub fn load_catalog(
    path: impl AsRef<Path>,
    name: &str,
    role: CatalogRole,
    features: Option<&[String]>,
) -> Result<Catalog, DataError> {
    let path = path.as_ref();
    let df = read_tsv(path)?;
    let present: HashSet<String> = column_names(&df).into_iter().collect();

    let feature_names: Vec<String> = match features {
        Some(names) => {
            if let Some(missing) = names.iter().find(|n| !present.contains(*n)) {
                return Err(DataError::ColumnNotFound(missing.clone()));
            }
            names.to_vec()
        }
        None => column_names(&df)
            .into_iter()
            .filter(|c| {
                ![ID_COLUMN, TARGET_COLUMN, WEIGHT_COLUMN].contains(&c.as_str())
                    && !c.ends_with(ERROR_SUFFIX)
            })
            .collect(),
    };
    if feature_names.is_empty() {
        return Err(DataError::NoFeatureColumns(path.display().to_string()));
    }

    let error_names: Vec<String> = feature_names
        .iter()
        .map(|f| format!("{f}{ERROR_SUFFIX}"))
        .collect();
    let n_error_columns = error_names.iter().filter(|e| present.contains(*e)).count();
    if n_error_columns > 0 && n_error_columns < error_names.len() {
        let missing = error_names
            .iter()
            .find(|e| !present.contains(*e))
            .cloned()
            .unwrap_or_default();
        return Err(DataError::IncompleteErrorColumns(missing));
    }

    let ids = object_ids(&df)?;
    let features = matrix(&df, &feature_names)?;
    let mut catalog = Catalog::new(name, role, feature_names, ids, features)?;
    if n_error_columns > 0 {
        catalog = catalog.with_feature_errors(matrix(&df, &error_names)?)?;
    }
    if present.contains(TARGET_COLUMN) {
        catalog = catalog.with_targets(Array1::from_vec(required_column(&df, TARGET_COLUMN)?))?;
    }
    if present.contains(WEIGHT_COLUMN) {
        catalog = catalog.with_weights(Array1::from_vec(required_column(&df, WEIGHT_COLUMN)?))?;
    }
    log::info!(
        "Catalog '{}' ({}): {} objects, {} features{}{}",
        catalog.name(),
        catalog.role(),
        catalog.len(),
        catalog.n_features(),
        if catalog.is_labeled() { ", labeled" } else { "" },
        if n_error_columns > 0 { ", with feature uncertainties" } else { "" }
    );
    Ok(catalog)
}

/// Member id of a prediction column: the number after `member_` when present, otherwise
/// the column's position.
fn member_id(column: &str, position: usize) -> usize {
    column
        .strip_prefix("member_")
        .and_then(|n| n.parse().ok())
        .unwrap_or(position)
}

/// Loads member predictions for `catalog`: an optional `id` column, which must list the
/// catalog's objects in order, and one column per member.
pub fn load_prediction_table(path: impl AsRef<Path>, catalog: &Catalog) -> Result<PredictionTable, DataError> {
    let path = path.as_ref();
    let df = read_tsv(path)?;
    let member_columns: Vec<String> = column_names(&df)
        .into_iter()
        .filter(|c| c != ID_COLUMN)
        .collect();
    if member_columns.is_empty() {
        return Err(DataError::NoMemberColumns(path.display().to_string()));
    }

    if df.column(ID_COLUMN).is_ok() {
        let ids = object_ids(&df)?;
        for (row, (found, expected)) in ids.iter().zip(catalog.ids()).enumerate() {
            if found != expected {
                return Err(DataError::IdMismatch {
                    row: row + 1,
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }
    }

    let columns = member_columns
        .iter()
        .enumerate()
        .map(|(position, name)| Ok((member_id(name, position), lenient_column(&df, name)?)))
        .collect::<Result<Vec<_>, DataError>>()?;
    Ok(PredictionTable::from_columns(df.height(), columns))
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v:.6}"))
}

fn flag_label(flag: ObjectFlag) -> &'static str {
    match flag {
        ObjectFlag::InvalidPdf => "invalid_pdf",
        ObjectFlag::PartialEnsemble => "partial_ensemble",
        ObjectFlag::NeighborFallback => "neighbor_fallback",
        ObjectFlag::NoNeighborsInRange => "no_neighbors_in_range",
        ObjectFlag::ErrorEstimationFailed => "error_estimation_failed",
        ObjectFlag::OutsideTraining => "outside_training",
    }
}

/// Writes one row per object: point estimates, per-strategy errors, the reported error
/// and the flags.
pub fn write_estimates(path: impl AsRef<Path>, output: &CombinedOutput) -> Result<(), DataError> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(
        file,
        "id\tvalid\tn_valid\tmean\tmedian\tmode\testimate\tensemble_spread\tneighbor_scatter\tinput_resampling\terror\ttraining_coverage\tflags"
    )?;
    for object in &output.objects {
        let strategy = |s: ErrorStrategy| format_value(object.error(s).map(|e| e.value));
        let flags = if object.flags.is_empty() {
            "-".to_string()
        } else {
            object.flags.iter().map(|&f| flag_label(f)).join(",")
        };
        writeln!(
            file,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            object.id,
            object.valid,
            object.pdf.n_valid,
            format_value(object.estimates.map(|e| e.mean)),
            format_value(object.estimates.map(|e| e.median)),
            format_value(object.estimates.map(|e| e.mode)),
            format_value(object.reported),
            strategy(ErrorStrategy::EnsembleSpread),
            strategy(ErrorStrategy::NeighborScatter),
            strategy(ErrorStrategy::InputResampling),
            format_value(object.combined_error),
            format_value(object.training_coverage),
            flags
        )?;
    }
    file.flush()?;
    Ok(())
}

/// Writes the binned PDFs, one row per object and one column per bin center. The last row,
/// `stacked`, is the population PDF.
pub fn write_pdfs(path: impl AsRef<Path>, output: &CombinedOutput) -> Result<(), DataError> {
    let mut file = BufWriter::new(File::create(path)?);
    let header = output.bin_centers.iter().map(|c| format!("{c:.6}")).join("\t");
    writeln!(file, "id\t{header}")?;
    for object in &output.objects {
        let masses = object.pdf.masses.iter().map(|m| format!("{m:.6e}")).join("\t");
        writeln!(file, "{}\t{}", object.id, masses)?;
    }
    let stacked = output.stacked_pdf.iter().map(|m| format!("{m:.6e}")).join("\t");
    writeln!(file, "stacked\t{stacked}")?;
    file.flush()?;
    Ok(())
}

fn weight_flag_label(flag: WeightFlag) -> &'static str {
    match flag {
        WeightFlag::Nominal => "nominal",
        WeightFlag::Clamped => "clamped",
        WeightFlag::ZeroDistance => "zero_distance",
        WeightFlag::Excluded => "excluded",
    }
}

/// Writes the density weights of a labeled catalog, one row per object.
pub fn write_weights(
    path: impl AsRef<Path>,
    catalog: &Catalog,
    weights: &DensityWeights,
) -> Result<(), DataError> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "id\tweight\traw_ratio\tflag")?;
    for (row, id) in catalog.ids().iter().enumerate() {
        writeln!(
            file,
            "{}\t{:.6}\t{:.6}\t{}",
            id,
            weights.weights[row],
            weights.raw[row],
            weight_flag_label(weights.flags[row])
        )?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn reserved_columns_are_not_features() {
        let file = create_test_tsv(
            "id\tmag_g\tmag_r\tmag_g_err\tmag_r_err\ttarget\tweight\n\
             a\t20.1\t19.5\t0.05\t0.04\t0.31\t1.0\n\
             b\t21.3\t20.2\t0.08\t0.06\t0.52\t2.0\n\
             c\t22.0\t21.1\t0.10\t0.09\t0.77\t0.5",
        )
        .unwrap();
        let catalog = load_catalog(file.path(), "train", CatalogRole::Training, None).unwrap();
        assert_eq!(catalog.feature_names(), &["mag_g".to_string(), "mag_r".to_string()]);
        assert_eq!(catalog.id(1), &ObjectId::from("b"));
        assert!(catalog.is_labeled());
        assert_abs_diff_eq!(catalog.weights()[2], 0.5);
        let errors = catalog.feature_errors().unwrap();
        assert_abs_diff_eq!(errors[[0, 1]], 0.04);
    }

    #[test]
    fn missing_ids_are_generated() {
        let file = create_test_tsv("x\n0.1\n0.2").unwrap();
        let catalog = load_catalog(file.path(), "apply", CatalogRole::Application, None).unwrap();
        assert_eq!(catalog.id(0), &ObjectId::from("1"));
        assert_eq!(catalog.id(1), &ObjectId::from("2"));
        assert!(!catalog.is_labeled());
    }

    #[test]
    fn incomplete_error_columns_are_rejected() {
        let file = create_test_tsv("x\ty\tx_err\n1.0\t2.0\t0.1").unwrap();
        let result = load_catalog(file.path(), "apply", CatalogRole::Application, None);
        assert!(matches!(result, Err(DataError::IncompleteErrorColumns(c)) if c == "y_err"));
    }

    #[test]
    fn explicit_features_must_exist() {
        let file = create_test_tsv("x\ty\n1.0\t2.0").unwrap();
        let names = vec!["x".to_string(), "z".to_string()];
        let result = load_catalog(file.path(), "apply", CatalogRole::Application, Some(&names));
        assert!(matches!(result, Err(DataError::ColumnNotFound(c)) if c == "z"));
    }

    #[test]
    fn non_numeric_features_are_rejected() {
        let file = create_test_tsv("x\ty\n1.0\tbright\n2.0\tfaint").unwrap();
        let result = load_catalog(file.path(), "apply", CatalogRole::Application, None);
        assert!(matches!(result, Err(DataError::ColumnWrongType { .. })));
    }

    #[test]
    fn prediction_tables_keep_gaps_as_missing_predictions() {
        let catalog_file = create_test_tsv("id\tx\na\t1.0\nb\t2.0").unwrap();
        let catalog = load_catalog(catalog_file.path(), "apply", CatalogRole::Application, None).unwrap();
        let predictions = create_test_tsv("id\tmember_3\tmember_7\na\t0.4\t\nb\t0.6\t0.5").unwrap();
        let table = load_prediction_table(predictions.path(), &catalog).unwrap();
        assert_eq!(table.members(), &[3, 7]);
        assert!(table.values()[[0, 1]].is_nan());
        assert_abs_diff_eq!(table.values()[[1, 1]], 0.5);

        let shuffled = create_test_tsv("id\tmember_0\nb\t0.4\na\t0.6").unwrap();
        assert!(matches!(
            load_prediction_table(shuffled.path(), &catalog),
            Err(DataError::IdMismatch { row: 1, .. })
        ));
    }
}
