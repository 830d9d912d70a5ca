//! # Data Loading and Validation Module
//!
//! This module is the exclusive entry point for caller-supplied biomarker
//! tables. It reads delimited files with polars, validates them against the
//! fixed panel schema and normalises them into an immutable [`Dataset`].
//!
//! - Strict Schema: the identifier column is `ID` and the predictors are
//!   `TREM_1`, `IL_6` and `Procalcitonin`, all case-sensitive, in pg/mL,
//!   untransformed. Nothing about the schema is configurable.
//! - Fail Fast: every structural problem aborts before any model is touched,
//!   and the error names exactly what is wrong (columns, ids, values).
//! - Explicit Normalisation: predictor columns out of canonical order, text
//!   columns holding numbers and unused columns are all handled here once and
//!   reported back as [`SchemaCoercion`]s instead of being silently patched.
//! - Missing predictor values are kept as `None`; dropping those records is the
//!   job of the missing-data filter, not of validation.

use crate::config::ValidationConfig;
use ahash::{AHashMap, AHashSet};
use polars::prelude::*;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Name of the caller-supplied identifier column.
pub const ID_COLUMN: &str = "ID";

/// How many offending ids or values an error message lists before truncating.
const MAX_REPORTED: usize = 10;

/// The three plasma biomarkers of the panel, in canonical model order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Biomarker {
    /// Soluble triggering receptor expressed on myeloid cells 1 (sTREM-1).
    Trem1,
    /// Interleukin 6.
    Il6,
    Procalcitonin,
}

impl Biomarker {
    /// Column order every model artifact was trained on.
    pub const CANONICAL: [Biomarker; 3] = [Biomarker::Trem1, Biomarker::Il6, Biomarker::Procalcitonin];

    pub fn column_name(self) -> &'static str {
        match self {
            Biomarker::Trem1 => "TREM_1",
            Biomarker::Il6 => "IL_6",
            Biomarker::Procalcitonin => "Procalcitonin",
        }
    }

    /// Position of this biomarker in the canonical design matrix.
    pub fn index(self) -> usize {
        match self {
            Biomarker::Trem1 => 0,
            Biomarker::Il6 => 1,
            Biomarker::Procalcitonin => 2,
        }
    }

    pub fn from_column_name(name: &str) -> Option<Self> {
        Self::CANONICAL
            .into_iter()
            .find(|marker| marker.column_name() == name)
    }
}

impl fmt::Display for Biomarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

/// One patient sample (or patient-timepoint) of the panel.
#[derive(Debug, Clone, PartialEq)]
pub struct BiomarkerRecord {
    pub id: String,
    /// Concentrations in canonical order; `None` marks a missing measurement.
    pub values: [Option<f64>; 3],
}

impl BiomarkerRecord {
    pub fn new(id: impl Into<String>, trem_1: Option<f64>, il_6: Option<f64>, pct: Option<f64>) -> Self {
        Self {
            id: id.into(),
            values: [trem_1, il_6, pct],
        }
    }

    pub fn value(&self, marker: Biomarker) -> Option<f64> {
        self.values[marker.index()]
    }

    /// Biomarkers without a measurement for this record, in canonical order.
    pub fn missing(&self) -> Vec<Biomarker> {
        Biomarker::CANONICAL
            .into_iter()
            .filter(|marker| self.value(*marker).is_none())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.values.iter().all(Option::is_some)
    }
}

/// An ordered, validated batch of records with unique identifiers.
///
/// Instances only come out of [`validate`] or [`Dataset::from_records`], so a
/// `Dataset` is never empty and never holds duplicate ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    records: Vec<BiomarkerRecord>,
}

impl Dataset {
    /// Builds a dataset from in-memory records, enforcing the same invariants as
    /// table validation: non-empty, unique ids, finite and (optionally) non-negative values.
    pub fn from_records(
        records: Vec<BiomarkerRecord>,
        options: &ValidationConfig,
    ) -> Result<Self, DataError> {
        if records.is_empty() {
            return Err(DataError::EmptyInput);
        }
        check_unique_ids(records.iter().map(|r| r.id.as_str()))?;

        for marker in Biomarker::CANONICAL {
            let non_finite: Vec<String> = records
                .iter()
                .filter_map(|r| match r.value(marker) {
                    Some(v) if !v.is_finite() => Some(format!("ID {}: {v}", r.id)),
                    _ => None,
                })
                .collect();
            if !non_finite.is_empty() {
                return Err(DataError::NonNumericPredictor {
                    column: marker.column_name().to_string(),
                    detail: summarise(&non_finite),
                });
            }
        }
        if options.reject_negative {
            check_non_negative(&records)?;
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[BiomarkerRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BiomarkerRecord> {
        self.records.get(index)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }
}

/// A normalisation the validator applied to make the table usable.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaCoercion {
    /// Predictor columns appeared in this order and were rearranged to canonical order.
    ReorderedPredictors { found: Vec<String> },
    /// The column was stored as text and its values were parsed as numbers.
    ParsedTextColumn { column: Biomarker },
    /// Columns that play no part in prediction and were left out.
    IgnoredColumns { columns: Vec<String> },
}

impl fmt::Display for SchemaCoercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaCoercion::ReorderedPredictors { found } => write!(
                f,
                "Predictor columns were found in the order [{}] and were reordered to [TREM_1, IL_6, Procalcitonin].",
                found.join(", ")
            ),
            SchemaCoercion::ParsedTextColumn { column } => {
                write!(f, "Column '{column}' was stored as text and was parsed as numeric.")
            }
            SchemaCoercion::IgnoredColumns { columns } => {
                write!(f, "Columns not used for prediction were ignored: {}", columns.join(", "))
            }
        }
    }
}

/// Non-fatal hint that a predictor column is dominated by one repeated value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyWarning {
    pub column: Biomarker,
    pub value: f64,
    pub count: usize,
    pub total: usize,
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Column '{}' holds the value {} in {} of {} rows ({:.1}%); the column may contain duplicated or corrupted data.",
            self.column,
            self.value,
            self.count,
            self.total,
            100.0 * self.count as f64 / self.total as f64
        )
    }
}

/// Output of [`validate`]: the dataset plus everything the caller should be told about it.
#[derive(Debug, Clone)]
pub struct ValidatedTable {
    pub dataset: Dataset,
    pub coercions: Vec<SchemaCoercion>,
    pub warnings: Vec<ConsistencyWarning>,
}

/// A comprehensive error type for all table loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The input is not a well-formed table: {0}")]
    Shape(String),
    #[error(
        "The identifier column 'ID' was not found in the input. Please check spelling and case."
    )]
    MissingIdColumn,
    #[error("The identifier in row {row} is empty. Every record needs a unique 'ID'.")]
    MissingIdValue { row: usize },
    #[error(
        "Duplicate identifiers found: {}. Identifiers must be unique; encode repeated timepoints into the ID.",
        .ids.join(", ")
    )]
    DuplicateId { ids: Vec<String> },
    #[error(
        "Required predictor column(s) not found: {}. Please check spelling and case.",
        .columns.join(", ")
    )]
    MissingColumns { columns: Vec<String> },
    #[error("The input table contains no data rows.")]
    EmptyInput,
    #[error("Predictor column '{column}' contains non-numeric data: {detail}")]
    NonNumericPredictor { column: String, detail: String },
    #[error(
        "Predictor column '{column}' contains negative concentrations ({}). Values must be untransformed pg/mL.",
        .ids.join(", ")
    )]
    NegativeConcentration { column: String, ids: Vec<String> },
}

/// Reads a delimited table from disk. Files ending in `.csv` are comma-separated,
/// everything else is read as TSV. `NA` and empty cells become nulls.
pub fn load_table(path: &Path) -> Result<DataFrame, DataError> {
    let separator = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };

    log::info!("Loading biomarker table from '{}'", path.display());
    let file = File::open(path)?;
    let df = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(separator)
                        .with_null_values(Some(NullValues::AllColumns(vec!["NA".into()]))),
                ),
        )
        .finish()
        .map_err(|err| DataError::Shape(err.to_string()))?;

    log::debug!("Loaded table with {} rows and {} columns", df.height(), df.width());
    Ok(df)
}

/// Loads and validates a biomarker table in one step.
pub fn load_and_validate(path: &Path, options: &ValidationConfig) -> Result<ValidatedTable, DataError> {
    let df = load_table(path)?;
    validate(&df, options)
}

/// Validates a table against the panel schema and normalises it into a [`Dataset`].
///
/// Checks run in a fixed order and the first failure wins: table shape, the
/// identifier column, row count, identifier values, required predictors, then
/// predictor contents.
pub fn validate(df: &DataFrame, options: &ValidationConfig) -> Result<ValidatedTable, DataError> {
    // --- Shape ---
    if df.width() == 0 {
        return Err(DataError::Shape("the table has no columns".to_string()));
    }
    for column in df.get_columns() {
        if matches!(column.dtype(), DataType::List(_)) {
            return Err(DataError::Shape(format!(
                "column '{}' holds nested values; every cell must be a scalar",
                column.name()
            )));
        }
    }

    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();

    // --- Identifiers ---
    if !column_names.iter().any(|name| name == ID_COLUMN) {
        return Err(DataError::MissingIdColumn);
    }
    if df.height() == 0 {
        return Err(DataError::EmptyInput);
    }
    let ids = extract_ids(df)?;
    check_unique_ids(ids.iter().map(String::as_str))?;

    // --- Required predictors ---
    let missing: Vec<String> = Biomarker::CANONICAL
        .into_iter()
        .filter(|marker| !column_names.iter().any(|name| name == marker.column_name()))
        .map(|marker| marker.column_name().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(DataError::MissingColumns { columns: missing });
    }

    let mut coercions = Vec::new();

    // Relative order of the predictors as they appear in the file.
    let found_order: Vec<String> = column_names
        .iter()
        .filter(|name| Biomarker::from_column_name(name).is_some())
        .cloned()
        .collect();
    let canonical_order: Vec<&str> = Biomarker::CANONICAL.iter().map(|m| m.column_name()).collect();
    if found_order.iter().map(String::as_str).ne(canonical_order.iter().copied()) {
        log::warn!(
            "Predictor columns are in the order [{}]; reordering to [{}].",
            found_order.join(", "),
            canonical_order.join(", ")
        );
        coercions.push(SchemaCoercion::ReorderedPredictors { found: found_order });
    }

    let ignored: Vec<String> = column_names
        .iter()
        .filter(|name| name.as_str() != ID_COLUMN && Biomarker::from_column_name(name).is_none())
        .cloned()
        .collect();
    if !ignored.is_empty() {
        log::debug!("Ignoring columns not used for prediction: {ignored:?}");
        coercions.push(SchemaCoercion::IgnoredColumns { columns: ignored });
    }

    // --- Predictor contents ---
    let mut columns: Vec<Vec<Option<f64>>> = Vec::with_capacity(3);
    for marker in Biomarker::CANONICAL {
        let series = df.column(marker.column_name())?.as_materialized_series();
        let (values, parsed_text) = normalise_predictor(series, marker, &ids)?;
        if parsed_text {
            coercions.push(SchemaCoercion::ParsedTextColumn { column: marker });
        }
        columns.push(values);
    }

    let records: Vec<BiomarkerRecord> = ids
        .into_iter()
        .enumerate()
        .map(|(row, id)| BiomarkerRecord {
            id,
            values: [columns[0][row], columns[1][row], columns[2][row]],
        })
        .collect();

    if options.reject_negative {
        check_non_negative(&records)?;
    }

    let warnings = consistency_warnings(&records, options);
    for warning in &warnings {
        log::warn!("{warning}");
    }

    log::info!(
        "Validated {} records; {} schema coercion(s) applied.",
        records.len(),
        coercions.len()
    );

    Ok(ValidatedTable {
        dataset: Dataset { records },
        coercions,
        warnings,
    })
}

fn extract_ids(df: &DataFrame) -> Result<Vec<String>, DataError> {
    let series = df.column(ID_COLUMN)?.as_materialized_series();
    let as_text = series.cast(&DataType::String)?;
    let mut ids = Vec::with_capacity(as_text.len());
    for (row, value) in as_text.str()?.into_iter().enumerate() {
        match value.map(str::trim) {
            Some(text) if !text.is_empty() => ids.push(text.to_string()),
            _ => return Err(DataError::MissingIdValue { row: row + 1 }),
        }
    }
    Ok(ids)
}

fn check_unique_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Result<(), DataError> {
    let mut seen: AHashSet<&str> = AHashSet::new();
    let mut duplicates: Vec<String> = Vec::new();
    for id in ids {
        if !seen.insert(id) && !duplicates.iter().any(|d| d == id) {
            duplicates.push(id.to_string());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(DataError::DuplicateId { ids: duplicates })
    }
}

/// Converts one predictor column to `f64`, mapping nulls, NaN and `NA`-like text to `None`.
/// Returns whether the column had to be parsed from text.
fn normalise_predictor(
    series: &Series,
    marker: Biomarker,
    ids: &[String],
) -> Result<(Vec<Option<f64>>, bool), DataError> {
    let dtype = series.dtype();
    let mut offending: Vec<String> = Vec::new();

    let (values, parsed_text) = if dtype.is_float() || dtype.is_integer() {
        let casted = series.cast(&DataType::Float64)?;
        let values: Vec<Option<f64>> = casted
            .f64()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| match value {
                Some(v) if v.is_nan() => None,
                Some(v) if v.is_infinite() => {
                    offending.push(format!("ID {}: {v}", ids[row]));
                    None
                }
                other => other,
            })
            .collect();
        (values, false)
    } else if matches!(dtype, DataType::String) {
        let values: Vec<Option<f64>> = series
            .str()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| {
                let text = value.map(str::trim).unwrap_or("");
                if is_missing_token(text) {
                    return None;
                }
                match text.parse::<f64>() {
                    Ok(v) if v.is_finite() => Some(v),
                    Ok(v) if v.is_nan() => None,
                    _ => {
                        offending.push(format!("ID {}: \"{text}\"", ids[row]));
                        None
                    }
                }
            })
            .collect();
        (values, true)
    } else if matches!(dtype, DataType::Null) {
        (vec![None; series.len()], false)
    } else {
        return Err(DataError::NonNumericPredictor {
            column: marker.column_name().to_string(),
            detail: format!("the column has type {dtype}, expected numbers"),
        });
    };

    if !offending.is_empty() {
        return Err(DataError::NonNumericPredictor {
            column: marker.column_name().to_string(),
            detail: summarise(&offending),
        });
    }
    Ok((values, parsed_text))
}

fn is_missing_token(text: &str) -> bool {
    text.is_empty()
        || text.eq_ignore_ascii_case("na")
        || text.eq_ignore_ascii_case("nan")
        || text.eq_ignore_ascii_case("null")
}

fn check_non_negative(records: &[BiomarkerRecord]) -> Result<(), DataError> {
    for marker in Biomarker::CANONICAL {
        let ids: Vec<String> = records
            .iter()
            .filter(|r| r.value(marker).is_some_and(|v| v < 0.0))
            .map(|r| r.id.clone())
            .collect();
        if !ids.is_empty() {
            return Err(DataError::NegativeConcentration {
                column: marker.column_name().to_string(),
                ids,
            });
        }
    }
    Ok(())
}

/// Flags columns in which one value accounts for too large a share of the rows.
///
/// Only the most frequent value of each column is reported; ties go to the
/// value that appears first in the table.
fn consistency_warnings(records: &[BiomarkerRecord], options: &ValidationConfig) -> Vec<ConsistencyWarning> {
    let total = records.len();
    if total <= options.consistency_min_records {
        return Vec::new();
    }

    let mut warnings = Vec::new();
    for marker in Biomarker::CANONICAL {
        // Keyed on the bit pattern; `+ 0.0` folds -0.0 into 0.0.
        let mut counts: AHashMap<u64, usize> = AHashMap::new();
        let mut first_seen: Vec<f64> = Vec::new();
        for value in records.iter().filter_map(|r| r.value(marker)) {
            let count = counts.entry((value + 0.0).to_bits()).or_insert(0);
            if *count == 0 {
                first_seen.push(value + 0.0);
            }
            *count += 1;
        }

        let mut top: Option<(f64, usize)> = None;
        for value in first_seen {
            let count = counts[&value.to_bits()];
            if top.is_none_or(|(_, best)| count > best) {
                top = Some((value, count));
            }
        }

        if let Some((value, count)) = top {
            if count as f64 / total as f64 > options.consistency_max_fraction {
                warnings.push(ConsistencyWarning {
                    column: marker,
                    value,
                    count,
                    total,
                });
            }
        }
    }
    warnings
}

fn summarise(items: &[String]) -> String {
    if items.len() <= MAX_REPORTED {
        items.join(", ")
    } else {
        format!(
            "{} (and {} more)",
            items[..MAX_REPORTED].join(", "),
            items.len() - MAX_REPORTED
        )
    }
}
