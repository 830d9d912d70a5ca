//! Result assembly.
//!
//! Joins the identifiers and echoed concentrations of the kept records with
//! their predictions into one immutable result value. The row order is the
//! input order with excluded records removed. Nothing is published anywhere
//! else: callers get everything, exclusions included, from the return value.

use crate::data::{Biomarker, ConsistencyWarning, ID_COLUMN, SchemaCoercion};
use crate::filter::{ExclusionReport, FilteredDataset};
use crate::stage::{DipStage, StagePrediction};
use ndarray::ArrayView2;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("Prediction for '{found}' is out of step with input record '{expected}' at position {position}.")]
    Misaligned {
        position: usize,
        expected: String,
        found: String,
    },
    #[error("Received {found} predictions for {expected} records.")]
    CountMismatch { found: usize, expected: usize },
    #[error("cDIP score {score} for record '{id}' is outside [0, 1].")]
    ScoreOutOfRange { id: String, score: f64 },
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One output row of the classifier path.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRow {
    pub id: String,
    /// Input concentrations in canonical order, echoed unchanged.
    pub concentrations: [f64; 3],
    pub stage: DipStage,
    pub probabilities: [f64; 3],
}

/// One output row of the regression path.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub id: String,
    pub concentrations: [f64; 3],
    /// cDIP in [0, 1]; higher means more dysregulated.
    pub score: f64,
}

/// Row types that know their output table layout.
pub trait OutputRow: Sized {
    fn id(&self) -> &str;

    fn to_frame(rows: &[Self]) -> PolarsResult<DataFrame>;
}

impl OutputRow for StageRow {
    fn id(&self) -> &str {
        &self.id
    }

    fn to_frame(rows: &[Self]) -> PolarsResult<DataFrame> {
        let mut df = concentration_frame(rows.iter().map(|r| (r.id.as_str(), &r.concentrations)))?;
        let labels: Vec<&str> = rows.iter().map(|r| r.stage.label()).collect();
        df.with_column(Column::new("DIP".into(), labels))?;
        for stage in DipStage::ALL {
            let probs: Vec<f64> = rows.iter().map(|r| r.probabilities[stage.index()]).collect();
            df.with_column(Column::new(format!("{}_Prob", stage.label()).into(), probs))?;
        }
        Ok(df)
    }
}

impl OutputRow for ScoreRow {
    fn id(&self) -> &str {
        &self.id
    }

    fn to_frame(rows: &[Self]) -> PolarsResult<DataFrame> {
        let mut df = concentration_frame(rows.iter().map(|r| (r.id.as_str(), &r.concentrations)))?;
        let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
        df.with_column(Column::new("cDIP".into(), scores))?;
        Ok(df)
    }
}

fn concentration_frame<'a>(rows: impl Iterator<Item = (&'a str, &'a [f64; 3])>) -> PolarsResult<DataFrame> {
    let mut ids: Vec<&str> = Vec::new();
    let mut values: [Vec<f64>; 3] = Default::default();
    for (id, concentrations) in rows {
        ids.push(id);
        for (column, value) in values.iter_mut().zip(concentrations) {
            column.push(*value);
        }
    }
    let mut columns = vec![Column::new(ID_COLUMN.into(), ids)];
    for (marker, column) in Biomarker::CANONICAL.into_iter().zip(values) {
        columns.push(Column::new(marker.column_name().into(), column));
    }
    DataFrame::new(columns)
}

/// Predictions for one batch together with everything reported along the way.
#[derive(Debug, Clone)]
pub struct PredictionReport<R> {
    pub rows: Vec<R>,
    pub exclusions: ExclusionReport,
    pub coercions: Vec<SchemaCoercion>,
    pub warnings: Vec<ConsistencyWarning>,
}

pub type StageResult = PredictionReport<StageRow>;
pub type ScoreResult = PredictionReport<ScoreRow>;

impl<R: OutputRow> PredictionReport<R> {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(OutputRow::id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The output table: `ID`, the three predictors, then the prediction columns.
    pub fn to_dataframe(&self) -> Result<DataFrame, AssemblyError> {
        Ok(R::to_frame(&self.rows)?)
    }

    /// Writes the output table as TSV.
    pub fn write_tsv(&self, path: &Path) -> Result<(), AssemblyError> {
        let mut df = self.to_dataframe()?;
        let mut file = File::create(path)?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .with_separator(b'\t')
            .finish(&mut df)?;
        Ok(())
    }
}

impl StageResult {
    /// Records per stage, for pie charts and the like.
    pub fn stage_counts(&self) -> [usize; 3] {
        let mut counts = [0; 3];
        for row in &self.rows {
            counts[row.stage.index()] += 1;
        }
        counts
    }
}

fn concentrations_of(filtered: &FilteredDataset<'_>) -> Vec<(String, [f64; 3])> {
    filtered
        .records()
        .map(|record| {
            let values = record.values.map(|v| v.unwrap_or(f64::NAN));
            (record.id.clone(), values)
        })
        .collect()
}

/// Merges kept records with their stage predictions, checking alignment.
pub fn stage_rows(
    filtered: &FilteredDataset<'_>,
    predictions: Vec<StagePrediction>,
) -> Result<Vec<StageRow>, AssemblyError> {
    let inputs = concentrations_of(filtered);
    if inputs.len() != predictions.len() {
        return Err(AssemblyError::CountMismatch {
            found: predictions.len(),
            expected: inputs.len(),
        });
    }
    inputs
        .into_iter()
        .zip(predictions)
        .enumerate()
        .map(|(position, ((id, concentrations), prediction))| {
            if prediction.id != id {
                return Err(AssemblyError::Misaligned {
                    position,
                    expected: id,
                    found: prediction.id,
                });
            }
            Ok(StageRow {
                id,
                concentrations,
                stage: prediction.stage,
                probabilities: prediction.probabilities,
            })
        })
        .collect()
}

/// Merges kept records with an N×1 score matrix, checking the [0, 1] range.
pub fn score_rows(
    filtered: &FilteredDataset<'_>,
    scores: ArrayView2<f64>,
) -> Result<Vec<ScoreRow>, AssemblyError> {
    let inputs = concentrations_of(filtered);
    if inputs.len() != scores.nrows() || scores.ncols() != 1 {
        return Err(AssemblyError::CountMismatch {
            found: scores.nrows(),
            expected: inputs.len(),
        });
    }
    inputs
        .into_iter()
        .zip(scores.column(0))
        .map(|((id, concentrations), &score)| {
            if !(0.0..=1.0).contains(&score) {
                return Err(AssemblyError::ScoreOutOfRange { id, score });
            }
            Ok(ScoreRow {
                id,
                concentrations,
                score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::data::{BiomarkerRecord, Dataset};
    use crate::filter::filter_missing;
    use ndarray::array;
    use tempfile::tempdir;

    fn dataset() -> Dataset {
        Dataset::from_records(
            vec![
                BiomarkerRecord::new("p1", Some(120.0), Some(15.0), Some(0.3)),
                BiomarkerRecord::new("p2", Some(410.0), None, Some(2.1)),
                BiomarkerRecord::new("p3", Some(980.0), Some(850.0), Some(14.0)),
            ],
            &ValidationConfig::default(),
        )
        .unwrap()
    }

    fn stage_prediction(id: &str, stage: DipStage, probabilities: [f64; 3]) -> StagePrediction {
        StagePrediction {
            id: id.to_string(),
            stage,
            probabilities,
        }
    }

    #[test]
    fn stage_table_has_expected_columns() {
        let data = dataset();
        let filtered = filter_missing(&data).unwrap();
        let rows = stage_rows(
            &filtered,
            vec![
                stage_prediction("p1", DipStage::Dip1, [0.8, 0.15, 0.05]),
                stage_prediction("p3", DipStage::Dip3, [0.05, 0.15, 0.8]),
            ],
        )
        .unwrap();
        let report = StageResult {
            rows,
            exclusions: filtered.into_report(),
            coercions: Vec::new(),
            warnings: Vec::new(),
        };

        let df = report.to_dataframe().unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec!["ID", "TREM_1", "IL_6", "Procalcitonin", "DIP", "DIP1_Prob", "DIP2_Prob", "DIP3_Prob"]
        );
        assert_eq!(df.height(), 2);
        assert_eq!(report.stage_counts(), [1, 0, 1]);
        assert!(report.exclusions.contains("p2"));
        let ids: Vec<&str> = report.ids().collect();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[test]
    fn misaligned_predictions_are_rejected() {
        let data = dataset();
        let filtered = filter_missing(&data).unwrap();
        let result = stage_rows(
            &filtered,
            vec![
                stage_prediction("p3", DipStage::Dip3, [0.0, 0.0, 1.0]),
                stage_prediction("p1", DipStage::Dip1, [1.0, 0.0, 0.0]),
            ],
        );
        assert!(matches!(result, Err(AssemblyError::Misaligned { position: 0, .. })));
    }

    #[test]
    fn scores_outside_unit_interval_are_rejected() {
        let data = dataset();
        let filtered = filter_missing(&data).unwrap();
        let result = score_rows(&filtered, array![[0.2], [1.3]].view());
        match result {
            Err(AssemblyError::ScoreOutOfRange { id, .. }) => assert_eq!(id, "p3"),
            other => panic!("Expected ScoreOutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn score_table_round_trips_to_tsv() {
        let data = dataset();
        let filtered = filter_missing(&data).unwrap();
        let rows = score_rows(&filtered, array![[0.12], [0.97]].view()).unwrap();
        let report = ScoreResult {
            rows,
            exclusions: filtered.into_report(),
            coercions: Vec::new(),
            warnings: Vec::new(),
        };

        let dir = tempdir().unwrap();
        let path = dir.path().join("cdip.tsv");
        report.write_tsv(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("ID\tTREM_1\tIL_6\tProcalcitonin\tcDIP"));
        assert!(lines.next().unwrap().starts_with("p1\t120"));
        assert!(lines.next().unwrap().starts_with("p3\t980"));
        assert!(lines.next().is_none());
    }
}
