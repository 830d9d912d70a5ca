//! Missing-data filter.
//!
//! Records lacking any of the three predictors cannot be scored. They are not
//! an error: they are dropped, and their identifiers are handed back to the
//! caller in an [`ExclusionReport`]. The input [`Dataset`] is never modified;
//! the filter produces an index-based view over it.

use crate::data::{Biomarker, BiomarkerRecord, Dataset};
use ndarray::Array2;
use std::fmt;
use thiserror::Error;

/// A record removed from a batch because of missing predictors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedRecord {
    pub id: String,
    pub missing: Vec<Biomarker>,
}

/// Identifiers removed before model invocation, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionReport {
    excluded: Vec<ExcludedRecord>,
}

impl ExclusionReport {
    pub fn records(&self) -> &[ExcludedRecord] {
        &self.excluded
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(|r| r.id.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.excluded.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.excluded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }
}

impl fmt::Display for ExclusionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.excluded.is_empty() {
            return f.write_str("no records excluded");
        }
        let parts: Vec<String> = self
            .excluded
            .iter()
            .map(|r| {
                let names: Vec<&str> = r.missing.iter().map(|m| m.column_name()).collect();
                format!("{} (missing {})", r.id, names.join(", "))
            })
            .collect();
        write!(f, "{} record(s) excluded: {}", self.excluded.len(), parts.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error(
        "Every record is missing at least one predictor, so nothing can be predicted. Excluded: {}",
        .report
    )]
    EmptyAfterFilter { report: ExclusionReport },
}

/// The complete records of a dataset, selected by index.
#[derive(Debug, Clone)]
pub struct FilteredDataset<'a> {
    source: &'a Dataset,
    kept: Vec<usize>,
    report: ExclusionReport,
}

impl<'a> FilteredDataset<'a> {
    pub fn len(&self) -> usize {
        self.kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }

    /// Kept records in input order.
    pub fn records(&self) -> impl Iterator<Item = &'a BiomarkerRecord> + '_ {
        let source = self.source;
        self.kept.iter().filter_map(move |&i| source.get(i))
    }

    /// Positions of the kept records in the source dataset.
    pub fn indices(&self) -> &[usize] {
        &self.kept
    }

    pub fn report(&self) -> &ExclusionReport {
        &self.report
    }

    pub fn into_report(self) -> ExclusionReport {
        self.report
    }

    /// Builds the N×3 design matrix in canonical predictor order.
    pub fn design_matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.kept.len(), Biomarker::CANONICAL.len()));
        for (row, record) in self.records().enumerate() {
            for marker in Biomarker::CANONICAL {
                // Every kept record is complete, so the fallback is never taken.
                matrix[[row, marker.index()]] = record.value(marker).unwrap_or(f64::NAN);
            }
        }
        matrix
    }
}

/// Splits a dataset into complete records and an exclusion report.
pub fn filter_missing(dataset: &Dataset) -> Result<FilteredDataset<'_>, FilterError> {
    let mut kept = Vec::with_capacity(dataset.len());
    let mut excluded = Vec::new();

    for (index, record) in dataset.records().iter().enumerate() {
        if record.is_complete() {
            kept.push(index);
        } else {
            excluded.push(ExcludedRecord {
                id: record.id.clone(),
                missing: record.missing(),
            });
        }
    }

    let report = ExclusionReport { excluded };
    if !report.is_empty() {
        log::warn!("Excluding records with missing predictors: {report}");
    }
    if kept.is_empty() {
        return Err(FilterError::EmptyAfterFilter { report });
    }

    Ok(FilteredDataset {
        source: dataset,
        kept,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use approx::assert_abs_diff_eq;

    fn dataset(records: Vec<BiomarkerRecord>) -> Dataset {
        Dataset::from_records(records, &ValidationConfig::default()).unwrap()
    }

    #[test]
    fn complete_records_pass_through_in_order() {
        let data = dataset(vec![
            BiomarkerRecord::new("a", Some(1.0), Some(2.0), Some(3.0)),
            BiomarkerRecord::new("b", Some(4.0), Some(5.0), Some(6.0)),
        ]);
        let filtered = filter_missing(&data).unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.report().is_empty());

        let matrix = filtered.design_matrix();
        assert_eq!(matrix.shape(), &[2, 3]);
        assert_abs_diff_eq!(matrix[[1, 0]], 4.0);
        assert_abs_diff_eq!(matrix[[1, 2]], 6.0);
    }

    #[test]
    fn incomplete_records_are_reported_not_fatal() {
        let data = dataset(vec![
            BiomarkerRecord::new("a", Some(1.0), None, Some(3.0)),
            BiomarkerRecord::new("b", Some(4.0), Some(5.0), Some(6.0)),
            BiomarkerRecord::new("c", None, None, Some(9.0)),
        ]);
        let filtered = filter_missing(&data).unwrap();

        assert_eq!(filtered.indices(), &[1]);
        let ids: Vec<&str> = filtered.report().ids().collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(
            filtered.report().records()[1].missing,
            vec![Biomarker::Trem1, Biomarker::Il6]
        );
        // The source dataset is untouched.
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn all_incomplete_is_an_error_listing_ids() {
        let data = dataset(vec![
            BiomarkerRecord::new("x", None, Some(2.0), Some(3.0)),
            BiomarkerRecord::new("y", Some(1.0), Some(2.0), None),
        ]);
        match filter_missing(&data) {
            Err(FilterError::EmptyAfterFilter { report }) => {
                assert!(report.contains("x"));
                assert!(report.contains("y"));
                let message = FilterError::EmptyAfterFilter { report }.to_string();
                assert!(message.contains("x (missing TREM_1)"), "{message}");
            }
            other => panic!("Expected EmptyAfterFilter, got {other:?}"),
        }
    }
}
