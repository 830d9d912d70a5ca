//! DIP stages and the arg-max stage assigner.

use ndarray::ArrayView2;
use std::fmt;
use thiserror::Error;

/// Tolerance on the total probability mass of one record.
pub const PROBABILITY_SUM_TOLERANCE: f64 = 1e-6;

/// Ordered DIP stages: minor, moderate, major immune dysregulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DipStage {
    Dip1,
    Dip2,
    Dip3,
}

impl DipStage {
    pub const ALL: [DipStage; 3] = [DipStage::Dip1, DipStage::Dip2, DipStage::Dip3];

    pub fn index(self) -> usize {
        match self {
            DipStage::Dip1 => 0,
            DipStage::Dip2 => 1,
            DipStage::Dip3 => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            DipStage::Dip1 => "DIP1",
            DipStage::Dip2 => "DIP2",
            DipStage::Dip3 => "DIP3",
        }
    }
}

impl fmt::Display for DipStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Stage label plus the full probability vector it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePrediction {
    pub id: String,
    pub stage: DipStage,
    pub probabilities: [f64; 3],
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Record '{id}' received an invalid probability vector {probabilities:?}: {reason}")]
    InvalidProbabilities {
        id: String,
        probabilities: Vec<f64>,
        reason: &'static str,
    },
    #[error("Received {found} probability rows for {expected} records.")]
    RowCountMismatch { found: usize, expected: usize },
}

/// Picks the most probable stage. Ties go to the lowest-severity stage.
///
/// Near-equal mass on two adjacent stages means the record sits near their
/// boundary; interpreting that is left to the caller, who gets the full vector.
pub fn assign(probabilities: &[f64; 3]) -> DipStage {
    let mut best = 0;
    for k in 1..probabilities.len() {
        if probabilities[k] > probabilities[best] {
            best = k;
        }
    }
    DipStage::ALL[best]
}

/// Assigns a stage to every row of an N×3 probability matrix.
///
/// Each row must be a proper distribution: entries in [0, 1] summing to 1
/// within [`PROBABILITY_SUM_TOLERANCE`].
pub fn assign_batch<'a>(
    ids: impl ExactSizeIterator<Item = &'a str>,
    probabilities: ArrayView2<f64>,
) -> Result<Vec<StagePrediction>, StageError> {
    if ids.len() != probabilities.nrows() || probabilities.ncols() != 3 {
        return Err(StageError::RowCountMismatch {
            found: probabilities.nrows(),
            expected: ids.len(),
        });
    }

    ids.zip(probabilities.rows())
        .map(|(id, row)| {
            let p = [row[0], row[1], row[2]];
            if p.iter().any(|v| !(0.0..=1.0).contains(v)) {
                return Err(StageError::InvalidProbabilities {
                    id: id.to_string(),
                    probabilities: p.to_vec(),
                    reason: "every probability must lie in [0, 1]",
                });
            }
            if (p.iter().sum::<f64>() - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
                return Err(StageError::InvalidProbabilities {
                    id: id.to_string(),
                    probabilities: p.to_vec(),
                    reason: "probabilities must sum to 1",
                });
            }
            Ok(StagePrediction {
                id: id.to_string(),
                stage: assign(&p),
                probabilities: p,
            })
        })
        .collect()
}
