//! Batch-level plausibility guard for stage predictions.
//!
//! A cohort split into almost exactly equal thirds across DIP1/DIP2/DIP3 is not
//! a biological finding. In practice it means the classifier saw garbage, most
//! often values in the wrong units. Such batches are rejected as a whole.

use crate::config::GuardConfig;
use crate::stage::{DipStage, StagePrediction};
use thiserror::Error;

/// Two probabilities closer than this count as tied for the top stage.
const TIE_TOLERANCE: f64 = 1e-9;

/// Stage tally of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDistribution {
    pub total: usize,
    /// Records per assigned stage; stages with no records count as zero.
    pub counts: [usize; 3],
    /// Share of the batch per stage. A record whose top probability is tied
    /// between `k` stages contributes `1/k` to each of them instead of landing
    /// wholly on the stage the tie-break picked.
    pub proportions: [f64; 3],
}

impl StageDistribution {
    pub fn from_predictions(predictions: &[StagePrediction]) -> Self {
        let mut counts = [0usize; 3];
        let mut shares = [0.0f64; 3];
        for prediction in predictions {
            counts[prediction.stage.index()] += 1;
            let p = &prediction.probabilities;
            let top = p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let tied = p.map(|v| top - v <= TIE_TOLERANCE);
            let k = tied.iter().filter(|&&t| t).count() as f64;
            for (share, is_top) in shares.iter_mut().zip(tied) {
                if is_top {
                    *share += 1.0 / k;
                }
            }
        }
        let total = predictions.len();
        let denom = total.max(1) as f64;
        Self {
            total,
            counts,
            proportions: shares.map(|s| s / denom),
        }
    }
}

#[derive(Error, Debug)]
pub enum GuardError {
    #[error(
        "Biologically implausible DIP distribution across {total} records: stage proportions of {} for DIP1/DIP2/DIP3 all lie within [{lower:.2}, {upper:.2}]. \
An almost uniform one-third split usually means malformed input, wrong units or scaling (values must be untransformed pg/mL), \
a non-numeric predictor read as numeric, or a broken runtime environment. No predictions were returned.",
        .proportions.map(|v| format!("{v:.3}")).join(" / ")
    )]
    ImplausibleDistribution {
        total: usize,
        proportions: [f64; 3],
        lower: f64,
        upper: f64,
    },
}

/// Fails the batch if its stage proportions are the near-uniform split.
///
/// Proportions come from [`StageDistribution`], so a batch of records that
/// each put equal mass on every stage reads as one third per stage even though
/// arg-max with its fixed tie-break labels all of them DIP1.
pub fn check(predictions: &[StagePrediction], config: &GuardConfig) -> Result<StageDistribution, GuardError> {
    let distribution = StageDistribution::from_predictions(predictions);

    if distribution.total < config.min_batch_size || distribution.total == 0 {
        log::debug!(
            "Plausibility guard skipped: {} predictions, minimum {}",
            distribution.total,
            config.min_batch_size
        );
        return Ok(distribution);
    }

    let band = config.lower..=config.upper;
    if distribution.proportions.iter().all(|p| band.contains(p)) {
        log::error!(
            "Rejecting batch of {}: stage proportions {:?} inside [{}, {}]",
            distribution.total,
            distribution.proportions,
            config.lower,
            config.upper
        );
        return Err(GuardError::ImplausibleDistribution {
            total: distribution.total,
            proportions: distribution.proportions,
            lower: config.lower,
            upper: config.upper,
        });
    }

    log::debug!(
        "Stage counts DIP1={} DIP2={} DIP3={}",
        distribution.counts[DipStage::Dip1.index()],
        distribution.counts[DipStage::Dip2.index()],
        distribution.counts[DipStage::Dip3.index()]
    );
    Ok(distribution)
}
