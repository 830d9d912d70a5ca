//! The two prediction paths, end to end.
//!
//! ```text
//! table -> validate -> filter_missing -> design matrix -> backend
//!       -> assign + guard (stage path only) -> assemble
//! ```
//!
//! Validation failures abort before any backend is touched. Once a backend has
//! been invoked, any failure discards the whole batch: there are no partial
//! results.

use crate::assemble::{AssemblyError, ScoreResult, StageResult, score_rows, stage_rows};
use crate::config::{ConfigError, GuardConfig, PipelineConfig, RegressorBackendConfig};
use crate::data::{DataError, Dataset, ValidatedTable, load_and_validate, validate};
use crate::external::ExternalBackend;
use crate::filter::{FilterError, filter_missing};
use crate::guard::{self, GuardError};
use crate::model::{ClassifierBackend, ModelBackend, ModelError, RegressorBackend, invoke};
use crate::stage::{DipStage, StageError, assign_batch};
use crate::store::ArtifactStore;
use polars::prelude::DataFrame;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}

/// Classifies every complete record into a DIP stage.
///
/// `backend` must produce three columns of class probabilities in stage order.
pub fn predict_stage(
    dataset: &Dataset,
    backend: &dyn ModelBackend,
    guard_config: &GuardConfig,
) -> Result<StageResult, PipelineError> {
    let expected = DipStage::ALL.len();
    if backend.output_width() != expected {
        return Err(ModelError::OutputWidth {
            backend: backend.name().to_string(),
            found: backend.output_width(),
            expected,
        }
        .into());
    }

    let filtered = filter_missing(dataset)?;
    let matrix = filtered.design_matrix();
    let probabilities = invoke(backend, matrix.view())?;

    let ids: Vec<&str> = filtered.records().map(|record| record.id.as_str()).collect();
    let predictions = assign_batch(ids.iter().copied(), probabilities.view())?;
    guard::check(&predictions, guard_config)?;

    let rows = stage_rows(&filtered, predictions)?;
    Ok(StageResult {
        rows,
        exclusions: filtered.into_report(),
        coercions: Vec::new(),
        warnings: Vec::new(),
    })
}

/// Scores every complete record on the continuous cDIP scale.
pub fn predict_score(dataset: &Dataset, backend: &dyn ModelBackend) -> Result<ScoreResult, PipelineError> {
    let filtered = filter_missing(dataset)?;
    let matrix = filtered.design_matrix();
    let scores = invoke(backend, matrix.view())?;

    let rows = score_rows(&filtered, scores.view())?;
    Ok(ScoreResult {
        rows,
        exclusions: filtered.into_report(),
        coercions: Vec::new(),
        warnings: Vec::new(),
    })
}

/// Owns the configuration and artifact store and runs either path on raw tables.
#[derive(Debug)]
pub struct Predictor {
    config: PipelineConfig,
    store: ArtifactStore,
}

impl Predictor {
    /// Checks the configuration and resolves the artifact store from it.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.check()?;
        let store = ArtifactStore::from_config(&config.artifacts);
        Ok(Self { config, store })
    }

    /// Uses an explicit store, ignoring `config.artifacts`.
    pub fn with_store(config: PipelineConfig, store: ArtifactStore) -> Result<Self, PipelineError> {
        config.check()?;
        Ok(Self { config, store })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn classifier_backend(&self) -> Result<ClassifierBackend, ModelError> {
        Ok(ClassifierBackend::new(self.store.classifier()?))
    }

    /// The in-process regressor, or the configured external program.
    pub fn regressor_backend(&self) -> Result<Box<dyn ModelBackend>, ModelError> {
        match &self.config.regressor {
            RegressorBackendConfig::Builtin => Ok(Box::new(RegressorBackend::new(self.store.regressor()?))),
            RegressorBackendConfig::External {
                program,
                args,
                timeout_secs,
            } => Ok(Box::new(ExternalBackend::new(
                "cdip-external",
                program.clone(),
                args.clone(),
                Duration::from_secs(*timeout_secs),
                1,
            ))),
        }
    }

    pub fn predict_stage(&self, dataset: &Dataset) -> Result<StageResult, PipelineError> {
        let backend = self.classifier_backend()?;
        predict_stage(dataset, &backend, &self.config.guard)
    }

    pub fn predict_score(&self, dataset: &Dataset) -> Result<ScoreResult, PipelineError> {
        let backend = self.regressor_backend()?;
        predict_score(dataset, backend.as_ref())
    }

    pub fn predict_stage_table(&self, df: &DataFrame) -> Result<StageResult, PipelineError> {
        let validated = validate(df, &self.config.validation)?;
        self.stage_validated(validated)
    }

    pub fn predict_score_table(&self, df: &DataFrame) -> Result<ScoreResult, PipelineError> {
        let validated = validate(df, &self.config.validation)?;
        self.score_validated(validated)
    }

    pub fn predict_stage_file(&self, path: &Path) -> Result<StageResult, PipelineError> {
        let validated = load_and_validate(path, &self.config.validation)?;
        self.stage_validated(validated)
    }

    pub fn predict_score_file(&self, path: &Path) -> Result<ScoreResult, PipelineError> {
        let validated = load_and_validate(path, &self.config.validation)?;
        self.score_validated(validated)
    }

    fn stage_validated(&self, validated: ValidatedTable) -> Result<StageResult, PipelineError> {
        let mut result = self.predict_stage(&validated.dataset)?;
        result.coercions = validated.coercions;
        result.warnings = validated.warnings;
        Ok(result)
    }

    fn score_validated(&self, validated: ValidatedTable) -> Result<ScoreResult, PipelineError> {
        let mut result = self.predict_score(&validated.dataset)?;
        result.coercions = validated.coercions;
        result.warnings = validated.warnings;
        Ok(result)
    }
}
