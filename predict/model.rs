use crate::data::Biomarker;
use crate::trees::{TreeArrays, TreeError};
use ndarray::{Array2, ArrayView2, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the public, human-readable format of the frozen models
// when serialized to TOML files in the artifact store.

/// Defines the link function applied to the summed regression ensemble output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    /// The ensemble sums to log-odds; the score is its sigmoid.
    Logit,
    /// The ensemble sums directly to the score, which is then clamped to [0, 1].
    Identity,
}

/// Provenance and input contract shared by both artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub name: String,
    pub version: String,
    /// Predictor order the model was trained on. Must equal the canonical panel order.
    pub features: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// The frozen DIP stage classifier: a probability forest.
///
/// Each leaf stores class weights (counts or proportions); a sample's class
/// distribution is the mean over trees of the normalised leaf weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierArtifact {
    pub metadata: ArtifactMetadata,
    pub classes: Vec<String>,
    pub trees: Vec<TreeArrays<Vec<f64>>>,
}

/// The frozen cDIP regressor: a gradient-boosted regression ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressorArtifact {
    pub metadata: ArtifactMetadata,
    pub link: LinkFunction,
    pub base_score: f64,
    pub learning_rate: f64,
    pub trees: Vec<TreeArrays<f64>>,
}

/// Custom error type for artifact loading and model invocation.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model artifact not found at '{}'. Check the artifact directory and model version.", .path.display())]
    ArtifactMissing { path: PathBuf },
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file '{}': {source}", .path.display())]
    ArtifactParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model artifact '{name}' is invalid: {reason}")]
    InvalidArtifact { name: String, reason: String },
    #[error("Model artifact '{name}' was trained on features [{}], but the panel order is [TREM_1, IL_6, Procalcitonin].", .found.join(", "))]
    FeatureMismatch { name: String, found: Vec<String> },
    #[error("Backend '{backend}' received a matrix with {found} columns; exactly 3 predictors are required.")]
    InputShape { backend: String, found: usize },
    #[error("Backend '{backend}' produces {found} output columns per record; this prediction path needs {expected}.")]
    OutputWidth {
        backend: String,
        found: usize,
        expected: usize,
    },
    #[error("Backend '{backend}' returned a {rows}x{cols} matrix, expected {expected_rows}x{expected_cols}.")]
    OutputShape {
        backend: String,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error(
        "Backend '{backend}' produced a non-finite value at row {row}, column {column}. The whole batch was discarded."
    )]
    PredictionNaN {
        backend: String,
        row: usize,
        column: usize,
    },
    #[error("External model process '{program}' failed: {message}")]
    BackendProcess { program: String, message: String },
    #[error("External model process '{program}' did not answer within {seconds} s and was stopped.")]
    BackendTimeout { program: String, seconds: u64 },
}

impl ClassifierArtifact {
    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    /// Loads and checks a classifier artifact from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let artifact: Self = internal::read_toml(path)?;
        artifact.check()?;
        Ok(artifact)
    }

    /// Saves the artifact in its human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        internal::write_toml(self, path)
    }

    pub fn check(&self) -> Result<(), ModelError> {
        let name = &self.metadata.name;
        internal::check_features(&self.metadata)?;
        if self.classes.len() != 3 {
            return Err(internal::invalid(
                name,
                format!("expected 3 DIP classes, found {}", self.classes.len()),
            ));
        }
        if self.trees.is_empty() {
            return Err(internal::invalid(name, "the forest has no trees".to_string()));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            tree.check(Biomarker::CANONICAL.len())
                .map_err(|err| internal::tree_invalid(name, t, err))?;
            for node in 0..tree.n_nodes() {
                if tree.feature[node] >= 0 {
                    continue;
                }
                let weights = &tree.value[node];
                let total: f64 = weights.iter().sum();
                if weights.len() != self.classes.len()
                    || weights.iter().any(|w| !w.is_finite() || *w < 0.0)
                    || total <= 0.0
                {
                    return Err(internal::invalid(
                        name,
                        format!("tree {t} leaf {node} must hold 3 non-negative class weights with a positive sum"),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl RegressorArtifact {
    /// Loads and checks a regressor artifact from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let artifact: Self = internal::read_toml(path)?;
        artifact.check()?;
        Ok(artifact)
    }

    /// Saves the artifact in its human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        internal::write_toml(self, path)
    }

    pub fn check(&self) -> Result<(), ModelError> {
        let name = &self.metadata.name;
        internal::check_features(&self.metadata)?;
        if !self.base_score.is_finite() || !self.learning_rate.is_finite() {
            return Err(internal::invalid(
                name,
                "base_score and learning_rate must be finite".to_string(),
            ));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            tree.check(Biomarker::CANONICAL.len())
                .map_err(|err| internal::tree_invalid(name, t, err))?;
            if tree.value.iter().any(|v| !v.is_finite()) {
                return Err(internal::invalid(name, format!("tree {t} has non-finite leaf values")));
            }
        }
        Ok(())
    }
}

/// A frozen model behind a uniform batch-predict contract.
///
/// Input is an N×3 matrix in canonical predictor order; output is N×K with
/// K = [`ModelBackend::output_width`]. Implementations must not keep state
/// between calls.
pub trait ModelBackend: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Number of output columns per record.
    fn output_width(&self) -> usize;

    fn predict(&self, matrix: ArrayView2<f64>) -> Result<Array2<f64>, ModelError>;
}

/// Runs a backend and enforces the shared contract on its output.
///
/// A single non-finite element aborts the whole batch.
pub fn invoke(backend: &dyn ModelBackend, matrix: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
    if matrix.ncols() != Biomarker::CANONICAL.len() {
        return Err(ModelError::InputShape {
            backend: backend.name().to_string(),
            found: matrix.ncols(),
        });
    }

    log::debug!("Invoking backend '{}' on {} records", backend.name(), matrix.nrows());
    let output = backend.predict(matrix)?;

    if output.nrows() != matrix.nrows() || output.ncols() != backend.output_width() {
        return Err(ModelError::OutputShape {
            backend: backend.name().to_string(),
            rows: output.nrows(),
            cols: output.ncols(),
            expected_rows: matrix.nrows(),
            expected_cols: backend.output_width(),
        });
    }
    if let Some(((row, column), _)) = output.indexed_iter().find(|(_, v)| !v.is_finite()) {
        log::error!(
            "Backend '{}' returned a non-finite value at ({row}, {column})",
            backend.name()
        );
        return Err(ModelError::PredictionNaN {
            backend: backend.name().to_string(),
            row,
            column,
        });
    }
    Ok(output)
}

/// In-process evaluation of the DIP stage classifier. Output width 3.
#[derive(Debug, Clone)]
pub struct ClassifierBackend {
    artifact: Arc<ClassifierArtifact>,
}

impl ClassifierBackend {
    pub fn new(artifact: Arc<ClassifierArtifact>) -> Self {
        Self { artifact }
    }

    pub fn artifact(&self) -> &ClassifierArtifact {
        &self.artifact
    }
}

impl ModelBackend for ClassifierBackend {
    fn name(&self) -> &str {
        &self.artifact.metadata.name
    }

    fn output_width(&self) -> usize {
        self.artifact.n_classes()
    }

    fn predict(&self, matrix: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        let n_classes = self.artifact.n_classes();
        let n_trees = self.artifact.trees.len() as f64;
        let mut probs = Array2::zeros((matrix.nrows(), n_classes));

        for (sample, mut out) in matrix.axis_iter(Axis(0)).zip(probs.axis_iter_mut(Axis(0))) {
            for tree in &self.artifact.trees {
                let weights = tree.leaf(sample);
                let total: f64 = weights.iter().sum();
                for (k, w) in weights.iter().enumerate() {
                    out[k] += w / total;
                }
            }
            out.mapv_inplace(|p| p / n_trees);
        }
        Ok(probs)
    }
}

/// In-process evaluation of the cDIP regressor. Output width 1.
#[derive(Debug, Clone)]
pub struct RegressorBackend {
    artifact: Arc<RegressorArtifact>,
}

impl RegressorBackend {
    pub fn new(artifact: Arc<RegressorArtifact>) -> Self {
        Self { artifact }
    }

    pub fn artifact(&self) -> &RegressorArtifact {
        &self.artifact
    }
}

impl ModelBackend for RegressorBackend {
    fn name(&self) -> &str {
        &self.artifact.metadata.name
    }

    fn output_width(&self) -> usize {
        1
    }

    fn predict(&self, matrix: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        let artifact = &self.artifact;
        let mut scores = Array2::zeros((matrix.nrows(), 1));

        for (row, sample) in matrix.axis_iter(Axis(0)).enumerate() {
            let raw: f64 = artifact.base_score
                + artifact.learning_rate
                    * artifact.trees.iter().map(|tree| *tree.leaf(sample)).sum::<f64>();
            scores[[row, 0]] = match artifact.link {
                LinkFunction::Logit => {
                    // Clamp eta to prevent overflow in exp().
                    let eta = raw.clamp(-700.0, 700.0);
                    1.0 / (1.0 + f64::exp(-eta))
                }
                LinkFunction::Identity => raw.clamp(0.0, 1.0),
            };
        }
        Ok(scores)
    }
}

/// Internal module for artifact I/O and checking helpers.
mod internal {
    use super::*;

    pub(super) fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
        if !path.is_file() {
            return Err(ModelError::ArtifactMissing {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|source| ModelError::ArtifactParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub(super) fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(value)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub(super) fn check_features(metadata: &ArtifactMetadata) -> Result<(), ModelError> {
        let canonical = Biomarker::CANONICAL.iter().map(|m| m.column_name());
        if metadata.features.iter().map(String::as_str).ne(canonical) {
            return Err(ModelError::FeatureMismatch {
                name: metadata.name.clone(),
                found: metadata.features.clone(),
            });
        }
        Ok(())
    }

    pub(super) fn invalid(name: &str, reason: String) -> ModelError {
        ModelError::InvalidArtifact {
            name: name.to_string(),
            reason,
        }
    }

    pub(super) fn tree_invalid(name: &str, tree: usize, err: TreeError) -> ModelError {
        invalid(name, format!("tree {tree}: {err}"))
    }
}
