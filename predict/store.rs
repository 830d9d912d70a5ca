//! Versioned store of the frozen model artifacts.
//!
//! Layout: `<root>/<version>/dip_classifier.toml` and
//! `<root>/<version>/cdip_regressor.toml`. Each artifact is read from disk at
//! most once per store and then shared read-only behind an `Arc`.

use crate::config::ArtifactConfig;
use crate::model::{ClassifierArtifact, ModelError, RegressorArtifact};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

pub const DEFAULT_MODEL_VERSION: &str = "v1";
pub const CLASSIFIER_FILE: &str = "dip_classifier.toml";
pub const REGRESSOR_FILE: &str = "cdip_regressor.toml";
pub const MODEL_DIR_ENV: &str = "DIPSTAT_MODEL_DIR";

/// The `models/` directory shipped alongside the package sources.
pub fn packaged_model_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("models")
}

#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    classifier: OnceLock<Arc<ClassifierArtifact>>,
    regressor: OnceLock<Arc<RegressorArtifact>>,
}

impl ArtifactStore {
    /// A store reading `<root>/<version>/`.
    pub fn new(root: impl AsRef<Path>, version: &str) -> Self {
        Self {
            dir: root.as_ref().join(version),
            classifier: OnceLock::new(),
            regressor: OnceLock::new(),
        }
    }

    /// Resolves the root from configuration, then `DIPSTAT_MODEL_DIR`, then the packaged models.
    pub fn from_config(config: &ArtifactConfig) -> Self {
        let root = config
            .root
            .clone()
            .or_else(|| env::var_os(MODEL_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(packaged_model_root);
        Self::new(root, &config.version)
    }

    /// Directory holding this version's artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.dir.join(CLASSIFIER_FILE)
    }

    pub fn regressor_path(&self) -> PathBuf {
        self.dir.join(REGRESSOR_FILE)
    }

    pub fn classifier(&self) -> Result<Arc<ClassifierArtifact>, ModelError> {
        load_once(&self.classifier, &self.classifier_path(), ClassifierArtifact::load)
    }

    pub fn regressor(&self) -> Result<Arc<RegressorArtifact>, ModelError> {
        load_once(&self.regressor, &self.regressor_path(), RegressorArtifact::load)
    }
}

fn load_once<T>(
    cell: &OnceLock<Arc<T>>,
    path: &Path,
    load: impl FnOnce(&Path) -> Result<T, ModelError>,
) -> Result<Arc<T>, ModelError> {
    if let Some(artifact) = cell.get() {
        return Ok(Arc::clone(artifact));
    }
    log::info!("Loading model artifact from '{}'", path.display());
    let loaded = Arc::new(load(path)?);
    // If another caller raced us, keep whichever landed first.
    Ok(Arc::clone(cell.get_or_init(|| loaded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Biomarker;
    use crate::model::{ArtifactMetadata, LinkFunction};
    use std::fs;
    use tempfile::tempdir;

    fn tiny_regressor() -> RegressorArtifact {
        RegressorArtifact {
            metadata: ArtifactMetadata {
                name: "cdip".to_string(),
                version: "v9".to_string(),
                features: Biomarker::CANONICAL
                    .iter()
                    .map(|m| m.column_name().to_string())
                    .collect(),
                description: String::new(),
            },
            link: LinkFunction::Identity,
            base_score: 0.5,
            learning_rate: 1.0,
            trees: Vec::new(),
        }
    }

    #[test]
    fn resolves_versioned_paths() {
        let store = ArtifactStore::new("/opt/dip", "v2");
        assert_eq!(store.classifier_path(), PathBuf::from("/opt/dip/v2/dip_classifier.toml"));
        assert_eq!(store.regressor_path(), PathBuf::from("/opt/dip/v2/cdip_regressor.toml"));
    }

    #[test]
    fn explicit_root_wins() {
        let config = ArtifactConfig {
            root: Some(PathBuf::from("/srv/models")),
            version: "v3".to_string(),
        };
        assert_eq!(ArtifactStore::from_config(&config).dir(), Path::new("/srv/models/v3"));
    }

    #[test]
    fn artifact_is_loaded_once_and_shared() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("v9")).unwrap();
        let store = ArtifactStore::new(dir.path(), "v9");
        tiny_regressor().save(&store.regressor_path()).unwrap();

        let first = store.regressor().unwrap();
        // Removing the file proves the second call is served from memory.
        fs::remove_file(store.regressor_path()).unwrap();
        let second = store.regressor().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_classifier_is_artifact_missing() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "v1");
        assert!(matches!(
            store.classifier(),
            Err(ModelError::ArtifactMissing { .. })
        ));
    }
}
