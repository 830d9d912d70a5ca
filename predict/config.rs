//! Pipeline configuration.
//!
//! Every knob has a default that reproduces the behaviour of the published DIP
//! tooling, so an empty (or absent) configuration file is always valid. The
//! file format is TOML, matching the on-disk format of the model artifacts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level configuration shared by both prediction paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub validation: ValidationConfig,
    pub guard: GuardConfig,
    pub artifacts: ArtifactConfig,
    pub regressor: RegressorBackendConfig,
}

/// Thresholds for the non-fatal input diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// The repeated-value diagnostic only runs on batches larger than this.
    pub consistency_min_records: usize,
    /// A single value occupying more than this fraction of a column triggers a warning.
    pub consistency_max_fraction: f64,
    /// Concentrations are physical quantities; negative values are rejected unless disabled.
    pub reject_negative: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            consistency_min_records: 10,
            consistency_max_fraction: 0.10,
            reject_negative: true,
        }
    }
}

/// Band and gating for the batch-level plausibility guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub lower: f64,
    pub upper: f64,
    /// Batches with fewer predictions than this skip the guard entirely.
    /// The default of 1 means the guard always runs.
    pub min_batch_size: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            lower: 0.30,
            upper: 0.36,
            min_batch_size: 1,
        }
    }
}

/// Location of the frozen model artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Overrides the artifact root. When unset, `DIPSTAT_MODEL_DIR` is consulted,
    /// then the `models/` directory shipped with the package.
    pub root: Option<PathBuf>,
    pub version: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: None,
            version: crate::store::DEFAULT_MODEL_VERSION.to_string(),
        }
    }
}

/// Where the cDIP regressor executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegressorBackendConfig {
    /// Evaluate the frozen regression ensemble in-process.
    #[default]
    Builtin,
    /// Delegate to another runtime through a child process.
    External {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.check()?;
        Ok(config)
    }

    /// Rejects settings that would make a check meaningless.
    pub fn check(&self) -> Result<(), ConfigError> {
        let guard = &self.guard;
        if !(0.0..=1.0).contains(&guard.lower)
            || !(0.0..=1.0).contains(&guard.upper)
            || guard.lower > guard.upper
        {
            return Err(ConfigError::Invalid(format!(
                "guard band [{}, {}] must be an ordered interval inside [0, 1]",
                guard.lower, guard.upper
            )));
        }
        let fraction = self.validation.consistency_max_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "validation.consistency_max_fraction must be in (0, 1], got {fraction}"
            )));
        }
        if self.artifacts.version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "artifacts.version must not be empty".to_string(),
            ));
        }
        if let RegressorBackendConfig::External { timeout_secs, .. } = &self.regressor {
            if *timeout_secs == 0 {
                return Err(ConfigError::Invalid(
                    "regressor.timeout_secs must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}
