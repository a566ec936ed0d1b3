// External imports
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// Internal imports
use crate::constants::{DATA_DIR, MODELS_DIR, RUNS_DIR};
use crate::daily::lstm::step_4_train_model::TrainingConfig;
use crate::error::{PredictorError, Result};

pub const DATA_DIR_ENV: &str = "STOCK_SENTINEL_DATA_DIR";
pub const MODELS_DIR_ENV: &str = "STOCK_SENTINEL_MODELS_DIR";
pub const RUNS_DIR_ENV: &str = "STOCK_SENTINEL_RUNS_DIR";

/// Directories and training defaults of the command line tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Holds `<SYMBOL>.csv` price histories
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    /// Training run records
    pub runs_dir: PathBuf,
    pub training: TrainingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DATA_DIR),
            models_dir: PathBuf::from(MODELS_DIR),
            runs_dir: PathBuf::from(RUNS_DIR),
            training: TrainingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON config; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| PredictorError::Config(format!("{}: {e}", path.display())))?;
        config.training.validate()?;
        Ok(config)
    }

    /// Optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(config.with_overrides(|key| env::var(key).ok()))
    }

    /// Replaces directories with non-empty values returned by `lookup`
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = lookup(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(MODELS_DIR_ENV) {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(RUNS_DIR_ENV) {
            self.runs_dir = PathBuf::from(dir);
        }
        self
    }
}
