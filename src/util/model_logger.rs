use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::build_info;
use crate::daily::lstm::step_4_train_model::{TrainingConfig, TrainingMetrics};
use crate::error::Result;

/// One training run, written as JSON next to the others
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub timestamp: String,
    pub symbol: String,
    pub model_type: String,
    pub config: TrainingConfig,
    pub metrics: Option<TrainingMetrics>,
    pub training_time_seconds: Option<f64>,
    pub crate_version: String,
    pub notes: String,
}

impl TrainingRun {
    pub fn new(symbol: &str, config: &TrainingConfig) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            symbol: symbol.to_string(),
            model_type: "attention_lstm".to_string(),
            config: config.clone(),
            metrics: None,
            training_time_seconds: None,
            crate_version: build_info::crate_version().to_string(),
            notes: String::new(),
        }
    }

    pub fn set_metrics(&mut self, metrics: &TrainingMetrics) {
        self.metrics = Some(metrics.clone());
    }

    pub fn set_training_time(&mut self, seconds: f64) {
        self.training_time_seconds = Some(seconds);
    }

    pub fn add_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }

    /// Writes `<SYMBOL>_h<hidden>_l<layers>_<stamp>_run.json` into `runs_dir`
    pub fn save(&self, runs_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(runs_dir)?;

        let filename = format!(
            "{}_h{}_l{}_{}_run.json",
            self.symbol,
            self.config.hidden_size,
            self.config.num_layers,
            Local::now().format("%Y%m%d_%H%M%S"),
        );
        let file_path = runs_dir.join(filename);

        let json = serde_json::to_string_pretty(&self).map_err(std::io::Error::other)?;
        let mut file = fs::File::create(&file_path)?;
        file.write_all(json.as_bytes())?;

        Ok(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_record_is_written() {
        let dir = tempdir().unwrap();
        let mut run = TrainingRun::new("AAPL", &TrainingConfig::default());
        run.set_training_time(12.5);
        run.add_note("first");
        run.add_note("second");

        let path = run.save(&dir.path().join("runs")).unwrap();
        let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(file_name.starts_with("AAPL_h128_l2_"));
        assert!(file_name.ends_with("_run.json"));

        let loaded: TrainingRun = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.symbol, "AAPL");
        assert_eq!(loaded.notes, "first\nsecond");
        assert_eq!(loaded.training_time_seconds, Some(12.5));
        assert!(loaded.metrics.is_none());
    }
}
