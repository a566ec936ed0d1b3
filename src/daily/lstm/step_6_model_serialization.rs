// External imports
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

// Internal imports
use super::step_1_tensor_preparation::ScalingTransform;
use super::step_3_lstm_model_arch::{AttentionLstmConfig, AttentionLstmModel};
use crate::build_info;
use crate::constants::{
    CHECKPOINT_FORMAT_VERSION, CHECKPOINT_MAGIC, FEATURE_COLUMNS, MODEL_FILE_SUFFIX, NUM_FEATURES,
};
use crate::error::{PredictorError, Result};
use crate::util::pre_processor::normalize_symbol;

const HEADER_LEN: usize = CHECKPOINT_MAGIC.len() + 4;

/// Everything needed to reproduce a symbol's predictions: architecture,
/// learned weights, window length and the fitted scaling transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub symbol: String,
    pub model: AttentionLstmConfig,
    pub sequence_length: usize,
    pub scaling: ScalingTransform,
    pub feature_columns: Vec<String>,
    /// Burn record bytes (`BinBytesRecorder`, full precision)
    pub weights: Vec<u8>,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub created_at: DateTime<Utc>,
    pub crate_version: String,
}

impl ModelCheckpoint {
    /// Snapshots a model's weights together with its training context
    pub fn capture<B: Backend>(
        symbol: &str,
        model: &AttentionLstmModel<B>,
        config: &AttentionLstmConfig,
        sequence_length: usize,
        scaling: &ScalingTransform,
        best_epoch: usize,
        best_val_loss: f64,
    ) -> Result<Self> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let weights = Recorder::<B>::record(&recorder, model.clone().into_record(), ())
            .map_err(|e| PredictorError::CorruptCheckpoint(format!("failed to record weights: {e:?}")))?;

        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            model: config.clone(),
            sequence_length,
            scaling: scaling.clone(),
            feature_columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            weights,
            best_epoch,
            best_val_loss,
            created_at: Utc::now(),
            crate_version: build_info::crate_version().to_string(),
        })
    }

    /// Rebuilds the model from the stored architecture and weights
    pub fn restore_model<B: Backend>(&self, device: &B::Device) -> Result<AttentionLstmModel<B>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, self.weights.clone(), device)
            .map_err(|e| PredictorError::CorruptCheckpoint(format!("failed to load weights: {e:?}")))?;

        Ok(self.model.init::<B>(device).load_record(record))
    }

    /// Rejects checkpoints whose schema differs from the compiled one
    pub fn validate(&self) -> Result<()> {
        if self.feature_columns.len() != FEATURE_COLUMNS.len()
            || self
                .feature_columns
                .iter()
                .zip(FEATURE_COLUMNS.iter())
                .any(|(stored, expected)| stored != expected)
        {
            return Err(PredictorError::IncompatibleCheckpoint(format!(
                "feature columns {:?} do not match {:?}",
                self.feature_columns, FEATURE_COLUMNS
            )));
        }
        if self.model.input_size != NUM_FEATURES
            || self.scaling.features.n_features() != NUM_FEATURES
        {
            return Err(PredictorError::IncompatibleCheckpoint(format!(
                "model expects {} features, schema has {}",
                self.model.input_size, NUM_FEATURES
            )));
        }
        if self.sequence_length == 0 {
            return Err(PredictorError::CorruptCheckpoint(
                "sequence length is zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Serializes as magic, little-endian format version, bincode payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PredictorError::CorruptCheckpoint(format!("failed to encode: {e}")))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&CHECKPOINT_MAGIC);
        bytes.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || bytes[..CHECKPOINT_MAGIC.len()] != CHECKPOINT_MAGIC {
            return Err(PredictorError::CorruptCheckpoint(
                "missing checkpoint header".to_string(),
            ));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[CHECKPOINT_MAGIC.len()..HEADER_LEN]);
        let version = u32::from_le_bytes(version);
        if version != CHECKPOINT_FORMAT_VERSION {
            return Err(PredictorError::IncompatibleCheckpoint(format!(
                "format version {version}, expected {CHECKPOINT_FORMAT_VERSION}"
            )));
        }

        let (checkpoint, _): (Self, usize) =
            bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], bincode::config::standard())
                .map_err(|e| PredictorError::CorruptCheckpoint(format!("failed to decode: {e}")))?;
        checkpoint.validate()?;

        Ok(checkpoint)
    }
}

/// Latest checkpoint per symbol. Saving overwrites the previous one.
pub trait CheckpointStore {
    fn save(&self, checkpoint: &ModelCheckpoint) -> Result<()>;

    /// `Ok(None)` when the symbol was never trained
    fn load(&self, symbol: &str) -> Result<Option<ModelCheckpoint>>;

    fn exists(&self, symbol: &str) -> Result<bool>;

    /// Symbols with a stored checkpoint, sorted
    fn symbols(&self) -> Result<Vec<String>>;
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for &T {
    fn save(&self, checkpoint: &ModelCheckpoint) -> Result<()> {
        (**self).save(checkpoint)
    }

    fn load(&self, symbol: &str) -> Result<Option<ModelCheckpoint>> {
        (**self).load(symbol)
    }

    fn exists(&self, symbol: &str) -> Result<bool> {
        (**self).exists(symbol)
    }

    fn symbols(&self) -> Result<Vec<String>> {
        (**self).symbols()
    }
}

/// Stores `<dir>/<SYMBOL>_price_model.ckpt` files
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, symbol: &str) -> Result<PathBuf> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self.dir.join(format!("{symbol}{MODEL_FILE_SUFFIX}")))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &ModelCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.symbol)?;
        fs::create_dir_all(&self.dir)?;

        // Readers never observe a half-written file
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(&checkpoint.to_bytes()?)?;
        file.flush()?;
        file.persist(&path).map_err(|e| PredictorError::Io(e.error))?;

        debug!(
            "Saved checkpoint for {} (epoch {}) to {}",
            checkpoint.symbol,
            checkpoint.best_epoch,
            path.display()
        );
        Ok(())
    }

    fn load(&self, symbol: &str) -> Result<Option<ModelCheckpoint>> {
        let path = self.path_for(symbol)?;
        if !path.exists() {
            return Ok(None);
        }

        let checkpoint = ModelCheckpoint::from_bytes(&fs::read(&path)?)?;
        if checkpoint.symbol != normalize_symbol(symbol)? {
            return Err(PredictorError::CorruptCheckpoint(format!(
                "{} holds a checkpoint for {}",
                path.display(),
                checkpoint.symbol
            )));
        }

        info!("Loaded checkpoint from {}", path.display());
        Ok(Some(checkpoint))
    }

    fn exists(&self, symbol: &str) -> Result<bool> {
        Ok(self.path_for(symbol)?.is_file())
    }

    fn symbols(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut symbols = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(symbol) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(MODEL_FILE_SUFFIX))
            {
                if normalize_symbol(symbol).is_ok_and(|normalized| normalized == symbol) {
                    symbols.push(symbol.to_string());
                }
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}

/// Keeps encoded checkpoints in memory; used when nothing should touch disk
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A poisoned map still holds complete entries
        self.checkpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &ModelCheckpoint) -> Result<()> {
        let bytes = checkpoint.to_bytes()?;
        self.entries().insert(normalize_symbol(&checkpoint.symbol)?, bytes);
        Ok(())
    }

    fn load(&self, symbol: &str) -> Result<Option<ModelCheckpoint>> {
        let symbol = normalize_symbol(symbol)?;
        self.entries()
            .get(&symbol)
            .map(|bytes| ModelCheckpoint::from_bytes(bytes))
            .transpose()
    }

    fn exists(&self, symbol: &str) -> Result<bool> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self.entries().contains_key(&symbol))
    }

    fn symbols(&self) -> Result<Vec<String>> {
        let mut symbols: Vec<String> = self.entries().keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }
}
