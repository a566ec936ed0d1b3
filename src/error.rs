use polars::error::PolarsError;
use thiserror::Error;

/// Errors surfaced by the prediction pipeline
#[derive(Debug, Error)]
pub enum PredictorError {
    /// Not enough history to build a window or a train/validation split
    #[error("insufficient data for {context}: need at least {required}, got {available}")]
    DataInsufficient {
        context: String,
        required: usize,
        available: usize,
    },

    /// Prediction was requested for a symbol without a checkpoint
    #[error("no trained model for {symbol}; train it first")]
    ModelNotTrained { symbol: String },

    /// Every feature value of the table is missing
    #[error("degenerate indicators: {0}")]
    DegenerateIndicator(String),

    /// Input rows are not strictly increasing by date
    #[error("rows must be strictly increasing by date (violation at row {index})")]
    UnorderedRows { index: usize },

    /// Validation loss never became finite, so no checkpoint was produced
    #[error("training diverged: {0}")]
    TrainingDiverged(String),

    #[error("invalid symbol {0:?}")]
    InvalidSymbol(String),

    /// Checkpoint was written by a different format or feature schema
    #[error("incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

impl PredictorError {
    pub fn insufficient(context: impl Into<String>, required: usize, available: usize) -> Self {
        Self::DataInsufficient {
            context: context.into(),
            required,
            available,
        }
    }
}

pub type Result<T> = std::result::Result<T, PredictorError>;
