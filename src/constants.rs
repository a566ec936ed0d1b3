// Feature schema, in the order the model consumes it
pub const FEATURE_COLUMNS: [&str; 13] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "sma_20",
    "sma_50",
    "ema_12",
    "ema_26",
    "rsi",
    "macd",
    "macd_signal",
    "sentiment_score",
];

pub const NUM_FEATURES: usize = FEATURE_COLUMNS.len();

// Position of the close price inside a feature vector
pub const CLOSE_FEATURE_INDEX: usize = 3;

// Indicator windows
pub const SMA_SHORT_WINDOW: usize = 20;
pub const SMA_LONG_WINDOW: usize = 50;
pub const EMA_FAST_SPAN: usize = 12;
pub const EMA_SLOW_SPAN: usize = 26;
pub const MACD_SIGNAL_SPAN: usize = 9;
pub const RSI_WINDOW: usize = 14;
pub const BOLLINGER_WINDOW: usize = 20;
pub const BOLLINGER_NUM_STD: f64 = 2.0;

// Model parameters
pub const SEQUENCE_LENGTH: usize = 60; // Number of trading days to look back
pub const HIDDEN_SIZE: usize = 128;
pub const NUM_LAYERS: usize = 2;
pub const DENSE_SIZE: usize = 64;
pub const DROPOUT: f64 = 0.2;

// Training defaults
pub const EPOCHS: usize = 50;
pub const BATCH_SIZE: usize = 32;
pub const LEARNING_RATE: f64 = 1e-3;
pub const VALIDATION_SPLIT_RATIO: f64 = 0.2; // 20% of windows for validation
pub const LR_PATIENCE: usize = 5;
pub const LR_FACTOR: f64 = 0.5;
pub const GRAD_CLIP_NORM: f64 = 1.0;

// 95% two-sided normal quantile used for the confidence band
pub const CONFIDENCE_Z: f64 = 1.96;

// Model paths
pub const MODELS_DIR: &str = "models";
pub const DATA_DIR: &str = "data";
pub const RUNS_DIR: &str = "runs";
pub const MODEL_FILE_SUFFIX: &str = "_price_model.ckpt";

// Checkpoint file header
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"SSCK";
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
