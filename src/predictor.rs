// External imports
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use log::info;

// Internal imports
use crate::daily::lstm::step_1_tensor_preparation::prepare_training_data;
use crate::daily::lstm::step_4_train_model::{train_model, TrainingConfig, TrainingMetrics};
use crate::daily::lstm::step_5_prediction::{forecast, PricePrediction};
use crate::daily::lstm::step_6_model_serialization::{CheckpointStore, ModelCheckpoint};
use crate::error::{PredictorError, Result};
use crate::util::feature_engineering::add_technical_indicators;
use crate::util::pre_processor::{normalize_symbol, RowSource};

/// Backend used to fit models
pub type TrainBackend = Autodiff<NdArray<f32>>;
/// Backend used for inference
pub type InferBackend = NdArray<f32>;

/// Trains and serves one model per symbol.
///
/// Rows come from a [`RowSource`] and checkpoints live in a
/// [`CheckpointStore`]. Every prediction loads the symbol's checkpoint, so the
/// weights and scaling transform of one symbol are never applied to another.
pub struct StockPricePredictor<S: RowSource, C: CheckpointStore> {
    source: S,
    store: C,
    device: NdArrayDevice,
}

impl<S: RowSource, C: CheckpointStore> StockPricePredictor<S, C> {
    pub fn new(source: S, store: C) -> Self {
        Self {
            source,
            store,
            device: NdArrayDevice::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    /// Fits a model for `symbol`, persisting every improving epoch
    ///
    /// # Returns
    ///
    /// Validation metrics of the best epoch, in price units
    pub fn train(&self, symbol: &str, config: &TrainingConfig) -> Result<TrainingMetrics> {
        let symbol = normalize_symbol(symbol)?;
        config.validate()?;

        let raw_rows = self.source.fetch(&symbol)?;
        info!("Training model for {} on {} rows", symbol, raw_rows.len());

        let rows = add_technical_indicators(raw_rows)?;
        let (scaling, dataset) = prepare_training_data(&rows, config.sequence_length)?;
        let model_config = config.model_config(dataset.num_features());

        let outcome = train_model::<TrainBackend, _>(
            &dataset,
            &scaling,
            config,
            &self.device,
            |model, summary| {
                let checkpoint = ModelCheckpoint::capture(
                    &symbol,
                    model,
                    &model_config,
                    config.sequence_length,
                    &scaling,
                    summary.epoch,
                    summary.val_loss,
                )?;
                self.store.save(&checkpoint)
            },
        )?;

        info!(
            "Model for {} trained: RMSE {:.4}, directional accuracy {:.2}%",
            symbol,
            outcome.metrics.rmse,
            outcome.metrics.directional_accuracy * 100.0
        );
        Ok(outcome.metrics)
    }

    /// Forecasts the next close of `symbol` from its latest rows
    pub fn predict(&self, symbol: &str) -> Result<PricePrediction> {
        let symbol = normalize_symbol(symbol)?;
        let checkpoint = self
            .store
            .load(&symbol)?
            .ok_or_else(|| PredictorError::ModelNotTrained {
                symbol: symbol.clone(),
            })?;

        let raw_rows = self.source.fetch(&symbol)?;
        if raw_rows.len() < checkpoint.sequence_length {
            return Err(PredictorError::insufficient(
                "prediction window (rows)",
                checkpoint.sequence_length,
                raw_rows.len(),
            ));
        }

        let model = checkpoint.restore_model::<InferBackend>(&self.device)?;
        let rows = add_technical_indicators(raw_rows)?;

        forecast(
            &symbol,
            &model,
            &rows,
            &checkpoint.scaling,
            checkpoint.sequence_length,
            &self.device,
        )
    }

    pub fn has_checkpoint(&self, symbol: &str) -> Result<bool> {
        self.store.exists(&normalize_symbol(symbol)?)
    }

    /// Symbols with a stored checkpoint, sorted
    pub fn trained_symbols(&self) -> Result<Vec<String>> {
        self.store.symbols()
    }
}
