// External imports
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use burn::tensor::{backend::Backend, Tensor};
use log::{debug, info};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Range;

// Internal imports
use super::step_1_tensor_preparation::{ScalingTransform, SequenceDataset};
use super::step_3_lstm_model_arch::{AttentionLstmConfig, AttentionLstmModel};
use crate::constants;
use crate::error::{PredictorError, Result};

/// Hyperparameters of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub sequence_length: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub validation_split: f64,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dense_size: usize,
    pub dropout: f64,
    pub lr_patience: usize,
    pub lr_factor: f64,
    pub grad_clip_norm: f64,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            sequence_length: constants::SEQUENCE_LENGTH,
            epochs: constants::EPOCHS,
            batch_size: constants::BATCH_SIZE,
            learning_rate: constants::LEARNING_RATE,
            validation_split: constants::VALIDATION_SPLIT_RATIO,
            hidden_size: constants::HIDDEN_SIZE,
            num_layers: constants::NUM_LAYERS,
            dense_size: constants::DENSE_SIZE,
            dropout: constants::DROPOUT,
            lr_patience: constants::LR_PATIENCE,
            lr_factor: constants::LR_FACTOR,
            grad_clip_norm: constants::GRAD_CLIP_NORM,
            seed: None,
        }
    }
}

impl TrainingConfig {
    pub fn model_config(&self, input_size: usize) -> AttentionLstmConfig {
        AttentionLstmConfig {
            input_size,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            dense_size: self.dense_size,
            dropout: self.dropout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let problem = if self.sequence_length == 0 {
            Some("sequence_length must be positive")
        } else if self.epochs == 0 {
            Some("epochs must be positive")
        } else if self.batch_size == 0 {
            Some("batch_size must be positive")
        } else if !(self.learning_rate > 0.0) {
            Some("learning_rate must be positive")
        } else if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            Some("validation_split must be in (0, 1)")
        } else if self.hidden_size == 0 || self.num_layers == 0 || self.dense_size == 0 {
            Some("layer sizes must be positive")
        } else if !(0.0..1.0).contains(&self.dropout) {
            Some("dropout must be in [0, 1)")
        } else if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            Some("lr_factor must be in (0, 1)")
        } else if !(self.grad_clip_norm > 0.0) {
            Some("grad_clip_norm must be positive")
        } else {
            None
        };

        match problem {
            Some(message) => Err(PredictorError::Config(message.to_string())),
            None => Ok(()),
        }
    }
}

/// Halves (by `factor`) the learning rate when validation loss plateaus.
///
/// An epoch improves when its loss is below `best * (1 - 1e-4)`. The rate is
/// reduced once more than `patience` consecutive epochs failed to improve.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    learning_rate: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(learning_rate: f64, factor: f64, patience: usize) -> Self {
        Self {
            learning_rate,
            factor,
            patience,
            threshold: 1e-4,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Records an epoch's validation loss and returns the rate for the next epoch
    pub fn step(&mut self, val_loss: f64) -> f64 {
        if val_loss < self.best * (1.0 - self.threshold) {
            self.best = val_loss;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs > self.patience {
            self.learning_rate *= self.factor;
            self.bad_epochs = 0;
            info!("Reducing learning rate to {:.3e}", self.learning_rate);
        }

        self.learning_rate
    }
}

/// Loss summary of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
}

/// Validation metrics of the best checkpoint, in price units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    pub directional_accuracy: f64,
    pub final_train_loss: f64,
    pub best_val_loss: f64,
    pub best_epoch: usize,
    pub epochs: usize,
    pub train_windows: usize,
    pub validation_windows: usize,
}

/// Result of [`train_model`]
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    /// Weights of the epoch with the lowest validation loss
    pub best_model: AttentionLstmModel<B>,
    /// Weights after the last epoch
    pub final_model: AttentionLstmModel<B>,
    pub metrics: TrainingMetrics,
    pub history: Vec<EpochSummary>,
}

/// Contiguous full batches over `range`; the trailing partial batch is dropped.
/// A range shorter than one batch forms a single batch.
pub fn batch_ranges(range: Range<usize>, batch_size: usize) -> Vec<Range<usize>> {
    let n = range.len();
    if n < batch_size {
        return vec![range];
    }
    (0..n / batch_size)
        .map(|b| range.start + b * batch_size..range.start + (b + 1) * batch_size)
        .collect()
}

/// RMSE, MAE, R² and directional accuracy of `predicted` against `actual`
pub fn regression_metrics(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> (f64, f64, f64, f64) {
    let n = actual.len() as f64;
    let errors = &predicted - &actual;

    let rmse = (errors.mapv(|e| e * e).sum() / n).sqrt();
    let mae = errors.mapv(f64::abs).sum() / n;

    let mean = actual.sum() / n;
    let ss_res = errors.mapv(|e| e * e).sum();
    let ss_tot = actual.mapv(|y| (y - mean).powi(2)).sum();
    let r2 = if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    };

    let directional_accuracy = if actual.len() < 2 {
        0.0
    } else {
        let rising = |values: ArrayView1<f64>| -> Vec<bool> {
            values.windows(2).into_iter().map(|w| w[1] - w[0] > 0.0).collect()
        };
        let hits = rising(actual)
            .iter()
            .zip(rising(predicted).iter())
            .filter(|(a, p)| a == p)
            .count();
        hits as f64 / (actual.len() - 1) as f64
    };

    (rmse, mae, r2, directional_accuracy)
}

/// Runs the model over a range of windows and returns scaled predictions
pub fn predict_range<B: Backend>(
    model: &AttentionLstmModel<B>,
    dataset: &SequenceDataset,
    range: Range<usize>,
    device: &B::Device,
) -> Vec<f64> {
    let (features, _) = dataset.to_tensors::<B>(range, device);
    model
        .forward(features)
        .into_data()
        .iter::<f32>()
        .map(f64::from)
        .collect()
}

/// Evaluates a model on a range of windows in price units
pub fn evaluate_model<B: Backend>(
    model: &AttentionLstmModel<B>,
    dataset: &SequenceDataset,
    range: Range<usize>,
    scaling: &ScalingTransform,
    device: &B::Device,
) -> (f64, f64, f64, f64) {
    let predicted: Array1<f64> = predict_range(model, dataset, range.clone(), device)
        .into_iter()
        .map(|v| scaling.unscale_target(v))
        .collect();
    let actual: Array1<f64> = dataset
        .targets(range)
        .iter()
        .map(|&v| scaling.unscale_target(f64::from(v)))
        .collect();

    regression_metrics(actual.view(), predicted.view())
}

struct SquaredNormVisitor<'a> {
    grads: &'a GradientsParams,
    sum_squares: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNormVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum_squares += (grad.clone() * grad).sum().into_scalar().to_f64();
        }
    }
}

struct ScaleVisitor<'a> {
    grads: &'a mut GradientsParams,
    scale: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// L2 norm of all gradients of `model` taken together
pub fn global_grad_norm<B, M>(model: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNormVisitor {
        grads,
        sum_squares: 0.0,
    };
    model.visit(&mut visitor);
    visitor.sum_squares.sqrt()
}

/// Rescales every gradient so the global norm is at most `max_norm`.
///
/// Returns the clipped gradients and the norm measured before clipping.
pub fn clip_grad_norm<B, M>(model: &M, mut grads: GradientsParams, max_norm: f64) -> (GradientsParams, f64)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let total_norm = global_grad_norm::<B, M>(model, &grads);
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        let mut visitor = ScaleVisitor {
            grads: &mut grads,
            scale: clip_coef,
        };
        model.visit(&mut visitor);
    }
    (grads, total_norm)
}

fn mse<B: Backend>(predictions: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    MseLoss::new().forward(predictions, targets, Reduction::Mean)
}

/// Trains an attention LSTM on a windowed dataset.
///
/// Batches are visited in table order every epoch. After each epoch the
/// validation loss drives the plateau scheduler; every strict improvement
/// is handed to `on_improvement` (which persists the checkpoint) and kept
/// as the best model. Final metrics are computed with the best weights.
pub fn train_model<B, F>(
    dataset: &SequenceDataset,
    scaling: &ScalingTransform,
    config: &TrainingConfig,
    device: &B::Device,
    mut on_improvement: F,
) -> Result<TrainingOutcome<B::InnerBackend>>
where
    B: AutodiffBackend,
    F: FnMut(&AttentionLstmModel<B::InnerBackend>, &EpochSummary) -> Result<()>,
{
    config.validate()?;
    if let Some(seed) = config.seed {
        B::seed(seed);
    }

    let (train_range, val_range) = dataset.split(config.validation_split)?;
    info!(
        "Data split: train windows: {}, validation windows: {}",
        train_range.len(),
        val_range.len()
    );

    // Batches never change order, so build their tensors once
    let train_batches: Vec<(Tensor<B, 3>, Tensor<B, 2>)> =
        batch_ranges(train_range.clone(), config.batch_size)
            .into_iter()
            .map(|range| dataset.to_tensors::<B>(range, device))
            .collect();
    let (val_features, val_targets) =
        dataset.to_tensors::<B::InnerBackend>(val_range.clone(), device);

    let mut model: AttentionLstmModel<B> =
        config.model_config(dataset.num_features()).init(device);
    let mut optimizer = AdamConfig::new().with_epsilon(1e-8).init();
    let mut scheduler = PlateauScheduler::new(config.learning_rate, config.lr_factor, config.lr_patience);

    let mut best_model: Option<AttentionLstmModel<B::InnerBackend>> = None;
    let mut best_val_loss = f64::INFINITY;
    let mut best_epoch = 0;
    let mut history = Vec::with_capacity(config.epochs);

    for epoch in 1..=config.epochs {
        let learning_rate = scheduler.learning_rate();

        let mut epoch_loss = 0.0;
        for (features, targets) in &train_batches {
            let predictions = model.forward(features.clone());
            let loss = mse(predictions, targets.clone());
            epoch_loss += loss.clone().into_scalar().to_f64();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let (grads, _) = clip_grad_norm::<B, _>(&model, grads, config.grad_clip_norm);
            model = optimizer.step(learning_rate, model, grads);
        }
        let train_loss = epoch_loss / train_batches.len() as f64;

        // Validation runs on the inner backend: no graph, no dropout
        let valid_model = model.valid();
        let val_loss = mse(valid_model.forward(val_features.clone()), val_targets.clone())
            .into_scalar()
            .to_f64();
        scheduler.step(val_loss);

        let summary = EpochSummary {
            epoch,
            train_loss,
            val_loss,
            learning_rate,
        };
        history.push(summary);

        debug!(
            "Epoch {}/{} - Train Loss: {:.6}, Val Loss: {:.6}, LR: {:.2e}",
            epoch, config.epochs, train_loss, val_loss, learning_rate
        );
        if epoch % 10 == 0 {
            info!(
                "Epoch {}/{} - Train Loss: {:.6}, Val Loss: {:.6}",
                epoch, config.epochs, train_loss, val_loss
            );
        }

        if val_loss < best_val_loss {
            best_val_loss = val_loss;
            best_epoch = epoch;
            on_improvement(&valid_model, &summary)?;
            best_model = Some(valid_model);
        }
    }

    let best_model = best_model.ok_or_else(|| {
        PredictorError::TrainingDiverged(format!(
            "validation loss was never finite over {} epochs",
            config.epochs
        ))
    })?;

    let (rmse, mae, r2, directional_accuracy) =
        evaluate_model(&best_model, dataset, val_range.clone(), scaling, device);
    let final_train_loss = history.last().map(|s| s.train_loss).unwrap_or(f64::NAN);

    let metrics = TrainingMetrics {
        rmse,
        mae,
        r2,
        directional_accuracy,
        final_train_loss,
        best_val_loss,
        best_epoch,
        epochs: config.epochs,
        train_windows: train_range.len(),
        validation_windows: val_range.len(),
    };
    info!(
        "Training finished: best epoch {} (val loss {:.6}), RMSE {:.4}, MAE {:.4}, R2 {:.4}",
        best_epoch, best_val_loss, rmse, mae, r2
    );

    Ok(TrainingOutcome {
        best_model,
        final_model: model.valid(),
        metrics,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daily::lstm::step_1_tensor_preparation::prepare_training_data;
    use crate::util::feature_engineering::add_technical_indicators;
    use crate::util::test_utils::synthetic_price_rows;
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use ndarray::array;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_scheduler_halves_after_patience_exceeded() {
        let mut scheduler = PlateauScheduler::new(1e-3, 0.5, 5);
        assert_eq!(scheduler.step(1.0), 1e-3);
        for _ in 0..5 {
            assert_eq!(scheduler.step(1.0), 1e-3);
        }
        // Sixth consecutive epoch without improvement
        assert_eq!(scheduler.step(1.0), 5e-4);
        // Counter restarts after a reduction
        for _ in 0..5 {
            assert_eq!(scheduler.step(1.0), 5e-4);
        }
        assert_eq!(scheduler.step(0.5), 5e-4);
    }

    #[test]
    fn test_scheduler_ignores_negligible_improvement() {
        let mut scheduler = PlateauScheduler::new(1.0, 0.5, 0);
        scheduler.step(1.0);
        // Below the relative threshold, counts as a bad epoch
        assert_eq!(scheduler.step(0.99999), 0.5);
    }

    #[test]
    fn test_batch_ranges_drop_partial_batch() {
        assert_eq!(batch_ranges(0..70, 32), vec![0..32, 32..64]);
        assert_eq!(batch_ranges(10..20, 32), vec![10..20]);
        assert_eq!(batch_ranges(0..32, 32), vec![0..32]);
    }

    #[test]
    fn test_regression_metrics() {
        let actual = array![1.0, 2.0, 3.0, 2.0];
        let predicted = array![1.0, 3.0, 2.0, 1.0];
        let (rmse, mae, r2, da) = regression_metrics(actual.view(), predicted.view());

        assert!((rmse - (3.0f64 / 4.0).sqrt()).abs() < 1e-12);
        assert!((mae - 0.75).abs() < 1e-12);
        // ss_tot = 2.0, ss_res = 3.0
        assert!((r2 - (1.0 - 3.0 / 2.0)).abs() < 1e-12);
        // Directions: actual up, up, down; predicted up, down, down
        assert!((da - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_regression_metrics_constant_target() {
        let actual = array![5.0, 5.0];
        let (_, _, r2, _) = regression_metrics(actual.view(), actual.view());
        assert_eq!(r2, 1.0);
        let (_, _, r2, _) = regression_metrics(actual.view(), array![5.0, 6.0].view());
        assert_eq!(r2, 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrainingConfig::default().validate().is_ok());
        let bad = TrainingConfig {
            validation_split: 1.0,
            ..TrainingConfig::default()
        };
        assert!(matches!(bad.validate(), Err(PredictorError::Config(_))));
    }

    #[test]
    fn test_training_keeps_best_epoch() {
        let rows = add_technical_indicators(synthetic_price_rows(90, 21)).unwrap();
        let (scaling, dataset) = prepare_training_data(&rows, 10).unwrap();
        let config = TrainingConfig {
            sequence_length: 10,
            epochs: 4,
            batch_size: 16,
            hidden_size: 8,
            dense_size: 4,
            seed: Some(42),
            ..TrainingConfig::default()
        };
        let device = NdArrayDevice::default();

        let mut improvements = Vec::new();
        let outcome = train_model::<TestBackend, _>(&dataset, &scaling, &config, &device, |_, summary| {
            improvements.push(summary.epoch);
            Ok(())
        })
        .unwrap();

        assert_eq!(outcome.history.len(), 4);
        assert_eq!(improvements.first(), Some(&1));
        assert_eq!(improvements.last(), Some(&outcome.metrics.best_epoch));

        let min_val = outcome
            .history
            .iter()
            .map(|s| s.val_loss)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(outcome.metrics.best_val_loss, min_val);
        assert_eq!(outcome.metrics.train_windows + outcome.metrics.validation_windows, 80);
        assert!(outcome.metrics.rmse.is_finite());
        assert!((0.0..=1.0).contains(&outcome.metrics.directional_accuracy));
    }

    #[test]
    fn test_clip_grad_norm_bounds_global_norm() {
        let device = NdArrayDevice::default();
        let model: AttentionLstmModel<TestBackend> = AttentionLstmConfig {
            hidden_size: 8,
            dense_size: 4,
            ..AttentionLstmConfig::new(5)
        }
        .init(&device);

        // Far-off targets produce gradients well above the limit
        let features = Tensor::<TestBackend, 3>::ones([4, 6, 5], &device);
        let targets = Tensor::<TestBackend, 2>::ones([4, 1], &device) * 1000.0;
        let loss = mse(model.forward(features), targets);
        let grads = GradientsParams::from_grads(loss.backward(), &model);

        let before = global_grad_norm::<TestBackend, _>(&model, &grads);
        assert!(before > 1.0, "gradient norm {before} too small for the test");

        let (clipped, reported) = clip_grad_norm::<TestBackend, _>(&model, grads, 1.0);
        assert!((reported - before).abs() < 1e-6 * before);
        let after = global_grad_norm::<TestBackend, _>(&model, &clipped);
        assert!(after <= 1.0 + 1e-4, "global norm after clipping is {after}");
        assert!(after > 0.99);

        // A generous limit leaves gradients untouched
        let (unclipped, _) = clip_grad_norm::<TestBackend, _>(&model, clipped, 1e9);
        let unchanged = global_grad_norm::<TestBackend, _>(&model, &unclipped);
        assert!((unchanged - after).abs() < 1e-6);
    }

    #[test]
    fn test_metrics_use_best_not_final_weights() {
        let rows = add_technical_indicators(synthetic_price_rows(120, 23)).unwrap();
        let (scaling, dataset) = prepare_training_data(&rows, 10).unwrap();
        let config = TrainingConfig {
            sequence_length: 10,
            epochs: 8,
            batch_size: 16,
            learning_rate: 0.05,
            hidden_size: 8,
            dense_size: 4,
            seed: Some(3),
            ..TrainingConfig::default()
        };
        let device = NdArrayDevice::default();

        let outcome =
            train_model::<TestBackend, _>(&dataset, &scaling, &config, &device, |_, _| Ok(())).unwrap();
        let (_, val_range) = dataset.split(config.validation_split).unwrap();

        let (best_rmse, best_mae, _, _) =
            evaluate_model(&outcome.best_model, &dataset, val_range.clone(), &scaling, &device);
        assert_eq!(best_rmse, outcome.metrics.rmse);
        assert_eq!(best_mae, outcome.metrics.mae);

        // The final model is the one scored in the last history entry
        let (val_features, val_targets) = dataset.to_tensors::<NdArray<f32>>(val_range.clone(), &device);
        let final_val_loss = mse(outcome.final_model.forward(val_features), val_targets)
            .into_scalar()
            .to_f64();
        let last = outcome.history.last().unwrap();
        assert!((final_val_loss - last.val_loss).abs() < 1e-9);

        if outcome.metrics.best_epoch < config.epochs && last.val_loss > outcome.metrics.best_val_loss {
            let (final_rmse, _, _, _) =
                evaluate_model(&outcome.final_model, &dataset, val_range, &scaling, &device);
            assert_ne!(final_rmse, outcome.metrics.rmse);
        }
    }

    #[test]
    fn test_training_requires_validation_window() {
        let rows = add_technical_indicators(synthetic_price_rows(31, 22)).unwrap();
        let (scaling, dataset) = prepare_training_data(&rows, 30).unwrap();
        let config = TrainingConfig {
            sequence_length: 30,
            epochs: 1,
            ..TrainingConfig::default()
        };
        let device = NdArrayDevice::default();

        let result = train_model::<TestBackend, _>(&dataset, &scaling, &config, &device, |_, _| Ok(()));
        assert!(matches!(result, Err(PredictorError::DataInsufficient { .. })));
    }
}
