// External imports
use burn::tensor::backend::Backend;
use burn::tensor::cast::ToElement;
use chrono::NaiveDate;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

// Internal imports
use super::step_1_tensor_preparation::{fill_missing_features, latest_window, ScalingTransform};
use super::step_3_lstm_model_arch::AttentionLstmModel;
use crate::constants::CONFIDENCE_Z;
use crate::error::{PredictorError, Result};
use crate::util::feature_engineering::PriceRow;

/// One-step-ahead close forecast with a symmetric band.
///
/// The band is `CONFIDENCE_Z` standard deviations of the fetched close
/// history around the point estimate. It describes how volatile the price
/// has been, not how uncertain the model is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePrediction {
    pub symbol: String,
    /// Date of the most recent row the forecast builds on
    pub as_of: NaiveDate,
    pub predicted_price: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub current_price: f64,
}

/// Sample standard deviation, 0 for fewer than two values
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    Array1::from(values.to_vec()).std(1.0)
}

/// Symmetric interval of `CONFIDENCE_Z` sample standard deviations of `closes`
pub fn confidence_interval(closes: &[f64], point: f64) -> (f64, f64) {
    let half_width = CONFIDENCE_Z * sample_std(closes);
    (point - half_width, point + half_width)
}

/// Predicts the next close from enriched rows with a stored scaling transform
///
/// # Arguments
///
/// * `model` - Trained model
/// * `rows` - Enriched rows ascending by date, at least `sequence_length` of them
/// * `scaling` - Transform fitted when the model was trained
/// * `sequence_length` - Window length the model was trained with
/// * `device` - Device to place tensors on
///
/// # Returns
///
/// The forecast in price units
pub fn predict_next_close<B: Backend>(
    model: &AttentionLstmModel<B>,
    rows: &[PriceRow],
    scaling: &ScalingTransform,
    sequence_length: usize,
    device: &B::Device,
) -> Result<f64> {
    if rows.len() < sequence_length {
        return Err(PredictorError::insufficient(
            "prediction window (rows)",
            sequence_length,
            rows.len(),
        ));
    }

    let features = fill_missing_features(rows)?;
    let window = latest_window::<B>(&features, scaling, sequence_length, device)?;
    let scaled = model.forward(window).into_scalar().to_f64();

    Ok(scaling.unscale_target(scaled))
}

/// Builds the full [`PricePrediction`] for a symbol
pub fn forecast<B: Backend>(
    symbol: &str,
    model: &AttentionLstmModel<B>,
    rows: &[PriceRow],
    scaling: &ScalingTransform,
    sequence_length: usize,
    device: &B::Device,
) -> Result<PricePrediction> {
    let predicted_price = predict_next_close(model, rows, scaling, sequence_length, device)?;

    let last = rows
        .last()
        .ok_or_else(|| PredictorError::insufficient("prediction window (rows)", sequence_length, 0))?;
    let closes: Vec<f64> = rows.iter().map(|r| r.close).filter(|c| c.is_finite()).collect();
    let (confidence_lower, confidence_upper) = confidence_interval(&closes, predicted_price);

    Ok(PricePrediction {
        symbol: symbol.to_string(),
        as_of: last.date,
        predicted_price,
        confidence_lower,
        confidence_upper,
        current_price: last.close,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daily::lstm::step_1_tensor_preparation::prepare_training_data;
    use crate::daily::lstm::step_3_lstm_model_arch::AttentionLstmConfig;
    use crate::util::feature_engineering::add_technical_indicators;
    use crate::util::test_utils::synthetic_price_rows;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn test_sample_std() {
        assert_eq!(sample_std(&[]), 0.0);
        assert_eq!(sample_std(&[3.0]), 0.0);
        // Mean 5, squared deviations sum to 32 over 7 degrees of freedom
        let std = sample_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((std - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_interval_is_symmetric() {
        let (lower, upper) = confidence_interval(&[1.0, 3.0], 10.0);
        let half = 1.96 * 2.0f64.sqrt();
        assert!((lower - (10.0 - half)).abs() < 1e-12);
        assert!((upper - (10.0 + half)).abs() < 1e-12);
    }

    #[test]
    fn test_forecast_uses_latest_row() {
        let rows = add_technical_indicators(synthetic_price_rows(40, 9)).unwrap();
        let (scaling, _) = prepare_training_data(&rows, 20).unwrap();
        let device = NdArrayDevice::default();
        let config = AttentionLstmConfig {
            hidden_size: 8,
            dense_size: 4,
            ..AttentionLstmConfig::new(13)
        };
        let model = config.init::<NdArray>(&device);

        let prediction = forecast("TEST", &model, &rows, &scaling, 20, &device).unwrap();

        assert_eq!(prediction.as_of, rows[39].date);
        assert_eq!(prediction.current_price, rows[39].close);
        assert!(prediction.confidence_lower <= prediction.predicted_price);
        assert!(prediction.predicted_price <= prediction.confidence_upper);
    }

    #[test]
    fn test_too_few_rows() {
        let rows = add_technical_indicators(synthetic_price_rows(40, 9)).unwrap();
        let (scaling, _) = prepare_training_data(&rows, 20).unwrap();
        let device = NdArrayDevice::default();
        let model = AttentionLstmConfig::new(13).init::<NdArray>(&device);

        let result = predict_next_close(&model, &rows[..19], &scaling, 20, &device);
        assert!(matches!(
            result,
            Err(PredictorError::DataInsufficient { required: 20, available: 19, .. })
        ));
    }
}
