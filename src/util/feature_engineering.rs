// External crates
use chrono::NaiveDate;
use log::debug;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

// Local modules
use crate::constants::{
    BOLLINGER_NUM_STD, BOLLINGER_WINDOW, EMA_FAST_SPAN, EMA_SLOW_SPAN, MACD_SIGNAL_SPAN,
    NUM_FEATURES, RSI_WINDOW, SMA_LONG_WINDOW, SMA_SHORT_WINDOW,
};
use crate::error::{PredictorError, Result};

/// Derived indicator columns of a [`PriceRow`].
///
/// Every field is `None` until enough history exists for its trailing window,
/// or when the value is degenerate (e.g. RSI with zero average loss).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub ema_12: Option<f64>,
    pub ema_26: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub rsi_14: Option<f64>,
    pub bollinger_middle: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_lower: Option<f64>,
}

/// One trading day of one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Daily aggregate sentiment, 0 when no articles were scored
    pub sentiment_score: f64,
    pub indicators: Indicators,
}

impl PriceRow {
    pub fn new(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
            sentiment_score: 0.0,
            indicators: Indicators::default(),
        }
    }

    pub fn with_sentiment(mut self, sentiment_score: f64) -> Self {
        self.sentiment_score = sentiment_score;
        self
    }

    /// Feature vector in `FEATURE_COLUMNS` order. Missing and non-finite values are `None`.
    pub fn features(&self) -> [Option<f64>; NUM_FEATURES] {
        let ind = &self.indicators;
        [
            finite(self.open),
            finite(self.high),
            finite(self.low),
            finite(self.close),
            finite(self.volume),
            ind.sma_20,
            ind.sma_50,
            ind.ema_12,
            ind.ema_26,
            ind.rsi_14,
            ind.macd,
            ind.macd_signal,
            finite(self.sentiment_score),
        ]
    }
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn rolling_options(window: usize) -> RollingOptionsFixedWindow {
    RollingOptionsFixedWindow {
        window_size: window,
        min_periods: window,
        center: false,
        weights: None,
        fn_params: None,
    }
}

fn finite_values(series: &Series) -> PolarsResult<Vec<Option<f64>>> {
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

/// Calculates Simple Moving Average (SMA) over the trailing `window` values
pub fn calculate_sma(values: &[Option<f64>], window: usize) -> PolarsResult<Vec<Option<f64>>> {
    if values.len() < window {
        return Ok(vec![None; values.len()]);
    }

    let series = Series::new("values".into(), values.to_vec());
    let sma = series.rolling_mean(rolling_options(window))?;
    finite_values(&sma)
}

/// Calculates the trailing sample standard deviation over `window` values
pub fn calculate_rolling_std(
    values: &[Option<f64>],
    window: usize,
) -> PolarsResult<Vec<Option<f64>>> {
    if values.len() < window {
        return Ok(vec![None; values.len()]);
    }

    let series = Series::new("values".into(), values.to_vec());
    let std = series.rolling_std(rolling_options(window))?;
    finite_values(&std)
}

/// Calculates Exponential Moving Average (EMA) with smoothing factor `2 / (span + 1)`.
///
/// The average is seeded with the first observed value and carries its last
/// value across missing inputs.
pub fn calculate_ema(values: &[Option<f64>], span: usize) -> Vec<Option<f64>> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut ema: Option<f64> = None;

    values
        .iter()
        .map(|value| {
            if let Some(x) = value {
                ema = Some(match ema {
                    Some(prev) => alpha * x + (1.0 - alpha) * prev,
                    None => *x,
                });
            }
            ema
        })
        .collect()
}

/// Calculates Moving Average Convergence Divergence (MACD) and its signal line
pub fn calculate_macd(close: &[Option<f64>]) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let fast = calculate_ema(close, EMA_FAST_SPAN);
    let slow = calculate_ema(close, EMA_SLOW_SPAN);

    let macd: Vec<Option<f64>> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| Some((*f)? - (*s)?))
        .collect();
    let signal = calculate_ema(&macd, MACD_SIGNAL_SPAN);

    (macd, signal)
}

/// Calculates Relative Strength Index (RSI).
///
/// Gains and losses are rolling means of the positive and negative parts of
/// the close-to-close delta; the first row contributes a zero delta. The value
/// is `None` while the window is incomplete and whenever the average loss is zero.
pub fn calculate_rsi(close: &[Option<f64>], window: usize) -> PolarsResult<Vec<Option<f64>>> {
    if close.len() < window {
        return Ok(vec![None; close.len()]);
    }

    let mut gains = Vec::with_capacity(close.len());
    let mut losses = Vec::with_capacity(close.len());
    for i in 0..close.len() {
        let change = match (i.checked_sub(1).and_then(|p| close[p]), close[i]) {
            (Some(prev), Some(curr)) => curr - prev,
            _ => 0.0,
        };
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let gains_series = Series::new("gains".into(), gains);
    let losses_series = Series::new("losses".into(), losses);
    let avg_gain = finite_values(&gains_series.rolling_mean(rolling_options(window))?)?;
    let avg_loss = finite_values(&losses_series.rolling_mean(rolling_options(window))?)?;

    Ok(avg_gain
        .into_iter()
        .zip(avg_loss)
        .map(|(gain, loss)| match (gain, loss) {
            (Some(gain), Some(loss)) if loss > 0.0 => {
                let rs = gain / loss;
                Some(100.0 - 100.0 / (1.0 + rs))
            }
            _ => None,
        })
        .collect())
}

/// Calculates Bollinger Bands as `(middle, upper, lower)`
pub fn calculate_bollinger_bands(
    close: &[Option<f64>],
    window: usize,
    num_std: f64,
) -> PolarsResult<(Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>)> {
    let middle = calculate_sma(close, window)?;
    let std = calculate_rolling_std(close, window)?;

    let band = |sign: f64| -> Vec<Option<f64>> {
        middle
            .iter()
            .zip(std.iter())
            .map(|(m, s)| Some((*m)? + sign * num_std * (*s)?))
            .collect()
    };
    let upper = band(1.0);
    let lower = band(-1.0);

    Ok((middle, upper, lower))
}

/// Adds all technical indicators to an ascending series of rows.
///
/// Pure transform: indicators that cannot be computed yet stay `None`, nothing
/// is filled here. Rows must be strictly increasing by date.
pub fn add_technical_indicators(mut rows: Vec<PriceRow>) -> Result<Vec<PriceRow>> {
    if let Some(index) = rows
        .windows(2)
        .position(|pair| pair[1].date <= pair[0].date)
    {
        return Err(PredictorError::UnorderedRows { index: index + 1 });
    }

    let close: Vec<Option<f64>> = rows.iter().map(|row| finite(row.close)).collect();

    let sma_20 = calculate_sma(&close, SMA_SHORT_WINDOW)?;
    let sma_50 = calculate_sma(&close, SMA_LONG_WINDOW)?;
    let ema_12 = calculate_ema(&close, EMA_FAST_SPAN);
    let ema_26 = calculate_ema(&close, EMA_SLOW_SPAN);
    let (macd, macd_signal) = calculate_macd(&close);
    let rsi_14 = calculate_rsi(&close, RSI_WINDOW)?;
    let (bb_middle, bb_upper, bb_lower) =
        calculate_bollinger_bands(&close, BOLLINGER_WINDOW, BOLLINGER_NUM_STD)?;

    for (i, row) in rows.iter_mut().enumerate() {
        row.indicators = Indicators {
            sma_20: sma_20[i],
            sma_50: sma_50[i],
            ema_12: ema_12[i],
            ema_26: ema_26[i],
            macd: macd[i],
            macd_signal: macd_signal[i],
            rsi_14: rsi_14[i],
            bollinger_middle: bb_middle[i],
            bollinger_upper: bb_upper[i],
            bollinger_lower: bb_lower[i],
        };
    }

    debug!(
        "Computed indicators for {} rows ({} without RSI)",
        rows.len(),
        rsi_14.iter().filter(|v| v.is_none()).count()
    );

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{daily_dates, synthetic_price_rows};

    fn closes(rows: &[PriceRow]) -> Vec<f64> {
        rows.iter().map(|r| r.close).collect()
    }

    fn assert_close_rel(actual: f64, expected: f64) {
        let rel = (actual - expected).abs() / expected.abs().max(1e-12);
        assert!(rel < 1e-9, "expected {expected}, got {actual} (rel err {rel})");
    }

    #[test]
    fn test_sma_and_ema_match_reference() {
        let rows = add_technical_indicators(synthetic_price_rows(200, 7)).unwrap();
        let close = closes(&rows);

        for (i, row) in rows.iter().enumerate() {
            // SMA reference: plain trailing mean
            for (window, value) in [(20, row.indicators.sma_20), (50, row.indicators.sma_50)] {
                if i + 1 < window {
                    assert!(value.is_none(), "sma_{window} should be missing at row {i}");
                } else {
                    let expected = close[i + 1 - window..=i].iter().sum::<f64>() / window as f64;
                    assert_close_rel(value.unwrap(), expected);
                }
            }
        }

        // EMA reference: recursive definition seeded with the first close
        let reference_ema = |span: usize| -> Vec<f64> {
            let alpha = 2.0 / (span as f64 + 1.0);
            let mut out = Vec::with_capacity(close.len());
            let mut ema = close[0];
            for (i, c) in close.iter().enumerate() {
                if i > 0 {
                    ema = alpha * c + (1.0 - alpha) * ema;
                }
                out.push(ema);
            }
            out
        };
        let ema_12 = reference_ema(12);
        let ema_26 = reference_ema(26);
        for (i, row) in rows.iter().enumerate() {
            assert_close_rel(row.indicators.ema_12.unwrap(), ema_12[i]);
            assert_close_rel(row.indicators.ema_26.unwrap(), ema_26[i]);
        }
    }

    #[test]
    fn test_bollinger_middle_equals_sma_20() {
        let rows = add_technical_indicators(synthetic_price_rows(120, 11)).unwrap();
        for row in &rows {
            assert_eq!(row.indicators.sma_20, row.indicators.bollinger_middle);
            if let (Some(mid), Some(upper), Some(lower)) = (
                row.indicators.bollinger_middle,
                row.indicators.bollinger_upper,
                row.indicators.bollinger_lower,
            ) {
                assert!(lower <= mid && mid <= upper);
                assert!(((upper - mid) - (mid - lower)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_rsi_within_bounds_on_random_walk() {
        for seed in 0..5 {
            let rows = add_technical_indicators(synthetic_price_rows(200, seed)).unwrap();
            for (i, row) in rows.iter().enumerate() {
                if i < RSI_WINDOW - 1 {
                    assert!(row.indicators.rsi_14.is_none());
                }
                if let Some(rsi) = row.indicators.rsi_14 {
                    assert!((0.0..=100.0).contains(&rsi), "RSI {rsi} out of range");
                }
            }
        }
    }

    #[test]
    fn test_rsi_missing_when_no_losses() {
        // Strictly rising closes never produce a loss
        let close: Vec<Option<f64>> = (0..40).map(|i| Some(100.0 + i as f64)).collect();
        let rsi = calculate_rsi(&close, RSI_WINDOW).unwrap();
        assert!(rsi.iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_rsi_matches_reference() {
        let rows = synthetic_price_rows(60, 13);
        let close: Vec<Option<f64>> = rows.iter().map(|r| Some(r.close)).collect();
        let rsi = calculate_rsi(&close, RSI_WINDOW).unwrap();

        let deltas: Vec<f64> = (0..close.len())
            .map(|i| if i == 0 { 0.0 } else { rows[i].close - rows[i - 1].close })
            .collect();
        for i in RSI_WINDOW - 1..close.len() {
            let window = &deltas[i + 1 - RSI_WINDOW..=i];
            let gain = window.iter().map(|d| d.max(0.0)).sum::<f64>() / RSI_WINDOW as f64;
            let loss = window.iter().map(|d| (-d).max(0.0)).sum::<f64>() / RSI_WINDOW as f64;
            let expected = 100.0 - 100.0 / (1.0 + gain / loss);
            assert!((rsi[i].unwrap() - expected).abs() < 1e-8, "row {i}");
        }
        assert!(rsi[RSI_WINDOW - 2].is_none());
    }

    #[test]
    fn test_macd_is_difference_of_emas() {
        let rows = add_technical_indicators(synthetic_price_rows(80, 3)).unwrap();
        for row in &rows {
            let ind = row.indicators;
            assert!((ind.macd.unwrap() - (ind.ema_12.unwrap() - ind.ema_26.unwrap())).abs() < 1e-12);
            assert!(ind.macd_signal.is_some());
        }
    }

    #[test]
    fn test_short_history_leaves_long_windows_missing() {
        let rows = add_technical_indicators(synthetic_price_rows(30, 5)).unwrap();
        assert_eq!(rows.len(), 30);
        assert!(rows.iter().all(|r| r.indicators.sma_50.is_none()));
        assert!(rows[29].indicators.sma_20.is_some());
    }

    #[test]
    fn test_non_finite_close_is_missing() {
        let mut rows = synthetic_price_rows(30, 9);
        rows[25].close = f64::NAN;
        let rows = add_technical_indicators(rows).unwrap();
        assert!(rows[25].indicators.sma_20.is_none());
        assert!(rows[25].features()[3].is_none());
        // EMA carries its previous value across the gap
        assert_eq!(rows[25].indicators.ema_12, rows[24].indicators.ema_12);
    }

    #[test]
    fn test_unordered_rows_rejected() {
        let dates = daily_dates(3);
        let rows = vec![
            PriceRow::new(dates[0], 1.0, 1.0, 1.0, 1.0, 10.0),
            PriceRow::new(dates[2], 1.0, 1.0, 1.0, 1.0, 10.0),
            PriceRow::new(dates[2], 1.0, 1.0, 1.0, 1.0, 10.0),
        ];
        let err = add_technical_indicators(rows).unwrap_err();
        assert!(matches!(err, PredictorError::UnorderedRows { index: 2 }));
    }
}
