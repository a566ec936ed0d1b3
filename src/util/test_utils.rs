// External imports
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Internal imports
use crate::util::feature_engineering::PriceRow;

/// Consecutive calendar dates starting 2023-01-02
pub fn daily_dates(num_rows: usize) -> Vec<NaiveDate> {
    let base_date = NaiveDate::from_ymd_opt(2023, 1, 2).expect("valid base date");
    (0..num_rows)
        .map(|i| base_date + Duration::days(i as i64))
        .collect()
}

/// Generate a reproducible random-walk price series for testing
pub fn synthetic_price_rows(num_rows: usize, seed: u64) -> Vec<PriceRow> {
    let mut rng = StdRng::seed_from_u64(seed);

    // Start with a base price around $100
    let mut current_price: f64 = 100.0 + rng.random::<f64>() * 50.0;

    daily_dates(num_rows)
        .into_iter()
        .map(|date| {
            // Random price movement between -2% and +2%
            let movement = rng.random_range(-0.02..0.02);
            current_price *= 1.0 + movement;

            // Open, high and low keep realistic relationships to close
            let open = current_price * (1.0 + rng.random_range(-0.005..0.005));
            let high = current_price.max(open) * (1.0 + rng.random::<f64>() * 0.005);
            let low = current_price.min(open) * (1.0 - rng.random::<f64>() * 0.005);
            let volume = rng.random_range(10_000.0..110_000.0);

            // Roughly a third of the days carry news sentiment
            let sentiment = if rng.random_bool(0.3) {
                rng.random_range(-1.0..1.0)
            } else {
                0.0
            };

            PriceRow::new(date, open, high, low, current_price, volume).with_sentiment(sentiment)
        })
        .collect()
}
