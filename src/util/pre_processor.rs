// External crates
use chrono::{NaiveDate, NaiveDateTime};
use log::{info, warn};
use polars::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// Local modules
use crate::error::{PredictorError, Result};
use crate::util::feature_engineering::PriceRow;

/// Source of daily price history, one symbol at a time.
///
/// Implementations return rows ascending by date. A missing sentiment
/// aggregate is reported as 0.
pub trait RowSource {
    fn fetch(&self, symbol: &str) -> Result<Vec<PriceRow>>;
}

impl<T: RowSource + ?Sized> RowSource for &T {
    fn fetch(&self, symbol: &str) -> Result<Vec<PriceRow>> {
        (**self).fetch(symbol)
    }
}

/// Upper-cases a ticker and rejects anything unsafe to use in a file name
pub fn normalize_symbol(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        && !symbol.starts_with('.');

    if valid {
        Ok(symbol)
    } else {
        Err(PredictorError::InvalidSymbol(symbol))
    }
}

/// Rows held in memory, keyed by symbol
#[derive(Debug, Clone, Default)]
pub struct InMemoryRowSource {
    rows: HashMap<String, Vec<PriceRow>>,
}

impl InMemoryRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, rows: Vec<PriceRow>) -> Result<()> {
        self.rows.insert(normalize_symbol(symbol)?, rows);
        Ok(())
    }

    pub fn with_rows(mut self, symbol: &str, rows: Vec<PriceRow>) -> Result<Self> {
        self.insert(symbol, rows)?;
        Ok(self)
    }
}

impl RowSource for InMemoryRowSource {
    fn fetch(&self, symbol: &str) -> Result<Vec<PriceRow>> {
        let symbol = normalize_symbol(symbol)?;
        match self.rows.get(&symbol) {
            Some(rows) => Ok(rows.clone()),
            None => {
                warn!("No data found for {}", symbol);
                Ok(Vec::new())
            }
        }
    }
}

/// Reads `<data_dir>/<SYMBOL>.csv` files exported from the price store
#[derive(Debug, Clone)]
pub struct CsvRowSource {
    data_dir: PathBuf,
}

impl CsvRowSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path_for(&self, symbol: &str) -> Result<PathBuf> {
        Ok(self.data_dir.join(format!("{}.csv", normalize_symbol(symbol)?)))
    }
}

impl RowSource for CsvRowSource {
    fn fetch(&self, symbol: &str) -> Result<Vec<PriceRow>> {
        let path = self.path_for(symbol)?;
        if !path.exists() {
            warn!("No data found for {} ({} missing)", symbol, path.display());
            return Ok(Vec::new());
        }

        let rows = load_price_csv(&path)?;
        info!("Fetched {} records for {}", rows.len(), symbol);
        Ok(rows)
    }
}

// Maps the column spellings used by the price store and common exports
fn standard_column_name(name: &str) -> Option<&'static str> {
    let standard = match name.to_lowercase().as_str() {
        "price_date" | "date" | "timestamp" | "time" | "datetime" | "day" => "date",
        "open_price" | "open" | "o" => "open",
        "high_price" | "high" | "h" => "high",
        "low_price" | "low" | "l" => "low",
        "close_price" | "close" | "c" | "adj_close" | "adjusted_close" => "close",
        "volume" | "vol" | "v" => "volume",
        "sentiment_score" | "sentiment" => "sentiment_score",
        _ => return None,
    };
    Some(standard)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            // e.g. "2024-01-02T00:00:00Z"
            raw.get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        })
}

// Looks the name up in the live column list, which `rename` keeps current
fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|column| column.as_str() == name)
}

fn float_column(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<f64>>> {
    let column = df.column(name)?.cast(&DataType::Float64)?;
    Ok(column.f64()?.into_iter().collect())
}

/// Loads a daily OHLCV csv into rows sorted ascending by date.
///
/// Rows with an unparseable date are skipped; missing numeric cells become
/// NaN and are treated as missing features downstream. Duplicate dates keep
/// the last occurrence.
pub fn load_price_csv(path: &Path) -> Result<Vec<PriceRow>> {
    let file = std::fs::File::open(path)?;
    let mut df = CsvReader::new(file).finish()?;

    let renames: Vec<(String, &'static str)> = df
        .get_column_names()
        .iter()
        .filter_map(|name| {
            let standard = standard_column_name(name.as_str())?;
            (name.as_str() != standard).then(|| (name.to_string(), standard))
        })
        .collect();
    for (old_name, new_name) in renames {
        if !has_column(&df, new_name) {
            df.rename(&old_name, new_name.into())?;
        }
    }

    // Verify required columns exist
    for required in ["date", "open", "high", "low", "close", "volume"] {
        if !has_column(&df, required) {
            return Err(PolarsError::ColumnNotFound(
                format!("Required column {} not found in {}", required, path.display()).into(),
            )
            .into());
        }
    }

    let dates_col = df.column("date")?.cast(&DataType::String)?;
    let dates = dates_col.str()?;
    let open = float_column(&df, "open")?;
    let high = float_column(&df, "high")?;
    let low = float_column(&df, "low")?;
    let close = float_column(&df, "close")?;
    let volume = float_column(&df, "volume")?;
    let sentiment = if has_column(&df, "sentiment_score") {
        float_column(&df, "sentiment_score")?
    } else {
        vec![None; df.height()]
    };

    let mut by_date: std::collections::BTreeMap<NaiveDate, PriceRow> = Default::default();
    let mut skipped = 0usize;
    for i in 0..df.height() {
        let Some(date) = dates.get(i).and_then(parse_date) else {
            skipped += 1;
            continue;
        };
        let value = |column: &[Option<f64>]| column[i].unwrap_or(f64::NAN);
        let row = PriceRow::new(
            date,
            value(&open),
            value(&high),
            value(&low),
            value(&close),
            value(&volume),
        )
        .with_sentiment(sentiment[i].unwrap_or(0.0));
        by_date.insert(date, row);
    }

    if skipped > 0 {
        warn!("Skipped {} rows with unparseable dates in {}", skipped, path.display());
    }

    Ok(by_date.into_values().collect())
}
