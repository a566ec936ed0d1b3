use std::fs;
use std::io::Write;

use tempfile::tempdir;

use crate::daily::lstm::step_4_train_model::TrainingConfig;
use crate::daily::lstm::step_6_model_serialization::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
use crate::error::PredictorError;
use crate::predictor::StockPricePredictor;
use crate::util::pre_processor::{CsvRowSource, InMemoryRowSource};
use crate::util::test_utils::synthetic_price_rows;

fn quick_config() -> TrainingConfig {
    TrainingConfig {
        epochs: 2,
        batch_size: 16,
        hidden_size: 32,
        dense_size: 16,
        seed: Some(7),
        ..TrainingConfig::default()
    }
}

#[test]
fn test_train_then_predict_end_to_end() {
    let dir = tempdir().unwrap();
    let source = InMemoryRowSource::new()
        .with_rows("AAPL", synthetic_price_rows(300, 11))
        .unwrap();
    let store = FileCheckpointStore::new(dir.path());
    let predictor = StockPricePredictor::new(source, store);

    let metrics = predictor.train("AAPL", &quick_config()).unwrap();
    assert_eq!(metrics.epochs, 2);
    // 300 rows give 240 windows, the last 48 validate
    assert_eq!(metrics.train_windows, 192);
    assert_eq!(metrics.validation_windows, 48);
    assert!(metrics.rmse.is_finite() && metrics.mae.is_finite());
    assert!(metrics.best_epoch >= 1 && metrics.best_epoch <= 2);

    assert!(dir.path().join("AAPL_price_model.ckpt").is_file());
    assert!(predictor.has_checkpoint("aapl").unwrap());
    assert_eq!(predictor.trained_symbols().unwrap(), vec!["AAPL".to_string()]);

    let prediction = predictor.predict("AAPL").unwrap();
    assert_eq!(prediction.symbol, "AAPL");
    assert!(prediction.predicted_price > 0.0);
    assert!(prediction.confidence_lower <= prediction.predicted_price);
    assert!(prediction.predicted_price <= prediction.confidence_upper);
}

#[test]
fn test_predict_without_checkpoint() {
    let source = InMemoryRowSource::new()
        .with_rows("AAPL", synthetic_price_rows(100, 1))
        .unwrap();
    let predictor = StockPricePredictor::new(source, MemoryCheckpointStore::new());

    let result = predictor.predict("AAPL");
    assert!(matches!(
        result,
        Err(PredictorError::ModelNotTrained { ref symbol }) if symbol == "AAPL"
    ));
    assert!(!predictor.has_checkpoint("AAPL").unwrap());
}

#[test]
fn test_predict_with_short_history() {
    let store = MemoryCheckpointStore::new();
    let trainer = StockPricePredictor::new(
        InMemoryRowSource::new()
            .with_rows("MSFT", synthetic_price_rows(120, 3))
            .unwrap(),
        &store,
    );
    let config = TrainingConfig {
        sequence_length: 40,
        epochs: 1,
        hidden_size: 8,
        dense_size: 4,
        ..quick_config()
    };
    trainer.train("MSFT", &config).unwrap();

    // Same checkpoints, but only 30 rows of history
    let server = StockPricePredictor::new(
        InMemoryRowSource::new()
            .with_rows("MSFT", synthetic_price_rows(30, 3))
            .unwrap(),
        &store,
    );
    assert!(matches!(
        server.predict("MSFT"),
        Err(PredictorError::DataInsufficient { required: 40, available: 30, .. })
    ));
}

#[test]
fn test_train_with_too_little_history() {
    let source = InMemoryRowSource::new()
        .with_rows("NVDA", synthetic_price_rows(60, 4))
        .unwrap();
    let store = MemoryCheckpointStore::new();
    let predictor = StockPricePredictor::new(source, &store);

    assert!(matches!(
        predictor.train("NVDA", &quick_config()),
        Err(PredictorError::DataInsufficient { required: 61, available: 60, .. })
    ));
    // Unknown symbols have no rows at all
    assert!(matches!(
        predictor.train("AMD", &quick_config()),
        Err(PredictorError::DataInsufficient { available: 0, .. })
    ));
    assert!(store.symbols().unwrap().is_empty());
}

#[test]
fn test_checkpoints_are_per_symbol() {
    let store = MemoryCheckpointStore::new();
    let source = InMemoryRowSource::new()
        .with_rows("LOW", synthetic_price_rows(90, 5))
        .unwrap()
        .with_rows(
            "HIGH",
            synthetic_price_rows(90, 6)
                .into_iter()
                .map(|mut row| {
                    row.open *= 10.0;
                    row.high *= 10.0;
                    row.low *= 10.0;
                    row.close *= 10.0;
                    row
                })
                .collect(),
        )
        .unwrap();
    let predictor = StockPricePredictor::new(source, &store);
    let config = TrainingConfig {
        sequence_length: 20,
        epochs: 1,
        hidden_size: 8,
        dense_size: 4,
        ..quick_config()
    };

    predictor.train("LOW", &config).unwrap();
    predictor.train("HIGH", &config).unwrap();

    let low = store.load("LOW").unwrap().unwrap();
    let high = store.load("HIGH").unwrap().unwrap();
    assert!(high.scaling.target.data_max()[0] > low.scaling.target.data_max()[0]);

    // Each forecast stays in its own symbol's price range
    let high_prediction = predictor.predict("HIGH").unwrap();
    let low_prediction = predictor.predict("LOW").unwrap();
    assert!(high_prediction.current_price > 5.0 * low_prediction.current_price);
    assert_eq!(predictor.trained_symbols().unwrap(), vec!["HIGH", "LOW"]);
}

#[test]
fn test_csv_source_and_file_store() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let mut file = fs::File::create(data_dir.join("IBM.csv")).unwrap();
    writeln!(file, "price_date,open_price,high_price,low_price,close_price,volume,sentiment_score").unwrap();
    for row in synthetic_price_rows(80, 8) {
        writeln!(
            file,
            "{},{},{},{},{},{},{}",
            row.date, row.open, row.high, row.low, row.close, row.volume, row.sentiment_score
        )
        .unwrap();
    }
    drop(file);

    let predictor = StockPricePredictor::new(
        CsvRowSource::new(&data_dir),
        FileCheckpointStore::new(dir.path().join("models")),
    );
    let config = TrainingConfig {
        sequence_length: 20,
        epochs: 1,
        hidden_size: 8,
        dense_size: 4,
        ..quick_config()
    };

    let metrics = predictor.train("ibm", &config).unwrap();
    assert_eq!(metrics.train_windows + metrics.validation_windows, 60);
    assert!(dir.path().join("models").join("IBM_price_model.ckpt").is_file());

    let prediction = predictor.predict("IBM").unwrap();
    assert!(prediction.confidence_lower <= prediction.confidence_upper);
}

#[test]
fn test_invalid_symbol() {
    let predictor = StockPricePredictor::new(InMemoryRowSource::new(), MemoryCheckpointStore::new());
    assert!(matches!(
        predictor.predict("../AAPL"),
        Err(PredictorError::InvalidSymbol(_))
    ));
}
