// External crates
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

// Local modules
use stock_sentinel::config::AppConfig;
use stock_sentinel::daily::lstm::step_6_model_serialization::FileCheckpointStore;
use stock_sentinel::predictor::StockPricePredictor;
use stock_sentinel::util::model_logger::TrainingRun;
use stock_sentinel::util::pre_processor::CsvRowSource;

#[derive(Parser, Debug)]
#[command(name = "stock-sentinel")]
#[command(about = "Train and query next-day price models per stock symbol")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory with <SYMBOL>.csv price histories
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory holding model checkpoints
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Directory for training run records
    #[arg(long, global = true)]
    runs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model and print its validation metrics
    Train(TrainArgs),
    /// Forecast the next close of a trained symbol
    Predict {
        #[arg(default_value = "AAPL")]
        symbol: String,
    },
    /// List symbols with a stored checkpoint
    Status,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(default_value = "AAPL")]
    symbol: String,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Fraction of windows held out for validation
    #[arg(long)]
    val_split: Option<f64>,

    #[arg(long)]
    sequence_length: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct StatusReport {
    models_dir: PathBuf,
    trained_symbols: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.models_dir {
        config.models_dir = dir.clone();
    }
    if let Some(dir) = &cli.runs_dir {
        config.runs_dir = dir.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let predictor = StockPricePredictor::new(
        CsvRowSource::new(&config.data_dir),
        FileCheckpointStore::new(&config.models_dir),
    );

    match cli.command {
        Command::Train(args) => {
            let mut training = config.training.clone();
            training.epochs = args.epochs.unwrap_or(training.epochs);
            training.batch_size = args.batch_size.unwrap_or(training.batch_size);
            training.learning_rate = args.learning_rate.unwrap_or(training.learning_rate);
            training.validation_split = args.val_split.unwrap_or(training.validation_split);
            training.sequence_length = args.sequence_length.unwrap_or(training.sequence_length);
            training.seed = args.seed.or(training.seed);

            let mut run = TrainingRun::new(&args.symbol.to_uppercase(), &training);
            let start = Instant::now();
            let metrics = predictor
                .train(&args.symbol, &training)
                .with_context(|| format!("training {} failed", args.symbol))?;

            run.set_metrics(&metrics);
            run.set_training_time(start.elapsed().as_secs_f64());
            let run_path = run.save(&config.runs_dir)?;
            info!("Run record saved to {}", run_path.display());

            print_json(&metrics)?;
        }
        Command::Predict { symbol } => {
            let prediction = predictor
                .predict(&symbol)
                .with_context(|| format!("prediction for {symbol} failed"))?;
            print_json(&prediction)?;
        }
        Command::Status => {
            let report = StatusReport {
                models_dir: config.models_dir.clone(),
                trained_symbols: predictor.trained_symbols()?,
            };
            print_json(&report)?;
        }
    }

    Ok(())
}
