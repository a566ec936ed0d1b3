pub mod build_info;
pub mod config;
pub mod constants;
pub mod daily;
pub mod error;
pub mod predictor;
#[cfg(test)]
pub mod test;
pub mod util {
    pub mod feature_engineering;
    pub mod model_logger;
    pub mod pre_processor;
    #[cfg(test)]
    pub mod test_utils;
}

pub use error::{PredictorError, Result};
pub use predictor::StockPricePredictor;
