pub mod predictor;
pub mod stats;
