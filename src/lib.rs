//! Retrain: continuously retrained predictors
//!
//! This library keeps a trained model up to date with its training data.
//! A single background training loop per predictor reloads the data, asks a
//! pluggable trainer strategy for candidate models, keeps whichever one the
//! best-model policy prefers and publishes it atomically, while prediction
//! callers wait on an evaluation gate instead of polling.

pub mod data;
pub mod evaluation;
pub mod models;
pub mod pipeline;
pub mod predictor;
pub mod storage;
pub mod traits;
pub mod training;

// Re-export key types for ergonomic use
pub use data::frame::DataFrame;
pub use data::schema::{Column, ColumnKind, Schema};
pub use data::text::TextFormat;
pub use data::value::DataValue;
pub use evaluation::evaluator::Evaluator;
pub use evaluation::metrics::{Metrics, MetricsKind};
pub use evaluation::policy::{BestModelPolicy, BinaryPolicy, Choice, MulticlassPolicy, RegressionPolicy};
pub use models::centroid::NearestCentroid;
pub use models::linears::LinearRegression;
pub use models::ridge::RidgeRegression;
pub use pipeline::featurizer::FeaturizerEstimator;
pub use pipeline::learner::{ClassificationEstimator, RegressionEstimator};
pub use pipeline::pipes::{ModelDefinition, ModelPipes};
pub use predictor::predictor::{Predictor, PredictorBuilder};
pub use predictor::stats::TrainingStats;
pub use storage::data::{DataStorage, FileDataStorage, MemoryDataStorage, Timestamped};
pub use storage::model::{FileModelStorage, MemoryModelStorage, ModelStorage};
pub use traits::features::FeatureVector;
pub use traits::model::{Classifier, Model, ModelError};
pub use traits::transform::{Estimator, Transformer};
pub use training::auto::AutoTrainer;
pub use training::config::PredictorConfig;
pub use training::events::TrainingEvent;
pub use training::trainers::{CrossValidateTrainer, ModelTrainer, ShuffleTrainer, StandardTrainer, TrainedModel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Verify that key types are exported and accessible
        let _feature = FeatureVector::new(vec![1.0, 2.0, 3.0]);
        let _config = PredictorConfig::default();
        let _definition = ModelDefinition::regression(Some(
            ModelPipes::new(RegressionEstimator::new(LinearRegression::default())).with_input(FeaturizerEstimator::new()),
        ));
        let _trainer = CrossValidateTrainer::default();
        let _format = TextFormat::default();
    }
}
