use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::traits::features::FeatureVector;
use crate::traits::transform::LearnerState;

/// Error type shared by the training loop, the storages and the learners.
///
/// Cloneable so that a single terminal training failure can be handed to
/// every caller waiting on the evaluation.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    /// Cooperative cancellation; expected shutdown path
    #[error("Operation cancelled")]
    Cancelled,
    /// Errors during training
    #[error("Training error: {0}")]
    Training(String),
    /// Errors during prediction
    #[error("Prediction error: {0}")]
    Prediction(String),
    /// Data dimension mismatch errors
    #[error("Dimension mismatch ({context}): expected {expected}, got {actual}")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },
    /// Invalid parameter errors
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Inconsistent schemas between data sources or between data and model
    #[error("Schema error: {0}")]
    Schema(String),
    /// Data or model storage failures
    #[error("Storage error: {0}")]
    Storage(String),
    /// I/O errors (file storages)
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
    /// Errors from serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Validation error: {0}")]
    Validation(String),
    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl ModelError {
    /// True for the transient branch: cancellation observed somewhere.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModelError::Cancelled)
    }

    /// Returns `Err(Cancelled)` once the token fires.
    pub fn check(cancel: &CancellationToken) -> Result<(), ModelError> {
        if cancel.is_cancelled() {
            Err(ModelError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for ModelError {
    fn from(err: csv::Error) -> Self {
        ModelError::Storage(err.to_string())
    }
}

/// Core trait for the learners a pipeline trains
pub trait Model: Send + Sync {
    /// Train the model on a batch of data, honoring cancellation between iterations
    fn train(
        &mut self,
        features: &[FeatureVector],
        targets: &[f32],
        cancel: &CancellationToken,
    ) -> Result<(), ModelError>;

    /// Make a prediction for a single feature vector
    fn predict(&self, feature: &FeatureVector) -> Result<f32, ModelError>;

    /// Make predictions for multiple feature vectors
    fn predict_batch(&self, features: &[FeatureVector]) -> Result<Vec<f32>, ModelError> {
        let mut predictions = Vec::with_capacity(features.len());
        for feature in features {
            predictions.push(self.predict(feature)?);
        }
        Ok(predictions)
    }

    /// Export model parameters
    fn export_parameters(&self) -> Result<Vec<f32>, ModelError>;

    /// Import model parameters
    fn import_parameters(&mut self, parameters: Vec<f32>) -> Result<(), ModelError>;

    /// Persistable snapshot of the trained learner
    fn state(&self) -> Result<LearnerState, ModelError>;

    /// Clone the model (needed to fit a fresh copy per candidate)
    fn clone_model(&self) -> Box<dyn Model>;
}

/// Learners producing a probability per class
pub trait Classifier: Model {
    /// Classes seen during training, in probability slot order
    fn classes(&self) -> Vec<usize>;

    fn num_classes(&self) -> usize {
        self.classes().len()
    }

    /// One probability per entry of [`classes`](Self::classes); sums to one
    fn predict_proba(&self, feature: &FeatureVector) -> Result<Vec<f32>, ModelError>;

    fn clone_classifier(&self) -> Box<dyn Classifier>;
}
