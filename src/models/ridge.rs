use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::linears::{check_training_input, design_matrix, gradient_descent, linear_predict};
use crate::traits::features::FeatureVector;
use crate::traits::model::{Model, ModelError};
use crate::traits::transform::LearnerState;

/// Ridge regression model (Linear regression with L2 regularization)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeRegression {
    /// Weights including bias term
    weights: Vec<f32>,
    /// Whether to include a bias term
    with_bias: bool,
    /// Regularization strength (alpha)
    alpha: f32,
    /// Learning rate for gradient descent
    learning_rate: f32,
    /// Number of iterations for gradient descent
    max_iterations: usize,
    /// Whether the model has been trained
    trained: bool,
}

impl RidgeRegression {
    /// Create a new Ridge Regression model
    pub fn new(with_bias: bool, alpha: f32, learning_rate: f32, max_iterations: usize) -> Self {
        Self {
            weights: Vec::new(),
            with_bias,
            alpha,
            learning_rate,
            max_iterations,
            trained: false,
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }
}

impl Default for RidgeRegression {
    fn default() -> Self {
        Self::new(true, 0.1, 0.05, 2000)
    }
}

impl Model for RidgeRegression {
    fn train(&mut self, features: &[FeatureVector], targets: &[f32], cancel: &CancellationToken) -> Result<(), ModelError> {
        if self.alpha < 0.0 {
            return Err(ModelError::InvalidParameter(format!("alpha must be non-negative, got {}", self.alpha)));
        }
        check_training_input(features, targets)?;

        let x = design_matrix(features, self.with_bias)?;
        let y = Array1::from(targets.to_vec());

        self.weights = gradient_descent(
            &x,
            &y,
            self.alpha,
            self.with_bias,
            self.learning_rate,
            self.max_iterations,
            cancel,
        )?;
        self.trained = true;
        Ok(())
    }

    fn predict(&self, feature: &FeatureVector) -> Result<f32, ModelError> {
        if !self.trained {
            return Err(ModelError::Prediction("Model not trained".to_string()));
        }
        linear_predict(&self.weights, self.with_bias, feature)
    }

    fn export_parameters(&self) -> Result<Vec<f32>, ModelError> {
        Ok(self.weights.clone())
    }

    fn import_parameters(&mut self, parameters: Vec<f32>) -> Result<(), ModelError> {
        if parameters.is_empty() {
            return Err(ModelError::InvalidParameter("Empty parameters".to_string()));
        }
        self.weights = parameters;
        self.trained = true;
        Ok(())
    }

    /// Persisted as plain linear weights; the penalty only matters while fitting
    fn state(&self) -> Result<LearnerState, ModelError> {
        if !self.trained {
            return Err(ModelError::Serialization("Model not trained".to_string()));
        }
        Ok(LearnerState::Linear {
            weights: self.weights.clone(),
            with_bias: self.with_bias,
        })
    }

    fn clone_model(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
}
