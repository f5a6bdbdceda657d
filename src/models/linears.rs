use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::traits::features::FeatureVector;
use crate::traits::model::{Model, ModelError};
use crate::traits::transform::LearnerState;

/// Gradient norm below which descent stops early
pub(crate) const CONVERGENCE_TOLERANCE: f32 = 1e-6;

/// Linear regression model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRegression {
    /// Weights including bias term
    weights: Vec<f32>,
    /// Whether to include a bias term
    with_bias: bool,
    /// Learning rate for gradient descent
    learning_rate: f32,
    /// Number of iterations for gradient descent
    max_iterations: usize,
    /// Whether the model has been trained
    trained: bool,
}

impl LinearRegression {
    /// Create a new Linear Regression model
    pub fn new(with_bias: bool, learning_rate: f32, max_iterations: usize) -> Self {
        Self {
            weights: Vec::new(),
            with_bias,
            learning_rate,
            max_iterations,
            trained: false,
        }
    }

    /// Already-trained model from stored weights (bias first when present)
    pub fn from_weights(weights: Vec<f32>, with_bias: bool) -> Result<Self, ModelError> {
        let mut model = Self::new(with_bias, 0.0, 0);
        model.import_parameters(weights)?;
        Ok(model)
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self::new(true, 0.05, 2000)
    }
}

/// Design matrix with an optional leading column of ones for the bias
pub(crate) fn design_matrix(features: &[FeatureVector], with_bias: bool) -> Result<Array2<f32>, ModelError> {
    let n_samples = features.len();
    let n_features = features.first().map(FeatureVector::dimension).unwrap_or(0);
    let offset = usize::from(with_bias);

    let mut matrix = if with_bias {
        Array2::ones((n_samples, n_features + 1))
    } else {
        Array2::zeros((n_samples, n_features))
    };

    for (i, feature) in features.iter().enumerate() {
        if feature.dimension() != n_features {
            return Err(ModelError::DimensionMismatch {
                expected: n_features,
                actual: feature.dimension(),
                context: format!("feature vector {}", i),
            });
        }
        for (j, value) in feature.as_array().iter().enumerate() {
            matrix[[i, j + offset]] = *value;
        }
    }
    Ok(matrix)
}

pub(crate) fn check_training_input(features: &[FeatureVector], targets: &[f32]) -> Result<(), ModelError> {
    if features.is_empty() || targets.is_empty() {
        return Err(ModelError::Training("Empty training data".to_string()));
    }
    if features.len() != targets.len() {
        return Err(ModelError::DimensionMismatch {
            expected: features.len(),
            actual: targets.len(),
            context: "Number of feature vectors doesn't match number of targets".to_string(),
        });
    }
    Ok(())
}

/// Batch gradient descent on mean squared error with an L2 gradient term
/// `alpha * w` (the bias column is never penalized). Cancellation is observed
/// once per iteration.
pub(crate) fn gradient_descent(
    x: &Array2<f32>,
    y: &Array1<f32>,
    alpha: f32,
    with_bias: bool,
    learning_rate: f32,
    max_iterations: usize,
    cancel: &CancellationToken,
) -> Result<Vec<f32>, ModelError> {
    let n_samples = x.nrows() as f32;
    let n_features = x.ncols();
    let offset = usize::from(with_bias);

    let mut weights = Array1::<f32>::zeros(n_features);
    for _ in 0..max_iterations {
        ModelError::check(cancel)?;

        // Errors: y - X * w
        let errors = y - &x.dot(&weights);

        // Gradient: -2/n * X^T * errors + alpha * w
        let mut gradient = x.t().dot(&errors) * (-2.0 / n_samples);
        for i in offset..n_features {
            gradient[i] += alpha * weights[i];
        }

        weights = &weights - &(gradient.mapv(|g| g * learning_rate));

        if weights.iter().any(|w| !w.is_finite()) {
            return Err(ModelError::Training(format!(
                "gradient descent diverged; learning rate {} is too large",
                learning_rate
            )));
        }
        if gradient.dot(&gradient).sqrt() < CONVERGENCE_TOLERANCE {
            break;
        }
    }
    Ok(weights.to_vec())
}

/// Dot product of a feature vector with bias-first weights
pub(crate) fn linear_predict(weights: &[f32], with_bias: bool, feature: &FeatureVector) -> Result<f32, ModelError> {
    let offset = usize::from(with_bias);
    let expected_dim = weights.len().saturating_sub(offset);
    if feature.dimension() != expected_dim {
        return Err(ModelError::DimensionMismatch {
            expected: expected_dim,
            actual: feature.dimension(),
            context: "Feature dimension doesn't match model weights".to_string(),
        });
    }
    let bias = if with_bias { weights[0] } else { 0.0 };
    Ok(feature
        .as_array()
        .iter()
        .zip(&weights[offset..])
        .fold(bias, |acc, (x, w)| acc + x * w))
}

impl Model for LinearRegression {
    fn train(&mut self, features: &[FeatureVector], targets: &[f32], cancel: &CancellationToken) -> Result<(), ModelError> {
        check_training_input(features, targets)?;

        let x = design_matrix(features, self.with_bias)?;
        let y = Array1::from(targets.to_vec());

        self.weights = gradient_descent(
            &x,
            &y,
            0.0,
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
