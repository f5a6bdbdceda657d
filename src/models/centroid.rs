use std::collections::BTreeMap;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::linears::check_training_input;
use crate::traits::features::FeatureVector;
use crate::traits::model::{Classifier, Model, ModelError};
use crate::traits::transform::LearnerState;

/// Convert raw model outputs to probability distributions using softmax
pub fn to_probabilities(values: &[f32]) -> Vec<f32> {
    // Find max value for numerical stability
    let max_val = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let exp_values: Vec<f32> = values.iter().map(|&x| (x - max_val).exp()).collect();
    let sum: f32 = exp_values.iter().sum();
    exp_values.into_iter().map(|v| v / sum).collect()
}

/// Nearest-centroid classifier.
///
/// Labels are class indices (non-negative integers). Probabilities are a
/// softmax over negative squared distances to each class centroid, one slot
/// per trained class in ascending class order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NearestCentroid {
    /// Class index of each centroid, ascending
    classes: Vec<f32>,
    centroids: Vec<Vec<f32>>,
}

impl NearestCentroid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trained classifier from stored centroids
    pub fn from_parts(classes: Vec<f32>, centroids: Vec<Vec<f32>>) -> Result<Self, ModelError> {
        if classes.is_empty() || classes.len() != centroids.len() {
            return Err(ModelError::InvalidParameter(format!(
                "{} classes for {} centroids",
                classes.len(),
                centroids.len()
            )));
        }
        for class in &classes {
            class_index(*class)?;
        }
        Ok(Self { classes, centroids })
    }

    pub fn is_trained(&self) -> bool {
        !self.classes.is_empty()
    }

    fn check_trained(&self) -> Result<(), ModelError> {
        if self.is_trained() {
            Ok(())
        } else {
            Err(ModelError::Prediction("Model not trained".to_string()))
        }
    }

    fn distances(&self, feature: &FeatureVector) -> Result<Vec<f32>, ModelError> {
        self.centroids
            .iter()
            .map(|centroid| {
                let centroid = FeatureVector::from(centroid.clone());
                feature.squared_distance(&centroid).ok_or_else(|| ModelError::DimensionMismatch {
                    expected: centroid.dimension(),
                    actual: feature.dimension(),
                    context: "Feature dimension doesn't match centroids".to_string(),
                })
            })
            .collect()
    }
}

fn class_index(label: f32) -> Result<usize, ModelError> {
    if label < 0.0 || label.fract() != 0.0 || !label.is_finite() {
        return Err(ModelError::Validation(format!(
            "class labels must be non-negative integers, got {}",
            label
        )));
    }
    Ok(label as usize)
}

impl Model for NearestCentroid {
    fn train(&mut self, features: &[FeatureVector], targets: &[f32], cancel: &CancellationToken) -> Result<(), ModelError> {
        check_training_input(features, targets)?;
        let dimension = features[0].dimension();

        let mut sums: BTreeMap<usize, (Array1<f32>, usize)> = BTreeMap::new();
        for (feature, target) in features.iter().zip(targets) {
            ModelError::check(cancel)?;
            if feature.dimension() != dimension {
                return Err(ModelError::DimensionMismatch {
                    expected: dimension,
                    actual: feature.dimension(),
                    context: "training feature vectors".to_string(),
                });
            }
            let entry = sums
                .entry(class_index(*target)?)
                .or_insert_with(|| (Array1::zeros(dimension), 0));
            entry.0 += feature.as_array();
            entry.1 += 1;
        }

        self.classes = sums.keys().map(|class| *class as f32).collect();
        self.centroids = sums
            .into_values()
            .map(|(sum, count)| (sum / count as f32).to_vec())
            .collect();
        Ok(())
    }

    fn predict(&self, feature: &FeatureVector) -> Result<f32, ModelError> {
        self.check_trained()?;
        let distances = self.distances(feature)?;
        let nearest = distances
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .unwrap_or(0);
        Ok(self.classes[nearest])
    }

    /// Layout: class count, dimension, classes, then centroids row by row
    fn export_parameters(&self) -> Result<Vec<f32>, ModelError> {
        self.check_trained()?;
        let dimension = self.centroids.first().map(Vec::len).unwrap_or(0);
        let mut parameters = vec![self.classes.len() as f32, dimension as f32];
        parameters.extend(&self.classes);
        for centroid in &self.centroids {
            parameters.extend(centroid);
        }
        Ok(parameters)
    }

    fn import_parameters(&mut self, parameters: Vec<f32>) -> Result<(), ModelError> {
        if parameters.len() < 2 {
            return Err(ModelError::InvalidParameter("Empty parameters".to_string()));
        }
        let count = parameters[0] as usize;
        let dimension = parameters[1] as usize;
        let expected = 2 + count + count * dimension;
        if parameters.len() != expected {
            return Err(ModelError::DimensionMismatch {
                expected,
                actual: parameters.len(),
                context: "centroid parameters".to_string(),
            });
        }
        let classes = parameters[2..2 + count].to_vec();
        let centroids = parameters[2 + count..]
            .chunks(dimension.max(1))
            .map(<[f32]>::to_vec)
            .collect();
        *self = Self::from_parts(classes, centroids)?;
        Ok(())
    }

    fn state(&self) -> Result<LearnerState, ModelError> {
        if !self.is_trained() {
            return Err(ModelError::Serialization("Model not trained".to_string()));
        }
        Ok(LearnerState::Centroid {
            centroids: self.centroids.clone(),
            classes: self.classes.clone(),
        })
    }

    fn clone_model(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
}

impl Classifier for NearestCentroid {
    fn classes(&self) -> Vec<usize> {
        self.classes.iter().map(|class| *class as usize).collect()
    }

    fn predict_proba(&self, feature: &FeatureVector) -> Result<Vec<f32>, ModelError> {
        self.check_trained()?;
        let scores: Vec<f32> = self.distances(feature)?.into_iter().map(|d| -d).collect();
        Ok(to_probabilities(&scores))
    }

    fn clone_classifier(&self) -> Box<dyn Classifier> {
        Box::new(self.clone())
    }
}
