//! The narrow framework contracts the training loop consumes: fit an
//! estimator on data to get a transformer, transform data with it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::data::frame::DataFrame;
use crate::pipeline::featurizer::{Featurizer, FeaturizerState};
use crate::pipeline::learner::{ClassificationTransformer, RegressionTransformer};
use crate::traits::model::ModelError;

/// A trained, immutable data transformation
pub trait Transformer: Send + Sync + fmt::Debug {
    /// Apply the transformation, returning a new frame
    fn transform(&self, data: &DataFrame) -> Result<DataFrame, ModelError>;

    /// Persistable form; transformers without one cannot be saved
    fn state(&self) -> Result<TransformerState, ModelError> {
        Err(ModelError::Serialization(format!("{:?} cannot be persisted", self)))
    }
}

/// A trainable pipeline stage
pub trait Estimator: Send + Sync {
    fn fit(&self, data: &DataFrame, cancel: &CancellationToken) -> Result<Arc<dyn Transformer>, ModelError>;
}

/// Persisted learner parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerState {
    Linear { weights: Vec<f32>, with_bias: bool },
    Centroid { centroids: Vec<Vec<f32>>, classes: Vec<f32> },
}

/// Persisted transformer graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformerState {
    Featurizer(FeaturizerState),
    Regression(LearnerState),
    Classification(LearnerState),
    Chain(Vec<TransformerState>),
}

impl TransformerState {
    /// Rebuild the live transformer
    pub fn restore(self) -> Result<Arc<dyn Transformer>, ModelError> {
        Ok(match self {
            TransformerState::Featurizer(state) => Arc::new(Featurizer::from_state(state)),
            TransformerState::Regression(learner) => Arc::new(RegressionTransformer::from_state(learner)?),
            TransformerState::Classification(learner) => Arc::new(ClassificationTransformer::from_state(learner)?),
            TransformerState::Chain(stages) => {
                let stages = stages
                    .into_iter()
                    .map(TransformerState::restore)
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(TransformerChain::new(stages))
            }
        })
    }
}

/// Transformers applied in sequence
#[derive(Debug, Clone, Default)]
pub struct TransformerChain {
    stages: Vec<Arc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new(stages: Vec<Arc<dyn Transformer>>) -> Self {
        Self { stages }
    }

    pub fn then(mut self, stage: Arc<dyn Transformer>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Arc<dyn Transformer>] {
        &self.stages
    }
}

impl Transformer for TransformerChain {
    fn transform(&self, data: &DataFrame) -> Result<DataFrame, ModelError> {
        let mut current = data.clone();
        for stage in &self.stages {
            current = stage.transform(&current)?;
        }
        Ok(current)
    }

    fn state(&self) -> Result<TransformerState, ModelError> {
        self.stages
            .iter()
            .map(|stage| stage.state())
            .collect::<Result<Vec<_>, _>>()
            .map(TransformerState::Chain)
    }
}

/// Estimators fitted in sequence, each on the output of the previous stage
#[derive(Clone, Default)]
pub struct EstimatorChain {
    stages: Vec<Arc<dyn Estimator>>,
}

impl EstimatorChain {
    pub fn new(stages: Vec<Arc<dyn Estimator>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Estimator for EstimatorChain {
    fn fit(&self, data: &DataFrame, cancel: &CancellationToken) -> Result<Arc<dyn Transformer>, ModelError> {
        let mut fitted = Vec::with_capacity(self.stages.len());
        let mut current = data.clone();
        for (index, stage) in self.stages.iter().enumerate() {
            ModelError::check(cancel)?;
            let transformer = stage.fit(&current, cancel)?;
            if index + 1 < self.stages.len() {
                current = transformer.transform(&current)?;
            }
            fitted.push(transformer);
        }
        Ok(Arc::new(TransformerChain::new(fitted)))
    }
}
