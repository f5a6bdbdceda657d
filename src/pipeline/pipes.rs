use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::data::frame::DataFrame;
use crate::evaluation::metrics::{Metrics, MetricsKind};
use crate::evaluation::policy::{BestModelPolicy, BinaryPolicy, MulticlassPolicy, RegressionPolicy};
use crate::traits::model::ModelError;
use crate::traits::transform::{Estimator, EstimatorChain, Transformer};

/// The three stages of a trainable pipeline
#[derive(Clone)]
pub struct ModelPipes {
    /// Input featurization
    pub input: Option<Arc<dyn Estimator>>,
    /// The learner
    pub trainer: Arc<dyn Estimator>,
    /// Post-processing of the learner output
    pub output: Option<Arc<dyn Estimator>>,
}

impl ModelPipes {
    pub fn new(trainer: impl Estimator + 'static) -> Self {
        Self {
            input: None,
            trainer: Arc::new(trainer),
            output: None,
        }
    }

    pub fn with_input(mut self, input: impl Estimator + 'static) -> Self {
        self.input = Some(Arc::new(input));
        self
    }

    pub fn with_output(mut self, output: impl Estimator + 'static) -> Self {
        self.output = Some(Arc::new(output));
        self
    }

    /// input -> trainer -> output as one estimator
    pub fn merged(&self) -> EstimatorChain {
        let stages = self
            .input
            .iter()
            .cloned()
            .chain(std::iter::once(Arc::clone(&self.trainer)))
            .chain(self.output.iter().cloned())
            .collect();
        EstimatorChain::new(stages)
    }
}

impl fmt::Debug for ModelPipes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPipes")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .finish_non_exhaustive()
    }
}

/// What a predictor trains and how candidates are judged
#[derive(Clone, Debug)]
pub struct ModelDefinition {
    /// `None` when the trainer strategy brings its own learners
    pub pipes: Option<ModelPipes>,
    pub metrics: MetricsKind,
    pub policy: Arc<dyn BestModelPolicy>,
}

impl ModelDefinition {
    pub fn new(pipes: Option<ModelPipes>, metrics: MetricsKind, policy: Arc<dyn BestModelPolicy>) -> Self {
        Self { pipes, metrics, policy }
    }

    pub fn regression(pipes: Option<ModelPipes>) -> Self {
        Self::new(pipes, MetricsKind::Regression, Arc::new(RegressionPolicy))
    }

    pub fn multiclass(pipes: Option<ModelPipes>) -> Self {
        Self::new(pipes, MetricsKind::Multiclass, Arc::new(MulticlassPolicy))
    }

    pub fn binary(pipes: Option<ModelPipes>) -> Self {
        Self::new(pipes, MetricsKind::Binary, Arc::new(BinaryPolicy))
    }

    pub fn with_policy(mut self, policy: Arc<dyn BestModelPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Transform `data` with `model` and score the output
    pub fn evaluate(
        &self,
        model: &Arc<dyn Transformer>,
        data: &DataFrame,
        cancel: &CancellationToken,
    ) -> Result<Metrics, ModelError> {
        ModelError::check(cancel)?;
        let output = model.transform(data)?;
        ModelError::check(cancel)?;
        self.metrics.evaluate(&output)
    }

    /// Fit the merged pipes; `None` when there is nothing to fit
    pub fn fit(&self, data: &DataFrame, cancel: &CancellationToken) -> Result<Option<Arc<dyn Transformer>>, ModelError> {
        match &self.pipes {
            Some(pipes) => pipes.merged().fit(data, cancel).map(Some),
            None => Ok(None),
        }
    }
}
