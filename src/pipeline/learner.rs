//! Learner stages: fit a [`Model`] on the `Features`/`Label` columns and
//! append its outputs.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::data::frame::DataFrame;
use crate::data::schema::{ColumnKind, FEATURES_COLUMN, LABEL_COLUMN, PREDICTED_LABEL_COLUMN, PROBABILITIES_COLUMN, SCORE_COLUMN};
use crate::data::value::DataValue;
use crate::models::centroid::NearestCentroid;
use crate::models::linears::LinearRegression;
use crate::traits::features::FeatureVector;
use crate::traits::model::{Classifier, Model, ModelError};
use crate::traits::transform::{Estimator, LearnerState, Transformer, TransformerState};

fn feature_vectors(data: &DataFrame) -> Result<Vec<FeatureVector>, ModelError> {
    Ok(data.vectors(FEATURES_COLUMN)?.into_iter().map(FeatureVector::new).collect())
}

/// Rows with a label, as `(features, labels)`
fn labeled(data: &DataFrame) -> Result<(Vec<FeatureVector>, Vec<f32>), ModelError> {
    let label = data
        .schema()
        .index_of(LABEL_COLUMN)
        .ok_or_else(|| ModelError::Schema(format!("column '{}' not found", LABEL_COLUMN)))?;
    let rows = data.filter(|_, row| !row[label].is_missing());
    if rows.is_empty() {
        return Err(ModelError::Training("Empty training data".to_string()));
    }
    Ok((feature_vectors(&rows)?, rows.numbers(LABEL_COLUMN)?))
}

/// Fits a regression learner; its transformer appends `Score`
pub struct RegressionEstimator {
    prototype: Box<dyn Model>,
}

impl RegressionEstimator {
    pub fn new(model: impl Model + 'static) -> Self {
        Self {
            prototype: Box::new(model),
        }
    }
}

impl Estimator for RegressionEstimator {
    fn fit(&self, data: &DataFrame, cancel: &CancellationToken) -> Result<Arc<dyn Transformer>, ModelError> {
        let (features, targets) = labeled(data)?;
        let mut model = self.prototype.clone_model();
        model.train(&features, &targets, cancel)?;
        Ok(Arc::new(RegressionTransformer { model }))
    }
}

pub struct RegressionTransformer {
    model: Box<dyn Model>,
}

impl RegressionTransformer {
    pub fn from_state(state: LearnerState) -> Result<Self, ModelError> {
        match state {
            LearnerState::Linear { weights, with_bias } => Ok(Self {
                model: Box::new(LinearRegression::from_weights(weights, with_bias)?),
            }),
            other => Err(ModelError::InvalidParameter(format!(
                "{:?} is not a regression learner",
                other
            ))),
        }
    }
}

impl fmt::Debug for RegressionTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegressionTransformer").finish_non_exhaustive()
    }
}

impl Transformer for RegressionTransformer {
    fn transform(&self, data: &DataFrame) -> Result<DataFrame, ModelError> {
        let scores = self
            .model
            .predict_batch(&feature_vectors(data)?)?
            .into_iter()
            .map(DataValue::Number)
            .collect();
        data.with_column(SCORE_COLUMN, ColumnKind::Number, scores)
    }

    fn state(&self) -> Result<TransformerState, ModelError> {
        Ok(TransformerState::Regression(self.model.state()?))
    }
}

/// Fits a classifier; its transformer appends `Probabilities` and `PredictedLabel`
pub struct ClassificationEstimator {
    prototype: Box<dyn Classifier>,
}

impl ClassificationEstimator {
    pub fn new(model: impl Classifier + 'static) -> Self {
        Self {
            prototype: Box::new(model),
        }
    }
}

impl Estimator for ClassificationEstimator {
    fn fit(&self, data: &DataFrame, cancel: &CancellationToken) -> Result<Arc<dyn Transformer>, ModelError> {
        let (features, labels) = labeled(data)?;
        let mut model = self.prototype.clone_classifier();
        model.train(&features, &labels, cancel)?;
        Ok(Arc::new(ClassificationTransformer { model }))
    }
}

pub struct ClassificationTransformer {
    model: Box<dyn Classifier>,
}

impl ClassificationTransformer {
    pub fn from_state(state: LearnerState) -> Result<Self, ModelError> {
        match state {
            LearnerState::Centroid { centroids, classes } => Ok(Self {
                model: Box::new(NearestCentroid::from_parts(classes, centroids)?),
            }),
            other => Err(ModelError::InvalidParameter(format!(
                "{:?} is not a classification learner",
                other
            ))),
        }
    }
}

impl fmt::Debug for ClassificationTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationTransformer")
            .field("num_classes", &self.model.num_classes())
            .finish_non_exhaustive()
    }
}

impl Transformer for ClassificationTransformer {
    fn transform(&self, data: &DataFrame) -> Result<DataFrame, ModelError> {
        let features = feature_vectors(data)?;
        let mut probabilities = Vec::with_capacity(features.len());
        let mut predicted = Vec::with_capacity(features.len());
        for feature in &features {
            probabilities.push(DataValue::Vector(self.model.predict_proba(feature)?));
            predicted.push(DataValue::Number(self.model.predict(feature)?));
        }
        data.with_column(PROBABILITIES_COLUMN, ColumnKind::Vector, probabilities)?
            .with_classes(PROBABILITIES_COLUMN, self.model.classes())?
            .with_column(PREDICTED_LABEL_COLUMN, ColumnKind::Number, predicted)
    }

    fn state(&self) -> Result<TransformerState, ModelError> {
        Ok(TransformerState::Classification(self.model.state()?))
    }
}
