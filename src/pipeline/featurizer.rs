//! Input featurization: turns the input columns into a dense `Features`
//! vector the learners consume.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::data::frame::DataFrame;
use crate::data::schema::{ColumnKind, FEATURES_COLUMN, LABEL_COLUMN};
use crate::data::value::DataValue;
use crate::traits::model::ModelError;
use crate::traits::transform::{Estimator, Transformer, TransformerState};

/// Learned featurization parameters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeaturizerState {
    /// Numeric, boolean or vector columns copied into the features
    pub numeric: Vec<String>,
    /// Text columns one-hot encoded against their vocabulary
    pub categorical: Vec<(String, Vec<String>)>,
}

/// Appends the `Features` column.
///
/// Missing numbers become 0, unknown categories encode as all zeros.
#[derive(Debug, Clone)]
pub struct Featurizer {
    state: FeaturizerState,
}

impl Featurizer {
    pub fn new(numeric: Vec<String>, categorical: Vec<(String, Vec<String>)>) -> Self {
        Self {
            state: FeaturizerState { numeric, categorical },
        }
    }

    pub fn from_state(state: FeaturizerState) -> Self {
        Self { state }
    }

    /// Length of the produced feature vector, vector columns excluded
    pub fn scalar_dimension(&self) -> usize {
        self.state.numeric.len() + self.state.categorical.iter().map(|(_, vocab)| vocab.len()).sum::<usize>()
    }

    fn features(&self, data: &DataFrame, row: usize) -> Result<Vec<f32>, ModelError> {
        let mut features = Vec::with_capacity(self.scalar_dimension());
        for name in &self.state.numeric {
            match data.value(row, name) {
                Some(DataValue::Vector(values)) => features.extend(values),
                Some(DataValue::Missing) => features.push(0.0),
                Some(value) => features.push(value.as_number().ok_or_else(|| {
                    ModelError::Validation(format!("column '{}' holds non-numeric value {:?}", name, value))
                })?),
                None => return Err(ModelError::Schema(format!("column '{}' not found", name))),
            }
        }
        for (name, vocabulary) in &self.state.categorical {
            let value = data
                .value(row, name)
                .ok_or_else(|| ModelError::Schema(format!("column '{}' not found", name)))?;
            let text = value.as_text();
            features.extend(
                vocabulary
                    .iter()
                    .map(|term| if Some(term.as_str()) == text { 1.0 } else { 0.0 }),
            );
        }
        Ok(features)
    }
}

impl Transformer for Featurizer {
    fn transform(&self, data: &DataFrame) -> Result<DataFrame, ModelError> {
        let values = (0..data.len())
            .map(|row| self.features(data, row).map(DataValue::Vector))
            .collect::<Result<Vec<_>, _>>()?;
        data.with_column(FEATURES_COLUMN, ColumnKind::Vector, values)
    }

    fn state(&self) -> Result<TransformerState, ModelError> {
        Ok(TransformerState::Featurizer(self.state.clone()))
    }
}

/// Learns the categorical vocabularies from the training data
#[derive(Debug, Clone, Default)]
pub struct FeaturizerEstimator {
    /// Restrict to these columns; `None` uses every column except the label
    columns: Option<Vec<String>>,
}

impl FeaturizerEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: Some(columns.into_iter().map(Into::into).collect()),
        }
    }
}

impl Estimator for FeaturizerEstimator {
    fn fit(&self, data: &DataFrame, cancel: &CancellationToken) -> Result<Arc<dyn Transformer>, ModelError> {
        let schema = data.schema();
        let selected: Vec<_> = match &self.columns {
            Some(names) => names
                .iter()
                .map(|name| {
                    schema
                        .column(name)
                        .ok_or_else(|| ModelError::Schema(format!("column '{}' not found", name)))
                })
                .collect::<Result<Vec<_>, ModelError>>()?,
            None => schema
                .columns()
                .iter()
                .filter(|column| column.name != LABEL_COLUMN && column.name != FEATURES_COLUMN)
                .collect(),
        };

        let mut numeric = Vec::new();
        let mut categorical = Vec::new();
        for column in selected {
            ModelError::check(cancel)?;
            match column.kind {
                ColumnKind::Text => {
                    let vocabulary: BTreeSet<String> = data
                        .column(&column.name)?
                        .into_iter()
                        .filter_map(|value| value.as_text().map(str::to_string))
                        .collect();
                    categorical.push((column.name.clone(), vocabulary.into_iter().collect()));
                }
                ColumnKind::Number | ColumnKind::Boolean | ColumnKind::Vector => numeric.push(column.name.clone()),
            }
        }
        Ok(Arc::new(Featurizer::new(numeric, categorical)))
    }
}
