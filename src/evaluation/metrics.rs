//! Quality metrics computed from a transformer's output columns against the
//! `Label` column.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::frame::DataFrame;
use crate::data::schema::{LABEL_COLUMN, PREDICTED_LABEL_COLUMN, PROBABILITIES_COLUMN, SCORE_COLUMN};
use crate::traits::model::ModelError;

/// Probabilities are clamped to this before taking logs
const PROBABILITY_EPSILON: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metrics {
    Regression {
        mae: f64,
        mse: f64,
        rmse: f64,
        r_squared: f64,
    },
    Multiclass {
        micro_accuracy: f64,
        macro_accuracy: f64,
        log_loss: f64,
    },
    Binary {
        accuracy: f64,
        /// Present only for calibrated (probability producing) models
        log_loss: Option<f64>,
    },
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metrics::Regression { mae, mse, rmse, r_squared } => write!(
                f,
                "R2 {:.4} | MAE {:.4} | MSE {:.4} | RMSE {:.4}",
                r_squared, mae, mse, rmse
            ),
            Metrics::Multiclass {
                micro_accuracy,
                macro_accuracy,
                log_loss,
            } => write!(
                f,
                "Accuracy {:.4} (macro {:.4}) | LogLoss {:.4}",
                micro_accuracy, macro_accuracy, log_loss
            ),
            Metrics::Binary {
                accuracy,
                log_loss: Some(log_loss),
            } => write!(f, "Accuracy {:.4} | LogLoss {:.4}", accuracy, log_loss),
            Metrics::Binary { accuracy, log_loss: None } => write!(f, "Accuracy {:.4}", accuracy),
        }
    }
}

/// Which metric computation a model kind uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsKind {
    Regression,
    Multiclass,
    Binary,
}

impl MetricsKind {
    /// Score transformed `output` (rows without a label are ignored)
    pub fn evaluate(&self, output: &DataFrame) -> Result<Metrics, ModelError> {
        let label = output
            .schema()
            .index_of(LABEL_COLUMN)
            .ok_or_else(|| ModelError::Schema(format!("column '{}' not found", LABEL_COLUMN)))?;
        let output = output.filter(|_, row| !row[label].is_missing());
        if output.is_empty() {
            return Err(ModelError::Validation("Empty validation data".to_string()));
        }
        match self {
            MetricsKind::Regression => regression(&output),
            MetricsKind::Multiclass => multiclass(&output),
            MetricsKind::Binary => binary(&output),
        }
    }
}

fn regression(output: &DataFrame) -> Result<Metrics, ModelError> {
    let labels = output.numbers(LABEL_COLUMN)?;
    let scores = output.numbers(SCORE_COLUMN)?;
    let n = labels.len() as f64;

    let mean = labels.iter().map(|&y| y as f64).sum::<f64>() / n;
    let mut abs_error = 0.0;
    let mut squared_error = 0.0;
    let mut total = 0.0;
    for (&y, &score) in labels.iter().zip(&scores) {
        let error = score as f64 - y as f64;
        abs_error += error.abs();
        squared_error += error * error;
        total += (y as f64 - mean).powi(2);
    }

    let mse = squared_error / n;
    // constant labels: a perfect fit explains everything, anything else nothing
    let r_squared = if total > 0.0 {
        1.0 - squared_error / total
    } else if squared_error < 1e-12 {
        1.0
    } else {
        0.0
    };
    Ok(Metrics::Regression {
        mae: abs_error / n,
        mse,
        rmse: mse.sqrt(),
        r_squared,
    })
}

fn class_of(label: f32) -> Result<usize, ModelError> {
    if label < 0.0 || label.fract() != 0.0 {
        return Err(ModelError::Validation(format!(
            "class labels must be non-negative integers, got {}",
            label
        )));
    }
    Ok(label as usize)
}

/// Probability slot of each class; without recorded slot classes the
/// vector is indexed by class
struct Slots(Option<Vec<usize>>);

impl Slots {
    fn of(output: &DataFrame) -> Self {
        Slots(output.schema().column(PROBABILITIES_COLUMN).and_then(|c| c.classes.clone()))
    }

    fn log_probability(&self, probabilities: &[f32], class: usize) -> f64 {
        let slot = match &self.0 {
            Some(classes) => classes.iter().position(|c| *c == class),
            None => Some(class),
        };
        let p = slot.and_then(|slot| probabilities.get(slot)).copied().unwrap_or(0.0) as f64;
        p.clamp(PROBABILITY_EPSILON, 1.0).ln()
    }
}

fn multiclass(output: &DataFrame) -> Result<Metrics, ModelError> {
    let labels = output.numbers(LABEL_COLUMN)?;
    let predicted = output.numbers(PREDICTED_LABEL_COLUMN)?;
    let probabilities = output.vectors(PROBABILITIES_COLUMN)?;
    let slots = Slots::of(output);

    // per class: (correct, total)
    let mut per_class: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    let mut correct = 0usize;
    let mut log_loss = 0.0;
    for ((&label, &prediction), probs) in labels.iter().zip(&predicted).zip(&probabilities) {
        let class = class_of(label)?;
        let hit = prediction == label;
        let entry = per_class.entry(class).or_default();
        entry.1 += 1;
        if hit {
            entry.0 += 1;
            correct += 1;
        }
        log_loss -= slots.log_probability(probs, class);
    }

    let n = labels.len() as f64;
    let macro_accuracy =
        per_class.values().map(|(hit, total)| *hit as f64 / *total as f64).sum::<f64>() / per_class.len() as f64;
    Ok(Metrics::Multiclass {
        micro_accuracy: correct as f64 / n,
        macro_accuracy,
        log_loss: log_loss / n,
    })
}

fn binary(output: &DataFrame) -> Result<Metrics, ModelError> {
    let labels = output.numbers(LABEL_COLUMN)?;
    let predicted = output.numbers(PREDICTED_LABEL_COLUMN)?;
    let n = labels.len() as f64;

    let correct = labels
        .iter()
        .zip(&predicted)
        .filter(|(label, prediction)| (**label > 0.5) == (**prediction > 0.5))
        .count();

    let log_loss = if output.schema().index_of(PROBABILITIES_COLUMN).is_some() {
        let probabilities = output.vectors(PROBABILITIES_COLUMN)?;
        let slots = Slots::of(output);
        let total: f64 = labels
            .iter()
            .zip(&probabilities)
            .map(|(label, probs)| -slots.log_probability(probs, usize::from(*label > 0.5)))
            .sum();
        Some(total / n)
    } else {
        None
    };

    Ok(Metrics::Binary {
        accuracy: correct as f64 / n,
        log_loss,
    })
}
