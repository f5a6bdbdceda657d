use serde::{Deserialize, Serialize};

use crate::data::text::TextFormat;
use crate::traits::model::ModelError;

/// Configuration for a continuously retrained predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Name used in log lines
    pub name: String,
    /// Persist every improved model to the model storage
    pub auto_save: bool,
    /// Merge the pending training data into the primary storage when training starts
    pub auto_commit: bool,
    /// Format of the stored text rows and of prediction input
    pub text_format: TextFormat,
    /// Default duplicate filtering for added training rows
    pub check_duplicates: bool,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            name: "predictor".to_string(),
            auto_save: true,
            auto_commit: true,
            text_format: TextFormat::default(),
            check_duplicates: false,
        }
    }
}

impl PredictorConfig {
    /// Create a new configuration with custom values
    pub fn new(name: impl Into<String>, auto_save: bool, auto_commit: bool, text_format: TextFormat) -> Self {
        Self {
            name: name.into(),
            auto_save,
            auto_commit,
            text_format,
            ..Default::default()
        }
    }

    /// Saves improved models and commits new data
    pub fn persistent() -> Self {
        Self::default()
    }

    /// Nothing is written back to the storages (useful for testing)
    pub fn ephemeral() -> Self {
        Self {
            auto_save: false,
            auto_commit: false,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Load from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }
}
