use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::data::frame::DataFrame;
use crate::data::schema::Schema;
use crate::evaluation::metrics::Metrics;
use crate::traits::transform::Transformer;

/// Snapshot of the currently usable trained state.
///
/// Never mutated once published: the training loop replaces the whole
/// snapshot, so a prediction holding an `Arc<Evaluator>` keeps a consistent
/// view while a newer one is published.
#[derive(Clone)]
pub struct Evaluator {
    data: Option<Arc<DataFrame>>,
    model: Option<Arc<dyn Transformer>>,
    input_schema: Arc<Schema>,
    timestamp: SystemTime,
    metrics: Option<Metrics>,
}

impl Evaluator {
    pub fn new(
        data: Option<Arc<DataFrame>>,
        model: Option<Arc<dyn Transformer>>,
        input_schema: Arc<Schema>,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            data,
            model,
            input_schema,
            timestamp,
            metrics: None,
        }
    }

    /// No data, no model, invalid timestamp
    pub fn empty(input_schema: Arc<Schema>) -> Self {
        Self::new(None, None, input_schema, SystemTime::UNIX_EPOCH)
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Same snapshot with the timestamp zeroed, so it reads as stale
    pub fn invalidated(&self) -> Self {
        Self {
            timestamp: SystemTime::UNIX_EPOCH,
            ..self.clone()
        }
    }

    pub fn data(&self) -> Option<&Arc<DataFrame>> {
        self.data.as_ref()
    }

    pub fn model(&self) -> Option<&Arc<dyn Transformer>> {
        self.model.as_ref()
    }

    pub fn input_schema(&self) -> &Arc<Schema> {
        &self.input_schema
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Only snapshots holding a model may serve predictions
    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_valid(&self) -> bool {
        self.timestamp > SystemTime::UNIX_EPOCH
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("rows", &self.data.as_ref().map(|data| data.len()))
            .field("model", &self.model)
            .field("timestamp", &self.timestamp)
            .field("metrics", &self.metrics)
            .finish()
    }
}
