//! Prediction entry point backed by continuous background retraining.
//!
//! A prediction first checks whether the published model is older than the
//! training data. If so (or if nothing is training and no model is
//! available) a training run is started without awaiting it, and the call
//! waits for the evaluation gate instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::data::frame::DataFrame;
use crate::data::schema::Schema;
use crate::data::text::TextFormat;
use crate::evaluation::evaluator::Evaluator;
use crate::pipeline::pipes::ModelDefinition;
use crate::predictor::stats::TrainingStats;
use crate::storage::data::{DataStorage, MemoryDataStorage};
use crate::storage::model::ModelStorage;
use crate::storage::training_data::TrainingData;
use crate::traits::model::ModelError;
use crate::training::config::PredictorConfig;
use crate::training::controller::{TaskResult, TrainingController, TrainingTask};
use crate::training::events::{EventSender, TrainingEvent};
use crate::training::trainers::{run_blocking, ModelTrainer, StandardTrainer};
use crate::training::training_loop::{self, TrainingContext};

/// Configures a [`Predictor`]
pub struct PredictorBuilder {
    definition: ModelDefinition,
    input_schema: Arc<Schema>,
    config: PredictorConfig,
    data_storage: Option<Arc<dyn DataStorage>>,
    model_storage: Option<Arc<dyn ModelStorage>>,
    trainer: Option<Arc<dyn ModelTrainer>>,
    runtime: Option<Handle>,
}

impl PredictorBuilder {
    pub fn with_config(mut self, config: PredictorConfig) -> Self {
        self.config = config;
        self
    }

    /// Primary training data; an empty in-memory storage by default
    pub fn with_data_storage(mut self, storage: Arc<dyn DataStorage>) -> Self {
        self.data_storage = Some(storage);
        self
    }

    pub fn with_model_storage(mut self, storage: Arc<dyn ModelStorage>) -> Self {
        self.model_storage = Some(storage);
        self
    }

    /// Strategy producing candidates; [`StandardTrainer`] by default
    pub fn with_trainer(mut self, trainer: Arc<dyn ModelTrainer>) -> Self {
        self.trainer = Some(trainer);
        self
    }

    /// Runtime the training task is spawned on; the current one by default
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Predictor, ModelError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|_| ModelError::InvalidParameter("no tokio runtime available".to_string()))?,
        };
        let input_schema = self.input_schema;
        let inner = TrainingContext {
            config: self.config,
            definition: self.definition,
            input_schema: Arc::clone(&input_schema),
            data_storage: self
                .data_storage
                .unwrap_or_else(|| Arc::new(MemoryDataStorage::new())),
            model_storage: self.model_storage,
            training_data: Arc::new(TrainingData::new()),
            trainer: self.trainer.unwrap_or_else(|| Arc::new(StandardTrainer)),
            controller: TrainingController::new(runtime.clone(), Evaluator::empty(input_schema)),
            events: EventSender::new(),
            stats: TrainingStats::new(),
            data_lock: Mutex::new(()),
            saved_at: AtomicCell::new(SystemTime::UNIX_EPOCH),
        };
        Ok(Predictor {
            inner: Arc::new(inner),
            shutdown: CancellationToken::new(),
            runtime,
        })
    }
}

/// A model kept up to date with its training data.
///
/// Dropping the predictor cancels any training still running.
pub struct Predictor {
    inner: Arc<TrainingContext>,
    /// Parent scope of every training run
    shutdown: CancellationToken,
    runtime: Handle,
}

impl Predictor {
    pub fn builder(definition: ModelDefinition, input_schema: Arc<Schema>) -> PredictorBuilder {
        PredictorBuilder {
            definition,
            input_schema,
            config: PredictorConfig::default(),
            data_storage: None,
            model_storage: None,
            trainer: None,
            runtime: None,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn input_schema(&self) -> &Arc<Schema> {
        &self.inner.input_schema
    }

    pub fn text_format(&self) -> &TextFormat {
        &self.inner.config.text_format
    }

    /// Transform text rows with the current model, (re)training first when
    /// the model is out of date.
    ///
    /// Fails with the training error when no model could be produced, and
    /// with `Cancelled` when `cancel` fires first.
    pub async fn predict(&self, input: &str, cancel: &CancellationToken) -> Result<DataFrame, ModelError> {
        let result = self.try_predict(input, cancel).await;
        match &result {
            Ok(_) => TrainingStats::increment(&self.inner.stats.predictions),
            Err(err) => {
                TrainingStats::increment(&self.inner.stats.prediction_errors);
                debug!(predictor = self.name(), error = %err, "prediction failed");
            }
        }
        result
    }

    /// Blocking form of [`predict`](Self::predict); must not be called
    /// from within the runtime's own worker threads.
    pub fn predict_blocking(&self, input: &str) -> Result<DataFrame, ModelError> {
        self.runtime.block_on(self.predict(input, &CancellationToken::new()))
    }

    async fn try_predict(&self, input: &str, cancel: &CancellationToken) -> Result<DataFrame, ModelError> {
        if self.is_stale() {
            self.ensure_training();
        }
        let evaluator = self.inner.controller.wait_for_evaluation(cancel).await?;
        let model = evaluator
            .model()
            .ok_or_else(|| ModelError::Prediction("no model available".to_string()))?;
        let data = self
            .inner
            .config
            .text_format
            .rows_only()
            .parse(input, evaluator.input_schema())?;
        model.transform(&data)
    }

    /// Data or a stored model newer than the published model, or nothing
    /// usable and nothing training
    fn is_stale(&self) -> bool {
        let controller = &self.inner.controller;
        let published = controller.evaluator().timestamp();
        self.inner.data_timestamp() > published
            || self.inner.foreign_model_timestamp() > published
            || (!controller.is_training() && !controller.is_available())
    }

    fn ensure_training(&self) -> TrainingTask {
        let inner = Arc::clone(&self.inner);
        self.inner
            .controller
            .ensure_started(&self.shutdown, move |cancel| training_loop::run(inner, cancel))
    }

    /// Start training (or join the run in progress) and wait for it to end.
    /// Cancelling `cancel` cancels the run.
    pub async fn start_training(&self, cancel: &CancellationToken) -> TaskResult {
        let task = self.ensure_training();
        tokio::select! {
            result = task.completion() => result,
            _ = cancel.cancelled() => {
                task.cancel();
                Err(ModelError::Cancelled)
            }
        }
    }

    /// Cancel the run in progress and wait for it to wind down. Cancelling
    /// `cancel` only gives up the wait.
    pub async fn stop_training(&self, cancel: &CancellationToken) -> TaskResult {
        self.inner.controller.stop_training(cancel).await
    }

    /// Queue text rows for the next training run; returns how many were
    /// added. With `check_duplicates`, rows already present in the primary
    /// storage, the pending buffer or earlier in `text` are skipped.
    ///
    /// Any running training is stopped and the evaluation invalidated
    /// before this returns.
    pub async fn add_training_data(&self, text: &str, check_duplicates: bool) -> Result<usize, ModelError> {
        let rows = if check_duplicates {
            let inner = Arc::clone(&self.inner);
            let text = text.to_string();
            run_blocking(&self.shutdown, move || unseen_rows(&inner, &text)).await?
        } else {
            text.lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()
        };
        if rows.is_empty() {
            return Ok(0);
        }

        self.inner.controller.halt().await;
        self.inner.controller.invalidate();
        {
            let _guard = self.inner.data_lock.lock();
            self.inner.training_data.append(&rows.join("\n"));
        }
        self.inner.events.emit(TrainingEvent::TrainingDataChanged);
        debug!(predictor = self.name(), rows = rows.len(), "training data added");
        Ok(rows.len())
    }

    /// Queue one row given as field values
    pub async fn add_training_row<S: AsRef<str>>(&self, values: &[S]) -> Result<usize, ModelError> {
        let row = self.inner.config.text_format.format_row(values);
        self.add_training_data(&row, self.inner.config.check_duplicates).await
    }

    /// Drop every pending row
    pub async fn clear_training_data(&self) {
        self.inner.controller.halt().await;
        self.inner.controller.invalidate();
        {
            let _guard = self.inner.data_lock.lock();
            self.inner.training_data.clear();
        }
        self.inner.events.emit(TrainingEvent::TrainingDataChanged);
    }

    /// Number of rows waiting to be committed
    pub fn pending_rows(&self) -> usize {
        self.inner.training_data.len()
    }

    /// Merge the pending rows into the primary storage
    pub async fn commit(&self) -> Result<bool, ModelError> {
        let inner = Arc::clone(&self.inner);
        run_blocking(&self.shutdown, move || inner.commit()).await
    }

    /// Stop training and publish a snapshot without a model
    pub async fn clear_model(&self) {
        self.inner.controller.halt().await;
        self.inner.publish(Evaluator::new(
            None,
            None,
            Arc::clone(&self.inner.input_schema),
            SystemTime::UNIX_EPOCH,
        ));
    }

    /// Persist the current model to the model storage
    pub async fn save_model(&self) -> Result<(), ModelError> {
        if self.inner.model_storage.is_none() {
            return Err(ModelError::Storage("no model storage configured".to_string()));
        }
        let model = self
            .inner
            .controller
            .evaluator()
            .model()
            .cloned()
            .ok_or_else(|| ModelError::Storage("no model to save".to_string()))?;
        let inner = Arc::clone(&self.inner);
        run_blocking(&self.shutdown, move || inner.save_model(&model)).await
    }

    /// Current evaluation snapshot
    pub fn evaluator(&self) -> Arc<Evaluator> {
        self.inner.controller.evaluator()
    }

    pub fn is_evaluation_available(&self) -> bool {
        self.inner.controller.is_available()
    }

    pub fn is_training(&self) -> bool {
        self.inner.controller.is_training()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrainingEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> &TrainingStats {
        &self.inner.stats
    }
}

impl Drop for Predictor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Rows of `text` not yet in the primary storage, the pending buffer or
/// earlier in `text`; fields are compared trimmed and unquoted
fn unseen_rows(inner: &TrainingContext, text: &str) -> Result<Vec<String>, ModelError> {
    let separator = inner.config.text_format.separator;
    let normalize = |line: &str| -> String {
        line.split(separator)
            .map(|field| field.trim().trim_matches('"'))
            .collect::<Vec<_>>()
            .join(&separator.to_string())
    };

    let _guard = inner.data_lock.lock();
    let mut known: HashSet<String> = inner
        .data_storage
        .text_rows()?
        .into_iter()
        .chain(inner.training_data.text_rows()?)
        .map(|line| normalize(&line))
        .collect();
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| known.insert(normalize(line)))
        .map(str::to_string)
        .collect())
}
