//! The retraining cycle run on the background task.
//!
//! Each run walks an explicit state machine:
//!
//! ```text
//! Initializing -> EvaluatingCurrent -> Retraining -> EvaluatingCandidate
//!                        ^                 ^  |              |
//!                        |                 |  +-> Converged  +-> Converged
//!                    Reloading <-----------+-----------------+
//! ```
//!
//! Cancellation is observed between every step and inside each blocking
//! step; a cancelled run ends in `Stopped` and leaves the last published
//! evaluator untouched.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::frame::DataFrame;
use crate::data::schema::Schema;
use crate::evaluation::evaluator::Evaluator;
use crate::evaluation::metrics::Metrics;
use crate::evaluation::policy::Choice;
use crate::pipeline::pipes::ModelDefinition;
use crate::predictor::stats::TrainingStats;
use crate::storage::data::{DataStorage, Timestamped};
use crate::storage::model::ModelStorage;
use crate::storage::training_data::TrainingData;
use crate::traits::model::ModelError;
use crate::traits::transform::Transformer;
use crate::training::config::PredictorConfig;
use crate::training::controller::{TaskResult, TrainingController};
use crate::training::events::{EventSender, TrainingEvent};
use crate::training::trainers::{run_blocking, ModelTrainer, TrainedModel};

/// Delay before announcing a fit, so passes that end quickly stay quiet
const TRAINING_NOTICE_DELAY: Duration = Duration::from_millis(250);

/// Everything a training run works with, shared with the predictor API
pub struct TrainingContext {
    pub(crate) config: PredictorConfig,
    pub(crate) definition: ModelDefinition,
    pub(crate) input_schema: Arc<Schema>,
    pub(crate) data_storage: Arc<dyn DataStorage>,
    pub(crate) model_storage: Option<Arc<dyn ModelStorage>>,
    pub(crate) training_data: Arc<TrainingData>,
    pub(crate) trainer: Arc<dyn ModelTrainer>,
    pub(crate) controller: TrainingController,
    pub(crate) events: EventSender,
    pub(crate) stats: TrainingStats,
    /// Serializes read-modify-write sequences over the buffer and the primary storage
    pub(crate) data_lock: Mutex<()>,
    /// Model storage timestamp right after this predictor's latest save
    pub(crate) saved_at: AtomicCell<SystemTime>,
}

impl TrainingContext {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Most recent change of the primary storage or the pending buffer
    pub fn data_timestamp(&self) -> SystemTime {
        self.data_storage.timestamp().max(self.training_data.timestamp())
    }

    /// Primary storage rows merged with the pending buffer
    pub fn load_data(&self) -> Result<DataFrame, ModelError> {
        let _guard = self.data_lock.lock();
        self.merged_data()
    }

    fn merged_data(&self) -> Result<DataFrame, ModelError> {
        let format = &self.config.text_format;
        let data = self.data_storage.load_data(&self.input_schema, format)?;
        if self.training_data.is_empty() {
            return Ok(data);
        }
        data.merge(&self.training_data.load_data(&self.input_schema, format)?)
    }

    /// Merge the pending buffer into the primary storage and clear it.
    /// Returns false when there was nothing to commit.
    pub fn commit(&self) -> Result<bool, ModelError> {
        {
            let _guard = self.data_lock.lock();
            if self.training_data.is_empty() {
                return Ok(false);
            }
            let merged = self.merged_data()?;
            self.data_storage.save_data(&merged, &self.config.text_format)?;
            self.training_data.clear();
        }
        self.events.emit(TrainingEvent::TrainingDataChanged);
        Ok(true)
    }

    /// Persist `model` with the input schema; no storage is a no-op
    pub fn save_model(&self, model: &Arc<dyn Transformer>) -> Result<(), ModelError> {
        if let Some(storage) = &self.model_storage {
            storage.save_model(model, &self.input_schema)?;
            self.saved_at.store(storage.timestamp());
        }
        Ok(())
    }

    /// Timestamp of a stored model written by someone else; `UNIX_EPOCH`
    /// when there is none or the latest one is our own
    pub fn foreign_model_timestamp(&self) -> SystemTime {
        match &self.model_storage {
            Some(storage) => {
                let stored = storage.timestamp();
                if stored == self.saved_at.load() {
                    SystemTime::UNIX_EPOCH
                } else {
                    stored
                }
            }
            None => SystemTime::UNIX_EPOCH,
        }
    }

    /// Stored model, provided its schema matches the input schema
    fn load_model(&self) -> Result<Option<Arc<dyn Transformer>>, ModelError> {
        let Some(storage) = &self.model_storage else {
            return Ok(None);
        };
        match storage.load_model()? {
            Some((model, schema)) => {
                self.input_schema
                    .check_consistent(&schema, "stored model schema differs from the input schema")?;
                Ok(Some(model))
            }
            None => Ok(None),
        }
    }

    /// Publish a snapshot and notify subscribers
    pub(crate) fn publish(&self, evaluator: Evaluator) -> Arc<Evaluator> {
        let evaluator = self.controller.publish(evaluator);
        if evaluator.is_available() {
            TrainingStats::increment(&self.stats.models_published);
        }
        self.events.emit(TrainingEvent::ModelChanged {
            timestamp: evaluator.timestamp(),
            has_model: evaluator.is_available(),
        });
        evaluator
    }
}

#[derive(Debug)]
enum LoopState {
    Initializing,
    Reloading,
    EvaluatingCurrent,
    Retraining,
    EvaluatingCandidate(TrainedModel),
    Converged,
    Stopped,
}

struct TrainingLoop {
    ctx: Arc<TrainingContext>,
    cancel: CancellationToken,
    data: Option<Arc<DataFrame>>,
    model: Option<Arc<dyn Transformer>>,
    /// Metrics of `model`, as measured when it was loaded or accepted
    metrics: Option<Metrics>,
    timestamp: SystemTime,
    cycle: usize,
    pending_save: Option<JoinHandle<Result<(), ModelError>>>,
}

/// Run one training loop to completion.
///
/// Cancellation ends the run with `Ok`; any other failure is logged and
/// returned, becoming the task's terminal result.
pub async fn run(ctx: Arc<TrainingContext>, cancel: CancellationToken) -> TaskResult {
    TrainingStats::increment(&ctx.stats.training_runs);
    ctx.trainer.begin();
    ctx.events.emit(TrainingEvent::TrainingStarted);
    info!(predictor = ctx.name(), "training started");

    let mut training = TrainingLoop {
        ctx: Arc::clone(&ctx),
        cancel,
        data: None,
        model: None,
        metrics: None,
        timestamp: SystemTime::UNIX_EPOCH,
        cycle: 0,
        pending_save: None,
    };
    let result = training.drive().await;
    let saved = training.finish_save().await;

    ctx.events.emit(TrainingEvent::TrainingEnded);
    info!(predictor = ctx.name(), "training ended");

    match result.and(saved) {
        Err(err) if err.is_cancelled() => {
            debug!(predictor = ctx.name(), "training cancelled");
            Ok(())
        }
        Err(err) => {
            TrainingStats::increment(&ctx.stats.training_failures);
            error!(predictor = ctx.name(), error = %err, "training failed");
            Err(err)
        }
        Ok(()) => Ok(()),
    }
}

impl TrainingLoop {
    async fn drive(&mut self) -> TaskResult {
        let mut state = LoopState::Initializing;
        loop {
            state = match state {
                LoopState::Converged => return Ok(()),
                LoopState::Stopped => return Err(ModelError::Cancelled),
                state => match self.step(state).await {
                    Err(err) if err.is_cancelled() => LoopState::Stopped,
                    other => other?,
                },
            };
        }
    }

    async fn step(&mut self, state: LoopState) -> Result<LoopState, ModelError> {
        ModelError::check(&self.cancel)?;
        match state {
            LoopState::Initializing => self.initialize().await,
            LoopState::Reloading => self.reload().await,
            LoopState::EvaluatingCurrent => self.evaluate_current().await,
            LoopState::Retraining => self.retrain().await,
            LoopState::EvaluatingCandidate(candidate) => self.evaluate_candidate(candidate).await,
            LoopState::Converged | LoopState::Stopped => Ok(state),
        }
    }

    async fn initialize(&mut self) -> Result<LoopState, ModelError> {
        let ctx = Arc::clone(&self.ctx);
        let data_timestamp = ctx.data_timestamp();

        // a published model newer than every data change stays usable
        let current = ctx.controller.evaluator();
        if current.is_available() && current.is_valid() && current.timestamp() >= data_timestamp {
            self.model = current.model().cloned();
            self.timestamp = current.timestamp();
        }

        if let Some(storage) = &ctx.model_storage {
            let stored = storage.timestamp();
            if stored >= data_timestamp && (stored > self.timestamp || self.model.is_none()) {
                info!(predictor = ctx.name(), "loading the model");
                let loader = Arc::clone(&ctx);
                match run_blocking(&self.cancel, move || loader.load_model()).await {
                    Ok(Some(model)) => {
                        info!(predictor = ctx.name(), "model loaded");
                        self.model = Some(model);
                        self.timestamp = stored;
                    }
                    Ok(None) => {}
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        warn!(predictor = ctx.name(), error = %err, "error loading the model");
                        self.model = None;
                        self.timestamp = SystemTime::UNIX_EPOCH;
                    }
                }
            }
        }
        if self.model.is_none() {
            info!(predictor = ctx.name(), "no model loaded, retrain all");
        }

        self.data = Some(self.load().await?);
        ModelError::check(&self.cancel)?;
        self.publish();

        if ctx.config.auto_commit && !ctx.training_data.is_empty() {
            info!(predictor = ctx.name(), "committing the new data");
            let committer = Arc::clone(&ctx);
            run_blocking(&self.cancel, move || committer.commit()).await?;
        }
        self.timestamp = SystemTime::now();
        Ok(LoopState::EvaluatingCurrent)
    }

    /// Pick up rows appended since the last pass
    async fn reload(&mut self) -> Result<LoopState, ModelError> {
        let ctx = Arc::clone(&self.ctx);
        if ctx.config.auto_commit && !ctx.training_data.is_empty() {
            info!(predictor = ctx.name(), "committing the new data");
            let committer = Arc::clone(&ctx);
            match run_blocking(&self.cancel, move || committer.commit()).await {
                Err(err) if !err.is_cancelled() => {
                    warn!(predictor = ctx.name(), error = %err, "error committing the data");
                }
                other => {
                    other?;
                }
            }
        }
        self.data = Some(self.load().await?);
        self.timestamp = SystemTime::now();
        Ok(LoopState::EvaluatingCurrent)
    }

    async fn evaluate_current(&mut self) -> Result<LoopState, ModelError> {
        let data = self.data()?;
        let Some(model) = self.model.clone() else {
            if data.is_empty() {
                return Err(ModelError::Training("no training data available".to_string()));
            }
            return Ok(LoopState::Retraining);
        };
        if data.is_empty() {
            return Ok(LoopState::Converged);
        }

        if self.metrics.is_none() {
            let metrics = self.evaluate(model, data).await?;
            debug!(predictor = self.ctx.name(), metrics = %metrics, "current model");
            self.metrics = Some(metrics);
        }
        if self.ctx.definition.policy.best(None, self.metrics.as_ref()) == Choice::Incumbent {
            debug!(predictor = self.ctx.name(), "no improvement possible");
            return Ok(LoopState::Converged);
        }
        Ok(LoopState::Retraining)
    }

    async fn retrain(&mut self) -> Result<LoopState, ModelError> {
        let ctx = Arc::clone(&self.ctx);
        if !ctx.trainer.is_cycling() && ctx.controller.is_available() {
            return Ok(LoopState::Converged);
        }

        let data = self.data()?;
        self.cycle += 1;
        TrainingStats::increment(&ctx.stats.training_cycles);
        ctx.events.emit(TrainingEvent::TrainingCycleStarted { cycle: self.cycle });
        debug!(predictor = ctx.name(), cycle = self.cycle, "training cycle");

        let message = if self.model.is_none() {
            "training the model"
        } else {
            "trying to find a better model"
        };
        let name = ctx.config.name.clone();
        let notice = tokio::spawn(async move {
            tokio::time::sleep(TRAINING_NOTICE_DELAY).await;
            info!(predictor = %name, "{}", message);
        });

        let started = Instant::now();
        let result = ctx
            .trainer
            .get_trained_model(&ctx.definition, data, &self.cancel)
            .await;
        notice.abort();
        let latency = usize::try_from(started.elapsed().as_micros()).unwrap_or(usize::MAX);
        ctx.stats.latest_fit_latency_us.store(latency, Ordering::SeqCst);

        match result? {
            Some(candidate) => Ok(LoopState::EvaluatingCandidate(candidate)),
            None => {
                debug!(predictor = ctx.name(), "no further candidate");
                Ok(LoopState::Converged)
            }
        }
    }

    async fn evaluate_candidate(&mut self, candidate: TrainedModel) -> Result<LoopState, ModelError> {
        let ctx = Arc::clone(&self.ctx);
        let TrainedModel { model, metrics } = candidate;
        let metrics = match metrics {
            Some(metrics) => metrics,
            None => self.evaluate(Arc::clone(&model), self.data()?).await?,
        };

        let choice = ctx.definition.policy.best(self.metrics.as_ref(), Some(&metrics));
        if choice == Choice::Incumbent && self.model.is_some() {
            TrainingStats::increment(&ctx.stats.candidates_discarded);
            info!(predictor = ctx.name(), metrics = %metrics, "the model is worse than the current one, discarded");
            return Ok(if ctx.trainer.is_cycling() {
                LoopState::Retraining
            } else {
                LoopState::Converged
            });
        }

        info!(predictor = ctx.name(), metrics = %metrics, "found suitable model");
        ctx.trainer.accepted();
        ModelError::check(&self.cancel)?;
        if ctx.config.auto_save && ctx.model_storage.is_some() {
            info!(predictor = ctx.name(), "saving the new model");
            self.save(Arc::clone(&model)).await?;
        }

        ModelError::check(&self.cancel)?;
        self.model = Some(model);
        self.metrics = Some(metrics);
        self.publish();

        Ok(if ctx.trainer.is_cycling() {
            LoopState::Reloading
        } else {
            LoopState::Converged
        })
    }

    fn data(&self) -> Result<Arc<DataFrame>, ModelError> {
        self.data
            .clone()
            .ok_or_else(|| ModelError::Training("no data loaded".to_string()))
    }

    async fn load(&self) -> Result<Arc<DataFrame>, ModelError> {
        let ctx = Arc::clone(&self.ctx);
        Ok(Arc::new(run_blocking(&self.cancel, move || ctx.load_data()).await?))
    }

    async fn evaluate(&self, model: Arc<dyn Transformer>, data: Arc<DataFrame>) -> Result<Metrics, ModelError> {
        let definition = self.ctx.definition.clone();
        let cancel = self.cancel.clone();
        run_blocking(&self.cancel, move || definition.evaluate(&model, &data, &cancel)).await
    }

    fn publish(&self) {
        let evaluator = Evaluator::new(
            self.data.clone(),
            self.model.clone(),
            Arc::clone(&self.ctx.input_schema),
            self.timestamp,
        )
        .with_metrics(self.metrics.clone());
        self.ctx.publish(evaluator);
    }

    /// Start saving `model` once the previous save, if any, is done
    async fn save(&mut self, model: Arc<dyn Transformer>) -> TaskResult {
        if let Some(previous) = self.pending_save.take() {
            join_save(previous).await?;
        }
        ModelError::check(&self.cancel)?;
        let ctx = Arc::clone(&self.ctx);
        self.pending_save = Some(tokio::task::spawn_blocking(move || ctx.save_model(&model)));
        Ok(())
    }

    async fn finish_save(&mut self) -> TaskResult {
        match self.pending_save.take() {
            Some(pending) => join_save(pending).await.inspect_err(|err| {
                error!(predictor = self.ctx.name(), error = %err, "error saving the model");
            }),
            None => Ok(()),
        }
    }
}

async fn join_save(pending: JoinHandle<Result<(), ModelError>>) -> TaskResult {
    pending
        .await
        .map_err(|err| ModelError::Storage(format!("model save failed: {}", err)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::{ColumnKind, LABEL_COLUMN};
    use crate::models::linears::LinearRegression;
    use crate::pipeline::featurizer::FeaturizerEstimator;
    use crate::pipeline::learner::RegressionEstimator;
    use crate::pipeline::pipes::ModelPipes;
    use crate::storage::data::MemoryDataStorage;
    use crate::data::text::TextFormat;
    use crate::storage::model::{FileModelStorage, MemoryModelStorage};
    use crate::pipeline::featurizer::Featurizer;
    use crate::pipeline::learner::RegressionTransformer;
    use crate::traits::transform::{LearnerState, TransformerChain};
    use crate::training::trainers::{RetrainCounter, ShuffleTrainer, StandardTrainer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::runtime::Handle;
    use tokio::sync::broadcast;

    /// Strategy whose every attempt fails
    struct FailingTrainer;

    #[async_trait]
    impl ModelTrainer for FailingTrainer {
        async fn get_trained_model(
            &self,
            _definition: &ModelDefinition,
            _data: Arc<DataFrame>,
            _cancel: &CancellationToken,
        ) -> Result<Option<TrainedModel>, ModelError> {
            Err(ModelError::Training("fit exploded".to_string()))
        }
    }

    /// Cycling strategy replaying fixed R-squared values, bounded like the shuffle trainer
    struct ScriptedTrainer {
        scores: Mutex<Vec<f64>>,
        counter: RetrainCounter,
    }

    impl ScriptedTrainer {
        fn new(scores: &[f64], max: usize) -> Self {
            Self {
                scores: Mutex::new(scores.iter().rev().copied().collect()),
                counter: RetrainCounter::new(max),
            }
        }
    }

    #[async_trait]
    impl ModelTrainer for ScriptedTrainer {
        async fn get_trained_model(
            &self,
            _definition: &ModelDefinition,
            _data: Arc<DataFrame>,
            _cancel: &CancellationToken,
        ) -> Result<Option<TrainedModel>, ModelError> {
            if !self.counter.try_attempt() {
                return Ok(None);
            }
            let Some(r_squared) = self.scores.lock().pop() else {
                return Ok(None);
            };
            scripted_candidate(r_squared).map(Some)
        }

        fn is_cycling(&self) -> bool {
            true
        }

        fn begin(&self) {
            self.counter.reset();
        }

        fn accepted(&self) {
            self.counter.reset();
        }
    }

    /// y = 2x + 1, reported with the given R-squared
    fn scripted_candidate(r_squared: f64) -> Result<TrainedModel, ModelError> {
        let model: Arc<dyn Transformer> = Arc::new(TransformerChain::new(vec![
            Arc::new(Featurizer::new(vec!["X".to_string()], Vec::new())),
            Arc::new(RegressionTransformer::from_state(LearnerState::Linear {
                weights: vec![2.0, 1.0],
                with_bias: true,
            })?),
        ]));
        let metrics = Metrics::Regression {
            mae: 0.0,
            mse: 0.0,
            rmse: 0.0,
            r_squared,
        };
        Ok(TrainedModel {
            model,
            metrics: Some(metrics),
        })
    }

    /// Cycling strategy that appends a row while fitting, then gives up
    struct AppendingTrainer {
        buffer: Arc<TrainingData>,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ModelTrainer for AppendingTrainer {
        async fn get_trained_model(
            &self,
            _definition: &ModelDefinition,
            data: Arc<DataFrame>,
            _cancel: &CancellationToken,
        ) -> Result<Option<TrainedModel>, ModelError> {
            let mut seen = self.seen.lock();
            seen.push(data.len());
            if seen.len() > 1 {
                return Ok(None);
            }
            self.buffer.append("5,11");
            scripted_candidate(0.9).map(Some)
        }

        fn is_cycling(&self) -> bool {
            true
        }
    }

    /// Primary storage that cannot be written
    struct ReadOnlyStorage(MemoryDataStorage);

    impl Timestamped for ReadOnlyStorage {
        fn timestamp(&self) -> SystemTime {
            self.0.timestamp()
        }
    }

    impl DataStorage for ReadOnlyStorage {
        fn load_data(&self, schema: &Arc<Schema>, format: &TextFormat) -> Result<DataFrame, ModelError> {
            self.0.load_data(schema, format)
        }

        fn save_data(&self, _data: &DataFrame, _format: &TextFormat) -> Result<(), ModelError> {
            Err(ModelError::Storage("read-only storage".to_string()))
        }

        fn text_rows(&self) -> Result<Vec<String>, ModelError> {
            self.0.text_rows()
        }
    }

    /// Model storage with slow writes that records overlapping saves
    #[derive(Default)]
    struct SlowModelStorage {
        active: AtomicBool,
        overlaps: AtomicUsize,
        saves: AtomicUsize,
    }

    impl Timestamped for SlowModelStorage {
        fn timestamp(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH
        }
    }

    impl ModelStorage for SlowModelStorage {
        fn load_model(&self) -> Result<Option<(Arc<dyn Transformer>, Schema)>, ModelError> {
            Ok(None)
        }

        fn save_model(&self, _model: &Arc<dyn Transformer>, _schema: &Schema) -> Result<(), ModelError> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(30));
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Passes its input through once released, flagging when it started
    #[derive(Debug, Default)]
    struct SlowTransformer {
        started: AtomicBool,
        release: AtomicBool,
    }

    impl Transformer for SlowTransformer {
        fn transform(&self, data: &DataFrame) -> Result<DataFrame, ModelError> {
            self.started.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(data.clone())
        }
    }

    /// Non-cycling strategy handing back a fixed model without metrics
    struct UnscoredTrainer(Arc<SlowTransformer>);

    #[async_trait]
    impl ModelTrainer for UnscoredTrainer {
        async fn get_trained_model(
            &self,
            _definition: &ModelDefinition,
            _data: Arc<DataFrame>,
            _cancel: &CancellationToken,
        ) -> Result<Option<TrainedModel>, ModelError> {
            let model: Arc<dyn Transformer> = self.0.clone();
            Ok(Some(TrainedModel { model, metrics: None }))
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::default()
                .with("X", ColumnKind::Number)
                .with(LABEL_COLUMN, ColumnKind::Number),
        )
    }

    fn definition() -> ModelDefinition {
        ModelDefinition::regression(Some(
            ModelPipes::new(RegressionEstimator::new(LinearRegression::new(true, 0.05, 3000)))
                .with_input(FeaturizerEstimator::new()),
        ))
    }

    fn context(
        config: PredictorConfig,
        trainer: Arc<dyn ModelTrainer>,
        data_storage: Arc<dyn DataStorage>,
        model_storage: Option<Arc<dyn ModelStorage>>,
    ) -> Arc<TrainingContext> {
        buffered_context(config, trainer, data_storage, model_storage, Arc::new(TrainingData::new()))
    }

    fn buffered_context(
        config: PredictorConfig,
        trainer: Arc<dyn ModelTrainer>,
        data_storage: Arc<dyn DataStorage>,
        model_storage: Option<Arc<dyn ModelStorage>>,
        training_data: Arc<TrainingData>,
    ) -> Arc<TrainingContext> {
        Arc::new(TrainingContext {
            config,
            definition: definition(),
            input_schema: schema(),
            data_storage,
            model_storage,
            training_data,
            trainer,
            controller: TrainingController::new(Handle::current(), Evaluator::empty(schema())),
            events: EventSender::new(),
            stats: TrainingStats::new(),
            data_lock: Mutex::new(()),
            saved_at: AtomicCell::new(SystemTime::UNIX_EPOCH),
        })
    }

    fn storage() -> Arc<MemoryDataStorage> {
        Arc::new(MemoryDataStorage::with_text("1,3\n2,5\n3,7\n4,9"))
    }

    fn drain(receiver: &mut broadcast::Receiver<TrainingEvent>) -> Vec<TrainingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_run_trains_and_publishes() {
        let ctx = context(PredictorConfig::ephemeral(), Arc::new(StandardTrainer), storage(), None);
        let mut events = ctx.events.subscribe();

        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();

        let evaluator = ctx.controller.evaluator();
        assert!(evaluator.is_available());
        assert!(evaluator.is_valid());
        assert!(ctx.controller.is_available());
        assert!(matches!(evaluator.metrics(), Some(Metrics::Regression { r_squared, .. }) if *r_squared > 0.99));

        let events = drain(&mut events);
        assert_eq!(events.first(), Some(&TrainingEvent::TrainingStarted));
        assert!(matches!(events[1], TrainingEvent::ModelChanged { has_model: false, .. }));
        assert_eq!(events[2], TrainingEvent::TrainingCycleStarted { cycle: 1 });
        assert!(matches!(events[3], TrainingEvent::ModelChanged { has_model: true, .. }));
        assert_eq!(events.last(), Some(&TrainingEvent::TrainingEnded));
        assert_eq!(ctx.stats.models_published.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_valid_model_is_kept_without_refit() {
        let ctx = context(PredictorConfig::ephemeral(), Arc::new(StandardTrainer), storage(), None);
        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();
        let first = ctx.controller.evaluator();

        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();
        let second = ctx.controller.evaluator();
        assert_eq!(ctx.stats.training_cycles.load(Ordering::SeqCst), 1);
        assert_eq!(first.timestamp(), second.timestamp());
        assert!(second.is_available());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_persisted_model_is_loaded() {
        let data = storage();
        let models = Arc::new(MemoryModelStorage::new());
        // train once to have something to persist
        let seed = context(PredictorConfig::ephemeral(), Arc::new(StandardTrainer), data.clone(), None);
        run(Arc::clone(&seed), CancellationToken::new()).await.unwrap();
        let model = seed.controller.evaluator().model().cloned().unwrap();
        models.save_model(&model, &schema()).unwrap();

        let ctx = context(PredictorConfig::ephemeral(), Arc::new(FailingTrainer), data, Some(models));
        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();
        let evaluator = ctx.controller.evaluator();
        assert!(evaluator.is_available());
        assert!(evaluator.is_valid());
        assert_eq!(ctx.stats.training_cycles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_outdated_persisted_model_is_ignored() {
        let models = Arc::new(MemoryModelStorage::new());
        let seed = context(PredictorConfig::ephemeral(), Arc::new(StandardTrainer), storage(), None);
        run(Arc::clone(&seed), CancellationToken::new()).await.unwrap();
        models
            .save_model(&seed.controller.evaluator().model().cloned().unwrap(), &schema())
            .unwrap();

        // the data changed after the model was stored
        let ctx = context(PredictorConfig::ephemeral(), Arc::new(FailingTrainer), storage(), Some(models));
        let err = run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ModelError::Training(_)));
        assert!(!ctx.controller.is_available());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auto_commit_and_auto_save() {
        let data = storage();
        let models = Arc::new(MemoryModelStorage::new());
        let ctx = context(
            PredictorConfig::persistent(),
            Arc::new(StandardTrainer),
            data.clone(),
            Some(models.clone()),
        );
        ctx.training_data.append("5,11");

        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();
        assert!(ctx.training_data.is_empty());
        assert!(data.text().contains("5,11"));
        assert!(models.load_model().unwrap().is_some());
        assert!(models.timestamp() > SystemTime::UNIX_EPOCH);
        assert!(ctx.controller.evaluator().timestamp() >= ctx.data_timestamp());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_is_returned_and_counted() {
        let ctx = context(PredictorConfig::ephemeral(), Arc::new(FailingTrainer), storage(), None);
        let mut events = ctx.events.subscribe();
        let err = run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ModelError::Training(_)));
        assert_eq!(ctx.stats.training_failures.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut events).last(), Some(&TrainingEvent::TrainingEnded));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_data_and_no_model_fails() {
        let ctx = context(
            PredictorConfig::ephemeral(),
            Arc::new(StandardTrainer),
            Arc::new(MemoryDataStorage::new()),
            None,
        );
        let err = run(ctx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ModelError::Training(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_run_is_quiet() {
        let ctx = context(PredictorConfig::ephemeral(), Arc::new(StandardTrainer), storage(), None);
        let mut events = ctx.events.subscribe();
        let cancel = CancellationToken::new();
        cancel.cancel();

        run(Arc::clone(&ctx), cancel).await.unwrap();
        assert!(!ctx.controller.is_available());
        assert_eq!(ctx.stats.training_failures.load(Ordering::SeqCst), 0);
        assert_eq!(drain(&mut events).last(), Some(&TrainingEvent::TrainingEnded));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cycling_trainer_stops_at_its_bound() {
        let trainer = Arc::new(ShuffleTrainer::new(7).with_max_training_cycles(2));
        let ctx = context(PredictorConfig::ephemeral(), trainer.clone(), storage(), None);
        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();

        assert!(ctx.controller.is_available());
        let cycles = ctx.stats.training_cycles.load(Ordering::SeqCst);
        let discarded = ctx.stats.candidates_discarded.load(Ordering::SeqCst);
        // the run ends once two candidates in a row were rejected
        assert!(cycles >= 4);
        assert!(discarded >= 2);
        assert!(trainer.counter().count() > trainer.counter().max());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retrain_counter_resets_on_acceptance() {
        // 0.5 accepted, 0.7 accepted, 0.6 rejected, then the bound of one retry is exceeded
        let trainer = Arc::new(ScriptedTrainer::new(&[0.5, 0.7, 0.6, 0.9], 1));
        let ctx = context(PredictorConfig::ephemeral(), trainer.clone(), storage(), None);
        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();

        assert_eq!(ctx.stats.models_published.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.stats.candidates_discarded.load(Ordering::SeqCst), 1);
        assert_eq!(trainer.counter.count(), 2);
        assert!(matches!(
            ctx.controller.evaluator().metrics(),
            Some(Metrics::Regression { r_squared, .. }) if (*r_squared - 0.7).abs() < 1e-12
        ));
        // the 0.9 candidate was never requested
        assert_eq!(trainer.scores.lock().len(), 1);

        // a new run starts with a fresh count
        trainer.begin();
        assert_eq!(trainer.counter.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_commit_still_trains_on_pending_rows() {
        let buffer = Arc::new(TrainingData::new());
        let trainer = Arc::new(AppendingTrainer {
            buffer: Arc::clone(&buffer),
            seen: Mutex::new(Vec::new()),
        });
        let storage = Arc::new(ReadOnlyStorage(MemoryDataStorage::with_text("1,3\n2,5\n3,7\n4,9")));
        let config = PredictorConfig::new("read-only", false, true, TextFormat::default());
        let ctx = buffered_context(config, trainer.clone(), storage, None, buffer);

        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();
        // the commit failed, so the row stays pending but the next pass still sees it
        assert_eq!(ctx.training_data.len(), 1);
        assert_eq!(*trainer.seen.lock(), vec![4, 5]);
        assert_eq!(ctx.stats.training_failures.load(Ordering::SeqCst), 0);
        assert!(ctx.controller.is_available());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_corrupt_model_file_falls_back_to_training() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let data = storage();
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&path, "{ not a model").unwrap();
        let models: Arc<dyn ModelStorage> = Arc::new(FileModelStorage::new(path.clone()));
        assert!(models.timestamp() >= data.timestamp());

        let ctx = context(PredictorConfig::ephemeral(), Arc::new(StandardTrainer), data, Some(models));
        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();
        assert!(ctx.controller.is_available());
        assert_eq!(ctx.stats.training_cycles.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.stats.training_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_saves_never_overlap() {
        let models = Arc::new(SlowModelStorage::default());
        let trainer = Arc::new(ScriptedTrainer::new(&[0.5, 0.6, 0.7], 1));
        let ctx = context(PredictorConfig::persistent(), trainer, storage(), Some(models.clone()));

        run(Arc::clone(&ctx), CancellationToken::new()).await.unwrap();
        assert_eq!(ctx.stats.models_published.load(Ordering::SeqCst), 3);
        // every save finished before the run returned, one at a time
        assert_eq!(models.saves.load(Ordering::SeqCst), 3);
        assert_eq!(models.overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_evaluation_yields_to_cancellation() {
        let slow = Arc::new(SlowTransformer::default());
        let trainer = Arc::new(UnscoredTrainer(Arc::clone(&slow)));
        let ctx = context(PredictorConfig::ephemeral(), trainer, storage(), None);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&ctx), cancel.clone()));

        while !slow.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(1), handle).await;
        slow.release.store(true, Ordering::SeqCst);

        assert!(matches!(finished, Ok(Ok(Ok(())))));
        assert!(!ctx.controller.is_available());
        assert_eq!(ctx.stats.training_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commit_merges_buffer() {
        let data = storage();
        let ctx = context(PredictorConfig::ephemeral(), Arc::new(StandardTrainer), data.clone(), None);
        assert!(!ctx.commit().unwrap());

        ctx.training_data.append("9,19");
        assert_eq!(ctx.load_data().unwrap().len(), 5);
        assert!(ctx.commit().unwrap());
        assert!(ctx.training_data.is_empty());
        assert_eq!(ctx.load_data().unwrap().len(), 5);
        assert!(data.text().contains("9,19"));
    }
}
