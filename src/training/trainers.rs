//! Pluggable strategies producing candidate models for the training loop.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::data::frame::DataFrame;
use crate::evaluation::metrics::Metrics;
use crate::evaluation::policy::Choice;
use crate::pipeline::pipes::ModelDefinition;
use crate::traits::model::ModelError;
use crate::traits::transform::Transformer;

/// Default number of cross-validation folds
pub const DEFAULT_NUM_FOLDS: usize = 5;
/// Default retrain bound of the cycling strategies
pub const DEFAULT_MAX_TRAINING_CYCLES: usize = 1;

/// A fitted candidate and, when the strategy measured it, its quality
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub model: Arc<dyn Transformer>,
    pub metrics: Option<Metrics>,
}

#[async_trait]
pub trait ModelTrainer: Send + Sync {
    /// Next candidate for `definition` trained on `data`; `None` when the
    /// strategy has nothing (more) to offer.
    async fn get_trained_model(
        &self,
        definition: &ModelDefinition,
        data: Arc<DataFrame>,
        cancel: &CancellationToken,
    ) -> Result<Option<TrainedModel>, ModelError>;

    /// Whether candidates keep being requested once a model is available
    fn is_cycling(&self) -> bool {
        false
    }

    /// Called when a training run begins
    fn begin(&self) {}

    /// Called when the last candidate replaced the incumbent
    fn accepted(&self) {}
}

/// Run a CPU-bound step on the blocking pool.
///
/// Returns `Cancelled` as soon as `cancel` fires; the step is then left to
/// finish on its own and its result is dropped.
pub(crate) async fn run_blocking<T, F>(cancel: &CancellationToken, step: F) -> Result<T, ModelError>
where
    F: FnOnce() -> Result<T, ModelError> + Send + 'static,
    T: Send + 'static,
{
    let step = tokio::task::spawn_blocking(step);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ModelError::Cancelled),
        joined = step => joined.map_err(|err| ModelError::Training(format!("training step failed: {}", err)))?,
    }
}

/// Fit the definition's pipes on `train` and score the result on `test`
async fn fit_and_evaluate(
    definition: &ModelDefinition,
    train: Arc<DataFrame>,
    test: Arc<DataFrame>,
    cancel: &CancellationToken,
) -> Result<Option<TrainedModel>, ModelError> {
    let definition = definition.clone();
    let token = cancel.clone();
    run_blocking(cancel, move || {
        let Some(model) = definition.fit(&train, &token)? else {
            return Ok(None);
        };
        let metrics = definition.evaluate(&model, &test, &token)?;
        Ok(Some(TrainedModel {
            model,
            metrics: Some(metrics),
        }))
    })
    .await
}

/// Bounds repeated unsuccessful retraining.
///
/// Every attempt counts; an accepted model resets the count. Once the count
/// exceeds the maximum no further attempt is allowed.
#[derive(Debug)]
pub struct RetrainCounter {
    count: AtomicUsize,
    max: usize,
}

impl RetrainCounter {
    pub fn new(max: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Register an attempt; false once the bound is exceeded
    pub fn try_attempt(&self) -> bool {
        self.count.fetch_add(1, Ordering::SeqCst) + 1 <= self.max
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Single fit on the data as loaded
#[derive(Debug, Default)]
pub struct StandardTrainer;

#[async_trait]
impl ModelTrainer for StandardTrainer {
    async fn get_trained_model(
        &self,
        definition: &ModelDefinition,
        data: Arc<DataFrame>,
        cancel: &CancellationToken,
    ) -> Result<Option<TrainedModel>, ModelError> {
        fit_and_evaluate(definition, Arc::clone(&data), data, cancel).await
    }
}

/// Fits on a row-shuffled view, with a new seed each attempt
#[derive(Debug)]
pub struct ShuffleTrainer {
    seed: AtomicU64,
    counter: RetrainCounter,
}

impl ShuffleTrainer {
    pub fn new(seed: u64) -> Self {
        Self {
            seed: AtomicU64::new(seed),
            counter: RetrainCounter::new(DEFAULT_MAX_TRAINING_CYCLES),
        }
    }

    pub fn with_max_training_cycles(mut self, max_training_cycles: usize) -> Self {
        self.counter = RetrainCounter::new(max_training_cycles);
        self
    }

    pub fn counter(&self) -> &RetrainCounter {
        &self.counter
    }
}

impl Default for ShuffleTrainer {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl ModelTrainer for ShuffleTrainer {
    async fn get_trained_model(
        &self,
        definition: &ModelDefinition,
        data: Arc<DataFrame>,
        cancel: &CancellationToken,
    ) -> Result<Option<TrainedModel>, ModelError> {
        if !self.counter.try_attempt() {
            return Ok(None);
        }
        let seed = self.seed.fetch_add(1, Ordering::SeqCst);
        let shuffled = Arc::new(run_blocking(cancel, move || Ok(data.shuffle(seed))).await?);
        fit_and_evaluate(definition, Arc::clone(&shuffled), shuffled, cancel).await
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

/// k-fold cross-validation; the best fold by the definition's policy wins
#[derive(Debug)]
pub struct CrossValidateTrainer {
    num_folds: usize,
    seed: AtomicU64,
    counter: RetrainCounter,
}

impl CrossValidateTrainer {
    pub fn new(num_folds: usize) -> Self {
        Self {
            num_folds,
            seed: AtomicU64::new(0),
            counter: RetrainCounter::new(DEFAULT_MAX_TRAINING_CYCLES),
        }
    }

    pub fn with_max_training_cycles(mut self, max_training_cycles: usize) -> Self {
        self.counter = RetrainCounter::new(max_training_cycles);
        self
    }

    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    pub fn counter(&self) -> &RetrainCounter {
        &self.counter
    }
}

impl Default for CrossValidateTrainer {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_FOLDS)
    }
}

#[async_trait]
impl ModelTrainer for CrossValidateTrainer {
    async fn get_trained_model(
        &self,
        definition: &ModelDefinition,
        data: Arc<DataFrame>,
        cancel: &CancellationToken,
    ) -> Result<Option<TrainedModel>, ModelError> {
        if !self.counter.try_attempt() {
            return Ok(None);
        }
        let seed = self.seed.fetch_add(1, Ordering::SeqCst);
        let num_folds = self.num_folds;
        let folds = run_blocking(cancel, move || data.folds(num_folds, seed)).await?;

        let mut best: Option<TrainedModel> = None;
        for (train, test) in folds {
            ModelError::check(cancel)?;
            let Some(candidate) = fit_and_evaluate(definition, Arc::new(train), Arc::new(test), cancel).await? else {
                return Ok(None);
            };
            let choice = definition.policy.best(
                best.as_ref().and_then(|model| model.metrics.as_ref()),
                candidate.metrics.as_ref(),
            );
            if choice == Choice::Candidate {
                best = Some(candidate);
            }
        }
        Ok(best)
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
