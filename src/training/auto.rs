//! Automatic search over candidate learners.
//!
//! A background producer fits the candidates one after the other within a
//! time budget and queues every fitted model; the training loop consumes
//! them as they arrive instead of waiting for the whole search.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::data::frame::DataFrame;
use crate::pipeline::pipes::ModelDefinition;
use crate::traits::model::ModelError;
use crate::traits::transform::{Estimator, EstimatorChain, Transformer, TransformerChain};
use crate::training::gate::Gate;
use crate::training::trainers::{run_blocking, ModelTrainer, TrainedModel};

/// Default search budget
pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(60);

struct AutoSearch {
    /// Fitted candidates in arrival order; `None` marks the end of the search
    queue: Mutex<VecDeque<Option<Arc<dyn Transformer>>>>,
    ready: Gate,
    cancel: CancellationToken,
}

impl AutoSearch {
    fn push(&self, item: Option<Arc<dyn Transformer>>) {
        let mut queue = self.queue.lock();
        queue.push_back(item);
        self.ready.set();
    }

    /// Next queued item, `None` when the queue is momentarily empty
    fn pop(&self) -> Option<Option<Arc<dyn Transformer>>> {
        let mut queue = self.queue.lock();
        let item = match queue.front() {
            // the end marker stays so later calls see it too
            Some(None) => Some(None),
            Some(Some(_)) => queue.pop_front(),
            None => None,
        };
        if queue.is_empty() {
            self.ready.reset();
        }
        item
    }
}

pub struct AutoTrainer {
    candidates: Vec<Arc<dyn Estimator>>,
    max_time: Duration,
    search: Mutex<Option<Arc<AutoSearch>>>,
}

impl AutoTrainer {
    pub fn new(max_time: Duration) -> Self {
        Self {
            candidates: Vec::new(),
            max_time,
            search: Mutex::new(None),
        }
    }

    pub fn with_candidate(mut self, candidate: impl Estimator + 'static) -> Self {
        self.candidates.push(Arc::new(candidate));
        self
    }

    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    /// Current search, launching one on first use
    fn search(&self, definition: &ModelDefinition, data: &Arc<DataFrame>, cancel: &CancellationToken) -> Arc<AutoSearch> {
        let mut slot = self.search.lock();
        if let Some(search) = slot.as_ref() {
            return Arc::clone(search);
        }

        let search = Arc::new(AutoSearch {
            queue: Mutex::new(VecDeque::new()),
            ready: Gate::new(),
            cancel: cancel.child_token(),
        });
        let input = definition.pipes.as_ref().and_then(|pipes| pipes.input.clone());
        let pipelines: Vec<EstimatorChain> = self
            .candidates
            .iter()
            .map(|candidate| EstimatorChain::new(input.iter().cloned().chain([Arc::clone(candidate)]).collect()))
            .collect();

        let producer = Arc::clone(&search);
        let data = Arc::clone(data);
        let max_time = self.max_time;
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            for (index, pipeline) in pipelines.iter().enumerate() {
                if producer.cancel.is_cancelled() || started.elapsed() >= max_time {
                    break;
                }
                match pipeline.fit(&data, &producer.cancel) {
                    Ok(model) => {
                        debug!(candidate = index, "search produced a candidate");
                        producer.push(Some(model));
                    }
                    Err(err) if err.is_cancelled() => break,
                    Err(err) => warn!(candidate = index, error = %err, "search candidate failed"),
                }
            }
            producer.push(None);
        });

        *slot = Some(Arc::clone(&search));
        search
    }

    fn end_search(&self) {
        if let Some(search) = self.search.lock().take() {
            search.cancel.cancel();
        }
    }
}

impl Drop for AutoTrainer {
    fn drop(&mut self) {
        self.end_search();
    }
}

/// Chain `model` with the definition's output pipe, fitted on the first
/// transformed row
fn with_output(
    definition: &ModelDefinition,
    model: Arc<dyn Transformer>,
    data: &DataFrame,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Transformer>, ModelError> {
    let Some(output) = definition.pipes.as_ref().and_then(|pipes| pipes.output.as_ref()) else {
        return Ok(model);
    };
    let sample = model.transform(&data.first_row())?;
    let output = output.fit(&sample, cancel)?;
    Ok(Arc::new(TransformerChain::new(vec![model, output])))
}

#[async_trait]
impl ModelTrainer for AutoTrainer {
    async fn get_trained_model(
        &self,
        definition: &ModelDefinition,
        data: Arc<DataFrame>,
        cancel: &CancellationToken,
    ) -> Result<Option<TrainedModel>, ModelError> {
        let search = self.search(definition, &data, cancel);

        let model = loop {
            tokio::select! {
                _ = search.ready.wait() => {}
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            }
            match search.pop() {
                Some(Some(model)) => break model,
                Some(None) => return Ok(None),
                None => continue,
            }
        };

        let definition = definition.clone();
        let token = cancel.clone();
        run_blocking(cancel, move || {
            let model = with_output(&definition, model, &data, &token)?;
            let metrics = definition.evaluate(&model, &data, &token)?;
            Ok(Some(TrainedModel {
                model,
                metrics: Some(metrics),
            }))
        })
        .await
    }

    fn is_cycling(&self) -> bool {
        true
    }

    /// Each run searches afresh
    fn begin(&self) {
        self.end_search();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::{ColumnKind, Schema, LABEL_COLUMN, SCORE_COLUMN};
    use crate::data::text::TextFormat;
    use crate::data::value::DataValue;
    use crate::evaluation::metrics::Metrics;
    use crate::models::linears::LinearRegression;
    use crate::models::ridge::RidgeRegression;
    use crate::pipeline::featurizer::FeaturizerEstimator;
    use crate::pipeline::learner::RegressionEstimator;
    use crate::pipeline::pipes::ModelPipes;

    /// Output stage doubling the score
    #[derive(Debug)]
    struct Doubler;

    impl Transformer for Doubler {
        fn transform(&self, data: &DataFrame) -> Result<DataFrame, ModelError> {
            let values = data
                .numbers(SCORE_COLUMN)?
                .into_iter()
                .map(|v| DataValue::Number(2.0 * v))
                .collect();
            data.with_column(SCORE_COLUMN, ColumnKind::Number, values)
        }
    }

    struct DoublerEstimator;

    impl Estimator for DoublerEstimator {
        fn fit(&self, data: &DataFrame, _cancel: &CancellationToken) -> Result<Arc<dyn Transformer>, ModelError> {
            // fitted on a single transformed row
            assert_eq!(data.len(), 1);
            assert!(data.schema().index_of(SCORE_COLUMN).is_some());
            Ok(Arc::new(Doubler))
        }
    }

    fn data() -> Arc<DataFrame> {
        let schema = Arc::new(
            Schema::default()
                .with("X", ColumnKind::Number)
                .with(LABEL_COLUMN, ColumnKind::Number),
        );
        Arc::new(TextFormat::default().parse("1,3\n2,5\n3,7\n4,9", &schema).unwrap())
    }

    fn definition() -> ModelDefinition {
        // the learner here is ignored; the search supplies its own
        ModelDefinition::regression(Some(
            ModelPipes::new(RegressionEstimator::new(LinearRegression::default())).with_input(FeaturizerEstimator::new()),
        ))
    }

    fn trainer() -> AutoTrainer {
        AutoTrainer::new(DEFAULT_MAX_TIME)
            .with_candidate(RegressionEstimator::new(LinearRegression::new(true, 0.05, 3000)))
            .with_candidate(RegressionEstimator::new(RidgeRegression::new(true, 0.5, 0.05, 3000)))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streams_each_candidate_then_ends() {
        let trainer = trainer();
        let cancel = CancellationToken::new();
        trainer.begin();

        let mut produced = 0;
        while let Some(candidate) = trainer.get_trained_model(&definition(), data(), &cancel).await.unwrap() {
            assert!(matches!(candidate.metrics, Some(Metrics::Regression { .. })));
            produced += 1;
        }
        assert_eq!(produced, 2);
        // the end of the search is sticky
        assert!(trainer.get_trained_model(&definition(), data(), &cancel).await.unwrap().is_none());
        assert!(trainer.is_cycling());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_output_pipe_wraps_candidates() {
        let pipes = ModelPipes::new(RegressionEstimator::new(LinearRegression::default()))
            .with_input(FeaturizerEstimator::new())
            .with_output(DoublerEstimator);
        let definition = ModelDefinition::regression(Some(pipes));

        let trainer = AutoTrainer::new(DEFAULT_MAX_TIME)
            .with_candidate(RegressionEstimator::new(LinearRegression::new(true, 0.05, 3000)));
        let candidate = trainer
            .get_trained_model(&definition, data(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        let scores = candidate.model.transform(&data()).unwrap().numbers(SCORE_COLUMN).unwrap();
        assert!((scores[0] - 6.0).abs() < 0.2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_budget_yields_nothing() {
        let trainer = AutoTrainer::new(Duration::ZERO)
            .with_candidate(RegressionEstimator::new(LinearRegression::new(true, 0.05, 3000)));
        assert_eq!(trainer.max_time(), Duration::ZERO);
        let result = trainer
            .get_trained_model(&definition(), data(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_consumer() {
        let trainer = AutoTrainer::new(DEFAULT_MAX_TIME);
        let cancel = CancellationToken::new();
        cancel.cancel();
        // an empty search still ends, but cancellation wins the race only if observed first
        let result = trainer.get_trained_model(&definition(), data(), &cancel).await;
        assert!(matches!(result, Err(ModelError::Cancelled) | Ok(None)));
    }
}
