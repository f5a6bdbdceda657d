//! Single background training task per predictor, plus the evaluation gate
//! prediction callers wait on.

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::evaluation::evaluator::Evaluator;
use crate::traits::model::ModelError;
use crate::training::gate::Gate;

pub type TaskResult = Result<(), ModelError>;

/// Handle on a spawned training loop; clones observe the same completion.
#[derive(Debug, Clone)]
pub struct TrainingTask {
    cancel: CancellationToken,
    done: watch::Receiver<Option<TaskResult>>,
}

impl TrainingTask {
    pub fn is_live(&self) -> bool {
        self.done.borrow().is_none()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Terminal result of the loop
    pub async fn completion(&self) -> TaskResult {
        let mut done = self.done.clone();
        let result = match done.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Ok(())),
            // sender dropped without a result: the loop panicked
            Err(_) => Err(ModelError::Training("training task ended unexpectedly".to_string())),
        };
        result
    }

    /// Completes when the task finishes or its scope is cancelled
    async fn finished(&self) -> TaskResult {
        tokio::select! {
            result = self.completion() => result,
            _ = self.cancel.cancelled() => Err(ModelError::Cancelled),
        }
    }
}

pub struct TrainingController {
    gate: Gate,
    evaluator: RwLock<Arc<Evaluator>>,
    task: Mutex<Option<TrainingTask>>,
    runtime: Handle,
}

impl TrainingController {
    pub fn new(runtime: Handle, initial: Evaluator) -> Self {
        Self {
            gate: Gate::new(),
            evaluator: RwLock::new(Arc::new(initial)),
            task: Mutex::new(None),
            runtime,
        }
    }

    /// Latest published snapshot
    pub fn evaluator(&self) -> Arc<Evaluator> {
        Arc::clone(&self.evaluator.read())
    }

    /// Replace the snapshot; the gate follows whether it holds a model
    pub fn publish(&self, evaluator: Evaluator) -> Arc<Evaluator> {
        let evaluator = Arc::new(evaluator);
        let mut slot = self.evaluator.write();
        *slot = Arc::clone(&evaluator);
        if evaluator.is_available() {
            self.gate.set();
        } else {
            self.gate.reset();
        }
        evaluator
    }

    /// Reset the gate and zero the snapshot timestamp
    pub fn invalidate(&self) {
        let mut slot = self.evaluator.write();
        self.gate.reset();
        *slot = Arc::new(slot.invalidated());
    }

    pub fn is_available(&self) -> bool {
        self.gate.is_set()
    }

    pub fn current_task(&self) -> Option<TrainingTask> {
        self.task.lock().clone()
    }

    pub fn is_training(&self) -> bool {
        self.task.lock().as_ref().is_some_and(TrainingTask::is_live)
    }

    /// Launch `run` unless a task is live, in which case that task is
    /// returned instead. A fresh launch resets the gate and runs under a
    /// child scope of `caller`.
    pub fn ensure_started<F, Fut>(&self, caller: &CancellationToken, run: F) -> TrainingTask
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let mut slot = self.task.lock();
        if let Some(task) = slot.as_ref().filter(|task| task.is_live()) {
            return task.clone();
        }

        self.gate.reset();
        let cancel = caller.child_token();
        let (done_tx, done_rx) = watch::channel(None);
        let future = run(cancel.clone());
        self.runtime.spawn(async move {
            let result = future.await;
            done_tx.send_replace(Some(result));
        });

        let task = TrainingTask { cancel, done: done_rx };
        *slot = Some(task.clone());
        task
    }

    /// Start (or join) training and wait for it to finish
    pub async fn start_training<F, Fut>(&self, caller: &CancellationToken, run: F) -> TaskResult
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.ensure_started(caller, run).completion().await
    }

    /// Cancel the live task, if any, and wait for it to wind down
    pub async fn halt(&self) {
        if let Some(task) = self.current_task() {
            task.cancel();
            let _ = task.completion().await;
        }
    }

    /// [`halt`](Self::halt), giving up the wait with `Cancelled` when
    /// `caller` fires first. The task stays cancelled either way.
    pub async fn stop_training(&self, caller: &CancellationToken) -> Result<(), ModelError> {
        tokio::select! {
            _ = self.halt() => Ok(()),
            _ = caller.cancelled() => Err(ModelError::Cancelled),
        }
    }

    /// Wait until a snapshot with a model is available.
    ///
    /// Fails with `Cancelled` when `caller` fires, and with the task's own
    /// terminal error (or `Cancelled`) when training ends first without
    /// making a model available.
    pub async fn wait_for_evaluation(&self, caller: &CancellationToken) -> Result<Arc<Evaluator>, ModelError> {
        let task = self.current_task();
        let finished = async {
            match &task {
                Some(task) => task.finished().await,
                None => Err(ModelError::Cancelled),
            }
        };

        tokio::select! {
            biased;
            _ = self.gate.wait() => {}
            _ = caller.cancelled() => return Err(ModelError::Cancelled),
            result = finished => result?,
        }

        // an invalidation may have raced the wake-up
        if !self.gate.is_set() {
            return Err(ModelError::Cancelled);
        }
        Ok(self.evaluator())
    }
}
