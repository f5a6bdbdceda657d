use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

/// Runtime counters of a predictor
#[derive(Debug)]
pub struct TrainingStats {
    /// Training loops launched
    pub training_runs: AtomicUsize,
    /// Candidates requested from the trainer strategy
    pub training_cycles: AtomicUsize,
    /// Evaluator snapshots published with a model
    pub models_published: AtomicUsize,
    /// Candidates rejected by the best-model policy
    pub candidates_discarded: AtomicUsize,
    /// Training loops that ended with an error
    pub training_failures: AtomicUsize,
    /// Successful predictions
    pub predictions: AtomicUsize,
    /// Failed predictions
    pub prediction_errors: AtomicUsize,
    /// Duration of the latest candidate fit, in microseconds
    pub latest_fit_latency_us: AtomicUsize,
    /// Creation timestamp
    pub created_at: SystemTime,
}

impl TrainingStats {
    pub fn new() -> Self {
        Self {
            training_runs: AtomicUsize::new(0),
            training_cycles: AtomicUsize::new(0),
            models_published: AtomicUsize::new(0),
            candidates_discarded: AtomicUsize::new(0),
            training_failures: AtomicUsize::new(0),
            predictions: AtomicUsize::new(0),
            prediction_errors: AtomicUsize::new(0),
            latest_fit_latency_us: AtomicUsize::new(0),
            created_at: SystemTime::now(),
        }
    }

    pub(crate) fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Get formatted statistics as a string
    pub fn format_stats(&self) -> String {
        format!(
            "Runs: {} | Cycles: {} | Published: {} | Discarded: {} | Failures: {} | Predictions: {} ({} errors) | Fit: {}μs",
            self.training_runs.load(Ordering::Relaxed),
            self.training_cycles.load(Ordering::Relaxed),
            self.models_published.load(Ordering::Relaxed),
            self.candidates_discarded.load(Ordering::Relaxed),
            self.training_failures.load(Ordering::Relaxed),
            self.predictions.load(Ordering::Relaxed),
            self.prediction_errors.load(Ordering::Relaxed),
            self.latest_fit_latency_us.load(Ordering::Relaxed),
        )
    }

    /// Reset error counters
    pub fn reset_error_counters(&self) {
        self.prediction_errors.store(0, Ordering::SeqCst);
        self.training_failures.store(0, Ordering::SeqCst);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
            .as_secs()
    }
}

impl Default for TrainingStats {
    fn default() -> Self {
        Self::new()
    }
}
