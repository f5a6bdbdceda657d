//! Best-of-two model selection.

use std::fmt;

use crate::evaluation::metrics::Metrics;

/// Outcome of comparing the incumbent model's metrics with a candidate's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Incumbent,
    Candidate,
}

/// Judges whether a candidate model beats the incumbent.
///
/// Absent metrics (no model) always lose to present ones. When both are
/// absent the candidate is chosen, so the result is never ambiguous.
pub trait BestModelPolicy: Send + Sync + fmt::Debug {
    /// Both sides present: true when the candidate should replace the incumbent
    fn prefers(&self, incumbent: &Metrics, candidate: &Metrics) -> bool;

    fn best(&self, incumbent: Option<&Metrics>, candidate: Option<&Metrics>) -> Choice {
        match (incumbent, candidate) {
            (Some(incumbent), Some(candidate)) => {
                if self.prefers(incumbent, candidate) {
                    Choice::Candidate
                } else {
                    Choice::Incumbent
                }
            }
            (Some(_), None) => Choice::Incumbent,
            (None, _) => Choice::Candidate,
        }
    }
}

/// Higher R-squared wins; ties keep the incumbent
#[derive(Debug, Clone, Copy, Default)]
pub struct RegressionPolicy;

impl BestModelPolicy for RegressionPolicy {
    fn prefers(&self, incumbent: &Metrics, candidate: &Metrics) -> bool {
        match (incumbent, candidate) {
            (Metrics::Regression { r_squared: old, .. }, Metrics::Regression { r_squared: new, .. }) => new > old,
            _ => true,
        }
    }
}

/// Candidate needs at least the same micro accuracy and a strictly lower log-loss
#[derive(Debug, Clone, Copy, Default)]
pub struct MulticlassPolicy;

impl BestModelPolicy for MulticlassPolicy {
    fn prefers(&self, incumbent: &Metrics, candidate: &Metrics) -> bool {
        match (incumbent, candidate) {
            (
                Metrics::Multiclass {
                    micro_accuracy: old_accuracy,
                    log_loss: old_loss,
                    ..
                },
                Metrics::Multiclass {
                    micro_accuracy: new_accuracy,
                    log_loss: new_loss,
                    ..
                },
            ) => new_accuracy >= old_accuracy && new_loss < old_loss,
            _ => true,
        }
    }
}

/// Calibrated models: accuracy at least as high and strictly lower log-loss.
/// Uncalibrated models: accuracy at least as high.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryPolicy;

impl BestModelPolicy for BinaryPolicy {
    fn prefers(&self, incumbent: &Metrics, candidate: &Metrics) -> bool {
        match (incumbent, candidate) {
            (
                Metrics::Binary {
                    accuracy: old_accuracy,
                    log_loss: old_loss,
                },
                Metrics::Binary {
                    accuracy: new_accuracy,
                    log_loss: new_loss,
                },
            ) => match (old_loss, new_loss) {
                (Some(old_loss), Some(new_loss)) => new_accuracy >= old_accuracy && new_loss < old_loss,
                _ => new_accuracy >= old_accuracy,
            },
            _ => true,
        }
    }
}
