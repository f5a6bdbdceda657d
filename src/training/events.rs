use std::time::SystemTime;

use tokio::sync::broadcast;

/// Capacity of the notification channel; slow subscribers lag, the loop never waits
const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications of a predictor
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    TrainingStarted,
    TrainingCycleStarted { cycle: usize },
    /// A new evaluator snapshot was published
    ModelChanged { timestamp: SystemTime, has_model: bool },
    /// The pending buffer or the primary storage changed
    TrainingDataChanged,
    TrainingEnded,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: broadcast::Sender<TrainingEvent>,
}

impl EventSender {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Delivered to current subscribers only; no subscriber is fine
    pub fn emit(&self, event: TrainingEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrainingEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let events = EventSender::new();
        events.emit(TrainingEvent::TrainingStarted);

        let mut receiver = events.subscribe();
        events.emit(TrainingEvent::TrainingCycleStarted { cycle: 1 });
        events.emit(TrainingEvent::TrainingEnded);
        assert_eq!(receiver.recv().await.unwrap(), TrainingEvent::TrainingCycleStarted { cycle: 1 });
        assert_eq!(receiver.recv().await.unwrap(), TrainingEvent::TrainingEnded);
    }
}
