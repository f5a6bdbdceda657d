use tokio::sync::watch;

/// Manual-reset event: stays set until explicitly reset, wakes every waiter.
#[derive(Debug)]
pub struct Gate {
    state: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(false),
        }
    }

    pub fn set(&self) {
        self.state.send_replace(true);
    }

    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    /// Whether the gate is open, without waiting
    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the gate is set (immediately if it already is)
    pub async fn wait(&self) {
        let mut receiver = self.state.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = receiver.wait_for(|set| *set).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_wakes_waiters() {
        let gate = Arc::new(Gate::new());
        assert!(!gate.is_set());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.set();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(gate.is_set());
    }

    #[tokio::test]
    async fn test_stays_set_until_reset() {
        let gate = Gate::new();
        gate.set();
        gate.wait().await;
        gate.wait().await;

        gate.reset();
        assert!(!gate.is_set());
        assert!(tokio::time::timeout(Duration::from_millis(20), gate.wait()).await.is_err());
    }
}
