use std::time::Duration;

use tokio::sync::watch;

use crate::shutdown;

/// Reconnect delay that doubles per failed cycle, capped at a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Return the delay for this attempt and double it for the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    /// Back to the floor after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Sleep for the next delay. Returns false if shutdown interrupted it.
    pub async fn wait(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown::cancelled(shutdown_rx) => false,
        }
    }
}
