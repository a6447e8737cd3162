use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Bounded wrap-around backoff for one polling loop. Each failure widens the
/// wait by one second up to the ceiling, then wraps back to one second, so
/// the wait never grows unbounded and never reaches zero. Each loop owns its
/// own instance; pacers are not shared.
#[derive(Debug)]
pub struct RetryPacer {
    current: u64,
    ceiling: u64,
}

impl RetryPacer {
    pub fn new(ceiling: u64) -> Self {
        Self {
            current: 1,
            ceiling: ceiling.max(1),
        }
    }

    /// Returns the current wait and advances: `current = 1 + (current mod
    /// ceiling)`. With ceiling 5 the sequence from fresh is 1,2,3,4,5,1,2,…
    pub fn next(&mut self) -> Duration {
        let wait = Duration::from_secs(self.current);
        self.current = 1 + (self.current % self.ceiling);
        wait
    }

    /// Back to the shortest wait. Called after a successful operation.
    pub fn reset(&mut self) {
        self.current = 1;
    }

    /// Suspends the calling task for `next()`'s duration. Does not affect
    /// any other loop.
    pub async fn sleep(&mut self) {
        let wait = self.next();
        debug!("Backing off for {:?}", wait);
        sleep(wait).await;
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }
}
