//! Attempt failure budget.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Counts an application's attempt failures against `max_attempts`.
///
/// With a validity window, failures older than the window stop counting,
/// so a long-running application is not killed by failures spread over
/// days.
#[derive(Debug, Clone)]
pub struct FailureBudget {
    max_attempts: u32,
    window: Option<Duration>,
    failures: VecDeque<Instant>,
}

impl FailureBudget {
    pub fn new(max_attempts: u32, window: Option<Duration>) -> Self {
        Self {
            max_attempts,
            window,
            failures: VecDeque::new(),
        }
    }

    /// Records a failure. Returns true if the budget is now exhausted.
    pub fn record_failure(&mut self) -> bool {
        let now = Instant::now();
        self.failures.push_back(now);
        self.prune(now);
        self.is_exhausted()
    }

    /// Failures still inside the window.
    pub fn count(&self) -> u32 {
        let now = Instant::now();
        self.failures
            .iter()
            .filter(|at| self.in_window(now, **at))
            .count() as u32
    }

    pub fn is_exhausted(&self) -> bool {
        self.count() >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.failures.front() {
            if self.in_window(now, *first) {
                break;
            }
            self.failures.pop_front();
        }
    }

    fn in_window(&self, now: Instant, at: Instant) -> bool {
        match self.window {
            Some(window) => now.saturating_duration_since(at) <= window,
            None => true,
        }
    }
}
