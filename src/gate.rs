use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
    /// Multiplier applied to the interval after every failed check; 1.0 keeps it fixed.
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_ms: 500,
            backoff: default_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed check number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt as i32);
        Duration::from_millis((self.interval_ms as f64 * factor).round() as u64)
    }
}

fn default_backoff() -> f64 {
    1.0
}

/// Checks `predicate` up to `policy.max_attempts` times, sleeping between
/// checks. Returns the number of checks made on success, `None` once the
/// bound is exhausted.
pub async fn wait_until<P, S, Fut>(policy: RetryPolicy, mut predicate: P, mut sleep: S) -> Option<u32>
where
    P: FnMut() -> bool,
    S: FnMut(Duration) -> Fut,
    Fut: Future<Output = ()>,
{
    for attempt in 0..policy.max_attempts {
        if predicate() {
            return Some(attempt + 1);
        }
        if attempt + 1 < policy.max_attempts {
            sleep(policy.delay(attempt)).await;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    #[tokio::test]
    async fn succeeds_once_predicate_holds() {
        let checks = Cell::new(0);
        let slept = RefCell::new(Vec::new());
        let policy = RetryPolicy {
            max_attempts: 5,
            interval_ms: 100,
            backoff: 1.0,
        };
        let result = wait_until(
            policy,
            || {
                checks.set(checks.get() + 1);
                checks.get() == 3
            },
            |delay| {
                slept.borrow_mut().push(delay);
                async {}
            },
        )
        .await;
        assert_eq!(result, Some(3));
        assert_eq!(*slept.borrow(), vec![Duration::from_millis(100); 2]);
    }

    #[tokio::test]
    async fn gives_up_after_bound_with_backoff() {
        let slept = RefCell::new(Vec::new());
        let policy = RetryPolicy {
            max_attempts: 4,
            interval_ms: 100,
            backoff: 2.0,
        };
        let result = wait_until(
            policy,
            || false,
            |delay| {
                slept.borrow_mut().push(delay.as_millis());
                async {}
            },
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(*slept.borrow(), vec![100, 200, 400]);
    }

    #[tokio::test]
    async fn zero_attempts_never_checks() {
        let policy = RetryPolicy {
            max_attempts: 0,
            interval_ms: 1,
            backoff: 1.0,
        };
        let result = wait_until(policy, || true, |_| async {}).await;
        assert_eq!(result, None);
    }
}
