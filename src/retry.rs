//! Bounded polling with configurable backoff.
//!
//! Provisioning polls the provider until a freshly launched instance becomes
//! visible and acquires an address. Each poll either produces a value, asks
//! to be retried, or fails fatally; [`retry`] enforces the attempt budget and
//! sleeps between attempts according to the policy's [`Backoff`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// How long to wait after a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    /// `step * (attempts - remaining)`: grows by `step` after each failure.
    Linear(Duration),
    /// The same delay after every failure.
    Constant(Duration),
}

/// Attempt budget and backoff for one polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts.
    pub attempts: u32,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(5, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    /// Linear backoff over `attempts` tries.
    #[must_use]
    pub const fn linear(attempts: u32, step: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Linear(step),
        }
    }

    /// Constant backoff over `attempts` tries.
    #[must_use]
    pub const fn constant(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Constant(delay),
        }
    }

    /// Immediate retries with no delay.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self::constant(attempts, Duration::ZERO)
    }

    /// Delay after a failure that leaves `remaining` attempts.
    #[must_use]
    pub fn delay_after(&self, remaining: u32) -> Duration {
        match self.backoff {
            Backoff::Linear(step) => step.saturating_mul(self.attempts.saturating_sub(remaining)),
            Backoff::Constant(delay) => delay,
        }
    }

    /// The full delay schedule, one entry per attempt.
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.attempts)
            .rev()
            .map(|remaining| self.delay_after(remaining))
            .collect()
    }
}

/// Result of one polling attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attempt<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not yet; the reason is kept for diagnostics.
    Pending(String),
}

/// Failure of a polling loop.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt was spent without reaching the condition.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Reason reported by the final attempt.
        last: String,
    },
    /// An attempt failed in a way retrying cannot fix.
    #[error("{0}")]
    Fatal(E),
}

/// Runs `operation` until it is ready, fails fatally, or the policy's
/// attempts are spent. The policy's delay is awaited after every pending
/// attempt, including the last.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] on the first fatal failure and
/// [`RetryError::Exhausted`] when the budget runs out.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let mut remaining = policy.attempts;
    let mut last = String::from("no attempts made");
    while remaining > 0 {
        match operation().await {
            Ok(Attempt::Ready(value)) => return Ok(value),
            Ok(Attempt::Pending(reason)) => {
                remaining -= 1;
                let delay = policy.delay_after(remaining);
                debug!(label, remaining, ?delay, %reason, "retrying");
                last = reason;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(RetryError::Fatal(err)),
        }
    }
    Err(RetryError::Exhausted {
        attempts: policy.attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;

    #[test]
    fn linear_schedule_grows_by_step() {
        let policy = RetryPolicy::default();
        let secs: Vec<u64> = policy.schedule().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, [5, 10, 15, 20, 25]);
    }

    #[rstest]
    #[case(4, 5)]
    #[case(3, 10)]
    #[case(2, 15)]
    #[case(1, 20)]
    #[case(0, 25)]
    fn linear_delay_follows_remaining_attempts(#[case] remaining: u32, #[case] secs: u64) {
        assert_eq!(
            RetryPolicy::default().delay_after(remaining),
            Duration::from_secs(secs)
        );
    }

    #[test]
    fn constant_schedule_repeats_delay() {
        let policy = RetryPolicy::constant(3, Duration::from_millis(500));
        assert_eq!(policy.schedule(), vec![Duration::from_millis(500); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_value_stops_polling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, RetryError<String>> =
            retry(&RetryPolicy::default(), "test", move || async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < 2 {
                    Ok(Attempt::Pending(String::from("not yet")))
                } else {
                    Ok(Attempt::Ready(call))
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_reason() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), RetryError<String>> =
            retry(&RetryPolicy::default(), "test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Attempt::Pending(String::from("still pending")))
            })
            .await;
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 5,
                last: String::from("still pending"),
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), RetryError<&str>> =
            retry(&RetryPolicy::default(), "test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom")
            })
            .await;
        assert_eq!(result, Err(RetryError::Fatal("boom")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
