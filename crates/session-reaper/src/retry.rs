//! Bounded retry for flaky outbound calls.
//!
//! Every gated call returns an [`Outcome`] instead of an error: after the attempts are
//! exhausted the caller gets an explicit [`Outcome::Failure`] and must decide what to do
//! with it. Errors from individual attempts are logged and swallowed.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt limit and fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts. Values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Fixed delay between two attempts (no backoff).
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            pause: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts,
            pause,
        }
    }

    /// Upper bound on the time spent sleeping between attempts.
    #[must_use]
    pub fn worst_case_pause(&self) -> Duration {
        self.pause * self.max_attempts.max(1).saturating_sub(1)
    }
}

/// Why a gated call gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFailure {
    pub target: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Result of a gated call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Success(T),
    Failure(GatewayFailure),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Convert into an `Option`, dropping the failure details.
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Failure(failure) => Outcome::Failure(failure),
        }
    }
}

/// Runs an operation up to `max_attempts` times with a fixed pause in between.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryGateway {
    policy: RetryPolicy,
}

impl RetryGateway {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Call `operation` with this gateway's policy.
    pub async fn call<T, E, F, Fut>(&self, target: &str, operation: F) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        Self::call_with(self.policy, target, operation).await
    }

    /// Call `operation` with an explicit policy.
    pub async fn call_with<T, E, F, Fut>(
        policy: RetryPolicy,
        target: &str,
        mut operation: F,
    ) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                warn!(
                    target_url = %target,
                    attempt,
                    max_attempts,
                    "Retrying gated call"
                );
            }

            match operation().await {
                Ok(value) => {
                    debug!(target_url = %target, attempt, "Gated call succeeded");
                    return Outcome::Success(value);
                }
                Err(e) => {
                    warn!(
                        target_url = %target,
                        attempt,
                        error = %e,
                        "Gated call attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(policy.pause).await;
            }
        }

        Outcome::Failure(GatewayFailure {
            target: target.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let gateway = RetryGateway::new(RetryPolicy::new(4, Duration::from_secs(5)));
        let started = Instant::now();

        let outcome: Outcome<()> = gateway
            .call("http://backend/flaky", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("connection reset")
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(15));
        match outcome {
            Outcome::Failure(failure) => {
                assert_eq!(failure.attempts, 4);
                assert_eq!(failure.last_error, "connection reset");
                assert_eq!(failure.target, "http://backend/flaky");
            }
            Outcome::Success(()) => panic!("expected failure"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_kth_attempt_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let gateway = RetryGateway::new(RetryPolicy::new(5, Duration::from_secs(1)));

        let outcome = gateway
            .call("op", || {
                let calls = Arc::clone(&calls);
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt * 10)
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome, Outcome::Success(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pause_after_final_attempt() {
        let gateway = RetryGateway::new(RetryPolicy::new(1, Duration::from_secs(60)));
        let started = Instant::now();

        let outcome: Outcome<()> = gateway.call("op", || async { Err("boom") }).await;

        assert!(!outcome.is_success());
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let outcome = RetryGateway::call_with(RetryPolicy::new(0, Duration::ZERO), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>("done") }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.success(), Some("done"));
    }

    #[test]
    fn test_worst_case_pause() {
        let policy = RetryPolicy::new(6, Duration::from_secs(5));
        assert_eq!(policy.worst_case_pause(), Duration::from_secs(25));
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(5)).worst_case_pause(), Duration::ZERO);
    }
}
