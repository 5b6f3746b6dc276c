//! Retry and polling combinators for control-plane calls.
//!
//! These wrap the outer calls that set up or observe remote resources. They
//! are deliberately not used on the tunnel data path: byte forwarding is
//! retry-free, and retry policy for the calls that trigger tunnel use
//! belongs to the caller.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, or the attempt
/// budget is exhausted.
///
/// `is_retryable` classifies errors; a fatal error is returned immediately.
/// The delay between attempts doubles, capped at `max_delay`. The last
/// error is returned when attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    mut is_retryable: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                debug!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
        }
    }
}

/// The polled condition did not become true before the timeout.
#[derive(Error, Debug)]
#[error("polling timed out after {0:?}")]
pub struct PollTimedOut(pub Duration);

/// Re-run `probe` every `interval` until it yields a value or `timeout`
/// elapses.
///
/// The probe returning `None` means "not ready yet". The combinator is a
/// plain future, so dropping it cancels the poll.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T, PollTimedOut>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(value) = probe().await {
            return Ok(value);
        }

        let next = tokio::time::Instant::now() + interval;
        if next > deadline {
            return Err(PollTimedOut(timeout));
        }
        tokio::time::sleep_until(next).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = BackoffPolicy::default();

        let result: Result<u32, String> = retry_with_backoff(
            &policy,
            |_| true,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_fatal_error() {
        let attempts = AtomicU32::new(0);
        let policy = BackoffPolicy::default();

        let result: Result<(), String> = retry_with_backoff(
            &policy,
            |e: &String| e.contains("refused"),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("401 unauthorized".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_attempt_budget() {
        let attempts = AtomicU32::new(0);
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 4,
        };

        let result: Result<(), String> = retry_with_backoff(
            &policy,
            |_| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_once_ready() {
        let probes = AtomicU32::new(0);

        let result = poll_until(Duration::from_secs(10), Duration::from_millis(100), || {
            let n = probes.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= 5 {
                    Some("ready")
                } else {
                    None
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(probes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out() {
        let result: Result<(), _> = poll_until(
            Duration::from_millis(250),
            Duration::from_millis(100),
            || async { None },
        )
        .await;

        assert!(result.is_err());
    }
}
