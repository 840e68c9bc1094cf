//! Exponential backoff and the "eventually" primitive used by convergence
//! checks.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default bound for [`succeeds_soon`].
pub const DEFAULT_SUCCEEDS_SOON_DURATION: Duration = Duration::from_secs(45);

/// Backoff parameters.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Ceiling on the delay between attempts.
    pub max_backoff: Duration,
    /// Growth factor applied after each attempt.
    pub multiplier: f64,
    /// Fraction of the delay randomized in either direction.
    pub randomization_factor: f64,
    /// Attempts after the first; zero means unlimited.
    pub max_retries: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.15,
            max_retries: 0,
        }
    }
}

/// Iterator-style retry loop.
///
/// ```ignore
/// let mut retry = Retry::start(opts);
/// while retry.next().await {
///     // attempt
/// }
/// ```
#[derive(Debug)]
pub struct Retry {
    opts: RetryOptions,
    attempt: usize,
    closer: Option<CancellationToken>,
}

impl Retry {
    /// Begin a retry loop.
    #[must_use]
    pub const fn start(opts: RetryOptions) -> Self {
        Self {
            opts,
            attempt: 0,
            closer: None,
        }
    }

    /// Abort the loop when `closer` is cancelled.
    #[must_use]
    pub fn with_closer(mut self, closer: CancellationToken) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Number of attempts started so far.
    #[must_use]
    pub const fn current_attempt(&self) -> usize {
        self.attempt
    }

    /// Restart the backoff schedule.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Wait for the next attempt. Returns `false` once retries are exhausted
    /// or the closer fired.
    pub async fn next(&mut self) -> bool {
        if self.closer.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return false;
        }
        if self.attempt == 0 {
            self.attempt = 1;
            return true;
        }
        if self.opts.max_retries > 0 && self.attempt > self.opts.max_retries {
            return false;
        }
        let backoff = self.backoff();
        self.attempt += 1;
        trace!(attempt = self.attempt, ?backoff, "retrying");
        match &self.closer {
            Some(closer) => tokio::select! {
                () = tokio::time::sleep(backoff) => true,
                () = closer.cancelled() => false,
            },
            None => {
                tokio::time::sleep(backoff).await;
                true
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn backoff(&self) -> Duration {
        let exponent = (self.attempt - 1).min(32) as i32;
        let base = self.opts.initial_backoff.as_secs_f64() * self.opts.multiplier.powi(exponent);
        let capped = base.min(self.opts.max_backoff.as_secs_f64());
        let factor = self.opts.randomization_factor.clamp(0.0, 1.0);
        let jittered = if factor > 0.0 {
            let delta = capped * factor;
            rand::thread_rng().gen_range((capped - delta)..=(capped + delta))
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Returned when a [`succeeds_soon`] condition never held.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("condition failed to evaluate within {timeout:?}: {last}")]
pub struct SucceedsSoonError {
    /// Bound that elapsed.
    pub timeout: Duration,
    /// Message of the last failed evaluation.
    pub last: String,
}

/// Evaluate `condition` with backoff until it returns `Ok` or `timeout`
/// elapses.
///
/// # Errors
///
/// Returns the last failure wrapped in [`SucceedsSoonError`] once the bound
/// is exceeded.
pub async fn succeeds_soon<T, E, F, Fut>(
    timeout: Duration,
    mut condition: F,
) -> Result<T, SucceedsSoonError>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut retry = Retry::start(RetryOptions {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_secs(1),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_retries: 0,
    });
    let mut last = String::from("condition never evaluated");
    while retry.next().await {
        match condition().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                trace!(error = %err, attempt = retry.current_attempt(), "condition not met yet");
                last = err.to_string();
            }
        }
        if Instant::now() >= deadline {
            break;
        }
    }
    Err(SucceedsSoonError { timeout, last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_attempt_is_immediate() {
        let mut retry = Retry::start(RetryOptions {
            initial_backoff: Duration::from_secs(60),
            ..RetryOptions::default()
        });
        let started = Instant::now();
        assert!(retry.next().await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn max_retries_bounds_attempts() {
        let mut retry = Retry::start(RetryOptions {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_retries: 3,
            ..RetryOptions::default()
        });
        let mut attempts = 0;
        while retry.next().await {
            attempts += 1;
        }
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn cancelled_closer_stops_loop() {
        let closer = CancellationToken::new();
        let mut retry = Retry::start(RetryOptions::default()).with_closer(closer.clone());
        assert!(retry.next().await);
        closer.cancel();
        assert!(!retry.next().await);
    }

    #[tokio::test]
    async fn succeeds_soon_returns_once_condition_holds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let value = succeeds_soon(Duration::from_secs(5), || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 { Err(format!("only {n} calls")) } else { Ok(n) }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn succeeds_soon_reports_last_error() {
        let err = succeeds_soon(Duration::from_millis(30), || async { Err::<(), _>("never") })
            .await
            .unwrap_err();
        assert_eq!(err.last, "never");
        assert_eq!(err.timeout, Duration::from_millis(30));
    }
}
