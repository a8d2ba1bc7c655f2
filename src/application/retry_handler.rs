use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::DownloadError;

/// Wait schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// `initial * 2^(retry-1)` capped at `max`; with `jitter` the wait is
    /// drawn uniformly from the upper half of that value.
    Exponential {
        #[serde(with = "millis")]
        initial: Duration,
        #[serde(with = "millis")]
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                max,
                jitter,
            } => {
                let exp = retry.saturating_sub(1).min(31);
                let base = initial.saturating_mul(1u32 << exp).min(*max);
                if *jitter && !base.is_zero() {
                    let half = base / 2;
                    let spread = rand::thread_rng().gen_range(0..=(base - half).as_millis() as u64);
                    half + Duration::from_millis(spread)
                } else {
                    base
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_secs(5),
        }
    }
}

/// Immutable retry configuration shared by all attempts of one job.
#[derive(Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(skip, default = "default_predicate")]
    pub retryable: fn(&DownloadError) -> bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            retryable: default_predicate(),
        }
    }

    pub fn with_predicate(mut self, retryable: fn(&DownloadError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Backoff::default())
    }
}

fn default_predicate() -> fn(&DownloadError) -> bool {
    DownloadError::is_retryable
}

/// Details handed to the observer before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    /// The attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: DownloadError,
}

/// Runs an attempt function under a [`RetryPolicy`].
///
/// The token is checked before every attempt and interrupts backoff sleeps.
/// In-flight attempts are expected to observe the same token themselves so
/// they can shut their work down cleanly; an attempt that fails after the
/// token fired is reported as [`DownloadError::Cancelled`].
#[derive(Debug, Clone)]
pub struct RetryHandler {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<T, F, Fut>(&self, attempt_fn: F) -> Result<T, DownloadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        self.run_observed(attempt_fn, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry` before each backoff sleep.
    pub async fn run_observed<T, F, Fut, O>(
        &self,
        mut attempt_fn: F,
        mut on_retry: O,
    ) -> Result<T, DownloadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
        O: FnMut(RetryNotice),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let error = match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(_) if self.cancel.is_cancelled() => return Err(DownloadError::Cancelled),
                Err(e) => e,
            };

            if !(self.policy.retryable)(&error) {
                debug!(attempt, kind = error.kind(), "fatal error, not retrying");
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(attempt, "retry attempts exhausted: {}", error);
                return Err(error);
            }

            let delay = self.policy.backoff.delay_for(attempt);
            warn!(attempt, max_attempts, ?delay, "attempt failed, retrying: {}", error);
            on_retry(RetryNotice {
                attempt,
                max_attempts,
                delay,
                error,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::Fixed {
                delay: Duration::from_millis(1),
            },
        )
    }

    fn network() -> DownloadError {
        DownloadError::Network("connection reset".into())
    }

    #[tokio::test]
    async fn test_n_failures_then_success() {
        for n in 0..4u32 {
            let calls = AtomicU32::new(0);
            let handler = RetryHandler::new(quick_policy(n + 1), CancellationToken::new());

            let result = handler
                .run(|_| {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if call <= n {
                            Err(network())
                        } else {
                            Ok(call)
                        }
                    }
                })
                .await;

            assert_eq!(result, Ok(n + 1));
            assert_eq!(calls.load(Ordering::SeqCst), n + 1);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_failure() {
        let n = 2u32;
        let calls = AtomicU32::new(0);
        let handler = RetryHandler::new(quick_policy(n + 1), CancellationToken::new());

        let result: Result<(), _> = handler
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(DownloadError::Network(format!("attempt {attempt}"))) }
            })
            .await;

        assert_eq!(result, Err(DownloadError::Network("attempt 3".into())));
        assert_eq!(calls.load(Ordering::SeqCst), n + 1);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let handler = RetryHandler::new(quick_policy(5), CancellationToken::new());

        let result: Result<(), _> = handler
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DownloadError::FormatUnavailable("no mp4".into())) }
            })
            .await;

        assert!(matches!(result, Err(DownloadError::FormatUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let calls = AtomicU32::new(0);
        let policy = quick_policy(3).with_predicate(|_| false);
        let handler = RetryHandler::new(policy, CancellationToken::new());

        let result: Result<(), _> = handler
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(network()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(
            3,
            Backoff::Fixed {
                delay: Duration::from_secs(60),
            },
        );
        let handler = RetryHandler::new(policy, cancel.clone());
        let calls = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let counter = calls.clone();
        let result: Result<(), _> = handler
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(network()) }
            })
            .await;

        assert_eq!(result, Err(DownloadError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_precancelled_never_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = RetryHandler::new(quick_policy(3), cancel);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = handler
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(DownloadError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_observer_sees_each_retry() {
        let handler = RetryHandler::new(quick_policy(3), CancellationToken::new());
        let mut notices = Vec::new();

        let _: Result<(), _> = handler
            .run_observed(|_| async { Err(network()) }, |n| notices.push(n.attempt))
            .await;

        assert_eq!(notices, vec![1, 2]);
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let d = backoff.delay_for(1);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_policy_deserializes_with_default_predicate() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts":2,"backoff":{"kind":"exponential","initial":100,"max":1000,"jitter":true}}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert!((policy.retryable)(&network()));
        assert!(!(policy.retryable)(&DownloadError::Cancelled));
    }
}
