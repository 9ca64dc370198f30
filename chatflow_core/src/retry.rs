use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backoff::{BackoffPolicy, RetryState};
use crate::error::CallError;

/// Retry policy applied to durable outbound calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CallRetryPolicy {
    pub backoff: BackoffPolicy,
    /// Total attempts allowed, `0` means unbounded.
    pub maximum_attempts: u32,
}

impl Default for CallRetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            maximum_attempts: 0,
        }
    }
}

impl CallRetryPolicy {
    #[must_use]
    pub const fn with_maximum_attempts(mut self, maximum_attempts: u32) -> Self {
        self.maximum_attempts = maximum_attempts;
        self
    }

    const fn allows(&self, attempts_made: u32) -> bool {
        self.maximum_attempts == 0 || attempts_made < self.maximum_attempts
    }
}

/// Why a retried call gave up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryExhausted {
    #[error("non-retryable error: {0}")]
    Fatal(CallError),

    #[error("gave up after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: CallError },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

/// Retry an async call with exponential backoff.
///
/// Transient errors are retried until the policy runs out of attempts; a
/// fatal error stops immediately. Cancellation is observed while waiting
/// between attempts.
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    policy: &CallRetryPolicy,
    cancel: &CancellationToken,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let mut state = RetryState::new();

    loop {
        if cancel.is_cancelled() {
            return Err(RetryExhausted::Cancelled {
                attempts: state.attempt,
            });
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(RetryExhausted::Fatal(e)),
            Err(e) => {
                let delay = state.advance(&policy.backoff);
                if !policy.allows(state.attempt) {
                    return Err(RetryExhausted::AttemptsExhausted {
                        attempts: state.attempt,
                        last: e,
                    });
                }

                warn!(
                    "Call failed (attempt {}): {e}. Retrying after {:?}...",
                    state.attempt, delay
                );

                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(RetryExhausted::Cancelled {
                            attempts: state.attempt,
                        });
                    }
                    () = sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(maximum_attempts: u32) -> CallRetryPolicy {
        CallRetryPolicy {
            backoff: BackoffPolicy::new(Duration::from_millis(10), 2.0, Duration::from_secs(1)),
            maximum_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_first_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CallError>("done")
                }
            },
            &fast_policy(0),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(
            || {
                let attempts = attempts.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(CallError::transient("throttled"))
                    } else {
                        Ok(count)
                    }
                }
            },
            &fast_policy(0),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = retry_with_backoff(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::fatal("bad request"))
                }
            },
            &fast_policy(0),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(
            result,
            Err(RetryExhausted::Fatal(CallError::fatal("bad request")))
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_fails_after_maximum_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = retry_with_backoff(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::transient("down"))
                }
            },
            &fast_policy(4),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(
            result,
            Err(RetryExhausted::AttemptsExhausted {
                attempts: 4,
                last: CallError::transient("down"),
            })
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let policy = CallRetryPolicy {
            backoff: BackoffPolicy::new(Duration::from_secs(60), 2.0, Duration::from_secs(60)),
            maximum_attempts: 0,
        };

        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result: Result<(), _> =
            retry_with_backoff(|| async { Err(CallError::transient("down")) }, &policy, &cancel)
                .await;
        assert_eq!(result, Err(RetryExhausted::Cancelled { attempts: 1 }));
    }
}
