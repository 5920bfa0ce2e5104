use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Result of a retried call
#[derive(Debug)]
pub enum RetryResult<T> {
    /// The call succeeded
    Done(T),
    /// A non-retryable error, or the last transient one once attempts ran out
    Failed(Error),
    /// Cancelled via token
    Cancelled,
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            RetryResult::Done(value) => Ok(value),
            RetryResult::Failed(err) => Err(err),
            RetryResult::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// Adds up to 20% random jitter so that independent loops hitting the same
/// node do not retry in lockstep.
fn with_jitter(backoff: Duration) -> Duration {
    let max_jitter = backoff.as_millis() as u64 / 5;
    if max_jitter == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Run `op` until it succeeds, fails with a non-retryable error, exhausts
/// `config.max_attempts`, or `cancel_token` fires.
///
/// Cancellation is observed while a call is in flight and during backoff.
///
/// # Arguments
/// * `what` - Name of the operation (for logging)
/// * `config` - Retry configuration
/// * `cancel_token` - Cancellation token to stop retrying
/// * `op` - Async function performing one attempt
pub async fn retry_with_backoff<T, F, Fut>(
    what: &str,
    config: &RetryConfig,
    cancel_token: &CancellationToken,
    op: F,
) -> RetryResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        if cancel_token.is_cancelled() {
            tracing::debug!(op = what, "Retry cancelled");
            return RetryResult::Cancelled;
        }

        let outcome = tokio::select! {
            outcome = op() => outcome,
            _ = cancel_token.cancelled() => {
                tracing::debug!(op = what, "Cancelled while awaiting call");
                return RetryResult::Cancelled;
            }
        };

        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(op = what, attempts = attempt + 1, "Recovered after retry");
                }
                return RetryResult::Done(value);
            }
            Err(Error::Cancelled) => return RetryResult::Cancelled,
            Err(e) if !e.is_retryable() => return RetryResult::Failed(e),
            Err(e) => {
                attempt += 1;

                if attempt >= config.max_attempts {
                    tracing::error!(
                        op = what,
                        attempts = attempt,
                        error = %e,
                        "Max attempts exceeded"
                    );
                    return RetryResult::Failed(e);
                }

                let backoff = with_jitter(config.backoff_for_attempt(attempt));
                tracing::warn!(
                    op = what,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Call failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel_token.cancelled() => {
                        tracing::debug!(op = what, "Retry cancelled during backoff");
                        return RetryResult::Cancelled;
                    }
                }
            }
        }
    }
}
