//! Retry combinator for per-message work.

use futures::future::BoxFuture;

use super::options::RetryPolicy;
use crate::error::SyncError;

/// The last error after every attempt failed.
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub attempts: u32,
    pub last_error: SyncError,
}

/// Run `op` against `ctx` until it succeeds, at most `1 + max_retries` times,
/// sleeping `delay` between attempts.
///
/// `op` receives the attempt number (starting at 1) and borrows `ctx` only for
/// the duration of one attempt, so callers can thread sessions through it.
pub async fn attempt<C, T, F>(policy: RetryPolicy, ctx: &mut C, mut op: F) -> Result<T, Exhausted>
where
    C: ?Sized + Send,
    F: for<'c> FnMut(&'c mut C, u32) -> BoxFuture<'c, Result<T, SyncError>>,
{
    let total = policy.max_retries.saturating_add(1);
    let mut attempt_no = 1;
    loop {
        match op(ctx, attempt_no).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt_no >= total => {
                return Err(Exhausted {
                    attempts: attempt_no,
                    last_error: e,
                });
            }
            Err(e) => {
                log::debug!("Attempt {attempt_no}/{total} failed: {e}; retrying in {:?}", policy.delay);
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt_no += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    struct Counter {
        calls: u32,
        succeed_on: Option<u32>,
    }

    fn policy(max_retries: u32, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            delay: Duration::from_millis(delay_ms),
        }
    }

    async fn step(counter: &mut Counter, attempt: u32) -> Result<u32, SyncError> {
        counter.calls += 1;
        match counter.succeed_on {
            Some(n) if n == attempt => Ok(attempt),
            _ => Err(SyncError::Message(format!("attempt {attempt} failed"))),
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut counter = Counter {
            calls: 0,
            succeed_on: None,
        };
        let err = attempt(policy(3, 0), &mut counter, |c, n| step(c, n).boxed())
            .await
            .unwrap_err();

        assert_eq!(counter.calls, 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error.to_string(), "attempt 4 failed");
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let mut counter = Counter {
            calls: 0,
            succeed_on: None,
        };
        let err = attempt(policy(0, 0), &mut counter, |c, n| step(c, n).boxed())
            .await
            .unwrap_err();
        assert_eq!(counter.calls, 1);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let mut counter = Counter {
            calls: 0,
            succeed_on: Some(2),
        };
        let value = attempt(policy(5, 0), &mut counter, |c, n| step(c, n).boxed())
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(counter.calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_between_attempts() {
        let mut counter = Counter {
            calls: 0,
            succeed_on: None,
        };
        let started = tokio::time::Instant::now();
        let _ = attempt(policy(2, 500), &mut counter, |c, n| step(c, n).boxed()).await;
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));
    }
}
