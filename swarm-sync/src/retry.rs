//! Bounded retries and per-call time limits
//!
//! Retry exhaustion is a value, not a panic or a swallowed error: callers
//! get [`RetryError::Exhausted`] with the attempt count and the last
//! failure, and decide what it means for them.

use std::future::Future;
use std::time::Duration;

use swarm_sync_core::Error;
use swarm_sync_runtime::SwarmRuntime;

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished; stop retrying
    Done(T),
    /// Transient failure; try again after the delay
    Retry(Error),
    /// Permanent failure; retrying cannot help
    Abort(Error),
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError {
    /// Every attempt failed transiently
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Error },
    /// An attempt failed permanently
    #[error(transparent)]
    Aborted(Error),
}

/// How many attempts, how far apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, at least one is always made
    pub limit: u32,
    /// Pause between attempts
    pub delay: Duration,
}

/// Run `op` until it is done, aborts, or `policy.limit` attempts have failed.
///
/// `op` receives the 1-based attempt number.
pub async fn with_retries<RT, T, F, Fut>(
    runtime: &RT,
    policy: RetryPolicy,
    what: &'static str,
    mut op: F,
) -> Result<T, RetryError>
where
    RT: SwarmRuntime,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let limit = policy.limit.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(err) => {
                tracing::debug!(what, attempt, error = %err, "aborting");
                return Err(RetryError::Aborted(err));
            }
            Attempt::Retry(err) if attempt >= limit => {
                tracing::error!(what, attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Attempt::Retry(err) => {
                tracing::warn!(what, attempt, limit, error = %err, "attempt failed, retrying");
                runtime.sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

/// Await `fut` for at most `limit` of runtime time; `None` on expiry
pub async fn bounded<RT, F>(runtime: &RT, limit: Duration, fut: F) -> Option<F::Output>
where
    RT: SwarmRuntime,
    F: Future,
{
    tokio::select! {
        biased;
        out = fut => Some(out),
        _ = runtime.sleep(limit) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_sync_runtime::mock_runtime::MockRuntime;

    fn policy(limit: u32) -> RetryPolicy {
        RetryPolicy {
            limit,
            delay: Duration::from_secs(2),
        }
    }

    fn transient() -> Error {
        Error::StoreUnavailable {
            attempts: 1,
            reason: "503".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let rt = MockRuntime::new();
        let result = with_retries(&rt, policy(3), "test", |attempt| async move {
            if attempt < 3 {
                Attempt::Retry(transient())
            } else {
                Attempt::Done(attempt)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        // Two pauses between three attempts.
        assert_eq!(rt.now(), 4_000);
    }

    #[tokio::test]
    async fn exhaustion_is_visible() {
        let rt = MockRuntime::new();
        let result: Result<(), _> =
            with_retries(&rt, policy(2), "test", |_| async { Attempt::Retry(transient()) }).await;
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last: transient()
            })
        );
    }

    #[tokio::test]
    async fn abort_stops_immediately() {
        let rt = MockRuntime::new();
        let mut calls = 0;
        let result: Result<(), _> = with_retries(&rt, policy(5), "test", |_| {
            calls += 1;
            async { Attempt::Abort(Error::NotFound { tag: Some(1) }) }
        })
        .await;
        assert_eq!(result, Err(RetryError::Aborted(Error::NotFound { tag: Some(1) })));
        assert_eq!(calls, 1);
        assert_eq!(rt.now(), 0);
    }

    #[tokio::test]
    async fn bounded_returns_ready_output_without_advancing_time() {
        let rt = MockRuntime::new();
        assert_eq!(bounded(&rt, Duration::from_secs(10), async { 7 }).await, Some(7));
        assert_eq!(rt.now(), 0);
    }

    #[tokio::test]
    async fn bounded_expires_on_pending_future() {
        let rt = MockRuntime::new();
        let out = bounded(&rt, Duration::from_secs(10), std::future::pending::<()>()).await;
        assert_eq!(out, None);
        assert_eq!(rt.now(), 10_000);
    }
}
